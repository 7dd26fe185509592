//! I/O collaborators: camera metadata, raw pixel decoding, output writing

pub mod metadata;
pub mod pixels;

pub use metadata::{MetadataProvider, TagMetadata};
pub use pixels::{write_float_tiff, write_raw_tiff, InMemorySource, PixelSource, TiffPixelSource};
