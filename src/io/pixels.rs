use crate::types::{CalError, CalResult, RawGrid, RealImage};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::ColorType;

/// Decode collaborator: produces the raw DN grid of one band image.
///
/// Sources are moved into the image that owns them, possibly onto a worker
/// thread, hence the `Send` bound.
pub trait PixelSource: Send {
    fn decode(&self) -> CalResult<RawGrid>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;
}

/// Pixels already held in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    data: RawGrid,
    label: String,
}

impl InMemorySource {
    pub fn new(data: RawGrid) -> Self {
        Self {
            data,
            label: "in-memory".to_string(),
        }
    }

    pub fn with_label(data: RawGrid, label: impl Into<String>) -> Self {
        Self {
            data,
            label: label.into(),
        }
    }
}

impl PixelSource for InMemorySource {
    fn decode(&self) -> CalResult<RawGrid> {
        Ok(self.data.clone())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Single-band 16-bit grayscale TIFF on disk
#[derive(Debug, Clone)]
pub struct TiffPixelSource {
    path: PathBuf,
}

impl TiffPixelSource {
    pub fn new<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CalError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Provided path is not a file: {}", path.display()),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PixelSource for TiffPixelSource {
    fn decode(&self) -> CalResult<RawGrid> {
        log::debug!("Decoding TIFF: {}", self.path.display());
        let file = File::open(&self.path)?;
        let decode_err = |e: tiff::TiffError| {
            CalError::Decode(format!("{}: {}", self.path.display(), e))
        };

        let mut decoder = Decoder::new(BufReader::new(file)).map_err(decode_err)?;
        let (width, height) = decoder.dimensions().map_err(decode_err)?;
        let color = decoder.colortype().map_err(decode_err)?;
        if color != ColorType::Gray(16) {
            return Err(CalError::Decode(format!(
                "{}: expected 16-bit single-band samples, found {:?}",
                self.path.display(),
                color
            )));
        }

        let samples = match decoder.read_image().map_err(decode_err)? {
            DecodingResult::U16(samples) => samples,
            _ => {
                return Err(CalError::Decode(format!(
                    "{}: unexpected sample buffer type",
                    self.path.display()
                )))
            }
        };

        let grid = RawGrid::from_shape_vec((height as usize, width as usize), samples)
            .map_err(|e| CalError::Decode(format!("Shape error: {}", e)))?;
        log::debug!("Decoded {} x {} raw grid", width, height);
        Ok(grid)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Write a corrected grid as a 32-bit float grayscale TIFF
pub fn write_float_tiff<P: AsRef<Path>>(path: P, image: &RealImage) -> CalResult<()> {
    let path = path.as_ref();
    let (height, width) = image.dim();
    log::debug!("Encoding float TIFF {}x{}: {}", width, height, path.display());

    let data: Vec<f32> = image.iter().map(|&v| v as f32).collect();
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    encoder.write_image::<colortype::Gray32Float>(width as u32, height as u32, &data)?;
    Ok(())
}

/// Write a raw DN grid as a 16-bit grayscale TIFF
pub fn write_raw_tiff<P: AsRef<Path>>(path: P, grid: &RawGrid) -> CalResult<()> {
    let path = path.as_ref();
    let (height, width) = grid.dim();
    let data: Vec<u16> = grid.iter().copied().collect();
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    encoder.write_image::<colortype::Gray16>(width as u32, height as u32, &data)?;
    Ok(())
}
