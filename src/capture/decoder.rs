use std::sync::Arc;

use thiserror::Error;

use super::frame::{FrameMetadata, PixelFormat};

/// Structured samples decoded from one raw frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Row-major, one sample per pixel at full bit depth
    pub samples: Arc<[u16]>,
}

impl DecodedFrame {
    pub fn sample(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        self.samples.get(index).copied()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("sample {value} at pixel {index} exceeds {format} bit depth")]
    SampleOutOfRange {
        index: usize,
        value: u16,
        format: PixelFormat,
    },
    #[error("pixel format {0} is not supported by the decoder")]
    Unsupported(PixelFormat),
}

/// Decode raw bytes into samples. Pure function of payload and metadata.
pub fn decode_frame(data: &[u8], meta: &FrameMetadata) -> Result<DecodedFrame, DecodeError> {
    let format = meta.format;
    let bpp = format
        .bytes_per_pixel()
        .ok_or(DecodeError::Unsupported(format))?;

    let pixels = meta.width as usize * meta.height as usize;
    let expected = pixels * bpp;
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: data.len(),
        });
    }

    let samples: Vec<u16> = match bpp {
        1 => data[..expected].iter().map(|&b| u16::from(b)).collect(),
        _ => {
            let limit = if format.bit_depth() >= 16 {
                u16::MAX
            } else {
                (1u16 << format.bit_depth()) - 1
            };
            let mut out = Vec::with_capacity(pixels);
            for (index, pair) in data[..expected].chunks_exact(2).enumerate() {
                let value = u16::from_le_bytes([pair[0], pair[1]]);
                if value > limit {
                    return Err(DecodeError::SampleOutOfRange {
                        index,
                        value,
                        format,
                    });
                }
                out.push(value);
            }
            out
        }
    };

    Ok(DecodedFrame {
        width: meta.width,
        height: meta.height,
        format,
        samples: samples.into(),
    })
}
