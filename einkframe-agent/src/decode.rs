//! Image decode collaborator
//!
//! Display payloads are decoded into a [`Bitmap`] before they reach the
//! render gate. The built-in decoder only accepts raw frames sized for the
//! panel; richer formats plug in through [`ImageDecoder`].

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDepth {
    /// One byte per pixel
    Grey8,
    /// Two pixels per byte, high nibble first
    Grey4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub depth: PixelDepth,
    pub pixels: Vec<u8>,
}

pub trait ImageDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Bitmap, DecodeError>;
}

/// Accepts uncompressed frames matching the panel resolution
#[derive(Debug, Clone, Copy)]
pub struct RawFrameDecoder {
    width: u32,
    height: u32,
}

impl RawFrameDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn grey8_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn grey4_len(&self) -> usize {
        self.grey8_len().div_ceil(2)
    }
}

impl ImageDecoder for RawFrameDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Bitmap, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }

        let depth = if payload.len() == self.grey8_len() {
            PixelDepth::Grey8
        } else if payload.len() == self.grey4_len() {
            PixelDepth::Grey4
        } else {
            return Err(DecodeError::UnexpectedLength {
                actual: payload.len(),
                expected_grey: self.grey8_len(),
                expected_packed: self.grey4_len(),
            });
        };

        Ok(Bitmap {
            width: self.width,
            height: self.height,
            depth,
            pixels: payload.to_vec(),
        })
    }
}
