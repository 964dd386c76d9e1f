//! Shared pixel types used between pipeline stages.
//!
//! [`FrameBuffer`] is what a producer draws into and what the streamer
//! cuts into blocks. Montages on the display side use the same row
//! layout so a block copy is a plain strided memcpy.

use serde::{Deserialize, Serialize};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of a streamed image. Only the byte width matters to the
/// engine; no conversion happens here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 3 bytes per pixel: Red, Green, Blue.
    #[default]
    Rgb8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 2 bytes per pixel, packed 5-6-5.
    Rgb565,
    /// 1 byte per pixel.
    Luminance8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Luminance8 => 1,
        }
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = crate::error::WallError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PixelFormat::Rgb8),
            1 => Ok(PixelFormat::Rgba8),
            2 => Ok(PixelFormat::Bgra8),
            3 => Ok(PixelFormat::Rgb565),
            4 => Ok(PixelFormat::Luminance8),
            _ => Err(crate::error::WallError::UnknownVariant {
                type_name: "PixelFormat",
                value: value as u64,
            }),
        }
    }
}

// ── FrameBuffer ──────────────────────────────────────────────────

/// A tightly packed image: `height` rows of `width * bpp` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data.
    pub data: Vec<u8>,
}

impl FrameBuffer {
    /// A zero-filled frame.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
        }
    }

    /// Row pitch in bytes.
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Total byte size of the bitmap.
    pub fn byte_len(&self) -> usize {
        self.stride() * self.height as usize
    }

    /// Returns a row slice.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride();
        &self.data[start..start + self.stride()]
    }

    /// Returns the pixel bytes at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride() + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }

    /// Overwrite the whole frame with a byte pattern produced by `f(offset)`.
    pub fn fill_with(&mut self, mut f: impl FnMut(usize) -> u8) {
        for (i, b) in self.data.iter_mut().enumerate() {
            *b = f(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(PixelFormat::Rgba8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgb8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Rgb565.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Luminance8.bytes_per_pixel(), 1);
    }

    #[test]
    fn frame_rows_and_pixels() {
        let mut frame = FrameBuffer::new(4, 2, PixelFormat::Rgb8);
        assert_eq!(frame.byte_len(), 24);
        frame.fill_with(|i| i as u8);
        assert_eq!(frame.row(1)[0], 12);
        assert_eq!(frame.pixel(1, 1), &[15, 16, 17]);
    }

    #[test]
    fn format_from_u32() {
        assert_eq!(PixelFormat::try_from(2).unwrap(), PixelFormat::Bgra8);
        assert!(PixelFormat::try_from(9).is_err());
    }
}
