//! Image model shared by the gallery and the broadcast channel
//!
//! Images travel as their encoded file bytes. Decoding validates the
//! container signature and reads the pixel dimensions; encoding hands the
//! same bytes back, so the round trip is lossless for every recognised format.

use std::fmt;

use bytes::Bytes;

use crate::{ShareError, ShareResult};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Recognised image container formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
}

impl ImageFormat {
    /// Sniff the format from the leading bytes
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(&PNG_SIGNATURE) {
            Some(ImageFormat::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A decoded image
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    format: ImageFormat,
    width: u32,
    height: u32,
    data: Bytes,
}

impl Image {
    /// Decode encoded image bytes, failing with `DecodeFailed` on anything unrecognised
    pub fn decode(data: impl Into<Bytes>) -> ShareResult<Self> {
        let data = data.into();
        let format = ImageFormat::detect(&data)
            .ok_or_else(|| ShareError::DecodeFailed("unrecognised image signature".into()))?;

        let (width, height) = match format {
            ImageFormat::Png => png_dimensions(&data)?,
            ImageFormat::Jpeg => jpeg_dimensions(&data)?,
            ImageFormat::Gif => gif_dimensions(&data)?,
        };

        if width == 0 || height == 0 {
            return Err(ShareError::DecodeFailed(format!(
                "{} image has zero dimension",
                format
            )));
        }

        Ok(Image {
            format,
            width,
            height,
            data,
        })
    }

    /// Encoded bytes for transmission
    pub fn encode(&self) -> Bytes {
        self.data.clone()
    }

    #[inline]
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Size of the encoded image in bytes
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn truncated(format: ImageFormat) -> ShareError {
    ShareError::DecodeFailed(format!("truncated {} header", format))
}

fn be_u16(data: &[u8], at: usize) -> u32 {
    u16::from_be_bytes([data[at], data[at + 1]]) as u32
}

fn png_dimensions(data: &[u8]) -> ShareResult<(u32, u32)> {
    // Signature, IHDR length, "IHDR", width, height
    if data.len() < 24 {
        return Err(truncated(ImageFormat::Png));
    }
    if &data[12..16] != b"IHDR" {
        return Err(ShareError::DecodeFailed("PNG without leading IHDR chunk".into()));
    }
    let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
    Ok((width, height))
}

fn gif_dimensions(data: &[u8]) -> ShareResult<(u32, u32)> {
    if data.len() < 10 {
        return Err(truncated(ImageFormat::Gif));
    }
    let width = u16::from_le_bytes([data[6], data[7]]) as u32;
    let height = u16::from_le_bytes([data[8], data[9]]) as u32;
    Ok((width, height))
}

/// Start-of-frame markers carry the dimensions (DHT, JPG and DAC share the range)
fn is_start_of_frame(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

fn jpeg_dimensions(data: &[u8]) -> ShareResult<(u32, u32)> {
    let mut i = 2;
    while i < data.len() {
        if data[i] != 0xFF {
            return Err(ShareError::DecodeFailed("JPEG marker expected".into()));
        }
        let mut m = i + 1;
        while m < data.len() && data[m] == 0xFF {
            m += 1;
        }
        if m >= data.len() {
            break;
        }

        let marker = data[m];
        match marker {
            0x01 | 0xD0..=0xD8 => {
                i = m + 1;
                continue;
            }
            0xD9 | 0xDA => break,
            _ => {}
        }

        if m + 3 > data.len() {
            break;
        }
        let segment_len = be_u16(data, m + 1) as usize;
        if segment_len < 2 {
            return Err(ShareError::DecodeFailed("JPEG segment length underflow".into()));
        }

        if is_start_of_frame(marker) {
            if m + 8 > data.len() {
                break;
            }
            let height = be_u16(data, m + 4);
            let width = be_u16(data, m + 6);
            return Ok((width, height));
        }

        i = m + 1 + segment_len;
    }

    Err(truncated(ImageFormat::Jpeg))
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal PNG: signature plus IHDR and an IEND trailer
    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut data = super::PNG_SIGNATURE.to_vec();
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&[8, 6, 0, 0, 0]);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"IEND");
        data.extend_from_slice(&[0xAE, 0x42, 0x60, 0x82]);
        data
    }

    pub fn jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        // APP0 with two bytes of body
        data.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0xAA, 0xBB]);
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    pub fn gif(width: u16, height: u16) -> Vec<u8> {
        let mut data = b"GIF89a".to_vec();
        data.extend_from_slice(&width.to_le_bytes());
        data.extend_from_slice(&height.to_le_bytes());
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x3B]);
        data
    }
}
