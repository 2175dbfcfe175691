//! Image decoding: raw image bytes or base64 text (with optional data-URI prefix)
//! into an RGB [`PixelGrid`].

use crate::error::DecodeError;
use crate::types::PixelGrid;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::error::ImageError;
use image::{ImageReader, Limits};
use std::io::Cursor;

/// Longest accepted image side in pixels.
pub const MAX_IMAGE_SIDE: u32 = 4096;
/// Decoder allocation ceiling; covers an RGBA16 frame at [`MAX_IMAGE_SIDE`].
const MAX_DECODE_ALLOC: u64 = 8 * MAX_IMAGE_SIDE as u64 * MAX_IMAGE_SIDE as u64;

/// Decode an encoded image buffer into a 3-channel grid.
///
/// Buffers that sniff as a known image container are decoded directly;
/// anything else is treated as base64 text. A `data:image/...;base64,`
/// style prefix (anything up to the first comma) is stripped first.
/// Images wider or taller than [`MAX_IMAGE_SIDE`] are refused from their
/// header, before any pixel memory is allocated.
pub fn decode_image(input: &[u8]) -> Result<PixelGrid, DecodeError> {
    if input.is_empty() {
        return Err(DecodeError::Empty);
    }

    let decoded;
    let bytes = if image::guess_format(input).is_ok() {
        input
    } else {
        decoded = decode_base64_text(input)?;
        decoded.as_slice()
    };

    let rgb = decode_bounded(bytes)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(DecodeError::EmptyGrid { width, height });
    }

    tracing::debug!(width, height, "decoded image");
    Ok(PixelGrid::new(rgb))
}

fn decode_bounded(bytes: &[u8]) -> Result<image::DynamicImage, DecodeError> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(ImageError::IoError)?;
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_SIDE);
    limits.max_image_height = Some(MAX_IMAGE_SIDE);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);
    reader.limits(limits);
    reader.decode().map_err(|e| match e {
        ImageError::Limits(limit) => DecodeError::TooLarge(limit.to_string()),
        other => DecodeError::Image(other),
    })
}

fn decode_base64_text(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let text = std::str::from_utf8(input).map_err(|_| DecodeError::Malformed)?;
    let payload = match text.split_once(',') {
        Some((_, rest)) => rest,
        None => text,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(STANDARD.decode(compact)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 77]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn test_decode_raw_png() {
        let grid = decode_image(&png_bytes(12, 9)).unwrap();
        assert_eq!((grid.width(), grid.height()), (12, 9));
        assert_eq!(grid.as_image().get_pixel(3, 4).0, [3, 4, 77]);
    }

    #[test]
    fn test_decode_base64_with_data_uri() {
        let b64 = STANDARD.encode(png_bytes(8, 8));
        let uri = format!("data:image/png;base64,{b64}");
        let grid = decode_image(uri.as_bytes()).unwrap();
        assert_eq!((grid.width(), grid.height()), (8, 8));
    }

    #[test]
    fn test_decode_bare_base64_with_line_breaks() {
        let b64 = STANDARD.encode(png_bytes(5, 6));
        let wrapped: String = b64
            .as_bytes()
            .chunks(16)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        let grid = decode_image(wrapped.as_bytes()).unwrap();
        assert_eq!((grid.width(), grid.height()), (5, 6));
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode_image(&[]), Err(DecodeError::Empty)));
        assert!(matches!(decode_image(b"data:image/png;base64,"), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_corrupted_buffers_never_panic() {
        let mut truncated = png_bytes(16, 16);
        truncated.truncate(40);
        let mut flipped = png_bytes(16, 16);
        for b in flipped.iter_mut().skip(20) {
            *b ^= 0xA5;
        }
        let cases: Vec<Vec<u8>> = vec![
            truncated,
            flipped,
            vec![0xFF, 0xFE, 0x00, 0x80],
            b"not an image at all!".to_vec(),
            b"data:image/png;base64,@@@@".to_vec(),
            STANDARD.encode(b"plain text, not pixels").into_bytes(),
        ];
        for case in cases {
            assert!(decode_image(&case).is_err(), "expected error for {case:?}");
        }
    }

    #[test]
    fn test_decode_refuses_oversized_dimensions() {
        let wide = png_bytes(MAX_IMAGE_SIDE + 1, 2);
        assert!(matches!(decode_image(&wide), Err(DecodeError::TooLarge(_))));

        let tall = STANDARD.encode(png_bytes(1, MAX_IMAGE_SIDE + 1));
        assert!(matches!(decode_image(tall.as_bytes()), Err(DecodeError::TooLarge(_))));

        let edge = decode_image(&png_bytes(MAX_IMAGE_SIDE, 1)).unwrap();
        assert_eq!(edge.width(), MAX_IMAGE_SIDE);
    }
}
