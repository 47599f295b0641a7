//! Image encoding: embedded `DynamicImage` → PNG bytes for upload.

use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an extracted image as PNG.
///
/// Images come out of the PDF engine in whatever pixel format the document
/// stored them in; PNG keeps them lossless regardless.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded {}x{} image → {} bytes PNG", img.width(), img.height(), buf.len());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = encode_png(&img).expect("encode should succeed");
        assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));

        let decoded = image::load_from_memory(&png).expect("valid png");
        assert_eq!(decoded.width(), 10);
    }

    #[test]
    fn encode_grayscale() {
        let img = DynamicImage::new_luma8(3, 2);
        let png = encode_png(&img).unwrap();
        assert!(!png.is_empty());
    }

    #[test]
    fn float_pixels_are_not_encodable() {
        assert!(encode_png(&DynamicImage::new_rgb32f(2, 2)).is_err());
    }
}
