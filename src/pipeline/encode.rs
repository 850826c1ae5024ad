//! Page image encoding for vision-model requests.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered page as a base64 PNG attachment.
///
/// PNG keeps typewriter glyph edges intact; `detail: "high"` asks the
/// provider for full-resolution tiling so small print survives.
pub fn page_attachment(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    let encoded = STANDARD.encode(&png);
    debug!("page attachment: {}x{} -> {} base64 bytes", img.width(), img.height(), encoded.len());
    Ok(ImageData::new(encoded, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, GrayImage};

    #[test]
    fn grayscale_page_encodes_as_png() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 8, Luma([200])));
        let data = page_attachment(&img).expect("encode");
        assert_eq!(data.mime_type, "image/png");
        let raw = STANDARD.decode(&data.data).expect("base64");
        assert_eq!(&raw[1..4], b"PNG");
    }
}
