use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage};
use studio_contracts::{Result, StudioError};

pub const INPUT_JPEG_QUALITY: u8 = 95;

/// Drops any alpha channel (no compositing) so the result is opaque RGB.
pub fn to_opaque_rgb(image: &DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb.clone(),
        other => other.to_rgb8(),
    }
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let opaque = DynamicImage::ImageRgb8(to_opaque_rgb(image));
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder.encode_image(&opaque).map_err(image_error)?;
    Ok(bytes)
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(image_error)?;
    Ok(cursor.into_inner())
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(image_error)
}

pub fn decode_opaque(bytes: &[u8]) -> Result<RgbImage> {
    decode(bytes).map(|image| to_opaque_rgb(&image))
}

fn image_error(err: image::ImageError) -> StudioError {
    StudioError::Image(err.to_string())
}
