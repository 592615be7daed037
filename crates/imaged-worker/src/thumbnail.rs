//! Downscaled previews of decrypted images

use std::io::Cursor;

use image::{GenericImageView, ImageOutputFormat};
use imaged_core::{ImagedError, ImagedResult};

/// Fit the image inside `max_size`×`max_size` (aspect ratio kept) and encode
/// it as PNG. Images already small enough are re-encoded at their own size.
pub fn render(image_bytes: &[u8], max_size: u32) -> ImagedResult<Vec<u8>> {
    let img = image::load_from_memory(image_bytes)
        .map_err(|e| ImagedError::Format(format!("decoding image: {e}")))?;

    let max_size = max_size.max(1);
    let (width, height) = img.dimensions();
    let img = if width > max_size || height > max_size {
        img.thumbnail(max_size, max_size)
    } else {
        img
    };

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageOutputFormat::Png)
        .map_err(|e| ImagedError::Other(anyhow::anyhow!("encoding thumbnail: {e}")))?;
    Ok(out.into_inner())
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let buffer = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(buffer)
        .write_to(&mut out, ImageOutputFormat::Png)
        .unwrap();
    out.into_inner()
}
