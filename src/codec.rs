//! Image decode / encode / crop helpers used by detection dispatch.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::dispatch::ClampedBox;

/// Quality used for re-encoded full frames and crops.
pub const JPEG_QUALITY: u8 = 90;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Decode one assembled frame into RGB pixels.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("decode frame")?;
    Ok(image.into_rgb8())
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(out.into_inner())
}

/// Encode the `region` of `image` as JPEG. `region` must lie inside the image.
pub fn crop_jpeg(image: &RgbImage, region: ClampedBox) -> Result<Vec<u8>> {
    let view = image::imageops::crop_imm(image, region.left, region.top, region.width, region.height);
    encode_jpeg(&view.to_image()).with_context(|| format!("encode crop {:?}", region))
}

/// Draw a 2px rectangle outline around `region`, clipped to the image.
pub fn draw_box(image: &mut RgbImage, region: ClampedBox) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let x0 = region.left.min(width - 1);
    let y0 = region.top.min(height - 1);
    let x1 = region.left.saturating_add(region.width).saturating_sub(1).min(width - 1);
    let y1 = region.top.saturating_add(region.height).saturating_sub(1).min(height - 1);

    for t in 0..2u32 {
        for x in x0..=x1 {
            image.put_pixel(x, (y0 + t).min(y1), BOX_COLOR);
            image.put_pixel(x, y1.saturating_sub(t).max(y0), BOX_COLOR);
        }
        for y in y0..=y1 {
            image.put_pixel((x0 + t).min(x1), y, BOX_COLOR);
            image.put_pixel(x1.saturating_sub(t).max(x0), y, BOX_COLOR);
        }
    }
}
