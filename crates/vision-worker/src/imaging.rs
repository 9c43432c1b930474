//! Image plumbing for the pipeline: single-pass resize + CHW
//! normalisation, padded face crops (zero-copy views), snapshot
//! upscaling, and JPEG encoding.

use anyhow::{Context, Result};
use image::{imageops, GenericImageView, Rgb, RgbImage, SubImage};

/// Per-channel normalisation for a model input: out = (pixel - mean) / std.
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

pub const DETECT_NORM: Normalization = Normalization {
    mean: [127.5, 127.5, 127.5],
    std: [128.0, 128.0, 128.0],
};

pub const EMBED_NORM: Normalization = Normalization {
    mean: [127.5, 127.5, 127.5],
    std: [127.5, 127.5, 127.5],
};

pub const ATTR_NORM: Normalization = Normalization {
    mean: [0.0, 0.0, 0.0],
    std: [1.0, 1.0, 1.0],
};

/// Nearest-neighbour resize and CHW float conversion in a single pass,
/// planes ordered R, G, B.
pub fn preprocess_chw<I>(img: &I, target_w: u32, target_h: u32, norm: &Normalization) -> Vec<f32>
where
    I: GenericImageView<Pixel = Rgb<u8>>,
{
    let (src_w, src_h) = img.dimensions();
    let (tw, th) = (target_w as usize, target_h as usize);
    let plane = tw * th;
    let mut data = vec![0f32; 3 * plane];
    if src_w == 0 || src_h == 0 {
        return data;
    }

    for y in 0..th {
        let src_y = (y as u32 * src_h / target_h).min(src_h - 1);
        for x in 0..tw {
            let src_x = (x as u32 * src_w / target_w).min(src_w - 1);
            let Rgb([r, g, b]) = img.get_pixel(src_x, src_y);
            let idx = y * tw + x;
            data[idx] = (r as f32 - norm.mean[0]) / norm.std[0];
            data[plane + idx] = (g as f32 - norm.mean[1]) / norm.std[1];
            data[2 * plane + idx] = (b as f32 - norm.mean[2]) / norm.std[2];
        }
    }

    data
}

/// Crop a detection box with 20% padding (10% per side), clamped to the
/// frame. The result is a zero-copy view into the frame's pixel buffer.
pub fn crop_face<'a>(img: &'a RgbImage, bbox: &[f32; 4]) -> Option<SubImage<&'a RgbImage>> {
    let (w, h) = img.dimensions();
    let (w, h) = (w as i64, h as i64);

    let mut x1 = (bbox[0] as i64).clamp(0, w);
    let mut y1 = (bbox[1] as i64).clamp(0, h);
    let mut x2 = (bbox[2] as i64).clamp(0, w);
    let mut y2 = (bbox[3] as i64).clamp(0, h);

    let box_w = x2 - x1;
    let box_h = y2 - y1;
    if box_w <= 0 || box_h <= 0 {
        return None;
    }

    let pad_w = (box_w as f32 * 0.1) as i64;
    let pad_h = (box_h as f32 * 0.1) as i64;
    x1 = (x1 - pad_w).clamp(0, w);
    y1 = (y1 - pad_h).clamp(0, h);
    x2 = (x2 + pad_w).clamp(0, w);
    y2 = (y2 + pad_h).clamp(0, h);

    Some(imageops::crop_imm(
        img,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    ))
}

/// Scale a crop up so its shortest side is at least `min_size` pixels.
/// Crops already large enough are copied out unscaled.
pub fn upscale_face<I>(img: &I, min_size: u32) -> RgbImage
where
    I: GenericImageView<Pixel = Rgb<u8>>,
{
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return RgbImage::new(w, h);
    }

    let shortest = w.min(h);
    let (new_w, new_h) = if shortest >= min_size {
        (w, h)
    } else {
        let scale = min_size as f64 / shortest as f64;
        ((w as f64 * scale) as u32, (h as f64 * scale) as u32)
    };

    let mut dst = RgbImage::new(new_w, new_h);
    for y in 0..new_h {
        let src_y = (y * h / new_h).min(h - 1);
        for x in 0..new_w {
            let src_x = (x * w / new_w).min(w - 1);
            dst.put_pixel(x, y, img.get_pixel(src_x, src_y));
        }
    }
    dst
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(img).context("encode jpeg")?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 0]))
    }

    #[test]
    fn preprocess_has_chw_layout_and_normalises() {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 127]));
        img.put_pixel(1, 0, Rgb([255, 0, 127]));
        img.put_pixel(0, 1, Rgb([255, 0, 127]));
        img.put_pixel(1, 1, Rgb([255, 0, 127]));

        let data = preprocess_chw(&img, 2, 2, &EMBED_NORM);
        assert_eq!(data.len(), 12);
        // R plane
        assert!((data[0] - 1.0).abs() < 0.01);
        // G plane
        assert!((data[4] + 1.0).abs() < 0.01);
        // B plane near zero
        assert!(data[8].abs() < 0.01);
    }

    #[test]
    fn preprocess_resizes_to_target() {
        let img = gradient_image(100, 50);
        let data = preprocess_chw(&img, 8, 8, &ATTR_NORM);
        assert_eq!(data.len(), 3 * 8 * 8);
    }

    #[test]
    fn crop_adds_padding_and_clamps() {
        let img = gradient_image(100, 100);

        let crop = crop_face(&img, &[10.0, 10.0, 50.0, 50.0]).unwrap();
        // 40px box, 4px padding each side
        assert_eq!(crop.dimensions(), (48, 48));

        let edge = crop_face(&img, &[0.0, 0.0, 30.0, 30.0]).unwrap();
        // padding cannot extend past the frame origin
        assert_eq!(edge.dimensions(), (33, 33));
    }

    #[test]
    fn degenerate_box_yields_no_crop() {
        let img = gradient_image(100, 100);
        assert!(crop_face(&img, &[50.0, 50.0, 50.0, 60.0]).is_none());
        assert!(crop_face(&img, &[200.0, 200.0, 300.0, 300.0]).is_none());
    }

    #[test]
    fn upscale_hits_minimum_short_side() {
        let img = gradient_image(10, 20);
        let scaled = upscale_face(&img, 100);
        assert_eq!(scaled.dimensions(), (100, 200));

        let untouched = upscale_face(&gradient_image(120, 140), 100);
        assert_eq!(untouched.dimensions(), (120, 140));
    }

    #[test]
    fn encode_jpeg_produces_jpeg_magic() {
        let img = gradient_image(16, 16);
        let data = encode_jpeg(&img, 90).unwrap();
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        assert_eq!(&data[data.len() - 2..], &[0xFF, 0xD9]);
    }
}
