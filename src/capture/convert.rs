//! Conversion of incoming images to planar I420.

use crate::bus::{ImageEncoding, ImageMessage};
use crate::errors::CaptureError;
use bytes::Bytes;
use image::{DynamicImage, GrayImage, RgbaImage};

/// Size in bytes of an I420 frame. Chroma planes round odd dimensions up.
pub fn i420_size(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
    w * h + 2 * cw * ch
}

/// Convert `image` into a freshly allocated I420 buffer.
///
/// I420 input is copied, not shared, so the returned buffer never aliases
/// the delivery that produced it.
pub fn to_i420(image: &ImageMessage) -> Result<Bytes, CaptureError> {
    if image.width == 0 || image.height == 0 {
        return Err(CaptureError::MalformedImage(format!(
            "empty image {}x{}",
            image.width, image.height
        )));
    }

    if image.encoding == ImageEncoding::I420 {
        let size = i420_size(image.width, image.height);
        if image.data.len() < size {
            return Err(CaptureError::MalformedImage(format!(
                "i420 buffer holds {} bytes, need {}",
                image.data.len(),
                size
            )));
        }
        return Ok(Bytes::copy_from_slice(&image.data[..size]));
    }

    let rgb = to_rgb24(image)?;
    Ok(Bytes::from(rgb_to_i420(&rgb, image.width, image.height)))
}

/// Repack a packed image into tightly packed RGB24.
fn to_rgb24(image: &ImageMessage) -> Result<Vec<u8>, CaptureError> {
    let bpp = image
        .encoding
        .bytes_per_pixel()
        .ok_or_else(|| CaptureError::UnsupportedEncoding(format!("{:?}", image.encoding)))?
        as usize;
    let (w, h) = (image.width as usize, image.height as usize);
    let row = w * bpp;
    let step = image.step as usize;
    if step < row || image.data.len() < step * (h - 1) + row {
        return Err(CaptureError::MalformedImage(format!(
            "{}x{} {:?} with step {} does not fit {} bytes",
            w,
            h,
            image.encoding,
            step,
            image.data.len()
        )));
    }

    let mut packed = Vec::with_capacity(row * h);
    for y in 0..h {
        packed.extend_from_slice(&image.data[y * step..y * step + row]);
    }

    let malformed = || CaptureError::MalformedImage("buffer does not match dimensions".into());
    let rgb = match image.encoding {
        ImageEncoding::Rgb8 => packed,
        ImageEncoding::Bgr8 => {
            for px in packed.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            packed
        }
        ImageEncoding::Rgba8 => {
            let buf = RgbaImage::from_raw(image.width, image.height, packed).ok_or_else(malformed)?;
            DynamicImage::ImageRgba8(buf).to_rgb8().into_raw()
        }
        ImageEncoding::Bgra8 => {
            for px in packed.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
            let buf = RgbaImage::from_raw(image.width, image.height, packed).ok_or_else(malformed)?;
            DynamicImage::ImageRgba8(buf).to_rgb8().into_raw()
        }
        ImageEncoding::Mono8 => {
            let buf = GrayImage::from_raw(image.width, image.height, packed).ok_or_else(malformed)?;
            DynamicImage::ImageLuma8(buf).to_rgb8().into_raw()
        }
        ImageEncoding::I420 => return Err(CaptureError::UnsupportedEncoding("i420".into())),
    };
    Ok(rgb)
}

/// BT.601 studio-swing RGB24 to I420. Chroma is sampled from the top-left
/// pixel of each 2x2 block.
pub fn rgb_to_i420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let cw = (w + 1) / 2;
    let ch = (h + 1) / 2;

    let y_size = w * h;
    let uv_size = cw * ch;
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 3;
            let r = rgb[idx] as i32;
            let g = rgb[idx + 1] as i32;
            let b = rgb[idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * cw + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(encoding: ImageEncoding, w: u32, h: u32, px: &[u8]) -> ImageMessage {
        let data: Vec<u8> = px.iter().copied().cycle().take(px.len() * (w * h) as usize).collect();
        ImageMessage::packed(w, h, encoding, data, 0)
    }

    #[test]
    fn test_i420_size_rounds_chroma_up() {
        assert_eq!(i420_size(640, 480), 640 * 480 * 3 / 2);
        assert_eq!(i420_size(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn test_white_and_black_levels() {
        let white = to_i420(&solid(ImageEncoding::Rgb8, 4, 4, &[255, 255, 255])).unwrap();
        assert_eq!(white[0], 235);
        assert_eq!(white[16], 128);

        let black = to_i420(&solid(ImageEncoding::Rgb8, 4, 4, &[0, 0, 0])).unwrap();
        assert_eq!(black[0], 16);
        assert_eq!(black[20], 128);
    }

    #[test]
    fn test_bgr_matches_rgb() {
        let rgb = to_i420(&solid(ImageEncoding::Rgb8, 2, 2, &[200, 10, 30])).unwrap();
        let bgr = to_i420(&solid(ImageEncoding::Bgr8, 2, 2, &[30, 10, 200])).unwrap();
        let bgra = to_i420(&solid(ImageEncoding::Bgra8, 2, 2, &[30, 10, 200, 255])).unwrap();
        assert_eq!(rgb, bgr);
        assert_eq!(rgb, bgra);
    }

    #[test]
    fn test_red_has_high_v() {
        let red = to_i420(&solid(ImageEncoding::Rgb8, 2, 2, &[255, 0, 0])).unwrap();
        let v = red[4 + 1];
        assert!(v > 200, "v plane for pure red was {}", v);
    }

    #[test]
    fn test_mono_is_neutral_chroma() {
        let grey = to_i420(&solid(ImageEncoding::Mono8, 3, 3, &[128])).unwrap();
        assert_eq!(grey.len(), i420_size(3, 3));
        assert!(grey[9..].iter().all(|&c| c == 128));
    }

    #[test]
    fn test_padded_rows_are_repacked() {
        let mut img = solid(ImageEncoding::Rgb8, 2, 2, &[255, 255, 255]);
        let mut padded = Vec::new();
        for row in img.data.chunks(6) {
            padded.extend_from_slice(row);
            padded.extend_from_slice(&[0, 0]);
        }
        img.step = 8;
        img.data = padded.into();
        let out = to_i420(&img).unwrap();
        assert!(out[..4].iter().all(|&y| y == 235));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let img = ImageMessage::packed(4, 4, ImageEncoding::Rgb8, vec![0u8; 10], 0);
        assert!(matches!(to_i420(&img), Err(CaptureError::MalformedImage(_))));
        let empty = ImageMessage::packed(0, 4, ImageEncoding::Rgb8, Vec::<u8>::new(), 0);
        assert!(to_i420(&empty).is_err());
    }

    #[test]
    fn test_i420_input_is_copied() {
        let data = vec![7u8; i420_size(2, 2)];
        let img = ImageMessage::packed(2, 2, ImageEncoding::I420, data.clone(), 0);
        let out = to_i420(&img).unwrap();
        assert_eq!(&out[..], &data[..]);
        assert_ne!(out.as_ptr(), img.data.as_ptr());
    }
}
