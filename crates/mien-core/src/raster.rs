//! Grayscale raster helpers shared by the inference stages.

/// Resize a grayscale image with bilinear interpolation.
///
/// Sub-pixel sampling uses pixel-center convention so edges stay sharp at
/// the scales the detector works with.
pub(crate) fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return vec![0u8; dst_w * dst_h];
    }

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;
    let mut dst = vec![0u8; dst_w * dst_h];

    for y in 0..dst_h {
        let sy = (y as f32 + 0.5) * y_ratio - 0.5;
        let y0 = (sy.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (sy - sy.floor()).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let sx = (x as f32 + 0.5) * x_ratio - 0.5;
            let x0 = (sx.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (sx - sx.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * src_w + x0] as f32;
            let tr = src[y0 * src_w + x1] as f32;
            let bl = src[y1 * src_w + x0] as f32;
            let br = src[y1 * src_w + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            dst[y * dst_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    dst
}

/// Integer crop rectangle clamped to image bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CropRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Expand a float box by `margin` (fraction of the larger side) and clamp
/// it to the frame. Degenerate boxes collapse to a 1×1 rect.
pub(crate) fn expand_and_clamp(
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    margin: f32,
    frame_w: usize,
    frame_h: usize,
) -> CropRect {
    let pad = width.max(height).max(0.0) * margin;
    let x0 = (x - pad).floor().max(0.0) as usize;
    let y0 = (y - pad).floor().max(0.0) as usize;
    let x1 = ((x + width + pad).ceil() as usize).min(frame_w);
    let y1 = ((y + height + pad).ceil() as usize).min(frame_h);

    CropRect {
        x: x0.min(frame_w.saturating_sub(1)),
        y: y0.min(frame_h.saturating_sub(1)),
        width: x1.saturating_sub(x0).max(1),
        height: y1.saturating_sub(y0).max(1),
    }
}

/// Copy a crop rect out of a grayscale frame.
pub(crate) fn crop(src: &[u8], src_w: usize, rect: CropRect) -> Vec<u8> {
    let mut out = Vec::with_capacity(rect.width * rect.height);
    for row in rect.y..rect.y + rect.height {
        let start = row * src_w + rect.x;
        out.extend_from_slice(&src[start..start + rect.width]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_uniform_stays_uniform() {
        let src = vec![128u8; 50 * 40];
        let dst = resize_bilinear(&src, 50, 40, 100, 80);
        assert_eq!(dst.len(), 100 * 80);
        assert!(dst.iter().all(|&p| p == 128));
    }

    #[test]
    fn resize_identity() {
        let src: Vec<u8> = (0..16).map(|i| (i * 16) as u8).collect();
        let dst = resize_bilinear(&src, 4, 4, 4, 4);
        assert_eq!(src, dst);
    }

    #[test]
    fn resize_zero_target() {
        let src = vec![1u8; 4];
        assert!(resize_bilinear(&src, 2, 2, 0, 0).is_empty());
    }

    #[test]
    fn expand_clamps_to_frame() {
        let rect = expand_and_clamp(-10.0, -10.0, 30.0, 30.0, 0.25, 100, 100);
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y, 0);
        assert!(rect.x + rect.width <= 100);
        assert!(rect.y + rect.height <= 100);
    }

    #[test]
    fn expand_adds_margin() {
        let rect = expand_and_clamp(40.0, 40.0, 20.0, 20.0, 0.25, 100, 100);
        // 25% of 20 = 5 pixels each side
        assert_eq!(rect.x, 35);
        assert_eq!(rect.y, 35);
        assert_eq!(rect.width, 30);
        assert_eq!(rect.height, 30);
    }

    #[test]
    fn crop_extracts_expected_pixels() {
        // 4x4 frame numbered 0..16
        let src: Vec<u8> = (0..16).collect();
        let rect = CropRect {
            x: 1,
            y: 1,
            width: 2,
            height: 2,
        };
        assert_eq!(crop(&src, 4, rect), vec![5, 6, 9, 10]);
    }
}
