//! Face alignment via a 4-DOF similarity transform.
//!
//! Warps a detected face to the canonical 112×112 pose expected by the
//! recognition model, using the five detected keypoints and least-squares
//! estimation against the standard reference positions.

/// Canonical keypoint positions for a 112×112 aligned crop.
const CANONICAL_POINTS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const ALIGNED_SIZE: usize = 112;

/// Align a face to the canonical 112×112 crop.
pub fn align_face(
    frame: &[u8],
    width: u32,
    height: u32,
    landmarks: &[(f32, f32); 5],
) -> Vec<u8> {
    let m = estimate_transform(landmarks, &CANONICAL_POINTS_112);
    warp(frame, width as usize, height as usize, &m, ALIGNED_SIZE)
}

/// Estimate a 2×3 similarity transform (scale, rotation, translation) from
/// `src` points to `dst` points by least squares.
///
/// Returned as [a, -b, tx, b, a, ty], i.e. the matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Each point pair contributes two equations in the unknowns [a, b, tx, ty]:
    //   sx*a - sy*b + tx = dx
    //   sy*a + sx*b + ty = dy
    // Accumulate the normal equations A^T A x = A^T b directly.
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];
        let rows = [[sx, -sy, 1.0, 0.0], [sy, sx, 0.0, 1.0]];
        let rhs = [dx, dy];

        for (row, &r) in rows.iter().zip(rhs.iter()) {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j * 4 + k] += row[j] * row[k];
                }
                atb[j] += row[j] * r;
            }
        }
    }

    let x = solve4(&ata, &atb);
    [x[0], -x[1], x[2], x[1], x[0], x[3]]
}

/// Solve a 4×4 linear system by Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut pivot_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            // Degenerate landmark geometry; fall back to identity scale.
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Apply the inverse of a 2×3 similarity transform with bilinear sampling.
/// Out-of-frame samples are black.
fn warp(frame: &[u8], src_w: usize, src_h: usize, matrix: &[f32; 6], out_size: usize) -> Vec<u8> {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    // Invert the rotation/scale block [[a, -b], [b, a]].
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return vec![0u8; out_size * out_size];
    }
    let ia = a / det;
    let ib = b / det;

    let mut output = vec![0u8; out_size * out_size];

    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let sample = |x: i32, y: i32| -> f32 {
                if x >= 0 && x < src_w as i32 && y >= 0 && y < src_h as i32 {
                    frame[y as usize * src_w + x as usize] as f32
                } else {
                    0.0
                }
            };

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0) * fx * (1.0 - fy)
                + sample(x0, y0 + 1) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1) * fx * fy;

            output[oy * out_size + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_already_canonical() {
        let pts = CANONICAL_POINTS_112;
        let m = estimate_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn doubled_landmarks_halve_scale() {
        let src: [(f32, f32); 5] =
            std::array::from_fn(|i| (CANONICAL_POINTS_112[i].0 * 2.0, CANONICAL_POINTS_112[i].1 * 2.0));
        let m = estimate_transform(&src, &CANONICAL_POINTS_112);
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn warp_output_size() {
        let frame = vec![128u8; 640 * 480];
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let out = warp(&frame, 640, 480, &identity, ALIGNED_SIZE);
        assert_eq!(out.len(), ALIGNED_SIZE * ALIGNED_SIZE);
    }

    #[test]
    fn align_output_size() {
        let frame = vec![128u8; 640 * 480];
        let aligned = align_face(&frame, 640, 480, &CANONICAL_POINTS_112);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE);
    }

    #[test]
    fn bright_patch_lands_on_canonical_eye() {
        let w = 200usize;
        let h = 200usize;
        let mut frame = vec![0u8; w * h];

        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // 5×5 bright patch on the left eye so it survives bilinear sampling.
        let (lx, ly) = (src[0].0 as usize, src[0].1 as usize);
        for dy in 0..5 {
            for dx in 0..5 {
                let px = lx - 2 + dx;
                let py = ly - 2 + dy;
                frame[py * w + px] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &src);

        let ref_x = CANONICAL_POINTS_112[0].0.round() as usize;
        let ref_y = CANONICAL_POINTS_112[0].1.round() as usize;
        let mut max_val = 0u8;
        for dy in 0..3 {
            for dx in 0..3 {
                let x = ref_x - 1 + dx;
                let y = ref_y - 1 + dy;
                max_val = max_val.max(aligned[y * ALIGNED_SIZE + x]);
            }
        }
        assert!(
            max_val > 100,
            "expected bright patch near canonical left eye ({ref_x}, {ref_y}), max={max_val}"
        );
    }
}
