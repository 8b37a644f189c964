//! Separable image resampling for the encoder's scale stage.

use crate::options::ResampleMethod;
use std::f32::consts::PI;

fn sinc(x: f32) -> f32 {
    if x.abs() < 1e-6 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

fn lanczos(d: f32, lobes: f32) -> f32 {
    if d.abs() >= lobes {
        0.0
    } else {
        sinc(d) * sinc(d / lobes)
    }
}

/// Kernel weight at distance `d` together with the filter's support radius.
fn kernel(method: ResampleMethod, d: f32) -> f32 {
    let d = d.abs();
    match method {
        ResampleMethod::Nearest => {
            if d <= 0.5 {
                1.0
            } else {
                0.0
            }
        }
        ResampleMethod::Bilinear => (1.0 - d).max(0.0),
        ResampleMethod::Welsh => {
            if d < 1.0 {
                1.0 - d * d
            } else {
                0.0
            }
        }
        ResampleMethod::Hanning => {
            if d < 1.0 {
                0.5 + 0.5 * (PI * d).cos()
            } else {
                0.0
            }
        }
        ResampleMethod::Hamming => {
            if d < 1.0 {
                0.54 + 0.46 * (PI * d).cos()
            } else {
                0.0
            }
        }
        ResampleMethod::Gaussian => {
            if d < 2.0 {
                (-d * d / 0.5).exp()
            } else {
                0.0
            }
        }
        ResampleMethod::Bicubic => {
            // Keys cubic, a = -0.5
            let a = -0.5;
            if d < 1.0 {
                (a + 2.0) * d * d * d - (a + 3.0) * d * d + 1.0
            } else if d < 2.0 {
                a * (d * d * d - 5.0 * d * d + 8.0 * d - 4.0)
            } else {
                0.0
            }
        }
        ResampleMethod::Lanczos2 => lanczos(d, 2.0),
        ResampleMethod::Lanczos3 => lanczos(d, 3.0),
        ResampleMethod::Lanczos4 => lanczos(d, 4.0),
    }
}

fn support(method: ResampleMethod) -> f32 {
    match method {
        ResampleMethod::Nearest => 0.5,
        ResampleMethod::Bilinear
        | ResampleMethod::Welsh
        | ResampleMethod::Hanning
        | ResampleMethod::Hamming => 1.0,
        ResampleMethod::Gaussian | ResampleMethod::Bicubic | ResampleMethod::Lanczos2 => 2.0,
        ResampleMethod::Lanczos3 => 3.0,
        ResampleMethod::Lanczos4 => 4.0,
    }
}

/// Precomputed contributions of source samples to one output position.
struct Contrib {
    start: usize,
    weights: Vec<f32>,
}

/// Build the contribution list for one axis. When minifying, the kernel
/// is stretched by the scale factor so neighboring source pixels are
/// averaged instead of skipped.
fn contributions(src_len: usize, dst_len: usize, method: ResampleMethod) -> Vec<Contrib> {
    let scale = src_len as f32 / dst_len as f32;
    let stretch = scale.max(1.0);
    let radius = support(method) * stretch;

    (0..dst_len)
        .map(|i| {
            let center = (i as f32 + 0.5) * scale - 0.5;
            let start = ((center - radius).floor().max(0.0)) as usize;
            let end = ((center + radius).ceil() as usize).min(src_len.saturating_sub(1));

            let mut weights = Vec::with_capacity(end - start + 1);
            let mut total = 0.0f32;
            for j in start..=end {
                let w = kernel(method, (j as f32 - center) / stretch);
                weights.push(w);
                total += w;
            }
            if total.abs() < 1e-8 {
                // Degenerate window; fall back to the nearest sample.
                let nearest = (center.round().max(0.0) as usize).min(src_len - 1);
                return Contrib {
                    start: nearest,
                    weights: vec![1.0],
                };
            }
            for w in &mut weights {
                *w /= total;
            }
            Contrib { start, weights }
        })
        .collect()
}

/// Resize an interleaved RGB888 buffer with the given filter.
pub fn resize_rgb888(
    src: &[u8],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
    method: ResampleMethod,
) -> Vec<u8> {
    debug_assert!(dst_width > 0 && dst_height > 0);

    // Horizontal pass into a float intermediate, then vertical pass.
    let horiz = contributions(src_width, dst_width, method);
    let mut mid = vec![0f32; dst_width * src_height * 3];
    for y in 0..src_height {
        let row = &src[y * src_width * 3..(y + 1) * src_width * 3];
        for (x, contrib) in horiz.iter().enumerate() {
            let mut acc = [0f32; 3];
            for (k, &w) in contrib.weights.iter().enumerate() {
                let p = (contrib.start + k).min(src_width - 1) * 3;
                acc[0] += row[p] as f32 * w;
                acc[1] += row[p + 1] as f32 * w;
                acc[2] += row[p + 2] as f32 * w;
            }
            let out = (y * dst_width + x) * 3;
            mid[out..out + 3].copy_from_slice(&acc);
        }
    }

    let vert = contributions(src_height, dst_height, method);
    let mut dst = vec![0u8; dst_width * dst_height * 3];
    for (y, contrib) in vert.iter().enumerate() {
        for x in 0..dst_width {
            let mut acc = [0f32; 3];
            for (k, &w) in contrib.weights.iter().enumerate() {
                let row = (contrib.start + k).min(src_height - 1);
                let p = (row * dst_width + x) * 3;
                acc[0] += mid[p] * w;
                acc[1] += mid[p + 1] * w;
                acc[2] += mid[p + 2] * w;
            }
            let out = (y * dst_width + x) * 3;
            for c in 0..3 {
                dst[out + c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    dst
}

/// Nearest-neighbor resize of a boolean coverage mask.
pub fn resize_mask_nearest(
    src: &[bool],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
) -> Vec<bool> {
    let mut dst = Vec::with_capacity(dst_width * dst_height);
    for y in 0..dst_height {
        let sy = (y * src_height / dst_height).min(src_height - 1);
        for x in 0..dst_width {
            let sx = (x * src_width / dst_width).min(src_width - 1);
            dst.push(src[sy * src_width + sx]);
        }
    }
    dst
}
