//! Grayscale image primitives: conversion, equalization, CLAHE, 3×3
//! derivative filters, Canny edges and histogram helpers.
//!
//! Planes are `ndarray::Array2` indexed `[[row, col]]`. Filters use
//! reflect-101 borders (`gfedcb|abcdefgh|gfedcba`).

use image::RgbImage;
use ndarray::Array2;
use std::collections::VecDeque;

/// Convert RGB to 8-bit luma with ITU-R BT.601 weights.
pub fn to_gray(img: &RgbImage) -> Array2<u8> {
    let (w, h) = img.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        let [r, g, b] = img.get_pixel(x as u32, y as u32).0;
        luma(r, g, b)
    })
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// HSV saturation channel on the 0–255 scale: `255 * (max - min) / max`.
pub fn saturation(img: &RgbImage) -> Array2<u8> {
    let (w, h) = img.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        let [r, g, b] = img.get_pixel(x as u32, y as u32).0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        if max == 0 {
            0
        } else {
            (255.0 * (max - min) as f32 / max as f32).round() as u8
        }
    })
}

/// Global histogram equalization. A constant image is returned unchanged.
pub fn equalize_hist(gray: &Array2<u8>) -> Array2<u8> {
    let mut hist = [0usize; 256];
    for &p in gray.iter() {
        hist[p as usize] += 1;
    }
    let total = gray.len();
    let Some(first) = hist.iter().position(|&c| c > 0) else {
        return gray.clone();
    };
    if hist[first] == total {
        return gray.clone();
    }

    let scale = 255.0 / (total - hist[first]) as f64;
    let mut lut = [0u8; 256];
    let mut cumulative = 0usize;
    for level in (first + 1)..256 {
        cumulative += hist[level];
        lut[level] = (cumulative as f64 * scale).round().clamp(0.0, 255.0) as u8;
    }
    gray.mapv(|p| lut[p as usize])
}

/// Apply Contrast-Limited Adaptive Histogram Equalization in place.
///
/// Divides the plane into `tiles_x` × `tiles_y` tiles, clips each tile's
/// histogram at `clip_limit` times the flat-histogram bin height,
/// redistributes the excess, and maps every pixel through bilinear
/// interpolation of the four nearest tile CDFs.
pub fn clahe(gray: &mut Array2<u8>, tiles_x: usize, tiles_y: usize, clip_limit: f32) {
    let (h, w) = gray.dim();
    if w == 0 || h == 0 || tiles_x == 0 || tiles_y == 0 {
        return;
    }
    let tile_w = w / tiles_x;
    let tile_h = h / tiles_y;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut luts: Vec<[f32; 256]> = Vec::with_capacity(tiles_x * tiles_y);
    for row in 0..tiles_y {
        for col in 0..tiles_x {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;
            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[gray[[y, x]] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            let scale = 255.0 / tile_pixels as f32;
            let mut lut = [0f32; 256];
            let mut cumulative = 0u32;
            for (level, &count) in hist.iter().enumerate() {
                cumulative += count;
                lut[level] = (cumulative as f32 * scale).clamp(0.0, 255.0);
            }
            luts.push(lut);
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (tiles_y - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(tiles_y - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (tiles_x - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tiles_x - 1);
            let dx = fx - c0 as f32;

            let pixel = gray[[y, x]] as usize;
            let tl = luts[r0 * tiles_x + c0][pixel];
            let tr = luts[r0 * tiles_x + c1][pixel];
            let bl = luts[r1 * tiles_x + c0][pixel];
            let br = luts[r1 * tiles_x + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            gray[[y, x]] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Reflect-101 index into `0..n`.
fn reflect101(i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * n - 2 - i;
    }
    i.clamp(0, n - 1) as usize
}

/// Correlate a plane with a 3×3 kernel (row-major).
fn filter3x3(gray: &Array2<u8>, kernel: &[[f64; 3]; 3]) -> Array2<f64> {
    let (h, w) = gray.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        let mut acc = 0.0;
        for (ky, krow) in kernel.iter().enumerate() {
            let sy = reflect101(y as isize + ky as isize - 1, h);
            for (kx, &k) in krow.iter().enumerate() {
                if k != 0.0 {
                    let sx = reflect101(x as isize + kx as isize - 1, w);
                    acc += k * gray[[sy, sx]] as f64;
                }
            }
        }
        acc
    })
}

const SOBEL_X: [[f64; 3]; 3] = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]];
const SOBEL_Y: [[f64; 3]; 3] = [[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]];
const LAPLACIAN: [[f64; 3]; 3] = [[0.0, 1.0, 0.0], [1.0, -4.0, 1.0], [0.0, 1.0, 0.0]];

/// 3×3 Sobel derivatives `(dx, dy)`.
pub fn sobel(gray: &Array2<u8>) -> (Array2<f64>, Array2<f64>) {
    (filter3x3(gray, &SOBEL_X), filter3x3(gray, &SOBEL_Y))
}

/// 4-neighbour Laplacian.
pub fn laplacian(gray: &Array2<u8>) -> Array2<f64> {
    filter3x3(gray, &LAPLACIAN)
}

/// Canny edge map with L1 gradient magnitude and hysteresis thresholds.
pub fn canny(gray: &Array2<u8>, low: f64, high: f64) -> Array2<bool> {
    let (h, w) = gray.dim();
    let (dx, dy) = sobel(gray);
    let mag = Array2::from_shape_fn((h, w), |idx| dx[idx].abs() + dy[idx].abs());
    let at = |y: isize, x: isize| -> f64 {
        if y < 0 || x < 0 || y >= h as isize || x >= w as isize {
            0.0
        } else {
            mag[[y as usize, x as usize]]
        }
    };

    // tan(22.5°) and tan(67.5°) split gradient directions into four sectors.
    const TAN_22_5: f64 = 0.414_213_562_373_095;
    const TAN_67_5: f64 = 2.414_213_562_373_095;

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        None,
        Weak,
        Strong,
    }
    let mut marks = Array2::from_elem((h, w), Mark::None);
    let mut queue = VecDeque::new();

    for y in 0..h {
        for x in 0..w {
            let m = mag[[y, x]];
            if m <= low {
                continue;
            }
            let (gx, gy) = (dx[[y, x]], dy[[y, x]]);
            let (ax, ay) = (gx.abs(), gy.abs());
            let (yi, xi) = (y as isize, x as isize);
            let is_max = if ay <= ax * TAN_22_5 {
                m > at(yi, xi - 1) && m >= at(yi, xi + 1)
            } else if ay >= ax * TAN_67_5 {
                m > at(yi - 1, xi) && m >= at(yi + 1, xi)
            } else {
                let s: isize = if (gx < 0.0) != (gy < 0.0) { -1 } else { 1 };
                m > at(yi - 1, xi - s) && m >= at(yi + 1, xi + s)
            };
            if !is_max {
                continue;
            }
            if m > high {
                marks[[y, x]] = Mark::Strong;
                queue.push_back((y, x));
            } else {
                marks[[y, x]] = Mark::Weak;
            }
        }
    }

    while let Some((y, x)) = queue.pop_front() {
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                if marks[[ny, nx]] == Mark::Weak {
                    marks[[ny, nx]] = Mark::Strong;
                    queue.push_back((ny, nx));
                }
            }
        }
    }

    marks.mapv(|m| m == Mark::Strong)
}

/// Histogram of 8-bit values over `[0, 256)` split into `bins` equal bins.
pub fn histogram<'a>(values: impl IntoIterator<Item = &'a u8>, bins: usize) -> Vec<f64> {
    let mut hist = vec![0.0; bins];
    let width = 256 / bins;
    for &v in values {
        hist[v as usize / width] += 1.0;
    }
    hist
}

/// Scale `v` to unit L2 norm. An all-zero vector stays zero.
pub fn l2_normalize(v: &mut [f64]) {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    } else {
        v.iter_mut().for_each(|x| *x = 0.0);
    }
}

pub fn mean(v: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = v.into_iter().fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Population variance.
pub fn variance(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let m = mean(v.iter().copied());
    v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / v.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn stddev(data: &Array2<u8>) -> f64 {
        let v: Vec<f64> = data.iter().map(|&b| b as f64).collect();
        variance(&v).sqrt()
    }

    #[test]
    fn test_to_gray_weights() {
        let mut img = RgbImage::new(3, 1);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        img.put_pixel(1, 0, image::Rgb([0, 255, 0]));
        img.put_pixel(2, 0, image::Rgb([200, 200, 200]));
        let g = to_gray(&img);
        assert_eq!(g[[0, 0]], 76);
        assert_eq!(g[[0, 1]], 150);
        assert_eq!(g[[0, 2]], 200);
    }

    #[test]
    fn test_saturation_gray_and_pure() {
        let mut img = RgbImage::new(3, 1);
        img.put_pixel(0, 0, image::Rgb([90, 90, 90]));
        img.put_pixel(1, 0, image::Rgb([0, 0, 200]));
        img.put_pixel(2, 0, image::Rgb([0, 0, 0]));
        let s = saturation(&img);
        assert_eq!(s.as_slice().unwrap(), &[0, 255, 0]);
    }

    #[test]
    fn test_equalize_constant_unchanged() {
        let gray = Array2::from_elem((4, 4), 93u8);
        assert_eq!(equalize_hist(&gray), gray);
    }

    #[test]
    fn test_equalize_stretches_range() {
        let gray = array![[100u8, 101], [102, 103]];
        let eq = equalize_hist(&gray);
        assert_eq!(eq[[0, 0]], 0);
        assert_eq!(eq[[1, 1]], 255);
    }

    #[test]
    fn test_clahe_increases_contrast() {
        // Low-contrast 16x16 image: all pixels between 100–110
        let mut gray = Array2::from_shape_fn((16, 16), |(y, x)| 100 + ((y * 16 + x) % 11) as u8);
        let orig_stddev = stddev(&gray);
        clahe(&mut gray, 2, 2, 40.0);
        let new_stddev = stddev(&gray);
        assert!(
            new_stddev > orig_stddev,
            "CLAHE should increase contrast: orig={orig_stddev:.2}, new={new_stddev:.2}"
        );
    }

    #[test]
    fn test_clahe_tiny_plane_is_noop() {
        let mut gray = Array2::from_elem((3, 3), 7u8);
        clahe(&mut gray, 8, 8, 2.0);
        assert!(gray.iter().all(|&p| p == 7));
    }

    #[test]
    fn test_reflect101() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(2, 5), 2);
        assert_eq!(reflect101(-1, 1), 0);
    }

    #[test]
    fn test_sobel_vertical_step() {
        let gray = Array2::from_shape_fn((5, 6), |(_, x)| if x < 3 { 0u8 } else { 100 });
        let (dx, dy) = sobel(&gray);
        assert_eq!(dx[[2, 2]], 400.0);
        assert_eq!(dx[[2, 0]], 0.0);
        assert!(dy.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_laplacian_flat_is_zero() {
        let gray = Array2::from_elem((6, 6), 50u8);
        assert!(laplacian(&gray).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_canny_flat_has_no_edges() {
        let gray = Array2::from_elem((20, 20), 128u8);
        assert!(canny(&gray, 50.0, 150.0).iter().all(|&e| !e));
    }

    #[test]
    fn test_canny_finds_step_edge() {
        let gray = Array2::from_shape_fn((20, 20), |(_, x)| if x < 10 { 20u8 } else { 220 });
        let edges = canny(&gray, 50.0, 150.0);
        // One thin vertical line, suppressed to a single column per row.
        for y in 0..20 {
            let row: Vec<usize> = (0..20).filter(|&x| edges[[y, x]]).collect();
            assert_eq!(row, vec![9], "row {y}");
        }
    }

    #[test]
    fn test_histogram_bins() {
        let data = [0u8, 3, 4, 255, 252];
        let h = histogram(data.iter(), 64);
        assert_eq!(h.len(), 64);
        assert_eq!(h[0], 2.0);
        assert_eq!(h[1], 1.0);
        assert_eq!(h[63], 2.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-12 && (v[1] - 0.8).abs() < 1e-12);
        let mut z = vec![0.0; 3];
        l2_normalize(&mut z);
        assert_eq!(z, vec![0.0; 3]);
    }

    #[test]
    fn test_variance() {
        assert_eq!(variance(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 4.0);
        assert_eq!(variance(&[]), 0.0);
    }
}
