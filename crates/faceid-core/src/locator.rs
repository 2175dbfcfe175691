//! Window-based face locator.
//!
//! Slides square windows from `min_size` to `max_size` (growing by
//! `scale_factor`) over a histogram-equalized grayscale plane and runs each
//! through a short cascade of Haar-like stages evaluated on integral images.
//! Accepted windows are grouped by similarity; groups backed by fewer than
//! `min_neighbors` windows are discarded and the rest are averaged into
//! [`FaceRegion`]s, then filtered to plausible frontal-face proportions.

use crate::imgproc;
use crate::types::{FaceRegion, PixelGrid};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

// --- Cascade stage constants ---
/// Stage 1: minimum intensity standard deviation inside a window.
const WINDOW_MIN_STDDEV: f64 = 12.0;
/// Stage 2: minimum mean gradient energy per pixel inside a window.
const WINDOW_MIN_ENERGY: f64 = 8.0;
/// Stage 2: window energy must exceed the surrounding ring's by this factor.
const SURROUND_RATIO: f64 = 2.0;
/// Stage 2: ring width as a fraction of the window side.
const SURROUND_FRACTION: f64 = 0.25;
/// Stage 2: windows whose in-grid ring is smaller than this fraction of the
/// window area cannot be judged and are rejected.
const MIN_RING_AREA_FRACTION: f64 = 0.25;
/// Stage 3: window energy over the energy of its central quarter; low values
/// mean a small blob padded out with background.
const MIN_FILL_RATIO: f64 = 0.5;
/// Stage 4: weaker half's energy over the stronger half's, both axes.
const MIN_HALF_BALANCE: f64 = 0.5;
/// Window stride as a fraction of the window side.
const STEP_FRACTION: f64 = 0.05;
/// Relative tolerance when grouping similar windows.
const GROUP_EPS: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub scale_factor: f64,
    pub min_neighbors: usize,
    /// Smallest window side in pixels.
    pub min_size: u32,
    /// Largest window side in pixels.
    pub max_size: u32,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    /// Candidates whose smaller side falls below this are discarded.
    pub min_face_side: u32,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 6,
            min_size: 80,
            max_size: 300,
            min_aspect_ratio: 0.7,
            max_aspect_ratio: 1.4,
            min_face_side: 80,
        }
    }
}

/// Summed-area tables over one plane.
struct Integral {
    sum: Array2<f64>,
    sq_sum: Array2<f64>,
    energy: Array2<f64>,
}

impl Integral {
    fn build(gray: &Array2<u8>) -> Self {
        let (h, w) = gray.dim();
        let mut sum = Array2::<f64>::zeros((h + 1, w + 1));
        let mut sq_sum = Array2::<f64>::zeros((h + 1, w + 1));
        let mut energy = Array2::<f64>::zeros((h + 1, w + 1));

        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            let mut row_energy = 0.0;
            for x in 0..w {
                let p = gray[[y, x]] as f64;
                // Forward-difference gradient energy; zero past the last row/column.
                let right = if x + 1 < w { gray[[y, x + 1]] as f64 } else { p };
                let below = if y + 1 < h { gray[[y + 1, x]] as f64 } else { p };
                row_sum += p;
                row_sq += p * p;
                row_energy += (right - p).abs() + (below - p).abs();
                sum[[y + 1, x + 1]] = sum[[y, x + 1]] + row_sum;
                sq_sum[[y + 1, x + 1]] = sq_sum[[y, x + 1]] + row_sq;
                energy[[y + 1, x + 1]] = energy[[y, x + 1]] + row_energy;
            }
        }

        Self { sum, sq_sum, energy }
    }

    fn rect(table: &Array2<f64>, x: usize, y: usize, w: usize, h: usize) -> f64 {
        table[[y + h, x + w]] - table[[y, x + w]] - table[[y + h, x]] + table[[y, x]]
    }
}

/// A window accepted by the cascade, in grid pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Window {
    x: u32,
    y: u32,
    size: u32,
}

/// Face locator with tunable window parameters.
pub struct FaceLocator {
    config: LocatorConfig,
}

impl FaceLocator {
    pub fn new(config: LocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// Find face candidates. An empty result means no face; callers decide
    /// how to treat more than one.
    pub fn locate(&self, grid: &PixelGrid) -> Vec<FaceRegion> {
        let gray = imgproc::equalize_hist(&imgproc::to_gray(grid.as_image()));
        let integral = Integral::build(&gray);
        let (h, w) = gray.dim();

        let windows = self.scan(&integral, w, h);
        let raw = windows.len();
        let grouped = group_windows(&windows, self.config.min_neighbors);

        let candidates: Vec<FaceRegion> = grouped
            .into_iter()
            .filter(|r| {
                let ratio = r.aspect_ratio();
                ratio >= self.config.min_aspect_ratio
                    && ratio <= self.config.max_aspect_ratio
                    && r.width.min(r.height) >= self.config.min_face_side
            })
            .collect();

        tracing::debug!(raw_windows = raw, faces = candidates.len(), "located faces");
        candidates
    }

    fn scan(&self, integral: &Integral, w: usize, h: usize) -> Vec<Window> {
        let mut accepted = Vec::new();
        let max_side = (self.config.max_size as usize).min(w).min(h);
        let scale = self.config.scale_factor.max(1.01);

        let mut side_f = self.config.min_size.max(1) as f64;
        while side_f.round() as usize <= max_side {
            let side = side_f.round() as usize;
            let step = ((side as f64 * STEP_FRACTION).round() as usize).max(2);
            let mut y = 0;
            while y + side <= h {
                let mut x = 0;
                while x + side <= w {
                    if classify_window(integral, x, y, side, w, h) {
                        accepted.push(Window {
                            x: x as u32,
                            y: y as u32,
                            size: side as u32,
                        });
                    }
                    x += step;
                }
                y += step;
            }
            side_f *= scale;
        }

        accepted
    }
}

impl Default for FaceLocator {
    fn default() -> Self {
        Self::new(LocatorConfig::default())
    }
}

/// Pick the candidate with the largest area.
pub fn primary_candidate(candidates: &[FaceRegion]) -> Option<&FaceRegion> {
    candidates.iter().max_by_key(|r| r.area())
}

/// Run one window through the cascade, rejecting at the first failed stage.
fn classify_window(integral: &Integral, x: usize, y: usize, side: usize, w: usize, h: usize) -> bool {
    let area = (side * side) as f64;

    // Stage 1: texture present at all.
    let sum = Integral::rect(&integral.sum, x, y, side, side);
    let sq_sum = Integral::rect(&integral.sq_sum, x, y, side, side);
    let mean = sum / area;
    let var = (sq_sum / area - mean * mean).max(0.0);
    if var.sqrt() < WINDOW_MIN_STDDEV {
        return false;
    }

    // Stage 2: textured blob standing out from its surroundings.
    let inner_energy = Integral::rect(&integral.energy, x, y, side, side);
    let inner_mean = inner_energy / area;
    if inner_mean < WINDOW_MIN_ENERGY {
        return false;
    }
    let pad = (side as f64 * SURROUND_FRACTION).round() as usize;
    let ox1 = x.saturating_sub(pad);
    let oy1 = y.saturating_sub(pad);
    let ox2 = (x + side + pad).min(w);
    let oy2 = (y + side + pad).min(h);
    let outer_area = ((ox2 - ox1) * (oy2 - oy1)) as f64;
    let ring_area = outer_area - area;
    if ring_area < area * MIN_RING_AREA_FRACTION {
        return false;
    }
    let outer_energy = Integral::rect(&integral.energy, ox1, oy1, ox2 - ox1, oy2 - oy1);
    let ring_mean = (outer_energy - inner_energy).max(0.0) / ring_area;
    if inner_mean < SURROUND_RATIO * ring_mean {
        return false;
    }

    // Stage 3: structure fills the window instead of clustering at its center.
    let quarter = side / 4;
    let core_side = side - 2 * quarter;
    let core_mean = Integral::rect(&integral.energy, x + quarter, y + quarter, core_side, core_side)
        / (core_side * core_side) as f64;
    if inner_mean < MIN_FILL_RATIO * core_mean {
        return false;
    }

    // Stage 4: left/right and top/bottom halves carry comparable structure.
    let half = side / 2;
    let left = Integral::rect(&integral.energy, x, y, half, side);
    let right = Integral::rect(&integral.energy, x + side - half, y, half, side);
    let top = Integral::rect(&integral.energy, x, y, side, half);
    let bottom = Integral::rect(&integral.energy, x, y + side - half, side, half);
    balanced(left, right) && balanced(top, bottom)
}

fn balanced(a: f64, b: f64) -> bool {
    let (weak, strong) = if a < b { (a, b) } else { (b, a) };
    strong > 0.0 && weak / strong >= MIN_HALF_BALANCE
}

fn similar(a: &Window, b: &Window) -> bool {
    let delta = GROUP_EPS * a.size.min(b.size) as f64;
    let (ax2, ay2) = (a.x + a.size, a.y + a.size);
    let (bx2, by2) = (b.x + b.size, b.y + b.size);
    (a.x as f64 - b.x as f64).abs() <= delta
        && (a.y as f64 - b.y as f64).abs() <= delta
        && (ax2 as f64 - bx2 as f64).abs() <= delta
        && (ay2 as f64 - by2 as f64).abs() <= delta
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster similar windows, drop weak clusters, average the rest, and drop
/// clusters nested inside a better-supported one.
fn group_windows(windows: &[Window], min_neighbors: usize) -> Vec<FaceRegion> {
    let n = windows.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&windows[i], &windows[j]) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // (count, sum_x, sum_y, sum_side) per root, in first-seen order.
    let mut order: Vec<usize> = Vec::new();
    let mut acc: Vec<Option<(u32, f64, f64, f64)>> = vec![None; n];
    for (i, win) in windows.iter().enumerate() {
        let root = find(&mut parent, i);
        let entry = acc[root].get_or_insert_with(|| {
            order.push(root);
            (0, 0.0, 0.0, 0.0)
        });
        entry.0 += 1;
        entry.1 += win.x as f64;
        entry.2 += win.y as f64;
        entry.3 += win.size as f64;
    }

    let clusters: Vec<FaceRegion> = order
        .into_iter()
        .filter_map(|root| acc[root])
        .filter(|&(count, ..)| count as usize >= min_neighbors.max(1))
        .map(|(count, sx, sy, ss)| {
            let c = count as f64;
            let side = (ss / c).round() as u32;
            FaceRegion {
                x: (sx / c).round() as u32,
                y: (sy / c).round() as u32,
                width: side,
                height: side,
                neighbors: count,
            }
        })
        .collect();

    clusters
        .iter()
        .enumerate()
        .filter(|(i, inner)| {
            !clusters.iter().enumerate().any(|(j, outer)| {
                let dx = (outer.width as f64 * GROUP_EPS).round() as i64;
                let dy = (outer.height as f64 * GROUP_EPS).round() as i64;
                *i != j
                    && inner.x as i64 >= outer.x as i64 - dx
                    && inner.y as i64 >= outer.y as i64 - dy
                    && (inner.x + inner.width) as i64 <= (outer.x + outer.width) as i64 + dx
                    && (inner.y + inner.height) as i64 <= (outer.y + outer.height) as i64 + dy
                    && (outer.neighbors > inner.neighbors.max(3) || inner.neighbors < 3)
            })
        })
        .map(|(_, r)| *r)
        .collect()
}
