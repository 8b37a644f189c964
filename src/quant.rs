//! Palette construction: histogram, median cut, k-means and final merge.
//!
//! The histogram is a dense entry array; median-cut boxes are index
//! ranges over it, so the box list and the entries never form cycles.

use crate::options::{FinalMerge, LutPolicy, MethodForLargest, MethodForRep, QuantizeModel};
use crate::palette::Palette;
use crate::{SixelError, SixelResult, SIXEL_PALETTE_MAX};
use log::debug;
use std::collections::HashMap;

/// One distinct color and how many pixels carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistEntry {
    pub rgb: [u8; 3],
    pub count: u32,
}

/// Tunable parameters, captured from the environment once at encoder
/// construction.
#[derive(Debug, Clone)]
pub struct QuantTuning {
    /// Provisional palette oversize factor before the final merge (1.0-3.0)
    pub oversplit_factor: f64,
    /// Lloyd convergence threshold for the k-means solver (0.0-0.5)
    pub kmeans_threshold: f64,
    /// Lloyd iteration cap for the k-means solver (1-30)
    pub kmeans_iter_max: usize,
    /// Extra Lloyd passes after a ward merge
    pub merge_lloyd_iters: usize,
    /// Lloyd iteration cap during hierarchical k-means merging
    pub hkmeans_iter_max: usize,
    /// Convergence threshold during hierarchical k-means merging
    pub hkmeans_threshold: f64,
    /// Red luminance weight for `find_largest = lum`
    pub lumin_factor_r: f64,
    /// Green luminance weight for `find_largest = lum`
    pub lumin_factor_g: f64,
    /// Seed for the k-means++ generator
    pub seed: u64,
}

impl Default for QuantTuning {
    fn default() -> Self {
        QuantTuning {
            oversplit_factor: 1.81,
            kmeans_threshold: 0.125,
            kmeans_iter_max: 20,
            merge_lloyd_iters: 3,
            hkmeans_iter_max: 20,
            hkmeans_threshold: 0.125,
            lumin_factor_r: 0.2989,
            lumin_factor_g: 0.5866,
            seed: 0,
        }
    }
}

/// Everything the palette builder needs for one solve.
#[derive(Debug, Clone)]
pub struct QuantizeOptions {
    pub reqcolors: usize,
    pub method_for_largest: MethodForLargest,
    pub method_for_rep: MethodForRep,
    pub quantize_model: QuantizeModel,
    pub final_merge: FinalMerge,
    pub lut_policy: LutPolicy,
    pub force_palette: bool,
    pub tuning: QuantTuning,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        QuantizeOptions {
            reqcolors: SIXEL_PALETTE_MAX,
            method_for_largest: MethodForLargest::Auto,
            method_for_rep: MethodForRep::Auto,
            quantize_model: QuantizeModel::Auto,
            final_merge: FinalMerge::Auto,
            lut_policy: LutPolicy::Auto,
            force_palette: false,
            tuning: QuantTuning::default(),
        }
    }
}

/// Resolve the `auto` LUT policy from the source bit depth.
pub fn resolve_lut_policy(policy: LutPolicy, source_bits: usize) -> LutPolicy {
    match policy {
        LutPolicy::Auto => {
            if source_bits <= 8 {
                LutPolicy::FiveBit
            } else {
                LutPolicy::SixBit
            }
        }
        other => other,
    }
}

/// Buckets carry the pixel-weighted mean of the colors that landed in
/// them, so a bucket holding a single distinct color reports it exactly
/// and nothing is lost on images with few colors.
fn bucketed_histogram(pixels: &[u8], shift: u32) -> Vec<HistEntry> {
    let channel_bits = 8 - shift;
    let bucket_count = 1usize << (channel_bits * 3);
    let mut counts = vec![0u32; bucket_count];
    let mut sums = vec![[0u64; 3]; bucket_count];
    let mut order: Vec<u32> = Vec::new();

    for p in pixels.chunks_exact(3) {
        let key = ((((p[0] >> shift) as u32) << (channel_bits * 2))
            | (((p[1] >> shift) as u32) << channel_bits)
            | ((p[2] >> shift) as u32)) as usize;
        if counts[key] == 0 {
            order.push(key as u32);
        }
        counts[key] = counts[key].saturating_add(1);
        sums[key][0] += p[0] as u64;
        sums[key][1] += p[1] as u64;
        sums[key][2] += p[2] as u64;
    }

    order
        .into_iter()
        .map(|key| {
            let key = key as usize;
            let n = counts[key] as u64;
            HistEntry {
                rgb: [
                    (sums[key][0] / n) as u8,
                    (sums[key][1] / n) as u8,
                    (sums[key][2] / n) as u8,
                ],
                count: counts[key],
            }
        })
        .collect()
}

fn exact_histogram(pixels: &[u8]) -> Vec<HistEntry> {
    let mut counts: HashMap<u32, u32> = HashMap::new();
    let mut order: Vec<u32> = Vec::new();

    for p in pixels.chunks_exact(3) {
        let key = ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32;
        let slot = counts.entry(key).or_insert_with(|| {
            order.push(key);
            0
        });
        *slot = slot.saturating_add(1);
    }

    order
        .into_iter()
        .map(|key| HistEntry {
            rgb: [(key >> 16) as u8, (key >> 8) as u8, key as u8],
            count: counts[&key],
        })
        .collect()
}

/// Exact counting through a two-level table: a dense 6-bit-per-channel
/// top level pointing at small per-cell color lists. No aliasing, one
/// indirection per pixel.
fn certlut_histogram(pixels: &[u8]) -> Vec<HistEntry> {
    const CELLS: usize = 1 << 18;
    let mut cells: Vec<u32> = vec![0; CELLS];
    let mut lists: Vec<Vec<([u8; 3], u32)>> = Vec::new();
    let mut cell_order: Vec<usize> = Vec::new();

    for p in pixels.chunks_exact(3) {
        let rgb = [p[0], p[1], p[2]];
        let cell = (((p[0] >> 2) as usize) << 12)
            | (((p[1] >> 2) as usize) << 6)
            | ((p[2] >> 2) as usize);
        let list = if cells[cell] == 0 {
            lists.push(Vec::with_capacity(1));
            cells[cell] = lists.len() as u32;
            cell_order.push(cell);
            lists.last_mut().unwrap()
        } else {
            &mut lists[cells[cell] as usize - 1]
        };
        match list.iter_mut().find(|(c, _)| *c == rgb) {
            Some((_, count)) => *count = count.saturating_add(1),
            None => list.push((rgb, 1)),
        }
    }

    let mut out = Vec::new();
    for cell in cell_order {
        for &(rgb, count) in &lists[cells[cell] as usize - 1] {
            out.push(HistEntry { rgb, count });
        }
    }
    out
}

/// Count the distinct colors of an RGB888 buffer under the given policy.
/// Entries come back in first-seen order; zero-count buckets never appear.
pub fn compute_histogram(pixels: &[u8], policy: LutPolicy) -> Vec<HistEntry> {
    match resolve_lut_policy(policy, 8) {
        LutPolicy::FiveBit => bucketed_histogram(pixels, 3),
        LutPolicy::SixBit => bucketed_histogram(pixels, 2),
        LutPolicy::Hash => exact_histogram(pixels),
        LutPolicy::CertLut => certlut_histogram(pixels),
        LutPolicy::Auto => unreachable!("resolved above"),
    }
}

/// A median-cut box: an index range over the (partially sorted) entry
/// array plus the pixel population it covers.
#[derive(Debug, Clone, Copy)]
struct ColorBox {
    start: usize,
    colors: usize,
    sum: u64,
}

fn box_bounds(entries: &[HistEntry]) -> ([u8; 3], [u8; 3]) {
    let mut min = entries[0].rgb;
    let mut max = entries[0].rgb;
    for e in &entries[1..] {
        for c in 0..3 {
            min[c] = min[c].min(e.rgb[c]);
            max[c] = max[c].max(e.rgb[c]);
        }
    }
    (min, max)
}

fn largest_dimension(
    min: [u8; 3],
    max: [u8; 3],
    method: MethodForLargest,
    tuning: &QuantTuning,
) -> usize {
    let spread = |c: usize| (max[c] - min[c]) as f64;
    let weighted: [f64; 3] = match method {
        MethodForLargest::Lum => {
            let factors = [
                tuning.lumin_factor_r,
                tuning.lumin_factor_g,
                1.0 - tuning.lumin_factor_r - tuning.lumin_factor_g,
            ];
            [
                factors[0] * spread(0),
                factors[1] * spread(1),
                factors[2] * spread(2),
            ]
        }
        _ => [spread(0), spread(1), spread(2)],
    };
    let mut dim = 0;
    for c in 1..3 {
        if weighted[c] > weighted[dim] {
            dim = c;
        }
    }
    dim
}

fn representative(entries: &[HistEntry], method: MethodForRep) -> [u8; 3] {
    match method {
        // Auto follows the classic median-cut default of the box center.
        MethodForRep::Auto | MethodForRep::Center => {
            let (min, max) = box_bounds(entries);
            [
                ((min[0] as u16 + max[0] as u16) / 2) as u8,
                ((min[1] as u16 + max[1] as u16) / 2) as u8,
                ((min[2] as u16 + max[2] as u16) / 2) as u8,
            ]
        }
        MethodForRep::Average => {
            let mut sum = [0u64; 3];
            for e in entries {
                for c in 0..3 {
                    sum[c] += e.rgb[c] as u64;
                }
            }
            let n = entries.len() as u64;
            [
                (sum[0] / n) as u8,
                (sum[1] / n) as u8,
                (sum[2] / n) as u8,
            ]
        }
        // Pixel-weighted centroid; the auto default.
        _ => weighted_centroid(entries),
    }
}

fn weighted_centroid(entries: &[HistEntry]) -> [u8; 3] {
    let mut sum = [0u64; 3];
    let mut n = 0u64;
    for e in entries {
        let w = e.count as u64;
        n += w;
        for c in 0..3 {
            sum[c] += e.rgb[c] as u64 * w;
        }
    }
    let n = n.max(1);
    [(sum[0] / n) as u8, (sum[1] / n) as u8, (sum[2] / n) as u8]
}

/// Heckbert median cut over the histogram. Returns one representative
/// color per final box, in box order.
fn median_cut(
    entries: &mut [HistEntry],
    newcolors: usize,
    method_for_largest: MethodForLargest,
    method_for_rep: MethodForRep,
    tuning: &QuantTuning,
) -> Vec<[u8; 3]> {
    let total: u64 = entries.iter().map(|e| e.count as u64).sum();
    let mut boxes = vec![ColorBox {
        start: 0,
        colors: entries.len(),
        sum: total,
    }];

    while boxes.len() < newcolors {
        // Boxes are kept sorted by population; split the first one that
        // still holds more than one color.
        let Some(bi) = boxes.iter().position(|b| b.colors >= 2) else {
            break;
        };
        let ColorBox { start, colors, sum } = boxes[bi];
        let slice = &mut entries[start..start + colors];

        let (min, max) = box_bounds(slice);
        let dim = largest_dimension(min, max, method_for_largest, tuning);
        slice.sort_by_key(|e| (e.rgb[dim], e.rgb));

        // Median by pixel count, not by entry count.
        let mut lowersum = slice[0].count as u64;
        let mut median = 1;
        while median < colors - 1 && lowersum < sum / 2 {
            lowersum += slice[median].count as u64;
            median += 1;
        }

        boxes[bi] = ColorBox {
            start,
            colors: median,
            sum: lowersum,
        };
        boxes.push(ColorBox {
            start: start + median,
            colors: colors - median,
            sum: sum - lowersum,
        });
        boxes.sort_by(|a, b| b.sum.cmp(&a.sum).then(a.start.cmp(&b.start)));
    }

    boxes
        .iter()
        .map(|b| representative(&entries[b.start..b.start + b.colors], method_for_rep))
        .collect()
}

/// Deterministic 64-bit generator for the k-means++ seeding (xorshift*).
struct SeededRng(u64);

impl SeededRng {
    fn new(seed: u64) -> Self {
        SeededRng(seed.wrapping_add(0x9e3779b97f4a7c15))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545f4914f6cdd1d)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next() >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn dist2(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    dr * dr + dg * dg + db * db
}

fn to_f64(rgb: [u8; 3]) -> [f64; 3] {
    [rgb[0] as f64, rgb[1] as f64, rgb[2] as f64]
}

/// One Lloyd pass: assign entries to the nearest center and recompute
/// pixel-weighted means. Returns the largest center movement in channel
/// units. Empty clusters are reseeded onto the entry farthest from its
/// center.
fn lloyd_pass(entries: &[HistEntry], centers: &mut [[f64; 3]]) -> f64 {
    let k = centers.len();
    let mut sums = vec![[0f64; 4]; k];

    for e in entries {
        let p = to_f64(e.rgb);
        let mut best = 0;
        let mut best_d = f64::MAX;
        for (i, c) in centers.iter().enumerate() {
            let d = dist2(p, *c);
            if d < best_d {
                best_d = d;
                best = i;
            }
        }
        let w = e.count as f64;
        sums[best][0] += p[0] * w;
        sums[best][1] += p[1] * w;
        sums[best][2] += p[2] * w;
        sums[best][3] += w;
    }

    let mut moved = 0f64;
    for (i, s) in sums.iter().enumerate() {
        if s[3] == 0.0 {
            // Reseed an empty cluster onto the worst-represented entry.
            let far = entries
                .iter()
                .max_by(|a, b| {
                    let da = centers
                        .iter()
                        .map(|c| dist2(to_f64(a.rgb), *c))
                        .fold(f64::MAX, f64::min);
                    let db = centers
                        .iter()
                        .map(|c| dist2(to_f64(b.rgb), *c))
                        .fold(f64::MAX, f64::min);
                    da.partial_cmp(&db).unwrap()
                })
                .map(|e| to_f64(e.rgb));
            if let Some(far) = far {
                moved = moved.max(dist2(centers[i], far).sqrt());
                centers[i] = far;
            }
            continue;
        }
        let next = [s[0] / s[3], s[1] / s[3], s[2] / s[3]];
        moved = moved.max(dist2(centers[i], next).sqrt());
        centers[i] = next;
    }
    moved
}

/// k-means++ seeding followed by Lloyd iterations.
fn kmeans(entries: &[HistEntry], k: usize, tuning: &QuantTuning) -> Vec<[f64; 3]> {
    let mut rng = SeededRng::new(tuning.seed);
    let mut centers: Vec<[f64; 3]> = Vec::with_capacity(k);

    let first = (rng.next() % entries.len() as u64) as usize;
    centers.push(to_f64(entries[first].rgb));

    let mut nearest: Vec<f64> = entries
        .iter()
        .map(|e| dist2(to_f64(e.rgb), centers[0]) * e.count as f64)
        .collect();

    while centers.len() < k {
        let total: f64 = nearest.iter().sum();
        let chosen = if total <= 0.0 {
            (rng.next() % entries.len() as u64) as usize
        } else {
            let mut target = rng.next_f64() * total;
            let mut pick = entries.len() - 1;
            for (i, &d) in nearest.iter().enumerate() {
                if target < d {
                    pick = i;
                    break;
                }
                target -= d;
            }
            pick
        };
        let center = to_f64(entries[chosen].rgb);
        centers.push(center);
        for (i, e) in entries.iter().enumerate() {
            let d = dist2(to_f64(e.rgb), center) * e.count as f64;
            if d < nearest[i] {
                nearest[i] = d;
            }
        }
    }

    for iteration in 0..tuning.kmeans_iter_max {
        let moved = lloyd_pass(entries, &mut centers);
        if moved < tuning.kmeans_threshold {
            debug!("kmeans converged after {} iterations", iteration + 1);
            break;
        }
    }
    centers
}

/// Weighted cluster used while merging an over-split palette.
#[derive(Debug, Clone, Copy)]
struct Cluster {
    center: [f64; 3],
    weight: f64,
}

fn cluster_weights(entries: &[HistEntry], centers: &[[f64; 3]]) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = centers
        .iter()
        .map(|&center| Cluster { center, weight: 0.0 })
        .collect();
    for e in entries {
        let p = to_f64(e.rgb);
        let mut best = 0;
        let mut best_d = f64::MAX;
        for (i, c) in centers.iter().enumerate() {
            let d = dist2(p, *c);
            if d < best_d {
                best_d = d;
                best = i;
            }
        }
        clusters[best].weight += e.count as f64;
    }
    clusters
}

/// Merge `clusters` down to `n` by repeatedly joining the pair with the
/// smallest increase in within-cluster variance:
/// `delta = (w_i * w_j) / (w_i + w_j) * ||c_i - c_j||^2`.
fn ward_merge(mut clusters: Vec<Cluster>, n: usize) -> Vec<Cluster> {
    while clusters.len() > n {
        let mut best = (0, 1);
        let mut best_delta = f64::MAX;
        for i in 0..clusters.len() {
            for j in i + 1..clusters.len() {
                let wi = clusters[i].weight.max(1.0);
                let wj = clusters[j].weight.max(1.0);
                let delta = wi * wj / (wi + wj) * dist2(clusters[i].center, clusters[j].center);
                if delta < best_delta {
                    best_delta = delta;
                    best = (i, j);
                }
            }
        }
        let (i, j) = best;
        let a = clusters[i];
        let b = clusters[j];
        let w = a.weight + b.weight;
        let merged = if w > 0.0 {
            Cluster {
                center: [
                    (a.center[0] * a.weight + b.center[0] * b.weight) / w,
                    (a.center[1] * a.weight + b.center[1] * b.weight) / w,
                    (a.center[2] * a.weight + b.center[2] * b.weight) / w,
                ],
                weight: w,
            }
        } else {
            a
        };
        clusters[i] = merged;
        clusters.swap_remove(j);
    }
    clusters
}

fn centers_to_colors(centers: &[[f64; 3]]) -> Vec<u8> {
    let mut colors = Vec::with_capacity(centers.len() * 3);
    for c in centers {
        for ch in c {
            colors.push(ch.round().clamp(0.0, 255.0) as u8);
        }
    }
    colors
}

/// Build a palette of at most `opts.reqcolors` colors for an RGB888 buffer.
///
/// Returns the palette and the number of distinct colors found in the
/// histogram (before any reduction).
pub fn make_palette(pixels: &[u8], opts: &QuantizeOptions) -> SixelResult<(Palette, usize)> {
    if pixels.is_empty() {
        return Err(SixelError::BadInput("frame has no pixels".into()));
    }
    if opts.reqcolors < 1 || opts.reqcolors > SIXEL_PALETTE_MAX {
        return Err(SixelError::BadArgument(format!(
            "requested colors {} out of range",
            opts.reqcolors
        )));
    }

    let mut entries = compute_histogram(pixels, opts.lut_policy);
    let origcolors = entries.len();
    debug!(
        "histogram: {} distinct colors for {} pixels",
        origcolors,
        pixels.len() / 3
    );

    let colors: Vec<u8> = if opts.reqcolors == 1 {
        weighted_centroid(&entries).to_vec()
    } else if origcolors <= opts.reqcolors {
        // Already few enough colors; the histogram is the palette.
        entries.iter().flat_map(|e| e.rgb).collect()
    } else {
        let merge = opts.final_merge;
        let solve_colors = if matches!(merge, FinalMerge::Ward | FinalMerge::Hkmeans) {
            let factor = opts.tuning.oversplit_factor.clamp(1.0, 3.0);
            ((opts.reqcolors as f64 * factor).round() as usize)
                .clamp(opts.reqcolors, SIXEL_PALETTE_MAX)
                .min(origcolors)
        } else {
            opts.reqcolors
        };

        let mut centers: Vec<[f64; 3]> = match opts.quantize_model {
            QuantizeModel::Kmeans => kmeans(&entries, solve_colors, &opts.tuning),
            _ => median_cut(
                &mut entries,
                solve_colors,
                opts.method_for_largest,
                opts.method_for_rep,
                &opts.tuning,
            )
            .into_iter()
            .map(to_f64)
            .collect(),
        };

        match merge {
            FinalMerge::Ward if centers.len() > opts.reqcolors => {
                let clusters = cluster_weights(&entries, &centers);
                centers = ward_merge(clusters, opts.reqcolors)
                    .into_iter()
                    .map(|c| c.center)
                    .collect();
                for _ in 0..opts.tuning.merge_lloyd_iters {
                    lloyd_pass(&entries, &mut centers);
                }
            }
            FinalMerge::Hkmeans if centers.len() > opts.reqcolors => {
                let mut clusters = cluster_weights(&entries, &centers);
                while clusters.len() > opts.reqcolors {
                    let target = clusters.len() - 1;
                    clusters = ward_merge(clusters, target);
                    let mut step: Vec<[f64; 3]> =
                        clusters.iter().map(|c| c.center).collect();
                    lloyd_pass(&entries, &mut step);
                    clusters = cluster_weights(&entries, &step);
                }
                centers = clusters.iter().map(|c| c.center).collect();
                for iteration in 0..opts.tuning.hkmeans_iter_max {
                    let moved = lloyd_pass(&entries, &mut centers);
                    if moved < opts.tuning.hkmeans_threshold {
                        debug!("hkmeans converged after {} iterations", iteration + 1);
                        break;
                    }
                }
            }
            _ => {}
        }

        centers_to_colors(&centers)
    };

    let mut palette = Palette::new(colors, opts.reqcolors)?.with_force(opts.force_palette);
    if opts.force_palette {
        palette.pad_to_requested();
    }
    Ok((palette, origcolors))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(rgb: [u8; 3], n: usize) -> Vec<u8> {
        rgb.iter().copied().cycle().take(n * 3).collect()
    }

    fn four_color_image() -> Vec<u8> {
        let mut pixels = Vec::new();
        pixels.extend_from_slice(&solid([255, 0, 0], 4));
        pixels.extend_from_slice(&solid([0, 255, 0], 3));
        pixels.extend_from_slice(&solid([0, 0, 255], 2));
        pixels.extend_from_slice(&solid([255, 255, 255], 1));
        pixels
    }

    #[test]
    fn histogram_counts_distinct_colors() {
        for policy in [LutPolicy::FiveBit, LutPolicy::Hash, LutPolicy::CertLut] {
            let entries = compute_histogram(&four_color_image(), policy);
            assert_eq!(entries.len(), 4, "{policy:?}");
            let total: u32 = entries.iter().map(|e| e.count).sum();
            assert_eq!(total, 10, "{policy:?}");
        }
    }

    #[test]
    fn exact_policies_keep_full_precision() {
        // Two colors one bucket apart under 5-bit quantization.
        let mut pixels = solid([100, 100, 100], 2);
        pixels.extend_from_slice(&solid([101, 100, 100], 1));
        assert_eq!(compute_histogram(&pixels, LutPolicy::FiveBit).len(), 1);
        assert_eq!(compute_histogram(&pixels, LutPolicy::Hash).len(), 2);
        assert_eq!(compute_histogram(&pixels, LutPolicy::CertLut).len(), 2);
    }

    #[test]
    fn few_colors_pass_through_untouched() {
        let (palette, origcolors) = make_palette(
            &four_color_image(),
            &QuantizeOptions {
                reqcolors: 16,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(origcolors, 4);
        assert_eq!(palette.active(), 4);
        // Every input color survives exactly.
        for rgb in [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 255]] {
            assert!((0..palette.active()).any(|i| palette.rgb(i) == rgb));
        }
    }

    #[test]
    fn single_color_request_yields_weighted_centroid() {
        let mut pixels = solid([0, 0, 0], 3);
        pixels.extend_from_slice(&solid([255, 255, 255], 1));
        let (palette, _) = make_palette(
            &pixels,
            &QuantizeOptions {
                reqcolors: 1,
                lut_policy: LutPolicy::Hash,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(palette.active(), 1);
        // 3 black + 1 white pixels average to 63.
        assert_eq!(palette.rgb(0), [63, 63, 63]);
    }

    #[test]
    fn force_palette_pads_to_requested() {
        let (palette, _) = make_palette(
            &solid([10, 20, 30], 8),
            &QuantizeOptions {
                reqcolors: 8,
                force_palette: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(palette.active(), 8);
        for i in 0..8 {
            assert_eq!(palette.rgb(i), [10, 20, 30]);
        }
    }

    #[test]
    fn median_cut_respects_color_budget() {
        // A ramp with many distinct colors must reduce to the request.
        let mut pixels = Vec::new();
        for i in 0..256usize {
            pixels.extend_from_slice(&solid([i as u8, (255 - i) as u8, 128], 2));
        }
        for reqcolors in [2, 4, 16, 64] {
            let (palette, origcolors) = make_palette(
                &pixels,
                &QuantizeOptions {
                    reqcolors,
                    lut_policy: LutPolicy::Hash,
                    ..Default::default()
                },
            )
            .unwrap();
            assert!(origcolors > reqcolors);
            assert!(palette.active() <= reqcolors);
            assert!(palette.active() > 0);
        }
    }

    #[test]
    fn grayscale_ramp_quantizes_to_even_levels() {
        let mut pixels = Vec::new();
        for i in 0..=255u16 {
            pixels.extend_from_slice(&solid([i as u8, i as u8, i as u8], 4));
        }
        let (palette, _) = make_palette(
            &pixels,
            &QuantizeOptions {
                reqcolors: 4,
                lut_policy: LutPolicy::Hash,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(palette.active(), 4);
        let mut levels: Vec<u8> = (0..4).map(|i| palette.rgb(i)[0]).collect();
        levels.sort_unstable();
        // Quarters of the ramp: near 32, 96, 160, 223.
        for (level, expected) in levels.iter().zip([32u8, 96, 160, 223]) {
            assert!(
                (*level as i16 - expected as i16).abs() <= 16,
                "levels {levels:?}"
            );
        }
    }

    #[test]
    fn kmeans_is_deterministic_for_a_fixed_seed() {
        let mut pixels = Vec::new();
        for i in 0..200usize {
            pixels.extend_from_slice(&solid(
                [(i * 7 % 256) as u8, (i * 13 % 256) as u8, (i * 29 % 256) as u8],
                1 + i % 3,
            ));
        }
        let opts = QuantizeOptions {
            reqcolors: 16,
            quantize_model: QuantizeModel::Kmeans,
            lut_policy: LutPolicy::Hash,
            ..Default::default()
        };
        let (a, _) = make_palette(&pixels, &opts).unwrap();
        let (b, _) = make_palette(&pixels, &opts).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn ward_merge_reduces_oversplit_palette() {
        let mut pixels = Vec::new();
        for i in 0..128usize {
            pixels.extend_from_slice(&solid([(i * 2) as u8, 0, (255 - i * 2) as u8], 3));
        }
        let (palette, _) = make_palette(
            &pixels,
            &QuantizeOptions {
                reqcolors: 8,
                final_merge: FinalMerge::Ward,
                lut_policy: LutPolicy::Hash,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(palette.active(), 8);
    }

    #[test]
    fn hkmeans_merge_reduces_oversplit_palette() {
        let mut pixels = Vec::new();
        for i in 0..96usize {
            pixels.extend_from_slice(&solid([(i * 2) as u8, (i % 32 * 8) as u8, 40], 2));
        }
        let (palette, _) = make_palette(
            &pixels,
            &QuantizeOptions {
                reqcolors: 6,
                final_merge: FinalMerge::Hkmeans,
                lut_policy: LutPolicy::Hash,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(palette.active(), 6);
    }

    #[test]
    fn empty_input_is_bad_input() {
        let err = make_palette(&[], &QuantizeOptions::default()).unwrap_err();
        assert!(matches!(err, SixelError::BadInput(_)));
    }
}
