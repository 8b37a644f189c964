//! Error-diffusion dithering: map pixels to palette indices while
//! propagating quantization error.
//!
//! Kernels are fixed weight matrices dispatched from a closed enum; the
//! carry mode decides whether error is written back into the source
//! buffer or accumulated in three rotating fixed-point row buffers.

use crate::options::{DiffusionCarry, DiffusionMethod, DiffusionScan};
use crate::palette::Palette;
use crate::pixelformat::PixelFormat;
use crate::{SixelError, SixelResult, SIXEL_PALETTE_MAX};
use log::{debug, trace};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fixed-point scale used by the carry buffers and the lso2 kernel.
const ERR_SCALE_SHIFT: i32 = 12;
const ERR_SCALE: i32 = 1 << ERR_SCALE_SHIFT;
const ERR_ROUND: i32 = 1 << (ERR_SCALE_SHIFT - 1);
const ERR_MAX: i64 = 255 * ERR_SCALE as i64;

/// One diffusion target: column/row offset and weight numerator.
#[derive(Clone, Copy)]
struct KernelCell {
    dx: i32,
    dy: i32,
    num: i32,
}

const fn cell(dx: i32, dy: i32, num: i32) -> KernelCell {
    KernelCell { dx, dy, num }
}

const FS: (&[KernelCell], i32) = (
    &[cell(1, 0, 7), cell(-1, 1, 3), cell(0, 1, 5), cell(1, 1, 1)],
    16,
);

const ATKINSON: (&[KernelCell], i32) = (
    &[
        cell(1, 0, 1),
        cell(2, 0, 1),
        cell(-1, 1, 1),
        cell(0, 1, 1),
        cell(1, 1, 1),
        cell(0, 2, 1),
    ],
    8,
);

const JAJUNI: (&[KernelCell], i32) = (
    &[
        cell(1, 0, 7),
        cell(2, 0, 5),
        cell(-2, 1, 3),
        cell(-1, 1, 5),
        cell(0, 1, 7),
        cell(1, 1, 5),
        cell(2, 1, 3),
        cell(-2, 2, 1),
        cell(-1, 2, 3),
        cell(0, 2, 5),
        cell(1, 2, 3),
        cell(2, 2, 1),
    ],
    48,
);

const STUCKI: (&[KernelCell], i32) = (
    &[
        cell(1, 0, 8),
        cell(2, 0, 4),
        cell(-2, 1, 2),
        cell(-1, 1, 4),
        cell(0, 1, 8),
        cell(1, 1, 4),
        cell(2, 1, 2),
        cell(-2, 2, 1),
        cell(-1, 2, 2),
        cell(0, 2, 4),
        cell(1, 2, 2),
        cell(2, 2, 1),
    ],
    42,
);

const BURKES: (&[KernelCell], i32) = (
    &[
        cell(1, 0, 8),
        cell(2, 0, 4),
        cell(-2, 1, 2),
        cell(-1, 1, 4),
        cell(0, 1, 8),
        cell(1, 1, 4),
        cell(2, 1, 2),
    ],
    32,
);

const SIERRA1: (&[KernelCell], i32) = (
    &[cell(1, 0, 2), cell(-1, 1, 1), cell(0, 1, 1)],
    4,
);

const SIERRA2: (&[KernelCell], i32) = (
    &[
        cell(1, 0, 4),
        cell(2, 0, 3),
        cell(-2, 1, 1),
        cell(-1, 1, 2),
        cell(0, 1, 3),
        cell(1, 1, 2),
        cell(2, 1, 1),
    ],
    16,
);

const SIERRA3: (&[KernelCell], i32) = (
    &[
        cell(1, 0, 5),
        cell(2, 0, 3),
        cell(-2, 1, 2),
        cell(-1, 1, 4),
        cell(0, 1, 5),
        cell(1, 1, 4),
        cell(2, 1, 2),
        cell(-1, 2, 2),
        cell(0, 2, 3),
        cell(1, 2, 2),
    ],
    32,
);

fn kernel_for(method: DiffusionMethod) -> Option<(&'static [KernelCell], i32)> {
    match method {
        DiffusionMethod::Fs => Some(FS),
        DiffusionMethod::Atkinson => Some(ATKINSON),
        DiffusionMethod::JaJuNi => Some(JAJUNI),
        DiffusionMethod::Stucki => Some(STUCKI),
        DiffusionMethod::Burkes => Some(BURKES),
        DiffusionMethod::Sierra1 => Some(SIERRA1),
        DiffusionMethod::Sierra2 => Some(SIERRA2),
        DiffusionMethod::Sierra3 => Some(SIERRA3),
        _ => None,
    }
}

/// Rows below the current one a kernel can reach.
fn kernel_reach(method: DiffusionMethod) -> usize {
    match method {
        DiffusionMethod::None | DiffusionMethod::ADither | DiffusionMethod::XDither => 0,
        DiffusionMethod::Fs | DiffusionMethod::Burkes | DiffusionMethod::Sierra1
        | DiffusionMethod::Sierra2 => 1,
        _ => 2,
    }
}

/// The lso2 kernel: per-error-magnitude weights, last column is the
/// denominator. Small errors keep a tight Floyd-Steinberg footprint,
/// large errors spread like Jarvis so banding in flat tones breaks up.
const LSO2_NARROW: [i32; 6] = [21, 0, 9, 15, 3, 0];
const LSO2_WIDE: [i32; 6] = [10, 7, 7, 10, 7, 7];

const fn build_lso2() -> [[i32; 7]; 256] {
    let mut table = [[0i32; 7]; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = 0;
        while c < 6 {
            table[i][c] = (LSO2_NARROW[c] * (255 - i as i32) + LSO2_WIDE[c] * i as i32) / 255;
            c += 1;
        }
        table[i][6] = 48;
        i += 1;
    }
    table
}

static LSO2_TABLE: [[i32; 7]; 256] = build_lso2();

/// lso2 offsets paired with the table columns 0..=5.
const LSO2_CELLS: [(i32, i32); 6] = [(1, 0), (2, 0), (-1, 1), (0, 1), (1, 1), (0, 2)];

/// Positionally stable ordered-dither masks. Ported verbatim so output
/// stays bit-stable across versions.
fn mask_a(x: i32, y: i32, c: i32) -> f32 {
    ((((x + c * 67) + y * 236) * 119) & 255) as f32 / 128.0 - 1.0
}

fn mask_x(x: i32, y: i32, c: i32) -> f32 {
    ((((x + c * 29) ^ (y * 149)) * 1234) & 511) as f32 / 256.0 - 1.0
}

/// 15-bit lookup cache key.
fn cache_key(pixel: &[u8]) -> usize {
    (((pixel[0] >> 3) as usize) << 10)
        | (((pixel[1] >> 3) as usize) << 5)
        | ((pixel[2] >> 3) as usize)
}

/// Extra weight on the red distance for skin tones: R > G > B with a
/// red-blue gap above 30.
fn complexion_weight(pixel: &[u8], complexion: i32) -> i32 {
    if complexion > 1 && pixel[0] > pixel[1] && pixel[1] > pixel[2] && pixel[0] - pixel[2] > 30 {
        complexion
    } else {
        1
    }
}

fn lookup_normal(pixel: &[u8], palette: &[u8], ncolors: usize, complexion: i32) -> usize {
    let weight = complexion_weight(pixel, complexion);
    let mut best = 0;
    let mut diff = i32::MAX;
    for i in 0..ncolors {
        let dr = pixel[0] as i32 - palette[i * 3] as i32;
        let dg = pixel[1] as i32 - palette[i * 3 + 1] as i32;
        let db = pixel[2] as i32 - palette[i * 3 + 2] as i32;
        let distant = dr * dr * weight + dg * dg + db * db;
        if distant < diff {
            diff = distant;
            best = i;
        }
    }
    best
}

/// Cached nearest-palette lookup. Each cache slot remembers the exact
/// color it was computed for, so an aliased slot falls back to the full
/// scan instead of returning a neighbor's answer; results are identical
/// no matter what order pixels are visited in.
fn lookup_fast(
    pixel: &[u8],
    palette: &[u8],
    ncolors: usize,
    cache: &mut [u64],
    complexion: i32,
) -> usize {
    let packed = ((pixel[0] as u64) << 16) | ((pixel[1] as u64) << 8) | pixel[2] as u64;
    let key = cache_key(pixel);
    let entry = cache[key];
    if entry != 0 && entry >> 16 == packed {
        return (entry & 0xffff) as usize - 1;
    }
    let best = lookup_normal(pixel, palette, ncolors, complexion);
    if entry == 0 {
        cache[key] = (packed << 16) | (best as u64 + 1);
    }
    best
}

fn lookup_mono_darkbg(pixel: &[u8]) -> usize {
    let sum = pixel[0] as i32 + pixel[1] as i32 + pixel[2] as i32;
    usize::from(sum >= 128 * 2)
}

fn lookup_mono_lightbg(pixel: &[u8]) -> usize {
    let sum = pixel[0] as i32 + pixel[1] as i32 + pixel[2] as i32;
    usize::from(sum < 128 * 2)
}

#[derive(Clone, Copy, PartialEq)]
enum LookupKind {
    Fast,
    MonoDark,
    MonoLight,
}

/// A palette-indexed image: one byte per pixel plus the palette that
/// defines the indices. Immutable once built and shareable across
/// threads.
#[derive(Debug, Clone)]
pub struct IndexImage {
    pub indices: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub palette: Arc<Palette>,
}

/// Hooks threaded through one [`Dither::apply_with`] call.
#[derive(Default)]
pub struct ApplyHooks<'a> {
    /// Polled between rows; on observation the apply returns `Interrupted`.
    pub cancel: Option<&'a AtomicBool>,
    /// Called after each completed row so overlapped pipelines can start
    /// emitting finished bands.
    pub on_row: Option<&'a mut dyn FnMut(usize)>,
    /// Worker budget; bands are processed in parallel when above 1.
    pub threads: usize,
    /// Rows per parallel band.
    pub band_height: usize,
    /// Burn-in rows re-dithered before each parallel band.
    pub band_overlap: usize,
}

/// Dithering context: owns the palette, the lookup cache and the
/// diffusion configuration.
pub struct Dither {
    palette: Arc<Palette>,
    method_for_diffuse: DiffusionMethod,
    method_for_scan: DiffusionScan,
    method_for_carry: DiffusionCarry,
    optimize_palette: bool,
    complexion: i32,
    pixelformat: PixelFormat,
    transparent: Option<u8>,
    cache: Vec<u64>,
}

impl Dither {
    pub fn new(palette: Arc<Palette>) -> Self {
        Dither {
            palette,
            method_for_diffuse: DiffusionMethod::Auto,
            method_for_scan: DiffusionScan::Auto,
            method_for_carry: DiffusionCarry::Auto,
            optimize_palette: false,
            complexion: 1,
            pixelformat: PixelFormat::Rgb888,
            transparent: None,
            cache: Vec::new(),
        }
    }

    pub fn palette(&self) -> &Arc<Palette> {
        &self.palette
    }

    pub fn set_diffusion(&mut self, method: DiffusionMethod) {
        self.method_for_diffuse = method;
    }

    pub fn set_scan(&mut self, scan: DiffusionScan) {
        self.method_for_scan = scan;
    }

    pub fn set_carry(&mut self, carry: DiffusionCarry) {
        self.method_for_carry = carry;
    }

    /// Skip palette slots that never occur, renumbering on the fly.
    /// Ignored while the palette is forced to keep its size.
    pub fn set_optimize_palette(&mut self, optimize: bool) {
        self.optimize_palette = optimize && !self.palette.is_forced();
    }

    pub fn set_complexion_score(&mut self, score: i32) {
        self.complexion = score.max(1);
    }

    pub fn set_pixelformat(&mut self, format: PixelFormat) {
        self.pixelformat = format;
    }

    pub fn pixelformat(&self) -> PixelFormat {
        self.pixelformat
    }

    pub fn set_transparent(&mut self, index: u8) {
        self.transparent = Some(index);
    }

    pub fn transparent(&self) -> Option<u8> {
        self.transparent
    }

    /// Resolved diffusion kernel (`auto` becomes Floyd-Steinberg).
    fn resolved_diffuse(&self) -> DiffusionMethod {
        match self.method_for_diffuse {
            DiffusionMethod::Auto => DiffusionMethod::Fs,
            other => other,
        }
    }

    /// `auto` scan: serpentine for error-diffusing kernels, raster for
    /// the positionally stable ones.
    fn resolved_scan(&self, diffuse: DiffusionMethod) -> DiffusionScan {
        match self.method_for_scan {
            DiffusionScan::Auto => match diffuse {
                DiffusionMethod::None | DiffusionMethod::ADither | DiffusionMethod::XDither => {
                    DiffusionScan::Raster
                }
                _ => DiffusionScan::Serpentine,
            },
            other => other,
        }
    }

    /// `auto` carry: separate buffers for kernels reaching two rows down.
    fn resolved_carry(&self, diffuse: DiffusionMethod) -> DiffusionCarry {
        match self.method_for_carry {
            DiffusionCarry::Auto => {
                if kernel_reach(diffuse) >= 2 {
                    DiffusionCarry::Carry
                } else {
                    DiffusionCarry::Direct
                }
            }
            other => other,
        }
    }

    fn lookup_kind(&self) -> LookupKind {
        let palette = self.palette.as_bytes();
        if self.palette.active() == 2 {
            let sum1: i32 = palette[0..3].iter().map(|&v| v as i32).sum();
            let sum2: i32 = palette[3..6].iter().map(|&v| v as i32).sum();
            if sum1 == 0 && sum2 == 255 * 3 {
                return LookupKind::MonoDark;
            }
            if sum1 == 255 * 3 && sum2 == 0 {
                return LookupKind::MonoLight;
            }
        }
        LookupKind::Fast
    }

    /// Map every pixel of an RGB888 buffer onto the palette.
    ///
    /// The source buffer is mutated in direct carry mode (the kernel
    /// writes error back into it), matching the in-place semantics the
    /// caller's working copy expects.
    pub fn apply(
        &mut self,
        pixels: &mut [u8],
        width: usize,
        height: usize,
    ) -> SixelResult<IndexImage> {
        self.apply_with(pixels, width, height, ApplyHooks::default())
    }

    pub fn apply_with(
        &mut self,
        pixels: &mut [u8],
        width: usize,
        height: usize,
        hooks: ApplyHooks,
    ) -> SixelResult<IndexImage> {
        if pixels.len() != width * height * 3 {
            return Err(SixelError::LogicError(format!(
                "dither input holds {} bytes for {}x{}",
                pixels.len(),
                width,
                height
            )));
        }

        let diffuse = self.resolved_diffuse();
        let scan = self.resolved_scan(diffuse);
        let carry = self.resolved_carry(diffuse);
        trace!("dither: {diffuse:?} scan {scan:?} carry {carry:?}");

        if self.cache.is_empty() {
            self.cache = vec![0u64; 1 << 15];
        } else {
            self.cache.fill(0);
        }

        let stable = matches!(
            diffuse,
            DiffusionMethod::None | DiffusionMethod::ADither | DiffusionMethod::XDither
        );
        let parallel = hooks.threads > 1 && !self.optimize_palette && height > 6;

        let mut core = DitherCore {
            palette: self.palette.as_bytes().to_vec(),
            ncolors: self.palette.active(),
            lookup: self.lookup_kind(),
            complexion: self.complexion,
            diffuse,
            serpentine: scan == DiffusionScan::Serpentine,
            use_carry: carry == DiffusionCarry::Carry,
        };

        let indices = if parallel {
            let band_height = hooks.band_height.max(6);
            let overlap = if stable {
                0
            } else {
                hooks.band_overlap.max(kernel_reach(diffuse))
            };
            debug!(
                "dithering {}x{} across {} threads, bands of {} (+{} burn-in)",
                width, height, hooks.threads, band_height, overlap
            );
            run_banded(&core, pixels, width, height, band_height, overlap, hooks.cancel)?
        } else {
            let mut out = vec![0u8; width * height];
            let mut migration = MigrationState::new(self.optimize_palette);
            core.run_rows(
                pixels,
                width,
                0,
                height,
                &mut self.cache,
                &mut out,
                &mut migration,
                hooks.cancel,
                hooks.on_row,
            )?;
            if let Some(optimized) = migration.finish(&core.palette) {
                debug!(
                    "optimize-palette: {} of {} slots survive",
                    optimized.len() / 3,
                    self.palette.active()
                );
                let palette = Arc::new(
                    Palette::new(optimized, self.palette.requested())?
                        .with_keycolor(self.palette.keycolor()),
                );
                return Ok(IndexImage {
                    indices: out,
                    width,
                    height,
                    palette,
                });
            }
            out
        };

        Ok(IndexImage {
            indices,
            width,
            height,
            palette: Arc::clone(&self.palette),
        })
    }
}

/// On-the-fly palette renumbering for optimize-palette mode.
struct MigrationState {
    enabled: bool,
    map: [u16; SIXEL_PALETTE_MAX],
    used: usize,
}

impl MigrationState {
    fn new(enabled: bool) -> Self {
        MigrationState {
            enabled,
            map: [0; SIXEL_PALETTE_MAX],
            used: 0,
        }
    }

    #[inline]
    fn remap(&mut self, index: usize) -> usize {
        if !self.enabled {
            return index;
        }
        if self.map[index] == 0 {
            self.used += 1;
            self.map[index] = self.used as u16;
        }
        self.map[index] as usize - 1
    }

    /// The compacted palette, or `None` when optimization was off or
    /// nothing was dropped.
    fn finish(&self, palette: &[u8]) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        let mut out = vec![0u8; self.used * 3];
        for (index, &slot) in self.map.iter().enumerate() {
            if slot != 0 {
                let dst = (slot as usize - 1) * 3;
                out[dst..dst + 3].copy_from_slice(&palette[index * 3..index * 3 + 3]);
            }
        }
        Some(out)
    }
}

/// Resolved per-run state shared by the sequential and banded paths.
#[derive(Clone)]
struct DitherCore {
    palette: Vec<u8>,
    ncolors: usize,
    lookup: LookupKind,
    complexion: i32,
    diffuse: DiffusionMethod,
    serpentine: bool,
    use_carry: bool,
}

impl DitherCore {
    #[inline]
    fn lookup(&self, pixel: &[u8], cache: &mut [u64]) -> usize {
        match self.lookup {
            LookupKind::MonoDark => lookup_mono_darkbg(pixel),
            LookupKind::MonoLight => lookup_mono_lightbg(pixel),
            LookupKind::Fast => {
                lookup_fast(pixel, &self.palette, self.ncolors, cache, self.complexion)
            }
        }
    }

    /// Dither rows `[y_start, y_end)` held in `data`; the output index of
    /// row `y` lands at `out[(y - y_start) * width ..]`.
    ///
    /// `y_start` is the absolute row index so serpentine parity and the
    /// ordered masks stay globally consistent when run per band.
    #[allow(clippy::too_many_arguments)]
    fn run_rows(
        &mut self,
        data: &mut [u8],
        width: usize,
        y_start: usize,
        y_end: usize,
        cache: &mut [u64],
        out: &mut [u8],
        migration: &mut MigrationState,
        cancel: Option<&AtomicBool>,
        mut on_row: Option<&mut dyn FnMut(usize)>,
    ) -> SixelResult<()> {
        let region_height = y_end - y_start;
        let mut carry = CarryBuffers::new(self.use_carry, width);

        for region_y in 0..region_height {
            let y = y_start + region_y;
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(SixelError::Interrupted);
                }
            }

            let reverse = self.serpentine && (y & 1) == 1;
            let xs: Box<dyn Iterator<Item = usize>> = if reverse {
                Box::new((0..width).rev())
            } else {
                Box::new(0..width)
            };
            let direction: i32 = if reverse { -1 } else { 1 };

            for x in xs {
                let pos = region_y * width + x;
                let base = pos * 3;

                let mut corrected = [0u8; 3];
                let mut accum_scaled = [0i32; 3];
                if carry.active() {
                    for (n, slot) in corrected.iter_mut().enumerate() {
                        let accum = ((data[base + n] as i64) << ERR_SCALE_SHIFT)
                            + carry.curr[x * 3 + n] as i64;
                        carry.curr[x * 3 + n] = 0;
                        let clamped = accum.clamp(0, ERR_MAX) as i32;
                        accum_scaled[n] = clamped;
                        *slot = ((clamped + ERR_ROUND) >> ERR_SCALE_SHIFT).min(255) as u8;
                    }
                } else {
                    corrected.copy_from_slice(&data[base..base + 3]);
                }

                // Ordered masks perturb the looked-up value only; no
                // error leaves the pixel.
                let masked;
                let pixel: &[u8] = match self.diffuse {
                    DiffusionMethod::ADither => {
                        masked = apply_mask(&corrected, x, y, mask_a);
                        &masked
                    }
                    DiffusionMethod::XDither => {
                        masked = apply_mask(&corrected, x, y, mask_x);
                        &masked
                    }
                    _ => &corrected,
                };

                let color_index = self.lookup(pixel, cache);
                out[pos] = migration.remap(color_index) as u8;

                if matches!(
                    self.diffuse,
                    DiffusionMethod::None | DiffusionMethod::ADither | DiffusionMethod::XDither
                ) {
                    continue;
                }

                for n in 0..3 {
                    let palette_value = self.palette[color_index * 3 + n] as i32;
                    if self.diffuse == DiffusionMethod::Lso2 {
                        let magnitude =
                            (corrected[n] as i32 - palette_value).unsigned_abs().min(255);
                        let error_scaled = if carry.active() {
                            accum_scaled[n] - (palette_value << ERR_SCALE_SHIFT)
                        } else {
                            ((data[base + n] as i32) - palette_value) << ERR_SCALE_SHIFT
                        };
                        diffuse_lso2(
                            data,
                            &mut carry,
                            width,
                            region_height,
                            x,
                            region_y,
                            n,
                            error_scaled,
                            magnitude as usize,
                            direction,
                        );
                    } else if carry.active() {
                        let error_scaled = accum_scaled[n] - (palette_value << ERR_SCALE_SHIFT);
                        diffuse_kernel_carry(
                            &mut carry,
                            self.diffuse,
                            width,
                            region_height,
                            x,
                            region_y,
                            n,
                            error_scaled,
                            direction,
                        );
                    } else {
                        let error = data[base + n] as i32 - palette_value;
                        diffuse_kernel_direct(
                            data,
                            self.diffuse,
                            width,
                            region_height,
                            x,
                            region_y,
                            n,
                            error,
                            direction,
                        );
                    }
                }
            }

            carry.rotate();
            if let Some(notify) = on_row.as_deref_mut() {
                notify(y);
            }
        }
        Ok(())
    }
}

/// Three row-sized signed accumulators rotated by swap, never copied.
struct CarryBuffers {
    curr: Vec<i32>,
    next: Vec<i32>,
    far: Vec<i32>,
    enabled: bool,
}

impl CarryBuffers {
    fn new(enabled: bool, width: usize) -> Self {
        let len = if enabled { width * 3 } else { 0 };
        CarryBuffers {
            curr: vec![0; len],
            next: vec![0; len],
            far: vec![0; len],
            enabled,
        }
    }

    #[inline]
    fn active(&self) -> bool {
        self.enabled
    }

    fn rotate(&mut self) {
        if !self.enabled {
            return;
        }
        std::mem::swap(&mut self.curr, &mut self.next);
        std::mem::swap(&mut self.next, &mut self.far);
        self.far.fill(0);
    }
}

fn apply_mask(pixel: &[u8; 3], x: usize, y: usize, mask: fn(i32, i32, i32) -> f32) -> [u8; 3] {
    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let value = pixel[c] as i32 + (mask(x as i32, y as i32, c as i32) * 32.0) as i32;
        *slot = value.clamp(0, 255) as u8;
    }
    out
}

/// Distribute `error` into neighboring source pixels (direct mode).
/// Out-of-bounds targets are dropped.
#[allow(clippy::too_many_arguments)]
fn diffuse_kernel_direct(
    data: &mut [u8],
    method: DiffusionMethod,
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    channel: usize,
    error: i32,
    direction: i32,
) {
    let Some((cells, denom)) = kernel_for(method) else {
        return;
    };
    for c in cells {
        let dx = c.dx * direction;
        let tx = x as i32 + dx;
        let ty = y as i32 + c.dy;
        if tx < 0 || tx >= width as i32 || ty < 0 || ty >= height as i32 {
            continue;
        }
        let offset = (ty as usize * width + tx as usize) * 3 + channel;
        let value = data[offset] as i32 + error * c.num / denom;
        data[offset] = value.clamp(0, 255) as u8;
    }
}

/// Distribute a fixed-point `error` into the carry rows.
#[allow(clippy::too_many_arguments)]
fn diffuse_kernel_carry(
    carry: &mut CarryBuffers,
    method: DiffusionMethod,
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    channel: usize,
    error: i32,
    direction: i32,
) {
    let Some((cells, denom)) = kernel_for(method) else {
        return;
    };
    for c in cells {
        let dx = c.dx * direction;
        let tx = x as i32 + dx;
        let ty = y as i32 + c.dy;
        if tx < 0 || tx >= width as i32 || ty < 0 || ty >= height as i32 {
            continue;
        }
        let slot = tx as usize * 3 + channel;
        let term = scaled_term(error, c.num, denom);
        match c.dy {
            0 => carry.curr[slot] += term,
            1 => carry.next[slot] += term,
            _ => carry.far[slot] += term,
        }
    }
}

#[inline]
fn scaled_term(error: i32, num: i32, denom: i32) -> i32 {
    let delta = error as i64 * num as i64;
    let rounded = if delta >= 0 {
        (delta + denom as i64 / 2) / denom as i64
    } else {
        (delta - denom as i64 / 2) / denom as i64
    };
    rounded as i32
}

/// The adaptive kernel: weights picked from [`LSO2_TABLE`] by the error
/// magnitude of the current pixel.
#[allow(clippy::too_many_arguments)]
fn diffuse_lso2(
    data: &mut [u8],
    carry: &mut CarryBuffers,
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    channel: usize,
    error_scaled: i32,
    magnitude: usize,
    direction: i32,
) {
    if error_scaled == 0 {
        return;
    }
    let entry = &LSO2_TABLE[magnitude.min(255)];
    let denom = entry[6];
    if denom == 0 {
        return;
    }

    for (i, (dx, dy)) in LSO2_CELLS.iter().enumerate() {
        let tx = x as i32 + dx * direction;
        let ty = y as i32 + dy;
        if tx < 0 || tx >= width as i32 || ty < 0 || ty >= height as i32 {
            continue;
        }
        let term = scaled_term(error_scaled, entry[i], denom);
        if carry.active() {
            let slot = tx as usize * 3 + channel;
            match dy {
                0 => carry.curr[slot] += term,
                1 => carry.next[slot] += term,
                _ => carry.far[slot] += term,
            }
        } else {
            let offset = (ty as usize * width + tx as usize) * 3 + channel;
            let value = ((data[offset] as i64) << ERR_SCALE_SHIFT) + term as i64;
            let value = value.clamp(0, ERR_MAX);
            data[offset] = ((value as i32 + ERR_ROUND) >> ERR_SCALE_SHIFT).min(255) as u8;
        }
    }
}

/// Parallel band dispatch: each worker re-dithers `overlap` burn-in rows
/// before its band to hide the seam, then only its own rows are kept.
/// Bands are collected in order so the result is deterministic.
fn run_banded(
    core: &DitherCore,
    pixels: &[u8],
    width: usize,
    height: usize,
    band_height: usize,
    overlap: usize,
    cancel: Option<&AtomicBool>,
) -> SixelResult<Vec<u8>> {
    let bands: Vec<(usize, usize)> = (0..height)
        .step_by(band_height)
        .map(|start| (start, (start + band_height).min(height)))
        .collect();

    let results: Vec<SixelResult<Vec<u8>>> = bands
        .par_iter()
        .map(|&(band_start, band_end)| {
            let burn_start = band_start.saturating_sub(overlap);
            let mut region =
                pixels[burn_start * width * 3..band_end * width * 3].to_vec();
            let mut out = vec![0u8; (band_end - burn_start) * width];
            let mut cache = vec![0u64; 1 << 15];
            let mut migration = MigrationState::new(false);
            let mut worker = core.clone();
            worker.run_rows(
                &mut region,
                width,
                burn_start,
                band_end,
                &mut cache,
                &mut out,
                &mut migration,
                cancel,
                None,
            )?;
            // Drop the burn-in rows.
            Ok(out.split_off((band_start - burn_start) * width))
        })
        .collect();

    let mut indices = Vec::with_capacity(width * height);
    for band in results {
        indices.extend_from_slice(&band?);
    }
    Ok(indices)
}
