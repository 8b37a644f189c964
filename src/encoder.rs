//! The encoder object: configuration, option parsing and the pipeline
//! that drives scale, crop, colorspace conversion, palette construction,
//! dithering and emission.

use crate::color::parse_color_spec;
use crate::colorspace::convert_rgb;
use crate::dither::{ApplyHooks, Dither, IndexImage};
use crate::frame::{Frame, WorkingImage};
use crate::options::{
    parse_colors, BuiltinPalette, ColorOption, Colorspace, CropRect, DiffusionCarry,
    DiffusionMethod, DiffusionScan, EncodePolicy, FinalMerge, LoopMode, LutPolicy,
    MethodForLargest, MethodForRep, OptionFlag, PaletteType, QuantizeModel, ResampleMethod,
    SizeSpec,
};
use crate::output::SixelOutput;
use crate::palette::{builtin, monochrome, parse_palette_file, Palette};
use crate::pixelformat::{unpack_palette_indices, PixelFormat};
use crate::quant::{make_palette, QuantTuning, QuantizeOptions};
use crate::{SixelError, SixelResult, SIXEL_PALETTE_MAX};
use log::{debug, warn};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Every user-visible setting of one encode, captured as closed enums and
/// validated numbers. Write-once per `encode_frame` call; environment
/// variables are folded in at [`Encoder::new`] so the config never reads
/// globals afterwards.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub reqcolors: u16,
    pub force_palette: bool,
    pub color_option: ColorOption,
    pub invert: bool,

    pub method_for_diffuse: DiffusionMethod,
    pub method_for_scan: DiffusionScan,
    pub method_for_carry: DiffusionCarry,
    pub method_for_largest: MethodForLargest,
    pub method_for_rep: MethodForRep,
    pub quantize_model: QuantizeModel,
    pub final_merge: FinalMerge,
    pub lut_policy: LutPolicy,
    pub complexion: i32,

    pub width: SizeSpec,
    pub height: SizeSpec,
    pub crop: Option<CropRect>,
    pub clip_first: bool,
    pub resampling: ResampleMethod,
    /// Terminal cell geometry backing the `c` size unit.
    pub cell_width: u32,
    pub cell_height: u32,

    pub working_colorspace: Colorspace,
    pub output_colorspace: Colorspace,
    pub bgcolor: Option<[u8; 3]>,

    pub eight_bit: bool,
    pub gri_limit: bool,
    pub ormode: bool,
    pub penetrate_multiplexer: bool,
    pub palette_type: PaletteType,
    pub encode_policy: EncodePolicy,
    pub use_macro: bool,
    pub macro_number: Option<u32>,

    pub loop_mode: LoopMode,
    pub ignore_delay: bool,
    pub fstatic: bool,

    pub threads: usize,
    pub band_height: usize,
    pub band_overlap: usize,

    pub tuning: QuantTuning,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            reqcolors: SIXEL_PALETTE_MAX as u16,
            force_palette: false,
            color_option: ColorOption::Default,
            invert: false,
            method_for_diffuse: DiffusionMethod::Auto,
            method_for_scan: DiffusionScan::Auto,
            method_for_carry: DiffusionCarry::Auto,
            method_for_largest: MethodForLargest::Auto,
            method_for_rep: MethodForRep::Auto,
            quantize_model: QuantizeModel::Auto,
            final_merge: FinalMerge::Auto,
            lut_policy: LutPolicy::Auto,
            complexion: 1,
            width: SizeSpec::Auto,
            height: SizeSpec::Auto,
            crop: None,
            clip_first: false,
            resampling: ResampleMethod::Bilinear,
            cell_width: 10,
            cell_height: 20,
            working_colorspace: Colorspace::Gamma,
            output_colorspace: Colorspace::Gamma,
            bgcolor: None,
            eight_bit: false,
            gri_limit: false,
            ormode: false,
            penetrate_multiplexer: false,
            palette_type: PaletteType::Auto,
            encode_policy: EncodePolicy::Auto,
            use_macro: false,
            macro_number: None,
            loop_mode: LoopMode::Auto,
            ignore_delay: false,
            fstatic: false,
            threads: 1,
            band_height: 64,
            band_overlap: 4,
            tuning: QuantTuning::default(),
        }
    }
}

fn env_f64(name: &str, range: std::ops::RangeInclusive<f64>, slot: &mut f64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<f64>() {
            Ok(v) if range.contains(&v) => *slot = v,
            _ => warn!("ignoring ${name}={raw}: out of range"),
        }
    }
}

fn env_usize(name: &str, range: std::ops::RangeInclusive<usize>, slot: &mut usize) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<usize>() {
            Ok(v) if range.contains(&v) => *slot = v,
            _ => warn!("ignoring ${name}={raw}: out of range"),
        }
    }
}

impl EncoderConfig {
    /// Default configuration with the `SIXEL_*` environment variables
    /// applied. Invalid values are logged and skipped.
    pub fn from_env() -> Self {
        let mut config = EncoderConfig::default();

        if let Ok(spec) = std::env::var("SIXEL_BGCOLOR") {
            match parse_color_spec(&spec) {
                Ok(rgb) => config.bgcolor = Some(rgb),
                Err(_) => warn!("ignoring $SIXEL_BGCOLOR={spec}: unparsable"),
            }
        }
        if let Ok(raw) = std::env::var("SIXEL_COLORS") {
            match raw.parse::<u16>() {
                Ok(n) if (2..=SIXEL_PALETTE_MAX as u16).contains(&n) => config.reqcolors = n,
                _ => warn!("ignoring $SIXEL_COLORS={raw}: out of range"),
            }
        }
        env_f64(
            "SIXEL_PALETTE_OVERSPLIT_FACTOR",
            1.0..=3.0,
            &mut config.tuning.oversplit_factor,
        );
        env_f64(
            "SIXEL_PALETTE_KMEANS_THRESHOLD",
            0.0..=0.5,
            &mut config.tuning.kmeans_threshold,
        );
        env_usize(
            "SIXEL_PALETTE_KMEANS_ITER_COUNT_MAX",
            1..=30,
            &mut config.tuning.kmeans_iter_max,
        );
        env_usize(
            "SIXEL_PALETTE_FINAL_MERGE_ADDITIONAL_LLOYD_ITER_COUNT",
            0..=30,
            &mut config.tuning.merge_lloyd_iters,
        );
        env_usize(
            "SIXEL_PALETTE_FINAL_MERGE_HKMEANS_ITER_COUNT_MAX",
            1..=30,
            &mut config.tuning.hkmeans_iter_max,
        );
        env_f64(
            "SIXEL_PALETTE_FINAL_MERGE_HKMEANS_THRESHOLD",
            0.0..=0.5,
            &mut config.tuning.hkmeans_threshold,
        );
        env_f64(
            "SIXEL_PALETTE_LUMIN_FACTOR_R",
            0.0..=1.0,
            &mut config.tuning.lumin_factor_r,
        );
        env_f64(
            "SIXEL_PALETTE_LUMIN_FACTOR_G",
            0.0..=1.0,
            &mut config.tuning.lumin_factor_g,
        );
        env_usize("SIXEL_THREADS", 1..=256, &mut config.threads);
        config
    }
}

/// Hex-encodes everything written through it; DECDMAC macro bodies may
/// not contain raw 8-bit data.
struct HexWriter<'a, W: Write> {
    inner: &'a mut W,
}

impl<W: Write> Write for HexWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = Vec::with_capacity(buf.len() * 2);
        for &b in buf {
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0xf) as usize]);
        }
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// The top-level pipeline object.
///
/// Owns the configuration and the palette cache; frames are fed one at a
/// time and SIXEL bytes leave through the writer handed to
/// [`Encoder::encode_frame`].
pub struct Encoder {
    config: EncoderConfig,
    cancel: Option<Arc<AtomicBool>>,
    /// Palette reused across frames for fixed-palette color options.
    palette_cache: Mutex<Option<Arc<Palette>>>,
    last_message: Option<String>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Create an encoder, capturing the `SIXEL_*` environment variables
    /// into the configuration.
    pub fn new() -> Self {
        Encoder::with_config(EncoderConfig::from_env())
    }

    pub fn with_config(config: EncoderConfig) -> Self {
        Encoder {
            config,
            cancel: None,
            palette_cache: Mutex::new(None),
            last_message: None,
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Non-owning cancel flag; when it becomes true the encoder stops at
    /// the next safe point and terminates the stream with CAN + ST.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    /// The human-readable diagnostic attached to the most recent
    /// failure. Informational only.
    pub fn last_additional_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    fn fail(&mut self, err: SixelError) -> SixelError {
        self.last_message = Some(err.to_string());
        *self.palette_cache.lock() = None;
        err
    }

    /// Apply one configuration option from its string form. Enumerated
    /// values go through the shared prefix matcher; numbers are bounds
    /// checked. Idempotent per field.
    pub fn setopt(&mut self, flag: OptionFlag, value: &str) -> SixelResult<()> {
        let result = self.setopt_inner(flag, value);
        if let Err(err) = result {
            return Err(self.fail(err));
        }
        // A palette-affecting option invalidates the cache.
        *self.palette_cache.lock() = None;
        Ok(())
    }

    fn setopt_inner(&mut self, flag: OptionFlag, value: &str) -> SixelResult<()> {
        let config = &mut self.config;
        match flag {
            OptionFlag::SevenBitMode => config.eight_bit = false,
            OptionFlag::EightBitMode => config.eight_bit = true,
            OptionFlag::GriLimit => config.gri_limit = true,
            OptionFlag::Colors => {
                let (n, force) = parse_colors(value)?;
                config.reqcolors = n;
                config.force_palette = force;
            }
            OptionFlag::Mapfile => {
                let bytes = std::fs::read(value)?;
                // Validate now so the error surfaces at option time.
                parse_palette_file(&bytes)?;
                config.color_option = ColorOption::Mapfile(bytes);
            }
            OptionFlag::Monochrome => config.color_option = ColorOption::Monochrome,
            OptionFlag::HighColor => config.color_option = ColorOption::HighColor,
            OptionFlag::BuiltinPalette => {
                config.color_option = ColorOption::Builtin(BuiltinPalette::parse(value)?);
            }
            OptionFlag::Diffusion => config.method_for_diffuse = DiffusionMethod::parse(value)?,
            OptionFlag::DiffusionScan => config.method_for_scan = DiffusionScan::parse(value)?,
            OptionFlag::DiffusionCarry => config.method_for_carry = DiffusionCarry::parse(value)?,
            OptionFlag::FindLargest => config.method_for_largest = MethodForLargest::parse(value)?,
            OptionFlag::SelectColor => config.method_for_rep = MethodForRep::parse(value)?,
            OptionFlag::QuantizeModel => config.quantize_model = QuantizeModel::parse(value)?,
            OptionFlag::FinalMerge => config.final_merge = FinalMerge::parse(value)?,
            OptionFlag::Crop => {
                config.crop = Some(CropRect::parse(value)?);
                config.clip_first = false;
            }
            OptionFlag::Width => {
                config.width = SizeSpec::parse("width", value)?;
                if config.crop.is_some() {
                    config.clip_first = true;
                }
            }
            OptionFlag::Height => {
                config.height = SizeSpec::parse("height", value)?;
                if config.crop.is_some() {
                    config.clip_first = true;
                }
            }
            OptionFlag::Resampling => config.resampling = ResampleMethod::parse(value)?,
            OptionFlag::LoopControl => config.loop_mode = LoopMode::parse(value)?,
            OptionFlag::PaletteType => config.palette_type = PaletteType::parse(value)?,
            OptionFlag::Bgcolor => config.bgcolor = Some(parse_color_spec(value)?),
            OptionFlag::Invert => config.invert = true,
            OptionFlag::UseMacro => config.use_macro = true,
            OptionFlag::MacroNumber => {
                let n: u32 = value.parse().map_err(|_| {
                    SixelError::BadArgument("cannot parse macro number".into())
                })?;
                config.macro_number = Some(n);
            }
            OptionFlag::IgnoreDelay => config.ignore_delay = true,
            OptionFlag::Static => config.fstatic = true,
            OptionFlag::PenetrateMultiplexer => config.penetrate_multiplexer = true,
            OptionFlag::EncodePolicy => config.encode_policy = EncodePolicy::parse(value)?,
            OptionFlag::LutPolicy => config.lut_policy = LutPolicy::parse(value)?,
            OptionFlag::WorkingColorspace => {
                config.working_colorspace = Colorspace::parse_working(value)?;
            }
            OptionFlag::OutputColorspace => {
                config.output_colorspace = Colorspace::parse_output(value)?;
            }
            OptionFlag::Ormode => config.ormode = true,
            OptionFlag::ComplexionScore => {
                let score: i32 = value.parse().map_err(|_| {
                    SixelError::BadArgument("cannot parse complexion score".into())
                })?;
                if score < 1 {
                    return Err(SixelError::BadArgument(
                        "complexion score must be 1 or more".into(),
                    ));
                }
                config.complexion = score;
            }
            OptionFlag::Threads => {
                let n: usize = value.parse().map_err(|_| {
                    SixelError::BadArgument("cannot parse thread count".into())
                })?;
                config.threads = n.clamp(1, 256);
            }
            OptionFlag::CellSize => {
                let (w, h) = value
                    .split_once('x')
                    .and_then(|(w, h)| Some((w.parse().ok()?, h.parse().ok()?)))
                    .ok_or_else(|| {
                        SixelError::BadArgument("cannot parse cell size (expected WxH)".into())
                    })?;
                config.cell_width = w;
                config.cell_height = h;
            }
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn resolve_axis(&self, spec: SizeSpec, source: usize, cell: u32) -> Option<usize> {
        match spec {
            SizeSpec::Auto => None,
            SizeSpec::Pixels(px) => Some(px as usize),
            SizeSpec::Percent(pct) => Some(source * pct as usize / 100),
            SizeSpec::Cells(cells) => Some(cells as usize * cell as usize),
        }
    }

    /// Scale per the configured width/height; a single specified axis
    /// preserves the aspect ratio.
    fn do_resize(&self, work: &mut WorkingImage) {
        let width = self.resolve_axis(self.config.width, work.width, self.config.cell_width);
        let height = self.resolve_axis(self.config.height, work.height, self.config.cell_height);

        let (dst_width, dst_height) = match (width, height) {
            (None, None) => return,
            (Some(w), None) => (w, (work.height * w).div_euclid(work.width)),
            (None, Some(h)) => ((work.width * h).div_euclid(work.height), h),
            (Some(w), Some(h)) => (w, h),
        };
        if dst_width == 0 || dst_height == 0 {
            return;
        }
        debug!(
            "resize {}x{} -> {}x{} ({:?})",
            work.width, work.height, dst_width, dst_height, self.config.resampling
        );
        work.resize(dst_width, dst_height, self.config.resampling);
    }

    fn do_clip(&self, work: &mut WorkingImage) {
        if let Some(rect) = self.config.crop {
            work.clip(
                rect.x as usize,
                rect.y as usize,
                rect.width as usize,
                rect.height as usize,
            );
        }
    }

    /// Produce the palette for this frame, reusing the cache for color
    /// options that do not depend on the frame content.
    fn prepare_palette(
        &self,
        work: &WorkingImage,
        frame: &Frame,
    ) -> SixelResult<(Arc<Palette>, usize)> {
        let config = &self.config;

        let fixed: Option<Palette> = match &config.color_option {
            ColorOption::Monochrome => Some(monochrome(config.invert)),
            ColorOption::Builtin(which) => Some(builtin(*which)),
            ColorOption::Mapfile(bytes) => Some(parse_palette_file(bytes)?),
            ColorOption::HighColor | ColorOption::Default => None,
        };
        if let Some(palette) = fixed {
            let mut cache = self.palette_cache.lock();
            if let Some(cached) = cache.as_ref() {
                return Ok((Arc::clone(cached), cached.active()));
            }
            let palette = Arc::new(palette);
            *cache = Some(Arc::clone(&palette));
            return Ok((Arc::clone(&palette), palette.active()));
        }

        // Paletted frames bypass the palette builder: the embedded
        // palette becomes the palette, converted to the working space.
        if frame.format().is_palette() {
            let embedded = frame
                .palette()
                .ok_or_else(|| SixelError::LogicError("palette format without palette".into()))?;
            let colors: Vec<u8> = embedded
                .chunks_exact(3)
                .flat_map(|c| {
                    convert_rgb(
                        [c[0], c[1], c[2]],
                        frame.colorspace(),
                        config.working_colorspace,
                    )
                })
                .collect();
            let n = colors.len() / 3;
            let palette = Palette::new(colors, n.min(SIXEL_PALETTE_MAX))?
                .with_keycolor(frame.transparent().map(|t| t as usize));
            return Ok((Arc::new(palette), n));
        }

        // Grayscale frames ride the matching gray builtin.
        if frame.format().is_grayscale() {
            let which = match frame.format() {
                PixelFormat::G1 => BuiltinPalette::Gray1,
                PixelFormat::G2 => BuiltinPalette::Gray2,
                PixelFormat::G4 => BuiltinPalette::Gray4,
                _ => BuiltinPalette::Gray8,
            };
            let palette = builtin(which);
            let n = palette.active();
            return Ok((Arc::new(palette), n));
        }

        // Transparency reserves register 0 for the background color and
        // keeps those pixels out of the histogram.
        let transparency_mask = work
            .opacity
            .as_ref()
            .filter(|mask| mask.iter().any(|&o| !o));

        let opts = QuantizeOptions {
            reqcolors: if transparency_mask.is_some() {
                (config.reqcolors as usize).saturating_sub(1).max(1)
            } else {
                config.reqcolors as usize
            },
            method_for_largest: config.method_for_largest,
            method_for_rep: config.method_for_rep,
            quantize_model: config.quantize_model,
            final_merge: config.final_merge,
            lut_policy: config.lut_policy,
            force_palette: config.force_palette,
            tuning: config.tuning.clone(),
        };

        if let Some(mask) = transparency_mask {
            let opaque: Vec<u8> = work
                .pixels
                .chunks_exact(3)
                .zip(mask.iter())
                .filter(|(_, &o)| o)
                .flat_map(|(p, _)| p.iter().copied())
                .collect();
            let key = config.bgcolor.map_or([0, 0, 0], |rgb| {
                convert_rgb(rgb, Colorspace::Gamma, config.working_colorspace)
            });
            let (built, origcolors) = if opaque.is_empty() {
                (Palette::new(key.to_vec(), 1)?, 0)
            } else {
                make_palette(&opaque, &opts)?
            };
            let mut colors = key.to_vec();
            colors.extend_from_slice(built.as_bytes());
            let mut palette = Palette::new(colors, (config.reqcolors as usize).max(2))?
                .with_keycolor(Some(0))
                .with_force(config.force_palette);
            if config.force_palette {
                palette.pad_to_requested();
            }
            return Ok((Arc::new(palette), origcolors));
        }

        let (palette, origcolors) = make_palette(&work.pixels, &opts)?;
        Ok((Arc::new(palette), origcolors))
    }

    /// Encode one frame into `writer`.
    ///
    /// Stages run in a fixed order; `clip_first` swaps crop and scale so
    /// a crop that would be destroyed by scaling happens first.
    pub fn encode_frame<W: Write>(&mut self, frame: &Frame, writer: &mut W) -> SixelResult<()> {
        match self.encode_frame_inner(frame, writer) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn encode_frame_inner<W: Write>(
        &mut self,
        frame: &Frame,
        writer: &mut W,
    ) -> SixelResult<()> {
        if self.cancelled() {
            return Err(SixelError::Interrupted);
        }

        // Paletted input with untouched geometry bypasses quantization
        // and dithering entirely.
        if frame.format().is_palette()
            && matches!(self.config.color_option, ColorOption::Default)
            && self.config.crop.is_none()
            && self.config.width == SizeSpec::Auto
            && self.config.height == SizeSpec::Auto
        {
            return self.emit_paletted_passthrough(frame, writer);
        }

        let mut work = WorkingImage::from_frame(frame)?;
        if self.config.clip_first {
            self.do_clip(&mut work);
            self.do_resize(&mut work);
        } else {
            self.do_resize(&mut work);
            self.do_clip(&mut work);
        }

        work.ensure_colorspace(self.config.working_colorspace);

        if self.cancelled() {
            return Err(SixelError::Interrupted);
        }

        if matches!(self.config.color_option, ColorOption::HighColor) {
            return self.emit_high_color(&mut work, writer);
        }

        let (palette, origcolors) = self.prepare_palette(&work, frame)?;
        debug!(
            "palette ready: {} active of {} requested ({} source colors)",
            palette.active(),
            palette.requested(),
            origcolors
        );

        let mut dither = Dither::new(Arc::clone(&palette));
        // With no more colors than requested there is nothing to
        // diffuse; drop to a plain nearest lookup.
        let diffuse = if origcolors <= palette.active()
            && matches!(self.config.color_option, ColorOption::Default)
        {
            DiffusionMethod::None
        } else {
            self.config.method_for_diffuse
        };
        dither.set_diffusion(diffuse);
        dither.set_scan(self.config.method_for_scan);
        dither.set_carry(self.config.method_for_carry);
        dither.set_complexion_score(self.config.complexion);
        dither.set_pixelformat(frame.format());
        if let Some(transparent) = frame.transparent() {
            dither.set_transparent(transparent);
        }
        let keycolor = palette.keycolor();
        dither.set_optimize_palette(
            matches!(self.config.color_option, ColorOption::Default)
                && !self.config.force_palette
                && keycolor.is_none(),
        );

        let cancel = self.cancel.clone();
        let mut index = dither.apply_with(
            &mut work.pixels,
            work.width,
            work.height,
            ApplyHooks {
                cancel: cancel.as_deref(),
                on_row: None,
                threads: self.config.threads,
                band_height: self.config.band_height,
                band_overlap: self.config.band_overlap,
            },
        )?;

        // Transparent pixels collapse onto the key register.
        if let (Some(mask), Some(key)) = (&work.opacity, keycolor) {
            for (slot, &opaque) in index.indices.iter_mut().zip(mask.iter()) {
                if !opaque {
                    *slot = key as u8;
                }
            }
        }

        self.emit(&index, keycolor, frame, writer)
    }

    /// Emit an already-indexed frame without rebuilding its palette.
    fn emit_paletted_passthrough<W: Write>(
        &mut self,
        frame: &Frame,
        writer: &mut W,
    ) -> SixelResult<()> {
        let embedded = frame
            .palette()
            .ok_or_else(|| SixelError::LogicError("palette format without palette".into()))?;
        let indices =
            unpack_palette_indices(frame.pixels(), frame.format(), frame.width(), frame.height())?;
        let n = embedded.len() / 3;
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= n) {
            return Err(SixelError::BadInput(format!(
                "palette index {} outside embedded palette of {} entries",
                bad, n
            )));
        }
        // The index plane is reused as is; only the palette needs to be
        // brought into the working colorspace.
        let colors: Vec<u8> = embedded
            .chunks_exact(3)
            .flat_map(|c| {
                convert_rgb(
                    [c[0], c[1], c[2]],
                    frame.colorspace(),
                    self.config.working_colorspace,
                )
            })
            .collect();
        let palette = Palette::new(colors, n)?
            .with_keycolor(frame.transparent().map(|t| t as usize));
        let keycolor = palette.keycolor();
        let image = IndexImage {
            indices,
            width: frame.width(),
            height: frame.height(),
            palette: Arc::new(palette),
        };
        self.emit(&image, keycolor, frame, writer)
    }

    /// Configure an emitter from the current options.
    fn new_output<W: Write>(&self, writer: W, policy: EncodePolicy) -> SixelOutput<W> {
        let mut output = SixelOutput::new(writer);
        output.set_8bit_mode(self.config.eight_bit);
        output.set_gri_limit(self.config.gri_limit);
        output.set_palette_type(self.config.palette_type);
        output.set_penetrate_multiplexer(self.config.penetrate_multiplexer);
        output.set_encode_policy(policy);
        output.set_ormode(self.config.ormode);
        output
    }

    /// `auto` policy: spend effort on size for stills, speed for
    /// animation frames.
    fn resolve_policy(&self, frame: &Frame) -> EncodePolicy {
        match self.config.encode_policy {
            EncodePolicy::Auto => {
                if frame.is_multiframe() {
                    EncodePolicy::Fast
                } else {
                    EncodePolicy::Size
                }
            }
            other => other,
        }
    }

    fn emit<W: Write>(
        &mut self,
        index: &IndexImage,
        keycolor: Option<usize>,
        frame: &Frame,
        writer: &mut W,
    ) -> SixelResult<()> {
        // The palette section is emitted in the output colorspace; the
        // index image itself is colorspace-agnostic.
        let out_palette = index.palette.map_colors(|rgb| {
            convert_rgb(rgb, self.config.working_colorspace, self.config.output_colorspace)
        });
        let image = IndexImage {
            indices: index.indices.clone(),
            width: index.width,
            height: index.height,
            palette: Arc::new(out_palette),
        };

        let policy = self.resolve_policy(frame);
        let cancel = self.cancel.clone();

        if self.config.use_macro || self.config.macro_number.is_some() {
            return self.emit_with_macro(&image, keycolor, frame, policy, writer);
        }

        let mut output = self.new_output(writer, policy);
        output.encode(&image, keycolor, cancel.as_deref())?;

        if self.cancelled() {
            return Err(SixelError::Interrupted);
        }
        Ok(())
    }

    /// Store the frame as a DEC macro (hex-encoded body) and replay it
    /// with DECINVM. Frames of later loop iterations only replay.
    fn emit_with_macro<W: Write>(
        &mut self,
        image: &IndexImage,
        keycolor: Option<usize>,
        frame: &Frame,
        policy: EncodePolicy,
        writer: &mut W,
    ) -> SixelResult<()> {
        let macro_no = self
            .config
            .macro_number
            .map(|n| n as usize)
            .unwrap_or(frame.frame_no());

        if frame.loop_no() == 0 {
            // DECDMAC: define macro <n>, replace, hex-encoded payload.
            write!(writer, "\x1bP{};0;1!z", macro_no)?;
            {
                let mut hex = HexWriter { inner: writer };
                let mut output = self.new_output(&mut hex, policy);
                output.set_skip_dcs_envelope(false);
                output.encode(image, keycolor, self.cancel.as_deref())?;
            }
            writer.write_all(b"\x1b\\")?;
        }

        if self.config.macro_number.is_none() {
            // DECINVM: invoke the macro for this frame.
            write!(writer, "\x1b[{}*z", frame.frame_no())?;
        }
        writer.flush()?;

        if self.cancelled() {
            return Err(SixelError::Interrupted);
        }
        Ok(())
    }

    /// 15bpp high-color emission: channels are dithered down to 5 bits,
    /// then every band defines the registers it needs, so an image may
    /// use far more than 256 colors overall.
    fn emit_high_color<W: Write>(
        &mut self,
        work: &mut WorkingImage,
        writer: &mut W,
    ) -> SixelResult<()> {
        quantize_15bpp(
            &mut work.pixels,
            work.width,
            work.height,
            self.config.method_for_diffuse,
        );

        let mut output = self.new_output(writer, EncodePolicy::Fast);
        output.encode_high_color(
            &work.pixels,
            work.width,
            work.height,
            self.cancel.as_deref(),
        )?;
        if self.cancelled() {
            return Err(SixelError::Interrupted);
        }
        Ok(())
    }

    /// Encode a frame sequence. `source_loop_count` is the loop count
    /// declared by the frame source (0 = forever); loop handling follows
    /// the configured mode. Timing is the caller's concern; frames are
    /// only iterated.
    pub fn encode_frames<W: Write>(
        &mut self,
        frames: &[Frame],
        source_loop_count: usize,
        writer: &mut W,
    ) -> SixelResult<()> {
        if frames.is_empty() {
            return Err(self.fail(SixelError::BadInput("no frames to encode".into())));
        }

        if self.config.fstatic || frames.len() == 1 {
            return self.encode_frame(&frames[0], writer);
        }

        let loops = match self.config.loop_mode {
            LoopMode::Disable => 1,
            LoopMode::Force => 0,
            LoopMode::Auto => source_loop_count,
        };

        let mut iteration = 0usize;
        loop {
            for frame in frames {
                if self.cancelled() {
                    return Err(self.fail(SixelError::Interrupted));
                }
                let mut pass = frame.clone();
                pass = pass.with_animation(
                    frame.frame_no(),
                    iteration,
                    if self.config.ignore_delay { 0 } else { frame.delay() },
                );
                self.encode_frame(&pass, writer)?;
            }
            iteration += 1;
            if loops != 0 && iteration >= loops {
                return Ok(());
            }
        }
    }
}

/// In-place channel reduction to 5 bits with error diffusion, for the
/// high-color path.
fn quantize_15bpp(pixels: &mut [u8], width: usize, height: usize, method: DiffusionMethod) {
    let plain = matches!(
        method,
        DiffusionMethod::None | DiffusionMethod::ADither | DiffusionMethod::XDither
    );
    for y in 0..height {
        for x in 0..width {
            let base = (y * width + x) * 3;
            for n in 0..3 {
                let value = pixels[base + n];
                let shown = (value & 0xf8) | (value >> 5);
                pixels[base + n] = value & 0xf8;
                if plain {
                    continue;
                }
                let error = value as i32 - shown as i32;
                // Floyd-Steinberg toward the 5-bit lattice.
                let mut spread = |dx: i32, dy: i32, num: i32| {
                    let tx = x as i32 + dx;
                    let ty = y as i32 + dy;
                    if tx < 0 || tx >= width as i32 || ty >= height as i32 {
                        return;
                    }
                    let offset = (ty as usize * width + tx as usize) * 3 + n;
                    let v = pixels[offset] as i32 + error * num / 16;
                    pixels[offset] = v.clamp(0, 255) as u8;
                };
                spread(1, 0, 7);
                spread(-1, 1, 3);
                spread(0, 1, 5);
                spread(1, 1, 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixelformat::PixelFormat;

    fn rgb_frame(pixels: Vec<u8>, width: usize, height: usize) -> Frame {
        Frame::new(pixels, width, height, PixelFormat::Rgb888).unwrap()
    }

    fn encode_to_vec(encoder: &mut Encoder, frame: &Frame) -> Vec<u8> {
        let mut out = Vec::new();
        encoder.encode_frame(frame, &mut out).unwrap();
        out
    }

    #[test]
    fn default_encode_produces_a_dcs_stream() {
        let frame = rgb_frame(vec![255, 0, 0, 0, 255, 0], 2, 1);
        let mut encoder = Encoder::with_config(EncoderConfig::default());
        let bytes = encode_to_vec(&mut encoder, &frame);
        assert!(bytes.starts_with(b"\x1bP"));
        assert!(bytes.ends_with(b"\x1b\\"));
    }

    #[test]
    fn setopt_routes_to_config_fields() {
        let mut encoder = Encoder::with_config(EncoderConfig::default());
        encoder.setopt(OptionFlag::Colors, "16!").unwrap();
        encoder.setopt(OptionFlag::Diffusion, "atk").unwrap();
        encoder.setopt(OptionFlag::EightBitMode, "").unwrap();
        encoder.setopt(OptionFlag::WorkingColorspace, "ok").unwrap();
        let config = encoder.config();
        assert_eq!(config.reqcolors, 16);
        assert!(config.force_palette);
        assert_eq!(config.method_for_diffuse, DiffusionMethod::Atkinson);
        assert!(config.eight_bit);
        assert_eq!(config.working_colorspace, Colorspace::Oklab);
    }

    #[test]
    fn setopt_rejects_ambiguous_prefixes_with_candidates() {
        let mut encoder = Encoder::with_config(EncoderConfig::default());
        let err = encoder.setopt(OptionFlag::SelectColor, "a").unwrap_err();
        assert!(matches!(err, SixelError::BadArgument(_)));
        let message = encoder.last_additional_message().unwrap().to_string();
        assert!(message.contains("auto") && message.contains("average"), "{message}");
    }

    #[test]
    fn crop_then_width_clips_first() {
        let mut encoder = Encoder::with_config(EncoderConfig::default());
        encoder.setopt(OptionFlag::Crop, "4x4+0+0").unwrap();
        encoder.setopt(OptionFlag::Width, "8").unwrap();
        assert!(encoder.config().clip_first);

        let mut encoder = Encoder::with_config(EncoderConfig::default());
        encoder.setopt(OptionFlag::Width, "8").unwrap();
        encoder.setopt(OptionFlag::Crop, "4x4+0+0").unwrap();
        assert!(!encoder.config().clip_first);
    }

    #[test]
    fn scenario_two_by_two_exact_colors() {
        // Four distinct colors, four requested: lossless palette, one
        // band, four registers.
        let frame = rgb_frame(
            vec![
                255, 0, 0, 0, 255, 0, //
                0, 0, 255, 255, 255, 255,
            ],
            2,
            2,
        );
        let mut config = EncoderConfig::default();
        config.reqcolors = 4;
        config.method_for_diffuse = DiffusionMethod::None;
        let mut encoder = Encoder::with_config(config);
        let bytes = encode_to_vec(&mut encoder, &frame);

        let decoded = crate::decoder::sixel_decode(&bytes).unwrap();
        assert_eq!((decoded.width, decoded.height), (2, 2));
        let rgb = decoded.to_rgb888();
        // Scaling to percent and back costs at most ~2 per channel.
        let expected = [
            [255, 0, 0],
            [0, 255, 0],
            [0, 0, 255],
            [255, 255, 255],
        ];
        for (pixel, want) in rgb.chunks_exact(3).zip(expected.iter()) {
            for (a, b) in pixel.iter().zip(want.iter()) {
                assert!((*a as i16 - *b as i16).abs() <= 3, "{pixel:?} vs {want:?}");
            }
        }
    }

    #[test]
    fn forced_palette_keeps_every_slot() {
        let frame = rgb_frame(vec![255; 6 * 6 * 3], 6, 6);
        let mut config = EncoderConfig::default();
        config.reqcolors = 256;
        config.force_palette = true;
        let mut encoder = Encoder::with_config(config);
        let bytes = encode_to_vec(&mut encoder, &frame);
        let text = String::from_utf8_lossy(&bytes);
        // All 256 registers are defined even for a solid white image.
        assert!(text.contains("#255;2;"), "palette was shrunk");
    }

    #[test]
    fn paletted_frames_bypass_quantization() {
        let frame = Frame::new(vec![0, 1, 1, 0], 2, 2, PixelFormat::Pal8)
            .unwrap()
            .with_palette(vec![10, 20, 30, 200, 210, 220]);
        let mut encoder = Encoder::with_config(EncoderConfig::default());
        let bytes = encode_to_vec(&mut encoder, &frame);
        let decoded = crate::decoder::sixel_decode(&bytes).unwrap();
        assert_eq!(decoded.indices[..4], [0, 1, 1, 0]);
    }

    #[test]
    fn out_of_range_palette_indices_are_bad_input() {
        let frame = Frame::new(vec![0, 9, 0, 0], 2, 2, PixelFormat::Pal8)
            .unwrap()
            .with_palette(vec![10, 20, 30, 200, 210, 220]);
        let mut encoder = Encoder::with_config(EncoderConfig::default());
        let mut out = Vec::new();
        match encoder.encode_frame(&frame, &mut out) {
            Err(SixelError::BadInput(_)) => {}
            other => panic!("expected BadInput, got {other:?}"),
        }
    }

    #[test]
    fn transparent_pixels_reserve_the_key_register() {
        let frame = Frame::new(
            vec![
                255, 0, 0, 255, //
                0, 255, 0, 0, // transparent
            ],
            2,
            1,
            PixelFormat::Rgba8888,
        )
        .unwrap();
        let mut encoder = Encoder::with_config(EncoderConfig::default());
        let bytes = encode_to_vec(&mut encoder, &frame);
        let text = String::from_utf8_lossy(&bytes);
        // Transparent mode is announced and register 0 is never painted.
        assert!(text.contains("0;1;0"), "{text}");
        let decoded = crate::decoder::sixel_decode(&bytes).unwrap();
        assert!(decoded.painted[0]);
        assert!(!decoded.painted[1]);
    }

    #[test]
    fn cancel_before_encode_interrupts() {
        let frame = rgb_frame(vec![0; 30], 10, 1);
        let mut encoder = Encoder::with_config(EncoderConfig::default());
        let flag = Arc::new(AtomicBool::new(true));
        encoder.set_cancel_flag(Arc::clone(&flag));
        let mut out = Vec::new();
        assert!(matches!(
            encoder.encode_frame(&frame, &mut out),
            Err(SixelError::Interrupted)
        ));
    }

    #[test]
    fn macro_definition_is_hex_encoded() {
        let frame = rgb_frame(vec![1, 2, 3], 1, 1).with_animation(0, 0, 10);
        let mut config = EncoderConfig::default();
        config.use_macro = true;
        let mut encoder = Encoder::with_config(config);
        let bytes = encode_to_vec(&mut encoder, &frame);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("\x1bP0;0;1!z"), "{text}");
        // The body between the DECDMAC header and ST is pure hex.
        let body = &text["\x1bP0;0;1!z".len()..text.find("\x1b\\").unwrap()];
        assert!(!body.is_empty());
        assert!(body.chars().all(|c| c.is_ascii_hexdigit()), "{body}");
        // The frame is replayed through DECINVM.
        assert!(text.ends_with("\x1b[0*z"), "{text}");
    }

    #[test]
    fn static_mode_encodes_only_the_first_frame() {
        let frames = vec![
            rgb_frame(vec![255, 0, 0], 1, 1).with_animation(0, 0, 5),
            rgb_frame(vec![0, 255, 0], 1, 1).with_animation(1, 0, 5),
        ];
        let mut config = EncoderConfig::default();
        config.fstatic = true;
        let mut encoder = Encoder::with_config(config);
        let mut out = Vec::new();
        encoder.encode_frames(&frames, 1, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert_eq!(text.matches('q').count(), 1);
    }

    #[test]
    fn loop_disable_runs_one_iteration() {
        let frames = vec![
            rgb_frame(vec![255, 0, 0], 1, 1).with_animation(0, 0, 5),
            rgb_frame(vec![0, 255, 0], 1, 1).with_animation(1, 0, 5),
        ];
        let mut config = EncoderConfig::default();
        config.loop_mode = LoopMode::Disable;
        let mut encoder = Encoder::with_config(config);
        let mut out = Vec::new();
        encoder.encode_frames(&frames, 3, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert_eq!(text.matches('q').count(), 2);
    }

    #[test]
    fn high_color_emits_per_band_palettes() {
        // A ramp with more distinct colors than one palette could hold.
        let width = 64;
        let height = 12;
        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[
                    (x * 4) as u8,
                    (y * 20) as u8,
                    ((x + y) * 3) as u8,
                ]);
            }
        }
        let frame = rgb_frame(pixels, width, height);
        let mut config = EncoderConfig::default();
        config.color_option = ColorOption::HighColor;
        config.method_for_diffuse = DiffusionMethod::None;
        let mut encoder = Encoder::with_config(config);
        let bytes = encode_to_vec(&mut encoder, &frame);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("\x1bP"), "{text}");
        // Both bands define their own registers.
        assert!(text.matches(";2;").count() > 2, "{text}");
    }

    #[test]
    fn identical_configs_produce_identical_streams() {
        let mut pixels = Vec::new();
        for i in 0..(100 * 100) {
            pixels.extend_from_slice(&[
                (i * 31 % 256) as u8,
                (i * 7 % 256) as u8,
                (i * 13 % 256) as u8,
            ]);
        }
        let frame = rgb_frame(pixels, 100, 100);

        let mut config = EncoderConfig::default();
        config.reqcolors = 16;
        config.quantize_model = QuantizeModel::Kmeans;
        config.final_merge = FinalMerge::Ward;

        let mut first = Encoder::with_config(config.clone());
        let mut second = Encoder::with_config(config);
        let a = encode_to_vec(&mut first, &frame);
        let b = encode_to_vec(&mut second, &frame);
        assert_eq!(a, b);
    }
}
