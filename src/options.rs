//! Enumerated encoder options and the shared prefix matcher.
//!
//! Every user-visible setting maps onto one of the closed enums below.
//! Enumerable values are parsed through one static `(name, value)` table
//! per option and a common prefix-match routine, so a configuration is
//! always representable as a finite sum type.

use crate::{SixelError, SixelResult, SIXEL_PALETTE_MAX};

/// Outcome of matching a user-supplied value string against a choice table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixMatch<T> {
    /// Exactly one value matched (full name, or an unambiguous prefix).
    Match(T),
    /// The prefix matched several names that map to different values.
    Ambiguous(Vec<&'static str>),
    /// Nothing matched.
    None,
}

/// Match `value` against a table of `(name, value)` choices.
///
/// A full-name match wins immediately. A prefix that selects several
/// names still matches when all of them carry the same value (alias rows
/// such as `smpte-c`/`smptec`); otherwise every candidate name is
/// reported. Comparison is case-sensitive.
pub fn match_choice<T: Copy + PartialEq>(
    value: &str,
    choices: &[(&'static str, T)],
) -> PrefixMatch<T> {
    if value.is_empty() {
        return PrefixMatch::None;
    }

    let mut candidates: Vec<&'static str> = Vec::new();
    let mut first: Option<T> = None;
    let mut ambiguous = false;

    for &(name, choice) in choices {
        if !name.starts_with(value) {
            continue;
        }
        if name.len() == value.len() {
            return PrefixMatch::Match(choice);
        }
        match first {
            None => first = Some(choice),
            Some(seen) if seen != choice => ambiguous = true,
            Some(_) => {}
        }
        candidates.push(name);
    }

    match first {
        None => PrefixMatch::None,
        Some(choice) if !ambiguous => PrefixMatch::Match(choice),
        Some(_) => PrefixMatch::Ambiguous(candidates),
    }
}

fn resolve<T: Copy + PartialEq>(
    option: &str,
    value: &str,
    choices: &[(&'static str, T)],
) -> SixelResult<T> {
    match match_choice(value, choices) {
        PrefixMatch::Match(v) => Ok(v),
        PrefixMatch::Ambiguous(candidates) => Err(SixelError::BadArgument(format!(
            "ambiguous prefix \"{}\" for {} (matches: {})",
            value,
            option,
            candidates.join(", ")
        ))),
        PrefixMatch::None => Err(SixelError::BadArgument(format!(
            "unknown value \"{}\" for {}",
            value, option
        ))),
    }
}

/// Error-diffusion kernel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffusionMethod {
    #[default]
    Auto,
    None,
    Fs,
    Atkinson,
    JaJuNi,
    Stucki,
    Burkes,
    Sierra1,
    Sierra2,
    Sierra3,
    ADither,
    XDither,
    Lso2,
}

impl DiffusionMethod {
    pub const CHOICES: &'static [(&'static str, DiffusionMethod)] = &[
        ("auto", DiffusionMethod::Auto),
        ("none", DiffusionMethod::None),
        ("fs", DiffusionMethod::Fs),
        ("atkinson", DiffusionMethod::Atkinson),
        ("jajuni", DiffusionMethod::JaJuNi),
        ("stucki", DiffusionMethod::Stucki),
        ("burkes", DiffusionMethod::Burkes),
        ("sierra1", DiffusionMethod::Sierra1),
        ("sierra2", DiffusionMethod::Sierra2),
        ("sierra3", DiffusionMethod::Sierra3),
        ("a_dither", DiffusionMethod::ADither),
        ("x_dither", DiffusionMethod::XDither),
        ("lso2", DiffusionMethod::Lso2),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("diffusion", value, Self::CHOICES)
    }
}

/// Scan order used while diffusing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffusionScan {
    #[default]
    Auto,
    Serpentine,
    Raster,
}

impl DiffusionScan {
    pub const CHOICES: &'static [(&'static str, DiffusionScan)] = &[
        ("auto", DiffusionScan::Auto),
        ("serpentine", DiffusionScan::Serpentine),
        ("raster", DiffusionScan::Raster),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("diffusion-scan", value, Self::CHOICES)
    }
}

/// Whether diffusion error is written back into the source pixels or
/// accumulated in separate carry rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffusionCarry {
    #[default]
    Auto,
    Direct,
    Carry,
}

impl DiffusionCarry {
    pub const CHOICES: &'static [(&'static str, DiffusionCarry)] = &[
        ("auto", DiffusionCarry::Auto),
        ("direct", DiffusionCarry::Direct),
        ("carry", DiffusionCarry::Carry),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("diffusion-carry", value, Self::CHOICES)
    }
}

/// Median-cut axis selection: raw channel range or luminance-weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodForLargest {
    #[default]
    Auto,
    Norm,
    Lum,
}

impl MethodForLargest {
    pub const CHOICES: &'static [(&'static str, MethodForLargest)] = &[
        ("auto", MethodForLargest::Auto),
        ("norm", MethodForLargest::Norm),
        ("lum", MethodForLargest::Lum),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("find-largest", value, Self::CHOICES)
    }
}

/// How the representative color of a median-cut box is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodForRep {
    #[default]
    Auto,
    Center,
    Average,
    Histogram,
}

impl MethodForRep {
    pub const CHOICES: &'static [(&'static str, MethodForRep)] = &[
        ("auto", MethodForRep::Auto),
        ("center", MethodForRep::Center),
        ("average", MethodForRep::Average),
        ("histogram", MethodForRep::Histogram),
        ("histgram", MethodForRep::Histogram),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("select-color", value, Self::CHOICES)
    }
}

/// Palette solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantizeModel {
    #[default]
    Auto,
    Heckbert,
    Kmeans,
}

impl QuantizeModel {
    pub const CHOICES: &'static [(&'static str, QuantizeModel)] = &[
        ("auto", QuantizeModel::Auto),
        ("heckbert", QuantizeModel::Heckbert),
        ("kmeans", QuantizeModel::Kmeans),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("quantize-model", value, Self::CHOICES)
    }
}

/// Post-quantization merge policy applied after over-splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalMerge {
    #[default]
    Auto,
    None,
    Ward,
    Hkmeans,
}

impl FinalMerge {
    pub const CHOICES: &'static [(&'static str, FinalMerge)] = &[
        ("auto", FinalMerge::Auto),
        ("none", FinalMerge::None),
        ("ward", FinalMerge::Ward),
        ("hkmeans", FinalMerge::Hkmeans),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("final-merge", value, Self::CHOICES)
    }
}

/// Histogram / lookup-table bucketing policy.
///
/// `robinhood` and `hopscotch` are accepted for compatibility and map to
/// the open-addressed hash policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LutPolicy {
    #[default]
    Auto,
    FiveBit,
    SixBit,
    Hash,
    CertLut,
}

impl LutPolicy {
    pub const CHOICES: &'static [(&'static str, LutPolicy)] = &[
        ("auto", LutPolicy::Auto),
        ("5bit", LutPolicy::FiveBit),
        ("6bit", LutPolicy::SixBit),
        ("none", LutPolicy::Hash),
        ("robinhood", LutPolicy::Hash),
        ("hopscotch", LutPolicy::Hash),
        ("certlut", LutPolicy::CertLut),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("lut-policy", value, Self::CHOICES)
    }
}

/// Resampling filter used for scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleMethod {
    Nearest,
    Gaussian,
    Hanning,
    Hamming,
    #[default]
    Bilinear,
    Welsh,
    Bicubic,
    Lanczos2,
    Lanczos3,
    Lanczos4,
}

impl ResampleMethod {
    pub const CHOICES: &'static [(&'static str, ResampleMethod)] = &[
        ("nearest", ResampleMethod::Nearest),
        ("gaussian", ResampleMethod::Gaussian),
        ("hanning", ResampleMethod::Hanning),
        ("hamming", ResampleMethod::Hamming),
        ("bilinear", ResampleMethod::Bilinear),
        ("welsh", ResampleMethod::Welsh),
        ("bicubic", ResampleMethod::Bicubic),
        ("lanczos2", ResampleMethod::Lanczos2),
        ("lanczos3", ResampleMethod::Lanczos3),
        ("lanczos4", ResampleMethod::Lanczos4),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("resampling", value, Self::CHOICES)
    }
}

/// Multi-frame loop behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Auto,
    Force,
    Disable,
}

impl LoopMode {
    pub const CHOICES: &'static [(&'static str, LoopMode)] = &[
        ("auto", LoopMode::Auto),
        ("force", LoopMode::Force),
        ("disable", LoopMode::Disable),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("loop-control", value, Self::CHOICES)
    }
}

/// On-wire palette representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaletteType {
    #[default]
    Auto,
    Hls,
    Rgb,
}

impl PaletteType {
    pub const CHOICES: &'static [(&'static str, PaletteType)] = &[
        ("auto", PaletteType::Auto),
        ("hls", PaletteType::Hls),
        ("rgb", PaletteType::Rgb),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("palette-type", value, Self::CHOICES)
    }
}

/// Size-versus-speed trade-off for the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodePolicy {
    #[default]
    Auto,
    Fast,
    Size,
}

impl EncodePolicy {
    pub const CHOICES: &'static [(&'static str, EncodePolicy)] = &[
        ("auto", EncodePolicy::Auto),
        ("fast", EncodePolicy::Fast),
        ("size", EncodePolicy::Size),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("encode-policy", value, Self::CHOICES)
    }
}

/// Colorspaces the pipeline can run in or emit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colorspace {
    /// sRGB transfer curve (the default interchange space)
    #[default]
    Gamma,
    /// Linear-light RGB
    Linear,
    /// OKLab perceptual space
    Oklab,
    /// SMPTE-C primaries
    SmpteC,
}

impl Colorspace {
    /// Values accepted for the working colorspace.
    pub const WORKING_CHOICES: &'static [(&'static str, Colorspace)] = &[
        ("gamma", Colorspace::Gamma),
        ("linear", Colorspace::Linear),
        ("oklab", Colorspace::Oklab),
    ];

    /// Values accepted for the output colorspace.
    pub const OUTPUT_CHOICES: &'static [(&'static str, Colorspace)] = &[
        ("gamma", Colorspace::Gamma),
        ("linear", Colorspace::Linear),
        ("smpte-c", Colorspace::SmpteC),
        ("smptec", Colorspace::SmpteC),
    ];

    pub fn parse_working(value: &str) -> SixelResult<Self> {
        resolve("working-colorspace", value, Self::WORKING_CHOICES)
    }

    pub fn parse_output(value: &str) -> SixelResult<Self> {
        resolve("output-colorspace", value, Self::OUTPUT_CHOICES)
    }
}

/// Predefined hardware / terminal palettes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinPalette {
    Xterm16,
    Xterm256,
    Vt340Mono,
    Vt340Color,
    Gray1,
    Gray2,
    Gray4,
    Gray8,
}

impl BuiltinPalette {
    pub const CHOICES: &'static [(&'static str, BuiltinPalette)] = &[
        ("xterm16", BuiltinPalette::Xterm16),
        ("xterm256", BuiltinPalette::Xterm256),
        ("vt340mono", BuiltinPalette::Vt340Mono),
        ("vt340color", BuiltinPalette::Vt340Color),
        ("gray1", BuiltinPalette::Gray1),
        ("gray2", BuiltinPalette::Gray2),
        ("gray4", BuiltinPalette::Gray4),
        ("gray8", BuiltinPalette::Gray8),
    ];

    pub fn parse(value: &str) -> SixelResult<Self> {
        resolve("builtin-palette", value, Self::CHOICES)
    }
}

/// How the palette is sourced for an encode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ColorOption {
    /// Quantize the frame's own colors
    #[default]
    Default,
    /// Two-entry black/white palette
    Monochrome,
    /// One of the [`BuiltinPalette`] sets
    Builtin(BuiltinPalette),
    /// Palette parsed from a palette file's bytes
    Mapfile(Vec<u8>),
    /// 15bpp dynamic palette emission
    HighColor,
}

/// A width or height request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeSpec {
    /// Preserve aspect ratio from the other axis
    #[default]
    Auto,
    /// Absolute pixels
    Pixels(u32),
    /// Percentage of the source dimension
    Percent(u32),
    /// Terminal cells (multiplied by the configured cell size)
    Cells(u32),
}

impl SizeSpec {
    /// Parse `"640"`, `"640px"`, `"50%"`, `"80c"` or `"auto"`.
    pub fn parse(option: &str, value: &str) -> SixelResult<Self> {
        if value == "auto" {
            return Ok(SizeSpec::Auto);
        }
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, unit) = value.split_at(split);
        let number: u32 = digits
            .parse()
            .map_err(|_| SixelError::BadArgument(format!("cannot parse {} option", option)))?;
        match unit {
            "" | "px" => Ok(SizeSpec::Pixels(number)),
            "%" => Ok(SizeSpec::Percent(number)),
            "c" => Ok(SizeSpec::Cells(number)),
            _ => Err(SixelError::BadArgument(format!(
                "cannot parse {} option",
                option
            ))),
        }
    }
}

/// A crop rectangle in `WxH+X+Y` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl CropRect {
    pub fn parse(value: &str) -> SixelResult<Self> {
        let bad = || SixelError::BadArgument("cannot parse crop geometry".into());

        let (w, rest) = value.split_once('x').ok_or_else(bad)?;
        let (h, rest) = rest.split_once('+').ok_or_else(bad)?;
        let (x, y) = rest.split_once('+').ok_or_else(bad)?;

        let rect = CropRect {
            width: w.parse().map_err(|_| bad())?,
            height: h.parse().map_err(|_| bad())?,
            x: x.parse().map_err(|_| bad())?,
            y: y.parse().map_err(|_| bad())?,
        };
        if rect.width == 0 || rect.height == 0 {
            return Err(bad());
        }
        Ok(rect)
    }
}

/// Parse a `colors` value: `1..=256` with an optional trailing `!`
/// requesting a forced (non-shrinking) palette. A bare `!` forces the
/// maximum palette size.
pub fn parse_colors(value: &str) -> SixelResult<(u16, bool)> {
    if value == "!" {
        return Ok((SIXEL_PALETTE_MAX as u16, true));
    }
    let (digits, forced) = match value.strip_suffix('!') {
        Some(rest) => (rest, true),
        None => (value, false),
    };
    let n: u32 = digits
        .parse()
        .map_err(|_| SixelError::BadArgument("cannot parse colors option".into()))?;
    if n < 1 {
        return Err(SixelError::BadArgument(
            "colors parameter must be 1 or more".into(),
        ));
    }
    if n > SIXEL_PALETTE_MAX as u32 {
        return Err(SixelError::BadArgument(
            "colors parameter must be less than or equal to 256".into(),
        ));
    }
    Ok((n as u16, forced))
}

/// Keys accepted by [`crate::encoder::Encoder::setopt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFlag {
    SevenBitMode,
    EightBitMode,
    GriLimit,
    Colors,
    Mapfile,
    Monochrome,
    HighColor,
    BuiltinPalette,
    Diffusion,
    DiffusionScan,
    DiffusionCarry,
    FindLargest,
    SelectColor,
    QuantizeModel,
    FinalMerge,
    Crop,
    Width,
    Height,
    Resampling,
    LoopControl,
    PaletteType,
    Bgcolor,
    Invert,
    UseMacro,
    MacroNumber,
    IgnoreDelay,
    Static,
    PenetrateMultiplexer,
    EncodePolicy,
    LutPolicy,
    WorkingColorspace,
    OutputColorspace,
    Ormode,
    ComplexionScore,
    Threads,
    CellSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_names_match_themselves() {
        for &(name, expected) in DiffusionMethod::CHOICES {
            assert_eq!(DiffusionMethod::parse(name).unwrap(), expected);
        }
        for &(name, expected) in ResampleMethod::CHOICES {
            assert_eq!(ResampleMethod::parse(name).unwrap(), expected);
        }
    }

    #[test]
    fn unique_prefixes_match() {
        assert_eq!(
            MethodForRep::parse("ave").unwrap(),
            MethodForRep::Average
        );
        assert_eq!(DiffusionMethod::parse("at").unwrap(), DiffusionMethod::Atkinson);
        assert_eq!(ResampleMethod::parse("bil").unwrap(), ResampleMethod::Bilinear);
    }

    #[test]
    fn shared_prefix_over_one_value_matches() {
        // "histogram" and "histgram" map to the same value, so the shared
        // prefix "hist" is not ambiguous.
        assert_eq!(
            MethodForRep::parse("hist").unwrap(),
            MethodForRep::Histogram
        );
        // "smpte" covers both spellings of the same colorspace.
        assert_eq!(
            Colorspace::parse_output("smpte").unwrap(),
            Colorspace::SmpteC
        );
    }

    #[test]
    fn ambiguous_prefix_reports_candidates() {
        let err = MethodForRep::parse("a").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("auto"), "{message}");
        assert!(message.contains("average"), "{message}");

        match match_choice("s", DiffusionMethod::CHOICES) {
            PrefixMatch::Ambiguous(names) => {
                assert_eq!(names, vec!["stucki", "sierra1", "sierra2", "sierra3"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn unknown_value_is_rejected() {
        assert!(DiffusionMethod::parse("floyd").is_err());
        assert!(DiffusionMethod::parse("").is_err());
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert!(DiffusionMethod::parse("FS").is_err());
        assert!(LoopMode::parse("Force").is_err());
    }

    #[test]
    fn lut_aliases_collapse_to_hash() {
        assert_eq!(LutPolicy::parse("robinhood").unwrap(), LutPolicy::Hash);
        assert_eq!(LutPolicy::parse("hopscotch").unwrap(), LutPolicy::Hash);
        assert_eq!(LutPolicy::parse("none").unwrap(), LutPolicy::Hash);
    }

    #[test]
    fn size_spec_units() {
        assert_eq!(SizeSpec::parse("width", "640").unwrap(), SizeSpec::Pixels(640));
        assert_eq!(SizeSpec::parse("width", "640px").unwrap(), SizeSpec::Pixels(640));
        assert_eq!(SizeSpec::parse("width", "50%").unwrap(), SizeSpec::Percent(50));
        assert_eq!(SizeSpec::parse("width", "80c").unwrap(), SizeSpec::Cells(80));
        assert_eq!(SizeSpec::parse("width", "auto").unwrap(), SizeSpec::Auto);
        assert!(SizeSpec::parse("width", "12q").is_err());
        assert!(SizeSpec::parse("width", "").is_err());
    }

    #[test]
    fn crop_rect_parsing() {
        let rect = CropRect::parse("640x480+10+20").unwrap();
        assert_eq!(
            rect,
            CropRect { width: 640, height: 480, x: 10, y: 20 }
        );
        assert!(CropRect::parse("640x480").is_err());
        assert!(CropRect::parse("0x480+0+0").is_err());
        assert!(CropRect::parse("640x480+-1+0").is_err());
    }

    #[test]
    fn colors_with_force_suffix() {
        assert_eq!(parse_colors("16").unwrap(), (16, false));
        assert_eq!(parse_colors("256!").unwrap(), (256, true));
        assert_eq!(parse_colors("!").unwrap(), (256, true));
        assert!(parse_colors("0").is_err());
        assert!(parse_colors("257").is_err());
        assert!(parse_colors("16!!").is_err());
    }
}
