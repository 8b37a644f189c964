//! Option surface checks: prefix matching over every choice table and
//! the numeric/geometry parsers.

use sixelkit::options::{
    match_choice, parse_colors, BuiltinPalette, Colorspace, CropRect, DiffusionCarry,
    DiffusionMethod, DiffusionScan, EncodePolicy, FinalMerge, LoopMode, LutPolicy,
    MethodForLargest, MethodForRep, PaletteType, PrefixMatch, QuantizeModel, ResampleMethod,
    SizeSpec,
};

/// Every full option name matches itself, for every table.
#[test]
fn full_names_round_trip_every_table() {
    fn check<T: Copy + PartialEq + std::fmt::Debug>(choices: &[(&'static str, T)]) {
        for &(name, expected) in choices {
            match match_choice(name, choices) {
                PrefixMatch::Match(v) => assert_eq!(v, expected, "{name}"),
                other => panic!("{name}: {other:?}"),
            }
        }
    }

    check(DiffusionMethod::CHOICES);
    check(DiffusionScan::CHOICES);
    check(DiffusionCarry::CHOICES);
    check(MethodForLargest::CHOICES);
    check(MethodForRep::CHOICES);
    check(QuantizeModel::CHOICES);
    check(FinalMerge::CHOICES);
    check(LutPolicy::CHOICES);
    check(ResampleMethod::CHOICES);
    check(LoopMode::CHOICES);
    check(PaletteType::CHOICES);
    check(EncodePolicy::CHOICES);
    check(BuiltinPalette::CHOICES);
    check(Colorspace::WORKING_CHOICES);
    check(Colorspace::OUTPUT_CHOICES);
}

/// Every strict one-character extension of a prefix that is unique
/// resolves; shared prefixes over distinct values report all candidates.
#[test]
fn prefix_behavior_is_consistent() {
    // Unique prefixes.
    assert_eq!(
        match_choice("serp", DiffusionScan::CHOICES),
        PrefixMatch::Match(DiffusionScan::Serpentine)
    );
    assert_eq!(
        match_choice("hec", QuantizeModel::CHOICES),
        PrefixMatch::Match(QuantizeModel::Heckbert)
    );
    assert_eq!(
        match_choice("w", FinalMerge::CHOICES),
        PrefixMatch::Match(FinalMerge::Ward)
    );
    assert_eq!(
        match_choice("lan", ResampleMethod::CHOICES),
        PrefixMatch::Ambiguous(vec!["lanczos2", "lanczos3", "lanczos4"])
    );
    assert_eq!(
        match_choice("sierra", DiffusionMethod::CHOICES),
        PrefixMatch::Ambiguous(vec!["sierra1", "sierra2", "sierra3"])
    );
    // A prefix covering aliases of one value still matches.
    assert_eq!(
        match_choice("hist", MethodForRep::CHOICES),
        PrefixMatch::Match(MethodForRep::Histogram)
    );
    // The compatibility aliases resolve onto the hash policy.
    assert_eq!(
        match_choice("ho", LutPolicy::CHOICES),
        PrefixMatch::Match(LutPolicy::Hash)
    );
    assert_eq!(
        match_choice("rob", LutPolicy::CHOICES),
        PrefixMatch::Match(LutPolicy::Hash)
    );
    // Nothing matches.
    assert_eq!(
        match_choice("bogus", DiffusionMethod::CHOICES),
        PrefixMatch::None::<DiffusionMethod>
    );
}

#[test]
fn ambiguity_requires_distinct_values() {
    // "h" in the working-colorspace table: no entry starts with h.
    assert_eq!(
        match_choice("h", Colorspace::WORKING_CHOICES),
        PrefixMatch::None::<Colorspace>
    );
    // "s" in the output table: both spellings of SMPTE-C, same value.
    assert_eq!(
        match_choice("s", Colorspace::OUTPUT_CHOICES),
        PrefixMatch::Match(Colorspace::SmpteC)
    );
}

#[test]
fn colors_parser_bounds() {
    assert_eq!(parse_colors("1").unwrap(), (1, false));
    assert_eq!(parse_colors("256").unwrap(), (256, false));
    assert_eq!(parse_colors("64!").unwrap(), (64, true));
    assert_eq!(parse_colors("!").unwrap(), (256, true));
    assert!(parse_colors("0").is_err());
    assert!(parse_colors("257").is_err());
    assert!(parse_colors("abc").is_err());
    assert!(parse_colors("").is_err());
}

#[test]
fn geometry_parsers() {
    assert_eq!(SizeSpec::parse("width", "800").unwrap(), SizeSpec::Pixels(800));
    assert_eq!(SizeSpec::parse("width", "75%").unwrap(), SizeSpec::Percent(75));
    assert_eq!(SizeSpec::parse("height", "24c").unwrap(), SizeSpec::Cells(24));
    assert_eq!(SizeSpec::parse("height", "auto").unwrap(), SizeSpec::Auto);

    let rect = CropRect::parse("320x200+16+8").unwrap();
    assert_eq!((rect.width, rect.height, rect.x, rect.y), (320, 200, 16, 8));
    assert!(CropRect::parse("320x200").is_err());
    assert!(CropRect::parse("x+1+1").is_err());
}
