//! Palette objects, builtin palettes and palette file formats.

use crate::options::BuiltinPalette;
use crate::{SixelError, SixelResult, SIXEL_PALETTE_MAX};

/// An ordered sequence of up to 256 RGB triples in the working colorspace.
///
/// Shared between cached [`crate::dither::Dither`] instances through
/// `Arc`; once built a palette is immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<u8>,
    requested: usize,
    keycolor: Option<usize>,
    force: bool,
}

impl Palette {
    /// Wrap RGB triples. `requested` is the color count the caller asked
    /// for; the active count is `colors.len() / 3`.
    pub fn new(colors: Vec<u8>, requested: usize) -> SixelResult<Self> {
        if colors.is_empty() || colors.len() % 3 != 0 {
            return Err(SixelError::LogicError(format!(
                "palette byte length {} is not a multiple of 3",
                colors.len()
            )));
        }
        let active = colors.len() / 3;
        if active > requested || requested > SIXEL_PALETTE_MAX {
            return Err(SixelError::LogicError(format!(
                "palette sizes out of range: active {} requested {}",
                active, requested
            )));
        }
        Ok(Palette {
            colors,
            requested,
            keycolor: None,
            force: false,
        })
    }

    pub fn with_keycolor(mut self, index: Option<usize>) -> Self {
        self.keycolor = index;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Number of colors actually present.
    pub fn active(&self) -> usize {
        self.colors.len() / 3
    }

    /// Number of colors originally requested.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Palette slot reserved for the transparent/background color.
    pub fn keycolor(&self) -> Option<usize> {
        self.keycolor
    }

    /// Whether the size must be preserved even if fewer colors sufficed.
    pub fn is_forced(&self) -> bool {
        self.force
    }

    pub fn rgb(&self, index: usize) -> [u8; 3] {
        let base = index * 3;
        [self.colors[base], self.colors[base + 1], self.colors[base + 2]]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.colors
    }

    /// Pad the palette up to `requested` by replicating the final color.
    /// Used when the force flag demands a fixed size.
    pub fn pad_to_requested(&mut self) {
        let last = self.rgb(self.active() - 1);
        while self.active() < self.requested {
            self.colors.extend_from_slice(&last);
        }
    }

    /// Map every entry through `f`; used for output colorspace conversion.
    pub fn map_colors(&self, mut f: impl FnMut([u8; 3]) -> [u8; 3]) -> Palette {
        let mut colors = Vec::with_capacity(self.colors.len());
        for c in self.colors.chunks_exact(3) {
            colors.extend_from_slice(&f([c[0], c[1], c[2]]));
        }
        Palette {
            colors,
            requested: self.requested,
            keycolor: self.keycolor,
            force: self.force,
        }
    }
}

/// Two-entry palette for the monochrome color option. `invert` swaps the
/// dark and light slots.
pub fn monochrome(invert: bool) -> Palette {
    let colors = if invert {
        vec![255, 255, 255, 0, 0, 0]
    } else {
        vec![0, 0, 0, 255, 255, 255]
    };
    Palette::new(colors, 2).expect("static palette")
}

/// Standard xterm 16-color set.
const XTERM16: [[u8; 3]; 16] = [
    [0, 0, 0],
    [205, 0, 0],
    [0, 205, 0],
    [205, 205, 0],
    [0, 0, 238],
    [205, 0, 205],
    [0, 205, 205],
    [229, 229, 229],
    [127, 127, 127],
    [255, 0, 0],
    [0, 255, 0],
    [255, 255, 0],
    [92, 92, 255],
    [255, 0, 255],
    [0, 255, 255],
    [255, 255, 255],
];

/// VT340 default color map, in percent RGB as the hardware documents it.
const VT340_COLOR_PERCENT: [[u16; 3]; 16] = [
    [0, 0, 0],
    [20, 20, 80],
    [80, 13, 13],
    [20, 80, 20],
    [80, 20, 80],
    [20, 80, 80],
    [80, 80, 20],
    [53, 53, 53],
    [26, 26, 26],
    [33, 33, 60],
    [60, 26, 26],
    [33, 60, 33],
    [60, 33, 60],
    [33, 60, 60],
    [60, 60, 33],
    [80, 80, 80],
];

fn percent_to_byte(v: u16) -> u8 {
    ((v as u32 * 255 + 50) / 100) as u8
}

fn gray_ramp(levels: usize) -> Vec<u8> {
    let mut colors = Vec::with_capacity(levels * 3);
    for i in 0..levels {
        let v = (i * 255 / (levels - 1)) as u8;
        colors.extend_from_slice(&[v, v, v]);
    }
    colors
}

/// Build one of the predefined palettes.
pub fn builtin(which: BuiltinPalette) -> Palette {
    let colors: Vec<u8> = match which {
        BuiltinPalette::Xterm16 => XTERM16.iter().flatten().copied().collect(),
        BuiltinPalette::Xterm256 => {
            let mut colors: Vec<u8> = XTERM16.iter().flatten().copied().collect();
            // 6x6x6 color cube
            const RAMP: [u8; 6] = [0, 95, 135, 175, 215, 255];
            for r in RAMP {
                for g in RAMP {
                    for b in RAMP {
                        colors.extend_from_slice(&[r, g, b]);
                    }
                }
            }
            // 24-step grayscale ramp
            for i in 0..24u16 {
                let v = (8 + i * 10) as u8;
                colors.extend_from_slice(&[v, v, v]);
            }
            colors
        }
        BuiltinPalette::Vt340Color => VT340_COLOR_PERCENT
            .iter()
            .flat_map(|c| c.map(percent_to_byte))
            .collect(),
        BuiltinPalette::Vt340Mono => {
            // Four gray shades cycling through all 16 registers.
            let shades = [0u16, 33, 66, 100];
            (0..16)
                .flat_map(|i| {
                    let v = percent_to_byte(shades[i % 4]);
                    [v, v, v]
                })
                .collect()
        }
        BuiltinPalette::Gray1 => gray_ramp(2),
        BuiltinPalette::Gray2 => gray_ramp(4),
        BuiltinPalette::Gray4 => gray_ramp(16),
        BuiltinPalette::Gray8 => gray_ramp(256),
    };
    let requested = colors.len() / 3;
    Palette::new(colors, requested).expect("static palette")
}

/// Palette file container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaletteFormat {
    /// Adobe color table: 768 raw bytes, optionally followed by a color
    /// count and transparent index (big endian)
    Act,
    /// JASC (Paint Shop Pro) text palette
    PalJasc,
    /// Microsoft RIFF PAL
    PalRiff,
    /// GIMP palette
    Gpl,
}

/// Sniff the palette file format from its leading bytes.
pub fn guess_format(data: &[u8]) -> Option<PaletteFormat> {
    if data.starts_with(b"JASC-PAL") {
        return Some(PaletteFormat::PalJasc);
    }
    if data.starts_with(b"RIFF") {
        return Some(PaletteFormat::PalRiff);
    }
    if data.starts_with(b"GIMP Palette") {
        return Some(PaletteFormat::Gpl);
    }
    if data.len() == 768 || data.len() == 772 {
        return Some(PaletteFormat::Act);
    }
    None
}

fn bad_palette(reason: &str) -> SixelError {
    SixelError::BadInput(format!("cannot parse palette file: {}", reason))
}

fn parse_act(data: &[u8]) -> SixelResult<Palette> {
    if data.len() != 768 && data.len() != 772 {
        return Err(bad_palette("ACT palette must be 768 or 772 bytes"));
    }
    let mut count = 256usize;
    let mut transparent = None;
    if data.len() == 772 {
        let declared = u16::from_be_bytes([data[768], data[769]]) as usize;
        if declared > 0 && declared <= 256 {
            count = declared;
        }
        let key = u16::from_be_bytes([data[770], data[771]]);
        if key != 0xffff && (key as usize) < count {
            transparent = Some(key as usize);
        }
    }
    let palette = Palette::new(data[..count * 3].to_vec(), count)?;
    Ok(palette.with_keycolor(transparent))
}

fn parse_pal_jasc(data: &[u8]) -> SixelResult<Palette> {
    let text = std::str::from_utf8(data).map_err(|_| bad_palette("JASC palette is not text"))?;
    let mut lines = text.lines().map(str::trim);

    if lines.next() != Some("JASC-PAL") {
        return Err(bad_palette("missing JASC-PAL signature"));
    }
    if lines.next() != Some("0100") {
        return Err(bad_palette("unsupported JASC-PAL version"));
    }
    let count: usize = lines
        .next()
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| bad_palette("missing JASC-PAL color count"))?;
    if count == 0 || count > SIXEL_PALETTE_MAX {
        return Err(bad_palette("JASC-PAL color count out of range"));
    }

    let mut colors = Vec::with_capacity(count * 3);
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| bad_palette("truncated JASC-PAL entry list"))?;
        let mut parts = line.split_ascii_whitespace();
        for _ in 0..3 {
            let v: u16 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| bad_palette("malformed JASC-PAL entry"))?;
            if v > 255 {
                return Err(bad_palette("JASC-PAL component out of range"));
            }
            colors.push(v as u8);
        }
    }
    Palette::new(colors, count)
}

fn parse_pal_riff(data: &[u8]) -> SixelResult<Palette> {
    if data.len() < 24 || &data[0..4] != b"RIFF" || &data[8..12] != b"PAL " {
        return Err(bad_palette("missing RIFF PAL header"));
    }
    // Scan chunks for "data".
    let mut offset = 12;
    while offset + 8 <= data.len() {
        let id = &data[offset..offset + 4];
        let size = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        let body = offset + 8;
        if id == b"data" {
            if body + 4 > data.len() || size < 4 {
                return Err(bad_palette("truncated RIFF data chunk"));
            }
            let count = u16::from_le_bytes([data[body + 2], data[body + 3]]) as usize;
            if count == 0 || count > SIXEL_PALETTE_MAX {
                return Err(bad_palette("RIFF PAL color count out of range"));
            }
            let entries = &data[body + 4..];
            if entries.len() < count * 4 {
                return Err(bad_palette("truncated RIFF PAL entries"));
            }
            let mut colors = Vec::with_capacity(count * 3);
            for e in entries.chunks_exact(4).take(count) {
                colors.extend_from_slice(&e[0..3]);
            }
            return Palette::new(colors, count);
        }
        offset = body + size + (size & 1);
    }
    Err(bad_palette("RIFF PAL has no data chunk"))
}

fn parse_gpl(data: &[u8]) -> SixelResult<Palette> {
    let text = std::str::from_utf8(data).map_err(|_| bad_palette("GPL palette is not text"))?;
    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some("GIMP Palette") {
        return Err(bad_palette("missing GIMP Palette signature"));
    }

    let mut colors = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with("Name:")
            || line.starts_with("Columns:")
        {
            continue;
        }
        let mut parts = line.split_ascii_whitespace();
        let mut rgb = [0u8; 3];
        for c in &mut rgb {
            let v: u16 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| bad_palette("malformed GPL entry"))?;
            if v > 255 {
                return Err(bad_palette("GPL component out of range"));
            }
            *c = v as u8;
        }
        colors.extend_from_slice(&rgb);
        if colors.len() / 3 > SIXEL_PALETTE_MAX {
            return Err(bad_palette("GPL palette has more than 256 entries"));
        }
    }
    if colors.is_empty() {
        return Err(bad_palette("GPL palette has no entries"));
    }
    let count = colors.len() / 3;
    Palette::new(colors, count)
}

/// Parse a palette file, sniffing the format from the content.
pub fn parse_palette_file(data: &[u8]) -> SixelResult<Palette> {
    match guess_format(data) {
        Some(PaletteFormat::Act) => parse_act(data),
        Some(PaletteFormat::PalJasc) => parse_pal_jasc(data),
        Some(PaletteFormat::PalRiff) => parse_pal_riff(data),
        Some(PaletteFormat::Gpl) => parse_gpl(data),
        None => Err(bad_palette("unrecognized palette file format")),
    }
}

/// Serialize a palette into the given file format.
pub fn write_palette_file(palette: &Palette, format: PaletteFormat) -> Vec<u8> {
    match format {
        PaletteFormat::Act => {
            let mut out = vec![0u8; 772];
            let n = palette.active().min(256);
            out[..n * 3].copy_from_slice(&palette.as_bytes()[..n * 3]);
            out[768..770].copy_from_slice(&(n as u16).to_be_bytes());
            let key = palette.keycolor().map(|k| k as u16).unwrap_or(0xffff);
            out[770..772].copy_from_slice(&key.to_be_bytes());
            out
        }
        PaletteFormat::PalJasc => {
            let mut out = String::new();
            out.push_str("JASC-PAL\r\n0100\r\n");
            out.push_str(&format!("{}\r\n", palette.active()));
            for i in 0..palette.active() {
                let [r, g, b] = palette.rgb(i);
                out.push_str(&format!("{} {} {}\r\n", r, g, b));
            }
            out.into_bytes()
        }
        PaletteFormat::PalRiff => {
            let count = palette.active();
            let data_size = 4 + count * 4;
            let riff_size = 4 + 8 + data_size;
            let mut out = Vec::with_capacity(8 + riff_size);
            out.extend_from_slice(b"RIFF");
            out.extend_from_slice(&(riff_size as u32).to_le_bytes());
            out.extend_from_slice(b"PAL ");
            out.extend_from_slice(b"data");
            out.extend_from_slice(&(data_size as u32).to_le_bytes());
            out.extend_from_slice(&0x0300u16.to_le_bytes());
            out.extend_from_slice(&(count as u16).to_le_bytes());
            for i in 0..count {
                let [r, g, b] = palette.rgb(i);
                out.extend_from_slice(&[r, g, b, 0]);
            }
            out
        }
        PaletteFormat::Gpl => {
            let mut out = String::from("GIMP Palette\nName: palette\nColumns: 16\n#\n");
            for i in 0..palette.active() {
                let [r, g, b] = palette.rgb(i);
                out.push_str(&format!("{:3} {:3} {:3}\tcolor{}\n", r, g, b, i));
            }
            out.into_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_palette() -> Palette {
        Palette::new(
            vec![0, 0, 0, 255, 0, 0, 0, 255, 0, 0, 0, 255],
            4,
        )
        .unwrap()
    }

    #[test]
    fn active_never_exceeds_requested() {
        assert!(Palette::new(vec![0; 9], 2).is_err());
        let p = Palette::new(vec![0; 9], 3).unwrap();
        assert_eq!(p.active(), 3);
        assert_eq!(p.requested(), 3);
    }

    #[test]
    fn padding_replicates_last_color() {
        let mut p = Palette::new(vec![1, 2, 3], 3).unwrap();
        p.pad_to_requested();
        assert_eq!(p.active(), 3);
        assert_eq!(p.rgb(2), [1, 2, 3]);
    }

    #[test]
    fn builtin_sizes() {
        assert_eq!(builtin(BuiltinPalette::Xterm16).active(), 16);
        assert_eq!(builtin(BuiltinPalette::Xterm256).active(), 256);
        assert_eq!(builtin(BuiltinPalette::Vt340Color).active(), 16);
        assert_eq!(builtin(BuiltinPalette::Vt340Mono).active(), 16);
        assert_eq!(builtin(BuiltinPalette::Gray1).active(), 2);
        assert_eq!(builtin(BuiltinPalette::Gray2).active(), 4);
        assert_eq!(builtin(BuiltinPalette::Gray4).active(), 16);
        assert_eq!(builtin(BuiltinPalette::Gray8).active(), 256);
    }

    #[test]
    fn xterm256_cube_is_regular() {
        let p = builtin(BuiltinPalette::Xterm256);
        // Entry 16 is cube origin, entry 231 is cube white.
        assert_eq!(p.rgb(16), [0, 0, 0]);
        assert_eq!(p.rgb(231), [255, 255, 255]);
        assert_eq!(p.rgb(232), [8, 8, 8]);
    }

    #[test]
    fn act_round_trip() {
        let p = sample_palette();
        let bytes = write_palette_file(&p, PaletteFormat::Act);
        assert_eq!(guess_format(&bytes), Some(PaletteFormat::Act));
        let parsed = parse_act(&bytes).unwrap();
        assert_eq!(parsed.active(), 4);
        assert_eq!(parsed.as_bytes(), p.as_bytes());
        // Format -> parse -> format is byte identical.
        assert_eq!(write_palette_file(&parsed, PaletteFormat::Act), bytes);
    }

    #[test]
    fn jasc_round_trip() {
        let p = sample_palette();
        let bytes = write_palette_file(&p, PaletteFormat::PalJasc);
        assert_eq!(guess_format(&bytes), Some(PaletteFormat::PalJasc));
        let parsed = parse_pal_jasc(&bytes).unwrap();
        assert_eq!(parsed.as_bytes(), p.as_bytes());
        assert_eq!(write_palette_file(&parsed, PaletteFormat::PalJasc), bytes);
    }

    #[test]
    fn riff_round_trip() {
        let p = sample_palette();
        let bytes = write_palette_file(&p, PaletteFormat::PalRiff);
        assert_eq!(guess_format(&bytes), Some(PaletteFormat::PalRiff));
        let parsed = parse_pal_riff(&bytes).unwrap();
        assert_eq!(parsed.as_bytes(), p.as_bytes());
        assert_eq!(write_palette_file(&parsed, PaletteFormat::PalRiff), bytes);
    }

    #[test]
    fn gpl_round_trip() {
        let p = sample_palette();
        let bytes = write_palette_file(&p, PaletteFormat::Gpl);
        assert_eq!(guess_format(&bytes), Some(PaletteFormat::Gpl));
        let parsed = parse_gpl(&bytes).unwrap();
        assert_eq!(parsed.as_bytes(), p.as_bytes());
        assert_eq!(write_palette_file(&parsed, PaletteFormat::Gpl), bytes);
    }

    #[test]
    fn malformed_palette_files_are_bad_input() {
        for data in [
            &b"JASC-PAL\r\n0200\r\n2\r\n"[..],
            &b"GIMP Palette\n300 0 0 red\n"[..],
            &b"RIFF\x00\x00\x00\x00PAL "[..],
            &[0u8; 100][..],
        ] {
            match parse_palette_file(data) {
                Err(SixelError::BadInput(_)) => {}
                other => panic!("expected BadInput, got {other:?}"),
            }
        }
    }
}
