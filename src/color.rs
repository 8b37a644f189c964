//! Background-color specifications in the X11 `XColorSpec` style.
//!
//! Accepted forms: a color name, `#rgb` / `#rrggbb` / `#rrrgggbbb` /
//! `#rrrrggggbbbb`, and `rgb:<r>/<g>/<b>` where each component is 1-4
//! hex digits scaled to 8 bits.

use crate::{SixelError, SixelResult};

/// Commonly used X11 color names. Lookup is case-insensitive.
const NAMED_COLORS: &[(&str, [u8; 3])] = &[
    ("aqua", [0, 255, 255]),
    ("black", [0, 0, 0]),
    ("blue", [0, 0, 255]),
    ("brown", [165, 42, 42]),
    ("cyan", [0, 255, 255]),
    ("darkblue", [0, 0, 139]),
    ("darkgray", [169, 169, 169]),
    ("darkgreen", [0, 100, 0]),
    ("darkred", [139, 0, 0]),
    ("fuchsia", [255, 0, 255]),
    ("gold", [255, 215, 0]),
    ("gray", [190, 190, 190]),
    ("green", [0, 255, 0]),
    ("grey", [190, 190, 190]),
    ("lightblue", [173, 216, 230]),
    ("lightgray", [211, 211, 211]),
    ("lime", [0, 255, 0]),
    ("magenta", [255, 0, 255]),
    ("maroon", [176, 48, 96]),
    ("navy", [0, 0, 128]),
    ("olive", [128, 128, 0]),
    ("orange", [255, 165, 0]),
    ("pink", [255, 192, 203]),
    ("purple", [160, 32, 240]),
    ("red", [255, 0, 0]),
    ("silver", [192, 192, 192]),
    ("teal", [0, 128, 128]),
    ("violet", [238, 130, 238]),
    ("white", [255, 255, 255]),
    ("yellow", [255, 255, 0]),
];

fn hex_nibble(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u32),
        b'a'..=b'f' => Some((c - b'a' + 10) as u32),
        b'A'..=b'F' => Some((c - b'A' + 10) as u32),
        _ => None,
    }
}

fn bad(spec: &str) -> SixelError {
    SixelError::BadArgument(format!("cannot parse color specification \"{}\"", spec))
}

/// Parse `rgb:<r>/<g>/<b>`. Each component carries 1-4 hex digits and is
/// scaled as if left-padded to 16 bits, keeping the top byte.
fn parse_rgb_form(spec: &str, body: &str) -> SixelResult<[u8; 3]> {
    let mut components = [0u8; 3];
    let mut count = 0;

    for part in body.split('/') {
        if count == 3 || part.is_empty() || part.len() > 4 {
            return Err(bad(spec));
        }
        let mut v: u32 = 0;
        for &c in part.as_bytes() {
            v = (v << 4) | hex_nibble(c).ok_or_else(|| bad(spec))?;
        }
        v = (v << ((4 - part.len()) * 4)) >> 8;
        components[count] = v as u8;
        count += 1;
    }

    if count != 3 {
        return Err(bad(spec));
    }
    Ok(components)
}

/// Parse `#…` with 3, 6, 9 or 12 hex digits (4, 8, 12 or 16 bits per
/// channel); wider channels keep their top byte.
fn parse_hash_form(spec: &str, body: &str) -> SixelResult<[u8; 3]> {
    let digits: Vec<u32> = body
        .as_bytes()
        .iter()
        .map(|&c| hex_nibble(c).ok_or_else(|| bad(spec)))
        .collect::<SixelResult<_>>()?;

    let per_channel = match digits.len() {
        3 => 1,
        6 => 2,
        9 => 3,
        12 => 4,
        _ => return Err(bad(spec)),
    };

    let mut components = [0u8; 3];
    for (channel, chunk) in digits.chunks_exact(per_channel).enumerate() {
        components[channel] = match per_channel {
            1 => (chunk[0] << 4) as u8,
            _ => ((chunk[0] << 4) | chunk[1]) as u8,
        };
    }
    Ok(components)
}

/// Parse a color specification into an RGB triple.
pub fn parse_color_spec(spec: &str) -> SixelResult<[u8; 3]> {
    let lowered = spec.to_ascii_lowercase();
    if let Some(&(_, rgb)) = NAMED_COLORS.iter().find(|(name, _)| *name == lowered) {
        return Ok(rgb);
    }
    if let Some(body) = spec.strip_prefix("rgb:") {
        return parse_rgb_form(spec, body);
    }
    if let Some(body) = spec.strip_prefix('#') {
        return parse_hash_form(spec, body);
    }
    Err(bad(spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_colors_resolve() {
        assert_eq!(parse_color_spec("red").unwrap(), [255, 0, 0]);
        assert_eq!(parse_color_spec("NAVY").unwrap(), [0, 0, 128]);
    }

    #[test]
    fn hash_forms() {
        assert_eq!(parse_color_spec("#fff").unwrap(), [0xf0, 0xf0, 0xf0]);
        assert_eq!(parse_color_spec("#102030").unwrap(), [0x10, 0x20, 0x30]);
        assert_eq!(parse_color_spec("#112233445566").unwrap(), [0x11, 0x33, 0x55]);
        assert!(parse_color_spec("#12345").is_err());
        assert!(parse_color_spec("#zzz").is_err());
    }

    #[test]
    fn rgb_forms_scale_components() {
        assert_eq!(parse_color_spec("rgb:ff/00/80").unwrap(), [0xff, 0x00, 0x80]);
        // Single digits replicate into the high nibble.
        assert_eq!(parse_color_spec("rgb:f/f/f").unwrap(), [0xf0, 0xf0, 0xf0]);
        assert_eq!(parse_color_spec("rgb:ffff/0000/8000").unwrap(), [0xff, 0x00, 0x80]);
        assert!(parse_color_spec("rgb:ff/00").is_err());
        assert!(parse_color_spec("rgb:ff/00/80/12").is_err());
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(parse_color_spec("notacolor").is_err());
    }
}
