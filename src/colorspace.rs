//! Colorspace conversions for the working and output stages.
//!
//! The pipeline decodes every space to linear-light RGB with BT.709
//! primaries, then re-encodes into the target space. Channel values stay
//! in 8-bit storage throughout; OKLab components are mapped onto 0-255
//! (L scaled by 255, a/b offset by 0.5) so the quantizer and dither can
//! treat every working space uniformly.

use crate::options::Colorspace;

fn srgb_to_linear(v: u8) -> f32 {
    let v = v as f32 / 255.0;
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(v: f32) -> u8 {
    let v = v.clamp(0.0, 1.0);
    let v = if v <= 0.0031308 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    };
    (v * 255.0 + 0.5) as u8
}

/// BT.709 primaries to SMPTE-C primaries, applied in linear light.
const TO_SMPTEC: [[f32; 3]; 3] = [
    [0.93954, 0.05018, 0.01028],
    [0.01778, 0.96575, 0.01647],
    [-0.00162, -0.00437, 1.00599],
];

/// SMPTE-C primaries back to BT.709, inverse of [`TO_SMPTEC`].
const FROM_SMPTEC: [[f32; 3]; 3] = [
    [1.06481, -0.05504, -0.00998],
    [-0.01960, 1.03640, -0.01677],
    [0.00163, 0.00441, 0.99395],
];

fn mat3(m: &[[f32; 3]; 3], rgb: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * rgb[0] + m[0][1] * rgb[1] + m[0][2] * rgb[2],
        m[1][0] * rgb[0] + m[1][1] * rgb[1] + m[1][2] * rgb[2],
        m[2][0] * rgb[0] + m[2][1] * rgb[1] + m[2][2] * rgb[2],
    ]
}

fn linear_to_oklab(rgb: [f32; 3]) -> [f32; 3] {
    let l = 0.4122214708 * rgb[0] + 0.5363325363 * rgb[1] + 0.0514459929 * rgb[2];
    let m = 0.2119034982 * rgb[0] + 0.6806995451 * rgb[1] + 0.1073969566 * rgb[2];
    let s = 0.0883024619 * rgb[0] + 0.2817188376 * rgb[1] + 0.6299787005 * rgb[2];

    let l = l.cbrt();
    let m = m.cbrt();
    let s = s.cbrt();

    [
        0.2104542553 * l + 0.7936177850 * m - 0.0040720468 * s,
        1.9779984951 * l - 2.4285922050 * m + 0.4505937099 * s,
        0.0259040371 * l + 0.7827717662 * m - 0.8086757660 * s,
    ]
}

fn oklab_to_linear(lab: [f32; 3]) -> [f32; 3] {
    let l = lab[0] + 0.3963377774 * lab[1] + 0.2158037573 * lab[2];
    let m = lab[0] - 0.1055613458 * lab[1] - 0.0638541728 * lab[2];
    let s = lab[0] - 0.0894841775 * lab[1] - 1.2914855480 * lab[2];

    let l = l * l * l;
    let m = m * m * m;
    let s = s * s * s;

    [
        4.0767416621 * l - 3.3077115913 * m + 0.2309699292 * s,
        -1.2684380046 * l + 2.6097574011 * m - 0.3413193965 * s,
        -0.0041960863 * l - 0.7034186147 * m + 1.7076147010 * s,
    ]
}

/// Decode one stored pixel into linear BT.709 RGB.
fn decode(space: Colorspace, p: [u8; 3]) -> [f32; 3] {
    match space {
        Colorspace::Gamma => [srgb_to_linear(p[0]), srgb_to_linear(p[1]), srgb_to_linear(p[2])],
        Colorspace::Linear => [
            p[0] as f32 / 255.0,
            p[1] as f32 / 255.0,
            p[2] as f32 / 255.0,
        ],
        Colorspace::Oklab => {
            let lab = [
                p[0] as f32 / 255.0,
                p[1] as f32 / 255.0 - 0.5,
                p[2] as f32 / 255.0 - 0.5,
            ];
            oklab_to_linear(lab)
        }
        Colorspace::SmpteC => {
            let rgb = [srgb_to_linear(p[0]), srgb_to_linear(p[1]), srgb_to_linear(p[2])];
            mat3(&FROM_SMPTEC, rgb)
        }
    }
}

/// Encode linear BT.709 RGB into one stored pixel of `space`.
fn encode(space: Colorspace, rgb: [f32; 3]) -> [u8; 3] {
    match space {
        Colorspace::Gamma => [
            linear_to_srgb(rgb[0]),
            linear_to_srgb(rgb[1]),
            linear_to_srgb(rgb[2]),
        ],
        Colorspace::Linear => [
            (rgb[0].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
            (rgb[1].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
            (rgb[2].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
        ],
        Colorspace::Oklab => {
            let lab = linear_to_oklab(rgb);
            [
                (lab[0].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
                ((lab[1] + 0.5).clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
                ((lab[2] + 0.5).clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
            ]
        }
        Colorspace::SmpteC => {
            let rgb = mat3(&TO_SMPTEC, rgb);
            [
                linear_to_srgb(rgb[0]),
                linear_to_srgb(rgb[1]),
                linear_to_srgb(rgb[2]),
            ]
        }
    }
}

/// Convert an interleaved RGB888 buffer between colorspaces in place.
pub fn convert_buffer(pixels: &mut [u8], from: Colorspace, to: Colorspace) {
    if from == to {
        return;
    }
    for p in pixels.chunks_exact_mut(3) {
        let rgb = decode(from, [p[0], p[1], p[2]]);
        let out = encode(to, rgb);
        p.copy_from_slice(&out);
    }
}

/// Convert a single RGB triple between colorspaces.
pub fn convert_rgb(rgb: [u8; 3], from: Colorspace, to: Colorspace) -> [u8; 3] {
    if from == to {
        return rgb;
    }
    encode(to, decode(from, rgb))
}
