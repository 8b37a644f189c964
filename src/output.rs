//! SIXEL stream emission: pack an indexed image into run-length encoded
//! six-row bands.

use crate::dither::IndexImage;
use crate::options::{EncodePolicy, PaletteType};
use crate::{SixelError, SixelResult, SIXEL_OUTPUT_SIZE_LIMIT};
use log::trace;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

const DCS_START_7BIT: &[u8] = b"\x1bP";
const DCS_START_8BIT: &[u8] = &[0x90];
const DCS_END_7BIT: &[u8] = b"\x1b\\";
const DCS_END_8BIT: &[u8] = &[0x9c];
const CAN: u8 = 0x18;

/// Output buffer packet size; the writer sees chunks of at least this.
const PACKET_SIZE: usize = 1024;
/// GNU Screen rejects DCS payloads longer than this per envelope.
const SCREEN_PACKET_SIZE: usize = 256;

fn nearest_register(colors: &[[u8; 3]], rgb: [u8; 3]) -> usize {
    let mut best = 0;
    let mut diff = i32::MAX;
    for (i, c) in colors.iter().enumerate() {
        let dr = c[0] as i32 - rgb[0] as i32;
        let dg = c[1] as i32 - rgb[1] as i32;
        let db = c[2] as i32 - rgb[2] as i32;
        let d = dr * dr + dg * dg + db * db;
        if d < diff {
            diff = d;
            best = i;
        }
    }
    best
}

/// One run in the output stream: a color register, the covered column
/// range and the band's column masks for that color.
struct SixelNode {
    pal: usize,
    sx: usize,
    mx: usize,
    map_start: usize,
}

/// Serializes indexed images into SIXEL bytes through any [`Write`].
///
/// Small writes are buffered internally and flushed in packets; the
/// writer is only handed data from one thread at a time.
pub struct SixelOutput<W: Write> {
    writer: W,
    buffer: Vec<u8>,

    eight_bit: bool,
    gri_limit: bool,
    penetrate_multiplexer: bool,
    skip_dcs_envelope: bool,
    palette_type: PaletteType,
    encode_policy: EncodePolicy,
    ormode: bool,

    save_pixel: u8,
    save_count: usize,
    active_palette: i32,
}

impl<W: Write> SixelOutput<W> {
    pub fn new(writer: W) -> Self {
        SixelOutput {
            writer,
            buffer: Vec::with_capacity(PACKET_SIZE * 2),
            eight_bit: false,
            gri_limit: false,
            penetrate_multiplexer: false,
            skip_dcs_envelope: false,
            palette_type: PaletteType::Auto,
            encode_policy: EncodePolicy::Auto,
            ormode: false,
            save_pixel: 0,
            save_count: 0,
            active_palette: -1,
        }
    }

    /// Use single-byte C1 controls (0x90/0x9C) instead of ESC sequences.
    pub fn set_8bit_mode(&mut self, eight_bit: bool) {
        self.eight_bit = eight_bit;
    }

    /// Cap DECGRI repeat counts at 255 for real VT hardware.
    pub fn set_gri_limit(&mut self, limit: bool) {
        self.gri_limit = limit;
    }

    /// Wrap every packet in a GNU Screen DCS pass-through envelope.
    pub fn set_penetrate_multiplexer(&mut self, penetrate: bool) {
        self.penetrate_multiplexer = penetrate;
    }

    /// Suppress the DCS introducer/terminator (macro bodies carry their
    /// own envelope).
    pub fn set_skip_dcs_envelope(&mut self, skip: bool) {
        self.skip_dcs_envelope = skip;
    }

    pub fn set_palette_type(&mut self, palette_type: PaletteType) {
        self.palette_type = palette_type;
    }

    pub fn set_encode_policy(&mut self, policy: EncodePolicy) {
        self.encode_policy = policy;
    }

    /// Emit index bit-planes for terminals that OR overlapping writes.
    pub fn set_ormode(&mut self, ormode: bool) {
        self.ormode = ormode;
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn put(&mut self, bytes: &[u8]) -> SixelResult<()> {
        self.buffer.extend_from_slice(bytes);
        self.advance()
    }

    fn putc(&mut self, byte: u8) -> SixelResult<()> {
        self.buffer.push(byte);
        self.advance()
    }

    fn put_number(&mut self, mut n: usize) -> SixelResult<()> {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        self.put(&digits[i..])
    }

    /// Flush full packets out of the buffer.
    fn advance(&mut self) -> SixelResult<()> {
        while self.buffer.len() >= PACKET_SIZE {
            if self.penetrate_multiplexer {
                self.write_penetrated(PACKET_SIZE)?;
            } else {
                self.writer.write_all(&self.buffer[..PACKET_SIZE])?;
            }
            self.buffer.drain(..PACKET_SIZE);
        }
        Ok(())
    }

    /// Drain everything left in the buffer to the writer.
    fn flush_buffer(&mut self) -> SixelResult<()> {
        if !self.buffer.is_empty() {
            if self.penetrate_multiplexer {
                let len = self.buffer.len();
                self.write_penetrated(len)?;
            } else {
                self.writer.write_all(&self.buffer)?;
            }
            self.buffer.clear();
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Split `len` buffered bytes into Screen-sized DCS envelopes.
    fn write_penetrated(&mut self, len: usize) -> SixelResult<()> {
        let chunk = SCREEN_PACKET_SIZE - DCS_START_7BIT.len() - DCS_END_7BIT.len();
        let mut pos = 0;
        while pos < len {
            let end = (pos + chunk).min(len);
            self.writer.write_all(DCS_START_7BIT)?;
            self.writer.write_all(&self.buffer[pos..end])?;
            self.writer.write_all(DCS_END_7BIT)?;
            pos = end;
        }
        Ok(())
    }

    /// Close out the pending DECGRI run.
    fn put_flash(&mut self) -> SixelResult<()> {
        if self.gri_limit {
            // Real VT hardware caps the repeat argument at 255.
            while self.save_count > 255 {
                self.put(b"!255")?;
                self.putc(self.save_pixel)?;
                self.save_count -= 255;
            }
        }
        if self.save_count > 3 {
            self.putc(b'!')?;
            self.put_number(self.save_count)?;
            self.putc(self.save_pixel)?;
        } else {
            for _ in 0..self.save_count {
                self.putc(self.save_pixel)?;
            }
        }
        self.save_pixel = 0;
        self.save_count = 0;
        Ok(())
    }

    /// Queue one sixel character (a 6-bit column mask), merging repeats.
    fn put_pixel(&mut self, bits: u8) -> SixelResult<()> {
        let ch = 0x3f + (bits & 0x3f);
        if ch == self.save_pixel {
            self.save_count += 1;
        } else {
            self.put_flash()?;
            self.save_pixel = ch;
            self.save_count = 1;
        }
        Ok(())
    }

    fn encode_header(&mut self, width: usize, height: usize, transparent: bool) -> SixelResult<()> {
        if !self.skip_dcs_envelope {
            if self.eight_bit {
                self.put(DCS_START_8BIT)?;
            } else {
                self.put(DCS_START_7BIT)?;
            }
        }
        if transparent {
            // P2 = 1 keeps unwritten pixels at the terminal background.
            self.put(b"0;1;0")?;
        }
        self.putc(b'q')?;

        // Raster attributes: 1:1 aspect plus the pixel extent.
        self.put(b"\"1;1;")?;
        self.put_number(width)?;
        self.putc(b';')?;
        self.put_number(height)?;
        Ok(())
    }

    fn put_palette_rgb(&mut self, n: usize, rgb: [u8; 3]) -> SixelResult<()> {
        self.putc(b'#')?;
        self.put_number(n)?;
        self.put(b";2;")?;
        self.put_number((rgb[0] as usize * 100 + 127) / 255)?;
        self.putc(b';')?;
        self.put_number((rgb[1] as usize * 100 + 127) / 255)?;
        self.putc(b';')?;
        self.put_number((rgb[2] as usize * 100 + 127) / 255)?;
        Ok(())
    }

    fn put_palette_hls(&mut self, n: usize, rgb: [u8; 3]) -> SixelResult<()> {
        let r = rgb[0] as i32;
        let g = rgb[1] as i32;
        let b = rgb[2] as i32;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let l = ((max + min) * 100 + 255) / 510;
        let mut h = 0;
        let mut s = 0;
        if max != min {
            s = if l < 50 {
                (max - min) * 100 / (max + min)
            } else {
                (max - min) * 100 / ((255 - max) + (255 - min))
            };
            // The SIXEL hue circle puts blue at 0 degrees.
            h = if r == max {
                120 + (g - b) * 60 / (max - min)
            } else if g == max {
                240 + (b - r) * 60 / (max - min)
            } else if r < g {
                360 + (r - g) * 60 / (max - min)
            } else {
                (r - g) * 60 / (max - min)
            };
        }
        self.putc(b'#')?;
        self.put_number(n)?;
        self.put(b";1;")?;
        self.put_number(h.rem_euclid(360) as usize)?;
        self.putc(b';')?;
        self.put_number(l as usize)?;
        self.putc(b';')?;
        self.put_number(s as usize)?;
        Ok(())
    }

    fn encode_palette(&mut self, image: &IndexImage, keycolor: Option<usize>) -> SixelResult<()> {
        let palette = &image.palette;
        for n in 0..palette.active() {
            if keycolor == Some(n) {
                continue;
            }
            if self.palette_type == PaletteType::Hls {
                self.put_palette_hls(n, palette.rgb(n))?;
            } else {
                self.put_palette_rgb(n, palette.rgb(n))?;
            }
        }
        Ok(())
    }

    /// Designate a color register unless it is already active.
    fn select_color(&mut self, pal: usize, monochrome_shortcut: bool) -> SixelResult<()> {
        if monochrome_shortcut {
            return Ok(());
        }
        if self.active_palette != pal as i32 {
            self.putc(b'#')?;
            self.put_number(pal)?;
            self.active_palette = pal as i32;
        }
        Ok(())
    }

    /// Collect the per-color runs of one band. With the `size` policy,
    /// gaps shorter than 10 columns are folded into the surrounding node
    /// so one register selection covers them.
    fn build_nodes(&self, map: &[u8], width: usize, ncolors: usize) -> Vec<SixelNode> {
        let merge_gaps = self.encode_policy != EncodePolicy::Fast;
        let mut nodes = Vec::new();
        for pal in 0..ncolors {
            let row = &map[pal * width..(pal + 1) * width];
            let mut sx = 0;
            while sx < width {
                if row[sx] == 0 {
                    sx += 1;
                    continue;
                }
                let mut mx = sx + 1;
                while mx < width {
                    if row[mx] != 0 {
                        mx += 1;
                        continue;
                    }
                    if !merge_gaps {
                        break;
                    }
                    let mut gap = 1;
                    while mx + gap < width && row[mx + gap] == 0 {
                        gap += 1;
                    }
                    if gap >= 10 || mx + gap >= width {
                        break;
                    }
                    mx += gap;
                }
                nodes.push(SixelNode {
                    pal,
                    sx,
                    mx,
                    map_start: pal * width,
                });
                sx = mx + 1;
            }
        }
        nodes
    }

    fn put_node(
        &mut self,
        map: &[u8],
        node: &SixelNode,
        x: &mut usize,
        monochrome_shortcut: bool,
    ) -> SixelResult<()> {
        self.select_color(node.pal, monochrome_shortcut)?;
        while *x < node.sx {
            self.put_pixel(0)?;
            *x += 1;
        }
        while *x < node.mx {
            self.put_pixel(map[node.map_start + *x])?;
            *x += 1;
        }
        self.put_flash()
    }

    /// Emit the banded image body.
    fn encode_body(
        &mut self,
        image: &IndexImage,
        keycolor: Option<usize>,
        cancel: Option<&AtomicBool>,
    ) -> SixelResult<()> {
        let width = image.width;
        let ncolors = image.palette.active();
        let monochrome_shortcut = ncolors == 2 && keycolor.is_some();
        let bands = image.height.div_ceil(6);
        let mut map = vec![0u8; ncolors * width];

        for band in 0..bands {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    self.put_flash()?;
                    self.abort_stream()?;
                    return Err(SixelError::Interrupted);
                }
            }

            if band > 0 {
                // DECGNL: advance to the next six-row band.
                self.putc(b'-')?;
            }

            let y0 = band * 6;
            let rows = (image.height - y0).min(6);
            map.fill(0);
            for row in 0..rows {
                let line = &image.indices[(y0 + row) * width..(y0 + row + 1) * width];
                for (x, &pal) in line.iter().enumerate() {
                    if keycolor == Some(pal as usize) {
                        continue;
                    }
                    map[pal as usize * width + x] |= 1 << row;
                }
            }

            if self.ormode {
                self.encode_band_ormode(&map, width, ncolors)?;
            } else {
                let nodes = self.build_nodes(&map, width, ncolors);
                let mut x = 0usize;
                for (i, node) in nodes.iter().enumerate() {
                    if i > 0 && node.sx < x {
                        // DECGCR: return to the left margin for the
                        // next color pass over this band.
                        self.putc(b'$')?;
                        x = 0;
                    }
                    self.put_node(&map, node, &mut x, monochrome_shortcut)?;
                }
            }
        }
        Ok(())
    }

    /// OR-mode band: one pass per index bit-plane, registers 1, 2, 4, ...
    /// An ORing terminal reassembles the palette index from the planes.
    fn encode_band_ormode(&mut self, map: &[u8], width: usize, ncolors: usize) -> SixelResult<()> {
        let planes = usize::BITS as usize - (ncolors.max(2) - 1).leading_zeros() as usize;
        let mut first = true;
        for plane in 0..planes {
            let mut column_mask = vec![0u8; width];
            let mut any = false;
            for pal in 0..ncolors {
                if pal & (1 << plane) == 0 {
                    continue;
                }
                for x in 0..width {
                    let bits = map[pal * width + x];
                    if bits != 0 {
                        column_mask[x] |= bits;
                        any = true;
                    }
                }
            }
            if !any {
                continue;
            }
            if !first {
                self.putc(b'$')?;
            }
            first = false;
            self.putc(b'#')?;
            self.put_number(1 << plane)?;
            self.active_palette = -1;
            for &bits in &column_mask {
                self.put_pixel(bits)?;
            }
            self.put_flash()?;
        }
        Ok(())
    }

    /// High-color emission: `pixels` is RGB888 already reduced to the
    /// 15bpp lattice. Every six-row band defines the registers it needs
    /// before painting, so the whole image is not limited to 256 colors.
    pub fn encode_high_color(
        &mut self,
        pixels: &[u8],
        width: usize,
        height: usize,
        cancel: Option<&AtomicBool>,
    ) -> SixelResult<()> {
        if width == 0 || height == 0 {
            return Err(SixelError::BadInput("empty high-color image".into()));
        }
        if width > SIXEL_OUTPUT_SIZE_LIMIT || height > SIXEL_OUTPUT_SIZE_LIMIT {
            return Err(SixelError::BadArgument(format!(
                "image {}x{} exceeds the SIXEL raster limit",
                width, height
            )));
        }

        self.active_palette = -1;
        self.save_pixel = 0;
        self.save_count = 0;
        self.encode_header(width, height, false)?;

        let bands = height.div_ceil(6);
        let mut register_of = vec![0u16; 1 << 15];
        let mut map = Vec::new();

        for band in 0..bands {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    self.put_flash()?;
                    self.abort_stream()?;
                    return Err(SixelError::Interrupted);
                }
            }
            if band > 0 {
                self.putc(b'-')?;
            }

            let y0 = band * 6;
            let rows = (height - y0).min(6);

            // First-seen register assignment for this band's colors;
            // overflow beyond 256 falls back to the nearest register.
            register_of.fill(0);
            let mut colors: Vec<[u8; 3]> = Vec::new();
            let mut indices = vec![0u8; rows * width];
            for row in 0..rows {
                for x in 0..width {
                    let base = ((y0 + row) * width + x) * 3;
                    let rgb = [pixels[base], pixels[base + 1], pixels[base + 2]];
                    let key = (((rgb[0] >> 3) as usize) << 10)
                        | (((rgb[1] >> 3) as usize) << 5)
                        | ((rgb[2] >> 3) as usize);
                    let register = if register_of[key] != 0 {
                        register_of[key] as usize - 1
                    } else if colors.len() < 256 {
                        colors.push(rgb);
                        register_of[key] = colors.len() as u16;
                        colors.len() - 1
                    } else {
                        nearest_register(&colors, rgb)
                    };
                    indices[row * width + x] = register as u8;
                }
            }

            for (n, &rgb) in colors.iter().enumerate() {
                self.put_palette_rgb(n, rgb)?;
            }
            self.active_palette = -1;

            map.clear();
            map.resize(colors.len() * width, 0u8);
            for row in 0..rows {
                for x in 0..width {
                    let pal = indices[row * width + x] as usize;
                    map[pal * width + x] |= 1 << row;
                }
            }

            let nodes = self.build_nodes(&map, width, colors.len());
            let mut x = 0usize;
            for (i, node) in nodes.iter().enumerate() {
                if i > 0 && node.sx < x {
                    self.putc(b'$')?;
                    x = 0;
                }
                self.put_node(&map, node, &mut x, false)?;
            }
        }
        self.encode_footer()
    }

    fn encode_footer(&mut self) -> SixelResult<()> {
        if !self.skip_dcs_envelope && !self.penetrate_multiplexer {
            if self.eight_bit {
                self.put(DCS_END_8BIT)?;
            } else {
                self.put(DCS_END_7BIT)?;
            }
        }
        self.flush_buffer()?;
        if self.penetrate_multiplexer && !self.skip_dcs_envelope {
            self.writer.write_all(DCS_END_7BIT)?;
            self.writer.flush()?;
        }
        Ok(())
    }

    /// Terminate a partially written stream: CAN followed by ST, so the
    /// terminal drops out of SIXEL mode cleanly.
    fn abort_stream(&mut self) -> SixelResult<()> {
        self.putc(CAN)?;
        if self.eight_bit {
            self.put(DCS_END_8BIT)?;
        } else {
            self.put(DCS_END_7BIT)?;
        }
        self.flush_buffer()
    }

    /// Encode a complete indexed image as one SIXEL stream.
    ///
    /// `keycolor` names the palette slot suppressed in the output (the
    /// transparent/background register).
    pub fn encode(
        &mut self,
        image: &IndexImage,
        keycolor: Option<usize>,
        cancel: Option<&AtomicBool>,
    ) -> SixelResult<()> {
        if image.width == 0 || image.height == 0 {
            return Err(SixelError::BadInput("empty index image".into()));
        }
        if image.width > SIXEL_OUTPUT_SIZE_LIMIT || image.height > SIXEL_OUTPUT_SIZE_LIMIT {
            return Err(SixelError::BadArgument(format!(
                "image {}x{} exceeds the SIXEL raster limit",
                image.width, image.height
            )));
        }
        if image.indices.len() != image.width * image.height {
            return Err(SixelError::LogicError(
                "index image size mismatch".into(),
            ));
        }
        trace!(
            "emitting {}x{} with {} colors",
            image.width,
            image.height,
            image.palette.active()
        );

        self.active_palette = -1;
        self.save_pixel = 0;
        self.save_count = 0;

        self.encode_header(image.width, image.height, keycolor.is_some())?;
        let monochrome_shortcut = image.palette.active() == 2 && keycolor.is_some();
        if !monochrome_shortcut {
            self.encode_palette(image, keycolor)?;
        }
        self.encode_body(image, keycolor, cancel)?;
        self.encode_footer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::Palette;
    use std::sync::Arc;

    fn image(indices: Vec<u8>, width: usize, height: usize, colors: Vec<u8>) -> IndexImage {
        let n = colors.len() / 3;
        IndexImage {
            indices,
            width,
            height,
            palette: Arc::new(Palette::new(colors, n).unwrap()),
        }
    }

    fn encode_to_vec(image: &IndexImage) -> Vec<u8> {
        let mut out = SixelOutput::new(Vec::new());
        out.encode(image, None, None).unwrap();
        out.into_inner()
    }

    #[test]
    fn stream_has_envelope_and_raster() {
        let img = image(vec![0], 1, 1, vec![255, 0, 0]);
        let bytes = encode_to_vec(&img);
        assert!(bytes.starts_with(b"\x1bPq\"1;1;1;1"));
        assert!(bytes.ends_with(b"\x1b\\"));
    }

    #[test]
    fn eight_bit_mode_uses_c1_controls() {
        let img = image(vec![0], 1, 1, vec![255, 0, 0]);
        let mut out = SixelOutput::new(Vec::new());
        out.set_8bit_mode(true);
        out.encode(&img, None, None).unwrap();
        let bytes = out.into_inner();
        assert_eq!(bytes[0], 0x90);
        assert_eq!(*bytes.last().unwrap(), 0x9c);
    }

    #[test]
    fn palette_section_scales_to_percent() {
        let img = image(vec![0], 1, 1, vec![255, 0, 128]);
        let bytes = encode_to_vec(&img);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("#0;2;100;0;50"), "{text}");
    }

    #[test]
    fn hls_palette_is_emitted_when_requested() {
        let img = image(vec![0], 1, 1, vec![255, 0, 0]);
        let mut out = SixelOutput::new(Vec::new());
        out.set_palette_type(PaletteType::Hls);
        out.encode(&img, None, None).unwrap();
        let text = String::from_utf8_lossy(&out.into_inner()).to_string();
        // Pure red: hue 120 on the SIXEL circle, lightness 50, full
        // saturation.
        assert!(text.contains("#0;1;120;50;100"), "{text}");
    }

    #[test]
    fn single_band_for_six_rows() {
        let img = image(vec![0; 6], 1, 6, vec![10, 20, 30]);
        let bytes = encode_to_vec(&img);
        // One band: no '-' separator, one full-height column (0x3f + 63).
        assert!(!bytes.windows(1).any(|w| w == b"-"));
        assert!(bytes.contains(&b'~'));
    }

    #[test]
    fn bands_are_separated_by_graphics_newline() {
        let img = image(vec![0; 7], 1, 7, vec![10, 20, 30]);
        let bytes = encode_to_vec(&img);
        assert_eq!(bytes.iter().filter(|&&b| b == b'-').count(), 1);
    }

    #[test]
    fn long_runs_use_decgri() {
        let img = image(vec![0; 100], 100, 1, vec![0, 0, 0]);
        let bytes = encode_to_vec(&img);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("!100@"), "{text}");
    }

    #[test]
    fn gri_limit_splits_long_runs() {
        let img = image(vec![0; 300], 300, 1, vec![0, 0, 0]);
        let mut out = SixelOutput::new(Vec::new());
        out.set_gri_limit(true);
        out.encode(&img, None, None).unwrap();
        let text = String::from_utf8_lossy(&out.into_inner()).to_string();
        assert!(text.contains("!255@"), "{text}");
        assert!(text.contains("!45@"), "{text}");
    }

    #[test]
    fn checkerboard_compresses_per_color() {
        // 16x12 checkerboard with 8-pixel tiles: two bands, two colors.
        let width = 16;
        let height = 12;
        let mut indices = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                indices.push(u8::from((x / 8 + y / 6) % 2 == 1));
            }
        }
        let img = image(
            indices,
            width,
            height,
            vec![0, 0, 0, 255, 255, 255],
        );
        let bytes = encode_to_vec(&img);
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches('-').count(), 1);
        assert!(text.contains("#0") && text.contains("#1"), "{text}");
        assert!(text.contains("!8~"), "{text}");
        // Only the second band needs a carriage return between colors.
        assert_eq!(text.matches('$').count(), 1);
        assert!(text.contains("!8?!8~"), "{text}");
    }

    #[test]
    fn keycolor_runs_are_suppressed() {
        let img = IndexImage {
            indices: vec![0, 1, 0, 1],
            width: 4,
            height: 1,
            palette: Arc::new(
                Palette::new(vec![9, 9, 9, 200, 200, 200, 1, 2, 3], 3)
                    .unwrap(),
            ),
        };
        let mut out = SixelOutput::new(Vec::new());
        out.encode(&img, Some(0), None).unwrap();
        let text = String::from_utf8_lossy(&out.into_inner()).to_string();
        // The key register is neither defined nor painted.
        assert!(text.contains("0;1;0"), "{text}");
        assert!(!text.contains("#0;2"), "{text}");
    }

    #[test]
    fn oversized_images_are_rejected() {
        let img = image(vec![0; 2], 2, 1, vec![0, 0, 0]);
        let mut bad = img.clone();
        bad.width = SIXEL_OUTPUT_SIZE_LIMIT + 1;
        let mut out = SixelOutput::new(Vec::new());
        match out.encode(&bad, None, None) {
            Err(SixelError::BadArgument(_)) => {}
            other => panic!("expected BadArgument, got {other:?}"),
        }
    }

    #[test]
    fn cancel_terminates_with_can_and_st() {
        let cancel = AtomicBool::new(true);
        let img = image(vec![0; 12], 1, 12, vec![0, 0, 0]);
        let mut out = SixelOutput::new(Vec::new());
        let result = out.encode(&img, None, Some(&cancel));
        assert!(matches!(result, Err(SixelError::Interrupted)));
        let bytes = out.into_inner();
        assert!(bytes.ends_with(&[CAN, 0x1b, b'\\']));
    }

    #[test]
    fn ormode_emits_bit_planes() {
        let img = image(
            vec![0, 1, 2, 3],
            4,
            1,
            vec![0, 0, 0, 80, 80, 80, 160, 160, 160, 255, 255, 255],
        );
        let mut out = SixelOutput::new(Vec::new());
        out.set_ormode(true);
        out.encode(&img, None, None).unwrap();
        let text = String::from_utf8_lossy(&out.into_inner()).to_string();
        // Registers 1 and 2 carry the two index planes.
        let body = text.split('q').nth(1).unwrap();
        assert!(body.contains("#1"), "{text}");
        assert!(body.contains("#2"), "{text}");
    }

    #[test]
    fn penetrate_mode_wraps_packets() {
        let img = image(vec![0; 600], 100, 6, vec![0, 0, 0]);
        let mut out = SixelOutput::new(Vec::new());
        out.set_penetrate_multiplexer(true);
        out.encode(&img, None, None).unwrap();
        let bytes = out.into_inner();
        let text: Vec<u8> = bytes.clone();
        // The outer stream is chopped into ESC P ... ESC \ envelopes.
        assert!(text.starts_with(b"\x1bP"));
        let count = bytes.windows(2).filter(|w| w == b"\x1bP").count();
        assert!(count >= 1);
        assert!(bytes.ends_with(b"\x1b\\"));
    }
}
