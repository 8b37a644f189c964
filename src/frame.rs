//! Input frames and the encoder's mutable working copy.

use crate::colorspace;
use crate::options::{Colorspace, ResampleMethod};
use crate::pixelformat::{normalize_to_rgb888, PixelFormat};
use crate::resample;
use crate::{SixelError, SixelResult, SIXEL_HEIGHT_LIMIT, SIXEL_WIDTH_LIMIT};

/// An immutable view of one decoded image.
///
/// Frames are produced by a loader collaborator; the encoder copies what
/// it needs and never mutates the original. Multi-frame sources hand over
/// one `Frame` per animation step with `frame_no`/`loop_no` advancing.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Vec<u8>,
    width: usize,
    height: usize,
    format: PixelFormat,
    colorspace: Colorspace,
    palette: Option<Vec<u8>>,
    transparent: Option<u8>,
    frame_no: usize,
    loop_no: usize,
    multiframe: bool,
    /// Delay until the next frame, in centiseconds
    delay: u32,
}

impl Frame {
    /// Wrap a pixel buffer. The buffer must hold exactly the bytes the
    /// format requires for `width` x `height`.
    pub fn new(
        pixels: Vec<u8>,
        width: usize,
        height: usize,
        format: PixelFormat,
    ) -> SixelResult<Self> {
        if width == 0 || height == 0 {
            return Err(SixelError::BadInput(format!(
                "frame has zero dimension: {}x{}",
                width, height
            )));
        }
        if width > SIXEL_WIDTH_LIMIT || height > SIXEL_HEIGHT_LIMIT {
            return Err(SixelError::BadInput(format!(
                "frame too large: {}x{}",
                width, height
            )));
        }
        let expected = format.buffer_len(width, height);
        if pixels.len() != expected {
            return Err(SixelError::BadInput(format!(
                "pixel buffer holds {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }
        Ok(Frame {
            pixels,
            width,
            height,
            format,
            colorspace: Colorspace::Gamma,
            palette: None,
            transparent: None,
            frame_no: 0,
            loop_no: 0,
            multiframe: false,
            delay: 0,
        })
    }

    /// Attach the palette of a `PAL*` frame (RGB triples).
    pub fn with_palette(mut self, palette: Vec<u8>) -> Self {
        self.palette = Some(palette);
        self
    }

    /// Mark one palette slot as transparent.
    pub fn with_transparent(mut self, index: u8) -> Self {
        self.transparent = Some(index);
        self
    }

    /// Tag the colorspace the pixel data is stored in.
    pub fn with_colorspace(mut self, colorspace: Colorspace) -> Self {
        self.colorspace = colorspace;
        self
    }

    /// Set animation bookkeeping for multi-frame sources.
    pub fn with_animation(mut self, frame_no: usize, loop_no: usize, delay: u32) -> Self {
        self.frame_no = frame_no;
        self.loop_no = loop_no;
        self.multiframe = true;
        self.delay = delay;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    pub fn palette(&self) -> Option<&[u8]> {
        self.palette.as_deref()
    }

    pub fn transparent(&self) -> Option<u8> {
        self.transparent
    }

    pub fn frame_no(&self) -> usize {
        self.frame_no
    }

    pub fn loop_no(&self) -> usize {
        self.loop_no
    }

    pub fn is_multiframe(&self) -> bool {
        self.multiframe
    }

    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Per-pixel opacity for alpha formats: alpha >= 128 is opaque.
    /// `None` when the format has no alpha channel.
    pub fn opacity_mask(&self) -> Option<Vec<bool>> {
        if !self.format.has_alpha() {
            return None;
        }
        let alpha_index = match self.format {
            PixelFormat::Argb8888 => 0,
            _ => 3,
        };
        Some(
            self.pixels
                .chunks_exact(4)
                .map(|p| p[alpha_index] >= 128)
                .collect(),
        )
    }
}

/// The encoder's mutable working copy: interleaved RGB888 plus the
/// opacity plane, resized and cropped in place as the pipeline runs.
#[derive(Debug, Clone)]
pub(crate) struct WorkingImage {
    pub pixels: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub colorspace: Colorspace,
    pub opacity: Option<Vec<bool>>,
}

impl WorkingImage {
    pub fn from_frame(frame: &Frame) -> SixelResult<Self> {
        let pixels = normalize_to_rgb888(
            frame.pixels(),
            frame.format(),
            frame.width(),
            frame.height(),
            frame.palette(),
        )?;
        Ok(WorkingImage {
            pixels,
            width: frame.width(),
            height: frame.height(),
            colorspace: frame.colorspace(),
            opacity: frame.opacity_mask(),
        })
    }

    /// Clip to the intersection of the requested rectangle and the image.
    /// A rectangle fully outside the bounds leaves the image untouched.
    pub fn clip(&mut self, x: usize, y: usize, mut width: usize, mut height: usize) {
        if x >= self.width || y >= self.height {
            return;
        }
        width = width.min(self.width - x);
        height = height.min(self.height - y);
        if width == 0 || height == 0 {
            return;
        }

        let mut pixels = Vec::with_capacity(width * height * 3);
        let mut opacity = self.opacity.as_ref().map(|_| Vec::with_capacity(width * height));
        for row in y..y + height {
            let start = (row * self.width + x) * 3;
            pixels.extend_from_slice(&self.pixels[start..start + width * 3]);
            if let (Some(out), Some(src)) = (opacity.as_mut(), self.opacity.as_ref()) {
                let start = row * self.width + x;
                out.extend_from_slice(&src[start..start + width]);
            }
        }

        self.pixels = pixels;
        self.opacity = opacity;
        self.width = width;
        self.height = height;
    }

    /// Resize with the given filter. The opacity plane is resampled with
    /// nearest neighbor so partial coverage never invents transparency.
    pub fn resize(&mut self, width: usize, height: usize, method: ResampleMethod) {
        if width == self.width && height == self.height {
            return;
        }
        self.pixels = resample::resize_rgb888(
            &self.pixels,
            self.width,
            self.height,
            width,
            height,
            method,
        );
        if let Some(opacity) = &self.opacity {
            self.opacity = Some(resample::resize_mask_nearest(
                opacity,
                self.width,
                self.height,
                width,
                height,
            ));
        }
        self.width = width;
        self.height = height;
    }

    pub fn ensure_colorspace(&mut self, target: Colorspace) {
        colorspace::convert_buffer(&mut self.pixels, self.colorspace, target);
        self.colorspace = target;
    }
}
