//! # sixelkit
//!
//! A pure Rust SIXEL encoding pipeline for VT340-class terminals.
//!
//! The crate owns the four stages that turn a decoded RGB(A) frame into a
//! SIXEL byte stream:
//!
//! - **Color quantization** ([`quant`]): median-cut and k-means palette
//!   construction with optional over-split/merge refinement
//! - **Error diffusion** ([`dither`]): a closed set of diffusion kernels,
//!   raster/serpentine scan orders and direct/carry error propagation
//! - **Stream emission** ([`output`]): run-length encoded six-row bands,
//!   7/8-bit envelopes, OR-mode and macro replay
//! - **Orchestration** ([`encoder`]): scaling, cropping, colorspace
//!   conversion and palette/dither caching behind one configuration object
//!
//! Image decoding, CLI handling and terminal probing are left to callers;
//! frames come in as raw pixel buffers and bytes go out through any
//! [`std::io::Write`].
//!
//! ## Quick start
//!
//! ```
//! use sixelkit::encoder::Encoder;
//! use sixelkit::frame::Frame;
//! use sixelkit::pixelformat::PixelFormat;
//!
//! let pixels = vec![255u8, 0, 0, 0, 255, 0]; // red, green
//! let frame = Frame::new(pixels, 2, 1, PixelFormat::Rgb888)?;
//! let mut out = Vec::new();
//! let mut encoder = Encoder::new();
//! encoder.encode_frame(&frame, &mut out)?;
//! assert!(out.starts_with(b"\x1bP"));
//! # Ok::<(), sixelkit::SixelError>(())
//! ```

use thiserror::Error;

pub mod color;
pub mod colorspace;
pub mod decoder;
pub mod dither;
pub mod encoder;
pub mod frame;
pub mod options;
pub mod output;
pub mod palette;
pub mod pixelformat;
pub mod quant;
pub mod resample;

pub use decoder::{sixel_decode, DecodedImage};
pub use dither::Dither;
pub use encoder::{Encoder, EncoderConfig};
pub use frame::Frame;
pub use options::OptionFlag;
pub use output::SixelOutput;
pub use palette::Palette;
pub use pixelformat::PixelFormat;

/// Maximum number of color registers a SIXEL palette can define.
pub const SIXEL_PALETTE_MAX: usize = 256;

/// Largest width or height the emitter accepts; the raster attribute
/// parameters of the wire format are capped at this value.
pub const SIXEL_OUTPUT_SIZE_LIMIT: usize = 65535;

pub(crate) const SIXEL_WIDTH_LIMIT: usize = 1000000;
pub(crate) const SIXEL_HEIGHT_LIMIT: usize = 1000000;

/// Errors that can occur while building palettes, dithering or emitting
/// SIXEL data.
///
/// No error is recovered locally: every failure aborts the current encode
/// call and surfaces here.
#[derive(Debug, Error)]
pub enum SixelError {
    /// Invalid option value or malformed parameter
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// Memory exhaustion while building a palette or index image
    #[error("allocation failed: {0}")]
    BadAllocation(String),

    /// Empty frame, zero-dimension image or unparsable palette file
    #[error("bad input: {0}")]
    BadInput(String),

    /// Short write or other I/O failure; the low byte of
    /// [`SixelError::errno`] carries the host errno
    #[error("runtime error: {0}")]
    RuntimeError(#[from] std::io::Error),

    /// Internal consistency violation; indicates a bug
    #[error("logic error: {0}")]
    LogicError(String),

    /// The cancel flag was observed; the stream has been terminated safely
    #[error("interrupted")]
    Interrupted,

    /// Option accepted syntactically but unsupported in this build
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl SixelError {
    /// Host errno carried by a runtime error, masked to the low 8 bits.
    /// Zero for every other variant.
    pub fn errno(&self) -> i32 {
        match self {
            SixelError::RuntimeError(e) => e.raw_os_error().unwrap_or(0) & 0xff,
            _ => 0,
        }
    }
}

/// Result type for SIXEL operations.
pub type SixelResult<T> = std::result::Result<T, SixelError>;
