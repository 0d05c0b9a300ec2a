use thiserror::Error;

/// Errors surfaced by the block-coding core.
///
/// The MQ coder itself is infallible on encode; everything that can go wrong
/// is either a validation failure at an entry point or damage detected while
/// decoding a coded segment. `Truncated` and `MalformedBitstream` are
/// recoverable: the decoder still hands back a best-effort reconstruction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingError {
    #[error("Code-block dimensions out of range or area exceeds 4096")]
    InvalidBlockGeometry = 1,
    #[error("Bit depth must be in 1..=38")]
    InvalidBitDepth = 2,
    #[error("Malformed bitstream")]
    MalformedBitstream = 3,
    #[error("Coded segment truncated")]
    Truncated = 4,
    #[error("Parameter value outside accepted domain")]
    InvalidParameter = 5,
    #[error("Rate-distortion search failed to bracket the target")]
    ConvergenceFailure = 6,
    #[error("Code-block list is empty")]
    EmptyInput = 7,
    #[error("Total pixel count must be positive")]
    InvalidPixelCount = 8,
    #[error("Operation cancelled")]
    Cancelled = 9,
}
