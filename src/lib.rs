/*!
# ebcot-rs

`ebcot-rs` is a pure Rust implementation of the JPEG 2000 block-coding core
(ISO/IEC 15444-1): the MQ arithmetic coder, the three-pass bit-plane coding
machinery, the code-block container, and the PCRD-opt rate controller that
assembles coded blocks into quality layers.

The crate deliberately stops at the code-block boundary. Wavelet
transforms, quantization, codestream markers and file formats belong to the
surrounding codec; this crate consumes quantized coefficients and produces
coded segments plus the metadata a packet writer needs.

## Modules

- `mq_coder`: MQ arithmetic encoder/decoder with the Table C.2 state
  machine and three termination disciplines (Annex C).
- `bit_io`: raw bit I/O for the arithmetic-bypass coding passes (D.5).
- `context`: context labels from neighbourhood state and subband
  orientation (D.3), plus the per-block context array.
- `bit_plane_coder`: significance propagation, magnitude refinement and
  cleanup passes over 4-row stripes (Annex D).
- `code_block`: the code-block container, coding options, block-level
  encode/decode, batch encoding over a worker pool, and cancellation.
- `rate_control`: convex-hull reduction, Lagrangian slope search and
  quality-layer formation (PCRD-opt).
- `pool`: size-bucketed scratch buffers for per-block working state.

## Example

```
use ebcot_rs::{CodeBlock, EncodeOptions, Subband};

let mut coefficients = vec![0i64; 16];
coefficients[0] = 5;
coefficients[7] = -3;

let options = EncodeOptions::default();
let block = CodeBlock::encode(&coefficients, 4, 4, Subband::LL, 8, &options).unwrap();
let decoded = block.decode(8, &options).unwrap();
assert_eq!(decoded.coefficients, coefficients);
```
*/

pub mod bit_io;
pub mod bit_plane_coder;
pub mod code_block;
pub mod context;
pub mod error;
pub mod mq_coder;
pub mod pool;
pub mod rate_control;

pub use code_block::{
    encode_all, BlockCoder, BlockRequest, BlockStyle, CancelFlag, CodeBlock, CodingPass,
    DecodedBlock, EncodeOptions, PassKind,
};
pub use context::Subband;
pub use error::CodingError;
pub use mq_coder::Termination;
pub use pool::ScratchPool;
pub use rate_control::{
    allocate, DistortionEstimation, Layer, RateControlConfiguration, RateControlMode,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_roundtrip() {
        let coefficients: Vec<i64> = (0..64).map(|i| (i % 9) - 4).collect();
        let options = EncodeOptions::default();
        let block = CodeBlock::encode(&coefficients, 8, 8, Subband::LL, 8, &options).unwrap();
        let decoded = block.decode(8, &options).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.coefficients, coefficients);
    }
}
