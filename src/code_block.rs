//! Code-block container and block-level coding entry points.
//!
//! A [`CodeBlock`] holds one coded segment together with the metadata the
//! packet writer and the rate controller need: subband, geometry, pass
//! count, zero bit-plane count and the per-pass descriptors. Blocks are
//! independent work units; [`encode_all`] fans them out over a worker pool
//! where each worker owns its coder state and scratch buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;

use crate::bit_plane_coder::{decode_block, encode_block};
use crate::context::Subband;
use crate::error::CodingError;
use crate::mq_coder::Termination;
use crate::pool::ScratchPool;
use crate::rate_control::DistortionEstimation;

/// Smallest accepted code-block dimension.
pub const MIN_BLOCK_DIM: u32 = 4;
/// Largest accepted code-block dimension.
pub const MAX_BLOCK_DIM: u32 = 1024;
/// Largest accepted code-block area.
pub const MAX_BLOCK_AREA: u32 = 4096;
/// Largest accepted bit depth.
pub const MAX_BIT_DEPTH: u32 = 38;
/// Largest accepted guard-bit count.
pub const MAX_GUARD_BITS: u32 = 15;

bitflags! {
    /// Block-style flags, matching the SPcod code-block style bit-field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockStyle: u8 {
        /// Raw-code significance and refinement passes from pass 10 on.
        const SELECTIVE_BYPASS = 0x01;
        /// Re-initialise the context array after every coding pass.
        const RESET_CONTEXTS = 0x02;
        /// Terminate the coded segment after every coding pass.
        const TERMINATE_PER_PASS = 0x04;
        /// Suppress context contributions from the stripe below.
        const VERTICALLY_CAUSAL = 0x08;
        /// Always use the predictable termination discipline.
        const PREDICTABLE_TERMINATION = 0x10;
        /// Code a 1010 symbol with the uniform context after each cleanup.
        const SEGMENTATION_SYMBOLS = 0x20;
    }
}

/// The three coding-pass types of one bit-plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    SignificancePropagation,
    MagnitudeRefinement,
    Cleanup,
}

impl PassKind {
    /// Pass type at pass index `i`: a block always opens with a cleanup
    /// pass, then cycles significance propagation, refinement, cleanup.
    pub fn of_index(i: usize) -> Self {
        match i % 3 {
            0 => PassKind::Cleanup,
            1 => PassKind::SignificancePropagation,
            _ => PassKind::MagnitudeRefinement,
        }
    }
}

/// Rate/distortion descriptor of one coding pass. Truncation is only valid
/// on pass boundaries, so these are the units the rate controller works in.
#[derive(Debug, Clone, Copy)]
pub struct CodingPass {
    pub kind: PassKind,
    /// Coded bytes from the start of the segment through this pass.
    pub cumulative_bytes: usize,
    /// Cumulative squared-error reduction through this pass.
    pub cumulative_distortion: f64,
    /// Distortion reduction per byte contributed by this pass alone.
    pub slope: f64,
}

/// Cooperative cancellation flag, polled between coding passes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Options recognised by block encode and decode. Decode must see the same
/// style, termination and guard bits the encoder used; in a full codestream
/// these travel in the COD/COC markers.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub style: BlockStyle,
    pub termination: Termination,
    /// Extra high-order bit-planes reserved against DWT overflow.
    pub guard_bits: u32,
    pub distortion: DistortionEstimation,
    /// Record per-pass distortion figures; turn off when no rate control
    /// will run over the blocks.
    pub collect_distortion: bool,
    pub cancel: Option<CancelFlag>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            style: BlockStyle::empty(),
            termination: Termination::Default,
            guard_bits: 2,
            distortion: DistortionEstimation::default(),
            collect_distortion: true,
            cancel: None,
        }
    }
}

impl EncodeOptions {
    /// The termination discipline in effect; the block-style flag overrides
    /// the configured mode.
    pub fn effective_termination(&self) -> Termination {
        if self.style.contains(BlockStyle::PREDICTABLE_TERMINATION) {
            Termination::Predictable
        } else {
            self.termination
        }
    }
}

/// Guard-bit count recommended for a given bit depth.
pub fn recommended_guard_bits(bit_depth: u32) -> u32 {
    if bit_depth > 16 {
        7
    } else if bit_depth > 12 {
        4
    } else {
        2
    }
}

/// Result of decoding a block: the reconstruction, plus the recoverable
/// error when the segment was damaged. A truncated or malformed segment
/// still yields the best-effort coefficients; callers may substitute a
/// zero block instead.
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub coefficients: Vec<i64>,
    pub error: Option<CodingError>,
}

impl DecodedBlock {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// The reconstruction, or the recoverable error if there was one.
    pub fn into_result(self) -> Result<Vec<i64>, CodingError> {
        match self.error {
            None => Ok(self.coefficients),
            Some(err) => Err(err),
        }
    }
}

fn validate_geometry(width: u32, height: u32, len: usize) -> Result<(), CodingError> {
    let dims = MIN_BLOCK_DIM..=MAX_BLOCK_DIM;
    if !dims.contains(&width) || !dims.contains(&height) || width * height > MAX_BLOCK_AREA {
        return Err(CodingError::InvalidBlockGeometry);
    }
    if len != (width * height) as usize {
        return Err(CodingError::InvalidBlockGeometry);
    }
    Ok(())
}

fn validate_parameters(bit_depth: u32, options: &EncodeOptions) -> Result<(), CodingError> {
    if bit_depth == 0 || bit_depth > MAX_BIT_DEPTH {
        return Err(CodingError::InvalidBitDepth);
    }
    if options.guard_bits > MAX_GUARD_BITS {
        return Err(CodingError::InvalidParameter);
    }
    Ok(())
}

/// One entropy-coded code-block: the coded segment and its signalled
/// metadata.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    subband: Subband,
    width: u32,
    height: u32,
    data: Vec<u8>,
    zero_bit_planes: u32,
    passes: Vec<CodingPass>,
}

impl CodeBlock {
    /// Encode a coefficient array into a code-block.
    pub fn encode(
        coefficients: &[i64],
        width: u32,
        height: u32,
        subband: Subband,
        bit_depth: u32,
        options: &EncodeOptions,
    ) -> Result<Self, CodingError> {
        Self::encode_pooled(coefficients, width, height, subband, bit_depth, options, None)
    }

    fn encode_pooled(
        coefficients: &[i64],
        width: u32,
        height: u32,
        subband: Subband,
        bit_depth: u32,
        options: &EncodeOptions,
        pool: Option<&ScratchPool>,
    ) -> Result<Self, CodingError> {
        validate_geometry(width, height, coefficients.len())?;
        validate_parameters(bit_depth, options)?;
        let total_planes = bit_depth + options.guard_bits;
        let outcome =
            encode_block(coefficients, width, height, subband, total_planes, options, pool)?;
        Ok(Self {
            subband,
            width,
            height,
            data: outcome.data,
            zero_bit_planes: outcome.zero_bit_planes,
            passes: outcome.passes,
        })
    }

    /// Rebuild a block from metadata signalled out-of-band, e.g. by a
    /// packet reader. `per_pass_bytes` carries the cumulative byte offset
    /// of every pass; without it the block decodes only in the
    /// single-segment styles, and truncation cannot be detected.
    pub fn from_parts(
        subband: Subband,
        width: u32,
        height: u32,
        data: Vec<u8>,
        zero_bit_planes: u32,
        pass_count: usize,
        per_pass_bytes: Option<&[usize]>,
    ) -> Result<Self, CodingError> {
        let dims = MIN_BLOCK_DIM..=MAX_BLOCK_DIM;
        if !dims.contains(&width) || !dims.contains(&height) || width * height > MAX_BLOCK_AREA {
            return Err(CodingError::InvalidBlockGeometry);
        }
        if let Some(bytes) = per_pass_bytes {
            if bytes.len() != pass_count {
                return Err(CodingError::InvalidParameter);
            }
        }
        let passes = (0..pass_count)
            .map(|i| CodingPass {
                kind: PassKind::of_index(i),
                cumulative_bytes: per_pass_bytes.map_or(data.len(), |b| b[i]),
                cumulative_distortion: 0.0,
                slope: 0.0,
            })
            .collect();
        Ok(Self {
            subband,
            width,
            height,
            data,
            zero_bit_planes,
            passes,
        })
    }

    /// Build a block around an explicit pass table. Test-only: production
    /// blocks come from `encode` or `from_parts`.
    #[cfg(test)]
    pub(crate) fn from_pass_table(
        subband: Subband,
        width: u32,
        height: u32,
        data: Vec<u8>,
        zero_bit_planes: u32,
        passes: Vec<CodingPass>,
    ) -> Self {
        Self {
            subband,
            width,
            height,
            data,
            zero_bit_planes,
            passes,
        }
    }

    /// Decode the block back into coefficients. `bit_depth` and `options`
    /// must match the encoder's.
    pub fn decode(
        &self,
        bit_depth: u32,
        options: &EncodeOptions,
    ) -> Result<DecodedBlock, CodingError> {
        self.decode_pooled(bit_depth, options, None)
    }

    fn decode_pooled(
        &self,
        bit_depth: u32,
        options: &EncodeOptions,
        pool: Option<&ScratchPool>,
    ) -> Result<DecodedBlock, CodingError> {
        validate_parameters(bit_depth, options)?;
        let total_planes = bit_depth + options.guard_bits;
        let bounds: Vec<usize> = self.passes.iter().map(|p| p.cumulative_bytes).collect();
        let bounds = (!bounds.is_empty()).then_some(bounds);
        let (coefficients, error) = decode_block(
            &self.data,
            self.width,
            self.height,
            self.subband,
            total_planes,
            self.zero_bit_planes,
            self.passes.len(),
            bounds.as_deref(),
            options,
            pool,
        )?;
        Ok(DecodedBlock {
            coefficients,
            error,
        })
    }

    /// The prefix of the coded segment covering the first `pass_index`
    /// passes. Never mutates the block; an out-of-range index clamps to
    /// the whole segment.
    pub fn truncate_at(&self, pass_index: usize) -> &[u8] {
        if pass_index == 0 {
            return &[];
        }
        let end = self
            .passes
            .get(pass_index - 1)
            .map_or(self.data.len(), |p| p.cumulative_bytes.min(self.data.len()));
        &self.data[..end]
    }

    pub fn subband(&self) -> Subband {
        self.subband
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn area(&self) -> usize {
        (self.width * self.height) as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn zero_bit_planes(&self) -> u32 {
        self.zero_bit_planes
    }

    pub fn passes(&self) -> &[CodingPass] {
        &self.passes
    }

    pub fn per_pass_slopes(&self) -> Vec<f64> {
        self.passes.iter().map(|p| p.slope).collect()
    }
}

/// A reusable block coder owning a scratch pool, one per worker. Repeated
/// encodes recycle the per-coefficient state arrays instead of
/// re-allocating them.
#[derive(Debug, Clone, Default)]
pub struct BlockCoder {
    pool: ScratchPool,
}

impl BlockCoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(pool: ScratchPool) -> Self {
        Self { pool }
    }

    pub fn encode(
        &self,
        coefficients: &[i64],
        width: u32,
        height: u32,
        subband: Subband,
        bit_depth: u32,
        options: &EncodeOptions,
    ) -> Result<CodeBlock, CodingError> {
        CodeBlock::encode_pooled(
            coefficients,
            width,
            height,
            subband,
            bit_depth,
            options,
            Some(&self.pool),
        )
    }

    pub fn decode(
        &self,
        block: &CodeBlock,
        bit_depth: u32,
        options: &EncodeOptions,
    ) -> Result<DecodedBlock, CodingError> {
        block.decode_pooled(bit_depth, options, Some(&self.pool))
    }
}

/// One block-encode work unit for [`encode_all`].
#[derive(Debug, Clone, Copy)]
pub struct BlockRequest<'a> {
    pub coefficients: &'a [i64],
    pub width: u32,
    pub height: u32,
    pub subband: Subband,
}

/// Encode independent blocks on up to `workers` threads. Every worker owns
/// its coder, context array and scratch pool; no state is shared between
/// blocks. Results come back in request order and the first error
/// (including `Cancelled`) wins.
pub fn encode_all(
    requests: &[BlockRequest<'_>],
    bit_depth: u32,
    options: &EncodeOptions,
    workers: usize,
) -> Result<Vec<CodeBlock>, CodingError> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    let workers = workers.max(1).min(requests.len());
    debug!("encoding {} blocks on {} workers", requests.len(), workers);

    let mut results: Vec<Result<CodeBlock, CodingError>> =
        (0..requests.len()).map(|_| Err(CodingError::Cancelled)).collect();
    let chunk = requests.len().div_ceil(workers);
    std::thread::scope(|scope| {
        for (req_chunk, res_chunk) in requests.chunks(chunk).zip(results.chunks_mut(chunk)) {
            scope.spawn(move || {
                let coder = BlockCoder::new();
                for (req, slot) in req_chunk.iter().zip(res_chunk.iter_mut()) {
                    *slot = coder.encode(
                        req.coefficients,
                        req.width,
                        req.height,
                        req.subband,
                        bit_depth,
                        options,
                    );
                }
            });
        }
    });
    results.into_iter().collect()
}
