//! Bit-plane coding of code-blocks (Annex D, EBCOT Tier-1).
//!
//! A code-block's magnitudes are coded bit-plane by bit-plane, from the
//! highest non-zero plane downward. Every plane below the first is covered
//! by three passes over the 4-row stripe scan: significance propagation,
//! magnitude refinement, cleanup. The first plane collapses into a single
//! cleanup pass, so a block coded over `n` planes carries `3n - 2` passes.
//!
//! The encoder records one [`CodingPass`] descriptor per pass (cumulative
//! bytes, cumulative distortion reduction, slope) for the rate controller.

use log::{debug, warn};

use crate::bit_io::{RawBitReader, RawBitWriter};
use crate::code_block::{BlockStyle, CodingPass, EncodeOptions, PassKind};
use crate::context::{
    magnitude_refinement_label, sign_coding_label, zero_coding_label, ContextArray, Subband,
    CTX_RUN, CTX_UNIFORM,
};
use crate::error::CodingError;
use crate::mq_coder::{MqDecoder, MqEncoder};
use crate::pool::{ScratchBuf, ScratchPool};

// Per-coefficient state flags.
const SIG: u8 = 1 << 0;
/// Coded by the significance pass of the current bit-plane.
const CODED: u8 = 1 << 1;
const REFINED: u8 = 1 << 2;
const NEG: u8 = 1 << 3;

/// True when coding pass `i` is raw-coded under the selective bypass rule:
/// from pass 10 onward, significance and refinement passes skip the MQ
/// coder (D.6).
pub(crate) fn is_raw_pass(style: BlockStyle, i: usize) -> bool {
    style.contains(BlockStyle::SELECTIVE_BYPASS) && i >= 10 && i % 3 != 0
}

/// True when the coded segment is terminated at the end of pass `i`. The
/// final pass always terminates; `TERMINATE_PER_PASS` terminates all of
/// them; under selective bypass a termination falls after the cleanup pass
/// preceding a raw pair and after each raw refinement pass (Table D.9).
pub(crate) fn is_terminated_pass(style: BlockStyle, i: usize, pass_count: usize) -> bool {
    if i + 1 == pass_count || style.contains(BlockStyle::TERMINATE_PER_PASS) {
        return true;
    }
    style.contains(BlockStyle::SELECTIVE_BYPASS) && i >= 9 && (i % 3 == 0 || i % 3 == 2)
}

/// Significance/sign state of one code-block plus the neighbourhood
/// queries the context model is fed from. Out-of-block neighbours read as
/// permanently insignificant; in vertically-causal mode the stripe below
/// the current one is suppressed as well.
struct BlockState {
    width: u32,
    height: u32,
    flags: ScratchBuf,
    causal: bool,
}

impl BlockState {
    fn new(width: u32, height: u32, causal: bool, pool: Option<&ScratchPool>) -> Self {
        let area = (width * height) as usize;
        let flags = match pool {
            Some(pool) => pool.acquire(area),
            None => ScratchBuf::detached(area),
        };
        Self {
            width,
            height,
            flags,
            causal,
        }
    }

    #[inline]
    fn idx(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    #[inline]
    fn sig_at(&self, x: i64, y: i64) -> u8 {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return 0;
        }
        (self.flags[(y as u32 * self.width + x as u32) as usize] & SIG != 0) as u8
    }

    /// Sign contribution of a neighbour: 0 when insignificant, otherwise
    /// +1 or -1 (Table D.2).
    #[inline]
    fn sign_at(&self, x: i64, y: i64) -> i8 {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return 0;
        }
        let f = self.flags[(y as u32 * self.width + x as u32) as usize];
        if f & SIG == 0 {
            0
        } else if f & NEG != 0 {
            -1
        } else {
            1
        }
    }

    /// The row below `y` belongs to the next stripe when `y + 1` is a
    /// multiple of four.
    #[inline]
    fn suppress_below(&self, y: u32) -> bool {
        self.causal && (y + 1) % 4 == 0
    }

    #[inline]
    fn h_count(&self, x: u32, y: u32) -> u8 {
        let (x, y) = (i64::from(x), i64::from(y));
        self.sig_at(x - 1, y) + self.sig_at(x + 1, y)
    }

    #[inline]
    fn v_count(&self, x: u32, y: u32) -> u8 {
        let below = if self.suppress_below(y) {
            0
        } else {
            self.sig_at(i64::from(x), i64::from(y) + 1)
        };
        self.sig_at(i64::from(x), i64::from(y) - 1) + below
    }

    #[inline]
    fn d_count(&self, x: u32, y: u32) -> u8 {
        let (x, y) = (i64::from(x), i64::from(y));
        let upper = self.sig_at(x - 1, y - 1) + self.sig_at(x + 1, y - 1);
        let lower = if self.suppress_below(y as u32) {
            0
        } else {
            self.sig_at(x - 1, y + 1) + self.sig_at(x + 1, y + 1)
        };
        upper + lower
    }

    #[inline]
    fn neighbourhood(&self, x: u32, y: u32) -> u8 {
        self.h_count(x, y) + self.v_count(x, y) + self.d_count(x, y)
    }

    #[inline]
    fn zc_label(&self, subband: Subband, x: u32, y: u32) -> usize {
        zero_coding_label(subband, self.h_count(x, y), self.v_count(x, y), self.d_count(x, y))
    }

    #[inline]
    fn sc_label(&self, x: u32, y: u32) -> (usize, u8) {
        let (xi, yi) = (i64::from(x), i64::from(y));
        let h = (i32::from(self.sign_at(xi - 1, yi)) + i32::from(self.sign_at(xi + 1, yi)))
            .clamp(-1, 1);
        let below = if self.suppress_below(y) {
            0
        } else {
            i32::from(self.sign_at(xi, yi + 1))
        };
        let v = (i32::from(self.sign_at(xi, yi - 1)) + below).clamp(-1, 1);
        sign_coding_label(h as i8, v as i8)
    }

    #[inline]
    fn mr_label(&self, x: u32, y: u32) -> usize {
        let refined = self.flags[self.idx(x, y)] & REFINED != 0;
        magnitude_refinement_label(refined, self.neighbourhood(x, y) > 0)
    }

    /// Forget the coded-this-plane marks at the end of a cleanup pass.
    fn clear_coded(&mut self) {
        for f in self.flags.iter_mut() {
            *f &= !CODED;
        }
    }
}

enum PassCoder {
    Mq(MqEncoder),
    Raw(RawBitWriter),
}

impl PassCoder {
    fn pending_len(&self) -> usize {
        match self {
            PassCoder::Mq(m) => m.pending_len(),
            PassCoder::Raw(r) => r.pending_len(),
        }
    }
}

enum PassDecoder<'a> {
    Mq(MqDecoder<'a>),
    Raw(RawBitReader<'a>),
}

/// Squared-error reduction of revealing the significance of a coefficient
/// with magnitude `mag` at `plane`, under the selected estimator.
fn significance_distortion(
    estimator: crate::rate_control::DistortionEstimation,
    gain: f64,
    mag: u64,
    plane: u32,
) -> f64 {
    use crate::rate_control::DistortionEstimation::*;
    let step = (1u64 << plane) as f64;
    match estimator {
        Simplified => step * step,
        NormBased => gain * step * step,
        MseBased => {
            let m = mag as f64;
            let after = m - step;
            m * m - after * after
        }
    }
}

/// Squared-error reduction of a refinement bit `bit` at `plane`.
fn refinement_distortion(
    estimator: crate::rate_control::DistortionEstimation,
    gain: f64,
    mag: u64,
    plane: u32,
    bit: u8,
) -> f64 {
    use crate::rate_control::DistortionEstimation::*;
    let step = (1u64 << plane) as f64;
    match estimator {
        Simplified => {
            if bit == 1 {
                step * step
            } else {
                0.0
            }
        }
        NormBased => {
            if bit == 1 {
                gain * step * step
            } else {
                0.0
            }
        }
        MseBased => {
            let m = mag as f64;
            let before = (mag >> (plane + 1) << (plane + 1)) as f64;
            let after = (mag >> plane << plane) as f64;
            (m - before) * (m - before) - (m - after) * (m - after)
        }
    }
}

/// Output of one block-encode: the concatenated coded segments plus the
/// per-pass descriptors and the zero bit-plane count.
pub(crate) struct EncodeOutcome {
    pub data: Vec<u8>,
    pub passes: Vec<CodingPass>,
    pub zero_bit_planes: u32,
}

struct BlockEncoder<'a> {
    mags: &'a [u64],
    negs: &'a [bool],
    st: BlockState,
    contexts: ContextArray,
    subband: Subband,
    estimator: crate::rate_control::DistortionEstimation,
    collect_distortion: bool,
    gain: f64,
}

impl BlockEncoder<'_> {
    fn significance_delta(&self, i: usize, plane: u32) -> f64 {
        if self.collect_distortion {
            significance_distortion(self.estimator, self.gain, self.mags[i], plane)
        } else {
            0.0
        }
    }

    fn refinement_delta(&self, i: usize, plane: u32, bit: u8) -> f64 {
        if self.collect_distortion {
            refinement_distortion(self.estimator, self.gain, self.mags[i], plane, bit)
        } else {
            0.0
        }
    }
}

impl BlockEncoder<'_> {
    fn code_sign(&mut self, coder: &mut PassCoder, x: u32, y: u32, i: usize) {
        let neg = (self.negs[i]) as u8;
        match coder {
            // Raw-coded signs carry no prediction flip.
            PassCoder::Raw(r) => r.put_bit(neg),
            PassCoder::Mq(m) => {
                let (label, flip) = self.st.sc_label(x, y);
                m.encode(neg ^ flip, self.contexts.get_mut(label));
            }
        }
    }

    /// Significance propagation (D.3.1): insignificant coefficients with a
    /// non-empty neighbourhood.
    fn significance_pass(&mut self, coder: &mut PassCoder, plane: u32) -> f64 {
        let mut delta = 0.0;
        for stripe in (0..self.st.height).step_by(4) {
            for x in 0..self.st.width {
                for y in stripe..(stripe + 4).min(self.st.height) {
                    let i = self.st.idx(x, y);
                    if self.st.flags[i] & SIG != 0 || self.st.neighbourhood(x, y) == 0 {
                        continue;
                    }
                    let bit = ((self.mags[i] >> plane) & 1) as u8;
                    match coder {
                        PassCoder::Raw(r) => r.put_bit(bit),
                        PassCoder::Mq(m) => {
                            let label = self.st.zc_label(self.subband, x, y);
                            m.encode(bit, self.contexts.get_mut(label));
                        }
                    }
                    self.st.flags[i] |= CODED;
                    if bit == 1 {
                        delta += self.significance_delta(i, plane);
                        self.code_sign(coder, x, y, i);
                        self.st.flags[i] |= SIG;
                    }
                }
            }
        }
        delta
    }

    /// Magnitude refinement (D.3.3): coefficients significant before this
    /// bit-plane.
    fn refinement_pass(&mut self, coder: &mut PassCoder, plane: u32) -> f64 {
        let mut delta = 0.0;
        for stripe in (0..self.st.height).step_by(4) {
            for x in 0..self.st.width {
                for y in stripe..(stripe + 4).min(self.st.height) {
                    let i = self.st.idx(x, y);
                    if self.st.flags[i] & SIG == 0 || self.st.flags[i] & CODED != 0 {
                        continue;
                    }
                    let bit = ((self.mags[i] >> plane) & 1) as u8;
                    match coder {
                        PassCoder::Raw(r) => r.put_bit(bit),
                        PassCoder::Mq(m) => {
                            let label = self.st.mr_label(x, y);
                            m.encode(bit, self.contexts.get_mut(label));
                        }
                    }
                    delta += self.refinement_delta(i, plane, bit);
                    self.st.flags[i] |= REFINED;
                }
            }
        }
        delta
    }

    /// Cleanup (D.3.4): everything the other two passes left, with
    /// run-length predication over all-quiet stripe columns.
    fn cleanup_pass(&mut self, coder: &mut PassCoder, plane: u32) -> f64 {
        let mut delta = 0.0;
        let height = self.st.height;
        for stripe in (0..height).step_by(4) {
            let stripe_end = (stripe + 4).min(height);
            for x in 0..self.st.width {
                let mut y = stripe;
                let first = self.st.idx(x, stripe);
                let run_eligible = stripe + 4 <= height
                    && self.st.flags[first] & (SIG | CODED) == 0
                    && (0..4).all(|k| self.st.neighbourhood(x, stripe + k) == 0);
                if run_eligible {
                    let run = (0..4u32)
                        .find(|&k| (self.mags[self.st.idx(x, stripe + k)] >> plane) & 1 == 1);
                    match run {
                        None => {
                            // Whole column stays insignificant: one run bit.
                            match coder {
                                PassCoder::Mq(m) => m.encode(0, self.contexts.get_mut(CTX_RUN)),
                                PassCoder::Raw(_) => unreachable!("cleanup is never raw-coded"),
                            }
                            continue;
                        }
                        Some(r) => {
                            if let PassCoder::Mq(m) = coder {
                                m.encode(1, self.contexts.get_mut(CTX_RUN));
                                m.encode(((r >> 1) & 1) as u8, self.contexts.get_mut(CTX_UNIFORM));
                                m.encode((r & 1) as u8, self.contexts.get_mut(CTX_UNIFORM));
                            }
                            let i = self.st.idx(x, stripe + r);
                            delta += self.significance_delta(i, plane);
                            self.code_sign(coder, x, stripe + r, i);
                            self.st.flags[i] |= SIG;
                            y = stripe + r + 1;
                        }
                    }
                }
                while y < stripe_end {
                    let i = self.st.idx(x, y);
                    if self.st.flags[i] & (SIG | CODED) == 0 {
                        let bit = ((self.mags[i] >> plane) & 1) as u8;
                        if let PassCoder::Mq(m) = coder {
                            let label = self.st.zc_label(self.subband, x, y);
                            m.encode(bit, self.contexts.get_mut(label));
                        }
                        if bit == 1 {
                            delta += self.significance_delta(i, plane);
                            self.code_sign(coder, x, y, i);
                            self.st.flags[i] |= SIG;
                        }
                    }
                    y += 1;
                }
            }
        }
        self.st.clear_coded();
        delta
    }
}

/// Encode one code-block. `total_planes` is the effective magnitude width,
/// bit depth plus guard bits. Geometry and parameters are validated by the
/// caller.
pub(crate) fn encode_block(
    coefficients: &[i64],
    width: u32,
    height: u32,
    subband: Subband,
    total_planes: u32,
    options: &EncodeOptions,
    pool: Option<&ScratchPool>,
) -> Result<EncodeOutcome, CodingError> {
    let mags: Vec<u64> = coefficients.iter().map(|&c| c.unsigned_abs()).collect();
    let negs: Vec<bool> = coefficients.iter().map(|&c| c < 0).collect();
    let max_mag = mags.iter().copied().max().unwrap_or(0);

    if max_mag == 0 {
        // An all-zero block codes nothing; the zero bit-plane count alone
        // describes it.
        return Ok(EncodeOutcome {
            data: Vec::new(),
            passes: Vec::new(),
            zero_bit_planes: total_planes,
        });
    }

    let hi = 63 - max_mag.leading_zeros();
    if hi + 1 > total_planes {
        // A magnitude that does not fit the declared bit depth.
        return Err(CodingError::InvalidParameter);
    }
    let zero_bit_planes = total_planes - (hi + 1);
    let pass_count = (3 * (hi + 1) - 2) as usize;
    debug!(
        "encoding {}x{} {:?} block: {} planes, {} passes, {} zero planes",
        width,
        height,
        subband,
        hi + 1,
        pass_count,
        zero_bit_planes
    );

    let mut enc = BlockEncoder {
        mags: &mags,
        negs: &negs,
        st: BlockState::new(
            width,
            height,
            options.style.contains(BlockStyle::VERTICALLY_CAUSAL),
            pool,
        ),
        contexts: ContextArray::new(),
        subband,
        estimator: options.distortion,
        collect_distortion: options.collect_distortion,
        gain: subband.energy_gain(),
    };

    let termination = options.effective_termination();
    let mut out: Vec<u8> = Vec::new();
    let mut passes: Vec<CodingPass> = Vec::with_capacity(pass_count);
    let mut coder: Option<PassCoder> = None;
    let mut cumulative_distortion = 0.0f64;
    let mut pass_idx = 0usize;

    for plane in (0..=hi).rev() {
        let kinds: &[PassKind] = if plane == hi {
            &[PassKind::Cleanup]
        } else {
            &[
                PassKind::SignificancePropagation,
                PassKind::MagnitudeRefinement,
                PassKind::Cleanup,
            ]
        };
        for &kind in kinds {
            if let Some(cancel) = &options.cancel {
                if cancel.is_cancelled() {
                    return Err(CodingError::Cancelled);
                }
            }

            let raw = is_raw_pass(options.style, pass_idx);
            let active = coder.get_or_insert_with(|| {
                if raw {
                    PassCoder::Raw(RawBitWriter::new())
                } else {
                    PassCoder::Mq(MqEncoder::new())
                }
            });

            let delta = match kind {
                PassKind::SignificancePropagation => enc.significance_pass(active, plane),
                PassKind::MagnitudeRefinement => enc.refinement_pass(active, plane),
                PassKind::Cleanup => {
                    let d = enc.cleanup_pass(active, plane);
                    if options.style.contains(BlockStyle::SEGMENTATION_SYMBOLS) {
                        if let PassCoder::Mq(m) = active {
                            for bit in [1, 0, 1, 0] {
                                m.encode(bit, enc.contexts.get_mut(CTX_UNIFORM));
                            }
                        }
                    }
                    d
                }
            };
            cumulative_distortion += delta;

            let cumulative_bytes = if is_terminated_pass(options.style, pass_idx, pass_count) {
                let finished = match coder.take() {
                    Some(PassCoder::Mq(m)) => m.finish(termination),
                    Some(PassCoder::Raw(r)) => r.finish(),
                    None => Vec::new(),
                };
                out.extend_from_slice(&finished);
                out.len()
            } else {
                out.len() + coder.as_ref().map_or(0, PassCoder::pending_len)
            };

            passes.push(CodingPass {
                kind,
                cumulative_bytes,
                cumulative_distortion,
                slope: 0.0,
            });
            if options.style.contains(BlockStyle::RESET_CONTEXTS) {
                enc.contexts.reset();
            }
            pass_idx += 1;
        }
    }

    // Non-terminated passes carry a pending-flush estimate that may overshoot
    // the next exact boundary; clamp so the byte counts are non-decreasing
    // and never exceed the segment length.
    for i in (0..passes.len().saturating_sub(1)).rev() {
        passes[i].cumulative_bytes = passes[i].cumulative_bytes.min(passes[i + 1].cumulative_bytes);
    }
    let mut prev = (0usize, 0.0f64);
    for pass in &mut passes {
        let dr = pass.cumulative_bytes - prev.0;
        let dd = pass.cumulative_distortion - prev.1;
        pass.slope = if dr == 0 {
            if dd > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            dd / dr as f64
        };
        prev = (pass.cumulative_bytes, pass.cumulative_distortion);
    }

    Ok(EncodeOutcome {
        data: out,
        passes,
        zero_bit_planes,
    })
}

struct BlockDecoder {
    st: BlockState,
    contexts: ContextArray,
    mags: Vec<u64>,
    subband: Subband,
    damaged: bool,
}

impl BlockDecoder {
    fn read_sign(&mut self, feed: &mut PassDecoder<'_>, x: u32, y: u32, i: usize) {
        let neg = match feed {
            PassDecoder::Raw(r) => r.read_bit(),
            PassDecoder::Mq(m) => {
                let (label, flip) = self.st.sc_label(x, y);
                m.decode(self.contexts.get_mut(label)) ^ flip
            }
        };
        if neg != 0 {
            self.st.flags[i] |= NEG;
        }
    }

    fn significance_pass(&mut self, feed: &mut PassDecoder<'_>, plane: u32) {
        for stripe in (0..self.st.height).step_by(4) {
            for x in 0..self.st.width {
                for y in stripe..(stripe + 4).min(self.st.height) {
                    let i = self.st.idx(x, y);
                    if self.st.flags[i] & SIG != 0 || self.st.neighbourhood(x, y) == 0 {
                        continue;
                    }
                    let bit = match feed {
                        PassDecoder::Raw(r) => r.read_bit(),
                        PassDecoder::Mq(m) => {
                            let label = self.st.zc_label(self.subband, x, y);
                            m.decode(self.contexts.get_mut(label))
                        }
                    };
                    self.st.flags[i] |= CODED;
                    if bit != 0 {
                        self.mags[i] |= 1u64 << plane;
                        self.read_sign(feed, x, y, i);
                        self.st.flags[i] |= SIG;
                    }
                }
            }
        }
    }

    fn refinement_pass(&mut self, feed: &mut PassDecoder<'_>, plane: u32) {
        for stripe in (0..self.st.height).step_by(4) {
            for x in 0..self.st.width {
                for y in stripe..(stripe + 4).min(self.st.height) {
                    let i = self.st.idx(x, y);
                    if self.st.flags[i] & SIG == 0 || self.st.flags[i] & CODED != 0 {
                        continue;
                    }
                    let bit = match feed {
                        PassDecoder::Raw(r) => r.read_bit(),
                        PassDecoder::Mq(m) => {
                            let label = self.st.mr_label(x, y);
                            m.decode(self.contexts.get_mut(label))
                        }
                    };
                    self.mags[i] |= u64::from(bit) << plane;
                    self.st.flags[i] |= REFINED;
                }
            }
        }
    }

    fn cleanup_pass(&mut self, feed: &mut PassDecoder<'_>, plane: u32) {
        let height = self.st.height;
        for stripe in (0..height).step_by(4) {
            let stripe_end = (stripe + 4).min(height);
            for x in 0..self.st.width {
                let mut y = stripe;
                let first = self.st.idx(x, stripe);
                let run_eligible = stripe + 4 <= height
                    && self.st.flags[first] & (SIG | CODED) == 0
                    && (0..4).all(|k| self.st.neighbourhood(x, stripe + k) == 0);
                if run_eligible {
                    let m = match feed {
                        PassDecoder::Mq(m) => m,
                        PassDecoder::Raw(_) => unreachable!("cleanup is never raw-coded"),
                    };
                    if m.decode(self.contexts.get_mut(CTX_RUN)) == 0 {
                        continue;
                    }
                    let mut run = m.decode(self.contexts.get_mut(CTX_UNIFORM)) as u32;
                    run = (run << 1) | m.decode(self.contexts.get_mut(CTX_UNIFORM)) as u32;
                    let i = self.st.idx(x, stripe + run);
                    self.mags[i] |= 1u64 << plane;
                    self.read_sign(feed, x, stripe + run, i);
                    self.st.flags[i] |= SIG;
                    y = stripe + run + 1;
                }
                while y < stripe_end {
                    let i = self.st.idx(x, y);
                    if self.st.flags[i] & (SIG | CODED) == 0 {
                        let bit = match feed {
                            PassDecoder::Mq(m) => {
                                let label = self.st.zc_label(self.subband, x, y);
                                m.decode(self.contexts.get_mut(label))
                            }
                            PassDecoder::Raw(_) => unreachable!("cleanup is never raw-coded"),
                        };
                        if bit != 0 {
                            self.mags[i] |= 1u64 << plane;
                            self.read_sign(feed, x, y, i);
                            self.st.flags[i] |= SIG;
                        }
                    }
                    y += 1;
                }
            }
        }
        self.st.clear_coded();
    }
}

/// Decode one code-block from its coded segment. Mirrors [`encode_block`]
/// pass by pass; recoverable damage (`Truncated`, `MalformedBitstream`)
/// comes back alongside the best-effort reconstruction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode_block(
    data: &[u8],
    width: u32,
    height: u32,
    subband: Subband,
    total_planes: u32,
    zero_bit_planes: u32,
    pass_count: usize,
    pass_byte_bounds: Option<&[usize]>,
    options: &EncodeOptions,
    pool: Option<&ScratchPool>,
) -> Result<(Vec<i64>, Option<CodingError>), CodingError> {
    let area = (width * height) as usize;
    if pass_count == 0 {
        return Ok((vec![0; area], None));
    }

    // Each three passes past the first cleanup open one more bit-plane.
    let planes_needed = 1 + (pass_count - 1).div_ceil(3) as u32;
    if zero_bit_planes + planes_needed > total_planes {
        warn!(
            "pass count {} inconsistent with {} zero of {} bit-planes",
            pass_count, zero_bit_planes, total_planes
        );
        return Ok((vec![0; area], Some(CodingError::MalformedBitstream)));
    }
    let hi = total_planes - 1 - zero_bit_planes;

    let mut truncated = false;
    if let Some(bounds) = pass_byte_bounds {
        if bounds.len() != pass_count {
            return Ok((vec![0; area], Some(CodingError::MalformedBitstream)));
        }
        if data.len() < *bounds.last().unwrap_or(&0) {
            warn!(
                "coded segment holds {} of {} bytes, decoding best-effort",
                data.len(),
                bounds.last().unwrap_or(&0)
            );
            truncated = true;
        }
    }

    let segmented = options.style.contains(BlockStyle::TERMINATE_PER_PASS)
        || options.style.contains(BlockStyle::SELECTIVE_BYPASS);
    if segmented && pass_byte_bounds.is_none() {
        // Segment boundaries are signalled out-of-band; without them a
        // multi-segment block cannot be located.
        return Ok((vec![0; area], Some(CodingError::MalformedBitstream)));
    }

    let mut dec = BlockDecoder {
        st: BlockState::new(
            width,
            height,
            options.style.contains(BlockStyle::VERTICALLY_CAUSAL),
            pool,
        ),
        contexts: ContextArray::new(),
        mags: vec![0; area],
        subband,
        damaged: false,
    };

    let mut plane = hi;
    let mut pass_idx = 0usize;
    while pass_idx < pass_count {
        if let Some(cancel) = &options.cancel {
            if cancel.is_cancelled() {
                return Err(CodingError::Cancelled);
            }
        }

        // One coded segment: from the current pass through the next
        // terminated one.
        let seg_start_pass = pass_idx;
        let mut seg_end_pass = pass_idx;
        while !is_terminated_pass(options.style, seg_end_pass, pass_count) {
            seg_end_pass += 1;
        }
        let byte_start = if seg_start_pass == 0 {
            0
        } else {
            pass_byte_bounds.map_or(0, |b| b[seg_start_pass - 1])
        };
        let byte_end = if seg_end_pass + 1 == pass_count {
            pass_byte_bounds.map_or(data.len(), |b| b[seg_end_pass].min(data.len()))
        } else {
            pass_byte_bounds.map_or(data.len(), |b| b[seg_end_pass])
        };
        let segment = data
            .get(byte_start.min(data.len())..byte_end.min(data.len()))
            .unwrap_or(&[]);

        let mut feed = if is_raw_pass(options.style, seg_start_pass) {
            PassDecoder::Raw(RawBitReader::new(segment))
        } else {
            PassDecoder::Mq(MqDecoder::new(segment))
        };

        for i in seg_start_pass..=seg_end_pass {
            match PassKind::of_index(i) {
                PassKind::SignificancePropagation => dec.significance_pass(&mut feed, plane),
                PassKind::MagnitudeRefinement => dec.refinement_pass(&mut feed, plane),
                PassKind::Cleanup => {
                    dec.cleanup_pass(&mut feed, plane);
                    if options.style.contains(BlockStyle::SEGMENTATION_SYMBOLS) {
                        if let PassDecoder::Mq(m) = &mut feed {
                            let mut symbol = 0u8;
                            for _ in 0..4 {
                                symbol =
                                    (symbol << 1) | m.decode(dec.contexts.get_mut(CTX_UNIFORM));
                            }
                            if symbol != 0b1010 {
                                warn!("segmentation symbol damaged: {:04b}", symbol);
                                dec.damaged = true;
                            }
                        }
                    }
                    plane = plane.saturating_sub(1);
                }
            }
            if options.style.contains(BlockStyle::RESET_CONTEXTS) {
                dec.contexts.reset();
            }
        }

        if let PassDecoder::Raw(r) = &feed {
            if r.overrun() {
                truncated = true;
            }
        }
        pass_idx = seg_end_pass + 1;
    }

    let coefficients: Vec<i64> = dec
        .mags
        .iter()
        .zip(dec.st.flags.iter())
        .map(|(&m, &f)| {
            let v = m as i64;
            if f & NEG != 0 {
                -v
            } else {
                v
            }
        })
        .collect();

    let error = if dec.damaged {
        Some(CodingError::MalformedBitstream)
    } else if truncated {
        Some(CodingError::Truncated)
    } else {
        None
    };
    Ok((coefficients, error))
}
