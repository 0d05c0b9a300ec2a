//! Post-compression rate-distortion optimisation (PCRD-opt).
//!
//! Every code-block reports a cumulative (rate, distortion) point per
//! coding pass. The controller reduces each block's points to their upper
//! convex hull, then searches a Lagrangian slope threshold so the selected
//! truncation points meet a byte budget with minimal distortion, and
//! finally partitions the selected passes into quality layers against an
//! increasing sequence of target rates.

use log::debug;

use crate::code_block::CodeBlock;
use crate::error::CodingError;

/// How per-pass distortion figures are estimated during encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistortionEstimation {
    /// Revealed-bit energy weighted by the subband gain.
    #[default]
    NormBased,
    /// Exact squared-error reduction against the true coefficients.
    MseBased,
    /// Unweighted magnitude-change proxy; cheapest.
    Simplified,
}

/// Target selection for the allocator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateControlMode {
    /// Single layer, every block contributes every pass.
    Lossless,
    /// Bits per pixel across the whole image.
    TargetBitrate(f64),
    /// Quality knob in [0, 1], mapped through a monotone bitrate curve.
    ConstantQuality(f64),
}

#[derive(Debug, Clone)]
pub struct RateControlConfiguration {
    pub mode: RateControlMode,
    pub layer_count: usize,
    pub distortion_estimation: DistortionEstimation,
    /// Never exceed the budget; back off block by block if the slope
    /// search lands above it.
    pub strict_rate_matching: bool,
    /// Bisection steps allowed before the search gives up.
    pub max_iterations: usize,
}

impl Default for RateControlConfiguration {
    fn default() -> Self {
        Self {
            mode: RateControlMode::Lossless,
            layer_count: 1,
            distortion_estimation: DistortionEstimation::default(),
            strict_rate_matching: true,
            max_iterations: 120,
        }
    }
}

/// One quality layer: for every block, the cumulative number of passes
/// included once this layer is decoded.
#[derive(Debug, Clone)]
pub struct Layer {
    pub index: usize,
    /// Cumulative byte target of this layer; absent for lossless output.
    pub target_rate: Option<u64>,
    /// Indexed by block position in the caller's slice.
    pub contributions: Vec<usize>,
}

/// Monotone quality-to-bitrate curve: 0.25 bpp at q = 0 up to 8 bpp at
/// q = 1.
pub fn quality_to_bitrate(q: f64) -> f64 {
    0.25 * 32f64.powf(q)
}

fn budget_bytes(bpp: f64, total_pixels: usize) -> u64 {
    (bpp * total_pixels as f64 / 8.0) as u64
}

/// One feasible truncation point left after convexification.
#[derive(Debug, Clone, Copy)]
struct HullPoint {
    /// Pass index of the point (truncating here keeps `pass + 1` passes).
    pass: usize,
    rate: u64,
    distortion: f64,
    slope: f64,
}

/// Upper convex hull of a block's (rate, distortion) pass points. Dominated
/// passes disappear; the surviving slopes are strictly decreasing.
fn convex_hull(block: &CodeBlock) -> Vec<HullPoint> {
    let mut hull: Vec<HullPoint> = Vec::new();
    for (pass, p) in block.passes().iter().enumerate() {
        let rate = p.cumulative_bytes as u64;
        let distortion = p.cumulative_distortion;
        let mut keep = true;
        let slope = loop {
            let (prev_rate, prev_dist, prev_slope) = match hull.last() {
                Some(prev) => (prev.rate, prev.distortion, prev.slope),
                None => (0, 0.0, f64::INFINITY),
            };
            let dr = rate.saturating_sub(prev_rate);
            let dd = distortion - prev_dist;
            if dd <= 0.0 {
                // No distortion gain over the hull: the point is dominated.
                keep = false;
                break 0.0;
            }
            let slope = if dr == 0 {
                f64::INFINITY
            } else {
                dd / dr as f64
            };
            if slope >= prev_slope && hull.pop().is_some() {
                continue;
            }
            break slope;
        };
        if keep {
            hull.push(HullPoint {
                pass,
                rate,
                distortion,
                slope,
            });
        }
    }
    hull
}

/// Largest feasible truncation with slope at least `lambda`:
/// (passes kept, bytes kept).
fn select(hull: &[HullPoint], lambda: f64) -> (usize, u64) {
    let mut chosen = (0usize, 0u64);
    for point in hull {
        if point.slope >= lambda {
            chosen = (point.pass + 1, point.rate);
        } else {
            break;
        }
    }
    chosen
}

/// Drop passes one at a time, smallest selected slope first, until the
/// total fits the budget.
fn back_off(hulls: &[Vec<HullPoint>], selection: &mut [(usize, u64)], budget: u64) {
    // Current hull position per block, None when nothing is selected.
    let mut position: Vec<Option<usize>> = hulls
        .iter()
        .zip(selection.iter())
        .map(|(hull, &(passes, _))| {
            hull.iter().position(|p| p.pass + 1 == passes)
        })
        .collect();
    let mut total: u64 = selection.iter().map(|s| s.1).sum();

    while total > budget {
        let mut victim: Option<(usize, f64)> = None;
        for (b, pos) in position.iter().enumerate() {
            if let Some(i) = pos {
                let slope = hulls[b][*i].slope;
                if victim.map_or(true, |(_, s)| slope < s) {
                    victim = Some((b, slope));
                }
            }
        }
        let Some((b, _)) = victim else {
            break;
        };
        let i = position[b].take();
        if let Some(i) = i {
            let old_rate = hulls[b][i].rate;
            let (new_pos, new_sel) = if i == 0 {
                (None, (0, 0))
            } else {
                let prev = hulls[b][i - 1];
                (Some(i - 1), (prev.pass + 1, prev.rate))
            };
            position[b] = new_pos;
            total = total - old_rate + new_sel.1;
            selection[b] = new_sel;
        }
    }
}

/// Bisect the slope threshold against a byte budget.
fn lagrangian_selection(
    hulls: &[Vec<HullPoint>],
    budget: u64,
    strict: bool,
    max_iterations: usize,
) -> Result<Vec<(usize, u64)>, CodingError> {
    let mut slopes: Vec<f64> = hulls
        .iter()
        .flatten()
        .map(|p| p.slope)
        .filter(|s| s.is_finite())
        .collect();
    slopes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let max_slope = slopes.last().copied().unwrap_or(0.0);

    let total_at = |lambda: f64| -> u64 { hulls.iter().map(|h| select(h, lambda).1).sum() };

    let mut lo = 0.0f64;
    let mut hi = max_slope + 1.0;
    if total_at(lo) <= budget {
        // Everything fits; no search needed.
        return Ok(hulls.iter().map(|h| select(h, lo)).collect());
    }
    if total_at(hi) > budget {
        // Even the mandatory zero-cost passes overrun; only a strict
        // back-off can restore feasibility.
        let mut selection: Vec<(usize, u64)> = hulls.iter().map(|h| select(h, hi)).collect();
        if strict {
            back_off(hulls, &mut selection, budget);
        }
        return Ok(selection);
    }

    // Invariant: total(hi) <= budget < total(lo). The bracket always
    // straddles the boundary slope, so one-pass granularity is reached
    // once at most one distinct slope remains strictly inside it.
    let interior = |lo: f64, hi: f64| -> usize {
        let mut count = 0;
        let mut last = f64::NAN;
        for &s in &slopes {
            if s > lo && s < hi && s != last {
                count += 1;
                last = s;
            }
        }
        count
    };
    let mut iterations = 0;
    while interior(lo, hi) > 1 {
        if iterations == max_iterations {
            return Err(CodingError::ConvergenceFailure);
        }
        let mid = 0.5 * (lo + hi);
        if total_at(mid) <= budget {
            hi = mid;
        } else {
            lo = mid;
        }
        iterations += 1;
    }

    let mut selection: Vec<(usize, u64)> = hulls.iter().map(|h| select(h, hi)).collect();
    if strict {
        back_off(hulls, &mut selection, budget);
    } else {
        // Nearest match may sit on the infeasible side of the bracket.
        let over: Vec<(usize, u64)> = hulls.iter().map(|h| select(h, lo)).collect();
        let under_total: u64 = selection.iter().map(|s| s.1).sum();
        let over_total: u64 = over.iter().map(|s| s.1).sum();
        if over_total - budget < budget - under_total {
            selection = over;
        }
    }
    Ok(selection)
}

fn layered_allocation(
    blocks: &[CodeBlock],
    budget: u64,
    config: &RateControlConfiguration,
) -> Result<Vec<Layer>, CodingError> {
    let hulls: Vec<Vec<HullPoint>> = blocks.iter().map(convex_hull).collect();
    let mut layers = Vec::with_capacity(config.layer_count);
    let mut floor = vec![0usize; blocks.len()];
    for index in 0..config.layer_count {
        let target = budget * (index as u64 + 1) / config.layer_count as u64;
        let selection = lagrangian_selection(
            &hulls,
            target,
            config.strict_rate_matching,
            config.max_iterations,
        )?;
        // Layer contributions never shrink across layers.
        let contributions: Vec<usize> = selection
            .iter()
            .zip(&floor)
            .map(|(&(passes, _), &prev)| passes.max(prev))
            .collect();
        debug!(
            "layer {}: target {} bytes, {} passes selected",
            index,
            target,
            contributions.iter().sum::<usize>()
        );
        floor.clone_from(&contributions);
        layers.push(Layer {
            index,
            target_rate: Some(target),
            contributions,
        });
    }
    Ok(layers)
}

/// Choose truncation points and quality layers for a set of code-blocks.
/// The blocks' pass tables are borrowed read-only.
pub fn allocate(
    blocks: &[CodeBlock],
    total_pixels: usize,
    config: &RateControlConfiguration,
) -> Result<Vec<Layer>, CodingError> {
    if blocks.is_empty() {
        return Err(CodingError::EmptyInput);
    }
    if total_pixels == 0 {
        return Err(CodingError::InvalidPixelCount);
    }
    if config.layer_count == 0 || config.max_iterations == 0 {
        return Err(CodingError::InvalidParameter);
    }

    match config.mode {
        RateControlMode::Lossless => Ok(vec![Layer {
            index: 0,
            target_rate: None,
            contributions: blocks.iter().map(CodeBlock::pass_count).collect(),
        }]),
        RateControlMode::TargetBitrate(bpp) => {
            if !bpp.is_finite() || bpp <= 0.0 {
                return Err(CodingError::InvalidParameter);
            }
            layered_allocation(blocks, budget_bytes(bpp, total_pixels), config)
        }
        RateControlMode::ConstantQuality(q) => {
            if !q.is_finite() || !(0.0..=1.0).contains(&q) {
                return Err(CodingError::InvalidParameter);
            }
            layered_allocation(blocks, budget_bytes(quality_to_bitrate(q), total_pixels), config)
        }
    }
}
