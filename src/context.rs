//! Context modelling for bit-plane coding (D.3).
//!
//! Maps a coefficient's neighbourhood state and the subband orientation to
//! one of the 19 context labels driving the MQ coder: zero coding 0-8, sign
//! coding 9-13 (with a sign-flip bit), magnitude refinement 14-16, the
//! run-length context 17 and the uniform context 18.

use num_enum::TryFromPrimitive;

use crate::mq_coder::MqContext;

/// Subband orientation of a code-block; selects the zero-coding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive)]
#[repr(u8)]
pub enum Subband {
    #[default]
    LL = 0,
    HL = 1,
    LH = 2,
    HH = 3,
}

impl Subband {
    /// Squared-norm synthesis gain used by the norm-based distortion
    /// estimator (5/3 approximation).
    pub fn energy_gain(self) -> f64 {
        match self {
            Subband::LL => 1.0,
            Subband::HL | Subband::LH => 2.0,
            Subband::HH => 4.0,
        }
    }
}

pub const CTX_COUNT: usize = 19;
/// Run-length context used by the cleanup pass.
pub const CTX_RUN: usize = 17;
/// Uniform context (non-adaptive state 46).
pub const CTX_UNIFORM: usize = 18;

/// Zero-coding context label from the significant-neighbour counts
/// (Table D.1). `h`/`v`/`d` are horizontal, vertical and diagonal counts.
pub fn zero_coding_label(subband: Subband, h: u8, v: u8, d: u8) -> usize {
    let (h, v) = match subband {
        // The HL table is the LL/LH table with the roles of horizontal and
        // vertical neighbours swapped.
        Subband::HL => (v, h),
        _ => (h, v),
    };
    match subband {
        Subband::LL | Subband::LH | Subband::HL => match (h, v, d) {
            (2.., _, _) => 8,
            (1, 1.., _) => 7,
            (1, 0, 1..) => 6,
            (1, 0, 0) => 5,
            (0, 2.., _) => 4,
            (0, 1, _) => 3,
            (0, 0, 2..) => 2,
            (0, 0, 1) => 1,
            _ => 0,
        },
        Subband::HH => match (h + v, d) {
            (_, 3..) => 8,
            (1.., 2) => 7,
            (0, 2) => 6,
            (2.., 1) => 5,
            (1, 1) => 4,
            (0, 1) => 3,
            (2.., 0) => 2,
            (1, 0) => 1,
            _ => 0,
        },
    }
}

/// Sign-coding context label and flip bit from the clamped horizontal and
/// vertical sign contributions (Tables D.2 and D.3). Contributions are in
/// -1..=1; the flip bit is XORed with the coded sign.
pub fn sign_coding_label(h: i8, v: i8) -> (usize, u8) {
    match (h, v) {
        (1, 1) => (13, 0),
        (1, 0) => (12, 0),
        (1, -1) => (11, 0),
        (0, 1) => (10, 0),
        (0, 0) => (9, 0),
        (0, -1) => (10, 1),
        (-1, 1) => (11, 1),
        (-1, 0) => (12, 1),
        (-1, -1) => (13, 1),
        _ => unreachable!("sign contributions are clamped to -1..=1"),
    }
}

/// Magnitude-refinement context label (Table D.4).
pub fn magnitude_refinement_label(refined: bool, significant_neighbours: bool) -> usize {
    if refined {
        16
    } else if significant_neighbours {
        15
    } else {
        14
    }
}

/// The 19 adaptive contexts of one code-block.
#[derive(Debug, Clone)]
pub struct ContextArray {
    contexts: [MqContext; CTX_COUNT],
}

impl Default for ContextArray {
    fn default() -> Self {
        let mut arr = Self {
            contexts: [MqContext::default(); CTX_COUNT],
        };
        arr.reset();
        arr
    }
}

impl ContextArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-initialise every label to its Table D.7 starting state.
    pub fn reset(&mut self) {
        for ctx in &mut self.contexts {
            *ctx = MqContext::default();
        }
        self.contexts[0] = MqContext::new(4, 0);
        self.contexts[CTX_RUN] = MqContext::new(3, 0);
        self.contexts[CTX_UNIFORM] = MqContext::new(46, 0);
    }

    pub fn get_mut(&mut self, label: usize) -> &mut MqContext {
        &mut self.contexts[label]
    }
}
