//! MQ arithmetic coder (ISO/IEC 15444-1 Annex C).
//!
//! A binary context-adaptive coder. Probability adaptation is driven by the
//! 47-entry state table; the per-label `(state index, MPS)` pairs live in a
//! caller-owned context array so that every code-block carries its own
//! adaptation state. Encoder and decoder are independent state records that
//! share nothing but the table.

/// One row of the probability state table (Table C.2).
#[derive(Debug, Clone, Copy)]
pub struct QeEntry {
    pub qe: u16,
    pub nmps: u8,
    pub nlps: u8,
    pub switch: bool,
}

macro_rules! qe {
    ($($qe:expr, $nmps:expr, $nlps:expr, $switch:expr),+ $(,)?) => {
        [$(QeEntry { qe: $qe, nmps: $nmps, nlps: $nlps, switch: $switch }),+]
    };
}

/// Qe values and state transitions, transcribed verbatim from Table C.2.
#[rustfmt::skip]
pub const QE_TABLE: [QeEntry; 47] = qe!(
    0x5601,  1,  1, true,
    0x3401,  2,  6, false,
    0x1801,  3,  9, false,
    0x0AC1,  4, 12, false,
    0x0521,  5, 29, false,
    0x0221, 38, 33, false,
    0x5601,  7,  6, true,
    0x5401,  8, 14, false,
    0x4801,  9, 14, false,
    0x3801, 10, 14, false,
    0x3001, 11, 17, false,
    0x2401, 12, 18, false,
    0x1C01, 13, 20, false,
    0x1601, 29, 21, false,
    0x5601, 15, 14, true,
    0x5401, 16, 14, false,
    0x5101, 17, 15, false,
    0x4801, 18, 16, false,
    0x3801, 19, 17, false,
    0x3401, 20, 18, false,
    0x3001, 21, 19, false,
    0x2801, 22, 19, false,
    0x2401, 23, 20, false,
    0x2201, 24, 21, false,
    0x1C01, 25, 22, false,
    0x1801, 26, 23, false,
    0x1601, 27, 24, false,
    0x1401, 28, 25, false,
    0x1201, 29, 26, false,
    0x1101, 30, 27, false,
    0x0AC1, 31, 28, false,
    0x09C1, 32, 29, false,
    0x08A1, 33, 30, false,
    0x0521, 34, 31, false,
    0x0441, 35, 32, false,
    0x02A1, 36, 33, false,
    0x0221, 37, 34, false,
    0x0141, 38, 35, false,
    0x0111, 39, 36, false,
    0x0085, 40, 37, false,
    0x0049, 41, 38, false,
    0x0025, 42, 39, false,
    0x0015, 43, 40, false,
    0x0009, 44, 41, false,
    0x0005, 45, 42, false,
    0x0001, 46, 43, false,
    0x5601, 46, 46, false,
);

/// Adaptive state of one context label: an index into [`QE_TABLE`] plus the
/// current more-probable symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MqContext {
    pub index: u8,
    pub mps: u8,
}

impl MqContext {
    pub const fn new(index: u8, mps: u8) -> Self {
        Self { index, mps }
    }
}

/// How a coded segment is ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Termination {
    /// FLUSH procedure of C.2.9: SETBITS plus two byte-outs.
    #[default]
    Default,
    /// Minimal-length termination: only the `12 - CT` bits the decoder
    /// cannot regenerate from its end-of-segment 1-fill are shifted out.
    NearOptimal,
    /// Minimal-length termination padded with one deterministic byte so a
    /// decoder can re-derive the segment tail.
    Predictable,
}

/// MQ encoder state (C.2). Output accumulates into an internal buffer whose
/// first byte is the carry delay slot; [`MqEncoder::finish`] strips it.
pub struct MqEncoder {
    a: u32,
    c: u32,
    ct: i32,
    out: Vec<u8>,
}

impl Default for MqEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MqEncoder {
    /// INITENC. The delay slot starts at zero, so CT is always 12.
    pub fn new() -> Self {
        Self {
            a: 0x8000,
            c: 0,
            ct: 12,
            out: vec![0],
        }
    }

    /// Number of whole bytes committed to the output so far.
    pub fn emitted(&self) -> usize {
        self.out.len() - 1
    }

    /// Upper bound on the segment length if the coder were terminated now.
    /// Exact after `finish`; the two-byte slack covers the FLUSH tail.
    pub fn pending_len(&self) -> usize {
        self.emitted() + 2
    }

    /// ENCODE one decision under `ctx` (C.2.5).
    pub fn encode(&mut self, d: u8, ctx: &mut MqContext) {
        if d == ctx.mps {
            self.code_mps(ctx);
        } else {
            self.code_lps(ctx);
        }
    }

    fn code_mps(&mut self, ctx: &mut MqContext) {
        let entry = &QE_TABLE[ctx.index as usize];
        let qe = u32::from(entry.qe);
        self.a -= qe;
        if self.a & 0x8000 == 0 {
            if self.a < qe {
                // Conditional exchange: the MPS takes the lower sub-interval.
                self.a = qe;
            } else {
                self.c += qe;
            }
            ctx.index = entry.nmps;
            self.renormalize();
        } else {
            self.c += qe;
        }
    }

    fn code_lps(&mut self, ctx: &mut MqContext) {
        let entry = &QE_TABLE[ctx.index as usize];
        let qe = u32::from(entry.qe);
        self.a -= qe;
        if self.a < qe {
            // Conditional exchange: the LPS takes the upper sub-interval.
            self.c += qe;
        } else {
            self.a = qe;
        }
        if entry.switch {
            ctx.mps = 1 - ctx.mps;
        }
        ctx.index = entry.nlps;
        self.renormalize();
    }

    /// RENORME (C.2.8).
    fn renormalize(&mut self) {
        loop {
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.ct == 0 {
                self.byte_out();
            }
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    /// BYTEOUT (C.2.6): carry resolution against the delay slot, stuffing to
    /// seven bits after an emitted 0xFF.
    fn byte_out(&mut self) {
        let last = self.out.len() - 1;
        if self.out[last] == 0xFF {
            self.out.push((self.c >> 20) as u8);
            self.c &= 0x000F_FFFF;
            self.ct = 7;
        } else {
            if self.c & 0x0800_0000 != 0 {
                self.out[last] += 1;
                self.c &= 0x07FF_FFFF;
                if self.out[last] == 0xFF {
                    self.out.push((self.c >> 20) as u8);
                    self.c &= 0x000F_FFFF;
                    self.ct = 7;
                    return;
                }
            }
            self.out.push((self.c >> 19) as u8);
            self.c &= 0x0007_FFFF;
            self.ct = 8;
        }
    }

    /// SETBITS (C.2.9): force the tail of C to ones so the decoder's
    /// end-of-segment 1-fill reproduces the discarded bits.
    fn set_bits(&mut self) {
        let temp = self.c + self.a;
        self.c |= 0xFFFF;
        if self.c >= temp {
            self.c -= 0x8000;
        }
    }

    /// Minimal-length termination: shift out only the `12 - CT` essential
    /// bits still held in the register.
    fn min_length_term(&mut self) {
        let mut k = 12 - self.ct;
        while k > 0 {
            self.c <<= self.ct;
            self.byte_out();
            k -= self.ct;
        }
    }

    /// Terminate the segment and take the coded bytes. A trailing 0xFF is
    /// never part of a segment; the decoder regenerates it.
    pub fn finish(mut self, termination: Termination) -> Vec<u8> {
        match termination {
            Termination::Default => {
                self.set_bits();
                self.c <<= self.ct;
                self.byte_out();
                self.c <<= self.ct;
                self.byte_out();
            }
            Termination::NearOptimal => {
                self.min_length_term();
            }
            Termination::Predictable => {
                self.min_length_term();
                if self.out[self.out.len() - 1] != 0xFF {
                    self.byte_out();
                }
            }
        }
        if self.out.last() == Some(&0xFF) {
            self.out.pop();
        }
        let mut out = self.out;
        out.remove(0);
        out
    }
}

/// MQ decoder state (C.3). Consumes bytes lazily; a 0xFF followed by a byte
/// above 0x8F is a marker and is never read past. Once the input runs out
/// the decoder synthesises 0xFF bytes indefinitely, so decoding is
/// infallible and deterministic on truncated input; `synthetic_fills`
/// reports how often that happened.
pub struct MqDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    a: u32,
    c: u32,
    ct: i32,
    fills: u32,
}

impl<'a> MqDecoder<'a> {
    /// INITDEC (C.3.5).
    pub fn new(data: &'a [u8]) -> Self {
        let mut dec = Self {
            data,
            pos: 0,
            a: 0,
            c: 0,
            ct: 0,
            fills: 0,
        };
        dec.c = u32::from(dec.b()) << 16;
        dec.byte_in();
        dec.c <<= 7;
        dec.ct -= 7;
        dec.a = 0x8000;
        dec
    }

    fn b(&self) -> u8 {
        self.data.get(self.pos).copied().unwrap_or(0xFF)
    }

    fn b1(&self) -> u8 {
        self.data.get(self.pos + 1).copied().unwrap_or(0xFF)
    }

    /// Count of synthetic 1-fill bytes fed after the input was exhausted or
    /// a marker was reached.
    pub fn synthetic_fills(&self) -> u32 {
        self.fills
    }

    /// BYTEIN (C.3.4).
    fn byte_in(&mut self) {
        if self.b() == 0xFF {
            if self.b1() > 0x8F {
                // Marker or end of data: stop consuming and feed 1-bits.
                self.c += 0xFF00;
                self.ct = 8;
                self.fills += 1;
            } else {
                self.pos += 1;
                self.c += u32::from(self.b()) << 9;
                self.ct = 7;
            }
        } else {
            self.pos += 1;
            if self.pos >= self.data.len() {
                self.fills += 1;
            }
            self.c += u32::from(self.b()) << 8;
            self.ct = 8;
        }
    }

    /// DECODE one decision under `ctx` (C.3.2).
    pub fn decode(&mut self, ctx: &mut MqContext) -> u8 {
        let entry = &QE_TABLE[ctx.index as usize];
        let qe = u32::from(entry.qe);
        self.a -= qe;
        if (self.c >> 16) < qe {
            // LPS_EXCHANGE
            let d;
            if self.a < qe {
                d = ctx.mps;
                ctx.index = entry.nmps;
            } else {
                d = 1 - ctx.mps;
                if entry.switch {
                    ctx.mps = 1 - ctx.mps;
                }
                ctx.index = entry.nlps;
            }
            self.a = qe;
            self.renormalize();
            d
        } else {
            self.c -= qe << 16;
            if self.a & 0x8000 == 0 {
                // MPS_EXCHANGE
                let d;
                if self.a < qe {
                    d = 1 - ctx.mps;
                    if entry.switch {
                        ctx.mps = 1 - ctx.mps;
                    }
                    ctx.index = entry.nlps;
                } else {
                    d = ctx.mps;
                    ctx.index = entry.nmps;
                }
                self.renormalize();
                d
            } else {
                ctx.mps
            }
        }
    }

    /// RENORMD (C.3.3).
    fn renormalize(&mut self) {
        loop {
            if self.ct == 0 {
                self.byte_in();
            }
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(bits: &[(u8, usize)], contexts: usize, term: Termination) {
        let mut ctx_enc = vec![MqContext::default(); contexts];
        let mut enc = MqEncoder::new();
        for &(bit, cx) in bits {
            enc.encode(bit, &mut ctx_enc[cx]);
        }
        let data = enc.finish(term);

        let mut ctx_dec = vec![MqContext::default(); contexts];
        let mut dec = MqDecoder::new(&data);
        for (i, &(bit, cx)) in bits.iter().enumerate() {
            let got = dec.decode(&mut ctx_dec[cx]);
            assert_eq!(bit, got, "symbol {} (ctx {}) mismatched", i, cx);
        }
    }

    #[test]
    fn qe_table_integrity() {
        assert_eq!(QE_TABLE.len(), 47);
        assert_eq!(QE_TABLE[0].qe, 0x5601);
        assert_eq!(QE_TABLE[0].nmps, 1);
        assert_eq!(QE_TABLE[0].nlps, 1);
        assert!(QE_TABLE[0].switch);
        assert_eq!(QE_TABLE[46].qe, 0x5601);
        assert_eq!(QE_TABLE[46].nmps, 46);
        assert_eq!(QE_TABLE[46].nlps, 46);
        assert!(!QE_TABLE[46].switch);
    }

    #[test]
    fn encoder_init_state() {
        let enc = MqEncoder::new();
        assert_eq!(enc.a, 0x8000);
        assert_eq!(enc.ct, 12);
        assert_eq!(enc.emitted(), 0);
    }

    #[test]
    fn single_context_roundtrip() {
        let bits: Vec<(u8, usize)> = [0, 0, 1, 0, 1, 1, 0, 1, 0, 0]
            .iter()
            .map(|&b| (b, 0))
            .collect();
        roundtrip(&bits, 1, Termination::Default);
    }

    #[test]
    fn forced_lps_runs_roundtrip() {
        // Long alternations keep driving the LPS path and the switch rule.
        let bits: Vec<(u8, usize)> = (0..200).map(|i| (((i / 3) % 2) as u8, 0)).collect();
        roundtrip(&bits, 1, Termination::Default);
    }

    #[test]
    fn multi_context_roundtrip() {
        let mut bits = Vec::new();
        for i in 0..120usize {
            bits.push(((i % 5 == 0) as u8, i % 3));
        }
        roundtrip(&bits, 3, Termination::Default);
    }

    #[test]
    fn uniform_and_run_contexts_roundtrip() {
        // Contexts pinned the way a cleanup pass pins them: run-length at
        // state 3, uniform at state 46.
        let mut ctx_enc = [MqContext::new(3, 0), MqContext::new(46, 0)];
        let mut enc = MqEncoder::new();
        let ops = [(0u8, 0usize), (0, 0), (1, 0), (1, 1), (0, 1), (0, 0)];
        for &(bit, cx) in &ops {
            enc.encode(bit, &mut ctx_enc[cx]);
        }
        let data = enc.finish(Termination::Default);

        let mut ctx_dec = [MqContext::new(3, 0), MqContext::new(46, 0)];
        let mut dec = MqDecoder::new(&data);
        for &(bit, cx) in &ops {
            assert_eq!(bit, dec.decode(&mut ctx_dec[cx]));
        }
    }

    #[test]
    fn near_optimal_termination_roundtrip() {
        let bits: Vec<(u8, usize)> = (0..64).map(|i| (((i * 7) % 11 < 4) as u8, 0)).collect();
        roundtrip(&bits, 1, Termination::NearOptimal);
    }

    #[test]
    fn predictable_termination_roundtrip() {
        let bits: Vec<(u8, usize)> = (0..64).map(|i| (((i * 5) % 13 < 6) as u8, 0)).collect();
        roundtrip(&bits, 1, Termination::Predictable);
    }

    #[test]
    fn near_optimal_no_longer_than_default() {
        let bits: Vec<(u8, usize)> = (0..96).map(|i| (((i % 7) > 4) as u8, 0)).collect();
        let encode = |term| {
            let mut ctx = [MqContext::default()];
            let mut enc = MqEncoder::new();
            for &(bit, cx) in &bits {
                enc.encode(bit, &mut ctx[cx]);
            }
            enc.finish(term)
        };
        let default = encode(Termination::Default);
        let trimmed = encode(Termination::NearOptimal);
        assert!(trimmed.len() <= default.len());
    }

    #[test]
    fn no_marker_collision_in_output() {
        // Invariant: no 0xFF is ever followed by a byte above 0x8F.
        let mut ctx = [MqContext::default(); 2];
        let mut enc = MqEncoder::new();
        for i in 0..4096usize {
            let bit = ((i * 31) % 17 < 8) as u8;
            enc.encode(bit, &mut ctx[i % 2]);
        }
        let data = enc.finish(Termination::Default);
        for pair in data.windows(2) {
            if pair[0] == 0xFF {
                assert!(pair[1] <= 0x8F, "marker collision: FF {:02X}", pair[1]);
            }
        }
        assert_ne!(data.last(), Some(&0xFF));
    }

    #[test]
    fn empty_input_decodes_deterministically() {
        let mut ctx = MqContext::default();
        let mut dec = MqDecoder::new(&[]);
        for _ in 0..32 {
            // With no data every decision resolves from the 1-fill.
            let _ = dec.decode(&mut ctx);
        }
        assert!(dec.synthetic_fills() > 0);
    }

    #[test]
    fn truncated_input_decodes_deterministically() {
        let bits: Vec<(u8, usize)> = (0..256).map(|i| (((i % 3) == 1) as u8, 0)).collect();
        let mut ctx = [MqContext::default()];
        let mut enc = MqEncoder::new();
        for &(bit, cx) in &bits {
            enc.encode(bit, &mut ctx[cx]);
        }
        let data = enc.finish(Termination::Default);
        let cut = &data[..data.len() / 2];

        let mut c1 = MqContext::default();
        let mut c2 = MqContext::default();
        let mut d1 = MqDecoder::new(cut);
        let mut d2 = MqDecoder::new(cut);
        for _ in 0..bits.len() {
            assert_eq!(d1.decode(&mut c1), d2.decode(&mut c2));
        }
        assert!(d1.synthetic_fills() > 0);
    }
}
