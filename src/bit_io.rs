//! Raw bit I/O for arithmetic-bypass coding passes (D.5).
//!
//! Raw segments pack bits MSB-first under the same marker-avoidance rule as
//! the MQ byte stream: the byte following an emitted 0xFF carries only seven
//! data bits, with bit 7 forced to zero.

use log::warn;

/// Bit packer for raw coding passes.
pub struct RawBitWriter {
    out: Vec<u8>,
    acc: u8,
    used: u8,
    limit: u8,
}

impl Default for RawBitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RawBitWriter {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            acc: 0,
            used: 0,
            limit: 8,
        }
    }

    pub fn put_bit(&mut self, bit: u8) {
        self.acc = (self.acc << 1) | (bit & 1);
        self.used += 1;
        if self.used == self.limit {
            self.out.push(self.acc);
            self.limit = if self.acc == 0xFF { 7 } else { 8 };
            self.acc = 0;
            self.used = 0;
        }
    }

    /// Upper bound on the segment length if terminated now.
    pub fn pending_len(&self) -> usize {
        self.out.len() + usize::from(self.used > 0)
    }

    /// Terminate the raw segment: zero-pad the final partial byte. A raw
    /// segment never ends on 0xFF.
    pub fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.acc <<= self.limit - self.used;
            self.out.push(self.acc);
        }
        if self.out.last() == Some(&0xFF) {
            self.out.push(0x00);
        }
        self.out
    }
}

/// Bit reader for raw coding passes. Past the end of input it returns
/// 1-bits and flags the overrun, mirroring the MQ decoder's end-of-segment
/// behaviour.
pub struct RawBitReader<'a> {
    data: &'a [u8],
    pos: usize,
    cur: u8,
    left: u8,
    prev_ff: bool,
    overrun: bool,
}

impl<'a> RawBitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            cur: 0,
            left: 0,
            prev_ff: false,
            overrun: false,
        }
    }

    pub fn read_bit(&mut self) -> u8 {
        if self.left == 0 {
            if self.pos >= self.data.len() {
                if !self.overrun {
                    warn!("raw segment exhausted, synthesising 1-bits");
                    self.overrun = true;
                }
                return 1;
            }
            self.cur = self.data[self.pos];
            self.pos += 1;
            // A byte after 0xFF carries seven bits; bit 7 is the stuff bit.
            self.left = if self.prev_ff { 7 } else { 8 };
            self.prev_ff = self.cur == 0xFF;
        }
        self.left -= 1;
        (self.cur >> self.left) & 1
    }

    pub fn overrun(&self) -> bool {
        self.overrun
    }
}
