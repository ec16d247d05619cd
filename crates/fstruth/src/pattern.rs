//! Deterministic content patterns.
//!
//! A pattern is an infinite byte stream addressed by offset.  Any window of it
//! can be produced without generating what comes before, so the same bytes can
//! be written to the image in arbitrary order and later re-derived when
//! computing the expected fingerprint.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of one line of [`Pattern::NumberedLines`], newline included.
pub const LINE_WIDTH: u64 = 80;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Pattern {
    /// Pseudo-random bytes derived from `seed` in counter mode.
    Seeded { seed: u64 },
    /// Text lines of 80 columns: the 1-based line number and a space,
    /// right-padded with `0` to 79 characters, then `\n`.
    #[default]
    NumberedLines,
    /// All zero bytes (written out, not a hole).
    Zeros,
    /// The given text, repeated.
    Text { text: String },
}

impl Pattern {
    /// Fills `buf` with the pattern bytes starting at pattern offset `offset`.
    pub fn fill(&self, offset: u64, buf: &mut [u8]) {
        match self {
            Pattern::Seeded { seed } => fill_seeded(*seed, offset, buf),
            Pattern::NumberedLines => fill_numbered(offset, buf),
            Pattern::Zeros => buf.fill(0),
            Pattern::Text { text } => {
                let text = text.as_bytes();
                if text.is_empty() {
                    buf.fill(0);
                    return;
                }
                let mut pos = (offset % text.len() as u64) as usize;
                for byte in buf.iter_mut() {
                    *byte = text[pos];
                    pos = (pos + 1) % text.len();
                }
            }
        }
    }

    /// Produces `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.fill(offset, &mut buf);
        buf
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Seeded { seed } => write!(f, "seed({seed})"),
            Pattern::NumberedLines => f.write_str("numbered-lines"),
            Pattern::Zeros => f.write_str("zeros"),
            Pattern::Text { text } => write!(f, "text({text:?})"),
        }
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn seeded_word(seed: u64, block: u64) -> [u8; 8] {
    splitmix64(seed ^ splitmix64(block)).to_le_bytes()
}

fn fill_seeded(seed: u64, offset: u64, buf: &mut [u8]) {
    let mut block = offset / 8;
    let mut word = seeded_word(seed, block);
    let mut within = (offset % 8) as usize;
    for byte in buf.iter_mut() {
        if within == 8 {
            block += 1;
            word = seeded_word(seed, block);
            within = 0;
        }
        *byte = word[within];
        within += 1;
    }
}

fn numbered_line(number: u64) -> Vec<u8> {
    let mut line = format!("{:0<79}", format!("{number} ")).into_bytes();
    line.push(b'\n');
    line
}

fn fill_numbered(offset: u64, buf: &mut [u8]) {
    let mut number = offset / LINE_WIDTH + 1;
    let mut column = (offset % LINE_WIDTH) as usize;
    let mut line = numbered_line(number);
    for byte in buf.iter_mut() {
        if column == line.len() {
            number += 1;
            line = numbered_line(number);
            column = 0;
        }
        *byte = line[column];
        column += 1;
    }
}
