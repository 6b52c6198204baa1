//! Incremental UTF-8 decoding of process output.
//!
//! Pipes hand us bytes in whatever chunks the OS chooses, so a multi-byte character can be
//! split across two reads. The decoder withholds an incomplete trailing sequence until the
//! next chunk arrives instead of decoding it early and corrupting it.

/// Longest UTF-8 sequence; also the furthest we ever look back for a boundary.
const MAX_SEQUENCE_LEN: usize = 4;

/// Decodes `buffer ++ chunk` up to the last complete character.
///
/// Returns the decoded text and the bytes that must be carried into the next call.
/// Malformed input is decoded with U+FFFD replacement characters rather than rejected.
pub fn feed(buffer: &[u8], chunk: &[u8]) -> (String, Vec<u8>) {
    let mut combined = Vec::with_capacity(buffer.len() + chunk.len());
    combined.extend_from_slice(buffer);
    combined.extend_from_slice(chunk);
    let boundary = complete_prefix_len(&combined);
    let carry = combined.split_off(boundary);
    (String::from_utf8_lossy(&combined).into_owned(), carry)
}

/// Decodes whatever is left in `buffer` once the stream has ended.
pub fn flush(buffer: &[u8]) -> String {
    String::from_utf8_lossy(buffer).into_owned()
}

fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(MAX_SEQUENCE_LEN) {
        let idx = len - back;
        let byte = bytes[idx];
        if byte & 0x80 == 0 {
            return idx + 1;
        }
        if byte & 0xC0 == 0xC0 {
            return if back < sequence_len(byte) { idx } else { len };
        }
    }
    // Only continuation bytes in reach: nothing later can complete them.
    len
}

fn sequence_len(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}

/// Owns the carried bytes for one output stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    carry: Vec<u8>,
}

impl StreamDecoder {
    /// Decodes `chunk` after any carried bytes, holding back an incomplete trailing character.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let (text, carry) = feed(&self.carry, chunk);
        self.carry = carry;
        text
    }

    /// Drains the carry at end of stream.
    pub fn finish(&mut self) -> String {
        let text = flush(&self.carry);
        self.carry.clear();
        text
    }

    /// Number of bytes waiting for the rest of their character.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}
