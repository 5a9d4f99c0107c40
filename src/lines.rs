//! Newline reassembly for byte streams that arrive in arbitrary chunks.
//!
//! Both the backend's stdout and its SSE endpoint deliver text in chunks
//! whose boundaries have nothing to do with line boundaries. [`LineBuffer`]
//! accumulates raw bytes, hands out every complete line, and keeps the
//! trailing partial line for the next chunk. Splitting happens on bytes, so a
//! multi-byte UTF-8 character cut across two chunks is rejoined before decoding.

/// Accumulates chunks and yields complete `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line completed by it, without the `\n`.
    ///
    /// Concatenating each returned line plus `\n`, followed by
    /// [`remainder`](Self::remainder), reproduces everything pushed so far
    /// that has not been returned earlier.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Bytes of the trailing partial line not yet terminated by `\n`.
    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }

    /// Consume the buffer, returning the unterminated tail if any (used at EOF).
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}
