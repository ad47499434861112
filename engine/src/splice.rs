//! Stream-text stop splicing.
//!
//! While streaming decoded text, a stop string can arrive split across
//! chunks. The splicer withholds any trailing text that is a proper prefix
//! of a stop string, emits it only once it turns out not to complete the
//! stop, and truncates the stream exactly at the first stop occurrence.
//! Chat and text completions share this one implementation.

/// Result of feeding one chunk to the splicer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplicedChunk {
    /// Emit this text downstream.
    Text(String),
    /// Nothing safe to emit yet; the chunk (or its tail) is buffered.
    Hold,
    /// A stop string completed; emit this final prefix and terminate.
    Stopped(String),
}

/// Stateful stop-splicer over a stream of decoded text chunks.
#[derive(Debug)]
pub struct StreamSplicer {
    stops: Vec<String>,
    /// All text received so far.
    total: String,
    /// Bytes of `total` already emitted downstream.
    emitted: usize,
    /// Received but not yet emitted (potential stop prefix).
    buffer: String,
    stopped: bool,
}

impl StreamSplicer {
    /// Splicer for the given stop strings. With no stops every chunk passes
    /// straight through.
    pub fn new(stops: Vec<String>) -> Self {
        Self {
            stops: stops.into_iter().filter(|s| !s.is_empty()).collect(),
            total: String::new(),
            emitted: 0,
            buffer: String::new(),
            stopped: false,
        }
    }

    /// Feed one decoded chunk.
    pub fn push(&mut self, chunk: &str) -> SplicedChunk {
        if self.stopped {
            return SplicedChunk::Hold;
        }
        self.total.push_str(chunk);
        self.buffer.push_str(chunk);

        // A completed stop truncates the stream at its first occurrence.
        if let Some(pos) =
            self.stops.iter().filter_map(|stop| self.total.find(stop.as_str())).min()
        {
            self.stopped = true;
            let keep = pos.saturating_sub(self.emitted).min(self.buffer.len());
            let out: String = self.buffer[..keep].to_string();
            self.buffer.clear();
            self.emitted += out.len();
            return SplicedChunk::Stopped(out);
        }

        // Withhold the longest trailing run that could still grow into a
        // stop string.
        let hold = self
            .stops
            .iter()
            .map(|stop| longest_held_prefix(&self.total, stop))
            .max()
            .unwrap_or(0);
        let emit_len = floor_char_boundary(&self.buffer, self.buffer.len().saturating_sub(hold));
        if emit_len == 0 {
            return SplicedChunk::Hold;
        }
        let out: String = self.buffer.drain(..emit_len).collect();
        self.emitted += out.len();
        SplicedChunk::Text(out)
    }

    /// Whether a stop string already completed.
    pub fn finished_by_stop(&self) -> bool {
        self.stopped
    }

    /// Flush the held tail at end of stream. Text withheld as a potential
    /// stop prefix that never completed is still part of the output.
    pub fn finish(&mut self) -> Option<String> {
        if self.stopped || self.buffer.is_empty() {
            return None;
        }
        let out = std::mem::take(&mut self.buffer);
        self.emitted += out.len();
        Some(out)
    }
}

/// Longest proper prefix of `stop` that `total` ends with, in bytes.
fn longest_held_prefix(total: &str, stop: &str) -> usize {
    let mut longest = 0;
    for (idx, _) in stop.char_indices().skip(1) {
        if total.ends_with(&stop[..idx]) {
            longest = longest.max(idx);
        }
    }
    longest
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
