//! Per-job console capture.
//!
//! The worker begins a capture before each job and takes the buffer when the
//! job ends. Only one job runs at a time, so a single buffer suffices.

use weft_common::ConsoleEntry;

#[derive(Debug, Default)]
pub struct ConsoleCapture {
    entries: Vec<ConsoleEntry>,
}

impl ConsoleCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards anything left over from a previous job.
    pub fn begin(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, entry: ConsoleEntry) {
        tracing::debug!(
            target: "weft::console",
            console_level = entry.level.as_str(),
            "{}",
            entry.message
        );
        self.entries.push(entry);
    }

    pub fn take(&mut self) -> Vec<ConsoleEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
