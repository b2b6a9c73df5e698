//! Bounded host-side buffer of mirrored guest log lines.

use std::collections::VecDeque;

use crate::protocol::LogEntry;

/// Default number of retained log entries.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// Default number of entries attached to a [`SandboxError`](crate::SandboxError).
pub const DEFAULT_ERROR_LOG_TAIL: usize = 40;

/// FIFO log buffer that keeps the newest `capacity` entries.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    dropped: usize,
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries evicted so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// The newest `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Consume the buffer, returning all retained entries oldest first.
    pub fn into_vec(self) -> Vec<LogEntry> {
        self.entries.into()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LogLevel;

    fn entry(i: u64) -> LogEntry {
        LogEntry {
            level: LogLevel::Info,
            message: format!("line {i}"),
            elapsed_ms: i,
        }
    }

    #[test]
    fn retains_newest_entries() {
        let mut buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push(entry(i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.dropped(), 2);
        let kept: Vec<_> = buf.into_vec().into_iter().map(|e| e.elapsed_ms).collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn tail_is_ordered_oldest_first() {
        let mut buf = LogBuffer::new(10);
        for i in 0..6 {
            buf.push(entry(i));
        }
        let tail: Vec<_> = buf.tail(2).into_iter().map(|e| e.elapsed_ms).collect();
        assert_eq!(tail, vec![4, 5]);
        assert_eq!(buf.tail(100).len(), 6);
    }

    #[test]
    fn zero_capacity_still_keeps_one() {
        let mut buf = LogBuffer::new(0);
        buf.push(entry(1));
        buf.push(entry(2));
        assert_eq!(buf.tail(5)[0].elapsed_ms, 2);
    }
}
