//! Time-sorted sliding window over incoming messages.
//!
//! Messages are kept ascending by timestamp. A prefix is only released once
//! enough newer data has arrived behind it, so that matches for the
//! released messages have had a chance to show up first.

use std::collections::VecDeque;

/// Anything carrying a message timestamp (milliseconds since epoch).
pub trait Timestamped {
    fn timestamp_ms(&self) -> i64;
}

/// Sorted window of messages with a target span.
#[derive(Debug, Clone)]
pub struct MessageBuffer<T> {
    messages: VecDeque<T>,
    target_window_size_ms: i64,
}

impl<T: Timestamped> MessageBuffer<T> {
    pub fn new(target_window_size_ms: i64) -> Self {
        Self {
            messages: VecDeque::new(),
            target_window_size_ms,
        }
    }

    /// Inserts `msg` behind every message with an equal or earlier timestamp.
    pub fn append(&mut self, msg: T) {
        let ts = msg.timestamp_ms();
        let idx = self.messages.partition_point(|m| m.timestamp_ms() <= ts);
        self.messages.insert(idx, msg);
    }

    /// Removes and returns the oldest messages beyond the target window.
    ///
    /// Nothing is returned unless the messages after the first
    /// `min_slice_length_ms` of the buffer still span the full target
    /// window. If they do, messages are popped from the front for as long
    /// as the buffer stays healthy.
    pub fn pop_slice(&mut self, min_slice_length_ms: i64) -> Vec<T> {
        let (Some(first), Some(last)) = (self.messages.front(), self.messages.back()) else {
            return Vec::new();
        };
        let start = first.timestamp_ms();
        let end = last.timestamp_ms();

        let cutoff = self
            .messages
            .iter()
            .position(|m| m.timestamp_ms() >= start + min_slice_length_ms)
            .unwrap_or(self.messages.len() - 1);
        let cutoff_ts = self.messages[cutoff].timestamp_ms();
        if end - cutoff_ts < self.target_window_size_ms {
            return Vec::new();
        }

        let mut slice = Vec::new();
        while self.is_healthy() {
            match self.messages.pop_front() {
                Some(msg) => slice.push(msg),
                None => break,
            }
        }
        slice
    }

    /// True if the buffer spans at least the target window.
    pub fn is_healthy(&self) -> bool {
        self.span_ms()
            .is_some_and(|span| span >= self.target_window_size_ms)
    }

    /// Time between the oldest and newest message.
    pub fn span_ms(&self) -> Option<i64> {
        match (self.messages.front(), self.messages.back()) {
            (Some(first), Some(last)) => Some(last.timestamp_ms() - first.timestamp_ms()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.messages.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.messages.iter()
    }

    pub fn target_window_size_ms(&self) -> i64 {
        self.target_window_size_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        ts: i64,
        tag: u32,
    }

    impl Timestamped for Msg {
        fn timestamp_ms(&self) -> i64 {
            self.ts
        }
    }

    fn msg(ts: i64) -> Msg {
        Msg { ts, tag: 0 }
    }

    #[test]
    fn test_is_healthy() {
        let mut testee = MessageBuffer::new(1000);
        testee.append(msg(10_000));
        assert!(!testee.is_healthy());

        testee.append(msg(11_000));
        assert!(testee.is_healthy());
    }

    #[test]
    fn test_append_keeps_order_and_is_stable() {
        let mut testee = MessageBuffer::new(1000);
        testee.append(Msg { ts: 300, tag: 1 });
        testee.append(Msg { ts: 100, tag: 2 });
        testee.append(Msg { ts: 300, tag: 3 });
        testee.append(Msg { ts: 200, tag: 4 });

        let tags: Vec<u32> = testee.iter().map(|m| m.tag).collect();
        assert_eq!(tags, vec![2, 4, 1, 3]);
        assert_eq!(testee.get(0).map(|m| m.ts), Some(100));
    }

    #[test]
    fn test_pop_slice() {
        let mut testee = MessageBuffer::new(1000);

        // TS interval [10000-11000]
        for ts in (10_000..=11_000).step_by(100) {
            testee.append(msg(ts));
        }
        assert!(testee.pop_slice(200).is_empty());

        testee.append(msg(11_100));
        testee.append(msg(11_200));
        assert!(testee.pop_slice(400).is_empty());

        let slice = testee.pop_slice(200);
        let stamps: Vec<i64> = slice.iter().map(|m| m.ts).collect();
        assert_eq!(stamps, vec![10_000, 10_100, 10_200]);

        // The remainder no longer spans the window
        assert!(!testee.is_healthy());
        assert_eq!(testee.len(), 10);
    }

    #[test]
    fn test_pop_slice_drains_while_healthy() {
        let mut testee = MessageBuffer::new(500);
        for ts in (0..=2_000).step_by(250) {
            testee.append(msg(ts));
        }

        let slice = testee.pop_slice(100);

        assert_eq!(slice.len(), 7);
        assert_eq!(testee.span_ms(), Some(250));
    }

    #[test]
    fn test_pop_slice_empty() {
        let mut testee: MessageBuffer<Msg> = MessageBuffer::new(1000);
        assert!(testee.pop_slice(100).is_empty());
    }
}
