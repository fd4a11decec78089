use std::collections::VecDeque;

/// Serialized envelopes waiting for the relay to open.
///
/// Frames leave in the order they were pushed. A frame that could not be
/// written goes back to the head with [`OutboundQueue::requeue`], so the order
/// survives a failed flush.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<String>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: String) {
        self.frames.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    pub fn requeue(&mut self, frame: String) {
        self.frames.push_front(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drops every pending frame and returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        dropped
    }
}
