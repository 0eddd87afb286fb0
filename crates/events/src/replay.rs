//! Deterministic iteration over a recorded event buffer.

use crate::Event;

/// Cursor over a captured event buffer.
///
/// Replaying the same buffer always yields the identical sequence, which is
/// what scenario tests assert against.
#[derive(Debug, Clone)]
pub struct Replay {
    events: Vec<Event>,
    index: usize,
}

impl Replay {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events, index: 0 }
    }

    /// Next event, advancing the cursor.
    pub fn next(&mut self) -> Option<&Event> {
        let event = self.events.get(self.index)?;
        self.index += 1;
        Some(event)
    }

    pub fn has_next(&self) -> bool {
        self.index < self.events.len()
    }

    /// Rewind to the beginning.
    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.index
    }
}
