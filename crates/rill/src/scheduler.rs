//! Cooperative scheduling of local actors.
//!
//! The node runs single-threaded: each tick the scheduler picks the next
//! enabled actor for an execution turn (the turn body belongs to the
//! excluded execution engine; the runtime only rotates fairly) and the
//! node loop dispatches any replication operation this node leads.

use crate::id::ActorId;

#[derive(Debug, Default)]
pub struct Scheduler {
    cursor: usize,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round-robin over the currently enabled actors. Stable across
    /// membership changes as long as the slice stays sorted.
    pub fn next_turn(&mut self, enabled: &[ActorId]) -> Option<ActorId> {
        if enabled.is_empty() {
            return None;
        }
        let pick = enabled[self.cursor % enabled.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(pick)
    }
}
