//! Rate limiting for live text deltas.
//!
//! Drafts are offered on every keystroke. Only the latest value per task is
//! kept, and a task is sent at most once per interval. Anything newer than
//! the last send waits in the buffer until [`DeltaThrottle::due`] releases it.

use std::collections::HashMap;
use std::time::Duration;

use boardsync_proto::TaskField;
use tokio::time::Instant;

/// A draft ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Task being edited.
    pub task_id: String,
    /// Field being edited.
    pub field: TaskField,
    /// Latest value.
    pub value: String,
}

/// Keeps the latest draft per task and spaces out sends.
#[derive(Debug)]
pub struct DeltaThrottle {
    interval: Duration,
    last_sent: HashMap<String, Instant>,
    waiting: HashMap<String, (TaskField, String)>,
}

impl DeltaThrottle {
    /// Creates a throttle allowing one send per task per `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    /// Offers a new draft. Returns it if it may be sent now; otherwise it
    /// replaces any buffered draft for the same task.
    pub fn offer(&mut self, draft: Draft, now: Instant) -> Option<Draft> {
        self.forget_expired(now);
        if self.ready(&draft.task_id, now) {
            self.waiting.remove(&draft.task_id);
            self.last_sent.insert(draft.task_id.clone(), now);
            return Some(draft);
        }
        self.waiting
            .insert(draft.task_id, (draft.field, draft.value));
        None
    }

    /// Releases buffered drafts whose interval has elapsed.
    pub fn due(&mut self, now: Instant) -> Vec<Draft> {
        self.forget_expired(now);
        let ready: Vec<String> = self
            .waiting
            .keys()
            .filter(|task| self.ready(task, now))
            .cloned()
            .collect();
        ready
            .into_iter()
            .filter_map(|task_id| {
                let (field, value) = self.waiting.remove(&task_id)?;
                self.last_sent.insert(task_id.clone(), now);
                Some(Draft {
                    task_id,
                    field,
                    value,
                })
            })
            .collect()
    }

    /// Returns `true` if drafts are waiting.
    #[must_use]
    pub fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    /// Forgets all state, e.g. after a reconnect.
    pub fn clear(&mut self) {
        self.last_sent.clear();
        self.waiting.clear();
    }

    /// Drops send times that no longer hold anything back.
    fn forget_expired(&mut self, now: Instant) {
        let interval = self.interval;
        let waiting = &self.waiting;
        self.last_sent.retain(|task, at| {
            waiting.contains_key(task) || now.saturating_duration_since(*at) < interval
        });
    }

    fn ready(&self, task_id: &str, now: Instant) -> bool {
        self.last_sent
            .get(task_id)
            .is_none_or(|at| now.saturating_duration_since(*at) >= self.interval)
    }
}
