//! Registry of running sequencers, one per workspace.
//!
//! Sequencers are started lazily on first use and retire themselves when
//! idle. The registry lock is held only to look up or insert a handle; all
//! workspace state lives inside the actor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sequencer::{self, SequencerConfig, SequencerHandle};
use crate::storage::{Storage, StorageError};

/// Lazily-populated map from workspace id to its sequencer.
pub struct Hub {
    storage: Arc<dyn Storage>,
    config: SequencerConfig,
    actors: Mutex<HashMap<String, SequencerHandle>>,
}

impl Hub {
    /// Creates an empty hub over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, config: SequencerConfig) -> Self {
        Self {
            storage,
            config,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the sequencer for `workspace`, starting it if needed.
    ///
    /// A sequencer that has retired is replaced, and handles of other
    /// retired sequencers are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if a new sequencer cannot read its log head.
    pub fn sequencer(&self, workspace: &str) -> Result<SequencerHandle, StorageError> {
        let mut actors = self.actors.lock();
        actors.retain(|_, handle| !handle.is_closed());
        if let Some(handle) = actors.get(workspace) {
            return Ok(handle.clone());
        }
        let handle = sequencer::spawn(workspace, Arc::clone(&self.storage), self.config.clone())?;
        actors.insert(workspace.to_string(), handle.clone());
        Ok(handle)
    }

    /// Number of registered sequencers, including retired ones not yet
    /// pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.lock().len()
    }

    /// Returns `true` if no sequencer has been started.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.lock().is_empty()
    }
}
