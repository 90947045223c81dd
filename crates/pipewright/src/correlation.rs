use std::collections::HashMap;
use std::collections::hash_map::Entry;

use parking_lot::Mutex;

use crate::engine::TaskId;
use crate::error::{CorrelationViolation, EngineError};

/// Why [`CorrelationTable::submit_and_register`] did not register an entry.
#[derive(Debug)]
pub enum RegisterError<E> {
    /// The engine refused the submission. The entry is handed back.
    Rejected { entry: E, source: EngineError },
    /// The engine returned an id that already has a live entry.
    Duplicate(CorrelationViolation),
}

/// Maps in-flight task ids to the caller state that produced them.
///
/// Each entry has a single owner: it is inserted once when its request is
/// submitted and removed once when the completion is resolved. A second
/// insert for the same id, or a resolve for an id that was never inserted,
/// is a [`CorrelationViolation`].
pub struct CorrelationTable<E> {
    name: String,
    /// Held across an engine submission and the matching insert.
    gate: Mutex<()>,
    entries: Mutex<HashMap<TaskId, E>>,
}

impl<E> CorrelationTable<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gate: Mutex::new(()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self, task: TaskId, entry: E) -> Result<(), CorrelationViolation> {
        match self.entries.lock().entry(task) {
            Entry::Occupied(_) => Err(CorrelationViolation::Duplicate {
                table: self.name.clone(),
                task,
            }),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Removes and returns the entry for `task`.
    ///
    /// Waits for any submission that is between the engine call and its
    /// registration, so a fast completion still finds its entry.
    pub fn resolve(&self, task: TaskId) -> Result<E, CorrelationViolation> {
        drop(self.gate.lock());
        self.entries
            .lock()
            .remove(&task)
            .ok_or_else(|| CorrelationViolation::Unregistered {
                table: self.name.clone(),
                task,
            })
    }

    /// Runs `submit` and registers `entry` under the id it returns, with no
    /// resolve able to slip in between.
    pub fn submit_and_register<F>(&self, entry: E, submit: F) -> Result<TaskId, RegisterError<E>>
    where
        F: FnOnce() -> Result<TaskId, EngineError>,
    {
        let _gate = self.gate.lock();
        match submit() {
            Ok(task) => self
                .register(task, entry)
                .map(|()| task)
                .map_err(RegisterError::Duplicate),
            Err(source) => Err(RegisterError::Rejected { entry, source }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
