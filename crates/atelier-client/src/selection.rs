//! Persistence of the active company/branch selection.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use atelier_core::{BranchId, CompanyId};

/// The active company/branch pair, restored on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSelection {
    /// The selected company.
    pub company_id: CompanyId,
    /// The selected branch, if any.
    pub branch_id: Option<BranchId>,
}

/// Where the selection is persisted between runs.
///
/// The browser app backs this with local storage; tests and headless
/// consumers use [`MemorySelectionStorage`].
pub trait SelectionStorage: Send + Sync {
    /// The stored selection, if any.
    fn load(&self) -> Option<ActiveSelection>;
    /// Persist a selection.
    fn save(&self, selection: &ActiveSelection);
    /// Drop the stored selection.
    fn clear(&self);
}

/// In-memory selection storage.
#[derive(Debug, Default)]
pub struct MemorySelectionStorage {
    inner: Mutex<Option<ActiveSelection>>,
}

impl MemorySelectionStorage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStorage for MemorySelectionStorage {
    fn load(&self) -> Option<ActiveSelection> {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn save(&self, selection: &ActiveSelection) {
        match self.inner.lock() {
            Ok(mut guard) => *guard = Some(*selection),
            Err(poisoned) => *poisoned.into_inner() = Some(*selection),
        }
    }

    fn clear(&self) {
        match self.inner.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}
