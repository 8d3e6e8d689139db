//! In-memory backend
//!
//! State lives only as long as the process. Stores skip building journal
//! ops entirely because [`NullJournal`] reports itself as non-durable.

use std::sync::Arc;

use super::error::Result;
use super::journal::{Journal, JournalOp, LoadedState};
use super::local::{LocalPersistence, StoreSettings};

/// Journal that keeps nothing
#[derive(Debug, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn load(&self) -> Result<LoadedState> {
        Ok(LoadedState::default())
    }

    fn apply(&self, _ops: Vec<JournalOp>) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

impl LocalPersistence {
    /// Backend that keeps everything in process memory
    pub fn memory(settings: StoreSettings) -> Self {
        Self::new(Arc::new(NullJournal), settings)
    }
}
