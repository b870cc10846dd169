//! Crash-recovery journal of pending patch ops, backed by redb.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::patch::PatchOperation;

/// Op id → JSON-serialized [`PatchOperation`].
const PATCH_OPS: TableDefinition<u64, &[u8]> = TableDefinition::new("patch_ops");

macro_rules! map_err {
    () => {
        |e| SyncError::Journal(e.to_string())
    };
}

#[derive(Clone)]
pub struct OpsJournal {
    db: Arc<Database>,
}

impl OpsJournal {
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(map_err!())?;
        let journal = Self { db: Arc::new(db) };
        journal.ensure_table()?;
        debug!(?path, "ops journal opened");
        Ok(journal)
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!())?;
        let journal = Self { db: Arc::new(db) };
        journal.ensure_table()?;
        Ok(journal)
    }

    fn ensure_table(&self) -> SyncResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        txn.open_table(PATCH_OPS).map_err(map_err!())?;
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    /// Replace the journal contents with `ops`.
    pub fn persist(&self, ops: &[PatchOperation]) -> SyncResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(PATCH_OPS).map_err(map_err!())?;
            let stale: Vec<u64> = table
                .iter()
                .map_err(map_err!())?
                .map(|entry| entry.map(|(key, _)| key.value()))
                .collect::<Result<_, _>>()
                .map_err(map_err!())?;
            for id in stale {
                table.remove(id).map_err(map_err!())?;
            }
            for op in ops {
                let value = serde_json::to_vec(op).map_err(|e| SyncError::Serialize(e.to_string()))?;
                table.insert(op.id, value.as_slice()).map_err(map_err!())?;
            }
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    /// Journaled ops in id order.
    pub fn load(&self) -> SyncResult<Vec<PatchOperation>> {
        let txn = self.db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(PATCH_OPS).map_err(map_err!())?;
        let mut ops = Vec::new();
        for entry in table.iter().map_err(map_err!())? {
            let (_, value) = entry.map_err(map_err!())?;
            let op: PatchOperation =
                serde_json::from_slice(value.value()).map_err(|e| SyncError::Serialize(e.to_string()))?;
            ops.push(op);
        }
        Ok(ops)
    }
}
