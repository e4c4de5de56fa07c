//! Persistent backend: one fjall partition per [`Column`].

use std::path::Path;
use std::time::{Duration, Instant};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

/// Commits slower than this are reported with their column mix.
const SLOW_COMMIT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, Default)]
pub struct FjallOptions {
    /// Block cache shared by all partitions; fjall's default when unset.
    pub cache_bytes: Option<u64>,
    /// Sync every batch instead of leaving it to the journal flusher.
    pub sync_commits: bool,
}

pub struct FjallStore {
    keyspace: Keyspace,
    columns: Vec<(Column, PartitionHandle)>,
    commit_mode: PersistMode,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        let keyspace = config.open().map_err(backend)?;
        let columns = Column::ALL
            .into_iter()
            .map(|column| {
                keyspace
                    .open_partition(column.as_str(), PartitionCreateOptions::default())
                    .map(|handle| (column, handle))
                    .map_err(backend)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let commit_mode = if options.sync_commits {
            PersistMode::SyncAll
        } else {
            PersistMode::Buffer
        };
        Ok(Self {
            keyspace,
            columns,
            commit_mode,
        })
    }

    /// Forces journals to disk; called on shutdown.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(backend)
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.columns
            .get(column.index())
            .filter(|(stored, _)| *stored == column)
            .map(|(_, handle)| handle)
            .ok_or_else(|| StoreError::Backend(format!("no partition for {}", column.as_str())))
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(backend)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut rows = Vec::new();
        self.for_each_prefix(column, prefix, &mut |key: &[u8], value: &[u8]| {
            rows.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(rows)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for row in self.partition(column)?.prefix(prefix) {
            let (key, value) = row.map_err(backend)?;
            visitor(&key, &value)?;
        }
        Ok(())
    }

    /// Commits the whole batch through one fjall batch, so a crash keeps
    /// either every row of a flush or none of them.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pending = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(self.commit_mode));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    pending.insert(self.partition(*column)?, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    pending.remove(self.partition(*column)?, key.as_slice());
                }
            }
        }
        let started = Instant::now();
        pending.commit().map_err(backend)?;
        let elapsed = started.elapsed();
        if elapsed >= SLOW_COMMIT {
            ledgerd_log::log_warn!(
                "slow store commit: {}ms for {} ops (index {}, undo {}, coins {})",
                elapsed.as_millis(),
                batch.len(),
                batch.count_in(Column::BlockIndex),
                batch.count_in(Column::BlockUndo),
                batch.count_in(Column::Coins),
            );
        }
        Ok(())
    }
}

fn backend(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
