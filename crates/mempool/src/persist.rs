//! Pool snapshots written at shutdown and replayed at startup.

use std::fs;
use std::path::Path;

use ledgerd_consensus::money::Amount;
use ledgerd_consensus::Hash256;
use ledgerd_log::log_info;
use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::transaction::Transaction;

use crate::error::{MempoolError, MempoolErrorKind, PersistError};
use crate::pool::Mempool;

pub const MEMPOOL_DUMP_VERSION: u64 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpedTx {
    pub tx: Transaction,
    pub time: i64,
    pub fee_delta: Amount,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MempoolDump {
    /// Pooled transactions, parents first.
    pub txs: Vec<DumpedTx>,
    /// Prioritisations for transactions that were not pooled.
    pub deltas: Vec<(Hash256, Amount)>,
}

impl MempoolDump {
    pub fn from_pool(pool: &Mempool) -> Self {
        let txs: Vec<DumpedTx> = pool
            .info_all()
            .into_iter()
            .map(|info| DumpedTx {
                tx: (*info.tx).clone(),
                time: info.time,
                fee_delta: info.fee_delta,
            })
            .collect();
        let mut deltas: Vec<(Hash256, Amount)> = pool
            .prioritisations()
            .filter(|(txid, _)| !pool.exists(txid))
            .map(|(txid, delta)| (*txid, *delta))
            .collect();
        deltas.sort();
        Self { txs, deltas }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(MEMPOOL_DUMP_VERSION);
        encoder.write_varint(self.txs.len() as u64);
        for entry in &self.txs {
            encoder.write_var_bytes(&entry.tx.consensus_encode());
            encoder.write_i64_le(entry.time);
            encoder.write_i64_le(entry.fee_delta);
        }
        encoder.write_varint(self.deltas.len() as u64);
        for (txid, delta) in &self.deltas {
            encoder.write_bytes(txid);
            encoder.write_i64_le(*delta);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u64_le()?;
        if version != MEMPOOL_DUMP_VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }
        let count = read_count(&mut decoder)?;
        let mut txs = Vec::with_capacity(count.min(16_384));
        for _ in 0..count {
            let raw = decoder.read_var_bytes()?;
            let tx = Transaction::consensus_decode(&raw)?;
            let time = decoder.read_i64_le()?;
            let fee_delta = decoder.read_i64_le()?;
            txs.push(DumpedTx {
                tx,
                time,
                fee_delta,
            });
        }
        let count = read_count(&mut decoder)?;
        let mut deltas = Vec::with_capacity(count.min(16_384));
        for _ in 0..count {
            let txid: Hash256 = decoder.read_fixed()?;
            let delta = decoder.read_i64_le()?;
            deltas.push((txid, delta));
        }
        if !decoder.is_empty() {
            return Err(PersistError::Decode(DecodeError::TrailingBytes));
        }
        Ok(Self { txs, deltas })
    }
}

fn read_count(decoder: &mut Decoder) -> Result<usize, PersistError> {
    let count = decoder.read_varint()?;
    if count > decoder.remaining() as u64 {
        return Err(PersistError::Decode(DecodeError::SizeTooLarge));
    }
    Ok(count as usize)
}

/// Writes the pool to `path`; returns the number of transactions written.
pub fn dump(pool: &Mempool, path: &Path) -> Result<usize, PersistError> {
    let snapshot = MempoolDump::from_pool(pool);
    let bytes = snapshot.encode();
    write_file_atomic(path, &bytes)?;
    log_info!(
        "dumped {} mempool transactions ({} bytes) to {}",
        snapshot.txs.len(),
        bytes.len(),
        path.display()
    );
    Ok(snapshot.txs.len())
}

/// Reads a dump; a missing file is not an error.
pub fn read(path: &Path) -> Result<Option<MempoolDump>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    MempoolDump::decode(&bytes).map(Some)
}

/// Where replayed transactions go. The node re-admits them through the
/// normal admission path while holding its locks.
pub trait MempoolLoader {
    fn prioritise(&mut self, txid: Hash256, delta: Amount);
    fn admit(&mut self, tx: Transaction, time: i64) -> Result<(), MempoolError>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LoadStats {
    pub accepted: usize,
    pub failed: usize,
    pub expired: usize,
    pub already_there: usize,
}

/// Replays the dump at `path`, skipping entries that entered at least
/// `expiry_secs` before `now`.
pub fn load<L: MempoolLoader>(
    path: &Path,
    now: i64,
    expiry_secs: i64,
    loader: &mut L,
) -> Result<LoadStats, PersistError> {
    let mut stats = LoadStats::default();
    let Some(snapshot) = read(path)? else {
        return Ok(stats);
    };
    for entry in snapshot.txs {
        let txid = entry.tx.txid();
        if entry.fee_delta != 0 {
            loader.prioritise(txid, entry.fee_delta);
        }
        if entry.time.saturating_add(expiry_secs) <= now {
            stats.expired += 1;
            continue;
        }
        match loader.admit(entry.tx, entry.time) {
            Ok(()) => stats.accepted += 1,
            Err(err) if err.kind == MempoolErrorKind::AlreadyInMempool => {
                stats.already_there += 1
            }
            Err(_) => stats.failed += 1,
        }
    }
    for (txid, delta) in snapshot.deltas {
        loader.prioritise(txid, delta);
    }
    log_info!(
        "imported mempool transactions from disk: {} succeeded, {} failed, {} expired, {} already there",
        stats.accepted,
        stats.failed,
        stats.expired,
        stats.already_there
    );
    Ok(stats)
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{LockPoints, MempoolEntry};
    use crate::policy::{MempoolLimits, MempoolPolicy};
    use ledgerd_primitives::outpoint::OutPoint;
    use ledgerd_primitives::transaction::{TxIn, TxOut};
    use std::sync::Arc;

    fn tx(prevout: OutPoint) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(prevout, vec![0x51; 12])],
            vout: vec![TxOut {
                value: 500,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    struct Replay {
        pool: Mempool,
    }

    impl MempoolLoader for Replay {
        fn prioritise(&mut self, txid: Hash256, delta: Amount) {
            self.pool.prioritise_transaction(txid, delta);
        }

        fn admit(&mut self, tx: Transaction, time: i64) -> Result<(), MempoolError> {
            if self.pool.exists(&tx.txid()) {
                return Err(MempoolError::new(MempoolErrorKind::AlreadyInMempool, "known"));
            }
            let entry =
                MempoolEntry::new(Arc::new(tx), 1000, time, 1, false, 0, LockPoints::default());
            let ancestors = self.pool.calculate_ancestors(&entry, &MempoolLimits::default())?;
            self.pool.add_unchecked(entry, &ancestors);
            Ok(())
        }
    }

    #[test]
    fn dump_then_load_restores_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mempool.dat");
        let mut replay = Replay {
            pool: Mempool::new(&MempoolPolicy::default()),
        };
        let parent = tx(OutPoint::new([1u8; 32], 0));
        let child = tx(OutPoint::new(parent.txid(), 0));
        let stale = tx(OutPoint::new([2u8; 32], 0));
        replay.admit(parent.clone(), 1_000).expect("parent");
        replay.admit(child.clone(), 1_001).expect("child");
        replay.admit(stale.clone(), 10).expect("stale");
        replay.prioritise(child.txid(), 77);
        replay.prioritise([9u8; 32], -5);

        assert_eq!(dump(&replay.pool, &path).expect("dump"), 3);
        let snapshot = read(&path).expect("read").expect("present");
        assert_eq!(snapshot.deltas, vec![([9u8; 32], -5)]);
        let position = |wanted: &Transaction| {
            snapshot
                .txs
                .iter()
                .position(|entry| &entry.tx == wanted)
                .expect("dumped")
        };
        assert!(position(&parent) < position(&child));

        let mut fresh = Replay {
            pool: Mempool::new(&MempoolPolicy::default()),
        };
        let stats = load(&path, 2_000, 1_500, &mut fresh).expect("load");
        assert_eq!(
            stats,
            LoadStats {
                accepted: 2,
                failed: 0,
                expired: 1,
                already_there: 0,
            }
        );
        assert!(fresh.pool.exists(&child.txid()));
        assert!(!fresh.pool.exists(&stale.txid()));
        assert_eq!(fresh.pool.apply_delta(&child.txid()), 77);
        assert_eq!(fresh.pool.apply_delta(&[9u8; 32]), -5);
        assert_eq!(fresh.pool.entry(&child.txid()).expect("child").time(), 1_001);
        fresh.pool.check_structure().expect("consistent");

        let again = load(&path, 2_000, 1_500, &mut fresh).expect("reload");
        assert_eq!(again.already_there, 2);
    }

    #[test]
    fn missing_and_corrupt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.dat");
        assert!(read(&path).expect("absent").is_none());

        fs::write(&path, [2u8, 0, 0, 0, 0, 0, 0, 0, 0, 0]).expect("write");
        assert!(matches!(read(&path), Err(PersistError::UnsupportedVersion(2))));

        let mut bytes = MempoolDump::default().encode();
        bytes.push(1);
        fs::write(&path, bytes).expect("write");
        assert!(read(&path).is_err());
    }
}
