pub mod config;
pub mod controller;

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use fs2::FileExt;
use ledgerd_log as logging;
use ledgerd_log::{log_error, log_info, log_warn};
use ledgerd_primitives::block::Block;
use ledgerd_script::{AcceptAll, CheckQueue, InlineCheckQueue, ParallelCheckQueue, ScriptVerifier};
use ledgerd_storage::fjall::FjallStore;
use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

use crate::config::{parse_args, usage, Backend, CliAction, Config};
use crate::controller::{ChainStateController, ChainStateError};

pub const MEMPOOL_FILE_NAME: &str = "mempool.dat";
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const IMPORT_QUEUE_DEPTH: usize = 16;
/// Upper bound on a single framed block in an import file.
const MAX_IMPORT_BLOCK_BYTES: usize = 4 * 1024 * 1024;

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    fn open(config: &Config) -> Result<Self, String> {
        match config.backend {
            Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
            Backend::Fjall => {
                let path = config.data_dir.join("db");
                FjallStore::open(&path)
                    .map(Store::Fjall)
                    .map_err(|err| format!("failed to open store at {}: {err}", path.display()))
            }
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(_) => Ok(()),
            Store::Fjall(store) => store.persist(),
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            Err(format!(
                "data dir {} is already locked by another ledgerd ({})",
                data_dir.display(),
                holder.trim()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {}: {err}",
            data_dir.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("ledgerd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

pub async fn run_with_config(config: Config) -> Result<(), String> {
    let start_time = Instant::now();
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    log_info!(
        "Startup: backend={:?} network={} data_dir={}",
        config.backend,
        config.network.as_str(),
        config.data_dir.display()
    );

    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;
    let _data_dir_lock = lock_data_dir(&config.data_dir)?;

    let store = Arc::new(Store::open(&config)?);
    let verifier: Arc<dyn ScriptVerifier> = Arc::new(AcceptAll);
    let check_queue: Arc<dyn CheckQueue> = if config.script_threads == 0 {
        Arc::new(InlineCheckQueue::new(Arc::clone(&verifier)))
    } else {
        Arc::new(ParallelCheckQueue::new(
            Arc::clone(&verifier),
            config.script_threads,
        )?)
    };
    let controller = Arc::new(
        ChainStateController::open(
            Arc::clone(&store),
            config.controller_config(),
            verifier,
            check_queue,
        )
        .map_err(|err| err.to_string())?,
    );
    let tip = controller.tip().map_err(|err| err.to_string())?;
    log_info!(
        "Startup: chain state ready at height {} in {}ms",
        tip.height,
        start_time.elapsed().as_millis()
    );

    if config.mempool.persist {
        controller.load_mempool().map_err(|err| err.to_string())?;
    }

    if let Some(path) = config.import.clone() {
        let importer = Arc::clone(&controller);
        let imported = tokio::task::spawn_blocking(move || import_blocks(&importer, &path))
            .await
            .map_err(|err| format!("import task failed: {err}"))??;
        log_info!("Imported {imported} blocks");
    }

    let outcome = maintenance_loop(&controller, &config).await;
    if let Err(err) = &outcome {
        log_error!("{err}");
    }

    log_info!("Shutdown: flushing chain state");
    controller.shutdown().map_err(|err| err.to_string())?;
    store.persist().map_err(|err| err.to_string())?;
    log_info!("Shutdown: complete");
    outcome
}

/// Runs periodic maintenance until Ctrl-C or until flushing keeps failing.
async fn maintenance_loop(
    controller: &ChainStateController<Store>,
    config: &Config,
) -> Result<(), String> {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.maintenance_interval_secs));
    ticker.tick().await;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                log_info!("Shutdown: interrupt received");
                return Ok(());
            }
            _ = ticker.tick() => {
                match controller.maintenance() {
                    Ok(_) => {}
                    Err(err @ ChainStateError::FlushFailed { .. }) => {
                        return Err(format!("stopping: {err}"));
                    }
                    Err(err) => log_warn!("Maintenance failed: {err}"),
                }
                log_status(controller, config.log_format);
            }
        }
    }
}

fn log_status(controller: &ChainStateController<Store>, format: logging::Format) {
    let status = match controller.status() {
        Ok(status) => status,
        Err(err) => {
            log_warn!("Status unavailable: {err}");
            return;
        }
    };
    match format {
        logging::Format::Json => match serde_json::to_string(&status) {
            Ok(line) => log_info!("{line}"),
            Err(err) => log_warn!("Status encode failed: {err}"),
        },
        logging::Format::Text => log_info!(
            "Status: height {} ({} headers, best header {}) | coins {} cached, {} bytes | mempool {} txs, {} bytes, min fee {}/kB",
            status.tip_height,
            status.headers,
            status.best_header_height,
            status.coins_cached,
            status.coins_memory_bytes,
            status.mempool_txs,
            status.mempool_bytes,
            status.mempool_min_fee_per_kb
        ),
    }
}

/// Feeds blocks from a file of `u32` little-endian length prefixed blocks
/// through [`ChainStateController::process_block`]. Invalid blocks are
/// logged and skipped. Returns the number of blocks accepted.
pub fn import_blocks<S: KeyValueStore>(
    controller: &ChainStateController<S>,
    path: &Path,
) -> Result<usize, String> {
    let file = File::open(path)
        .map_err(|err| format!("failed to open import file {}: {err}", path.display()))?;
    let (tx, rx) = bounded::<Result<Block, String>>(IMPORT_QUEUE_DEPTH);
    let reader = thread::spawn(move || read_framed_blocks(file, &tx));

    let mut accepted = 0usize;
    let mut result = Ok(());
    for item in rx.iter() {
        let block = match item {
            Ok(block) => block,
            Err(err) => {
                result = Err(err);
                break;
            }
        };
        match controller.process_block(&block) {
            Ok(_) => accepted += 1,
            Err(ChainStateError::FlushFailed { attempts, last }) => {
                result = Err(format!("import aborted after {attempts} flush failures: {last}"));
                break;
            }
            Err(err) => log_warn!("Import: skipped block: {err}"),
        }
    }
    drop(rx);
    if reader.join().is_err() {
        return Err("import reader thread panicked".to_string());
    }
    result.map(|()| accepted)
}

fn read_framed_blocks(mut file: File, tx: &crossbeam_channel::Sender<Result<Block, String>>) {
    loop {
        let mut len_bytes = [0u8; 4];
        match file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return,
            Err(err) => {
                let _ = tx.send(Err(format!("import read failed: {err}")));
                return;
            }
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_IMPORT_BLOCK_BYTES {
            let _ = tx.send(Err(format!("import frame of {len} bytes is too large")));
            return;
        }
        let mut raw = vec![0u8; len];
        if let Err(err) = file.read_exact(&mut raw) {
            let _ = tx.send(Err(format!("import read failed: {err}")));
            return;
        }
        let block = Block::consensus_decode(&raw).map_err(|err| format!("bad import block: {err}"));
        if tx.send(block).is_err() {
            return;
        }
    }
}
