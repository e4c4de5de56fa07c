//! Command line and `ledgerd.conf` parsing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ledgerd_consensus::money::COIN;
use ledgerd_consensus::Network;
use ledgerd_log as logging;
use ledgerd_mempool::{FeeRate, MempoolLimits, MempoolPolicy};

use crate::controller::{ControllerConfig, DEFAULT_DB_CACHE_MB, DEFAULT_MAX_FORK_TRAVERSAL};

pub const CONF_FILE_NAME: &str = "ledgerd.conf";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub db_cache_bytes: usize,
    pub mempool: MempoolPolicy,
    pub max_fork_traversal: usize,
    /// Script check workers; zero checks inline on the calling thread.
    pub script_threads: usize,
    pub check_script: bool,
    pub import: Option<PathBuf>,
    pub maintenance_interval_secs: u64,
}

impl Config {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            network: self.network,
            max_fork_traversal: self.max_fork_traversal,
            db_cache_bytes: self.db_cache_bytes,
            check_script: self.check_script,
            mempool: self.mempool.clone(),
            mempool_path: self
                .mempool
                .persist
                .then(|| self.data_dir.join(crate::MEMPOOL_FILE_NAME)),
        }
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

/// Flags given on the command line win over the same key in the conf file.
pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network: Option<Network> = None;
    let mut log_level: Option<logging::Level> = None;
    let mut log_format: Option<logging::Format> = None;
    let mut log_timestamps: Option<bool> = None;
    let mut db_cache_mb: Option<u64> = None;
    let mut max_mempool_mb: Option<u64> = None;
    let mut mempool_expiry_hours: Option<u64> = None;
    let mut ancestor_count: Option<u64> = None;
    let mut ancestor_size_kb: Option<u64> = None;
    let mut descendant_count: Option<u64> = None;
    let mut descendant_size_kb: Option<u64> = None;
    let mut min_relay_fee: Option<i64> = None;
    let mut incremental_relay_fee: Option<i64> = None;
    let mut replacement: Option<bool> = None;
    let mut persist_mempool: Option<bool> = None;
    let mut check_ratio: Option<f64> = None;
    let mut max_fork_traversal: Option<usize> = None;
    let mut script_threads: Option<usize> = None;
    let mut skip_script = false;
    let mut import: Option<PathBuf> = None;
    let mut maintenance_interval_secs: Option<u64> = None;

    let mut args = raw_args.into_iter().peekable();
    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
        };
        match arg.as_str() {
            "--backend" => {
                let raw = value("--backend")?;
                backend = Backend::parse(&raw)
                    .ok_or_else(|| format!("invalid backend '{raw}'\n{}", usage()))?;
            }
            "--data-dir" => data_dir = Some(PathBuf::from(value("--data-dir")?)),
            "--conf" => conf_path = Some(PathBuf::from(value("--conf")?)),
            "--network" => {
                let raw = value("--network")?;
                network = Some(Network::parse(&raw).ok_or_else(|| {
                    format!(
                        "invalid network '{raw}' (expected main|test|regtest)\n{}",
                        usage()
                    )
                })?);
            }
            "--testnet" => network = Some(Network::Testnet),
            "--regtest" => network = Some(Network::Regtest),
            "--log-level" => {
                let raw = value("--log-level")?;
                log_level = Some(
                    logging::Level::parse(&raw)
                        .ok_or_else(|| format!("invalid log level '{raw}'\n{}", usage()))?,
                );
            }
            "--log-format" => {
                let raw = value("--log-format")?;
                log_format = Some(
                    logging::Format::parse(&raw)
                        .ok_or_else(|| format!("invalid log format '{raw}'\n{}", usage()))?,
                );
            }
            "--log-timestamps" => log_timestamps = Some(true),
            "--no-log-timestamps" => log_timestamps = Some(false),
            "--dbcache" => db_cache_mb = Some(parse_flag("--dbcache", &value("--dbcache")?)?),
            "--maxmempool" => {
                max_mempool_mb = Some(parse_flag("--maxmempool", &value("--maxmempool")?)?)
            }
            "--mempoolexpiry" => {
                mempool_expiry_hours =
                    Some(parse_flag("--mempoolexpiry", &value("--mempoolexpiry")?)?)
            }
            "--limitancestorcount" => {
                ancestor_count = Some(parse_flag(
                    "--limitancestorcount",
                    &value("--limitancestorcount")?,
                )?)
            }
            "--limitancestorsize" => {
                ancestor_size_kb = Some(parse_flag(
                    "--limitancestorsize",
                    &value("--limitancestorsize")?,
                )?)
            }
            "--limitdescendantcount" => {
                descendant_count = Some(parse_flag(
                    "--limitdescendantcount",
                    &value("--limitdescendantcount")?,
                )?)
            }
            "--limitdescendantsize" => {
                descendant_size_kb = Some(parse_flag(
                    "--limitdescendantsize",
                    &value("--limitdescendantsize")?,
                )?)
            }
            "--minrelaytxfee" => {
                let raw = value("--minrelaytxfee")?;
                min_relay_fee = Some(
                    parse_fee_rate_per_kb(&raw)
                        .map_err(|err| format!("invalid --minrelaytxfee: {err}\n{}", usage()))?,
                );
            }
            "--incrementalrelayfee" => {
                let raw = value("--incrementalrelayfee")?;
                incremental_relay_fee = Some(parse_fee_rate_per_kb(&raw).map_err(|err| {
                    format!("invalid --incrementalrelayfee: {err}\n{}", usage())
                })?);
            }
            "--mempoolreplacement" => replacement = Some(true),
            "--no-mempoolreplacement" => replacement = Some(false),
            "--persistmempool" => persist_mempool = Some(true),
            "--no-persistmempool" => persist_mempool = Some(false),
            "--checkmempool" => {
                let raw = value("--checkmempool")?;
                check_ratio = Some(
                    parse_check_ratio(&raw)
                        .ok_or_else(|| format!("invalid --checkmempool '{raw}'\n{}", usage()))?,
                );
            }
            "--maxforktraversal" => {
                max_fork_traversal = Some(parse_flag(
                    "--maxforktraversal",
                    &value("--maxforktraversal")?,
                )?)
            }
            "--par" => script_threads = Some(parse_flag("--par", &value("--par")?)?),
            "--skip-script" => skip_script = true,
            "--import" => import = Some(PathBuf::from(value("--import")?)),
            "--maintenance-interval" => {
                let secs: u64 = parse_flag("--maintenance-interval", &value("--maintenance-interval")?)?;
                if secs == 0 {
                    return Err(format!("--maintenance-interval must be > 0\n{}", usage()));
                }
                maintenance_interval_secs = Some(secs);
            }
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    if let Some(conf) = load_conf(&conf_file)? {
        let conf = ConfFile {
            values: conf,
            path: &conf_file,
        };
        if network.is_none() {
            if let Some(raw) = conf.last("network") {
                network = Some(
                    Network::parse(raw).ok_or_else(|| conf.invalid("network", raw))?,
                );
            } else if conf.bool("regtest")? == Some(true) {
                network = Some(Network::Regtest);
            } else if conf.bool("testnet")? == Some(true) {
                network = Some(Network::Testnet);
            }
        }
        if log_level.is_none() {
            if let Some(raw) = conf.last("loglevel") {
                log_level =
                    Some(logging::Level::parse(raw).ok_or_else(|| conf.invalid("loglevel", raw))?);
            }
        }
        if log_format.is_none() {
            if let Some(raw) = conf.last("logformat") {
                log_format = Some(
                    logging::Format::parse(raw).ok_or_else(|| conf.invalid("logformat", raw))?,
                );
            }
        }
        if log_timestamps.is_none() {
            log_timestamps = conf.bool("logtimestamps")?;
        }
        conf.number_into("dbcache", &mut db_cache_mb)?;
        conf.number_into("maxmempool", &mut max_mempool_mb)?;
        conf.number_into("mempoolexpiry", &mut mempool_expiry_hours)?;
        conf.number_into("limitancestorcount", &mut ancestor_count)?;
        conf.number_into("limitancestorsize", &mut ancestor_size_kb)?;
        conf.number_into("limitdescendantcount", &mut descendant_count)?;
        conf.number_into("limitdescendantsize", &mut descendant_size_kb)?;
        conf.number_into("maxforktraversal", &mut max_fork_traversal)?;
        conf.number_into("par", &mut script_threads)?;
        conf.number_into("maintenanceinterval", &mut maintenance_interval_secs)?;
        if min_relay_fee.is_none() {
            if let Some(raw) = conf.last("minrelaytxfee") {
                min_relay_fee =
                    Some(parse_fee_rate_per_kb(raw).map_err(|_| conf.invalid("minrelaytxfee", raw))?);
            }
        }
        if incremental_relay_fee.is_none() {
            if let Some(raw) = conf.last("incrementalrelayfee") {
                incremental_relay_fee = Some(
                    parse_fee_rate_per_kb(raw)
                        .map_err(|_| conf.invalid("incrementalrelayfee", raw))?,
                );
            }
        }
        if replacement.is_none() {
            replacement = conf.bool("mempoolreplacement")?;
        }
        if persist_mempool.is_none() {
            persist_mempool = conf.bool("persistmempool")?;
        }
        if check_ratio.is_none() {
            if let Some(raw) = conf.last("checkmempool") {
                check_ratio =
                    Some(parse_check_ratio(raw).ok_or_else(|| conf.invalid("checkmempool", raw))?);
            }
        }
        if !skip_script {
            skip_script = conf.bool("skipscript")?.unwrap_or(false);
        }
        if import.is_none() {
            import = conf.last("import").map(PathBuf::from);
        }
    }

    let network = network.unwrap_or(Network::Mainnet);
    let defaults = MempoolPolicy::default();
    let limit_defaults = MempoolLimits::default();
    let mempool = MempoolPolicy {
        max_mempool_bytes: max_mempool_mb
            .map(|mb| mb.saturating_mul(1_000_000) as usize)
            .unwrap_or(defaults.max_mempool_bytes),
        expiry_secs: mempool_expiry_hours
            .map(|hours| (hours as i64).saturating_mul(3600))
            .unwrap_or(defaults.expiry_secs),
        min_relay_fee: min_relay_fee
            .map(FeeRate::from_sat_per_kb)
            .unwrap_or(defaults.min_relay_fee),
        incremental_relay_fee: incremental_relay_fee
            .map(FeeRate::from_sat_per_kb)
            .unwrap_or(defaults.incremental_relay_fee),
        enable_replacement: replacement.unwrap_or(defaults.enable_replacement),
        persist: persist_mempool.unwrap_or(defaults.persist),
        check_ratio: check_ratio.unwrap_or(if network == Network::Regtest {
            1.0
        } else {
            defaults.check_ratio
        }),
        limits: MempoolLimits {
            ancestor_count: ancestor_count.unwrap_or(limit_defaults.ancestor_count),
            ancestor_size: ancestor_size_kb
                .map(|kb| kb.saturating_mul(1000))
                .unwrap_or(limit_defaults.ancestor_size),
            descendant_count: descendant_count.unwrap_or(limit_defaults.descendant_count),
            descendant_size: descendant_size_kb
                .map(|kb| kb.saturating_mul(1000))
                .unwrap_or(limit_defaults.descendant_size),
        },
    };

    Ok(CliAction::Run(Box::new(Config {
        backend,
        data_dir,
        conf_path: conf_file,
        network,
        log_level: log_level.unwrap_or(logging::Level::Info),
        log_format: log_format.unwrap_or(logging::Format::Text),
        log_timestamps: log_timestamps.unwrap_or(true),
        db_cache_bytes: db_cache_mb
            .unwrap_or(DEFAULT_DB_CACHE_MB)
            .saturating_mul(1024 * 1024) as usize,
        mempool,
        max_fork_traversal: max_fork_traversal.unwrap_or(DEFAULT_MAX_FORK_TRAVERSAL),
        script_threads: script_threads.unwrap_or(0),
        check_script: !skip_script,
        import,
        maintenance_interval_secs: maintenance_interval_secs
            .unwrap_or(DEFAULT_MAINTENANCE_INTERVAL_SECS),
    })))
}

struct ConfFile<'a> {
    values: HashMap<String, Vec<String>>,
    path: &'a Path,
}

impl ConfFile<'_> {
    fn last(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    fn invalid(&self, key: &str, raw: &str) -> String {
        format!("invalid {key} '{raw}' in {}", self.path.display())
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, String> {
        match self.last(key) {
            None => Ok(None),
            Some(raw) => parse_conf_bool(raw)
                .map(Some)
                .ok_or_else(|| self.invalid(key, raw)),
        }
    }

    /// Fills `slot` from the conf file unless the command line already did.
    fn number_into<T: FromStr>(&self, key: &str, slot: &mut Option<T>) -> Result<(), String> {
        if slot.is_some() {
            return Ok(());
        }
        if let Some(raw) = self.last(key) {
            *slot = Some(raw.parse::<T>().map_err(|_| self.invalid(key, raw))?);
        }
        Ok(())
    }
}

fn parse_flag<T: FromStr>(flag: &str, raw: &str) -> Result<T, String> {
    raw.parse::<T>()
        .map_err(|_| format!("invalid value '{raw}' for {flag}\n{}", usage()))
}

pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_check_ratio(value: &str) -> Option<f64> {
    let ratio = value.trim().parse::<f64>().ok()?;
    (ratio.is_finite() && ratio >= 0.0).then_some(ratio.min(1.0))
}

/// Accepts either whole satoshis or a decimal coin amount per kB.
fn parse_fee_rate_per_kb(value: &str) -> Result<i64, String> {
    if value.contains('.') {
        return parse_amount(value);
    }
    let amount = value
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("invalid fee rate '{value}'"))?;
    if amount < 0 {
        return Err("fee rate must be >= 0".to_string());
    }
    Ok(amount)
}

fn parse_amount(value: &str) -> Result<i64, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("amount is empty".to_string());
    }
    if value.starts_with('-') {
        return Err("amount must be >= 0".to_string());
    }
    let (whole, frac) = match value.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (value, ""),
    };
    let whole = if whole.is_empty() {
        0i64
    } else {
        whole
            .parse::<i64>()
            .map_err(|_| format!("invalid amount '{value}'"))?
    };
    if frac.len() > 8 || !frac.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(format!("invalid amount '{value}'"));
    }
    let frac_value = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<8}")
            .parse::<i64>()
            .map_err(|_| format!("invalid amount '{value}'"))?
    };
    whole
        .checked_mul(COIN)
        .and_then(|sats| sats.checked_add(frac_value))
        .ok_or_else(|| format!("amount out of range '{value}'"))
}

pub fn usage() -> String {
    [
        "Usage:",
        "  ledgerd [options]",
        "  ledgerd <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend to use (memory|fjall, default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/ledgerd.conf)",
        "  --network  Chain to follow (main|test|regtest, default: main)",
        "  --testnet, --regtest  Shorthands for --network",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --dbcache  UTXO cache size in MiB before a flush (default: 450)",
        "  --maxmempool  Mempool size limit in MB (default: 300)",
        "  --mempoolexpiry  Drop mempool transactions older than N hours (default: 336)",
        "  --limitancestorcount  Max in-pool ancestors per transaction (default: 25)",
        "  --limitancestorsize  Max ancestor package size in kB (default: 101)",
        "  --limitdescendantcount  Max in-pool descendants per transaction (default: 25)",
        "  --limitdescendantsize  Max descendant package size in kB (default: 101)",
        "  --minrelaytxfee  Minimum relay fee rate in sat/kB or coins/kB with a decimal point (default: 1000)",
        "  --incrementalrelayfee  Fee rate step for eviction and replacement (default: 1000)",
        "  --mempoolreplacement  Accept opt-in replacements of conflicting transactions (default: off)",
        "  --persistmempool, --no-persistmempool  Save the mempool on shutdown and reload it (default: on)",
        "  --checkmempool  Fraction of mempool changes followed by a full consistency check (default: 0, regtest 1)",
        "  --maxforktraversal  Parent hops allowed when looking for a fork point (default: 1000)",
        "  --par  Script verification threads (0 verifies inline, default: 0)",
        "  --skip-script  Do not run script verification",
        "  --import  Connect blocks from a file of length-prefixed blocks at startup",
        "  --maintenance-interval  Seconds between expiry, flush and status passes (default: 60)",
    ]
    .join("\n")
}
