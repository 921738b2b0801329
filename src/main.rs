//! vfsync-tool - inspect and repair vfsync cache files
//!
//! Usage:
//!   vfsync-tool init                      - Write a default configuration
//!   vfsync-tool config                    - Validate and print the configuration
//!   vfsync-tool index <file.idx>          - Show the dirty ranges in an index file
//!   vfsync-tool log <file.log> --key ...  - Verify a sector log
//!   vfsync-tool recover <id> --key ...    - Replay a leftover sector log
//!   vfsync-tool cat <id> [--key ...]      - Print the contents of a cached file

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vfsync::{
    config::Config,
    crypto::{FileKey, MasterKey, KEY_SIZE},
    interval::decode_index,
    openfile::CachePaths,
    registry::{OpenFileRegistry, OpenRequest},
    sectorlog::{recover, scan_log, EncryptedDataFile},
    FileId,
};

#[derive(Parser)]
#[command(name = "vfsync-tool")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and repair vfsync cache files")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/vfsync/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the key of an encrypted file comes from
#[derive(Args, Clone)]
struct KeyArgs {
    /// File key as 64 hex characters
    #[arg(long, conflicts_with = "password_file")]
    key: Option<String>,

    /// Read the crypto passphrase from this file and derive the file key
    #[arg(long, requires = "key_id")]
    password_file: Option<PathBuf>,

    /// Key id the file key is derived for
    #[arg(long)]
    key_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Cache directory to use
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Validate and print the configuration
    Config,

    /// Show the dirty ranges stored in an index file
    Index {
        path: PathBuf,
    },

    /// Verify a sector log without applying it
    Log {
        path: PathBuf,

        #[command(flatten)]
        key: KeyArgs,

        /// List every record
        #[arg(long)]
        records: bool,
    },

    /// Replay a leftover sector log into its data file
    Recover {
        /// File id (negative for files still waiting for upload)
        #[arg(allow_hyphen_values = true)]
        id: i64,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Print the local contents of a cached file
    Cat {
        #[arg(allow_hyphen_values = true)]
        id: i64,

        /// Logical size of an unencrypted file
        #[arg(long, default_value_t = 0)]
        size: u64,

        #[command(flatten)]
        key: KeyArgs,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_env("VFSYNC_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }

    let config_path = expand_tilde(&cli.config);
    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init { cache_dir } => cmd_init(config_path, cache_dir),
        Commands::Config => cmd_config(config_path),
        Commands::Index { path } => cmd_index(&path),
        Commands::Log { path, key, records } => cmd_log(config_path, &path, &key, records),
        Commands::Recover { id, key } => cmd_recover(config_path, FileId(id), &key),
        Commands::Cat { id, size, key } => cmd_cat(config_path, FileId(id), size, &key),
    }
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
            .with_context(|| format!("loading configuration from {:?}", config_path))
    } else {
        warn!("No configuration at {:?}, using defaults", config_path);
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn file_key(config: &Config, args: &KeyArgs) -> anyhow::Result<Option<FileKey>> {
    if let Some(hex_key) = &args.key {
        let bytes = hex::decode(hex_key.trim()).context("file key is not valid hex")?;
        let key: [u8; KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("file key must be {} bytes", KEY_SIZE))?;
        return Ok(Some(FileKey::from_bytes(key)));
    }

    match (&args.password_file, &args.key_id) {
        (Some(path), Some(key_id)) => {
            if config.encryption.salt.is_empty() {
                bail!("encryption.salt is not set; file keys cannot be derived reproducibly");
            }
            let password = std::fs::read_to_string(path)
                .with_context(|| format!("reading passphrase from {:?}", path))?;
            let master = MasterKey::from_password(password.trim_end().as_bytes(), &config.encryption)?;
            Ok(Some(master.file_key(key_id)?))
        }
        _ => Ok(None),
    }
}

fn require_key(config: &Config, args: &KeyArgs) -> anyhow::Result<FileKey> {
    match file_key(config, args)? {
        Some(key) => Ok(key),
        None => bail!("this command needs --key or --password-file with --key-id"),
    }
}

fn cmd_init(config_path: &Path, cache_dir: Option<PathBuf>) -> anyhow::Result<()> {
    if config_path.exists() {
        bail!("{:?} already exists", config_path);
    }
    let config = match cache_dir {
        Some(dir) => Config::with_cache_dir(dir),
        None => Config::default(),
    };
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Cache directory: {:?}", config.cache.cache_dir);
    Ok(())
}

fn cmd_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn cmd_index(path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
    let tracker = match decode_index(&bytes) {
        Ok(tracker) => tracker,
        Err(e) => bail!("index is unusable and would be discarded on open: {}", e),
    };

    println!("Records:   {}", bytes.len() as u64 / vfsync::interval::INDEX_RECORD_SIZE);
    println!("Intervals: {}", tracker.len());
    println!("Dirty:     {} bytes", tracker.total_bytes());
    for range in tracker.iter() {
        println!("  [{}, {})", range.start, range.end);
    }
    Ok(())
}

fn cmd_log(config_path: &Path, path: &Path, key: &KeyArgs, records: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let key = require_key(&config, key)?;
    let bytes = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
    let scan = scan_log(&bytes, &key.log_key()?);

    println!("Verified records: {}", scan.records.len());
    match scan.stopped {
        Some(reason) => println!(
            "Stopped:          {:?} ({} bytes not verifiable)",
            reason, scan.discarded_bytes
        ),
        None => println!("Stopped:          end of log"),
    }
    if let Some(last) = scan.records.last() {
        println!("Size after replay: {}", last.file_size);
    }
    if records {
        for (i, record) in scan.records.iter().enumerate() {
            println!(
                "  #{:<5} sector {:<8} offset {:<12} size {}",
                i,
                record.sector(),
                record.offset,
                record.file_size
            );
        }
    }
    Ok(())
}

fn cmd_recover(config_path: &Path, id: FileId, key: &KeyArgs) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let key = require_key(&config, key)?;
    let paths = CachePaths::new(&config.cache.cache_dir, id);
    if !paths.log.exists() {
        info!("No sector log at {:?}, nothing to do", paths.log);
        return Ok(());
    }

    let open = |path: &Path| {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening {:?}", path))
    };
    let data = EncryptedDataFile::open(open(&paths.data)?)?;
    let report = recover(&open(&paths.log)?, &data, &key.log_key()?)?;

    println!("Applied records: {}", report.applied);
    println!("Discarded bytes: {}", report.discarded_bytes);
    println!("Logical size:    {}", report.size);
    if let Some(reason) = report.stopped {
        println!("Stopped early:   {:?}", reason);
    }
    Ok(())
}

fn cmd_cat(config_path: &Path, id: FileId, size: u64, key: &KeyArgs) -> anyhow::Result<()> {
    let config = Arc::new(load_config(config_path)?);
    let key = file_key(&config, key)?;
    let registry = OpenFileRegistry::new(Arc::clone(&config))?;

    let mut req = OpenRequest::new(id, 0, id.cache_stem());
    req.size = size;
    req.key = key;
    let handle = registry.lookup_or_create(&req)?;

    let chunk = config.streams.max_readahead.max(1);
    let mut stdout = std::io::stdout().lock();
    let mut offset = 0;
    let result = loop {
        match handle.read(offset, chunk) {
            Ok(out) if out.data.is_empty() => break Ok(()),
            Ok(out) => {
                offset += out.data.len() as u64;
                if let Err(e) = stdout.write_all(&out.data) {
                    break Err(e.into());
                }
            }
            Err(e) => break Err(e.into()),
        }
    };
    registry.release(&handle);
    result
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
