use crate::error::ChainError;
use crate::logger::{LogLevels, Severity};
use crate::model::Point;
use crate::pattern::Pattern;
use crate::storage::InputManagement;
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum depth of a chain reorganization, in slots. A protocol parameter;
/// the default matches mainnet (3k/f).
const DEFAULT_LONGEST_ROLLBACK: u64 = 129_600;

const MIN_CONCURRENCY: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "kupo", about = "Fast, lightweight & configurable chain-index", disable_version_flag = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Print the version and exit.
    #[arg(long = "version", short = 'v', global = true)]
    pub version: bool,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the version and exit.
    Version,
    /// Exit 0 when a running instance is healthy and synchronized.
    HealthCheck {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 1442)]
        port: u16,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the node-to-client socket of a local node.
    #[arg(long)]
    pub node_socket: Option<PathBuf>,

    /// Path to the node configuration (goes with --node-socket).
    #[arg(long)]
    pub node_config: Option<PathBuf>,

    /// Host of the JSON-RPC WebSocket bridge.
    #[arg(long)]
    pub ogmios_host: Option<String>,

    /// Port of the JSON-RPC WebSocket bridge.
    #[arg(long)]
    pub ogmios_port: Option<u16>,

    /// Directory holding the database files.
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Keep the whole index in memory instead of on disk.
    #[arg(long)]
    pub in_memory: bool,

    /// Address the HTTP server binds to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port the HTTP server binds to.
    #[arg(long, default_value_t = 1442)]
    pub port: u16,

    /// Point to start synchronizing from: 'origin' or '<slot>.<header hash>'.
    #[arg(long)]
    pub since: Option<String>,

    /// Pattern to index; repeatable, patterns are combined with a logical OR.
    #[arg(long = "match")]
    pub matches: Vec<String>,

    /// Remove inputs from the index as soon as their spend leaves the
    /// rollback safe zone, instead of marking them.
    #[arg(long)]
    pub prune_utxo: bool,

    /// Seconds between two garbage collection passes.
    #[arg(long, default_value_t = 3600)]
    pub gc_interval: u64,

    /// Maximum number of concurrent HTTP requests.
    #[arg(long, default_value_t = 50)]
    pub max_concurrency: usize,

    /// Postpone secondary index creation to a later start, for a faster
    /// first synchronization.
    #[arg(long)]
    pub defer_db_indexes: bool,

    /// Maximum depth of a chain reorganization, in slots.
    #[arg(long, default_value_t = DEFAULT_LONGEST_ROLLBACK)]
    pub longest_rollback: u64,

    /// Minimum severity for all components.
    #[arg(long)]
    pub log_level: Option<Severity>,

    #[arg(long)]
    pub log_level_consumer: Option<Severity>,

    #[arg(long)]
    pub log_level_database: Option<Severity>,

    #[arg(long)]
    pub log_level_http: Option<Severity>,

    #[arg(long)]
    pub log_level_gc: Option<Severity>,

    #[arg(long)]
    pub log_level_health: Option<Severity>,
}

#[derive(Debug, Clone)]
pub enum DatabaseLocation {
    Dir(PathBuf),
    InMemory,
}

#[derive(Debug, Clone)]
pub enum ProducerConfig {
    Ogmios { host: String, port: u16 },
}

/// Validated runtime settings, derived from the raw CLI arguments.
#[derive(Debug, Clone)]
pub struct Settings {
    pub producer: ProducerConfig,
    pub database: DatabaseLocation,
    pub server: SocketAddr,
    pub since: Option<Point>,
    pub patterns: Vec<Pattern>,
    pub input_management: InputManagement,
    pub gc_interval: Duration,
    pub max_concurrency: usize,
    pub defer_indexes: bool,
    pub longest_rollback: u64,
    pub log_levels: LogLevels,
}

impl RunArgs {
    pub fn into_settings(self) -> Result<Settings, ChainError> {
        let producer = match (&self.node_socket, &self.ogmios_host, self.ogmios_port) {
            (Some(_), Some(_), _) => {
                return Err(ChainError::Configuration(
                    "both --node-socket and --ogmios-host given; pick one block producer".to_string(),
                ))
            }
            (Some(_), None, _) => {
                return Err(ChainError::Configuration(
                    "this build speaks the JSON-RPC bridge protocol; \
                     provide --ogmios-host and --ogmios-port instead of --node-socket"
                        .to_string(),
                ))
            }
            (None, Some(host), Some(port)) => ProducerConfig::Ogmios { host: host.clone(), port },
            (None, Some(_), None) => {
                return Err(ChainError::Configuration("--ogmios-host requires --ogmios-port".to_string()))
            }
            (None, None, _) => {
                return Err(ChainError::Configuration(
                    "no block producer configured; provide --ogmios-host and --ogmios-port".to_string(),
                ))
            }
        };

        let database = match (self.workdir, self.in_memory) {
            (Some(_), true) => {
                return Err(ChainError::Configuration("--workdir and --in-memory are mutually exclusive".to_string()))
            }
            (Some(dir), false) => DatabaseLocation::Dir(dir),
            (None, true) => DatabaseLocation::InMemory,
            (None, false) => {
                return Err(ChainError::Configuration(
                    "no database location; provide --workdir <dir> or --in-memory".to_string(),
                ))
            }
        };

        let since = self
            .since
            .map(|text| {
                text.parse::<Point>().map_err(|_| {
                    ChainError::Configuration(format!(
                        "unreadable --since '{}'; expecting 'origin' or '<slot>.<64-character header hash>'",
                        text
                    ))
                })
            })
            .transpose()?;

        let patterns = self
            .matches
            .iter()
            .map(|text| {
                text.parse::<Pattern>()
                    .map_err(|_| ChainError::Configuration(format!("unreadable --match pattern '{}'", text)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if self.max_concurrency < MIN_CONCURRENCY {
            return Err(ChainError::Configuration(format!(
                "--max-concurrency must be at least {}",
                MIN_CONCURRENCY
            )));
        }

        let defaults = LogLevels::default();
        let log_levels = LogLevels {
            default: self.log_level.unwrap_or(defaults.default),
            consumer: self.log_level_consumer,
            database: self.log_level_database,
            http: self.log_level_http,
            gc: self.log_level_gc,
            health: self.log_level_health,
        };

        Ok(Settings {
            producer,
            database,
            server: SocketAddr::new(self.host, self.port),
            since,
            patterns,
            input_management: if self.prune_utxo {
                InputManagement::RemoveSpentInputs
            } else {
                InputManagement::MarkSpentInputs
            },
            gc_interval: Duration::from_secs(self.gc_interval),
            max_concurrency: self.max_concurrency,
            defer_indexes: self.defer_db_indexes,
            longest_rollback: self.longest_rollback,
            log_levels,
        })
    }
}
