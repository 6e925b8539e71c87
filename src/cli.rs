use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::EngineConfig;
use crate::daemon::DaemonConfig;
use crate::matching::MatchOptions;

#[derive(Parser)]
#[command(name = "tabwardend", about = "Closes duplicate browser tabs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon and serve the browser bridge
    Serve {
        /// Bridge socket path [default: $XDG_RUNTIME_DIR/tabwarden/bridge.sock]
        #[arg(long)]
        socket: Option<PathBuf>,

        #[command(flatten)]
        tuning: TuningArgs,

        #[command(flatten)]
        matching: MatchArgs,
    },

    /// Show how URLs are classified and compared
    Key {
        #[command(flatten)]
        matching: MatchArgs,

        /// URLs to inspect
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

/// Which URL components duplicate detection ignores.
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct MatchArgs {
    /// Treat URLs that differ only in their #fragment as different pages
    #[arg(long)]
    pub keep_fragment: bool,

    /// Treat www.example.com and example.com as different hosts
    #[arg(long)]
    pub keep_www: bool,

    /// Compare URLs case-sensitively
    #[arg(long)]
    pub case_sensitive: bool,

    /// Treat URLs that differ only in their ?query as the same page
    #[arg(long)]
    pub ignore_query: bool,

    /// Treat http:// and https:// versions of a page as the same page
    #[arg(long)]
    pub ignore_scheme: bool,
}

impl MatchArgs {
    pub fn options(&self) -> MatchOptions {
        MatchOptions {
            ignore_fragment: !self.keep_fragment,
            ignore_www: !self.keep_www,
            case_insensitive: !self.case_sensitive,
            ignore_query: self.ignore_query,
            ignore_scheme: self.ignore_scheme,
        }
    }
}

/// Engine timings and thresholds.
#[derive(Args, Debug, Clone)]
pub struct TuningArgs {
    /// Quiet period before a surviving tab is refocused (ms)
    #[arg(long, default_value_t = 250)]
    pub refocus_quiet_ms: u64,

    /// Delay between attempts to close a tab on a locked tab strip (ms)
    #[arg(long, default_value_t = 100)]
    pub retry_delay_ms: u64,

    /// Attempts to close a tab before giving up
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub retry_attempts: u32,

    /// Wait after browser startup before the first full pass (ms)
    #[arg(long, default_value_t = 1000)]
    pub startup_delay_ms: u64,

    /// Largest duplicate group closed all at once during the startup pass
    #[arg(long, default_value_t = 4)]
    pub concurrent_close_limit: usize,

    /// Gap between closures in larger startup groups (ms)
    #[arg(long, default_value_t = 50)]
    pub sequential_gap_ms: u64,

    /// Interval between registry sweeps (s)
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    pub gc_interval_secs: u64,

    /// How long a record missing from the inventory may linger (s)
    #[arg(long, default_value_t = 1800)]
    pub gc_retention_secs: u64,

    /// How long to wait for the browser to answer a request (s)
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub request_timeout_secs: u64,
}

impl TuningArgs {
    pub fn daemon_config(&self, socket: Option<PathBuf>, matching: MatchOptions) -> DaemonConfig {
        DaemonConfig {
            socket,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            engine: EngineConfig {
                matching,
                refocus_quiet: Duration::from_millis(self.refocus_quiet_ms),
                retry_delay: Duration::from_millis(self.retry_delay_ms),
                retry_attempts: self.retry_attempts,
                startup_delay: Duration::from_millis(self.startup_delay_ms),
                concurrent_close_limit: self.concurrent_close_limit,
                sequential_gap: Duration::from_millis(self.sequential_gap_ms),
                gc_interval: Duration::from_secs(self.gc_interval_secs),
                gc_retention: Duration::from_secs(self.gc_retention_secs),
            },
            ..DaemonConfig::default()
        }
    }
}
