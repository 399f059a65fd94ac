use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Configuration for the nodevault-local tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "nodevault-local")]
#[command(about = "Tree lock administration and version lifecycle demo for nodevault")]
pub struct Config {
    /// Directory holding the shared tree lock table (file backend)
    #[arg(long, env = "NODEVAULT_LOCK_DIR", global = true)]
    pub lock_dir: Option<PathBuf>,

    /// Lock owner recorded on acquired locks (defaults to a fresh UUID)
    #[arg(long, env = "NODEVAULT_OWNER", global = true)]
    pub owner: Option<String>,

    /// Locks older than this are purged as abandoned; 0 disables expiry
    #[arg(long, default_value = "3600", env = "NODEVAULT_LOCK_STALE_SECS", global = true)]
    pub stale_after_secs: u64,

    /// Tree lock backend
    #[arg(long, default_value = "file", env = "NODEVAULT_LOCK_BACKEND", global = true)]
    pub lock_backend: LockBackend,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Get the effective lock table directory.
    pub fn effective_lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nodevault")
                .join("locks")
        })
    }

    pub fn effective_owner(&self) -> String {
        self.owner
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs))
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Inspect and manage tree locks
    #[command(subcommand)]
    Locks(LocksCommand),

    /// Run the version lifecycle scenarios against in-memory storage
    Demo,
}

#[derive(Subcommand, Debug, Clone)]
pub enum LocksCommand {
    /// List held locks
    List,

    /// Report whether a path is covered by a held lock
    Check { path: String },

    /// Lock one or more subtrees, all or nothing, until the timeout or Ctrl+C
    Acquire {
        #[arg(required = true)]
        paths: Vec<String>,

        /// Release after this many seconds instead of waiting for a signal
        #[arg(long)]
        hold_secs: Option<u64>,
    },

    /// Release a lock by id
    Release { id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LockBackend {
    File,
    Memory,
}

impl std::fmt::Display for LockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockBackend::File => write!(f, "file"),
            LockBackend::Memory => write!(f, "memory"),
        }
    }
}
