mod config;
mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nodevault_core::{LockId, RepositoryPath, TreeLockStore};
use nodevault_local::{BroadcastCluster, FileTreeLockStore, MemoryTreeLockStore, TreeLockRegistry};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config, LockBackend, LocksCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let owner = config.effective_owner();

    info!("Starting nodevault-local");
    info!("  Lock backend: {}", config.lock_backend);
    info!("  Owner: {}", owner);

    let store: Arc<dyn TreeLockStore> = match config.lock_backend {
        LockBackend::File => {
            let dir = config.effective_lock_dir();
            info!("  Lock dir: {}", dir.display());
            let mut store = FileTreeLockStore::new(&dir);
            if let Some(stale) = config.stale_after() {
                info!("  Stale locks expire after {}s", stale.as_secs());
                store = store.with_stale_after(stale);
            }
            Arc::new(store)
        }
        LockBackend::Memory => Arc::new(MemoryTreeLockStore::new()),
    };

    let cluster = Arc::new(BroadcastCluster::default());
    let registry = TreeLockRegistry::new(store, owner).with_cluster(cluster.clone());

    match config.command {
        Command::Locks(command) => run_locks(&registry, command).await,
        Command::Demo => demo::run(registry, cluster).await,
    }
}

async fn run_locks(registry: &TreeLockRegistry, command: LocksCommand) -> anyhow::Result<()> {
    match command {
        LocksCommand::List => {
            let locks = registry.store().list().await?;
            if locks.is_empty() {
                println!("No tree locks held");
            }
            for lock in locks {
                println!(
                    "{:>6}  {}  {}  {}",
                    lock.id,
                    lock.acquired_at.to_rfc3339(),
                    lock.owner,
                    lock.path
                );
            }
        }
        LocksCommand::Check { path } => {
            let path = RepositoryPath::parse(&path).with_context(|| format!("invalid path {path}"))?;
            let held: Vec<_> = registry
                .get_all_locks()
                .await?
                .into_iter()
                .filter(|(_, locked)| locked.overlaps(&path))
                .collect();
            if held.is_empty() {
                println!("{} is free", path);
            } else {
                for (id, locked) in held {
                    println!("{} is locked by lock {} on {}", path, id, locked);
                }
            }
        }
        LocksCommand::Acquire { paths, hold_secs } => {
            let paths = paths
                .iter()
                .map(|p| RepositoryPath::parse(p).with_context(|| format!("invalid path {p}")))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let guard = registry.acquire_all(&paths).await?;
            for lock in guard.locks() {
                println!("Acquired lock {} on {}", lock.id, lock.path);
            }

            let mut shutdown = create_shutdown_signal();
            match hold_secs {
                Some(secs) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                            info!("Hold time of {}s elapsed", secs);
                        }
                        _ = shutdown.changed() => {}
                    }
                }
                None => {
                    info!("Holding locks until Ctrl+C");
                    let _ = shutdown.changed().await;
                }
            }

            guard.release().await?;
            println!("Released");
        }
        LocksCommand::Release { id } => {
            if registry.release(LockId(id)).await? {
                println!("Released lock {}", id);
            } else {
                println!("Lock {} is not held", id);
            }
        }
    }
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, releasing locks"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, releasing locks");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
