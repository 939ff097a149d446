//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver of validated configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// A sender that injects a forced reload (e.g., on SIGHUP).
    pub fn reload_trigger(&self) -> ReloadTrigger {
        ReloadTrigger {
            path: self.path.clone(),
            update_tx: self.update_tx.clone(),
        }
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let trigger = self.reload_trigger();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, reloading");
                        trigger.reload();
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Re-reads the config file and forwards it when it validates.
#[derive(Clone)]
pub struct ReloadTrigger {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ReloadTrigger {
    pub fn reload(&self) -> bool {
        match load_config(&self.path) {
            Ok(config) => self.update_tx.send(config).is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_trigger_skips_invalid_files() {
        let path = std::env::temp_dir().join(format!("origin-pool-watch-{}.toml", std::process::id()));
        std::fs::write(&path, "[[origins]]\nname = \"api\"\n").unwrap();

        let (watcher, mut updates) = ConfigWatcher::new(&path);
        let trigger = watcher.reload_trigger();

        assert!(trigger.reload());
        assert_eq!(updates.try_recv().unwrap().origins[0].name, "api");

        std::fs::write(&path, "[[origins]]\nname = \"\"\n").unwrap();
        assert!(!trigger.reload());
        assert!(updates.try_recv().is_err());

        std::fs::remove_file(&path).unwrap();
    }
}
