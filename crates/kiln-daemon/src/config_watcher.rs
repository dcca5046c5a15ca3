//! Configuration file watcher for hot-reload support.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{DaemonError, Result};
use crate::server::DaemonState;

const RELOAD_SETTLE_DELAY: Duration = Duration::from_millis(100);
const CONFIG_DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

/// Keeps the underlying watcher alive; dropping it stops notifications.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch the directory holding `config_path` and signal `tx` when the file
/// is written or replaced.
///
/// # Errors
///
/// Returns an error if the path has no parent or the directory cannot be watched.
pub fn watch_config(config_path: &Path, tx: mpsc::UnboundedSender<()>) -> Result<ConfigWatcher> {
    let parent = config_path
        .parent()
        .ok_or_else(|| {
            DaemonError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid config path",
            ))
        })?
        .to_path_buf();
    let file_name = config_path.file_name().map(ToOwned::to_owned);
    let last_signal: Mutex<Option<Instant>> = Mutex::new(None);

    let mut watcher =
        notify::recommended_watcher(move |result: notify::Result<notify::Event>| match result {
            Ok(event) if is_config_change(&event, file_name.as_deref()) => {
                let Ok(mut last) = last_signal.lock() else {
                    error!("[config_watcher] Debounce mutex poisoned, skipping event");
                    return;
                };
                let now = Instant::now();
                if last.is_none_or(|at| now.duration_since(at) > CONFIG_DEBOUNCE_DURATION) {
                    *last = Some(now);
                    let _ = tx.send(());
                }
            }
            Ok(_) => {}
            Err(e) => error!("Watcher error: {}", e),
        })?;

    watcher.watch(&parent, RecursiveMode::NonRecursive)?;
    info!("Watching config directory: {:?}", parent);

    Ok(ConfigWatcher { _watcher: watcher })
}

fn is_config_change(event: &notify::Event, file_name: Option<&OsStr>) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && file_name.is_some()
        && event.paths.iter().any(|p| p.file_name() == file_name)
}

/// Reload the core's config for every change signal until the sender is gone.
///
/// A failed reload keeps the previous config; the core logs why.
pub async fn reload_on_change(state: Arc<DaemonState>, mut changes: mpsc::UnboundedReceiver<()>) {
    while changes.recv().await.is_some() {
        // Editors write in several steps; let the file settle first
        tokio::time::sleep(RELOAD_SETTLE_DELAY).await;
        while changes.try_recv().is_ok() {}

        debug!("Config file changed, reloading");
        let _ = state.core.reload_config().await;
    }
    debug!("Config watcher task ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::ffi::OsString;
    use std::path::PathBuf;

    fn config_name() -> Option<OsString> {
        Some(OsString::from("config.json"))
    }

    #[test]
    fn test_modify_of_config_is_a_change() {
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/home/u/.config/kiln/config.json"));
        assert!(is_config_change(&event, config_name().as_deref()));
    }

    #[test]
    fn test_create_of_config_is_a_change() {
        let event = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/tmp/cfg/config.json"));
        assert!(is_config_change(&event, config_name().as_deref()));
    }

    #[test]
    fn test_other_files_are_ignored() {
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/tmp/cfg/config.json.swp"));
        assert!(!is_config_change(&event, config_name().as_deref()));
    }

    #[test]
    fn test_access_events_are_ignored() {
        let event = notify::Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/tmp/cfg/config.json"));
        assert!(!is_config_change(&event, config_name().as_deref()));
    }

    #[tokio::test]
    async fn test_writing_config_signals_change() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = temp.path().join("config.json");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = watch_config(&config, tx).unwrap();

        std::fs::write(&config, "{}").unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(signal, Ok(Some(()))));
    }

    #[test]
    fn test_missing_directory_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = watch_config(Path::new("/nonexistent/kiln/config.json"), tx);
        assert!(result.is_err());
    }
}
