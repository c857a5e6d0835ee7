use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Watch a single file for content changes.
///
/// The parent directory is watched rather than the file itself so that
/// editors replacing the file by rename keep being noticed. Bursts of events
/// collapse into one pending notification. Returns the receiver plus the
/// watcher, which must be kept alive for as long as events are wanted.
pub fn watch_file(path: &Path) -> Result<(mpsc::Receiver<()>, RecommendedWatcher), String> {
    let (tx, rx) = mpsc::channel(1);

    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| format!("not a file path: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    let _ = tx.try_send(());
                }
            }
            Err(e) => log::warn!("file watch error: {e}"),
        },
        Config::default(),
    )
    .map_err(|e| format!("failed to create watcher: {e}"))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| format!("failed to watch {}: {e}", dir.display()))?;

    Ok((rx, watcher))
}
