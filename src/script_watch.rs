use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tracing::warn;

use crate::scripts::absolute;

/// Watches behaviour source directories and reports changed script files.
pub struct ScriptWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    roots: Vec<PathBuf>,
    extension: String,
}

impl ScriptWatcher {
    pub fn new(extension: &str) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(
                NotifyConfig::default()
                    .with_compare_contents(false)
                    .with_poll_interval(Duration::from_millis(300)),
            )
            .context("configure script watcher")?;
        Ok(Self { watcher, rx, roots: Vec::new(), extension: extension.trim_start_matches('.').to_string() })
    }

    pub fn watch_root(&mut self, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        if !root.exists() {
            anyhow::bail!("path '{}' does not exist", root.display());
        }
        let normalized = absolute(root);
        if self.roots.contains(&normalized) {
            return Ok(());
        }
        let mode = if normalized.is_dir() { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        self.watcher.watch(&normalized, mode).with_context(|| format!("watch {}", normalized.display()))?;
        self.roots.push(normalized);
        Ok(())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Script files touched since the last call, deduplicated, in arrival order.
    pub fn drain_changes(&mut self) -> Vec<PathBuf> {
        let mut changes: Vec<PathBuf> = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                Ok(event) => {
                    if !is_relevant(&event.kind) {
                        continue;
                    }
                    for path in event.paths {
                        if self.is_script(&path) && !changes.contains(&path) {
                            changes.push(path);
                        }
                    }
                }
                Err(err) => warn!(error = %err, "script watcher error"),
            }
        }
        changes
    }

    fn is_script(&self, path: &Path) -> bool {
        path.extension().and_then(|ext| ext.to_str()) == Some(self.extension.as_str())
            && self.roots.iter().any(|root| absolute(path).starts_with(root))
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
            | EventKind::Remove(_)
    )
}
