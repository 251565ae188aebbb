//! Filesystem change detection: include/exclude filters, per-path event
//! deduplication, and a quiet-period debounce driving a reload callback.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use notify::{RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::build::BIN_PREFIX;

pub const DEFAULT_FILE_PATTERN: &str = "go";
pub const DEFAULT_IGNORED_PATTERN: &str = r"(\/\.\w+)|(^\.)|(\.\w+$)";

/// Fire the callback only after a path has been quiet for this long.
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Invoked with the watcher itself and the settled path once a change
/// survives filtering, deduplication, and the debounce window.
pub type ChangeHandler = Box<dyn Fn(&Watcher, &Path) + Send + Sync>;

pub struct Watcher {
    extra_dirs: String,
    file_filter: Regex,
    ignored: Regex,
    only_watch_bin: bool,
    paused: AtomicBool,
    changed: AtomicBool,
    debounce_epoch: AtomicU64,
    mtimes: Mutex<HashMap<PathBuf, i64>>,
    on_changed: ChangeHandler,
}

impl Watcher {
    /// Build a watcher. `file_pattern` is an extension alternation for
    /// source mode; binary-swap mode (`only_watch_bin`) matches emitted
    /// binary names instead. Empty patterns fall back to the defaults.
    pub fn new(
        extra_dirs: &str,
        file_pattern: &str,
        ignored_pattern: &str,
        only_watch_bin: bool,
        on_changed: ChangeHandler,
    ) -> anyhow::Result<Self> {
        let file_pattern = if file_pattern.is_empty() {
            DEFAULT_FILE_PATTERN
        } else {
            file_pattern
        };
        let ignored_pattern = if ignored_pattern.is_empty() {
            DEFAULT_IGNORED_PATTERN
        } else {
            ignored_pattern
        };
        let file_filter = if only_watch_bin {
            format!("{}[0-9]+(\\.exe)?$", regex::escape(BIN_PREFIX))
        } else {
            format!(r"\.({file_pattern})$")
        };
        Ok(Self {
            extra_dirs: extra_dirs.to_string(),
            file_filter: Regex::new(&file_filter).context("invalid file watch pattern")?,
            ignored: Regex::new(ignored_pattern).context("invalid ignored-path pattern")?,
            only_watch_bin,
            paused: AtomicBool::new(false),
            changed: AtomicBool::new(false),
            debounce_epoch: AtomicU64::new(0),
            mtimes: Mutex::new(HashMap::new()),
            on_changed,
        })
    }

    pub fn changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.changed.store(false, Ordering::SeqCst);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Register OS notifications on every watched directory and process
    /// events until the backend goes away. Errors before the loop starts
    /// make the whole system unusable and are returned to the caller.
    pub async fn watch(self: Arc<Self>) -> anyhow::Result<()> {
        let dirs = self.dirs_to_watch()?;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut backend = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })
        .context("failed to create filesystem watcher")?;

        for dir in &dirs {
            backend
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch {}", dir.display()))?;
            info!(dir = %dir.display(), "watching directory");
        }

        while let Some(res) = rx.recv().await {
            match res {
                Ok(event) => {
                    for path in event.paths {
                        self.handle_path(path);
                    }
                }
                Err(e) => warn!(error = %e, "watch backend error"),
            }
        }
        Ok(())
    }

    /// Run one raw event through pause, filters, and deduplication, then
    /// schedule the debounce check.
    fn handle_path(self: &Arc<Self>, path: PathBuf) {
        if self.paused() {
            debug!("watcher paused, discarding event");
            return;
        }
        let name = path.to_string_lossy().replace('\\', "/");
        // Editors write through .tmp files; never react to those.
        if name.to_lowercase().ends_with(".tmp") {
            return;
        }
        if !self.file_filter.is_match(&name) {
            if self.only_watch_bin {
                debug!(file = %name, "ignoring non-binary change");
            }
            return;
        }
        let mtime = file_mtime_millis(&path);
        {
            let mut mtimes = self.mtimes.lock();
            if mtimes.get(&path) == Some(&mtime) {
                debug!(file = %name, "skipping event with unchanged mtime");
                return;
            }
            mtimes.insert(path.clone(), mtime);
        }
        debug!(file = %name, "event accepted");

        // Every accepted event moves the epoch forward; only the timer
        // belonging to the newest event fires, giving "quiet for 1s".
        let epoch = self.debounce_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            if this.debounce_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            info!(file = %path.display(), "change detected");
            this.changed.store(true, Ordering::SeqCst);
            (this.on_changed)(this.as_ref(), &path);
        });
    }

    /// Enumerate directories to monitor: the working directory plus any
    /// `|`-separated extra roots, descending recursively and pruning
    /// paths matched by the ignore pattern.
    fn dirs_to_watch(&self) -> anyhow::Result<Vec<PathBuf>> {
        let cwd = std::env::current_dir().context("failed to resolve working directory")?;
        let mut roots = vec![cwd];
        for extra in self.extra_dirs.split('|') {
            if extra.is_empty() {
                continue;
            }
            let path = PathBuf::from(extra);
            if path.is_dir() {
                roots.push(path);
            }
        }

        let mut seen = HashSet::new();
        let mut dirs = Vec::new();
        for root in roots {
            let mut stack = vec![root];
            while let Some(dir) = stack.pop() {
                let slash = dir.to_string_lossy().replace('\\', "/");
                if self.ignored.is_match(&slash) || self.ignored.is_match(&format!("{slash}/")) {
                    continue;
                }
                if !seen.insert(dir.clone()) {
                    continue;
                }
                dirs.push(dir.clone());
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        stack.push(entry.path());
                    }
                }
            }
        }
        Ok(dirs)
    }
}

/// Modification time in unix milliseconds; falls back to "now" so events
/// on just-deleted files still register as fresh.
fn file_mtime_millis(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| {
            t.duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64
        })
        .unwrap_or_else(|_| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_watcher(
        file_pattern: &str,
        only_watch_bin: bool,
    ) -> (Arc<Watcher>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watcher = Watcher::new(
            "",
            file_pattern,
            "",
            only_watch_bin,
            Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        (Arc::new(watcher), fired)
    }

    #[tokio::test(start_paused = true)]
    async fn tmp_files_never_fire() {
        let (watcher, fired) = counting_watcher("go", false);
        watcher.handle_path(PathBuf::from("/src/foo.go.tmp"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extension_filter_drops_foreign_files() {
        let (watcher, fired) = counting_watcher("go", false);
        watcher.handle_path(PathBuf::from("/src/readme.txt"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn binary_mode_matches_emitted_binaries_only() {
        let (watcher, fired) = counting_watcher("", true);
        watcher.handle_path(PathBuf::from("/out/main.go"));
        watcher.handle_path(PathBuf::from("/out/tower-app-1700000000"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_mtime_events_fire_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.go");
        std::fs::write(&file, "package main").unwrap();

        let (watcher, fired) = counting_watcher("go", false);
        watcher.handle_path(file.clone());
        watcher.handle_path(file.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_events_debounce_to_one_firing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.go");

        let (watcher, fired) = counting_watcher("go", false);
        for i in 0..5 {
            std::fs::write(&file, format!("package main // {i}")).unwrap();
            // Distinct mtimes so deduplication does not collapse the burst.
            std::thread::sleep(Duration::from_millis(5));
            watcher.handle_path(file.clone());
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(watcher.changed());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_watcher_discards_events() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.go");
        std::fs::write(&file, "package main").unwrap();

        let (watcher, fired) = counting_watcher("go", false);
        watcher.set_paused(true);
        watcher.handle_path(file.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        watcher.set_paused(false);
        watcher.handle_path(file);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_the_changed_flag() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.go");
        std::fs::write(&file, "package main").unwrap();

        let (watcher, _) = counting_watcher("go", false);
        watcher.handle_path(file);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(watcher.changed());
        watcher.reset();
        assert!(!watcher.changed());
    }

    #[test]
    fn dirs_to_watch_prunes_ignored_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();

        let watcher = Watcher::new(
            &dir.path().to_string_lossy(),
            "go",
            r"\.git$",
            false,
            Box::new(|_, _| {}),
        )
        .unwrap();
        let dirs = watcher.dirs_to_watch().unwrap();
        assert!(dirs.iter().any(|d| d.ends_with("src")));
        assert!(!dirs.iter().any(|d| d.ends_with(".git")));
    }
}
