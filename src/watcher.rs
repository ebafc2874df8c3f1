//! Watches the working directory for the well-known generated-output files and
//! reports each one's parsed JSON content through a handler.
//!
//! Ground truth: `examples/original_source/src/GeneratedFilesWatcher.{h,cpp}`.
//! Poco's `DirectoryWatcher` delegate callbacks become a `notify::RecommendedWatcher`
//! feeding a `std::sync::mpsc` channel drained on a dedicated thread, following the
//! same "watcher callback sends into a channel, a loop on another thread drains it"
//! shape as `examples/easternanemone-rust-daq/src/hardware/plugin/hot_reload.rs`
//! (which uses `tokio::sync::mpsc` instead, since that watcher feeds an async
//! factory; this one feeds the fully synchronous `persist` module).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use log::{error, info};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;

type FileHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

fn file_names_to_tags() -> HashMap<&'static str, &'static str> {
    let mut m = HashMap::new();
    m.insert("config.json", "config");
    m.insert("config.defaults.json", "defConfig");
    m.insert("result.json", "result");
    m.insert("webui.json", "webUI");
    m
}

/// Watches four well-known filenames under `work_dir` and invokes `handler(tag,
/// parsed_json)` whenever one of them is created, modified, or moved into place.
pub struct GeneratedFilesWatcher {
    work_dir: PathBuf,
    handler: FileHandler,
    tags: HashMap<&'static str, &'static str>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    drain_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl GeneratedFilesWatcher {
    pub fn new<F>(work_dir: impl Into<PathBuf>, handler: F) -> Self
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        GeneratedFilesWatcher {
            work_dir: work_dir.into(),
            handler: Arc::new(handler),
            tags: file_names_to_tags(),
            watcher: Mutex::new(None),
            drain_thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> notify::Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&self.work_dir, RecursiveMode::NonRecursive)?;

        let tags = self.tags.clone();
        let handler = self.handler.clone();
        let work_dir = self.work_dir.clone();
        let drain_handle = std::thread::Builder::new()
            .name("generated-files-watcher".to_string())
            .spawn(move || {
                for event in rx {
                    match event {
                        Ok(event) => {
                            if matches!(
                                event.kind,
                                EventKind::Create(_) | EventKind::Modify(_)
                            ) {
                                for path in &event.paths {
                                    process_event_path(path, &work_dir, &tags, &handler);
                                }
                            }
                        }
                        Err(e) => error!("Generated files watcher error: {e}"),
                    }
                }
            })
            .expect("failed to spawn generated files watcher drain thread");

        *self.watcher.lock().expect("watcher mutex poisoned") = Some(watcher);
        *self.drain_thread.lock().expect("drain thread mutex poisoned") = Some(drain_handle);
        info!("Generated files watcher installed.");
        Ok(())
    }

    pub fn stop(&self) {
        let watcher = self.watcher.lock().expect("watcher mutex poisoned").take();
        if watcher.is_some() {
            // Dropping the watcher closes its event sender, which ends the drain
            // thread's `for event in rx` loop.
            drop(watcher);
            if let Some(handle) = self
                .drain_thread
                .lock()
                .expect("drain thread mutex poisoned")
                .take()
            {
                let _ = handle.join();
            }
            info!("Generated files watcher uninstalled.");
        }
    }

    /// Scans the four known filenames directly, bypassing the live watcher, and
    /// processes any that exist. Used once after `stop()` to drain files written
    /// in the window between the child exiting and the watcher being torn down.
    pub fn collect_all(&self) {
        for (file_name, tag) in &self.tags {
            let path = self.work_dir.join(file_name);
            if path.is_file() {
                process_file(&path, tag, &self.handler);
            }
        }
    }
}

fn process_event_path(
    path: &Path,
    work_dir: &Path,
    tags: &HashMap<&'static str, &'static str>,
    handler: &FileHandler,
) {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    if path.parent() != Some(work_dir) {
        return;
    }
    if let Some(tag) = tags.get(file_name) {
        process_file(path, tag, handler);
    }
}

fn process_file(path: &Path, tag: &str, handler: &FileHandler) {
    match std::fs::read_to_string(path).and_then(|contents| {
        serde_json::from_str::<Value>(&contents).map_err(std::io::Error::from)
    }) {
        Ok(value) => handler(tag, value),
        Err(e) => error!("Failed to process generated file {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn collect_all_processes_existing_known_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("result.json"), r#"{"ok": true}"#).unwrap();
        std::fs::write(dir.path().join("ignored.json"), r#"{}"#).unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let watcher = GeneratedFilesWatcher::new(dir.path(), move |tag, value| {
            calls_clone.lock().unwrap().push((tag.to_string(), value));
        });
        watcher.collect_all();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "result");
    }

    #[test]
    fn live_watch_detects_new_known_file() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let watcher = GeneratedFilesWatcher::new(dir.path(), move |_, _| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        watcher.start().unwrap();

        std::fs::write(dir.path().join("config.json"), r#"{"a": 1}"#).unwrap();
        std::thread::sleep(Duration::from_millis(500));

        watcher.stop();
        assert!(seen.load(Ordering::SeqCst) >= 1);
    }
}
