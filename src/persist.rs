//! Persists executor status to disk and forwards the same events to the
//! callback API, so a recovering API server can read the status file back if it
//! missed the callback.
//!
//! Ground truth: `examples/original_source/src/PersistAndCallbackManager.{h,cpp}`.
//! The atomic file write (`Poco::FileOutputStream` truncate-and-write) becomes a
//! temp-file-then-rename via `tempfile`, a dependency already present on the
//! teacher for test tooling and promoted here to a runtime dependency since it is
//! the idiomatic Rust way to get atomic file replacement.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::info;
use serde_json::{json, Value};

use crate::callback::CallbackClient;
use crate::child::ProgramStatus;
use crate::error::AppResult;

/// Coordinates status-file persistence and best-effort callback delivery.
pub struct PersistAndCallbackManager {
    status_file: Option<PathBuf>,
    callback: Option<CallbackClient>,
    host_name: Mutex<String>,
    port: Mutex<u16>,
    last_posted_generated_files: Mutex<std::collections::HashMap<String, String>>,
}

impl PersistAndCallbackManager {
    pub fn new(status_file: Option<PathBuf>, uri: impl Into<String>, token: impl Into<String>) -> Self {
        let uri = uri.into();
        PersistAndCallbackManager {
            status_file,
            callback: if uri.is_empty() {
                None
            } else {
                Some(CallbackClient::new(uri, token))
            },
            host_name: Mutex::new(String::new()),
            port: Mutex::new(0),
            last_posted_generated_files: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.status_file.is_some() || self.callback.is_some()
    }

    fn save_file(&self, doc: &Value) -> AppResult<()> {
        if let Some(path) = &self.status_file {
            write_atomically(path, &doc.to_string())?;
        }
        Ok(())
    }

    fn post_event(&self, event_type: &str, doc: Value) {
        if let Some(callback) = &self.callback {
            callback.post_with_retry(event_type, doc);
        }
    }

    pub fn program_started(&self, host_name: &str, port: u16) -> AppResult<()> {
        info!("statusUpdated: RUNNING");
        *self.host_name.lock().expect("host name mutex poisoned") = host_name.to_string();
        *self.port.lock().expect("port mutex poisoned") = port;

        let doc = json!({
            "executor.hostname": host_name,
            "executor.port": port,
            "status": "RUNNING",
        });
        self.save_file(&doc)?;
        self.post_event("statusUpdated", doc);
        Ok(())
    }

    pub fn file_generated(&self, file_tag: &str, value: Value) {
        if self.callback.is_none() {
            return;
        }
        let serialized = value.to_string();
        let mut last = self
            .last_posted_generated_files
            .lock()
            .expect("last posted files mutex poisoned");
        if last.get(file_tag).map(|s| s.as_str()) != Some(serialized.as_str()) {
            info!("fileGenerated:{file_tag}: {serialized}");
            self.post_event(&format!("fileGenerated:{file_tag}"), value);
            last.insert(file_tag.to_string(), serialized);
        }
    }

    pub fn program_finished(&self, status: ProgramStatus, work_dir_size: u64) -> AppResult<()> {
        let host_name = self.host_name.lock().expect("host name mutex poisoned").clone();
        let port = *self.port.lock().expect("port mutex poisoned");

        let mut doc = json!({
            "executor.hostname": host_name,
            "executor.port": port,
            "workDirSize": work_dir_size,
        });
        let status_name = match status {
            ProgramStatus::Exited(code) => {
                doc["status"] = json!("EXITED");
                doc["exitCode"] = json!(code);
                "EXITED"
            }
            ProgramStatus::Signalled(sig) => {
                doc["status"] = json!("SIGNALLED");
                doc["exitSignal"] = json!(sig);
                "SIGNALLED"
            }
            ProgramStatus::CannotKill => {
                doc["status"] = json!("CANNOT_KILL");
                "CANNOT_KILL"
            }
            ProgramStatus::NotStarted | ProgramStatus::Running => {
                log::warn!("Invalid executor status after it is completed.");
                "INVALID"
            }
        };
        info!("statusUpdated: {status_name}");

        self.save_file(&doc)?;
        self.post_event("statusUpdated", doc);
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &str) -> AppResult<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = if let Some(dir) = dir {
        tempfile::NamedTempFile::new_in(dir)?
    } else {
        tempfile::NamedTempFile::new()?
    };
    use std::io::Write;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| crate::error::SupervisorError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_no_status_file_or_uri() {
        let mgr = PersistAndCallbackManager::new(None, "", "");
        assert!(!mgr.enabled());
    }

    #[test]
    fn enabled_with_status_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = PersistAndCallbackManager::new(Some(dir.path().join("status.json")), "", "");
        assert!(mgr.enabled());
    }

    #[test]
    fn program_started_writes_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        let mgr = PersistAndCallbackManager::new(Some(status_path.clone()), "", "");
        mgr.program_started("localhost", 8080).unwrap();

        let contents = std::fs::read_to_string(&status_path).unwrap();
        let parsed: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["status"], "RUNNING");
        assert_eq!(parsed["executor.port"], 8080);
    }

    #[test]
    fn program_finished_records_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        let mgr = PersistAndCallbackManager::new(Some(status_path.clone()), "", "");
        mgr.program_finished(ProgramStatus::Exited(3), 42).unwrap();

        let contents = std::fs::read_to_string(&status_path).unwrap();
        let parsed: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["status"], "EXITED");
        assert_eq!(parsed["exitCode"], 3);
        assert_eq!(parsed["workDirSize"], 42);
    }
}
