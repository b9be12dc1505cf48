use crate::types::DaemonId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::Notify;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Running,
    Draining,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlFile {
    pub mode: Mode,
    #[serde(default)]
    pub pause_requested: bool,
    #[serde(default)]
    pub pause_at_checkpoint: Option<String>,
    #[serde(default)]
    pub drain_timeout_ms: Option<u64>,
}

impl Default for ControlFile {
    fn default() -> Self {
        Self {
            mode: Mode::Running,
            pause_requested: false,
            pause_at_checkpoint: None,
            drain_timeout_ms: None,
        }
    }
}

/// Watches `control.json` on an interval, retaining last-known-good
/// content when the file is briefly unreadable (spec.md §4.9). Invalid
/// content is logged at most once per transition to avoid noisy repeated
/// warnings.
pub struct ControlPlane {
    path: PathBuf,
    current: RwLock<ControlFile>,
    was_invalid: AtomicBool,
    resume_signal: Notify,
}

impl ControlPlane {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(ControlFile::default()),
            was_invalid: AtomicBool::new(false),
            resume_signal: Notify::new(),
        }
    }

    pub fn poll(&self) {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<ControlFile>(&raw) {
                Ok(parsed) => {
                    self.was_invalid.store(false, Ordering::SeqCst);
                    let previously_draining = self.current.read().unwrap().mode == Mode::Draining;
                    *self.current.write().unwrap() = parsed.clone();
                    if previously_draining && parsed.mode == Mode::Running {
                        self.resume_signal.notify_waiters();
                    }
                }
                Err(e) => {
                    if !self.was_invalid.swap(true, Ordering::SeqCst) {
                        warn!(path = %self.path.display(), error = %e, "control file content invalid");
                    }
                }
            },
            Err(_) => {
                // File briefly unreadable; keep last-known-good silently.
            }
        }
    }

    pub fn current(&self) -> ControlFile {
        self.current.read().unwrap().clone()
    }

    pub fn is_draining(&self) -> bool {
        self.current.read().unwrap().mode == Mode::Draining
    }

    /// Returns a future that completes once the mode is no longer pausing
    /// at `checkpoint` — a single checkpoint function rather than ad-hoc
    /// polling scattered across the worker (spec.md §9 Design Notes).
    pub async fn checkpoint(&self, checkpoint: &str) {
        loop {
            let file = self.current();
            let pausing = file.pause_requested
                && file.pause_at_checkpoint.as_deref().map(|c| c == checkpoint).unwrap_or(true);
            if !pausing {
                return;
            }
            self.resume_signal.notified().await;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonRegistryEntry {
    pub version: u32,
    pub daemon_id: String,
    pub pid: i32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub heartbeat_at: chrono::DateTime<chrono::Utc>,
    pub control_root: String,
    pub control_file_path: String,
    pub cwd: String,
    pub command: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryHealth {
    Running,
    Stale,
}

/// Classifies a registry record whose PID is no longer alive as `stale`
/// (spec.md §4.9), mirroring the lock-file-plus-PID idiom from daemon
/// lifecycle management elsewhere in the retrieval pack.
pub fn classify_registry_entry(entry: &DaemonRegistryEntry) -> RegistryHealth {
    if is_pid_alive(entry.pid) {
        RegistryHealth::Running
    } else {
        RegistryHealth::Stale
    }
}

#[cfg(unix)]
fn is_pid_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: i32) -> bool {
    true
}

pub fn registry_path(state_dir: &Path, daemon_id: &DaemonId) -> PathBuf {
    state_dir.join("daemons").join(format!("{}.json", daemon_id.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_is_running_not_draining() {
        let cp = ControlPlane::new("/nonexistent/control.json");
        assert!(!cp.is_draining());
    }

    #[test]
    fn poll_keeps_last_known_good_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, r#"{"mode":"draining"}"#).unwrap();
        let cp = ControlPlane::new(&path);
        cp.poll();
        assert!(cp.is_draining());

        std::fs::remove_file(&path).unwrap();
        cp.poll();
        assert!(cp.is_draining());
    }

    #[test]
    fn poll_ignores_invalid_json_keeping_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, r#"{"mode":"running"}"#).unwrap();
        let cp = ControlPlane::new(&path);
        cp.poll();
        assert!(!cp.is_draining());

        let mut file = std::fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        write!(file, "not json").unwrap();
        cp.poll();
        assert!(!cp.is_draining());
    }

    #[test]
    fn dead_pid_is_classified_stale() {
        let entry = DaemonRegistryEntry {
            version: 1,
            daemon_id: "d1".into(),
            pid: 999_999,
            started_at: chrono::Utc::now(),
            heartbeat_at: chrono::Utc::now(),
            control_root: "/tmp".into(),
            control_file_path: "/tmp/control.json".into(),
            cwd: "/tmp".into(),
            command: "ralph-daemon".into(),
        };
        assert_eq!(classify_registry_entry(&entry), RegistryHealth::Stale);
    }

    #[test]
    fn own_pid_is_classified_running() {
        let entry = DaemonRegistryEntry {
            version: 1,
            daemon_id: "d1".into(),
            pid: std::process::id() as i32,
            started_at: chrono::Utc::now(),
            heartbeat_at: chrono::Utc::now(),
            control_root: "/tmp".into(),
            control_file_path: "/tmp/control.json".into(),
            cwd: "/tmp".into(),
            command: "ralph-daemon".into(),
        };
        assert_eq!(classify_registry_entry(&entry), RegistryHealth::Running);
    }
}
