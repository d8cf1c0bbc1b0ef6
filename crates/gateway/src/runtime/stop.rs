//! Run stop registry.
//!
//! A stop request is a short-lived key `agent:stop:<run_id>` with an
//! absolute expiry, persisted in a JSON file under the shared state
//! directory so replicas observe each other's flags (`/stop` may land on
//! any replica). Every read fails open: an unreadable registry never
//! blocks a run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use od_domain::clock::now_ms;

pub struct StopRegistry {
    path: PathBuf,
    default_ttl: Duration,
    /// Serializes read-modify-write of the registry file in this process.
    guard: Mutex<()>,
}

impl StopRegistry {
    pub fn new(state_path: &Path, default_ttl: Duration) -> std::io::Result<Self> {
        std::fs::create_dir_all(state_path)?;
        Ok(Self {
            path: state_path.join("stops.json"),
            default_ttl,
            guard: Mutex::new(()),
        })
    }

    fn key(run_id: &str) -> String {
        format!("agent:stop:{run_id}")
    }

    fn load(&self) -> HashMap<String, i64> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn save(&self, entries: &HashMap<String, i64>) {
        let tmp = self.path.with_extension("json.tmp");
        let json = match serde_json::to_string(entries) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize stop registry");
                return;
            }
        };
        if let Err(e) = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &self.path)) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to persist stop registry");
        }
    }

    /// Set the stop flag for a run. `ttl` defaults to the configured TTL.
    pub fn request_stop(&self, run_id: &str, ttl: Option<Duration>) {
        let _guard = self.guard.lock();
        let mut entries = self.load();
        let now = now_ms();
        entries.retain(|_, expires| *expires > now);
        let ttl = ttl.unwrap_or(self.default_ttl);
        entries.insert(Self::key(run_id), now + ttl.as_millis() as i64);
        self.save(&entries);
    }

    /// Remove the stop flag for a run. Called at the start of every run so
    /// a stop requested against a prior run does not leak into the next.
    pub fn clear_stop(&self, run_id: &str) {
        let _guard = self.guard.lock();
        let mut entries = self.load();
        if entries.remove(&Self::key(run_id)).is_some() {
            self.save(&entries);
        }
    }

    /// Whether a stop has been requested. Fails open on any error.
    pub fn should_stop(&self, run_id: &str) -> bool {
        let entries = self.load();
        entries
            .get(&Self::key(run_id))
            .map(|expires| *expires > now_ms())
            .unwrap_or(false)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
