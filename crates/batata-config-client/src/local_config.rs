//! Local configuration snapshot and failover processor
//!
//! Provides local disaster recovery capabilities:
//! - Failover: operator-authored files that override the server value while present
//! - Snapshot: the last value fetched from the server, used when the server is unreachable
//!
//! Layout under the store root:
//!
//! ```text
//! {env}_batata/data/config-data[-tenant/{tenant}]/{group}/{dataId}      failover
//! {env}_batata/snapshot[-tenant/{tenant}]/{group}/{dataId}              snapshot
//! {env}_batata/encrypted-data-key/failover[-tenant/{tenant}]/{group}/{dataId}
//! {env}_batata/encrypted-data-key/snapshot[-tenant/{tenant}]/{group}/{dataId}
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use tracing::debug;

use crate::config::cache::ConfigKey;
use crate::error::Result;
use crate::properties::ClientProperties;

/// Content of a failover file together with its version stamp
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalOverride {
    pub content: String,
    /// File modification time in nanoseconds since the epoch
    pub version: u64,
}

/// Read/write contract of the local failover and snapshot stores
pub trait LocalConfigStore: Send + Sync + 'static {
    /// Version stamp of the failover file, without reading its content
    fn override_version(&self, key: &ConfigKey) -> Result<Option<u64>>;

    fn read_override(&self, key: &ConfigKey) -> Result<Option<LocalOverride>>;

    fn read_snapshot(&self, key: &ConfigKey) -> Result<Option<String>>;

    /// Write the snapshot; `None` deletes it
    fn write_snapshot(&self, key: &ConfigKey, content: Option<&str>) -> Result<()>;

    fn read_override_data_key(&self, key: &ConfigKey) -> Result<Option<String>>;

    fn read_snapshot_data_key(&self, key: &ConfigKey) -> Result<Option<String>>;

    /// Write the encrypted data key snapshot; `None` deletes it
    fn write_snapshot_data_key(&self, key: &ConfigKey, data_key: Option<&str>) -> Result<()>;
}

/// Snapshot switch to enable/disable snapshot functionality
#[derive(Clone)]
pub struct SnapshotSwitch {
    enabled: Arc<AtomicBool>,
}

impl SnapshotSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Disk-backed [`LocalConfigStore`]
pub struct LocalConfigInfoProcessor {
    snapshot_switch: SnapshotSwitch,
    env_path: PathBuf,
}

impl LocalConfigInfoProcessor {
    /// Create a processor rooted at `base_path` for the given environment
    pub fn new(base_path: impl Into<PathBuf>, env_name: &str, snapshot_switch: SnapshotSwitch) -> Self {
        let env_path = base_path
            .into()
            .join(format!("{}_batata", simplify_env_name(env_name)));
        Self {
            snapshot_switch,
            env_path,
        }
    }

    pub fn from_properties(properties: &ClientProperties) -> Self {
        let base_path = properties
            .local_store_path
            .clone()
            .unwrap_or_else(default_local_store_path);
        Self::new(
            base_path,
            &properties.resolved_env_name(),
            SnapshotSwitch::new(properties.snapshot_enabled),
        )
    }

    pub fn snapshot_switch(&self) -> &SnapshotSwitch {
        &self.snapshot_switch
    }

    pub fn env_path(&self) -> &Path {
        &self.env_path
    }

    /// Remove every snapshot of this environment
    pub fn clean_all_snapshots(&self) -> Result<()> {
        for dir in ["snapshot", "snapshot-tenant"] {
            let path = self.env_path.join(dir);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        let data_key_path = self.env_path.join("encrypted-data-key");
        for dir in ["snapshot", "snapshot-tenant"] {
            let path = data_key_path.join(dir);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }

    /// Failover file path
    pub fn failover_file(&self, key: &ConfigKey) -> PathBuf {
        let mut path = self.env_path.join("data");
        if key.tenant.is_empty() {
            path.push("config-data");
        } else {
            path.push("config-data-tenant");
            path.push(&key.tenant);
        }
        path.push(&key.group);
        path.push(&key.data_id);
        path
    }

    /// Snapshot file path
    pub fn snapshot_file(&self, key: &ConfigKey) -> PathBuf {
        keyed_path(self.env_path.clone(), "snapshot", key)
    }

    fn data_key_failover_file(&self, key: &ConfigKey) -> PathBuf {
        keyed_path(self.env_path.join("encrypted-data-key"), "failover", key)
    }

    fn data_key_snapshot_file(&self, key: &ConfigKey) -> PathBuf {
        keyed_path(self.env_path.join("encrypted-data-key"), "snapshot", key)
    }

    fn write_or_delete(&self, file: &Path, content: Option<&str>) -> Result<()> {
        if !self.snapshot_switch.is_enabled() {
            return Ok(());
        }
        match content {
            Some(content) => {
                if let Some(parent) = file.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(file, content)?;
            }
            None => {
                if file.exists() {
                    fs::remove_file(file)?;
                    debug!(file = ?file, "Deleted snapshot");
                }
            }
        }
        Ok(())
    }

    fn read_snapshot_file(&self, file: &Path) -> Result<Option<String>> {
        if !self.snapshot_switch.is_enabled() {
            return Ok(None);
        }
        read_optional(file)
    }
}

impl LocalConfigStore for LocalConfigInfoProcessor {
    fn override_version(&self, key: &ConfigKey) -> Result<Option<u64>> {
        let file = self.failover_file(key);
        if !file.is_file() {
            return Ok(None);
        }
        Ok(Some(modified_nanos(&file)?))
    }

    fn read_override(&self, key: &ConfigKey) -> Result<Option<LocalOverride>> {
        let file = self.failover_file(key);
        if !file.is_file() {
            return Ok(None);
        }
        let version = modified_nanos(&file)?;
        let content = fs::read_to_string(&file)?;
        Ok(Some(LocalOverride { content, version }))
    }

    fn read_snapshot(&self, key: &ConfigKey) -> Result<Option<String>> {
        self.read_snapshot_file(&self.snapshot_file(key))
    }

    fn write_snapshot(&self, key: &ConfigKey, content: Option<&str>) -> Result<()> {
        self.write_or_delete(&self.snapshot_file(key), content)
    }

    fn read_override_data_key(&self, key: &ConfigKey) -> Result<Option<String>> {
        read_optional(&self.data_key_failover_file(key))
    }

    fn read_snapshot_data_key(&self, key: &ConfigKey) -> Result<Option<String>> {
        self.read_snapshot_file(&self.data_key_snapshot_file(key))
    }

    fn write_snapshot_data_key(&self, key: &ConfigKey, data_key: Option<&str>) -> Result<()> {
        self.write_or_delete(&self.data_key_snapshot_file(key), data_key)
    }
}

/// Get local store path from environment or default
fn default_local_store_path() -> PathBuf {
    if let Ok(path) = std::env::var("BATATA_SNAPSHOT_PATH") {
        return PathBuf::from(path).join("config");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".batata").join("config");
    }

    PathBuf::from(".batata").join("config")
}

fn keyed_path(mut path: PathBuf, dir: &str, key: &ConfigKey) -> PathBuf {
    if key.tenant.is_empty() {
        path.push(dir);
    } else {
        path.push(format!("{}-tenant", dir));
        path.push(&key.tenant);
    }
    path.push(&key.group);
    path.push(&key.data_id);
    path
}

fn read_optional(file: &Path) -> Result<Option<String>> {
    if !file.is_file() {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(file)?))
}

fn modified_nanos(file: &Path) -> Result<u64> {
    let modified = fs::metadata(file)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default())
}

/// Simplify environment name if over limit (max 30 chars)
fn simplify_env_name(name: &str) -> String {
    const MAX_LEN: usize = 30;
    if name.len() > MAX_LEN {
        let prefix: String = name.chars().take(MAX_LEN - 17).collect();
        format!("{}-{}", prefix, hash_string(name))
    } else {
        name.to_string()
    }
}

/// Short hex id of a string
fn hash_string(s: &str) -> String {
    let result = Md5::digest(s.as_bytes());
    const_hex::encode(&result[..8])
}
