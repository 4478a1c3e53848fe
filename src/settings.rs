// Settings store (spec §4.9).  A persistent key/value store backed by a
// single JSON object file.  No repo in the retrieval pack depends on an
// embedded-database crate, so this reuses the teacher's own affinity for
// `tempfile` (already a dependency, used throughout `download.rs` and
// `install.rs` for scratch files) to get an atomic write: write to a
// sibling temp file, `sync_all`, then rename over the target.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const KEY_MIN_BATTERY: &str = "min_battery";
pub const KEY_AUTO_DOWNLOAD: &str = "auto_download";
pub const KEY_FAILURES_BEFORE_WARNING: &str = "failures_before_warning";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoDownload {
    Never,
    WifiOnly,
    Always,
}

impl AutoDownload {
    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "0" => Some(AutoDownload::Never),
            "1" => Some(AutoDownload::WifiOnly),
            "2" => Some(AutoDownload::Always),
            _ => None,
        }
    }
}

/// Write `data` to `path` atomically: a temp file in the same directory,
/// flushed and synced, then renamed over the destination.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().context("destination has no parent directory")?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".settings-")
        .tempfile_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    use std::io::Write;
    tmp.write_all(data).context("writing temp file")?;
    tmp.as_file().sync_all().context("syncing temp file")?;
    tmp.persist(path)
        .with_context(|| format!("renaming temp file to {}", path.display()))?;
    Ok(())
}

/// True iff `key`/`value` form a valid predefined-key assignment, or
/// `key` is a passthrough user-reserved key (starts with `_`).
fn is_valid(key: &str, value: &str) -> bool {
    if key.starts_with('_') {
        return true;
    }
    match key {
        KEY_MIN_BATTERY => value.parse::<u8>().map(|v| v <= 100).unwrap_or(false),
        KEY_AUTO_DOWNLOAD => AutoDownload::from_str(value).is_some(),
        KEY_FAILURES_BEFORE_WARNING => value.parse::<u64>().is_ok(),
        _ => true,
    }
}

pub struct SettingsStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl SettingsStore {
    /// Load the store from `path`, or start empty if the file doesn't
    /// exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set `key` to `value`, ignoring invalid values for predefined keys.
    /// Returns `true` if the stored value actually changed (the caller
    /// emits `SettingChanged` only in that case, per spec).
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool> {
        if !is_valid(key, value) {
            return Ok(false);
        }
        let changed = self.values.get(key).map(String::as_str) != Some(value);
        if changed {
            self.values.insert(key.to_string(), value.to_string());
            self.flush()?;
        }
        Ok(changed)
    }

    pub fn del(&mut self, key: &str) -> Result<bool> {
        let existed = self.values.remove(key).is_some();
        if existed {
            self.flush()?;
        }
        Ok(existed)
    }

    pub fn show_all(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    fn flush(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.values)?;
        atomic_write(&self.path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_predefined_keys() {
        let dir = TempDir::new().unwrap();
        let mut store = SettingsStore::open(dir.path().join("settings.json")).unwrap();

        assert!(store.set(KEY_MIN_BATTERY, "50").unwrap());
        assert_eq!(store.get(KEY_MIN_BATTERY), Some("50"));

        // invalid: out of range, ignored (not stored)
        assert!(!store.set(KEY_MIN_BATTERY, "150").unwrap());
        assert_eq!(store.get(KEY_MIN_BATTERY), Some("50"));

        assert!(!store.set(KEY_AUTO_DOWNLOAD, "7").unwrap());
        assert!(store.set(KEY_AUTO_DOWNLOAD, "2").unwrap());
    }

    #[test]
    fn test_unchanged_value_does_not_report_change() {
        let dir = TempDir::new().unwrap();
        let mut store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert!(store.set(KEY_FAILURES_BEFORE_WARNING, "3").unwrap());
        assert!(!store.set(KEY_FAILURES_BEFORE_WARNING, "3").unwrap());
    }

    #[test]
    fn test_user_reserved_keys_pass_through() {
        let dir = TempDir::new().unwrap();
        let mut store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert!(store.set("_custom_key", "anything goes").unwrap());
        assert_eq!(store.get("_custom_key"), Some("anything goes"));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        {
            let mut store = SettingsStore::open(&path).unwrap();
            store.set(KEY_MIN_BATTERY, "20").unwrap();
        }
        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.get(KEY_MIN_BATTERY), Some("20"));
    }

    #[test]
    fn test_del_setting() {
        let dir = TempDir::new().unwrap();
        let mut store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        store.set(KEY_MIN_BATTERY, "20").unwrap();
        assert!(store.del(KEY_MIN_BATTERY).unwrap());
        assert!(!store.del(KEY_MIN_BATTERY).unwrap());
        assert_eq!(store.get(KEY_MIN_BATTERY), None);
    }
}
