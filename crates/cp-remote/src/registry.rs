//! Persisted registry of ssh targets
//!
//! `registry.json` is a JSON object keyed by the raw target string. Every
//! mutation reads the whole document, applies the change and rewrites it via
//! a temp file and rename, all while holding an exclusive advisory lock on a
//! sibling `registry.json.lock`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cp_core::error::RemoteError;
use cp_core::paths::StatePaths;

/// What we remember about a target between invocations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Remote daemon port the recorded tunnel forwards to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_jump: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
}

impl RegistryEntry {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn is_starred(&self) -> bool {
        self.starred.unwrap_or(false)
    }
}

/// Accepted on-disk shapes
#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryDocument {
    Map(BTreeMap<String, RegistryEntry>),
    Legacy(Vec<RegistryEntry>),
}

/// Exclusive `flock` held for the lifetime of the guard
struct RegistryLock {
    #[allow(dead_code)]
    file: File,
}

impl RegistryLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: flock is safe to call with a valid file descriptor
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self { file })
    }
}

/// Handle on `registry.json`
#[derive(Debug, Clone)]
pub struct Registry {
    paths: StatePaths,
    path: PathBuf,
}

impl Registry {
    pub fn new(paths: StatePaths) -> Self {
        let path = paths.registry_file();
        Self { paths, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<RegistryLock, RemoteError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = self.path.with_extension("json.lock");
        Ok(RegistryLock::acquire(&lock_path)?)
    }

    /// Read the whole document
    ///
    /// A missing file is empty. An unparseable file is logged and treated as
    /// empty rather than failing the command.
    pub fn load(&self) -> Result<BTreeMap<String, RegistryEntry>, RemoteError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        match serde_json::from_str::<RegistryDocument>(&content) {
            Ok(RegistryDocument::Map(map)) => Ok(map
                .into_iter()
                .map(|(key, mut entry)| {
                    if entry.target.is_empty() {
                        entry.target = key.clone();
                    }
                    (key, entry)
                })
                .collect()),
            Ok(RegistryDocument::Legacy(entries)) => Ok(entries
                .into_iter()
                .filter(|entry| !entry.target.is_empty())
                .map(|entry| (entry.target.clone(), entry))
                .collect()),
            Err(e) => {
                tracing::warn!("Ignoring unreadable registry {:?}: {}", self.path, e);
                Ok(BTreeMap::new())
            }
        }
    }

    fn save(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<(), RemoteError> {
        let json = serde_json::to_string_pretty(entries).map_err(|e| RemoteError::Parse {
            what: "registry".to_string(),
            message: e.to_string(),
        })?;
        let tmp = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get(&self, target: &str) -> Result<Option<RegistryEntry>, RemoteError> {
        Ok(self.load()?.remove(target))
    }

    /// All entries, in no particular order
    pub fn list(&self) -> Result<Vec<RegistryEntry>, RemoteError> {
        Ok(self.load()?.into_values().collect())
    }

    /// Read-modify-write one entry, creating it if needed
    pub fn update<F>(&self, target: &str, apply: F) -> Result<RegistryEntry, RemoteError>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        let entry = entries
            .entry(target.to_string())
            .or_insert_with(|| RegistryEntry::new(target));
        apply(entry);
        entry.target = target.to_string();
        let updated = entry.clone();
        self.save(&entries)?;
        Ok(updated)
    }

    /// Update an entry only if it exists
    pub fn update_existing<F>(&self, target: &str, apply: F) -> Result<Option<RegistryEntry>, RemoteError>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        let Some(entry) = entries.get_mut(target) else {
            return Ok(None);
        };
        apply(entry);
        let updated = entry.clone();
        self.save(&entries)?;
        Ok(Some(updated))
    }

    /// Remove an entry and, best-effort, its local state directory
    pub fn delete(&self, target: &str) -> Result<Option<RegistryEntry>, RemoteError> {
        let removed = {
            let _lock = self.lock()?;
            let mut entries = self.load()?;
            let removed = entries.remove(target);
            if removed.is_some() {
                self.save(&entries)?;
            }
            removed
        };

        let dir = self.paths.target_dir(target);
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove state dir {:?}: {}", dir, e);
            }
        }
        Ok(removed)
    }
}

/// Display order: starred first, then most recently used
pub fn sort_for_display(entries: &mut [RegistryEntry]) {
    entries.sort_by(|a, b| {
        b.is_starred()
            .cmp(&a.is_starred())
            .then_with(|| b.last_used.unwrap_or(0).cmp(&a.last_used.unwrap_or(0)))
            .then_with(|| a.target.cmp(&b.target))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, Registry) {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(StatePaths::new(dir.path()));
        (dir, registry)
    }

    #[test]
    fn test_empty_when_missing() {
        let (_dir, registry) = registry();
        assert!(registry.list().unwrap().is_empty());
        assert!(registry.get("box").unwrap().is_none());
    }

    #[test]
    fn test_update_merges_fields() {
        let (_dir, registry) = registry();
        registry
            .update("me@box:2222", |e| {
                e.host = Some("me@box".to_string());
                e.port = Some(2222);
                e.local_port = Some(8080);
            })
            .unwrap();
        registry.update("me@box:2222", |e| e.tunnel_pid = Some(42)).unwrap();

        let entry = registry.get("me@box:2222").unwrap().unwrap();
        assert_eq!(entry.target, "me@box:2222");
        assert_eq!(entry.local_port, Some(8080));
        assert_eq!(entry.tunnel_pid, Some(42));

        registry.update("me@box:2222", |e| e.tunnel_pid = None).unwrap();
        assert_eq!(registry.get("me@box:2222").unwrap().unwrap().tunnel_pid, None);
    }

    #[test]
    fn test_writes_camel_case_object() {
        let (_dir, registry) = registry();
        registry.update("box", |e| e.local_port = Some(9000)).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(registry.path()).unwrap()).unwrap();
        assert_eq!(raw["box"]["localPort"], 9000);
        assert_eq!(raw["box"]["target"], "box");
        assert!(raw["box"].get("tunnelPid").is_none());
    }

    #[test]
    fn test_reads_legacy_array() {
        let (_dir, registry) = registry();
        fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        fs::write(
            registry.path(),
            r#"[{"target":"a","localPort":1},{"target":"b","lastUsed":5,"extra":true}]"#,
        )
        .unwrap();

        let entries = registry.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["a"].local_port, Some(1));
        assert_eq!(entries["b"].last_used, Some(5));
    }

    #[test]
    fn test_corrupt_registry_is_empty() {
        let (_dir, registry) = registry();
        fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        fs::write(registry.path(), "{not json").unwrap();

        assert!(registry.list().unwrap().is_empty());
        registry.update("box", |e| e.starred = Some(true)).unwrap();
        assert!(registry.get("box").unwrap().unwrap().is_starred());
    }

    #[test]
    fn test_delete_removes_state_dir() {
        let (dir, registry) = registry();
        let paths = StatePaths::new(dir.path());
        registry.update("box", |e| e.local_port = Some(1)).unwrap();
        fs::create_dir_all(paths.target_dir("box")).unwrap();

        let removed = registry.delete("box").unwrap();
        assert_eq!(removed.map(|e| e.local_port), Some(Some(1)));
        assert!(!paths.target_dir("box").exists());
        assert!(registry.delete("box").unwrap().is_none());
    }

    #[test]
    fn test_update_existing_skips_unknown() {
        let (_dir, registry) = registry();
        assert!(registry.update_existing("ghost", |e| e.tunnel_pid = None).unwrap().is_none());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_sort_for_display() {
        let mut entries = vec![
            RegistryEntry { last_used: Some(10), ..RegistryEntry::new("old") },
            RegistryEntry { last_used: Some(30), ..RegistryEntry::new("new") },
            RegistryEntry { last_used: Some(1), starred: Some(true), ..RegistryEntry::new("fav") },
            RegistryEntry::new("never"),
        ];
        sort_for_display(&mut entries);
        let order: Vec<_> = entries.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(order, vec!["fav", "new", "old", "never"]);
    }
}
