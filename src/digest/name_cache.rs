use crate::digest::util::write_atomic;
use crate::digest::warn::{self, Warning};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Remote directory that turns Slack ids into display names.
pub trait NameLookup {
    fn lookup_user(&self, id: &str) -> Result<String>;
    fn lookup_channel(&self, id: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NameKind {
    User,
    Channel,
}

impl NameKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameCacheFile {
    pub schema_version: u32,
    pub users: BTreeMap<String, String>,
    pub channels: BTreeMap<String, String>,
}

impl Default for NameCacheFile {
    fn default() -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            users: BTreeMap::new(),
            channels: BTreeMap::new(),
        }
    }
}

impl NameCacheFile {
    fn map(&self, kind: NameKind) -> &BTreeMap<String, String> {
        match kind {
            NameKind::User => &self.users,
            NameKind::Channel => &self.channels,
        }
    }

    fn map_mut(&mut self, kind: NameKind) -> &mut BTreeMap<String, String> {
        match kind {
            NameKind::User => &mut self.users,
            NameKind::Channel => &mut self.channels,
        }
    }

    /// Pull in entries another process persisted; ours win on conflict.
    fn absorb(&mut self, other: NameCacheFile) {
        for (id, name) in other.users {
            self.users.entry(id).or_insert(name);
        }
        for (id, name) in other.channels {
            self.channels.entry(id).or_insert(name);
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    file: NameCacheFile,
    // Ids whose lookup failed this run. Not persisted.
    failed: BTreeSet<(NameKind, String)>,
}

/// Persistent id -> name mapping shared by every channel task of a run.
#[derive(Debug)]
pub struct NameCache {
    path: PathBuf,
    state: Mutex<CacheState>,
}

fn read_cache_file(path: &Path) -> Result<Option<NameCacheFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let parsed: NameCacheFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

impl NameCache {
    /// Open the cache at `path`. A missing file starts empty; an unreadable
    /// one is discarded with a warning since every entry can be refetched.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match read_cache_file(&path) {
            Ok(found) => found.unwrap_or_default(),
            Err(err) => {
                warn::emit(Warning {
                    code: "NAME_CACHE_RESET",
                    stage: "cache-load",
                    reason: "unreadable",
                    err: &format!("{err:#}"),
                    ..Warning::default()
                });
                NameCacheFile::default()
            }
        };
        Self::with_file(path, file)
    }

    /// Start from nothing, ignoring whatever is on disk.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self::with_file(path.into(), NameCacheFile::default())
    }

    fn with_file(path: PathBuf, file: NameCacheFile) -> Self {
        Self {
            path,
            state: Mutex::new(CacheState {
                file,
                failed: BTreeSet::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        let state = self.state();
        state.file.users.len() + state.file.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve_user(&self, id: &str, lookup: &dyn NameLookup) -> String {
        self.resolve(NameKind::User, id, lookup)
    }

    pub fn resolve_channel(&self, id: &str, lookup: &dyn NameLookup) -> String {
        self.resolve(NameKind::Channel, id, lookup)
    }

    /// Return the cached name for `id`, fetching and persisting it on a
    /// miss. A failed fetch falls back to the raw id and is not retried
    /// for the rest of the process.
    pub fn resolve(&self, kind: NameKind, id: &str, lookup: &dyn NameLookup) -> String {
        let id = id.trim();
        if id.is_empty() {
            return String::new();
        }

        // Held across the lookup so concurrent tasks never fetch the same id twice.
        let mut state = self.state();
        if let Some(name) = state.file.map(kind).get(id) {
            return name.clone();
        }
        let failed_key = (kind, id.to_string());
        if state.failed.contains(&failed_key) {
            return id.to_string();
        }

        let fetched = match kind {
            NameKind::User => lookup.lookup_user(id),
            NameKind::Channel => lookup.lookup_channel(id),
        };
        match fetched {
            Ok(name) => {
                let name = name.trim().to_string();
                let name = if name.is_empty() { id.to_string() } else { name };
                state.file.map_mut(kind).insert(id.to_string(), name.clone());
                if let Err(err) = self.persist(&mut state.file) {
                    warn::emit(Warning {
                        code: "NAME_CACHE_WRITE",
                        stage: "cache-persist",
                        reason: kind.as_str(),
                        err: &format!("{err:#}"),
                        ..Warning::default()
                    });
                }
                name
            }
            Err(err) => {
                warn::emit(Warning {
                    code: "NAME_LOOKUP_FAILED",
                    stage: "names",
                    reason: kind.as_str(),
                    err: &format!("{id}: {err:#}"),
                    ..Warning::default()
                });
                state.failed.insert(failed_key);
                id.to_string()
            }
        }
    }

    /// Drop every entry and write the emptied cache.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state();
        state.file = NameCacheFile::default();
        state.failed.clear();
        let lock = self.lock_file()?;
        write_atomic(&self.path, &render_cache(&state.file)?)?;
        FileExt::unlock(&lock)?;
        Ok(())
    }

    fn lock_file(&self) -> Result<fs::File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let lock_path = lock_path(&self.path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;
        lock.lock_exclusive()
            .with_context(|| format!("failed to lock {}", lock_path.display()))?;
        Ok(lock)
    }

    /// Write the full mapping back under an exclusive file lock, merging in
    /// anything another process added since we loaded.
    fn persist(&self, file: &mut NameCacheFile) -> Result<()> {
        let lock = self.lock_file()?;
        if let Ok(Some(on_disk)) = read_cache_file(&self.path) {
            file.absorb(on_disk);
        }
        file.schema_version = CACHE_SCHEMA_VERSION;
        write_atomic(&self.path, &render_cache(file)?)?;
        FileExt::unlock(&lock)?;
        Ok(())
    }
}

fn render_cache(file: &NameCacheFile) -> Result<String> {
    Ok(format!("{}\n", serde_json::to_string_pretty(file)?))
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::NameLookup;
    use anyhow::Result;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory directory that counts every remote call.
    #[derive(Default)]
    pub struct FakeDirectory {
        pub users: BTreeMap<String, String>,
        pub channels: BTreeMap<String, String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeDirectory {
        pub fn with_users(pairs: &[(&str, &str)]) -> Self {
            Self {
                users: pairs
                    .iter()
                    .map(|(id, name)| (id.to_string(), name.to_string()))
                    .collect(),
                ..Self::default()
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().expect("calls lock").len()
        }
    }

    impl NameLookup for FakeDirectory {
        fn lookup_user(&self, id: &str) -> Result<String> {
            self.calls.lock().expect("calls lock").push(format!("user:{id}"));
            self.users
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("user_not_found"))
        }

        fn lookup_channel(&self, id: &str) -> Result<String> {
            self.calls.lock().expect("calls lock").push(format!("channel:{id}"));
            self.channels
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("channel_not_found"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::FakeDirectory;
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn repeated_ids_are_fetched_once() {
        let tmp = tempdir().expect("tempdir");
        let cache = NameCache::load(tmp.path().join("names.json"));
        let dir = FakeDirectory::with_users(&[("U1", "alice"), ("U2", "bob")]);

        for _ in 0..3 {
            assert_eq!(cache.resolve_user("U1", &dir), "alice");
            assert_eq!(cache.resolve_user("U2", &dir), "bob");
        }
        assert_eq!(dir.call_count(), 2);
    }

    #[test]
    fn failed_lookup_falls_back_to_id_without_caching() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("names.json");
        let cache = NameCache::load(&path);
        let dir = FakeDirectory::default();

        assert_eq!(cache.resolve_user("U404", &dir), "U404");
        assert_eq!(cache.resolve_user("U404", &dir), "U404");
        assert_eq!(dir.call_count(), 1);
        assert!(cache.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn resolved_names_survive_reload() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("cache/names.json");
        {
            let cache = NameCache::load(&path);
            let mut dir = FakeDirectory::with_users(&[("U1", "alice")]);
            dir.channels.insert("C1".to_string(), "general".to_string());
            cache.resolve_user("U1", &dir);
            cache.resolve_channel("C1", &dir);
        }

        let reloaded = NameCache::load(&path);
        let dir = FakeDirectory::default();
        assert_eq!(reloaded.resolve_user("U1", &dir), "alice");
        assert_eq!(reloaded.resolve_channel("C1", &dir), "general");
        assert_eq!(dir.call_count(), 0);

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["schema_version"], 1);
        assert_eq!(raw["users"]["U1"], "alice");
        assert_eq!(raw["channels"]["C1"], "general");
    }

    #[test]
    fn corrupt_cache_starts_empty() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("names.json");
        fs::write(&path, "{not json").expect("write");
        let cache = NameCache::load(&path);
        assert!(cache.is_empty());
    }

    #[test]
    fn persist_merges_entries_written_by_another_process() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("names.json");
        let ours = NameCache::load(&path);
        let theirs = NameCache::load(&path);

        theirs.resolve_user("U2", &FakeDirectory::with_users(&[("U2", "bob")]));
        ours.resolve_user("U1", &FakeDirectory::with_users(&[("U1", "alice")]));

        let merged = NameCache::load(&path);
        let offline = FakeDirectory::default();
        assert_eq!(merged.resolve_user("U1", &offline), "alice");
        assert_eq!(merged.resolve_user("U2", &offline), "bob");
        assert_eq!(offline.call_count(), 0);
    }

    #[test]
    fn clear_empties_disk_copy() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("names.json");
        let cache = NameCache::load(&path);
        cache.resolve_user("U1", &FakeDirectory::with_users(&[("U1", "alice")]));
        cache.clear().expect("clear");
        assert!(NameCache::load(&path).is_empty());
    }

    #[test]
    fn lock_path_sits_next_to_cache() {
        assert_eq!(
            lock_path(Path::new("/tmp/cache/names.json")),
            PathBuf::from("/tmp/cache/names.json.lock")
        );
    }
}
