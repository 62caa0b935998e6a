//! Durable storage: per-key state records and versioned artifacts.
//!
//! [`FileStore`] is the single serialized authority for shared mutable state
//! (rate budgets, breaker records, scheduler checkpoints). Every mutation goes
//! through [`FileStore::update`], an atomic read-modify-write under one lock,
//! so concurrent callers can never observe stale state and jointly over-admit.
//! Records are JSON files written via temp-file-then-rename.
//!
//! [`ArtifactStore`] holds stage outputs keyed by item identity and run id:
//! an immutable `{run_id}.json` per run plus an overwritable `latest.json`,
//! each with a [`RunMetadata`] sidecar.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PolicywatchError;
use crate::item::{ItemKey, Stage};
use crate::schema::RunMetadata;

pub struct FileStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PolicywatchError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, lock: Mutex::new(()) })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PolicywatchError> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        self.read_unlocked(key)
    }

    fn read_unlocked<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PolicywatchError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PolicywatchError> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        self.put_unlocked(key, value)
    }

    fn put_unlocked<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PolicywatchError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    /// Atomic read-modify-write. The record is created from `init` on first
    /// touch (lazy creation), mutated by `f`, and persisted before the lock is
    /// released. Returns whatever `f` returns.
    pub fn update<T, R>(
        &self,
        key: &str,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, PolicywatchError>
    where
        T: Serialize + DeserializeOwned,
    {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let mut record: T = self.read_unlocked(key)?.unwrap_or_else(init);
        let result = f(&mut record);
        self.put_unlocked(key, &record)?;
        Ok(result)
    }

    /// All keys under a prefix, e.g. `items/` for scheduler checkpoints.
    pub fn list_keys(&self, prefix: &str) -> Result<Vec<String>, PolicywatchError> {
        let _guard = self.lock.lock().expect("store lock poisoned");
        let dir = self.root.join(prefix);
        let mut keys = Vec::new();
        if dir.exists() {
            collect_keys(&dir, &self.root, &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }
}

fn collect_keys(dir: &Path, root: &Path, keys: &mut Vec<String>) -> Result<(), PolicywatchError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_keys(&path, root, keys)?;
        } else if path.extension().is_some_and(|e| e == "json") {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| PolicywatchError::Config(e.to_string()))?;
            let mut key = rel.to_string_lossy().into_owned();
            key.truncate(key.len() - ".json".len());
            keys.push(key);
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PolicywatchError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn dir_for(&self, key: &ItemKey, stage: Stage) -> PathBuf {
        self.root
            .join(stage.artifact_dir())
            .join(&key.company)
            .join(&key.policy)
            .join(&key.timestamp)
    }

    /// Persist one run's output. The versioned record is immutable: writing
    /// the same run id twice is an error. `latest` is refreshed every run.
    pub fn write_run(
        &self,
        key: &ItemKey,
        stage: Stage,
        payload: &str,
        meta: &RunMetadata,
    ) -> Result<(), PolicywatchError> {
        let dir = self.dir_for(key, stage);
        std::fs::create_dir_all(&dir)?;

        let versioned = dir.join(format!("{}.json", meta.run_id));
        if versioned.exists() {
            return Err(PolicywatchError::FatalConfig(format!(
                "run {} already recorded for {} at {stage}",
                meta.run_id,
                key.id()
            )));
        }
        write_atomic(&versioned, payload)?;
        write_atomic(
            &dir.join(format!("{}.meta.json", meta.run_id)),
            &serde_json::to_string_pretty(meta)?,
        )?;

        write_atomic(&dir.join("latest.json"), payload)?;
        write_atomic(&dir.join("latest.meta.json"), &serde_json::to_string_pretty(meta)?)?;
        Ok(())
    }

    pub fn read_latest(
        &self,
        key: &ItemKey,
        stage: Stage,
    ) -> Result<Option<(String, RunMetadata)>, PolicywatchError> {
        self.read_named(key, stage, "latest")
    }

    pub fn read_run(
        &self,
        key: &ItemKey,
        stage: Stage,
        run_id: &str,
    ) -> Result<Option<(String, RunMetadata)>, PolicywatchError> {
        self.read_named(key, stage, run_id)
    }

    fn read_named(
        &self,
        key: &ItemKey,
        stage: Stage,
        name: &str,
    ) -> Result<Option<(String, RunMetadata)>, PolicywatchError> {
        let dir = self.dir_for(key, stage);
        let payload_path = dir.join(format!("{name}.json"));
        if !payload_path.exists() {
            return Ok(None);
        }
        let payload = std::fs::read_to_string(payload_path)?;
        let meta = std::fs::read_to_string(dir.join(format!("{name}.meta.json")))?;
        Ok(Some((payload, serde_json::from_str(&meta)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: u32,
    }

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("state")).unwrap();
        (dir, store)
    }

    #[test]
    fn read_missing_key_is_none() {
        let (_dir, store) = store();
        let got: Option<Counter> = store.read("budgets/llm").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn update_creates_lazily_and_persists() {
        let (_dir, store) = store();
        let after = store
            .update("budgets/llm", Counter::default, |c| {
                c.value += 3;
                c.value
            })
            .unwrap();
        assert_eq!(after, 3);

        let read: Counter = store.read("budgets/llm").unwrap().unwrap();
        assert_eq!(read.value, 3);
    }

    #[test]
    fn updates_accumulate_atomically() {
        let (_dir, store) = store();
        for _ in 0..10 {
            store
                .update("counters/c", Counter::default, |c| c.value += 1)
                .unwrap();
        }
        let read: Counter = store.read("counters/c").unwrap().unwrap();
        assert_eq!(read.value, 10);
    }

    #[test]
    fn list_keys_scoped_to_prefix() {
        let (_dir, store) = store();
        store.put("items/acme/tos/1", &Counter::default()).unwrap();
        store.put("items/acme/tos/2", &Counter::default()).unwrap();
        store.put("breakers/scraper", &Counter::default()).unwrap();

        let keys = store.list_keys("items").unwrap();
        assert_eq!(keys, vec!["items/acme/tos/1", "items/acme/tos/2"]);
        assert!(store.list_keys("nothing-here").unwrap().is_empty());
    }

    #[test]
    fn artifact_versioned_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::open(dir.path()).unwrap();
        let key = ItemKey::new("acme", "tos", "20260101");

        let first = RunMetadata::new("v1", "p1", 1);
        artifacts.write_run(&key, Stage::Summarize, r#"{"a":1}"#, &first).unwrap();
        let second = RunMetadata::new("v1", "p2", 2);
        artifacts.write_run(&key, Stage::Summarize, r#"{"chunks":[{},{}]}"#, &second).unwrap();

        // Latest follows the most recent run; versioned records stay intact.
        let (latest, meta) = artifacts.read_latest(&key, Stage::Summarize).unwrap().unwrap();
        assert_eq!(meta.run_id, second.run_id);
        assert!(latest.contains("chunks"));

        let (old, old_meta) = artifacts
            .read_run(&key, Stage::Summarize, &first.run_id)
            .unwrap()
            .unwrap();
        assert_eq!(old, r#"{"a":1}"#);
        assert_eq!(old_meta.prompt_version, "p1");
    }

    #[test]
    fn versioned_run_is_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::open(dir.path()).unwrap();
        let key = ItemKey::new("acme", "tos", "20260101");
        let meta = RunMetadata::new("v1", "p1", 1);

        artifacts.write_run(&key, Stage::Judge, "{}", &meta).unwrap();
        let err = artifacts.write_run(&key, Stage::Judge, "{}", &meta).unwrap_err();
        assert!(matches!(err, PolicywatchError::FatalConfig(_)));
    }

    #[test]
    fn missing_artifact_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::open(dir.path()).unwrap();
        let key = ItemKey::new("acme", "tos", "20260101");
        assert!(artifacts.read_latest(&key, Stage::Diff).unwrap().is_none());
    }
}
