//! Per-job sync state: what was transferred, and what it looked like at the time.
//!
//! One JSON document per job key, replaced atomically (write to a sibling temp file, then rename)
//! so a crash mid-write never leaves a truncated state behind.

use anyhow::Context;

use crate::path;
use crate::transport::EntryMeta;

pub const STATE_VERSION: u32 = 1;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub synced_at: i64,
}

impl FileFingerprint {
    pub fn new(meta: &EntryMeta, synced_at: i64) -> Self {
        Self {
            remote_id: meta.remote_id.clone(),
            size: meta.size,
            modified_at: meta.modified_at,
            hash: meta.hash.clone(),
            synced_at,
        }
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            remote_id: self.remote_id.clone(),
            size: self.size,
            modified_at: self.modified_at,
            hash: self.hash.clone(),
        }
    }
}

fn both_equal<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

/// Decide whether `current` describes the same content as `previous`.
///
/// Rules, first match wins:
/// 1. both ids known and different: changed
/// 2. both hashes known and equal: same
/// 3. size and modification time both known and equal: same
/// 4. size or modification time equal, and both ids known and equal: same
/// 5. otherwise: changed
pub fn is_same_file(previous: &EntryMeta, current: &EntryMeta) -> bool {
    if let (Some(a), Some(b)) = (&previous.remote_id, &current.remote_id) {
        if a != b {
            return false;
        }
    }
    if both_equal(&previous.hash, &current.hash) {
        return true;
    }
    let same_size = both_equal(&previous.size, &current.size);
    let same_mtime = both_equal(&previous.modified_at, &current.modified_at);
    if same_size && same_mtime {
        return true;
    }
    (same_size || same_mtime) && both_equal(&previous.remote_id, &current.remote_id)
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub version: u32,
    pub job_key: String,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<i64>,
    #[serde(default)]
    pub files: std::collections::BTreeMap<String, FileFingerprint>,
}

impl SyncState {
    pub fn empty(job_key: &str) -> Self {
        Self {
            version: STATE_VERSION,
            job_key: job_key.to_string(),
            updated_at: now_millis(),
            last_sync_at: None,
            files: Default::default(),
        }
    }

    /// True when `target_path` was synced before and its source looks unchanged.
    pub fn is_unchanged(&self, target_path: &str, current: &EntryMeta) -> bool {
        self.files
            .get(target_path)
            .is_some_and(|previous| is_same_file(&previous.meta(), current))
    }

    pub fn record(&mut self, target_path: &str, meta: &EntryMeta) {
        self.files
            .insert(target_path.to_string(), FileFingerprint::new(meta, now_millis()));
    }
}

/// First 16 hex digits of the SHA-256 of `job_key`.
fn key_digest(job_key: &str) -> String {
    use sha2::Digest;
    let digest = sha2::Sha256::digest(job_key.as_bytes());
    hex::encode(&digest[..8])
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: std::path::PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// `<sanitized key>-<hash of key>.json`, so distinct keys never collide after sanitizing.
    pub fn file_for(&self, job_key: &str) -> std::path::PathBuf {
        let readable: String = path::sanitize_segment(job_key).chars().take(64).collect();
        self.dir
            .join(format!("{}-{}.json", readable, key_digest(job_key)))
    }

    /// Missing, unreadable or corrupt state all start from scratch.
    pub async fn load(&self, job_key: &str) -> SyncState {
        let file = self.file_for(job_key);
        let contents = match tokio::fs::read(&file).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no sync state at {:?}", &file);
                return SyncState::empty(job_key);
            }
            Err(error) => {
                tracing::warn!("cannot read sync state {:?}, starting fresh: {}", &file, &error);
                return SyncState::empty(job_key);
            }
        };
        match serde_json::from_slice::<SyncState>(&contents) {
            Ok(state) if state.version == STATE_VERSION && state.job_key == job_key => state,
            Ok(state) => {
                tracing::warn!(
                    "ignoring sync state {:?} (version {}, job {:?})",
                    &file,
                    state.version,
                    &state.job_key
                );
                SyncState::empty(job_key)
            }
            Err(error) => {
                tracing::warn!("corrupt sync state {:?}, starting fresh: {}", &file, &error);
                SyncState::empty(job_key)
            }
        }
    }

    pub async fn save(&self, state: &mut SyncState) -> anyhow::Result<()> {
        state.updated_at = now_millis();
        let file = self.file_for(&state.job_key);
        let contents = serde_json::to_vec_pretty(state).context("failed serializing sync state")?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("cannot create state directory {:?}", &self.dir))?;
        let tmp = file.with_extension(format!("json.{}.tmp", std::process::id()));
        tokio::fs::write(&tmp, &contents)
            .await
            .with_context(|| format!("failed writing {:?}", &tmp))?;
        if let Err(error) = tokio::fs::rename(&tmp, &file).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(error).with_context(|| format!("failed replacing {:?}", &file));
        }
        tracing::debug!("saved sync state {:?} ({} files)", &file, state.files.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn meta(id: Option<&str>, size: Option<u64>, mtime: Option<i64>, hash: Option<&str>) -> EntryMeta {
        EntryMeta {
            remote_id: id.map(str::to_string),
            size,
            modified_at: mtime,
            hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn fingerprint_rules() {
        let cases = [
            // different ids win over everything
            (
                meta(Some("a"), Some(1), Some(5), Some("h")),
                meta(Some("b"), Some(1), Some(5), Some("h")),
                false,
            ),
            // equal hash
            (meta(None, Some(1), None, Some("h")), meta(None, Some(2), None, Some("h")), true),
            // size and mtime
            (meta(None, Some(1), Some(5), None), meta(Some("x"), Some(1), Some(5), None), true),
            // size only needs matching ids
            (meta(Some("a"), Some(1), Some(5), None), meta(Some("a"), Some(1), Some(6), None), true),
            (meta(None, Some(1), Some(5), None), meta(None, Some(1), Some(6), None), false),
            // mtime only with matching ids
            (meta(Some("a"), Some(1), Some(5), None), meta(Some("a"), Some(2), Some(5), None), true),
            // nothing known
            (meta(None, None, None, None), meta(None, None, None, None), false),
            // hash mismatch falls through to size/mtime
            (meta(None, Some(1), Some(5), Some("h1")), meta(None, Some(1), Some(5), Some("h2")), true),
        ];
        for (idx, (previous, current, expected)) in cases.iter().enumerate() {
            assert_eq!(is_same_file(previous, current), *expected, "case {idx}");
        }
    }

    fn arb_meta() -> impl Strategy<Value = EntryMeta> {
        (
            proptest::option::of("[ab]"),
            proptest::option::of(0u64..3),
            proptest::option::of(0i64..3),
            proptest::option::of("[xy]"),
        )
            .prop_map(|(remote_id, size, modified_at, hash)| EntryMeta {
                remote_id,
                size,
                modified_at,
                hash,
            })
    }

    proptest! {
        #[test]
        fn comparison_is_symmetric(a in arb_meta(), b in arb_meta()) {
            prop_assert_eq!(is_same_file(&a, &b), is_same_file(&b, &a));
        }

        #[test]
        fn different_ids_always_differ(a in arb_meta(), b in arb_meta()) {
            if let (Some(x), Some(y)) = (&a.remote_id, &b.remote_id) {
                if x != y {
                    prop_assert!(!is_same_file(&a, &b));
                }
            }
        }
    }

    #[test]
    fn serializes_camel_case_and_skips_unknowns() -> anyhow::Result<()> {
        let mut state = SyncState::empty("job");
        state.files.insert(
            "/a.txt".to_string(),
            FileFingerprint::new(&meta(Some("f1"), Some(3), None, None), 42),
        );
        let value = serde_json::to_value(&state)?;
        assert_eq!(value["version"], 1);
        assert_eq!(value["jobKey"], "job");
        assert!(value.get("lastSyncAt").is_none());
        let file = &value["files"]["/a.txt"];
        assert_eq!(file["remoteId"], "f1");
        assert_eq!(file["syncedAt"], 42);
        assert!(file.get("modifiedAt").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn save_then_load() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = StateStore::new(tmp.path().join("state"));
        let mut state = SyncState::empty("group:1/main");
        state.last_sync_at = Some(7);
        state.record("/a", &meta(None, Some(10), Some(20), None));
        store.save(&mut state).await?;
        let loaded = store.load("group:1/main").await;
        assert_eq!(loaded, state);
        assert!(loaded.is_unchanged("/a", &meta(None, Some(10), Some(20), None)));
        assert!(!loaded.is_unchanged("/a", &meta(None, Some(11), Some(20), None)));
        assert!(!loaded.is_unchanged("/b", &meta(None, Some(10), Some(20), None)));
        // only the final file remains, no temp leftovers
        assert_eq!(std::fs::read_dir(store.dir())?.count(), 1);
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn corrupt_or_missing_state_starts_empty() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = StateStore::new(tmp.path());
        assert!(store.load("fresh").await.files.is_empty());
        std::fs::write(store.file_for("broken"), b"{not json")?;
        let state = store.load("broken").await;
        assert!(state.files.is_empty());
        assert_eq!(state.job_key, "broken");
        assert!(logs_contain("corrupt sync state"));
        Ok(())
    }

    #[test]
    fn distinct_keys_get_distinct_files() {
        let store = StateStore::new("/tmp/state");
        assert_ne!(store.file_for("a/b"), store.file_for("a:b"));
        assert_eq!(store.file_for("a/b"), store.file_for("a/b"));
        assert_eq!(
            store.file_for("a/b"),
            std::path::Path::new("/tmp/state/a_b-c14cddc033f64b9d.json")
        );
    }
}
