//! Durable per-transfer resume state.
//!
//! One JSON file per transfer id under the configured root. Saves are
//! atomic (temp file + rename) so a crash mid-write never corrupts an
//! existing record.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResumeState {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub sha256_hex: String,
    pub chunk_size: u32,
    pub last_confirmed_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResumeStore {
    base_dir: PathBuf,
}

impl ResumeStore {
    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to prepare resume dir at {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn load(&self, transfer_id: &Uuid) -> Result<Option<TransferResumeState>> {
        let path = self.path_for(transfer_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read resume state {}", path.display()))?;
        let state: TransferResumeState = serde_json::from_str(&contents)
            .with_context(|| format!("invalid resume state {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &TransferResumeState) -> Result<()> {
        let path = self.path_for(&state.transfer_id);
        let payload =
            serde_json::to_vec_pretty(state).context("failed to serialise resume state")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)
            .with_context(|| format!("failed to write resume state {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to commit resume state {}", path.display()))?;
        Ok(())
    }

    pub fn delete(&self, transfer_id: &Uuid) -> Result<()> {
        let path = self.path_for(transfer_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove resume state {}", path.display()))?;
        }
        Ok(())
    }

    fn path_for(&self, transfer_id: &Uuid) -> PathBuf {
        self.base_dir.join(format!("{transfer_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(last_confirmed: u64) -> TransferResumeState {
        TransferResumeState {
            transfer_id: Uuid::new_v4(),
            file_name: "report.pdf".into(),
            file_size: 100 * 1024,
            sha256_hex: "ab".repeat(32),
            chunk_size: 4096,
            last_confirmed_sequence: last_confirmed,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn save_load_delete_roundtrip() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = ResumeStore::with_base_dir(temp.path().to_path_buf()).expect("store");

        let state = sample_state(12);
        store.save(&state).expect("save");

        let loaded = store
            .load(&state.transfer_id)
            .expect("load")
            .expect("state present");
        assert_eq!(loaded, state);

        store.delete(&state.transfer_id).expect("delete");
        assert!(store.load(&state.transfer_id).expect("load").is_none());
    }

    #[test]
    fn missing_state_is_none() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = ResumeStore::with_base_dir(temp.path().to_path_buf()).expect("store");
        assert!(store.load(&Uuid::new_v4()).expect("load").is_none());
    }

    #[test]
    fn save_overwrites_previous_progress() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = ResumeStore::with_base_dir(temp.path().to_path_buf()).expect("store");

        let mut state = sample_state(1);
        store.save(&state).expect("save");
        state.last_confirmed_sequence = 49;
        store.save(&state).expect("overwrite");

        let loaded = store
            .load(&state.transfer_id)
            .expect("load")
            .expect("state present");
        assert_eq!(loaded.last_confirmed_sequence, 49);
    }

    #[test]
    fn delete_of_missing_state_is_fine() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = ResumeStore::with_base_dir(temp.path().to_path_buf()).expect("store");
        store.delete(&Uuid::new_v4()).expect("delete");
    }
}
