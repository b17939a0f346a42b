//! Append-only record logs and the persisted rollout state.
//!
//! Layout under the data directory:
//!
//! ```text
//! gas_samples.jsonl         one GasSample per line
//! execution_results.jsonl   one ExecutionRecord per line
//! rollout_state.json        latest RolloutState, replaced atomically
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::engine::ExecutionResult;
use crate::error::StoreError;
use crate::monitor::GasSample;
use crate::rollout::RolloutState;

const GAS_SAMPLES: &str = "gas_samples.jsonl";
const EXECUTION_RESULTS: &str = "execution_results.jsonl";
const ROLLOUT_STATE: &str = "rollout_state.json";

/// An execution result keyed by time and scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// When the result was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    /// Scenario of the plan.
    pub scenario_tag: String,
    /// The result itself.
    pub result: ExecutionResult,
}

/// File-backed record store.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl RecordStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self { dir })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a cost sample.
    pub fn append_gas_sample(&self, sample: &GasSample) -> Result<(), StoreError> {
        self.append(GAS_SAMPLES, sample)
    }

    /// Append an execution record.
    pub fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.append(EXECUTION_RESULTS, record)
    }

    /// Every cost sample, oldest first.
    pub fn gas_samples(&self) -> Result<Vec<GasSample>, StoreError> {
        self.read_lines(GAS_SAMPLES)
    }

    /// Every execution record, oldest first.
    pub fn execution_records(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.read_lines(EXECUTION_RESULTS)
    }

    /// Replace the persisted rollout state.
    ///
    /// Written to a temp file and renamed over the old one, so readers never
    /// see a partial state.
    pub fn write_rollout_state(&self, state: &RolloutState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)?;
        let path = self.dir.join(ROLLOUT_STATE);
        let temp_path = path.with_extension("tmp");

        let cleanup = |err: StoreError| {
            let _ = fs::remove_file(&temp_path);
            err
        };

        let mut file = File::create(&temp_path).map_err(io_error(&temp_path))?;
        file.write_all(json.as_bytes())
            .map_err(io_error(&temp_path))
            .map_err(cleanup)?;
        file.sync_all()
            .map_err(io_error(&temp_path))
            .map_err(cleanup)?;
        fs::rename(&temp_path, &path)
            .map_err(io_error(&path))
            .map_err(cleanup)?;
        Ok(())
    }

    /// The persisted rollout state, if any.
    pub fn load_rollout_state(&self) -> Result<Option<RolloutState>, StoreError> {
        let path = self.dir.join(ROLLOUT_STATE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(io_error(&path))?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn append<T: Serialize>(&self, name: &str, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let path = self.dir.join(name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;
        file.write_all(line.as_bytes()).map_err(io_error(&path))?;
        Ok(())
    }

    fn read_lines<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(io_error(&path))?;

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_error(&path))?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ImplementationTag;
    use alloy_primitives::B256;
    use pretty_assertions::assert_eq;

    fn sample(cost: u64) -> GasSample {
        GasSample {
            scenario_tag: "constant_product>constant_product".into(),
            implementation_tag: ImplementationTag::Optimized,
            cost_consumed: cost,
            success: true,
            recorded_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn samples_append_one_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        store.append_gas_sample(&sample(1)).unwrap();
        store.append_gas_sample(&sample(2)).unwrap();

        let raw = fs::read_to_string(dir.path().join(GAS_SAMPLES)).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert_eq!(store.gas_samples().unwrap(), vec![sample(1), sample(2)]);
    }

    #[test]
    fn execution_records_keep_large_profits() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        let record = ExecutionRecord {
            recorded_at: OffsetDateTime::UNIX_EPOCH,
            scenario_tag: "s".into(),
            result: ExecutionResult::committed(
                B256::repeat_byte(7),
                ImplementationTag::Reference,
                i128::from(u64::MAX) * 4,
                123,
            ),
        };
        store.append_execution(&record).unwrap();
        assert_eq!(store.execution_records().unwrap(), vec![record]);
    }

    #[test]
    fn rollout_state_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("nested")).unwrap();
        assert_eq!(store.load_rollout_state().unwrap(), None);

        let mut state = RolloutState::initial(OffsetDateTime::UNIX_EPOCH);
        store.write_rollout_state(&state).unwrap();
        state.traffic_percentage = 5;
        store.write_rollout_state(&state).unwrap();

        assert_eq!(store.load_rollout_state().unwrap(), Some(state));
        assert!(!store.dir().join("rollout_state.tmp").exists());
    }

    #[test]
    fn missing_logs_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        assert!(store.execution_records().unwrap().is_empty());
    }
}
