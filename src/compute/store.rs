//! Candidate persistence.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::schema::{Candidate, CandidateStatus};

/// Store errors. Any of them aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Unknown candidate {0}")]
    UnknownCandidate(u64),
    #[error("Corrupt store at line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

/// Persistent record of every candidate of one search run.
pub trait CandidateStore {
    /// Record a candidate awaiting relaxation.
    fn add_unrelaxed(&mut self, candidate: &Candidate) -> Result<(), StoreError>;
    /// Record a relaxed candidate, replacing its unrelaxed entry.
    fn add_relaxed(&mut self, candidate: &Candidate) -> Result<(), StoreError>;
    /// Mark a candidate as killed.
    fn kill(&mut self, id: u64) -> Result<(), StoreError>;
    /// Number of candidates still awaiting relaxation.
    fn unrelaxed_count(&self) -> Result<usize, StoreError>;
    /// The oldest candidate awaiting relaxation.
    fn next_unrelaxed(&self) -> Result<Option<Candidate>, StoreError>;
    /// Every relaxed candidate, ordered by ID.
    fn all_relaxed(&self) -> Result<Vec<Candidate>, StoreError>;
    /// Look up a candidate by ID.
    fn get(&self, id: u64) -> Result<Option<Candidate>, StoreError>;
    /// Total number of candidates ever recorded.
    fn candidate_count(&self) -> Result<usize, StoreError>;
    /// Largest ID recorded so far.
    fn max_id(&self) -> Result<Option<u64>, StoreError>;
}

/// In-memory store, used for tests and throwaway runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    candidates: BTreeMap<u64, Candidate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_with_status(&mut self, candidate: &Candidate, status: CandidateStatus) {
        let mut stored = candidate.clone();
        stored.status = status;
        self.candidates.insert(stored.id, stored);
    }
}

impl CandidateStore for MemoryStore {
    fn add_unrelaxed(&mut self, candidate: &Candidate) -> Result<(), StoreError> {
        self.insert_with_status(candidate, CandidateStatus::Unrelaxed);
        Ok(())
    }

    fn add_relaxed(&mut self, candidate: &Candidate) -> Result<(), StoreError> {
        self.insert_with_status(candidate, CandidateStatus::Relaxed);
        Ok(())
    }

    fn kill(&mut self, id: u64) -> Result<(), StoreError> {
        let candidate = self
            .candidates
            .get_mut(&id)
            .ok_or(StoreError::UnknownCandidate(id))?;
        candidate.status = CandidateStatus::Killed;
        Ok(())
    }

    fn unrelaxed_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .candidates
            .values()
            .filter(|c| c.status == CandidateStatus::Unrelaxed)
            .count())
    }

    fn next_unrelaxed(&self) -> Result<Option<Candidate>, StoreError> {
        Ok(self
            .candidates
            .values()
            .find(|c| c.status == CandidateStatus::Unrelaxed)
            .cloned())
    }

    fn all_relaxed(&self) -> Result<Vec<Candidate>, StoreError> {
        Ok(self
            .candidates
            .values()
            .filter(|c| c.status == CandidateStatus::Relaxed)
            .cloned()
            .collect())
    }

    fn get(&self, id: u64) -> Result<Option<Candidate>, StoreError> {
        Ok(self.candidates.get(&id).cloned())
    }

    fn candidate_count(&self) -> Result<usize, StoreError> {
        Ok(self.candidates.len())
    }

    fn max_id(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.candidates.keys().next_back().copied())
    }
}

/// One line of the JSON store log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StoreEvent {
    Unrelaxed { candidate: Candidate },
    Relaxed { candidate: Candidate },
    Killed { id: u64 },
}

/// Append-only JSON-lines store; the log is replayed on open.
///
/// Every write is flushed before returning so that a crash mid-generation
/// keeps all completed relaxations.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    file: File,
    state: MemoryStore,
}

impl JsonStore {
    /// File name of the log inside a run directory.
    pub const FILE_NAME: &'static str = "candidates.jsonl";

    /// Open (or create) the store of a run directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);

        let mut state = MemoryStore::new();
        let mut terminate_tail = false;
        if path.exists() {
            let bytes = fs::read(&path)?;
            let complete = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
            let (body, tail) = bytes.split_at(complete);

            let mut lines = 0;
            for (index, line) in body.split(|&b| b == b'\n').enumerate() {
                lines = index + 1;
                replay_line(&mut state, line, index + 1)?;
            }

            // A crash during `append` leaves an unterminated last line.
            if !is_blank(tail) {
                let line = lines;
                match serde_json::from_slice::<StoreEvent>(tail) {
                    Ok(event) => {
                        replay(&mut state, event).map_err(|e| StoreError::Corrupt {
                            line,
                            message: e.to_string(),
                        })?;
                        terminate_tail = true;
                    }
                    Err(e) => {
                        log::warn!(
                            "Discarding partial entry at line {} of {}: {}",
                            line,
                            path.display(),
                            e
                        );
                        OpenOptions::new()
                            .write(true)
                            .open(&path)?
                            .set_len(complete as u64)?;
                    }
                }
            }
            log::info!(
                "Opened store {} with {} candidates",
                path.display(),
                state.candidates.len()
            );
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if terminate_tail {
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(Self { path, file, state })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, event: &StoreEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn replay_line(state: &mut MemoryStore, line: &[u8], number: usize) -> Result<(), StoreError> {
    if is_blank(line) {
        return Ok(());
    }
    let corrupt = |message: String| StoreError::Corrupt {
        line: number,
        message,
    };
    let event: StoreEvent = serde_json::from_slice(line).map_err(|e| corrupt(e.to_string()))?;
    replay(state, event).map_err(|e| corrupt(e.to_string()))
}

fn replay(state: &mut MemoryStore, event: StoreEvent) -> Result<(), StoreError> {
    match event {
        StoreEvent::Unrelaxed { candidate } => state.add_unrelaxed(&candidate),
        StoreEvent::Relaxed { candidate } => state.add_relaxed(&candidate),
        StoreEvent::Killed { id } => state.kill(id),
    }
}

impl CandidateStore for JsonStore {
    fn add_unrelaxed(&mut self, candidate: &Candidate) -> Result<(), StoreError> {
        self.append(&StoreEvent::Unrelaxed {
            candidate: candidate.clone(),
        })?;
        self.state.add_unrelaxed(candidate)
    }

    fn add_relaxed(&mut self, candidate: &Candidate) -> Result<(), StoreError> {
        self.append(&StoreEvent::Relaxed {
            candidate: candidate.clone(),
        })?;
        self.state.add_relaxed(candidate)
    }

    fn kill(&mut self, id: u64) -> Result<(), StoreError> {
        if self.state.get(id)?.is_none() {
            return Err(StoreError::UnknownCandidate(id));
        }
        self.append(&StoreEvent::Killed { id })?;
        self.state.kill(id)
    }

    fn unrelaxed_count(&self) -> Result<usize, StoreError> {
        self.state.unrelaxed_count()
    }

    fn next_unrelaxed(&self) -> Result<Option<Candidate>, StoreError> {
        self.state.next_unrelaxed()
    }

    fn all_relaxed(&self) -> Result<Vec<Candidate>, StoreError> {
        self.state.all_relaxed()
    }

    fn get(&self, id: u64) -> Result<Option<Candidate>, StoreError> {
        self.state.get(id)
    }

    fn candidate_count(&self) -> Result<usize, StoreError> {
        self.state.candidate_count()
    }

    fn max_id(&self) -> Result<Option<u64>, StoreError> {
        self.state.max_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Structure;
    use nalgebra::Matrix3;
    use tempfile::tempdir;

    fn candidate(id: u64) -> Candidate {
        let structure = Structure::new(
            vec!["O".to_string()],
            vec![[0.0, 0.0, 0.0]],
            Matrix3::identity() * 3.0,
        );
        Candidate::unrelaxed(id, structure, 0, Vec::new(), "random")
    }

    fn relaxed(id: u64, score: f64) -> Candidate {
        let mut c = candidate(id);
        c.status = CandidateStatus::Relaxed;
        c.raw_score = Some(score);
        c.energy = Some(-score);
        c
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let mut store = MemoryStore::new();
        store.add_unrelaxed(&candidate(1)).unwrap();
        store.add_unrelaxed(&candidate(2)).unwrap();
        assert_eq!(store.unrelaxed_count().unwrap(), 2);
        assert_eq!(store.next_unrelaxed().unwrap().unwrap().id, 1);

        store.add_relaxed(&relaxed(1, -3.0)).unwrap();
        store.kill(2).unwrap();

        assert_eq!(store.unrelaxed_count().unwrap(), 0);
        assert!(store.next_unrelaxed().unwrap().is_none());
        let all = store.all_relaxed().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].raw_score, Some(-3.0));
        assert_eq!(
            store.get(2).unwrap().unwrap().status,
            CandidateStatus::Killed
        );
        assert_eq!(store.max_id().unwrap(), Some(2));
    }

    #[test]
    fn test_kill_unknown_candidate() {
        let mut store = MemoryStore::new();
        assert!(matches!(
            store.kill(9),
            Err(StoreError::UnknownCandidate(9))
        ));
    }

    #[test]
    fn test_json_store_replays_log() {
        let dir = tempdir().unwrap();
        {
            let mut store = JsonStore::open(dir.path()).unwrap();
            store.add_unrelaxed(&candidate(1)).unwrap();
            store.add_unrelaxed(&candidate(2)).unwrap();
            store.add_unrelaxed(&candidate(3)).unwrap();
            store.add_relaxed(&relaxed(1, -1.5)).unwrap();
            store.kill(2).unwrap();
        }

        let store = JsonStore::open(dir.path()).unwrap();
        assert_eq!(store.candidate_count().unwrap(), 3);
        assert_eq!(store.unrelaxed_count().unwrap(), 1);
        assert_eq!(store.next_unrelaxed().unwrap().unwrap().id, 3);
        assert_eq!(store.all_relaxed().unwrap()[0].id, 1);
        assert_eq!(
            store.get(2).unwrap().unwrap().status,
            CandidateStatus::Killed
        );
    }

    #[test]
    fn test_json_store_rejects_corrupt_log() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(JsonStore::FILE_NAME), "{not json}\n").unwrap();
        assert!(matches!(
            JsonStore::open(dir.path()),
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn test_json_store_rejects_corrupt_middle_line() {
        let dir = tempdir().unwrap();
        {
            let mut store = JsonStore::open(dir.path()).unwrap();
            store.add_unrelaxed(&candidate(1)).unwrap();
        }
        let path = dir.path().join(JsonStore::FILE_NAME);
        let mut log = fs::read_to_string(&path).unwrap();
        log.push_str("{\"event\":\"relaxed\",\n");
        log.push_str("{\"event\":\"killed\",\"id\":1}\n");
        fs::write(&path, log).unwrap();

        assert!(matches!(
            JsonStore::open(dir.path()),
            Err(StoreError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn test_json_store_recovers_from_partial_write() {
        let dir = tempdir().unwrap();
        {
            let mut store = JsonStore::open(dir.path()).unwrap();
            store.add_unrelaxed(&candidate(1)).unwrap();
            store.add_relaxed(&relaxed(1, -2.0)).unwrap();
        }
        let path = dir.path().join(JsonStore::FILE_NAME);
        let intact = fs::read(&path).unwrap();
        let mut log = intact.clone();
        log.extend_from_slice(br#"{"event":"relaxed","candidate":{"id":1,"#);
        fs::write(&path, log).unwrap();

        {
            let mut store = JsonStore::open(dir.path()).unwrap();
            assert_eq!(fs::read(&path).unwrap(), intact);
            assert_eq!(store.all_relaxed().unwrap()[0].raw_score, Some(-2.0));
            store.add_unrelaxed(&candidate(2)).unwrap();
        }

        let store = JsonStore::open(dir.path()).unwrap();
        assert_eq!(store.candidate_count().unwrap(), 2);
        assert_eq!(store.next_unrelaxed().unwrap().unwrap().id, 2);
    }

    #[test]
    fn test_json_store_terminates_complete_last_line() {
        let dir = tempdir().unwrap();
        {
            let mut store = JsonStore::open(dir.path()).unwrap();
            store.add_unrelaxed(&candidate(1)).unwrap();
        }
        let path = dir.path().join(JsonStore::FILE_NAME);
        let mut log = fs::read_to_string(&path).unwrap();
        log.push_str(r#"{"event":"killed","id":1}"#);
        fs::write(&path, log).unwrap();

        {
            let mut store = JsonStore::open(dir.path()).unwrap();
            assert_eq!(
                store.get(1).unwrap().unwrap().status,
                CandidateStatus::Killed
            );
            store.add_unrelaxed(&candidate(2)).unwrap();
        }

        let store = JsonStore::open(dir.path()).unwrap();
        assert_eq!(store.candidate_count().unwrap(), 2);
    }
}
