//! On-disk artifacts of a search run.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::schema::{Candidate, GenerationRecord, SearchResult};

/// Snapshot of the survivors after one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationExport {
    pub generation: usize,
    pub candidates: Vec<Candidate>,
}

/// Writes per-generation snapshots, the running history and the final
/// result into a run directory.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    pub const HISTORY_FILE: &'static str = "history.jsonl";
    pub const RESULT_FILE: &'static str = "result.json";

    /// Use (and create) the given run directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the population snapshot of a generation.
    pub fn population_path(&self, generation: usize) -> PathBuf {
        self.dir.join(format!("population_gen{generation:03}.json"))
    }

    /// Save the survivors of a generation.
    pub fn save_population(
        &self,
        generation: usize,
        candidates: &[Candidate],
    ) -> io::Result<PathBuf> {
        let path = self.population_path(generation);
        let export = PopulationExport {
            generation,
            candidates: candidates.to_vec(),
        };
        let json = serde_json::to_string_pretty(&export)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Append one generation record to the history log.
    pub fn append_history(&self, record: &GenerationRecord) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(Self::HISTORY_FILE))?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())
    }

    /// Save the final result.
    pub fn save_result(&self, result: &SearchResult) -> io::Result<PathBuf> {
        let path = self.dir.join(Self::RESULT_FILE);
        fs::write(&path, serde_json::to_string_pretty(result)?)?;
        Ok(path)
    }
}

/// Load a population snapshot.
pub fn load_population<P: AsRef<Path>>(path: P) -> io::Result<PopulationExport> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Load a history log.
pub fn load_history<P: AsRef<Path>>(path: P) -> io::Result<Vec<GenerationRecord>> {
    fs::read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Structure;
    use nalgebra::Matrix3;
    use tempfile::tempdir;

    fn record(generation: usize, best: f64) -> GenerationRecord {
        GenerationRecord {
            generation,
            best,
            mean: best - 1.0,
            stdev: 0.5,
            best_ever: best,
            stagnation: 0,
            population: 20,
            admitted: 16,
            killed: 2,
            failed_slots: 0,
            injected: 4,
        }
    }

    #[test]
    fn test_population_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path()).unwrap();
        let structure = Structure::new(
            vec!["O".to_string()],
            vec![[0.1, 0.2, 0.3]],
            Matrix3::identity() * 3.0,
        );
        let candidates = vec![Candidate::unrelaxed(4, structure, 2, vec![1, 2], "pairing: 1 2")];

        let path = artifacts.save_population(7, &candidates).unwrap();
        assert!(path.ends_with("population_gen007.json"));

        let loaded = load_population(&path).unwrap();
        assert_eq!(loaded.generation, 7);
        assert_eq!(loaded.candidates, candidates);
    }

    #[test]
    fn test_history_appends() {
        let dir = tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path().join("run")).unwrap();
        artifacts.append_history(&record(1, -5.0)).unwrap();
        artifacts.append_history(&record(2, -4.5)).unwrap();

        let history = load_history(artifacts.dir().join(RunArtifacts::HISTORY_FILE)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].generation, 2);
        assert_eq!(history[1].best, -4.5);
    }
}
