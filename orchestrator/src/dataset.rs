//! Dataset sources
//!
//! A dataset is an ordered list of puzzles. Puzzle content is opaque to the
//! orchestrator; only the expected answer is inspected, to score replies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::state::PuzzleId;

/// Error type for dataset loading
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Dataset not found: {0}")]
    NotFound(String),

    #[error("Invalid dataset reference: {0}")]
    InvalidRef(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate puzzle id '{0}'")]
    DuplicatePuzzle(String),
}

/// Result type for dataset loading
pub type DatasetResult<T> = Result<T, DatasetError>;

/// Shared reference to a dataset source
pub type SharedDatasetSource = Arc<dyn DatasetSource>;

/// One puzzle of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Puzzle {
    pub id: PuzzleId,
    /// Opaque content handed to backends
    pub payload: Value,
    /// Expected answer; puzzles without one can never be scored correct
    #[serde(default)]
    pub expected: Option<Value>,
}

impl Puzzle {
    pub fn new(id: impl Into<PuzzleId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            expected: None,
        }
    }

    pub fn with_expected(mut self, expected: Value) -> Self {
        self.expected = Some(expected);
        self
    }

    /// Whether `answer` matches the expected answer
    pub fn is_correct(&self, answer: &Value) -> bool {
        self.expected.as_ref().is_some_and(|e| e == answer)
    }
}

/// Resolves dataset references to puzzles
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn load(&self, dataset_ref: &str) -> DatasetResult<Vec<Puzzle>>;
}

/// Datasets registered in memory
#[derive(Debug, Default)]
pub struct InMemoryDatasets {
    sets: RwLock<HashMap<String, Vec<Puzzle>>>,
}

impl InMemoryDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, dataset_ref: impl Into<String>, puzzles: Vec<Puzzle>) -> Self {
        self.insert(dataset_ref, puzzles);
        self
    }

    pub fn insert(&self, dataset_ref: impl Into<String>, puzzles: Vec<Puzzle>) {
        if let Ok(mut sets) = self.sets.write() {
            sets.insert(dataset_ref.into(), puzzles);
        }
    }
}

#[async_trait]
impl DatasetSource for InMemoryDatasets {
    async fn load(&self, dataset_ref: &str) -> DatasetResult<Vec<Puzzle>> {
        let sets = self
            .sets
            .read()
            .map_err(|_| DatasetError::NotFound(dataset_ref.to_string()))?;
        let puzzles = sets
            .get(dataset_ref)
            .cloned()
            .ok_or_else(|| DatasetError::NotFound(dataset_ref.to_string()))?;
        check_unique(&puzzles)?;
        Ok(puzzles)
    }
}

/// On-disk puzzle without its id (taken from the file stem)
#[derive(Debug, Deserialize)]
struct PuzzleFile {
    payload: Value,
    #[serde(default)]
    expected: Option<Value>,
}

/// Datasets stored under a root directory.
///
/// A reference `abc` resolves to either `<root>/abc.json`, holding an array
/// of puzzles, or `<root>/abc/`, holding one `*.json` file per puzzle.
#[derive(Debug, Clone)]
pub struct DirectoryDatasets {
    root: PathBuf,
}

impl DirectoryDatasets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_file(path: &Path) -> DatasetResult<Vec<Puzzle>> {
        let text = read(path).await?;
        serde_json::from_str(&text).map_err(|source| DatasetError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn load_dir(dir: &Path) -> DatasetResult<Vec<Puzzle>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|source| DatasetError::Io {
                path: dir.to_path_buf(),
                source,
            })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        // Directory order is unspecified; puzzle order follows file names
        paths.sort();

        let mut puzzles = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = read(&path).await?;
            let file: PuzzleFile =
                serde_json::from_str(&text).map_err(|source| DatasetError::Parse {
                    path: path.clone(),
                    source,
                })?;
            puzzles.push(Puzzle {
                id: id.to_string(),
                payload: file.payload,
                expected: file.expected,
            });
        }
        Ok(puzzles)
    }
}

#[async_trait]
impl DatasetSource for DirectoryDatasets {
    async fn load(&self, dataset_ref: &str) -> DatasetResult<Vec<Puzzle>> {
        validate_ref(dataset_ref)?;

        let file = self.root.join(format!("{dataset_ref}.json"));
        let dir = self.root.join(dataset_ref);

        let puzzles = if tokio::fs::metadata(&file).await.is_ok_and(|m| m.is_file()) {
            Self::load_file(&file).await?
        } else if tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            Self::load_dir(&dir).await?
        } else {
            return Err(DatasetError::NotFound(dataset_ref.to_string()));
        };

        check_unique(&puzzles)?;
        debug!(dataset = dataset_ref, puzzles = puzzles.len(), "Dataset loaded");
        Ok(puzzles)
    }
}

async fn read(path: &Path) -> DatasetResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// References are plain names, never paths
fn validate_ref(dataset_ref: &str) -> DatasetResult<()> {
    let bad = dataset_ref.is_empty()
        || dataset_ref.starts_with('.')
        || dataset_ref.contains(['/', '\\'])
        || dataset_ref.contains("..");
    if bad {
        return Err(DatasetError::InvalidRef(dataset_ref.to_string()));
    }
    Ok(())
}

fn check_unique(puzzles: &[Puzzle]) -> DatasetResult<()> {
    let mut seen = std::collections::HashSet::with_capacity(puzzles.len());
    for puzzle in puzzles {
        if !seen.insert(puzzle.id.as_str()) {
            return Err(DatasetError::DuplicatePuzzle(puzzle.id.clone()));
        }
    }
    Ok(())
}
