//! Tabular dataset loading and the train/test split
//!
//! The dataset is a flat CSV with a header row. Every column other than the
//! label column is a numeric feature, kept in file order; that order becomes
//! the column order a trained model expects at inference time.

use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Error type for dataset operations
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to open dataset {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("label column '{0}' not found in header")]
    MissingLabelColumn(String),

    #[error("row {row}, column '{column}': '{value}' is not a valid number")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },

    #[error("row {row}: label {value} is not an integer class")]
    NonIntegerLabel { row: usize, value: f64 },

    #[error("dataset has no rows")]
    Empty,

    #[error("cannot split {rows} rows with test fraction {fraction}")]
    TooSmall { rows: usize, fraction: f64 },

    #[error("data load command `{command}` failed: {reason}")]
    LoadCommand { command: String, reason: String },
}

/// Feature matrix and integer labels read from a CSV file
#[derive(Debug, Clone)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub features: Array2<f64>,
    pub labels: Vec<i64>,
}

/// Shuffled train/held-out partition of a [`Dataset`]
#[derive(Debug, Clone)]
pub struct TrainTestSplit {
    pub feature_names: Vec<String>,
    pub x_train: Array2<f64>,
    pub y_train: Vec<i64>,
    pub x_test: Array2<f64>,
    pub y_test: Vec<i64>,
}

impl Dataset {
    /// Read `path`, treating `label_column` as the target
    pub fn from_csv(path: &Path, label_column: &str) -> Result<Self, DatasetError> {
        let file = File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = csv::Reader::from_reader(BufReader::new(file));

        let headers = reader.headers()?.clone();
        let label_idx = headers
            .iter()
            .position(|h| h == label_column)
            .ok_or_else(|| DatasetError::MissingLabelColumn(label_column.to_string()))?;

        let feature_names: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != label_idx)
            .map(|(_, h)| h.to_string())
            .collect();

        let mut values = Vec::new();
        let mut labels = Vec::new();

        for (row, result) in reader.records().enumerate() {
            let record = result?;
            for (col, field) in record.iter().enumerate() {
                let parsed = parse_number(field).ok_or_else(|| DatasetError::InvalidValue {
                    row,
                    column: headers.get(col).unwrap_or_default().to_string(),
                    value: field.to_string(),
                })?;

                if col == label_idx {
                    if parsed.fract() != 0.0 {
                        return Err(DatasetError::NonIntegerLabel { row, value: parsed });
                    }
                    labels.push(parsed as i64);
                } else {
                    values.push(parsed);
                }
            }
        }

        if labels.is_empty() {
            return Err(DatasetError::Empty);
        }

        let features = Array2::from_shape_vec((labels.len(), feature_names.len()), values)
            .map_err(|e| DatasetError::InvalidValue {
                row: labels.len(),
                column: "*".to_string(),
                value: e.to_string(),
            })?;

        Ok(Self {
            feature_names,
            features,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Shuffle with `seed` and hold out `ceil(len * test_fraction)` rows
    pub fn split(&self, test_fraction: f64, seed: u64) -> Result<TrainTestSplit, DatasetError> {
        let n = self.len();
        let n_test = (n as f64 * test_fraction).ceil() as usize;
        if n_test == 0 || n_test >= n {
            return Err(DatasetError::TooSmall {
                rows: n,
                fraction: test_fraction,
            });
        }

        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let (test_idx, train_idx) = indices.split_at(n_test);
        let take_labels = |idx: &[usize]| idx.iter().map(|&i| self.labels[i]).collect::<Vec<_>>();

        Ok(TrainTestSplit {
            feature_names: self.feature_names.clone(),
            x_train: self.features.select(ndarray::Axis(0), train_idx),
            y_train: take_labels(train_idx),
            x_test: self.features.select(ndarray::Axis(0), test_idx),
            y_test: take_labels(test_idx),
        })
    }
}

fn parse_number(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Upstream action that produces the dataset file when it is missing
pub trait DataSource: Send + Sync {
    fn materialize(&self, path: &Path) -> Result<(), DatasetError>;
}

/// No upstream loader configured; a missing dataset stays missing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDataSource;

impl DataSource for NoopDataSource {
    fn materialize(&self, path: &Path) -> Result<(), DatasetError> {
        warn!(path = %path.display(), "Dataset missing and no data load command configured");
        Ok(())
    }
}

/// Runs a shell command that is expected to write the dataset
#[derive(Debug, Clone)]
pub struct CommandDataSource {
    command: String,
}

impl CommandDataSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl DataSource for CommandDataSource {
    fn materialize(&self, path: &Path) -> Result<(), DatasetError> {
        info!(command = %self.command, path = %path.display(), "Running data load command");

        let status = if cfg!(windows) {
            Command::new("cmd").args(["/C", &self.command]).status()
        } else {
            Command::new("sh").args(["-c", &self.command]).status()
        }
        .map_err(|e| DatasetError::LoadCommand {
            command: self.command.clone(),
            reason: e.to_string(),
        })?;

        if !status.success() {
            return Err(DatasetError::LoadCommand {
                command: self.command.clone(),
                reason: status.to_string(),
            });
        }
        Ok(())
    }
}

/// Data source for an optional configured command
pub fn data_source(command: Option<&str>) -> Box<dyn DataSource> {
    match command {
        Some(cmd) if !cmd.trim().is_empty() => Box::new(CommandDataSource::new(cmd)),
        _ => Box::new(NoopDataSource),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "\
sepal length (cm),sepal width (cm),petal length (cm),petal width (cm),species
5.1,3.5,1.4,0.2,0.0
4.9,3.0,1.4,0.2,0.0
7.0,3.2,4.7,1.4,1.0
6.4,3.2,4.5,1.5,1.0
6.3,3.3,6.0,2.5,2.0
5.8,2.7,5.1,1.9,2.0
";

    fn write(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("iris.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_csv() {
        let dir = TempDir::new().unwrap();
        let data = Dataset::from_csv(&write(&dir, SAMPLE), "species").unwrap();

        assert_eq!(data.len(), 6);
        assert_eq!(data.feature_names.len(), 4);
        assert_eq!(data.feature_names[0], "sepal length (cm)");
        assert_eq!(data.labels, vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(data.features[[2, 2]], 4.7);
    }

    #[test]
    fn test_label_column_may_be_first() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "target,a,b\n1,0.5,0.6\n0,0.1,0.2\n");
        let data = Dataset::from_csv(&path, "target").unwrap();
        assert_eq!(data.feature_names, vec!["a", "b"]);
        assert_eq!(data.features[[0, 1]], 0.6);
        assert_eq!(data.labels, vec![1, 0]);
    }

    #[test]
    fn test_missing_label_column() {
        let dir = TempDir::new().unwrap();
        let result = Dataset::from_csv(&write(&dir, SAMPLE), "target");
        assert!(matches!(result, Err(DatasetError::MissingLabelColumn(_))));
    }

    #[test]
    fn test_non_numeric_value() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a,species\nabc,1\n");
        assert!(matches!(
            Dataset::from_csv(&path, "species"),
            Err(DatasetError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_fractional_label_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a,species\n1.0,0.5\n");
        assert!(matches!(
            Dataset::from_csv(&path, "species"),
            Err(DatasetError::NonIntegerLabel { .. })
        ));
    }

    #[test]
    fn test_split_sizes_and_determinism() {
        let dir = TempDir::new().unwrap();
        let data = Dataset::from_csv(&write(&dir, SAMPLE), "species").unwrap();

        let a = data.split(0.2, 42).unwrap();
        let b = data.split(0.2, 42).unwrap();

        assert_eq!(a.y_test.len(), 2);
        assert_eq!(a.y_train.len(), 4);
        assert_eq!(a.x_train.nrows(), 4);
        assert_eq!(a.x_test.ncols(), 4);
        assert_eq!(a.y_test, b.y_test);
        assert_eq!(a.x_train, b.x_train);
    }

    #[test]
    fn test_split_too_small() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a,species\n1.0,0\n");
        let data = Dataset::from_csv(&path, "species").unwrap();
        assert!(matches!(
            data.split(0.2, 42),
            Err(DatasetError::TooSmall { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_data_source_writes_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("made.csv");
        let source = CommandDataSource::new(format!("printf 'a,species\\n1,0\\n' > '{}'", target.display()));

        source.materialize(&target).unwrap();
        assert!(target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_data_source_failure() {
        let source = CommandDataSource::new("exit 3");
        assert!(matches!(
            source.materialize(Path::new("unused.csv")),
            Err(DatasetError::LoadCommand { .. })
        ));
    }
}
