use std::path::{Path, PathBuf};

use log::info;
use ndarray::{s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{ClientId, TRAIN_ROWS};
use crate::error::DataError;

pub const FEATURE_COLUMNS: [&str; 7] = [
    "distance",
    "sleep",
    "bmi",
    "age",
    "breakfast",
    "meal",
    "gender",
];
pub const TARGET_COLUMNS: [&str; 2] = ["sleep_deficit", "distance_deficit"];

/// Feature rows paired by index with target rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPartition {
    pub features: Array2<f32>,
    pub targets: Array2<f32>,
}

impl DataPartition {
    pub fn new(features: Array2<f32>, targets: Array2<f32>) -> Result<Self, DataError> {
        if features.nrows() != targets.nrows() {
            return Err(DataError::RowMismatch {
                features: features.nrows(),
                targets: targets.nrows(),
            });
        }
        Ok(Self { features, targets })
    }

    pub fn rows(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn input_dim(&self) -> usize {
        self.features.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.targets.ncols()
    }

    /// Deterministic split: rows `[0, at)` and `[at, rows)`.
    ///
    /// When the partition is shorter than `at`, everything is training data
    /// and the held-out half is empty.
    pub fn split_at(&self, at: usize) -> (DataPartition, DataPartition) {
        let at = at.min(self.rows());
        let head = DataPartition {
            features: self.features.slice(s![..at, ..]).to_owned(),
            targets: self.targets.slice(s![..at, ..]).to_owned(),
        };
        let tail = DataPartition {
            features: self.features.slice(s![at.., ..]).to_owned(),
            targets: self.targets.slice(s![at.., ..]).to_owned(),
        };
        (head, tail)
    }

    /// The protocol's fixed train/test split (first [`TRAIN_ROWS`] rows train).
    pub fn train_test_split(&self) -> (DataPartition, DataPartition) {
        self.split_at(TRAIN_ROWS)
    }
}

/// Standardises each feature column to zero mean and unit population variance.
///
/// A constant column is centred and left at scale 1.
pub fn standard_scale(features: &Array2<f32>) -> Array2<f32> {
    if features.nrows() == 0 {
        return features.clone();
    }
    let mean: Array1<f32> = features
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(features.ncols()));
    let std = features.std_axis(Axis(0), 0.0).mapv(|s| if s == 0.0 { 1.0 } else { s });
    (features - &mean) / &std
}

pub fn partition_path(data_dir: &Path, client_id: ClientId) -> PathBuf {
    data_dir.join(format!("data{client_id}.csv"))
}

/// Loads `data{client_id}.csv`, keeps row order, scales the features.
pub fn load_partition(data_dir: &Path, client_id: ClientId) -> Result<DataPartition, DataError> {
    let path = partition_path(data_dir, client_id);
    let csv_err = |source| DataError::Csv {
        path: path.clone(),
        source,
    };

    let mut reader = csv::Reader::from_path(&path).map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let column_index = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| DataError::MissingColumn {
                path: path.clone(),
                column: name.to_string(),
            })
    };
    let feature_idx = FEATURE_COLUMNS
        .iter()
        .map(|c| column_index(*c))
        .collect::<Result<Vec<_>, _>>()?;
    let target_idx = TARGET_COLUMNS
        .iter()
        .map(|c| column_index(*c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut features = Vec::new();
    let mut targets = Vec::new();
    let mut rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let read = |idx: usize, out: &mut Vec<f32>| -> Result<(), DataError> {
            let raw = record.get(idx).unwrap_or("").trim();
            let value = raw.parse::<f32>().map_err(|_| DataError::Parse {
                path: path.clone(),
                row: row + 1,
                column: headers.get(idx).unwrap_or("").to_string(),
                value: raw.to_string(),
            })?;
            out.push(value);
            Ok(())
        };
        for &idx in &feature_idx {
            read(idx, &mut features)?;
        }
        for &idx in &target_idx {
            read(idx, &mut targets)?;
        }
        rows += 1;
    }
    if rows == 0 {
        return Err(DataError::Empty(path));
    }

    let features = Array2::from_shape_vec((rows, FEATURE_COLUMNS.len()), features)?;
    let targets = Array2::from_shape_vec((rows, TARGET_COLUMNS.len()), targets)?;
    info!(
        "Loaded partition for client {}: {} rows from {}",
        client_id,
        rows,
        path.display()
    );

    DataPartition::new(standard_scale(&features), targets)
}

/// Reproducible stand-in partition for smoke runs without CSV files.
///
/// Targets are a fixed noisy linear function of the features, so every
/// client sees the same underlying relation with different samples.
pub fn synthetic_partition(client_id: ClientId, rows: usize, seed: u64) -> DataPartition {
    let mut rng = StdRng::seed_from_u64(seed ^ (u64::from(client_id) << 32));
    let input_dim = FEATURE_COLUMNS.len();
    let features = Array2::from_shape_fn((rows, input_dim), |_| rng.gen_range(-1.0f32..1.0));
    let mut targets = Array2::zeros((rows, TARGET_COLUMNS.len()));
    for (i, row) in features.axis_iter(Axis(0)).enumerate() {
        let a: f32 = row.iter().enumerate().map(|(j, v)| v * (j as f32 - 3.0) * 0.3).sum();
        let b: f32 = row.iter().enumerate().map(|(j, v)| v * (1.5 - j as f32 * 0.4)).sum();
        targets[[i, 0]] = a + rng.gen_range(-0.05f32..0.05);
        targets[[i, 1]] = b + rng.gen_range(-0.05f32..0.05);
    }
    DataPartition {
        features: standard_scale(&features),
        targets,
    }
}
