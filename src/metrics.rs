//! Regression metrics and the append-only metrics log.
//!
//! Every local Fit and Evaluate call produces one [`MetricsRecord`] and appends
//! it to a CSV log with columns `client_id,r2_score,accuracy,mse,mae`. The
//! header is written once, when the file is created or empty.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use ndarray::{Array2, Axis, Zip};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::ClientId;
use crate::error::MetricsError;
use crate::federated_learning as proto;

pub const LOG_HEADER: [&str; 5] = ["client_id", "r2_score", "accuracy", "mse", "mae"];

/// Four scalars describing how well predictions match targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// Coefficient of determination, averaged uniformly over target columns.
    pub r2_score: f64,
    /// Fraction of predicted values whose sign class matches the target's.
    pub accuracy: f64,
    /// Mean squared error over every target value.
    pub mse: f64,
    /// Mean absolute error over every target value.
    pub mae: f64,
}

impl MetricsRecord {
    pub fn compute(y_true: &Array2<f32>, y_pred: &Array2<f32>) -> Result<Self, MetricsError> {
        if y_true.dim() != y_pred.dim() {
            return Err(MetricsError::ShapeMismatch {
                expected: y_true.dim(),
                actual: y_pred.dim(),
            });
        }
        if y_true.is_empty() {
            return Err(MetricsError::Empty);
        }

        Ok(Self {
            r2_score: r2_uniform(y_true, y_pred),
            accuracy: sign_agreement(y_true, y_pred),
            mse: mean_error(y_true, y_pred, |d| d * d),
            mae: mean_error(y_true, y_pred, f64::abs),
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "r2={:.4} acc={:.4} mse={:.4} mae={:.4}",
            self.r2_score, self.accuracy, self.mse, self.mae
        )
    }
}

impl From<MetricsRecord> for proto::Metrics {
    fn from(m: MetricsRecord) -> Self {
        proto::Metrics {
            r2_score: m.r2_score,
            accuracy: m.accuracy,
            mse: m.mse,
            mae: m.mae,
        }
    }
}

impl From<proto::Metrics> for MetricsRecord {
    fn from(m: proto::Metrics) -> Self {
        MetricsRecord {
            r2_score: m.r2_score,
            accuracy: m.accuracy,
            mse: m.mse,
            mae: m.mae,
        }
    }
}

fn mean_error(y_true: &Array2<f32>, y_pred: &Array2<f32>, f: impl Fn(f64) -> f64) -> f64 {
    let mut total = 0.0;
    Zip::from(y_true).and(y_pred).for_each(|&t, &p| {
        total += f(f64::from(p) - f64::from(t));
    });
    total / y_true.len() as f64
}

fn r2_uniform(y_true: &Array2<f32>, y_pred: &Array2<f32>) -> f64 {
    let outputs = y_true.ncols();
    let total: f64 = y_true
        .axis_iter(Axis(1))
        .zip(y_pred.axis_iter(Axis(1)))
        .map(|(t, p)| {
            let mean = t.iter().map(|&v| f64::from(v)).sum::<f64>() / t.len() as f64;
            let mut ss_res = 0.0;
            let mut ss_tot = 0.0;
            for (&tv, &pv) in t.iter().zip(p.iter()) {
                ss_res += (f64::from(tv) - f64::from(pv)).powi(2);
                ss_tot += (f64::from(tv) - mean).powi(2);
            }
            if ss_tot == 0.0 {
                // constant target column
                if ss_res == 0.0 {
                    1.0
                } else {
                    0.0
                }
            } else {
                1.0 - ss_res / ss_tot
            }
        })
        .sum();
    total / outputs as f64
}

/// Positive, zero and negative are distinct classes; NaN matches nothing.
fn sign_class(v: f32) -> Option<i8> {
    if v > 0.0 {
        Some(1)
    } else if v < 0.0 {
        Some(-1)
    } else if v == 0.0 {
        Some(0)
    } else {
        None
    }
}

fn sign_agreement(y_true: &Array2<f32>, y_pred: &Array2<f32>) -> f64 {
    let mut hits = 0usize;
    Zip::from(y_true).and(y_pred).for_each(|&t, &p| {
        if let (Some(a), Some(b)) = (sign_class(t), sign_class(p)) {
            if a == b {
                hits += 1;
            }
        }
    });
    hits as f64 / y_true.len() as f64
}

#[derive(Serialize)]
struct LogRow {
    client_id: ClientId,
    r2_score: f64,
    accuracy: f64,
    mse: f64,
    mae: f64,
}

/// Append-only CSV metrics log.
///
/// Clones share one in-process lock, and every append also holds an
/// exclusive advisory lock on the file. Writers in the same process or in
/// separate client processes never interleave rows or duplicate the header.
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl MetricsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, client_id: ClientId, record: &MetricsRecord) -> Result<(), MetricsError> {
        let _guard = self.lock.lock();

        let io_err = |source| MetricsError::Io {
            path: self.path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        // other processes may log to the same file
        FileExt::lock_exclusive(&file).map_err(io_err)?;
        let written = self.write_row(&file, client_id, record);
        FileExt::unlock(&file).map_err(io_err)?;
        written
    }

    fn write_row(
        &self,
        file: &File,
        client_id: ClientId,
        record: &MetricsRecord,
    ) -> Result<(), MetricsError> {
        let io_err = |source| MetricsError::Io {
            path: self.path.clone(),
            source,
        };
        let needs_header = file.metadata().map_err(io_err)?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(LOG_HEADER).map_err(|source| MetricsError::Csv {
                path: self.path.clone(),
                source,
            })?;
        }
        writer
            .serialize(LogRow {
                client_id,
                r2_score: record.r2_score,
                accuracy: record.accuracy,
                mse: record.mse,
                mae: record.mae,
            })
            .map_err(|source| MetricsError::Csv {
                path: self.path.clone(),
                source,
            })?;
        writer.flush().map_err(io_err)
    }

    /// Reads back every data row, mainly for inspection and tests.
    pub fn read_rows(&self) -> Result<Vec<(ClientId, MetricsRecord)>, MetricsError> {
        let mut reader = csv::Reader::from_path(&self.path).map_err(|source| MetricsError::Csv {
            path: self.path.clone(),
            source,
        })?;
        reader
            .deserialize::<(ClientId, f64, f64, f64, f64)>()
            .map(|row| {
                row.map(|(id, r2_score, accuracy, mse, mae)| {
                    (
                        id,
                        MetricsRecord {
                            r2_score,
                            accuracy,
                            mse,
                            mae,
                        },
                    )
                })
                .map_err(|source| MetricsError::Csv {
                    path: self.path.clone(),
                    source,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn identical_predictions_score_perfectly() {
        let y = array![[1.0f32, -2.0], [0.0, 3.0], [-1.5, 0.5]];
        let m = MetricsRecord::compute(&y, &y).unwrap();
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.mse, 0.0);
        assert_eq!(m.mae, 0.0);
        assert!((m.r2_score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_is_its_own_sign_class() {
        let y_true = array![[0.0f32, 1.0], [-1.0, 0.0]];
        let y_pred = array![[0.1f32, 2.0], [-3.0, 0.0]];
        let m = MetricsRecord::compute(&y_true, &y_pred).unwrap();
        // 0 vs 0.1 mismatches, the rest agree
        assert!((m.accuracy - 0.75).abs() < 1e-12);
    }

    #[test]
    fn errors_are_pooled_over_both_outputs() {
        let y_true = array![[0.0f32, 0.0], [0.0, 0.0]];
        let y_pred = array![[1.0f32, -1.0], [2.0, 0.0]];
        let m = MetricsRecord::compute(&y_true, &y_pred).unwrap();
        assert!((m.mse - (1.0 + 1.0 + 4.0) / 4.0).abs() < 1e-12);
        assert!((m.mae - (1.0 + 1.0 + 2.0) / 4.0).abs() < 1e-12);
    }

    #[test]
    fn r2_is_averaged_over_outputs() {
        // first column predicted perfectly, second column predicted by its mean
        let y_true = array![[1.0f32, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let y_pred = array![[1.0f32, 4.0], [2.0, 4.0], [3.0, 4.0]];
        let m = MetricsRecord::compute(&y_true, &y_pred).unwrap();
        assert!((m.r2_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn constant_target_column_scores_zero_unless_exact() {
        let y_true = array![[1.0f32], [1.0]];
        let off = array![[1.0f32], [2.0]];
        assert_eq!(MetricsRecord::compute(&y_true, &off).unwrap().r2_score, 0.0);
        assert_eq!(MetricsRecord::compute(&y_true, &y_true).unwrap().r2_score, 1.0);
    }

    #[test]
    fn empty_and_mismatched_inputs_are_rejected() {
        let empty = Array2::<f32>::zeros((0, 2));
        assert!(matches!(
            MetricsRecord::compute(&empty, &empty),
            Err(MetricsError::Empty)
        ));
        let a = Array2::<f32>::zeros((2, 2));
        let b = Array2::<f32>::zeros((2, 1));
        assert!(matches!(
            MetricsRecord::compute(&a, &b),
            Err(MetricsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn log_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetricsLog::new(dir.path().join("m.csv"));
        let record = MetricsRecord {
            r2_score: 0.5,
            accuracy: 0.75,
            mse: 1.25,
            mae: 0.5,
        };
        log.append(1, &record).unwrap();
        log.clone().append(2, &record).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "client_id,r2_score,accuracy,mse,mae");
        assert!(lines[1].starts_with("1,"));

        let rows = log.read_rows().unwrap();
        assert_eq!(rows, vec![(1, record), (2, record)]);
    }

    #[test]
    fn independent_handles_write_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.csv");
        let start = Arc::new(std::sync::Barrier::new(4));
        let writers: Vec<_> = (0..4)
            .map(|id| {
                // separate handles share no in-process lock
                let log = MetricsLog::new(path.clone());
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    let record = MetricsRecord {
                        r2_score: 0.1,
                        accuracy: 0.2,
                        mse: 0.3,
                        mae: 0.4,
                    };
                    start.wait();
                    for _ in 0..25 {
                        log.append(id, &record).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("client_id")).count(), 1);
        let rows = MetricsLog::new(path).read_rows().unwrap();
        assert_eq!(rows.len(), 100);
        for id in 0..4 {
            assert_eq!(rows.iter().filter(|(c, _)| *c == id).count(), 25);
        }
    }

    #[test]
    fn log_append_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetricsLog::new(dir.path().join("missing").join("m.csv"));
        let record = MetricsRecord {
            r2_score: 0.0,
            accuracy: 0.0,
            mse: 0.0,
            mae: 0.0,
        };
        assert!(matches!(log.append(1, &record), Err(MetricsError::Io { .. })));
    }
}
