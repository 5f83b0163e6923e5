use std::fs;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::ParamError;
use crate::federated_learning as proto;
use crate::metrics::MetricsRecord;

/// Client identity; also selects the client's data partition.
pub type ClientId = u32;

/// Rows at the head of a partition used for local training; the rest is held out.
pub const TRAIN_ROWS: usize = 8;
/// Local optimisation passes per Fit call.
pub const LOCAL_EPOCHS: usize = 5;
/// Mini-batch size used during local training.
pub const BATCH_SIZE: usize = 4;

pub const TRAIN_METRICS_FILE: &str = "train_metrics.csv";
pub const TEST_METRICS_FILE: &str = "test_metrics.csv";

/// Ordered tensors making up one model's trainable state.
///
/// Only values change across rounds; the number of tensors and every shape are
/// fixed by the model architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    tensors: Vec<ArrayD<f32>>,
}

impl ParameterSet {
    pub fn new(tensors: Vec<ArrayD<f32>>) -> Self {
        Self { tensors }
    }

    pub fn tensors(&self) -> &[ArrayD<f32>] {
        &self.tensors
    }

    pub fn into_tensors(self) -> Vec<ArrayD<f32>> {
        self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape().to_vec()).collect()
    }

    /// Total number of scalars across all tensors.
    pub fn num_values(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }

    /// Fails unless `other` has the same tensor count and per-tensor shapes.
    pub fn ensure_same_shape(&self, other: &ParameterSet) -> Result<(), ParamError> {
        if self.tensors.len() != other.tensors.len() {
            return Err(ParamError::LengthMismatch {
                expected: self.tensors.len(),
                actual: other.tensors.len(),
            });
        }
        for (index, (mine, theirs)) in self.tensors.iter().zip(&other.tensors).enumerate() {
            if mine.shape() != theirs.shape() {
                return Err(ParamError::ShapeMismatch {
                    index,
                    expected: mine.shape().to_vec(),
                    actual: theirs.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self, ParamError> {
        let bytes = fs::read(path).map_err(|source| ParamError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ParamError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ParamError> {
        let bytes = serde_json::to_vec(self).map_err(|source| ParamError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, bytes).map_err(|source| ParamError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl From<&ParameterSet> for proto::Parameters {
    fn from(params: &ParameterSet) -> Self {
        let tensors = params
            .tensors
            .iter()
            .map(|t| proto::Tensor {
                shape: t.shape().iter().map(|&d| d as u64).collect(),
                values: t.iter().copied().collect(),
            })
            .collect();
        proto::Parameters { tensors }
    }
}

impl TryFrom<proto::Parameters> for ParameterSet {
    type Error = ParamError;

    fn try_from(params: proto::Parameters) -> Result<Self, Self::Error> {
        let tensors = params
            .tensors
            .into_iter()
            .enumerate()
            .map(|(index, t)| {
                let shape: Vec<usize> = t.shape.iter().map(|&d| d as usize).collect();
                let actual = t.values.len();
                ArrayD::from_shape_vec(IxDyn(&shape), t.values).map_err(|_| {
                    ParamError::Malformed {
                        index,
                        shape,
                        actual,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ParameterSet::new(tensors))
    }
}

/// Decodes an optional wire parameter field.
pub(crate) fn decode_parameters(
    params: Option<proto::Parameters>,
) -> Result<ParameterSet, ParamError> {
    params.ok_or(ParamError::Missing)?.try_into()
}

/// Fit instruction broadcast to one client.
#[derive(Debug, Clone)]
pub struct FitIns {
    pub parameters: ParameterSet,
    pub server_round: u64,
}

/// A client's training contribution: its updated parameters weighted by
/// the number of examples it trained on.
#[derive(Debug, Clone)]
pub struct FitRes {
    pub parameters: ParameterSet,
    pub num_examples: u64,
    pub metrics: Option<MetricsRecord>,
    /// Set when the training metrics row could not be appended.
    pub audit_error: Option<String>,
}

/// Evaluation instruction broadcast to one client.
#[derive(Debug, Clone)]
pub struct EvaluateIns {
    pub parameters: ParameterSet,
    pub server_round: u64,
}

/// A client's evaluation contribution. `num_examples == 0` means the client
/// had nothing to evaluate and carries no metrics.
#[derive(Debug, Clone)]
pub struct EvaluateRes {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Option<MetricsRecord>,
    pub audit_error: Option<String>,
}

fn audit_to_wire(audit: &Option<String>) -> String {
    audit.clone().unwrap_or_default()
}

fn audit_from_wire(audit: String) -> Option<String> {
    if audit.is_empty() {
        None
    } else {
        Some(audit)
    }
}

impl From<&FitIns> for proto::FitRequest {
    fn from(ins: &FitIns) -> Self {
        proto::FitRequest {
            parameters: Some((&ins.parameters).into()),
            server_round: ins.server_round,
        }
    }
}

impl TryFrom<proto::FitRequest> for FitIns {
    type Error = ParamError;

    fn try_from(req: proto::FitRequest) -> Result<Self, Self::Error> {
        Ok(FitIns {
            parameters: decode_parameters(req.parameters)?,
            server_round: req.server_round,
        })
    }
}

impl From<&FitRes> for proto::FitResponse {
    fn from(res: &FitRes) -> Self {
        proto::FitResponse {
            parameters: Some((&res.parameters).into()),
            num_examples: res.num_examples,
            metrics: res.metrics.map(Into::into),
            audit_error: audit_to_wire(&res.audit_error),
        }
    }
}

impl TryFrom<proto::FitResponse> for FitRes {
    type Error = ParamError;

    fn try_from(res: proto::FitResponse) -> Result<Self, Self::Error> {
        Ok(FitRes {
            parameters: decode_parameters(res.parameters)?,
            num_examples: res.num_examples,
            metrics: res.metrics.map(Into::into),
            audit_error: audit_from_wire(res.audit_error),
        })
    }
}

impl From<&EvaluateIns> for proto::EvaluateRequest {
    fn from(ins: &EvaluateIns) -> Self {
        proto::EvaluateRequest {
            parameters: Some((&ins.parameters).into()),
            server_round: ins.server_round,
        }
    }
}

impl TryFrom<proto::EvaluateRequest> for EvaluateIns {
    type Error = ParamError;

    fn try_from(req: proto::EvaluateRequest) -> Result<Self, Self::Error> {
        Ok(EvaluateIns {
            parameters: decode_parameters(req.parameters)?,
            server_round: req.server_round,
        })
    }
}

impl From<&EvaluateRes> for proto::EvaluateResponse {
    fn from(res: &EvaluateRes) -> Self {
        proto::EvaluateResponse {
            loss: res.loss,
            num_examples: res.num_examples,
            metrics: res.metrics.map(Into::into),
            audit_error: audit_to_wire(&res.audit_error),
        }
    }
}

impl From<proto::EvaluateResponse> for EvaluateRes {
    fn from(res: proto::EvaluateResponse) -> Self {
        EvaluateRes {
            loss: res.loss,
            num_examples: res.num_examples,
            metrics: res.metrics.map(Into::into),
            audit_error: audit_from_wire(res.audit_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn sample() -> ParameterSet {
        ParameterSet::new(vec![
            arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn(),
            arr1(&[0.5, -0.5, 0.0]).into_dyn(),
        ])
    }

    #[test]
    fn shape_check_accepts_identical_layout() {
        let a = sample();
        let mut b = sample();
        b.tensors[0].fill(0.0);
        assert!(a.ensure_same_shape(&b).is_ok());
        assert_eq!(a.num_values(), 9);
    }

    #[test]
    fn shape_check_rejects_transposed_tensor() {
        let a = sample();
        let b = ParameterSet::new(vec![
            arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn(),
            arr1(&[0.5, -0.5, 0.0]).into_dyn(),
        ]);
        match a.ensure_same_shape(&b) {
            Err(ParamError::ShapeMismatch { index, expected, actual }) => {
                assert_eq!(index, 0);
                assert_eq!(expected, vec![2, 3]);
                assert_eq!(actual, vec![3, 2]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn shape_check_rejects_missing_tensor() {
        let a = sample();
        let b = ParameterSet::new(a.tensors()[..1].to_vec());
        assert!(matches!(
            a.ensure_same_shape(&b),
            Err(ParamError::LengthMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn wire_tensor_keeps_row_major_order() {
        let wire: proto::Parameters = (&sample()).into();
        assert_eq!(wire.tensors[0].shape, vec![2, 3]);
        assert_eq!(wire.tensors[0].values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let back = ParameterSet::try_from(wire).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn malformed_wire_tensor_is_rejected() {
        let wire = proto::Parameters {
            tensors: vec![proto::Tensor {
                shape: vec![2, 2],
                values: vec![1.0, 2.0, 3.0],
            }],
        };
        assert!(matches!(
            ParameterSet::try_from(wire),
            Err(ParamError::Malformed { index: 0, actual: 3, .. })
        ));
    }

    #[test]
    fn missing_parameters_field_is_an_error() {
        let req = proto::FitRequest {
            parameters: None,
            server_round: 1,
        };
        assert!(matches!(FitIns::try_from(req), Err(ParamError::Missing)));
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        sample().save_json(&path).unwrap();
        assert_eq!(ParameterSet::load_json(&path).unwrap(), sample());
    }
}
