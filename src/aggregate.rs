//! Federated averaging.
//!
//! Every aggregate here is `Σ(weight_i · value_i) / Σ(weight_i)` where the
//! weight is the example count a client reported. Zero-weight entries add
//! nothing to either sum, so they are excluded rather than averaged in as
//! zeros. A zero total weight is an error, never a silent zero or NaN.

use ndarray::{ArrayD, Zip};

use crate::common::{ClientId, ParameterSet};
use crate::error::AggregationError;
use crate::metrics::MetricsRecord;

fn total_weight(weights: impl IntoIterator<Item = u64>) -> Result<f64, AggregationError> {
    let mut seen = false;
    let mut total = 0u128;
    for w in weights {
        seen = true;
        total += u128::from(w);
    }
    if !seen {
        return Err(AggregationError::NoContributions);
    }
    if total == 0 {
        return Err(AggregationError::ZeroTotalWeight);
    }
    Ok(total as f64)
}

/// Weighted mean of scalar `(value, weight)` pairs.
pub fn weighted_mean<I>(pairs: I) -> Result<f64, AggregationError>
where
    I: IntoIterator<Item = (f64, u64)>,
    I::IntoIter: Clone,
{
    let pairs = pairs.into_iter();
    let total = total_weight(pairs.clone().map(|(_, w)| w))?;
    let sum: f64 = pairs
        .filter(|&(_, w)| w > 0)
        .map(|(v, w)| v * w as f64)
        .sum();
    Ok(sum / total)
}

/// FedAvg over parameter sets, tensor by tensor.
///
/// Every contribution must share the first contribution's layout; the
/// offending client is named otherwise.
pub fn aggregate_params(
    contributions: &[(ClientId, &ParameterSet, u64)],
) -> Result<ParameterSet, AggregationError> {
    let total = total_weight(contributions.iter().map(|&(_, _, w)| w))?;

    let (_, reference, _) = contributions[0];
    for &(client_id, params, _) in contributions {
        reference
            .ensure_same_shape(params)
            .map_err(|source| AggregationError::Shape { client_id, source })?;
    }

    let mut sums: Vec<ArrayD<f64>> = reference
        .tensors()
        .iter()
        .map(|t| ArrayD::zeros(t.raw_dim()))
        .collect();

    for &(_, params, weight) in contributions.iter().filter(|&&(_, _, w)| w > 0) {
        let w = weight as f64;
        for (acc, tensor) in sums.iter_mut().zip(params.tensors()) {
            Zip::from(acc).and(tensor).for_each(|a, &v| *a += w * f64::from(v));
        }
    }

    let tensors = sums
        .into_iter()
        .map(|acc| acc.mapv(|a| (a / total) as f32))
        .collect();
    Ok(ParameterSet::new(tensors))
}

/// FedAvg applied independently to each metrics field.
pub fn aggregate_metrics(
    contributions: &[(MetricsRecord, u64)],
) -> Result<MetricsRecord, AggregationError> {
    let field = |f: fn(&MetricsRecord) -> f64| {
        weighted_mean(contributions.iter().map(move |(m, w)| (f(m), *w)))
    };
    Ok(MetricsRecord {
        r2_score: field(|m| m.r2_score)?,
        accuracy: field(|m| m.accuracy)?,
        mse: field(|m| m.mse)?,
        mae: field(|m| m.mae)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn params(w: [[f32; 2]; 2], b: [f32; 2]) -> ParameterSet {
        ParameterSet::new(vec![arr2(&w).into_dyn(), arr1(&b).into_dyn()])
    }

    #[test]
    fn weighted_mean_of_scalars() {
        // (0.1*10 + 0.2*30) / 40
        let m = weighted_mean(vec![(0.1, 10), (0.2, 30)]).unwrap();
        assert!((m - 0.175).abs() < 1e-12);
    }

    #[test]
    fn zero_weights_are_excluded() {
        let m = weighted_mean(vec![(4.0, 2), (1000.0, 0), (f64::NAN, 0)]).unwrap();
        assert_eq!(m, 4.0);
    }

    #[test]
    fn zero_total_weight_is_an_error() {
        assert!(matches!(
            weighted_mean(vec![(1.0, 0), (2.0, 0)]),
            Err(AggregationError::ZeroTotalWeight)
        ));
        assert!(matches!(
            weighted_mean(Vec::<(f64, u64)>::new()),
            Err(AggregationError::NoContributions)
        ));
    }

    #[test]
    fn params_are_averaged_by_example_count() {
        let a = params([[1.0, 2.0], [3.0, 4.0]], [0.0, 1.0]);
        let b = params([[3.0, 6.0], [7.0, 0.0]], [4.0, 1.0]);
        let avg = aggregate_params(&[(1, &a, 1), (2, &b, 3)]).unwrap();
        assert_eq!(avg.tensors()[0], arr2(&[[2.5, 5.0], [6.0, 1.0]]).into_dyn());
        assert_eq!(avg.tensors()[1], arr1(&[3.0, 1.0]).into_dyn());
    }

    #[test]
    fn params_with_zero_total_weight_fail() {
        let a = params([[1.0, 2.0], [3.0, 4.0]], [0.0, 1.0]);
        assert!(matches!(
            aggregate_params(&[(1, &a, 0), (2, &a, 0)]),
            Err(AggregationError::ZeroTotalWeight)
        ));
        assert!(matches!(
            aggregate_params(&[]),
            Err(AggregationError::NoContributions)
        ));
    }

    #[test]
    fn mismatched_contribution_names_the_client() {
        let a = params([[1.0, 2.0], [3.0, 4.0]], [0.0, 1.0]);
        let b = ParameterSet::new(vec![
            arr2(&[[1.0f32, 2.0]]).into_dyn(),
            arr1(&[0.0f32, 1.0]).into_dyn(),
        ]);
        match aggregate_params(&[(1, &a, 5), (7, &b, 5)]) {
            Err(AggregationError::Shape { client_id, .. }) => assert_eq!(client_id, 7),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn metrics_fields_are_averaged_independently() {
        let m1 = MetricsRecord {
            r2_score: 1.0,
            accuracy: 0.5,
            mse: 2.0,
            mae: 1.0,
        };
        let m2 = MetricsRecord {
            r2_score: 0.0,
            accuracy: 1.0,
            mse: 6.0,
            mae: 3.0,
        };
        let agg = aggregate_metrics(&[(m1, 7), (m2, 7)]).unwrap();
        assert_eq!(agg.r2_score, 0.5);
        assert_eq!(agg.accuracy, 0.75);
        assert_eq!(agg.mse, 4.0);
        assert_eq!(agg.mae, 2.0);
    }
}
