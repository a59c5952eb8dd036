//! Per-group folding state for the scalar aggregation table
//!
//! One accumulator exists per output group per step-batch slot; it is reset
//! at the start of every step, fed each group member's sample, and asked for
//! its value at the end. A group with an undefined value (e.g. `min` over no
//! members) is omitted from the output step vector.

use crate::error::{EngineError, Result};
use crate::execution::numeric::{KahanSum, WelfordState};
use crate::logical::AggregateOp;

/// Folding state for one output group at one step.
#[derive(Debug, Clone)]
pub enum Accumulator {
    /// Kahan-compensated sum
    Sum { sum: KahanSum, has_value: bool },
    /// Smallest member
    Min { value: f64, has_value: bool },
    /// Largest member
    Max { value: f64, has_value: bool },
    /// Arithmetic mean
    Avg { sum: KahanSum, count: u64 },
    /// Member count
    Count { count: u64, has_value: bool },
    /// Constant 1 for non-empty groups
    Group { has_value: bool },
    /// Population standard deviation (Welford)
    Stddev(WelfordState),
    /// Population variance (Welford)
    Stdvar(WelfordState),
    /// phi-quantile of the members, parameterised per step
    Quantile { q: f64, values: Vec<f64> },
}

impl Accumulator {
    /// Accumulator for the given aggregation kind.
    ///
    /// Kinds without a scalar-table strategy (`topk`, `bottomk`,
    /// `count_values`) are rejected with a fallback-eligible error.
    pub fn new(op: AggregateOp) -> Result<Self> {
        let acc = match op {
            AggregateOp::Sum => Accumulator::Sum {
                sum: KahanSum::new(),
                has_value: false,
            },
            AggregateOp::Min => Accumulator::Min {
                value: f64::INFINITY,
                has_value: false,
            },
            AggregateOp::Max => Accumulator::Max {
                value: f64::NEG_INFINITY,
                has_value: false,
            },
            AggregateOp::Avg => Accumulator::Avg {
                sum: KahanSum::new(),
                count: 0,
            },
            AggregateOp::Count => Accumulator::Count {
                count: 0,
                has_value: false,
            },
            AggregateOp::Group => Accumulator::Group { has_value: false },
            AggregateOp::Stddev => Accumulator::Stddev(WelfordState::new()),
            AggregateOp::Stdvar => Accumulator::Stdvar(WelfordState::new()),
            AggregateOp::Quantile => Accumulator::Quantile {
                q: f64::NAN,
                values: Vec::new(),
            },
            other => {
                return Err(EngineError::NotSupportedExpr(format!(
                    "unknown aggregation function {other}"
                )))
            }
        };
        Ok(acc)
    }

    /// Clear state for a new step. `param` is the step's parameter for
    /// parameterised kinds.
    pub fn reset(&mut self, param: f64) {
        match self {
            Accumulator::Sum { sum, has_value } => {
                *sum = KahanSum::new();
                *has_value = false;
            }
            Accumulator::Min { value, has_value } => {
                *value = f64::INFINITY;
                *has_value = false;
            }
            Accumulator::Max { value, has_value } => {
                *value = f64::NEG_INFINITY;
                *has_value = false;
            }
            Accumulator::Avg { sum, count } => {
                *sum = KahanSum::new();
                *count = 0;
            }
            Accumulator::Count { count, has_value } => {
                *count = 0;
                *has_value = false;
            }
            Accumulator::Group { has_value } => *has_value = false,
            Accumulator::Stddev(state) | Accumulator::Stdvar(state) => {
                *state = WelfordState::new()
            }
            Accumulator::Quantile { q, values } => {
                *q = param;
                values.clear();
            }
        }
    }

    /// Fold one group member's sample.
    pub fn add(&mut self, sample: f64) {
        match self {
            Accumulator::Sum { sum, has_value } => {
                sum.add(sample);
                *has_value = true;
            }
            Accumulator::Min { value, has_value } => {
                if sample < *value || !*has_value {
                    *value = sample;
                }
                *has_value = true;
            }
            Accumulator::Max { value, has_value } => {
                if sample > *value || !*has_value {
                    *value = sample;
                }
                *has_value = true;
            }
            Accumulator::Avg { sum, count } => {
                sum.add(sample);
                *count += 1;
            }
            Accumulator::Count { count, has_value } => {
                *count += 1;
                *has_value = true;
            }
            Accumulator::Group { has_value } => *has_value = true,
            Accumulator::Stddev(state) | Accumulator::Stdvar(state) => state.add(sample),
            Accumulator::Quantile { values, .. } => values.push(sample),
        }
    }

    /// The group's value and whether it is defined at this step.
    pub fn value(&self) -> (f64, bool) {
        match self {
            Accumulator::Sum { sum, has_value } => (sum.sum(), *has_value),
            Accumulator::Min { value, has_value } | Accumulator::Max { value, has_value } => {
                (*value, *has_value)
            }
            Accumulator::Avg { sum, count } => {
                if *count == 0 {
                    (f64::NAN, false)
                } else {
                    (sum.sum() / *count as f64, true)
                }
            }
            Accumulator::Count { count, has_value } => (*count as f64, *has_value),
            Accumulator::Group { has_value } => (1.0, *has_value),
            Accumulator::Stddev(state) => (state.stddev_population(), state.count > 0),
            Accumulator::Stdvar(state) => (state.variance_population(), state.count > 0),
            Accumulator::Quantile { q, values } => {
                if values.is_empty() {
                    (f64::NAN, false)
                } else {
                    (quantile(*q, values.clone()), true)
                }
            }
        }
    }
}

// phi-quantile with linear interpolation between adjacent ranks, matching the
// reference engine: out-of-range phi maps to the infinities.
fn quantile(q: f64, mut values: Vec<f64>) -> f64 {
    if q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len() as f64;
    let rank = q * (n - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - rank.floor();
    values[lower] * (1.0 - weight) + values[upper.min(values.len() - 1)] * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(op: AggregateOp, samples: &[f64]) -> (f64, bool) {
        let mut acc = Accumulator::new(op).unwrap();
        acc.reset(f64::NAN);
        for &s in samples {
            acc.add(s);
        }
        acc.value()
    }

    #[test]
    fn test_uniform_input_identities() {
        // Over n copies of x: sum = n*x, avg = x, count = n, group = 1.
        let samples = [3.0; 5];
        assert_eq!(fold(AggregateOp::Sum, &samples), (15.0, true));
        assert_eq!(fold(AggregateOp::Avg, &samples), (3.0, true));
        assert_eq!(fold(AggregateOp::Count, &samples), (5.0, true));
        assert_eq!(fold(AggregateOp::Group, &samples), (1.0, true));
    }

    #[test]
    fn test_min_max() {
        let samples = [3.0, -1.0, 7.5, 2.0];
        assert_eq!(fold(AggregateOp::Min, &samples), (-1.0, true));
        assert_eq!(fold(AggregateOp::Max, &samples), (7.5, true));
    }

    #[test]
    fn test_empty_group_is_undefined() {
        for op in [
            AggregateOp::Sum,
            AggregateOp::Min,
            AggregateOp::Max,
            AggregateOp::Avg,
            AggregateOp::Count,
            AggregateOp::Group,
            AggregateOp::Stddev,
            AggregateOp::Stdvar,
        ] {
            let (_, defined) = fold(op, &[]);
            assert!(!defined, "{op} over empty group must be undefined");
        }
    }

    #[test]
    fn test_stddev_population_divisor() {
        // Population stddev of {1, 3}: mean 2, variance ((1)^2+(1)^2)/2 = 1.
        assert_eq!(fold(AggregateOp::Stddev, &[1.0, 3.0]), (1.0, true));
        assert_eq!(fold(AggregateOp::Stdvar, &[1.0, 3.0]), (1.0, true));
    }

    #[test]
    fn test_stddev_constant_input_is_zero() {
        let (v, defined) = fold(AggregateOp::Stddev, &[5.0; 10]);
        assert!(defined);
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut acc = Accumulator::new(AggregateOp::Sum).unwrap();
        acc.reset(f64::NAN);
        acc.add(10.0);
        acc.reset(f64::NAN);
        acc.add(2.0);
        assert_eq!(acc.value(), (2.0, true));
    }

    #[test]
    fn test_quantile_interpolation() {
        let mut acc = Accumulator::new(AggregateOp::Quantile).unwrap();
        acc.reset(0.5);
        for s in [1.0, 2.0, 3.0, 4.0] {
            acc.add(s);
        }
        assert_eq!(acc.value(), (2.5, true));
    }

    #[test]
    fn test_quantile_out_of_range() {
        let mut acc = Accumulator::new(AggregateOp::Quantile).unwrap();
        acc.reset(1.5);
        acc.add(1.0);
        assert_eq!(acc.value().0, f64::INFINITY);
        acc.reset(-0.5);
        acc.add(1.0);
        assert_eq!(acc.value().0, f64::NEG_INFINITY);
    }

    #[test]
    fn test_unsupported_kind_rejected() {
        let err = Accumulator::new(AggregateOp::CountValues).unwrap_err();
        assert!(err.is_fallback_eligible());
    }
}
