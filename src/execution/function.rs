//! Builtin function table and the instant-vector function operator
//!
//! Two function families exist:
//!
//! - [`RangeFunc`]: functions over a range-vector argument (`rate`,
//!   `increase`, the `*_over_time` family). These never run standalone; the
//!   builder fuses them into the matrix-selector and subquery operators,
//!   which apply them per series per step over the window `(t - range, t]`.
//! - Instant transforms (`abs`, `ceil`, trigonometry, ...): implemented by
//!   [`FunctionOperator`], a streaming map over the child's samples.
//!
//! Unknown names surface `NotSupportedExpr` at build time, making the query
//! eligible for fallback.

use crate::error::{EngineError, Result};
use crate::execution::model::{ExecutionContext, StepBatch, VectorOperator};
use crate::execution::numeric::{KahanSum, WelfordState};
use crate::execution::VectorPool;
use crate::types::Labels;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Range functions
// ---------------------------------------------------------------------------

/// A function evaluated over the samples inside a range window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RangeFunc {
    Rate,
    Increase,
    Delta,
    SumOverTime,
    AvgOverTime,
    MinOverTime,
    MaxOverTime,
    CountOverTime,
    StddevOverTime,
    StdvarOverTime,
    LastOverTime,
}

impl RangeFunc {
    /// Look up a range function by its PromQL name.
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "rate" => RangeFunc::Rate,
            "increase" => RangeFunc::Increase,
            "delta" => RangeFunc::Delta,
            "sum_over_time" => RangeFunc::SumOverTime,
            "avg_over_time" => RangeFunc::AvgOverTime,
            "min_over_time" => RangeFunc::MinOverTime,
            "max_over_time" => RangeFunc::MaxOverTime,
            "count_over_time" => RangeFunc::CountOverTime,
            "stddev_over_time" => RangeFunc::StddevOverTime,
            "stdvar_over_time" => RangeFunc::StdvarOverTime,
            "last_over_time" => RangeFunc::LastOverTime,
            _ => return None,
        };
        Some(f)
    }

    /// The function's PromQL name.
    pub fn name(&self) -> &'static str {
        match self {
            RangeFunc::Rate => "rate",
            RangeFunc::Increase => "increase",
            RangeFunc::Delta => "delta",
            RangeFunc::SumOverTime => "sum_over_time",
            RangeFunc::AvgOverTime => "avg_over_time",
            RangeFunc::MinOverTime => "min_over_time",
            RangeFunc::MaxOverTime => "max_over_time",
            RangeFunc::CountOverTime => "count_over_time",
            RangeFunc::StddevOverTime => "stddev_over_time",
            RangeFunc::StdvarOverTime => "stdvar_over_time",
            RangeFunc::LastOverTime => "last_over_time",
        }
    }

    /// Whether the result keeps the metric name of its input.
    pub fn keeps_metric_name(&self) -> bool {
        matches!(self, RangeFunc::LastOverTime)
    }

    /// Evaluate over the samples inside `(range_start, range_end]`.
    ///
    /// `samples` must be in increasing timestamp order. `None` means the
    /// series has no value at this step.
    pub fn apply(&self, samples: &[(i64, f64)], range_start: i64, range_end: i64) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        match self {
            RangeFunc::Rate => extrapolated_rate(samples, true, true, range_start, range_end),
            RangeFunc::Increase => {
                extrapolated_rate(samples, true, false, range_start, range_end)
            }
            RangeFunc::Delta => extrapolated_rate(samples, false, false, range_start, range_end),
            RangeFunc::SumOverTime => {
                let mut sum = KahanSum::new();
                for &(_, v) in samples {
                    sum.add(v);
                }
                Some(sum.sum())
            }
            RangeFunc::AvgOverTime => {
                let mut sum = KahanSum::new();
                for &(_, v) in samples {
                    sum.add(v);
                }
                Some(sum.sum() / samples.len() as f64)
            }
            RangeFunc::MinOverTime => {
                Some(samples.iter().map(|&(_, v)| v).fold(f64::INFINITY, f64::min))
            }
            RangeFunc::MaxOverTime => Some(
                samples
                    .iter()
                    .map(|&(_, v)| v)
                    .fold(f64::NEG_INFINITY, f64::max),
            ),
            RangeFunc::CountOverTime => Some(samples.len() as f64),
            RangeFunc::StddevOverTime => {
                let mut state = WelfordState::new();
                for &(_, v) in samples {
                    state.add(v);
                }
                Some(state.stddev_population())
            }
            RangeFunc::StdvarOverTime => {
                let mut state = WelfordState::new();
                for &(_, v) in samples {
                    state.add(v);
                }
                Some(state.variance_population())
            }
            RangeFunc::LastOverTime => samples.last().map(|&(_, v)| v),
        }
    }
}

// Rate/increase/delta with boundary extrapolation, matching the reference
// engine: the raw difference over the sampled interval is scaled to the full
// window unless the first/last samples sit too far from the window edges.
fn extrapolated_rate(
    samples: &[(i64, f64)],
    is_counter: bool,
    is_rate: bool,
    range_start: i64,
    range_end: i64,
) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let (first_t, first_v) = samples[0];
    let (last_t, _) = samples[samples.len() - 1];

    let mut result = samples[samples.len() - 1].1 - first_v;
    if is_counter {
        let mut prev = first_v;
        for &(_, v) in &samples[1..] {
            if v < prev {
                result += prev;
            }
            prev = v;
        }
    }

    let mut duration_to_start = (first_t - range_start) as f64 / 1000.0;
    let duration_to_end = (range_end - last_t) as f64 / 1000.0;
    let sampled_interval = (last_t - first_t) as f64 / 1000.0;
    let avg_duration_between_samples = sampled_interval / (samples.len() - 1) as f64;

    if is_counter && result > 0.0 && first_v >= 0.0 {
        // Counters cannot be negative: never extrapolate past the point
        // where the counter would have been zero.
        let duration_to_zero = sampled_interval * (first_v / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    let extrapolation_threshold = avg_duration_between_samples * 1.1;
    let mut extrapolate_to_interval = sampled_interval;
    if duration_to_start < extrapolation_threshold {
        extrapolate_to_interval += duration_to_start;
    } else {
        extrapolate_to_interval += avg_duration_between_samples / 2.0;
    }
    if duration_to_end < extrapolation_threshold {
        extrapolate_to_interval += duration_to_end;
    } else {
        extrapolate_to_interval += avg_duration_between_samples / 2.0;
    }
    let mut factor = extrapolate_to_interval / sampled_interval;
    if is_rate {
        factor /= (range_end - range_start) as f64 / 1000.0;
    }
    Some(result * factor)
}

// ---------------------------------------------------------------------------
// Instant transforms
// ---------------------------------------------------------------------------

/// Look up a sample-wise math transform by its PromQL name.
pub fn math_func(name: &str) -> Option<fn(f64) -> f64> {
    let f: fn(f64) -> f64 = match name {
        "abs" => f64::abs,
        "ceil" => f64::ceil,
        "floor" => f64::floor,
        "exp" => f64::exp,
        "ln" => f64::ln,
        "log2" => f64::log2,
        "log10" => f64::log10,
        "sqrt" => f64::sqrt,
        "round" => f64::round,
        "sin" => f64::sin,
        "cos" => f64::cos,
        "tan" => f64::tan,
        "asin" => f64::asin,
        "acos" => f64::acos,
        "atan" => f64::atan,
        "sinh" => f64::sinh,
        "cosh" => f64::cosh,
        "tanh" => f64::tanh,
        "asinh" => f64::asinh,
        "acosh" => f64::acosh,
        "atanh" => f64::atanh,
        "deg" => f64::to_degrees,
        "rad" => f64::to_radians,
        "sgn" => f64::signum,
        _ => return None,
    };
    Some(f)
}

/// Streaming sample-wise transform of an instant vector.
pub struct FunctionOperator {
    pool: Arc<VectorPool>,
    next: Box<dyn VectorOperator>,
    name: String,
    func: fn(f64) -> f64,
    series: Option<Arc<Vec<Labels>>>,
}

impl std::fmt::Debug for FunctionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionOperator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl FunctionOperator {
    /// Build the operator for `name`, failing on unknown functions.
    pub fn new(name: &str, next: Box<dyn VectorOperator>) -> Result<Self> {
        let func = math_func(name).ok_or_else(|| {
            EngineError::NotSupportedExpr(format!("unknown function {name}"))
        })?;
        Ok(Self {
            pool: Arc::new(VectorPool::new()),
            next,
            name: name.to_string(),
            func,
            series: None,
        })
    }
}

impl VectorOperator for FunctionOperator {
    fn series(&mut self, ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        if let Some(series) = &self.series {
            return Ok(Arc::clone(series));
        }
        // Transforms produce derived values, so the metric name is dropped.
        let series: Vec<Labels> = self
            .next
            .series(ctx)?
            .iter()
            .map(|l| l.without_metric_name())
            .collect();
        self.pool.set_step_size(series.len());
        let series = Arc::new(series);
        self.series = Some(Arc::clone(&series));
        Ok(series)
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;
        let Some(input) = self.next.next(ctx)? else {
            return Ok(None);
        };
        let mut out = self.pool.get_vector_batch();
        for vector in &input {
            let mut step = self.pool.get_step_vector(vector.t);
            for (&id, &sample) in vector.sample_ids.iter().zip(&vector.samples) {
                step.push(id, (self.func)(sample));
            }
            out.push(step);
        }
        let pool = self.next.pool();
        pool.put_vectors(input);
        Ok(Some(out))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        (format!("[function] {}", self.name), vec![&*self.next])
    }
}

/// `scalar()`: collapses a one-series vector into a scalar stream.
///
/// Emits exactly one sample per step: the input's value when the step holds
/// exactly one sample, NaN otherwise. The series table is intentionally
/// empty, mirroring the reference engine, where the scalar's sample stream
/// is shaped by the result builder rather than a series entry.
pub struct ScalarFunctionOperator {
    pool: Arc<VectorPool>,
    next: Box<dyn VectorOperator>,
}

impl ScalarFunctionOperator {
    /// Wrap a vector stream in scalar conversion.
    pub fn new(next: Box<dyn VectorOperator>) -> Self {
        Self {
            pool: Arc::new(VectorPool::with_step_size(1)),
            next,
        }
    }
}

impl VectorOperator for ScalarFunctionOperator {
    fn series(&mut self, _ctx: &ExecutionContext) -> Result<Arc<Vec<Labels>>> {
        Ok(Arc::new(vec![]))
    }

    fn next(&mut self, ctx: &ExecutionContext) -> Result<Option<StepBatch>> {
        ctx.check()?;
        let Some(input) = self.next.next(ctx)? else {
            return Ok(None);
        };
        let mut out = self.pool.get_vector_batch();
        for vector in &input {
            let mut step = self.pool.get_step_vector(vector.t);
            let value = if vector.len() == 1 {
                vector.samples[0]
            } else {
                f64::NAN
            };
            step.push(0, value);
            out.push(step);
        }
        let pool = self.next.pool();
        pool.put_vectors(input);
        Ok(Some(out))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<&dyn VectorOperator>) {
        ("[function] scalar".to_string(), vec![&*self.next])
    }
}
