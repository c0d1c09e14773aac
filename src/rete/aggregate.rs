//! Aggregation operators.
//!
//! An aggregator node groups its parent's tuples by signature and emits one
//! `signature + aggregate` row per non-empty group. When a group changes, the
//! old row is revoked and the new one inserted; values are never diffed.

use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Folds the aggregated column of one group into a single value.
///
/// `values` yields one item per stored tuple, repeated by multiplicity.
/// Returning `None` means the group produces no row.
pub trait AggregationOperator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn aggregate(&self, values: &mut dyn Iterator<Item = &Value>) -> Option<Value>;

    /// Row value used for a group with no tuples, if the operator has one
    fn neutral(&self) -> Option<Value> {
        None
    }
}

/// Number of tuples in the group
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl AggregationOperator for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn aggregate(&self, values: &mut dyn Iterator<Item = &Value>) -> Option<Value> {
        Some(Value::Int64(values.count() as i64))
    }

    fn neutral(&self) -> Option<Value> {
        Some(Value::Int64(0))
    }
}

/// Numeric sum; integer unless a float is present, non-numeric values are skipped
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl AggregationOperator for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn aggregate(&self, values: &mut dyn Iterator<Item = &Value>) -> Option<Value> {
        let mut int_sum: i64 = 0;
        let mut float_sum: f64 = 0.0;
        let mut is_float = false;
        for value in values {
            match value {
                Value::Int64(v) => {
                    int_sum = int_sum.wrapping_add(*v);
                    float_sum += *v as f64;
                }
                Value::Float64(v) => {
                    is_float = true;
                    float_sum += v;
                }
                _ => {}
            }
        }
        Some(if is_float {
            Value::Float64(float_sum)
        } else {
            Value::Int64(int_sum)
        })
    }

    fn neutral(&self) -> Option<Value> {
        Some(Value::Int64(0))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl AggregationOperator for Min {
    fn name(&self) -> &str {
        "min"
    }

    fn aggregate(&self, values: &mut dyn Iterator<Item = &Value>) -> Option<Value> {
        values.min().cloned()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl AggregationOperator for Max {
    fn name(&self) -> &str {
        "max"
    }

    fn aggregate(&self, values: &mut dyn Iterator<Item = &Value>) -> Option<Value> {
        values.max().cloned()
    }
}

/// The builtin operators, keyed by name
pub fn builtin_operators() -> Vec<Arc<dyn AggregationOperator>> {
    vec![Arc::new(Count), Arc::new(Sum), Arc::new(Min), Arc::new(Max)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(op: &dyn AggregationOperator, values: &[Value]) -> Option<Value> {
        op.aggregate(&mut values.iter())
    }

    #[test]
    fn test_count() {
        assert_eq!(run(&Count, &[Value::Null, Value::Null]), Some(Value::Int64(2)));
        assert_eq!(Count.neutral(), Some(Value::Int64(0)));
    }

    #[test]
    fn test_sum_promotes_to_float() {
        assert_eq!(
            run(&Sum, &[Value::Int64(2), Value::Int64(3)]),
            Some(Value::Int64(5))
        );
        assert_eq!(
            run(&Sum, &[Value::Int64(2), Value::Float64(0.5)]),
            Some(Value::Float64(2.5))
        );
    }

    #[test]
    fn test_min_max() {
        let values = [Value::Int64(4), Value::Int64(-1), Value::Int64(9)];
        assert_eq!(run(&Min, &values), Some(Value::Int64(-1)));
        assert_eq!(run(&Max, &values), Some(Value::Int64(9)));
        assert_eq!(run(&Max, &[]), None);
        assert_eq!(Max.neutral(), None);
    }
}
