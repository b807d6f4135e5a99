// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Combine functions for partial aggregate results.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

use crate::chunk::Value;
use crate::error::{LatticeError, Result};

/// Combines two partial states of an aggregate into one.
///
/// `Null` is the identity of every aggregate.
pub trait Aggregate: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn combine(&self, current: &Value, incoming: &Value) -> Result<Value>;
}

fn type_mismatch(name: &str, a: &Value, b: &Value) -> LatticeError {
    LatticeError::Internal(format!(
        "aggregate {name} cannot combine {a:?} with {b:?}"
    ))
}

fn add(name: &str, current: &Value, incoming: &Value) -> Result<Value> {
    match (current, incoming) {
        (Value::Null, v) | (v, Value::Null) => Ok(v.clone()),
        (Value::Int64(a), Value::Int64(b)) => Ok(Value::Int64(a.wrapping_add(*b))),
        (Value::Float64(a), Value::Float64(b)) => Ok(Value::Float64(a + b)),
        (Value::Int64(a), Value::Float64(b)) | (Value::Float64(b), Value::Int64(a)) => {
            Ok(Value::Float64(*a as f64 + b))
        }
        (a, b) => Err(type_mismatch(name, a, b)),
    }
}

fn compare(name: &str, a: &Value, b: &Value) -> Result<Ordering> {
    let ord = match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::Float64(x), Value::Float64(y)) => x.total_cmp(y),
        (Value::Int64(x), Value::Float64(y)) => (*x as f64).total_cmp(y),
        (Value::Float64(x), Value::Int64(y)) => x.total_cmp(&(*y as f64)),
        (Value::Utf8(x), Value::Utf8(y)) => x.cmp(y),
        _ => return Err(type_mismatch(name, a, b)),
    };
    Ok(ord)
}

#[derive(Debug, Default)]
pub struct Sum;

impl Aggregate for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn combine(&self, current: &Value, incoming: &Value) -> Result<Value> {
        add(self.name(), current, incoming)
    }
}

/// Partial counts are added, so only integers are accepted.
#[derive(Debug, Default)]
pub struct Count;

impl Aggregate for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn combine(&self, current: &Value, incoming: &Value) -> Result<Value> {
        match (current, incoming) {
            (Value::Null | Value::Int64(_), Value::Null | Value::Int64(_)) => {
                add(self.name(), current, incoming)
            }
            (a, b) => Err(type_mismatch(self.name(), a, b)),
        }
    }
}

#[derive(Debug, Default)]
pub struct Min;

impl Aggregate for Min {
    fn name(&self) -> &str {
        "min"
    }

    fn combine(&self, current: &Value, incoming: &Value) -> Result<Value> {
        match (current, incoming) {
            (Value::Null, v) | (v, Value::Null) => Ok(v.clone()),
            (a, b) => match compare(self.name(), a, b)? {
                Ordering::Greater => Ok(b.clone()),
                _ => Ok(a.clone()),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct Max;

impl Aggregate for Max {
    fn name(&self) -> &str {
        "max"
    }

    fn combine(&self, current: &Value, incoming: &Value) -> Result<Value> {
        match (current, incoming) {
            (Value::Null, v) | (v, Value::Null) => Ok(v.clone()),
            (a, b) => match compare(self.name(), a, b)? {
                Ordering::Less => Ok(b.clone()),
                _ => Ok(a.clone()),
            },
        }
    }
}

/// Look up a built-in aggregate by its lowercase name.
pub fn aggregate_by_name(name: &str) -> Result<Arc<dyn Aggregate>> {
    match name.to_ascii_lowercase().as_str() {
        "sum" => Ok(Arc::new(Sum)),
        "count" => Ok(Arc::new(Count)),
        "min" => Ok(Arc::new(Min)),
        "max" => Ok(Arc::new(Max)),
        other => Err(LatticeError::NotImplemented(format!(
            "aggregate '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_and_count() -> Result<()> {
        assert_eq!(Sum.combine(&Value::Int64(2), &Value::Int64(3))?, Value::Int64(5));
        assert_eq!(
            Sum.combine(&Value::Int64(2), &Value::Float64(0.5))?,
            Value::Float64(2.5)
        );
        assert_eq!(Sum.combine(&Value::Null, &Value::Int64(7))?, Value::Int64(7));
        assert!(Sum.combine(&Value::Utf8("a".into()), &Value::Int64(1)).is_err());
        assert_eq!(Count.combine(&Value::Int64(4), &Value::Int64(1))?, Value::Int64(5));
        assert!(Count.combine(&Value::Float64(1.0), &Value::Int64(1)).is_err());
        Ok(())
    }

    #[test]
    fn test_min_max() -> Result<()> {
        assert_eq!(Min.combine(&Value::Int64(2), &Value::Int64(-3))?, Value::Int64(-3));
        assert_eq!(Max.combine(&Value::Int64(2), &Value::Int64(-3))?, Value::Int64(2));
        assert_eq!(
            Max.combine(&Value::Utf8("b".into()), &Value::Utf8("a".into()))?,
            Value::Utf8("b".into())
        );
        assert_eq!(Min.combine(&Value::Float64(1.5), &Value::Null)?, Value::Float64(1.5));
        Ok(())
    }

    #[test]
    fn test_lookup() {
        assert_eq!(aggregate_by_name("SUM").map(|a| a.name().to_string()).ok(), Some("sum".to_string()));
        assert!(aggregate_by_name("median").is_err());
    }
}
