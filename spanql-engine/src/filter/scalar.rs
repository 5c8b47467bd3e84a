use std::fmt::{Display, Error as FmtError, Formatter};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{Static, StaticType};
use crate::span::Spanset;

use super::expr::FieldExpression;
use super::operator::Operator;
use super::value::binary_op;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateOp {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateOp::Count => "count",
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
        }
    }
}

/// Reduces the spans of each spanset to a single scalar, e.g. `avg(duration)`.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub op: AggregateOp,
    /// Absent only for `count()`.
    pub expression: Option<FieldExpression>,
}

impl Aggregate {
    pub fn count() -> Aggregate {
        Aggregate {
            op: AggregateOp::Count,
            expression: None,
        }
    }

    pub fn new(op: AggregateOp, expression: FieldExpression) -> Aggregate {
        Aggregate {
            op,
            expression: Some(expression),
        }
    }

    pub(crate) fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        let name = self.to_string();
        let mut output = Vec::with_capacity(input.len());

        for mut spanset in input {
            let scalar = match (self.op, self.expression.as_mut()) {
                (AggregateOp::Count, _) | (_, None) => Static::Int(spanset.spans.len() as i64),
                (op, Some(expression)) => {
                    let mut acc: Option<Static> = None;
                    let mut count = 0usize;

                    for span in &spanset.spans {
                        let value = expression.execute(span.as_ref())?;
                        if value.is_nil() {
                            continue;
                        }

                        count += 1;
                        acc = Some(match (op, acc) {
                            (_, None) => value,
                            (AggregateOp::Sum | AggregateOp::Avg, Some(acc)) => acc.sum_into(&value),
                            (AggregateOp::Min, Some(acc)) if value.compare(&acc).is_lt() => value,
                            (AggregateOp::Max, Some(acc)) if value.compare(&acc).is_gt() => value,
                            (_, Some(acc)) => acc,
                        });
                    }

                    match (op, acc) {
                        (AggregateOp::Avg, Some(sum)) => sum.divide_by(count as f64),
                        (_, acc) => acc.unwrap_or_default(),
                    }
                }
            };

            spanset.add_attribute(name.clone(), scalar.clone());
            spanset.scalar = scalar;
            output.push(spanset);
        }

        Ok(output)
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        let Some(expression) = &self.expression else {
            return match self.op {
                AggregateOp::Count => Ok(()),
                op => Err(EngineError::Validation(format!(
                    "{}() requires an expression",
                    op.as_str()
                ))),
            };
        };

        expression.validate()?;

        let t = expression.implied_type();
        if self.op != AggregateOp::Count && !(t.is_numeric() || t == StaticType::Attribute) {
            return Err(EngineError::Validation(format!(
                "aggregate field expressions must resolve to a number type: {self}"
            )));
        }

        Ok(())
    }
}

impl Display for Aggregate {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match &self.expression {
            Some(expression) => write!(f, "{}({expression})", self.op.as_str()),
            None => write!(f, "{}()", self.op.as_str()),
        }
    }
}

/// The sides of a scalar filter.
#[derive(Debug, Clone)]
pub enum ScalarExpression {
    Aggregate(Aggregate),
    Static(Static),
    Operation(Box<ScalarOperation>),
}

#[derive(Debug, Clone)]
pub struct ScalarOperation {
    pub op: Operator,
    pub lhs: ScalarExpression,
    pub rhs: ScalarExpression,
}

impl Display for ScalarExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            ScalarExpression::Aggregate(aggregate) => write!(f, "{aggregate}"),
            ScalarExpression::Static(value) => write!(f, "{value}"),
            ScalarExpression::Operation(operation) => {
                write!(f, "({} {} {})", operation.lhs, operation.op, operation.rhs)
            }
        }
    }
}

/// Keeps spansets whose aggregate satisfies a comparison, e.g.
/// `count() > 3`. Only an aggregate on the left and a literal on the right
/// are supported.
#[derive(Debug, Clone)]
pub struct ScalarFilter {
    pub op: Operator,
    pub lhs: ScalarExpression,
    pub rhs: ScalarExpression,
    regex: Option<Regex>,
}

impl ScalarFilter {
    pub fn new(op: Operator, lhs: ScalarExpression, rhs: ScalarExpression) -> ScalarFilter {
        ScalarFilter {
            op,
            lhs,
            rhs,
            regex: None,
        }
    }

    pub(crate) fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        let (aggregate, rhs) = match (&mut self.lhs, &self.rhs) {
            (ScalarExpression::Aggregate(aggregate), ScalarExpression::Static(rhs)) => {
                (aggregate, rhs)
            }
            _ => {
                return Err(EngineError::Execution(format!(
                    "scalar filter of the form {self} is not supported"
                )))
            }
        };

        let mut output = Vec::new();
        for spanset in aggregate.evaluate(input)? {
            let result = binary_op(self.op, &spanset.scalar, rhs, &mut self.regex)?;
            if result.as_bool() == Some(true) {
                output.push(spanset);
            }
        }

        Ok(output)
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        let (ScalarExpression::Aggregate(aggregate), ScalarExpression::Static(rhs)) =
            (&self.lhs, &self.rhs)
        else {
            return Err(EngineError::Validation(format!(
                "scalar filter of the form {} {} {} is not supported, only aggregate op literal",
                self.lhs, self.op, self.rhs
            )));
        };

        aggregate.validate()?;

        if !self.op.is_comparison() {
            return Err(EngineError::Validation(format!(
                "scalar filters must use a comparison operator, found {}",
                self.op
            )));
        }

        let lhs = match aggregate.op {
            AggregateOp::Count => StaticType::Int,
            _ => StaticType::Attribute,
        };
        if !self.op.binary_types_valid(lhs, rhs.static_type()) {
            return Err(EngineError::Validation(format!(
                "illegal operation for the given types: {} {} {}",
                self.lhs, self.op, self.rhs
            )));
        }

        Ok(())
    }
}

impl Display for ScalarFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{} {} {}", self.lhs, self.op, self.rhs)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::attribute::Attribute;
    use crate::storage::transient::{MemoryTrace, NewSpan};

    fn trace() -> Spanset {
        MemoryTrace::new(&[1])
            .with_span(NewSpan::new(&[1], "a").duration(Duration::from_millis(10)))
            .with_span(NewSpan::new(&[2], "b").duration(Duration::from_millis(20)))
            .with_span(NewSpan::new(&[3], "c").duration(Duration::from_millis(60)).attribute("size", 3_i64))
            .build()
    }

    fn duration() -> FieldExpression {
        FieldExpression::attribute(Attribute::new("duration"))
    }

    fn scalar(op: AggregateOp, expression: FieldExpression) -> Static {
        let mut aggregate = Aggregate::new(op, expression);
        let output = aggregate.evaluate(vec![trace()]).unwrap();
        output[0].scalar.clone()
    }

    #[test]
    fn aggregates() {
        let mut count = Aggregate::count();
        let output = count.evaluate(vec![trace()]).unwrap();
        assert!(output[0].scalar.strict_equals(&Static::Int(3)));
        assert!(output[0].attribute("count()").is_some());

        let ms = |v| Static::Duration(Duration::from_millis(v));
        assert!(scalar(AggregateOp::Sum, duration()).strict_equals(&ms(90)));
        assert!(scalar(AggregateOp::Avg, duration()).strict_equals(&ms(30)));
        assert!(scalar(AggregateOp::Min, duration()).strict_equals(&ms(10)));
        assert!(scalar(AggregateOp::Max, duration()).strict_equals(&ms(60)));
    }

    #[test]
    fn aggregates_skip_missing_values() {
        let size = FieldExpression::attribute(Attribute::span("size"));
        assert!(scalar(AggregateOp::Avg, size.clone()).strict_equals(&Static::Float(3.0)));
        assert!(scalar(AggregateOp::Sum, size).strict_equals(&Static::Int(3)));

        let missing = FieldExpression::attribute(Attribute::span("missing"));
        assert!(scalar(AggregateOp::Max, missing).is_nil());
    }

    #[test]
    fn scalar_filter() {
        let mut filter = ScalarFilter::new(
            Operator::Greater,
            ScalarExpression::Aggregate(Aggregate::new(AggregateOp::Avg, duration())),
            ScalarExpression::Static(Duration::from_millis(25).into()),
        );
        assert!(filter.validate().is_ok());
        assert_eq!(filter.evaluate(vec![trace()]).unwrap().len(), 1);

        let mut filter = ScalarFilter::new(
            Operator::Greater,
            ScalarExpression::Aggregate(Aggregate::count()),
            ScalarExpression::Static(Static::Int(3)),
        );
        assert!(filter.evaluate(vec![trace()]).unwrap().is_empty());
    }

    #[test]
    fn unsupported_scalar_filter_shapes() {
        let mut filter = ScalarFilter::new(
            Operator::Greater,
            ScalarExpression::Static(Static::Int(3)),
            ScalarExpression::Aggregate(Aggregate::count()),
        );

        assert!(matches!(filter.validate(), Err(EngineError::Validation(_))));
        assert!(matches!(
            filter.evaluate(vec![trace()]),
            Err(EngineError::Execution(_))
        ));
    }
}
