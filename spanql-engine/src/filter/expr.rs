use std::fmt::{Display, Error as FmtError, Formatter};
use std::mem;

use regex::Regex;

use crate::attribute::Attribute;
use crate::error::EngineError;
use crate::models::{Static, StaticType};
use crate::span::Span;

use super::branch::{Branch, BranchOptimizer};
use super::operator::Operator;
use super::value::{binary_op, negate};

/// An expression evaluated once per span.
#[derive(Debug, Clone)]
pub enum FieldExpression {
    Static(Static),
    Attribute(Attribute),
    Unary(Box<UnaryOperation>),
    Binary(Box<BinaryOperation>),
}

impl Default for FieldExpression {
    fn default() -> FieldExpression {
        FieldExpression::Static(Static::Nil)
    }
}

#[derive(Debug, Clone)]
pub struct UnaryOperation {
    pub op: Operator,
    pub expression: FieldExpression,
}

#[derive(Debug, Clone)]
pub struct BinaryOperation {
    pub op: Operator,
    pub lhs: FieldExpression,
    pub rhs: FieldExpression,
    regex: Option<Regex>,
    optimizer: Option<BranchOptimizer>,
}

impl FieldExpression {
    pub fn unary(op: Operator, expression: FieldExpression) -> FieldExpression {
        FieldExpression::Unary(Box::new(UnaryOperation { op, expression }))
    }

    pub fn binary(op: Operator, lhs: FieldExpression, rhs: FieldExpression) -> FieldExpression {
        FieldExpression::Binary(Box::new(BinaryOperation::new(op, lhs, rhs)))
    }

    pub fn attribute(attribute: Attribute) -> FieldExpression {
        FieldExpression::Attribute(attribute)
    }

    pub fn value(value: impl Into<Static>) -> FieldExpression {
        FieldExpression::Static(value.into())
    }

    pub fn execute(&mut self, span: &dyn Span) -> Result<Static, EngineError> {
        match self {
            FieldExpression::Static(value) => Ok(value.clone()),
            FieldExpression::Attribute(attribute) => {
                Ok(span.attribute_for(attribute).unwrap_or_default())
            }
            FieldExpression::Unary(unary) => unary.execute(span),
            FieldExpression::Binary(binary) => binary.execute(span),
        }
    }

    /// Whether evaluating this expression reads anything from the span.
    pub fn references_span(&self) -> bool {
        match self {
            FieldExpression::Static(_) => false,
            FieldExpression::Attribute(_) => true,
            FieldExpression::Unary(unary) => unary.expression.references_span(),
            FieldExpression::Binary(binary) => {
                binary.lhs.references_span() || binary.rhs.references_span()
            }
        }
    }

    pub fn implied_type(&self) -> StaticType {
        match self {
            FieldExpression::Static(value) => value.static_type(),
            FieldExpression::Attribute(attribute) => attribute.implied_type(),
            FieldExpression::Unary(unary) => match unary.op {
                Operator::Sub => unary.expression.implied_type(),
                _ => StaticType::Boolean,
            },
            FieldExpression::Binary(binary) => binary.implied_type(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            FieldExpression::Static(_) | FieldExpression::Attribute(_) => Ok(()),
            FieldExpression::Unary(unary) => {
                unary.expression.validate()?;

                let t = unary.expression.implied_type();
                if !unary.op.unary_type_valid(t) {
                    return Err(EngineError::Validation(format!(
                        "illegal operation for the given type: {self}"
                    )));
                }

                Ok(())
            }
            FieldExpression::Binary(binary) => binary.validate(),
        }
    }

    pub(crate) fn as_static(&self) -> Option<&Static> {
        match self {
            FieldExpression::Static(value) => Some(value),
            _ => None,
        }
    }
}

impl UnaryOperation {
    fn execute(&mut self, span: &dyn Span) -> Result<Static, EngineError> {
        let value = self.expression.execute(span)?;

        let result = match self.op {
            Operator::Not => match value.as_bool() {
                Some(b) => Static::Bool(!b),
                None => Static::Nil,
            },
            Operator::Sub => negate(&value),
            Operator::Exists => Static::Bool(!value.is_nil()),
            _ => Static::Nil,
        };

        Ok(result)
    }
}

/// Whether the left side of `&&` or `||` alone settles the result.
fn decides(is_and: bool, lhs: &Static) -> bool {
    let lhs_true = lhs.as_bool() == Some(true);
    if is_and {
        !lhs_true
    } else {
        lhs_true
    }
}

impl BinaryOperation {
    pub fn new(op: Operator, lhs: FieldExpression, rhs: FieldExpression) -> BinaryOperation {
        BinaryOperation {
            op,
            lhs,
            rhs,
            regex: None,
            optimizer: None,
        }
    }

    /// Samples the cost of each side for `samples` evaluations before
    /// settling the order. Only meaningful for `&&` and `||`.
    pub(crate) fn with_branch_optimizer(mut self, samples: usize) -> BinaryOperation {
        if samples > 0 && matches!(self.op, Operator::And | Operator::Or) {
            self.optimizer = Some(BranchOptimizer::new(samples));
        }
        self
    }

    fn execute(&mut self, span: &dyn Span) -> Result<Static, EngineError> {
        if matches!(self.op, Operator::And | Operator::Or) {
            return self.execute_boolean(span);
        }

        let lhs = self.lhs.execute(span)?;
        let rhs = self.rhs.execute(span)?;

        binary_op(self.op, &lhs, &rhs, &mut self.regex)
    }

    fn execute_boolean(&mut self, span: &dyn Span) -> Result<Static, EngineError> {
        let is_and = self.op == Operator::And;

        if let Some(optimizer) = self.optimizer.as_mut().filter(|o| o.recording()) {
            // both sides are evaluated while sampling so each gets timed
            optimizer.start();
            let lhs = self.lhs.execute(span)?;
            optimizer.finish(Branch::Left);

            optimizer.start();
            let rhs = self.rhs.execute(span);
            let done = optimizer.finish(Branch::Right);

            if done {
                if optimizer.optimal_branch() == Branch::Right {
                    mem::swap(&mut self.lhs, &mut self.rhs);
                }
                self.optimizer = None;
            }

            // the right side only ran for timing, its errors must not leak
            // when the left side already decides
            if decides(is_and, &lhs) {
                return Ok(Static::Bool(!is_and));
            }

            return Ok(combine_boolean(is_and, &lhs, &rhs?));
        }

        let lhs = self.lhs.execute(span)?;
        if decides(is_and, &lhs) {
            return Ok(Static::Bool(!is_and));
        }

        let rhs = self.rhs.execute(span)?;
        Ok(combine_boolean(is_and, &lhs, &rhs))
    }

    fn implied_type(&self) -> StaticType {
        if self.op.is_boolean() {
            return StaticType::Boolean;
        }

        let lhs = self.lhs.implied_type();
        let rhs = self.rhs.implied_type();

        if self.op == Operator::Div && lhs == StaticType::Int && rhs == StaticType::Int {
            return StaticType::Float;
        }

        if lhs == StaticType::Attribute {
            rhs
        } else {
            lhs
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        self.lhs.validate()?;
        self.rhs.validate()?;

        let lhs = self.lhs.implied_type();
        let rhs = self.rhs.implied_type();

        if !lhs.is_matching_operand(rhs) {
            return Err(EngineError::Validation(format!(
                "binary operands do not match types: {lhs} and {rhs} in {}",
                DisplayBinary(self)
            )));
        }

        if !self.op.binary_types_valid(lhs, rhs) {
            return Err(EngineError::Validation(format!(
                "illegal operation for the given types: {}",
                DisplayBinary(self)
            )));
        }

        if matches!(self.op, Operator::Regex | Operator::NotRegex) {
            if let Some(Static::String(pattern)) = self.rhs.as_static() {
                Regex::new(pattern).map_err(|err| {
                    EngineError::Validation(format!("invalid regex {pattern:?}: {err}"))
                })?;
            }
        }

        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Operator, FieldExpression, FieldExpression) {
        (self.op, self.lhs, self.rhs)
    }

    pub(crate) fn has_branch_optimizer(&self) -> bool {
        self.optimizer.is_some()
    }
}

fn combine_boolean(is_and: bool, lhs: &Static, rhs: &Static) -> Static {
    let l = lhs.as_bool() == Some(true);
    let r = rhs.as_bool() == Some(true);

    if is_and {
        Static::Bool(l && r)
    } else {
        Static::Bool(l || r)
    }
}

struct DisplayBinary<'a>(&'a BinaryOperation);

impl Display for DisplayBinary<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write_operand(f, &self.0.lhs)?;
        write!(f, " {} ", self.0.op)?;
        write_operand(f, &self.0.rhs)
    }
}

fn write_operand(f: &mut Formatter<'_>, expression: &FieldExpression) -> Result<(), FmtError> {
    match expression {
        FieldExpression::Binary(_) => write!(f, "({expression})"),
        _ => write!(f, "{expression}"),
    }
}

impl Display for FieldExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            FieldExpression::Static(value) => write!(f, "{value}"),
            FieldExpression::Attribute(attribute) => write!(f, "{attribute}"),
            FieldExpression::Unary(unary) => match unary.op {
                Operator::Exists => {
                    write_operand(f, &unary.expression)?;
                    f.write_str(" != nil")
                }
                op => {
                    write!(f, "{op}")?;
                    write_operand(f, &unary.expression)
                }
            },
            FieldExpression::Binary(binary) => write!(f, "{}", DisplayBinary(binary)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::Status;
    use crate::span::SpanRef;
    use crate::storage::transient::{MemoryTrace, NewSpan};

    fn span() -> SpanRef {
        let spanset = MemoryTrace::new(&[1])
            .with_span(
                NewSpan::new(&[1], "GET /users")
                    .duration(Duration::from_millis(150))
                    .status(Status::Error)
                    .attribute("http.status_code", 500_i64)
                    .attribute("tags", Static::StringArray(vec!["a".to_owned(), "b".to_owned()]))
                    .attribute("pattern", "(")
                    .resource_attribute("service.name", "api"),
            )
            .build();

        spanset.spans[0].clone()
    }

    fn attr(name: &str) -> FieldExpression {
        FieldExpression::attribute(Attribute::new(name))
    }

    fn span_attr(name: &str) -> FieldExpression {
        FieldExpression::attribute(Attribute::span(name))
    }

    #[test]
    fn attribute_lookup() {
        let span = span();

        let mut expr = FieldExpression::binary(
            Operator::GreaterEqual,
            span_attr("http.status_code"),
            FieldExpression::value(500_i64),
        );
        assert!(expr.execute(span.as_ref()).unwrap().as_bool().unwrap());

        // unscoped attributes fall back to the resource
        let mut expr = FieldExpression::binary(
            Operator::Equal,
            attr("service.name"),
            FieldExpression::value("api"),
        );
        assert!(expr.execute(span.as_ref()).unwrap().as_bool().unwrap());

        let mut expr = attr("missing");
        assert!(expr.execute(span.as_ref()).unwrap().is_nil());
    }

    #[test]
    fn intrinsics() {
        let span = span();

        let mut expr = FieldExpression::binary(
            Operator::Greater,
            attr("duration"),
            FieldExpression::value(Duration::from_millis(100)),
        );
        assert!(expr.execute(span.as_ref()).unwrap().as_bool().unwrap());

        let mut expr = FieldExpression::binary(
            Operator::Equal,
            attr("status"),
            FieldExpression::value(Status::Error),
        );
        assert!(expr.execute(span.as_ref()).unwrap().as_bool().unwrap());
    }

    #[test]
    fn short_circuit_skips_the_right_side() {
        let span = span();

        // the pattern is only known at execution time and does not compile
        let mut failing =
            FieldExpression::binary(Operator::Regex, attr("name"), span_attr("pattern"));
        assert!(matches!(
            failing.execute(span.as_ref()),
            Err(EngineError::Execution(_))
        ));

        let mut expr = FieldExpression::binary(
            Operator::And,
            FieldExpression::value(false),
            failing.clone(),
        );
        assert_eq!(expr.execute(span.as_ref()).unwrap().as_bool(), Some(false));

        let mut expr = FieldExpression::binary(Operator::Or, FieldExpression::value(true), failing);
        assert_eq!(expr.execute(span.as_ref()).unwrap().as_bool(), Some(true));
    }

    #[test]
    fn branch_optimizer_keeps_results() {
        let span = span();

        let lhs = FieldExpression::binary(
            Operator::Regex,
            attr("name"),
            FieldExpression::value("^GET .*$"),
        );
        let rhs = FieldExpression::binary(
            Operator::Equal,
            span_attr("http.status_code"),
            FieldExpression::value(500_i64),
        );

        let binary = BinaryOperation::new(Operator::And, lhs, rhs).with_branch_optimizer(3);
        let mut expr = FieldExpression::Binary(Box::new(binary));

        for _ in 0..10 {
            assert_eq!(expr.execute(span.as_ref()).unwrap().as_bool(), Some(true));
        }

        let FieldExpression::Binary(binary) = &expr else {
            panic!("expected binary");
        };
        assert!(!binary.has_branch_optimizer());
    }

    #[test]
    fn branch_optimizer_ignores_errors_of_an_undecided_side() {
        let span = span();
        let failing = || FieldExpression::binary(Operator::Regex, attr("name"), span_attr("pattern"));

        for (op, lhs, expected) in [(Operator::And, false, false), (Operator::Or, true, true)] {
            let binary = BinaryOperation::new(op, FieldExpression::value(lhs), failing())
                .with_branch_optimizer(1000);
            let mut sampled = FieldExpression::Binary(Box::new(binary));
            let mut plain = FieldExpression::binary(op, FieldExpression::value(lhs), failing());

            for _ in 0..5 {
                assert_eq!(sampled.execute(span.as_ref()).unwrap().as_bool(), Some(expected));
                assert_eq!(plain.execute(span.as_ref()).unwrap().as_bool(), Some(expected));
            }
        }

        // an undecided left side still surfaces the error
        let binary = BinaryOperation::new(Operator::And, FieldExpression::value(true), failing())
            .with_branch_optimizer(1000);
        let mut expr = FieldExpression::Binary(Box::new(binary));
        assert!(matches!(expr.execute(span.as_ref()), Err(EngineError::Execution(_))));
    }

    #[test]
    fn unary_operations() {
        let span = span();

        let mut expr = FieldExpression::unary(Operator::Exists, span_attr("http.status_code"));
        assert_eq!(expr.execute(span.as_ref()).unwrap().as_bool(), Some(true));

        let mut expr = FieldExpression::unary(Operator::Exists, span_attr("missing"));
        assert_eq!(expr.execute(span.as_ref()).unwrap().as_bool(), Some(false));

        let mut expr = FieldExpression::unary(Operator::Not, FieldExpression::value(false));
        assert_eq!(expr.execute(span.as_ref()).unwrap().as_bool(), Some(true));

        let mut expr = FieldExpression::unary(Operator::Sub, span_attr("http.status_code"));
        assert!(expr.execute(span.as_ref()).unwrap().strict_equals(&Static::Int(-500)));
    }

    #[test]
    fn array_membership_on_attributes() {
        let span = span();

        let mut expr =
            FieldExpression::binary(Operator::Equal, span_attr("tags"), FieldExpression::value("b"));
        assert_eq!(expr.execute(span.as_ref()).unwrap().as_bool(), Some(true));
    }

    #[test]
    fn validation() {
        let expr = FieldExpression::binary(
            Operator::Add,
            FieldExpression::value("a"),
            FieldExpression::value(1_i64),
        );
        assert!(matches!(expr.validate(), Err(EngineError::Validation(_))));

        let expr = FieldExpression::binary(
            Operator::Regex,
            attr("name"),
            FieldExpression::value("(unclosed"),
        );
        assert!(matches!(expr.validate(), Err(EngineError::Validation(_))));

        let expr = FieldExpression::binary(
            Operator::Greater,
            attr("duration"),
            FieldExpression::value(Duration::from_secs(1)),
        );
        assert!(expr.validate().is_ok());

        let expr = FieldExpression::binary(
            Operator::Equal,
            attr("status"),
            FieldExpression::value("error"),
        );
        assert!(matches!(expr.validate(), Err(EngineError::Validation(_))));

        let expr = FieldExpression::unary(Operator::Not, FieldExpression::value(1_i64));
        assert!(matches!(expr.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn display() {
        let expr = FieldExpression::binary(
            Operator::And,
            FieldExpression::binary(
                Operator::Equal,
                span_attr("foo"),
                FieldExpression::value("bar"),
            ),
            FieldExpression::unary(Operator::Exists, attr("baz")),
        );

        assert_eq!(expr.to_string(), "(span.foo = \"bar\") && .baz != nil");
    }
}
