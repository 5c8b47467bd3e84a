//! Constant folding: sub-expressions that never read from a span are computed
//! once up front instead of once per span.

use crate::attribute::Attribute;
use crate::error::EngineError;
use crate::models::Static;
use crate::span::{Span, SpanRef};

use super::expr::{BinaryOperation, FieldExpression, UnaryOperation};
use super::operator::Operator;

/// Stands in for a span when evaluating expressions that do not reference
/// one.
struct ConstantSpan;

impl Span for ConstantSpan {
    fn attribute_for(&self, _attribute: &Attribute) -> Option<Static> {
        None
    }

    fn all_attributes_func(&self, _f: &mut dyn FnMut(&Attribute, &Static)) {}

    fn id(&self) -> &[u8] {
        &[]
    }

    fn start_time_unix_nanos(&self) -> u64 {
        0
    }

    fn duration_nanos(&self) -> u64 {
        0
    }

    fn sibling_of(&self, _: &[SpanRef], _: &[SpanRef], _: bool, _: bool, buffer: &mut Vec<SpanRef>) {
        buffer.clear();
    }

    fn descendant_of(
        &self,
        _: &[SpanRef],
        _: &[SpanRef],
        _: bool,
        _: bool,
        _: bool,
        buffer: &mut Vec<SpanRef>,
    ) {
        buffer.clear();
    }

    fn child_of(
        &self,
        _: &[SpanRef],
        _: &[SpanRef],
        _: bool,
        _: bool,
        _: bool,
        buffer: &mut Vec<SpanRef>,
    ) {
        buffer.clear();
    }
}

impl FieldExpression {
    /// Replaces every sub-expression that does not reference the span with
    /// its value. Boolean operators with span data on both sides get a branch
    /// optimizer sampling `branch_samples` evaluations.
    pub fn fold(self, branch_samples: usize) -> Result<FieldExpression, EngineError> {
        if !self.references_span() {
            let mut expression = self;
            let value = expression.execute(&ConstantSpan)?;
            return Ok(FieldExpression::Static(value));
        }

        match self {
            FieldExpression::Unary(unary) => {
                let UnaryOperation { op, expression } = *unary;
                Ok(FieldExpression::unary(op, expression.fold(branch_samples)?))
            }
            FieldExpression::Binary(binary) => {
                let (op, lhs, rhs) = binary.into_parts();

                let lhs = lhs.fold(branch_samples)?;
                let rhs = rhs.fold(branch_samples)?;
                let both_dynamic = lhs.references_span() && rhs.references_span();

                let mut folded = BinaryOperation::new(op, lhs, rhs);
                if both_dynamic && matches!(op, Operator::And | Operator::Or) {
                    folded = folded.with_branch_optimizer(branch_samples);
                }

                Ok(FieldExpression::Binary(Box::new(folded)))
            }
            other => Ok(other),
        }
    }
}
