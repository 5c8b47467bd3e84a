use std::collections::HashSet;

use crate::error::EngineError;
use crate::span::{SpanRef, Spanset};

use super::operator::SpansetOp;
use super::PipelineElement;

/// Joins the results of two sub-pipelines evaluated on the same input.
#[derive(Debug, Clone)]
pub struct SpansetOperation {
    pub op: SpansetOp,
    pub lhs: Box<PipelineElement>,
    pub rhs: Box<PipelineElement>,
    buffer: Vec<SpanRef>,
}

impl SpansetOperation {
    pub fn new(op: SpansetOp, lhs: PipelineElement, rhs: PipelineElement) -> SpansetOperation {
        SpansetOperation {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            buffer: Vec::new(),
        }
    }

    pub(crate) fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        let mut output = Vec::new();

        for spanset in input {
            let lhs = self.lhs.evaluate(vec![spanset.clone()])?;
            let rhs = self.rhs.evaluate(vec![spanset.clone()])?;

            match self.op {
                SpansetOp::And => {
                    if !lhs.is_empty() && !rhs.is_empty() {
                        let mut matching = spanset;
                        matching.spans = unique_spans(&lhs, &rhs);
                        output.push(matching);
                    }
                }
                SpansetOp::Union => {
                    if !lhs.is_empty() || !rhs.is_empty() {
                        let mut matching = spanset;
                        matching.spans = unique_spans(&lhs, &rhs);
                        output.push(matching);
                    }
                }
                op => {
                    self.join(op, &lhs, &rhs)?;
                    if !self.buffer.is_empty() {
                        let mut matching = spanset;
                        matching.spans = self.buffer.clone();
                        output.push(matching);
                    }
                }
            }
        }

        Ok(output)
    }

    /// Runs the relationship query for a structural operator, leaving the
    /// matching spans in the buffer.
    fn join(&mut self, op: SpansetOp, lhs: &[Spanset], rhs: &[Spanset]) -> Result<(), EngineError> {
        self.buffer.clear();

        if lhs.len() > 1 || rhs.len() > 1 {
            return Err(EngineError::Execution(
                "spanset operation is not supported for multiple spansets per trace, consider using coalesce()"
                    .to_owned(),
            ));
        }

        let l: &[SpanRef] = lhs.first().map(|s| s.spans.as_slice()).unwrap_or(&[]);
        let r: &[SpanRef] = rhs.first().map(|s| s.spans.as_slice()).unwrap_or(&[]);

        // the relationship is asked of any span, it does not matter which
        let Some(any) = r.first().or_else(|| l.first()).cloned() else {
            return Ok(());
        };

        let buffer = &mut self.buffer;
        match op {
            SpansetOp::Descendant => any.descendant_of(l, r, false, false, false, buffer),
            SpansetOp::NotDescendant => any.descendant_of(l, r, true, false, false, buffer),
            SpansetOp::Ancestor => any.descendant_of(l, r, false, true, false, buffer),
            SpansetOp::NotAncestor => any.descendant_of(l, r, true, true, false, buffer),
            SpansetOp::Child => any.child_of(l, r, false, false, false, buffer),
            SpansetOp::NotChild => any.child_of(l, r, true, false, false, buffer),
            SpansetOp::Parent => any.child_of(l, r, false, true, false, buffer),
            SpansetOp::NotParent => any.child_of(l, r, true, true, false, buffer),
            SpansetOp::Sibling => any.sibling_of(l, r, false, false, buffer),
            SpansetOp::NotSibling => any.sibling_of(l, r, true, false, buffer),
            SpansetOp::UnionDescendant => any.descendant_of(l, r, false, false, true, buffer),
            SpansetOp::UnionAncestor => any.descendant_of(l, r, false, true, true, buffer),
            SpansetOp::UnionChild => any.child_of(l, r, false, false, true, buffer),
            SpansetOp::UnionParent => any.child_of(l, r, false, true, true, buffer),
            SpansetOp::UnionSibling => any.sibling_of(l, r, false, true, buffer),
            SpansetOp::And | SpansetOp::Union => {}
        }

        Ok(())
    }
}

/// All spans of both sides, each once. The smaller side is indexed by span id
/// and the larger side is streamed against it.
fn unique_spans(lhs: &[Spanset], rhs: &[Spanset]) -> Vec<SpanRef> {
    let lhs_count: usize = lhs.iter().map(|s| s.spans.len()).sum();
    let rhs_count: usize = rhs.iter().map(|s| s.spans.len()).sum();

    let (small, large) = if lhs_count <= rhs_count {
        (lhs, rhs)
    } else {
        (rhs, lhs)
    };

    let mut output: Vec<SpanRef> = Vec::with_capacity(lhs_count + rhs_count);
    let mut seen: HashSet<&[u8]> = HashSet::with_capacity(lhs_count.min(rhs_count));

    for span in small.iter().flat_map(|s| &s.spans) {
        if seen.insert(span.id()) {
            output.push(span.clone());
        }
    }

    for span in large.iter().flat_map(|s| &s.spans) {
        if !seen.contains(span.id()) {
            output.push(span.clone());
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::filter::{FieldExpression, Operator, SpansetFilter};
    use crate::storage::transient::{MemoryTrace, NewSpan};

    fn trace() -> Spanset {
        MemoryTrace::new(&[1])
            .with_span(NewSpan::new(&[1], "root").attribute("tier", "edge"))
            .with_span(NewSpan::new(&[2], "a").parent(&[1]).attribute("tier", "app"))
            .with_span(NewSpan::new(&[3], "b").parent(&[1]).attribute("tier", "app"))
            .with_span(NewSpan::new(&[4], "db").parent(&[2]).attribute("tier", "db"))
            .build()
    }

    fn tier(value: &str) -> PipelineElement {
        PipelineElement::Filter(SpansetFilter::new(FieldExpression::binary(
            Operator::Equal,
            FieldExpression::attribute(Attribute::span("tier")),
            FieldExpression::value(value),
        )))
    }

    fn ids(spansets: &[Spanset]) -> Vec<Vec<u8>> {
        spansets
            .iter()
            .map(|s| s.spans.iter().map(|s| s.id()[0]).collect())
            .collect()
    }

    fn run(op: SpansetOp, lhs: &str, rhs: &str) -> Vec<Vec<u8>> {
        let mut operation = SpansetOperation::new(op, tier(lhs), tier(rhs));
        ids(&operation.evaluate(vec![trace()]).unwrap())
    }

    #[test]
    fn and_requires_both_sides() {
        assert_eq!(run(SpansetOp::And, "edge", "db"), vec![vec![1, 4]]);
        assert!(run(SpansetOp::And, "edge", "missing").is_empty());
    }

    #[test]
    fn union_takes_either_side() {
        assert_eq!(run(SpansetOp::Union, "edge", "missing"), vec![vec![1]]);
        assert_eq!(run(SpansetOp::Union, "app", "app"), vec![vec![2, 3]]);
        assert!(run(SpansetOp::Union, "missing", "missing").is_empty());
    }

    #[test]
    fn structural() {
        assert_eq!(run(SpansetOp::Child, "edge", "app"), vec![vec![2, 3]]);
        assert_eq!(run(SpansetOp::Descendant, "edge", "db"), vec![vec![4]]);
        assert_eq!(run(SpansetOp::Parent, "db", "app"), vec![vec![2]]);
        assert_eq!(run(SpansetOp::Ancestor, "db", "edge"), vec![vec![1]]);
        assert_eq!(run(SpansetOp::NotParent, "db", "app"), vec![vec![3]]);
        assert_eq!(run(SpansetOp::Sibling, "app", "app"), vec![vec![2, 3]]);
        assert_eq!(run(SpansetOp::UnionChild, "app", "db"), vec![vec![2, 4]]);
        assert!(run(SpansetOp::Child, "db", "edge").is_empty());
    }

    #[test]
    fn not_descendant_with_empty_lhs_keeps_rhs() {
        assert_eq!(run(SpansetOp::NotDescendant, "missing", "app"), vec![vec![2, 3]]);
    }

    #[test]
    fn structural_requires_single_spansets() {
        let group = PipelineElement::Group(crate::filter::GroupOperation::new(
            FieldExpression::attribute(Attribute::span("tier")),
        ));
        let mut operation = SpansetOperation::new(SpansetOp::Child, group, tier("db"));

        let err = operation.evaluate(vec![trace()]).unwrap_err();
        assert!(err.to_string().contains("coalesce()"));
    }
}
