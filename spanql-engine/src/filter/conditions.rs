//! Pushdown: translating the pipeline into conditions for the storage layer.

use crate::attribute::Attribute;
use crate::models::Static;
use crate::storage::{Condition, FetchSpansRequest};

use super::expr::FieldExpression;
use super::operator::Operator;
use super::scalar::{Aggregate, ScalarExpression};
use super::{Pipeline, PipelineElement};

impl FieldExpression {
    /// Adds a condition for every attribute this expression reads. Clears
    /// `all_conditions` whenever the conditions stop describing the
    /// expression exactly.
    pub(crate) fn extract_conditions(&self, request: &mut FetchSpansRequest) {
        match self {
            FieldExpression::Static(_) => {}
            FieldExpression::Attribute(attribute) => {
                request.append_condition(Condition::fetch(attribute.clone()));
            }
            FieldExpression::Unary(unary) => match (unary.op, &unary.expression) {
                (Operator::Exists, FieldExpression::Attribute(attribute)) => {
                    request.append_condition(Condition::new(
                        attribute.clone(),
                        Operator::Exists,
                        Vec::new(),
                    ));
                }
                (Operator::Not, inner) => {
                    // a negated condition cannot be filtered on, only fetched
                    let mut scratch = FetchSpansRequest::default();
                    inner.extract_conditions(&mut scratch);
                    for condition in scratch.conditions {
                        request.append_condition(Condition::fetch(condition.attribute));
                    }
                    request.all_conditions = false;
                }
                (_, inner) => {
                    inner.extract_conditions(request);
                    request.all_conditions = false;
                }
            },
            FieldExpression::Binary(binary) => {
                let op = binary.op;

                if matches!(op, Operator::And | Operator::Or) {
                    binary.lhs.extract_boolean_conditions(request);
                    binary.rhs.extract_boolean_conditions(request);
                    if op == Operator::Or {
                        request.all_conditions = false;
                    }
                    return;
                }

                match (&binary.lhs, &binary.rhs) {
                    (FieldExpression::Attribute(attribute), FieldExpression::Static(value))
                        if op.is_comparison() =>
                    {
                        request.append_condition(Condition::new(
                            attribute.clone(),
                            op,
                            vec![value.clone()],
                        ));
                    }
                    (FieldExpression::Static(value), FieldExpression::Attribute(attribute))
                        if op.is_comparison() =>
                    {
                        match op.flip() {
                            Some(flipped) => request.append_condition(Condition::new(
                                attribute.clone(),
                                flipped,
                                vec![value.clone()],
                            )),
                            None => {
                                request.append_condition(Condition::fetch(attribute.clone()));
                                request.all_conditions = false;
                            }
                        }
                    }
                    (FieldExpression::Static(_), FieldExpression::Static(_)) => {}
                    (lhs, rhs) => {
                        // attribute against attribute, arithmetic and nested
                        // expressions are only fetched
                        lhs.extract_conditions(request);
                        rhs.extract_conditions(request);
                        request.all_conditions = false;
                    }
                }
            }
        }
    }

    /// Same as [`extract_conditions`](Self::extract_conditions) for an
    /// expression used as a boolean. A bare attribute is a test for `true`.
    pub(crate) fn extract_boolean_conditions(&self, request: &mut FetchSpansRequest) {
        match self {
            FieldExpression::Attribute(attribute) => request.append_condition(Condition::new(
                attribute.clone(),
                Operator::Equal,
                vec![Static::Bool(true)],
            )),
            other => other.extract_conditions(request),
        }
    }
}

impl Aggregate {
    fn extract_conditions(&self, request: &mut FetchSpansRequest) {
        if let Some(expression) = &self.expression {
            expression.extract_conditions(request);
        }
    }
}

impl ScalarExpression {
    fn extract_conditions(&self, request: &mut FetchSpansRequest) {
        match self {
            ScalarExpression::Aggregate(aggregate) => aggregate.extract_conditions(request),
            ScalarExpression::Static(_) => {}
            ScalarExpression::Operation(operation) => {
                operation.lhs.extract_conditions(request);
                operation.rhs.extract_conditions(request);
            }
        }
    }
}

impl PipelineElement {
    pub(crate) fn extract_conditions(&self, request: &mut FetchSpansRequest) {
        match self {
            PipelineElement::Filter(filter) => filter.expression.extract_boolean_conditions(request),
            PipelineElement::SpansetOperation(operation) => {
                if let Some(intrinsic) = operation.op.structural_intrinsic() {
                    request.append_condition(Condition::fetch(Attribute::intrinsic(intrinsic)));
                }
                operation.lhs.extract_conditions(request);
                operation.rhs.extract_conditions(request);
                request.all_conditions = false;
            }
            PipelineElement::Group(group) => group.expression.extract_conditions(request),
            PipelineElement::Coalesce(_) => {}
            PipelineElement::Select(select) => {
                for attribute in &select.attributes {
                    request.append_second_pass_condition(Condition::fetch(attribute.clone()));
                }
            }
            PipelineElement::Aggregate(aggregate) => aggregate.extract_conditions(request),
            PipelineElement::ScalarFilter(filter) => {
                filter.lhs.extract_conditions(request);
                filter.rhs.extract_conditions(request);
            }
            PipelineElement::Pipeline(pipeline) => pipeline.extract_conditions(request),
        }
    }
}

impl Pipeline {
    /// Once a select is seen, everything after it is only informational and
    /// goes to the second pass so it cannot restrict the first.
    pub fn extract_conditions(&self, request: &mut FetchSpansRequest) {
        let mut after_select = false;

        for element in &self.elements {
            if after_select {
                let mut scratch = FetchSpansRequest::new(0, 0);
                element.extract_conditions(&mut scratch);
                for condition in scratch.conditions.into_iter().chain(scratch.second_pass_conditions) {
                    request.append_second_pass_condition(condition);
                }
                continue;
            }

            element.extract_conditions(request);
            if matches!(element, PipelineElement::Select(_)) {
                after_select = true;
            }
        }

        if self.elements.len() > 1 {
            request.all_conditions = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Intrinsic;
    use crate::filter::{
        GroupOperation, SelectOperation, SpansetFilter, SpansetOp, SpansetOperation,
    };

    fn eq(attribute: Attribute, value: impl Into<Static>) -> FieldExpression {
        FieldExpression::binary(
            Operator::Equal,
            FieldExpression::attribute(attribute),
            FieldExpression::value(value),
        )
    }

    fn filter(expression: FieldExpression) -> PipelineElement {
        PipelineElement::Filter(SpansetFilter::new(expression))
    }

    fn extract(pipeline: &Pipeline) -> FetchSpansRequest {
        let mut request = FetchSpansRequest::new(0, 0);
        pipeline.extract_conditions(&mut request);
        request
    }

    #[test]
    fn comparisons_become_conditions() {
        let pipeline = Pipeline::new(vec![filter(FieldExpression::binary(
            Operator::And,
            eq(Attribute::span("a"), 1_i64),
            FieldExpression::binary(
                Operator::Less,
                FieldExpression::value(std::time::Duration::from_secs(1)),
                FieldExpression::attribute(Attribute::new("duration")),
            ),
        ))]);

        let request = extract(&pipeline);
        assert!(request.all_conditions);
        assert_eq!(
            request.conditions,
            vec![
                Condition::new(Attribute::span("a"), Operator::Equal, vec![Static::Int(1)]),
                Condition::new(
                    Attribute::intrinsic(Intrinsic::Duration),
                    Operator::Greater,
                    vec![std::time::Duration::from_secs(1).into()]
                ),
            ]
        );
    }

    #[test]
    fn or_clears_all_conditions() {
        let pipeline = Pipeline::new(vec![filter(FieldExpression::binary(
            Operator::Or,
            eq(Attribute::span("a"), 1_i64),
            eq(Attribute::span("b"), 2_i64),
        ))]);

        let request = extract(&pipeline);
        assert!(!request.all_conditions);
        assert_eq!(request.conditions.len(), 2);
    }

    #[test]
    fn attribute_against_attribute_is_fetched() {
        let pipeline = Pipeline::new(vec![filter(FieldExpression::binary(
            Operator::Equal,
            FieldExpression::attribute(Attribute::span("a")),
            FieldExpression::attribute(Attribute::span("b")),
        ))]);

        let request = extract(&pipeline);
        assert!(!request.all_conditions);
        assert!(request.conditions.iter().all(|c| c.op == Operator::None));
        assert_eq!(request.conditions.len(), 2);
    }

    #[test]
    fn negation_is_fetched() {
        let pipeline = Pipeline::new(vec![filter(FieldExpression::unary(
            Operator::Not,
            eq(Attribute::span("a"), 1_i64),
        ))]);

        let request = extract(&pipeline);
        assert!(!request.all_conditions);
        assert_eq!(request.conditions, vec![Condition::fetch(Attribute::span("a"))]);
    }

    #[test]
    fn structural_operators_add_markers() {
        let pipeline = Pipeline::new(vec![PipelineElement::SpansetOperation(
            SpansetOperation::new(
                SpansetOp::Descendant,
                filter(eq(Attribute::span("a"), 1_i64)),
                filter(eq(Attribute::span("b"), 2_i64)),
            ),
        )]);

        let request = extract(&pipeline);
        assert!(!request.all_conditions);
        assert_eq!(
            request.conditions[0],
            Condition::fetch(Attribute::intrinsic(Intrinsic::StructuralDescendant))
        );
        assert_eq!(request.conditions.len(), 3);
    }

    #[test]
    fn select_routes_later_attributes_to_second_pass() {
        let pipeline = Pipeline::new(vec![
            filter(eq(Attribute::span("a"), 1_i64)),
            PipelineElement::Select(SelectOperation::new(vec![Attribute::span("b")])),
            PipelineElement::Group(GroupOperation::new(FieldExpression::attribute(
                Attribute::span("c"),
            ))),
        ]);

        let request = extract(&pipeline);
        assert_eq!(
            request.conditions,
            vec![Condition::new(Attribute::span("a"), Operator::Equal, vec![Static::Int(1)])]
        );
        assert_eq!(
            request.second_pass_conditions,
            vec![
                Condition::fetch(Attribute::span("b")),
                Condition::fetch(Attribute::span("c")),
            ]
        );
        assert!(!request.all_conditions);
    }

    #[test]
    fn bare_attribute_filters_on_true() {
        let pipeline = Pipeline::new(vec![filter(FieldExpression::attribute(Attribute::span(
            "cached",
        )))]);

        let request = extract(&pipeline);
        assert!(request.all_conditions);
        assert_eq!(
            request.conditions,
            vec![Condition::new(
                Attribute::span("cached"),
                Operator::Equal,
                vec![Static::Bool(true)]
            )]
        );
    }
}
