//! The query AST and its evaluation.
//!
//! A query arrives as a [`RootExpr`]: a [`Pipeline`] of spanset stages,
//! optionally followed by a metrics stage and a second metrics stage. Each
//! pipeline element takes the spansets of the previous element and returns
//! new ones; evaluation stops as soon as nothing is left.
//!
//! Before evaluation the tree is validated, constant subtrees are folded
//! (see [`FieldExpression::fold`]) and the pipeline is walked once to build
//! the conditions pushed down to storage.

use std::fmt::{Display, Error as FmtError, Formatter};
use std::mem;

use crate::error::EngineError;
use crate::hints::Hints;
use crate::metrics::{FirstStageElement, SecondStageElement};
use crate::models::{Static, StaticType};
use crate::span::{Span, SpanRef, Spanset};
use crate::storage::FetchSpansRequest;

mod branch;
mod conditions;
mod expr;
mod fold;
mod group;
mod operator;
mod scalar;
mod spanset_ops;
pub(crate) mod value;

pub use expr::{BinaryOperation, FieldExpression, UnaryOperation};
pub use group::{CoalesceOperation, GroupOperation, SelectOperation};
pub use operator::{Operator, SpansetOp};
pub use scalar::{Aggregate, AggregateOp, ScalarExpression, ScalarFilter, ScalarOperation};
pub use spanset_ops::SpansetOperation;

/// Keeps the spans for which the expression is `true`.
#[derive(Debug, Clone)]
pub struct SpansetFilter {
    pub expression: FieldExpression,
    matching: Vec<SpanRef>,
}

impl SpansetFilter {
    pub fn new(expression: FieldExpression) -> SpansetFilter {
        SpansetFilter {
            expression,
            matching: Vec::new(),
        }
    }

    pub(crate) fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        let mut output = Vec::with_capacity(input.len());

        for mut spanset in input {
            if spanset.spans.is_empty() {
                continue;
            }

            self.matching.clear();
            for span in &spanset.spans {
                if self.matches(span.as_ref())? {
                    self.matching.push(span.clone());
                }
            }

            if self.matching.is_empty() {
                continue;
            }

            if self.matching.len() != spanset.spans.len() {
                // the replaced span list becomes the next scratch buffer
                mem::swap(&mut spanset.spans, &mut self.matching);
            }

            output.push(spanset);
        }

        Ok(output)
    }

    /// Whether the span satisfies the filter. Anything but a boolean `true`
    /// is a miss.
    pub(crate) fn matches(&mut self, span: &dyn Span) -> Result<bool, EngineError> {
        let result = self.expression.execute(span)?;
        Ok(result.as_bool() == Some(true))
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        self.expression.validate()?;

        match self.expression.implied_type() {
            StaticType::Boolean | StaticType::Attribute => Ok(()),
            _ => Err(EngineError::Validation(format!(
                "filter expression must evaluate to a boolean: {}",
                self.expression
            ))),
        }
    }

    pub(crate) fn fold(self, branch_samples: usize) -> Result<SpansetFilter, EngineError> {
        Ok(SpansetFilter::new(self.expression.fold(branch_samples)?))
    }

    fn is_static_false(&self) -> bool {
        matches!(self.expression.as_static(), Some(Static::Bool(false)))
    }
}

impl Display for SpansetFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{{ {} }}", self.expression)
    }
}

#[derive(Debug, Clone)]
pub enum PipelineElement {
    Filter(SpansetFilter),
    SpansetOperation(SpansetOperation),
    Group(GroupOperation),
    Coalesce(CoalesceOperation),
    Select(SelectOperation),
    Aggregate(Aggregate),
    ScalarFilter(ScalarFilter),
    Pipeline(Pipeline),
}

impl PipelineElement {
    pub(crate) fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        match self {
            PipelineElement::Filter(filter) => filter.evaluate(input),
            PipelineElement::SpansetOperation(operation) => operation.evaluate(input),
            PipelineElement::Group(group) => group.evaluate(input),
            PipelineElement::Coalesce(coalesce) => coalesce.evaluate(input),
            PipelineElement::Select(select) => select.evaluate(input),
            PipelineElement::Aggregate(aggregate) => aggregate.evaluate(input),
            PipelineElement::ScalarFilter(filter) => filter.evaluate(input),
            PipelineElement::Pipeline(pipeline) => pipeline.evaluate(input),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        match self {
            PipelineElement::Filter(filter) => filter.validate(),
            PipelineElement::SpansetOperation(operation) => {
                operation.lhs.validate()?;
                operation.rhs.validate()
            }
            PipelineElement::Group(group) => group.expression.validate(),
            PipelineElement::Coalesce(_) => Ok(()),
            PipelineElement::Select(_) => Ok(()),
            PipelineElement::Aggregate(aggregate) => aggregate.validate(),
            PipelineElement::ScalarFilter(filter) => filter.validate(),
            PipelineElement::Pipeline(pipeline) => pipeline.validate(),
        }
    }

    /// Rewrites the element with every constant subexpression folded.
    pub(crate) fn fold(self, branch_samples: usize) -> Result<PipelineElement, EngineError> {
        let element = match self {
            PipelineElement::Filter(filter) => PipelineElement::Filter(filter.fold(branch_samples)?),
            PipelineElement::SpansetOperation(operation) => {
                PipelineElement::SpansetOperation(SpansetOperation::new(
                    operation.op,
                    operation.lhs.fold(branch_samples)?,
                    operation.rhs.fold(branch_samples)?,
                ))
            }
            PipelineElement::Group(group) => {
                PipelineElement::Group(GroupOperation::new(group.expression.fold(branch_samples)?))
            }
            PipelineElement::Aggregate(aggregate) => {
                PipelineElement::Aggregate(fold_aggregate(aggregate, branch_samples)?)
            }
            PipelineElement::ScalarFilter(filter) => PipelineElement::ScalarFilter(ScalarFilter::new(
                filter.op,
                fold_scalar(filter.lhs, branch_samples)?,
                fold_scalar(filter.rhs, branch_samples)?,
            )),
            PipelineElement::Pipeline(pipeline) => {
                PipelineElement::Pipeline(pipeline.fold(branch_samples)?)
            }
            element @ (PipelineElement::Coalesce(_) | PipelineElement::Select(_)) => element,
        };

        Ok(element)
    }
}

fn fold_aggregate(aggregate: Aggregate, branch_samples: usize) -> Result<Aggregate, EngineError> {
    Ok(Aggregate {
        op: aggregate.op,
        expression: aggregate
            .expression
            .map(|e| e.fold(branch_samples))
            .transpose()?,
    })
}

fn fold_scalar(
    expression: ScalarExpression,
    branch_samples: usize,
) -> Result<ScalarExpression, EngineError> {
    let expression = match expression {
        ScalarExpression::Aggregate(aggregate) => {
            ScalarExpression::Aggregate(fold_aggregate(aggregate, branch_samples)?)
        }
        ScalarExpression::Static(value) => ScalarExpression::Static(value),
        ScalarExpression::Operation(operation) => {
            let ScalarOperation { op, lhs, rhs } = *operation;
            ScalarExpression::Operation(Box::new(ScalarOperation {
                op,
                lhs: fold_scalar(lhs, branch_samples)?,
                rhs: fold_scalar(rhs, branch_samples)?,
            }))
        }
    };

    Ok(expression)
}

impl Display for PipelineElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            PipelineElement::Filter(filter) => write!(f, "{filter}"),
            PipelineElement::SpansetOperation(operation) => {
                write!(f, "({}) {} ({})", operation.lhs, operation.op, operation.rhs)
            }
            PipelineElement::Group(group) => write!(f, "{group}"),
            PipelineElement::Coalesce(_) => write!(f, "coalesce()"),
            PipelineElement::Select(select) => {
                write!(f, "select(")?;
                for (i, attribute) in select.attributes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{attribute}")?;
                }
                write!(f, ")")
            }
            PipelineElement::Aggregate(aggregate) => write!(f, "{aggregate}"),
            PipelineElement::ScalarFilter(filter) => write!(f, "{filter}"),
            PipelineElement::Pipeline(pipeline) => write!(f, "{pipeline}"),
        }
    }
}

/// An ordered chain of elements, e.g. `{ a } | by(b) | count() > 2`.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub elements: Vec<PipelineElement>,
}

impl Pipeline {
    pub fn new(elements: Vec<PipelineElement>) -> Pipeline {
        Pipeline { elements }
    }

    pub fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        let mut result = input;

        for element in &mut self.elements {
            if result.is_empty() {
                break;
            }

            result = element.evaluate(result)?;
        }

        Ok(result)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.elements.iter().try_for_each(PipelineElement::validate)
    }

    pub fn fold(self, branch_samples: usize) -> Result<Pipeline, EngineError> {
        let elements = self
            .elements
            .into_iter()
            .map(|e| e.fold(branch_samples))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Pipeline { elements })
    }
}

impl Display for Pipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{element}")?;
        }
        Ok(())
    }
}

/// A whole query as produced by the parser.
#[derive(Debug, Default)]
pub struct RootExpr {
    pub pipeline: Pipeline,
    pub metrics_pipeline: Option<Box<dyn FirstStageElement>>,
    pub metrics_second_stage: Option<Box<dyn SecondStageElement>>,
    pub hints: Hints,
}

impl RootExpr {
    pub fn new(pipeline: Pipeline) -> RootExpr {
        RootExpr {
            pipeline,
            ..RootExpr::default()
        }
    }

    pub fn with_metrics(mut self, metrics: impl FirstStageElement + 'static) -> RootExpr {
        self.metrics_pipeline = Some(Box::new(metrics));
        self
    }

    pub fn with_second_stage(mut self, second_stage: impl SecondStageElement + 'static) -> RootExpr {
        self.metrics_second_stage = Some(Box::new(second_stage));
        self
    }

    pub fn with_hints(mut self, hints: Hints) -> RootExpr {
        self.hints = hints;
        self
    }

    /// Trivial queries that can never return anything, like `{ false }`.
    pub fn is_noop(&self) -> bool {
        if self.pipeline.elements.is_empty() {
            return self.metrics_pipeline.is_none();
        }

        matches!(
            self.pipeline.elements.first(),
            Some(PipelineElement::Filter(filter)) if filter.is_static_false()
        )
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.pipeline.validate()?;

        if let Some(metrics) = &self.metrics_pipeline {
            metrics.validate()?;
        }

        if let Some(second_stage) = &self.metrics_second_stage {
            if self.metrics_pipeline.is_none() {
                return Err(EngineError::Validation(format!(
                    "{second_stage} requires a metrics query"
                )));
            }
            second_stage.validate()?;
        }

        Ok(())
    }

    /// Folds constants in every stage. Must only be called on a validated
    /// expression.
    pub fn fold(&mut self, branch_samples: usize) -> Result<(), EngineError> {
        self.pipeline = mem::take(&mut self.pipeline).fold(branch_samples)?;

        if let Some(metrics) = &mut self.metrics_pipeline {
            metrics.fold(branch_samples)?;
        }

        Ok(())
    }

    pub fn extract_conditions(&self, request: &mut FetchSpansRequest) {
        self.pipeline.extract_conditions(request);

        if let Some(metrics) = &self.metrics_pipeline {
            metrics.extract_conditions(request);
        }
    }
}

impl Display for RootExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.pipeline)?;

        if let Some(metrics) = &self.metrics_pipeline {
            write!(f, " | {metrics}")?;
        }

        if let Some(second_stage) = &self.metrics_second_stage {
            write!(f, " | {second_stage}")?;
        }

        Ok(())
    }
}
