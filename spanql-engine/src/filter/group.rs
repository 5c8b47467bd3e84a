use std::collections::HashMap;
use std::fmt::{Display, Error as FmtError, Formatter};

use crate::attribute::Attribute;
use crate::error::EngineError;
use crate::models::StaticMapKey;
use crate::span::Spanset;

use super::expr::FieldExpression;

/// Splits each spanset into one spanset per distinct value of the
/// expression, recorded as a `by(...)` attribute.
#[derive(Debug, Clone)]
pub struct GroupOperation {
    pub expression: FieldExpression,
}

impl GroupOperation {
    pub fn new(expression: FieldExpression) -> GroupOperation {
        GroupOperation { expression }
    }

    pub(crate) fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        let name = self.to_string();
        let mut output = Vec::with_capacity(input.len());

        for spanset in input {
            let mut groups: Vec<Spanset> = Vec::new();
            let mut index: HashMap<StaticMapKey, usize> = HashMap::new();

            for span in &spanset.spans {
                let value = self.expression.execute(span.as_ref())?;

                let i = *index.entry(value.map_key()).or_insert_with(|| {
                    let mut group = spanset.clone();
                    group.spans = Vec::new();
                    group.add_attribute(name.clone(), value);
                    groups.push(group);
                    groups.len() - 1
                });

                groups[i].spans.push(span.clone());
            }

            output.extend(groups);
        }

        Ok(output)
    }
}

impl Display for GroupOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "by({})", self.expression)
    }
}

/// Merges all spansets into one. The spansets are expected to come from the
/// same trace, the metadata of the first is kept.
#[derive(Debug, Clone, Default)]
pub struct CoalesceOperation;

impl CoalesceOperation {
    pub(crate) fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        let mut input = input.into_iter();
        let Some(mut merged) = input.next() else {
            return Ok(Vec::new());
        };

        for spanset in input {
            merged.spans.extend(spanset.spans);
        }

        Ok(vec![merged])
    }
}

/// Declares attributes that should be loaded for the results. It has no
/// effect on evaluation, only on what is asked of storage.
#[derive(Debug, Clone)]
pub struct SelectOperation {
    pub attributes: Vec<Attribute>,
}

impl SelectOperation {
    pub fn new(attributes: Vec<Attribute>) -> SelectOperation {
        SelectOperation { attributes }
    }

    pub(crate) fn evaluate(&mut self, input: Vec<Spanset>) -> Result<Vec<Spanset>, EngineError> {
        Ok(input)
    }
}
