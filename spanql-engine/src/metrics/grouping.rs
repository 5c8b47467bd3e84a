//! Sorting spans into series by the values of their group-by attributes.

use std::collections::HashMap;
use std::fmt::Debug;

use super::combine::log2_bucketize;
use super::{Label, Labels, SeriesSet, LABEL_BUCKET, LABEL_NAME, MAX_GROUP_BYS};
use crate::attribute::{Attribute, AttributeScope, Intrinsic};
use crate::error::EngineError;
use crate::models::{Static, StaticMapKey};
use crate::span::Span;

/// Accumulates the spans of a single series.
pub(crate) trait RangeAggregator: Debug + Clone + Send {
    fn observe(&mut self, span: &dyn Span);

    fn observe_exemplar(&mut self, span: &dyn Span, value: f64);

    /// Adds the series this aggregator produces, labelled with `labels`.
    fn write_series(&self, labels: Labels, output: &mut SeriesSet);
}

/// Accumulates spans into any number of series.
pub(crate) trait SpanAggregator: Debug + Send {
    fn observe(&mut self, span: &dyn Span);

    fn observe_exemplar(&mut self, span: &dyn Span, value: f64);

    fn series(&self) -> SeriesSet;

    /// Number of distinct series seen.
    fn length(&self) -> usize;
}

/// A label computed from the span instead of read from an attribute. Spans
/// for which it has no value are dropped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DynamicLabel {
    /// Power-of-two bucket of the span duration, in seconds.
    DurationBucket,
    /// Power-of-two bucket of an integer attribute.
    AttributeBucket(Attribute),
}

impl DynamicLabel {
    fn name(&self) -> &'static str {
        LABEL_BUCKET
    }

    fn value(&self, span: &dyn Span) -> Option<Static> {
        match self {
            DynamicLabel::DurationBucket => duration_bucket(span.duration_nanos()),
            DynamicLabel::AttributeBucket(attribute) => match span.attribute_for(attribute)? {
                Static::Int(i) if i >= 2 => Some(Static::Float(log2_bucketize(i as u64))),
                Static::Float(f) if f >= 2.0 => {
                    Some(Static::Float(log2_bucketize(f.ceil() as u64)))
                }
                Static::Duration(d) => duration_bucket(d.as_nanos() as u64),
                _ => None,
            },
        }
    }
}

fn duration_bucket(nanos: u64) -> Option<Static> {
    if nanos < 2 {
        return None;
    }

    Some(Static::Float(log2_bucketize(nanos) / 1e9))
}

/// Where to look for each group-by value. Unscoped attributes are looked up
/// on the span first and then on the resource.
fn lookups_for(by: &[Attribute]) -> Vec<Vec<Attribute>> {
    by.iter()
        .map(|attribute| {
            if attribute.is_unscoped() {
                vec![
                    Attribute::scoped(AttributeScope::Span, attribute.parent, &attribute.name),
                    Attribute::scoped(AttributeScope::Resource, attribute.parent, &attribute.name),
                ]
            } else {
                vec![attribute.clone()]
            }
        })
        .collect()
}

fn lookup(lookups: &[Attribute], span: &dyn Span) -> Static {
    lookups
        .iter()
        .find_map(|attribute| span.attribute_for(attribute))
        .unwrap_or_default()
}

/// Groups by `N` values, the dynamic label included. Keys are fixed size
/// arrays so distinct groups can never collide.
#[derive(Debug)]
struct GroupingAggregator<const N: usize, R> {
    by: Vec<Attribute>,
    lookups: Vec<Vec<Attribute>>,
    dynamic: Option<DynamicLabel>,
    template: R,

    series: Vec<([Static; N], R)>,
    index: HashMap<[StaticMapKey; N], usize>,

    keys: [StaticMapKey; N],
    values: [Static; N],
    last: Option<([StaticMapKey; N], usize)>,
}

impl<const N: usize, R: RangeAggregator> GroupingAggregator<N, R> {
    fn new(by: &[Attribute], dynamic: Option<DynamicLabel>, template: R) -> Self {
        GroupingAggregator {
            by: by.to_vec(),
            lookups: lookups_for(by),
            dynamic,
            template,
            series: Vec::new(),
            index: HashMap::new(),
            keys: std::array::from_fn(|_| StaticMapKey::Nil),
            values: std::array::from_fn(|_| Static::Nil),
            last: None,
        }
    }

    /// Fills the key buffers for the span. Returns `false` if the span must
    /// be dropped.
    fn load_values(&mut self, span: &dyn Span) -> bool {
        for (i, lookups) in self.lookups.iter().enumerate() {
            let value = lookup(lookups, span);
            self.keys[i] = value.map_key();
            self.values[i] = value;
        }

        if let Some(dynamic) = &self.dynamic {
            let Some(value) = dynamic.value(span) else {
                return false;
            };

            let i = self.lookups.len();
            self.keys[i] = value.map_key();
            self.values[i] = value;
        }

        true
    }

    fn current_series(&mut self) -> &mut R {
        // spans often arrive already grouped
        let cached = match &self.last {
            Some((key, i)) if *key == self.keys => Some(*i),
            _ => None,
        };

        let i = match cached {
            Some(i) => i,
            None => {
                let i = match self.index.get(&self.keys) {
                    Some(&i) => i,
                    None => {
                        let i = self.series.len();
                        self.series.push((self.values.clone(), self.template.clone()));
                        self.index.insert(self.keys.clone(), i);
                        i
                    }
                };
                self.last = Some((self.keys.clone(), i));
                i
            }
        };

        &mut self.series[i].1
    }

    /// Nil values are left out, unless all are nil in which case the first
    /// group-by is kept so the series still has a label.
    fn labels_for(&self, values: &[Static; N]) -> Labels {
        let mut labels = Labels::default();

        for (attribute, value) in self.by.iter().zip(values) {
            if value.is_nil() {
                continue;
            }
            labels.push(Label::new(attribute.to_string(), value.clone()));
        }

        if let Some(dynamic) = &self.dynamic {
            labels.push(Label::new(dynamic.name(), values[self.by.len()].clone()));
        }

        if labels.is_empty() {
            if let Some(first) = self.by.first() {
                labels.push(Label::new(first.to_string(), Static::Nil));
            }
        }

        labels
    }
}

impl<const N: usize, R: RangeAggregator> SpanAggregator for GroupingAggregator<N, R> {
    fn observe(&mut self, span: &dyn Span) {
        if !self.load_values(span) {
            return;
        }

        self.current_series().observe(span);
    }

    fn observe_exemplar(&mut self, span: &dyn Span, value: f64) {
        if !self.load_values(span) {
            return;
        }

        self.current_series().observe_exemplar(span, value);
    }

    fn series(&self) -> SeriesSet {
        let mut output = SeriesSet::new();
        for (values, aggregator) in &self.series {
            aggregator.write_series(self.labels_for(values), &mut output);
        }
        output
    }

    fn length(&self) -> usize {
        self.series.len()
    }
}

/// A single series named after the operation, e.g. `{__name__="rate"}`.
#[derive(Debug)]
struct UngroupedAggregator<R> {
    name: String,
    inner: R,
}

impl<R: RangeAggregator> SpanAggregator for UngroupedAggregator<R> {
    fn observe(&mut self, span: &dyn Span) {
        self.inner.observe(span);
    }

    fn observe_exemplar(&mut self, span: &dyn Span, value: f64) {
        self.inner.observe_exemplar(span, value);
    }

    fn series(&self) -> SeriesSet {
        let mut output = SeriesSet::new();
        let labels = Labels::default().with(LABEL_NAME, self.name.as_str());
        self.inner.write_series(labels, &mut output);
        output
    }

    fn length(&self) -> usize {
        0
    }
}

/// Picks the aggregator for the number of group-by values.
pub(crate) fn new_span_aggregator<R: RangeAggregator + 'static>(
    name: &str,
    template: R,
    by: &[Attribute],
    dynamic: Option<DynamicLabel>,
) -> Result<Box<dyn SpanAggregator>, EngineError> {
    let arity = by.len() + usize::from(dynamic.is_some());

    let aggregator: Box<dyn SpanAggregator> = match arity {
        0 => Box::new(UngroupedAggregator {
            name: name.to_owned(),
            inner: template,
        }),
        1 => Box::new(GroupingAggregator::<1, R>::new(by, dynamic, template)),
        2 => Box::new(GroupingAggregator::<2, R>::new(by, dynamic, template)),
        3 => Box::new(GroupingAggregator::<3, R>::new(by, dynamic, template)),
        4 => Box::new(GroupingAggregator::<4, R>::new(by, dynamic, template)),
        5 => Box::new(GroupingAggregator::<5, R>::new(by, dynamic, template)),
        n => {
            return Err(EngineError::Unsupported(format!(
                "metrics group by {n} values, at most {MAX_GROUP_BYS} are supported"
            )))
        }
    };

    Ok(aggregator)
}

/// Whether an attribute is always present on stored spans, so that reading
/// it never needs the full second pass.
pub(crate) fn is_intrinsic_like(attribute: &Attribute) -> bool {
    attribute.intrinsic != Intrinsic::None
        || (attribute.scope == AttributeScope::Resource
            && !attribute.parent
            && attribute.name == "service.name")
}
