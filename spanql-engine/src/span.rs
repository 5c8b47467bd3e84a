//! The span capability the evaluator runs against and the spanset that
//! carries spans through a pipeline.

use std::fmt::{Debug, Error as FmtError, Formatter};
use std::sync::Arc;

use crate::attribute::Attribute;
use crate::models::Static;

pub type SpanRef = Arc<dyn Span>;

/// Anything the engine can evaluate. The storage layer decides how spans are
/// represented; the engine only reads through this interface and never
/// mutates a span.
///
/// The relationship queries operate on whole candidate sets. They are called
/// on any one span of those sets and write their result into `buffer`, which
/// they clear first, so the caller controls allocation.
pub trait Span: Send + Sync {
    fn attribute_for(&self, attribute: &Attribute) -> Option<Static>;

    fn all_attributes_func(&self, f: &mut dyn FnMut(&Attribute, &Static));

    fn all_attributes(&self) -> Vec<(Attribute, Static)> {
        let mut attributes = Vec::new();
        self.all_attributes_func(&mut |attribute, value| {
            attributes.push((attribute.clone(), value.clone()));
        });
        attributes
    }

    fn id(&self) -> &[u8];

    fn start_time_unix_nanos(&self) -> u64;

    fn duration_nanos(&self) -> u64;

    /// Spans of `rhs` that share a parent with some span of `lhs`. With
    /// `false_for_all` it is instead the spans of `rhs` that share a parent
    /// with none of them. With `union` the matching spans of both sides are
    /// returned.
    fn sibling_of(
        &self,
        lhs: &[SpanRef],
        rhs: &[SpanRef],
        false_for_all: bool,
        union: bool,
        buffer: &mut Vec<SpanRef>,
    );

    /// Spans of `rhs` that descend from some span of `lhs`. With `invert` it
    /// is instead the spans of `rhs` that are an ancestor of some span of
    /// `lhs`. `false_for_all` and `union` work the same as for
    /// [`Span::sibling_of`].
    fn descendant_of(
        &self,
        lhs: &[SpanRef],
        rhs: &[SpanRef],
        false_for_all: bool,
        invert: bool,
        union: bool,
        buffer: &mut Vec<SpanRef>,
    );

    /// Same as [`Span::descendant_of`] but limited to direct children.
    fn child_of(
        &self,
        lhs: &[SpanRef],
        rhs: &[SpanRef],
        false_for_all: bool,
        invert: bool,
        union: bool,
        buffer: &mut Vec<SpanRef>,
    );
}

impl Debug for dyn Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Span").field("id", &hex(self.id())).finish()
    }
}

pub type ReleaseFn = Arc<dyn Fn(&Spanset) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SpansetAttribute {
    pub name: String,
    pub value: Static,
}

/// A group of spans from one trace that are evaluated together.
pub struct Spanset {
    pub trace_id: Vec<u8>,
    pub root_span_name: String,
    pub root_service_name: String,
    pub start_time_unix_nanos: u64,
    pub duration_nanos: u64,

    /// Result of the most recent aggregate stage.
    pub scalar: Static,
    pub spans: Vec<SpanRef>,
    pub attributes: Vec<SpansetAttribute>,

    release_fn: Option<ReleaseFn>,
}

impl Spanset {
    pub fn new(trace_id: Vec<u8>, spans: Vec<SpanRef>) -> Spanset {
        Spanset {
            trace_id,
            root_span_name: String::new(),
            root_service_name: String::new(),
            start_time_unix_nanos: 0,
            duration_nanos: 0,
            scalar: Static::Nil,
            spans,
            attributes: Vec::new(),
            release_fn: None,
        }
    }

    /// Sets the callback that returns this spanset's resources to its owner.
    pub fn with_release(mut self, release_fn: ReleaseFn) -> Spanset {
        self.release_fn = Some(release_fn);
        self
    }

    pub fn add_attribute(&mut self, name: impl Into<String>, value: Static) {
        self.attributes.push(SpansetAttribute {
            name: name.into(),
            value,
        });
    }

    pub fn attribute(&self, name: &str) -> Option<&Static> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    /// Hands the spanset back to its owner. Must be called once by whoever
    /// received it from storage, after every derived spanset is done.
    pub fn release(mut self) {
        if let Some(release_fn) = self.release_fn.take() {
            release_fn(&self);
        }
    }

    pub fn trace_id_hex(&self) -> String {
        hex(&self.trace_id)
    }
}

/// Clones share the spans but not the release callback; only the original
/// owns the resources.
impl Clone for Spanset {
    fn clone(&self) -> Spanset {
        Spanset {
            trace_id: self.trace_id.clone(),
            root_span_name: self.root_span_name.clone(),
            root_service_name: self.root_service_name.clone(),
            start_time_unix_nanos: self.start_time_unix_nanos,
            duration_nanos: self.duration_nanos,
            scalar: self.scalar.clone(),
            spans: self.spans.clone(),
            attributes: self.attributes.clone(),
            release_fn: None,
        }
    }
}

impl Debug for Spanset {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Spanset")
            .field("trace_id", &self.trace_id_hex())
            .field("root_span_name", &self.root_span_name)
            .field("root_service_name", &self.root_service_name)
            .field("scalar", &self.scalar)
            .field("spans", &self.spans.len())
            .field("attributes", &self.attributes)
            .finish()
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
