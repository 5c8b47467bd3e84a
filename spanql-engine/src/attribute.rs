//! References to fields on a span.

use std::fmt::{Display, Error as FmtError, Formatter};

use serde::{Deserialize, Serialize};

use crate::models::StaticType;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeScope {
    None,
    Resource,
    Span,
    Event,
    Link,
    Instrumentation,
}

impl AttributeScope {
    pub fn as_str(self) -> &'static str {
        match self {
            AttributeScope::None => "",
            AttributeScope::Resource => "resource",
            AttributeScope::Span => "span",
            AttributeScope::Event => "event",
            AttributeScope::Link => "link",
            AttributeScope::Instrumentation => "instrumentation",
        }
    }

    pub fn parse(s: &str) -> Option<AttributeScope> {
        match s {
            "" => Some(AttributeScope::None),
            "resource" => Some(AttributeScope::Resource),
            "span" => Some(AttributeScope::Span),
            "event" => Some(AttributeScope::Event),
            "link" => Some(AttributeScope::Link),
            "instrumentation" => Some(AttributeScope::Instrumentation),
            _ => None,
        }
    }
}

/// Fields that every span has (or that are derived from its trace) and that
/// are not looked up by name.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intrinsic {
    None,
    Duration,
    Name,
    Status,
    StatusMessage,
    Kind,
    ChildCount,
    EventName,
    EventTimeSinceStart,
    LinkSpanId,
    LinkTraceId,
    InstrumentationName,
    InstrumentationVersion,
    TraceRootService,
    TraceRootSpan,
    TraceDuration,
    TraceId,
    TraceStartTime,
    SpanId,
    SpanStartTime,
    ParentId,
    NestedSetLeft,
    NestedSetRight,
    NestedSetParent,

    // markers for the storage layer that structural data is needed
    StructuralDescendant,
    StructuralChild,
    StructuralSibling,
}

impl Intrinsic {
    pub fn as_str(self) -> &'static str {
        match self {
            Intrinsic::None => "none",
            Intrinsic::Duration => "duration",
            Intrinsic::Name => "name",
            Intrinsic::Status => "status",
            Intrinsic::StatusMessage => "statusMessage",
            Intrinsic::Kind => "kind",
            Intrinsic::ChildCount => "childCount",
            Intrinsic::EventName => "event:name",
            Intrinsic::EventTimeSinceStart => "event:timeSinceStart",
            Intrinsic::LinkSpanId => "link:spanID",
            Intrinsic::LinkTraceId => "link:traceID",
            Intrinsic::InstrumentationName => "instrumentation:name",
            Intrinsic::InstrumentationVersion => "instrumentation:version",
            Intrinsic::TraceRootService => "rootServiceName",
            Intrinsic::TraceRootSpan => "rootName",
            Intrinsic::TraceDuration => "traceDuration",
            Intrinsic::TraceId => "trace:id",
            Intrinsic::TraceStartTime => "trace:start",
            Intrinsic::SpanId => "span:id",
            Intrinsic::SpanStartTime => "span:start",
            Intrinsic::ParentId => "span:parentID",
            Intrinsic::NestedSetLeft => "nestedSetLeft",
            Intrinsic::NestedSetRight => "nestedSetRight",
            Intrinsic::NestedSetParent => "nestedSetParent",
            Intrinsic::StructuralDescendant => "__structural_descendant",
            Intrinsic::StructuralChild => "__structural_child",
            Intrinsic::StructuralSibling => "__structural_sibling",
        }
    }

    /// Parses an intrinsic name. Both the scoped spelling (`trace:rootService`)
    /// and the older bare spelling (`rootServiceName`) are accepted.
    pub fn parse(s: &str) -> Option<Intrinsic> {
        let intrinsic = match s {
            "duration" | "span:duration" => Intrinsic::Duration,
            "name" | "span:name" => Intrinsic::Name,
            "status" | "span:status" => Intrinsic::Status,
            "statusMessage" | "span:statusMessage" => Intrinsic::StatusMessage,
            "kind" | "span:kind" => Intrinsic::Kind,
            "childCount" | "span:childCount" => Intrinsic::ChildCount,
            "event:name" => Intrinsic::EventName,
            "event:timeSinceStart" => Intrinsic::EventTimeSinceStart,
            "link:spanID" => Intrinsic::LinkSpanId,
            "link:traceID" => Intrinsic::LinkTraceId,
            "instrumentation:name" => Intrinsic::InstrumentationName,
            "instrumentation:version" => Intrinsic::InstrumentationVersion,
            "rootServiceName" | "trace:rootService" => Intrinsic::TraceRootService,
            "rootName" | "trace:rootName" => Intrinsic::TraceRootSpan,
            "traceDuration" | "trace:duration" => Intrinsic::TraceDuration,
            "trace:id" => Intrinsic::TraceId,
            "trace:start" => Intrinsic::TraceStartTime,
            "span:id" => Intrinsic::SpanId,
            "span:start" => Intrinsic::SpanStartTime,
            "span:parentID" => Intrinsic::ParentId,
            "nestedSetLeft" => Intrinsic::NestedSetLeft,
            "nestedSetRight" => Intrinsic::NestedSetRight,
            "nestedSetParent" => Intrinsic::NestedSetParent,
            _ => return None,
        };

        Some(intrinsic)
    }

    /// The type a lookup of this intrinsic is expected to produce.
    pub fn implied_type(self) -> StaticType {
        match self {
            Intrinsic::Duration
            | Intrinsic::TraceDuration
            | Intrinsic::EventTimeSinceStart => StaticType::Duration,
            Intrinsic::Name
            | Intrinsic::StatusMessage
            | Intrinsic::EventName
            | Intrinsic::LinkSpanId
            | Intrinsic::LinkTraceId
            | Intrinsic::InstrumentationName
            | Intrinsic::InstrumentationVersion
            | Intrinsic::TraceRootService
            | Intrinsic::TraceRootSpan
            | Intrinsic::TraceId
            | Intrinsic::SpanId
            | Intrinsic::ParentId => StaticType::String,
            Intrinsic::Status => StaticType::Status,
            Intrinsic::Kind => StaticType::Kind,
            Intrinsic::ChildCount
            | Intrinsic::TraceStartTime
            | Intrinsic::SpanStartTime
            | Intrinsic::NestedSetLeft
            | Intrinsic::NestedSetRight
            | Intrinsic::NestedSetParent => StaticType::Int,
            Intrinsic::None
            | Intrinsic::StructuralDescendant
            | Intrinsic::StructuralChild
            | Intrinsic::StructuralSibling => StaticType::Attribute,
        }
    }
}

/// Identifies where to read a value from a span. Either `intrinsic` is set
/// and `name` is empty, or `intrinsic` is [`Intrinsic::None`] and `name` is
/// looked up within `scope`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attribute {
    pub scope: AttributeScope,
    pub parent: bool,
    pub name: String,
    pub intrinsic: Intrinsic,
}

impl Attribute {
    /// An unscoped attribute, e.g. `.foo`. A bare name that spells an
    /// intrinsic resolves to that intrinsic.
    pub fn new(name: &str) -> Attribute {
        Attribute::scoped(AttributeScope::None, false, name)
    }

    pub fn scoped(scope: AttributeScope, parent: bool, name: &str) -> Attribute {
        if scope == AttributeScope::None && !parent {
            if let Some(intrinsic) = Intrinsic::parse(name) {
                return Attribute::intrinsic(intrinsic);
            }
        }

        Attribute {
            scope,
            parent,
            name: name.to_owned(),
            intrinsic: Intrinsic::None,
        }
    }

    pub fn intrinsic(intrinsic: Intrinsic) -> Attribute {
        Attribute {
            scope: AttributeScope::None,
            parent: false,
            name: String::new(),
            intrinsic,
        }
    }

    pub fn span(name: &str) -> Attribute {
        Attribute::scoped(AttributeScope::Span, false, name)
    }

    pub fn resource(name: &str) -> Attribute {
        Attribute::scoped(AttributeScope::Resource, false, name)
    }

    pub fn is_intrinsic(&self) -> bool {
        self.intrinsic != Intrinsic::None
    }

    /// Unscoped attributes that are not intrinsics, like `.foo`.
    pub fn is_unscoped(&self) -> bool {
        self.scope == AttributeScope::None && self.intrinsic == Intrinsic::None
    }

    pub fn implied_type(&self) -> StaticType {
        self.intrinsic.implied_type()
    }

    /// The same attribute without the parent qualifier.
    pub fn without_parent(&self) -> Attribute {
        Attribute {
            parent: false,
            ..self.clone()
        }
    }
}

fn needs_quoting(name: &str) -> bool {
    name.is_empty()
        || name.chars().any(|c| {
            c.is_whitespace()
                || matches!(
                    c,
                    '{' | '}' | '(' | ')' | '=' | '~' | '!' | '<' | '>' | '&' | '|' | '^' | ','
                        | '"'
                )
        })
}

impl Display for Attribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.intrinsic != Intrinsic::None {
            return f.write_str(self.intrinsic.as_str());
        }

        if self.parent {
            f.write_str("parent.")?;
        }

        f.write_str(self.scope.as_str())?;

        if needs_quoting(&self.name) {
            write!(f, ".{:?}", self.name)
        } else {
            write!(f, ".{}", self.name)
        }
    }
}
