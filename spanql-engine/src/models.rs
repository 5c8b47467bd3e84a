use std::cmp::Ordering;
use std::fmt::{Display, Error as FmtError, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The type tag of a [`Static`]. `Spanset` and `Attribute` never appear on a
/// concrete value, they are only used while inferring the type of an
/// expression before it is executed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaticType {
    Nil,
    Spanset,
    Attribute,
    Int,
    Float,
    String,
    Boolean,
    IntArray,
    FloatArray,
    StringArray,
    BooleanArray,
    Duration,
    Status,
    Kind,
}

impl StaticType {
    pub fn is_numeric(self) -> bool {
        matches!(self, StaticType::Int | StaticType::Float | StaticType::Duration)
    }

    pub fn is_array(self) -> bool {
        matches!(
            self,
            StaticType::IntArray
                | StaticType::FloatArray
                | StaticType::StringArray
                | StaticType::BooleanArray
        )
    }

    /// The type of a single element if this is an array type, otherwise the
    /// type itself.
    pub fn element_type(self) -> StaticType {
        match self {
            StaticType::IntArray => StaticType::Int,
            StaticType::FloatArray => StaticType::Float,
            StaticType::StringArray => StaticType::String,
            StaticType::BooleanArray => StaticType::Boolean,
            other => other,
        }
    }

    /// Whether a value of this type can sit on the other side of a binary
    /// operator from a value of `other`. Attributes are unknown until
    /// execution so they match anything, as does nil.
    pub fn is_matching_operand(self, other: StaticType) -> bool {
        if self == StaticType::Attribute || other == StaticType::Attribute {
            return true;
        }

        if self == StaticType::Nil || other == StaticType::Nil {
            return true;
        }

        if self == other {
            return true;
        }

        let lhs = self.element_type();
        let rhs = other.element_type();

        lhs == rhs || (lhs.is_numeric() && rhs.is_numeric())
    }
}

impl Display for StaticType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let s = match self {
            StaticType::Nil => "nil",
            StaticType::Spanset => "spanset",
            StaticType::Attribute => "attribute",
            StaticType::Int => "int",
            StaticType::Float => "float",
            StaticType::String => "string",
            StaticType::Boolean => "bool",
            StaticType::IntArray => "int[]",
            StaticType::FloatArray => "float[]",
            StaticType::StringArray => "string[]",
            StaticType::BooleanArray => "bool[]",
            StaticType::Duration => "duration",
            StaticType::Status => "status",
            StaticType::Kind => "kind",
        };

        f.write_str(s)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Error,
    Ok,
    Unset,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Error => "error",
            Status::Ok => "ok",
            Status::Unset => "unset",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Unspecified => "unspecified",
            Kind::Internal => "internal",
            Kind::Server => "server",
            Kind::Client => "client",
            Kind::Producer => "producer",
            Kind::Consumer => "consumer",
        }
    }
}

/// A typed value. Used for query literals, for attribute values read from
/// spans, and for the results of evaluating expressions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Static {
    #[default]
    Nil,
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Duration(Duration),
    Status(Status),
    Kind(Kind),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
    BoolArray(Vec<bool>),
}

impl Static {
    pub fn static_type(&self) -> StaticType {
        match self {
            Static::Nil => StaticType::Nil,
            Static::Int(_) => StaticType::Int,
            Static::Float(_) => StaticType::Float,
            Static::String(_) => StaticType::String,
            Static::Bool(_) => StaticType::Boolean,
            Static::Duration(_) => StaticType::Duration,
            Static::Status(_) => StaticType::Status,
            Static::Kind(_) => StaticType::Kind,
            Static::IntArray(_) => StaticType::IntArray,
            Static::FloatArray(_) => StaticType::FloatArray,
            Static::StringArray(_) => StaticType::StringArray,
            Static::BoolArray(_) => StaticType::BooleanArray,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Static::Nil)
    }

    /// Numeric view of the value. Durations are expressed in nanoseconds.
    /// Anything that is not numeric is NaN.
    pub fn float(&self) -> f64 {
        match self {
            Static::Int(i) => *i as f64,
            Static::Float(f) => *f,
            Static::Duration(d) => d.as_nanos() as f64,
            _ => f64::NAN,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Static::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Static::String(s) => Some(s),
            _ => None,
        }
    }

    /// Number of elements if this is an array.
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Static::IntArray(a) => Some(a.len()),
            Static::FloatArray(a) => Some(a.len()),
            Static::StringArray(a) => Some(a.len()),
            Static::BoolArray(a) => Some(a.len()),
            _ => None,
        }
    }

    /// Gets an element of an array as its own value.
    pub fn array_element(&self, index: usize) -> Option<Static> {
        match self {
            Static::IntArray(a) => a.get(index).map(|v| Static::Int(*v)),
            Static::FloatArray(a) => a.get(index).map(|v| Static::Float(*v)),
            Static::StringArray(a) => a.get(index).map(|v| Static::String(v.clone())),
            Static::BoolArray(a) => a.get(index).map(|v| Static::Bool(*v)),
            _ => None,
        }
    }

    /// Loose equality. A nil on either side is never equal to anything, not
    /// even another nil. Numbers of different types are compared as floats.
    pub fn equals(&self, other: &Static) -> bool {
        match (self, other) {
            (Static::Nil, _) | (_, Static::Nil) => false,
            (Static::Int(a), Static::Int(b)) => a == b,
            (Static::Duration(a), Static::Duration(b)) => a == b,
            (a, b) if a.static_type().is_numeric() && b.static_type().is_numeric() => {
                a.float() == b.float()
            }
            (Static::String(a), Static::String(b)) => a == b,
            (Static::Bool(a), Static::Bool(b)) => a == b,
            (Static::Status(a), Static::Status(b)) => a == b,
            (Static::Kind(a), Static::Kind(b)) => a == b,
            (a, b) if a.static_type().is_array() && b.static_type().is_array() => {
                let (Some(len_a), Some(len_b)) = (a.array_len(), b.array_len()) else {
                    return false;
                };

                len_a == len_b
                    && (0..len_a).all(|i| match (a.array_element(i), b.array_element(i)) {
                        (Some(x), Some(y)) => x.equals(&y),
                        _ => false,
                    })
            }
            _ => false,
        }
    }

    /// Loose inequality. Also false if either side is nil.
    pub fn not_equals(&self, other: &Static) -> bool {
        if self.is_nil() || other.is_nil() {
            return false;
        }

        !self.equals(other)
    }

    /// Type-exact identity. Nil is only identical to nil, floats compare by
    /// their bit pattern so every value is identical to itself.
    pub fn strict_equals(&self, other: &Static) -> bool {
        match (self, other) {
            (Static::Nil, Static::Nil) => true,
            (Static::Int(a), Static::Int(b)) => a == b,
            (Static::Float(a), Static::Float(b)) => a.to_bits() == b.to_bits(),
            (Static::String(a), Static::String(b)) => a == b,
            (Static::Bool(a), Static::Bool(b)) => a == b,
            (Static::Duration(a), Static::Duration(b)) => a == b,
            (Static::Status(a), Static::Status(b)) => a == b,
            (Static::Kind(a), Static::Kind(b)) => a == b,
            (Static::IntArray(a), Static::IntArray(b)) => a == b,
            (Static::FloatArray(a), Static::FloatArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Static::StringArray(a), Static::StringArray(b)) => a == b,
            (Static::BoolArray(a), Static::BoolArray(b)) => a == b,
            _ => false,
        }
    }

    /// Ordering between two values. Mismatched numbers compare as floats and
    /// arrays compare lexicographically. Values that have no defined order
    /// relative to each other compare as equal.
    pub fn compare(&self, other: &Static) -> Ordering {
        match (self, other) {
            (Static::Int(a), Static::Int(b)) => a.cmp(b),
            (Static::Duration(a), Static::Duration(b)) => a.cmp(b),
            (a, b) if a.static_type().is_numeric() && b.static_type().is_numeric() => {
                a.float().partial_cmp(&b.float()).unwrap_or(Ordering::Equal)
            }
            (Static::String(a), Static::String(b)) => a.cmp(b),
            (Static::Bool(a), Static::Bool(b)) => a.cmp(b),
            (Static::Status(a), Static::Status(b)) => a.cmp(b),
            (Static::Kind(a), Static::Kind(b)) => a.cmp(b),
            (a, b) if a.static_type().is_array() && b.static_type().is_array() => {
                let len_a = a.array_len().unwrap_or(0);
                let len_b = b.array_len().unwrap_or(0);

                for i in 0..len_a.min(len_b) {
                    if let (Some(x), Some(y)) = (a.array_element(i), b.array_element(i)) {
                        match x.compare(&y) {
                            Ordering::Equal => {}
                            ord => return ord,
                        }
                    }
                }

                len_a.cmp(&len_b)
            }
            _ => Ordering::Equal,
        }
    }

    /// A hashable key that uniquely identifies this value.
    pub fn map_key(&self) -> StaticMapKey {
        match self {
            Static::Nil => StaticMapKey::Nil,
            Static::Int(i) => StaticMapKey::Int(*i),
            Static::Float(f) => StaticMapKey::Float(f.to_bits()),
            Static::String(s) => StaticMapKey::String(s.clone()),
            Static::Bool(b) => StaticMapKey::Bool(*b),
            Static::Duration(d) => StaticMapKey::Duration(*d),
            Static::Status(s) => StaticMapKey::Status(*s),
            Static::Kind(k) => StaticMapKey::Kind(*k),
            Static::IntArray(a) => StaticMapKey::IntArray(a.clone()),
            Static::FloatArray(a) => StaticMapKey::FloatArray(a.iter().map(|f| f.to_bits()).collect()),
            Static::StringArray(a) => StaticMapKey::StringArray(a.clone()),
            Static::BoolArray(a) => StaticMapKey::BoolArray(a.clone()),
        }
    }

    /// Adds two values for aggregation, keeping the type where possible.
    pub fn sum_into(&self, other: &Static) -> Static {
        match (self, other) {
            (Static::Int(a), Static::Int(b)) => Static::Int(a.wrapping_add(*b)),
            (Static::Duration(a), Static::Duration(b)) => Static::Duration(a.saturating_add(*b)),
            (a, b) => Static::Float(a.float() + b.float()),
        }
    }

    /// Divides a value for aggregation. Integers become floats.
    pub fn divide_by(&self, divisor: f64) -> Static {
        match self {
            Static::Duration(d) => {
                Static::Duration(Duration::from_nanos((d.as_nanos() as f64 / divisor) as u64))
            }
            other => Static::Float(other.float() / divisor),
        }
    }

    /// Renders the value as text. Strings are only quoted if `quotes` is set.
    pub fn encode_to_string(&self, quotes: bool) -> String {
        match self {
            Static::Nil => "nil".to_owned(),
            Static::Int(i) => i.to_string(),
            Static::Float(f) => f.to_string(),
            Static::String(s) if quotes => format!("{s:?}"),
            Static::String(s) => s.clone(),
            Static::Bool(b) => b.to_string(),
            Static::Duration(d) => format_duration(*d),
            Static::Status(s) => s.as_str().to_owned(),
            Static::Kind(k) => k.as_str().to_owned(),
            Static::IntArray(a) => format_array(a.iter().map(|v| v.to_string())),
            Static::FloatArray(a) => format_array(a.iter().map(|v| v.to_string())),
            Static::StringArray(a) if quotes => format_array(a.iter().map(|v| format!("{v:?}"))),
            Static::StringArray(a) => format_array(a.iter().cloned()),
            Static::BoolArray(a) => format_array(a.iter().map(|v| v.to_string())),
        }
    }
}

impl Display for Static {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(&self.encode_to_string(true))
    }
}

/// Identity, not query equality: see [`Static::strict_equals`].
impl PartialEq for Static {
    fn eq(&self, other: &Static) -> bool {
        self.strict_equals(other)
    }
}

impl From<i64> for Static {
    fn from(value: i64) -> Static {
        Static::Int(value)
    }
}

impl From<f64> for Static {
    fn from(value: f64) -> Static {
        Static::Float(value)
    }
}

impl From<bool> for Static {
    fn from(value: bool) -> Static {
        Static::Bool(value)
    }
}

impl From<&str> for Static {
    fn from(value: &str) -> Static {
        Static::String(value.to_owned())
    }
}

impl From<String> for Static {
    fn from(value: String) -> Static {
        Static::String(value)
    }
}

impl From<Duration> for Static {
    fn from(value: Duration) -> Static {
        Static::Duration(value)
    }
}

impl From<Status> for Static {
    fn from(value: Status) -> Static {
        Static::Status(value)
    }
}

impl From<Kind> for Static {
    fn from(value: Kind) -> Static {
        Static::Kind(value)
    }
}

/// Hashable stand-in for a [`Static`]. Every distinct value maps to a
/// distinct key so grouping never collides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StaticMapKey {
    #[default]
    Nil,
    Int(i64),
    Float(u64),
    String(String),
    Bool(bool),
    Duration(Duration),
    Status(Status),
    Kind(Kind),
    IntArray(Vec<i64>),
    FloatArray(Vec<u64>),
    StringArray(Vec<String>),
    BoolArray(Vec<bool>),
}

fn format_array(items: impl Iterator<Item = String>) -> String {
    let items: Vec<String> = items.collect();
    format!("[{}]", items.join(", "))
}

/// Formats like `1h2m3.5s`, `150ms` or `20µs`.
pub(crate) fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();

    if nanos == 0 {
        return "0s".to_owned();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", nanos as f64 / 1e3);
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", nanos as f64 / 1e6);
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = (total_secs % 60) as f64 + d.subsec_nanos() as f64 / 1e9;

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Static> {
        vec![
            Static::Nil,
            Static::Int(3),
            Static::Float(2.5),
            Static::Float(f64::NAN),
            Static::String("foo".to_owned()),
            Static::Bool(true),
            Static::Duration(Duration::from_millis(15)),
            Static::Status(Status::Error),
            Static::Kind(Kind::Server),
            Static::IntArray(vec![1, 2]),
            Static::FloatArray(vec![1.5]),
            Static::StringArray(vec!["a".to_owned(), "b".to_owned()]),
            Static::BoolArray(vec![false]),
        ]
    }

    #[test]
    fn strict_equals_is_reflexive() {
        for value in samples() {
            assert!(value.strict_equals(&value), "{value:?}");
        }
    }

    #[test]
    fn nil_is_never_loosely_equal() {
        for value in samples() {
            assert!(!Static::Nil.equals(&value));
            assert!(!value.equals(&Static::Nil));
            assert!(!Static::Nil.not_equals(&value));
            assert!(!value.not_equals(&Static::Nil));
        }

        assert!(Static::Nil.strict_equals(&Static::Nil));
        assert!(!Static::Nil.strict_equals(&Static::Int(0)));
    }

    #[test]
    fn numbers_compare_across_types() {
        assert!(Static::Int(2).equals(&Static::Float(2.0)));
        assert!(!Static::Int(2).strict_equals(&Static::Float(2.0)));
        assert_eq!(Static::Int(2).compare(&Static::Float(2.5)), Ordering::Less);
        assert_eq!(
            Static::Duration(Duration::from_nanos(10)).compare(&Static::Int(5)),
            Ordering::Greater
        );
        assert!(Static::Int(1).not_equals(&Static::Int(2)));
        assert!(!Static::String("1".to_owned()).equals(&Static::Int(1)));
    }

    #[test]
    fn arrays_compare_element_wise() {
        let a = Static::IntArray(vec![1, 2, 3]);
        let b = Static::IntArray(vec![1, 2, 4]);
        let c = Static::IntArray(vec![1, 2]);

        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(a.compare(&c), Ordering::Greater);
        assert_eq!(a.compare(&a.clone()), Ordering::Equal);
        assert!(a.equals(&Static::FloatArray(vec![1.0, 2.0, 3.0])));
        assert!(!a.equals(&c));
    }

    #[test]
    fn unordered_values_compare_equal() {
        assert_eq!(Static::Nil.compare(&Static::Nil), Ordering::Equal);
        assert_eq!(Static::Nil.compare(&Static::Int(1)), Ordering::Equal);
        assert_eq!(
            Static::String("a".to_owned()).compare(&Static::Int(1)),
            Ordering::Equal
        );
    }

    #[test]
    fn map_keys_distinguish_types() {
        assert_ne!(Static::Int(1).map_key(), Static::Float(1.0).map_key());
        assert_ne!(
            Static::String("1".to_owned()).map_key(),
            Static::Int(1).map_key()
        );
        assert_eq!(Static::Nil.map_key(), StaticMapKey::default());
    }

    #[test]
    fn sum_and_divide_keep_types() {
        assert!(matches!(Static::Int(2).sum_into(&Static::Int(3)), Static::Int(5)));
        let d = Static::Duration(Duration::from_secs(1)).sum_into(&Static::Duration(Duration::from_secs(2)));
        assert!(d.strict_equals(&Static::Duration(Duration::from_secs(3))));
        assert!(d.divide_by(2.0).strict_equals(&Static::Duration(Duration::from_millis(1500))));
        assert!(Static::Int(3).divide_by(2.0).strict_equals(&Static::Float(1.5)));
    }

    #[test]
    fn encodes_values() {
        assert_eq!(Static::String("a".to_owned()).to_string(), "\"a\"");
        assert_eq!(Static::String("a".to_owned()).encode_to_string(false), "a");
        assert_eq!(Static::Duration(Duration::from_millis(1500)).to_string(), "1.5s");
        assert_eq!(Static::Duration(Duration::from_millis(150)).to_string(), "150ms");
        assert_eq!(Static::Duration(Duration::from_secs(3661)).to_string(), "1h1m1s");
        assert_eq!(Static::Status(Status::Ok).to_string(), "ok");
        assert_eq!(Static::IntArray(vec![1, 2]).to_string(), "[1, 2]");
        assert_eq!(Static::Nil.to_string(), "nil");
    }
}
