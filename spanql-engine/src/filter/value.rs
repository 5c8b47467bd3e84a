use std::cmp::Ordering;

use regex::Regex;

use crate::error::EngineError;
use crate::models::{Static, StaticType};

use super::operator::Operator;

/// Compiles `pattern` into `cache` unless it already holds it. Only the first
/// execution of a node with a literal pattern pays for the compile.
pub(crate) fn cached_regex<'a>(
    cache: &'a mut Option<Regex>,
    pattern: &str,
) -> Result<&'a Regex, EngineError> {
    let stale = match cache {
        Some(regex) => regex.as_str() != pattern,
        None => true,
    };

    if stale {
        let regex = Regex::new(pattern).map_err(|err| {
            EngineError::Execution(format!("invalid regex {pattern:?}: {err}"))
        })?;
        *cache = Some(regex);
    }

    match cache {
        Some(regex) => Ok(regex),
        None => Err(EngineError::Execution("regex cache is empty".to_owned())),
    }
}

/// Executes a binary operator on two already evaluated operands.
///
/// Operands of incompatible types are not an error, they simply do not
/// match. `&&` and `||` are handled by the expression node itself so that it
/// can short circuit, but are supported here for completeness.
pub(crate) fn binary_op(
    op: Operator,
    lhs: &Static,
    rhs: &Static,
    regex: &mut Option<Regex>,
) -> Result<Static, EngineError> {
    let lhs_type = lhs.static_type();
    let rhs_type = rhs.static_type();

    if !lhs_type.is_matching_operand(rhs_type) {
        return Ok(Static::Bool(false));
    }

    match (lhs_type.is_array(), rhs_type.is_array()) {
        (true, true) => {
            let result = match op {
                Operator::Equal => lhs.equals(rhs),
                Operator::NotEqual => lhs.not_equals(rhs),
                _ => false,
            };
            return Ok(Static::Bool(result));
        }
        (true, false) => return array_op(op, lhs, rhs, false, regex),
        (false, true) => return array_op(op, rhs, lhs, true, regex),
        (false, false) => {}
    }

    let result = match op {
        Operator::And | Operator::Or => match (lhs.as_bool(), rhs.as_bool()) {
            (Some(l), Some(r)) if op == Operator::And => Static::Bool(l && r),
            (Some(l), Some(r)) => Static::Bool(l || r),
            _ => Static::Bool(false),
        },
        Operator::Equal => Static::Bool(lhs.equals(rhs)),
        Operator::NotEqual => Static::Bool(lhs.not_equals(rhs)),
        Operator::Greater | Operator::GreaterEqual | Operator::Less | Operator::LessEqual => {
            Static::Bool(ordering_op(op, lhs, rhs))
        }
        Operator::Regex | Operator::NotRegex => match (lhs, rhs) {
            (Static::String(l), Static::String(r)) => {
                let matched = cached_regex(regex, r)?.is_match(l);
                Static::Bool(matched == (op == Operator::Regex))
            }
            _ => Static::Bool(false),
        },
        Operator::Add
        | Operator::Sub
        | Operator::Div
        | Operator::Mod
        | Operator::Mult
        | Operator::Power => arithmetic_op(op, lhs, rhs),
        Operator::None | Operator::Not | Operator::Exists => Static::Bool(false),
    };

    Ok(result)
}

/// Membership style comparison between an array and a scalar: true if any
/// element satisfies the operator. Negated operators are true when no element
/// satisfies the positive form.
fn array_op(
    op: Operator,
    array: &Static,
    scalar: &Static,
    array_on_right: bool,
    regex: &mut Option<Regex>,
) -> Result<Static, EngineError> {
    if scalar.is_nil() {
        return Ok(Static::Bool(false));
    }

    let (element_op, negate) = match op.positive() {
        Some(positive) => (positive, true),
        None => (op, false),
    };

    if !element_op.is_comparison() {
        return Ok(Static::Bool(false));
    }

    let len = array.array_len().unwrap_or(0);
    let mut found = false;
    for i in 0..len {
        let Some(element) = array.array_element(i) else {
            continue;
        };

        let result = if array_on_right {
            binary_op(element_op, scalar, &element, regex)?
        } else {
            binary_op(element_op, &element, scalar, regex)?
        };

        if result.as_bool() == Some(true) {
            found = true;
            break;
        }
    }

    Ok(Static::Bool(found != negate))
}

fn ordering_op(op: Operator, lhs: &Static, rhs: &Static) -> bool {
    let comparable = (lhs.static_type().is_numeric() && rhs.static_type().is_numeric())
        || (lhs.static_type() == StaticType::String && rhs.static_type() == StaticType::String);

    if !comparable {
        return false;
    }

    // NaN is unordered against everything
    if lhs.float().is_nan() && lhs.static_type() == StaticType::Float
        || rhs.float().is_nan() && rhs.static_type() == StaticType::Float
    {
        return false;
    }

    let ordering = lhs.compare(rhs);
    match op {
        Operator::Greater => ordering == Ordering::Greater,
        Operator::GreaterEqual => ordering != Ordering::Less,
        Operator::Less => ordering == Ordering::Less,
        Operator::LessEqual => ordering != Ordering::Greater,
        _ => false,
    }
}

fn arithmetic_op(op: Operator, lhs: &Static, rhs: &Static) -> Static {
    match (lhs, rhs) {
        (Static::Int(l), Static::Int(r)) => match op {
            Operator::Add => Static::Int(l.wrapping_add(*r)),
            Operator::Sub => Static::Int(l.wrapping_sub(*r)),
            Operator::Mult => Static::Int(l.wrapping_mul(*r)),
            Operator::Div => Static::Float(*l as f64 / *r as f64),
            Operator::Mod => match l.checked_rem(*r) {
                Some(v) => Static::Int(v),
                None => Static::Float(f64::NAN),
            },
            Operator::Power => match u32::try_from(*r) {
                Ok(exp) => Static::Int(l.wrapping_pow(exp)),
                Err(_) => Static::Float((*l as f64).powf(*r as f64)),
            },
            _ => Static::Nil,
        },
        (Static::Duration(l), Static::Duration(r)) if op == Operator::Add => {
            Static::Duration(l.saturating_add(*r))
        }
        (Static::Duration(l), Static::Duration(r)) if op == Operator::Sub => {
            Static::Duration(l.saturating_sub(*r))
        }
        (l, r) if l.static_type().is_numeric() && r.static_type().is_numeric() => {
            Static::Float(float_op(op, l.float(), r.float()))
        }
        _ => Static::Nil,
    }
}

fn float_op(op: Operator, l: f64, r: f64) -> f64 {
    match op {
        Operator::Add => l + r,
        Operator::Sub => l - r,
        Operator::Mult => l * r,
        Operator::Div => l / r,
        Operator::Mod => l % r,
        Operator::Power => l.powf(r),
        _ => f64::NAN,
    }
}

/// Negation for the unary `-` operator.
pub(crate) fn negate(value: &Static) -> Static {
    match value {
        Static::Int(i) => Static::Int(i.wrapping_neg()),
        Static::Float(f) => Static::Float(-f),
        // durations cannot be negative
        Static::Duration(d) => Static::Float(-(d.as_nanos() as f64)),
        _ => Static::Nil,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn op(op: Operator, lhs: impl Into<Static>, rhs: impl Into<Static>) -> Static {
        binary_op(op, &lhs.into(), &rhs.into(), &mut None).unwrap()
    }

    fn is_true(value: Static) -> bool {
        value.as_bool() == Some(true)
    }

    #[test]
    fn mismatched_types_do_not_match() {
        assert!(!is_true(op(Operator::Equal, "1", 1_i64)));
        assert!(!is_true(op(Operator::NotEqual, "1", 1_i64)));
        assert!(!is_true(op(Operator::Greater, true, 1_i64)));
    }

    #[test]
    fn nil_comparisons_are_false() {
        assert!(!is_true(op(Operator::Equal, Static::Nil, Static::Nil)));
        assert!(!is_true(op(Operator::NotEqual, Static::Nil, 1_i64)));
    }

    #[test]
    fn numeric_comparisons_coerce() {
        assert!(is_true(op(Operator::Equal, 2_i64, 2.0)));
        assert!(is_true(op(Operator::Greater, Duration::from_millis(20), Duration::from_millis(10))));
        assert!(is_true(op(Operator::LessEqual, 1_i64, 1.0)));
        assert!(!is_true(op(Operator::Less, f64::NAN, 1.0)));
        assert!(is_true(op(Operator::Less, "abc", "abd")));
    }

    #[test]
    fn arithmetic_keeps_types() {
        assert!(op(Operator::Add, 2_i64, 3_i64).strict_equals(&Static::Int(5)));
        assert!(op(Operator::Div, 3_i64, 2_i64).strict_equals(&Static::Float(1.5)));
        assert!(op(Operator::Power, 2_i64, 10_i64).strict_equals(&Static::Int(1024)));
        assert!(op(Operator::Mult, 2_i64, 1.5).strict_equals(&Static::Float(3.0)));
        assert!(op(Operator::Mod, 5_i64, 0_i64).float().is_nan());
        assert!(op(Operator::Add, Duration::from_secs(1), Duration::from_secs(2))
            .strict_equals(&Static::Duration(Duration::from_secs(3))));
    }

    #[test]
    fn regex_is_compiled_once_and_recompiled_on_change() {
        let mut cache = None;
        let matched = binary_op(Operator::Regex, &"foobar".into(), &"foo.*".into(), &mut cache).unwrap();
        assert!(is_true(matched));
        assert_eq!(cache.as_ref().map(|r| r.as_str()), Some("foo.*"));

        let matched = binary_op(Operator::NotRegex, &"foobar".into(), &"^baz".into(), &mut cache).unwrap();
        assert!(is_true(matched));
        assert_eq!(cache.as_ref().map(|r| r.as_str()), Some("^baz"));
    }

    #[test]
    fn invalid_regex_is_an_execution_error() {
        let err = binary_op(Operator::Regex, &"foo".into(), &"(".into(), &mut None).unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[test]
    fn array_membership() {
        let arr = Static::StringArray(vec!["a".to_owned(), "b".to_owned()]);

        assert!(is_true(op(Operator::Equal, arr.clone(), "b")));
        assert!(is_true(op(Operator::Equal, "a", arr.clone())));
        assert!(!is_true(op(Operator::Equal, arr.clone(), "c")));
        assert!(is_true(op(Operator::NotEqual, arr.clone(), "c")));
        assert!(!is_true(op(Operator::NotEqual, arr.clone(), "a")));
        assert!(is_true(op(Operator::Regex, arr.clone(), "^b$")));

        let ints = Static::IntArray(vec![1, 5, 10]);
        assert!(is_true(op(Operator::Greater, ints.clone(), 7_i64)));
        assert!(!is_true(op(Operator::Greater, ints, 10_i64)));
    }

    #[test]
    fn arrays_against_arrays_only_compare_for_equality() {
        let a = Static::IntArray(vec![1, 2]);
        let b = Static::IntArray(vec![1, 3]);

        assert!(is_true(op(Operator::Equal, a.clone(), a.clone())));
        assert!(is_true(op(Operator::NotEqual, a.clone(), b.clone())));
        assert!(!is_true(op(Operator::Less, a, b)));
    }
}
