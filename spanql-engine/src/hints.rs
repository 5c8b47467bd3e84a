//! Query hints, e.g. `with(exemplars=5, most_recent=true)`.

use std::time::Duration;

use crate::models::Static;

pub const HINT_TIME_OVERLAP_CUTOFF: &str = "time_overlap_cutoff";
pub const HINT_EXEMPLARS: &str = "exemplars";
pub const HINT_MOST_RECENT: &str = "most_recent";

#[derive(Debug, Clone)]
pub struct Hint {
    pub name: String,
    pub value: Static,
}

impl Hint {
    pub fn new(name: &str, value: impl Into<Static>) -> Hint {
        Hint {
            name: name.to_owned(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Hints {
    pub hints: Vec<Hint>,
}

/// Hints that tune server-side resources are only honored when the operator
/// allows it.
fn is_unsafe(name: &str) -> bool {
    !matches!(name, HINT_EXEMPLARS | HINT_MOST_RECENT)
}

impl Hints {
    pub fn new(hints: Vec<Hint>) -> Hints {
        Hints { hints }
    }

    pub fn get(&self, name: &str, allow_unsafe: bool) -> Option<&Static> {
        if is_unsafe(name) && !allow_unsafe {
            if self.hints.iter().any(|h| h.name == name) {
                tracing::debug!(hint = name, "ignoring unsafe query hint");
            }
            return None;
        }

        self.hints.iter().find(|h| h.name == name).map(|h| &h.value)
    }

    pub fn get_int(&self, name: &str, allow_unsafe: bool) -> Option<i64> {
        match self.get(name, allow_unsafe)? {
            Static::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats also accept integer values.
    pub fn get_float(&self, name: &str, allow_unsafe: bool) -> Option<f64> {
        match self.get(name, allow_unsafe)? {
            Static::Float(f) => Some(*f),
            Static::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str, allow_unsafe: bool) -> Option<bool> {
        self.get(name, allow_unsafe)?.as_bool()
    }

    pub fn get_duration(&self, name: &str, allow_unsafe: bool) -> Option<Duration> {
        match self.get(name, allow_unsafe)? {
            Static::Duration(d) => Some(*d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_hints_are_always_available() {
        let hints = Hints::new(vec![
            Hint::new(HINT_EXEMPLARS, 5_i64),
            Hint::new(HINT_MOST_RECENT, true),
        ]);

        assert_eq!(hints.get_int(HINT_EXEMPLARS, false), Some(5));
        assert_eq!(hints.get_bool(HINT_MOST_RECENT, false), Some(true));
    }

    #[test]
    fn unsafe_hints_require_permission() {
        let hints = Hints::new(vec![
            Hint::new(HINT_TIME_OVERLAP_CUTOFF, 0.5),
            Hint::new("job_interval", Duration::from_secs(60)),
        ]);

        assert_eq!(hints.get_float(HINT_TIME_OVERLAP_CUTOFF, false), None);
        assert_eq!(hints.get_float(HINT_TIME_OVERLAP_CUTOFF, true), Some(0.5));
        assert_eq!(
            hints.get_duration("job_interval", true),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn unrecognized_hints_are_unsafe() {
        let hints = Hints::new(vec![Hint::new("sample", 0.5)]);

        assert_eq!(hints.get_float("sample", false), None);
        assert_eq!(hints.get_float("sample", true), Some(0.5));
    }

    #[test]
    fn mistyped_hints_are_ignored() {
        let hints = Hints::new(vec![Hint::new(HINT_EXEMPLARS, "lots")]);
        assert_eq!(hints.get_int(HINT_EXEMPLARS, true), None);
        assert_eq!(hints.get_float(HINT_EXEMPLARS, true), None);
    }
}
