use std::fmt::{Display, Error as FmtError, Formatter};

use serde::{Deserialize, Serialize};

use crate::attribute::Intrinsic;
use crate::models::StaticType;

/// Operators of field expressions. Also used by pushdown conditions, where
/// [`Operator::None`] means "fetch the column but do not filter on it".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    None,
    Add,
    Sub,
    Div,
    Mod,
    Mult,
    Power,
    Equal,
    NotEqual,
    Regex,
    NotRegex,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    And,
    Or,
    Not,
    /// `x != nil`
    Exists,
}

impl Operator {
    /// Operators that produce a boolean.
    pub fn is_boolean(self) -> bool {
        self.is_comparison() || matches!(self, Operator::And | Operator::Or | Operator::Not | Operator::Exists)
    }

    /// Operators that compare two values, the only ones a storage layer
    /// can filter on directly.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Equal
                | Operator::NotEqual
                | Operator::Regex
                | Operator::NotRegex
                | Operator::Greater
                | Operator::GreaterEqual
                | Operator::Less
                | Operator::LessEqual
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Operator::Add
                | Operator::Sub
                | Operator::Div
                | Operator::Mod
                | Operator::Mult
                | Operator::Power
        )
    }

    /// The operator to use when the operands are swapped, if it exists.
    pub fn flip(self) -> Option<Operator> {
        match self {
            Operator::Equal | Operator::NotEqual => Some(self),
            Operator::Greater => Some(Operator::Less),
            Operator::GreaterEqual => Some(Operator::LessEqual),
            Operator::Less => Some(Operator::Greater),
            Operator::LessEqual => Some(Operator::GreaterEqual),
            _ => None,
        }
    }

    /// The positive form of a negated comparison.
    pub(crate) fn positive(self) -> Option<Operator> {
        match self {
            Operator::NotEqual => Some(Operator::Equal),
            Operator::NotRegex => Some(Operator::Regex),
            _ => None,
        }
    }

    /// Whether this binary operator accepts operands of the given types. An
    /// attribute is unknown before execution so it takes on the type of the
    /// other side.
    pub fn binary_types_valid(self, lhs: StaticType, rhs: StaticType) -> bool {
        let (lhs, rhs) = match (lhs, rhs) {
            (StaticType::Attribute, StaticType::Attribute) => return true,
            (StaticType::Attribute, rhs) => (rhs, rhs),
            (lhs, StaticType::Attribute) => (lhs, lhs),
            pair => pair,
        };

        if lhs == StaticType::Nil || rhs == StaticType::Nil {
            return matches!(self, Operator::Equal | Operator::NotEqual);
        }

        let l = lhs.element_type();
        let r = rhs.element_type();

        match self {
            Operator::And | Operator::Or => l == StaticType::Boolean && r == StaticType::Boolean,
            Operator::Add
            | Operator::Sub
            | Operator::Div
            | Operator::Mod
            | Operator::Mult
            | Operator::Power => lhs.is_numeric() && rhs.is_numeric(),
            Operator::Greater | Operator::GreaterEqual | Operator::Less | Operator::LessEqual => {
                (l.is_numeric() && r.is_numeric())
                    || (l == StaticType::String && r == StaticType::String)
            }
            Operator::Equal | Operator::NotEqual => {
                l == r || (l.is_numeric() && r.is_numeric())
            }
            Operator::Regex | Operator::NotRegex => {
                l == StaticType::String && r == StaticType::String
            }
            Operator::None | Operator::Not | Operator::Exists => false,
        }
    }

    pub fn unary_type_valid(self, t: StaticType) -> bool {
        match self {
            Operator::Not => matches!(t, StaticType::Boolean | StaticType::Attribute),
            Operator::Sub => t.is_numeric() || t == StaticType::Attribute,
            Operator::Exists => true,
            _ => false,
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let s = match self {
            Operator::None => "",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::Mult => "*",
            Operator::Power => "^",
            Operator::Equal => "=",
            Operator::NotEqual => "!=",
            Operator::Regex => "=~",
            Operator::NotRegex => "!~",
            Operator::Greater => ">",
            Operator::GreaterEqual => ">=",
            Operator::Less => "<",
            Operator::LessEqual => "<=",
            Operator::And => "&&",
            Operator::Or => "||",
            Operator::Not => "!",
            Operator::Exists => "!= nil",
        };

        f.write_str(s)
    }
}

/// Operators joining two spanset expressions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpansetOp {
    And,
    Union,
    Child,
    Parent,
    Descendant,
    Ancestor,
    Sibling,
    NotChild,
    NotParent,
    NotDescendant,
    NotAncestor,
    NotSibling,
    UnionChild,
    UnionParent,
    UnionDescendant,
    UnionAncestor,
    UnionSibling,
}

impl SpansetOp {
    /// Operators that relate spans of one side to spans of the other.
    pub fn is_structural(self) -> bool {
        !matches!(self, SpansetOp::And | SpansetOp::Union)
    }

    /// The marker condition telling storage which structural data to load.
    pub(crate) fn structural_intrinsic(self) -> Option<Intrinsic> {
        match self {
            SpansetOp::And | SpansetOp::Union => None,
            SpansetOp::Child
            | SpansetOp::Parent
            | SpansetOp::NotChild
            | SpansetOp::NotParent
            | SpansetOp::UnionChild
            | SpansetOp::UnionParent => Some(Intrinsic::StructuralChild),
            SpansetOp::Descendant
            | SpansetOp::Ancestor
            | SpansetOp::NotDescendant
            | SpansetOp::NotAncestor
            | SpansetOp::UnionDescendant
            | SpansetOp::UnionAncestor => Some(Intrinsic::StructuralDescendant),
            SpansetOp::Sibling | SpansetOp::NotSibling | SpansetOp::UnionSibling => {
                Some(Intrinsic::StructuralSibling)
            }
        }
    }
}

impl Display for SpansetOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let s = match self {
            SpansetOp::And => "&&",
            SpansetOp::Union => "||",
            SpansetOp::Child => ">",
            SpansetOp::Parent => "<",
            SpansetOp::Descendant => ">>",
            SpansetOp::Ancestor => "<<",
            SpansetOp::Sibling => "~",
            SpansetOp::NotChild => "!>",
            SpansetOp::NotParent => "!<",
            SpansetOp::NotDescendant => "!>>",
            SpansetOp::NotAncestor => "!<<",
            SpansetOp::NotSibling => "!~",
            SpansetOp::UnionChild => "&>",
            SpansetOp::UnionParent => "&<",
            SpansetOp::UnionDescendant => "&>>",
            SpansetOp::UnionAncestor => "&<<",
            SpansetOp::UnionSibling => "&~",
        };

        f.write_str(s)
    }
}
