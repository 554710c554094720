//! Row selection for `find_many` / `update_many`.
//!
//! Deliberately small: a conjunction of per-column conditions, one optional
//! sort column, and validated paging. Anything smarter belongs to the
//! external read API.

use chainstore_core::Value;

/// A single-column condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(Value),
    Not(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
}

/// A conjunction of column conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, column: impl Into<String>, condition: Condition) -> Self {
        self.predicates.push((column.into(), condition));
        self
    }

    pub fn predicates(&self) -> &[(String, Condition)] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Sort direction. An unspecified direction reads as ascending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Sort specification for `find_many`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }
}
