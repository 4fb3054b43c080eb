//! Label and field selectors.
//!
//! A selector is a conjunction of requirements written as a comma-separated
//! string: `app=web,tier!=db,release,!canary`.

use std::collections::BTreeMap;
use std::fmt;

use super::Object;
use crate::CacheError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

impl Requirement {
    pub fn matches(
        &self,
        set: &BTreeMap<String, String>,
    ) -> bool {
        match self.operator {
            Operator::Equals => set.get(&self.key).is_some_and(|v| *v == self.value),
            // a missing key satisfies `!=`
            Operator::NotEquals => set.get(&self.key).map_or(true, |v| *v != self.value),
            Operator::Exists => set.contains_key(&self.key),
            Operator::DoesNotExist => !set.contains_key(&self.key),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Selector matching every set.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            requirements.push(parse_requirement(term)?);
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(
        &self,
        set: &BTreeMap<String, String>,
    ) -> bool {
        self.requirements.iter().all(|r| r.matches(set))
    }

    /// Value `key` is pinned to by an `=`/`==` requirement, if any.
    pub fn requires_exact_match(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.requirements
            .iter()
            .find(|r| r.key == key && r.operator == Operator::Equals)
            .map(|r| r.value.as_str())
    }
}

impl fmt::Display for Selector {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r.operator {
                Operator::Equals => format!("{}={}", r.key, r.value),
                Operator::NotEquals => format!("{}!={}", r.key, r.value),
                Operator::Exists => r.key.clone(),
                Operator::DoesNotExist => format!("!{}", r.key),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

fn parse_requirement(term: &str) -> Result<Requirement> {
    let (key, operator, value) = if let Some((k, v)) = term.split_once("!=") {
        (k, Operator::NotEquals, v)
    } else if let Some((k, v)) = term.split_once("==") {
        (k, Operator::Equals, v)
    } else if let Some((k, v)) = term.split_once('=') {
        (k, Operator::Equals, v)
    } else if let Some(k) = term.strip_prefix('!') {
        (k, Operator::DoesNotExist, "")
    } else {
        (term, Operator::Exists, "")
    };

    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || !key.chars().all(is_key_char) {
        return Err(CacheError::InvalidSelector(format!("invalid key in {:?}", term)).into());
    }
    if value.contains(['=', '!']) {
        return Err(CacheError::InvalidSelector(format!("invalid value in {:?}", term)).into());
    }

    Ok(Requirement {
        key: key.to_string(),
        operator,
        value: value.to_string(),
    })
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

/// Filter applied to list snapshots and watch streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPredicate {
    pub label: Selector,
    pub field: Selector,
    /// Maximum number of items per list page; 0 means unlimited
    pub limit: usize,
    /// Key to continue a paginated list after
    pub continue_key: Option<String>,
    pub allow_watch_bookmarks: bool,
}

impl SelectionPredicate {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn new(
        label: &str,
        field: &str,
    ) -> Result<Self> {
        Ok(Self {
            label: Selector::parse(label)?,
            field: Selector::parse(field)?,
            ..Default::default()
        })
    }

    pub fn with_bookmarks(mut self) -> Self {
        self.allow_watch_bookmarks = true;
        self
    }

    pub fn with_limit(
        mut self,
        limit: usize,
    ) -> Self {
        self.limit = limit;
        self
    }

    pub fn is_everything(&self) -> bool {
        self.label.is_empty() && self.field.is_empty()
    }

    pub fn matches(
        &self,
        obj: &Object,
    ) -> bool {
        if self.is_everything() {
            return true;
        }
        self.matches_object_attributes(obj.labels(), &obj.field_set())
    }

    pub fn matches_object_attributes(
        &self,
        labels: &BTreeMap<String, String>,
        fields: &BTreeMap<String, String>,
    ) -> bool {
        self.label.matches(labels) && self.field.matches(fields)
    }
}
