//! Advanced filter expressions over metadata (`tag: smoke & tier: 1 | tag: -slow`).
//!
//! Grammar: clauses `key: value` joined by `&` (binds tighter) and `|`.
//! A value prefixed with `-` negates the clause. Comma-separated values are
//! alternatives. List-valued keys match when any element matches; a missing
//! key never satisfies a positive clause.

use anyhow::{Result, anyhow};
use regex::Regex;

use crate::core::environment::scalar_to_string;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clause {
    key: String,
    values: Vec<String>,
    negated: bool,
}

/// A parsed filter expression (disjunction of conjunctions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    alternatives: Vec<Vec<Clause>>,
}

impl Filter {
    pub fn parse(expression: &str) -> Result<Self> {
        let mut alternatives = Vec::new();
        for alternative in expression.split('|') {
            let mut clauses = Vec::new();
            for raw in alternative.split('&') {
                clauses.push(parse_clause(raw, expression)?);
            }
            alternatives.push(clauses);
        }
        Ok(Self { alternatives })
    }

    pub fn matches(&self, data: &serde_yaml::Mapping) -> bool {
        self.alternatives
            .iter()
            .any(|clauses| clauses.iter().all(|clause| clause_matches(clause, data)))
    }
}

fn parse_clause(raw: &str, expression: &str) -> Result<Clause> {
    let (key, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid filter '{expression}': missing ':' in '{}'", raw.trim()))?;
    let key = key.trim();
    let mut value = value.trim();
    if key.is_empty() || value.is_empty() {
        return Err(anyhow!("invalid filter '{expression}': empty key or value"));
    }
    let negated = value.starts_with('-');
    if negated {
        value = value[1..].trim_start();
    }
    let values = value
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    Ok(Clause {
        key: key.to_string(),
        values,
        negated,
    })
}

fn clause_matches(clause: &Clause, data: &serde_yaml::Mapping) -> bool {
    let present = node_values(data, &clause.key);
    let hit = present
        .iter()
        .any(|value| clause.values.iter().any(|wanted| wanted == value));
    if clause.negated { !hit } else { hit }
}

fn node_values(data: &serde_yaml::Mapping, key: &str) -> Vec<String> {
    match data.get(key) {
        Some(serde_yaml::Value::Sequence(items)) => items
            .iter()
            .filter_map(|item| scalar_to_string(item).ok())
            .collect(),
        Some(value) => scalar_to_string(value).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Compile name patterns; a name is selected when any pattern matches (search semantics).
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(|err| anyhow!("invalid pattern '{pattern}': {err}")))
        .collect()
}

/// True when `patterns` is empty or any of them matches `name`.
pub fn name_selected(name: &str, patterns: &[Regex]) -> bool {
    patterns.is_empty() || patterns.iter().any(|pattern| pattern.is_match(name))
}
