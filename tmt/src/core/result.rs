//! Test results and result interpretation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Outcome of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Info,
    Warn,
    Error,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::Pass,
        Outcome::Fail,
        Outcome::Info,
        Outcome::Warn,
        Outcome::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Info => "info",
            Outcome::Warn => "warn",
            Outcome::Error => "error",
        }
    }

    /// Past-tense verb used in summaries (`3 tests passed`).
    fn verb(self) -> &'static str {
        match self {
            Outcome::Pass => "passed",
            Outcome::Fail => "failed",
            Outcome::Info => "info",
            Outcome::Warn => "warn",
            Outcome::Error => "errored",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Outcome::ALL
            .into_iter()
            .find(|outcome| outcome.as_str() == value)
            .ok_or_else(|| anyhow!("invalid result '{value}'"))
    }
}

/// How a raw outcome is rewritten before it is reported (the test `result` key).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interpretation {
    #[default]
    Respect,
    Xfail,
    Custom,
    Force(Outcome),
}

impl TryFrom<String> for Interpretation {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "respect" => Ok(Interpretation::Respect),
            "xfail" => Ok(Interpretation::Xfail),
            "custom" => Ok(Interpretation::Custom),
            other => other
                .parse()
                .map(Interpretation::Force)
                .map_err(|_| anyhow!("invalid result interpretation '{other}'")),
        }
    }
}

impl From<Interpretation> for String {
    fn from(value: Interpretation) -> Self {
        match value {
            Interpretation::Respect => "respect".to_string(),
            Interpretation::Xfail => "xfail".to_string(),
            Interpretation::Custom => "custom".to_string(),
            Interpretation::Force(outcome) => outcome.as_str().to_string(),
        }
    }
}

/// Structured outcome of one test on one guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Log paths relative to the execute step workdir.
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub ids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<String>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, result: Outcome) -> Self {
        Self {
            name: name.into(),
            result,
            note: None,
            duration: None,
            log: Vec::new(),
            ids: BTreeMap::new(),
            guest: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Rewrite the outcome according to `interpretation`.
    ///
    /// Every rewriting directive records the raw outcome at the start of
    /// `note` (`original result: fail`), keeping any earlier note after it.
    pub fn interpret(mut self, interpretation: Interpretation) -> Self {
        let original = self.result;
        let interpreted = match interpretation {
            Interpretation::Respect | Interpretation::Custom => return self,
            Interpretation::Xfail => match original {
                Outcome::Pass => Outcome::Fail,
                Outcome::Fail => Outcome::Pass,
                other => other,
            },
            Interpretation::Force(outcome) => outcome,
        };
        let marker = format!("original result: {original}");
        self.note = Some(match self.note.take() {
            Some(previous) if !previous.is_empty() => format!("{marker}; {previous}"),
            _ => marker,
        });
        self.result = interpreted;
        self
    }
}

/// Outcome counts over a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    counts: BTreeMap<&'static str, usize>,
    total: usize,
}

impl Summary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a TestResult>) -> Self {
        let mut summary = Summary::default();
        for result in results {
            summary.add(result.result);
        }
        summary
    }

    pub fn add(&mut self, outcome: Outcome) {
        *self.counts.entry(outcome.as_str()).or_default() += 1;
        self.total += 1;
    }

    pub fn merge(&mut self, other: &Summary) {
        for (key, count) in &other.counts {
            *self.counts.entry(*key).or_default() += *count;
        }
        self.total += other.total;
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(outcome.as_str()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// `2 tests passed, 1 test failed` (outcomes without results are omitted).
    pub fn describe(&self) -> String {
        let parts: Vec<String> = Outcome::ALL
            .into_iter()
            .filter_map(|outcome| {
                let count = self.count(outcome);
                (count > 0).then(|| format!("{} {}", pluralize(count, "test"), outcome.verb()))
            })
            .collect();
        if parts.is_empty() {
            return "no results found".to_string();
        }
        parts.join(", ")
    }
}

/// `1 test`, `2 tests`.
pub fn pluralize(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}
