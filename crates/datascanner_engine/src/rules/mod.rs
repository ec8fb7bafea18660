//! Boolean rule trees over typed conversions.
//!
//! A [`Rule`] is either a [`SimpleRule`], evaluable in one step against one
//! converted value, or a compound of other rules. Compounds are never
//! evaluated directly: [`Rule::split`] peels off the next simple rule
//! together with the continuation to follow when it does or does not
//! match, so that evaluation only ever asks for the conversions the
//! boolean structure still needs.

pub mod cpr;
pub mod dimensions;
pub mod evaluate;
pub mod last_modified;
pub mod logical;
pub mod meta;
pub mod regex;
pub mod registry;

use crate::conversions::{OutputType, OutputValue};
use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use self::evaluate::{evaluate, run_available, Evaluation, MatchFragment};
pub use self::logical::{make_and, make_if, make_not, make_or, Split};
pub use self::registry::{RuleRegistry, SimpleRuleFactory};

// ============================================================================
// Sensitivity
// ============================================================================

/// How serious a match of a rule is. Informational only; it never changes
/// how a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sensitivity {
    Information,
    Notice,
    Warning,
    Problem,
    Critical,
}

impl Sensitivity {
    pub fn value(&self) -> u32 {
        match self {
            Sensitivity::Information => 0,
            Sensitivity::Notice => 250,
            Sensitivity::Warning => 500,
            Sensitivity::Problem => 750,
            Sensitivity::Critical => 1000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Information => "information",
            Sensitivity::Notice => "notice",
            Sensitivity::Warning => "warning",
            Sensitivity::Problem => "problem",
            Sensitivity::Critical => "critical",
        }
    }

    pub fn from_value(value: u64) -> Option<Self> {
        match value {
            0 => Some(Sensitivity::Information),
            250 => Some(Sensitivity::Notice),
            500 => Some(Sensitivity::Warning),
            750 => Some(Sensitivity::Problem),
            1000 => Some(Sensitivity::Critical),
            _ => None,
        }
    }

    /// Reads the optional `sensitivity` key of a rule object, given either
    /// as its numeric value or its name.
    fn from_json(obj: &Map<String, Value>, type_label: &str) -> Result<Option<Self>> {
        let parsed = match obj.get("sensitivity") {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.as_u64().and_then(Self::from_value),
            Some(Value::String(s)) => s.parse().ok(),
            Some(_) => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| EngineError::malformed(type_label, "unrecognised sensitivity"))
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Sensitivity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "information" => Ok(Sensitivity::Information),
            "notice" => Ok(Sensitivity::Notice),
            "warning" => Ok(Sensitivity::Warning),
            "problem" => Ok(Sensitivity::Problem),
            "critical" => Ok(Sensitivity::Critical),
            other => Err(EngineError::malformed("sensitivity", format!("unknown level '{}'", other))),
        }
    }
}

// ============================================================================
// Simple rules
// ============================================================================

/// A test that can be applied directly to one converted value.
pub trait SimpleRule: fmt::Debug + Send + Sync + 'static {
    /// Discriminator of the JSON form.
    fn type_label(&self) -> &'static str;

    /// The conversion this rule needs.
    fn operates_on(&self) -> OutputType;

    /// Zero or more JSON fragments, one per match, each with at least a
    /// `match` key. Empty means no match.
    fn find_matches(&self, content: &OutputValue) -> Vec<Value>;

    /// Properties of the JSON form, excluding `type`, `sensitivity` and
    /// `name`. Two simple rules with the same label and properties are the
    /// same rule.
    fn properties(&self) -> Map<String, Value> {
        Map::new()
    }
}

// ============================================================================
// Rule trees
// ============================================================================

#[derive(Debug, Clone)]
pub enum RuleKind {
    Simple(Arc<dyn SimpleRule>),
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
}

/// An immutable rule tree node.
#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    sensitivity: Option<Sensitivity>,
    name: Option<String>,
}

impl Rule {
    pub fn simple(rule: impl SimpleRule) -> Self {
        Self::from_kind(RuleKind::Simple(Arc::new(rule)))
    }

    /// A conjunction. Unlike [`make_and`], this never simplifies.
    pub fn and(components: Vec<Rule>) -> Self {
        Self::from_kind(RuleKind::And(components))
    }

    /// A disjunction. Unlike [`make_or`], this never simplifies.
    pub fn or(components: Vec<Rule>) -> Self {
        Self::from_kind(RuleKind::Or(components))
    }

    pub fn not(rule: Rule) -> Self {
        Self::from_kind(RuleKind::Not(Box::new(rule)))
    }

    pub(crate) fn from_kind(kind: RuleKind) -> Self {
        Self {
            kind,
            sensitivity: None,
            name: None,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn sensitivity(&self) -> Option<Sensitivity> {
        self.sensitivity
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn type_label(&self) -> &'static str {
        match &self.kind {
            RuleKind::Simple(rule) => rule.type_label(),
            RuleKind::And(_) => "and",
            RuleKind::Or(_) => "or",
            RuleKind::Not(_) => "not",
        }
    }

    pub fn to_json_object(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::String(self.type_label().to_string()));
        match &self.kind {
            RuleKind::Simple(rule) => obj.extend(rule.properties()),
            RuleKind::And(components) | RuleKind::Or(components) => {
                let components = components.iter().map(Rule::to_json_object).collect();
                obj.insert("components".to_string(), Value::Array(components));
            }
            RuleKind::Not(rule) => {
                obj.insert("rule".to_string(), rule.to_json_object());
            }
        }
        if let Some(sensitivity) = self.sensitivity {
            obj.insert("sensitivity".to_string(), Value::from(sensitivity.value()));
        }
        if let Some(name) = &self.name {
            obj.insert("name".to_string(), Value::String(name.clone()));
        }
        Value::Object(obj)
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        let same_kind = match (&self.kind, &other.kind) {
            (RuleKind::Simple(a), RuleKind::Simple(b)) => {
                a.type_label() == b.type_label() && a.properties() == b.properties()
            }
            (RuleKind::And(a), RuleKind::And(b)) | (RuleKind::Or(a), RuleKind::Or(b)) => a == b,
            (RuleKind::Not(a), RuleKind::Not(b)) => a == b,
            _ => false,
        };
        same_kind && self.sensitivity == other.sensitivity && self.name == other.name
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = |f: &mut fmt::Formatter<'_>, op: &str, components: &[Rule]| {
            write!(f, "{}(", op)?;
            for (i, component) in components.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", component)?;
            }
            write!(f, ")")
        };
        match &self.kind {
            RuleKind::Simple(rule) => write!(f, "{:?}", rule),
            RuleKind::And(components) => joined(f, "And", components),
            RuleKind::Or(components) => joined(f, "Or", components),
            RuleKind::Not(rule) => write!(f, "Not({})", rule),
        }
    }
}

/// What is left to evaluate: a decided outcome or a remaining rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    Decided(bool),
    Rule(Rule),
}

impl Continuation {
    pub fn decided(&self) -> Option<bool> {
        match self {
            Continuation::Decided(outcome) => Some(*outcome),
            Continuation::Rule(_) => None,
        }
    }
}

impl From<bool> for Continuation {
    fn from(outcome: bool) -> Self {
        Continuation::Decided(outcome)
    }
}

impl From<Rule> for Continuation {
    fn from(rule: Rule) -> Self {
        Continuation::Rule(rule)
    }
}
