use std::{collections::HashMap, fmt, str::FromStr};

use thiserror::Error;

use crate::verify::VerifiedIdentity;

/// The role that unlocks every rule.
pub const ROLE_ADMIN: &str = "ADMIN";

/// Decision
///
/// The outcome of evaluating a rule. There is no third state: anything that
/// is not an explicit `Allow` is a `Deny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }

    fn from_bool(allowed: bool) -> Self {
        if allowed { Decision::Allow } else { Decision::Deny }
    }
}

/// PolicyError
///
/// A caller asked for a rule the evaluator does not know. This is a wiring
/// bug, reported separately from a normal deny so it shows up in logs, but it
/// never grants access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("unknown authorization rule: {0}")]
    UnknownRule(String),
}

/// Rule
///
/// The authorization rules a route can be bound to. New shapes are added as
/// variants here and in `Rule::decide`; routes and middleware only ever pass a
/// `Rule` through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    /// Allow iff the caller holds `ADMIN`.
    AdminOnly,
    /// Allow iff the caller holds `ADMIN`, or is the subject the request
    /// targets.
    AdminOrSubject,
}

impl Rule {
    pub const ALL: [Rule; 2] = [Rule::AdminOnly, Rule::AdminOrSubject];

    pub fn name(self) -> &'static str {
        match self {
            Rule::AdminOnly => "AdminOnly",
            Rule::AdminOrSubject => "AdminOrSubject",
        }
    }

    fn decide(self, identity: &VerifiedIdentity, target: Option<&str>) -> Decision {
        let admin = identity.has_role(ROLE_ADMIN);
        match self {
            Rule::AdminOnly => Decision::from_bool(admin),
            Rule::AdminOrSubject => {
                Decision::from_bool(admin || target == Some(identity.subject.as_str()))
            }
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Rule {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rule::ALL
            .into_iter()
            .find(|rule| rule.name() == s)
            .ok_or_else(|| PolicyError::UnknownRule(s.to_string()))
    }
}

/// PolicyEvaluator
///
/// Pure decision function over (rule, identity, target). The registry maps
/// configured rule names to rules; it is built once at startup and only read
/// afterwards, so evaluation needs no synchronization.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    rules: HashMap<String, Rule>,
}

impl Default for PolicyEvaluator {
    fn default() -> Self {
        Self {
            rules: Rule::ALL
                .into_iter()
                .map(|rule| (rule.name().to_string(), rule))
                .collect(),
        }
    }
}

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `rule` under an additional name.
    pub fn with_rule(mut self, name: impl Into<String>, rule: Rule) -> Self {
        self.rules.insert(name.into(), rule);
        self
    }

    pub fn lookup(&self, name: &str) -> Result<Rule, PolicyError> {
        self.rules
            .get(name)
            .copied()
            .ok_or_else(|| PolicyError::UnknownRule(name.to_string()))
    }

    /// evaluate
    ///
    /// Role membership is exact and case-sensitive; subject comparison is
    /// plain string equality with no normalization.
    pub fn evaluate(
        &self,
        rule: Rule,
        identity: &VerifiedIdentity,
        target: Option<&str>,
    ) -> Decision {
        rule.decide(identity, target)
    }

    /// evaluate_named
    ///
    /// Resolves `name` through the registry first. An unregistered name is
    /// an `Err`, which callers must treat as deny.
    pub fn evaluate_named(
        &self,
        name: &str,
        identity: &VerifiedIdentity,
        target: Option<&str>,
    ) -> Result<Decision, PolicyError> {
        let rule = self.lookup(name)?;
        Ok(self.evaluate(rule, identity, target))
    }
}
