//! Evaluating one rule instance against the current file.
//!
//! A rule instance gets its own scope frame for the duration of the call.
//! Conditions run in order and the first false one rejects the rule
//! without running anything else. Once every condition holds, variables
//! no condition touched are forced so the match snapshot is complete,
//! the actions run, and finally each child rule is evaluated in a nested
//! frame.

use super::{FailureMode, Rule, RuleId};
use crate::env::Environment;
use crate::error::Result;
use crate::value::Primitive;
use indexmap::IndexMap;
use tracing::{debug, trace};

/// Result of a rule whose conditions all held against a file
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Matched rule
    pub rule: RuleId,
    /// Id of the matched rule
    pub id: String,
    /// Resolved variables of this rule and its ancestors
    pub vars: IndexMap<String, Primitive>,
    /// Matches of child rules
    pub children: Vec<Match>,
    /// Ids of child rules that did not match
    pub unmatched: Vec<String>,
}

impl Match {
    /// Whether no child rule matched
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// This match and all nested matches, depth first
    pub fn iter(&self) -> Vec<&Match> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.iter());
        }
        out
    }

    /// Matches without matched children
    pub fn leaves(&self) -> Vec<&Match> {
        self.iter().into_iter().filter(|m| m.is_leaf()).collect()
    }

    /// Finds a nested match by rule id
    pub fn find(&self, id: &str) -> Option<&Match> {
        self.iter().into_iter().find(|m| m.id == id)
    }
}

impl<'a> Environment<'a> {
    /// Evaluates `id` and its children against the current file.
    ///
    /// Returns `Ok(None)` when a condition is false and `Err` when a
    /// condition or a variable fails to evaluate. Action failures and
    /// child rule failures are recorded on the environment instead.
    pub fn evaluate_rule(&mut self, id: RuleId) -> Result<Option<Match>> {
        let rule = self.rules().rule(id);
        self.nested(|env| {
            env.scope_mut()
                .push(id, rule.vars().iter().map(|(name, expr)| (name.as_str(), expr)));
            let result = env.evaluate_in_scope(id, rule);
            env.scope_mut().pop();
            result
        })
    }

    fn evaluate_in_scope(&mut self, id: RuleId, rule: &'a Rule) -> Result<Option<Match>> {
        for condition in rule.conditions() {
            if !condition.evaluate(self)?.truthy()? {
                trace!(rule = rule.id(), %condition, "rejected");
                return Ok(None);
            }
        }
        for name in rule.vars().keys() {
            self.resolve(name)?;
        }
        let vars = self.scope().extract();
        debug!(rule = rule.id(), "matched");

        for action in rule.actions() {
            match action.expr.evaluate(self) {
                Ok(_) if action.mode == FailureMode::StopRuleActions => break,
                Ok(_) => {}
                Err(e) if action.mode == FailureMode::Ignore && !e.is_internal() => {
                    debug!(rule = rule.id(), error = %e, "ignored action failure");
                }
                Err(e) => self.record_failure(e),
            }
        }

        let mut children = Vec::new();
        let mut unmatched = Vec::new();
        for &child in rule.children() {
            match self.evaluate_rule(child) {
                Ok(Some(m)) => children.push(m),
                Ok(None) => unmatched.push(self.rules().rule(child).id().to_string()),
                Err(e) => {
                    unmatched.push(self.rules().rule(child).id().to_string());
                    self.record_rule_failure(Some(child), e);
                }
            }
        }

        Ok(Some(Match {
            rule: id,
            id: rule.id().to_string(),
            vars,
            children,
            unmatched,
        }))
    }
}
