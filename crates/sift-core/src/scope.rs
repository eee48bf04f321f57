//! Per-rule-instance variable scopes.
//!
//! Each rule evaluation pushes a frame seeded with the rule's declared
//! variables as [`Binding::Unevaluated`]. Lookups walk from the innermost
//! frame outwards, so a child rule sees the resolved values of its parent
//! rule instance. A binding is marked [`Binding::InProgress`] while its
//! expression is being evaluated; meeting that marker again means the
//! variable depends on itself.

use crate::expr::Expr;
use crate::rules::RuleId;
use crate::value::Primitive;
use indexmap::IndexMap;

/// State of one variable in a scope frame
#[derive(Debug, Clone)]
pub enum Binding<'r> {
    /// Declared but not evaluated yet
    Unevaluated(&'r Expr),
    /// Currently being evaluated
    InProgress,
    /// Evaluated to a value
    Resolved(Primitive),
}

#[derive(Debug)]
struct Frame<'r> {
    rule: RuleId,
    bindings: IndexMap<String, Binding<'r>>,
}

/// Stack of frames, innermost last
#[derive(Debug, Default)]
pub struct Scope<'r> {
    frames: Vec<Frame<'r>>,
}

impl<'r> Scope<'r> {
    /// Creates an empty scope stack
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Pushes a frame for `rule`, seeded with its declared variables
    pub fn push<I>(&mut self, rule: RuleId, vars: I)
    where
        I: IntoIterator<Item = (&'r str, &'r Expr)>,
    {
        let bindings = vars
            .into_iter()
            .map(|(name, expr)| (name.to_string(), Binding::Unevaluated(expr)))
            .collect();
        self.frames.push(Frame { rule, bindings });
    }

    /// Pops the innermost frame, returning the rule it belonged to
    pub fn pop(&mut self) -> Option<RuleId> {
        self.frames.pop().map(|frame| frame.rule)
    }

    /// Rule owning the innermost frame
    pub fn current_rule(&self) -> Option<RuleId> {
        self.frames.last().map(|frame| frame.rule)
    }

    /// Number of active frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame is active
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Finds the innermost binding for `name`, with the index of its frame
    pub fn lookup(&self, name: &str) -> Option<(usize, &Binding<'r>)> {
        self.frames
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, frame)| frame.bindings.get(name).map(|b| (index, b)))
    }

    /// Convenience accessor for an already resolved value
    pub fn get(&self, name: &str) -> Option<&Primitive> {
        match self.lookup(name) {
            Some((_, Binding::Resolved(value))) => Some(value),
            _ => None,
        }
    }

    /// Writes a binding into the innermost frame; returns false without a frame
    pub fn set(&mut self, name: impl Into<String>, binding: Binding<'r>) -> bool {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.bindings.insert(name.into(), binding);
                true
            }
            None => false,
        }
    }

    /// Writes a binding into a specific frame, as returned by [`Scope::lookup`]
    pub(crate) fn set_at(&mut self, frame: usize, name: &str, binding: Binding<'r>) {
        if let Some(slot) = self
            .frames
            .get_mut(frame)
            .and_then(|frame| frame.bindings.get_mut(name))
        {
            *slot = binding;
        }
    }

    /// Flattens every resolved binding in the chain into a plain map.
    ///
    /// Outer frames come first in iteration order; when a name is bound in
    /// several frames the innermost value wins.
    pub fn extract(&self) -> IndexMap<String, Primitive> {
        let mut flat = IndexMap::new();
        for frame in &self.frames {
            for (name, binding) in &frame.bindings {
                if let Binding::Resolved(value) = binding {
                    flat.insert(name.clone(), value.clone());
                }
            }
        }
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Number;

    fn lit(n: u64) -> Expr {
        Expr::Value(Number::literal(n).into())
    }

    #[test]
    fn test_push_seeds_unevaluated() {
        let a = lit(1);
        let mut scope = Scope::new();
        scope.push(RuleId(0), [("a", &a)]);
        assert!(matches!(scope.lookup("a"), Some((0, Binding::Unevaluated(_)))));
        assert!(scope.get("a").is_none());
        assert_eq!(scope.current_rule(), Some(RuleId(0)));
    }

    #[test]
    fn test_inner_frame_shadows_outer() {
        let mut scope = Scope::new();
        scope.push(RuleId(0), std::iter::empty());
        scope.set("x", Binding::Resolved(Number::literal(1).into()));
        scope.push(RuleId(1), std::iter::empty());
        scope.set("x", Binding::Resolved(Number::literal(2).into()));
        scope.set("y", Binding::Resolved(Number::literal(3).into()));

        assert_eq!(scope.get("x"), Some(&Number::literal(2).into()));
        let flat = scope.extract();
        assert_eq!(flat.get("x"), Some(&Number::literal(2).into()));
        assert_eq!(flat.len(), 2);

        assert_eq!(scope.pop(), Some(RuleId(1)));
        assert_eq!(scope.get("x"), Some(&Number::literal(1).into()));
        assert!(scope.get("y").is_none());
    }

    #[test]
    fn test_extract_skips_unresolved() {
        let a = lit(1);
        let mut scope = Scope::new();
        scope.push(RuleId(0), [("a", &a)]);
        scope.set("b", Binding::InProgress);
        assert!(scope.extract().is_empty());
    }

    #[test]
    fn test_set_without_frame() {
        let mut scope = Scope::new();
        assert!(!scope.set("a", Binding::InProgress));
        assert!(scope.pop().is_none());
    }
}
