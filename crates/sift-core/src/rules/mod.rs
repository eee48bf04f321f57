//! Rules and rule sets.
//!
//! A [`Rule`] is built incrementally by the parser while it is open, then
//! closed exactly once when its [`RuleSet`] is linked: closing re-parents
//! its metadata register to the parent rule's register, folds constants in
//! every expression and re-parents the metadata of nested extracts and
//! calls to the rule's own register. A closed rule can no longer be
//! modified.

mod eval;
pub mod lexer;
mod parser;

pub use eval::Match;
pub use parser::RuleParser;

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::operator::OperatorRegistry;
use crate::register::Register;
use crate::value::Primitive;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Index of a rule inside its [`RuleSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub(crate) usize);

/// What a failing action does to the rest of the rule instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Record the failure and keep running the remaining actions
    #[default]
    Normal,
    /// Swallow the failure (it is only logged)
    Ignore,
    /// Like `Normal` on failure; on success skip the remaining actions
    StopRuleActions,
}

/// A side-effecting call run after a rule matched
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// The call expression
    pub expr: Expr,
    /// Failure handling
    pub mode: FailureMode,
}

/// A named set of variables, conditions and actions
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    source: String,
    meta: Arc<Register>,
    vars: IndexMap<String, Expr>,
    conditions: Vec<Expr>,
    actions: Vec<Action>,
    parent_name: Option<String>,
    parent: Option<RuleId>,
    children: Vec<RuleId>,
    closed: bool,
}

impl Rule {
    /// Creates an open rule declared in `source`
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            meta: Arc::new(Register::new()),
            vars: IndexMap::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            parent_name: None,
            parent: None,
            children: Vec::new(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::RuleClosed {
                rule: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Sets a metadata value
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Primitive>) -> Result<()> {
        self.ensure_open()?;
        Arc::make_mut(&mut self.meta).set(key, value);
        Ok(())
    }

    /// Declares a variable; names must be unique within the rule
    pub fn declare_var(&mut self, name: impl Into<String>, expr: Expr) -> Result<()> {
        self.ensure_open()?;
        let name = name.into();
        if self.vars.contains_key(&name) {
            return Err(Error::DuplicateVariable {
                rule: self.id.clone(),
                name,
            });
        }
        self.vars.insert(name, expr);
        Ok(())
    }

    /// Appends a condition
    pub fn add_condition(&mut self, expr: Expr) -> Result<()> {
        self.ensure_open()?;
        self.conditions.push(expr);
        Ok(())
    }

    /// Appends an action
    pub fn add_action(&mut self, expr: Expr, mode: FailureMode) -> Result<()> {
        self.ensure_open()?;
        self.actions.push(Action { expr, mode });
        Ok(())
    }

    /// Names the parent rule, resolved when the set is linked
    pub fn set_parent_name(&mut self, parent: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.parent_name = Some(parent.into());
        Ok(())
    }

    /// Rule id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the source the rule was declared in
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Metadata register, chained to the parent rule's once closed
    pub fn meta(&self) -> &Arc<Register> {
        &self.meta
    }

    /// Declared variables in declaration order
    pub fn vars(&self) -> &IndexMap<String, Expr> {
        &self.vars
    }

    /// Conditions in declaration order
    pub fn conditions(&self) -> &[Expr] {
        &self.conditions
    }

    /// Actions in declaration order
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Declared parent id
    pub fn parent_name(&self) -> Option<&str> {
        self.parent_name.as_deref()
    }

    /// Linked parent rule
    pub fn parent(&self) -> Option<RuleId> {
        self.parent
    }

    /// Linked child rules in declaration order
    pub fn children(&self) -> &[RuleId] {
        &self.children
    }

    /// Whether the rule has been closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Pass number from the `pass` metadata, 0 when unset
    pub fn pass(&self) -> i64 {
        self.meta
            .get_number("pass")
            .and_then(|n| i64::try_from(n.get()).ok())
            .unwrap_or(0)
    }

    /// Tags from the comma-separated `tag` metadata
    pub fn tags(&self) -> Vec<String> {
        self.meta
            .get_string("tag")
            .map(|raw| {
                String::from_utf8_lossy(raw)
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn close(&mut self, parent_meta: Option<Arc<Register>>) -> Result<()> {
        self.ensure_open()?;
        Arc::make_mut(&mut self.meta).set_parent(parent_meta);
        let meta = self.meta.clone();
        let finish = |expr: &Expr| -> Result<Expr> { Ok(expr.simplify()?.bind_metadata(&meta)) };

        for expr in self.vars.values_mut() {
            *expr = finish(expr)?;
        }
        for expr in &mut self.conditions {
            *expr = finish(expr)?;
        }
        for action in &mut self.actions {
            action.expr = finish(&action.expr)?;
        }
        self.closed = true;
        Ok(())
    }
}

/// All loaded rules, linked into a hierarchy
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    index: HashMap<String, RuleId>,
    roots: Vec<RuleId>,
    sources: IndexMap<String, Vec<RuleId>>,
}

impl RuleSet {
    /// Parses and links rules from a single string
    pub fn parse(
        source_name: &str,
        text: &str,
        operators: &OperatorRegistry,
    ) -> Result<RuleSet> {
        let mut parser = RuleParser::new(operators);
        parser.parse_str(source_name, text)?;
        parser.finish()
    }

    /// Parses and links rules from files
    pub fn load<P: AsRef<Path>>(paths: &[P], operators: &OperatorRegistry) -> Result<RuleSet> {
        let mut parser = RuleParser::new(operators);
        for path in paths {
            parser.parse_file(path.as_ref())?;
        }
        parser.finish()
    }

    /// Adds an open rule; ids must be unique across all sources
    pub fn insert(&mut self, rule: Rule) -> Result<RuleId> {
        if let Some(existing) = self.index.get(&rule.id) {
            return Err(Error::DuplicateRule {
                id: rule.id.clone(),
                first: self.rules[existing.0].source.clone(),
                second: rule.source.clone(),
            });
        }
        let id = RuleId(self.rules.len());
        self.index.insert(rule.id.clone(), id);
        self.sources.entry(rule.source.clone()).or_default().push(id);
        self.rules.push(rule);
        Ok(id)
    }

    /// Resolves parent names, then closes every rule parent-first.
    ///
    /// Forward references across sources are fine since nothing is
    /// resolved before every rule has been inserted.
    pub fn link(&mut self) -> Result<()> {
        for index in 0..self.rules.len() {
            let Some(name) = self.rules[index].parent_name.clone() else {
                self.roots.push(RuleId(index));
                continue;
            };
            let parent = *self.index.get(&name).ok_or_else(|| Error::UnknownParent {
                rule: self.rules[index].id.clone(),
                parent: name.clone(),
            })?;
            self.rules[index].parent = Some(parent);
            self.rules[parent.0].children.push(RuleId(index));
        }

        let mut queue: VecDeque<RuleId> = self.roots.iter().copied().collect();
        let mut closed = 0;
        while let Some(id) = queue.pop_front() {
            let parent_meta = self.rules[id.0].parent.map(|p| self.rules[p.0].meta.clone());
            self.rules[id.0].close(parent_meta)?;
            closed += 1;
            queue.extend(self.rules[id.0].children.iter().copied());
        }

        if closed < self.rules.len() {
            return Err(self.cycle_error());
        }
        debug!(rules = self.rules.len(), roots = self.roots.len(), "linked rule set");
        Ok(())
    }

    /// Names a rule on an inheritance cycle; only called when one exists
    fn cycle_error(&self) -> Error {
        let start = self
            .rules
            .iter()
            .position(|r| !r.closed)
            .unwrap_or_default();
        let mut seen = HashSet::new();
        let mut current = RuleId(start);
        while seen.insert(current) {
            match self.rules[current.0].parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Error::InheritanceCycle {
            rule: self.rules[current.0].id.clone(),
        }
    }

    /// Looks a rule up by id
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.index.get(id).map(|i| &self.rules[i.0])
    }

    /// Index of a rule id
    pub fn lookup(&self, id: &str) -> Option<RuleId> {
        self.index.get(id).copied()
    }

    /// The rule at `id`
    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0]
    }

    /// Rules without a parent, in declaration order
    pub fn roots(&self) -> &[RuleId] {
        &self.roots
    }

    /// All rules in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Each source with the rules it declared
    pub fn iter_sources(&self) -> impl Iterator<Item = (&str, &[RuleId])> {
        self.sources.iter().map(|(s, ids)| (s.as_str(), ids.as_slice()))
    }

    /// Top-level rules grouped by pass, passes ascending, declaration
    /// order within a pass
    pub fn passes(&self) -> BTreeMap<i64, Vec<RuleId>> {
        let mut passes: BTreeMap<i64, Vec<RuleId>> = BTreeMap::new();
        for &id in &self.roots {
            passes.entry(self.rules[id.0].pass()).or_default().push(id);
        }
        passes
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{BinaryOp, Number};

    fn rule(id: &str, parent: Option<&str>) -> Rule {
        let mut r = Rule::new(id, "test");
        if let Some(p) = parent {
            r.set_parent_name(p).unwrap();
        }
        r
    }

    #[test]
    fn test_duplicate_variable() {
        let mut r = rule("a", None);
        r.declare_var("x", Expr::number(1)).unwrap();
        assert!(matches!(
            r.declare_var("x", Expr::number(2)),
            Err(Error::DuplicateVariable { .. })
        ));
    }

    #[test]
    fn test_duplicate_rule() {
        let mut set = RuleSet::default();
        set.insert(Rule::new("a", "one.sift")).unwrap();
        match set.insert(Rule::new("a", "two.sift")) {
            Err(Error::DuplicateRule { first, second, .. }) => {
                assert_eq!(first, "one.sift");
                assert_eq!(second, "two.sift");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_link_forward_reference_and_children() {
        let mut set = RuleSet::default();
        set.insert(rule("child2", Some("root"))).unwrap();
        set.insert(rule("root", None)).unwrap();
        set.insert(rule("child1", Some("root"))).unwrap();
        set.link().unwrap();

        let root = set.lookup("root").unwrap();
        assert_eq!(set.roots(), &[root]);
        let names: Vec<_> = set
            .rule(root)
            .children()
            .iter()
            .map(|&c| set.rule(c).id())
            .collect();
        assert_eq!(names, vec!["child2", "child1"]);
        assert!(set.iter().all(Rule::is_closed));
    }

    #[test]
    fn test_unknown_parent() {
        let mut set = RuleSet::default();
        set.insert(rule("a", Some("missing"))).unwrap();
        assert!(matches!(set.link(), Err(Error::UnknownParent { .. })));
    }

    #[test]
    fn test_inheritance_cycle() {
        let mut set = RuleSet::default();
        set.insert(rule("root", None)).unwrap();
        set.insert(rule("a", Some("b"))).unwrap();
        set.insert(rule("b", Some("a"))).unwrap();
        assert!(matches!(set.link(), Err(Error::InheritanceCycle { .. })));
    }

    #[test]
    fn test_closed_rule_rejects_changes() {
        let mut set = RuleSet::default();
        set.insert(rule("a", None)).unwrap();
        set.link().unwrap();
        let mut closed = set.rule(RuleId(0)).clone();
        assert!(matches!(
            closed.add_condition(Expr::number(1)),
            Err(Error::RuleClosed { .. })
        ));
    }

    #[test]
    fn test_metadata_chain_and_folding() {
        let mut parent = rule("p", None);
        parent.set_meta("bigendian", false).unwrap();
        let mut child = rule("c", Some("p"));
        child
            .declare_var(
                "x",
                Expr::binary(BinaryOp::Add, Expr::number(100), Expr::number(51)),
            )
            .unwrap();

        let mut set = RuleSet::default();
        set.insert(parent).unwrap();
        set.insert(child).unwrap();
        set.link().unwrap();

        let c = set.get("c").unwrap();
        assert_eq!(c.meta().get_bool("bigendian"), Some(false));
        assert_eq!(c.vars()["x"], Expr::number(151));
    }

    #[test]
    fn test_passes_and_tags() {
        let mut late = rule("late", None);
        late.set_meta("pass", Number::literal(2)).unwrap();
        late.set_meta("tag", "elf, exec,").unwrap();
        let early = rule("early", None);

        let mut set = RuleSet::default();
        set.insert(late).unwrap();
        set.insert(early).unwrap();
        set.link().unwrap();

        let passes: Vec<_> = set.passes().into_iter().collect();
        assert_eq!(passes, vec![(0, vec![RuleId(1)]), (2, vec![RuleId(0)])]);
        assert_eq!(set.get("late").unwrap().tags(), vec!["elf", "exec"]);
    }
}
