//! Recursive-descent parser for rule sources.
//!
//! ```text
//! rule <id> [(<key>=<expr>, ...)] [: <parent>] {
//!     var <name> = <expr>;
//!     if <expr>;
//!     [ignore | stop] <Call>(<args>);
//! }
//! ```
//!
//! Binary operators are parsed by precedence climbing. From loosest to
//! tightest: `| || ^`, `& &&`, `== !=`, `< > <= >=`, `<< >>`, `+ -`,
//! `* / %`, then the unary prefixes `- + ~ !` and postfix slicing.

use super::lexer::{Lexer, Token, TokenKind};
use super::{FailureMode, Rule, RuleSet};
use crate::error::{Error, Result};
use crate::expr::{Expr, ExtractFormat};
use crate::operator::OperatorRegistry;
use crate::register::Register;
use crate::value::{BinaryOp, Number, Primitive, UnaryOp, Width};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Deepest allowed nesting of parentheses, prefixes, slices and calls
const MAX_NESTING: usize = 64;

/// Most nodes a single statement or constant may build
const MAX_NODES: usize = 256;

/// Accumulates rules from one or more sources into a [`RuleSet`]
pub struct RuleParser<'a> {
    operators: &'a OperatorRegistry,
    set: RuleSet,
}

impl<'a> RuleParser<'a> {
    /// Creates a parser that validates calls against `operators`
    pub fn new(operators: &'a OperatorRegistry) -> Self {
        Self {
            operators,
            set: RuleSet::default(),
        }
    }

    /// Parses rule text; `source_name` labels the rules and error messages
    pub fn parse_str(&mut self, source_name: &str, text: &str) -> Result<()> {
        let tokens = Lexer::new(source_name, text).tokenize()?;
        let mut parser = Parser {
            source_name,
            tokens,
            pos: 0,
            operators: self.operators,
            depth: 0,
            nodes: 0,
        };
        let mut count = 0;
        while !parser.at(&TokenKind::Eof) {
            let rule = parser.rule()?;
            self.set.insert(rule)?;
            count += 1;
        }
        debug!(source = source_name, rules = count, "parsed rule source");
        Ok(())
    }

    /// Reads and parses a rule file
    pub fn parse_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        self.parse_str(&path.display().to_string(), &text)
    }

    /// Links and closes everything parsed so far
    pub fn finish(mut self) -> Result<RuleSet> {
        self.set.link()?;
        Ok(self.set)
    }
}

struct Parser<'s> {
    source_name: &'s str,
    tokens: Vec<Token>,
    pos: usize,
    operators: &'s OperatorRegistry,
    depth: usize,
    nodes: usize,
}

/// Binding power and operator for a binary token
fn binary_op(kind: &TokenKind) -> Option<(BinaryOp, u8)> {
    let entry = match kind {
        TokenKind::Pipe => (BinaryOp::BitOr, 1),
        TokenKind::PipePipe => (BinaryOp::Or, 1),
        TokenKind::Caret => (BinaryOp::BitXor, 1),
        TokenKind::Amp => (BinaryOp::BitAnd, 2),
        TokenKind::AmpAmp => (BinaryOp::And, 2),
        TokenKind::EqEq => (BinaryOp::Eq, 3),
        TokenKind::Ne => (BinaryOp::Ne, 3),
        TokenKind::Lt => (BinaryOp::Lt, 4),
        TokenKind::Gt => (BinaryOp::Gt, 4),
        TokenKind::Le => (BinaryOp::Le, 4),
        TokenKind::Ge => (BinaryOp::Ge, 4),
        TokenKind::Shl => (BinaryOp::Shl, 5),
        TokenKind::Shr => (BinaryOp::Shr, 5),
        TokenKind::Plus => (BinaryOp::Add, 6),
        TokenKind::Minus => (BinaryOp::Sub, 6),
        TokenKind::Star => (BinaryOp::Mul, 7),
        TokenKind::Slash => (BinaryOp::Div, 7),
        TokenKind::Percent => (BinaryOp::Rem, 7),
        _ => return None,
    };
    Some(entry)
}

impl<'s> Parser<'s> {
    fn peek(&self) -> &Token {
        // The lexer always ends the stream with Eof, and `advance` never
        // moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> Error {
        let text = if token.kind == TokenKind::Eof {
            "<eof>".to_string()
        } else {
            token.text.clone()
        };
        Error::parse(self.source_name, token.line, token.column, text, message)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.at(&kind) {
            return Ok(self.advance());
        }
        Err(self.error_at(self.peek(), format!("expected '{kind}'")))
    }

    fn ident(&mut self, what: &str) -> Result<(String, Token)> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                Ok((name, self.advance()))
            }
            _ => Err(self.error_at(self.peek(), format!("expected {what}"))),
        }
    }

    /// Folds constants, attributing failures to `at`
    fn fold(&self, expr: Expr, at: &Token) -> Result<Expr> {
        match expr.simplify() {
            Ok(folded) => Ok(folded.into_owned()),
            Err(e) => Err(self.error_at(at, format!("cannot fold constant expression: {e}"))),
        }
    }

    /// Parses an expression that must fold to a literal
    fn constant(&mut self, what: &str) -> Result<Primitive> {
        let at = self.peek().clone();
        let expr = self.bounded_expr()?;
        match self.fold(expr, &at)? {
            Expr::Value(value) => Ok(value),
            _ => Err(self.error_at(&at, format!("{what} must be a constant"))),
        }
    }

    fn rule(&mut self) -> Result<Rule> {
        if !self.eat(&TokenKind::Rule) {
            return Err(self.error_at(self.peek(), "expected 'rule'"));
        }
        let (id, _) = self.ident("rule name")?;
        let mut rule = Rule::new(id, self.source_name);

        if self.eat(&TokenKind::LParen) {
            if !self.at(&TokenKind::RParen) {
                loop {
                    let (key, _) = self.ident("metadata key")?;
                    self.expect(TokenKind::Assign)?;
                    let value = self.constant("metadata value")?;
                    rule.set_meta(key, value)?;
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
        }

        if self.eat(&TokenKind::Colon) {
            let (parent, _) = self.ident("parent rule name")?;
            rule.set_parent_name(parent)?;
        }

        self.expect(TokenKind::LBrace)?;
        while !self.eat(&TokenKind::RBrace) {
            self.statement(&mut rule)?;
        }
        Ok(rule)
    }

    fn statement(&mut self, rule: &mut Rule) -> Result<()> {
        let start = self.peek().clone();
        match start.kind {
            TokenKind::Eof => return Err(self.error_at(&start, "expected '}'")),
            TokenKind::Var => {
                self.advance();
                let (name, _) = self.ident("variable name")?;
                self.expect(TokenKind::Assign)?;
                let at = self.peek().clone();
                let expr = self.bounded_expr()?;
                rule.declare_var(name, self.fold(expr, &at)?)?;
            }
            TokenKind::If => {
                self.advance();
                let at = self.peek().clone();
                let expr = self.bounded_expr()?;
                rule.add_condition(self.fold(expr, &at)?)?;
            }
            _ => {
                let mode = if self.eat(&TokenKind::Ignore) {
                    FailureMode::Ignore
                } else if self.eat(&TokenKind::Stop) {
                    FailureMode::StopRuleActions
                } else {
                    FailureMode::Normal
                };
                let at = self.peek().clone();
                let expr = self.bounded_expr()?;
                if !matches!(expr, Expr::Call { .. }) {
                    return Err(self.error_at(&at, "an action must be a function call"));
                }
                rule.add_action(self.fold(expr, &at)?, mode)?;
            }
        }
        self.expect(TokenKind::Semi)?;
        Ok(())
    }

    /// Parses an expression with a fresh node budget.
    ///
    /// Folding and evaluation recurse over the tree, so its size is
    /// capped here where the error can still point at rule text.
    fn bounded_expr(&mut self) -> Result<Expr> {
        let outer = std::mem::replace(&mut self.nodes, 0);
        let expr = self.expr();
        self.nodes = outer;
        expr
    }

    /// Counts one more node against the budget
    fn node(&mut self) -> Result<()> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(self.error_at(
                self.peek(),
                format!("expression has more than {MAX_NODES} nodes"),
            ));
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr> {
        self.binary(1)
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some((op, prec)) = binary_op(&self.peek().kind) {
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.binary(prec + 1)?;
            self.node()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.depth >= MAX_NESTING {
            return Err(self.error_at(self.peek(), "expression nested too deeply"));
        }
        self.depth += 1;
        let expr = self.unary_inner();
        self.depth -= 1;
        expr
    }

    fn unary_inner(&mut self) -> Result<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::Tilde => UnaryOp::BitNot,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        self.node()?;
        Ok(Expr::unary(op, operand))
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        while self.eat(&TokenKind::LBracket) {
            let start = self.expr()?;
            let end = if self.eat(&TokenKind::Colon) {
                Some(Box::new(self.expr()?))
            } else {
                None
            };
            self.expect(TokenKind::RBracket)?;
            self.node()?;
            expr = Expr::Slice {
                expr: Box::new(expr),
                start: Box::new(start),
                end,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        self.node()?;
        let token = self.advance();
        match &token.kind {
            TokenKind::Number(n) => Ok(Expr::number(*n)),
            TokenKind::Str(bytes) => Ok(Expr::Value(bytes.clone().into())),
            TokenKind::Char(c) => Ok(Expr::Value(
                Number::unsigned(u64::from(*c), Width::W1).into(),
            )),
            TokenKind::True => Ok(Expr::Value(Primitive::Bool(true))),
            TokenKind::False => Ok(Expr::Value(Primitive::Bool(false))),
            TokenKind::Special(name) => Ok(Expr::Variable(name.clone())),
            TokenKind::Ident(name) => {
                if self.at(&TokenKind::LParen) {
                    self.call(name.clone(), &token)
                } else {
                    Ok(Expr::Variable(name.clone()))
                }
            }
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBrace => self.byte_array(),
            _ => Err(self.error_at(&token, "expected an expression")),
        }
    }

    fn byte_array(&mut self) -> Result<Expr> {
        let mut bytes = Vec::new();
        if !self.at(&TokenKind::RBrace) {
            loop {
                let at = self.peek().clone();
                let value = self.constant("byte array element")?;
                let byte = value
                    .as_number()
                    .ok()
                    .and_then(|n| u8::try_from(n.get()).ok())
                    .ok_or_else(|| self.error_at(&at, "byte array element must be in 0..=255"))?;
                bytes.push(byte);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::Value(bytes.into()))
    }

    fn call(&mut self, name: String, at: &Token) -> Result<Expr> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        let mut meta = Register::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                let is_meta = matches!(self.peek().kind, TokenKind::Ident(_))
                    && *self.peek_at(1) == TokenKind::Assign;
                if is_meta {
                    let (key, _) = self.ident("metadata key")?;
                    self.advance();
                    let value = self.constant("metadata value")?;
                    meta.set(key, value);
                } else {
                    args.push(self.expr()?);
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;

        let width = match name.as_str() {
            "Byte" => Some(Width::W1),
            "Short" => Some(Width::W2),
            "Long" => Some(Width::W4),
            "Quad" => Some(Width::W8),
            _ => None,
        };
        let format = match name.as_str() {
            "String" => Some(ExtractFormat::String),
            "StringZ" => Some(ExtractFormat::StringZ),
            _ => None,
        };

        if let Some(width) = width {
            let [offset] = <[Expr; 1]>::try_from(args)
                .map_err(|_| self.error_at(at, format!("{name} takes one offset argument")))?;
            return Ok(Expr::extract_number(offset, width, meta));
        }
        if let Some(format) = format {
            let [offset, size] = <[Expr; 2]>::try_from(args).map_err(|_| {
                self.error_at(at, format!("{name} takes an offset and a length"))
            })?;
            return Ok(Expr::Extract {
                offset: Box::new(offset),
                size: Box::new(size),
                format,
                meta: Arc::new(meta),
            });
        }

        let op = self
            .operators
            .get(&name)
            .ok_or_else(|| self.error_at(at, format!("unknown function '{name}'")))?;
        let signature = op.signature();
        if !signature.accepts_arity(args.len()) {
            return Err(self.error_at(
                at,
                format!("{name} expects {signature} arguments, got {}", args.len()),
            ));
        }
        Ok(Expr::Call {
            name,
            args,
            meta: Arc::new(meta),
        })
    }
}
