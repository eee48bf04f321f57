//! Hand-written lexer for rule sources.

use crate::error::{Error, Result};
use std::fmt;

/// Token kinds of the rule language
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// `[A-Za-z_][A-Za-z0-9_]*`
    Ident(String),
    /// `$` followed by identifier characters
    Special(String),
    /// Integer literal
    Number(u64),
    /// Decoded string literal
    Str(Vec<u8>),
    /// Decoded character literal
    Char(u8),

    // Keywords
    /// `rule`
    Rule,
    /// `var`
    Var,
    /// `if`
    If,
    /// `true`
    True,
    /// `false`
    False,
    /// `ignore`
    Ignore,
    /// `stop`
    Stop,

    // Punctuation
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `,`
    Comma,
    /// `;`
    Semi,
    /// `:`
    Colon,
    /// `=`
    Assign,

    // Operators
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `&`
    Amp,
    /// `&&`
    AmpAmp,
    /// `|`
    Pipe,
    /// `||`
    PipePipe,
    /// `^`
    Caret,
    /// `~`
    Tilde,
    /// `!`
    Bang,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `==`
    EqEq,
    /// `!=`
    Ne,

    /// End of input
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) | TokenKind::Special(name) => f.write_str(name),
            TokenKind::Number(n) => write!(f, "{n}"),
            TokenKind::Str(_) => f.write_str("string literal"),
            TokenKind::Char(_) => f.write_str("character literal"),
            TokenKind::Eof => f.write_str("end of input"),
            other => f.write_str(punctuation(other)),
        }
    }
}

fn punctuation(kind: &TokenKind) -> &'static str {
    match kind {
        TokenKind::Rule => "rule",
        TokenKind::Var => "var",
        TokenKind::If => "if",
        TokenKind::True => "true",
        TokenKind::False => "false",
        TokenKind::Ignore => "ignore",
        TokenKind::Stop => "stop",
        TokenKind::LParen => "(",
        TokenKind::RParen => ")",
        TokenKind::LBrace => "{",
        TokenKind::RBrace => "}",
        TokenKind::LBracket => "[",
        TokenKind::RBracket => "]",
        TokenKind::Comma => ",",
        TokenKind::Semi => ";",
        TokenKind::Colon => ":",
        TokenKind::Assign => "=",
        TokenKind::Plus => "+",
        TokenKind::Minus => "-",
        TokenKind::Star => "*",
        TokenKind::Slash => "/",
        TokenKind::Percent => "%",
        TokenKind::Amp => "&",
        TokenKind::AmpAmp => "&&",
        TokenKind::Pipe => "|",
        TokenKind::PipePipe => "||",
        TokenKind::Caret => "^",
        TokenKind::Tilde => "~",
        TokenKind::Bang => "!",
        TokenKind::Shl => "<<",
        TokenKind::Shr => ">>",
        TokenKind::Lt => "<",
        TokenKind::Gt => ">",
        TokenKind::Le => "<=",
        TokenKind::Ge => ">=",
        TokenKind::EqEq => "==",
        TokenKind::Ne => "!=",
        _ => "?",
    }
}

/// A token with its source position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// What was read
    pub kind: TokenKind,
    /// 1-based line
    pub line: u32,
    /// 1-based column, in bytes
    pub column: u32,
    /// Source text of the token
    pub text: String,
}

/// Converts rule source text into tokens, failing on the first bad character
pub struct Lexer<'a> {
    source_name: &'a str,
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    line_start: usize,
}

impl<'a> Lexer<'a> {
    /// Creates a lexer for `text`; `source_name` is used in error messages
    pub fn new(source_name: &'a str, text: &'a str) -> Self {
        Self {
            source_name,
            text,
            bytes: text.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
        }
    }

    /// Tokenizes the whole input; the last token is always [`TokenKind::Eof`]
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let start = self.pos;
            let (line, column) = (self.line, self.column());
            let kind = match self.peek() {
                None => TokenKind::Eof,
                Some(_) => self.next_kind()?,
            };
            let done = kind == TokenKind::Eof;
            tokens.push(Token {
                kind,
                line,
                column,
                text: self.text[start..self.pos].to_string(),
            });
            if done {
                return Ok(tokens);
            }
        }
    }

    fn column(&self) -> u32 {
        (self.pos - self.line_start + 1) as u32
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(b)
    }

    fn error(&self, start: usize, message: impl Into<String>) -> Error {
        let end = (self.pos.max(start + 1)).min(self.text.len());
        let token = self.text.get(start..end).unwrap_or("");
        let column = (start.saturating_sub(self.line_start) + 1) as u32;
        Error::parse(self.source_name, self.line, column, token, message)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            while self.peek().map_or(false, |b| b.is_ascii_whitespace()) {
                self.advance();
            }
            match (self.peek(), self.peek_at(1)) {
                (Some(b'/'), Some(b'/')) => {
                    while self.peek().map_or(false, |b| b != b'\n') {
                        self.advance();
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.pos;
                    self.advance();
                    self.advance();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            (Some(_), _) => {
                                self.advance();
                            }
                            (None, _) => {
                                return Err(self.error(start, "unterminated block comment"))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_kind(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        let Some(b) = self.advance() else {
            return Ok(TokenKind::Eof);
        };
        let kind = match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                self.eat_ident_chars();
                keyword(&self.text[start..self.pos])
            }
            b'$' => {
                self.eat_ident_chars();
                if self.pos == start + 1 {
                    return Err(self.error(start, "expected a name after '$'"));
                }
                TokenKind::Special(self.text[start..self.pos].to_string())
            }
            b'0'..=b'9' => self.number(start)?,
            b'"' => self.string(start)?,
            b'\'' => self.char_literal(start)?,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semi,
            b':' => TokenKind::Colon,
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'^' => TokenKind::Caret,
            b'~' => TokenKind::Tilde,
            b'&' => self.pick(b'&', TokenKind::AmpAmp, TokenKind::Amp),
            b'|' => self.pick(b'|', TokenKind::PipePipe, TokenKind::Pipe),
            b'=' => self.pick(b'=', TokenKind::EqEq, TokenKind::Assign),
            b'!' => self.pick(b'=', TokenKind::Ne, TokenKind::Bang),
            b'<' => match self.peek() {
                Some(b'<') => self.pick(b'<', TokenKind::Shl, TokenKind::Lt),
                _ => self.pick(b'=', TokenKind::Le, TokenKind::Lt),
            },
            b'>' => match self.peek() {
                Some(b'>') => self.pick(b'>', TokenKind::Shr, TokenKind::Gt),
                _ => self.pick(b'=', TokenKind::Ge, TokenKind::Gt),
            },
            _ => {
                // Step over the whole UTF-8 character for the message.
                while self.peek().map_or(false, |b| b & 0xC0 == 0x80) {
                    self.advance();
                }
                return Err(self.error(start, "unexpected character"));
            }
        };
        Ok(kind)
    }

    fn pick(&mut self, next: u8, two: TokenKind, one: TokenKind) -> TokenKind {
        if self.peek() == Some(next) {
            self.advance();
            two
        } else {
            one
        }
    }

    fn eat_ident_chars(&mut self) {
        while self
            .peek()
            .map_or(false, |b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.advance();
        }
    }

    fn number(&mut self, start: usize) -> Result<TokenKind> {
        let radix = match (self.bytes[start], self.peek()) {
            (b'0', Some(b'x' | b'X')) => 16,
            (b'0', Some(b'o' | b'O')) => 8,
            (b'0', Some(b'b' | b'B')) => 2,
            _ => 10,
        };
        let digits_start = if radix == 10 {
            start
        } else {
            self.advance();
            self.pos
        };
        self.eat_ident_chars();
        let digits: String = self.text[digits_start..self.pos]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        if digits.is_empty() {
            return Err(self.error(start, "missing digits after radix prefix"));
        }
        u64::from_str_radix(&digits, radix)
            .map(TokenKind::Number)
            .map_err(|e| self.error(start, format!("invalid number literal: {e}")))
    }

    fn string(&mut self, start: usize) -> Result<TokenKind> {
        let mut out = Vec::new();
        loop {
            match self.advance() {
                None | Some(b'\n') => return Err(self.error(start, "unterminated string literal")),
                Some(b'"') => return Ok(TokenKind::Str(out)),
                Some(b'\\') => out.push(self.escape(start)?),
                Some(b) => out.push(b),
            }
        }
    }

    fn char_literal(&mut self, start: usize) -> Result<TokenKind> {
        let value = match self.advance() {
            None | Some(b'\n') | Some(b'\'') => {
                return Err(self.error(start, "empty or unterminated character literal"))
            }
            Some(b'\\') => self.escape(start)?,
            Some(b) if b.is_ascii() => b,
            Some(_) => return Err(self.error(start, "character literal must be ASCII")),
        };
        if self.advance() != Some(b'\'') {
            return Err(self.error(start, "unterminated character literal"));
        }
        Ok(TokenKind::Char(value))
    }

    /// Decodes the escape after a backslash
    fn escape(&mut self, start: usize) -> Result<u8> {
        let Some(b) = self.advance() else {
            return Err(self.error(start, "unterminated escape sequence"));
        };
        match b {
            b'\\' => Ok(b'\\'),
            b'"' => Ok(b'"'),
            b'\'' => Ok(b'\''),
            b't' => Ok(b'\t'),
            b'r' => Ok(b'\r'),
            b'n' => Ok(b'\n'),
            b'x' => {
                let hex = |b: Option<u8>| b.and_then(|b| (b as char).to_digit(16));
                match (hex(self.peek()), hex(self.peek_at(1))) {
                    (Some(hi), Some(lo)) => {
                        self.advance();
                        self.advance();
                        Ok((hi * 16 + lo) as u8)
                    }
                    _ => Err(self.error(start, "\\x escape needs two hex digits")),
                }
            }
            b'0'..=b'7' => {
                let mut value = u32::from(b - b'0');
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'7') => {
                            self.advance();
                            value = value * 8 + u32::from(d - b'0');
                        }
                        _ => break,
                    }
                }
                u8::try_from(value).map_err(|_| self.error(start, "octal escape out of range"))
            }
            _ => Err(self.error(start, format!("unknown escape '\\{}'", b as char))),
        }
    }
}

fn keyword(word: &str) -> TokenKind {
    match word {
        "rule" => TokenKind::Rule,
        "var" => TokenKind::Var,
        "if" => TokenKind::If,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "ignore" => TokenKind::Ignore,
        "stop" => TokenKind::Stop,
        _ => TokenKind::Ident(word.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(text: &str) -> Vec<TokenKind> {
        Lexer::new("test", text)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_rule_header() {
        assert_eq!(
            kinds("rule elf (tag=\"elf\") : base {"),
            vec![
                TokenKind::Rule,
                TokenKind::Ident("elf".into()),
                TokenKind::LParen,
                TokenKind::Ident("tag".into()),
                TokenKind::Assign,
                TokenKind::Str(b"elf".to_vec()),
                TokenKind::RParen,
                TokenKind::Colon,
                TokenKind::Ident("base".into()),
                TokenKind::LBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("0x7f 0o17 0b1010 1_000 0"),
            vec![
                TokenKind::Number(0x7f),
                TokenKind::Number(0o17),
                TokenKind::Number(0b1010),
                TokenKind::Number(1000),
                TokenKind::Number(0),
                TokenKind::Eof,
            ]
        );
        assert!(Lexer::new("t", "0x").tokenize().is_err());
        assert!(Lexer::new("t", "99999999999999999999999").tokenize().is_err());
        assert!(Lexer::new("t", "12ab").tokenize().is_err());
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\\b\t\r\n\"\x41\101\0""#),
            vec![
                TokenKind::Str(b"a\\b\t\r\n\"AA\0".to_vec()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_char_literals() {
        assert_eq!(
            kinds(r"'a' '\n' '\x42'"),
            vec![
                TokenKind::Char(b'a'),
                TokenKind::Char(b'\n'),
                TokenKind::Char(b'B'),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("<< >> <= >= == != && || < > ! ~ ^"),
            vec![
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::EqEq,
                TokenKind::Ne,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Bang,
                TokenKind::Tilde,
                TokenKind::Caret,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_specials() {
        assert_eq!(
            kinds("// line\n$filesize /* block\n */ stop"),
            vec![
                TokenKind::Special("$filesize".into()),
                TokenKind::Stop,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("t", "rule a {\n  var x = 1;\n}").tokenize().unwrap();
        let var = &tokens[3];
        assert_eq!(var.kind, TokenKind::Var);
        assert_eq!((var.line, var.column), (2, 3));
        assert_eq!(var.text, "var");
    }

    #[test]
    fn test_error_position() {
        let err = Lexer::new("rules.sift", "rule a {\n  @\n}").tokenize().unwrap_err();
        match err {
            Error::Parse {
                line, column, token, ..
            } => {
                assert_eq!((line, column), (2, 3));
                assert_eq!(token, "@");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
