//! Indentation-aware tokenizer.

use crate::errors::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Int(i64),
    Float(f64),
    Imaginary(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Operators and delimiters.
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

/// Longest operators first so that greedy matching picks them.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "->", "**", "//", "<<", ">>", "<=", ">=", "==", "!=", "+=", "-=",
    "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@", "&", "|", "^", "~",
    "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=",
];

const TAB_SIZE: usize = 8;

struct Tokenizer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    line_start: usize,
    indents: Vec<usize>,
    /// Open brackets; newlines inside them are insignificant.
    depth: usize,
    tokens: Vec<Spanned>,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
            indents: vec![0],
            depth: 0,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(ch)
    }

    fn column(&self) -> usize {
        self.pos - self.line_start + 1
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.line, self.column(), message)
    }

    fn push(&mut self, token: Token, line: usize, column: usize) {
        self.tokens.push(Spanned {
            token,
            line,
            column,
        });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.token),
            None | Some(Token::Newline | Token::Indent | Token::Dedent)
        )
    }

    /// Measures the indentation of the line starting at `pos` and emits
    /// indent/dedent tokens. Blank and comment-only lines are skipped.
    fn handle_line_start(&mut self) -> Result<(), SyntaxError> {
        loop {
            let mut width = 0;
            while let Some(ch) = self.peek() {
                match ch {
                    b' ' => width += 1,
                    b'\t' => width = (width / TAB_SIZE + 1) * TAB_SIZE,
                    b'\x0c' => width = 0,
                    _ => break,
                }
                self.pos += 1;
            }
            match self.peek() {
                None => return Ok(()),
                Some(b'#') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.pos += 1;
                    }
                    self.advance();
                }
                Some(b'\n') | Some(b'\r') => {
                    if self.peek() == Some(b'\r') {
                        self.pos += 1;
                    }
                    self.advance();
                }
                Some(_) => return self.apply_indent(width),
            }
        }
    }

    fn apply_indent(&mut self, width: usize) -> Result<(), SyntaxError> {
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Token::Indent, self.line, 1);
        } else if width < current {
            while self.indents.last().is_some_and(|&top| top > width) {
                self.indents.pop();
                self.push(Token::Dedent, self.line, 1);
            }
            if self.indents.last() != Some(&width) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(())
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn read_digits(&mut self, radix: u32, out: &mut String) {
        while let Some(ch) = self.peek() {
            if ch == b'_' {
                self.pos += 1;
            } else if char::from(ch).is_digit(radix) {
                out.push(char::from(ch));
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, SyntaxError> {
        let radix = match (self.peek(), self.peek_at(1)) {
            (Some(b'0'), Some(b'x' | b'X')) => 16,
            (Some(b'0'), Some(b'o' | b'O')) => 8,
            (Some(b'0'), Some(b'b' | b'B')) => 2,
            _ => 10,
        };
        let mut digits = String::new();
        if radix != 10 {
            self.pos += 2;
            self.read_digits(radix, &mut digits);
            if digits.is_empty() {
                return Err(self.error("invalid number literal"));
            }
            return i64::from_str_radix(&digits, radix)
                .map(Token::Int)
                .map_err(|_| self.error("integer literal too large"));
        }

        self.read_digits(10, &mut digits);
        let mut is_float = false;
        if self.peek() == Some(b'.') {
            is_float = true;
            digits.push('.');
            self.pos += 1;
            self.read_digits(10, &mut digits);
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let sign = self.peek_at(1);
            let exponent_start = if matches!(sign, Some(b'+' | b'-')) { 2 } else { 1 };
            if self.peek_at(exponent_start).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                digits.push('e');
                if let Some(sign @ (b'+' | b'-')) = sign {
                    digits.push(char::from(sign));
                }
                self.pos += exponent_start;
                self.read_digits(10, &mut digits);
            }
        }
        if matches!(self.peek(), Some(b'j' | b'J')) {
            self.pos += 1;
            return digits
                .parse::<f64>()
                .map(Token::Imaginary)
                .map_err(|_| self.error("invalid imaginary literal"));
        }
        if self.peek().is_some_and(|c| c.is_ascii_alphabetic() || c == b'_') {
            return Err(self.error("invalid decimal literal"));
        }
        if is_float {
            return digits
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| self.error("invalid float literal"));
        }
        if digits.len() > 1 && digits.starts_with('0') && digits.bytes().any(|c| c != b'0') {
            return Err(self.error("leading zeros in decimal integer literals are not permitted"));
        }
        digits
            .parse::<i64>()
            .map(Token::Int)
            .map_err(|_| self.error("integer literal too large"))
    }

    fn read_string(&mut self, raw: bool) -> Result<Vec<u8>, SyntaxError> {
        let quote = self.peek().ok_or_else(|| self.error("unterminated string"))?;
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let mut out = Vec::new();
        loop {
            let ch = self
                .advance()
                .ok_or_else(|| self.error("unterminated string literal"))?;
            match ch {
                c if c == quote => {
                    if !triple {
                        return Ok(out);
                    }
                    if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                        self.pos += 2;
                        return Ok(out);
                    }
                    out.push(c);
                }
                b'\n' if !triple => return Err(self.error("unterminated string literal")),
                b'\\' if !raw => {
                    let escaped = self
                        .advance()
                        .ok_or_else(|| self.error("unterminated string literal"))?;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'0' => out.push(0),
                        b'\\' => out.push(b'\\'),
                        b'\'' => out.push(b'\''),
                        b'"' => out.push(b'"'),
                        b'\n' => {}
                        b'x' => {
                            let hex: Vec<u8> = (0..2).filter_map(|_| self.advance()).collect();
                            let value = std::str::from_utf8(&hex)
                                .ok()
                                .and_then(|h| u8::from_str_radix(h, 16).ok())
                                .ok_or_else(|| self.error("truncated \\xXX escape"))?;
                            out.push(value);
                        }
                        other => {
                            out.push(b'\\');
                            out.push(other);
                        }
                    }
                }
                c => out.push(c),
            }
        }
    }

    /// String or bytes literal, possibly with an `r`/`b` prefix already read
    /// into `prefix`.
    fn read_string_literal(&mut self, prefix: &str) -> Result<Token, SyntaxError> {
        let lower = prefix.to_ascii_lowercase();
        if !matches!(lower.as_str(), "" | "r" | "b" | "br" | "rb" | "u") {
            return Err(self.error(format!("unsupported string prefix {prefix:?}")));
        }
        let raw = lower.contains('r');
        let bytes = self.read_string(raw)?;
        if lower.contains('b') {
            return Ok(Token::Bytes(bytes));
        }
        String::from_utf8(bytes)
            .map(Token::Str)
            .map_err(|_| self.error("invalid utf-8 in string literal"))
    }

    fn read_operator(&mut self) -> Result<Token, SyntaxError> {
        let rest = &self.input[self.pos..];
        let op = OPERATORS
            .iter()
            .find(|op| rest.starts_with(op.as_bytes()))
            .copied()
            .ok_or_else(|| {
                let ch = self.peek().map(char::from).unwrap_or('?');
                self.error(format!("invalid character '{ch}'"))
            })?;
        self.pos += op.len();
        match op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => {
                self.depth = self
                    .depth
                    .checked_sub(1)
                    .ok_or_else(|| self.error(format!("unmatched '{op}'")))?;
            }
            _ => {}
        }
        Ok(Token::Op(op))
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, SyntaxError> {
        self.handle_line_start()?;
        loop {
            let (line, column) = (self.line, self.column());
            let Some(ch) = self.peek() else {
                break;
            };
            match ch {
                b' ' | b'\t' | b'\x0c' | b'\r' => {
                    self.pos += 1;
                }
                b'#' => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.pos += 1;
                    }
                }
                b'\\' if matches!(self.peek_at(1), Some(b'\n')) => {
                    self.pos += 1;
                    self.advance();
                }
                b'\n' => {
                    self.advance();
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(Token::Newline, line, column);
                        }
                        self.handle_line_start()?;
                    }
                }
                b'\'' | b'"' => {
                    let token = self.read_string_literal("")?;
                    self.push(token, line, column);
                }
                c if c.is_ascii_digit()
                    || (c == b'.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) =>
                {
                    let token = self.read_number()?;
                    self.push(token, line, column);
                }
                c if c.is_ascii_alphabetic() || c == b'_' => {
                    let name = self.read_name();
                    if matches!(self.peek(), Some(b'\'' | b'"')) && name.len() <= 2 {
                        let token = self.read_string_literal(&name)?;
                        self.push(token, line, column);
                    } else {
                        self.push(Token::Name(name), line, column);
                    }
                }
                c if c >= 0x80 => return Err(self.error("non-ascii identifiers are not supported")),
                _ => {
                    let token = self.read_operator()?;
                    self.push(token, line, column);
                }
            }
        }
        if self.depth > 0 {
            return Err(self.error("unexpected EOF inside brackets"));
        }
        let (line, column) = (self.line, self.column());
        if !self.last_is_newline() {
            self.push(Token::Newline, line, column);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Token::Dedent, line, column);
        }
        self.push(Token::Eof, line, column);
        Ok(self.tokens)
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, SyntaxError> {
    Tokenizer::new(source).tokenize()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            tokens("x = 1"),
            vec![
                Token::Name("x".into()),
                Token::Op("="),
                Token::Int(1),
                Token::Newline,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let toks = tokens("def f():\n  return 1\n\n# comment\nx\n");
        assert!(toks.contains(&Token::Indent));
        let indent = toks.iter().position(|t| *t == Token::Indent).unwrap();
        let dedent = toks.iter().position(|t| *t == Token::Dedent).unwrap();
        assert!(indent < dedent);
        assert_eq!(toks[dedent + 1], Token::Name("x".into()));
    }

    #[test]
    fn test_inconsistent_dedent_is_error() {
        let err = tokenize("if x:\n    y\n  z\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_brackets_join_lines() {
        let toks = tokens("x = (1,\n     2)\n");
        assert_eq!(toks.iter().filter(|t| **t == Token::Newline).count(), 1);
        assert!(!toks.contains(&Token::Indent));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("0x1f 1_000 2.5 1e3 3j .5")[..6],
            [
                Token::Int(31),
                Token::Int(1000),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Imaginary(3.0),
                Token::Float(0.5),
            ]
        );
        assert!(tokenize("99999999999999999999").is_err());
        assert!(tokenize("012").is_err());
    }

    #[test]
    fn test_strings() {
        assert_eq!(
            tokens(r#"'a\n' "b" r'\n' b'\x41' '''x'y'''"#)[..5],
            [
                Token::Str("a\n".into()),
                Token::Str("b".into()),
                Token::Str("\\n".into()),
                Token::Bytes(vec![0x41]),
                Token::Str("x'y".into()),
            ]
        );
        assert!(tokenize("'open").is_err());
    }

    #[test]
    fn test_operators_are_greedy() {
        assert_eq!(
            tokens("a **= b // c != d")[..7],
            [
                Token::Name("a".into()),
                Token::Op("**="),
                Token::Name("b".into()),
                Token::Op("//"),
                Token::Name("c".into()),
                Token::Op("!="),
                Token::Name("d".into()),
            ]
        );
    }

    #[test]
    fn test_unbalanced_brackets() {
        assert!(tokenize("f(").is_err());
        assert!(tokenize(")").is_err());
        assert!(tokenize("x $ y").is_err());
    }
}
