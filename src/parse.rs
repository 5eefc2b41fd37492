//! Input syntax: dotted quads, inclusive ranges and CIDR blocks.
//!
//! ```text
//! 10.0.0.1                      single address
//! 10.0.0.1 - 10.0.0.4           inclusive range
//! 192.168.0.0/16                CIDR block
//! ```
//!
//! Items are separated by whitespace, which may also surround `-` and `/`
//! but never appears inside a dotted quad or a width. A malformed item is
//! reported once, with its line number, and skipped; parsing resumes at the
//! next item.

use thiserror::Error;

use crate::{Block, MAX_PREFIX_LEN};

/// One well-formed input item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    Address(u32),
    /// Inclusive, `lo <= hi`.
    Range(u32, u32),
    Cidr(Block),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("out-of-range number in input")]
    OutOfRangeNumber,

    #[error("out-of-range width in input")]
    OutOfRangeWidth,

    #[error("{0} at an inappropriate place")]
    Misplaced(char),

    #[error("incomplete dotted quad")]
    IncompleteAddress,

    #[error("EOF at an inappropriate place")]
    UnexpectedEof,

    #[error("invalid character {0:?} in input")]
    InvalidCharacter(char),

    #[error("invalid range (ends reversed)")]
    ReversedRange,
}

/// A malformed item, tagged with the 1-based line it was detected on.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    fn new(line: usize, kind: ParseErrorKind) -> Self {
        Self { line, kind }
    }
}

/// Iterate over the items of `input`.
pub fn parse(input: &str) -> Parser<'_> {
    Parser::new(input)
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lexeme<'a> {
    /// Maximal run of bytes that are neither whitespace, `-` nor `/`.
    Word(&'a str),
    Dash,
    Slash,
}

impl Lexeme<'_> {
    fn is_operator(self) -> bool {
        !matches!(self, Lexeme::Word(_))
    }

    fn operator_char(self) -> char {
        match self {
            Lexeme::Dash => '-',
            Lexeme::Slash => '/',
            Lexeme::Word(_) => unreachable!("words are not operators"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Token<'a> {
    lexeme: Lexeme<'a>,
    line: usize,
    /// Whitespace (or start of input) precedes this token.
    spaced: bool,
}

#[inline]
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            line: 1,
        }
    }

    fn next_token(&mut self) -> Option<Token<'a>> {
        let bytes = self.input.as_bytes();
        let start = self.pos;
        while self.pos < bytes.len() && is_space(bytes[self.pos]) {
            if bytes[self.pos] == b'\n' {
                self.line += 1;
            }
            self.pos += 1;
        }
        let spaced = start == 0 || self.pos > start;
        let b = *bytes.get(self.pos)?;

        let lexeme = match b {
            b'-' => {
                self.pos += 1;
                Lexeme::Dash
            }
            b'/' => {
                self.pos += 1;
                Lexeme::Slash
            }
            _ => {
                let word_start = self.pos;
                while self.pos < bytes.len()
                    && !is_space(bytes[self.pos])
                    && !matches!(bytes[self.pos], b'-' | b'/')
                {
                    self.pos += 1;
                }
                // Delimiters are ASCII, so both ends sit on char boundaries.
                Lexeme::Word(&self.input[word_start..self.pos])
            }
        };

        Some(Token {
            lexeme,
            line: self.line,
            spaced,
        })
    }
}

// =============================================================================
// Words
// =============================================================================

fn parse_quad(word: &str) -> Result<u32, ParseErrorKind> {
    let mut addr = 0u32;
    let mut parts = 0;
    for part in word.split('.') {
        parts += 1;
        if parts > 4 || part.is_empty() {
            return Err(ParseErrorKind::Misplaced('.'));
        }
        if let Some(c) = part.chars().find(|c| !c.is_ascii_digit()) {
            return Err(ParseErrorKind::InvalidCharacter(c));
        }
        let octet = parse_bounded(part, 255).ok_or(ParseErrorKind::OutOfRangeNumber)?;
        addr = (addr << 8) | octet;
    }
    if parts < 4 {
        return Err(ParseErrorKind::IncompleteAddress);
    }
    Ok(addr)
}

fn quad_at(word: &str, line: usize) -> Result<u32, ParseError> {
    parse_quad(word).map_err(|kind| ParseError::new(line, kind))
}

fn parse_width(word: &str) -> Result<u8, ParseErrorKind> {
    if let Some(c) = word.chars().find(|c| !c.is_ascii_digit()) {
        return Err(match c {
            '.' => ParseErrorKind::Misplaced('.'),
            c => ParseErrorKind::InvalidCharacter(c),
        });
    }
    let width = parse_bounded(word, u32::from(MAX_PREFIX_LEN))
        .ok_or(ParseErrorKind::OutOfRangeWidth)?;
    Ok(width as u8)
}

/// Decimal value of an all-digit string, or `None` once it passes `max`.
fn parse_bounded(digits: &str, max: u32) -> Option<u32> {
    digits.bytes().try_fold(0u32, |n, b| {
        let n = n * 10 + u32::from(b - b'0');
        (n <= max).then_some(n)
    })
}

// =============================================================================
// Parser
// =============================================================================

/// Iterator over the items of an input text.
///
/// Yields `Ok` for every well-formed item and one `Err` per malformed item.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<Token<'a>>,
    /// The last token consumed was `-` or `/`.
    after_operator: bool,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            lexer: Lexer::new(input),
            peeked: None,
            after_operator: false,
        }
    }

    fn peek(&mut self) -> Option<Token<'a>> {
        if self.peeked.is_none() {
            self.peeked = self.lexer.next_token();
        }
        self.peeked
    }

    fn bump(&mut self) -> Option<Token<'a>> {
        let tok = self.peeked.take().or_else(|| self.lexer.next_token());
        if let Some(tok) = tok {
            self.after_operator = tok.lexeme.is_operator();
        }
        tok
    }

    /// Skip the rest of a malformed item: everything up to the next word that
    /// is not the operand of a `-` or `/`.
    fn recover(&mut self) {
        while let Some(tok) = self.peek() {
            if !tok.lexeme.is_operator() && !self.after_operator {
                break;
            }
            self.bump();
        }
    }

    fn item(&mut self, first: Token<'a>, word: &'a str) -> Result<Entry, ParseError> {
        let op = match self.peek() {
            Some(tok) if tok.lexeme.is_operator() => self.bump(),
            _ => None,
        };
        let Some(op) = op else {
            return quad_at(word, first.line).map(Entry::Address);
        };

        let (second, second_line) = match self.bump() {
            Some(Token {
                lexeme: Lexeme::Word(w),
                line,
                ..
            }) => (w, line),
            Some(tok) => {
                return Err(ParseError::new(
                    tok.line,
                    ParseErrorKind::Misplaced(tok.lexeme.operator_char()),
                ))
            }
            None => {
                return Err(ParseError::new(
                    self.lexer.line,
                    ParseErrorKind::UnexpectedEof,
                ))
            }
        };

        let entry = match op.lexeme {
            Lexeme::Dash => {
                let lo = quad_at(word, first.line)?;
                let hi = quad_at(second, second_line)?;
                if lo > hi {
                    return Err(ParseError::new(
                        second_line,
                        ParseErrorKind::ReversedRange,
                    ));
                }
                Entry::Range(lo, hi)
            }
            _ => {
                let addr = quad_at(word, first.line)?;
                let width =
                    parse_width(second).map_err(|kind| ParseError::new(second_line, kind))?;
                Entry::Cidr(Block::new(addr, width))
            }
        };

        // `a-b/24` and friends: an operator glued onto a complete item.
        if let Some(tok) = self.peek() {
            if tok.lexeme.is_operator() && !tok.spaced {
                return Err(ParseError::new(
                    tok.line,
                    ParseErrorKind::Misplaced(tok.lexeme.operator_char()),
                ));
            }
        }
        Ok(entry)
    }
}

impl<'a> Iterator for Parser<'a> {
    type Item = Result<Entry, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let tok = self.bump()?;
        let Lexeme::Word(word) = tok.lexeme else {
            // A stray operator is dropped on its own; the next word starts
            // a fresh item.
            self.after_operator = false;
            return Some(Err(ParseError::new(
                tok.line,
                ParseErrorKind::Misplaced(tok.lexeme.operator_char()),
            )));
        };
        let result = self.item(tok, word);
        if result.is_err() {
            self.recover();
        }
        Some(result)
    }
}

impl std::iter::FusedIterator for Parser<'_> {}
