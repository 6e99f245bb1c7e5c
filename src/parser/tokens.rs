use crate::parser::diagnostic::{Diagnostic, Severity, TAB_WIDTH};
use nom::{
    IResult,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::digit1,
    combinator::{map_res, recognize},
    error::{Error, ErrorKind},
    sequence::pair,
};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tap::Tap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TokenKind {
    Number(f64),
    Identifier(String),

    Plus,
    Minus,
    Multiply,
    Divide,
    Power,

    Assign,
    PlusEquals,
    MinusEquals,
    MultiplyEquals,
    DivideEquals,

    Greater,
    Smaller,
    GreaterEquals,
    SmallerEquals,

    OpenBracket,
    ClosedBracket,
    OpenCurly,
    ClosedCurly,
    Colon,
    Comma,
    Arrow,
    Newline,

    Func,
    Use,
    Return,
    Let,
    Var,
    If,
    Elif,
    Else,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Number(n) => return write!(f, "number {}", n),
            TokenKind::Identifier(s) => return write!(f, "identifier \"{}\"", s),
            TokenKind::Plus => "plus",
            TokenKind::Minus => "minus",
            TokenKind::Multiply => "multiply",
            TokenKind::Divide => "divide",
            TokenKind::Power => "power",
            TokenKind::Assign => "assign",
            TokenKind::PlusEquals => "plus equals",
            TokenKind::MinusEquals => "minus equals",
            TokenKind::MultiplyEquals => "multiply equals",
            TokenKind::DivideEquals => "divide equals",
            TokenKind::Greater => "greater",
            TokenKind::Smaller => "smaller",
            TokenKind::GreaterEquals => "greater equals",
            TokenKind::SmallerEquals => "smaller equals",
            TokenKind::OpenBracket => "open bracket",
            TokenKind::ClosedBracket => "closed bracket",
            TokenKind::OpenCurly => "open curly bracket",
            TokenKind::ClosedCurly => "closed curly bracket",
            TokenKind::Colon => "colon",
            TokenKind::Comma => "comma",
            TokenKind::Arrow => "arrow",
            TokenKind::Newline => "newline",
            TokenKind::Func => "keyword func",
            TokenKind::Use => "keyword use",
            TokenKind::Return => "keyword return",
            TokenKind::Let => "keyword let",
            TokenKind::Var => "keyword var",
            TokenKind::If => "keyword if",
            TokenKind::Elif => "keyword elif",
            TokenKind::Else => "keyword else",
            TokenKind::Eof => "end of file",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    /// 1-based
    pub line: usize,
    /// 1-based
    pub column: usize,
}

/// Operator spellings, longest first so the first match is the longest prefix.
static OPERATORS: [(&str, TokenKind); 25] = [
    ("**", TokenKind::Power),
    ("+=", TokenKind::PlusEquals),
    ("-=", TokenKind::MinusEquals),
    ("*=", TokenKind::MultiplyEquals),
    ("×=", TokenKind::MultiplyEquals),
    ("/=", TokenKind::DivideEquals),
    ("÷=", TokenKind::DivideEquals),
    (">=", TokenKind::GreaterEquals),
    ("<=", TokenKind::SmallerEquals),
    ("->", TokenKind::Arrow),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Multiply),
    ("×", TokenKind::Multiply),
    ("/", TokenKind::Divide),
    ("÷", TokenKind::Divide),
    ("=", TokenKind::Assign),
    (">", TokenKind::Greater),
    ("<", TokenKind::Smaller),
    ("(", TokenKind::OpenBracket),
    (")", TokenKind::ClosedBracket),
    ("{", TokenKind::OpenCurly),
    ("}", TokenKind::ClosedCurly),
    (":", TokenKind::Colon),
    (",", TokenKind::Comma),
];

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    HashMap::from([
        ("func", TokenKind::Func),
        ("use", TokenKind::Use),
        ("return", TokenKind::Return),
        ("let", TokenKind::Let),
        ("var", TokenKind::Var),
        ("if", TokenKind::If),
        ("elif", TokenKind::Elif),
        ("else", TokenKind::Else),
    ])
});

type LexRes<'a, O> = IResult<&'a str, O, Error<&'a str>>;

/// An integer-valued literal; every value is a double at runtime.
fn number(input: &str) -> LexRes<f64> {
    map_res(digit1, |digits: &str| digits.parse::<f64>())(input)
}

/// A letter or underscore followed by the longest alphanumeric/underscore run.
fn word(input: &str) -> LexRes<&str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn operator(input: &str) -> LexRes<TokenKind> {
    for (text, kind) in OPERATORS.iter() {
        if let Ok((rest, _)) = tag::<_, _, Error<&str>>(*text)(input) {
            return Ok((rest, kind.clone()));
        }
    }
    Err(nom::Err::Error(Error::new(input, ErrorKind::Tag)))
}

/// Converts source text into [Token]s on demand, tracking line and column.
pub struct Lexer<'a> {
    src: &'a str,
    rest: &'a str,
    line: usize,
    column: usize,
    /// Set once a token has been produced on the current line; tabs before that are indentation.
    line_started: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src,
            rest: src,
            line: 1,
            column: 1,
            line_started: false,
            diagnostics: vec![],
        }
    }

    /// The whole source being lexed.
    pub fn source(&self) -> &'a str {
        self.src
    }

    /// Lexical diagnostics produced since the last call.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Produce the next token. When `include_newline` is false, line breaks are skipped like
    /// any other whitespace. At the end of input this keeps returning [TokenKind::Eof].
    pub fn next_token(&mut self, include_newline: bool) -> Token {
        loop {
            let (line, column) = (self.line, self.column);
            let c = match self.rest.chars().next() {
                Some(c) => c,
                None => return Token { kind: TokenKind::Eof, line, column },
            };

            match c {
                ' ' | '\r' => self.advance(1),
                '\n' => {
                    self.advance(1);
                    if include_newline {
                        return Token { kind: TokenKind::Newline, line, column };
                    }
                }
                '\t' => {
                    if self.line_started {
                        self.error("Unexpected tab".to_string(), line, column);
                    }
                    self.advance(1);
                }
                '#' => {
                    // Comments run up to, not including, the newline
                    let len = self.rest.find('\n').unwrap_or(self.rest.len());
                    self.advance(len);
                }
                _ => match self.lex_one() {
                    Some((kind, len)) => {
                        self.line_started = true;
                        self.advance(len);
                        return Token { kind, line, column }
                            .tap(|t| log::trace!("{}:{} {}", t.line, t.column, t.kind));
                    }
                    None => {
                        self.error(format!("Invalid char '{}' ({})", c, c as u32), line, column);
                        self.advance(c.len_utf8());
                    }
                },
            }
        }
    }

    /// Recognise a single number, word or operator at the cursor, returning its byte length.
    fn lex_one(&self) -> Option<(TokenKind, usize)> {
        let input = self.rest;
        let consumed = |rest: &str| input.len() - rest.len();

        if let Ok((rest, n)) = number(input) {
            return Some((TokenKind::Number(n), consumed(rest)));
        }
        if let Ok((rest, w)) = word(input) {
            let kind = KEYWORDS
                .get(w)
                .cloned()
                .unwrap_or_else(|| TokenKind::Identifier(w.to_string()));
            return Some((kind, consumed(rest)));
        }
        operator(input)
            .ok()
            .map(|(rest, kind)| (kind, consumed(rest)))
    }

    /// Move the cursor over the next `len` bytes.
    fn advance(&mut self, len: usize) {
        let (skipped, rest) = self.rest.split_at(len);
        for c in skipped.chars() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.column = 1;
                    self.line_started = false;
                }
                '\t' => self.column += TAB_WIDTH,
                _ => self.column += 1,
            }
        }
        self.rest = rest;
    }

    fn error(&mut self, msg: String, line: usize, column: usize) {
        self.diagnostics
            .push(Diagnostic::new(Severity::Error, msg, self.src, line, column));
    }
}

/// Lex a whole string, up to and including the first [TokenKind::Eof].
pub fn tokenize(src: &str, include_newline: bool) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut lexer = Lexer::new(src);
    let mut tokens = vec![];
    loop {
        let t = lexer.next_token(include_newline);
        let done = t.kind == TokenKind::Eof;
        tokens.push(t);
        if done {
            break;
        }
    }
    (tokens, lexer.take_diagnostics())
}
