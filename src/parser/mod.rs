/// Source positions, severities and caret rendering.
pub mod diagnostic;
/// Characters to tokens.
pub mod tokens;
mod syntax;

pub use diagnostic::{Diagnostic, Severity};

use crate::types::Ast;
use tokens::Token;

/// A problem found while parsing a statement or declaration. The parser turns these into
/// [Diagnostic]s and carries on from the next statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseErr {
    pub message: String,
    pub line: usize,
    pub column: usize,
    /// Extra notes/help anchored at the same position.
    pub notes: Vec<(Severity, String)>,
}

impl ParseErr {
    pub fn at(token: &Token, message: impl ToString) -> Self {
        ParseErr {
            message: message.to_string(),
            line: token.line,
            column: token.column,
            notes: vec![],
        }
    }

    pub fn with_note(mut self, severity: Severity, note: impl ToString) -> Self {
        self.notes.push((severity, note.to_string()));
        self
    }
}

/// Short hand for an `Err(ParseErr)` at a token, given the message and format args.
#[macro_export]
macro_rules! PErr {
    ($at:expr, $msg:expr) => {
        Err($crate::parser::ParseErr::at(&$at, $msg))
    };
    ($at:expr, $msg:expr, $($var:expr),+) => {
        Err($crate::parser::ParseErr::at(&$at, format!($msg, $($var),+)))
    }
}

/// Parse a whole program. The [Ast] is returned even when it is incomplete; check
/// [Ast::error_count] before using it.
pub fn parse_ast(input: &str) -> Ast {
    syntax::Parser::new(input).parse()
}

/// Parse a program, failing with every accumulated diagnostic if there were any errors.
pub fn parse(input: &str) -> Result<Ast, Vec<Diagnostic>> {
    let mut ast = parse_ast(input);
    if ast.error_count() > 0 {
        Err(ast.take_diagnostics())
    } else {
        Ok(ast)
    }
}
