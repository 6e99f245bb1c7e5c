use serde::Serialize;
use std::fmt;

/// Columns a tab advances by, both when lexing and when drawing carets.
pub const TAB_WIDTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Note,
    Help,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Note => "note",
            Severity::Help => "help",
        })
    }
}

/// A message anchored to a position in the source, rendered with the offending line and a caret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// 1-based
    pub line: usize,
    /// 1-based, tabs counted as [TAB_WIDTH] columns
    pub column: usize,
    /// The source line, verbatim.
    pub source_line: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: String, src: &str, line: usize, column: usize) -> Self {
        Diagnostic {
            severity,
            message,
            line,
            column,
            source_line: line_text(src, line).to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let number = self.line.to_string();
        let gutter = " ".repeat(number.len());
        let shown = self.source_line.replace('\t', &" ".repeat(TAB_WIDTH));
        let caret = " ".repeat(self.column.saturating_sub(1));

        writeln!(f, "{}: {}", self.severity, self.message)?;
        writeln!(f, " {} | {}", number, shown)?;
        write!(f, " {} | {}^", gutter, caret)
    }
}

/// The text of a 1-based line of `src`, without its terminator. Empty past the end.
pub fn line_text(src: &str, line: usize) -> &str {
    src.lines()
        .nth(line.saturating_sub(1))
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_caret_under_column() {
        let src = "func f() {\n  let x = $\n}";
        let d = Diagnostic::new(Severity::Error, "Invalid char '$'".into(), src, 2, 11);
        assert_eq!(
            d.to_string(),
            "error: Invalid char '$'\n 2 |   let x = $\n   |           ^"
        );
    }

    #[test]
    fn tabs_are_expanded_when_drawn() {
        let src = "\tx";
        let d = Diagnostic::new(Severity::Note, "here".into(), src, 1, 5);
        assert_eq!(d.to_string(), "note: here\n 1 |     x\n   |     ^");
    }

    #[test]
    fn missing_lines_are_empty() {
        assert_eq!(line_text("a\nb", 2), "b");
        assert_eq!(line_text("a\nb", 7), "");
    }
}
