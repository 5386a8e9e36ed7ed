//! Source spans, phase errors and the diagnostics handed to the host

use std::fmt;

use thiserror::Error;

/// A region of source text. Lines and columns are 1-based, `end_col` is exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    pub fn new(line: usize, start_col: usize, end_col: usize) -> Self {
        Self { line, start_col, end_line: line, end_col }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        let (start_line, start_col) = (self.line, self.start_col).min((other.line, other.start_col));
        let (end_line, end_col) = (self.end_line, self.end_col).max((other.end_line, other.end_col));
        Span { line: start_line, start_col, end_line, end_col }
    }

    pub fn is_single_line(&self) -> bool {
        self.line == self.end_line
    }

    /// Source text covered by the span, clipped to its first line.
    pub fn excerpt(&self, source: &str) -> String {
        let Some(text) = source.lines().nth(self.line.saturating_sub(1)) else {
            return String::new();
        };
        let start = self.start_col.saturating_sub(1);
        let take = if self.is_single_line() {
            self.end_col.saturating_sub(self.start_col)
        } else {
            usize::MAX
        };
        text.chars().skip(start).take(take).collect()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.start_col)
    }
}

/// Pipeline phase that produced a diagnostic
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Lexical,
    Syntax,
    Runtime,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Lexical => "lexical",
            Phase::Syntax => "syntax",
            Phase::Runtime => "runtime",
        })
    }
}

/// Structured report of a fault, ready for display by the editor.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub phase: Phase,
    pub span: Span,
    pub lexeme: String,
    pub message: String,
}

impl Diagnostic {
    pub fn line(&self) -> usize {
        self.span.line
    }

    pub fn col(&self) -> usize {
        self.span.start_col
    }

    /// Message followed by the offending source line and a caret underline.
    pub fn render(&self, source: &str) -> String {
        let mut out = self.to_string();
        if let Some(text) = source.lines().nth(self.span.line.saturating_sub(1)) {
            let gutter = format!("{} | ", self.span.line);
            let width = if self.span.is_single_line() {
                self.span.end_col.saturating_sub(self.span.start_col).max(1)
            } else {
                text.chars().count().saturating_sub(self.span.start_col.saturating_sub(1)).max(1)
            };
            out.push('\n');
            out.push_str(&gutter);
            out.push_str(text);
            out.push('\n');
            out.push_str(&" ".repeat(gutter.len() + self.span.start_col.saturating_sub(1)));
            out.push_str(&"^".repeat(width));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} error: {}", self.span, self.phase, self.message)
    }
}

/// Lexical fault kinds
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LexErrorKind {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("malformed number literal '{0}'")]
    MalformedNumber(String),
    #[error("unknown escape sequence '\\{0}'")]
    UnknownEscape(char),
    #[error("unterminated block comment")]
    UnterminatedComment,
}

#[derive(Clone, Debug, PartialEq, Error)]
#[error("{kind}")]
pub struct LexError {
    pub kind: LexErrorKind,
    pub span: Span,
    pub lexeme: String,
}

impl From<LexError> for Diagnostic {
    fn from(err: LexError) -> Self {
        Diagnostic {
            phase: Phase::Lexical,
            span: err.span,
            message: err.kind.to_string(),
            lexeme: err.lexeme,
        }
    }
}

/// Syntax fault kinds
#[derive(Clone, Debug, PartialEq, Error)]
pub enum SyntaxErrorKind {
    #[error("expected {expected}, found {found}")]
    Expected { expected: String, found: String },
    #[error("expected expression, found {0}")]
    ExpectedExpression(String),
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,
    #[error("'break' outside of a loop or switch")]
    BreakOutsideLoop,
    #[error("'continue' outside of a loop")]
    ContinueOutsideLoop,
    #[error("'return' outside of a function")]
    ReturnOutsideFunction,
    #[error("duplicate 'default' clause in switch")]
    DuplicateDefault,
    #[error("duplicate parameter '{0}'")]
    DuplicateParameter(String),
    #[error("nesting deeper than {0} levels")]
    TooDeeplyNested(usize),
}

#[derive(Clone, Debug, PartialEq, Error)]
#[error("{kind}")]
pub struct SyntaxError {
    pub kind: SyntaxErrorKind,
    pub span: Span,
    pub lexeme: String,
}

impl From<SyntaxError> for Diagnostic {
    fn from(err: SyntaxError) -> Self {
        Diagnostic {
            phase: Phase::Syntax,
            span: err.span,
            message: err.kind.to_string(),
            lexeme: err.lexeme,
        }
    }
}

/// Runtime fault kinds
#[derive(Clone, Debug, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("undefined name '{0}'")]
    Undefined(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("'{0}' is already defined in this scope")]
    AlreadyDefined(String),
    #[error("cannot assign to '{0}' because it is not defined")]
    NotDefined(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("'{name}' expects {expected} argument(s) but got {found}")]
    Arity { name: String, expected: usize, found: usize },
    #[error("index {index} is out of bounds for length {len}")]
    IndexOutOfBounds { index: f64, len: usize },
    #[error("maximum call depth of {0} exceeded")]
    CallDepthExceeded(usize),
    #[error("{0}")]
    Native(String),
}

/// Fatal fault of a run, located at the node that raised it.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{kind}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub span: Span,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn to_diagnostic(&self, source: &str) -> Diagnostic {
        Diagnostic {
            phase: Phase::Runtime,
            span: self.span,
            lexeme: self.span.excerpt(source),
            message: self.kind.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_merge() {
        let a = Span::new(1, 5, 6);
        let b = Span { line: 1, start_col: 9, end_line: 2, end_col: 3 };
        assert_eq!(a.to(b), Span { line: 1, start_col: 5, end_line: 2, end_col: 3 });
        assert_eq!(b.to(a), a.to(b));
    }

    #[test]
    fn test_excerpt() {
        let source = "let x = 1;\nlet yy = x / 0;";
        assert_eq!(Span::new(2, 10, 15).excerpt(source), "x / 0");
        assert_eq!(Span::new(9, 1, 2).excerpt(source), "");
    }

    #[test]
    fn test_render_underlines_span() {
        let source = "let x = @;";
        let diag = Diagnostic {
            phase: Phase::Lexical,
            span: Span::new(1, 9, 10),
            lexeme: "@".to_string(),
            message: "unexpected character '@'".to_string(),
        };
        let rendered = diag.render(source);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "1:9: lexical error: unexpected character '@'");
        assert_eq!(lines[1], "1 | let x = @;");
        assert_eq!(lines[2], "            ^");
    }
}
