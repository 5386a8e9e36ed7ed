//! Token vocabulary shared by the lexer and the parser

use std::fmt;

use crate::script::diagnostic::Span;

/// Token kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Literals
    Number,
    String,

    // Identifiers and keywords
    Identifier,
    Keyword(Keyword),

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    StarStar,

    // Postfix
    PlusPlus,
    MinusMinus,

    // Assignment
    Equal,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PercentEqual,
    StarStarEqual,
    AmpEqual,
    PipeEqual,
    CaretEqual,
    LessLessEqual,
    GreaterGreaterEqual,

    // Comparison
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // Logical
    AmpAmp,
    PipePipe,
    Bang,

    // Bitwise
    Amp,
    Pipe,
    Caret,
    Tilde,
    LessLess,
    GreaterGreater,

    // Punctuation
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Colon,
    Semicolon,

    // Special
    Error,
    Eof,
}

impl TokenKind {
    pub fn is_assignment(self) -> bool {
        matches!(
            self,
            TokenKind::Equal
                | TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::StarEqual
                | TokenKind::SlashEqual
                | TokenKind::PercentEqual
                | TokenKind::StarStarEqual
                | TokenKind::AmpEqual
                | TokenKind::PipeEqual
                | TokenKind::CaretEqual
                | TokenKind::LessLessEqual
                | TokenKind::GreaterGreaterEqual
        )
    }

    /// Human readable name used in "expected ..." messages.
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Number => "number",
            TokenKind::String => "string",
            TokenKind::Identifier => "identifier",
            TokenKind::Keyword(kw) => kw.as_str(),
            TokenKind::Error => "invalid character",
            TokenKind::Eof => "end of input",
            other => other.symbol().unwrap_or("token"),
        }
    }

    /// Source spelling of operator and punctuation kinds.
    pub fn symbol(self) -> Option<&'static str> {
        OPERATORS
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(text, _)| *text)
    }
}

/// Operator and punctuation spellings, longest first so that the lexer can
/// apply maximal munch by taking the first prefix match.
pub const OPERATORS: &[(&str, TokenKind)] = &[
    ("**=", TokenKind::StarStarEqual),
    ("<<=", TokenKind::LessLessEqual),
    (">>=", TokenKind::GreaterGreaterEqual),
    ("**", TokenKind::StarStar),
    ("++", TokenKind::PlusPlus),
    ("--", TokenKind::MinusMinus),
    ("+=", TokenKind::PlusEqual),
    ("-=", TokenKind::MinusEqual),
    ("*=", TokenKind::StarEqual),
    ("/=", TokenKind::SlashEqual),
    ("%=", TokenKind::PercentEqual),
    ("&=", TokenKind::AmpEqual),
    ("|=", TokenKind::PipeEqual),
    ("^=", TokenKind::CaretEqual),
    ("==", TokenKind::EqualEqual),
    ("!=", TokenKind::BangEqual),
    ("<=", TokenKind::LessEqual),
    (">=", TokenKind::GreaterEqual),
    ("&&", TokenKind::AmpAmp),
    ("||", TokenKind::PipePipe),
    ("<<", TokenKind::LessLess),
    (">>", TokenKind::GreaterGreater),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("%", TokenKind::Percent),
    ("=", TokenKind::Equal),
    ("<", TokenKind::Less),
    (">", TokenKind::Greater),
    ("!", TokenKind::Bang),
    ("&", TokenKind::Amp),
    ("|", TokenKind::Pipe),
    ("^", TokenKind::Caret),
    ("~", TokenKind::Tilde),
    ("(", TokenKind::LeftParen),
    (")", TokenKind::RightParen),
    ("[", TokenKind::LeftBracket),
    ("]", TokenKind::RightBracket),
    ("{", TokenKind::LeftBrace),
    ("}", TokenKind::RightBrace),
    (",", TokenKind::Comma),
    (".", TokenKind::Dot),
    (":", TokenKind::Colon),
    (";", TokenKind::Semicolon),
];

/// Script keywords
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Keyword {
    // Declarations
    Let, Fn,

    // Control flow
    If, Then, Else,
    Switch, Case, Default,
    For, In, While, Do,
    Break, Continue, Return,

    // Literals
    True, False, Null,

    // Word operators
    And, Or, Not, Instanceof,
}

impl Keyword {
    pub fn from_ident(name: &str) -> Option<Keyword> {
        match name {
            "let" => Some(Keyword::Let),
            "fn" => Some(Keyword::Fn),
            "if" => Some(Keyword::If),
            "then" => Some(Keyword::Then),
            "else" => Some(Keyword::Else),
            "switch" => Some(Keyword::Switch),
            "case" => Some(Keyword::Case),
            "default" => Some(Keyword::Default),
            "for" => Some(Keyword::For),
            "in" => Some(Keyword::In),
            "while" => Some(Keyword::While),
            "do" => Some(Keyword::Do),
            "break" => Some(Keyword::Break),
            "continue" => Some(Keyword::Continue),
            "return" => Some(Keyword::Return),
            "true" => Some(Keyword::True),
            "false" => Some(Keyword::False),
            "null" => Some(Keyword::Null),
            "and" => Some(Keyword::And),
            "or" => Some(Keyword::Or),
            "not" => Some(Keyword::Not),
            "instanceof" => Some(Keyword::Instanceof),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Let => "let",
            Keyword::Fn => "fn",
            Keyword::If => "if",
            Keyword::Then => "then",
            Keyword::Else => "else",
            Keyword::Switch => "switch",
            Keyword::Case => "case",
            Keyword::Default => "default",
            Keyword::For => "for",
            Keyword::In => "in",
            Keyword::While => "while",
            Keyword::Do => "do",
            Keyword::Break => "break",
            Keyword::Continue => "continue",
            Keyword::Return => "return",
            Keyword::True => "true",
            Keyword::False => "false",
            Keyword::Null => "null",
            Keyword::And => "and",
            Keyword::Or => "or",
            Keyword::Not => "not",
            Keyword::Instanceof => "instanceof",
        }
    }

    /// Keywords that can only appear at the start of a statement. The parser
    /// resynchronizes on these after a syntax error.
    pub fn starts_statement(self) -> bool {
        matches!(
            self,
            Keyword::Let
                | Keyword::Fn
                | Keyword::If
                | Keyword::Switch
                | Keyword::For
                | Keyword::While
                | Keyword::Do
                | Keyword::Break
                | Keyword::Continue
                | Keyword::Return
        )
    }
}

/// Parsed value of a literal token
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Number(f64),
    String(String),
}

/// A token with position info. Columns are 1-based and `end_col` is exclusive.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub literal: Option<Literal>,
    pub line: usize,
    pub start_col: usize,
    pub end_col: usize,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, line: usize, start_col: usize) -> Self {
        let lexeme = lexeme.into();
        let end_col = start_col + lexeme.chars().count();
        Self { kind, lexeme, literal: None, line, start_col, end_col }
    }

    pub fn with_literal(mut self, literal: Literal) -> Self {
        self.literal = Some(literal);
        self
    }

    pub fn span(&self) -> Span {
        Span::new(self.line, self.start_col, self.end_col)
    }

    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Eof => write!(f, "end of input"),
            _ => write!(f, "'{}'", self.lexeme),
        }
    }
}
