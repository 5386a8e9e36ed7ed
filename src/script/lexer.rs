//! Script lexer/tokenizer

use crate::script::diagnostic::{LexError, LexErrorKind, Span};
use crate::script::token::{Keyword, Literal, Token, TokenKind, OPERATORS};

/// The lexer
pub struct Lexer<'a> {
    source: &'a str,
    /// Byte offset of the next unread character
    pos: usize,
    line: usize,
    column: usize,
    errors: Vec<LexError>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            pos: 0,
            line: 1,
            column: 1,
            errors: Vec::new(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.rest().chars().next()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn error(&mut self, kind: LexErrorKind, span: Span, lexeme: &str) {
        log::trace!("lexical error at {}: {}", span, kind);
        self.errors.push(LexError { kind, span, lexeme: lexeme.to_string() });
    }

    /// Skip whitespace, line breaks and comments
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => self.skip_line_comment(),
                Some('/') if self.peek_next() == Some('*') => self.skip_block_comment(),
                _ => break,
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) {
        let (line, column) = (self.line, self.column);
        self.advance();
        self.advance();
        loop {
            match self.peek() {
                None => {
                    self.error(LexErrorKind::UnterminatedComment, Span::new(line, column, column + 2), "/*");
                    return;
                }
                Some('*') if self.peek_next() == Some('/') => {
                    self.advance();
                    self.advance();
                    return;
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn eat_digits(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
    }

    fn read_number(&mut self, start: usize, line: usize, column: usize) -> Token {
        // Byte offset where the well-formed prefix stops, if the literal is malformed
        let mut valid_end: Option<usize> = None;

        // Integer part
        self.eat_digits();

        // Decimal part
        if self.peek() == Some('.') && matches!(self.peek_next(), Some(c) if c.is_ascii_digit()) {
            self.advance();
            self.eat_digits();
        }

        // Further decimal points make the literal malformed
        while self.peek() == Some('.') && matches!(self.peek_next(), Some(c) if c.is_ascii_digit()) {
            valid_end.get_or_insert(self.pos);
            self.advance();
            self.eat_digits();
        }

        // Exponent part
        if matches!(self.peek(), Some('e' | 'E')) {
            let has_digits = match self.peek_next() {
                Some(c) if c.is_ascii_digit() => true,
                Some('+' | '-') => matches!(self.peek_nth(2), Some(c) if c.is_ascii_digit()),
                _ => false,
            };
            if has_digits {
                self.advance();
                if matches!(self.peek(), Some('+' | '-')) {
                    self.advance();
                }
                self.eat_digits();
            }
        }

        // Identifier characters glued to the digits
        if matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            valid_end.get_or_insert(self.pos);
            while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == '.') {
                self.advance();
            }
        }

        let lexeme = &self.source[start..self.pos];
        let valid = &self.source[start..valid_end.unwrap_or(self.pos)];
        let value = valid.parse::<f64>().unwrap_or(0.0);
        let token = Token::new(TokenKind::Number, lexeme, line, column).with_literal(Literal::Number(value));
        if valid_end.is_some() {
            let span = Span::new(line, token.start_col, token.end_col);
            self.error(LexErrorKind::MalformedNumber(lexeme.to_string()), span, lexeme);
        }
        token
    }

    fn read_string(&mut self, start: usize, line: usize, column: usize) -> Token {
        let quote = self.advance();
        let mut s = String::new();
        let mut terminated = false;

        while let Some(c) = self.peek() {
            if Some(c) == quote {
                self.advance();
                terminated = true;
                break;
            } else if c == '\n' {
                break;
            } else if c == '\\' {
                let escape_col = self.column;
                match self.peek_next() {
                    None | Some('\n') => {
                        self.advance();
                        break;
                    }
                    Some(e) => {
                        self.advance();
                        self.advance();
                        match e {
                            'n' => s.push('\n'),
                            't' => s.push('\t'),
                            'r' => s.push('\r'),
                            '0' => s.push('\0'),
                            '\\' | '"' | '\'' => s.push(e),
                            other => {
                                let span = Span::new(self.line, escape_col, escape_col + 2);
                                self.error(LexErrorKind::UnknownEscape(other), span, &format!("\\{}", other));
                                s.push(other);
                            }
                        }
                    }
                }
            } else {
                s.push(c);
                self.advance();
            }
        }

        let lexeme = &self.source[start..self.pos];
        let token = Token::new(TokenKind::String, lexeme, line, column).with_literal(Literal::String(s));
        if !terminated {
            let span = Span::new(line, token.start_col, token.end_col);
            self.error(LexErrorKind::UnterminatedString, span, lexeme);
        }
        token
    }

    fn read_identifier(&mut self, start: usize, line: usize, column: usize) -> Token {
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.advance();
        }

        let name = &self.source[start..self.pos];
        let kind = match Keyword::from_ident(name) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Identifier,
        };
        Token::new(kind, name, line, column)
    }

    fn read_operator(&mut self, line: usize, column: usize) -> Token {
        let rest = self.rest();
        if let Some((text, kind)) = OPERATORS.iter().find(|(text, _)| rest.starts_with(text)) {
            for _ in 0..text.len() {
                self.advance();
            }
            return Token::new(*kind, *text, line, column);
        }

        let c = self.advance().unwrap_or_default();
        let lexeme = c.to_string();
        self.error(LexErrorKind::UnexpectedChar(c), Span::new(line, column, column + 1), &lexeme);
        Token::new(TokenKind::Error, lexeme, line, column)
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Token {
        self.skip_trivia();

        let start = self.pos;
        let line = self.line;
        let column = self.column;

        match self.peek() {
            None => Token::new(TokenKind::Eof, "", line, column),
            Some(c) if c.is_ascii_digit() => self.read_number(start, line, column),
            Some('"' | '\'') => self.read_string(start, line, column),
            Some(c) if c.is_alphabetic() || c == '_' => self.read_identifier(start, line, column),
            Some(_) => self.read_operator(line, column),
        }
    }

    /// Tokenize entire input
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        log::debug!("lexed {} tokens with {} error(s)", tokens.len(), self.errors.len());
        tokens
    }

    pub fn errors(&self) -> &[LexError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<LexError> {
        std::mem::take(&mut self.errors)
    }
}

/// Tokenize `source`, returning the token stream and the lexical errors found.
pub fn lex(source: &str) -> (Vec<Token>, Vec<LexError>) {
    let mut lexer = Lexer::new(source);
    let tokens = lexer.tokenize();
    (tokens, lexer.take_errors())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).0.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_input_is_just_eof() {
        let (tokens, errors) = lex("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_maximal_munch() {
        assert_eq!(kinds("**="), vec![TokenKind::StarStarEqual, TokenKind::Eof]);
        assert_eq!(kinds("**"), vec![TokenKind::StarStar, TokenKind::Eof]);
        assert_eq!(
            kinds("a+++b"),
            vec![TokenKind::Identifier, TokenKind::PlusPlus, TokenKind::Plus, TokenKind::Identifier, TokenKind::Eof]
        );
        assert_eq!(
            kinds("<<= >> >= ="),
            vec![
                TokenKind::LessLessEqual,
                TokenKind::GreaterGreater,
                TokenKind::GreaterEqual,
                TokenKind::Equal,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_keywords_exact_match() {
        assert_eq!(
            kinds("let letter iff if"),
            vec![
                TokenKind::Keyword(Keyword::Let),
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Keyword(Keyword::If),
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("instanceof")[0], TokenKind::Keyword(Keyword::Instanceof));
    }

    #[test]
    fn test_positions() {
        let (tokens, _) = lex("let x\n  = 42;");
        assert_eq!((tokens[0].line, tokens[0].start_col, tokens[0].end_col), (1, 1, 4));
        assert_eq!((tokens[1].line, tokens[1].start_col, tokens[1].end_col), (1, 5, 6));
        assert_eq!((tokens[2].line, tokens[2].start_col), (2, 3));
        assert_eq!((tokens[3].line, tokens[3].start_col, tokens[3].end_col), (2, 5, 7));
        assert_eq!(tokens[3].literal, Some(Literal::Number(42.0)));
    }

    #[test]
    fn test_numbers() {
        let (tokens, errors) = lex("3.25 1e3 2.5E-2 7");
        assert!(errors.is_empty());
        let values: Vec<Option<Literal>> = tokens.iter().map(|t| t.literal.clone()).collect();
        assert_eq!(values[0], Some(Literal::Number(3.25)));
        assert_eq!(values[1], Some(Literal::Number(1000.0)));
        assert_eq!(values[2], Some(Literal::Number(0.025)));
        assert_eq!(values[3], Some(Literal::Number(7.0)));
    }

    #[test]
    fn test_malformed_number_still_emits_token() {
        let (tokens, errors) = lex("1.2.3 + 1");
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].kind, LexErrorKind::MalformedNumber(ref s) if s == "1.2.3"));
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].literal, Some(Literal::Number(1.2)));
        assert_eq!(tokens[1].kind, TokenKind::Plus);

        let (tokens, errors) = lex("12abc;");
        assert_eq!(errors.len(), 1);
        assert_eq!(tokens[0].lexeme, "12abc");
        assert_eq!(tokens[1].kind, TokenKind::Semicolon);
    }

    #[test]
    fn test_member_access_after_number_is_not_decimal() {
        assert_eq!(
            kinds("1.x"),
            vec![TokenKind::Number, TokenKind::Dot, TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn test_strings() {
        let (tokens, errors) = lex(r#""a\tb" 'it\'s'"#);
        assert!(errors.is_empty());
        assert_eq!(tokens[0].literal, Some(Literal::String("a\tb".to_string())));
        assert_eq!(tokens[0].lexeme, r#""a\tb""#);
        assert_eq!(tokens[1].literal, Some(Literal::String("it's".to_string())));
    }

    #[test]
    fn test_unterminated_string() {
        let (tokens, errors) = lex("let s = \"abc\nlet t = 1;");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, LexErrorKind::UnterminatedString);
        assert_eq!(errors[0].span.line, 1);
        assert_eq!(tokens[3].literal, Some(Literal::String("abc".to_string())));
        // Scanning resumes on the next line
        assert_eq!(tokens[4].kind, TokenKind::Keyword(Keyword::Let));
        assert_eq!(tokens[4].line, 2);
    }

    #[test]
    fn test_unknown_escape() {
        let (tokens, errors) = lex(r#""a\qb""#);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, LexErrorKind::UnknownEscape('q'));
        assert_eq!(tokens[0].literal, Some(Literal::String("aqb".to_string())));
    }

    #[test]
    fn test_bad_characters_are_reported_and_skipped() {
        let (tokens, errors) = lex("a @ b # c");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].kind, LexErrorKind::UnexpectedChar('@'));
        assert_eq!((errors[0].span.line, errors[0].span.start_col), (1, 3));
        assert_eq!(errors[1].kind, LexErrorKind::UnexpectedChar('#'));
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::Error,
                TokenKind::Identifier,
                TokenKind::Error,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("a // comment\n/* block\n comment */ b"),
            vec![TokenKind::Identifier, TokenKind::Identifier, TokenKind::Eof]
        );
        let (tokens, errors) = lex("a /* never closed");
        assert_eq!(errors[0].kind, LexErrorKind::UnterminatedComment);
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_stream_invariants() {
        let inputs = ["", "let x = 1;", "@@@", "\"open", "1.2.3e", "a\n\n\tb /* x", "x **= 2 ** -y;"];
        for input in inputs {
            let (tokens, _) = lex(input);
            let eofs = tokens.iter().filter(|t| t.kind == TokenKind::Eof).count();
            assert_eq!(eofs, 1, "input {:?}", input);
            assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
            for token in &tokens {
                assert!(token.end_col >= token.start_col, "token {:?}", token);
            }
        }
    }

    #[test]
    fn test_relex_lexemes_round_trip() {
        let source = "fn f(a, b) { return a ** 2 + b[0].len; } // done\nlet s = 'x\\n'; s += \"y\";";
        let (tokens, errors) = lex(source);
        assert!(errors.is_empty());
        let joined = tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .map(|t| t.lexeme.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let (again, errors) = lex(&joined);
        assert!(errors.is_empty());
        let pairs = |ts: &[Token]| ts.iter().map(|t| (t.kind, t.lexeme.clone(), t.literal.clone())).collect::<Vec<_>>();
        assert_eq!(pairs(&tokens), pairs(&again));
    }
}
