//! Script parser - produces an AST, recovering from errors statement by statement

use std::collections::HashSet;
use std::rc::Rc;

use crate::script::ast::{
    AssignOp, BinOp, Block, Expr, ExprKind, FunctionDef, LiteralValue, Program, Stmt, StmtKind, SwitchCase,
    UnaryOp, UpdateOp,
};
use crate::script::diagnostic::{Span, SyntaxError, SyntaxErrorKind};
use crate::script::token::{Keyword, Literal, Token, TokenKind};

type ParseResult<T> = Result<T, SyntaxError>;

/// Deepest statement and expression nesting accepted
pub const MAX_NESTING: usize = 64;

/// Parser for scripts
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<SyntaxError>,
    /// Current statement and expression nesting
    nesting: usize,
    /// Nesting counters for the placement checks of break/continue/return
    loop_depth: usize,
    switch_depth: usize,
    function_depth: usize,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.last().map_or(true, |t| t.kind != TokenKind::Eof) {
            let (line, col) = tokens.last().map_or((1, 1), |t| (t.line, t.end_col));
            tokens.push(Token::new(TokenKind::Eof, "", line, col));
        }
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
            nesting: 0,
            loop_depth: 0,
            switch_depth: 0,
            function_depth: 0,
        }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn peek(&self) -> TokenKind {
        self.current().kind
    }

    fn peek_at(&self, offset: usize) -> TokenKind {
        self.tokens.get(self.pos + offset).map_or(TokenKind::Eof, |t| t.kind)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek() == kind
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.peek() == TokenKind::Keyword(keyword)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    /// Consume the current token if it has the given kind
    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at(&self, token: &Token, kind: SyntaxErrorKind) -> SyntaxError {
        SyntaxError { kind, span: token.span(), lexeme: token.lexeme.clone() }
    }

    fn expected(&self, what: &str) -> SyntaxError {
        let token = self.current();
        self.error_at(
            token,
            SyntaxErrorKind::Expected { expected: what.to_string(), found: found_description(token) },
        )
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.expected(what))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> ParseResult<Token> {
        self.expect(TokenKind::Identifier, what)
    }

    /// Run `parse` one nesting level deeper. Input nested past
    /// [`MAX_NESTING`] is rejected before it can exhaust the stack.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error_at(self.current(), SyntaxErrorKind::TooDeeplyNested(MAX_NESTING)));
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    /// Span from `start` to the end of the last consumed token
    fn span_from(&self, start: Span) -> Span {
        start.to(self.previous().span())
    }

    /// Record a diagnostic. Errors raised on a token the lexer already
    /// rejected are not reported twice.
    fn report(&mut self, err: SyntaxError) {
        if self.current().kind == TokenKind::Error && self.current().span() == err.span {
            log::trace!("suppressing syntax error on invalid character at {}", err.span);
            return;
        }
        log::debug!("syntax error at {}: {}", err.span, err);
        self.errors.push(err);
    }

    /// Discard tokens up to the next statement boundary. Always makes progress
    /// unless the input is exhausted.
    fn synchronize(&mut self, start: usize) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::LeftBrace => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RightBrace if depth > 0 => {
                    depth -= 1;
                    self.advance();
                }
                TokenKind::RightBrace => break,
                TokenKind::Semicolon if depth == 0 => {
                    self.advance();
                    break;
                }
                TokenKind::Keyword(kw)
                    if depth == 0 && (kw.starts_statement() || matches!(kw, Keyword::Case | Keyword::Default)) =>
                {
                    break
                }
                _ => {
                    self.advance();
                }
            }
        }
        if self.pos == start {
            self.advance();
        }
        log::trace!("resynchronized at {}", self.current().span());
    }

    /// Parse the entire program
    pub fn parse(&mut self) -> Program {
        let mut statements = Vec::new();

        while !self.check(TokenKind::Eof) {
            if self.eat(TokenKind::Semicolon) {
                continue;
            }
            if let Some(stmt) = self.parse_recovering() {
                statements.push(stmt);
            }
        }

        log::debug!("parsed {} statement(s) with {} error(s)", statements.len(), self.errors.len());
        Program { statements }
    }

    pub fn errors(&self) -> &[SyntaxError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<SyntaxError> {
        std::mem::take(&mut self.errors)
    }

    /// Parse one statement, recording the error and skipping to the next
    /// statement boundary on failure.
    fn parse_recovering(&mut self) -> Option<Stmt> {
        let start = self.pos;
        match self.parse_statement() {
            Ok(stmt) => Some(stmt),
            Err(err) => {
                self.report(err);
                self.synchronize(start);
                None
            }
        }
    }

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        self.nested(Self::parse_statement_kind)
    }

    fn parse_statement_kind(&mut self) -> ParseResult<Stmt> {
        match self.peek() {
            TokenKind::Keyword(Keyword::Let) => self.parse_let(),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::Switch) => self.parse_switch(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Do) => self.parse_do_while(),
            TokenKind::Keyword(Keyword::Break) => self.parse_break(),
            TokenKind::Keyword(Keyword::Continue) => self.parse_continue(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::Fn) => self.parse_function(),
            TokenKind::LeftBrace => {
                let block = self.parse_block()?;
                let span = block.span;
                Ok(Stmt::new(StmtKind::Block(block), span))
            }
            TokenKind::Semicolon => {
                // Empty statement, e.g. `while (busy());`
                let token = self.advance();
                let span = token.span();
                Ok(Stmt::new(StmtKind::Block(Block { statements: Vec::new(), span }), span))
            }
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_expression_statement(&mut self) -> ParseResult<Stmt> {
        let expr = self.parse_expression()?;
        self.expect(TokenKind::Semicolon, "';' after expression")?;
        let span = self.span_from(expr.span);
        Ok(Stmt::new(StmtKind::Expression(expr), span))
    }

    /// Parse LET declaration: let name [= value];
    fn parse_let(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span();
        let name = self.expect_identifier("variable name after 'let'")?.lexeme;
        let value = if self.eat(TokenKind::Equal) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "';' after variable declaration")?;
        Ok(Stmt::new(StmtKind::Let { name, value }, self.span_from(start)))
    }

    /// Parse IF: if condition [then] statement [else statement]
    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span();
        let condition = self.parse_expression()?;
        self.eat(TokenKind::Keyword(Keyword::Then));
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.eat(TokenKind::Keyword(Keyword::Else)) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::new(StmtKind::If { condition, then_branch, else_branch }, self.span_from(start)))
    }

    /// Parse SWITCH: switch subject { case value: ... default: ... }
    fn parse_switch(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span();
        let subject = self.parse_expression()?;
        self.expect(TokenKind::LeftBrace, "'{' after switch subject")?;

        self.switch_depth += 1;
        let cases = self.parse_switch_cases();
        self.switch_depth -= 1;
        let cases = cases?;

        self.expect(TokenKind::RightBrace, "'}' after switch cases")?;
        Ok(Stmt::new(StmtKind::Switch { subject, cases }, self.span_from(start)))
    }

    fn parse_switch_cases(&mut self) -> ParseResult<Vec<SwitchCase>> {
        let mut cases: Vec<SwitchCase> = Vec::new();
        let mut seen_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            let label = self.current().clone();
            let test = if self.eat(TokenKind::Keyword(Keyword::Case)) {
                Some(self.parse_expression()?)
            } else if self.eat(TokenKind::Keyword(Keyword::Default)) {
                if seen_default {
                    let err = self.error_at(&label, SyntaxErrorKind::DuplicateDefault);
                    self.report(err);
                }
                seen_default = true;
                None
            } else {
                let err = self.expected("'case' or 'default'");
                self.report(err);
                self.skip_to_case_label();
                continue;
            };
            self.expect(TokenKind::Colon, "':' after case label")?;

            let mut body = Vec::new();
            while !matches!(
                self.peek(),
                TokenKind::Keyword(Keyword::Case | Keyword::Default) | TokenKind::RightBrace | TokenKind::Eof
            ) {
                if self.eat(TokenKind::Semicolon) {
                    continue;
                }
                if let Some(stmt) = self.parse_recovering() {
                    body.push(stmt);
                }
            }
            cases.push(SwitchCase { test, body, span: self.span_from(label.span()) });
        }

        Ok(cases)
    }

    /// Skip statements that precede the first case label
    fn skip_to_case_label(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Keyword(Keyword::Case | Keyword::Default) | TokenKind::RightBrace if depth == 0 => break,
                TokenKind::LeftBrace => depth += 1,
                TokenKind::RightBrace => depth -= 1,
                _ => {}
            }
            self.advance();
        }
    }

    /// Parse FOR: C-style `for (init; cond; update)` or `for name in iterable`
    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span();
        let parenthesized = self.check(TokenKind::LeftParen);
        let offset = usize::from(parenthesized);

        if self.peek_at(offset) == TokenKind::Identifier
            && self.peek_at(offset + 1) == TokenKind::Keyword(Keyword::In)
        {
            return self.parse_for_in(start, parenthesized);
        }

        self.expect(TokenKind::LeftParen, "'(' after 'for'")?;
        let init = if self.eat(TokenKind::Semicolon) {
            None
        } else if self.check_keyword(Keyword::Let) {
            Some(Box::new(self.parse_let()?))
        } else {
            Some(Box::new(self.parse_expression_statement()?))
        };
        let condition = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::Semicolon, "';' after loop condition")?;
        let update = if self.check(TokenKind::RightParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::RightParen, "')' after for clauses")?;

        let body = Box::new(self.parse_loop_body()?);
        Ok(Stmt::new(StmtKind::For { init, condition, update, body }, self.span_from(start)))
    }

    fn parse_for_in(&mut self, start: Span, parenthesized: bool) -> ParseResult<Stmt> {
        if parenthesized {
            self.advance();
        }
        let binding = self.expect_identifier("loop variable")?.lexeme;
        self.expect(TokenKind::Keyword(Keyword::In), "'in'")?;
        let iterable = self.parse_expression()?;
        if parenthesized {
            self.expect(TokenKind::RightParen, "')' after for-in clause")?;
        }
        let body = Box::new(self.parse_loop_body()?);
        Ok(Stmt::new(StmtKind::ForIn { binding, iterable, body }, self.span_from(start)))
    }

    fn parse_loop_body(&mut self) -> ParseResult<Stmt> {
        self.loop_depth += 1;
        let body = self.parse_statement();
        self.loop_depth -= 1;
        body
    }

    /// Parse WHILE: while condition statement
    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span();
        let condition = self.parse_expression()?;
        let body = Box::new(self.parse_loop_body()?);
        Ok(Stmt::new(StmtKind::While { condition, body }, self.span_from(start)))
    }

    /// Parse DO/WHILE: do statement while condition;
    fn parse_do_while(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span();
        let body = Box::new(self.parse_loop_body()?);
        self.expect(TokenKind::Keyword(Keyword::While), "'while' after do body")?;
        let condition = self.parse_expression()?;
        self.expect(TokenKind::Semicolon, "';' after do-while condition")?;
        Ok(Stmt::new(StmtKind::DoWhile { body, condition }, self.span_from(start)))
    }

    fn parse_break(&mut self) -> ParseResult<Stmt> {
        let keyword = self.advance();
        if self.loop_depth == 0 && self.switch_depth == 0 {
            let err = self.error_at(&keyword, SyntaxErrorKind::BreakOutsideLoop);
            self.report(err);
        }
        self.expect(TokenKind::Semicolon, "';' after 'break'")?;
        Ok(Stmt::new(StmtKind::Break, self.span_from(keyword.span())))
    }

    fn parse_continue(&mut self) -> ParseResult<Stmt> {
        let keyword = self.advance();
        if self.loop_depth == 0 {
            let err = self.error_at(&keyword, SyntaxErrorKind::ContinueOutsideLoop);
            self.report(err);
        }
        self.expect(TokenKind::Semicolon, "';' after 'continue'")?;
        Ok(Stmt::new(StmtKind::Continue, self.span_from(keyword.span())))
    }

    fn parse_return(&mut self) -> ParseResult<Stmt> {
        let keyword = self.advance();
        if self.function_depth == 0 {
            let err = self.error_at(&keyword, SyntaxErrorKind::ReturnOutsideFunction);
            self.report(err);
        }
        let value = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::Semicolon, "';' after return value")?;
        Ok(Stmt::new(StmtKind::Return(value), self.span_from(keyword.span())))
    }

    /// Parse FN definition: fn name(params) { body }
    fn parse_function(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().span();
        let name = self.expect_identifier("function name after 'fn'")?.lexeme;
        self.expect(TokenKind::LeftParen, "'(' after function name")?;
        let params = self.parse_param_list()?;

        // Loops and switches of the caller do not extend into the body
        let saved = (self.loop_depth, self.switch_depth);
        self.loop_depth = 0;
        self.switch_depth = 0;
        self.function_depth += 1;
        let body = self.parse_block();
        self.function_depth -= 1;
        (self.loop_depth, self.switch_depth) = saved;
        let body = body?;

        let span = self.span_from(start);
        let def = FunctionDef { name, params, body, span };
        Ok(Stmt::new(StmtKind::FunctionDef(Rc::new(def)), span))
    }

    /// Parse parameter list
    fn parse_param_list(&mut self) -> ParseResult<Vec<String>> {
        let mut params = Vec::new();
        let mut seen = HashSet::new();

        if !self.check(TokenKind::RightParen) {
            loop {
                let token = self.expect_identifier("parameter name")?;
                if !seen.insert(token.lexeme.clone()) {
                    let err = self.error_at(&token, SyntaxErrorKind::DuplicateParameter(token.lexeme.clone()));
                    self.report(err);
                }
                params.push(token.lexeme);

                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(TokenKind::RightParen, "')' after parameters")?;
        Ok(params)
    }

    fn parse_block(&mut self) -> ParseResult<Block> {
        let open = self.expect(TokenKind::LeftBrace, "'{'")?;
        let mut statements = Vec::new();

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.eat(TokenKind::Semicolon) {
                continue;
            }
            if let Some(stmt) = self.parse_recovering() {
                statements.push(stmt);
            }
        }

        self.expect(TokenKind::RightBrace, "'}' to close block")?;
        Ok(Block { statements, span: self.span_from(open.span()) })
    }

    /// Parse an expression
    pub fn parse_expression(&mut self) -> ParseResult<Expr> {
        self.nested(Self::parse_assignment)
    }

    fn parse_assignment(&mut self) -> ParseResult<Expr> {
        let target = self.parse_or()?;

        let op = match self.peek() {
            TokenKind::Equal => AssignOp::Assign,
            TokenKind::PlusEqual => AssignOp::Compound(BinOp::Add),
            TokenKind::MinusEqual => AssignOp::Compound(BinOp::Sub),
            TokenKind::StarEqual => AssignOp::Compound(BinOp::Mul),
            TokenKind::SlashEqual => AssignOp::Compound(BinOp::Div),
            TokenKind::PercentEqual => AssignOp::Compound(BinOp::Mod),
            TokenKind::StarStarEqual => AssignOp::Compound(BinOp::Pow),
            TokenKind::AmpEqual => AssignOp::Compound(BinOp::BitAnd),
            TokenKind::PipeEqual => AssignOp::Compound(BinOp::BitOr),
            TokenKind::CaretEqual => AssignOp::Compound(BinOp::BitXor),
            TokenKind::LessLessEqual => AssignOp::Compound(BinOp::Shl),
            TokenKind::GreaterGreaterEqual => AssignOp::Compound(BinOp::Shr),
            _ => return Ok(target),
        };
        let op_token = self.advance();
        // Right associative
        let value = self.nested(Self::parse_assignment)?;
        if !target.is_assignable() {
            let err = self.error_at(&op_token, SyntaxErrorKind::InvalidAssignmentTarget);
            self.report(err);
        }

        let span = target.span.to(value.span);
        Ok(Expr::new(ExprKind::Assignment { op, target: Box::new(target), value: Box::new(value) }, span))
    }

    fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
        let span = left.span.to(right.span);
        Expr::new(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, span)
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;

        while matches!(self.peek(), TokenKind::PipePipe | TokenKind::Keyword(Keyword::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Self::binary(left, BinOp::Or, right);
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_bit_or()?;

        while matches!(self.peek(), TokenKind::AmpAmp | TokenKind::Keyword(Keyword::And)) {
            self.advance();
            let right = self.parse_bit_or()?;
            left = Self::binary(left, BinOp::And, right);
        }

        Ok(left)
    }

    fn parse_bit_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_bit_xor()?;

        while self.eat(TokenKind::Pipe) {
            let right = self.parse_bit_xor()?;
            left = Self::binary(left, BinOp::BitOr, right);
        }

        Ok(left)
    }

    fn parse_bit_xor(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_bit_and()?;

        while self.eat(TokenKind::Caret) {
            let right = self.parse_bit_and()?;
            left = Self::binary(left, BinOp::BitXor, right);
        }

        Ok(left)
    }

    fn parse_bit_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_equality()?;

        while self.eat(TokenKind::Amp) {
            let right = self.parse_equality()?;
            left = Self::binary(left, BinOp::BitAnd, right);
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_relational()?;

        loop {
            let op = match self.peek() {
                TokenKind::EqualEqual => BinOp::Eq,
                TokenKind::BangEqual => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_relational()?;
            left = Self::binary(left, op, right);
        }

        Ok(left)
    }

    fn parse_relational(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_shift()?;

        loop {
            let op = match self.peek() {
                TokenKind::Less => BinOp::Lt,
                TokenKind::LessEqual => BinOp::Le,
                TokenKind::Greater => BinOp::Gt,
                TokenKind::GreaterEqual => BinOp::Ge,
                TokenKind::Keyword(Keyword::In) => BinOp::In,
                TokenKind::Keyword(Keyword::Instanceof) => BinOp::InstanceOf,
                _ => break,
            };
            self.advance();
            let right = self.parse_shift()?;
            left = Self::binary(left, op, right);
        }

        Ok(left)
    }

    fn parse_shift(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_additive()?;

        loop {
            let op = match self.peek() {
                TokenKind::LessLess => BinOp::Shl,
                TokenKind::GreaterGreater => BinOp::Shr,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Self::binary(left, op, right);
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Self::binary(left, op, right);
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_power()?;

        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_power()?;
            left = Self::binary(left, op, right);
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            TokenKind::Bang | TokenKind::Keyword(Keyword::Not) => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Tilde => UnaryOp::BitNot,
            _ => return self.parse_postfix(),
        };
        let start = self.advance().span();
        let operand = self.nested(Self::parse_unary)?;
        let span = start.to(operand.span);
        Ok(Expr::new(ExprKind::Unary { op, operand: Box::new(operand) }, span))
    }

    fn parse_power(&mut self) -> ParseResult<Expr> {
        // Prefix operators bind tighter than `**`, so `-2 ** 2` squares -2
        let base = self.parse_unary()?;

        if self.eat(TokenKind::StarStar) {
            let exponent = self.nested(Self::parse_power)?;
            Ok(Self::binary(base, BinOp::Pow, exponent))
        } else {
            Ok(base)
        }
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek() {
                TokenKind::LeftParen => {
                    self.advance();
                    let args = self.parse_arguments()?;
                    let span = self.span_from(expr.span);
                    expr = Expr::new(ExprKind::Call { callee: Box::new(expr), args }, span);
                }
                TokenKind::Dot => {
                    self.advance();
                    let property = self.expect_identifier("property name after '.'")?.lexeme;
                    let span = self.span_from(expr.span);
                    expr = Expr::new(ExprKind::PropertyAccess { object: Box::new(expr), property }, span);
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RightBracket, "']' after index")?;
                    let span = self.span_from(expr.span);
                    expr = Expr::new(ExprKind::Index { object: Box::new(expr), index: Box::new(index) }, span);
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let op_token = self.advance();
                    let op = if op_token.kind == TokenKind::PlusPlus {
                        UpdateOp::Increment
                    } else {
                        UpdateOp::Decrement
                    };
                    if !expr.is_assignable() {
                        let err = self.error_at(&op_token, SyntaxErrorKind::InvalidAssignmentTarget);
                        self.report(err);
                    }
                    let span = self.span_from(expr.span);
                    expr = Expr::new(ExprKind::Update { op, target: Box::new(expr) }, span);
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    /// Parse call arguments after the opening parenthesis
    fn parse_arguments(&mut self) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "')' after arguments")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let token = self.current().clone();
        let literal = |value: LiteralValue| -> ParseResult<Expr> { Ok(Expr::new(ExprKind::Literal(value), token.span())) };

        match token.kind {
            TokenKind::Number => {
                self.advance();
                let n = match token.literal {
                    Some(Literal::Number(n)) => n,
                    _ => token.lexeme.parse().unwrap_or(0.0),
                };
                literal(LiteralValue::Number(n))
            }
            TokenKind::String => {
                self.advance();
                let s = match &token.literal {
                    Some(Literal::String(s)) => s.clone(),
                    _ => String::new(),
                };
                literal(LiteralValue::String(s))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                literal(LiteralValue::Bool(true))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                literal(LiteralValue::Bool(false))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                literal(LiteralValue::Null)
            }
            TokenKind::Identifier => {
                self.advance();
                Ok(Expr::new(ExprKind::Identifier(token.lexeme.clone()), token.span()))
            }
            TokenKind::LeftParen => {
                self.advance();
                let mut expr = self.parse_expression()?;
                self.expect(TokenKind::RightParen, "')' after expression")?;
                expr.span = self.span_from(token.span());
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(TokenKind::RightBracket) {
                    items.push(self.parse_expression()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RightBracket, "']' after array items")?;
                Ok(Expr::new(ExprKind::Array(items), self.span_from(token.span())))
            }
            _ => Err(self.error_at(&token, SyntaxErrorKind::ExpectedExpression(found_description(&token)))),
        }
    }
}

fn found_description(token: &Token) -> String {
    match token.kind {
        TokenKind::Eof => "end of input".to_string(),
        _ => format!("'{}'", token.lexeme),
    }
}

/// Parse a token stream. The program is `None` when errors left no statement.
pub fn parse(tokens: Vec<Token>) -> (Option<Program>, Vec<SyntaxError>) {
    let mut parser = Parser::new(tokens);
    let program = parser.parse();
    let errors = parser.take_errors();
    if program.is_empty() && !errors.is_empty() {
        (None, errors)
    } else {
        (Some(program), errors)
    }
}
