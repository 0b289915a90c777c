use crate::language::{
    ast::*,
    errors::{SyntaxError, SyntaxErrors},
    lexer::lex,
    span::Span,
    token::{Token, TokenKind},
};
use std::rc::Rc;

pub fn parse_chunk(source: &str) -> Result<Chunk, SyntaxErrors> {
    let tokens = match lex(source) {
        Ok(tokens) => tokens,
        Err(errors) => {
            let errs = errors
                .into_iter()
                .map(|err| SyntaxError::new(err.message, err.span))
                .collect();
            return Err(SyntaxErrors::new(errs));
        }
    };
    Parser::new(tokens).parse()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_block: u32,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            next_block: 0,
        }
    }

    fn parse(mut self) -> Result<Chunk, SyntaxErrors> {
        match self.parse_block() {
            Ok(block) => {
                if let Err(err) = self.expect(TokenKind::Eof) {
                    return Err(SyntaxErrors::new(vec![err]));
                }
                Ok(Chunk { block })
            }
            Err(err) => Err(SyntaxErrors::new(vec![err])),
        }
    }

    // ---- token plumbing ----

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn current_kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn current_span(&self) -> Span {
        self.current().span
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.current_kind() == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(&kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, SyntaxError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(SyntaxError::new(
                format!(
                    "Expected {} but found {}",
                    kind.describe(),
                    self.current_kind().describe()
                ),
                self.current_span(),
            ))
        }
    }

    fn expect_name(&mut self, what: &str) -> Result<Name, SyntaxError> {
        match self.current_kind().clone() {
            TokenKind::Name(text) => {
                let span = self.current_span();
                self.advance();
                Ok(Name { text, span })
            }
            other => Err(SyntaxError::new(
                format!("Expected {what} but found {}", other.describe()),
                self.current_span(),
            )),
        }
    }

    fn fresh_block_id(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }

    // ---- blocks and statements ----

    fn block_ends(&self) -> bool {
        matches!(
            self.current_kind(),
            TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until
                | TokenKind::Eof
        )
    }

    fn parse_block(&mut self) -> Result<Block, SyntaxError> {
        let id = self.fresh_block_id();
        let start = self.current_span();
        let mut statements = Vec::new();
        let mut ret = None;

        loop {
            if self.block_ends() {
                break;
            }
            if self.check(&TokenKind::Return) {
                ret = Some(self.parse_return()?);
                break;
            }
            statements.push(self.parse_statement()?);
        }

        let end = self.current_span();
        Ok(Block {
            id,
            statements,
            ret,
            span: Span::new(start.start, end.start),
        })
    }

    fn parse_return(&mut self) -> Result<ReturnStat, SyntaxError> {
        let start = self.expect(TokenKind::Return)?.span;
        let mut exprs = Vec::new();
        if !self.block_ends() && !self.check(&TokenKind::Semi) {
            exprs = self.parse_expr_list()?;
        }
        self.matches(TokenKind::Semi);
        let span = exprs
            .last()
            .map(|e| start.merge(e.span()))
            .unwrap_or(start);
        Ok(ReturnStat { exprs, span })
    }

    fn parse_statement(&mut self) -> Result<Statement, SyntaxError> {
        match self.current_kind() {
            TokenKind::Semi => {
                self.advance();
                Ok(Statement::Empty)
            }
            TokenKind::Break => {
                let span = self.advance().span;
                Ok(Statement::Break(span))
            }
            TokenKind::Goto => {
                self.advance();
                let name = self.expect_name("label name after `goto`")?;
                Ok(Statement::Goto(name))
            }
            TokenKind::ColonColon => {
                self.advance();
                let name = self.expect_name("label name")?;
                self.expect(TokenKind::ColonColon)?;
                Ok(Statement::Label(name))
            }
            TokenKind::Do => {
                self.advance();
                let block = self.parse_block()?;
                self.expect(TokenKind::End)?;
                Ok(Statement::Do(block))
            }
            TokenKind::While => {
                self.advance();
                let condition = self.parse_expr()?;
                self.expect(TokenKind::Do)?;
                let body = self.parse_block()?;
                self.expect(TokenKind::End)?;
                Ok(Statement::While(WhileStat { condition, body }))
            }
            TokenKind::Repeat => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(TokenKind::Until)?;
                let condition = self.parse_expr()?;
                Ok(Statement::Repeat(RepeatStat { body, condition }))
            }
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Function => self.parse_function_decl(),
            TokenKind::Local => self.parse_local(),
            _ => self.parse_expr_statement(),
        }
    }

    fn parse_if(&mut self) -> Result<Statement, SyntaxError> {
        self.expect(TokenKind::If)?;
        let mut arms = Vec::new();

        let guard = self.parse_expr()?;
        self.expect(TokenKind::Then)?;
        arms.push((guard, self.parse_block()?));

        let mut else_block = None;
        loop {
            match self.current_kind() {
                TokenKind::Elseif => {
                    self.advance();
                    let guard = self.parse_expr()?;
                    self.expect(TokenKind::Then)?;
                    arms.push((guard, self.parse_block()?));
                }
                TokenKind::Else => {
                    self.advance();
                    else_block = Some(self.parse_block()?);
                    self.expect(TokenKind::End)?;
                    break;
                }
                TokenKind::End => {
                    self.advance();
                    break;
                }
                other => {
                    return Err(SyntaxError::new(
                        format!(
                            "Expected `elseif`, `else` or `end` but found {}",
                            other.describe()
                        ),
                        self.current_span(),
                    ));
                }
            }
        }

        Ok(Statement::If(IfStat { arms, else_block }))
    }

    fn parse_for(&mut self) -> Result<Statement, SyntaxError> {
        self.expect(TokenKind::For)?;
        let first = self.expect_name("loop variable")?;

        if self.matches(TokenKind::Eq) {
            let start = self.parse_expr()?;
            self.expect(TokenKind::Comma)?;
            let limit = self.parse_expr()?;
            let step = if self.matches(TokenKind::Comma) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(TokenKind::Do)?;
            let body = self.parse_block()?;
            self.expect(TokenKind::End)?;
            return Ok(Statement::NumericFor(NumericForStat {
                variable: first,
                start,
                limit,
                step,
                body,
            }));
        }

        let mut names = vec![first];
        while self.matches(TokenKind::Comma) {
            names.push(self.expect_name("loop variable")?);
        }
        self.expect(TokenKind::In)?;
        let exprs = self.parse_expr_list()?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_block()?;
        self.expect(TokenKind::End)?;
        Ok(Statement::GenericFor(GenericForStat { names, exprs, body }))
    }

    fn parse_function_decl(&mut self) -> Result<Statement, SyntaxError> {
        self.expect(TokenKind::Function)?;
        let mut path = vec![self.expect_name("function name")?];
        let mut is_method = false;
        loop {
            if self.matches(TokenKind::Dot) {
                path.push(self.expect_name("name after `.`")?);
            } else if self.matches(TokenKind::Colon) {
                path.push(self.expect_name("method name after `:`")?);
                is_method = true;
                break;
            } else {
                break;
            }
        }
        let body = self.parse_func_body(is_method)?;
        Ok(Statement::FunctionDecl(FunctionDeclStat {
            path,
            is_method,
            body: Rc::new(body),
        }))
    }

    fn parse_local(&mut self) -> Result<Statement, SyntaxError> {
        self.expect(TokenKind::Local)?;

        if self.matches(TokenKind::Function) {
            let name = self.expect_name("function name")?;
            let body = self.parse_func_body(false)?;
            return Ok(Statement::LocalFunction(LocalFunctionStat {
                name,
                body: Rc::new(body),
            }));
        }

        let mut names = Vec::new();
        let mut attribs = Vec::new();
        loop {
            names.push(self.expect_name("variable name")?);
            if self.matches(TokenKind::Lt) {
                let attrib = self.expect_name("attribute name")?;
                self.expect(TokenKind::Gt)?;
                attribs.push(Some(attrib));
            } else {
                attribs.push(None);
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }

        let exprs = if self.matches(TokenKind::Eq) {
            self.parse_expr_list()?
        } else {
            Vec::new()
        };

        Ok(Statement::Local(LocalStat {
            names,
            attribs,
            exprs,
        }))
    }

    /// Either a multiple assignment or a function-call statement; both start
    /// with a prefix expression.
    fn parse_expr_statement(&mut self) -> Result<Statement, SyntaxError> {
        let first = self.parse_prefix_expr()?;

        if self.check(&TokenKind::Eq) || self.check(&TokenKind::Comma) {
            let mut targets = vec![first];
            while self.matches(TokenKind::Comma) {
                targets.push(self.parse_prefix_expr()?);
            }
            for target in &targets {
                if !matches!(target, Expr::Name(_) | Expr::Index(_)) {
                    return Err(SyntaxError::new(
                        "Cannot assign to this expression",
                        target.span(),
                    )
                    .with_help("assignment targets must be names or table fields"));
                }
            }
            self.expect(TokenKind::Eq)?;
            let exprs = self.parse_expr_list()?;
            return Ok(Statement::Assign(AssignStat { targets, exprs }));
        }

        match first {
            Expr::Call(_) | Expr::MethodCall(_) => Ok(Statement::Call(first)),
            other => Err(SyntaxError::new(
                "Expression statements must be function calls",
                other.span(),
            )),
        }
    }

    fn parse_func_body(&mut self, is_method: bool) -> Result<FuncBody, SyntaxError> {
        let start = self.expect(TokenKind::LParen)?.span;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.matches(TokenKind::Ellipsis) {
                    params.push("...".to_string());
                    break;
                }
                params.push(self.expect_name("parameter name")?.text);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let block = self.parse_block()?;
        let end = self.expect(TokenKind::End)?.span;
        Ok(FuncBody {
            params,
            block,
            span: start.merge(end),
        })
    }

    // ---- expressions ----

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut exprs = vec![self.parse_expr()?];
        while self.matches(TokenKind::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    fn parse_expr(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;

        while let Some(op) = binary_op(self.current_kind()) {
            let (precedence, right_assoc) = binary_precedence(op);
            if precedence < min_precedence {
                break;
            }
            self.advance();
            let next_min = if right_assoc {
                precedence
            } else {
                precedence + 1
            };
            let right = self.parse_binary(next_min)?;
            let span = left.span().merge(right.span());
            left = Expr::Binary(Box::new(BinaryExpr {
                op,
                left,
                right,
                span,
            }));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        let op = match self.current_kind() {
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Hash => Some(UnaryOp::Len),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };

        if let Some(op) = op {
            let start = self.advance().span;
            // Unary operators bind tighter than any binary operator except
            // `^`, which wins over a unary on its left.
            let operand = self.parse_binary(UNARY_PRECEDENCE)?;
            let span = start.merge(operand.span());
            return Ok(Expr::Unary(Box::new(UnaryExpr { op, operand, span })));
        }

        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.parse_suffixed()?;
        if self.check(&TokenKind::Caret) {
            self.advance();
            // Right-associative, and the exponent admits fresh unary
            // operators: `2^-2` parses.
            let exponent = self.parse_unary()?;
            let span = base.span().merge(exponent.span());
            return Ok(Expr::Binary(Box::new(BinaryExpr {
                op: BinaryOp::Pow,
                left: base,
                right: exponent,
                span,
            })));
        }
        Ok(base)
    }

    fn parse_suffixed(&mut self) -> Result<Expr, SyntaxError> {
        match self.current_kind().clone() {
            TokenKind::Nil => Ok(Expr::Nil(self.advance().span)),
            TokenKind::True => Ok(Expr::True(self.advance().span)),
            TokenKind::False => Ok(Expr::False(self.advance().span)),
            TokenKind::Ellipsis => Ok(Expr::Varargs(self.advance().span)),
            TokenKind::Int(value) => Ok(Expr::Int(value, self.advance().span)),
            TokenKind::Float(value) => Ok(Expr::Float(value, self.advance().span)),
            TokenKind::Str(value) => Ok(Expr::Str(value, self.advance().span)),
            TokenKind::Function => {
                self.advance();
                let body = self.parse_func_body(false)?;
                Ok(Expr::Function(Rc::new(body)))
            }
            TokenKind::LBrace => self.parse_table().map(Expr::Table),
            _ => self.parse_prefix_expr(),
        }
    }

    fn parse_prefix_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = match self.current_kind().clone() {
            TokenKind::Name(text) => {
                let span = self.advance().span;
                Expr::Name(Name { text, span })
            }
            TokenKind::LParen => {
                let start = self.advance().span;
                let inner = self.parse_expr()?;
                let end = self.expect(TokenKind::RParen)?.span;
                Expr::Paren(Box::new(inner), start.merge(end))
            }
            other => {
                return Err(SyntaxError::new(
                    format!("Unexpected {} in expression", other.describe()),
                    self.current_span(),
                ));
            }
        };

        loop {
            match self.current_kind().clone() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_name("field name after `.`")?;
                    let span = expr.span().merge(name.span);
                    expr = Expr::Index(Box::new(IndexExpr {
                        object: expr,
                        index: IndexKey::Dot(name),
                        span,
                    }));
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.parse_expr()?;
                    let end = self.expect(TokenKind::RBracket)?.span;
                    let span = expr.span().merge(end);
                    expr = Expr::Index(Box::new(IndexExpr {
                        object: expr,
                        index: IndexKey::Bracket(key),
                        span,
                    }));
                }
                TokenKind::Colon => {
                    self.advance();
                    let method = self.expect_name("method name after `:`")?;
                    let (args, end) = self.parse_call_args()?;
                    let span = expr.span().merge(end);
                    expr = Expr::MethodCall(Box::new(MethodCallExpr {
                        object: expr,
                        method,
                        args,
                        span,
                    }));
                }
                TokenKind::LParen | TokenKind::Str(_) | TokenKind::LBrace => {
                    let (args, end) = self.parse_call_args()?;
                    let span = expr.span().merge(end);
                    expr = Expr::Call(Box::new(CallExpr {
                        callee: expr,
                        args,
                        span,
                    }));
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    /// Call arguments: `(explist)`, a single string literal, or a single
    /// table constructor.
    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Span), SyntaxError> {
        match self.current_kind().clone() {
            TokenKind::LParen => {
                self.advance();
                let args = if self.check(&TokenKind::RParen) {
                    Vec::new()
                } else {
                    self.parse_expr_list()?
                };
                let end = self.expect(TokenKind::RParen)?.span;
                Ok((args, end))
            }
            TokenKind::Str(value) => {
                let span = self.advance().span;
                Ok((vec![Expr::Str(value, span)], span))
            }
            TokenKind::LBrace => {
                let table = self.parse_table()?;
                let span = table.span;
                Ok((vec![Expr::Table(table)], span))
            }
            other => Err(SyntaxError::new(
                format!("Expected call arguments but found {}", other.describe()),
                self.current_span(),
            )),
        }
    }

    fn parse_table(&mut self) -> Result<TableExpr, SyntaxError> {
        let start = self.expect(TokenKind::LBrace)?.span;
        let mut fields = Vec::new();

        while !self.check(&TokenKind::RBrace) {
            match self.current_kind().clone() {
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    self.expect(TokenKind::Eq)?;
                    let value = self.parse_expr()?;
                    fields.push(TableField::Keyed(key, value));
                }
                TokenKind::Name(text) if self.peek_is(&TokenKind::Eq) => {
                    let span = self.advance().span;
                    self.advance();
                    let value = self.parse_expr()?;
                    fields.push(TableField::Named(Name { text, span }, value));
                }
                _ => {
                    fields.push(TableField::Positional(self.parse_expr()?));
                }
            }

            if !self.matches(TokenKind::Comma) && !self.matches(TokenKind::Semi) {
                break;
            }
        }

        let end = self.expect(TokenKind::RBrace)?.span;
        Ok(TableExpr {
            fields,
            span: start.merge(end),
        })
    }

    fn peek_is(&self, kind: &TokenKind) -> bool {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.kind == kind)
            .unwrap_or(false)
    }
}

const UNARY_PRECEDENCE: u8 = 12;

fn binary_op(kind: &TokenKind) -> Option<BinaryOp> {
    Some(match kind {
        TokenKind::Or => BinaryOp::Or,
        TokenKind::And => BinaryOp::And,
        TokenKind::Lt => BinaryOp::Lt,
        TokenKind::Gt => BinaryOp::Gt,
        TokenKind::LtEq => BinaryOp::LtEq,
        TokenKind::GtEq => BinaryOp::GtEq,
        TokenKind::TildeEq => BinaryOp::NotEq,
        TokenKind::EqEq => BinaryOp::Eq,
        TokenKind::Pipe => BinaryOp::BitOr,
        TokenKind::Tilde => BinaryOp::BitXor,
        TokenKind::Ampersand => BinaryOp::BitAnd,
        TokenKind::LtLt => BinaryOp::Shl,
        TokenKind::GtGt => BinaryOp::Shr,
        TokenKind::DotDot => BinaryOp::Concat,
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::SlashSlash => BinaryOp::FloorDiv,
        TokenKind::Percent => BinaryOp::Mod,
        TokenKind::Caret => BinaryOp::Pow,
        _ => return None,
    })
}

/// Lua operator precedence. `..` and `^` are right-associative.
fn binary_precedence(op: BinaryOp) -> (u8, bool) {
    match op {
        BinaryOp::Or => (1, false),
        BinaryOp::And => (2, false),
        BinaryOp::Lt
        | BinaryOp::Gt
        | BinaryOp::LtEq
        | BinaryOp::GtEq
        | BinaryOp::NotEq
        | BinaryOp::Eq => (3, false),
        BinaryOp::BitOr => (4, false),
        BinaryOp::BitXor => (5, false),
        BinaryOp::BitAnd => (6, false),
        BinaryOp::Shl | BinaryOp::Shr => (7, false),
        BinaryOp::Concat => (9, true),
        BinaryOp::Add | BinaryOp::Sub => (10, false),
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod => (11, false),
        BinaryOp::Pow => (14, true),
    }
}
