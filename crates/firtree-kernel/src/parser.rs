//! Recursive-descent parser for the kernel language.
//!
//! Parsing is best-effort: syntax errors are pushed to the compile log and
//! the parser resynchronises on `;` / `}` so that several diagnostics can be
//! reported in one pass.

use crate::ast::*;
use crate::diag::{CompileLog, DiagnosticKind};
use crate::lexer::{lex, LineMap, Token};
use firtree_ir::{ParamDirection, Type};

struct Parser<'s, 'l> {
    tokens: Vec<(Token<'s>, Span)>,
    pos: usize,
    line_map: LineMap,
    source_len: usize,
    log: &'l mut CompileLog,
}

/// Parse a full translation unit.
pub fn parse(source: &str, log: &mut CompileLog) -> Program {
    let mut parser = Parser {
        tokens: lex(source),
        pos: 0,
        line_map: LineMap::new(source),
        source_len: source.len(),
        log,
    };
    parser.parse_program()
}

impl<'s, 'l> Parser<'s, 'l> {
    fn peek(&self) -> Option<Token<'s>> {
        self.tokens.get(self.pos).map(|(t, _)| *t)
    }

    fn peek2(&self) -> Option<Token<'s>> {
        self.tokens.get(self.pos + 1).map(|(t, _)| *t)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| s.clone())
            .unwrap_or(self.source_len..self.source_len)
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|(_, s)| s.clone())
            .unwrap_or(self.source_len..self.source_len)
    }

    fn bump(&mut self) -> Option<(Token<'s>, Span)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn at(&self, token: Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: Token) -> bool {
        if self.at(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error_at(&mut self, span: Span, message: impl Into<String>) {
        let (line, column) = self.line_map.line_col(span.start);
        self.log.error(DiagnosticKind::SyntaxError, line, column, message);
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let span = self.span();
        self.error_at(span, message);
    }

    fn expect(&mut self, token: Token) -> Option<Span> {
        if self.at(token) {
            self.bump().map(|(_, s)| s)
        } else {
            let found = self
                .peek()
                .map(|t| t.describe())
                .unwrap_or_else(|| "end of file".to_string());
            self.error_here(format!("expected {}, found {}", token.describe(), found));
            None
        }
    }

    fn expect_ident(&mut self) -> Option<(String, Span)> {
        match self.peek() {
            Some(Token::IDENT(name)) => {
                let (_, span) = self.bump().unwrap();
                Some((name.to_string(), span))
            }
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of file".to_string());
                self.error_here(format!("expected identifier, found {}", found));
                None
            }
        }
    }

    /// Skip forward to just past the next `;`, stopping before `}`.
    fn recover_to_semi(&mut self) {
        let mut depth = 0usize;
        while let Some(t) = self.peek() {
            match t {
                Token::SEMICOLON if depth == 0 => {
                    self.bump();
                    return;
                }
                Token::L_CURLY | Token::L_PAREN | Token::L_BRACK => depth += 1,
                Token::R_CURLY if depth == 0 => return,
                Token::R_CURLY | Token::R_PAREN | Token::R_BRACK => depth = depth.saturating_sub(1),
                _ => {}
            }
            self.bump();
        }
    }

    /// Skip a whole `{ ... }` body, tracking nesting.
    fn recover_past_block(&mut self) {
        let mut depth = 0usize;
        while let Some(t) = self.peek() {
            match t {
                Token::L_CURLY => depth += 1,
                Token::R_CURLY => {
                    self.bump();
                    if depth <= 1 {
                        return;
                    }
                    depth -= 1;
                    continue;
                }
                _ => {}
            }
            self.bump();
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Declarations

    fn parse_program(&mut self) -> Program {
        let mut decls = Vec::new();
        while self.peek().is_some() {
            let before = self.pos;
            if let Some(decl) = self.parse_decl() {
                decls.push(decl);
            }
            if self.pos == before {
                // Ensure forward progress on unparseable input.
                self.bump();
            }
        }
        Program { decls }
    }

    fn parse_decl(&mut self) -> Option<Decl> {
        let start = self.span().start;
        let is_kernel = self.eat(Token::KERNEL_KW);
        let is_const = self.eat(Token::CONST_KW);

        let ty = match self.peek().and_then(|t| t.type_keyword()) {
            Some(ty) => {
                self.bump();
                ty
            }
            None => {
                self.error_here("expected a declaration");
                self.recover_to_semi();
                return None;
            }
        };

        let (name, name_span) = self.expect_ident()?;

        if self.at(Token::L_PAREN) {
            let func = self.parse_function(is_kernel, ty, name, start)?;
            return Some(Decl::Function(func));
        }

        // Global constant.
        if !is_const {
            self.error_at(name_span, "global variables must be `const`");
        }
        self.expect(Token::EQ)?;
        let init = match self.parse_expr() {
            Some(e) => e,
            None => {
                self.recover_to_semi();
                return None;
            }
        };
        self.expect(Token::SEMICOLON);
        Some(Decl::GlobalConst(GlobalConst {
            name,
            ty,
            init,
            span: start..self.prev_span().end,
        }))
    }

    fn parse_function(&mut self, is_kernel: bool, ret_ty: Type, name: String, start: usize) -> Option<FunctionDecl> {
        self.expect(Token::L_PAREN)?;
        let mut params = Vec::new();
        if !self.at(Token::R_PAREN) {
            loop {
                match self.parse_param() {
                    Some(p) => params.push(p),
                    None => {
                        self.recover_past_block();
                        return None;
                    }
                }
                if !self.eat(Token::COMMA) {
                    break;
                }
            }
        }
        self.expect(Token::R_PAREN)?;
        if self.expect(Token::L_CURLY).is_none() {
            self.recover_past_block();
            return None;
        }
        let body = self.parse_block_body();
        Some(FunctionDecl {
            is_kernel,
            ret_ty,
            name,
            params,
            body,
            span: start..self.prev_span().end,
        })
    }

    fn parse_param(&mut self) -> Option<ParamDecl> {
        let start = self.span().start;
        let mut direction = ParamDirection::In;
        let mut is_static = false;
        let mut is_const = false;
        loop {
            match self.peek() {
                Some(Token::CONST_KW) => {
                    self.bump();
                    is_const = true;
                }
                Some(Token::STATIC_KW) => {
                    self.bump();
                    is_static = true;
                }
                Some(Token::IN_KW) => {
                    self.bump();
                    direction = ParamDirection::In;
                }
                Some(Token::OUT_KW) => {
                    self.bump();
                    direction = ParamDirection::Out;
                }
                Some(Token::INOUT_KW) => {
                    self.bump();
                    direction = ParamDirection::InOut;
                }
                _ => break,
            }
        }
        let ty = match self.peek().and_then(|t| t.type_keyword()) {
            Some(ty) => {
                self.bump();
                ty
            }
            None => {
                self.error_here("expected parameter type");
                return None;
            }
        };
        let (name, _) = self.expect_ident()?;
        Some(ParamDecl {
            name,
            ty,
            direction,
            is_static,
            is_const,
            span: start..self.prev_span().end,
        })
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Statements

    /// Parse statements until the closing `}` (which is consumed).
    fn parse_block_body(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.error_here("unexpected end of file, expected `}`");
                    break;
                }
                Some(Token::R_CURLY) => {
                    self.bump();
                    break;
                }
                Some(_) => {
                    let before = self.pos;
                    stmts.push(self.parse_stmt());
                    if self.pos == before {
                        self.bump();
                    }
                }
            }
        }
        stmts
    }

    fn parse_stmt(&mut self) -> Stmt {
        let start = self.span().start;
        match self.peek() {
            Some(Token::L_CURLY) => {
                self.bump();
                Stmt::Block(self.parse_block_body())
            }
            Some(Token::SEMICOLON) => {
                self.bump();
                Stmt::Empty
            }
            Some(Token::IF_KW) => self.parse_if(start),
            Some(Token::FOR_KW) => self.parse_for(start),
            Some(Token::WHILE_KW) => self.parse_while(start),
            Some(Token::DO_KW) => self.parse_do_while(start),
            Some(Token::RETURN_KW) => {
                self.bump();
                let value = if self.at(Token::SEMICOLON) {
                    None
                } else {
                    match self.parse_expr() {
                        Some(e) => Some(e),
                        None => {
                            self.recover_to_semi();
                            return Stmt::Empty;
                        }
                    }
                };
                self.expect(Token::SEMICOLON);
                Stmt::Return { value, span: start..self.prev_span().end }
            }
            Some(Token::BREAK_KW) => {
                self.bump();
                self.expect(Token::SEMICOLON);
                Stmt::Break(start..self.prev_span().end)
            }
            Some(Token::CONTINUE_KW) => {
                self.bump();
                self.expect(Token::SEMICOLON);
                Stmt::Continue(start..self.prev_span().end)
            }
            Some(t) if t == Token::CONST_KW || t == Token::STATIC_KW || t.type_keyword().is_some() => {
                self.parse_var_decl(start)
            }
            Some(_) => {
                let expr = match self.parse_expr() {
                    Some(e) => e,
                    None => {
                        self.recover_to_semi();
                        return Stmt::Empty;
                    }
                };
                self.expect(Token::SEMICOLON);
                Stmt::Expr(expr)
            }
            None => Stmt::Empty,
        }
    }

    fn parse_var_decl(&mut self, start: usize) -> Stmt {
        let is_const = self.eat(Token::CONST_KW);
        let is_static = self.eat(Token::STATIC_KW);
        let ty = match self.peek().and_then(|t| t.type_keyword()) {
            Some(ty) => {
                self.bump();
                ty
            }
            None => {
                self.error_here("expected type in declaration");
                self.recover_to_semi();
                return Stmt::Empty;
            }
        };
        let mut vars = Vec::new();
        loop {
            let var_start = self.span().start;
            let Some((name, _)) = self.expect_ident() else {
                self.recover_to_semi();
                return Stmt::Empty;
            };
            let init = if self.eat(Token::EQ) {
                match self.parse_expr() {
                    Some(e) => Some(e),
                    None => {
                        self.recover_to_semi();
                        return Stmt::Empty;
                    }
                }
            } else {
                None
            };
            vars.push((name, init, var_start..self.prev_span().end));
            if !self.eat(Token::COMMA) {
                break;
            }
        }
        self.expect(Token::SEMICOLON);
        Stmt::Decl(VarDecl {
            ty,
            is_const,
            is_static,
            vars,
            span: start..self.prev_span().end,
        })
    }

    fn parse_if(&mut self, start: usize) -> Stmt {
        self.bump();
        self.expect(Token::L_PAREN);
        let cond = match self.parse_expr() {
            Some(e) => e,
            None => {
                self.recover_to_semi();
                return Stmt::Empty;
            }
        };
        self.expect(Token::R_PAREN);
        let then_branch = Box::new(self.parse_stmt());
        let else_branch = if self.eat(Token::ELSE_KW) {
            Some(Box::new(self.parse_stmt()))
        } else {
            None
        };
        Stmt::If {
            cond,
            then_branch,
            else_branch,
            span: start..self.prev_span().end,
        }
    }

    fn parse_for(&mut self, start: usize) -> Stmt {
        self.bump();
        self.expect(Token::L_PAREN);
        let init = if self.eat(Token::SEMICOLON) {
            None
        } else {
            Some(Box::new(self.parse_stmt()))
        };
        let cond = if self.at(Token::SEMICOLON) {
            None
        } else {
            self.parse_expr()
        };
        self.expect(Token::SEMICOLON);
        let step = if self.at(Token::R_PAREN) {
            None
        } else {
            self.parse_expr()
        };
        self.expect(Token::R_PAREN);
        let body = Box::new(self.parse_stmt());
        Stmt::For {
            init,
            cond,
            step,
            body,
            span: start..self.prev_span().end,
        }
    }

    fn parse_while(&mut self, start: usize) -> Stmt {
        self.bump();
        self.expect(Token::L_PAREN);
        let cond = match self.parse_expr() {
            Some(e) => e,
            None => {
                self.recover_to_semi();
                return Stmt::Empty;
            }
        };
        self.expect(Token::R_PAREN);
        let body = Box::new(self.parse_stmt());
        Stmt::While { cond, body, span: start..self.prev_span().end }
    }

    fn parse_do_while(&mut self, start: usize) -> Stmt {
        self.bump();
        let body = Box::new(self.parse_stmt());
        self.expect(Token::WHILE_KW);
        self.expect(Token::L_PAREN);
        let cond = match self.parse_expr() {
            Some(e) => e,
            None => {
                self.recover_to_semi();
                return Stmt::Empty;
            }
        };
        self.expect(Token::R_PAREN);
        self.expect(Token::SEMICOLON);
        Stmt::DoWhile { body, cond, span: start..self.prev_span().end }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Expressions

    fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let lhs = self.parse_ternary()?;
        let op = match self.peek() {
            Some(Token::EQ) => None,
            Some(Token::PLUSEQ) => Some(BinOp::Add),
            Some(Token::MINUSEQ) => Some(BinOp::Sub),
            Some(Token::STAREQ) => Some(BinOp::Mul),
            Some(Token::SLASHEQ) => Some(BinOp::Div),
            _ => return Some(lhs),
        };
        self.bump();
        let value = self.parse_assign()?;
        Some(Expr {
            kind: ExprKind::Assign {
                op,
                target: Box::new(lhs),
                value: Box::new(value),
            },
            span: start..self.prev_span().end,
        })
    }

    fn parse_ternary(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let cond = self.parse_logical_or()?;
        if !self.eat(Token::QUESTION) {
            return Some(cond);
        }
        let if_true = self.parse_expr()?;
        self.expect(Token::COLON)?;
        let if_false = self.parse_assign()?;
        Some(Expr {
            kind: ExprKind::Ternary {
                cond: Box::new(cond),
                if_true: Box::new(if_true),
                if_false: Box::new(if_false),
            },
            span: start..self.prev_span().end,
        })
    }

    fn parse_logical_or(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let mut lhs = self.parse_logical_and()?;
        while self.eat(Token::PIPE2) {
            let rhs = self.parse_logical_and()?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op: BinOp::LogicalOr,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: start..self.prev_span().end,
            };
        }
        Some(lhs)
    }

    fn parse_logical_and(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let mut lhs = self.parse_equality()?;
        while self.eat(Token::AMP2) {
            let rhs = self.parse_equality()?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op: BinOp::LogicalAnd,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: start..self.prev_span().end,
            };
        }
        Some(lhs)
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EQ2) => BinOp::Eq,
                Some(Token::NEQ) => BinOp::Ne,
                _ => return Some(lhs),
            };
            self.bump();
            let rhs = self.parse_relational()?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: start..self.prev_span().end,
            };
        }
    }

    fn parse_relational(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::L_ANGLE) => BinOp::Lt,
                Some(Token::R_ANGLE) => BinOp::Gt,
                Some(Token::LTEQ) => BinOp::Le,
                Some(Token::GTEQ) => BinOp::Ge,
                _ => return Some(lhs),
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: start..self.prev_span().end,
            };
        }
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::PLUS) => BinOp::Add,
                Some(Token::MINUS) => BinOp::Sub,
                _ => return Some(lhs),
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: start..self.prev_span().end,
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::STAR) => BinOp::Mul,
                Some(Token::SLASH) => BinOp::Div,
                Some(Token::PERCENT) => BinOp::Rem,
                _ => return Some(lhs),
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: start..self.prev_span().end,
            };
        }
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let op = match self.peek() {
            Some(Token::MINUS) => Some(UnOp::Neg),
            Some(Token::BANG) => Some(UnOp::Not),
            Some(Token::PLUSPLUS) => Some(UnOp::PreInc),
            Some(Token::MINUSMINUS) => Some(UnOp::PreDec),
            Some(Token::PLUS) => {
                // Unary plus is a no-op.
                self.bump();
                return self.parse_unary();
            }
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let expr = self.parse_unary()?;
            return Some(Expr {
                kind: ExprKind::Unary { op, expr: Box::new(expr) },
                span: start..self.prev_span().end,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let start = self.span().start;
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::DOT) => {
                    self.bump();
                    let (field, _) = self.expect_ident()?;
                    expr = Expr {
                        kind: ExprKind::Field { base: Box::new(expr), field },
                        span: start..self.prev_span().end,
                    };
                }
                Some(Token::L_BRACK) => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(Token::R_BRACK)?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        span: start..self.prev_span().end,
                    };
                }
                Some(Token::PLUSPLUS) => {
                    self.bump();
                    expr = Expr {
                        kind: ExprKind::Postfix { op: IncDec::Inc, expr: Box::new(expr) },
                        span: start..self.prev_span().end,
                    };
                }
                Some(Token::MINUSMINUS) => {
                    self.bump();
                    expr = Expr {
                        kind: ExprKind::Postfix { op: IncDec::Dec, expr: Box::new(expr) },
                        span: start..self.prev_span().end,
                    };
                }
                _ => return Some(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> Option<Vec<Expr>> {
        self.expect(Token::L_PAREN)?;
        let mut args = Vec::new();
        if !self.at(Token::R_PAREN) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(Token::COMMA) {
                    break;
                }
            }
        }
        self.expect(Token::R_PAREN)?;
        Some(args)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let start = self.span().start;
        match self.peek() {
            Some(Token::INT_NUMBER(text)) => {
                self.bump();
                let value = parse_int_literal(text);
                match value {
                    Some(v) => Some(Expr {
                        kind: ExprKind::IntLit(v),
                        span: start..self.prev_span().end,
                    }),
                    None => {
                        self.error_at(start..self.prev_span().end, format!("integer literal `{}` out of range", text));
                        None
                    }
                }
            }
            Some(Token::FLOAT_NUMBER(text)) => {
                self.bump();
                match text.parse::<f32>() {
                    Ok(v) => Some(Expr {
                        kind: ExprKind::FloatLit(v),
                        span: start..self.prev_span().end,
                    }),
                    Err(_) => {
                        self.error_at(start..self.prev_span().end, format!("invalid float literal `{}`", text));
                        None
                    }
                }
            }
            Some(Token::TRUE_KW) => {
                self.bump();
                Some(Expr { kind: ExprKind::BoolLit(true), span: start..self.prev_span().end })
            }
            Some(Token::FALSE_KW) => {
                self.bump();
                Some(Expr { kind: ExprKind::BoolLit(false), span: start..self.prev_span().end })
            }
            Some(Token::IDENT(name)) => {
                let name = name.to_string();
                self.bump();
                if self.at(Token::L_PAREN) {
                    let args = self.parse_call_args()?;
                    Some(Expr {
                        kind: ExprKind::Call { name, args },
                        span: start..self.prev_span().end,
                    })
                } else {
                    Some(Expr { kind: ExprKind::Ident(name), span: start..self.prev_span().end })
                }
            }
            Some(t) if t.type_keyword().is_some() && self.peek2() == Some(Token::L_PAREN) => {
                let ty = t.type_keyword().unwrap();
                self.bump();
                let args = self.parse_call_args()?;
                Some(Expr {
                    kind: ExprKind::Construct { ty, args },
                    span: start..self.prev_span().end,
                })
            }
            Some(Token::L_PAREN) => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(Token::R_PAREN)?;
                Some(inner)
            }
            other => {
                let found = other
                    .map(|t| t.describe())
                    .unwrap_or_else(|| "end of file".to_string());
                self.error_here(format!("expected expression, found {}", found));
                None
            }
        }
    }
}

fn parse_int_literal(text: &str) -> Option<i32> {
    let (radix, digits) = if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (16, rest)
    } else if let Some(rest) = text.strip_prefix("0b") {
        (2, rest)
    } else if let Some(rest) = text.strip_prefix("0o") {
        (8, rest)
    } else {
        (10, text)
    };
    i32::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let mut log = CompileLog::new("test.kernel");
        let program = parse(source, &mut log);
        assert!(!log.has_errors(), "unexpected errors: {:?}", log.lines());
        program
    }

    #[test]
    fn parses_checker_kernel() {
        let program = parse_ok(
            "kernel vec4 checker(float size, vec4 a, vec4 b) {\n\
             \tvec2 dc = mod(destCoord(), 2.0 * size);\n\
             \treturn mix(a, b, step(size, dc.x));\n\
             }\n",
        );
        assert_eq!(program.decls.len(), 1);
        let Decl::Function(f) = &program.decls[0] else { panic!("expected function") };
        assert!(f.is_kernel);
        assert_eq!(f.name, "checker");
        assert_eq!(f.params.len(), 3);
        assert_eq!(f.body.len(), 2);
    }

    #[test]
    fn parses_control_flow() {
        let program = parse_ok(
            "float f(int n) {\n\
             \tfloat acc = 0.0;\n\
             \tfor (int i = 0; i < n; ++i) { acc += float(i); }\n\
             \twhile (acc > 100.0) { acc /= 2.0; if (acc < 50.0) break; }\n\
             \tdo { acc -= 1.0; } while (acc > 10.0);\n\
             \treturn acc;\n\
             }\n",
        );
        let Decl::Function(f) = &program.decls[0] else { panic!() };
        assert_eq!(f.body.len(), 5);
    }

    #[test]
    fn parses_ternary_and_swizzle() {
        let program = parse_ok("vec2 g(vec4 v) { return (v.x > 0.0) ? v.xy : v.zw; }");
        let Decl::Function(f) = &program.decls[0] else { panic!() };
        let Stmt::Return { value: Some(e), .. } = &f.body[0] else { panic!() };
        assert!(matches!(e.kind, ExprKind::Ternary { .. }));
    }

    #[test]
    fn reports_syntax_error_with_position() {
        let mut log = CompileLog::new("test.kernel");
        parse("kernel vec4 f() { return vec4(1.0 }\n", &mut log);
        assert!(log.has_errors());
        let line = &log.lines()[0];
        assert!(line.starts_with("test.kernel:1:"), "line = {}", line);
    }

    // Parsing the same source twice yields identical trees.
    #[test]
    fn parse_is_deterministic() {
        let source = "kernel vec4 f(static float k, sampler src) {\n\
                      \treturn sample(src, samplerTransform(src, destCoord())) * k;\n\
                      }\n";
        let a = parse_ok(source);
        let b = parse_ok(source);
        assert_eq!(a, b);
    }

    #[test]
    fn recovers_and_reports_multiple_errors() {
        let mut log = CompileLog::new("test.kernel");
        let program = parse(
            "float f() { return 1.0 + ; }\nfloat g() { return 2.0; }\n",
            &mut log,
        );
        assert!(log.has_errors());
        // The second function still parses.
        assert!(program
            .decls
            .iter()
            .any(|d| matches!(d, Decl::Function(f) if f.name == "g")));
    }
}
