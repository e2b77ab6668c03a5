//! Recursive descent parser for snippets.
//!
//! ```text
//! program   = { statement separator }
//! statement = "let" ident "=" expr
//!           | builtin "(" [ expr { "," expr } ] ")"
//!           | "repeat" "(" expr ")" statement
//!           | expr
//! expr      = term { ("+" | "-") term }
//! term      = unary { ("*" | "/") unary }
//! unary     = "-" unary | primary
//! primary   = int | string | ident | "(" expr ")" | "[" [ expr { "," expr } ] "]"
//! ```
//!
//! A statement with a syntax error is reported and skipped up to the next
//! separator, so one pass reports every broken line.

use crate::record::Diagnostic;

use super::ast::{BinOp, Expr, Program, Statement, StatementKind};
use super::lexer::{Token, TokenKind};

const KEYWORDS: &[&str] = &["let", "print", "dump", "sleep", "throw", "exit", "repeat"];

pub fn parse(tokens: &[Token]) -> (Program, Vec<Diagnostic>) {
    let mut parser = Parser {
        tokens,
        pos: 0,
        diagnostics: Vec::new(),
    };
    let mut statements = Vec::new();

    loop {
        parser.skip_separators();
        if parser.at(&TokenKind::Eof) {
            break;
        }
        match parser.statement() {
            Ok(statement) => {
                if !parser.at(&TokenKind::Separator) && !parser.at(&TokenKind::Eof) {
                    let token = parser.peek().clone();
                    parser.error_at(&token, format!("expected end of statement, found {}", token.kind.describe()));
                    parser.recover();
                } else {
                    statements.push(statement);
                }
            }
            Err(diagnostic) => {
                parser.diagnostics.push(diagnostic);
                parser.recover();
            }
        }
    }

    (Program { statements }, parser.diagnostics)
}

type ParseResult<T> = std::result::Result<T, Diagnostic>;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &'a Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_next(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos + 1)
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> &'a Token {
        let token = self.peek();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<&'a Token> {
        if self.at(&kind) {
            Ok(self.advance())
        } else {
            let token = self.peek();
            Err(Diagnostic::error(
                format!("expected {}, found {}", kind.describe(), token.kind.describe()),
                token.line,
                token.column,
            ))
        }
    }

    fn error_at(&mut self, token: &Token, message: String) {
        self.diagnostics
            .push(Diagnostic::error(message, token.line, token.column));
    }

    fn skip_separators(&mut self) {
        while self.at(&TokenKind::Separator) {
            self.advance();
        }
    }

    fn recover(&mut self) {
        while !self.at(&TokenKind::Separator) && !self.at(&TokenKind::Eof) {
            self.advance();
        }
    }

    fn statement(&mut self) -> ParseResult<Statement> {
        let start = self.peek();
        let line = start.line;

        let builtin = match &start.kind {
            TokenKind::Ident(name) if KEYWORDS.contains(&name.as_str()) => Some(name.as_str()),
            _ => None,
        };

        let kind = match builtin {
            Some("let") => {
                self.advance();
                let name_token = self.advance();
                let name = match &name_token.kind {
                    TokenKind::Ident(name) if !KEYWORDS.contains(&name.as_str()) => name.clone(),
                    other => {
                        return Err(Diagnostic::error(
                            format!("expected variable name, found {}", other.describe()),
                            name_token.line,
                            name_token.column,
                        ));
                    }
                };
                self.expect(TokenKind::Assign)?;
                StatementKind::Let {
                    name,
                    value: self.expr()?,
                }
            }
            Some("repeat") => {
                self.advance();
                let mut args = self.call_args()?;
                if args.len() != 1 {
                    return Err(arity_error("repeat", 1, args.len(), start));
                }
                let count = args.remove(0);
                if self.at(&TokenKind::Separator) || self.at(&TokenKind::Eof) {
                    let token = self.peek();
                    return Err(Diagnostic::error(
                        "expected a statement after repeat(...)",
                        token.line,
                        token.column,
                    ));
                }
                StatementKind::Repeat {
                    count,
                    body: Box::new(self.statement()?),
                }
            }
            Some(name) => {
                self.advance();
                let args = self.call_args()?;
                builtin_statement(name, args, start)?
            }
            None => {
                if let TokenKind::Ident(name) = &start.kind {
                    if self.peek_next().is_some_and(|t| t.kind == TokenKind::LParen) {
                        return Err(Diagnostic::error(
                            format!("unknown function '{}'", name),
                            start.line,
                            start.column,
                        ));
                    }
                }
                let value = self.expr()?;
                self.diagnostics.push(Diagnostic::warning(
                    "expression result is unused",
                    start.line,
                    start.column,
                ));
                StatementKind::Expr { value }
            }
        };

        Ok(Statement { line, kind })
    }

    fn call_args(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect(TokenKind::LParen)?;
        let args = self.expr_list(TokenKind::RParen)?;
        Ok(args)
    }

    /// Comma separated expressions up to and including `close`.
    fn expr_list(&mut self, close: TokenKind) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        if self.at(&close) {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.at(&TokenKind::Comma) {
                self.advance();
                continue;
            }
            self.expect(close.clone())?;
            return Ok(items);
        }
    }

    fn expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.at(&TokenKind::Minus) {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let token = self.advance();
        match &token.kind {
            TokenKind::Int(n) => Ok(Expr::Int(*n)),
            TokenKind::Str(s) => Ok(Expr::Str(s.clone())),
            TokenKind::Ident(name) if KEYWORDS.contains(&name.as_str()) => Err(Diagnostic::error(
                format!("'{}' cannot be used as a value", name),
                token.line,
                token.column,
            )),
            TokenKind::Ident(name) => Ok(Expr::Var(name.clone())),
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => Ok(Expr::List(self.expr_list(TokenKind::RBracket)?)),
            other => Err(Diagnostic::error(
                format!("expected an expression, found {}", other.describe()),
                token.line,
                token.column,
            )),
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn arity_error(name: &str, expected: usize, found: usize, at: &Token) -> Diagnostic {
    Diagnostic::error(
        format!(
            "{}() takes {} argument{}, found {}",
            name,
            expected,
            if expected == 1 { "" } else { "s" },
            found
        ),
        at.line,
        at.column,
    )
}

fn builtin_statement(name: &str, mut args: Vec<Expr>, at: &Token) -> ParseResult<StatementKind> {
    let expected = if name == "dump" { 2 } else { 1 };
    if args.len() != expected {
        return Err(arity_error(name, expected, args.len(), at));
    }

    let first = args.remove(0);
    Ok(match name {
        "print" => StatementKind::Print { value: first },
        "dump" => StatementKind::Dump {
            header: first,
            value: args.remove(0),
        },
        "sleep" => StatementKind::Sleep { millis: first },
        "throw" => StatementKind::Throw { message: first },
        "exit" => StatementKind::Exit { code: first },
        other => {
            return Err(Diagnostic::error(
                format!("unknown function '{}'", other),
                at.line,
                at.column,
            ));
        }
    })
}
