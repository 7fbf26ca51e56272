use std::collections::HashMap;
use std::io::BufRead;

use super::ast::{Expr, Function, Prototype};
use super::error::{Error, ErrorKind};
use super::lexer::Lexer;
use super::token::Token;

pub(crate) const ANON_EXPR: &str = "__anon_expr";

/// Binary operator precedences. Seeded with the built-ins; user `binary`
/// definitions install entries when their codegen succeeds.
pub(crate) struct OperatorTable(HashMap<char, i32>);

impl OperatorTable {
    pub(crate) fn new() -> OperatorTable {
        let mut table = HashMap::new();
        table.insert('=', 2);
        table.insert('<', 10);
        table.insert('+', 20);
        table.insert('-', 20);
        table.insert('*', 40);
        OperatorTable(table)
    }

    pub(crate) fn precedence(&self, op: char) -> Option<i32> {
        self.0.get(&op).copied()
    }

    pub(crate) fn install(&mut self, op: char, precedence: i32) {
        self.0.insert(op, precedence);
    }

    pub(crate) fn remove(&mut self, op: char) {
        self.0.remove(&op);
    }
}

/// One-token-lookahead recursive-descent parser over the token stream.
pub(crate) struct Parser<R> {
    lexer: Lexer<R>,
    cur: Token,
}

impl<R: BufRead> Parser<R> {
    pub(crate) fn new(lexer: Lexer<R>) -> Parser<R> {
        Parser {
            lexer,
            cur: Token::Eof,
        }
    }

    pub(crate) fn current(&self) -> &Token {
        &self.cur
    }

    pub(crate) fn advance(&mut self) {
        self.cur = self.lexer.next_token();
    }

    fn err<T>(msg: &str) -> Result<T, Error> {
        Err(Error::from(ErrorKind::Parse(msg.to_owned())))
    }

    fn tok_precedence(&self, ops: &OperatorTable) -> i32 {
        match self.cur {
            Token::Kwd(op) => ops.precedence(op).unwrap_or(-1),
            _ => -1,
        }
    }

    pub(crate) fn parse_definition(&mut self, ops: &OperatorTable) -> Result<Function, Error> {
        self.advance();
        let proto = self.parse_prototype()?;
        let body = self.parse_expression(ops)?;
        Ok(Function(Box::new(proto), Box::new(body)))
    }

    pub(crate) fn parse_extern(&mut self) -> Result<Prototype, Error> {
        self.advance();
        self.parse_prototype()
    }

    pub(crate) fn parse_toplevel(&mut self, ops: &OperatorTable) -> Result<Function, Error> {
        let body = self.parse_expression(ops)?;
        let proto = Prototype::new(ANON_EXPR.to_owned(), Vec::new());
        Ok(Function(Box::new(proto), Box::new(body)))
    }

    fn parse_expression(&mut self, ops: &OperatorTable) -> Result<Expr, Error> {
        let lhs = self.parse_unary(ops)?;
        self.parse_binop_rhs(ops, 0, lhs)
    }

    fn parse_binop_rhs(
        &mut self,
        ops: &OperatorTable,
        expr_prec: i32,
        mut lhs: Expr,
    ) -> Result<Expr, Error> {
        loop {
            let tok_prec = self.tok_precedence(ops);
            if tok_prec < expr_prec {
                return Ok(lhs);
            }
            let op = match self.cur {
                Token::Kwd(op) => op,
                _ => return Ok(lhs),
            };
            self.advance();

            let mut rhs = self.parse_unary(ops)?;
            // If the next operator binds tighter, it takes rhs first.
            let next_prec = self.tok_precedence(ops);
            if tok_prec < next_prec {
                rhs = self.parse_binop_rhs(ops, tok_prec + 1, rhs)?;
            }
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self, ops: &OperatorTable) -> Result<Expr, Error> {
        match self.cur {
            Token::Kwd(op) if op != '(' && op != ',' => {
                self.advance();
                let operand = self.parse_unary(ops)?;
                Ok(Expr::Unary(op, Box::new(operand)))
            }
            _ => self.parse_primary(ops),
        }
    }

    fn parse_primary(&mut self, ops: &OperatorTable) -> Result<Expr, Error> {
        match self.cur.clone() {
            Token::Ident(name) => {
                self.advance();
                if self.cur != Token::Kwd('(') {
                    return Ok(Expr::Variable(name));
                }
                self.advance();
                let mut args = Vec::new();
                if self.cur != Token::Kwd(')') {
                    loop {
                        args.push(self.parse_expression(ops)?);
                        if self.cur == Token::Kwd(')') {
                            break;
                        }
                        if self.cur != Token::Kwd(',') {
                            return Self::err("Expected ')' or ',' in argument list");
                        }
                        self.advance();
                    }
                }
                self.advance();
                Ok(Expr::Call(name, args))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::Kwd('(') => {
                self.advance();
                let e = self.parse_expression(ops)?;
                if self.cur != Token::Kwd(')') {
                    return Self::err("expected ')'");
                }
                self.advance();
                Ok(e)
            }
            Token::If => self.parse_if(ops),
            Token::For => self.parse_for(ops),
            Token::Var => self.parse_var(ops),
            _ => Self::err("unknown token when expecting an expression"),
        }
    }

    fn parse_if(&mut self, ops: &OperatorTable) -> Result<Expr, Error> {
        self.advance();
        let cond = self.parse_expression(ops)?;
        if self.cur != Token::Then {
            return Self::err("expected then");
        }
        self.advance();
        let then = self.parse_expression(ops)?;
        if self.cur != Token::Else {
            return Self::err("expected else");
        }
        self.advance();
        let els = self.parse_expression(ops)?;
        Ok(Expr::If(Box::new(cond), Box::new(then), Box::new(els)))
    }

    fn parse_for(&mut self, ops: &OperatorTable) -> Result<Expr, Error> {
        self.advance();
        let name = match self.cur.clone() {
            Token::Ident(name) => name,
            _ => return Self::err("expected identifier after for"),
        };
        self.advance();
        if self.cur != Token::Kwd('=') {
            return Self::err("expected '=' after for");
        }
        self.advance();

        let start = self.parse_expression(ops)?;
        if self.cur != Token::Kwd(',') {
            return Self::err("expected ',' after for start value");
        }
        self.advance();

        let end = self.parse_expression(ops)?;
        let step = if self.cur == Token::Kwd(',') {
            self.advance();
            Some(self.parse_expression(ops)?)
        } else {
            None
        };
        if self.cur != Token::In {
            return Self::err("expected 'in' after for");
        }
        self.advance();
        let body = self.parse_expression(ops)?;
        Ok(Expr::For(
            name,
            Box::new(start),
            Box::new(end),
            Box::new(step),
            Box::new(body),
        ))
    }

    fn parse_var(&mut self, ops: &OperatorTable) -> Result<Expr, Error> {
        self.advance();
        if !matches!(self.cur, Token::Ident(_)) {
            return Self::err("expected identifier after var");
        }

        let mut vars = Vec::new();
        loop {
            let name = match self.cur.clone() {
                Token::Ident(name) => name,
                _ => return Self::err("expected identifier list after var"),
            };
            self.advance();
            let init = if self.cur == Token::Kwd('=') {
                self.advance();
                Some(self.parse_expression(ops)?)
            } else {
                None
            };
            vars.push((name, init));
            if self.cur != Token::Kwd(',') {
                break;
            }
            self.advance();
        }
        if self.cur != Token::In {
            return Self::err("expected 'in' keyword after 'var'");
        }
        self.advance();
        let body = self.parse_expression(ops)?;
        Ok(Expr::Var(vars, Box::new(body)))
    }

    fn parse_prototype(&mut self) -> Result<Prototype, Error> {
        let (name, kind, precedence): (String, usize, u32) = match self.cur.clone() {
            Token::Ident(name) => {
                self.advance();
                (name, 0, 30)
            }
            Token::Unary => {
                self.advance();
                let op = match self.cur {
                    Token::Kwd(op) => op,
                    _ => return Self::err("Expected unary operator"),
                };
                self.advance();
                (format!("unary{}", op), 1, 30)
            }
            Token::Binary => {
                self.advance();
                let op = match self.cur {
                    Token::Kwd(op) => op,
                    _ => return Self::err("Expected binary operator"),
                };
                self.advance();
                let mut precedence = 30;
                if let Token::Number(n) = self.cur {
                    if !(1.0..=100.0).contains(&n) {
                        return Self::err("Invalid precedence: must be 1..100");
                    }
                    precedence = n as u32;
                    self.advance();
                }
                (format!("binary{}", op), 2, precedence)
            }
            _ => return Self::err("Expected function name in prototype"),
        };

        if self.cur != Token::Kwd('(') {
            return Self::err("Expected '(' in prototype");
        }
        let mut args = Vec::new();
        self.advance();
        while let Token::Ident(arg) = self.cur.clone() {
            args.push(arg);
            self.advance();
        }
        if self.cur != Token::Kwd(')') {
            return Self::err("Expected ')' in prototype");
        }
        self.advance();
        if kind != 0 && args.len() != kind {
            return Self::err("Invalid number of operands for operator");
        }
        Ok(Prototype {
            name,
            args,
            is_operator: kind != 0,
            precedence,
        })
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::super::ast::Expr::*;
    use super::*;

    fn parser(src: &str) -> Parser<Cursor<Vec<u8>>> {
        let mut parser = Parser::new(Lexer::new(Cursor::new(src.as_bytes().to_vec())));
        parser.advance();
        parser
    }

    fn parse_expr(src: &str) -> Result<Expr, Error> {
        parser(src).parse_expression(&OperatorTable::new())
    }

    #[test]
    fn test_primary() {
        assert_eq!(parse_expr("1.0").unwrap(), Number(1.0));
        assert_eq!(parse_expr("y").unwrap(), Variable("y".to_owned()));
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            parse_expr("1+2*3").unwrap(),
            Binary(
                '+',
                Box::new(Number(1.0)),
                Box::new(Binary('*', Box::new(Number(2.0)), Box::new(Number(3.0))))
            )
        );
        assert_eq!(
            parse_expr("(1+2)*3").unwrap(),
            Binary(
                '*',
                Box::new(Binary('+', Box::new(Number(1.0)), Box::new(Number(2.0)))),
                Box::new(Number(3.0))
            )
        );
        assert_eq!(
            parse_expr("1+2-3").unwrap(),
            Binary(
                '-',
                Box::new(Binary('+', Box::new(Number(1.0)), Box::new(Number(2.0)))),
                Box::new(Number(3.0))
            )
        );
    }

    #[test]
    fn test_assignment() {
        assert_eq!(
            parse_expr("x = y + 1").unwrap(),
            Binary(
                '=',
                Box::new(Variable("x".to_owned())),
                Box::new(Binary(
                    '+',
                    Box::new(Variable("y".to_owned())),
                    Box::new(Number(1.0))
                ))
            )
        );
    }

    #[test]
    fn test_call() {
        assert_eq!(
            parse_expr("foo(y, 4.0)").unwrap(),
            Call(
                "foo".to_owned(),
                vec![Variable("y".to_owned()), Number(4.0)]
            )
        );
        // no whitespace between callee and argument list
        assert_eq!(parse_expr("f(1)").unwrap(), Call("f".to_owned(), vec![Number(1.0)]));
        assert_eq!(parse_expr("g()").unwrap(), Call("g".to_owned(), vec![]));
        assert!(parse_expr("f(1 2)").is_err());
    }

    #[test]
    fn test_unary() {
        assert_eq!(
            parse_expr("!x").unwrap(),
            Unary('!', Box::new(Variable("x".to_owned())))
        );
        assert_eq!(
            parse_expr("!!x").unwrap(),
            Unary('!', Box::new(Unary('!', Box::new(Variable("x".to_owned())))))
        );
    }

    #[test]
    fn test_if() {
        assert_eq!(
            parse_expr("if c then 1 else 2").unwrap(),
            If(
                Box::new(Variable("c".to_owned())),
                Box::new(Number(1.0)),
                Box::new(Number(2.0))
            )
        );
        assert!(parse_expr("if c then 1").is_err());
    }

    #[test]
    fn test_for() {
        assert_eq!(
            parse_expr("for i=1, 3 in 3").unwrap(),
            For(
                "i".to_owned(),
                Box::new(Number(1.0)),
                Box::new(Number(3.0)),
                Box::new(None),
                Box::new(Number(3.0))
            )
        );
        assert_eq!(
            parse_expr("for i=1, 3,2 in 3").unwrap(),
            For(
                "i".to_owned(),
                Box::new(Number(1.0)),
                Box::new(Number(3.0)),
                Box::new(Some(Number(2.0))),
                Box::new(Number(3.0))
            )
        );
    }

    #[test]
    fn test_var() {
        assert_eq!(
            parse_expr("var x = 3, y in x+y").unwrap(),
            Var(
                vec![("x".to_owned(), Some(Number(3.0))), ("y".to_owned(), None)],
                Box::new(Binary(
                    '+',
                    Box::new(Variable("x".to_owned())),
                    Box::new(Variable("y".to_owned()))
                ))
            )
        );
        assert!(parse_expr("var in 1").is_err());
    }

    #[test]
    fn test_user_operator_precedence() {
        let mut ops = OperatorTable::new();
        ops.install('|', 5);
        // '|' binds looser than '<'
        assert_eq!(
            parser("a | b < c").parse_expression(&ops).unwrap(),
            Binary(
                '|',
                Box::new(Variable("a".to_owned())),
                Box::new(Binary(
                    '<',
                    Box::new(Variable("b".to_owned())),
                    Box::new(Variable("c".to_owned()))
                ))
            )
        );
        // without the table entry, '|' is not a binary operator
        assert_eq!(
            parse_expr("a | b").unwrap(),
            Variable("a".to_owned())
        );
    }

    #[test]
    fn test_prototype() {
        let ops = OperatorTable::new();
        let Function(proto, _) = parser("def foo(a b) a").parse_definition(&ops).unwrap();
        assert_eq!(proto.name, "foo");
        assert_eq!(proto.args, vec!["a".to_owned(), "b".to_owned()]);
        assert!(!proto.is_operator);
    }

    #[test]
    fn test_unary_prototype() {
        let ops = OperatorTable::new();
        let Function(proto, _) = parser("def unary!(v) 0").parse_definition(&ops).unwrap();
        assert_eq!(proto.name, "unary!");
        assert!(proto.is_unary_op());
        assert_eq!(proto.operator_name(), '!');

        assert!(parser("def unary&(a b) a")
            .parse_definition(&ops)
            .is_err());
    }

    #[test]
    fn test_binary_prototype() {
        let ops = OperatorTable::new();
        let Function(proto, _) = parser("def binary| 5 (x y) x").parse_definition(&ops).unwrap();
        assert_eq!(proto.name, "binary|");
        assert!(proto.is_binary_op());
        assert_eq!(proto.operator_name(), '|');
        assert_eq!(proto.precedence, 5);

        // default precedence
        let Function(proto, _) = parser("def binary% (x y) x").parse_definition(&ops).unwrap();
        assert_eq!(proto.precedence, 30);

        assert!(parser("def binary% 0 (x y) x").parse_definition(&ops).is_err());
        assert!(parser("def binary% 101 (x y) x").parse_definition(&ops).is_err());
        assert!(parser("def binary% 5 (x) x").parse_definition(&ops).is_err());
    }

    #[test]
    fn test_extern() {
        let proto = parser("extern sin(x)").parse_extern().unwrap();
        assert_eq!(proto.name, "sin");
        assert_eq!(proto.args, vec!["x".to_owned()]);
    }

    #[test]
    fn test_toplevel() {
        let ops = OperatorTable::new();
        let Function(proto, body) = parser("4+5").parse_toplevel(&ops).unwrap();
        assert_eq!(proto.name, ANON_EXPR);
        assert!(proto.args.is_empty());
        assert_eq!(
            *body,
            Binary('+', Box::new(Number(4.0)), Box::new(Number(5.0)))
        );
    }

    #[test]
    fn test_errors() {
        assert!(parse_expr("then").is_err());
        assert!(parse_expr("(1+2").is_err());
        let ops = OperatorTable::new();
        assert!(parser("def 1(x) x").parse_definition(&ops).is_err());
    }
}
