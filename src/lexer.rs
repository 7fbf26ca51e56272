use std::ffi::CString;
use std::io::BufRead;
use std::ptr;

use combine::error::ParseError;
use combine::parser::char::{alpha_num, digit, letter, space};
use combine::parser::choice::or;
use combine::parser::Parser;
use combine::stream::Stream;
use combine::{any, choice, eof, many, many1, satisfy, skip_many, skip_many1, token};

use super::token::Token;

fn number<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    // The whole [0-9.] run is consumed; strtod decides what it means, so
    // "1.2.3" lexes as 1.2 with the tail swallowed.
    many1(choice((digit(), token('.')))).map(|ns: String| {
        let ns = CString::new(ns).unwrap();
        Token::Number(unsafe { libc::strtod(ns.as_ptr(), ptr::null_mut()) })
    })
}

fn ident<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (letter(), many(alpha_num())).map(|(first, rest): (char, String)| {
        let mut s = String::with_capacity(rest.len() + 1);
        s.push(first);
        s.push_str(&rest);
        match s.as_ref() {
            "def" => Token::Def,
            "extern" => Token::Extern,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "for" => Token::For,
            "in" => Token::In,
            "binary" => Token::Binary,
            "unary" => Token::Unary,
            "var" => Token::Var,
            id => Token::Ident(id.to_string()),
        }
    })
}

fn comment<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    token('#').with(skip_many(satisfy(|c: char| c != '\n')))
}

fn skip<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip_many(or(skip_many1(space()), comment()))
}

fn operator<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    any().map(Token::Kwd)
}

/// One token off the front of the buffer, or `None` when the buffer is
/// exhausted (more input may still arrive).
pub(crate) fn lex<Input>() -> impl Parser<Input, Output = Option<Token>>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip().with(choice((
        number().map(Some),
        ident().map(Some),
        eof().map(|_| None),
        operator().map(Some),
    )))
}

/// Pull source over the character stream, refilled one line at a time.
pub(crate) struct Lexer<R> {
    input: R,
    buf: String,
    pos: usize,
}

impl<R: BufRead> Lexer<R> {
    pub(crate) fn new(input: R) -> Lexer<R> {
        Lexer {
            input,
            buf: String::new(),
            pos: 0,
        }
    }

    pub(crate) fn next_token(&mut self) -> Token {
        enum Step {
            Got(usize, Token),
            NeedMore,
            Unusable,
        }

        loop {
            let step = match lex().parse(&self.buf[self.pos..]) {
                Ok((Some(tok), rest)) => {
                    let pos = self.buf.len() - rest.len();
                    Step::Got(pos, tok)
                }
                Ok((None, _)) => Step::NeedMore,
                Err(_) => Step::Unusable,
            };
            match step {
                Step::Got(pos, tok) => {
                    self.pos = pos;
                    return tok;
                }
                Step::NeedMore => {
                    self.buf.clear();
                    self.pos = 0;
                    match self.input.read_line(&mut self.buf) {
                        Ok(0) => return Token::Eof,
                        Ok(_) => {}
                        Err(e) => {
                            eprintln!("Error: {}", e);
                            return Token::Eof;
                        }
                    }
                }
                Step::Unusable => {
                    // the rest of the line is unusable; resume at the next one
                    self.buf.clear();
                    self.pos = 0;
                }
            }
        }
    }
}
