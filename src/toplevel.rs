use std::io::BufRead;
use std::mem;

use super::codegen::{self, Context};
use super::error::Error;
use super::jit::Jit;
use super::lexer::Lexer;
use super::parser::{OperatorTable, Parser, ANON_EXPR};
use super::token::Token;

/// The REPL driver: owns the parser, the operator table, the codegen
/// context, and the JIT, and threads them through each top-level item.
pub(crate) struct Driver<R> {
    parser: Parser<R>,
    ops: OperatorTable,
    codegen: Context,
    jit: Jit,
}

impl<R: BufRead> Driver<R> {
    pub(crate) fn new(input: R) -> Result<Driver<R>, Error> {
        let jit = unsafe { Jit::new()? };
        let codegen = unsafe { Context::new(jit.data_layout()) };
        Ok(Driver {
            parser: Parser::new(Lexer::new(input)),
            ops: OperatorTable::new(),
            codegen,
            jit,
        })
    }

    /// Errors escaping this loop are fatal (JIT state is no longer
    /// trustworthy); everything else is reported and skipped past.
    pub(crate) fn run(&mut self) -> Result<(), Error> {
        self.parser.advance();
        loop {
            eprint!("ready> ");
            match self.parser.current().clone() {
                Token::Eof => return Ok(()),
                Token::Kwd(';') => self.parser.advance(),
                Token::Def => self.handle_definition()?,
                Token::Extern => self.handle_extern(),
                _ => self.handle_top_level_expression()?,
            }
        }
    }

    fn handle_definition(&mut self) -> Result<(), Error> {
        let parsed = self.parser.parse_definition(&self.ops);
        let result = parsed.and_then(|f| unsafe { self.codegen.codegen_func(&mut self.ops, &f) });
        match result {
            Ok(function) => unsafe {
                eprintln!("Read function definition:");
                eprintln!("{}", codegen::print_to_string(function));
                let module = self.codegen.take_module();
                self.jit.add_module(module)?;
            },
            Err(e) => {
                eprintln!("Error: {}", e);
                self.parser.advance();
            }
        }
        Ok(())
    }

    fn handle_extern(&mut self) {
        let parsed = self.parser.parse_extern();
        let result = parsed.and_then(|proto| unsafe { self.codegen.codegen_extern(&proto) });
        match result {
            Ok(function) => {
                eprintln!("Read extern:");
                eprintln!("{}", unsafe { codegen::print_to_string(function) });
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                self.parser.advance();
            }
        }
    }

    fn handle_top_level_expression(&mut self) -> Result<(), Error> {
        match self.eval_top_level() {
            Ok(value) => {
                eprintln!("Evaluated to {:.6}", value);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                eprintln!("Error: {}", e);
                self.parser.advance();
                Ok(())
            }
        }
    }

    /// Compile `__anon_expr` into its own module, run it under a resource
    /// tracker, and discard the module afterwards.
    fn eval_top_level(&mut self) -> Result<f64, Error> {
        let parsed = self.parser.parse_toplevel(&self.ops);
        parsed.and_then(|f| unsafe { self.codegen.codegen_func(&mut self.ops, &f) })?;
        unsafe {
            let module = self.codegen.take_module();
            let tracker = self.jit.add_module_with_tracker(module)?;
            let addr = self.jit.lookup(ANON_EXPR)?;
            let callable: extern "C" fn() -> f64 = mem::transmute(addr as usize);
            let value = callable();
            tracker.remove()?;
            Ok(value)
        }
    }
}
