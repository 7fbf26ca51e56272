mod ast;
mod codegen;
mod error;
mod jit;
mod lexer;
mod parser;
mod token;
mod toplevel;

use std::io;
use std::process;

fn main() {
    let stdin = io::stdin();
    let mut driver = match toplevel::Driver::new(stdin.lock()) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = driver.run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
