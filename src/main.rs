mod ast;
mod codegen;
mod error;
mod ir;
mod jit;
mod lexer;
mod parser;
mod token;
mod toplevel;

use error::Error;
use jit::NativeJit;
use std::env;
use std::io;
use std::process;
use toplevel::{Options, Session, USAGE};

fn run() -> Result<(), Error> {
    let options = Options::from_args(env::args().skip(1))?;
    if options.help {
        println!("{}", USAGE);
        return Ok(());
    }
    let jit = NativeJit::new(options.optimize)?;
    let stdin = io::stdin();
    let mut session = Session::new(options, jit, io::stdout(), io::stderr());
    session.main_loop(stdin.lock())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
