use super::ast::{Function, Prototype};
use super::codegen::CodeGen;
use super::error::{Error, ErrorKind};
use super::ir::Module;
use super::jit::Jit;
use super::lexer;
use super::parser::{self, ANON_EXPR};
use super::token::Token;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::mem;

const UNIT_NAME: &str = "my cool jit";

const AST_BANNER: &str = "===============   AST   ===============";
const IR_BANNER: &str = "===============   IR    ===============";
const OPT_BANNER: &str = "============  OPTIMIZED IR  ===========";

pub(crate) const USAGE: &str = "\
usage: kaleidoscope-jit [options]

Reads statements from stdin and evaluates them.

options:
  -q, --quiet   do not dump the AST and IR of each statement
      --no-opt  compile without the backend's optimizer
  -h, --help    print this message";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Options {
    pub(crate) prompt: bool,
    pub(crate) dump_ast: bool,
    pub(crate) dump_ir: bool,
    pub(crate) optimize: bool,
    pub(crate) help: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            prompt: true,
            dump_ast: true,
            dump_ir: true,
            optimize: true,
            help: false,
        }
    }
}

impl Options {
    /// Parses command line flags, not including the program name.
    pub(crate) fn from_args<I>(args: I) -> Result<Options, Error>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut options = Options::default();
        for arg in args {
            match arg.as_ref() {
                "-q" | "--quiet" => {
                    options.dump_ast = false;
                    options.dump_ir = false;
                }
                "--no-opt" => options.optimize = false,
                "-h" | "--help" => options.help = true,
                other => {
                    return Err(Error::from(ErrorKind::Config(format!(
                        "unknown option '{}'",
                        other
                    ))))
                }
            }
        }
        Ok(options)
    }
}

/// Every extern and function accepted so far. Units are regenerated from
/// here, so it must only ever hold entries that generated cleanly.
#[derive(Debug, Default)]
pub(crate) struct Definitions {
    externs: BTreeMap<String, Prototype>,
    functions: BTreeMap<String, Function>,
}

impl Definitions {
    pub(crate) fn add_extern(&mut self, proto: Prototype) {
        self.externs.insert(proto.name.clone(), proto);
    }

    pub(crate) fn add_function(&mut self, func: Function) {
        self.functions.insert(func.proto.name.clone(), func);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Defined(String),
    Declared(String),
    Evaluated(f64),
    Skipped,
    Failed(ErrorKind),
}

enum Statement {
    Definition(Function),
    Extern(Prototype),
    Expression(Function),
}

/// The read-eval-print state: one open unit for definitions, the store it is
/// rebuilt from, and the backend that runs expressions.
pub(crate) struct Session<J, O, E> {
    options: Options,
    jit: J,
    codegen: CodeGen,
    definitions: Definitions,
    unit: Module,
    pending: Vec<Token>,
    out: O,
    err: E,
}

impl<J: Jit, O: Write, E: Write> Session<J, O, E> {
    pub(crate) fn new(options: Options, jit: J, out: O, err: E) -> Self {
        Session {
            options,
            jit,
            codegen: CodeGen::new(),
            definitions: Definitions::default(),
            unit: Module::new(UNIT_NAME),
            pending: Vec::new(),
            out,
            err,
        }
    }

    /// Whether a statement is waiting for more input.
    pub(crate) fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn prompt(&mut self) -> Result<(), Error> {
        if self.options.prompt {
            let prompt = if self.is_pending() { "...> " } else { "ready> " };
            write!(self.out, "{}", prompt)?;
            self.out.flush()?;
        }
        Ok(())
    }

    fn report(&mut self, e: &Error) -> Result<Outcome, Error> {
        writeln!(self.err, "Error: {}", e)?;
        Ok(Outcome::Failed(e.kind().clone()))
    }

    /// Reads statements until `input` is exhausted, then dumps the open unit.
    /// A line that is not UTF-8 is reported as a lex error and skipped.
    pub(crate) fn main_loop<R: BufRead>(&mut self, mut input: R) -> Result<(), Error> {
        let mut buf = Vec::new();
        loop {
            self.prompt()?;
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
                buf.pop();
            }
            match std::str::from_utf8(&buf) {
                Ok(line) => {
                    self.run_line(line)?;
                }
                Err(e) => {
                    let e = Error::from(ErrorKind::Lex(format!(
                        "line is not valid UTF-8 (byte {})",
                        e.valid_up_to() + 1
                    )));
                    self.report(&e)?;
                }
            }
        }
        if self.is_pending() {
            self.pending.clear();
            self.report(&Error::from(ErrorKind::Incomplete))?;
        }
        if self.options.prompt {
            writeln!(self.out)?;
        }
        if self.options.dump_ir {
            write!(self.out, "{}", self.unit)?;
        }
        self.out.flush()?;
        Ok(())
    }

    /// Handles every complete statement on `line`, together with whatever
    /// was left pending by earlier lines. Only output failures are returned
    /// as errors; a failed statement is reported and the rest carry on.
    pub(crate) fn run_line(&mut self, line: &str) -> Result<Vec<Outcome>, Error> {
        let mut tokens = mem::replace(&mut self.pending, Vec::new());
        match lexer::tokenize(line) {
            Ok(more) => tokens.extend(more),
            Err(e) => return Ok(vec![self.report(&e)?]),
        }

        let mut outcomes = Vec::new();
        let mut rest = tokens.as_slice();
        while let Some(first) = rest.first() {
            let parsed = match first {
                Token::Kwd(';') => {
                    rest = &rest[1..];
                    outcomes.push(Outcome::Skipped);
                    continue;
                }
                Token::Def => parser::parse_definition(rest)
                    .map(|(f, r)| (Statement::Definition(f), r)),
                Token::Extern => {
                    parser::parse_extern(rest).map(|(p, r)| (Statement::Extern(p), r))
                }
                _ => parser::parse_top_level_expr(rest)
                    .map(|(f, r)| (Statement::Expression(f), r)),
            };
            match parsed {
                Ok((statement, r)) => {
                    rest = r;
                    let outcome = self.handle(statement)?;
                    outcomes.push(outcome);
                }
                Err(ref e) if *e.kind() == ErrorKind::Incomplete => {
                    self.pending = rest.to_vec();
                    break;
                }
                Err(e) => {
                    outcomes.push(self.report(&e)?);
                    rest = skip_statement(rest);
                }
            }
        }
        Ok(outcomes)
    }

    fn handle(&mut self, statement: Statement) -> Result<Outcome, Error> {
        match statement {
            Statement::Definition(f) => self.define(f),
            Statement::Extern(p) => self.declare(p),
            Statement::Expression(f) => self.evaluate(f),
        }
    }

    fn dump_ast(&mut self, node: &dyn std::fmt::Display) -> Result<(), Error> {
        if self.options.dump_ast {
            writeln!(self.out, "{}", AST_BANNER)?;
            write!(self.out, "{}", node)?;
        }
        Ok(())
    }

    fn dump_ir(&mut self, banner: &str, ir: &str) -> Result<(), Error> {
        if self.options.dump_ir {
            writeln!(self.out, "{}", banner)?;
            write!(self.out, "{}", ir)?;
        }
        Ok(())
    }

    fn define(&mut self, f: Function) -> Result<Outcome, Error> {
        self.dump_ast(&f)?;
        let name = f.proto.name.clone();
        let ir = match self.codegen.codegen_func(&mut self.unit, &f) {
            Ok(func) => func.to_string(),
            Err(e) => return self.report(&Error::from(e)),
        };
        self.dump_ir(IR_BANNER, &ir)?;
        self.definitions.add_function(f);

        if self.options.optimize && self.options.dump_ir {
            // the definition stands even if the backend cannot show it
            match self.jit.optimized_ir(&self.unit, &name) {
                Ok(optimized) => self.dump_ir(OPT_BANNER, &optimized)?,
                Err(e) => {
                    self.report(&e)?;
                }
            }
        }
        Ok(Outcome::Defined(name))
    }

    fn declare(&mut self, p: Prototype) -> Result<Outcome, Error> {
        self.dump_ast(&p)?;
        let ir = match self.codegen.codegen_proto(&mut self.unit, &p) {
            Ok(func) => func.to_string(),
            Err(e) => return self.report(&Error::from(e)),
        };
        self.dump_ir(IR_BANNER, &ir)?;
        let name = p.name.clone();
        self.definitions.add_extern(p);
        Ok(Outcome::Declared(name))
    }

    fn evaluate(&mut self, f: Function) -> Result<Outcome, Error> {
        self.dump_ast(&f)?;
        let ir = match self.codegen.codegen_func(&mut self.unit, &f) {
            Ok(func) => func.to_string(),
            Err(e) => return self.report(&Error::from(e)),
        };
        self.dump_ir(IR_BANNER, &ir)?;

        let mut unit = mem::replace(&mut self.unit, Module::new(UNIT_NAME));
        // only what the expression can reach gets compiled, so a stored
        // definition calling an unresolvable extern cannot poison the rest
        unit.retain_reachable(ANON_EXPR);
        let result = self.run_unit(unit);
        if let Err(e) = self.rebuild_unit() {
            self.report(&e)?;
        }
        match result {
            Ok(v) => {
                writeln!(self.out, "Evaluated to {:.6}", v)?;
                Ok(Outcome::Evaluated(v))
            }
            Err(e) => self.report(&e),
        }
    }

    /// Submits `unit`, runs its anonymous expression and unloads it again.
    fn run_unit(&mut self, unit: Module) -> Result<f64, Error> {
        let tracker = self.jit.add_module(unit)?;
        let result = self
            .jit
            .lookup(tracker, ANON_EXPR)
            .and_then(|sym| sym.call0());
        self.jit.remove(tracker)?;
        result
    }

    /// Replaces the open unit with one regenerated from the stored
    /// definitions. All prototypes are declared before any body so the
    /// order of the store does not matter.
    pub(crate) fn rebuild_unit(&mut self) -> Result<(), Error> {
        let mut unit = Module::new(UNIT_NAME);
        let result = self.regenerate(&mut unit);
        self.unit = unit;
        result
    }

    fn regenerate(&mut self, unit: &mut Module) -> Result<(), Error> {
        let Session {
            codegen,
            definitions,
            ..
        } = self;
        for proto in definitions.externs.values() {
            codegen.codegen_proto(unit, proto)?;
        }
        for f in definitions.functions.values() {
            codegen.codegen_proto(unit, &f.proto)?;
        }
        for f in definitions.functions.values() {
            codegen.codegen_func(unit, f)?;
        }
        Ok(())
    }
}

/// Drops the failed statement: everything up to and including the next
/// `;`, or the rest of the input.
fn skip_statement(tokens: &[Token]) -> &[Token] {
    match tokens.iter().position(|t| *t == Token::Kwd(';')) {
        Some(idx) => &tokens[idx + 1..],
        None => &[],
    }
}
