use failure::{Backtrace, Context, Fail};
use std::fmt;
use std::io;

#[derive(Debug)]
pub(crate) struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, PartialEq, Fail)]
pub(crate) enum ErrorKind {
    #[fail(display = "lex error: {}", _0)]
    Lex(String),
    #[fail(display = "syntax error: {}", _0)]
    Syntax(String),
    #[fail(display = "syntax error: unexpected end of input")]
    Incomplete,
    #[fail(display = "codegen error: {}", _0)]
    Codegen(CodegenError),
    #[fail(display = "execution error: {}", _0)]
    Execution(String),
    #[fail(display = "invalid option: {}", _0)]
    Config(String),
    #[fail(display = "io error: {}", _0)]
    Io(String),
}

#[derive(Clone, Debug, PartialEq, Fail)]
pub(crate) enum CodegenError {
    #[fail(display = "Unknown variable name '{}'", _0)]
    UnknownVariable(String),
    #[fail(display = "Unknown function referenced '{}'", _0)]
    UnknownFunction(String),
    #[fail(
        display = "Incorrect # arguments passed to '{}': expected {}, got {}",
        callee, expected, got
    )]
    ArgumentCount {
        callee: String,
        expected: usize,
        got: usize,
    },
    #[fail(display = "Invalid binary operator '{}'", _0)]
    InvalidOperator(char),
    #[fail(display = "Function cannot be redefined: '{}'", _0)]
    Redefinition(String),
    #[fail(
        display = "conflicting declaration of '{}': {} parameter(s) declared, {} given",
        name, declared, given
    )]
    ConflictingDeclaration {
        name: String,
        declared: usize,
        given: usize,
    },
    #[fail(display = "malformed function '{}': {}", function, reason)]
    Malformed { function: String, reason: String },
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl Error {
    pub(crate) fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

impl From<CodegenError> for Error {
    fn from(e: CodegenError) -> Error {
        Error::from(ErrorKind::Codegen(e))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        let message = e.to_string();
        Error {
            inner: e.context(ErrorKind::Io(message)),
        }
    }
}
