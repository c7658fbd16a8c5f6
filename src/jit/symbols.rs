use crate::error::{Error, ErrorKind};
use std::ffi::CString;
use std::io::{self, Write};

type Unary = extern "C" fn(f64) -> f64;

/// Writes the character with code `x` to stderr.
extern "C" fn putchard(x: f64) -> f64 {
    let mut err = io::stderr();
    let _ = err.write_all(&[x as u8]).and_then(|_| err.flush());
    0.0
}

/// Prints `x` and a newline to stderr.
extern "C" fn printd(x: f64) -> f64 {
    eprintln!("{:.6}", x);
    0.0
}

extern "C" fn sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn sqrt(x: f64) -> f64 {
    x.sqrt()
}

extern "C" fn exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn log(x: f64) -> f64 {
    x.ln()
}

fn builtin(name: &str) -> Option<Unary> {
    let f: Unary = match name {
        "putchard" => putchard,
        "printd" => printd,
        "sin" => sin,
        "cos" => cos,
        "sqrt" => sqrt,
        "exp" => exp,
        "log" => log,
        _ => return None,
    };
    Some(f)
}

/// Address of the extern `name`: a builtin, else a symbol of the host
/// process.
pub(crate) fn resolve(name: &str, arity: usize) -> Result<*const u8, Error> {
    if let Some(f) = builtin(name) {
        if arity != 1 {
            return Err(Error::from(ErrorKind::Execution(format!(
                "builtin '{}' takes 1 argument, declared with {}",
                name, arity
            ))));
        }
        return Ok(f as *const u8);
    }
    let cname = CString::new(name)
        .map_err(|_| Error::from(ErrorKind::Execution(format!("bad symbol name '{}'", name))))?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
    if addr.is_null() {
        Err(Error::from(ErrorKind::Execution(format!(
            "unresolved external symbol '{}'",
            name
        ))))
    } else {
        Ok(addr as *const u8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builtin() {
        let addr = resolve("sqrt", 1).expect("builtin");
        let f: Unary = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(16.0), 4.0);
    }

    #[test]
    fn test_builtin_arity() {
        let err = resolve("sin", 2).err().map(|e| e.kind().clone());
        assert_eq!(
            err,
            Some(ErrorKind::Execution(
                "builtin 'sin' takes 1 argument, declared with 2".to_owned()
            ))
        );
    }

    #[test]
    fn test_unresolved() {
        assert!(resolve("surely_not_a_symbol_in_this_process", 0).is_err());
    }
}
