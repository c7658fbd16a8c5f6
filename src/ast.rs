use std::fmt;

const INDENT: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Variable(String),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Prototype {
    pub(crate) name: String,
    pub(crate) params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub(crate) proto: Prototype,
    pub(crate) body: Expr,
}

impl Prototype {
    pub(crate) fn new(name: impl Into<String>, params: Vec<String>) -> Self {
        Prototype {
            name: name.into(),
            params,
        }
    }
}

impl Function {
    pub(crate) fn new(proto: Prototype, body: Expr) -> Self {
        Function { proto, body }
    }
}

impl Expr {
    /// Writes the node tag at `title` columns and its children at `indent`
    /// plus one level. `title` differs from `indent` when the caller already
    /// printed a label such as `LHS = ` on the same line.
    fn dump(&self, f: &mut fmt::Formatter<'_>, indent: usize, title: usize) -> fmt::Result {
        let pad = indent + INDENT;
        match self {
            Expr::Number(n) => writeln!(f, "{:title$}Number: {}", "", n, title = title),
            Expr::Variable(name) => writeln!(f, "{:title$}Variable: {}", "", name, title = title),
            Expr::Binary(op, lhs, rhs) => {
                writeln!(f, "{:title$}Binary: {}", "", op, title = title)?;
                write!(f, "{:pad$}LHS = ", "", pad = pad)?;
                lhs.dump(f, pad, 0)?;
                write!(f, "{:pad$}RHS = ", "", pad = pad)?;
                rhs.dump(f, pad, 0)
            }
            Expr::Call(callee, args) => {
                writeln!(f, "{:title$}Call: {}", "", callee, title = title)?;
                for (i, arg) in args.iter().enumerate() {
                    write!(f, "{:pad$}ARG[{}] = ", "", i, pad = pad)?;
                    arg.dump(f, pad, 0)?;
                }
                Ok(())
            }
            Expr::If(cond, then, els) => {
                writeln!(f, "{:title$}If", "", title = title)?;
                write!(f, "{:pad$}Cond = ", "", pad = pad)?;
                cond.dump(f, pad, 0)?;
                write!(f, "{:pad$}Then = ", "", pad = pad)?;
                then.dump(f, pad, 0)?;
                write!(f, "{:pad$}Else = ", "", pad = pad)?;
                els.dump(f, pad, 0)
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f, 0, 0)
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Prototype: {}({})", self.name, self.params.join(", "))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Function:")?;
        write!(f, "{:pad$}proto = {}", "", self.proto, pad = INDENT)?;
        write!(f, "{:pad$}body = ", "", pad = INDENT)?;
        self.body.dump(f, INDENT, 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn num(n: f64) -> Box<Expr> {
        Box::new(Expr::Number(n))
    }

    #[test]
    fn test_dump_binary() {
        let e = Expr::Binary('+', num(1.0), Box::new(Expr::Variable("x".to_owned())));
        assert_eq!(
            e.to_string(),
            "Binary: +\n   LHS = Number: 1\n   RHS = Variable: x\n"
        );
    }

    #[test]
    fn test_dump_nested() {
        let e = Expr::Call(
            "f".to_owned(),
            vec![Expr::If(num(1.0), num(2.0), num(3.0))],
        );
        assert_eq!(
            e.to_string(),
            "Call: f\n   ARG[0] = If\n      Cond = Number: 1\n      Then = Number: 2\n      Else = Number: 3\n"
        );
    }

    #[test]
    fn test_dump_function() {
        let f = Function::new(
            Prototype::new("id", vec!["x".to_owned()]),
            Expr::Variable("x".to_owned()),
        );
        assert_eq!(
            f.to_string(),
            "Function:\n   proto = Prototype: id(x)\n   body = Variable: x\n"
        );
    }
}
