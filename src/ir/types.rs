use std::fmt;

/// A virtual register: the SSA value produced by a parameter or instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct VReg(pub(crate) u32);

/// A basic block handle, stable across layout changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BlockId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum IrType {
    Double,
    I1,
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Double => write!(f, "double"),
            IrType::I1 => write!(f, "i1"),
        }
    }
}

/// An instruction operand. Constants are carried inline rather than
/// materialized by instructions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Value {
    Reg(VReg),
    Double(f64),
}

impl Value {
    pub(crate) fn as_reg(&self) -> Option<VReg> {
        match self {
            Value::Reg(r) => Some(*r),
            _ => None,
        }
    }
}

/// Formats a double the way LLVM's textual IR does, e.g. `4.200000e+01`.
pub(crate) fn format_double(n: f64) -> String {
    if n.is_nan() {
        return "0x7FF8000000000000".to_owned();
    }
    if n.is_infinite() {
        return if n > 0.0 {
            "0x7FF0000000000000".to_owned()
        } else {
            "0xFFF0000000000000".to_owned()
        };
    }
    let s = format!("{:.6e}", n);
    match s.find('e') {
        Some(idx) => {
            let (mantissa, exp) = s.split_at(idx);
            let exp: i32 = exp[1..].parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => s,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_double() {
        assert_eq!(format_double(0.0), "0.000000e+00");
        assert_eq!(format_double(1.0), "1.000000e+00");
        assert_eq!(format_double(42.0), "4.200000e+01");
        assert_eq!(format_double(-0.125), "-1.250000e-01");
        assert_eq!(format_double(f64::INFINITY), "0x7FF0000000000000");
    }
}
