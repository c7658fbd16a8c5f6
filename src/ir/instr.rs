use super::types::{BlockId, IrType, VReg, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BinOp {
    FAdd,
    FSub,
    FMul,
    FDiv,
}

impl BinOp {
    pub(crate) fn mnemonic(self) -> &'static str {
        match self {
            BinOp::FAdd => "fadd",
            BinOp::FSub => "fsub",
            BinOp::FMul => "fmul",
            BinOp::FDiv => "fdiv",
        }
    }
}

/// Floating point comparison predicates. `One` (ordered and not equal) is
/// false when either operand is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CmpOp {
    One,
}

impl CmpOp {
    pub(crate) fn mnemonic(self) -> &'static str {
        match self {
            CmpOp::One => "one",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Instruction {
    pub(crate) result: VReg,
    pub(crate) kind: InstrKind,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InstrKind {
    Binary(BinOp, Value, Value),
    FCmp(CmpOp, Value, Value),
    Call { callee: String, args: Vec<Value> },
    Phi(IrType, Vec<(Value, BlockId)>),
}

impl InstrKind {
    pub(crate) fn result_type(&self) -> IrType {
        match self {
            InstrKind::FCmp(..) => IrType::I1,
            InstrKind::Phi(ty, _) => *ty,
            InstrKind::Binary(..) | InstrKind::Call { .. } => IrType::Double,
        }
    }

    pub(crate) fn is_phi(&self) -> bool {
        match self {
            InstrKind::Phi(..) => true,
            _ => false,
        }
    }

    pub(crate) fn operands(&self) -> Vec<&Value> {
        match self {
            InstrKind::Binary(_, l, r) | InstrKind::FCmp(_, l, r) => vec![l, r],
            InstrKind::Call { args, .. } => args.iter().collect(),
            InstrKind::Phi(_, incoming) => incoming.iter().map(|(v, _)| v).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Terminator {
    Ret(Value),
    Br(BlockId),
    CondBr {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
}

impl Terminator {
    pub(crate) fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Ret(_) => vec![],
            Terminator::Br(b) => vec![*b],
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => {
                if then_block == else_block {
                    vec![*then_block]
                } else {
                    vec![*then_block, *else_block]
                }
            }
        }
    }

    pub(crate) fn operands(&self) -> Vec<&Value> {
        match self {
            Terminator::Ret(v) => vec![v],
            Terminator::Br(_) => vec![],
            Terminator::CondBr { cond, .. } => vec![cond],
        }
    }
}
