//! A small SSA intermediate representation: `double`-typed functions made of
//! basic blocks, with phi nodes at control-flow joins.

mod builder;
mod function;
mod instr;
mod types;
mod verify;

pub(crate) use self::builder::FunctionBuilder;
pub(crate) use self::function::{BasicBlock, Function, Module};
pub(crate) use self::instr::{BinOp, CmpOp, InstrKind, Instruction, Terminator};
pub(crate) use self::types::{BlockId, IrType, VReg, Value};
pub(crate) use self::verify::verify_function;
