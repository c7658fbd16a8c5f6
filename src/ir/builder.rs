use super::function::{BasicBlock, Function};
use super::instr::{BinOp, CmpOp, InstrKind, Instruction, Terminator};
use super::types::{BlockId, IrType, Value};

/// Appends instructions to a function body, one block at a time.
///
/// Blocks are created detached and only enter the layout when the builder
/// switches to them, so a block's position reflects when code was emitted
/// into it.
pub(crate) struct FunctionBuilder<'f> {
    func: &'f mut Function,
    current: BlockId,
}

impl<'f> FunctionBuilder<'f> {
    /// Opens the `entry` block of `func`, which must not have a body yet.
    pub(crate) fn new(func: &'f mut Function) -> Self {
        let entry = func.new_block_id("entry");
        func.blocks.push(BasicBlock::new(entry));
        FunctionBuilder {
            func,
            current: entry,
        }
    }

    pub(crate) fn create_block(&mut self, label: &str) -> BlockId {
        self.func.new_block_id(label)
    }

    pub(crate) fn switch_to_block(&mut self, block: BlockId) {
        if self.func.block(block).is_none() {
            self.func.blocks.push(BasicBlock::new(block));
        }
        self.current = block;
    }

    pub(crate) fn current_block(&self) -> BlockId {
        self.current
    }

    fn push(&mut self, name: &str, kind: InstrKind) -> Value {
        let result = self.func.new_value(name, kind.result_type());
        let current = self.current;
        if let Some(b) = self.func.block_mut(current) {
            b.instrs.push(Instruction { result, kind });
        }
        Value::Reg(result)
    }

    fn terminate(&mut self, t: Terminator) {
        let current = self.current;
        if let Some(b) = self.func.block_mut(current) {
            b.terminator = Some(t);
        }
    }

    pub(crate) fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value, name: &str) -> Value {
        self.push(name, InstrKind::Binary(op, lhs, rhs))
    }

    pub(crate) fn fcmp(&mut self, op: CmpOp, lhs: Value, rhs: Value, name: &str) -> Value {
        self.push(name, InstrKind::FCmp(op, lhs, rhs))
    }

    pub(crate) fn call(&mut self, callee: &str, args: Vec<Value>, name: &str) -> Value {
        let kind = InstrKind::Call {
            callee: callee.to_owned(),
            args,
        };
        self.push(name, kind)
    }

    pub(crate) fn phi(&mut self, ty: IrType, incoming: Vec<(Value, BlockId)>, name: &str) -> Value {
        self.push(name, InstrKind::Phi(ty, incoming))
    }

    pub(crate) fn br(&mut self, dest: BlockId) {
        self.terminate(Terminator::Br(dest))
    }

    pub(crate) fn cond_br(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        })
    }

    pub(crate) fn ret(&mut self, v: Value) {
        self.terminate(Terminator::Ret(v))
    }
}
