use super::function::{Function, Module};
use super::instr::{InstrKind, Terminator};
use super::types::{BlockId, IrType, VReg, Value};
use crate::error::CodegenError;
use std::collections::{HashMap, HashSet};

/// Structural checks on a function body before it is accepted into a unit.
/// Calls are resolved against `module`, plus `func` itself for recursion.
pub(crate) fn verify_function(module: &Module, func: &Function) -> Result<(), CodegenError> {
    Verifier { module, func }.run()
}

struct Verifier<'a> {
    module: &'a Module,
    func: &'a Function,
}

type Dominators = HashMap<BlockId, HashSet<BlockId>>;

impl<'a> Verifier<'a> {
    fn fail<T>(&self, reason: String) -> Result<T, CodegenError> {
        Err(CodegenError::Malformed {
            function: self.func.name.clone(),
            reason,
        })
    }

    fn run(&self) -> Result<(), CodegenError> {
        let func = self.func;
        if func.is_declaration() {
            return Ok(());
        }
        let placed: HashSet<BlockId> = func.blocks.iter().map(|b| b.id).collect();
        if placed.len() != func.blocks.len() {
            return self.fail("block placed twice".to_owned());
        }

        let mut defs: HashMap<VReg, (BlockId, usize)> = HashMap::new();
        for b in &func.blocks {
            let term = match &b.terminator {
                Some(t) => t,
                None => return self.fail(format!("block '{}' has no terminator", func.label(b.id))),
            };
            for s in term.successors() {
                if !placed.contains(&s) {
                    return self.fail(format!(
                        "block '{}' branches to a block outside the function",
                        func.label(b.id)
                    ));
                }
            }
            let mut phis_done = false;
            for (idx, i) in b.instrs.iter().enumerate() {
                if i.kind.is_phi() {
                    if phis_done {
                        return self.fail(format!(
                            "phi '%{}' is not at the start of its block",
                            func.value_name(i.result)
                        ));
                    }
                } else {
                    phis_done = true;
                }
                if (i.result.0 as usize) < func.arity() || defs.insert(i.result, (b.id, idx)).is_some() {
                    return self.fail(format!("'%{}' is defined twice", func.value_name(i.result)));
                }
                if func.reg_type(i.result) != Some(i.kind.result_type()) {
                    return self.fail(format!("'%{}' has the wrong type", func.value_name(i.result)));
                }
            }
        }

        let preds = func.predecessors();
        if let Some(entry) = func.entry() {
            if preds.get(&entry).map_or(false, |p| !p.is_empty()) {
                return self.fail("entry block has predecessors".to_owned());
            }
        }

        for b in &func.blocks {
            for i in &b.instrs {
                self.check_types(&i.kind)?;
                if let InstrKind::Phi(_, incoming) = &i.kind {
                    let from: HashSet<BlockId> = incoming.iter().map(|(_, blk)| *blk).collect();
                    let expected: HashSet<BlockId> =
                        preds.get(&b.id).into_iter().flatten().cloned().collect();
                    if from.len() != incoming.len() || from != expected {
                        return self.fail(format!(
                            "phi '%{}' does not match the predecessors of '{}'",
                            func.value_name(i.result),
                            func.label(b.id)
                        ));
                    }
                }
            }
            if let Some(t) = &b.terminator {
                self.check_terminator(t)?;
            }
        }

        let rpo = func.reverse_post_order();
        let doms = dominators(func, &rpo);
        for &bid in &rpo {
            let block = match func.block(bid) {
                Some(b) => b,
                None => continue,
            };
            for (idx, i) in block.instrs.iter().enumerate() {
                match &i.kind {
                    InstrKind::Phi(_, incoming) => {
                        for (v, pred) in incoming {
                            if doms.contains_key(pred) {
                                self.check_available(v, *pred, None, &defs, &doms)?;
                            }
                        }
                    }
                    kind => {
                        for v in kind.operands() {
                            self.check_available(v, bid, Some(idx), &defs, &doms)?;
                        }
                    }
                }
            }
            if let Some(t) = &block.terminator {
                for v in t.operands() {
                    self.check_available(v, bid, None, &defs, &doms)?;
                }
            }
        }
        Ok(())
    }

    fn expect_type(&self, v: &Value, ty: IrType) -> Result<(), CodegenError> {
        match self.func.type_of(v) {
            Some(t) if t == ty => Ok(()),
            Some(t) => self.fail(format!("operand of type {} where {} is required", t, ty)),
            None => self.fail("operand refers to an unknown register".to_owned()),
        }
    }

    fn check_types(&self, kind: &InstrKind) -> Result<(), CodegenError> {
        match kind {
            InstrKind::Binary(_, l, r) | InstrKind::FCmp(_, l, r) => {
                self.expect_type(l, IrType::Double)?;
                self.expect_type(r, IrType::Double)
            }
            InstrKind::Call { callee, args } => {
                let arity = if *callee == self.func.name {
                    Some(self.func.arity())
                } else {
                    self.module.get_function(callee).map(Function::arity)
                };
                match arity {
                    None => return self.fail(format!("call to undeclared function '{}'", callee)),
                    Some(n) if n != args.len() => {
                        return self.fail(format!(
                            "call to '{}' with {} argument(s), expected {}",
                            callee,
                            args.len(),
                            n
                        ))
                    }
                    Some(_) => {}
                }
                args.iter()
                    .try_for_each(|a| self.expect_type(a, IrType::Double))
            }
            InstrKind::Phi(ty, incoming) => incoming
                .iter()
                .try_for_each(|(v, _)| self.expect_type(v, *ty)),
        }
    }

    fn check_terminator(&self, t: &Terminator) -> Result<(), CodegenError> {
        match t {
            Terminator::Ret(v) => self.expect_type(v, IrType::Double),
            Terminator::Br(_) => Ok(()),
            Terminator::CondBr { cond, .. } => self.expect_type(cond, IrType::I1),
        }
    }

    /// `v` used in `block`, before instruction `before` (or at the end of the
    /// block when `None`).
    fn check_available(
        &self,
        v: &Value,
        block: BlockId,
        before: Option<usize>,
        defs: &HashMap<VReg, (BlockId, usize)>,
        doms: &Dominators,
    ) -> Result<(), CodegenError> {
        let r = match v.as_reg() {
            Some(r) if (r.0 as usize) >= self.func.arity() => r,
            _ => return Ok(()),
        };
        let ok = match defs.get(&r) {
            None => false,
            Some(&(def_block, def_idx)) if def_block == block => {
                before.map_or(true, |idx| def_idx < idx)
            }
            Some(&(def_block, _)) => doms.get(&block).map_or(false, |d| d.contains(&def_block)),
        };
        if ok {
            Ok(())
        } else {
            self.fail(format!(
                "'%{}' does not dominate all of its uses",
                self.func.value_name(r)
            ))
        }
    }
}

/// Dominator sets of the reachable blocks.
fn dominators(func: &Function, rpo: &[BlockId]) -> Dominators {
    let preds = func.predecessors();
    let all: HashSet<BlockId> = rpo.iter().cloned().collect();
    let mut doms: Dominators = HashMap::new();
    for (n, &b) in rpo.iter().enumerate() {
        if n == 0 {
            doms.insert(b, std::iter::once(b).collect());
        } else {
            doms.insert(b, all.clone());
        }
    }
    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new: Option<HashSet<BlockId>> = None;
            for p in preds.get(&b).into_iter().flatten() {
                let pd = match doms.get(p) {
                    Some(pd) => pd,
                    None => continue,
                };
                new = Some(match new {
                    None => pd.clone(),
                    Some(acc) => acc.intersection(pd).cloned().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(b);
            if doms.get(&b) != Some(&new) {
                doms.insert(b, new);
                changed = true;
            }
        }
    }
    doms
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::instr::{BinOp, CmpOp, Instruction};

    fn reason(r: Result<(), CodegenError>) -> String {
        match r {
            Err(CodegenError::Malformed { reason, .. }) => reason,
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    fn if_function() -> Function {
        let mut f = Function::declare("f", vec!["x".to_owned()]);
        let x = f.param(0);
        let mut b = FunctionBuilder::new(&mut f);
        let c = b.fcmp(CmpOp::One, x, Value::Double(0.0), "ifcond");
        let t = b.create_block("then");
        let e = b.create_block("else");
        let m = b.create_block("ifcont");
        b.cond_br(c, t, e);
        b.switch_to_block(t);
        let tv = b.binary(BinOp::FMul, x, x, "multmp");
        b.br(m);
        b.switch_to_block(e);
        b.br(m);
        b.switch_to_block(m);
        let p = b.phi(IrType::Double, vec![(tv, t), (Value::Double(1.0), e)], "iftmp");
        b.ret(p);
        f
    }

    #[test]
    fn test_valid_if() {
        let m = Module::new("test");
        assert_eq!(verify_function(&m, &if_function()), Ok(()));
    }

    #[test]
    fn test_missing_terminator() {
        let mut f = Function::declare("f", vec![]);
        FunctionBuilder::new(&mut f);
        let m = Module::new("test");
        assert!(reason(verify_function(&m, &f)).contains("no terminator"));
    }

    #[test]
    fn test_use_not_dominated() {
        let mut f = if_function();
        // return the then-branch value directly from the join
        let multmp = VReg(2);
        if let Some(last) = f.blocks.last_mut() {
            last.terminator = Some(Terminator::Ret(Value::Reg(multmp)));
        }
        let m = Module::new("test");
        assert!(reason(verify_function(&m, &f)).contains("dominate"));
    }

    #[test]
    fn test_phi_edges() {
        let mut f = if_function();
        if let Some(last) = f.blocks.last_mut() {
            if let InstrKind::Phi(_, incoming) = &mut last.instrs[0].kind {
                incoming.pop();
            }
        }
        let m = Module::new("test");
        assert!(reason(verify_function(&m, &f)).contains("predecessors"));
    }

    #[test]
    fn test_call_checks() {
        let mut f = Function::declare("g", vec![]);
        let mut b = FunctionBuilder::new(&mut f);
        let v = b.call("sin", vec![], "calltmp");
        b.ret(v);

        let mut m = Module::new("test");
        assert!(reason(verify_function(&m, &f)).contains("undeclared"));
        m.add_function(Function::declare("sin", vec!["x".to_owned()]));
        assert!(reason(verify_function(&m, &f)).contains("expected 1"));
    }

    #[test]
    fn test_type_mismatch() {
        let mut f = Function::declare("g", vec![]);
        let mut b = FunctionBuilder::new(&mut f);
        let c = b.fcmp(CmpOp::One, Value::Double(1.0), Value::Double(2.0), "ifcond");
        b.ret(c);
        let m = Module::new("test");
        assert!(reason(verify_function(&m, &f)).contains("i1"));

        // a double used as a branch condition
        let mut f = Function::declare("h", vec![]);
        let mut b = FunctionBuilder::new(&mut f);
        let t = b.create_block("then");
        b.cond_br(Value::Double(1.0), t, t);
        b.switch_to_block(t);
        b.ret(Value::Double(0.0));
        assert!(reason(verify_function(&m, &f)).contains("operand of type double where i1"));

        // a result register whose recorded type disagrees with its instruction
        let mut f = Function::declare("k", vec![]);
        let r = f.new_value("bad", IrType::I1);
        let mut b = FunctionBuilder::new(&mut f);
        b.ret(Value::Double(0.0));
        f.blocks[0].instrs.push(Instruction {
            result: r,
            kind: InstrKind::Binary(BinOp::FAdd, Value::Double(1.0), Value::Double(1.0)),
        });
        assert!(reason(verify_function(&m, &f)).contains("wrong type"));
    }
}
