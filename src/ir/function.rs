use super::instr::{InstrKind, Instruction, Terminator};
use super::types::{format_double, BlockId, IrType, VReg, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BasicBlock {
    pub(crate) id: BlockId,
    pub(crate) instrs: Vec<Instruction>,
    pub(crate) terminator: Option<Terminator>,
}

impl BasicBlock {
    pub(crate) fn new(id: BlockId) -> Self {
        BasicBlock {
            id,
            instrs: Vec::new(),
            terminator: None,
        }
    }

    pub(crate) fn successors(&self) -> Vec<BlockId> {
        self.terminator
            .as_ref()
            .map(Terminator::successors)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ValueInfo {
    name: String,
    ty: IrType,
}

/// A function in SSA form. A function without blocks is a declaration whose
/// body lives elsewhere (an extern, or a definition not generated yet).
///
/// Parameters occupy the first `params.len()` virtual registers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub(crate) name: String,
    pub(crate) params: Vec<String>,
    pub(crate) blocks: Vec<BasicBlock>,
    values: Vec<ValueInfo>,
    value_names: NameTable,
    labels: Vec<String>,
    label_names: NameTable,
}

/// Hands out distinct names, suffixing a repeated hint with the next free
/// number for that hint.
#[derive(Debug, Clone, Default, PartialEq)]
struct NameTable {
    taken: HashSet<String>,
    next_suffix: HashMap<String, u32>,
}

impl NameTable {
    fn claim(&mut self, hint: &str) -> String {
        let mut name = hint.to_owned();
        if self.taken.contains(&name) {
            let next = self.next_suffix.entry(hint.to_owned()).or_insert(1);
            loop {
                name = format!("{}{}", hint, next);
                *next += 1;
                if !self.taken.contains(&name) {
                    break;
                }
            }
        }
        self.taken.insert(name.clone());
        name
    }
}

impl Function {
    pub(crate) fn declare(name: impl Into<String>, params: Vec<String>) -> Self {
        let mut value_names = NameTable::default();
        let values = params
            .iter()
            .map(|p| ValueInfo {
                name: value_names.claim(p),
                ty: IrType::Double,
            })
            .collect();
        Function {
            name: name.into(),
            params,
            blocks: Vec::new(),
            values,
            value_names,
            labels: Vec::new(),
            label_names: NameTable::default(),
        }
    }

    pub(crate) fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn arity(&self) -> usize {
        self.params.len()
    }

    pub(crate) fn param(&self, i: usize) -> Value {
        Value::Reg(VReg(i as u32))
    }

    /// Allocates a fresh virtual register, suffixing `hint` until the name is
    /// unique within the function.
    pub(crate) fn new_value(&mut self, hint: &str, ty: IrType) -> VReg {
        let name = self.value_names.claim(hint);
        self.values.push(ValueInfo { name, ty });
        VReg(self.values.len() as u32 - 1)
    }

    /// Allocates a block id with a unique label. The block is not placed in
    /// the layout; see `FunctionBuilder::switch_to_block`.
    pub(crate) fn new_block_id(&mut self, hint: &str) -> BlockId {
        let label = self.label_names.claim(hint);
        self.labels.push(label);
        BlockId(self.labels.len() as u32 - 1)
    }

    pub(crate) fn value_name(&self, v: VReg) -> &str {
        self.values
            .get(v.0 as usize)
            .map(|i| i.name.as_str())
            .unwrap_or("<invalid>")
    }

    pub(crate) fn reg_type(&self, v: VReg) -> Option<IrType> {
        self.values.get(v.0 as usize).map(|i| i.ty)
    }

    pub(crate) fn type_of(&self, v: &Value) -> Option<IrType> {
        match v {
            Value::Reg(r) => self.reg_type(*r),
            Value::Double(_) => Some(IrType::Double),
        }
    }

    pub(crate) fn label(&self, b: BlockId) -> &str {
        self.labels
            .get(b.0 as usize)
            .map(String::as_str)
            .unwrap_or("<invalid>")
    }

    pub(crate) fn entry(&self) -> Option<BlockId> {
        self.blocks.first().map(|b| b.id)
    }

    pub(crate) fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    /// Predecessors of every placed block, in layout order of the source.
    pub(crate) fn predecessors(&self) -> HashMap<BlockId, Vec<BlockId>> {
        let mut preds: HashMap<BlockId, Vec<BlockId>> =
            self.blocks.iter().map(|b| (b.id, Vec::new())).collect();
        for b in &self.blocks {
            for s in b.successors() {
                preds.entry(s).or_insert_with(Vec::new).push(b.id);
            }
        }
        preds
    }

    /// Blocks reachable from the entry, each listed after all of its
    /// dominators.
    pub(crate) fn reverse_post_order(&self) -> Vec<BlockId> {
        let entry = match self.entry() {
            Some(e) => e,
            None => return Vec::new(),
        };
        let mut visited = HashSet::new();
        let mut post = Vec::new();
        let mut stack = vec![(entry, 0usize)];
        visited.insert(entry);
        while let Some((id, next)) = stack.pop() {
            let succs = self.block(id).map(BasicBlock::successors).unwrap_or_default();
            if next < succs.len() {
                stack.push((id, next + 1));
                let s = succs[next];
                if visited.insert(s) {
                    stack.push((s, 0));
                }
            } else {
                post.push(id);
            }
        }
        post.reverse();
        post
    }

    /// Names of the functions this body calls, in order of first call.
    pub(crate) fn callees(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter_map(|i| match &i.kind {
                InstrKind::Call { callee, .. } => Some(callee.as_str()),
                _ => None,
            })
            .filter(|c| seen.insert(*c))
            .collect()
    }

    /// The callable signature, e.g. `double @add(double, double)`.
    pub(crate) fn signature(&self) -> String {
        let params = vec!["double"; self.params.len()].join(", ");
        format!("double @{}({})", self.name, params)
    }

    fn fmt_value(&self, v: &Value) -> String {
        match v {
            Value::Reg(r) => format!("%{}", self.value_name(*r)),
            Value::Double(n) => format_double(*n),
        }
    }

    fn fmt_instr(&self, f: &mut fmt::Formatter<'_>, i: &Instruction) -> fmt::Result {
        write!(f, "  %{} = ", self.value_name(i.result))?;
        match &i.kind {
            InstrKind::Binary(op, l, r) => writeln!(
                f,
                "{} double {}, {}",
                op.mnemonic(),
                self.fmt_value(l),
                self.fmt_value(r)
            ),
            InstrKind::FCmp(op, l, r) => writeln!(
                f,
                "fcmp {} double {}, {}",
                op.mnemonic(),
                self.fmt_value(l),
                self.fmt_value(r)
            ),
            InstrKind::Call { callee, args } => {
                let args = args
                    .iter()
                    .map(|a| format!("double {}", self.fmt_value(a)))
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(f, "call double @{}({})", callee, args)
            }
            InstrKind::Phi(ty, incoming) => {
                let incoming = incoming
                    .iter()
                    .map(|(v, b)| format!("[ {}, %{} ]", self.fmt_value(v), self.label(*b)))
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(f, "phi {} {}", ty, incoming)
            }
        }
    }

    fn fmt_terminator(&self, f: &mut fmt::Formatter<'_>, t: &Terminator) -> fmt::Result {
        match t {
            Terminator::Ret(v) => writeln!(f, "  ret double {}", self.fmt_value(v)),
            Terminator::Br(b) => writeln!(f, "  br label %{}", self.label(*b)),
            Terminator::CondBr {
                cond,
                then_block,
                else_block,
            } => writeln!(
                f,
                "  br i1 {}, label %{}, label %{}",
                self.fmt_value(cond),
                self.label(*then_block),
                self.label(*else_block)
            ),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|p| format!("double %{}", p))
            .collect::<Vec<_>>()
            .join(", ");
        if self.is_declaration() {
            return writeln!(f, "declare double @{}({})", self.name, params);
        }
        writeln!(f, "define double @{}({}) {{", self.name, params)?;
        for (n, b) in self.blocks.iter().enumerate() {
            if n > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}:", self.label(b.id))?;
            for i in &b.instrs {
                self.fmt_instr(f, i)?;
            }
            if let Some(t) = &b.terminator {
                self.fmt_terminator(f, t)?;
            }
        }
        writeln!(f, "}}")
    }
}

/// A compilation unit: the functions generated since it was opened.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Module {
    name: String,
    functions: Vec<Function>,
}

impl Module {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    #[cfg(feature = "llvm")]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub(crate) fn get_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Inserts `function`, replacing any function of the same name in place.
    pub(crate) fn add_function(&mut self, function: Function) -> &mut Function {
        let idx = match self.functions.iter().position(|f| f.name == function.name) {
            Some(idx) => {
                self.functions[idx] = function;
                idx
            }
            None => {
                self.functions.push(function);
                self.functions.len() - 1
            }
        };
        &mut self.functions[idx]
    }

    pub(crate) fn remove_function(&mut self, name: &str) -> Option<Function> {
        let idx = self.functions.iter().position(|f| f.name == name)?;
        Some(self.functions.remove(idx))
    }

    /// Drops every function `root` cannot reach through calls. Returns false,
    /// leaving the unit untouched, when `root` is not in it.
    pub(crate) fn retain_reachable(&mut self, root: &str) -> bool {
        if self.get_function(root).is_none() {
            return false;
        }
        let mut live: HashSet<String> = HashSet::new();
        let mut work = vec![root.to_owned()];
        while let Some(name) = work.pop() {
            if !live.insert(name.clone()) {
                continue;
            }
            if let Some(f) = self.get_function(&name) {
                work.extend(f.callees().into_iter().map(str::to_owned));
            }
        }
        self.functions.retain(|f| live.contains(&f.name));
        true
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::instr::{BinOp, CmpOp};

    fn diamond() -> Function {
        let mut f = Function::declare("choose", vec!["x".to_owned()]);
        let x = f.param(0);
        let mut b = FunctionBuilder::new(&mut f);
        let cond = b.fcmp(CmpOp::One, x, Value::Double(0.0), "ifcond");
        let then_bb = b.create_block("then");
        let else_bb = b.create_block("else");
        let merge_bb = b.create_block("ifcont");
        b.cond_br(cond, then_bb, else_bb);
        b.switch_to_block(then_bb);
        let t = b.binary(BinOp::FAdd, x, Value::Double(1.0), "addtmp");
        b.br(merge_bb);
        b.switch_to_block(else_bb);
        let e = b.binary(BinOp::FAdd, x, Value::Double(2.0), "addtmp");
        b.br(merge_bb);
        b.switch_to_block(merge_bb);
        let phi = b.phi(IrType::Double, vec![(t, then_bb), (e, else_bb)], "iftmp");
        b.ret(phi);
        f
    }

    #[test]
    fn test_unique_value_names() {
        let f = diamond();
        let text = f.to_string();
        assert!(text.contains("%addtmp = fadd double %x, 1.000000e+00"));
        assert!(text.contains("%addtmp1 = fadd double %x, 2.000000e+00"));
        assert!(text.contains("%iftmp = phi double [ %addtmp, %then ], [ %addtmp1, %else ]"));
        assert!(text.contains("br i1 %ifcond, label %then, label %else"));
    }

    #[test]
    fn test_cfg_queries() {
        let f = diamond();
        let ids: Vec<BlockId> = f.blocks.iter().map(|b| b.id).collect();
        let preds = f.predecessors();
        assert!(preds[&ids[0]].is_empty());
        assert_eq!(preds[&ids[3]], vec![ids[1], ids[2]]);

        let rpo = f.reverse_post_order();
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], ids[0]);
        assert_eq!(rpo[3], ids[3]);
    }

    #[test]
    fn test_many_values_with_one_hint() {
        let mut f = Function::declare("sum", vec!["addtmp1".to_owned()]);
        let first = f.new_value("addtmp", IrType::Double);
        let second = f.new_value("addtmp", IrType::Double);
        assert_eq!(f.value_name(first), "addtmp");
        // the parameter already holds the first suffix
        assert_eq!(f.value_name(second), "addtmp2");

        let last = (0..5000)
            .map(|_| f.new_value("addtmp", IrType::Double))
            .last()
            .expect("values");
        assert_eq!(f.value_name(last), "addtmp5002");
        let names: HashSet<&str> = (0..f.values.len() as u32)
            .map(|i| f.value_name(VReg(i)))
            .collect();
        assert_eq!(names.len(), f.values.len());
    }

    fn caller(name: &str, callees: &[&str]) -> Function {
        let mut f = Function::declare(name, vec![]);
        let mut b = FunctionBuilder::new(&mut f);
        let mut last = Value::Double(0.0);
        for c in callees {
            last = b.call(c, vec![], "calltmp");
        }
        b.ret(last);
        f
    }

    #[test]
    fn test_retain_reachable() {
        let mut m = Module::new("my cool jit");
        m.add_function(Function::declare("broken", vec![]));
        m.add_function(Function::declare("sin", vec!["x".to_owned()]));
        m.add_function(caller("uses_broken", &["broken"]));
        m.add_function(caller("leaf", &[]));
        m.add_function(caller("mid", &["leaf", "mid"]));
        m.add_function(caller("__anon_expr", &["mid", "mid"]));

        assert!(m.retain_reachable("__anon_expr"));
        let names: Vec<&str> = m.functions().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["leaf", "mid", "__anon_expr"]);
        assert!(!m.retain_reachable("missing"));
        assert_eq!(m.functions().count(), 3);
    }

    #[test]
    fn test_module_replace_and_display() {
        let mut m = Module::new("my cool jit");
        m.add_function(Function::declare("sin", vec!["x".to_owned()]));
        m.add_function(diamond());
        assert_eq!(m.functions().count(), 2);

        let replaced = m.add_function(Function::declare("choose", vec!["y".to_owned()]));
        assert!(replaced.is_declaration());
        assert_eq!(m.functions().count(), 2);
        assert_eq!(
            m.to_string(),
            "; ModuleID = 'my cool jit'\n\n\
             declare double @sin(double %x)\n\n\
             declare double @choose(double %y)\n"
        );

        assert!(m.remove_function("sin").is_some());
        assert!(m.get_function("sin").is_none());
        assert_eq!(m.get_function("choose").map(Function::signature),
            Some("double @choose(double)".to_owned()));
    }
}
