use super::{symbols, unknown_symbol, unknown_tracker, Jit, JitSymbol, ResourceTracker};
use crate::error::{Error, ErrorKind};
use crate::ir::{self, BinOp, BlockId, CmpOp, InstrKind, IrType, Terminator, VReg};
use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::condcodes::FloatCC;
use cranelift_codegen::ir::{types, AbiParam, Block, InstBuilder, Signature, UserFuncName};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module as _};
use std::collections::{HashMap, HashSet};
use std::fmt;

fn jit_error(e: impl fmt::Display) -> Error {
    Error::from(ErrorKind::Execution(e.to_string()))
}

fn host_isa(optimize: bool) -> Result<OwnedTargetIsa, Error> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(jit_error)?;
    flag_builder.set("is_pic", "false").map_err(jit_error)?;
    let opt_level = if optimize { "speed" } else { "none" };
    flag_builder.set("opt_level", opt_level).map_err(jit_error)?;
    let isa_builder = cranelift_native::builder().map_err(jit_error)?;
    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(jit_error)
}

struct Unit {
    module: JITModule,
    functions: HashMap<String, (FuncId, usize)>,
}

/// Cranelift backend. Every unit gets its own `JITModule`, so freeing one
/// unit's memory never touches another's code. With `optimize` set, code is
/// compiled at `opt_level=speed`.
pub(crate) struct CraneliftJit {
    optimize: bool,
    next: u64,
    units: HashMap<ResourceTracker, Unit>,
}

impl CraneliftJit {
    pub(crate) fn new(optimize: bool) -> Result<Self, Error> {
        // fail early when the host is not supported
        host_isa(optimize)?;
        Ok(CraneliftJit {
            optimize,
            next: 0,
            units: HashMap::new(),
        })
    }
}

/// Externs that some body in `module` calls.
fn referenced_externs(module: &ir::Module) -> HashSet<&str> {
    let declared: HashSet<&str> = module
        .functions()
        .filter(|f| f.is_declaration())
        .map(|f| f.name.as_str())
        .collect();
    module
        .functions()
        .flat_map(|f| f.blocks.iter())
        .flat_map(|b| b.instrs.iter())
        .filter_map(|i| match &i.kind {
            InstrKind::Call { callee, .. } => declared.get(callee.as_str()).cloned(),
            _ => None,
        })
        .collect()
}

fn signature(module: &JITModule, arity: usize) -> Signature {
    let mut sig = module.make_signature();
    for _ in 0..arity {
        sig.params.push(AbiParam::new(types::F64));
    }
    sig.returns.push(AbiParam::new(types::F64));
    sig
}

type FuncIds = HashMap<String, (FuncId, usize)>;

/// Declares the functions of `module` that `linkage` picks a linkage for.
fn declare_functions(
    jit: &mut JITModule,
    module: &ir::Module,
    linkage: impl Fn(&ir::Function) -> Option<Linkage>,
) -> Result<FuncIds, Error> {
    let mut ids = HashMap::new();
    for f in module.functions() {
        let linkage = match linkage(f) {
            Some(l) => l,
            None => continue,
        };
        let sig = signature(jit, f.arity());
        let id = jit
            .declare_function(&f.name, linkage, &sig)
            .map_err(jit_error)?;
        ids.insert(f.name.clone(), (id, f.arity()));
    }
    Ok(ids)
}

/// Translates the body of `f` into `ctx.func`.
fn build_function(
    jit: &mut JITModule,
    ids: &FuncIds,
    f: &ir::Function,
    ctx: &mut Context,
    builder_ctx: &mut FunctionBuilderContext,
) -> Result<FuncId, Error> {
    let id = ids.get(&f.name).map(|(id, _)| *id).ok_or_else(|| unknown_symbol(&f.name))?;
    ctx.func.signature = signature(jit, f.arity());
    ctx.func.name = UserFuncName::user(0, id.as_u32());
    let mut builder = FunctionBuilder::new(&mut ctx.func, builder_ctx);
    Translator {
        jit,
        ids,
        func: f,
        builder: &mut builder,
        blocks: HashMap::new(),
        values: HashMap::new(),
    }
    .translate()?;
    builder.finalize();
    Ok(id)
}

fn clif_type(ty: IrType) -> types::Type {
    match ty {
        IrType::Double => types::F64,
        IrType::I1 => types::I8,
    }
}

fn compile(
    jit: &mut JITModule,
    module: &ir::Module,
    referenced: &HashSet<&str>,
) -> Result<FuncIds, Error> {
    let ids = declare_functions(jit, module, |f| {
        if !f.is_declaration() {
            Some(Linkage::Export)
        } else if referenced.contains(f.name.as_str()) {
            Some(Linkage::Import)
        } else {
            None
        }
    })?;

    let mut ctx = jit.make_context();
    let mut builder_ctx = FunctionBuilderContext::new();
    for f in module.functions().filter(|f| !f.is_declaration()) {
        let id = build_function(jit, &ids, f, &mut ctx, &mut builder_ctx)?;
        jit.define_function(id, &mut ctx).map_err(jit_error)?;
        jit.clear_context(&mut ctx);
    }
    jit.finalize_definitions().map_err(jit_error)?;
    Ok(ids)
}

/// Runs Cranelift's mid-end over `f` and prints the result. Callees are
/// only declared, so nothing needs to resolve.
fn optimized_text(
    jit: &mut JITModule,
    module: &ir::Module,
    f: &ir::Function,
) -> Result<String, Error> {
    let ids = declare_functions(jit, module, |_| Some(Linkage::Import))?;
    let mut ctx = jit.make_context();
    let mut builder_ctx = FunctionBuilderContext::new();
    build_function(jit, &ids, f, &mut ctx, &mut builder_ctx)?;
    ctx.optimize(jit.isa(), &mut ControlPlane::default())
        .map_err(jit_error)?;
    Ok(ctx.func.display().to_string())
}

/// Lowers one IR function. Blocks are visited in reverse post order so every
/// operand is translated before its uses; phis become block parameters.
struct Translator<'a, 'b> {
    jit: &'a mut JITModule,
    ids: &'a FuncIds,
    func: &'a ir::Function,
    builder: &'a mut FunctionBuilder<'b>,
    blocks: HashMap<BlockId, Block>,
    values: HashMap<VReg, cranelift_codegen::ir::Value>,
}

impl<'a, 'b> Translator<'a, 'b> {
    fn malformed(&self, what: &str) -> Error {
        Error::from(ErrorKind::Execution(format!(
            "cannot translate '{}': {}",
            self.func.name, what
        )))
    }

    fn translate(mut self) -> Result<(), Error> {
        let order = self.func.reverse_post_order();
        for id in &order {
            let block = self.builder.create_block();
            self.blocks.insert(*id, block);
        }
        let entry = match order.first() {
            Some(id) => self.blocks[id],
            None => return Err(self.malformed("no entry block")),
        };
        self.builder.append_block_params_for_function_params(entry);
        let params = self.builder.block_params(entry).to_vec();
        for (i, p) in params.into_iter().enumerate() {
            self.values.insert(VReg(i as u32), p);
        }

        for id in &order {
            let block = self.blocks[id];
            for i in self.ir_block(*id)?.instrs.iter().filter(|i| i.kind.is_phi()) {
                let p = self
                    .builder
                    .append_block_param(block, clif_type(i.kind.result_type()));
                self.values.insert(i.result, p);
            }
        }

        for id in &order {
            self.builder.switch_to_block(self.blocks[id]);
            let ir_block = self.ir_block(*id)?;
            for i in ir_block.instrs.iter().filter(|i| !i.kind.is_phi()) {
                let v = self.instr(&i.kind)?;
                self.values.insert(i.result, v);
            }
            match &ir_block.terminator {
                Some(t) => self.terminator(*id, t)?,
                None => return Err(self.malformed("unterminated block")),
            }
        }
        self.builder.seal_all_blocks();
        Ok(())
    }

    fn ir_block(&self, id: BlockId) -> Result<&'a ir::BasicBlock, Error> {
        let func: &'a ir::Function = self.func;
        func.block(id).ok_or_else(|| self.malformed("dangling block"))
    }

    fn operand(&mut self, v: &ir::Value) -> Result<cranelift_codegen::ir::Value, Error> {
        match v {
            ir::Value::Reg(r) => self
                .values
                .get(r)
                .cloned()
                .ok_or_else(|| self.malformed("use before definition")),
            ir::Value::Double(n) => Ok(self.builder.ins().f64const(*n)),
        }
    }

    fn instr(&mut self, kind: &InstrKind) -> Result<cranelift_codegen::ir::Value, Error> {
        match kind {
            InstrKind::Binary(op, l, r) => {
                let (l, r) = (self.operand(l)?, self.operand(r)?);
                let ins = self.builder.ins();
                Ok(match op {
                    BinOp::FAdd => ins.fadd(l, r),
                    BinOp::FSub => ins.fsub(l, r),
                    BinOp::FMul => ins.fmul(l, r),
                    BinOp::FDiv => ins.fdiv(l, r),
                })
            }
            InstrKind::FCmp(op, l, r) => {
                let (l, r) = (self.operand(l)?, self.operand(r)?);
                let cc = match op {
                    CmpOp::One => FloatCC::OrderedNotEqual,
                };
                Ok(self.builder.ins().fcmp(cc, l, r))
            }
            InstrKind::Call { callee, args } => {
                let id = match self.ids.get(callee) {
                    Some((id, _)) => *id,
                    None => return Err(unknown_symbol(callee)),
                };
                let mut argv = Vec::with_capacity(args.len());
                for a in args {
                    argv.push(self.operand(a)?);
                }
                let func_ref = self.jit.declare_func_in_func(id, self.builder.func);
                let call = self.builder.ins().call(func_ref, &argv);
                Ok(self.builder.inst_results(call)[0])
            }
            InstrKind::Phi(..) => Err(self.malformed("phi after the start of a block")),
        }
    }

    /// Values `from` passes to the phis of `to`.
    fn edge_args(
        &mut self,
        from: BlockId,
        to: BlockId,
    ) -> Result<Vec<cranelift_codegen::ir::Value>, Error> {
        let mut args = Vec::new();
        for i in self.ir_block(to)?.instrs.iter() {
            if let InstrKind::Phi(_, incoming) = &i.kind {
                let v = match incoming.iter().find(|(_, b)| *b == from) {
                    Some((v, _)) => *v,
                    None => return Err(self.malformed("phi without an incoming edge")),
                };
                args.push(self.operand(&v)?);
            }
        }
        Ok(args)
    }

    fn target(&self, id: &BlockId) -> Result<Block, Error> {
        self.blocks
            .get(id)
            .cloned()
            .ok_or_else(|| self.malformed("branch to unreachable block"))
    }

    fn terminator(&mut self, from: BlockId, t: &Terminator) -> Result<(), Error> {
        match t {
            Terminator::Ret(v) => {
                let v = self.operand(v)?;
                self.builder.ins().return_(&[v]);
            }
            Terminator::Br(dest) => {
                let args = self.edge_args(from, *dest)?;
                let dest = self.target(dest)?;
                self.builder.ins().jump(dest, &args);
            }
            Terminator::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                let cond = self.operand(cond)?;
                let then_args = self.edge_args(from, *then_block)?;
                let else_args = self.edge_args(from, *else_block)?;
                let (then_b, else_b) = (self.target(then_block)?, self.target(else_block)?);
                self.builder
                    .ins()
                    .brif(cond, then_b, &then_args, else_b, &else_args);
            }
        }
        Ok(())
    }
}

impl Jit for CraneliftJit {
    fn add_module(&mut self, module: ir::Module) -> Result<ResourceTracker, Error> {
        let referenced = referenced_externs(&module);
        let mut resolved = Vec::with_capacity(referenced.len());
        for f in module.functions() {
            if f.is_declaration() && referenced.contains(f.name.as_str()) {
                resolved.push((f.name.clone(), symbols::resolve(&f.name, f.arity())?));
            }
        }

        let mut builder = JITBuilder::with_isa(host_isa(self.optimize)?, default_libcall_names());
        for (name, addr) in resolved {
            builder.symbol(name, addr);
        }
        let mut jit = JITModule::new(builder);
        let functions = match compile(&mut jit, &module, &referenced) {
            Ok(functions) => functions,
            Err(e) => {
                unsafe { jit.free_memory() };
                return Err(e);
            }
        };

        let tracker = ResourceTracker::new(self.next);
        self.next += 1;
        self.units.insert(
            tracker,
            Unit {
                module: jit,
                functions,
            },
        );
        Ok(tracker)
    }

    fn optimized_ir(&self, module: &ir::Module, name: &str) -> Result<String, Error> {
        let f = module
            .get_function(name)
            .filter(|f| !f.is_declaration())
            .ok_or_else(|| unknown_symbol(name))?;
        let builder = JITBuilder::with_isa(host_isa(self.optimize)?, default_libcall_names());
        let mut jit = JITModule::new(builder);
        let text = optimized_text(&mut jit, module, f);
        unsafe { jit.free_memory() };
        text
    }

    fn lookup(&self, tracker: ResourceTracker, name: &str) -> Result<JitSymbol<'_>, Error> {
        let unit = self
            .units
            .get(&tracker)
            .ok_or_else(|| unknown_tracker(tracker))?;
        let (id, arity) = unit
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| unknown_symbol(name))?;
        Ok(JitSymbol::new(unit.module.get_finalized_function(id), arity))
    }

    fn remove(&mut self, tracker: ResourceTracker) -> Result<(), Error> {
        let unit = self
            .units
            .remove(&tracker)
            .ok_or_else(|| unknown_tracker(tracker))?;
        // nothing borrows the unit: symbols hold a borrow of `self`
        unsafe { unit.module.free_memory() };
        Ok(())
    }

    fn resident(&self) -> usize {
        self.units.len()
    }
}

impl Drop for CraneliftJit {
    fn drop(&mut self) {
        for (_, unit) in self.units.drain() {
            unsafe { unit.module.free_memory() };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codegen::CodeGen;
    use crate::lexer::tokenize;
    use crate::parser::{parse_definition, parse_extern, parse_top_level_expr, ANON_EXPR};

    fn unit(defs: &[&str], expr: &str) -> ir::Module {
        let mut m = ir::Module::new("my cool jit");
        let mut cg = CodeGen::new();
        for src in defs {
            let tokens = tokenize(src).expect("lexes");
            if src.starts_with("extern") {
                let proto = parse_extern(&tokens).expect("parses").0;
                cg.codegen_proto(&mut m, &proto).expect("declares");
            } else {
                let f = parse_definition(&tokens).expect("parses").0;
                cg.codegen_func(&mut m, &f).expect("codegen");
            }
        }
        let tokens = tokenize(expr).expect("lexes");
        let f = parse_top_level_expr(&tokens).expect("parses").0;
        cg.codegen_func(&mut m, &f).expect("codegen");
        m
    }

    fn eval(jit: &mut CraneliftJit, defs: &[&str], expr: &str) -> f64 {
        let tracker = jit.add_module(unit(defs, expr)).expect("compiles");
        let result = jit
            .lookup(tracker, ANON_EXPR)
            .and_then(|s| s.call0())
            .expect("runs");
        jit.remove(tracker).expect("removes");
        result
    }

    #[test]
    fn test_arithmetic() {
        let mut jit = CraneliftJit::new(true).expect("host isa");
        assert_eq!(eval(&mut jit, &[], "1+2*3"), 7.0);
        assert_eq!(eval(&mut jit, &[], "(1+2)*3"), 9.0);
        assert_eq!(eval(&mut jit, &[], "8/2-1"), 3.0);
        assert_eq!(eval(&mut jit, &[], "1/0"), f64::INFINITY);
        assert_eq!(jit.resident(), 0);

        let mut jit = CraneliftJit::new(false).expect("host isa");
        assert_eq!(eval(&mut jit, &[], "(1+2)*3 - 10/4"), 6.5);
    }

    #[test]
    fn test_if_and_calls() {
        let mut jit = CraneliftJit::new(true).expect("host isa");
        let defs = ["def add(a b) a+b", "def fact(n) if n then n*fact(n-1) else 1"];
        assert_eq!(eval(&mut jit, &defs, "add(3, 4)"), 7.0);
        assert_eq!(eval(&mut jit, &defs, "fact(5)"), 120.0);
        assert_eq!(eval(&mut jit, &[], "if 1 then 2 else 3"), 2.0);
        assert_eq!(eval(&mut jit, &[], "if 0 then 2 else 3"), 3.0);
    }

    #[test]
    fn test_externs() {
        let mut jit = CraneliftJit::new(true).expect("host isa");
        assert_eq!(eval(&mut jit, &["extern sqrt(x)"], "sqrt(16)"), 4.0);
        // unreferenced externs need not resolve
        assert_eq!(eval(&mut jit, &["extern nosuchfn(x)"], "1"), 1.0);

        let err = jit.add_module(unit(&["extern nosuchfn(x)"], "nosuchfn(1)"));
        assert!(err.is_err());
        assert_eq!(jit.resident(), 0);
    }

    #[test]
    fn test_optimized_ir() {
        let jit = CraneliftJit::new(true).expect("host isa");
        let m = unit(&["extern nosuchfn(x)", "def k(x) (1+2)*x + nosuchfn(x)"], "k(1)");
        // callees are declared only, so an unresolvable extern is fine here
        let text = jit.optimized_ir(&m, "k").expect("optimizes");
        assert!(text.starts_with("function u0:"), "{}", text);
        assert!(text.contains("fmul"), "{}", text);
        assert!(text.contains("call fn"), "{}", text);
        assert!(jit.optimized_ir(&m, "nosuchfn").is_err());
        assert!(jit.optimized_ir(&m, "missing").is_err());
        assert_eq!(jit.resident(), 0);
    }

    #[test]
    fn test_units_are_independent() {
        let mut jit = CraneliftJit::new(true).expect("host isa");
        let a = jit.add_module(unit(&[], "1")).expect("compiles");
        let b = jit.add_module(unit(&[], "2")).expect("compiles");
        assert_ne!(a, b);
        assert_eq!(jit.resident(), 2);
        jit.remove(a).expect("removes");
        assert!(jit.lookup(a, ANON_EXPR).is_err());
        let v = jit.lookup(b, ANON_EXPR).and_then(|s| s.call0()).expect("runs");
        assert_eq!(v, 2.0);
        assert!(jit.remove(a).is_err());
        assert!(jit.lookup(b, "missing").is_err());
    }
}
