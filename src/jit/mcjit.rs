use super::{symbols, unknown_symbol, unknown_tracker, Jit, JitSymbol, ResourceTracker};
use crate::error::{Error, ErrorKind};
use crate::ir::{self, BinOp, BlockId, CmpOp, InstrKind, IrType, Terminator, VReg};
use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyModule};
use llvm_sys::core;
use llvm_sys::execution_engine::{self, LLVMExecutionEngineRef, LLVMMCJITCompilerOptions};
use llvm_sys::prelude::*;
use llvm_sys::support::LLVMAddSymbol;
use llvm_sys::target;
use llvm_sys::transforms::instcombine::LLVMAddInstructionCombiningPass;
use llvm_sys::transforms::scalar::{
    LLVMAddCFGSimplificationPass, LLVMAddGVNPass, LLVMAddReassociatePass,
};
use llvm_sys::LLVMRealPredicate;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::mem;
use std::os::raw::c_char;
use std::ptr;
use std::sync::Once;

static INIT: Once = Once::new();

fn llvm_error(message: String) -> Error {
    Error::from(ErrorKind::Execution(message))
}

fn c_name(s: &str) -> Result<CString, Error> {
    CString::new(s).map_err(|_| llvm_error(format!("bad symbol name '{}'", s)))
}

/// Takes ownership of an LLVM error message.
unsafe fn take_message(msg: *mut c_char) -> String {
    if msg.is_null() {
        return "unknown LLVM error".to_owned();
    }
    let s = CStr::from_ptr(msg).to_string_lossy().into_owned();
    core::LLVMDisposeMessage(msg);
    s
}

struct Unit {
    context: LLVMContextRef,
    engine: LLVMExecutionEngineRef,
    arities: HashMap<String, usize>,
}

impl Unit {
    unsafe fn dispose(self) {
        // the engine owns the module
        execution_engine::LLVMDisposeExecutionEngine(self.engine);
        core::LLVMContextDispose(self.context);
    }
}

/// LLVM MCJIT backend: one context, module and execution engine per unit.
/// With `optimize` set, every body goes through the function pass manager
/// before it is compiled.
pub(crate) struct McJit {
    optimize: bool,
    next: u64,
    units: HashMap<ResourceTracker, Unit>,
}

impl McJit {
    pub(crate) fn new(optimize: bool) -> Result<Self, Error> {
        let mut ok = true;
        INIT.call_once(|| unsafe {
            execution_engine::LLVMLinkInMCJIT();
            ok = target::LLVM_InitializeNativeTarget() == 0
                && target::LLVM_InitializeNativeAsmPrinter() == 0;
        });
        if !ok {
            return Err(llvm_error("cannot initialize the native target".to_owned()));
        }
        Ok(McJit {
            optimize,
            next: 0,
            units: HashMap::new(),
        })
    }
}

struct Lowering<'a> {
    context: LLVMContextRef,
    module: LLVMModuleRef,
    builder: LLVMBuilderRef,
    double: LLVMTypeRef,
    i1: LLVMTypeRef,
    func: &'a ir::Function,
    values: HashMap<VReg, LLVMValueRef>,
    blocks: HashMap<BlockId, LLVMBasicBlockRef>,
    phis: Vec<(LLVMValueRef, &'a [(ir::Value, BlockId)])>,
}

impl<'a> Lowering<'a> {
    fn ty(&self, ty: IrType) -> LLVMTypeRef {
        match ty {
            IrType::Double => self.double,
            IrType::I1 => self.i1,
        }
    }

    unsafe fn operand(&self, v: &ir::Value) -> Result<LLVMValueRef, Error> {
        match v {
            ir::Value::Reg(r) => self
                .values
                .get(r)
                .cloned()
                .ok_or_else(|| llvm_error(format!("use before definition in '{}'", self.func.name))),
            ir::Value::Double(n) => Ok(core::LLVMConstReal(self.double, *n)),
        }
    }

    unsafe fn lower(mut self) -> Result<(), Error> {
        let fname = c_name(&self.func.name)?;
        let fn_val = core::LLVMGetNamedFunction(self.module, fname.as_ptr());
        if fn_val.is_null() {
            return Err(unknown_symbol(&self.func.name));
        }
        for (i, p) in self.func.params.iter().enumerate() {
            let param = core::LLVMGetParam(fn_val, i as u32);
            core::LLVMSetValueName(param, c_name(p)?.as_ptr());
            self.values.insert(VReg(i as u32), param);
        }

        let order = self.func.reverse_post_order();
        for id in &order {
            let label = c_name(self.func.label(*id))?;
            let bb = core::LLVMAppendBasicBlockInContext(self.context, fn_val, label.as_ptr());
            self.blocks.insert(*id, bb);
        }

        let func = self.func;
        for id in &order {
            let block = match func.block(*id) {
                Some(b) => b,
                None => continue,
            };
            core::LLVMPositionBuilderAtEnd(self.builder, self.blocks[id]);
            for i in &block.instrs {
                let name = c_name(self.func.value_name(i.result))?;
                let v = self.instr(&i.kind, name.as_ptr())?;
                self.values.insert(i.result, v);
            }
            match &block.terminator {
                Some(t) => self.terminator(t)?,
                None => return Err(llvm_error(format!("unterminated block in '{}'", self.func.name))),
            }
        }

        for (phi, incoming) in mem::replace(&mut self.phis, Vec::new()) {
            let mut vals = Vec::with_capacity(incoming.len());
            let mut bbs = Vec::with_capacity(incoming.len());
            for (v, from) in incoming {
                if let Some(bb) = self.blocks.get(from) {
                    vals.push(self.operand(v)?);
                    bbs.push(*bb);
                }
            }
            core::LLVMAddIncoming(phi, vals.as_mut_ptr(), bbs.as_mut_ptr(), vals.len() as u32);
        }
        Ok(())
    }

    unsafe fn instr(&mut self, kind: &'a InstrKind, name: *const c_char) -> Result<LLVMValueRef, Error> {
        let b = self.builder;
        Ok(match kind {
            InstrKind::Binary(op, l, r) => {
                let (l, r) = (self.operand(l)?, self.operand(r)?);
                match op {
                    BinOp::FAdd => core::LLVMBuildFAdd(b, l, r, name),
                    BinOp::FSub => core::LLVMBuildFSub(b, l, r, name),
                    BinOp::FMul => core::LLVMBuildFMul(b, l, r, name),
                    BinOp::FDiv => core::LLVMBuildFDiv(b, l, r, name),
                }
            }
            InstrKind::FCmp(op, l, r) => {
                let (l, r) = (self.operand(l)?, self.operand(r)?);
                let pred = match op {
                    CmpOp::One => LLVMRealPredicate::LLVMRealONE,
                };
                core::LLVMBuildFCmp(b, pred, l, r, name)
            }
            InstrKind::Call { callee, args } => {
                let cname = c_name(callee)?;
                let f = core::LLVMGetNamedFunction(self.module, cname.as_ptr());
                if f.is_null() {
                    return Err(unknown_symbol(callee));
                }
                let mut argv = Vec::with_capacity(args.len());
                for a in args {
                    argv.push(self.operand(a)?);
                }
                core::LLVMBuildCall(b, f, argv.as_mut_ptr(), argv.len() as u32, name)
            }
            InstrKind::Phi(ty, incoming) => {
                let phi = core::LLVMBuildPhi(b, self.ty(*ty), name);
                self.phis.push((phi, incoming.as_slice()));
                phi
            }
        })
    }

    unsafe fn terminator(&self, t: &Terminator) -> Result<(), Error> {
        let block = |id: &BlockId| {
            self.blocks
                .get(id)
                .cloned()
                .ok_or_else(|| llvm_error(format!("branch to unreachable block in '{}'", self.func.name)))
        };
        match t {
            Terminator::Ret(v) => {
                core::LLVMBuildRet(self.builder, self.operand(v)?);
            }
            Terminator::Br(dest) => {
                core::LLVMBuildBr(self.builder, block(dest)?);
            }
            Terminator::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                core::LLVMBuildCondBr(
                    self.builder,
                    self.operand(cond)?,
                    block(then_block)?,
                    block(else_block)?,
                );
            }
        }
        Ok(())
    }
}

/// Builds the LLVM module for `unit` inside `context`.
unsafe fn build_module(context: LLVMContextRef, unit: &ir::Module) -> Result<LLVMModuleRef, Error> {
    let name = c_name(unit.name())?;
    let module = core::LLVMModuleCreateWithNameInContext(name.as_ptr(), context);
    let double = core::LLVMDoubleTypeInContext(context);
    let i1 = core::LLVMInt1TypeInContext(context);

    for f in unit.functions() {
        let mut params = vec![double; f.arity()];
        let fn_type = core::LLVMFunctionType(double, params.as_mut_ptr(), params.len() as u32, 0);
        core::LLVMAddFunction(module, c_name(&f.name)?.as_ptr(), fn_type);
    }

    let builder = core::LLVMCreateBuilderInContext(context);
    let mut result = Ok(());
    for f in unit.functions().filter(|f| !f.is_declaration()) {
        result = Lowering {
            context,
            module,
            builder,
            double,
            i1,
            func: f,
            values: HashMap::new(),
            blocks: HashMap::new(),
            phis: Vec::new(),
        }
        .lower();
        if result.is_err() {
            break;
        }
    }
    core::LLVMDisposeBuilder(builder);

    if result.is_ok() {
        let mut msg = ptr::null_mut();
        if LLVMVerifyModule(
            module,
            LLVMVerifierFailureAction::LLVMReturnStatusAction,
            &mut msg,
        ) != 0
        {
            result = Err(llvm_error(take_message(msg)));
        } else if !msg.is_null() {
            core::LLVMDisposeMessage(msg);
        }
    }
    match result {
        Ok(()) => Ok(module),
        Err(e) => {
            core::LLVMDisposeModule(module);
            Err(e)
        }
    }
}

/// Runs the function passes over every body in `module`.
unsafe fn optimize_module(module: LLVMModuleRef) {
    let the_fpm = core::LLVMCreateFunctionPassManagerForModule(module);
    LLVMAddInstructionCombiningPass(the_fpm);
    LLVMAddReassociatePass(the_fpm);
    LLVMAddGVNPass(the_fpm);
    LLVMAddCFGSimplificationPass(the_fpm);
    core::LLVMInitializeFunctionPassManager(the_fpm);
    let mut f = core::LLVMGetFirstFunction(module);
    while !f.is_null() {
        if core::LLVMIsDeclaration(f) == 0 {
            core::LLVMRunFunctionPassManager(the_fpm, f);
        }
        f = core::LLVMGetNextFunction(f);
    }
    core::LLVMFinalizeFunctionPassManager(the_fpm);
    core::LLVMDisposePassManager(the_fpm);
}

impl Jit for McJit {
    fn add_module(&mut self, unit: ir::Module) -> Result<ResourceTracker, Error> {
        let called: Vec<&str> = unit
            .functions()
            .flat_map(|f| f.blocks.iter())
            .flat_map(|b| b.instrs.iter())
            .filter_map(|i| match &i.kind {
                InstrKind::Call { callee, .. } => Some(callee.as_str()),
                _ => None,
            })
            .collect();
        for f in unit.functions() {
            if f.is_declaration() && called.contains(&f.name.as_str()) {
                let addr = symbols::resolve(&f.name, f.arity())?;
                unsafe { LLVMAddSymbol(c_name(&f.name)?.as_ptr(), addr as *mut _) };
            }
        }

        let arities = unit
            .functions()
            .filter(|f| !f.is_declaration())
            .map(|f| (f.name.clone(), f.arity()))
            .collect();

        unsafe {
            let context = core::LLVMContextCreate();
            let module = match build_module(context, &unit) {
                Ok(m) => m,
                Err(e) => {
                    core::LLVMContextDispose(context);
                    return Err(e);
                }
            };
            if self.optimize {
                optimize_module(module);
            }

            let mut options: LLVMMCJITCompilerOptions = mem::zeroed();
            let size = mem::size_of::<LLVMMCJITCompilerOptions>();
            execution_engine::LLVMInitializeMCJITCompilerOptions(&mut options, size);
            options.OptLevel = if self.optimize { 2 } else { 0 };
            let mut engine = ptr::null_mut();
            let mut msg = ptr::null_mut();
            if execution_engine::LLVMCreateMCJITCompilerForModule(
                &mut engine,
                module,
                &mut options,
                size,
                &mut msg,
            ) != 0
            {
                core::LLVMDisposeModule(module);
                core::LLVMContextDispose(context);
                return Err(llvm_error(take_message(msg)));
            }

            let tracker = ResourceTracker::new(self.next);
            self.next += 1;
            self.units.insert(
                tracker,
                Unit {
                    context,
                    engine,
                    arities,
                },
            );
            Ok(tracker)
        }
    }

    fn optimized_ir(&self, unit: &ir::Module, name: &str) -> Result<String, Error> {
        if unit.get_function(name).map_or(true, ir::Function::is_declaration) {
            return Err(unknown_symbol(name));
        }
        let cname = c_name(name)?;
        unsafe {
            let context = core::LLVMContextCreate();
            let text = build_module(context, unit).map(|module| {
                if self.optimize {
                    optimize_module(module);
                }
                let f = core::LLVMGetNamedFunction(module, cname.as_ptr());
                let text = take_message(core::LLVMPrintValueToString(f));
                core::LLVMDisposeModule(module);
                text
            });
            core::LLVMContextDispose(context);
            text
        }
    }

    fn lookup(&self, tracker: ResourceTracker, name: &str) -> Result<JitSymbol<'_>, Error> {
        let unit = self
            .units
            .get(&tracker)
            .ok_or_else(|| unknown_tracker(tracker))?;
        let arity = unit
            .arities
            .get(name)
            .cloned()
            .ok_or_else(|| unknown_symbol(name))?;
        let cname = c_name(name)?;
        let addr = unsafe { execution_engine::LLVMGetFunctionAddress(unit.engine, cname.as_ptr()) };
        if addr == 0 {
            return Err(unknown_symbol(name));
        }
        Ok(JitSymbol::new(addr as usize as *const u8, arity))
    }

    fn remove(&mut self, tracker: ResourceTracker) -> Result<(), Error> {
        let unit = self
            .units
            .remove(&tracker)
            .ok_or_else(|| unknown_tracker(tracker))?;
        unsafe { unit.dispose() };
        Ok(())
    }

    fn resident(&self) -> usize {
        self.units.len()
    }
}

impl Drop for McJit {
    fn drop(&mut self) {
        for (_, unit) in self.units.drain() {
            unsafe { unit.dispose() };
        }
    }
}
