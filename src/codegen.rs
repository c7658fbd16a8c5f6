use super::ast::{self, Expr, Prototype};
use super::error::CodegenError;
use super::ir::{
    verify_function, BinOp, CmpOp, Function, FunctionBuilder, IrType, Module, Value,
};
use std::collections::HashMap;

/// Lowers AST functions into a unit. Holds the symbol table of the function
/// currently being generated.
pub(crate) struct CodeGen {
    named_values: HashMap<String, Value>,
}

impl CodeGen {
    pub(crate) fn new() -> Self {
        CodeGen {
            named_values: HashMap::new(),
        }
    }

    /// Declares `proto` in `module`, or returns the existing declaration when
    /// one of the same arity is already there.
    pub(crate) fn codegen_proto<'m>(
        &mut self,
        module: &'m mut Module,
        proto: &Prototype,
    ) -> Result<&'m Function, CodegenError> {
        match module.get_function(&proto.name).map(Function::arity) {
            Some(declared) if declared != proto.params.len() => {
                return Err(CodegenError::ConflictingDeclaration {
                    name: proto.name.clone(),
                    declared,
                    given: proto.params.len(),
                })
            }
            Some(_) => {}
            None => {
                module.add_function(Function::declare(proto.name.clone(), proto.params.clone()));
            }
        }
        module
            .get_function(&proto.name)
            .ok_or_else(|| CodegenError::UnknownFunction(proto.name.clone()))
    }

    /// Generates the body of `func`. On failure the unit is left as it was
    /// before the call, except that a declaration created here is dropped.
    pub(crate) fn codegen_func<'m>(
        &mut self,
        module: &'m mut Module,
        func: &ast::Function,
    ) -> Result<&'m Function, CodegenError> {
        let name = &func.proto.name;
        let existed = match module.get_function(name) {
            Some(f) if !f.is_declaration() => {
                return Err(CodegenError::Redefinition(name.clone()));
            }
            Some(_) => true,
            None => false,
        };
        self.codegen_proto(module, &func.proto)?;

        match self.codegen_body(module, func) {
            Ok(body) => Ok(&*module.add_function(body)),
            Err(e) => {
                if !existed {
                    module.remove_function(name);
                }
                Err(e)
            }
        }
    }

    fn codegen_body(
        &mut self,
        module: &Module,
        func: &ast::Function,
    ) -> Result<Function, CodegenError> {
        let mut function = Function::declare(func.proto.name.clone(), func.proto.params.clone());

        self.named_values.clear();
        for (i, param) in func.proto.params.iter().enumerate() {
            self.named_values.insert(param.clone(), function.param(i));
        }

        {
            let mut builder = FunctionBuilder::new(&mut function);
            let ret_val = self.codegen_expr(module, &mut builder, &func.body)?;
            builder.ret(ret_val);
        }
        verify_function(module, &function)?;
        Ok(function)
    }

    fn codegen_expr(
        &self,
        module: &Module,
        builder: &mut FunctionBuilder<'_>,
        e: &Expr,
    ) -> Result<Value, CodegenError> {
        match e {
            Expr::Number(n) => Ok(Value::Double(*n)),
            Expr::Variable(name) => self
                .named_values
                .get(name)
                .cloned()
                .ok_or_else(|| CodegenError::UnknownVariable(name.clone())),
            Expr::Binary(op, lhs, rhs) => {
                let lhs_val = self.codegen_expr(module, builder, lhs)?;
                let rhs_val = self.codegen_expr(module, builder, rhs)?;
                match op {
                    '+' => Ok(builder.binary(BinOp::FAdd, lhs_val, rhs_val, "addtmp")),
                    '-' => Ok(builder.binary(BinOp::FSub, lhs_val, rhs_val, "subtmp")),
                    '*' => Ok(builder.binary(BinOp::FMul, lhs_val, rhs_val, "multmp")),
                    '/' => Ok(builder.binary(BinOp::FDiv, lhs_val, rhs_val, "divtmp")),
                    _ => Err(CodegenError::InvalidOperator(*op)),
                }
            }
            Expr::Call(callee, args) => {
                let expected = module
                    .get_function(callee)
                    .map(Function::arity)
                    .ok_or_else(|| CodegenError::UnknownFunction(callee.clone()))?;
                if expected != args.len() {
                    return Err(CodegenError::ArgumentCount {
                        callee: callee.clone(),
                        expected,
                        got: args.len(),
                    });
                }
                let mut args_v = Vec::with_capacity(args.len());
                for arg in args {
                    args_v.push(self.codegen_expr(module, builder, arg)?);
                }
                Ok(builder.call(callee, args_v, "calltmp"))
            }
            Expr::If(cond, then, els) => {
                let cond_v = self.codegen_expr(module, builder, cond)?;
                let cond_v = builder.fcmp(CmpOp::One, cond_v, Value::Double(0.0), "ifcond");

                let then_bb = builder.create_block("then");
                let else_bb = builder.create_block("else");
                let merge_bb = builder.create_block("ifcont");
                builder.cond_br(cond_v, then_bb, else_bb);

                builder.switch_to_block(then_bb);
                let then_v = self.codegen_expr(module, builder, then)?;
                builder.br(merge_bb);
                // nested ifs move the insertion point
                let then_end = builder.current_block();

                builder.switch_to_block(else_bb);
                let else_v = self.codegen_expr(module, builder, els)?;
                builder.br(merge_bb);
                let else_end = builder.current_block();

                builder.switch_to_block(merge_bb);
                Ok(builder.phi(
                    IrType::Double,
                    vec![(then_v, then_end), (else_v, else_end)],
                    "iftmp",
                ))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;
    use crate::lexer::tokenize;
    use crate::parser::{parse_definition, parse_extern, parse_top_level_expr};

    fn def(src: &str) -> ast::Function {
        let tokens = tokenize(src).expect("lexes");
        parse_definition(&tokens).expect("parses").0
    }

    fn ext(src: &str) -> Prototype {
        let tokens = tokenize(src).expect("lexes");
        parse_extern(&tokens).expect("parses").0
    }

    fn top(src: &str) -> ast::Function {
        let tokens = tokenize(src).expect("lexes");
        parse_top_level_expr(&tokens).expect("parses").0
    }

    #[test]
    fn test_codegen_add() {
        let mut m = Module::new("my cool jit");
        let mut cg = CodeGen::new();
        let f = cg.codegen_func(&mut m, &def("def add(a b) a+b")).expect("codegen");
        assert_eq!(
            f.to_string(),
            "define double @add(double %a, double %b) {\n\
             entry:\n  %addtmp = fadd double %a, %b\n  ret double %addtmp\n}\n"
        );
    }

    #[test]
    fn test_codegen_compare() {
        // `<` parses, but only the four arithmetic operators lower
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        let err = cg.codegen_func(&mut m, &def("def lt(a b) a < b")).err();
        assert_eq!(err, Some(CodegenError::InvalidOperator('<')));
        assert!(m.is_empty());
        let err = cg.codegen_func(&mut m, &top("if 1 < 2 then 1 else 0")).err();
        assert_eq!(err, Some(CodegenError::InvalidOperator('<')));
        assert!(m.is_empty());
    }

    #[test]
    fn test_codegen_if() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        let text = cg
            .codegen_func(&mut m, &def("def f(x) if x then x*2 else x/2"))
            .expect("codegen")
            .to_string();
        assert_eq!(
            text,
            "define double @f(double %x) {\n\
             entry:\n  \
             %ifcond = fcmp one double %x, 0.000000e+00\n  \
             br i1 %ifcond, label %then, label %else\n\
             \n\
             then:\n  \
             %multmp = fmul double %x, 2.000000e+00\n  \
             br label %ifcont\n\
             \n\
             else:\n  \
             %divtmp = fdiv double %x, 2.000000e+00\n  \
             br label %ifcont\n\
             \n\
             ifcont:\n  \
             %iftmp = phi double [ %multmp, %then ], [ %divtmp, %else ]\n  \
             ret double %iftmp\n\
             }\n"
        );
    }

    #[test]
    fn test_nested_if_joins_from_inner_block() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        let text = cg
            .codegen_func(&mut m, &def("def f(x) if x then (if x-1 then 1 else 2) else 3"))
            .expect("codegen")
            .to_string();
        assert!(text.contains("%iftmp1 = phi double [ %iftmp, %ifcont1 ], [ 3.000000e+00, %else ]"));
    }

    #[test]
    fn test_call_arity() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        cg.codegen_proto(&mut m, &ext("extern sin(x)")).expect("declare");

        let err = cg.codegen_func(&mut m, &top("sin(1, 2)")).err();
        assert_eq!(
            err,
            Some(CodegenError::ArgumentCount {
                callee: "sin".to_owned(),
                expected: 1,
                got: 2,
            })
        );
        assert!(m.get_function(crate::parser::ANON_EXPR).is_none());

        let f = cg.codegen_func(&mut m, &top("sin(1)")).expect("codegen");
        assert!(f.to_string().contains("call double @sin(double 1.000000e+00)"));
    }

    #[test]
    fn test_unknown_names_leave_nothing_behind() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        let err = cg.codegen_func(&mut m, &def("def f(x) y")).err();
        assert_eq!(err, Some(CodegenError::UnknownVariable("y".to_owned())));
        assert!(m.get_function("f").is_none());

        let err = cg.codegen_func(&mut m, &def("def g(x) h(x)")).err();
        assert_eq!(err, Some(CodegenError::UnknownFunction("h".to_owned())));
        assert!(m.is_empty());
    }

    #[test]
    fn test_invalid_operator() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        let f = ast::Function::new(
            Prototype::new("f", vec![]),
            Expr::Binary('%', Box::new(Expr::Number(1.0)), Box::new(Expr::Number(2.0))),
        );
        assert_eq!(
            cg.codegen_func(&mut m, &f).err(),
            Some(CodegenError::InvalidOperator('%'))
        );
        assert!(m.is_empty());
    }

    #[test]
    fn test_redefinition() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        cg.codegen_func(&mut m, &def("def f(x) x")).expect("codegen");
        let err = cg.codegen_func(&mut m, &def("def f(x) x+1")).err();
        assert_eq!(err, Some(CodegenError::Redefinition("f".to_owned())));
        assert_eq!(
            crate::error::Error::from(CodegenError::Redefinition("f".to_owned())).kind(),
            &ErrorKind::Codegen(CodegenError::Redefinition("f".to_owned()))
        );
    }

    #[test]
    fn test_extern_then_define() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        cg.codegen_proto(&mut m, &ext("extern f(a)")).expect("declare");
        assert!(m.get_function("f").map_or(false, Function::is_declaration));

        // a failed body keeps the extern
        assert!(cg.codegen_func(&mut m, &def("def f(x) nope")).is_err());
        assert!(m.get_function("f").map_or(false, Function::is_declaration));

        let f = cg.codegen_func(&mut m, &def("def f(x) x*x")).expect("codegen");
        assert!(f.to_string().starts_with("define double @f(double %x)"));
        assert!(cg.codegen_func(&mut m, &def("def f(x) x")).is_err());
    }

    #[test]
    fn test_conflicting_declaration() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        cg.codegen_proto(&mut m, &ext("extern f(a b)")).expect("declare");
        assert_eq!(
            cg.codegen_func(&mut m, &def("def f(x) x")).err(),
            Some(CodegenError::ConflictingDeclaration {
                name: "f".to_owned(),
                declared: 2,
                given: 1,
            })
        );
        assert!(m.get_function("f").is_some());
    }

    #[test]
    fn test_recursion() {
        let mut m = Module::new("test");
        let mut cg = CodeGen::new();
        let f = cg
            .codegen_func(&mut m, &def("def fact(n) if n then n*fact(n-1) else 1"))
            .expect("codegen");
        assert!(f.to_string().contains("%calltmp = call double @fact(double %subtmp)"));
    }

    #[test]
    fn test_regenerate_is_stable() {
        let sources = ["def sq(x) x*x", "def quad(x) sq(sq(x))"];
        let build = || {
            let mut m = Module::new("my cool jit");
            let mut cg = CodeGen::new();
            cg.codegen_proto(&mut m, &ext("extern sin(x)")).expect("declare");
            for src in &sources {
                cg.codegen_func(&mut m, &def(src)).expect("codegen");
            }
            m
        };
        let (a, b) = (build(), build());
        assert_eq!(a.to_string(), b.to_string());
        let sigs = |m: &Module| m.functions().map(Function::signature).collect::<Vec<_>>();
        assert_eq!(sigs(&a), sigs(&b));
    }
}
