use std::collections::HashMap;
use std::ffi::{CStr, CString};

use llvm_sys::orc2;
use llvm_sys::prelude::*;
use llvm_sys::transforms::instcombine;
use llvm_sys::transforms::scalar;
use llvm_sys::{analysis, core, LLVMRealPredicate};

use super::ast::{Expr, Function, Prototype};
use super::error::{Error, ErrorKind};
use super::parser::OperatorTable;

/// Lowering state for one compile cycle: a thread-safe context, the module
/// being filled, the builder, and the function pass manager all live until
/// `take_module` hands them to the JIT and starts the next cycle. The
/// prototype registry and nothing else survives across cycles, so later
/// modules can rematerialize declarations on demand.
pub(crate) struct Context {
    tsc: orc2::LLVMOrcThreadSafeContextRef,
    context: LLVMContextRef,
    module: LLVMModuleRef,
    builder: LLVMBuilderRef,
    fpm: LLVMPassManagerRef,
    double_type: LLVMTypeRef,
    data_layout: CString,
    named_values: HashMap<String, LLVMValueRef>,
    protos: HashMap<String, Prototype>,
}

impl Context {
    pub(crate) unsafe fn new(data_layout: &CStr) -> Context {
        let (tsc, context, module, builder, fpm, double_type) = Context::fresh_module(data_layout);
        Context {
            tsc,
            context,
            module,
            builder,
            fpm,
            double_type,
            data_layout: data_layout.to_owned(),
            named_values: HashMap::new(),
            protos: HashMap::new(),
        }
    }

    unsafe fn fresh_module(
        data_layout: &CStr,
    ) -> (
        orc2::LLVMOrcThreadSafeContextRef,
        LLVMContextRef,
        LLVMModuleRef,
        LLVMBuilderRef,
        LLVMPassManagerRef,
        LLVMTypeRef,
    ) {
        let tsc = orc2::LLVMOrcCreateNewThreadSafeContext();
        let context = orc2::LLVMOrcThreadSafeContextGetContext(tsc);
        let module =
            core::LLVMModuleCreateWithNameInContext(b"kscope\0".as_ptr() as *const _, context);
        core::LLVMSetDataLayout(module, data_layout.as_ptr());
        let builder = core::LLVMCreateBuilderInContext(context);

        let fpm = core::LLVMCreateFunctionPassManagerForModule(module);
        instcombine::LLVMAddInstructionCombiningPass(fpm);
        scalar::LLVMAddReassociatePass(fpm);
        scalar::LLVMAddGVNPass(fpm);
        scalar::LLVMAddCFGSimplificationPass(fpm);
        core::LLVMInitializeFunctionPassManager(fpm);

        let double_type = core::LLVMDoubleTypeInContext(context);
        (tsc, context, module, builder, fpm, double_type)
    }

    /// Hands the finished module off as a thread-safe module and starts a
    /// fresh one for subsequent items.
    pub(crate) unsafe fn take_module(&mut self) -> orc2::LLVMOrcThreadSafeModuleRef {
        core::LLVMDisposePassManager(self.fpm);
        core::LLVMDisposeBuilder(self.builder);
        let tsm = orc2::LLVMOrcCreateNewThreadSafeModule(self.module, self.tsc);
        orc2::LLVMOrcDisposeThreadSafeContext(self.tsc);

        let (tsc, context, module, builder, fpm, double_type) =
            Context::fresh_module(&self.data_layout);
        self.tsc = tsc;
        self.context = context;
        self.module = module;
        self.builder = builder;
        self.fpm = fpm;
        self.double_type = double_type;
        tsm
    }

    /// Module lookup first; otherwise re-emit the declaration from the
    /// prototype registry. Cross-module calls resolve through this.
    pub(crate) unsafe fn get_function(&self, name: &str) -> Option<LLVMValueRef> {
        let cname = CString::new(name).unwrap();
        let function = core::LLVMGetNamedFunction(self.module, cname.as_ptr());
        if !function.is_null() {
            return Some(function);
        }
        self.protos.get(name).map(|proto| self.codegen_proto(proto))
    }

    pub(crate) unsafe fn codegen_proto(&self, proto: &Prototype) -> LLVMValueRef {
        let mut doubles = vec![self.double_type; proto.args.len()];
        let fn_type = core::LLVMFunctionType(
            self.double_type,
            doubles.as_mut_ptr(),
            proto.args.len() as u32,
            0, /* not vararg */
        );
        let cname = CString::new(proto.name.as_str()).unwrap();
        let function = core::LLVMAddFunction(self.module, cname.as_ptr(), fn_type);
        for (i, arg) in proto.args.iter().enumerate() {
            let param = core::LLVMGetParam(function, i as u32);
            core::LLVMSetValueName2(param, arg.as_ptr() as *const _, arg.len());
        }
        function
    }

    /// `extern` handling: a known name must keep its arity; on success the
    /// declaration is re-emitted and the registry updated.
    pub(crate) unsafe fn codegen_extern(&mut self, proto: &Prototype) -> Result<LLVMValueRef, Error> {
        if let Some(existing) = self.protos.get(&proto.name) {
            if existing.args.len() != proto.args.len() {
                return Err(Error::from(ErrorKind::Codegen(format!(
                    "redefinition of function {} with different # args",
                    proto.name
                ))));
            }
        }
        let function = self.codegen_proto(proto);
        self.protos.insert(proto.name.clone(), proto.clone());
        Ok(function)
    }

    pub(crate) unsafe fn codegen_func(
        &mut self,
        ops: &mut OperatorTable,
        Function(proto, body): &Function,
    ) -> Result<LLVMValueRef, Error> {
        self.protos.insert(proto.name.clone(), (**proto).clone());
        let function = match self.get_function(&proto.name) {
            Some(f) => f,
            None => {
                return Err(Error::from(ErrorKind::Codegen(format!(
                    "unable to materialize function: {}",
                    proto.name
                ))))
            }
        };

        // Installed before the body so the operator can appear in it.
        if proto.is_binary_op() {
            ops.install(proto.operator_name(), proto.precedence as i32);
        }

        let bb =
            core::LLVMAppendBasicBlockInContext(self.context, function, b"entry\0".as_ptr() as *const _);
        core::LLVMPositionBuilderAtEnd(self.builder, bb);

        self.named_values.clear();
        for (i, arg) in proto.args.iter().enumerate() {
            let alloca = self.entry_block_alloca(function, arg);
            core::LLVMBuildStore(self.builder, core::LLVMGetParam(function, i as u32), alloca);
            self.named_values.insert(arg.clone(), alloca);
        }

        match self.codegen_expr(body) {
            Ok(ret) => {
                core::LLVMBuildRet(self.builder, ret);
                analysis::LLVMVerifyFunction(
                    function,
                    analysis::LLVMVerifierFailureAction::LLVMAbortProcessAction,
                );
                core::LLVMRunFunctionPassManager(self.fpm, function);
                Ok(function)
            }
            Err(e) => {
                core::LLVMDeleteFunction(function);
                if proto.is_binary_op() {
                    ops.remove(proto.operator_name());
                }
                Err(e)
            }
        }
    }

    unsafe fn codegen_expr(&mut self, e: &Expr) -> Result<LLVMValueRef, Error> {
        match e {
            Expr::Number(n) => Ok(core::LLVMConstReal(self.double_type, *n)),
            Expr::Variable(name) => match self.named_values.get(name) {
                Some(cell) => {
                    let cell = *cell;
                    let cname = CString::new(name.as_str()).unwrap();
                    Ok(core::LLVMBuildLoad2(
                        self.builder,
                        self.double_type,
                        cell,
                        cname.as_ptr(),
                    ))
                }
                None => Err(Error::from(ErrorKind::Codegen(format!(
                    "unknown variable name: {}",
                    name
                )))),
            },
            Expr::Unary(op, operand) => {
                let operand = self.codegen_expr(operand)?;
                let callee = match self.get_function(&format!("unary{}", op)) {
                    Some(f) => f,
                    None => {
                        return Err(Error::from(ErrorKind::Codegen(format!(
                            "unknown unary operator: {}",
                            op
                        ))))
                    }
                };
                let mut args = [operand];
                Ok(self.build_call(callee, &mut args, b"unop\0".as_ptr() as *const _))
            }
            Expr::Binary('=', lhs, rhs) => {
                let name = match lhs.as_ref() {
                    Expr::Variable(name) => name,
                    _ => {
                        return Err(Error::from(ErrorKind::Codegen(
                            "destination of '=' must be a variable".to_owned(),
                        )))
                    }
                };
                let val = self.codegen_expr(rhs)?;
                let cell = match self.named_values.get(name) {
                    Some(cell) => *cell,
                    None => {
                        return Err(Error::from(ErrorKind::Codegen(format!(
                            "unknown variable name: {}",
                            name
                        ))))
                    }
                };
                core::LLVMBuildStore(self.builder, val, cell);
                Ok(val)
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs_val = self.codegen_expr(lhs)?;
                let rhs_val = self.codegen_expr(rhs)?;
                match op {
                    '+' => Ok(core::LLVMBuildFAdd(
                        self.builder,
                        lhs_val,
                        rhs_val,
                        b"addtmp\0".as_ptr() as *const _,
                    )),
                    '-' => Ok(core::LLVMBuildFSub(
                        self.builder,
                        lhs_val,
                        rhs_val,
                        b"subtmp\0".as_ptr() as *const _,
                    )),
                    '*' => Ok(core::LLVMBuildFMul(
                        self.builder,
                        lhs_val,
                        rhs_val,
                        b"multmp\0".as_ptr() as *const _,
                    )),
                    '<' => {
                        let cmp = core::LLVMBuildFCmp(
                            self.builder,
                            LLVMRealPredicate::LLVMRealULT,
                            lhs_val,
                            rhs_val,
                            b"cmptmp\0".as_ptr() as *const _,
                        );
                        Ok(core::LLVMBuildUIToFP(
                            self.builder,
                            cmp,
                            self.double_type,
                            b"booltmp\0".as_ptr() as *const _,
                        ))
                    }
                    op => {
                        let callee = match self.get_function(&format!("binary{}", op)) {
                            Some(f) => f,
                            None => {
                                return Err(Error::from(ErrorKind::Codegen(format!(
                                    "unknown binary operator: {}",
                                    op
                                ))))
                            }
                        };
                        let mut args = [lhs_val, rhs_val];
                        Ok(self.build_call(callee, &mut args, b"binop\0".as_ptr() as *const _))
                    }
                }
            }
            Expr::Call(callee, args) => {
                let function = match self.get_function(callee) {
                    Some(f) => f,
                    None => {
                        return Err(Error::from(ErrorKind::Codegen(format!(
                            "unknown function referenced: {}",
                            callee
                        ))))
                    }
                };
                if core::LLVMCountParams(function) as usize != args.len() {
                    return Err(Error::from(ErrorKind::Codegen(
                        "incorrect # arguments passed".to_owned(),
                    )));
                }
                let mut arg_vals = args
                    .iter()
                    .map(|arg| self.codegen_expr(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.build_call(function, &mut arg_vals, b"calltmp\0".as_ptr() as *const _))
            }
            Expr::If(cond, then, els) => {
                let cond_val = self.codegen_expr(cond)?;
                let zero = core::LLVMConstReal(self.double_type, 0.0);
                let cond_val = core::LLVMBuildFCmp(
                    self.builder,
                    LLVMRealPredicate::LLVMRealONE,
                    cond_val,
                    zero,
                    b"ifcond\0".as_ptr() as *const _,
                );

                let function = core::LLVMGetBasicBlockParent(core::LLVMGetInsertBlock(self.builder));
                let then_bb = core::LLVMAppendBasicBlockInContext(
                    self.context,
                    function,
                    b"then\0".as_ptr() as *const _,
                );
                let else_bb =
                    core::LLVMCreateBasicBlockInContext(self.context, b"else\0".as_ptr() as *const _);
                let merge_bb =
                    core::LLVMCreateBasicBlockInContext(self.context, b"ifcont\0".as_ptr() as *const _);
                core::LLVMBuildCondBr(self.builder, cond_val, then_bb, else_bb);

                core::LLVMPositionBuilderAtEnd(self.builder, then_bb);
                let then_val = self.codegen_expr(then)?;
                core::LLVMBuildBr(self.builder, merge_bb);
                // nested control flow moves the builder; the PHI wants the
                // block each branch ended in
                let then_end = core::LLVMGetInsertBlock(self.builder);

                core::LLVMAppendExistingBasicBlock(function, else_bb);
                core::LLVMPositionBuilderAtEnd(self.builder, else_bb);
                let else_val = self.codegen_expr(els)?;
                core::LLVMBuildBr(self.builder, merge_bb);
                let else_end = core::LLVMGetInsertBlock(self.builder);

                core::LLVMAppendExistingBasicBlock(function, merge_bb);
                core::LLVMPositionBuilderAtEnd(self.builder, merge_bb);
                let phi = core::LLVMBuildPhi(
                    self.builder,
                    self.double_type,
                    b"iftmp\0".as_ptr() as *const _,
                );
                let mut incoming_vals = [then_val, else_val];
                let mut incoming_blocks = [then_end, else_end];
                core::LLVMAddIncoming(
                    phi,
                    incoming_vals.as_mut_ptr(),
                    incoming_blocks.as_mut_ptr(),
                    2,
                );
                Ok(phi)
            }
            Expr::For(name, start, end, step, body) => {
                let function = core::LLVMGetBasicBlockParent(core::LLVMGetInsertBlock(self.builder));
                let alloca = self.entry_block_alloca(function, name);

                let start_val = self.codegen_expr(start)?;
                core::LLVMBuildStore(self.builder, start_val, alloca);

                let loop_bb = core::LLVMAppendBasicBlockInContext(
                    self.context,
                    function,
                    b"loop\0".as_ptr() as *const _,
                );
                core::LLVMBuildBr(self.builder, loop_bb);
                core::LLVMPositionBuilderAtEnd(self.builder, loop_bb);

                let shadowed = self.named_values.insert(name.clone(), alloca);
                let looped = self.codegen_loop(function, loop_bb, alloca, name, end, &**step, body);
                match shadowed {
                    Some(old) => self.named_values.insert(name.clone(), old),
                    None => self.named_values.remove(name),
                };
                looped?;

                // a for expression always evaluates to 0.0
                Ok(core::LLVMConstNull(self.double_type))
            }
            Expr::Var(vars, body) => {
                let function = core::LLVMGetBasicBlockParent(core::LLVMGetInsertBlock(self.builder));
                let mut old_bindings = Vec::with_capacity(vars.len());
                let mut failed = None;
                for (name, init) in vars {
                    let init_val = match init {
                        Some(init) => match self.codegen_expr(init) {
                            Ok(v) => v,
                            Err(e) => {
                                failed = Some(e);
                                break;
                            }
                        },
                        None => core::LLVMConstReal(self.double_type, 0.0),
                    };
                    let alloca = self.entry_block_alloca(function, name);
                    core::LLVMBuildStore(self.builder, init_val, alloca);
                    old_bindings.push((name.clone(), self.named_values.insert(name.clone(), alloca)));
                }

                let result = match failed {
                    Some(e) => Err(e),
                    None => self.codegen_expr(body),
                };
                for (name, old) in old_bindings.into_iter().rev() {
                    match old {
                        Some(v) => self.named_values.insert(name, v),
                        None => self.named_values.remove(&name),
                    };
                }
                result
            }
        }
    }

    /// Body, step, end condition, and the back edge of a `for`. The caller
    /// restores the loop-variable binding whether or not this succeeds.
    unsafe fn codegen_loop(
        &mut self,
        function: LLVMValueRef,
        loop_bb: LLVMBasicBlockRef,
        alloca: LLVMValueRef,
        name: &str,
        end: &Expr,
        step: &Option<Expr>,
        body: &Expr,
    ) -> Result<(), Error> {
        // the body's value is discarded
        self.codegen_expr(body)?;

        let step_val = match step {
            Some(step) => self.codegen_expr(step)?,
            None => core::LLVMConstReal(self.double_type, 1.0),
        };
        // end condition sees the value of this iteration, not the next
        let end_cond = self.codegen_expr(end)?;

        let cname = CString::new(name).unwrap();
        let cur = core::LLVMBuildLoad2(self.builder, self.double_type, alloca, cname.as_ptr());
        let next = core::LLVMBuildFAdd(
            self.builder,
            cur,
            step_val,
            b"nextvar\0".as_ptr() as *const _,
        );
        core::LLVMBuildStore(self.builder, next, alloca);

        let zero = core::LLVMConstReal(self.double_type, 0.0);
        let end_cond = core::LLVMBuildFCmp(
            self.builder,
            LLVMRealPredicate::LLVMRealONE,
            end_cond,
            zero,
            b"loopcond\0".as_ptr() as *const _,
        );

        let after_bb = core::LLVMAppendBasicBlockInContext(
            self.context,
            function,
            b"afterloop\0".as_ptr() as *const _,
        );
        core::LLVMBuildCondBr(self.builder, end_cond, loop_bb, after_bb);
        core::LLVMPositionBuilderAtEnd(self.builder, after_bb);
        Ok(())
    }

    unsafe fn build_call(
        &self,
        callee: LLVMValueRef,
        args: &mut [LLVMValueRef],
        name: *const libc::c_char,
    ) -> LLVMValueRef {
        let fn_type = core::LLVMGlobalGetValueType(callee);
        core::LLVMBuildCall2(
            self.builder,
            fn_type,
            callee,
            args.as_mut_ptr(),
            args.len() as u32,
            name,
        )
    }

    /// Stack cells live in the entry block so mem2reg-style optimization
    /// sees them all in one place.
    unsafe fn entry_block_alloca(&self, function: LLVMValueRef, name: &str) -> LLVMValueRef {
        let tmp = core::LLVMCreateBuilderInContext(self.context);
        let entry = core::LLVMGetEntryBasicBlock(function);
        let first = core::LLVMGetFirstInstruction(entry);
        if first.is_null() {
            core::LLVMPositionBuilderAtEnd(tmp, entry);
        } else {
            core::LLVMPositionBuilderBefore(tmp, first);
        }
        let cname = CString::new(name).unwrap();
        let alloca = core::LLVMBuildAlloca(tmp, self.double_type, cname.as_ptr());
        core::LLVMDisposeBuilder(tmp);
        alloca
    }

    #[cfg(test)]
    pub(crate) fn proto_arity(&self, name: &str) -> Option<usize> {
        self.protos.get(name).map(|proto| proto.args.len())
    }
}

pub(crate) unsafe fn print_to_string(value: LLVMValueRef) -> String {
    let ir = core::LLVMPrintValueToString(value);
    let s = CStr::from_ptr(ir).to_string_lossy().into_owned();
    core::LLVMDisposeMessage(ir);
    s
}

#[cfg(test)]
mod test {
    use super::super::ast::Expr::*;
    use super::super::parser::ANON_EXPR;
    use super::*;

    unsafe fn context() -> Context {
        let data_layout = CString::new("").unwrap();
        Context::new(&data_layout)
    }

    fn anon(body: Expr) -> Function {
        Function(
            Box::new(Prototype::new(ANON_EXPR.to_owned(), Vec::new())),
            Box::new(body),
        )
    }

    #[test]
    fn test_constant_fold() {
        unsafe {
            let mut ctx = context();
            let mut ops = OperatorTable::new();
            let body = Binary('+', Box::new(Number(4.0)), Box::new(Number(5.0)));
            let function = ctx.codegen_func(&mut ops, &anon(body)).unwrap();
            let ir = print_to_string(function);
            assert!(ir.contains("9.000000e+00"), "{}", ir);
        }
    }

    #[test]
    fn test_unknown_variable() {
        unsafe {
            let mut ctx = context();
            let mut ops = OperatorTable::new();
            let err = ctx
                .codegen_func(&mut ops, &anon(Variable("x".to_owned())))
                .unwrap_err();
            assert!(format!("{}", err).contains("unknown variable name"));
        }
    }

    #[test]
    fn test_assignment_target() {
        unsafe {
            let mut ctx = context();
            let mut ops = OperatorTable::new();
            let body = Binary('=', Box::new(Number(1.0)), Box::new(Number(2.0)));
            let err = ctx.codegen_func(&mut ops, &anon(body)).unwrap_err();
            assert!(format!("{}", err).contains("must be a variable"));
        }
    }

    #[test]
    fn test_call_arity() {
        unsafe {
            let mut ctx = context();
            let mut ops = OperatorTable::new();
            ctx.codegen_extern(&Prototype::new("sin".to_owned(), vec!["x".to_owned()]))
                .unwrap();
            let err = ctx
                .codegen_func(&mut ops, &anon(Call("sin".to_owned(), vec![])))
                .unwrap_err();
            assert!(format!("{}", err).contains("incorrect # arguments"));
        }
    }

    #[test]
    fn test_extern_arity_conflict() {
        unsafe {
            let mut ctx = context();
            ctx.codegen_extern(&Prototype::new("cos".to_owned(), vec!["x".to_owned()]))
                .unwrap();
            // matching redeclaration is fine
            ctx.codegen_extern(&Prototype::new("cos".to_owned(), vec!["y".to_owned()]))
                .unwrap();
            let err = ctx
                .codegen_extern(&Prototype::new(
                    "cos".to_owned(),
                    vec!["a".to_owned(), "b".to_owned()],
                ))
                .unwrap_err();
            assert!(format!("{}", err).contains("different # args"));
            assert_eq!(ctx.proto_arity("cos"), Some(1));
        }
    }

    #[test]
    fn test_operator_install_and_rollback() {
        unsafe {
            let mut ctx = context();
            let mut ops = OperatorTable::new();

            let good = Function(
                Box::new(Prototype {
                    name: "binary&".to_owned(),
                    args: vec!["a".to_owned(), "b".to_owned()],
                    is_operator: true,
                    precedence: 50,
                }),
                Box::new(Variable("a".to_owned())),
            );
            ctx.codegen_func(&mut ops, &good).unwrap();
            assert_eq!(ops.precedence('&'), Some(50));

            let bad = Function(
                Box::new(Prototype {
                    name: "binary^".to_owned(),
                    args: vec!["a".to_owned(), "b".to_owned()],
                    is_operator: true,
                    precedence: 40,
                }),
                Box::new(Variable("nosuchvar".to_owned())),
            );
            assert!(ctx.codegen_func(&mut ops, &bad).is_err());
            assert_eq!(ops.precedence('^'), None);
        }
    }

    #[test]
    fn test_if_lowering() {
        unsafe {
            let mut ctx = context();
            let mut ops = OperatorTable::new();
            let body = If(
                Box::new(Number(1.0)),
                Box::new(Number(2.0)),
                Box::new(Number(3.0)),
            );
            let function = ctx.codegen_func(&mut ops, &anon(body)).unwrap();
            // simplify-cfg folds the constant branch away
            let ir = print_to_string(function);
            assert!(ir.contains("2.000000e+00"), "{}", ir);
        }
    }
}
