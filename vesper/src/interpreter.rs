use std::sync::Arc;

use crate::{
    Block, CompiledMethodBody, DynamicScope, Frame, Instr, InterpretedMethod, Label, MathOp,
    Operand, Runtime, RuntimeError, TempCounts, TempKind, Value, Variable,
    define::define_class,
    error::Unwind,
    method::{Activation, dispatch},
};

/// Typed temporary slots, sized once per activation.
struct Temps {
    generic: Vec<Value>,
    boolean: Vec<bool>,
    fixnum: Vec<i64>,
    float: Vec<f64>,
}

impl Temps {
    fn new(counts: TempCounts) -> Self {
        Self {
            generic: vec![Value::Nil; counts.generic],
            boolean: vec![false; counts.boolean],
            fixnum: vec![0; counts.fixnum],
            float: vec![0.0; counts.float],
        }
    }
}

struct Interpreter<'a, 'ctx> {
    activation: &'a mut Activation<'ctx>,
    body: &'a Arc<CompiledMethodBody>,
    self_value: Value,
    args: &'a [Value],
    temps: Temps,
}

/// Runs `body` to completion inside an already entered activation.
pub(crate) fn interpret(
    activation: &mut Activation<'_>,
    body: &Arc<CompiledMethodBody>,
    args: &[Value],
) -> Result<Value, Unwind> {
    let self_value = activation
        .context_ref()
        .current_frame()
        .map(|frame| frame.self_value.clone())
        .ok_or_else(no_frame)?;
    Interpreter {
        activation,
        body,
        self_value,
        args,
        temps: Temps::new(body.temps()),
    }
    .run()
}

fn no_frame() -> RuntimeError {
    RuntimeError::Internal("interpreting without a frame".to_owned())
}

impl Interpreter<'_, '_> {
    fn run(&mut self) -> Result<Value, Unwind> {
        let body = self.body;
        let instructions = body.instructions();
        let mut pc = 0;
        while let Some(instr) = instructions.get(pc) {
            log::trace!("{}:{pc} {instr}", body.name());
            pc += 1;
            match instr {
                Instr::Copy { result, source } => {
                    let value = self.retrieve(source)?;
                    self.store(result, value)?;
                }
                Instr::ReceiveArg { result, index } => {
                    let value = self.args.get(*index as usize).cloned().unwrap_or(Value::Nil);
                    self.store(result, value)?;
                }
                Instr::ReceiveBlock { result } => {
                    let value = self.frame()?.block.clone().map_or(Value::Nil, Value::Block);
                    self.store(result, value)?;
                }
                Instr::IntMath {
                    result,
                    op,
                    lhs,
                    rhs,
                } => {
                    let value = self.int_math(*op, lhs, rhs)?;
                    self.store(result, value)?;
                }
                Instr::FloatMath {
                    result,
                    op,
                    lhs,
                    rhs,
                } => {
                    let value = self.float_math(*op, lhs, rhs)?;
                    self.store(result, value)?;
                }
                Instr::Label { .. } => {}
                Instr::Jump { target } => pc = self.jump(*target)?,
                Instr::BranchFalse { condition, target } => {
                    if !self.retrieve(condition)?.is_truthy() {
                        pc = self.jump(*target)?;
                    }
                }
                Instr::Call {
                    result,
                    name,
                    receiver,
                    args,
                    block,
                    call_type,
                } => {
                    let receiver = self.retrieve(receiver)?;
                    let args = self.retrieve_all(args)?;
                    let block = match block {
                        Some(block) => self.block_arg(block)?,
                        None => None,
                    };
                    let ctx = self.activation.context();
                    let value = dispatch(ctx, receiver, name, &args, block, *call_type)?;
                    self.store(result, value)?;
                }
                Instr::DefineMethod { name, body } => self.define_method(name, body)?,
                Instr::DefineClass {
                    result,
                    body,
                    container,
                    superclass,
                } => {
                    let container = self.retrieve(container)?;
                    let runtime = self.runtime();
                    let method = define_class(&*runtime, body, &container, || match superclass {
                        Operand::Undefined => Ok(None),
                        operand => self.retrieve(operand).map(Some),
                    })?;
                    self.store(result, Value::Method(method))?;
                }
                Instr::ProcessModuleBody { result, method } => {
                    let value = self.retrieve(method)?;
                    let method = value.as_method().cloned().ok_or_else(|| {
                        RuntimeError::type_error(format!("{value} is not a module body"))
                    })?;
                    let receiver = Value::Module(method.module().clone());
                    let ctx = self.activation.context();
                    let value = method.invoke(ctx, receiver, method.body().name(), &[], None)?;
                    self.store(result, value)?;
                }
                Instr::SetVisibility { visibility } => {
                    self.activation
                        .context()
                        .current_frame_mut()
                        .ok_or_else(no_frame)?
                        .visibility = *visibility;
                }
                Instr::PutConst {
                    container,
                    name,
                    value,
                } => {
                    let container = self.retrieve(container)?;
                    let module = container.as_module().ok_or_else(|| {
                        RuntimeError::type_error(format!("{container} is not a class/module"))
                    })?;
                    module.set_constant(name, self.retrieve(value)?);
                }
                Instr::SearchConst { result, name } => {
                    let runtime = self.runtime();
                    let module = self.frame()?.module.clone();
                    let value = runtime.search_const(self.body.static_scope(), &module, name)?;
                    self.store(result, value)?;
                }
                Instr::BuildClosure { result, body } => {
                    let frame = self.frame()?;
                    let (module, visibility) = (frame.module.clone(), frame.visibility);
                    let scope = self.activation.closure_scope(self.body);
                    let block = Block::new(
                        body.clone(),
                        self.self_value.clone(),
                        scope,
                        module,
                        visibility,
                    );
                    self.store(result, Value::Block(block))?;
                }
                Instr::Yield {
                    result,
                    block,
                    args,
                } => {
                    let block = match self.retrieve(block)? {
                        Value::Block(block) => block,
                        Value::Nil => {
                            return Err(RuntimeError::LocalJump("no block given (yield)").into());
                        }
                        other => return Err(self.not_a_block(&other).into()),
                    };
                    let args = self.retrieve_all(args)?;
                    let value = block.invoke(self.activation.context(), &args)?;
                    self.store(result, value)?;
                }
                Instr::Return { value } => return Ok(self.retrieve(value)?),
                Instr::NonLocalReturn { value } => {
                    let value = self.retrieve(value)?;
                    if self.body.kind().is_return_target() {
                        return Ok(value);
                    }
                    let target = self
                        .current_scope()
                        .and_then(|scope| scope.return_target())
                        .map(DynamicScope::id);
                    return match target {
                        Some(target) => Err(Unwind::Return { target, value }),
                        None => Err(RuntimeError::LocalJump("unexpected return").into()),
                    };
                }
                Instr::Raise { value } => {
                    return Err(RuntimeError::Raised(self.retrieve(value)?).into());
                }
            }
        }
        Ok(Value::Nil)
    }

    fn runtime(&self) -> Arc<Runtime> {
        self.activation.context_ref().runtime().clone()
    }

    fn frame(&self) -> Result<&Frame, RuntimeError> {
        self.activation
            .context_ref()
            .current_frame()
            .ok_or_else(no_frame)
    }

    /// The innermost live scope: our own, or the parent's when ours was
    /// eliminated or reused.
    fn current_scope(&self) -> Option<&Arc<DynamicScope>> {
        self.activation.scope().or(self.activation.parent())
    }

    /// Static depths count from this body's own scope. A body running in its
    /// parent's scope resolves them one level up.
    fn local_scope(&self, depth: u32) -> Result<(&Arc<DynamicScope>, u32), RuntimeError> {
        let activation = &*self.activation;
        match (activation.owns_scope(), activation.scope(), activation.parent()) {
            (true, Some(scope), _) => Ok((scope, depth)),
            (false, _, Some(parent)) if depth > 0 => Ok((parent, depth - 1)),
            _ => Err(RuntimeError::Internal(format!(
                "{} has no scope for locals at depth {depth}",
                self.body.name()
            ))),
        }
    }

    fn jump(&self, target: Label) -> Result<usize, RuntimeError> {
        self.body
            .label_index(target)
            .ok_or_else(|| RuntimeError::Internal(format!("jump to undefined label {target}")))
    }

    fn retrieve(&self, operand: &Operand) -> Result<Value, RuntimeError> {
        Ok(match operand {
            Operand::Var(var) => return self.load(var),
            Operand::SelfValue => self.self_value.clone(),
            Operand::Nil => Value::Nil,
            Operand::Bool(value) => Value::Bool(*value),
            Operand::Fixnum(value) => Value::Fixnum(*value),
            Operand::Float(value) => Value::Float(*value),
            Operand::Str(value) => Value::Str(value.clone()),
            Operand::Symbol(value) => Value::Symbol(value.clone()),
            Operand::Array(elements) => Value::Array(self.retrieve_all(elements)?.into()),
            Operand::ScopeModule => match self.body.static_scope().lexical_module() {
                Some(module) => Value::Module(module),
                None => Value::Module(self.frame()?.module.clone()),
            },
            Operand::Undefined => {
                return Err(RuntimeError::Internal("read of an undefined operand".to_owned()));
            }
            Operand::Body(body) => {
                return Err(RuntimeError::Internal(format!(
                    "compiled body {} is not a value",
                    body.name()
                )));
            }
        })
    }

    fn retrieve_all(&self, operands: &[Operand]) -> Result<Vec<Value>, RuntimeError> {
        operands.iter().map(|operand| self.retrieve(operand)).collect()
    }

    fn load(&self, var: &Variable) -> Result<Value, RuntimeError> {
        match var {
            Variable::Temp { kind, index } => {
                let i = *index as usize;
                let temps = &self.temps;
                let value = match kind {
                    TempKind::Generic => temps.generic.get(i).cloned(),
                    TempKind::Boolean => temps.boolean.get(i).map(|&b| Value::Bool(b)),
                    TempKind::Fixnum => temps.fixnum.get(i).map(|&n| Value::Fixnum(n)),
                    TempKind::Float => temps.float.get(i).map(|&f| Value::Float(f)),
                };
                value.ok_or_else(|| out_of_range(var))
            }
            Variable::Local { depth, offset, .. } => {
                let (scope, depth) = self.local_scope(*depth)?;
                scope.get(depth, *offset)
            }
        }
    }

    fn store(&mut self, var: &Variable, value: Value) -> Result<(), RuntimeError> {
        match var {
            Variable::Temp { kind, index } => {
                let i = *index as usize;
                let mismatch = |expected: &str, value: &Value| {
                    RuntimeError::type_error(format!("{var} expects {expected}, got {value}"))
                };
                match kind {
                    TempKind::Generic => {
                        *self.temps.generic.get_mut(i).ok_or_else(|| out_of_range(var))? = value
                    }
                    TempKind::Boolean => {
                        let Value::Bool(b) = value else {
                            return Err(mismatch("a boolean", &value));
                        };
                        *self.temps.boolean.get_mut(i).ok_or_else(|| out_of_range(var))? = b
                    }
                    TempKind::Fixnum => {
                        let Value::Fixnum(n) = value else {
                            return Err(mismatch("an Integer", &value));
                        };
                        *self.temps.fixnum.get_mut(i).ok_or_else(|| out_of_range(var))? = n
                    }
                    TempKind::Float => {
                        let Value::Float(f) = value else {
                            return Err(mismatch("a Float", &value));
                        };
                        *self.temps.float.get_mut(i).ok_or_else(|| out_of_range(var))? = f
                    }
                }
                Ok(())
            }
            Variable::Local { depth, offset, .. } => {
                let (scope, depth) = self.local_scope(*depth)?;
                scope.set(depth, *offset, value)
            }
        }
    }

    fn int_math(&self, op: MathOp, lhs: &Operand, rhs: &Operand) -> Result<Value, RuntimeError> {
        let a = self.fixnum(lhs)?;
        let b = self.fixnum(rhs)?;
        Ok(match op {
            MathOp::Add => Value::Fixnum(a.wrapping_add(b)),
            MathOp::Sub => Value::Fixnum(a.wrapping_sub(b)),
            MathOp::Mul => Value::Fixnum(a.wrapping_mul(b)),
            MathOp::Lt => Value::Bool(a < b),
            MathOp::Gt => Value::Bool(a > b),
            MathOp::Eq => Value::Bool(a == b),
        })
    }

    fn float_math(&self, op: MathOp, lhs: &Operand, rhs: &Operand) -> Result<Value, RuntimeError> {
        let a = self.float(lhs)?;
        let b = self.float(rhs)?;
        Ok(match op {
            MathOp::Add => Value::Float(a + b),
            MathOp::Sub => Value::Float(a - b),
            MathOp::Mul => Value::Float(a * b),
            MathOp::Lt => Value::Bool(a < b),
            MathOp::Gt => Value::Bool(a > b),
            MathOp::Eq => Value::Bool(a == b),
        })
    }

    fn fixnum(&self, operand: &Operand) -> Result<i64, RuntimeError> {
        let value = self.retrieve(operand)?;
        value
            .as_fixnum()
            .ok_or_else(|| self.coercion_error(&value, "Integer"))
    }

    fn float(&self, operand: &Operand) -> Result<f64, RuntimeError> {
        match self.retrieve(operand)? {
            Value::Float(value) => Ok(value),
            Value::Fixnum(value) => Ok(value as f64),
            other => Err(self.coercion_error(&other, "Float")),
        }
    }

    fn coercion_error(&self, value: &Value, target: &str) -> RuntimeError {
        let class = self.runtime().class_of(value);
        RuntimeError::type_error(format!("{} can't be coerced into {target}", class.name()))
    }

    fn block_arg(&self, operand: &Operand) -> Result<Option<Arc<Block>>, RuntimeError> {
        match self.retrieve(operand)? {
            Value::Block(block) => Ok(Some(block)),
            Value::Nil => Ok(None),
            other => Err(self.not_a_block(&other)),
        }
    }

    fn not_a_block(&self, value: &Value) -> RuntimeError {
        let class = self.runtime().class_of(value);
        RuntimeError::type_error(format!("wrong argument type {} (expected Proc)", class.name()))
    }

    fn define_method(
        &self,
        name: &str,
        body: &Arc<CompiledMethodBody>,
    ) -> Result<(), RuntimeError> {
        let frame = self.frame()?;
        let module = frame.module.clone();
        let visibility = frame.visibility;
        log::debug!("defined method {}#{name} ({visibility})", module.name());
        let method = InterpretedMethod::new(body.clone(), visibility, module.clone());
        module.add_method(name, method);
        Ok(())
    }
}

fn out_of_range(var: &Variable) -> RuntimeError {
    RuntimeError::Internal(format!("{var} is outside the declared temporaries"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BodyBuilder, BodyFlags, BodyKind, CallType, ContextCreateInfo, ExecutionContext,
        RuntimeCreateInfo, Visibility,
    };

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            Runtime::new(RuntimeCreateInfo::default()),
            ContextCreateInfo::default(),
        )
    }

    fn define_on_object(ctx: &ExecutionContext, name: &str, body: Arc<CompiledMethodBody>) {
        let object = ctx.runtime().core().object.clone();
        object.add_method(
            name,
            InterpretedMethod::new(body, Visibility::Public, object.clone()),
        );
    }

    fn script(build: impl FnOnce(&mut BodyBuilder)) -> Arc<CompiledMethodBody> {
        let mut b = BodyBuilder::new(BodyKind::Script, "<main>").file("test.rb");
        build(&mut b);
        b.build().expect("script")
    }

    /// `def yielder = yield; :after_yield`
    fn yielder() -> Arc<CompiledMethodBody> {
        let mut b = BodyBuilder::new(BodyKind::Method, "yielder");
        let block = b.temp(TempKind::Generic);
        let result = b.temp(TempKind::Generic);
        b.push(Instr::ReceiveBlock {
            result: block.clone(),
        });
        b.push(Instr::Yield {
            result,
            block: block.into(),
            args: Vec::new(),
        });
        b.push(Instr::Return {
            value: Operand::symbol("after_yield"),
        });
        b.build().expect("yielder")
    }

    /// `def finder = yielder { return :found }; :not_found`
    fn finder() -> Arc<CompiledMethodBody> {
        let mut b = BodyBuilder::new(BodyKind::Method, "finder");
        let mut closure = BodyBuilder::new(BodyKind::Closure, "finder_block")
            .scope(&[], Some(b.static_scope()));
        closure.push(Instr::NonLocalReturn {
            value: Operand::symbol("found"),
        });
        let closure = closure.build().expect("closure");

        let block = b.temp(TempKind::Generic);
        let result = b.temp(TempKind::Generic);
        b.push(Instr::BuildClosure {
            result: block.clone(),
            body: closure,
        });
        b.push(Instr::call(
            result,
            Operand::SelfValue,
            "yielder",
            Vec::new(),
            Some(block.into()),
        ));
        b.push(Instr::Return {
            value: Operand::symbol("not_found"),
        });
        b.build().expect("finder")
    }

    #[test]
    fn nonlocal_return_unwinds_to_the_defining_method() {
        let mut ctx = context();
        define_on_object(&ctx, "yielder", yielder());
        define_on_object(&ctx, "finder", finder());

        let top = ctx.runtime().top_self();
        let result = ctx.send(top, "finder", &[]).expect("finder");
        assert_eq!(result, Value::Symbol("found".into()));

        let stats = ctx.stats();
        assert_eq!(stats.frame_pushes, 3);
        assert_eq!(stats.scope_pushes, 3);
        assert!(stats.is_balanced());
        assert_eq!(ctx.frame_depth(), 0);
    }

    #[test]
    fn escaped_nonlocal_return_is_a_local_jump_error() {
        let mut ctx = context();
        // def maker = proc { return 1 }
        let mut b = BodyBuilder::new(BodyKind::Method, "maker");
        let mut closure = BodyBuilder::new(BodyKind::Closure, "escaping")
            .scope(&[], Some(b.static_scope()));
        closure.push(Instr::NonLocalReturn {
            value: Operand::Fixnum(1),
        });
        let block = b.temp(TempKind::Generic);
        b.push(Instr::BuildClosure {
            result: block.clone(),
            body: closure.build().expect("closure"),
        });
        b.push(Instr::Return {
            value: block.into(),
        });
        define_on_object(&ctx, "maker", b.build().expect("maker"));

        let top = ctx.runtime().top_self();
        let proc_value = ctx.send(top, "maker", &[]).expect("maker");
        let block = match proc_value {
            Value::Block(block) => block,
            other => panic!("expected a block, got {other}"),
        };
        let err = block.call(&mut ctx, &[]).expect_err("escaped return");
        assert!(matches!(err, RuntimeError::LocalJump("unexpected return")));
        assert!(ctx.stats().is_balanced());
    }

    #[test]
    fn closures_share_the_enclosing_locals() {
        let mut ctx = context();
        define_on_object(&ctx, "yielder", yielder());

        // count = 0; yielder { count += 1 }; yielder { count += 1 }; count
        let mut b = BodyBuilder::new(BodyKind::Script, "<main>").scope(&["count"], None);
        let mut closure = BodyBuilder::new(BodyKind::Closure, "increment")
            .scope(&[], Some(b.static_scope()));
        let count = closure.local("count").expect("count");
        let next = closure.temp(TempKind::Fixnum);
        closure.push(Instr::IntMath {
            result: next.clone(),
            op: MathOp::Add,
            lhs: count.clone().into(),
            rhs: Operand::Fixnum(1),
        });
        closure.push(Instr::copy(count, next));
        let closure = closure.build().expect("closure");

        let count = b.local("count").expect("count");
        let block = b.temp(TempKind::Generic);
        let ignored = b.temp(TempKind::Generic);
        b.push(Instr::copy(count.clone(), Operand::Fixnum(0)));
        b.push(Instr::BuildClosure {
            result: block.clone(),
            body: closure,
        });
        for _ in 0..2 {
            b.push(Instr::call(
                ignored.clone(),
                Operand::SelfValue,
                "yielder",
                Vec::new(),
                Some(block.clone().into()),
            ));
        }
        b.push(Instr::Return {
            value: count.into(),
        });
        let body = b.build().expect("script");

        assert_eq!(ctx.run_script(&body).expect("run"), Value::Fixnum(2));
        assert!(ctx.stats().is_balanced());
    }

    #[test]
    fn loops_over_typed_temporaries() {
        let mut ctx = context();
        // i = 0; sum = 0; while i < 10; sum += i; i += 1; end; sum
        let body = script(|b| {
            let i = b.temp(TempKind::Fixnum);
            let sum = b.temp(TempKind::Fixnum);
            let cond = b.temp(TempKind::Boolean);
            let top = b.label();
            let done = b.label();
            b.push(Instr::copy(i.clone(), Operand::Fixnum(0)));
            b.push(Instr::copy(sum.clone(), Operand::Fixnum(0)));
            b.push(Instr::Label { label: top });
            b.push(Instr::IntMath {
                result: cond.clone(),
                op: MathOp::Lt,
                lhs: i.clone().into(),
                rhs: Operand::Fixnum(10),
            });
            b.push(Instr::BranchFalse {
                condition: cond.into(),
                target: done,
            });
            b.push(Instr::IntMath {
                result: sum.clone(),
                op: MathOp::Add,
                lhs: sum.clone().into(),
                rhs: i.clone().into(),
            });
            b.push(Instr::IntMath {
                result: i.clone(),
                op: MathOp::Add,
                lhs: i.into(),
                rhs: Operand::Fixnum(1),
            });
            b.push(Instr::Jump { target: top });
            b.push(Instr::Label { label: done });
            b.push(Instr::Return { value: sum.into() });
        });
        assert_eq!(ctx.run_script(&body).expect("run"), Value::Fixnum(45));
    }

    #[test]
    fn float_math_coerces_integers() {
        let mut ctx = context();
        let body = script(|b| {
            let f = b.temp(TempKind::Float);
            b.push(Instr::FloatMath {
                result: f.clone(),
                op: MathOp::Mul,
                lhs: Operand::Float(1.5),
                rhs: Operand::Fixnum(4),
            });
            b.push(Instr::Return { value: f.into() });
        });
        assert_eq!(ctx.run_script(&body).expect("run"), Value::Float(6.0));
    }

    #[test]
    fn typed_temporaries_reject_other_values() {
        let mut ctx = context();
        let body = script(|b| {
            let i = b.temp(TempKind::Fixnum);
            b.push(Instr::copy(i, Operand::str("nope")));
        });
        let err = ctx.run_script(&body).expect_err("type");
        assert_eq!(err.message(), "%i_0 expects an Integer, got \"nope\"");

        let body = script(|b| {
            let i = b.temp(TempKind::Fixnum);
            b.push(Instr::IntMath {
                result: i,
                op: MathOp::Add,
                lhs: Operand::Fixnum(1),
                rhs: Operand::Nil,
            });
        });
        let err = ctx.run_script(&body).expect_err("coercion");
        assert_eq!(err.message(), "NilClass can't be coerced into Integer");
        assert!(ctx.stats().is_balanced());
    }

    #[test]
    fn yield_without_block_is_a_local_jump_error() {
        let mut ctx = context();
        define_on_object(&ctx, "yielder", yielder());
        let top = ctx.runtime().top_self();
        let err = ctx.send(top, "yielder", &[]).expect_err("no block");
        assert!(matches!(err, RuntimeError::LocalJump("no block given (yield)")));
    }

    #[test]
    fn constants_are_written_and_searched() {
        let mut ctx = context();
        let body = script(|b| {
            let found = b.temp(TempKind::Generic);
            b.push(Instr::PutConst {
                container: Operand::ScopeModule,
                name: "ANSWER".into(),
                value: Operand::Fixnum(42),
            });
            b.push(Instr::SearchConst {
                result: found.clone(),
                name: "ANSWER".into(),
            });
            b.push(Instr::Return {
                value: found.into(),
            });
        });
        assert_eq!(ctx.run_script(&body).expect("run"), Value::Fixnum(42));

        let body = script(|b| {
            let found = b.temp(TempKind::Generic);
            b.push(Instr::SearchConst {
                result: found,
                name: "Missing".into(),
            });
        });
        let err = ctx.run_script(&body).expect_err("missing");
        assert_eq!(err.to_string(), "NameError: uninitialized constant Missing");
    }

    #[test]
    fn top_level_methods_are_private() {
        let mut ctx = context();
        let mut m = BodyBuilder::new(BodyKind::Method, "helper");
        m.push(Instr::Return {
            value: Operand::Fixnum(7),
        });
        let helper = m.build().expect("helper");

        let body = script(|b| {
            let result = b.temp(TempKind::Generic);
            b.push(Instr::define_method("helper", helper));
            b.push(Instr::call(
                result.clone(),
                Operand::SelfValue,
                "helper",
                Vec::new(),
                None,
            ));
            b.push(Instr::Return {
                value: result.into(),
            });
        });
        assert_eq!(ctx.run_script(&body).expect("run"), Value::Fixnum(7));

        let method = ctx
            .runtime()
            .core()
            .object
            .method("helper")
            .expect("defined on Object");
        assert_eq!(method.visibility(), Visibility::Private);
        let top = ctx.runtime().top_self();
        assert!(ctx.send(top, "helper", &[]).is_err());
    }

    #[test]
    fn eliminated_scope_reads_outer_locals_one_level_up() {
        let mut ctx = context();
        define_on_object(&ctx, "yielder", yielder());

        // x = 5; yielder { x } with the block's own scope eliminated
        let mut b = BodyBuilder::new(BodyKind::Script, "<main>").scope(&["x"], None);
        let mut closure = BodyBuilder::new(BodyKind::Closure, "reader")
            .scope(&[], Some(b.static_scope()))
            .flags(BodyFlags::SCOPE_ELIMINATED);
        let x = closure.local("x").expect("x");
        closure.push(Instr::Return { value: x.into() });
        let closure = closure.build().expect("closure");

        let x = b.local("x").expect("x");
        let block = b.temp(TempKind::Generic);
        let result = b.temp(TempKind::Generic);
        b.push(Instr::copy(x, Operand::Fixnum(5)));
        b.push(Instr::BuildClosure {
            result: block.clone(),
            body: closure,
        });
        b.push(Instr::Yield {
            result: result.clone(),
            block: block.into(),
            args: Vec::new(),
        });
        b.push(Instr::Return {
            value: result.into(),
        });
        let body = b.build().expect("script");

        let before = ctx.stats();
        assert_eq!(ctx.run_script(&body).expect("run"), Value::Fixnum(5));
        let after = ctx.stats();
        // only the script's own scope
        assert_eq!(after.scope_pushes - before.scope_pushes, 1);
        assert_eq!(after.frame_pushes - before.frame_pushes, 2);
    }

    /// `x = 5; yield_to(closure)`, returning whatever the script ends with.
    fn yield_to_closure(
        x_after: bool,
        closure: impl FnOnce(&Arc<crate::StaticScope>) -> Arc<CompiledMethodBody>,
    ) -> Arc<CompiledMethodBody> {
        let mut b = BodyBuilder::new(BodyKind::Script, "<main>").scope(&["x"], None);
        let closure = closure(b.static_scope());
        let x = b.local("x").expect("x");
        let block = b.temp(TempKind::Generic);
        let result = b.temp(TempKind::Generic);
        b.push(Instr::copy(x.clone(), Operand::Fixnum(5)));
        b.push(Instr::BuildClosure {
            result: block.clone(),
            body: closure,
        });
        b.push(Instr::Yield {
            result: result.clone(),
            block: block.into(),
            args: Vec::new(),
        });
        let value = if x_after { x.into() } else { result.into() };
        b.push(Instr::Return { value });
        b.build().expect("script")
    }

    #[test]
    fn reused_scope_closure_reads_enclosing_locals() {
        let mut ctx = context();
        // x = 5; yield to a block sharing the script's scope that returns x
        let body = yield_to_closure(false, |enclosing| {
            let mut closure = BodyBuilder::new(BodyKind::Closure, "reader")
                .scope(&[], Some(enclosing))
                .flags(BodyFlags::REUSE_PARENT_SCOPE);
            let x = closure.local("x").expect("x");
            closure.push(Instr::Return { value: x.into() });
            closure.build().expect("closure")
        });

        let before = ctx.stats();
        assert_eq!(ctx.run_script(&body).expect("run"), Value::Fixnum(5));
        let after = ctx.stats();
        assert_eq!(after.scope_allocations - before.scope_allocations, 1);
        assert_eq!(after.scope_pushes - before.scope_pushes, 2);
        assert!(after.is_balanced());
    }

    #[test]
    fn closures_built_in_a_reused_scope_reach_outer_locals() {
        let mut ctx = context();
        // x = 5; yield to a shared-scope block that yields to { x = x + 1 }; x
        let body = yield_to_closure(true, |enclosing| {
            let mut reuser = BodyBuilder::new(BodyKind::Closure, "reuser")
                .scope(&[], Some(enclosing))
                .flags(BodyFlags::REUSE_PARENT_SCOPE);
            let mut inner = BodyBuilder::new(BodyKind::Closure, "increment")
                .scope(&[], Some(reuser.static_scope()));
            let x = inner.local("x").expect("x");
            assert_eq!(x, Variable::local("x", 2, 0));
            let next = inner.temp(TempKind::Fixnum);
            inner.push(Instr::IntMath {
                result: next.clone(),
                op: MathOp::Add,
                lhs: x.clone().into(),
                rhs: Operand::Fixnum(1),
            });
            inner.push(Instr::copy(x, next));
            let inner = inner.build().expect("inner");

            let block = reuser.temp(TempKind::Generic);
            let result = reuser.temp(TempKind::Generic);
            reuser.push(Instr::BuildClosure {
                result: block.clone(),
                body: inner,
            });
            reuser.push(Instr::Yield {
                result: result.clone(),
                block: block.into(),
                args: Vec::new(),
            });
            reuser.push(Instr::Return {
                value: result.into(),
            });
            reuser.build().expect("reuser")
        });

        assert_eq!(ctx.run_script(&body).expect("run"), Value::Fixnum(6));
        assert!(ctx.stats().is_balanced());
    }

    #[test]
    fn methods_run_with_their_declared_visibility() {
        let mut ctx = context();
        let mut inner = BodyBuilder::new(BodyKind::Method, "inner");
        inner.push(Instr::Return {
            value: Operand::Nil,
        });
        let inner = inner.build().expect("inner");

        // def outer = def inner = nil
        let outer = |name: &str| {
            let mut b = BodyBuilder::new(BodyKind::Method, name);
            b.push(Instr::define_method(&format!("{name}_inner"), inner.clone()));
            b.push(Instr::Return {
                value: Operand::Nil,
            });
            b.build().expect("outer")
        };
        let object = ctx.runtime().core().object.clone();
        for (name, visibility) in [("hidden", Visibility::Private), ("shown", Visibility::Public)] {
            object.add_method(
                name,
                InterpretedMethod::new(outer(name), visibility, object.clone()),
            );
            let top = ctx.runtime().top_self();
            dispatch(&mut ctx, top, name, &[], None, CallType::Functional)
                .map_err(Unwind::into_error)
                .expect("outer");
            let defined = object
                .method(&format!("{name}_inner"))
                .expect("defined");
            assert_eq!(defined.visibility(), visibility);
        }
    }
}
