use std::{fmt, sync::Arc};

use crate::{
    CallType, CompiledMethodBody, DynamicScope, ExecutionContext, Frame, Module,
    RuntimeError, ScopeId, ScopeOrigin, Value, Visibility, error::Unwind, interpreter,
};

/// A compiled body bound to the module it was defined in.
pub struct InterpretedMethod {
    body: Arc<CompiledMethodBody>,
    visibility: Visibility,
    module: Arc<Module>,
}

impl InterpretedMethod {
    pub fn new(
        body: Arc<CompiledMethodBody>,
        visibility: Visibility,
        module: Arc<Module>,
    ) -> Arc<Self> {
        Arc::new(Self {
            body,
            visibility,
            module,
        })
    }

    pub fn body(&self) -> &Arc<CompiledMethodBody> {
        &self.body
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Required parameter names. Class, module and metaclass bodies take
    /// none.
    pub fn parameter_list(&self) -> Vec<Arc<str>> {
        if self.body.kind().is_module_body() {
            return Vec::new();
        }
        let locals = self.body.static_scope().local_names();
        (0..self.body.required_args())
            .map(|i| locals.get(i).cloned().unwrap_or_else(|| "_".into()))
            .collect()
    }

    pub fn dup(&self) -> Arc<Self> {
        Self::new(self.body.clone(), self.visibility, self.module.clone())
    }

    /// Invokes the method with `receiver` as `self`.
    pub fn call(
        &self,
        ctx: &mut ExecutionContext,
        receiver: Value,
        name: &str,
        args: &[Value],
        block: Option<Arc<Block>>,
    ) -> Result<Value, RuntimeError> {
        self.invoke(ctx, receiver, name, args, block)
            .map_err(Unwind::into_error)
    }

    pub(crate) fn invoke(
        &self,
        ctx: &mut ExecutionContext,
        receiver: Value,
        name: &str,
        args: &[Value],
        block: Option<Arc<Block>>,
    ) -> Result<Value, Unwind> {
        let expected = self.parameter_list().len();
        if args.len() != expected {
            return Err(RuntimeError::ArgumentError {
                given: args.len(),
                expected,
            }
            .into());
        }
        let frame = Frame {
            self_value: receiver,
            visibility: self.visibility,
            name: name.into(),
            block,
            module: self.module.clone(),
        };
        let parent = ctx.current_scope().cloned();
        execute(ctx, &self.body, frame, parent, args)
    }
}

impl fmt::Debug for InterpretedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpretedMethod")
            .field("name", &self.body.name())
            .field("visibility", &self.visibility)
            .field("module", &self.module.name())
            .finish()
    }
}

/// A closure: a body plus the `self`, scope, module and visibility it was
/// created with.
pub struct Block {
    body: Arc<CompiledMethodBody>,
    self_value: Value,
    scope: Option<Arc<DynamicScope>>,
    module: Arc<Module>,
    visibility: Visibility,
}

impl Block {
    pub fn new(
        body: Arc<CompiledMethodBody>,
        self_value: Value,
        scope: Option<Arc<DynamicScope>>,
        module: Arc<Module>,
        visibility: Visibility,
    ) -> Arc<Self> {
        Arc::new(Self {
            body,
            self_value,
            scope,
            module,
            visibility,
        })
    }

    pub fn body(&self) -> &Arc<CompiledMethodBody> {
        &self.body
    }

    pub fn captured_scope(&self) -> Option<&Arc<DynamicScope>> {
        self.scope.as_ref()
    }

    pub fn call(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, RuntimeError> {
        self.invoke(ctx, args).map_err(Unwind::into_error)
    }

    pub(crate) fn invoke(
        &self,
        ctx: &mut ExecutionContext,
        args: &[Value],
    ) -> Result<Value, Unwind> {
        let frame = Frame {
            self_value: self.self_value.clone(),
            visibility: self.visibility,
            name: self.body.name().into(),
            block: None,
            module: self.module.clone(),
        };
        execute(ctx, &self.body, frame, self.scope.clone(), args)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.body.name())
            .field("scope", &self.scope.as_ref().map(|s| s.id()))
            .finish()
    }
}

/// The frame and scope pushed for one body invocation. Dropping it pops
/// both, so every exit path leaves the context balanced.
pub(crate) struct Activation<'a> {
    ctx: &'a mut ExecutionContext,
    scope: Option<Arc<DynamicScope>>,
    parent: Option<Arc<DynamicScope>>,
    /// `false` when the body runs in its parent's scope, eliminated or
    /// reused. Static depths then count one level the context never pushed.
    owns_scope: bool,
    /// Stands in for the missing scope level when closures are created.
    bridge: Option<Arc<DynamicScope>>,
    pop_scope: bool,
}

impl<'a> Activation<'a> {
    pub(crate) fn enter(
        ctx: &'a mut ExecutionContext,
        body: &CompiledMethodBody,
        frame: Frame,
        parent: Option<Arc<DynamicScope>>,
    ) -> Result<Self, RuntimeError> {
        log::trace!("pre {} {} depth {}", body.kind(), body.name(), ctx.frame_depth());
        ctx.push_frame(frame)?;

        let (scope, owns_scope) = if body.push_new_scope() {
            let scope = DynamicScope::new(body.static_scope().clone(), parent.clone());
            ctx.push_scope(scope.clone(), ScopeOrigin::Allocated);
            (Some(scope), true)
        } else if body.reuse_parent_scope() {
            match &parent {
                Some(parent) => {
                    ctx.push_scope(parent.clone(), ScopeOrigin::Reused);
                    (Some(parent.clone()), false)
                }
                None => {
                    log::warn!("{} reuses a parent scope but has none", body.name());
                    let scope = DynamicScope::new(body.static_scope().clone(), None);
                    ctx.push_scope(scope.clone(), ScopeOrigin::Allocated);
                    (Some(scope), true)
                }
            }
        } else {
            (None, false)
        };

        Ok(Self {
            ctx,
            scope,
            parent,
            owns_scope,
            bridge: None,
            pop_scope: body.pop_scope(),
        })
    }

    #[inline]
    pub(crate) fn context(&mut self) -> &mut ExecutionContext {
        &mut *self.ctx
    }

    #[inline]
    pub(crate) fn context_ref(&self) -> &ExecutionContext {
        &*self.ctx
    }

    /// The scope this activation pushed, if any.
    pub(crate) fn scope(&self) -> Option<&Arc<DynamicScope>> {
        self.scope.as_ref()
    }

    pub(crate) fn parent(&self) -> Option<&Arc<DynamicScope>> {
        self.parent.as_ref()
    }

    pub(crate) fn owns_scope(&self) -> bool {
        self.owns_scope
    }

    /// The scope closures created by `body` capture. Without a scope of its
    /// own, a bridge over the parent keeps closure depths aligned with the
    /// static nesting.
    pub(crate) fn closure_scope(
        &mut self,
        body: &CompiledMethodBody,
    ) -> Option<Arc<DynamicScope>> {
        if self.owns_scope {
            return self.scope.clone();
        }
        let parent = self.parent.clone()?;
        let bridge = self
            .bridge
            .get_or_insert_with(|| DynamicScope::new(body.static_scope().clone(), Some(parent)));
        Some(bridge.clone())
    }

    /// Whether a non-local return aimed at `target` lands here.
    fn returns_to(&self, target: ScopeId) -> bool {
        let own = self.scope.as_ref().filter(|_| self.owns_scope);
        own.into_iter().chain(&self.bridge).any(|scope| scope.id() == target)
    }
}

impl Drop for Activation<'_> {
    fn drop(&mut self) {
        if self.pop_scope {
            self.ctx.pop_scope();
        }
        if let Some(frame) = self.ctx.pop_frame() {
            log::trace!("post {}", frame.name);
        }
    }
}

/// Runs `body` inside a fresh activation. A non-local return aimed at the
/// scope this activation owns completes here.
pub(crate) fn execute(
    ctx: &mut ExecutionContext,
    body: &Arc<CompiledMethodBody>,
    frame: Frame,
    parent: Option<Arc<DynamicScope>>,
    args: &[Value],
) -> Result<Value, Unwind> {
    let mut activation = Activation::enter(ctx, body, frame, parent)?;
    match interpreter::interpret(&mut activation, body, args) {
        Err(Unwind::Return { target, value })
            if body.kind().is_return_target() && activation.returns_to(target) =>
        {
            Ok(value)
        }
        result => result,
    }
}

/// Looks up `name` on `receiver` and invokes it.
pub(crate) fn dispatch(
    ctx: &mut ExecutionContext,
    receiver: Value,
    name: &str,
    args: &[Value],
    block: Option<Arc<Block>>,
    call_type: CallType,
) -> Result<Value, Unwind> {
    let runtime = ctx.runtime().clone();
    let Some(method) = runtime.find_method(&receiver, name) else {
        return intrinsic(ctx, &receiver, name, args, block);
    };
    if method.visibility() == Visibility::Private && call_type == CallType::Normal {
        return Err(RuntimeError::NoMethodError {
            name: name.to_owned(),
            message: format!(
                "private method '{name}' called for {}",
                describe(ctx, &receiver)
            ),
        }
        .into());
    }
    method.invoke(ctx, receiver, name, args, block)
}

/// Methods every object answers without a definition.
fn intrinsic(
    ctx: &mut ExecutionContext,
    receiver: &Value,
    name: &str,
    args: &[Value],
    block: Option<Arc<Block>>,
) -> Result<Value, Unwind> {
    let runtime = ctx.runtime().clone();
    match (name, receiver) {
        ("new", Value::Module(class)) if class.is_class() && !class.is_singleton() => {
            let object = runtime.new_object(class);
            if runtime.find_method(&object, "initialize").is_some() {
                dispatch(ctx, object.clone(), "initialize", args, block, CallType::Functional)?;
            } else if !args.is_empty() {
                return Err(RuntimeError::ArgumentError {
                    given: args.len(),
                    expected: 0,
                }
                .into());
            }
            Ok(object)
        }
        ("class", _) if args.is_empty() => Ok(Value::Module(runtime.class_of(receiver))),
        ("singleton_class", _) if args.is_empty() => {
            Ok(Value::Module(runtime.singleton_class_for(receiver)?))
        }
        ("call" | "[]", Value::Block(block)) => block.invoke(ctx, args),
        _ => Err(RuntimeError::NoMethodError {
            name: name.to_owned(),
            message: format!("undefined method '{name}' for {}", describe(ctx, receiver)),
        }
        .into()),
    }
}

fn describe(ctx: &ExecutionContext, receiver: &Value) -> String {
    match receiver {
        Value::Module(module) => module.name().to_owned(),
        Value::Nil => "nil".to_owned(),
        other => format!("an instance of {}", ctx.runtime().class_of(other).name()),
    }
}
