use std::{collections::HashMap, fmt, sync::Arc};

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::{Instr, IrError, Label, Module, TempCounts, TempKind, Variable};

bitflags! {
    /// Execution flags computed by the compiler for one body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BodyFlags: u32 {
        /// Run inside the caller's (or captured) scope instead of a new one.
        const REUSE_PARENT_SCOPE = 1 << 0;
        /// No dynamic scope at all, locals live in temporaries.
        const SCOPE_ELIMINATED = 1 << 1;
        const HAS_NONLOCAL_RETURNS = 1 << 2;
        const RECEIVES_CLOSURE_ARG = 1 << 3;
        const CAN_CAPTURE_CALLERS_BINDING = 1 << 4;
        const REQUIRES_FRAME = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyKind {
    Script,
    Method,
    Closure,
    ClassBody,
    ModuleBody,
    MetaClassBody,
}

impl BodyKind {
    /// Non-local returns unwind to the nearest activation of this kind.
    pub fn is_return_target(self) -> bool {
        matches!(self, BodyKind::Script | BodyKind::Method)
    }

    pub fn is_module_body(self) -> bool {
        matches!(
            self,
            BodyKind::ClassBody | BodyKind::ModuleBody | BodyKind::MetaClassBody
        )
    }
}

impl fmt::Display for BodyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BodyKind::Script => "script",
            BodyKind::Method => "method",
            BodyKind::Closure => "closure",
            BodyKind::ClassBody => "class_body",
            BodyKind::ModuleBody => "module_body",
            BodyKind::MetaClassBody => "metaclass_body",
        };
        f.write_str(name)
    }
}

/// Compile-time view of a lexical scope: its local names, the lexically
/// enclosing scope, and the module its body is bound to.
#[derive(Debug)]
pub struct StaticScope {
    kind: BodyKind,
    locals: Vec<Arc<str>>,
    enclosing: Option<Arc<StaticScope>>,
    module: RwLock<Option<Arc<Module>>>,
}

impl StaticScope {
    pub fn new(
        kind: BodyKind,
        locals: Vec<Arc<str>>,
        enclosing: Option<Arc<StaticScope>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            locals,
            enclosing,
            module: RwLock::new(None),
        })
    }

    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn local_names(&self) -> &[Arc<str>] {
        &self.locals
    }

    pub fn local_offset(&self, name: &str) -> Option<u32> {
        self.locals
            .iter()
            .position(|local| &**local == name)
            .map(|offset| offset as u32)
    }

    pub fn enclosing(&self) -> Option<&Arc<StaticScope>> {
        self.enclosing.as_ref()
    }

    /// The scope `depth` enclosure hops away.
    pub fn ancestor(&self, depth: u32) -> Option<&StaticScope> {
        let mut scope = self;
        for _ in 0..depth {
            scope = scope.enclosing.as_deref()?;
        }
        Some(scope)
    }

    pub fn module(&self) -> Option<Arc<Module>> {
        self.module.read().clone()
    }

    pub fn set_module(&self, module: Arc<Module>) {
        *self.module.write() = Some(module);
    }

    /// The nearest module bound to this scope or one enclosing it.
    pub fn lexical_module(&self) -> Option<Arc<Module>> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(module) = current.module() {
                return Some(module);
            }
            scope = current.enclosing.as_deref();
        }
        None
    }
}

/// An immutable, compiled method, closure, class or script body.
///
/// Shared by every invocation of the code it represents. The three scope
/// booleans are derived from [`BodyFlags`] once, at construction.
pub struct CompiledMethodBody {
    name: Arc<str>,
    file: Arc<str>,
    static_scope: Arc<StaticScope>,
    instructions: Vec<Instr>,
    labels: HashMap<Label, usize>,
    temps: TempCounts,
    flags: BodyFlags,
    required_args: usize,
    push_new_scope: bool,
    reuse_parent_scope: bool,
    pop_scope: bool,
}

impl CompiledMethodBody {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn kind(&self) -> BodyKind {
        self.static_scope.kind
    }

    pub fn static_scope(&self) -> &Arc<StaticScope> {
        &self.static_scope
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.instructions
    }

    pub fn temps(&self) -> TempCounts {
        self.temps
    }

    pub fn flags(&self) -> BodyFlags {
        self.flags
    }

    pub fn required_args(&self) -> usize {
        self.required_args
    }

    #[inline]
    pub fn push_new_scope(&self) -> bool {
        self.push_new_scope
    }

    #[inline]
    pub fn reuse_parent_scope(&self) -> bool {
        self.reuse_parent_scope
    }

    #[inline]
    pub fn pop_scope(&self) -> bool {
        self.pop_scope
    }

    /// Instruction index of `label`.
    pub fn label_index(&self, label: Label) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// One past the highest label in use.
    pub fn next_label(&self) -> u32 {
        self.labels.keys().map(|label| label.0 + 1).max().unwrap_or(0)
    }

    /// A copy of this body with a different instruction stream, used by
    /// optimization passes. The new stream is validated like a fresh body.
    pub fn with_instructions(&self, instructions: Vec<Instr>) -> Result<Arc<Self>, IrError> {
        BodyBuilder {
            name: self.name.clone(),
            file: self.file.clone(),
            static_scope: self.static_scope.clone(),
            instructions,
            allocated: TempCounts::default(),
            declared: None,
            next_label: 0,
            flags: self.flags,
            required_args: self.required_args,
        }
        .build()
    }

    pub fn disassemble(&self) -> String {
        let mut out = format!(
            "{} {} ({}) temps=[v:{} b:{} i:{} f:{}] flags={:?}\n",
            self.kind(),
            self.name,
            self.file,
            self.temps.generic,
            self.temps.boolean,
            self.temps.fixnum,
            self.temps.float,
            self.flags,
        );
        for (index, instr) in self.instructions.iter().enumerate() {
            out.push_str(&format!("  {index:>3}: {instr}\n"));
        }
        out
    }
}

impl PartialEq for CompiledMethodBody {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl fmt::Debug for CompiledMethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethodBody")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("instructions", &self.instructions.len())
            .field("temps", &self.temps)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Assembles and validates a [`CompiledMethodBody`].
pub struct BodyBuilder {
    name: Arc<str>,
    file: Arc<str>,
    static_scope: Arc<StaticScope>,
    instructions: Vec<Instr>,
    allocated: TempCounts,
    declared: Option<TempCounts>,
    next_label: u32,
    flags: BodyFlags,
    required_args: usize,
}

impl BodyBuilder {
    pub fn new(kind: BodyKind, name: &str) -> Self {
        Self {
            name: name.into(),
            file: "-".into(),
            static_scope: StaticScope::new(kind, Vec::new(), None),
            instructions: Vec::new(),
            allocated: TempCounts::default(),
            declared: None,
            next_label: 0,
            flags: BodyFlags::empty(),
            required_args: 0,
        }
    }

    pub fn file(mut self, file: &str) -> Self {
        self.file = file.into();
        self
    }

    pub fn flags(mut self, flags: BodyFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn required_args(mut self, count: usize) -> Self {
        self.required_args = count;
        self
    }

    /// Sizes the temporaries explicitly instead of deriving them from use.
    pub fn declare_temps(mut self, temps: TempCounts) -> Self {
        self.declared = Some(temps);
        self
    }

    /// Replaces the static scope. Call before handing out [`Self::static_scope`].
    pub fn scope(
        mut self,
        locals: &[&str],
        enclosing: Option<&Arc<StaticScope>>,
    ) -> Self {
        self.static_scope = StaticScope::new(
            self.static_scope.kind,
            locals.iter().map(|&name| Arc::from(name)).collect(),
            enclosing.cloned(),
        );
        self
    }

    pub fn static_scope(&self) -> &Arc<StaticScope> {
        &self.static_scope
    }

    /// Resolves `name` in this scope or an enclosing one.
    pub fn local(&self, name: &str) -> Result<Variable, IrError> {
        let mut scope = Some(&*self.static_scope);
        let mut depth = 0;
        while let Some(current) = scope {
            if let Some(offset) = current.local_offset(name) {
                return Ok(Variable::local(name, depth, offset));
            }
            depth += 1;
            scope = current.enclosing.as_deref();
        }
        Err(IrError::UnknownLocal(name.to_owned()))
    }

    pub fn temp(&mut self, kind: TempKind) -> Variable {
        Variable::typed_temp(kind, self.allocated.allocate(kind))
    }

    pub fn label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn push(&mut self, instr: Instr) -> &mut Self {
        self.instructions.push(instr);
        self
    }

    pub fn build(self) -> Result<Arc<CompiledMethodBody>, IrError> {
        let eliminated = self.flags.contains(BodyFlags::SCOPE_ELIMINATED);
        let reuse_parent_scope = self.flags.contains(BodyFlags::REUSE_PARENT_SCOPE);
        if eliminated && reuse_parent_scope {
            return Err(IrError::ConflictingScopeFlags);
        }

        let mut labels = HashMap::new();
        for (index, instr) in self.instructions.iter().enumerate() {
            if let Instr::Label { label } = instr {
                if labels.insert(*label, index).is_some() {
                    return Err(IrError::DuplicateLabel(*label));
                }
            }
        }

        let mut used = self.allocated;
        for instr in &self.instructions {
            match instr {
                Instr::Jump { target } | Instr::BranchFalse { target, .. } => {
                    if !labels.contains_key(target) {
                        return Err(IrError::UnknownLabel(*target));
                    }
                }
                _ => {}
            }
            for var in instr.used_variables() {
                match &var {
                    Variable::Temp { kind, index } => used.cover(*kind, *index),
                    Variable::Local {
                        name,
                        depth,
                        offset,
                    } => {
                        let shares_parent = eliminated || reuse_parent_scope;
                        self.check_local(name, *depth, *offset, shares_parent)?
                    }
                }
            }
        }

        let temps = match self.declared {
            Some(declared) => {
                check_declared(&declared, &used)?;
                declared
            }
            None => used,
        };

        let push_new_scope = !eliminated && !reuse_parent_scope;
        Ok(Arc::new(CompiledMethodBody {
            name: self.name,
            file: self.file,
            static_scope: self.static_scope,
            instructions: self.instructions,
            labels,
            temps,
            flags: self.flags,
            required_args: self.required_args,
            push_new_scope,
            reuse_parent_scope,
            pop_scope: push_new_scope || reuse_parent_scope,
        }))
    }

    fn check_local(
        &self,
        name: &str,
        depth: u32,
        offset: u32,
        shares_parent: bool,
    ) -> Result<(), IrError> {
        if shares_parent && depth == 0 {
            return Err(IrError::SharedScopeLocal(name.to_owned()));
        }
        match self.static_scope.ancestor(depth) {
            Some(scope) if (offset as usize) < scope.local_count() => Ok(()),
            _ => Err(IrError::LocalOutOfRange {
                name: name.to_owned(),
                depth,
                offset,
            }),
        }
    }
}

fn check_declared(declared: &TempCounts, used: &TempCounts) -> Result<(), IrError> {
    if declared.covers(used) {
        return Ok(());
    }
    let kind = TempKind::ALL
        .into_iter()
        .find(|&kind| used.get(kind) > declared.get(kind))
        .unwrap_or(TempKind::Generic);
    Err(IrError::TempOutOfRange {
        var: Variable::typed_temp(kind, (used.get(kind) - 1) as u32).to_string(),
        declared: declared.get(kind),
    })
}
