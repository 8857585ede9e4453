use std::{fmt, sync::Arc};

use crate::{
    Block, CallType, CompiledMethodBody, DynamicScope, Module, Runtime, RuntimeError, Value,
    method::{self, dispatch},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Protected => "protected",
        };
        f.write_str(name)
    }
}

/// One call frame. `visibility` is the default for methods defined while
/// this frame is active.
#[derive(Debug, Clone)]
pub struct Frame {
    pub self_value: Value,
    pub visibility: Visibility,
    pub name: Arc<str>,
    pub block: Option<Arc<Block>>,
    pub module: Arc<Module>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOrigin {
    /// Allocated by the activation that pushed it.
    Allocated,
    /// The parent scope pushed again by a body that runs inside it.
    Reused,
}

#[derive(Debug, Clone)]
pub struct ScopeEntry {
    pub scope: Arc<DynamicScope>,
    pub origin: ScopeOrigin,
}

/// Push/pop accounting for one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub frame_pushes: usize,
    pub frame_pops: usize,
    pub scope_pushes: usize,
    pub scope_pops: usize,
    pub scope_allocations: usize,
}

impl ContextStats {
    pub fn is_balanced(&self) -> bool {
        self.frame_pushes == self.frame_pops && self.scope_pushes == self.scope_pops
    }
}

impl fmt::Display for ContextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames +{}/-{} scopes +{}/-{} allocated {}",
            self.frame_pushes,
            self.frame_pops,
            self.scope_pushes,
            self.scope_pops,
            self.scope_allocations
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextCreateInfo {
    pub frame_capacity: usize,
    pub scope_capacity: usize,
}

impl Default for ContextCreateInfo {
    fn default() -> Self {
        Self {
            frame_capacity: 64,
            scope_capacity: 64,
        }
    }
}

/// Per-thread execution state: the frame stack and the scope stack.
pub struct ExecutionContext {
    runtime: Arc<Runtime>,
    frames: Vec<Frame>,
    scopes: Vec<ScopeEntry>,
    stats: ContextStats,
}

impl ExecutionContext {
    pub fn new(runtime: Arc<Runtime>, info: ContextCreateInfo) -> Self {
        Self {
            runtime,
            frames: Vec::with_capacity(info.frame_capacity),
            scopes: Vec::with_capacity(info.scope_capacity),
            stats: ContextStats::default(),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn push_frame(&mut self, frame: Frame) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.runtime.max_call_depth() {
            return Err(RuntimeError::StackOverflow);
        }
        self.frames.push(frame);
        self.stats.frame_pushes += 1;
        Ok(())
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.stats.frame_pops += 1;
        Some(frame)
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_scope(&mut self, scope: Arc<DynamicScope>, origin: ScopeOrigin) {
        if origin == ScopeOrigin::Allocated {
            self.stats.scope_allocations += 1;
        }
        self.scopes.push(ScopeEntry { scope, origin });
        self.stats.scope_pushes += 1;
    }

    pub fn pop_scope(&mut self) -> Option<ScopeEntry> {
        let entry = self.scopes.pop()?;
        self.stats.scope_pops += 1;
        Some(entry)
    }

    pub fn current_scope(&self) -> Option<&Arc<DynamicScope>> {
        self.scopes.last().map(|entry| &entry.scope)
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    /// Runs a top-level body with the runtime's main object as `self`.
    pub fn run_script(&mut self, body: &Arc<CompiledMethodBody>) -> Result<Value, RuntimeError> {
        let frame = Frame {
            self_value: self.runtime.top_self(),
            visibility: Visibility::Private,
            name: "<main>".into(),
            block: None,
            module: self.runtime.core().object.clone(),
        };
        log::debug!("running script {} ({})", body.name(), body.file());
        method::execute(self, body, frame, None, &[]).map_err(|unwind| unwind.into_error())
    }

    /// Calls a public method on `receiver` from outside any running body.
    pub fn send(
        &mut self,
        receiver: Value,
        name: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        dispatch(self, receiver, name, args, None, CallType::Normal)
            .map_err(|unwind| unwind.into_error())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("frames", &self.frames.len())
            .field("scopes", &self.scopes.len())
            .field("stats", &self.stats)
            .finish()
    }
}
