use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{RuntimeError, StaticScope, Value};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Runtime storage for the locals of one activation.
///
/// The `parent` link is the lexical enclosure and never changes. A scope
/// outlives its activation when a closure captured it.
pub struct DynamicScope {
    id: ScopeId,
    static_scope: Arc<StaticScope>,
    parent: Option<Arc<DynamicScope>>,
    slots: Mutex<Vec<Value>>,
}

impl DynamicScope {
    pub fn new(static_scope: Arc<StaticScope>, parent: Option<Arc<DynamicScope>>) -> Arc<Self> {
        let slots = vec![Value::Nil; static_scope.local_count()];
        Arc::new(Self {
            id: ScopeId::next(),
            static_scope,
            parent,
            slots: Mutex::new(slots),
        })
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn static_scope(&self) -> &Arc<StaticScope> {
        &self.static_scope
    }

    pub fn parent(&self) -> Option<&Arc<DynamicScope>> {
        self.parent.as_ref()
    }

    pub fn ancestor(&self, depth: u32) -> Option<&DynamicScope> {
        let mut scope = self;
        for _ in 0..depth {
            scope = scope.parent.as_deref()?;
        }
        Some(scope)
    }

    pub fn get(&self, depth: u32, offset: u32) -> Result<Value, RuntimeError> {
        let scope = self.ancestor(depth).ok_or_else(|| missing(depth, offset))?;
        let slots = scope.slots.lock();
        slots
            .get(offset as usize)
            .cloned()
            .ok_or_else(|| missing(depth, offset))
    }

    pub fn set(&self, depth: u32, offset: u32, value: Value) -> Result<(), RuntimeError> {
        let scope = self.ancestor(depth).ok_or_else(|| missing(depth, offset))?;
        let mut slots = scope.slots.lock();
        let slot = slots
            .get_mut(offset as usize)
            .ok_or_else(|| missing(depth, offset))?;
        *slot = value;
        Ok(())
    }

    /// The nearest scope, this one included, that a non-local return
    /// unwinds to.
    pub fn return_target(&self) -> Option<&DynamicScope> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if current.static_scope.kind().is_return_target() {
                return Some(current);
            }
            scope = current.parent.as_deref();
        }
        None
    }
}

fn missing(depth: u32, offset: u32) -> RuntimeError {
    RuntimeError::Internal(format!("no local slot at depth {depth} offset {offset}"))
}

impl fmt::Debug for DynamicScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicScope")
            .field("id", &self.id)
            .field("kind", &self.static_scope.kind())
            .field("slots", &self.static_scope.local_count())
            .field("parent", &self.parent.as_ref().map(|parent| parent.id))
            .finish()
    }
}
