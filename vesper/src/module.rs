use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{CompiledMethodBody, InterpretedMethod, Value};

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u64);

#[derive(Debug)]
pub enum ModuleKind {
    Module,
    Class {
        superclass: Option<Arc<Module>>,
        /// `false` for classes that cannot be subclassed, e.g. `Class`.
        inheritable: bool,
    },
    /// Holds the per-object methods of exactly one module or object.
    Singleton,
}

/// A module, class or singleton class.
pub struct Module {
    id: ModuleId,
    name: Arc<str>,
    kind: ModuleKind,
    methods: RwLock<HashMap<Arc<str>, Arc<InterpretedMethod>>>,
    /// Constants, nested classes and modules included. Reopening looks up
    /// and inserts under this one lock.
    constants: Mutex<HashMap<Arc<str>, Value>>,
    singleton: Mutex<Option<Arc<Module>>>,
    body: RwLock<Option<Arc<CompiledMethodBody>>>,
}

impl Module {
    fn with_kind(name: &str, kind: ModuleKind) -> Arc<Self> {
        Arc::new(Self {
            id: ModuleId(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            kind,
            methods: RwLock::new(HashMap::new()),
            constants: Mutex::new(HashMap::new()),
            singleton: Mutex::new(None),
            body: RwLock::new(None),
        })
    }

    pub fn new_module(name: &str) -> Arc<Self> {
        Self::with_kind(name, ModuleKind::Module)
    }

    pub fn new_class(name: &str, superclass: Option<Arc<Module>>) -> Arc<Self> {
        Self::with_kind(
            name,
            ModuleKind::Class {
                superclass,
                inheritable: true,
            },
        )
    }

    /// A class that refuses to be subclassed.
    pub fn new_final_class(name: &str, superclass: Option<Arc<Module>>) -> Arc<Self> {
        Self::with_kind(
            name,
            ModuleKind::Class {
                superclass,
                inheritable: false,
            },
        )
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ModuleKind {
        &self.kind
    }

    /// Singleton classes count as classes.
    pub fn is_class(&self) -> bool {
        !matches!(self.kind, ModuleKind::Module)
    }

    pub fn is_singleton(&self) -> bool {
        matches!(self.kind, ModuleKind::Singleton)
    }

    pub fn is_inheritable(&self) -> bool {
        matches!(
            self.kind,
            ModuleKind::Class {
                inheritable: true,
                ..
            }
        )
    }

    pub fn superclass(&self) -> Option<&Arc<Module>> {
        match &self.kind {
            ModuleKind::Class { superclass, .. } => superclass.as_ref(),
            _ => None,
        }
    }

    /// This class followed by its superclasses.
    pub fn ancestors(self: &Arc<Self>) -> impl Iterator<Item = Arc<Module>> {
        std::iter::successors(Some(self.clone()), |module| module.superclass().cloned())
    }

    pub fn method(&self, name: &str) -> Option<Arc<InterpretedMethod>> {
        self.methods.read().get(name).cloned()
    }

    pub fn add_method(&self, name: &str, method: Arc<InterpretedMethod>) {
        self.methods.write().insert(name.into(), method);
    }

    pub fn method_names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<_> = self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn constant(&self, name: &str) -> Option<Value> {
        self.constants.lock().get(name).cloned()
    }

    pub fn set_constant(&self, name: &str, value: Value) {
        self.constants.lock().insert(name.into(), value);
    }

    /// Locks the constant table for a lookup-or-insert.
    pub fn definitions(&self) -> MutexGuard<'_, HashMap<Arc<str>, Value>> {
        self.constants.lock()
    }

    pub fn existing_singleton(&self) -> Option<Arc<Module>> {
        self.singleton.lock().clone()
    }

    /// The unique singleton class, created on first request.
    pub fn singleton_class(self: &Arc<Self>) -> Arc<Module> {
        let mut slot = self.singleton.lock();
        if let Some(singleton) = slot.as_ref() {
            return singleton.clone();
        }
        let singleton = Module::with_kind(
            &format!("#<Class:{}>", self.name),
            ModuleKind::Singleton,
        );
        log::debug!("materialized singleton class {}", singleton.name);
        *slot = Some(singleton.clone());
        singleton
    }

    /// Records `body` as the code last executed to define this module.
    pub fn bind_body(&self, body: Arc<CompiledMethodBody>) {
        *self.body.write() = Some(body);
    }

    pub fn body(&self) -> Option<Arc<CompiledMethodBody>> {
        self.body.read().clone()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ModuleKind::Module => "module",
            ModuleKind::Class { .. } => "class",
            ModuleKind::Singleton => "singleton",
        };
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &kind)
            .field("superclass", &self.superclass().map(|s| s.name.clone()))
            .finish()
    }
}

/// A plain instance. Objects carry no state beyond their class.
pub struct RObject {
    class: Arc<Module>,
    singleton: Mutex<Option<Arc<Module>>>,
}

impl RObject {
    pub fn new(class: Arc<Module>) -> Arc<Self> {
        Arc::new(Self {
            class,
            singleton: Mutex::new(None),
        })
    }

    pub fn class(&self) -> &Arc<Module> {
        &self.class
    }

    pub fn existing_singleton(&self) -> Option<Arc<Module>> {
        self.singleton.lock().clone()
    }

    pub fn singleton_class(self: &Arc<Self>) -> Arc<Module> {
        let mut slot = self.singleton.lock();
        if let Some(singleton) = slot.as_ref() {
            return singleton.clone();
        }
        let singleton = Module::with_kind(
            &format!("#<Class:#<{}>>", self.class.name),
            ModuleKind::Singleton,
        );
        log::debug!("materialized singleton class {}", singleton.name);
        *slot = Some(singleton.clone());
        singleton
    }
}

impl fmt::Debug for RObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RObject")
            .field("class", &self.class.name)
            .finish()
    }
}
