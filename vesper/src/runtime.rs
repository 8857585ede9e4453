use std::sync::Arc;

use crate::{InterpretedMethod, Module, RObject, RuntimeError, StaticScope, Value};

/// Object-model operations the class definition instruction relies on.
pub trait ObjectModel {
    /// `value` as a namespace that classes can be defined under.
    fn as_container(&self, value: &Value) -> Option<Arc<Module>>;

    /// Returns the class `name` under `container`, creating it on first
    /// definition. `superclass` of `None` means none was written.
    fn define_or_get_class_under(
        &self,
        container: &Arc<Module>,
        name: &str,
        superclass: Option<Arc<Module>>,
    ) -> Result<Arc<Module>, RuntimeError>;

    fn define_or_get_module_under(
        &self,
        container: &Arc<Module>,
        name: &str,
    ) -> Result<Arc<Module>, RuntimeError>;

    /// Checks that `superclass` may be subclassed and returns it as a class.
    fn check_inheritable(&self, superclass: &Value) -> Result<Arc<Module>, RuntimeError>;

    fn singleton_class_of(&self, container: &Arc<Module>) -> Arc<Module>;
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeCreateInfo {
    /// Frames allowed on one context before `StackOverflow`.
    pub max_call_depth: usize,
}

impl Default for RuntimeCreateInfo {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
        }
    }
}

#[derive(Debug)]
pub struct CoreClasses {
    pub basic_object: Arc<Module>,
    pub object: Arc<Module>,
    pub module: Arc<Module>,
    pub class: Arc<Module>,
    pub integer: Arc<Module>,
    pub float: Arc<Module>,
    pub string: Arc<Module>,
    pub symbol: Arc<Module>,
    pub nil: Arc<Module>,
    pub true_class: Arc<Module>,
    pub false_class: Arc<Module>,
    pub array: Arc<Module>,
    pub proc_class: Arc<Module>,
    pub method: Arc<Module>,
}

impl CoreClasses {
    fn new() -> Self {
        let basic_object = Module::new_class("BasicObject", None);
        let object = Module::new_class("Object", Some(basic_object.clone()));
        let module = Module::new_class("Module", Some(object.clone()));
        let sub = |name: &str| Module::new_class(name, Some(object.clone()));
        let terminal = |name: &str| Module::new_final_class(name, Some(object.clone()));
        Self {
            class: Module::new_final_class("Class", Some(module.clone())),
            integer: terminal("Integer"),
            float: terminal("Float"),
            string: sub("String"),
            symbol: terminal("Symbol"),
            nil: terminal("NilClass"),
            true_class: terminal("TrueClass"),
            false_class: terminal("FalseClass"),
            array: sub("Array"),
            proc_class: sub("Proc"),
            method: sub("Method"),
            basic_object,
            object,
            module,
        }
    }

    fn all(&self) -> [&Arc<Module>; 14] {
        [
            &self.basic_object,
            &self.object,
            &self.module,
            &self.class,
            &self.integer,
            &self.float,
            &self.string,
            &self.symbol,
            &self.nil,
            &self.true_class,
            &self.false_class,
            &self.array,
            &self.proc_class,
            &self.method,
        ]
    }
}

/// State shared by every thread: the core classes and the object graph
/// hanging off `Object`.
#[derive(Debug)]
pub struct Runtime {
    info: RuntimeCreateInfo,
    core: CoreClasses,
    top_self: Arc<RObject>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Arc<Self> {
        let core = CoreClasses::new();
        for class in core.all() {
            core.object
                .set_constant(class.name(), Value::Module(class.clone()));
        }
        let top_self = RObject::new(core.object.clone());
        log::debug!("runtime booted, max call depth {}", info.max_call_depth);
        Arc::new(Self {
            info,
            core,
            top_self,
        })
    }

    pub fn core(&self) -> &CoreClasses {
        &self.core
    }

    pub fn max_call_depth(&self) -> usize {
        self.info.max_call_depth
    }

    pub fn top_self(&self) -> Value {
        Value::Object(self.top_self.clone())
    }

    pub fn new_object(&self, class: &Arc<Module>) -> Value {
        Value::Object(RObject::new(class.clone()))
    }

    pub fn class_of(&self, value: &Value) -> Arc<Module> {
        let core = &self.core;
        match value {
            Value::Nil => core.nil.clone(),
            Value::Bool(true) => core.true_class.clone(),
            Value::Bool(false) => core.false_class.clone(),
            Value::Fixnum(_) => core.integer.clone(),
            Value::Float(_) => core.float.clone(),
            Value::Str(_) => core.string.clone(),
            Value::Symbol(_) => core.symbol.clone(),
            Value::Array(_) => core.array.clone(),
            Value::Object(object) => object.class().clone(),
            Value::Module(module) if module.is_class() => core.class.clone(),
            Value::Module(_) => core.module.clone(),
            Value::Method(_) => core.method.clone(),
            Value::Block(_) => core.proc_class.clone(),
        }
    }

    /// The singleton class of `value`, created on first request. Immediate
    /// values have none.
    pub fn singleton_class_for(&self, value: &Value) -> Result<Arc<Module>, RuntimeError> {
        match value {
            Value::Object(object) => Ok(object.singleton_class()),
            Value::Module(module) => Ok(module.singleton_class()),
            _ => Err(RuntimeError::type_error("can't define singleton")),
        }
    }

    /// Singleton classes first, then the class hierarchy.
    pub fn find_method(&self, receiver: &Value, name: &str) -> Option<Arc<InterpretedMethod>> {
        match receiver {
            Value::Object(object) => {
                if let Some(method) = object.existing_singleton().and_then(|s| s.method(name)) {
                    return Some(method);
                }
            }
            Value::Module(module) => {
                let singleton_method = module
                    .ancestors()
                    .filter_map(|ancestor| ancestor.existing_singleton())
                    .find_map(|singleton| singleton.method(name));
                if singleton_method.is_some() {
                    return singleton_method;
                }
            }
            _ => {}
        }
        self.class_of(receiver)
            .ancestors()
            .find_map(|class| class.method(name))
    }

    /// Lexically enclosing modules, then the ancestors of `module`, then
    /// `Object`.
    pub fn search_const(
        &self,
        scope: &StaticScope,
        module: &Arc<Module>,
        name: &str,
    ) -> Result<Value, RuntimeError> {
        let mut lexical = Some(scope);
        while let Some(current) = lexical {
            if let Some(value) = current.module().and_then(|m| m.constant(name)) {
                return Ok(value);
            }
            lexical = current.enclosing().map(|s| &**s);
        }
        module
            .ancestors()
            .find_map(|ancestor| ancestor.constant(name))
            .or_else(|| self.core.object.constant(name))
            .ok_or_else(|| RuntimeError::NameError(name.to_owned()))
    }

    fn qualified_name(&self, container: &Arc<Module>, name: &str) -> String {
        if Arc::ptr_eq(container, &self.core.object) {
            name.to_owned()
        } else {
            format!("{}::{name}", container.name())
        }
    }
}

impl ObjectModel for Runtime {
    fn as_container(&self, value: &Value) -> Option<Arc<Module>> {
        value.as_module().cloned()
    }

    fn define_or_get_class_under(
        &self,
        container: &Arc<Module>,
        name: &str,
        superclass: Option<Arc<Module>>,
    ) -> Result<Arc<Module>, RuntimeError> {
        let qualified = self.qualified_name(container, name);
        let mut definitions = container.definitions();
        if let Some(existing) = definitions.get(name) {
            let class = match existing {
                Value::Module(module) if module.is_class() && !module.is_singleton() => module,
                _ => return Err(RuntimeError::type_error(format!("{qualified} is not a class"))),
            };
            if let Some(superclass) = &superclass {
                let same = class
                    .superclass()
                    .is_some_and(|current| Arc::ptr_eq(current, superclass));
                if !same {
                    return Err(RuntimeError::type_error(format!(
                        "superclass mismatch for class {qualified}"
                    )));
                }
            }
            log::trace!("reopened class {qualified}");
            return Ok(class.clone());
        }

        let superclass = superclass.unwrap_or_else(|| self.core.object.clone());
        let class = Module::new_class(&qualified, Some(superclass.clone()));
        definitions.insert(name.into(), Value::Module(class.clone()));
        log::debug!("defined class {qualified} < {}", superclass.name());
        Ok(class)
    }

    fn define_or_get_module_under(
        &self,
        container: &Arc<Module>,
        name: &str,
    ) -> Result<Arc<Module>, RuntimeError> {
        let qualified = self.qualified_name(container, name);
        let mut definitions = container.definitions();
        if let Some(existing) = definitions.get(name) {
            return match existing {
                Value::Module(module) if !module.is_class() => {
                    log::trace!("reopened module {qualified}");
                    Ok(module.clone())
                }
                _ => Err(RuntimeError::type_error(format!("{qualified} is not a module"))),
            };
        }

        let module = Module::new_module(&qualified);
        definitions.insert(name.into(), Value::Module(module.clone()));
        log::debug!("defined module {qualified}");
        Ok(module)
    }

    fn check_inheritable(&self, superclass: &Value) -> Result<Arc<Module>, RuntimeError> {
        match superclass {
            Value::Module(class) if class.is_singleton() => Err(RuntimeError::type_error(
                "can't make subclass of singleton class",
            )),
            Value::Module(class) if class.is_class() => {
                if class.is_inheritable() {
                    Ok(class.clone())
                } else {
                    Err(RuntimeError::type_error(format!(
                        "can't make subclass of {}",
                        class.name()
                    )))
                }
            }
            other => Err(RuntimeError::type_error(format!(
                "superclass must be a Class ({} given)",
                self.class_of(other).name()
            ))),
        }
    }

    fn singleton_class_of(&self, container: &Arc<Module>) -> Arc<Module> {
        container.singleton_class()
    }
}
