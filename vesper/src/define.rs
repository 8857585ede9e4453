use std::sync::Arc;

use crate::{
    BodyKind, CompiledMethodBody, InterpretedMethod, ObjectModel, RuntimeError, Value, Visibility,
};

/// Creates or reopens the class, module or singleton class `body` defines
/// under `container` and returns the body bound to it, ready to be run with
/// the module as `self`.
///
/// `superclass` is only evaluated for class bodies. It yields `None` when
/// the definition names no superclass.
pub fn define_class<M, F>(
    model: &M,
    body: &Arc<CompiledMethodBody>,
    container: &Value,
    superclass: F,
) -> Result<Arc<InterpretedMethod>, RuntimeError>
where
    M: ObjectModel + ?Sized,
    F: FnOnce() -> Result<Option<Value>, RuntimeError>,
{
    let container = model
        .as_container(container)
        .ok_or_else(|| RuntimeError::type_error("no outer class/module"))?;

    let module = match body.kind() {
        BodyKind::MetaClassBody => model.singleton_class_of(&container),
        BodyKind::ModuleBody => model.define_or_get_module_under(&container, body.name())?,
        BodyKind::ClassBody => {
            let superclass = match superclass()? {
                Some(value) => Some(model.check_inheritable(&value)?),
                None => None,
            };
            model.define_or_get_class_under(&container, body.name(), superclass)?
        }
        kind => {
            return Err(RuntimeError::Internal(format!(
                "{} is a {kind} body, not a class body",
                body.name()
            )));
        }
    };

    body.static_scope().set_module(module.clone());
    module.bind_body(body.clone());
    Ok(InterpretedMethod::new(body.clone(), Visibility::Public, module))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BodyBuilder, ContextCreateInfo, ExecutionContext, Instr, Module, Operand, Runtime,
        RuntimeCreateInfo, TempKind,
    };
    use std::{
        cell::Cell,
        sync::{Barrier, atomic::{AtomicUsize, Ordering}},
        thread,
    };

    fn runtime() -> Arc<Runtime> {
        Runtime::new(RuntimeCreateInfo::default())
    }

    fn body(kind: BodyKind, name: &str) -> Arc<CompiledMethodBody> {
        BodyBuilder::new(kind, name)
            .file("shapes.rb")
            .build()
            .expect("body")
    }

    fn object(rt: &Runtime) -> Value {
        Value::Module(rt.core().object.clone())
    }

    fn no_superclass() -> Result<Option<Value>, RuntimeError> {
        Ok(None)
    }

    #[test]
    fn defining_twice_reopens_the_same_class() {
        let rt = runtime();
        let shape = body(BodyKind::ClassBody, "Shape");
        let first = define_class(&*rt, &shape, &object(&rt), no_superclass).expect("define");
        let second = define_class(&*rt, &shape, &object(&rt), || Ok(Some(object(&rt))))
            .expect("reopen");

        assert!(Arc::ptr_eq(first.module(), second.module()));
        assert_eq!(first.visibility(), Visibility::Public);
        assert!(Arc::ptr_eq(first.body(), &shape));
        let bound = shape.static_scope().module().expect("bound");
        assert!(Arc::ptr_eq(&bound, first.module()));
        assert!(first.module().body().is_some_and(|b| Arc::ptr_eq(&b, &shape)));
        let superclass = first.module().superclass().expect("superclass");
        assert!(Arc::ptr_eq(superclass, &rt.core().object));
    }

    #[test]
    fn reopening_with_another_superclass_fails() {
        let rt = runtime();
        let shape = body(BodyKind::ClassBody, "Shape");
        define_class(&*rt, &shape, &object(&rt), no_superclass).expect("define");
        let string = Value::Module(rt.core().string.clone());
        let err = define_class(&*rt, &shape, &object(&rt), || Ok(Some(string)))
            .expect_err("mismatch");
        assert_eq!(err.to_string(), "TypeError: superclass mismatch for class Shape");
    }

    #[test]
    fn metaclass_body_ignores_the_superclass() {
        let rt = runtime();
        let meta = body(BodyKind::MetaClassBody, "singleton");
        let evaluated = Cell::new(false);
        let superclass = || {
            evaluated.set(true);
            Ok(Some(Value::Fixnum(1)))
        };

        let first = define_class(&*rt, &meta, &object(&rt), superclass).expect("meta");
        let second = define_class(&*rt, &meta, &object(&rt), no_superclass).expect("meta again");

        assert!(!evaluated.get());
        assert!(first.module().is_singleton());
        assert!(Arc::ptr_eq(first.module(), second.module()));
        assert!(Arc::ptr_eq(first.module(), &rt.core().object.singleton_class()));
    }

    #[test]
    fn container_must_be_a_module() {
        let rt = runtime();
        let point = body(BodyKind::ClassBody, "Point");
        let err = define_class(&*rt, &point, &Value::Fixnum(5), || {
            panic!("superclass evaluated before the container check")
        })
        .expect_err("no container");
        assert_eq!(err.message(), "no outer class/module");
        assert!(rt.core().object.constant("Point").is_none());
        assert!(point.static_scope().module().is_none());
    }

    #[test]
    fn superclass_must_be_an_inheritable_class() {
        let rt = runtime();
        let point = body(BodyKind::ClassBody, "Point");
        let err = define_class(&*rt, &point, &object(&rt), || Ok(Some(Value::Fixnum(3))))
            .expect_err("not a class");
        assert_eq!(err.message(), "superclass must be a Class (Integer given)");

        let class = Value::Module(rt.core().class.clone());
        let err = define_class(&*rt, &point, &object(&rt), || Ok(Some(class)))
            .expect_err("final");
        assert_eq!(err.message(), "can't make subclass of Class");
        assert!(rt.core().object.constant("Point").is_none());
    }

    #[test]
    fn modules_are_nested_under_their_container() {
        let rt = runtime();
        let geometry = body(BodyKind::ModuleBody, "Geometry");
        let method = define_class(&*rt, &geometry, &object(&rt), no_superclass).expect("module");
        let module = method.module().clone();
        assert!(!module.is_class());

        let point = body(BodyKind::ClassBody, "Point");
        let container = Value::Module(module.clone());
        let class = define_class(&*rt, &point, &container, no_superclass).expect("class");
        assert_eq!(class.module().name(), "Geometry::Point");

        let err = define_class(&*rt, &body(BodyKind::ClassBody, "Geometry"), &object(&rt), no_superclass)
            .expect_err("module is not a class");
        assert_eq!(err.message(), "Geometry is not a class");
    }

    #[test]
    fn method_bodies_cannot_define_classes() {
        let rt = runtime();
        let err = define_class(&*rt, &body(BodyKind::Method, "area"), &object(&rt), no_superclass)
            .expect_err("wrong kind");
        assert!(matches!(err, RuntimeError::Internal(_)));
    }

    #[test]
    fn parallel_definitions_yield_one_class() {
        const THREADS: usize = 8;
        let rt = runtime();
        let worker = body(BodyKind::ClassBody, "Worker");
        let barrier = Arc::new(Barrier::new(THREADS));
        let superclass_reads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let rt = rt.clone();
                let worker = worker.clone();
                let barrier = barrier.clone();
                let superclass_reads = superclass_reads.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let container = Value::Module(rt.core().object.clone());
                    define_class(&*rt, &worker, &container, || {
                        superclass_reads.fetch_add(1, Ordering::Relaxed);
                        Ok(None)
                    })
                    .map(|method| method.module().clone())
                })
            })
            .collect();

        let classes: Vec<Arc<Module>> = handles
            .into_iter()
            .map(|h| h.join().expect("thread").expect("define"))
            .collect();
        assert!(classes.iter().all(|c| Arc::ptr_eq(c, &classes[0])));
        assert_eq!(superclass_reads.load(Ordering::Relaxed), THREADS);
    }

    /// class Counter; def self.start = 10; end; Counter.start
    #[test]
    fn class_bodies_run_through_the_interpreter() {
        let rt = runtime();
        let mut ctx = ExecutionContext::new(rt.clone(), ContextCreateInfo::default());

        let mut start = BodyBuilder::new(BodyKind::Method, "start");
        start.push(Instr::Return {
            value: Operand::Fixnum(10),
        });
        let mut meta = BodyBuilder::new(BodyKind::MetaClassBody, "singleton");
        meta.push(Instr::define_method("start", start.build().expect("start")));
        let meta = meta.build().expect("meta");

        let mut class = BodyBuilder::new(BodyKind::ClassBody, "Counter");
        let meta_method = class.temp(TempKind::Generic);
        let ignored = class.temp(TempKind::Generic);
        class.push(Instr::define_class(
            meta_method.clone(),
            meta,
            Operand::SelfValue,
            Some(Operand::Fixnum(99)),
        ));
        class.push(Instr::ProcessModuleBody {
            result: ignored,
            method: meta_method.into(),
        });
        let class = class.build().expect("class");

        let mut script = BodyBuilder::new(BodyKind::Script, "<main>");
        let method = script.temp(TempKind::Generic);
        let ignored = script.temp(TempKind::Generic);
        let counter = script.temp(TempKind::Generic);
        let result = script.temp(TempKind::Generic);
        script.push(Instr::define_class(
            method.clone(),
            class,
            Operand::ScopeModule,
            None,
        ));
        script.push(Instr::ProcessModuleBody {
            result: ignored,
            method: method.into(),
        });
        script.push(Instr::SearchConst {
            result: counter.clone(),
            name: "Counter".into(),
        });
        script.push(Instr::call(
            result.clone(),
            counter.into(),
            "start",
            Vec::new(),
            None,
        ));
        script.push(Instr::Return {
            value: result.into(),
        });
        let script = script.build().expect("script");

        assert_eq!(ctx.run_script(&script).expect("first run"), Value::Fixnum(10));
        assert_eq!(ctx.run_script(&script).expect("reopened"), Value::Fixnum(10));
        assert!(ctx.stats().is_balanced());

        let counter = rt.core().object.constant("Counter").expect("Counter");
        let counter = counter.as_module().expect("class");
        let singleton = counter.existing_singleton().expect("singleton");
        assert_eq!(singleton.method_names(), vec![Arc::<str>::from("start")]);
    }
}
