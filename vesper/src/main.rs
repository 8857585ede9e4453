use clap::{Parser as ClapParser, ValueEnum};
use std::{process, sync::Arc, thread};

use thiserror::Error;
use vesper::{
    BodyBuilder, BodyKind, CompiledMethodBody, ContextCreateInfo, ExecutionContext, Instr,
    IrError, Operand, Runtime, RuntimeCreateInfo, RuntimeError, TempKind, Value, passes,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Demo {
    Reopen,
    NonlocalReturn,
    Singleton,
    Threads,
    All,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Demo program to run
    #[arg(long, value_enum, default_value_t = Demo::All)]
    demo: Demo,

    /// Print the disassembly of every body before running it
    #[arg(long, help = "Dump IR of the demo bodies")]
    dump: bool,

    /// Threads used by the threads demo
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Log every interpreted instruction
    #[arg(long)]
    trace: bool,

    /// Frames allowed per thread
    #[arg(long, default_value_t = RuntimeCreateInfo::default().max_call_depth)]
    max_call_depth: usize,
}

#[derive(Debug, Error)]
enum DemoError {
    #[error("invalid IR: {0}")]
    Ir(#[from] IrError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("worker thread panicked")]
    ThreadPanicked,
    #[error("{0}")]
    Unexpected(String),
}

fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if cli.trace {
        logger.filter_level(log::LevelFilter::Trace);
    }
    logger.init();

    let runtime = Runtime::new(RuntimeCreateInfo {
        max_call_depth: cli.max_call_depth,
    });

    let demos: &[Demo] = match cli.demo {
        Demo::All => &[
            Demo::Reopen,
            Demo::NonlocalReturn,
            Demo::Singleton,
            Demo::Threads,
        ],
        ref demo => std::slice::from_ref(demo),
    };

    for &demo in demos {
        println!("== {demo:?} ==");
        let result = match demo {
            Demo::Reopen => reopen(&runtime, &cli),
            Demo::NonlocalReturn => nonlocal_return(&runtime, &cli),
            Demo::Singleton => singleton(&runtime, &cli),
            Demo::Threads => threads(&runtime, &cli),
            Demo::All => Ok(()),
        };
        if let Err(err) = result {
            eprintln!("Error in {demo:?} demo: {err}");
            process::exit(1);
        }
    }
}

fn new_context(runtime: &Arc<Runtime>) -> ExecutionContext {
    ExecutionContext::new(runtime.clone(), ContextCreateInfo::default())
}

fn dump(cli: &Cli, body: &Arc<CompiledMethodBody>) {
    if !cli.dump {
        return;
    }
    print!("{}", body.disassemble());
    for nested in passes::nested_bodies(body) {
        print!("{}", nested.disassemble());
    }
}

fn run(
    cli: &Cli,
    ctx: &mut ExecutionContext,
    script: &Arc<CompiledMethodBody>,
) -> Result<Value, DemoError> {
    dump(cli, script);
    let value = ctx.run_script(script)?;
    println!("=> {value}    [{}]", ctx.stats());
    Ok(value)
}

/// A method body returning a constant.
fn constant_method(name: &str, value: Operand) -> Result<Arc<CompiledMethodBody>, IrError> {
    let mut b = BodyBuilder::new(BodyKind::Method, name).file("demo.rb");
    b.push(Instr::Return { value });
    b.build()
}

/// `class <name> [< superclass]; def <method> = <value>; end; <name>`
fn class_script(
    name: &str,
    superclass: Option<&str>,
    method: &str,
    value: Operand,
) -> Result<Arc<CompiledMethodBody>, IrError> {
    let mut class = BodyBuilder::new(BodyKind::ClassBody, name).file("demo.rb");
    class.push(Instr::define_method(method, constant_method(method, value)?));
    let class = class.build()?;

    let mut script = BodyBuilder::new(BodyKind::Script, "<main>").file("demo.rb");
    let superclass = superclass.map(|superclass| {
        let var = script.temp(TempKind::Generic);
        script.push(Instr::SearchConst {
            result: var.clone(),
            name: superclass.into(),
        });
        Operand::from(var)
    });
    let method = script.temp(TempKind::Generic);
    let ignored = script.temp(TempKind::Generic);
    let result = script.temp(TempKind::Generic);
    script.push(Instr::define_class(
        method.clone(),
        class,
        Operand::ScopeModule,
        superclass,
    ));
    script.push(Instr::ProcessModuleBody {
        result: ignored,
        method: method.into(),
    });
    script.push(Instr::SearchConst {
        result: result.clone(),
        name: name.into(),
    });
    script.push(Instr::Return {
        value: result.into(),
    });
    script.build()
}

fn reopen(runtime: &Arc<Runtime>, cli: &Cli) -> Result<(), DemoError> {
    let mut ctx = new_context(runtime);
    let shape = class_script("Shape", None, "sides", Operand::Fixnum(0))?;
    let square = class_script("Square", Some("Shape"), "sides", Operand::Fixnum(4))?;
    let reopened = class_script("Square", None, "corners", Operand::Fixnum(4))?;

    run(cli, &mut ctx, &shape)?;
    let first = run(cli, &mut ctx, &square)?;
    let second = run(cli, &mut ctx, &reopened)?;
    println!("same class after reopen: {}", first.identical(&second));

    let object = ctx.runtime().new_object(
        second
            .as_module()
            .ok_or_else(|| DemoError::Unexpected(format!("{second} is not a class")))?,
    );
    let sides = ctx.send(object.clone(), "sides", &[])?;
    let corners = ctx.send(object, "corners", &[])?;
    println!("Square#sides => {sides}, Square#corners => {corners}");

    let mismatch = class_script("Square", Some("Object"), "sides", Operand::Fixnum(4))?;
    match ctx.run_script(&mismatch) {
        Err(err) => println!("reopen with another superclass: {err}"),
        Ok(value) => return Err(DemoError::Unexpected(format!("{value} was reopened"))),
    }
    Ok(())
}

/// `def yielder = yield` and `def finder = yielder { return :found }; :not_found`
fn nonlocal_return(runtime: &Arc<Runtime>, cli: &Cli) -> Result<(), DemoError> {
    let mut yielder = BodyBuilder::new(BodyKind::Method, "yielder").file("demo.rb");
    let block = yielder.temp(TempKind::Generic);
    let ignored = yielder.temp(TempKind::Generic);
    yielder.push(Instr::ReceiveBlock {
        result: block.clone(),
    });
    yielder.push(Instr::Yield {
        result: ignored,
        block: block.into(),
        args: Vec::new(),
    });
    yielder.push(Instr::Return {
        value: Operand::symbol("after_yield"),
    });
    let yielder = yielder.build()?;

    let mut finder = BodyBuilder::new(BodyKind::Method, "finder").file("demo.rb");
    let mut closure = BodyBuilder::new(BodyKind::Closure, "finder_block")
        .file("demo.rb")
        .scope(&[], Some(finder.static_scope()));
    closure.push(Instr::NonLocalReturn {
        value: Operand::symbol("found"),
    });
    let closure = closure.build()?;
    let block = finder.temp(TempKind::Generic);
    let result = finder.temp(TempKind::Generic);
    finder.push(Instr::BuildClosure {
        result: block.clone(),
        body: closure,
    });
    finder.push(Instr::call(
        result,
        Operand::SelfValue,
        "yielder",
        Vec::new(),
        Some(block.into()),
    ));
    finder.push(Instr::Return {
        value: Operand::symbol("not_found"),
    });
    let finder = finder.build()?;

    let mut script = BodyBuilder::new(BodyKind::Script, "<main>").file("demo.rb");
    let result = script.temp(TempKind::Generic);
    script.push(Instr::define_method("yielder", yielder));
    script.push(Instr::define_method("finder", finder));
    script.push(Instr::call(
        result.clone(),
        Operand::SelfValue,
        "finder",
        Vec::new(),
        None,
    ));
    script.push(Instr::Return {
        value: result.into(),
    });
    let script = script.build()?;

    let mut ctx = new_context(runtime);
    run(cli, &mut ctx, &script)?;
    Ok(())
}

/// `class Config; class << self; def name = :config; end; end; Config.name`
fn singleton(runtime: &Arc<Runtime>, cli: &Cli) -> Result<(), DemoError> {
    let mut meta = BodyBuilder::new(BodyKind::MetaClassBody, "singleton").file("demo.rb");
    meta.push(Instr::define_method(
        "name",
        constant_method("name", Operand::symbol("config"))?,
    ));
    let meta = meta.build()?;

    let mut class = BodyBuilder::new(BodyKind::ClassBody, "Config").file("demo.rb");
    let method = class.temp(TempKind::Generic);
    let ignored = class.temp(TempKind::Generic);
    class.push(Instr::define_class(
        method.clone(),
        meta,
        Operand::SelfValue,
        None,
    ));
    class.push(Instr::ProcessModuleBody {
        result: ignored,
        method: method.into(),
    });
    let class = class.build()?;

    let mut script = BodyBuilder::new(BodyKind::Script, "<main>").file("demo.rb");
    let method = script.temp(TempKind::Generic);
    let ignored = script.temp(TempKind::Generic);
    let config = script.temp(TempKind::Generic);
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
        result: config.clone(),
        name: "Config".into(),
    });
    script.push(Instr::call(
        result.clone(),
        config.into(),
        "name",
        Vec::new(),
        None,
    ));
    script.push(Instr::Return {
        value: result.into(),
    });
    let built = script.build()?;
    let script = passes::optimize(&built)?;

    let mut ctx = new_context(runtime);
    run(cli, &mut ctx, &script)?;
    run(cli, &mut ctx, &script)?;
    Ok(())
}

fn threads(runtime: &Arc<Runtime>, cli: &Cli) -> Result<(), DemoError> {
    let script = class_script("Worker", None, "id", Operand::Fixnum(1))?;
    dump(cli, &script);

    let handles: Vec<_> = (0..cli.threads.max(1))
        .map(|_| {
            let runtime = runtime.clone();
            let script = script.clone();
            thread::spawn(move || new_context(&runtime).run_script(&script))
        })
        .collect();

    let mut classes = Vec::with_capacity(handles.len());
    for handle in handles {
        let class = handle.join().map_err(|_| DemoError::ThreadPanicked)??;
        classes.push(class);
    }
    let shared = classes.iter().all(|class| class.identical(&classes[0]));
    println!("{} threads defined Worker, one class: {shared}", classes.len());
    Ok(())
}
