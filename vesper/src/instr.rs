use std::{collections::HashMap, fmt, sync::Arc};

use crate::{CloneInfo, CompiledMethodBody, Operand, Variable, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Lt,
    Gt,
    Eq,
}

impl MathOp {
    fn name(self) -> &'static str {
        match self {
            MathOp::Add => "add",
            MathOp::Sub => "sub",
            MathOp::Mul => "mul",
            MathOp::Lt => "lt",
            MathOp::Gt => "gt",
            MathOp::Eq => "eq",
        }
    }
}

/// `Functional` calls have an implicit receiver and may reach private methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Normal,
    Functional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Copy,
    ReceiveArg,
    ReceiveBlock,
    IntMath,
    FloatMath,
    Label,
    Jump,
    BranchFalse,
    Call,
    DefineMethod,
    DefineClass,
    ProcessModuleBody,
    SetVisibility,
    PutConst,
    SearchConst,
    BuildClosure,
    Yield,
    Return,
    NonLocalReturn,
    Raise,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Copy => "copy",
            Operation::ReceiveArg => "recv_arg",
            Operation::ReceiveBlock => "recv_block",
            Operation::IntMath => "int_math",
            Operation::FloatMath => "float_math",
            Operation::Label => "label",
            Operation::Jump => "jump",
            Operation::BranchFalse => "b_false",
            Operation::Call => "call",
            Operation::DefineMethod => "def_method",
            Operation::DefineClass => "def_class",
            Operation::ProcessModuleBody => "process_module_body",
            Operation::SetVisibility => "set_visibility",
            Operation::PutConst => "put_const",
            Operation::SearchConst => "search_const",
            Operation::BuildClosure => "build_closure",
            Operation::Yield => "yield",
            Operation::Return => "return",
            Operation::NonLocalReturn => "nonlocal_return",
            Operation::Raise => "raise",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One IR instruction.
///
/// Result-producing variants carry their result as a plain [`Variable`], so a
/// missing result cannot be constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Copy {
        result: Variable,
        source: Operand,
    },
    ReceiveArg {
        result: Variable,
        index: u32,
    },
    ReceiveBlock {
        result: Variable,
    },
    IntMath {
        result: Variable,
        op: MathOp,
        lhs: Operand,
        rhs: Operand,
    },
    FloatMath {
        result: Variable,
        op: MathOp,
        lhs: Operand,
        rhs: Operand,
    },
    Label {
        label: Label,
    },
    Jump {
        target: Label,
    },
    BranchFalse {
        condition: Operand,
        target: Label,
    },
    Call {
        result: Variable,
        name: Arc<str>,
        receiver: Operand,
        args: Vec<Operand>,
        block: Option<Operand>,
        call_type: CallType,
    },
    DefineMethod {
        name: Arc<str>,
        body: Arc<CompiledMethodBody>,
    },
    DefineClass {
        result: Variable,
        body: Arc<CompiledMethodBody>,
        container: Operand,
        superclass: Operand,
    },
    ProcessModuleBody {
        result: Variable,
        method: Operand,
    },
    SetVisibility {
        visibility: Visibility,
    },
    PutConst {
        container: Operand,
        name: Arc<str>,
        value: Operand,
    },
    SearchConst {
        result: Variable,
        name: Arc<str>,
    },
    BuildClosure {
        result: Variable,
        body: Arc<CompiledMethodBody>,
    },
    Yield {
        result: Variable,
        block: Operand,
        args: Vec<Operand>,
    },
    Return {
        value: Operand,
    },
    NonLocalReturn {
        value: Operand,
    },
    Raise {
        value: Operand,
    },
}

impl Instr {
    pub fn copy(result: Variable, source: impl Into<Operand>) -> Self {
        Instr::Copy {
            result,
            source: source.into(),
        }
    }

    pub fn call(
        result: Variable,
        receiver: Operand,
        name: &str,
        args: Vec<Operand>,
        block: Option<Operand>,
    ) -> Self {
        let call_type = match receiver {
            Operand::SelfValue => CallType::Functional,
            _ => CallType::Normal,
        };
        Instr::Call {
            result,
            name: name.into(),
            receiver,
            args,
            block,
            call_type,
        }
    }

    /// `superclass` of `None` is stored as [`Operand::Undefined`].
    pub fn define_class(
        result: Variable,
        body: Arc<CompiledMethodBody>,
        container: Operand,
        superclass: Option<Operand>,
    ) -> Self {
        Instr::DefineClass {
            result,
            body,
            container,
            superclass: superclass.unwrap_or(Operand::Undefined),
        }
    }

    pub fn define_method(name: &str, body: Arc<CompiledMethodBody>) -> Self {
        Instr::DefineMethod {
            name: name.into(),
            body,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Instr::Copy { .. } => Operation::Copy,
            Instr::ReceiveArg { .. } => Operation::ReceiveArg,
            Instr::ReceiveBlock { .. } => Operation::ReceiveBlock,
            Instr::IntMath { .. } => Operation::IntMath,
            Instr::FloatMath { .. } => Operation::FloatMath,
            Instr::Label { .. } => Operation::Label,
            Instr::Jump { .. } => Operation::Jump,
            Instr::BranchFalse { .. } => Operation::BranchFalse,
            Instr::Call { .. } => Operation::Call,
            Instr::DefineMethod { .. } => Operation::DefineMethod,
            Instr::DefineClass { .. } => Operation::DefineClass,
            Instr::ProcessModuleBody { .. } => Operation::ProcessModuleBody,
            Instr::SetVisibility { .. } => Operation::SetVisibility,
            Instr::PutConst { .. } => Operation::PutConst,
            Instr::SearchConst { .. } => Operation::SearchConst,
            Instr::BuildClosure { .. } => Operation::BuildClosure,
            Instr::Yield { .. } => Operation::Yield,
            Instr::Return { .. } => Operation::Return,
            Instr::NonLocalReturn { .. } => Operation::NonLocalReturn,
            Instr::Raise { .. } => Operation::Raise,
        }
    }

    /// Operands in a fixed per-opcode order.
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Instr::Copy { source, .. } => vec![source.clone()],
            Instr::IntMath { lhs, rhs, .. } | Instr::FloatMath { lhs, rhs, .. } => {
                vec![lhs.clone(), rhs.clone()]
            }
            Instr::BranchFalse { condition, .. } => vec![condition.clone()],
            Instr::Call {
                receiver,
                args,
                block,
                ..
            } => {
                let mut operands = Vec::with_capacity(args.len() + 2);
                operands.push(receiver.clone());
                operands.extend(args.iter().cloned());
                operands.extend(block.iter().cloned());
                operands
            }
            Instr::DefineMethod { body, .. } | Instr::BuildClosure { body, .. } => {
                vec![Operand::Body(body.clone())]
            }
            Instr::DefineClass {
                container,
                superclass,
                ..
            } => vec![container.clone(), superclass.clone()],
            Instr::ProcessModuleBody { method, .. } => vec![method.clone()],
            Instr::PutConst {
                container, value, ..
            } => vec![container.clone(), value.clone()],
            Instr::Yield { block, args, .. } => {
                let mut operands = Vec::with_capacity(args.len() + 1);
                operands.push(block.clone());
                operands.extend(args.iter().cloned());
                operands
            }
            Instr::Return { value }
            | Instr::NonLocalReturn { value }
            | Instr::Raise { value } => vec![value.clone()],
            Instr::ReceiveArg { .. }
            | Instr::ReceiveBlock { .. }
            | Instr::Label { .. }
            | Instr::Jump { .. }
            | Instr::SetVisibility { .. }
            | Instr::SearchConst { .. } => Vec::new(),
        }
    }

    pub fn result(&self) -> Option<&Variable> {
        match self {
            Instr::Copy { result, .. }
            | Instr::ReceiveArg { result, .. }
            | Instr::ReceiveBlock { result }
            | Instr::IntMath { result, .. }
            | Instr::FloatMath { result, .. }
            | Instr::Call { result, .. }
            | Instr::DefineClass { result, .. }
            | Instr::ProcessModuleBody { result, .. }
            | Instr::SearchConst { result, .. }
            | Instr::BuildClosure { result, .. }
            | Instr::Yield { result, .. } => Some(result),
            _ => None,
        }
    }

    fn result_mut(&mut self) -> Option<&mut Variable> {
        match self {
            Instr::Copy { result, .. }
            | Instr::ReceiveArg { result, .. }
            | Instr::ReceiveBlock { result }
            | Instr::IntMath { result, .. }
            | Instr::FloatMath { result, .. }
            | Instr::Call { result, .. }
            | Instr::DefineClass { result, .. }
            | Instr::ProcessModuleBody { result, .. }
            | Instr::SearchConst { result, .. }
            | Instr::BuildClosure { result, .. }
            | Instr::Yield { result, .. } => Some(result),
            _ => None,
        }
    }

    /// # Panics
    /// When the instruction does not produce a result.
    pub fn update_result(&mut self, var: Variable) {
        let operation = self.operation();
        match self.result_mut() {
            Some(result) => *result = var,
            None => panic!("{operation} does not produce a result"),
        }
    }

    pub fn simplify_operands(&mut self, values: &HashMap<Variable, Operand>, force: bool) {
        let simplify = |operand: &mut Operand| *operand = operand.simplified(values, force);
        match self {
            Instr::Copy { source, .. } => simplify(source),
            Instr::IntMath { lhs, rhs, .. } | Instr::FloatMath { lhs, rhs, .. } => {
                simplify(lhs);
                simplify(rhs);
            }
            Instr::BranchFalse { condition, .. } => simplify(condition),
            Instr::Call {
                receiver,
                args,
                block,
                ..
            } => {
                simplify(receiver);
                args.iter_mut().for_each(simplify);
                block.iter_mut().for_each(simplify);
            }
            Instr::DefineClass {
                container,
                superclass,
                ..
            } => {
                simplify(container);
                simplify(superclass);
            }
            Instr::ProcessModuleBody { method, .. } => simplify(method),
            Instr::PutConst {
                container, value, ..
            } => {
                simplify(container);
                simplify(value);
            }
            Instr::Yield { block, args, .. } => {
                simplify(block);
                args.iter_mut().for_each(simplify);
            }
            Instr::Return { value }
            | Instr::NonLocalReturn { value }
            | Instr::Raise { value } => simplify(value),
            Instr::ReceiveArg { .. }
            | Instr::ReceiveBlock { .. }
            | Instr::Label { .. }
            | Instr::Jump { .. }
            | Instr::DefineMethod { .. }
            | Instr::SetVisibility { .. }
            | Instr::SearchConst { .. }
            | Instr::BuildClosure { .. } => {}
        }
    }

    /// Deep clone with every variable and label renamed through `info`.
    /// Compiled bodies are shared with the original.
    pub fn clone_for_inlining(&self, info: &mut CloneInfo) -> Instr {
        match self {
            Instr::Copy { result, source } => Instr::Copy {
                result: info.renamed_variable(result),
                source: source.clone_for_inlining(info),
            },
            Instr::ReceiveArg { result, index } => Instr::ReceiveArg {
                result: info.renamed_variable(result),
                index: *index,
            },
            Instr::ReceiveBlock { result } => Instr::ReceiveBlock {
                result: info.renamed_variable(result),
            },
            Instr::IntMath {
                result,
                op,
                lhs,
                rhs,
            } => Instr::IntMath {
                result: info.renamed_variable(result),
                op: *op,
                lhs: lhs.clone_for_inlining(info),
                rhs: rhs.clone_for_inlining(info),
            },
            Instr::FloatMath {
                result,
                op,
                lhs,
                rhs,
            } => Instr::FloatMath {
                result: info.renamed_variable(result),
                op: *op,
                lhs: lhs.clone_for_inlining(info),
                rhs: rhs.clone_for_inlining(info),
            },
            Instr::Label { label } => Instr::Label {
                label: info.renamed_label(*label),
            },
            Instr::Jump { target } => Instr::Jump {
                target: info.renamed_label(*target),
            },
            Instr::BranchFalse { condition, target } => Instr::BranchFalse {
                condition: condition.clone_for_inlining(info),
                target: info.renamed_label(*target),
            },
            Instr::Call {
                result,
                name,
                receiver,
                args,
                block,
                call_type,
            } => Instr::Call {
                result: info.renamed_variable(result),
                name: name.clone(),
                receiver: receiver.clone_for_inlining(info),
                args: args.iter().map(|arg| arg.clone_for_inlining(info)).collect(),
                block: block.as_ref().map(|block| block.clone_for_inlining(info)),
                call_type: *call_type,
            },
            Instr::DefineMethod { name, body } => Instr::DefineMethod {
                name: name.clone(),
                body: body.clone(),
            },
            Instr::DefineClass {
                result,
                body,
                container,
                superclass,
            } => Instr::DefineClass {
                result: info.renamed_variable(result),
                body: body.clone(),
                container: container.clone_for_inlining(info),
                superclass: superclass.clone_for_inlining(info),
            },
            Instr::ProcessModuleBody { result, method } => Instr::ProcessModuleBody {
                result: info.renamed_variable(result),
                method: method.clone_for_inlining(info),
            },
            Instr::SetVisibility { visibility } => Instr::SetVisibility {
                visibility: *visibility,
            },
            Instr::PutConst {
                container,
                name,
                value,
            } => Instr::PutConst {
                container: container.clone_for_inlining(info),
                name: name.clone(),
                value: value.clone_for_inlining(info),
            },
            Instr::SearchConst { result, name } => Instr::SearchConst {
                result: info.renamed_variable(result),
                name: name.clone(),
            },
            Instr::BuildClosure { result, body } => Instr::BuildClosure {
                result: info.renamed_variable(result),
                body: body.clone(),
            },
            Instr::Yield {
                result,
                block,
                args,
            } => Instr::Yield {
                result: info.renamed_variable(result),
                block: block.clone_for_inlining(info),
                args: args.iter().map(|arg| arg.clone_for_inlining(info)).collect(),
            },
            Instr::Return { value } => Instr::Return {
                value: value.clone_for_inlining(info),
            },
            Instr::NonLocalReturn { value } => Instr::NonLocalReturn {
                value: value.clone_for_inlining(info),
            },
            Instr::Raise { value } => Instr::Raise {
                value: value.clone_for_inlining(info),
            },
        }
    }

    /// Every variable read or written, result first.
    pub fn used_variables(&self) -> Vec<Variable> {
        let mut used = Vec::new();
        if let Some(result) = self.result() {
            used.push(result.clone());
        }
        for operand in self.operands() {
            if !matches!(operand, Operand::Body(_)) {
                operand.add_used_variables(&mut used);
            }
        }
        used
    }

    pub fn visit<V: InstrVisitor + ?Sized>(&self, visitor: &mut V) {
        match self {
            Instr::Copy { result, source } => visitor.copy(result, source),
            Instr::ReceiveArg { result, index } => visitor.receive_arg(result, *index),
            Instr::ReceiveBlock { result } => visitor.receive_block(result),
            Instr::IntMath {
                result,
                op,
                lhs,
                rhs,
            } => visitor.int_math(result, *op, lhs, rhs),
            Instr::FloatMath {
                result,
                op,
                lhs,
                rhs,
            } => visitor.float_math(result, *op, lhs, rhs),
            Instr::Label { label } => visitor.label(*label),
            Instr::Jump { target } => visitor.jump(*target),
            Instr::BranchFalse { condition, target } => visitor.branch_false(condition, *target),
            Instr::Call {
                result,
                name,
                receiver,
                args,
                block,
                call_type,
            } => visitor.call(result, name, receiver, args, block.as_ref(), *call_type),
            Instr::DefineMethod { name, body } => visitor.define_method(name, body),
            Instr::DefineClass {
                result,
                body,
                container,
                superclass,
            } => visitor.define_class(result, body, container, superclass),
            Instr::ProcessModuleBody { result, method } => {
                visitor.process_module_body(result, method)
            }
            Instr::SetVisibility { visibility } => visitor.set_visibility(*visibility),
            Instr::PutConst {
                container,
                name,
                value,
            } => visitor.put_const(container, name, value),
            Instr::SearchConst { result, name } => visitor.search_const(result, name),
            Instr::BuildClosure { result, body } => visitor.build_closure(result, body),
            Instr::Yield {
                result,
                block,
                args,
            } => visitor.yield_(result, block, args),
            Instr::Return { value } => visitor.return_(value),
            Instr::NonLocalReturn { value } => visitor.nonlocal_return(value),
            Instr::Raise { value } => visitor.raise(value),
        }
    }
}

/// Per-opcode callbacks for passes that walk instructions without matching
/// on [`Instr`] themselves. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait InstrVisitor {
    fn copy(&mut self, result: &Variable, source: &Operand) {}
    fn receive_arg(&mut self, result: &Variable, index: u32) {}
    fn receive_block(&mut self, result: &Variable) {}
    fn int_math(&mut self, result: &Variable, op: MathOp, lhs: &Operand, rhs: &Operand) {}
    fn float_math(&mut self, result: &Variable, op: MathOp, lhs: &Operand, rhs: &Operand) {}
    fn label(&mut self, label: Label) {}
    fn jump(&mut self, target: Label) {}
    fn branch_false(&mut self, condition: &Operand, target: Label) {}
    fn call(
        &mut self,
        result: &Variable,
        name: &str,
        receiver: &Operand,
        args: &[Operand],
        block: Option<&Operand>,
        call_type: CallType,
    ) {
    }
    fn define_method(&mut self, name: &str, body: &Arc<CompiledMethodBody>) {}
    fn define_class(
        &mut self,
        result: &Variable,
        body: &Arc<CompiledMethodBody>,
        container: &Operand,
        superclass: &Operand,
    ) {
    }
    fn process_module_body(&mut self, result: &Variable, method: &Operand) {}
    fn set_visibility(&mut self, visibility: Visibility) {}
    fn put_const(&mut self, container: &Operand, name: &str, value: &Operand) {}
    fn search_const(&mut self, result: &Variable, name: &str) {}
    fn build_closure(&mut self, result: &Variable, body: &Arc<CompiledMethodBody>) {}
    fn yield_(&mut self, result: &Variable, block: &Operand, args: &[Operand]) {}
    fn return_(&mut self, value: &Operand) {}
    fn nonlocal_return(&mut self, value: &Operand) {}
    fn raise(&mut self, value: &Operand) {}
}

fn write_list(f: &mut fmt::Formatter<'_>, operands: &[Operand]) -> fmt::Result {
    write!(f, "[")?;
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{operand}")?;
    }
    write!(f, "]")
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result() {
            write!(f, "{result} = ")?;
        }
        let op = self.operation();
        match self {
            Instr::Copy { source, .. } => write!(f, "{op}({source})"),
            Instr::ReceiveArg { index, .. } => write!(f, "{op}({index})"),
            Instr::ReceiveBlock { .. } => write!(f, "{op}"),
            Instr::IntMath {
                op: math, lhs, rhs, ..
            }
            | Instr::FloatMath {
                op: math, lhs, rhs, ..
            } => write!(f, "{op}({}, {lhs}, {rhs})", math.name()),
            Instr::Label { label } => write!(f, "{label}:"),
            Instr::Jump { target } => write!(f, "{op}({target})"),
            Instr::BranchFalse { condition, target } => write!(f, "{op}({condition}, {target})"),
            Instr::Call {
                name,
                receiver,
                args,
                block,
                call_type,
                ..
            } => {
                let op = match call_type {
                    CallType::Normal => "call",
                    CallType::Functional => "fcall",
                };
                write!(f, "{op}({name}, {receiver}, ")?;
                write_list(f, args)?;
                if let Some(block) = block {
                    write!(f, ", &{block}")?;
                }
                write!(f, ")")
            }
            Instr::DefineMethod { name, body } => write!(f, "{op}({name}, <body {}>)", body.name()),
            Instr::DefineClass {
                body,
                container,
                superclass,
                ..
            } => write!(
                f,
                "{op}({}, {container}, {superclass}, {})",
                body.name(),
                body.file()
            ),
            Instr::ProcessModuleBody { method, .. } => write!(f, "{op}({method})"),
            Instr::SetVisibility { visibility } => write!(f, "{op}({visibility})"),
            Instr::PutConst {
                container,
                name,
                value,
            } => write!(f, "{op}({container}, {name}, {value})"),
            Instr::SearchConst { name, .. } => write!(f, "{op}({name})"),
            Instr::BuildClosure { body, .. } => write!(f, "{op}(<body {}>)", body.name()),
            Instr::Yield { block, args, .. } => {
                write!(f, "{op}({block}, ")?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Instr::Return { value }
            | Instr::NonLocalReturn { value }
            | Instr::Raise { value } => write!(f, "{op}({value})"),
        }
    }
}
