//! Small compiler-side passes over instruction streams.

use std::{collections::HashMap, sync::Arc};

use crate::{CloneInfo, CompiledMethodBody, Instr, InstrVisitor, IrError, Operand, Variable};

/// Forward copy and constant propagation within straight-line runs.
///
/// Only temporaries are tracked: locals can be written by closures. The
/// value map is reset at every label since control can enter there from
/// elsewhere.
pub fn propagate_copies(instructions: &mut [Instr]) {
    let mut values: HashMap<Variable, Operand> = HashMap::new();
    for instr in instructions.iter_mut() {
        if matches!(instr, Instr::Label { .. }) {
            values.clear();
            continue;
        }
        instr.simplify_operands(&values, true);

        if let Some(result) = instr.result().cloned() {
            values.retain(|var, value| {
                *var != result && value.as_variable() != Some(&result)
            });
            if let Instr::Copy { source, .. } = instr {
                if result.is_temp() && (source.is_constant() || is_temp(source)) {
                    values.insert(result, source.clone());
                }
            }
        }
        // calls and yields may run closures that write locals
        if matches!(instr, Instr::Call { .. } | Instr::Yield { .. }) {
            values.retain(|_, value| !matches!(value.as_variable(), Some(Variable::Local { .. })));
        }
    }
}

fn is_temp(operand: &Operand) -> bool {
    operand.as_variable().is_some_and(Variable::is_temp)
}

/// Runs [`propagate_copies`] on a copy of `body`.
pub fn optimize(body: &CompiledMethodBody) -> Result<Arc<CompiledMethodBody>, IrError> {
    let mut instructions = body.instructions().to_vec();
    propagate_copies(&mut instructions);
    body.with_instructions(instructions)
}

/// Clones `instructions` with every variable and label renamed through
/// `info`.
pub fn clone_instructions(instructions: &[Instr], info: &mut CloneInfo) -> Vec<Instr> {
    instructions
        .iter()
        .map(|instr| instr.clone_for_inlining(info))
        .collect()
}

/// Every distinct variable read or written, in first-use order.
pub fn used_variables(instructions: &[Instr]) -> Vec<Variable> {
    let mut seen = Vec::new();
    for var in instructions.iter().flat_map(Instr::used_variables) {
        if !seen.contains(&var) {
            seen.push(var);
        }
    }
    seen
}

/// Collects bodies referenced from an instruction stream.
#[derive(Default)]
struct NestedBodies {
    bodies: Vec<Arc<CompiledMethodBody>>,
}

impl InstrVisitor for NestedBodies {
    fn define_method(&mut self, _name: &str, body: &Arc<CompiledMethodBody>) {
        self.bodies.push(body.clone());
    }

    fn define_class(
        &mut self,
        _result: &Variable,
        body: &Arc<CompiledMethodBody>,
        _container: &Operand,
        _superclass: &Operand,
    ) {
        self.bodies.push(body.clone());
    }

    fn build_closure(&mut self, _result: &Variable, body: &Arc<CompiledMethodBody>) {
        self.bodies.push(body.clone());
    }
}

/// Method, class and closure bodies nested in `body`, depth first.
pub fn nested_bodies(body: &CompiledMethodBody) -> Vec<Arc<CompiledMethodBody>> {
    let mut visitor = NestedBodies::default();
    for instr in body.instructions() {
        instr.visit(&mut visitor);
    }
    let mut all = Vec::new();
    for nested in visitor.bodies {
        let inner = nested_bodies(&nested);
        all.push(nested);
        all.extend(inner);
    }
    all
}
