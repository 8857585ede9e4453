use std::{collections::HashMap, fmt, sync::Arc};

use crate::{CloneInfo, CompiledMethodBody};

/// The four kinds of temporary slots a compiled body sizes separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TempKind {
    Generic,
    Boolean,
    Fixnum,
    Float,
}

impl TempKind {
    pub const ALL: [TempKind; 4] = [
        TempKind::Generic,
        TempKind::Boolean,
        TempKind::Fixnum,
        TempKind::Float,
    ];

    fn prefix(self) -> &'static str {
        match self {
            TempKind::Generic => "v",
            TempKind::Boolean => "b",
            TempKind::Fixnum => "i",
            TempKind::Float => "f",
        }
    }
}

/// Slot counts per [`TempKind`], computed by the compiler for one body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TempCounts {
    pub generic: usize,
    pub boolean: usize,
    pub fixnum: usize,
    pub float: usize,
}

impl TempCounts {
    pub fn get(&self, kind: TempKind) -> usize {
        match kind {
            TempKind::Generic => self.generic,
            TempKind::Boolean => self.boolean,
            TempKind::Fixnum => self.fixnum,
            TempKind::Float => self.float,
        }
    }

    fn get_mut(&mut self, kind: TempKind) -> &mut usize {
        match kind {
            TempKind::Generic => &mut self.generic,
            TempKind::Boolean => &mut self.boolean,
            TempKind::Fixnum => &mut self.fixnum,
            TempKind::Float => &mut self.float,
        }
    }

    /// Hands out the next free index of `kind`.
    pub fn allocate(&mut self, kind: TempKind) -> u32 {
        let slot = self.get_mut(kind);
        let index = *slot as u32;
        *slot += 1;
        index
    }

    /// Grows the count of `kind` so that `index` fits.
    pub fn cover(&mut self, kind: TempKind, index: u32) {
        let slot = self.get_mut(kind);
        *slot = (*slot).max(index as usize + 1);
    }

    pub fn covers(&self, other: &TempCounts) -> bool {
        TempKind::ALL
            .iter()
            .all(|&kind| self.get(kind) >= other.get(kind))
    }
}

/// A writable location: a typed temporary or a lexical local.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Variable {
    Temp { kind: TempKind, index: u32 },
    /// `depth` counts lexical-enclosure hops from the current scope.
    Local { name: Arc<str>, depth: u32, offset: u32 },
}

impl Variable {
    pub fn temp(index: u32) -> Self {
        Variable::Temp {
            kind: TempKind::Generic,
            index,
        }
    }

    pub fn typed_temp(kind: TempKind, index: u32) -> Self {
        Variable::Temp { kind, index }
    }

    pub fn local(name: &str, depth: u32, offset: u32) -> Self {
        Variable::Local {
            name: name.into(),
            depth,
            offset,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Variable::Temp { .. })
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Temp { kind, index } => write!(f, "%{}_{index}", kind.prefix()),
            Variable::Local {
                name,
                depth,
                offset,
            } => write!(f, "{name}({depth}:{offset})"),
        }
    }
}

/// An instruction operand.
#[derive(Debug, Clone)]
pub enum Operand {
    Var(Variable),
    SelfValue,
    Nil,
    Bool(bool),
    Fixnum(i64),
    Float(f64),
    Str(Arc<str>),
    Symbol(Arc<str>),
    Array(Vec<Operand>),
    /// The module the executing body is lexically bound to.
    ScopeModule,
    /// Marks an absent optional operand, e.g. a missing superclass.
    Undefined,
    /// Handle to a compiled body. Shared, never cloned for inlining.
    Body(Arc<CompiledMethodBody>),
}

impl Operand {
    pub fn str(value: &str) -> Self {
        Operand::Str(value.into())
    }

    pub fn symbol(value: &str) -> Self {
        Operand::Symbol(value.into())
    }

    pub fn is_constant(&self) -> bool {
        match self {
            Operand::Nil
            | Operand::Bool(_)
            | Operand::Fixnum(_)
            | Operand::Float(_)
            | Operand::Str(_)
            | Operand::Symbol(_) => true,
            Operand::Array(elements) => elements.iter().all(Operand::is_constant),
            _ => false,
        }
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Operand::Var(var) => Some(var),
            _ => None,
        }
    }

    /// Substitutes variables found in `values`. Constants always replace a
    /// variable, other operands only when `force` is set.
    pub fn simplified(&self, values: &HashMap<Variable, Operand>, force: bool) -> Operand {
        match self {
            Operand::Var(var) => match values.get(var) {
                Some(value) if force || value.is_constant() => value.clone(),
                _ => self.clone(),
            },
            Operand::Array(elements) => Operand::Array(
                elements
                    .iter()
                    .map(|element| element.simplified(values, force))
                    .collect(),
            ),
            _ => self.clone(),
        }
    }

    /// # Panics
    /// Body handles are shared between clones and must never reach here.
    pub fn clone_for_inlining(&self, info: &mut CloneInfo) -> Operand {
        match self {
            Operand::Var(var) => Operand::Var(info.renamed_variable(var)),
            Operand::Array(elements) => Operand::Array(
                elements
                    .iter()
                    .map(|element| element.clone_for_inlining(info))
                    .collect(),
            ),
            Operand::Body(body) => {
                panic!("compiled body {} cannot be cloned for inlining", body.name())
            }
            _ => self.clone(),
        }
    }

    pub fn add_used_variables(&self, used: &mut Vec<Variable>) {
        match self {
            Operand::Var(var) => used.push(var.clone()),
            Operand::Array(elements) => {
                elements.iter().for_each(|e| e.add_used_variables(used))
            }
            _ => {}
        }
    }
}

impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Operand::Var(a), Operand::Var(b)) => a == b,
            (Operand::SelfValue, Operand::SelfValue) => true,
            (Operand::Nil, Operand::Nil) => true,
            (Operand::Bool(a), Operand::Bool(b)) => a == b,
            (Operand::Fixnum(a), Operand::Fixnum(b)) => a == b,
            (Operand::Float(a), Operand::Float(b)) => a.to_bits() == b.to_bits(),
            (Operand::Str(a), Operand::Str(b)) => a == b,
            (Operand::Symbol(a), Operand::Symbol(b)) => a == b,
            (Operand::Array(a), Operand::Array(b)) => a == b,
            (Operand::ScopeModule, Operand::ScopeModule) => true,
            (Operand::Undefined, Operand::Undefined) => true,
            (Operand::Body(a), Operand::Body(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Variable> for Operand {
    fn from(var: Variable) -> Self {
        Operand::Var(var)
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Fixnum(value)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(var) => write!(f, "{var}"),
            Operand::SelfValue => write!(f, "self"),
            Operand::Nil => write!(f, "nil"),
            Operand::Bool(value) => write!(f, "{value}"),
            Operand::Fixnum(value) => write!(f, "{value}"),
            Operand::Float(value) => write!(f, "{value:?}"),
            Operand::Str(value) => write!(f, "{value:?}"),
            Operand::Symbol(value) => write!(f, ":{value}"),
            Operand::Array(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "]")
            }
            Operand::ScopeModule => write!(f, "<module>"),
            Operand::Undefined => write!(f, "undefined"),
            Operand::Body(body) => write!(f, "<body {}>", body.name()),
        }
    }
}
