mod body;
mod clone;
mod context;
mod define;
mod error;
mod instr;
mod interpreter;
mod method;
mod module;
mod operand;
pub mod passes;
mod runtime;
mod scope;
mod value;

pub use body::*;
pub use clone::CloneInfo;
pub use context::*;
pub use define::define_class;
pub use error::{IrError, RuntimeError};
pub use instr::*;
pub use method::{Block, InterpretedMethod};
pub use module::*;
pub use operand::*;
pub use runtime::*;
pub use scope::{DynamicScope, ScopeId};
pub use value::Value;
