//! REAM Bytecode - Polymorphic bytecode format with effect tracking
//!
//! Bytecode forms the initial algebra over a graded monad of instruction effects.
//!
//! `Value` here is the *literal* representation used by the constant pool
//! (the `LitT` chunk of a module image) and by the verifier's static
//! effect/type checks. It is deliberately distinct from `runtime::term::Term`,
//! the tagged heap word a running process actually computes with — loading a
//! module materializes each `Value` into a `Term` on first reference (see
//! `bytecode::loader`).

pub mod instruction;
pub mod program;
pub mod registry;
pub mod security;
pub mod verifier;
pub mod loader;

use serde::{Deserialize, Serialize};
use crate::types::Pid;

pub use instruction::{Bytecode, Instruction};
pub use program::{BytecodeProgram, BytecodeFunction};
pub use registry::{ModuleRegistry, ModuleVersion};
pub use loader::{ModuleImage, ModuleImageBuilder, ModuleLoader};

/// Value types in REAM bytecode's constant pool / literal area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Boolean value (BEAM represents these as the atoms `true`/`false`;
    /// kept as a distinct variant here for cheaper dispatch in hot
    /// comparison/branch instructions)
    Bool(bool),
    /// Interned atom
    Atom(String),
    /// String value (used by string-handling BIFs; not interned)
    String(String),
    /// Binary data (materializes into an off-heap `Term` binary)
    Binary(Vec<u8>),
    /// List of values
    List(Vec<Value>),
    /// Fixed-arity tuple
    Tuple(Vec<Value>),
    /// Function reference (module-local function index)
    Function(u32),
    /// Process ID
    Pid(Pid),
    /// Null/nil value
    Null,
}

impl Value {
    /// Get the type of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Atom(_) => "atom",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Function(_) => "function",
            Value::Pid(_) => "pid",
            Value::Null => "null",
        }
    }

    /// Check if value is truthy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Atom(a) => a != "false",
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Null => false,
            _ => true,
        }
    }

    /// Convert to integer if possible
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Convert to float if possible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Atom(a) => a.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => "nil".to_string(),
            Value::Binary(b) => format!("<<{} bytes>>", b.len()),
            Value::List(l) => format!("[{}]", l.iter().map(|v| v.as_string()).collect::<Vec<_>>().join(", ")),
            Value::Tuple(t) => format!("{{{}}}", t.iter().map(|v| v.as_string()).collect::<Vec<_>>().join(", ")),
            Value::Function(f) => format!("function#{}", f),
            Value::Pid(p) => format!("pid#{}", p.raw()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// Static type information used by the verifier's type-compatibility pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeInfo {
    /// Integer type
    Int,
    /// Float type
    Float,
    /// Boolean type
    Bool,
    /// Atom type
    Atom,
    /// String type
    String,
    /// Binary type
    Binary,
    /// List type with element type
    List(Box<TypeInfo>),
    /// Tuple type with element types
    Tuple(Vec<TypeInfo>),
    /// Function type with parameter and return types
    Function(Vec<TypeInfo>, Box<TypeInfo>),
    /// Process ID type
    Pid,
    /// Unit type
    Unit,
    /// Type variable
    TypeVar(String),
    /// Unknown type
    Unknown,
}

impl TypeInfo {
    /// Check if this type is compatible with another
    pub fn is_compatible(&self, other: &TypeInfo) -> bool {
        match (self, other) {
            (TypeInfo::TypeVar(_), _) | (_, TypeInfo::TypeVar(_)) => true,
            (TypeInfo::Unknown, _) | (_, TypeInfo::Unknown) => true,
            (TypeInfo::Int, TypeInfo::Int) => true,
            (TypeInfo::Float, TypeInfo::Float) => true,
            (TypeInfo::Bool, TypeInfo::Bool) => true,
            (TypeInfo::Atom, TypeInfo::Atom) => true,
            (TypeInfo::String, TypeInfo::String) => true,
            (TypeInfo::Binary, TypeInfo::Binary) => true,
            (TypeInfo::Pid, TypeInfo::Pid) => true,
            (TypeInfo::Unit, TypeInfo::Unit) => true,
            (TypeInfo::List(a), TypeInfo::List(b)) => a.is_compatible(b),
            (TypeInfo::Tuple(a), TypeInfo::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.is_compatible(y))
            }
            (TypeInfo::Function(a_params, a_ret), TypeInfo::Function(b_params, b_ret)) => {
                a_params.len() == b_params.len() &&
                a_params.iter().zip(b_params.iter()).all(|(a, b)| a.is_compatible(b)) &&
                a_ret.is_compatible(b_ret)
            }
            _ => false,
        }
    }

    /// Get the default value for this type
    pub fn default_value(&self) -> Value {
        match self {
            TypeInfo::Int => Value::Int(0),
            TypeInfo::Float => Value::Float(0.0),
            TypeInfo::Bool => Value::Bool(false),
            TypeInfo::Atom => Value::Atom(String::new()),
            TypeInfo::String => Value::String(String::new()),
            TypeInfo::Binary => Value::Binary(Vec::new()),
            TypeInfo::List(_) => Value::List(Vec::new()),
            TypeInfo::Tuple(fields) => Value::Tuple(fields.iter().map(|t| t.default_value()).collect()),
            TypeInfo::Pid => Value::Pid(Pid::new()),
            TypeInfo::Unit | TypeInfo::TypeVar(_) | TypeInfo::Unknown => Value::Null,
            TypeInfo::Function(_, _) => Value::Function(0),
        }
    }

    /// Infer the static type of a literal value
    pub fn from_value(value: &Value) -> TypeInfo {
        match value {
            Value::Int(_) => TypeInfo::Int,
            Value::Float(_) => TypeInfo::Float,
            Value::Bool(_) => TypeInfo::Bool,
            Value::Atom(_) => TypeInfo::Atom,
            Value::String(_) => TypeInfo::String,
            Value::Binary(_) => TypeInfo::Binary,
            Value::List(items) => {
                let elem = items.first().map(TypeInfo::from_value).unwrap_or(TypeInfo::Unknown);
                TypeInfo::List(Box::new(elem))
            }
            Value::Tuple(items) => TypeInfo::Tuple(items.iter().map(TypeInfo::from_value).collect()),
            Value::Function(_) => TypeInfo::Function(Vec::new(), Box::new(TypeInfo::Unknown)),
            Value::Pid(_) => TypeInfo::Pid,
            Value::Null => TypeInfo::Unit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_truthiness() {
        assert!(Value::Int(1).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Atom("false".to_string()).is_truthy());
        assert!(Value::Atom("ok".to_string()).is_truthy());
    }

    #[test]
    fn test_type_compatibility() {
        assert!(TypeInfo::Int.is_compatible(&TypeInfo::Int));
        assert!(!TypeInfo::Int.is_compatible(&TypeInfo::Bool));
        assert!(TypeInfo::Unknown.is_compatible(&TypeInfo::Int));
    }

    #[test]
    fn test_type_from_value() {
        assert_eq!(TypeInfo::from_value(&Value::Int(1)), TypeInfo::Int);
        assert_eq!(
            TypeInfo::from_value(&Value::Tuple(vec![Value::Int(1), Value::Bool(true)])),
            TypeInfo::Tuple(vec![TypeInfo::Int, TypeInfo::Bool])
        );
    }
}
