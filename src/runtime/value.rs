use crate::language::ast::FuncBody;
use crate::runtime::{
    error::{RuntimeError, RuntimeResult},
    ffi::HostFunction,
    table::Table,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A shared binding cell. Locals, globals and closure captures all go
/// through one of these so that assignment through any alias is visible to
/// every other holder.
pub type Slot = Rc<RefCell<Value>>;

#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Table(Rc<RefCell<Table>>),
    Function(Rc<Function>),
    Userdata(Rc<Userdata>),
    /// The value of `...`: an ordered bundle that expands in tail positions
    /// and contributes its first element anywhere else.
    Varargs(Vec<Value>),
}

#[derive(Debug)]
pub struct Function {
    pub kind: FunctionKind,
}

#[derive(Debug)]
pub enum FunctionKind {
    Script(ScriptFunction),
    Host(Rc<HostFunction>),
}

#[derive(Debug)]
pub struct ScriptFunction {
    /// Formal parameter names; a trailing `"..."` makes the function
    /// variadic.
    pub params: Vec<String>,
    pub body: Rc<FuncBody>,
    /// Bindings captured from enclosing blocks when the function value was
    /// created. Only names are kept; the block structure is not.
    pub closure: HashMap<String, Slot>,
}

#[derive(Debug, Default)]
pub struct Userdata;

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "double",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Userdata(_) => "userdata",
            Value::Varargs(_) => "varargs",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Heap values share their referent; everything else is self-contained.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Value::Table(_) | Value::Function(_) | Value::Userdata(_)
        )
    }

    /// Only `nil` and `false` are falsy.
    pub fn as_bool_weak(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            _ => true,
        }
    }

    pub fn as_double_weak(&self) -> RuntimeResult<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| RuntimeError::bad_type_contextless("weak double", "string")),
            other => Err(RuntimeError::bad_type_contextless(
                "weak double",
                other.type_name(),
            )),
        }
    }

    /// Integers pass through; doubles and numeric strings are accepted only
    /// when their fractional part is zero.
    pub fn as_int_weak(&self, allow_double: bool) -> RuntimeResult<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Float(v) => {
                if !allow_double {
                    return Err(RuntimeError::bad_type_contextless(
                        "integer or integer-string",
                        "double",
                    ));
                }
                if v.fract() == 0.0 {
                    Ok(*v as i64)
                } else {
                    Err(RuntimeError::bad_type_contextless("integer", "double"))
                }
            }
            Value::Str(s) => {
                let parsed = s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| RuntimeError::bad_type_contextless("weak integer", "string"))?;
                if parsed.fract() == 0.0 {
                    Ok(parsed as i64)
                } else {
                    Err(RuntimeError::bad_type_contextless(
                        "weak integer",
                        "string of double",
                    ))
                }
            }
            other => Err(RuntimeError::bad_type_contextless(
                "weak integer",
                other.type_name(),
            )),
        }
    }

    pub fn as_string(&self) -> RuntimeResult<String> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Float(v) => Ok(v.to_string()),
            Value::Nil => Ok("nil".to_string()),
            other => Err(RuntimeError::bad_type_contextless(
                "number or string",
                other.type_name(),
            )),
        }
    }

    /// Parses a string into a number, preferring the integer representation
    /// when the value is whole unless a double is forced.
    pub fn from_string_to_number(&self, force_double: bool) -> RuntimeResult<Value> {
        let Value::Str(_) = self else {
            return Err(RuntimeError::bad_type_contextless(
                "string",
                self.type_name(),
            ));
        };
        if force_double {
            return Ok(Value::Float(self.as_double_weak()?));
        }
        let parsed = self.as_double_weak()?;
        if parsed.fract() == 0.0 {
            Ok(Value::Int(parsed as i64))
        } else {
            Ok(Value::Float(parsed))
        }
    }

    /// Printable form. Reference values render their address, the way the
    /// host prints `table: 0x...`.
    pub fn render(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(s) => s.clone(),
            Value::Table(t) => format!("table: {:p}", Rc::as_ptr(t)),
            Value::Function(f) => format!("function: {:p}", Rc::as_ptr(f)),
            Value::Userdata(u) => format!("userdata: {:p}", Rc::as_ptr(u)),
            Value::Varargs(values) => values
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Doubles compare within one ULP-proportional tolerance.
fn doubles_equal(a: f64, b: f64) -> bool {
    let diff = (a - b).abs();
    let eps = f64::EPSILON * 1.0_f64.max(a.abs().max(b.abs()));
    diff <= eps
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => doubles_equal(*a, *b),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Userdata(a), Value::Userdata(b)) => Rc::ptr_eq(a, b),
            (Value::Varargs(_), Value::Varargs(_)) => true,
            // Integer and double compare numerically.
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                doubles_equal(*a as f64, *b)
            }
            // A boolean compares against the truthiness of the other side.
            (Value::Bool(a), other) | (other, Value::Bool(a)) => *a == other.as_bool_weak(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
