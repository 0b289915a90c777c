use crate::runtime::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FfiError {
    #[error("Attempt to bind more effective arguments than function's formal arguments count")]
    BindOverflow,
    #[error("Attempt to call function without all arguments bound")]
    PartialCall,
    #[error("No converter registered for native type {0}")]
    NoConverter(NativeType),
    #[error("Cannot convert a {from} value to native type {to}")]
    Unconvertible { from: String, to: NativeType },
}

/// The native types a host callable may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeType {
    Unit,
    Int,
    Float,
    Double,
    Bool,
    Str,
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NativeType::Unit => "Unit",
            NativeType::Int => "Int",
            NativeType::Float => "Float",
            NativeType::Double => "Double",
            NativeType::Bool => "Bool",
            NativeType::Str => "Str",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NativeValue {
    Unit,
    Int(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Str(String),
}

impl NativeValue {
    pub fn into_value(self) -> Value {
        match self {
            NativeValue::Unit => Value::Nil,
            NativeValue::Int(v) => Value::Int(v),
            NativeValue::Float(v) => Value::Float(v as f64),
            NativeValue::Double(v) => Value::Float(v),
            NativeValue::Bool(v) => Value::Bool(v),
            NativeValue::Str(v) => Value::Str(v),
        }
    }
}

pub type ConvertFn = fn(&Value) -> Result<NativeValue, FfiError>;

/// Value-to-native conversion table, configured once by the embedder.
#[derive(Default)]
pub struct Converter {
    converters: HashMap<NativeType, ConvertFn>,
}

impl Converter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converter preloaded for every native type the bridge knows about.
    pub fn with_defaults() -> Self {
        let mut converter = Self::new();
        converter.register(NativeType::Int, |value| match value {
            Value::Int(v) => Ok(NativeValue::Int(*v)),
            Value::Float(v) if v.fract() == 0.0 => Ok(NativeValue::Int(*v as i64)),
            other => Err(FfiError::Unconvertible {
                from: other.type_name().to_string(),
                to: NativeType::Int,
            }),
        });
        converter.register(NativeType::Float, |value| match value {
            Value::Int(v) => Ok(NativeValue::Float(*v as f32)),
            Value::Float(v) => Ok(NativeValue::Float(*v as f32)),
            other => Err(FfiError::Unconvertible {
                from: other.type_name().to_string(),
                to: NativeType::Float,
            }),
        });
        converter.register(NativeType::Double, |value| match value {
            Value::Int(v) => Ok(NativeValue::Double(*v as f64)),
            Value::Float(v) => Ok(NativeValue::Double(*v)),
            other => Err(FfiError::Unconvertible {
                from: other.type_name().to_string(),
                to: NativeType::Double,
            }),
        });
        converter.register(NativeType::Bool, |value| Ok(NativeValue::Bool(value.as_bool_weak())));
        converter.register(NativeType::Str, |value| match value {
            Value::Str(s) => Ok(NativeValue::Str(s.clone())),
            Value::Int(v) => Ok(NativeValue::Str(v.to_string())),
            Value::Float(v) => Ok(NativeValue::Str(v.to_string())),
            other => Err(FfiError::Unconvertible {
                from: other.type_name().to_string(),
                to: NativeType::Str,
            }),
        });
        converter
    }

    pub fn register(&mut self, ty: NativeType, convert: ConvertFn) {
        self.converters.insert(ty, convert);
    }

    pub fn convert(&self, ty: NativeType, value: &Value) -> Result<NativeValue, FfiError> {
        let convert = self.converters.get(&ty).ok_or(FfiError::NoConverter(ty))?;
        convert(value)
    }
}

pub type HostCallable = Box<dyn Fn(&[NativeValue]) -> Option<NativeValue>>;

/// A registered host callable with its declared signature.
pub struct HostFunction {
    pub name: String,
    pub params: Vec<NativeType>,
    callable: HostCallable,
}

impl HostFunction {
    pub fn new(
        name: impl Into<String>,
        params: Vec<NativeType>,
        callable: impl Fn(&[NativeValue]) -> Option<NativeValue> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            callable: Box::new(callable),
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Single-use curried binder: one per invocation. Arguments are bound one at
/// a time, each converted to the native type at its position; the call runs
/// only once every declared parameter is bound.
pub struct CurriedCall {
    function: Rc<HostFunction>,
    bound: Vec<NativeValue>,
}

impl CurriedCall {
    pub fn new(function: Rc<HostFunction>) -> Self {
        Self {
            function,
            bound: Vec::new(),
        }
    }

    pub fn bind_next(&mut self, converter: &Converter, value: &Value) -> Result<(), FfiError> {
        let position = self.bound.len();
        let Some(ty) = self.function.params.get(position).copied() else {
            return Err(FfiError::BindOverflow);
        };
        self.bound.push(converter.convert(ty, value)?);
        Ok(())
    }

    pub fn invoke(self) -> Result<Value, FfiError> {
        if self.bound.len() < self.function.params.len() {
            return Err(FfiError::PartialCall);
        }
        let result = (self.function.callable)(&self.bound);
        Ok(result.map(NativeValue::into_value).unwrap_or(Value::Nil))
    }
}
