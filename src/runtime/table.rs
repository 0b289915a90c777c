use crate::runtime::{
    error::{RuntimeError, RuntimeResult},
    value::{Function, Userdata, Value},
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Total-order key wrapper so doubles can live in an ordered map.
#[derive(Clone, Copy, Debug)]
struct FloatKey(f64);

impl PartialEq for FloatKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for FloatKey {}

impl PartialOrd for FloatKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Associative container with one independent store per key type. `nil` and
/// varargs are rejected as keys; looking up an absent key yields `nil`
/// without creating a slot.
#[derive(Debug, Default)]
pub struct Table {
    int_fields: BTreeMap<i64, Value>,
    float_fields: BTreeMap<FloatKey, Value>,
    bool_fields: [Option<Value>; 2],
    string_fields: BTreeMap<String, Value>,
    function_fields: BTreeMap<usize, (Rc<Function>, Value)>,
    table_fields: BTreeMap<usize, (Rc<RefCell<Table>>, Value)>,
    userdata_fields: BTreeMap<usize, (Rc<Userdata>, Value)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> RuntimeResult<Value> {
        let value = match key {
            Value::Int(i) => self.int_fields.get(i).cloned(),
            Value::Float(f) => self.float_fields.get(&FloatKey(*f)).cloned(),
            Value::Bool(b) => self.bool_fields[*b as usize].clone(),
            Value::Str(s) => self.string_fields.get(s).cloned(),
            Value::Function(f) => self
                .function_fields
                .get(&(Rc::as_ptr(f) as usize))
                .map(|(_, v)| v.clone()),
            Value::Table(t) => self
                .table_fields
                .get(&(Rc::as_ptr(t) as usize))
                .map(|(_, v)| v.clone()),
            Value::Userdata(u) => self
                .userdata_fields
                .get(&(Rc::as_ptr(u) as usize))
                .map(|(_, v)| v.clone()),
            Value::Nil | Value::Varargs(_) => {
                return Err(RuntimeError::BadKey {
                    type_name: key.type_name().to_string(),
                });
            }
        };
        Ok(value.unwrap_or(Value::Nil))
    }

    pub fn get_str(&self, name: &str) -> Value {
        self.string_fields.get(name).cloned().unwrap_or(Value::Nil)
    }

    /// Create-on-miss assignment; a `nil` value removes the mapping.
    pub fn set(&mut self, key: Value, value: Value) -> RuntimeResult<()> {
        let remove = value.is_nil();
        match key {
            Value::Int(i) => {
                if remove {
                    self.int_fields.remove(&i);
                } else {
                    self.int_fields.insert(i, value);
                }
            }
            Value::Float(f) => {
                if remove {
                    self.float_fields.remove(&FloatKey(f));
                } else {
                    self.float_fields.insert(FloatKey(f), value);
                }
            }
            Value::Bool(b) => {
                self.bool_fields[b as usize] = if remove { None } else { Some(value) };
            }
            Value::Str(s) => {
                if remove {
                    self.string_fields.remove(&s);
                } else {
                    self.string_fields.insert(s, value);
                }
            }
            Value::Function(f) => {
                let ptr = Rc::as_ptr(&f) as usize;
                if remove {
                    self.function_fields.remove(&ptr);
                } else {
                    self.function_fields.insert(ptr, (f, value));
                }
            }
            Value::Table(t) => {
                let ptr = Rc::as_ptr(&t) as usize;
                if remove {
                    self.table_fields.remove(&ptr);
                } else {
                    self.table_fields.insert(ptr, (t, value));
                }
            }
            Value::Userdata(u) => {
                let ptr = Rc::as_ptr(&u) as usize;
                if remove {
                    self.userdata_fields.remove(&ptr);
                } else {
                    self.userdata_fields.insert(ptr, (u, value));
                }
            }
            Value::Nil | Value::Varargs(_) => {
                return Err(RuntimeError::BadKey {
                    type_name: key.type_name().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn set_str(&mut self, name: &str, value: Value) {
        if value.is_nil() {
            self.string_fields.remove(name);
        } else {
            self.string_fields.insert(name.to_string(), value);
        }
    }

    /// Any `n > 0` with `n` present and `n + 1` absent among the positive
    /// integer keys, or 0 when index 1 is absent. Deterministic only for
    /// gap-free prefixes.
    pub fn border(&self) -> i64 {
        let mut previous = 0i64;
        for key in self.int_fields.keys().copied().filter(|k| *k > 0) {
            if key != previous + 1 {
                return previous;
            }
            previous = key;
        }
        previous
    }
}
