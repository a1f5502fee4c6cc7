// File: src/value.rs
//
// Runtime value types for the Rill engine.
// Defines the tagged Value union, the prototype-linked object model, the
// growable array model, and the callable descriptors (native functions and
// bytecode closures with shared upvalue cells).

use crate::errors::ScriptError;
use crate::program::ProgramImage;
use crate::vm::VM;
use ahash::AHashMap;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A captured variable cell. Every closure that captured the same variable
/// holds a clone of the same Arc, so writes through one closure are observed
/// by all the others.
pub type UpvalueCell = Arc<Mutex<Value>>;

/// Shared reference to an object
pub type ObjectRef = Arc<Mutex<ObjectData>>;

/// Shared reference to an array
pub type ArrayRef = Arc<Mutex<ArrayData>>;

/// Native host function. Receives the VM (so it can call back into script
/// code) and the argument list; returns a value or an engine error.
pub type NativeFn = Arc<dyn Fn(&mut VM, &[Value]) -> Result<Value, ScriptError> + Send + Sync>;

/// Runtime values
///
/// Equality is value-wise for primitives and identity-wise for objects,
/// arrays, and functions. `Undefined` compares equal only to itself.
#[derive(Clone)]
pub enum Value {
    /// The absent value; what missing fields and out-of-range reads produce
    Undefined,
    /// The explicit empty value
    Null,
    /// Boolean
    Bool(bool),
    /// IEEE-754 double
    Number(f64),
    /// Immutable text, reference-shared
    Str(Arc<String>),
    /// Prototype-linked key/value container
    Object(ObjectRef),
    /// Growable ordered sequence
    Array(ArrayRef),
    /// Callable: native host function or bytecode closure
    Function(Arc<FunctionValue>),
}

/// A callable descriptor
pub enum FunctionValue {
    /// Host function registered by the embedder (or an engine intrinsic)
    Native { name: String, func: NativeFn },
    /// Bytecode entry point packaged with its captured upvalue cells
    Closure(Closure),
}

/// A bytecode function bound to its captured environment
#[derive(Clone)]
pub struct Closure {
    /// The image this closure executes from
    pub program: Arc<ProgramImage>,
    /// Index into the image's function table
    pub function: usize,
    /// Captured cells, in capture-descriptor order
    pub upvalues: Vec<UpvalueCell>,
}

impl Value {
    pub fn string(s: String) -> Self {
        Value::Str(Arc::new(s))
    }

    pub fn str_ref(s: &str) -> Self {
        Value::Str(Arc::new(s.to_string()))
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Arc::new(Mutex::new(ArrayData { elements })))
    }

    pub fn object(data: ObjectData) -> Self {
        Value::Object(Arc::new(Mutex::new(data)))
    }

    pub fn native(name: &str, func: NativeFn) -> Self {
        Value::Function(Arc::new(FunctionValue::Native { name: name.to_string(), func }))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
        }
    }

    /// `false`, `null`, and `undefined` are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Undefined | Value::Null | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Bitwise operand coercion: truncate toward zero and wrap into a 32-bit
/// signed integer. Non-finite input coerces to zero; magnitudes beyond the
/// i64 range saturate there before wrapping.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64) as i32
}

/// Formats a number the way scripts expect: integral values print without a
/// decimal point, everything else uses the shortest round-trip form.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{}", s),
            Value::Object(_) => write!(f, "object"),
            Value::Array(_) => write!(f, "array"),
            Value::Function(func) => match func.as_ref() {
                FunctionValue::Native { name, .. } => write!(f, "function {}", name),
                FunctionValue::Closure(c) => {
                    write!(f, "function {}", c.program.function_name(c.function))
                }
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::Str(s) => write!(f, "Str({:?})", s.as_str()),
            Value::Object(o) => {
                let len = o.lock().unwrap().len();
                write!(f, "Object{{{} keys}}", len)
            }
            Value::Array(a) => {
                let len = a.lock().unwrap().elements.len();
                write!(f, "Array[{}]", len)
            }
            Value::Function(func) => match func.as_ref() {
                FunctionValue::Native { name, .. } => write!(f, "NativeFunction({})", name),
                FunctionValue::Closure(c) => write!(
                    f,
                    "Closure({}, {} upvalues)",
                    c.program.function_name(c.function),
                    c.upvalues.len()
                ),
            },
        }
    }
}

/// Hashable identity of a Value used as an object key.
///
/// Keys may be any non-null, non-undefined value; equality is tag + payload.
/// Numbers hash by canonical bits (-0.0 folds to 0.0, every NaN folds to one
/// pattern) so key identity is reflexive; reference types hash by pointer.
#[derive(Clone)]
pub struct ValueKey(pub Value);

impl ValueKey {
    pub fn new(value: Value) -> Result<Self, ScriptError> {
        match value {
            Value::Undefined | Value::Null => Err(ScriptError::runtime_error(format!(
                "'{}' cannot be used as an object key",
                value.type_name()
            ))),
            other => Ok(ValueKey(other)),
        }
    }

    fn number_bits(n: f64) -> u64 {
        if n.is_nan() {
            f64::NAN.to_bits()
        } else if n == 0.0 {
            0.0f64.to_bits()
        } else {
            n.to_bits()
        }
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &ValueKey) -> bool {
        match (&self.0, &other.0) {
            (Value::Number(a), Value::Number(b)) => {
                Self::number_bits(*a) == Self::number_bits(*b)
            }
            (a, b) => a == b,
        }
    }
}

impl Eq for ValueKey {}

impl std::hash::Hash for ValueKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Number(n) => {
                state.write_u8(2);
                Self::number_bits(*n).hash(state);
            }
            Value::Str(s) => {
                state.write_u8(3);
                s.hash(state);
            }
            Value::Object(o) => {
                state.write_u8(4);
                (Arc::as_ptr(o) as usize).hash(state);
            }
            Value::Array(a) => {
                state.write_u8(5);
                (Arc::as_ptr(a) as usize).hash(state);
            }
            Value::Function(f) => {
                state.write_u8(6);
                (Arc::as_ptr(f) as usize).hash(state);
            }
            // Rejected by the constructor
            Value::Undefined | Value::Null => state.write_u8(0),
        }
    }
}

/// Longest prototype chain the engine will walk before assuming a cycle
const MAX_PROTOTYPE_DEPTH: usize = 1000;

/// An insertion-ordered mapping from Value keys to Value values with a
/// prototype slot, a lock flag, and an opaque user-data slot for the host.
pub struct ObjectData {
    entries: Vec<(Value, Value)>,
    index: AHashMap<ValueKey, usize>,
    pub prototype: Option<ObjectRef>,
    pub locked: bool,
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Default for ObjectData {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectData {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: AHashMap::new(),
            prototype: None,
            locked: false,
            user_data: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key on this object only, ignoring the prototype chain.
    pub fn get_own(&self, key: &Value) -> Option<Value> {
        let key = ValueKey::new(key.clone()).ok()?;
        self.index.get(&key).map(|&slot| self.entries[slot].1.clone())
    }

    pub fn has_own(&self, key: &Value) -> bool {
        match ValueKey::new(key.clone()) {
            Ok(key) => self.index.contains_key(&key),
            Err(_) => false,
        }
    }

    /// Insert or update a key. Locked objects reject new keys with a
    /// RuntimeError; updates to existing keys remain permitted.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), ScriptError> {
        let key = ValueKey::new(key)?;
        if let Some(&slot) = self.index.get(&key) {
            self.entries[slot].1 = value;
            return Ok(());
        }
        if self.locked {
            return Err(ScriptError::runtime_error(
                "cannot add a key to a locked object".to_string(),
            ));
        }
        let slot = self.entries.len();
        self.entries.push((key.0.clone(), value));
        self.index.insert(key, slot);
        Ok(())
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("entries", &self.entries.len())
            .field("locked", &self.locked)
            .field("has_prototype", &self.prototype.is_some())
            .finish()
    }
}

/// Walk the prototype chain of `object` looking for `key`.
/// Missing keys read as Undefined. Locks are taken one level at a time so
/// lookups never hold more than one object lock.
pub fn object_lookup(object: &ObjectRef, key: &Value) -> Result<Value, ScriptError> {
    let mut current = object.clone();
    for _ in 0..MAX_PROTOTYPE_DEPTH {
        let next = {
            let data = current.lock().unwrap();
            if let Some(value) = data.get_own(key) {
                return Ok(value);
            }
            data.prototype.clone()
        };
        match next {
            Some(proto) => current = proto,
            None => return Ok(Value::Undefined),
        }
    }
    Err(ScriptError::runtime_error("prototype chain too deep".to_string()))
}

/// Whether `key` resolves anywhere on the prototype chain
pub fn object_has_key(object: &ObjectRef, key: &Value) -> Result<bool, ScriptError> {
    let mut current = object.clone();
    for _ in 0..MAX_PROTOTYPE_DEPTH {
        let next = {
            let data = current.lock().unwrap();
            if data.has_own(key) {
                return Ok(true);
            }
            data.prototype.clone()
        };
        match next {
            Some(proto) => current = proto,
            None => return Ok(false),
        }
    }
    Err(ScriptError::runtime_error("prototype chain too deep".to_string()))
}

/// Resolve a meta-method (`__add`, `__eq`, ...) on the prototype chain.
/// Returns None when the name does not resolve to a callable.
pub fn object_meta_method(object: &ObjectRef, name: &str) -> Option<Value> {
    let key = Value::str_ref(name);
    match object_lookup(object, &key) {
        Ok(value) if value.is_callable() => Some(value),
        _ => None,
    }
}

/// A contiguous, growable ordered sequence of Values.
///
/// Out-of-range reads return Undefined. Writes past the end extend the array,
/// padding the gap with Undefined.
#[derive(Debug, Default)]
pub struct ArrayData {
    pub elements: Vec<Value>,
}

impl ArrayData {
    pub fn new() -> Self {
        Self { elements: Vec::new() }
    }

    /// Convert a script index to a slot. Non-integral or negative numbers
    /// never address an element.
    fn slot(index: f64) -> Option<usize> {
        if index.is_finite() && index.fract() == 0.0 && index >= 0.0 && index < usize::MAX as f64 {
            Some(index as usize)
        } else {
            None
        }
    }

    pub fn get(&self, index: f64) -> Value {
        match Self::slot(index) {
            Some(slot) => self.elements.get(slot).cloned().unwrap_or(Value::Undefined),
            None => Value::Undefined,
        }
    }

    pub fn set(&mut self, index: f64, value: Value) -> Result<(), ScriptError> {
        let slot = Self::slot(index).ok_or_else(|| {
            ScriptError::runtime_error(format!("invalid array index {}", format_number(index)))
        })?;
        if slot >= self.elements.len() {
            self.elements.resize(slot + 1, Value::Undefined);
        }
        self.elements[slot] = value;
        Ok(())
    }
}
