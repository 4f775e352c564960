use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tern_syntax::{Block, Parameter};

pub const INTEGER: &str = "INTEGER";
pub const BOOLEAN: &str = "BOOLEAN";
pub const STRING: &str = "STRING";
pub const NULL: &str = "NULL";
pub const ARRAY: &str = "ARRAY";
pub const HASH: &str = "HASH";
pub const FUNCTION: &str = "FUNCTION";
pub const COMPILED_FUNCTION: &str = "COMPILED_FUNCTION";
pub const CLOSURE: &str = "CLOSURE";
pub const BUILTIN: &str = "BUILTIN";
pub const RETURN: &str = "RETURN";

pub type Pairs = IndexMap<HashKey, HashPair>;

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Bool(bool),
    /// UTF-8 bytes; indexing is by byte and yields a one-byte string.
    Str(Rc<String>),
    Null,
    Array(Rc<RefCell<Vec<Value>>>),
    Hash(Rc<RefCell<Pairs>>),
    Function(Rc<FunctionValue>),
    Compiled(Rc<CompiledFunction>),
    Closure(Rc<ClosureValue>),
    Builtin(&'static BuiltinDef),
    /// Tree-walker unwind marker; never observed by user code.
    Return(Rc<Value>),
}

/// The canonical form a value takes when used as a hash key: primitives by
/// content, everything composite by object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Int(i64),
    Bool(bool),
    Str(String),
    Null,
    Ident(usize),
}

#[derive(Debug, Clone)]
pub struct HashPair {
    pub key: Value,
    pub value: Value,
}

pub struct FunctionValue {
    pub params: Vec<Parameter>,
    pub body: Block,
    pub env: Env,
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The captured env can point back at this function; don't chase it.
        f.debug_struct("FunctionValue")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledFunction {
    pub instructions: Vec<u8>,
    pub num_locals: usize,
    pub num_parameters: usize,
}

#[derive(Debug, Clone)]
pub struct ClosureValue {
    pub func: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

pub type BuiltinFn = fn(Vec<Value>) -> Result<Value, String>;

pub struct BuiltinDef {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl fmt::Debug for BuiltinDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuiltinDef({})", self.name)
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(Rc::new(s.into()))
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn hash() -> Self {
        Value::Hash(Rc::new(RefCell::new(Pairs::new())))
    }

    pub fn key(&self) -> HashKey {
        match self {
            Value::Int(v) => HashKey::Int(*v),
            Value::Bool(v) => HashKey::Bool(*v),
            Value::Str(v) => HashKey::Str(v.as_ref().clone()),
            Value::Null => HashKey::Null,
            Value::Array(v) => HashKey::Ident(Rc::as_ptr(v) as usize),
            Value::Hash(v) => HashKey::Ident(Rc::as_ptr(v) as usize),
            Value::Function(v) => HashKey::Ident(Rc::as_ptr(v) as usize),
            Value::Compiled(v) => HashKey::Ident(Rc::as_ptr(v) as usize),
            Value::Closure(v) => HashKey::Ident(Rc::as_ptr(v) as usize),
            Value::Builtin(def) => HashKey::Ident(*def as *const BuiltinDef as usize),
            Value::Return(v) => v.key(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => INTEGER,
            Value::Bool(_) => BOOLEAN,
            Value::Str(_) => STRING,
            Value::Null => NULL,
            Value::Array(_) => ARRAY,
            Value::Hash(_) => HASH,
            Value::Function(_) => FUNCTION,
            Value::Compiled(_) => COMPILED_FUNCTION,
            Value::Closure(_) => CLOSURE,
            Value::Builtin(_) => BUILTIN,
            Value::Return(_) => RETURN,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn inspect(&self) -> String {
        self.to_string()
    }
}

/// Key-form equality: primitives compare by content, composites by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
            Value::Null => f.write_str("null"),
            Value::Array(elements) => {
                f.write_str("[")?;
                for (i, el) in elements.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{el}")?;
                }
                f.write_str("]")
            }
            Value::Hash(pairs) => {
                f.write_str("{")?;
                for (i, (_, pair)) in pairs.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", pair.key, pair.value)?;
                }
                f.write_str("}")
            }
            Value::Function(func) => {
                f.write_str("fn(")?;
                for (i, param) in func.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ") {{ {} }}", func.body)
            }
            Value::Compiled(_) => f.write_str("<compiled function>"),
            Value::Closure(_) => f.write_str("<closure>"),
            Value::Builtin(_) => f.write_str("<builtin function>"),
            Value::Return(v) => write!(f, "{v}"),
        }
    }
}

pub fn hash_get(pairs: &Rc<RefCell<Pairs>>, key: &Value) -> Option<Value> {
    pairs.borrow().get(&key.key()).map(|p| p.value.clone())
}

pub fn hash_set(pairs: &Rc<RefCell<Pairs>>, key: Value, value: Value) {
    pairs
        .borrow_mut()
        .insert(key.key(), HashPair { key, value });
}

/// A lexically nested frame of name bindings, shared by reference so
/// closures can keep their defining scope alive.
#[derive(Debug, Clone)]
pub struct Env(Rc<RefCell<EnvInner>>);

#[derive(Debug)]
struct EnvInner {
    parent: Option<Env>,
    store: HashMap<String, Binding>,
}

#[derive(Debug, Clone)]
struct Binding {
    value: Value,
    declared: Option<String>,
}

impl Env {
    pub fn new(parent: Option<Env>) -> Self {
        Self(Rc::new(RefCell::new(EnvInner {
            parent,
            store: HashMap::new(),
        })))
    }

    /// The name `locals` is a virtual read producing a hash snapshot of the
    /// current frame's bindings.
    pub fn get(&self, name: &str) -> Option<Value> {
        if name == "locals" {
            return Some(self.locals());
        }
        let inner = self.0.borrow();
        if let Some(binding) = inner.store.get(name) {
            return Some(binding.value.clone());
        }
        inner.parent.as_ref().and_then(|parent| parent.get(name))
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.0.borrow_mut().store.insert(
            name.into(),
            Binding {
                value,
                declared: None,
            },
        );
    }

    pub fn set_typed(
        &self,
        name: impl Into<String>,
        value: Value,
        declared: Option<String>,
    ) -> Result<(), String> {
        if let Some(ty) = &declared {
            check_type(ty, &value)?;
        }
        self.0
            .borrow_mut()
            .store
            .insert(name.into(), Binding { value, declared });
        Ok(())
    }

    /// Walks outward to the frame holding `name`; fails when no frame does.
    pub fn update(&self, name: &str, value: Value) -> Result<(), String> {
        {
            let mut inner = self.0.borrow_mut();
            if let Some(binding) = inner.store.get_mut(name) {
                if let Some(ty) = &binding.declared {
                    check_type(ty, &value)?;
                }
                binding.value = value;
                return Ok(());
            }
        }
        let parent = self.0.borrow().parent.clone();
        match parent {
            Some(parent) => parent.update(name, value),
            None => Err(format!("'{name}' is not defined")),
        }
    }

    pub fn locals(&self) -> Value {
        let hash = Value::hash();
        if let Value::Hash(pairs) = &hash {
            for (name, binding) in &self.0.borrow().store {
                hash_set(pairs, Value::string(name.clone()), binding.value.clone());
            }
        }
        hash
    }
}

/// Runtime tag-compare for `let` and parameter type annotations.
pub fn check_type(declared: &str, value: &Value) -> Result<(), String> {
    let expected = match declared {
        "int" | "integer" => INTEGER,
        "string" | "str" => STRING,
        "bool" | "boolean" => BOOLEAN,
        "array" => ARRAY,
        "hash" => HASH,
        "fn" | "function" => FUNCTION,
        "null" => NULL,
        other => return Err(format!("unknown type: {other}")),
    };
    let got = value.type_name();
    if got != expected {
        return Err(format!("type mismatch: expected {expected}, got {got}"));
    }
    Ok(())
}

/// Built-in registry. The order is load-bearing: the compiler refers to
/// builtins by index through `OpGetBuiltin`.
pub static BUILTINS: &[BuiltinDef] = &[
    BuiltinDef {
        name: "len",
        func: builtin_len,
    },
    BuiltinDef {
        name: "append",
        func: builtin_append,
    },
    BuiltinDef {
        name: "first",
        func: builtin_first,
    },
    BuiltinDef {
        name: "rest",
        func: builtin_rest,
    },
    BuiltinDef {
        name: "delete",
        func: builtin_delete,
    },
    BuiltinDef {
        name: "keys",
        func: builtin_keys,
    },
    BuiltinDef {
        name: "values",
        func: builtin_values,
    },
    BuiltinDef {
        name: "print",
        func: builtin_print,
    },
    BuiltinDef {
        name: "read",
        func: builtin_read,
    },
    BuiltinDef {
        name: "str",
        func: builtin_str,
    },
    BuiltinDef {
        name: "type",
        func: builtin_type,
    },
];

pub fn lookup_builtin(name: &str) -> Option<&'static BuiltinDef> {
    BUILTINS.iter().find(|def| def.name == name)
}

fn want_args(name: &str, args: &[Value], count: usize) -> Result<(), String> {
    if args.len() != count {
        return Err(format!("{name}: wrong number of arguments"));
    }
    Ok(())
}

fn builtin_len(args: Vec<Value>) -> Result<Value, String> {
    want_args("len", &args, 1)?;
    match &args[0] {
        Value::Str(s) => Ok(Value::Int(s.len() as i64)),
        Value::Array(elements) => Ok(Value::Int(elements.borrow().len() as i64)),
        Value::Hash(pairs) => Ok(Value::Int(pairs.borrow().len() as i64)),
        other => Err(format!("len: invalid argument type {}", other.type_name())),
    }
}

fn builtin_append(mut args: Vec<Value>) -> Result<Value, String> {
    if args.is_empty() {
        return Err("append: at least one argument required".to_string());
    }
    let rest = args.split_off(1);
    let array = args.remove(0);
    match &array {
        Value::Array(elements) => elements.borrow_mut().extend(rest),
        other => return Err(format!("append: expected array, got {}", other.type_name())),
    }
    Ok(array)
}

fn builtin_first(args: Vec<Value>) -> Result<Value, String> {
    want_args("first", &args, 1)?;
    match &args[0] {
        Value::Array(elements) => match elements.borrow().first() {
            Some(el) => Ok(el.clone()),
            None => Err("first: cannot get first element of empty array".to_string()),
        },
        other => Err(format!("first: expected array, got {}", other.type_name())),
    }
}

fn builtin_rest(args: Vec<Value>) -> Result<Value, String> {
    want_args("rest", &args, 1)?;
    match &args[0] {
        Value::Array(elements) => {
            let elements = elements.borrow();
            let rest = elements.iter().skip(1).cloned().collect();
            Ok(Value::array(rest))
        }
        other => Err(format!("rest: expected array, got {}", other.type_name())),
    }
}

fn builtin_delete(args: Vec<Value>) -> Result<Value, String> {
    want_args("delete", &args, 2)?;
    match &args[0] {
        Value::Hash(pairs) => {
            pairs.borrow_mut().shift_remove(&args[1].key());
            Ok(Value::Null)
        }
        other => Err(format!("delete: expected hash, got {}", other.type_name())),
    }
}

fn builtin_keys(args: Vec<Value>) -> Result<Value, String> {
    want_args("keys", &args, 1)?;
    match &args[0] {
        Value::Hash(pairs) => {
            let keys = pairs.borrow().values().map(|p| p.key.clone()).collect();
            Ok(Value::array(keys))
        }
        other => Err(format!("keys: expected hash, got {}", other.type_name())),
    }
}

fn builtin_values(args: Vec<Value>) -> Result<Value, String> {
    want_args("values", &args, 1)?;
    match &args[0] {
        Value::Hash(pairs) => {
            let values = pairs.borrow().values().map(|p| p.value.clone()).collect();
            Ok(Value::array(values))
        }
        other => Err(format!("values: expected hash, got {}", other.type_name())),
    }
}

fn builtin_print(args: Vec<Value>) -> Result<Value, String> {
    let line = args
        .iter()
        .map(Value::inspect)
        .collect::<Vec<_>>()
        .join(" ");
    println!("{line}");
    Ok(Value::Null)
}

fn builtin_read(args: Vec<Value>) -> Result<Value, String> {
    want_args("read", &args, 1)?;
    match &args[0] {
        Value::Str(path) => match std::fs::read_to_string(path.as_str()) {
            Ok(data) => Ok(Value::string(data)),
            Err(err) => Err(format!("read: {err}")),
        },
        other => Err(format!("read: expected string, got {}", other.type_name())),
    }
}

fn builtin_str(args: Vec<Value>) -> Result<Value, String> {
    want_args("str", &args, 1)?;
    match &args[0] {
        Value::Str(_) => Ok(args[0].clone()),
        other => Ok(Value::string(other.inspect())),
    }
}

fn builtin_type(args: Vec<Value>) -> Result<Value, String> {
    want_args("type", &args, 1)?;
    Ok(Value::string(args[0].type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_equality_is_by_content() {
        assert_eq!(Value::Int(5), Value::Int(5));
        assert_ne!(Value::Int(5), Value::Int(6));
        assert_eq!(Value::string("abc"), Value::string("abc"));
        assert_ne!(Value::Int(1), Value::Bool(true));
        assert_eq!(Value::Null, Value::Null);
    }

    #[test]
    fn composite_equality_is_by_identity() {
        let a = Value::array(vec![Value::Int(1)]);
        let b = Value::array(vec![Value::Int(1)]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn hash_keys_canonicalize() {
        let hash = Value::hash();
        if let Value::Hash(pairs) = &hash {
            hash_set(pairs, Value::Int(1), Value::string("one"));
            hash_set(pairs, Value::string("two"), Value::Int(2));
            assert_eq!(hash_get(pairs, &Value::Int(1)), Some(Value::string("one")));
            assert_eq!(hash_get(pairs, &Value::string("two")), Some(Value::Int(2)));
            // incommensurate key form
            assert_eq!(hash_get(pairs, &Value::Bool(true)), None);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn hash_overwrites_by_key_form() {
        let hash = Value::hash();
        if let Value::Hash(pairs) = &hash {
            hash_set(pairs, Value::Int(1), Value::string("one"));
            hash_set(pairs, Value::Int(1), Value::string("uno"));
            assert_eq!(pairs.borrow().len(), 1);
            assert_eq!(hash_get(pairs, &Value::Int(1)), Some(Value::string("uno")));
        }
    }

    #[test]
    fn env_lookup_walks_outward() {
        let outer = Env::new(None);
        outer.set("x", Value::Int(1));
        let inner = Env::new(Some(outer.clone()));
        inner.set("y", Value::Int(2));
        assert_eq!(inner.get("x"), Some(Value::Int(1)));
        assert_eq!(inner.get("y"), Some(Value::Int(2)));
        assert_eq!(outer.get("y"), None);
    }

    #[test]
    fn env_update_walks_outward() {
        let outer = Env::new(None);
        outer.set("x", Value::Int(1));
        let inner = Env::new(Some(outer.clone()));
        inner.update("x", Value::Int(9)).expect("update binding");
        assert_eq!(outer.get("x"), Some(Value::Int(9)));
        let err = inner.update("zz", Value::Null).expect_err("undefined");
        assert_eq!(err, "'zz' is not defined");
    }

    #[test]
    fn typed_bindings_tag_compare() {
        let env = Env::new(None);
        env.set_typed("x", Value::Int(1), Some("int".to_string()))
            .expect("bind typed");
        let err = env
            .update("x", Value::string("no"))
            .expect_err("type mismatch");
        assert_eq!(err, "type mismatch: expected INTEGER, got STRING");
        let err = env
            .set_typed("y", Value::Int(1), Some("string".to_string()))
            .expect_err("type mismatch");
        assert_eq!(err, "type mismatch: expected STRING, got INTEGER");
    }

    #[test]
    fn locals_snapshots_current_frame_only() {
        let outer = Env::new(None);
        outer.set("x", Value::Int(1));
        let inner = Env::new(Some(outer));
        inner.set("y", Value::Int(2));
        let locals = inner.get("locals").expect("locals hash");
        if let Value::Hash(pairs) = &locals {
            assert_eq!(pairs.borrow().len(), 1);
            assert_eq!(
                hash_get(pairs, &Value::string("y")),
                Some(Value::Int(2))
            );
        } else {
            panic!("locals is not a hash: {locals:?}");
        }
    }

    #[test]
    fn builtin_ordinals_are_stable() {
        let names: Vec<&str> = BUILTINS.iter().map(|b| b.name).collect();
        assert_eq!(
            names,
            vec![
                "len", "append", "first", "rest", "delete", "keys", "values", "print", "read",
                "str", "type"
            ]
        );
    }

    #[test]
    fn len_counts_bytes_elements_pairs() {
        assert_eq!(builtin_len(vec![Value::string("héllo")]), Ok(Value::Int(6)));
        assert_eq!(
            builtin_len(vec![Value::array(vec![Value::Int(1), Value::Int(2)])]),
            Ok(Value::Int(2))
        );
        assert_eq!(builtin_len(vec![Value::hash()]), Ok(Value::Int(0)));
        assert_eq!(
            builtin_len(vec![Value::Int(1)]),
            Err("len: invalid argument type INTEGER".to_string())
        );
        assert_eq!(
            builtin_len(vec![]),
            Err("len: wrong number of arguments".to_string())
        );
    }

    #[test]
    fn append_mutates_in_place() {
        let arr = Value::array(vec![]);
        let result = builtin_append(vec![arr.clone(), Value::Int(1)]).expect("append");
        assert_eq!(result, arr);
        if let Value::Array(elements) = &arr {
            assert_eq!(elements.borrow().len(), 1);
            assert_eq!(elements.borrow()[0], Value::Int(1));
        }
    }

    #[test]
    fn first_and_rest() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(builtin_first(vec![arr.clone()]), Ok(Value::Int(1)));
        let rest = builtin_rest(vec![arr.clone()]).expect("rest");
        if let Value::Array(elements) = &rest {
            assert_eq!(
                *elements.borrow(),
                vec![Value::Int(2), Value::Int(3)]
            );
        }
        // rest returns a new array
        assert_ne!(rest, arr);
        assert_eq!(
            builtin_first(vec![Value::array(vec![])]),
            Err("first: cannot get first element of empty array".to_string())
        );
        let empty_rest = builtin_rest(vec![Value::array(vec![])]).expect("rest of empty");
        if let Value::Array(elements) = &empty_rest {
            assert!(elements.borrow().is_empty());
        }
    }

    #[test]
    fn delete_keys_values() {
        let hash = Value::hash();
        if let Value::Hash(pairs) = &hash {
            hash_set(pairs, Value::string("a"), Value::Int(1));
            hash_set(pairs, Value::string("b"), Value::Int(2));
        }
        let keys = builtin_keys(vec![hash.clone()]).expect("keys");
        let values = builtin_values(vec![hash.clone()]).expect("values");
        if let (Value::Array(keys), Value::Array(values)) = (&keys, &values) {
            let keys = keys.borrow();
            let values = values.borrow();
            assert_eq!(keys.len(), 2);
            assert!(keys.contains(&Value::string("a")));
            assert!(keys.contains(&Value::string("b")));
            assert_eq!(values.len(), 2);
            assert!(values.contains(&Value::Int(1)));
            assert!(values.contains(&Value::Int(2)));
        }
        assert_eq!(
            builtin_delete(vec![hash.clone(), Value::string("a")]),
            Ok(Value::Null)
        );
        assert_eq!(builtin_len(vec![hash]), Ok(Value::Int(1)));
    }

    #[test]
    fn str_and_type() {
        let s = Value::string("same");
        assert_eq!(builtin_str(vec![s.clone()]), Ok(s));
        assert_eq!(builtin_str(vec![Value::Int(42)]), Ok(Value::string("42")));
        assert_eq!(
            builtin_type(vec![Value::Bool(true)]),
            Ok(Value::string("BOOLEAN"))
        );
        assert_eq!(builtin_type(vec![Value::hash()]), Ok(Value::string("HASH")));
    }

    #[test]
    fn inspect_formats() {
        let arr = Value::array(vec![Value::Int(1), Value::string("a"), Value::Null]);
        assert_eq!(arr.inspect(), "[1, a, null]");
        let hash = Value::hash();
        if let Value::Hash(pairs) = &hash {
            hash_set(pairs, Value::Int(1), Value::Bool(true));
        }
        assert_eq!(hash.inspect(), "{1: true}");
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::string("").is_truthy());
    }
}
