//! Heap objects and the per-VM heap that owns them.
//!
//! Every object allocated while compiling or running a program is pushed
//! into one [`Heap`] and addressed by a copyable [`ObjRef`] handle. Nothing
//! is reclaimed mid-run; the whole graph drops with the heap when the VM
//! shuts down. Strings are interned: allocating the same bytes twice yields
//! the same handle, so interned-string equality is handle equality.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::typeid;
use crate::value::{Value, format_number};

/// Handle to a heap object. Plain index, `Copy`, compared by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Construct from a raw index. Only meaningful for handles that came
    /// out of the owning heap; exposed for tests and serialization.
    pub fn from_raw(raw: u32) -> ObjRef {
        ObjRef(raw)
    }
}

/// Identifier of a native function in the VM's registry. The heap stores
/// these instead of function pointers so this crate stays independent of
/// the VM type.
pub type NativeId = u32;

#[derive(Debug)]
pub struct StrObj {
    pub text: Box<str>,
    pub hash: u32,
}

#[derive(Debug)]
pub struct FunctionObj {
    pub arity: usize,
    /// Interned name; `None` for the top-level script.
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

#[derive(Debug)]
pub struct NativeObj {
    pub native: NativeId,
    pub name: String,
}

/// Ordered name/value entries exposing builtins by dotted access.
#[derive(Debug)]
pub struct NamespaceObj {
    pub name: String,
    pub entries: Vec<(String, Value)>,
}

impl NamespaceObj {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
            return;
        }
        self.entries.push((name.to_string(), value));
    }
}

#[derive(Debug)]
pub struct ArrayObj {
    pub values: Vec<Value>,
}

/// What a bound method will call when invoked.
#[derive(Debug, Clone, Copy)]
pub enum BoundCallable {
    Function(ObjRef),
    Native(NativeId),
}

#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub callable: BoundCallable,
    pub name: String,
}

#[derive(Debug)]
pub struct DictObj {
    pub table: Table,
}

#[derive(Debug)]
pub struct PropertyDef {
    /// Interned property name.
    pub name: ObjRef,
    pub default: Value,
    pub is_private: bool,
    /// Index into the instance fields array.
    pub index: usize,
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: ObjRef,
    pub properties: Vec<PropertyDef>,
    pub methods: Table,
    pub private_methods: Table,
    /// Bytecode `init` method, if declared.
    pub initializer: Option<ObjRef>,
    /// Native initializer, for classes provided by builtin namespaces.
    pub native_initializer: Option<NativeId>,
}

#[derive(Debug)]
pub struct InstanceObj {
    pub class: ObjRef,
    /// One slot per class property, indexed by `PropertyDef::index`.
    pub fields: Vec<Value>,
}

#[derive(Debug)]
pub struct U8ArrayObj {
    pub values: Vec<u8>,
}

#[derive(Debug)]
pub struct ErrorObj {
    /// Interned message string.
    pub msg: ObjRef,
}

/// Every heap object kind.
#[derive(Debug)]
pub enum Obj {
    Str(StrObj),
    Function(FunctionObj),
    Native(NativeObj),
    Namespace(NamespaceObj),
    Array(ArrayObj),
    BoundMethod(BoundMethodObj),
    Dict(DictObj),
    Class(ClassObj),
    Instance(InstanceObj),
    U8Array(U8ArrayObj),
    Error(ErrorObj),
}

/// 32-bit FNV-1a.
pub fn hash_string(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Arena of heap objects for one VM run.
///
/// Object lifetime is the heap's lifetime: handles stay valid until the
/// heap drops. The intern set maps string content to the canonical handle.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Obj>,
    strings: Table,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        let index = self.objects.len();
        self.objects.push(obj);
        ObjRef(index as u32)
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.objects[r.index()]
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.objects[r.index()]
    }

    // ---- strings -------------------------------------------------------

    /// Intern a string: returns the canonical handle for these bytes,
    /// allocating only when the content is new.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_string(text.as_bytes());
        let objects = &self.objects;
        if let Some(existing) = self.strings.find_str(hash, |key| {
            matches!(&objects[key.index()], Obj::Str(s) if &*s.text == text)
        }) {
            return existing;
        }

        let r = self.alloc(Obj::Str(StrObj {
            text: text.into(),
            hash,
        }));
        self.strings.set(r, hash, Value::Null);
        r
    }

    pub fn str_text(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::Str(s) => &s.text,
            other => unreachable!("expected string object, got {:?}", other),
        }
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        match self.get(r) {
            Obj::Str(s) => s.hash,
            other => unreachable!("expected string object, got {:?}", other),
        }
    }

    pub fn as_str(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Obj::Str(_)) => Some(r),
            _ => None,
        }
    }

    // ---- constructors --------------------------------------------------

    pub fn new_function(&mut self, f: FunctionObj) -> ObjRef {
        self.alloc(Obj::Function(f))
    }

    pub fn new_native(&mut self, native: NativeId, name: &str) -> ObjRef {
        self.alloc(Obj::Native(NativeObj {
            native,
            name: name.to_string(),
        }))
    }

    pub fn new_namespace(&mut self, name: &str) -> ObjRef {
        self.alloc(Obj::Namespace(NamespaceObj {
            name: name.to_string(),
            entries: Vec::new(),
        }))
    }

    pub fn new_array(&mut self, values: Vec<Value>) -> ObjRef {
        self.alloc(Obj::Array(ArrayObj { values }))
    }

    pub fn new_array_with_capacity(&mut self, capacity: usize) -> ObjRef {
        self.alloc(Obj::Array(ArrayObj {
            values: Vec::with_capacity(capacity),
        }))
    }

    pub fn new_bound_method(
        &mut self,
        receiver: Value,
        callable: BoundCallable,
        name: &str,
    ) -> ObjRef {
        self.alloc(Obj::BoundMethod(BoundMethodObj {
            receiver,
            callable,
            name: name.to_string(),
        }))
    }

    pub fn new_dict(&mut self) -> ObjRef {
        self.alloc(Obj::Dict(DictObj {
            table: Table::new(),
        }))
    }

    pub fn new_class(&mut self, name: ObjRef) -> ObjRef {
        self.alloc(Obj::Class(ClassObj {
            name,
            properties: Vec::new(),
            methods: Table::new(),
            private_methods: Table::new(),
            initializer: None,
            native_initializer: None,
        }))
    }

    /// Create an instance with its fields populated from the class's
    /// property defaults. Upholds `fields.len == property_count`.
    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        let fields: Vec<Value> = match self.get(class) {
            Obj::Class(c) => c.properties.iter().map(|p| p.default).collect(),
            other => unreachable!("expected class object, got {:?}", other),
        };
        self.alloc(Obj::Instance(InstanceObj { class, fields }))
    }

    pub fn new_u8array(&mut self, values: Vec<u8>) -> ObjRef {
        self.alloc(Obj::U8Array(U8ArrayObj { values }))
    }

    pub fn new_error(&mut self, msg: &str) -> ObjRef {
        let msg = self.intern(msg);
        self.alloc(Obj::Error(ErrorObj { msg }))
    }

    // ---- typed accessors ----------------------------------------------

    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match self.get(r) {
            Obj::Function(f) => f,
            other => unreachable!("expected function object, got {:?}", other),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut FunctionObj {
        match self.get_mut(r) {
            Obj::Function(f) => f,
            other => unreachable!("expected function object, got {:?}", other),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ClassObj {
        match self.get(r) {
            Obj::Class(c) => c,
            other => unreachable!("expected class object, got {:?}", other),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            other => unreachable!("expected class object, got {:?}", other),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &InstanceObj {
        match self.get(r) {
            Obj::Instance(i) => i,
            other => unreachable!("expected instance object, got {:?}", other),
        }
    }

    // ---- type ids ------------------------------------------------------

    pub fn type_id(&self, v: Value) -> i32 {
        match v {
            Value::Bool(_) => typeid::BOOL,
            Value::Null => typeid::NULL,
            Value::Number(_) => typeid::NUMBER,
            Value::Obj(r) => match self.get(r) {
                Obj::Str(_) => typeid::STRING,
                Obj::Function(_) => typeid::FUNCTION,
                Obj::Native(_) => typeid::NATIVE_FUNCTION,
                Obj::Namespace(_) => typeid::NAMESPACE,
                Obj::Array(_) => typeid::ARRAY,
                Obj::BoundMethod(_) => typeid::BOUND_METHOD,
                Obj::Dict(_) => typeid::DICT,
                Obj::Class(_) => typeid::CLASS,
                Obj::Instance(_) => typeid::INSTANCE,
                Obj::U8Array(_) => typeid::U8ARRAY,
                Obj::Error(_) => typeid::ERROR,
            },
        }
    }

    // ---- equality ------------------------------------------------------

    /// Language-level `==`: structural for primitives, interned strings,
    /// arrays and dicts; identity for every other object kind.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Null, Value::Null) => true,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => {
                if x == y {
                    return true;
                }
                match (self.get(x), self.get(y)) {
                    (Obj::Str(sa), Obj::Str(sb)) => {
                        // Interning collapses equal strings to one handle,
                        // so distinct handles only match if a string came
                        // from outside the intern set. Compare anyway.
                        sa.hash == sb.hash && sa.text == sb.text
                    }
                    (Obj::Array(aa), Obj::Array(ab)) => {
                        aa.values.len() == ab.values.len()
                            && aa
                                .values
                                .iter()
                                .zip(ab.values.iter())
                                .all(|(&x, &y)| self.values_equal(x, y))
                    }
                    (Obj::Dict(da), Obj::Dict(db)) => {
                        da.table.len() == db.table.len()
                            && da.table.iter().all(|(key, value)| {
                                db.table
                                    .get(key, self.str_hash(key))
                                    .is_some_and(|other| self.values_equal(value, other))
                            })
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    // ---- display -------------------------------------------------------

    /// Render a value the way `io.println` prints it.
    pub fn format_value(&self, v: Value) -> String {
        match v {
            Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
            Value::Null => "null".to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.format_obj(r),
        }
    }

    fn format_obj(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::Str(s) => s.text.to_string(),
            Obj::Function(f) => match f.name {
                Some(name) => format!("<Function {}>", self.str_text(name)),
                None => "<script>".to_string(),
            },
            Obj::Native(n) => format!("<Function ::{}>", n.name),
            Obj::Namespace(ns) => format!("<Namespace {}>", ns.name),
            Obj::Array(a) => {
                let items: Vec<String> =
                    a.values.iter().map(|&v| self.format_value(v)).collect();
                format!("[ {} ]", items.join(", "))
            }
            Obj::BoundMethod(bm) => format!("<BoundMethod {}>", bm.name),
            Obj::Dict(d) => {
                let items: Vec<String> = d
                    .table
                    .iter()
                    .map(|(k, v)| format!("\"{}\": {}", self.str_text(k), self.format_value(v)))
                    .collect();
                format!("{{ {} }}", items.join(", "))
            }
            Obj::Class(c) => format!("<Class {}>", self.str_text(c.name)),
            Obj::Instance(i) => {
                format!("<{} : instance>", self.str_text(self.class(i.class).name))
            }
            Obj::U8Array(a) => {
                let items: Vec<String> = a.values.iter().map(|b| b.to_string()).collect();
                format!("[ {} ]", items.join(", "))
            }
            Obj::Error(e) => format!("<Error {}>", self.str_text(e.msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_collapses_equal_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_text(a), "hello");
    }

    #[test]
    fn test_interning_property_holds_across_many_strings() {
        let mut heap = Heap::new();
        let mut handles = Vec::new();
        for n in 0..200 {
            handles.push(heap.intern(&format!("s{}", n)));
        }
        for (n, &h) in handles.iter().enumerate() {
            assert_eq!(heap.intern(&format!("s{}", n)), h);
        }
    }

    #[test]
    fn test_instance_fields_match_property_count() {
        let mut heap = Heap::new();
        let name = heap.intern("Point");
        let class = heap.new_class(name);
        for (i, prop) in ["x", "y"].iter().enumerate() {
            let pname = heap.intern(prop);
            heap.class_mut(class).properties.push(PropertyDef {
                name: pname,
                default: Value::Number(i as f64),
                is_private: false,
                index: i,
            });
        }
        let inst = heap.new_instance(class);
        let inst = heap.instance(inst);
        assert_eq!(inst.fields.len(), heap.class(class).properties.len());
        assert_eq!(inst.fields[1], Value::Number(1.0));
    }

    #[test]
    fn test_values_equal_structural_arrays() {
        let mut heap = Heap::new();
        let a = heap.new_array(vec![Value::Number(1.0), Value::Number(2.0)]);
        let b = heap.new_array(vec![Value::Number(1.0), Value::Number(2.0)]);
        let c = heap.new_array(vec![Value::Number(1.0)]);
        assert!(heap.values_equal(Value::Obj(a), Value::Obj(b)));
        assert!(!heap.values_equal(Value::Obj(a), Value::Obj(c)));
    }

    #[test]
    fn test_values_equal_dicts_as_sets() {
        let mut heap = Heap::new();
        let (k1, k2) = (heap.intern("a"), heap.intern("b"));
        let (h1, h2) = (heap.str_hash(k1), heap.str_hash(k2));
        let da = heap.new_dict();
        let db = heap.new_dict();
        // Insert in opposite orders; equality is order-independent.
        match heap.get_mut(da) {
            Obj::Dict(d) => {
                d.table.set(k1, h1, Value::Number(1.0));
                d.table.set(k2, h2, Value::Number(2.0));
            }
            _ => unreachable!(),
        }
        match heap.get_mut(db) {
            Obj::Dict(d) => {
                d.table.set(k2, h2, Value::Number(2.0));
                d.table.set(k1, h1, Value::Number(1.0));
            }
            _ => unreachable!(),
        }
        assert!(heap.values_equal(Value::Obj(da), Value::Obj(db)));
    }

    #[test]
    fn test_type_id_total_over_variants() {
        let mut heap = Heap::new();
        let s = heap.intern("s");
        let arr = heap.new_array(Vec::new());
        let cases = [
            (Value::Bool(true), typeid::BOOL),
            (Value::Null, typeid::NULL),
            (Value::Number(1.0), typeid::NUMBER),
            (Value::Obj(s), typeid::STRING),
            (Value::Obj(arr), typeid::ARRAY),
        ];
        for (v, id) in cases {
            assert_eq!(heap.type_id(v), id);
        }
    }

    #[test]
    fn test_format_values() {
        let mut heap = Heap::new();
        let s = heap.intern("hi");
        let arr = heap.new_array(vec![Value::Number(1.0), Value::Obj(s)]);
        assert_eq!(heap.format_value(Value::Obj(s)), "hi");
        assert_eq!(heap.format_value(Value::Obj(arr)), "[ 1, hi ]");
        assert_eq!(heap.format_value(Value::Number(55.0)), "55");
        assert_eq!(heap.format_value(Value::Null), "null");
    }
}
