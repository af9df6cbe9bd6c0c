use crate::bytecode::chunk::Chunk;
use crate::lang::table::Table;
use crate::lang::value::Value;

/// Handle to a heap object. Plain index into the arena; handles are never
/// invalidated because objects live until the heap itself is dropped.
/// Handle equality is object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(u32);

impl ObjRef {
    fn index(self) -> usize {
        self.0 as usize
    }
}

pub type NativeFn = fn(&[Value]) -> Value;

/// Immutable interned string: contents plus its precomputed FNV-1a hash.
#[derive(Debug)]
pub struct StrObj {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function: created once by the compiler, immutable afterwards.
/// `name` is `None` for the implicit top-level script.
#[derive(Debug)]
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

/// Runtime instantiation of a function literal. One per evaluation of the
/// literal, so a literal inside a loop yields many closures over one function.
#[derive(Debug)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug)]
pub struct NativeObj {
    pub name: &'static str,
    pub function: NativeFn,
}

/// A captured variable. Open while the defining frame is live (the payload is
/// an absolute value-stack slot), closed once that frame returns (the payload
/// is the moved-out value). The transition is one-way.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub enum Obj {
    Str(StrObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Native(NativeObj),
    Upvalue(Upvalue),
}

/// The object heap: an arena in allocation order plus the string-intern set.
///
/// Nothing is freed during execution; dropping the heap releases every object
/// at once, which is the VM's bulk-teardown path.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Obj>,
    strings: Table,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            strings: Table::new(),
        }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let r = ObjRef(self.objects.len() as u32);
        self.objects.push(obj);
        r
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.objects[r.index()]
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.objects[r.index()]
    }

    /// Canonical handle for a string with these contents. Looks the contents
    /// up in the intern set first; only on a miss does a new object get
    /// allocated and registered, so equal-content strings share one handle.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);

        let objects = &self.objects;
        let existing = self.strings.find_with(hash, |r| {
            matches!(&objects[r.index()], Obj::Str(s) if s.chars == chars)
        });
        if let Some(r) = existing {
            return r;
        }

        let r = ObjRef(self.objects.len() as u32);
        self.objects.push(Obj::Str(StrObj {
            chars: chars.to_string(),
            hash,
        }));
        self.strings.set(r, hash, Value::Nil);
        r
    }

    pub fn str_chars(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::Str(s) => &s.chars,
            _ => unreachable!("handle is not a string"),
        }
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        match self.get(r) {
            Obj::Str(s) => s.hash,
            _ => unreachable!("handle is not a string"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!("handle is not a function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ClosureObj {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("handle is not a closure"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("handle is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("handle is not an upvalue"),
        }
    }

    /// Function name for diagnostics; `None` for the top-level script.
    pub fn function_name(&self, r: ObjRef) -> Option<&str> {
        self.function(r).name.map(|n| self.str_chars(n))
    }

    pub fn show_object(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::Str(s) => s.chars.clone(),
            Obj::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.str_chars(name)),
                None => "<script>".to_string(),
            },
            Obj::Closure(c) => self.show_object(c.function),
            Obj::Native(n) => format!("<native fn {}>", n.name),
            Obj::Upvalue(_) => "upvalue".to_string(),
        }
    }

    pub fn object_type_name(&self, r: ObjRef) -> &'static str {
        match self.get(r) {
            Obj::Str(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Upvalue(_) => "upvalue",
        }
    }
}

/// FNV-1a over the UTF-8 bytes.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
    }

    #[test]
    fn test_intern_dedupes() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        assert_eq!(heap.str_chars(a), "hello");
    }

    #[test]
    fn test_intern_distinct_contents() {
        let mut heap = Heap::new();
        let a = heap.intern("left");
        let b = heap.intern("right");
        assert_ne!(a, b);
    }

    #[test]
    fn test_allocation_order_is_preserved() {
        let mut heap = Heap::new();
        let a = heap.intern("first");
        let b = heap.intern("second");
        assert!(a.index() < b.index());
    }

    #[test]
    fn test_show_function() {
        let mut heap = Heap::new();
        let name = heap.intern("whittle");
        let f = heap.alloc(Obj::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            name: Some(name),
            chunk: Chunk::new(),
        }));
        assert_eq!(heap.show_object(f), "<fn whittle>");

        let script = heap.alloc(Obj::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            name: None,
            chunk: Chunk::new(),
        }));
        assert_eq!(heap.show_object(script), "<script>");
    }

    #[test]
    fn test_upvalue_close_transition() {
        let mut heap = Heap::new();
        let u = heap.alloc(Obj::Upvalue(Upvalue::Open(3)));
        assert!(matches!(heap.upvalue(u), Upvalue::Open(3)));

        *heap.upvalue_mut(u) = Upvalue::Closed(Value::Number(7.0));
        assert!(matches!(
            heap.upvalue(u),
            Upvalue::Closed(Value::Number(n)) if *n == 7.0
        ));
    }
}
