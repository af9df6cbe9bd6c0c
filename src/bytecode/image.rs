use serde::{Deserialize, Serialize};

use crate::bytecode::chunk::Chunk;
use crate::lang::object::{FunctionObj, Heap, Obj, ObjRef};
use crate::lang::value::Value;

/// Bumped whenever the instruction set or the image layout changes.
pub const IMAGE_VERSION: u16 = 1;

// =============================================================================
// IMAGE - serialized bytecode programs (.cinb)
// =============================================================================

/// Portable form of a compiled script, encoded with postcard. Strings are
/// stored by content and re-interned on load, so identity equality holds for
/// thawed code exactly as it does for freshly compiled code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramImage {
    pub version: u16,
    pub script: FunctionImage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionImage {
    pub arity: u8,
    pub upvalue_count: u16,
    pub name: Option<String>,
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<ConstImage>,
}

/// Constant pools only ever hold immediates, strings, and nested functions;
/// closures, natives and upvalues are runtime-only objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConstImage {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
    Function(FunctionImage),
}

#[derive(Debug)]
pub enum ImageError {
    /// A constant that cannot occur in a compiled chunk (runtime-only object).
    UnsupportedConstant(&'static str),
    /// The image was produced by an incompatible format version.
    Version { found: u16 },
    /// postcard failed to encode or decode.
    Codec(postcard::Error),
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::UnsupportedConstant(kind) => {
                write!(f, "bytecode image error: cannot serialize a {} constant", kind)
            }
            ImageError::Version { found } => write!(
                f,
                "bytecode image error: format version {} (expected {})",
                found, IMAGE_VERSION
            ),
            ImageError::Codec(e) => write!(f, "bytecode image error: {}", e),
        }
    }
}

impl std::error::Error for ImageError {}

impl From<postcard::Error> for ImageError {
    fn from(e: postcard::Error) -> Self {
        ImageError::Codec(e)
    }
}

/// Serialize a compiled script function into image bytes.
pub fn freeze(heap: &Heap, function: ObjRef) -> Result<Vec<u8>, ImageError> {
    let image = ProgramImage {
        version: IMAGE_VERSION,
        script: freeze_function(heap, function)?,
    };
    Ok(postcard::to_allocvec(&image)?)
}

/// Decode image bytes into a live function, interning every string into the
/// given heap.
pub fn thaw(heap: &mut Heap, bytes: &[u8]) -> Result<ObjRef, ImageError> {
    let image: ProgramImage = postcard::from_bytes(bytes)?;
    if image.version != IMAGE_VERSION {
        return Err(ImageError::Version {
            found: image.version,
        });
    }
    Ok(thaw_function(heap, &image.script))
}

fn freeze_function(heap: &Heap, function: ObjRef) -> Result<FunctionImage, ImageError> {
    let func = heap.function(function);

    let mut constants = Vec::with_capacity(func.chunk.constants.len());
    for constant in &func.chunk.constants {
        constants.push(freeze_constant(heap, *constant)?);
    }

    Ok(FunctionImage {
        arity: func.arity,
        upvalue_count: func.upvalue_count as u16,
        name: func.name.map(|n| heap.str_chars(n).to_string()),
        code: func.chunk.code.clone(),
        lines: func.chunk.lines.clone(),
        constants,
    })
}

fn freeze_constant(heap: &Heap, value: Value) -> Result<ConstImage, ImageError> {
    let image = match value {
        Value::Nil => ConstImage::Nil,
        Value::Bool(b) => ConstImage::Bool(b),
        Value::Number(n) => ConstImage::Number(n),
        Value::Obj(r) => match heap.get(r) {
            Obj::Str(s) => ConstImage::Str(s.chars.clone()),
            Obj::Function(_) => ConstImage::Function(freeze_function(heap, r)?),
            Obj::Closure(_) => return Err(ImageError::UnsupportedConstant("closure")),
            Obj::Native(_) => return Err(ImageError::UnsupportedConstant("native function")),
            Obj::Upvalue(_) => return Err(ImageError::UnsupportedConstant("upvalue")),
        },
    };
    Ok(image)
}

fn thaw_function(heap: &mut Heap, image: &FunctionImage) -> ObjRef {
    let mut chunk = Chunk::new();
    chunk.code = image.code.clone();
    chunk.lines = image.lines.clone();

    for constant in &image.constants {
        let value = match constant {
            ConstImage::Nil => Value::Nil,
            ConstImage::Bool(b) => Value::Bool(*b),
            ConstImage::Number(n) => Value::Number(*n),
            ConstImage::Str(s) => Value::Obj(heap.intern(s)),
            ConstImage::Function(inner) => Value::Obj(thaw_function(heap, inner)),
        };
        chunk.constants.push(value);
    }

    let name = image.name.as_deref().map(|n| heap.intern(n));
    heap.alloc(Obj::Function(FunctionObj {
        arity: image.arity,
        upvalue_count: image.upvalue_count as usize,
        name,
        chunk,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile;

    fn compile_and_freeze(source: &str) -> Vec<u8> {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("compiles");
        freeze(&heap, function).expect("freezes")
    }

    #[test]
    fn test_freeze_thaw_preserves_code_and_constants() {
        let mut heap = Heap::new();
        let function = compile("print 1 + 2;", &mut heap).expect("compiles");
        let bytes = freeze(&heap, function).expect("freezes");

        let mut fresh = Heap::new();
        let thawed = thaw(&mut fresh, &bytes).expect("thaws");

        let before = heap.function(function);
        let after = fresh.function(thawed);
        assert_eq!(before.chunk.code, after.chunk.code);
        assert_eq!(before.chunk.lines, after.chunk.lines);
        assert_eq!(before.chunk.constants.len(), after.chunk.constants.len());
    }

    #[test]
    fn test_thawed_strings_are_interned() {
        let bytes = compile_and_freeze("var greeting = \"hi\"; print \"hi\";");

        let mut heap = Heap::new();
        let thawed = thaw(&mut heap, &bytes).expect("thaws");

        // The two "hi" constants must collapse to one handle in the new heap.
        let strings: Vec<ObjRef> = heap
            .function(thawed)
            .chunk
            .constants
            .iter()
            .filter_map(|c| c.as_obj())
            .filter(|r| matches!(heap.get(*r), Obj::Str(s) if s.chars == "hi"))
            .collect();
        assert_eq!(strings.len(), 2);
        assert_eq!(strings[0], strings[1]);
    }

    #[test]
    fn test_nested_functions_survive_round_trip() {
        let bytes = compile_and_freeze("fun twice(x) { return x + x; } print twice(4);");

        let mut heap = Heap::new();
        let thawed = thaw(&mut heap, &bytes).expect("thaws");

        let inner = heap
            .function(thawed)
            .chunk
            .constants
            .iter()
            .filter_map(|c| c.as_obj())
            .find(|r| matches!(heap.get(*r), Obj::Function(_)))
            .expect("nested function constant");
        let func = heap.function(inner);
        assert_eq!(func.arity, 1);
        assert_eq!(heap.str_chars(func.name.expect("named")), "twice");
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut heap = Heap::new();
        let function = compile("1;", &mut heap).expect("compiles");
        let bytes = freeze(&heap, function).expect("freezes");

        let mut image: ProgramImage = postcard::from_bytes(&bytes).expect("decodes");
        image.version = IMAGE_VERSION + 1;
        let tampered = postcard::to_allocvec(&image).expect("encodes");

        let mut fresh = Heap::new();
        assert!(matches!(
            thaw(&mut fresh, &tampered),
            Err(ImageError::Version { .. })
        ));
    }

    #[test]
    fn test_garbage_bytes_are_a_codec_error() {
        let mut heap = Heap::new();
        assert!(matches!(
            thaw(&mut heap, &[0xde, 0xad, 0xbe, 0xef]),
            Err(ImageError::Codec(_) | ImageError::Version { .. })
        ));
    }
}
