//! Module image format (C4) and loader (C5).
//!
//! The on-disk/over-the-wire shape of a compiled module: a magic+version
//! header followed by a sequence of tagged, length-prefixed chunks, padded
//! to a 4-byte boundary. The chunk names (`AtU8`, `ImpT`, `ExpT`, `LitT`,
//! `Code`) are deliberately the same ones BEAM's own `.beam` format uses —
//! it is a well-proven shape for "old tools keep working when a new,
//! unknown chunk type shows up" and spec §4.9's hot-loading story assumes
//! exactly this kind of chunked image. Each chunk's payload is bincode —
//! every structure it carries (`BytecodeFunction`, `Value`, ...) already
//! derives `Serialize`/`Deserialize`, and `bincode` is already a stack
//! dependency for this purpose, so hand-rolling a second binary encoding
//! on top of a binary encoding would be pure duplication.
//!
//! Grounded on the teacher's `bytecode/registry.rs` load/purge vocabulary
//! for what happens to a decoded image once it exists: `ModuleLoader::load`
//! is a thin decode-then-`ModuleRegistry::load` pipeline, not a second
//! place module versioning logic lives.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};

use crate::bytecode::program::{BytecodeFunction, BytecodeProgram, FunctionSignature, ImportInfo};
use crate::bytecode::registry::ModuleRegistry;
use crate::bytecode::Value;
use crate::error::{LoaderError, LoaderResult};

const MAGIC: &[u8; 4] = b"RE4M";
const SUPPORTED_VERSION: u32 = 1;
const CHUNK_ALIGN: usize = 4;

const TAG_ATOMS: [u8; 4] = *b"AtU8";
const TAG_IMPORTS: [u8; 4] = *b"ImpT";
const TAG_EXPORTS: [u8; 4] = *b"ExpT";
const TAG_LITERALS: [u8; 4] = *b"LitT";
const TAG_CODE: [u8; 4] = *b"Code";
const TAG_STRINGS: [u8; 4] = *b"StrT";
const TAG_ATTRIBUTES: [u8; 4] = *b"Attr";

const REQUIRED_CHUNKS: [(&str, [u8; 4]); 5] =
    [("AtU8", TAG_ATOMS), ("ImpT", TAG_IMPORTS), ("ExpT", TAG_EXPORTS), ("LitT", TAG_LITERALS), ("Code", TAG_CODE)];

fn tag_name(tag: &[u8; 4]) -> &'static str {
    match *tag {
        TAG_ATOMS => "AtU8",
        TAG_IMPORTS => "ImpT",
        TAG_EXPORTS => "ExpT",
        TAG_LITERALS => "LitT",
        TAG_CODE => "Code",
        TAG_STRINGS => "StrT",
        TAG_ATTRIBUTES => "Attr",
        _ => "Unkn",
    }
}

fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) / align * align
}

/// One import, as stored in the `ImpT` chunk: atom-table indices for the
/// callee's module and function name, plus its arity. Resolved against the
/// `AtU8` table at decode time, matching how `ExpT` resolves its own names
/// — real atom-index indirection, not strings duplicated per chunk.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RawImport {
    module_atom: u32,
    function_atom: u32,
    arity: u8,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RawExport {
    function_atom: u32,
    arity: u8,
    function_id: u32,
}

/// A fully parsed module image: header plus every chunk's raw bytes, keyed
/// by tag, before any chunk has been decoded into program structures. Kept
/// as its own type (rather than decoding straight into a `BytecodeProgram`)
/// so `parse` and `decode` can be tested and reasoned about separately —
/// `parse` only ever fails on structural problems (`BadMagic`,
/// `ChunkOverflow`, `MissingChunk`); `decode` is where a corrupt or
/// out-of-range payload surfaces.
#[derive(Debug, Clone)]
pub struct ModuleImage {
    pub version: u32,
    chunks: HashMap<[u8; 4], Vec<u8>>,
}

impl ModuleImage {
    /// Parse a byte buffer into chunks without interpreting any of them.
    pub fn parse(bytes: &[u8]) -> LoaderResult<Self> {
        if bytes.len() < 8 || &bytes[0..4] != MAGIC.as_slice() {
            return Err(LoaderError::BadMagic);
        }
        let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        if version != SUPPORTED_VERSION {
            return Err(LoaderError::UnsupportedVersion(version));
        }

        let mut chunks = HashMap::new();
        let mut offset = 8usize;
        while offset < bytes.len() {
            if offset + 8 > bytes.len() {
                return Err(LoaderError::ChunkOverflow("<header>"));
            }
            let tag: [u8; 4] = bytes[offset..offset + 4].try_into().unwrap();
            let len = u32::from_be_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
            let payload_start = offset + 8;
            let payload_end =
                payload_start.checked_add(len).filter(|&end| end <= bytes.len()).ok_or(LoaderError::ChunkOverflow(tag_name(&tag)))?;

            chunks.insert(tag, bytes[payload_start..payload_end].to_vec());
            offset = payload_start + align_up(len, CHUNK_ALIGN);
        }

        for (name, tag) in REQUIRED_CHUNKS {
            if !chunks.contains_key(&tag) {
                return Err(LoaderError::MissingChunk(name));
            }
        }

        Ok(ModuleImage { version, chunks })
    }

    pub fn has_chunk(&self, tag: &[u8; 4]) -> bool {
        self.chunks.contains_key(tag)
    }

    fn decode_chunk<T: DeserializeOwned>(&self, tag: [u8; 4]) -> LoaderResult<T> {
        let data = self.chunks.get(&tag).ok_or_else(|| LoaderError::MissingChunk(tag_name(&tag)))?;
        bincode::deserialize(data).map_err(|e| LoaderError::Malformed(tag_name(&tag), e.to_string()))
    }

    pub fn atoms(&self) -> LoaderResult<Vec<String>> {
        self.decode_chunk(TAG_ATOMS)
    }

    fn raw_imports(&self) -> LoaderResult<Vec<RawImport>> {
        self.decode_chunk(TAG_IMPORTS)
    }

    fn raw_exports(&self) -> LoaderResult<Vec<RawExport>> {
        self.decode_chunk(TAG_EXPORTS)
    }

    pub fn literals(&self) -> LoaderResult<Vec<Value>> {
        self.decode_chunk(TAG_LITERALS)
    }

    pub fn functions(&self) -> LoaderResult<Vec<BytecodeFunction>> {
        self.decode_chunk(TAG_CODE)
    }

    pub fn attributes(&self) -> LoaderResult<HashMap<String, String>> {
        if !self.has_chunk(&TAG_ATTRIBUTES) {
            return Ok(HashMap::new());
        }
        self.decode_chunk(TAG_ATTRIBUTES)
    }

    fn resolve_atom<'a>(atoms: &'a [String], idx: u32, chunk: &'static str) -> LoaderResult<&'a str> {
        atoms.get(idx as usize).map(String::as_str).ok_or(LoaderError::IndexOutOfBounds { chunk, index: idx })
    }

    /// Fully decode this image into a program the registry can run,
    /// resolving every atom-table reference along the way.
    pub fn decode(&self, module_name: &str) -> LoaderResult<BytecodeProgram> {
        let atoms = self.atoms()?;
        let mut program = BytecodeProgram::new(module_name.to_string());
        program.constants = self.literals()?;

        for function in self.functions()? {
            program.add_function(function);
        }

        for export in self.raw_exports()? {
            let name = Self::resolve_atom(&atoms, export.function_atom, "ExpT")?;
            program.export_function(name.to_string(), export.function_id).map_err(|e| {
                LoaderError::Malformed("ExpT", e.to_string())
            })?;
        }

        for import in self.raw_imports()? {
            let module = Self::resolve_atom(&atoms, import.module_atom, "ImpT")?.to_string();
            let function = Self::resolve_atom(&atoms, import.function_atom, "ImpT")?.to_string();
            let key = format!("{module}:{function}/{}", import.arity);
            let signature = FunctionSignature {
                params: Vec::new(),
                return_type: crate::bytecode::TypeInfo::Unknown,
                effects: crate::types::EffectGrade::Pure,
            };
            program.import_function(key, ImportInfo { module, function, signature });
        }

        Ok(program)
    }

    /// Encode a set of already-decoded chunk payloads into a byte image.
    /// Exists for tests and any offline tooling that produces images
    /// in-process rather than shelling out to a separate compiler; the
    /// compiler that turns source text into these chunks is out of scope
    /// (spec §1 Non-goals).
    pub fn build(chunks: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&SUPPORTED_VERSION.to_be_bytes());
        for (tag, payload) in chunks {
            out.extend_from_slice(tag.as_slice());
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(payload);
            let padding = align_up(payload.len(), CHUNK_ALIGN) - payload.len();
            out.extend(std::iter::repeat(0u8).take(padding));
        }
        out
    }
}

/// Builds a [`ModuleImage`]'s required chunks from already-assembled parts,
/// encoding each with bincode — the counterpart to `ModuleImage::build` for
/// callers that think in terms of atoms/imports/exports/literals/functions
/// rather than raw byte slices.
#[derive(Default)]
pub struct ModuleImageBuilder {
    atoms: Vec<String>,
    imports: Vec<RawImport>,
    exports: Vec<RawExport>,
    literals: Vec<Value>,
    functions: Vec<BytecodeFunction>,
}

impl ModuleImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns an atom, returning its index; reuses an existing entry if
    /// the name was already added.
    pub fn intern_atom(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.atoms.iter().position(|a| a == name) {
            return idx as u32;
        }
        self.atoms.push(name.to_string());
        (self.atoms.len() - 1) as u32
    }

    pub fn add_import(&mut self, module: &str, function: &str, arity: u8) {
        let module_atom = self.intern_atom(module);
        let function_atom = self.intern_atom(function);
        self.imports.push(RawImport { module_atom, function_atom, arity });
    }

    pub fn add_export(&mut self, function: &str, arity: u8, function_id: u32) {
        let function_atom = self.intern_atom(function);
        self.exports.push(RawExport { function_atom, arity, function_id });
    }

    pub fn add_literal(&mut self, value: Value) -> u32 {
        self.literals.push(value);
        (self.literals.len() - 1) as u32
    }

    pub fn add_function(&mut self, function: BytecodeFunction) {
        self.functions.push(function);
    }

    pub fn build(&self) -> LoaderResult<Vec<u8>> {
        let atoms = encode(&self.atoms)?;
        let imports = encode(&self.imports)?;
        let exports = encode(&self.exports)?;
        let literals = encode(&self.literals)?;
        let functions = encode(&self.functions)?;

        Ok(ModuleImage::build(&[
            (&TAG_ATOMS, &atoms),
            (&TAG_IMPORTS, &imports),
            (&TAG_EXPORTS, &exports),
            (&TAG_LITERALS, &literals),
            (&TAG_CODE, &functions),
        ]))
    }
}

fn encode<T: Serialize>(value: &T) -> LoaderResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| LoaderError::Malformed("<encode>", e.to_string()))
}

/// Ties `ModuleImage` decoding to `ModuleRegistry` residency: the surface
/// `runtime::mod`'s hot-loading control operations (spec §4.9/§6) call.
pub struct ModuleLoader<'a> {
    registry: &'a ModuleRegistry,
}

impl<'a> ModuleLoader<'a> {
    pub fn new(registry: &'a ModuleRegistry) -> Self {
        ModuleLoader { registry }
    }

    /// Parse, decode, and install `bytes` as `module_name`'s current
    /// version. Fails the same way `ModuleRegistry::load` does if an old,
    /// still-busy version is already resident (spec §4.9's "only two
    /// versions" rule).
    pub fn load(&self, module_name: &str, bytes: &[u8]) -> LoaderResult<()> {
        let image = ModuleImage::parse(bytes)?;
        let program = image.decode(module_name)?;
        self.registry.load(module_name, program)
    }

    pub fn purge(&self, module_name: &str) -> LoaderResult<()> {
        self.registry.purge(module_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Bytecode;
    use crate::types::EffectGrade;

    fn sample_image() -> Vec<u8> {
        let mut builder = ModuleImageBuilder::new();
        builder.add_literal(Value::Int(41));
        let mut function = BytecodeFunction::new(0, "main".to_string(), 0);
        function.add_instruction(Bytecode::Const(0, EffectGrade::Pure));
        function.add_instruction(Bytecode::Ret(EffectGrade::Pure));
        builder.add_function(function);
        builder.add_export("main", 0, 0);
        builder.add_import("io", "format", 1);
        builder.build().unwrap()
    }

    #[test]
    fn round_trips_through_parse_and_decode() {
        let bytes = sample_image();
        let image = ModuleImage::parse(&bytes).unwrap();
        let program = image.decode("m").unwrap();
        assert_eq!(program.constants, vec![Value::Int(41)]);
        assert!(program.get_function_by_name("main").is_some());
        assert!(program.imports.contains_key("io:format/1"));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_image();
        bytes[0] = b'X';
        assert!(matches!(ModuleImage::parse(&bytes), Err(LoaderError::BadMagic)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = sample_image();
        bytes[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(ModuleImage::parse(&bytes), Err(LoaderError::UnsupportedVersion(99))));
    }

    #[test]
    fn rejects_missing_required_chunk() {
        // An image with only the Code chunk, lacking AtU8/ImpT/ExpT/LitT.
        let mut function_bytes = Vec::new();
        function_bytes.extend_from_slice(MAGIC);
        function_bytes.extend_from_slice(&SUPPORTED_VERSION.to_be_bytes());
        let payload = encode::<Vec<BytecodeFunction>>(&Vec::new()).unwrap();
        let bytes = ModuleImage::build(&[(&TAG_CODE, &payload)]);
        assert!(matches!(ModuleImage::parse(&bytes), Err(LoaderError::MissingChunk("AtU8"))));
    }

    #[test]
    fn rejects_truncated_chunk_length() {
        let mut bytes = sample_image();
        // Byte 12 is the most-significant byte of the first chunk's 4-byte
        // BE length (tag occupies 8..12); inflating it runs the chunk past
        // the end of the image.
        bytes[12] = 0xff;
        assert!(matches!(ModuleImage::parse(&bytes), Err(LoaderError::ChunkOverflow(_))));
    }

    #[test]
    fn loader_installs_into_registry() {
        let bytes = sample_image();
        let registry = ModuleRegistry::new();
        let loader = ModuleLoader::new(&registry);
        loader.load("m", &bytes).unwrap();
        assert!(registry.current("m").is_some());
    }
}
