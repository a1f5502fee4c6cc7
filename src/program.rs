// File: src/program.rs
//
// The program image: the immutable, linkable artifact produced by the
// compiler and executed by the VM. Holds the constant pools, the function
// table, the linked bytecode stream, and the optional debug tables.
//
// Binary layout (all integers little-endian):
//
// +--------------------+
// | Magic (4 bytes)    |  "RILB"
// +--------------------+
// | Version (u16)      |
// +--------------------+
// | #numbers (u32)     |  then that many f64
// | #strings (u32)     |  then (u32 length + UTF-8 bytes) each
// | #functions (u32)   |  then the function table
// | bytecode len (u32) |  then the bytecode bytes
// | debug len (u32)    |  then the debug section (zero length = absent)
// +--------------------+

use crate::bytecode;
use crate::errors::ScriptError;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

/// Magic bytes identifying a Rill program image
pub const MAGIC: &[u8; 4] = b"RILB";

/// Current image format version. Images are not compatible across versions;
/// the loader rejects anything else.
pub const VERSION: u16 = 4;

/// Where a closure's upvalue slot is captured from, relative to the frame
/// executing the `Closure` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// The creating frame's i-th own cell (a captured local of that frame)
    LocalCell(u16),
    /// The creating frame's j-th received upvalue
    Upvalue(u16),
}

/// What a handler does when it catches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Jumps to a catch block that binds the error value
    Catch,
    /// Jumps to a generated finally block that re-raises afterwards
    Finally,
}

/// A try handler: an instruction range and the target to jump to when an
/// instruction inside the range fails. The error value is pushed before the
/// jump. Records are walked innermost-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRecord {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub kind: HandlerKind,
}

impl HandlerRecord {
    pub fn covers(&self, offset: u32) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// One entry of the function table
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// Byte offset of the function's entry point
    pub entry_offset: u32,
    /// Declared parameter count (the vararg parameter included)
    pub num_args: u16,
    /// Local slot count
    pub num_locals: u16,
    /// Received upvalue count (filled from the capture descriptor)
    pub num_upvalues: u16,
    /// Frame-owned cell count for locals captured by inner functions.
    /// The frame's upvalue array is laid out cells-first, received after.
    pub num_cells: u16,
    pub has_var_args: bool,
    pub is_sequence: bool,
    /// String pool index of the function's name, if it has one
    pub debug_name: Option<u32>,
    /// How the creator fills this function's received upvalue slots
    pub captures: Vec<CaptureSource>,
    /// Try handlers, in emission order (innermost last)
    pub handlers: Vec<HandlerRecord>,
}

/// Source position for one instruction offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionEntry {
    pub offset: u32,
    pub line: u32,
    pub column: u32,
}

/// Instruction range covered by one source statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementEntry {
    pub start: u32,
    pub end: u32,
    pub line: u32,
}

/// One lexical scope: its instruction range and the names it declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeEntry {
    pub id: u32,
    /// Parent scope id, or -1 for a function's root scope
    pub parent: i32,
    pub start: u32,
    pub end: u32,
    /// (string pool index, local slot) pairs
    pub names: Vec<(u32, u16)>,
}

/// Debug tables, stripped out of the instruction stream during linking and
/// keyed by instruction offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugInfo {
    pub file_name: Option<String>,
    /// Sorted by offset
    pub positions: Vec<PositionEntry>,
    pub statements: Vec<StatementEntry>,
    pub scopes: Vec<ScopeEntry>,
    /// (function index, string pool index)
    pub function_names: Vec<(u32, u32)>,
}

impl DebugInfo {
    /// The innermost recorded position at or before `offset`
    pub fn position_for(&self, offset: u32) -> Option<&PositionEntry> {
        match self.positions.binary_search_by_key(&offset, |p| p.offset) {
            Ok(at) => Some(&self.positions[at]),
            Err(0) => None,
            Err(at) => Some(&self.positions[at - 1]),
        }
    }
}

/// The immutable program image
#[derive(Debug, Default)]
pub struct ProgramImage {
    pub numbers: Vec<f64>,
    pub strings: Vec<Arc<String>>,
    pub functions: Vec<FunctionInfo>,
    pub bytecode: Vec<u8>,
    pub debug: Option<DebugInfo>,
}

impl ProgramImage {
    pub fn string(&self, index: u32) -> &str {
        self.strings
            .get(index as usize)
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn function_name(&self, index: usize) -> String {
        match self.functions.get(index).and_then(|f| f.debug_name) {
            Some(name) => self.string(name).to_string(),
            None => format!("fn_{}", index),
        }
    }

    /// Source location for an instruction offset, from the debug tables
    pub fn location_for(&self, offset: u32) -> Option<crate::errors::SourceLocation> {
        let debug = self.debug.as_ref()?;
        let position = debug.position_for(offset)?;
        Some(match &debug.file_name {
            Some(file) => crate::errors::SourceLocation::with_file(
                position.line as usize,
                position.column as usize,
                file.clone(),
            ),
            None => crate::errors::SourceLocation::new(
                position.line as usize,
                position.column as usize,
            ),
        })
    }

    /// Human-readable listing of the whole image
    pub fn disassemble(&self) -> Result<String, ScriptError> {
        let mut out = String::new();
        for (index, function) in self.functions.iter().enumerate() {
            out.push_str(&format!(
                "; function {} entry={} args={} locals={} upvalues={} cells={}\n",
                self.function_name(index),
                function.entry_offset,
                function.num_args,
                function.num_locals,
                function.num_upvalues,
                function.num_cells,
            ));
        }
        for (offset, instruction) in bytecode::decode(&self.bytecode)? {
            out.push_str(&bytecode::disassemble_instruction(offset, &instruction));
            out.push('\n');
        }
        Ok(out)
    }

    /// Serialize the image to its binary layout
    pub fn save_to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());

        out.extend_from_slice(&(self.numbers.len() as u32).to_le_bytes());
        for number in &self.numbers {
            out.extend_from_slice(&number.to_le_bytes());
        }

        out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for string in &self.strings {
            let bytes = string.as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }

        out.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());
        for function in &self.functions {
            write_function(&mut out, function);
        }

        out.extend_from_slice(&(self.bytecode.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bytecode);

        match &self.debug {
            Some(debug) => {
                let bytes = write_debug(debug);
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(&bytes);
            }
            None => out.extend_from_slice(&0u32.to_le_bytes()),
        }
        out
    }

    /// Load and validate an image from its binary layout
    pub fn load_from_bytes(data: &[u8]) -> Result<ProgramImage, ScriptError> {
        let mut reader = Reader { data, at: 0 };

        let magic = reader.take(4)?;
        if magic != MAGIC {
            return Err(ScriptError::runtime_error(
                "invalid magic bytes - not a Rill program image".to_string(),
            ));
        }
        let version = reader.u16()?;
        if version != VERSION {
            return Err(ScriptError::runtime_error(format!(
                "unsupported image version {} (current: {})",
                version, VERSION
            )));
        }

        let number_count = reader.u32()? as usize;
        let mut numbers = Vec::with_capacity(number_count);
        for _ in 0..number_count {
            numbers.push(reader.f64()?);
        }

        let string_count = reader.u32()? as usize;
        let mut strings = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            let length = reader.u32()? as usize;
            let bytes = reader.take(length)?;
            let text = std::str::from_utf8(bytes).map_err(|_| {
                ScriptError::runtime_error("string pool entry is not UTF-8".to_string())
            })?;
            strings.push(Arc::new(text.to_string()));
        }

        let function_count = reader.u32()? as usize;
        let mut functions = Vec::with_capacity(function_count);
        for _ in 0..function_count {
            functions.push(read_function(&mut reader)?);
        }

        let bytecode_length = reader.u32()? as usize;
        let bytecode = reader.take(bytecode_length)?.to_vec();

        let debug_length = reader.u32()? as usize;
        let debug = if debug_length > 0 {
            let bytes = reader.take(debug_length)?;
            Some(read_debug(&mut Reader { data: bytes, at: 0 })?)
        } else {
            None
        };

        Ok(ProgramImage { numbers, strings, functions, bytecode, debug })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ScriptError> {
        let bytes = self.save_to_bytes();
        let mut file = File::create(path)
            .map_err(|e| ScriptError::runtime_error(format!("cannot create image file: {}", e)))?;
        file.write_all(&bytes)
            .map_err(|e| ScriptError::runtime_error(format!("cannot write image file: {}", e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<ProgramImage, ScriptError> {
        let mut file = File::open(path)
            .map_err(|e| ScriptError::runtime_error(format!("cannot open image file: {}", e)))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| ScriptError::runtime_error(format!("cannot read image file: {}", e)))?;
        Self::load_from_bytes(&bytes)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], ScriptError> {
        if self.at + count > self.data.len() {
            return Err(ScriptError::runtime_error("truncated program image".to_string()));
        }
        let slice = &self.data[self.at..self.at + count];
        self.at += count;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ScriptError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ScriptError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, ScriptError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn f64(&mut self) -> Result<f64, ScriptError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }
}

const FLAG_VAR_ARGS: u8 = 1 << 0;
const FLAG_SEQUENCE: u8 = 1 << 1;
const NO_NAME: u32 = u32::MAX;

fn write_function(out: &mut Vec<u8>, function: &FunctionInfo) {
    out.extend_from_slice(&function.entry_offset.to_le_bytes());
    out.extend_from_slice(&function.num_args.to_le_bytes());
    out.extend_from_slice(&function.num_locals.to_le_bytes());
    out.extend_from_slice(&function.num_upvalues.to_le_bytes());
    out.extend_from_slice(&function.num_cells.to_le_bytes());

    let mut flags = 0u8;
    if function.has_var_args {
        flags |= FLAG_VAR_ARGS;
    }
    if function.is_sequence {
        flags |= FLAG_SEQUENCE;
    }
    out.push(flags);

    out.extend_from_slice(&function.debug_name.unwrap_or(NO_NAME).to_le_bytes());

    out.extend_from_slice(&(function.captures.len() as u16).to_le_bytes());
    for capture in &function.captures {
        match capture {
            CaptureSource::LocalCell(index) => {
                out.push(0);
                out.extend_from_slice(&index.to_le_bytes());
            }
            CaptureSource::Upvalue(index) => {
                out.push(1);
                out.extend_from_slice(&index.to_le_bytes());
            }
        }
    }

    out.extend_from_slice(&(function.handlers.len() as u16).to_le_bytes());
    for handler in &function.handlers {
        out.extend_from_slice(&handler.start.to_le_bytes());
        out.extend_from_slice(&handler.end.to_le_bytes());
        out.extend_from_slice(&handler.target.to_le_bytes());
        out.push(match handler.kind {
            HandlerKind::Catch => 0,
            HandlerKind::Finally => 1,
        });
    }
}

fn read_function(reader: &mut Reader) -> Result<FunctionInfo, ScriptError> {
    let entry_offset = reader.u32()?;
    let num_args = reader.u16()?;
    let num_locals = reader.u16()?;
    let num_upvalues = reader.u16()?;
    let num_cells = reader.u16()?;
    let flags = reader.u8()?;
    let debug_name = match reader.u32()? {
        NO_NAME => None,
        name => Some(name),
    };

    let capture_count = reader.u16()? as usize;
    let mut captures = Vec::with_capacity(capture_count);
    for _ in 0..capture_count {
        let kind = reader.u8()?;
        let index = reader.u16()?;
        captures.push(match kind {
            0 => CaptureSource::LocalCell(index),
            1 => CaptureSource::Upvalue(index),
            other => {
                return Err(ScriptError::runtime_error(format!(
                    "invalid capture source kind {}",
                    other
                )))
            }
        });
    }

    let handler_count = reader.u16()? as usize;
    let mut handlers = Vec::with_capacity(handler_count);
    for _ in 0..handler_count {
        let start = reader.u32()?;
        let end = reader.u32()?;
        let target = reader.u32()?;
        let kind = match reader.u8()? {
            0 => HandlerKind::Catch,
            1 => HandlerKind::Finally,
            other => {
                return Err(ScriptError::runtime_error(format!(
                    "invalid handler kind {}",
                    other
                )))
            }
        };
        handlers.push(HandlerRecord { start, end, target, kind });
    }

    Ok(FunctionInfo {
        entry_offset,
        num_args,
        num_locals,
        num_upvalues,
        num_cells,
        has_var_args: flags & FLAG_VAR_ARGS != 0,
        is_sequence: flags & FLAG_SEQUENCE != 0,
        debug_name,
        captures,
        handlers,
    })
}

fn write_debug(debug: &DebugInfo) -> Vec<u8> {
    let mut out = Vec::new();
    match &debug.file_name {
        Some(file) => {
            out.push(1);
            out.extend_from_slice(&(file.len() as u32).to_le_bytes());
            out.extend_from_slice(file.as_bytes());
        }
        None => out.push(0),
    }

    out.extend_from_slice(&(debug.positions.len() as u32).to_le_bytes());
    for position in &debug.positions {
        out.extend_from_slice(&position.offset.to_le_bytes());
        out.extend_from_slice(&position.line.to_le_bytes());
        out.extend_from_slice(&position.column.to_le_bytes());
    }

    out.extend_from_slice(&(debug.statements.len() as u32).to_le_bytes());
    for statement in &debug.statements {
        out.extend_from_slice(&statement.start.to_le_bytes());
        out.extend_from_slice(&statement.end.to_le_bytes());
        out.extend_from_slice(&statement.line.to_le_bytes());
    }

    out.extend_from_slice(&(debug.scopes.len() as u32).to_le_bytes());
    for scope in &debug.scopes {
        out.extend_from_slice(&scope.id.to_le_bytes());
        out.extend_from_slice(&(scope.parent as u32).to_le_bytes());
        out.extend_from_slice(&scope.start.to_le_bytes());
        out.extend_from_slice(&scope.end.to_le_bytes());
        out.extend_from_slice(&(scope.names.len() as u16).to_le_bytes());
        for (name, slot) in &scope.names {
            out.extend_from_slice(&name.to_le_bytes());
            out.extend_from_slice(&slot.to_le_bytes());
        }
    }

    out.extend_from_slice(&(debug.function_names.len() as u32).to_le_bytes());
    for (function, name) in &debug.function_names {
        out.extend_from_slice(&function.to_le_bytes());
        out.extend_from_slice(&name.to_le_bytes());
    }
    out
}

fn read_debug(reader: &mut Reader) -> Result<DebugInfo, ScriptError> {
    let file_name = if reader.u8()? != 0 {
        let length = reader.u32()? as usize;
        let bytes = reader.take(length)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ScriptError::runtime_error("debug file name is not UTF-8".to_string()))?;
        Some(text.to_string())
    } else {
        None
    };

    let position_count = reader.u32()? as usize;
    let mut positions = Vec::with_capacity(position_count);
    for _ in 0..position_count {
        positions.push(PositionEntry {
            offset: reader.u32()?,
            line: reader.u32()?,
            column: reader.u32()?,
        });
    }

    let statement_count = reader.u32()? as usize;
    let mut statements = Vec::with_capacity(statement_count);
    for _ in 0..statement_count {
        statements.push(StatementEntry {
            start: reader.u32()?,
            end: reader.u32()?,
            line: reader.u32()?,
        });
    }

    let scope_count = reader.u32()? as usize;
    let mut scopes = Vec::with_capacity(scope_count);
    for _ in 0..scope_count {
        let id = reader.u32()?;
        let parent = reader.u32()? as i32;
        let start = reader.u32()?;
        let end = reader.u32()?;
        let name_count = reader.u16()? as usize;
        let mut names = Vec::with_capacity(name_count);
        for _ in 0..name_count {
            let name = reader.u32()?;
            let slot = reader.u16()?;
            names.push((name, slot));
        }
        scopes.push(ScopeEntry { id, parent, start, end, names });
    }

    let function_name_count = reader.u32()? as usize;
    let mut function_names = Vec::with_capacity(function_name_count);
    for _ in 0..function_name_count {
        let function = reader.u32()?;
        let name = reader.u32()?;
        function_names.push((function, name));
    }

    Ok(DebugInfo { file_name, positions, statements, scopes, function_names })
}
