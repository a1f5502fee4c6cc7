// File: src/bytecode.rs
//
// Bytecode instruction definitions for the Rill VM.
// Defines the OpCode enum, operand encoding, the instruction encoder/decoder,
// and a disassembler for tests and debugger tooling.
//
// Opcodes are a single byte in three bands: executable opcodes live in
// [0, 200), the Label pseudo-op sits at 200, and debug pseudo-ops above 200
// are erased during linking. Operands follow the opcode byte inline:
// little-endian u32 for constant/function indices and jump targets, u16 for
// local/arg/upvalue slots.

use crate::errors::ScriptError;
use once_cell::sync::Lazy;

/// Bytecode instruction opcodes for the Rill VM.
/// Stack-based; most operations pop operands from the evaluation stack and
/// push results back onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // === Stack shuffling ===
    /// Duplicate the top of stack
    Dup = 0,
    /// Duplicate the top two values, preserving order
    Dup2 = 1,
    /// Pop and discard the top of stack
    Drop = 2,
    /// Swap the top two values
    Swap = 3,
    /// Move the top value below the next two
    Swap1For2 = 4,

    // === Constants ===
    LdUndef = 10,
    LdNull = 11,
    LdTrue = 12,
    LdFalse = 13,
    /// Push a number from the number pool. Operand: u32 pool index
    LdNum = 14,
    /// Push a string from the string pool. Operand: u32 pool index
    LdStr = 15,

    // === Globals ===
    /// Push the global object
    LdGlobal = 20,
    /// Direct name lookup from the global object. Operand: u32 string index
    LdGlobalFld = 21,

    // === Locals and arguments ===
    /// Load a local slot. Operand: u16 slot
    LdLocF = 24,
    /// Store the top of stack into a local slot (pops). Operand: u16 slot
    StLocF = 25,
    /// Load an argument slot. Operand: u16 slot
    LdArgF = 26,
    /// Store the top of stack into an argument slot (pops). Operand: u16 slot
    StArgF = 27,

    // === Fields and indexing ===
    /// Pop object, push object.field. Operand: u32 string index
    LdFld = 30,
    /// Pop object, pop value, set object.field. Operand: u32 string index
    StFld = 31,
    /// Pop index and container, push container[index]
    LdArr = 32,
    /// Pop index, container, and value, set container[index] = value
    StArr = 33,
    /// Static index into an array local. Operands: u16 slot, u32 element
    LdArrF = 34,
    /// Pop value into a static index of an array local.
    /// Operands: u16 slot, u32 element
    StArrF = 35,

    // === Upvalues ===
    /// Push a snapshot of the current upvalue array
    LdUp = 40,
    /// Load upvalue cell contents. Operand: u16 slot
    LdUpValue = 41,
    /// Store the top of stack into an upvalue cell (pops). Operand: u16 slot
    StUpValue = 42,
    /// Install a fresh cell at a frame-owned upvalue slot; gives loop
    /// variables their fresh per-iteration binding. Operand: u16 slot
    NewCell = 43,

    // === Sequences ===
    /// Pop the yielded value, persist the frame, return to the resumer
    SeqSuspend = 48,
    /// Push the value the sequence was resumed with
    SeqResume = 49,

    // === Constructors ===
    /// Push a new empty object
    NewObject = 52,
    /// Pop n values, push an array of them. Operand: u32 count
    NewArray = 53,
    /// Pop step, end, start, and container; push the sliced array
    Slice = 54,

    // === Arithmetic ===
    Add = 60,
    Sub = 61,
    Mul = 62,
    Div = 63,
    Mod = 64,
    Exp = 65,
    Neg = 66,

    // === Comparison ===
    Eq = 70,
    Neq = 71,
    Gt = 72,
    Gte = 73,
    Lt = 74,
    Lte = 75,

    // === Logical / bitwise ===
    Not = 80,
    BitLShift = 81,
    BitRShift = 82,
    BitAnd = 83,
    BitOr = 84,
    BitXor = 85,
    BitNot = 86,

    // === Membership ===
    In = 90,
    NotIn = 91,

    // === Control flow ===
    /// Unconditional jump. Operand: u32 byte offset
    Jmp = 100,
    /// Pop, jump if truthy. Operand: u32 byte offset
    JmpTrue = 101,
    /// Pop, jump if falsy. Operand: u32 byte offset
    JmpFalse = 102,
    /// Peek, jump if truthy; used for short-circuit ||. Operand: u32 offset
    JmpTrueP = 103,
    /// Peek, jump if falsy; used for short-circuit &&. Operand: u32 offset
    JmpFalseP = 104,
    /// Dense switch dispatch.
    /// Operands: u32 base (i32 bits), u32 count, u32 default, count u32 targets
    JmpTable = 105,

    // === Calls and frames ===
    /// Build a closure over the current frame. Operand: u32 function index
    Closure = 110,
    /// Pop argc args and the callable, invoke it. Operand: u32 argc
    Call = 111,
    /// Like Call but reuses the current frame. Operand: u32 argc
    TailCall = 112,
    /// Pop argc args and the receiver, dispatch a method with the receiver
    /// as first argument. Operands: u32 argc, u32 method-name string index
    InstanceCall = 113,
    /// Frame setup marker at function entry. Operand: u32 local count
    Enter = 114,
    /// Pop the return value, tear the frame down, resume the caller
    Ret = 115,
    /// Pack trailing arguments into an array bound to the last argument
    /// slot. Operand: u32 fixed argument count
    VarArgs = 116,
    /// Pop a value and raise it; emitted by the finally lowering to re-raise
    /// a suspended error
    Throw = 117,

    // === In-place increment ===
    /// Add one to a number local. Operand: u16 slot
    IncF = 120,
    /// Subtract one from a number local. Operand: u16 slot
    DecF = 121,

    // === Debugging ===
    /// Unconditionally notify an attached debugger
    Breakpoint = 130,
    /// Notify an attached debugger only if it wants to stop here
    DebugCheckpoint = 131,

    // === Pseudo-ops (length 0, erased during linking) ===
    /// Jump target marker. Operand: u32 label id
    Label = 200,
    /// Source position marker. Operands: u32 line, u32 column
    DbgPosition = 210,
    /// Statement boundary marker. Operand: u32 line
    DbgStatement = 211,
    /// Lexical scope open marker. Operand: u32 scope id
    DbgScopeBegin = 212,
    /// Lexical scope close marker. Operand: u32 scope id
    DbgScopeEnd = 213,
}

/// Every opcode, for table construction
const ALL_OPS: &[OpCode] = &[
    OpCode::Dup,
    OpCode::Dup2,
    OpCode::Drop,
    OpCode::Swap,
    OpCode::Swap1For2,
    OpCode::LdUndef,
    OpCode::LdNull,
    OpCode::LdTrue,
    OpCode::LdFalse,
    OpCode::LdNum,
    OpCode::LdStr,
    OpCode::LdGlobal,
    OpCode::LdGlobalFld,
    OpCode::LdLocF,
    OpCode::StLocF,
    OpCode::LdArgF,
    OpCode::StArgF,
    OpCode::LdFld,
    OpCode::StFld,
    OpCode::LdArr,
    OpCode::StArr,
    OpCode::LdArrF,
    OpCode::StArrF,
    OpCode::LdUp,
    OpCode::LdUpValue,
    OpCode::StUpValue,
    OpCode::NewCell,
    OpCode::SeqSuspend,
    OpCode::SeqResume,
    OpCode::NewObject,
    OpCode::NewArray,
    OpCode::Slice,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::Mod,
    OpCode::Exp,
    OpCode::Neg,
    OpCode::Eq,
    OpCode::Neq,
    OpCode::Gt,
    OpCode::Gte,
    OpCode::Lt,
    OpCode::Lte,
    OpCode::Not,
    OpCode::BitLShift,
    OpCode::BitRShift,
    OpCode::BitAnd,
    OpCode::BitOr,
    OpCode::BitXor,
    OpCode::BitNot,
    OpCode::In,
    OpCode::NotIn,
    OpCode::Jmp,
    OpCode::JmpTrue,
    OpCode::JmpFalse,
    OpCode::JmpTrueP,
    OpCode::JmpFalseP,
    OpCode::JmpTable,
    OpCode::Closure,
    OpCode::Call,
    OpCode::TailCall,
    OpCode::InstanceCall,
    OpCode::Enter,
    OpCode::Ret,
    OpCode::VarArgs,
    OpCode::Throw,
    OpCode::IncF,
    OpCode::DecF,
    OpCode::Breakpoint,
    OpCode::DebugCheckpoint,
    OpCode::Label,
    OpCode::DbgPosition,
    OpCode::DbgStatement,
    OpCode::DbgScopeBegin,
    OpCode::DbgScopeEnd,
];

/// Byte-to-opcode decode table
static DECODE_TABLE: Lazy<[Option<OpCode>; 256]> = Lazy::new(|| {
    let mut table = [None; 256];
    for &op in ALL_OPS {
        table[op as u8 as usize] = Some(op);
    }
    table
});

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        DECODE_TABLE[byte as usize]
    }

    /// Pseudo-ops occupy no space in the linked bytecode
    pub fn is_pseudo(self) -> bool {
        self as u8 >= 200
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Dup => "dup",
            OpCode::Dup2 => "dup2",
            OpCode::Drop => "drop",
            OpCode::Swap => "swap",
            OpCode::Swap1For2 => "swap1for2",
            OpCode::LdUndef => "ldundef",
            OpCode::LdNull => "ldnull",
            OpCode::LdTrue => "ldtrue",
            OpCode::LdFalse => "ldfalse",
            OpCode::LdNum => "ldnum",
            OpCode::LdStr => "ldstr",
            OpCode::LdGlobal => "ldglobal",
            OpCode::LdGlobalFld => "ldglobalfld",
            OpCode::LdLocF => "ldlocf",
            OpCode::StLocF => "stlocf",
            OpCode::LdArgF => "ldargf",
            OpCode::StArgF => "stargf",
            OpCode::LdFld => "ldfld",
            OpCode::StFld => "stfld",
            OpCode::LdArr => "ldarr",
            OpCode::StArr => "starr",
            OpCode::LdArrF => "ldarrf",
            OpCode::StArrF => "starrf",
            OpCode::LdUp => "ldup",
            OpCode::LdUpValue => "ldupvalue",
            OpCode::StUpValue => "stupvalue",
            OpCode::NewCell => "newcell",
            OpCode::SeqSuspend => "seqsuspend",
            OpCode::SeqResume => "seqresume",
            OpCode::NewObject => "newobject",
            OpCode::NewArray => "newarray",
            OpCode::Slice => "slice",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Mod => "mod",
            OpCode::Exp => "exp",
            OpCode::Neg => "neg",
            OpCode::Eq => "eq",
            OpCode::Neq => "neq",
            OpCode::Gt => "gt",
            OpCode::Gte => "gte",
            OpCode::Lt => "lt",
            OpCode::Lte => "lte",
            OpCode::Not => "not",
            OpCode::BitLShift => "bitlshift",
            OpCode::BitRShift => "bitrshift",
            OpCode::BitAnd => "bitand",
            OpCode::BitOr => "bitor",
            OpCode::BitXor => "bitxor",
            OpCode::BitNot => "bitnot",
            OpCode::In => "in",
            OpCode::NotIn => "notin",
            OpCode::Jmp => "jmp",
            OpCode::JmpTrue => "jmptrue",
            OpCode::JmpFalse => "jmpfalse",
            OpCode::JmpTrueP => "jmptruep",
            OpCode::JmpFalseP => "jmpfalsep",
            OpCode::JmpTable => "jmptable",
            OpCode::Closure => "closure",
            OpCode::Call => "call",
            OpCode::TailCall => "tailcall",
            OpCode::InstanceCall => "instancecall",
            OpCode::Enter => "enter",
            OpCode::Ret => "ret",
            OpCode::VarArgs => "varargs",
            OpCode::Throw => "throw",
            OpCode::IncF => "incf",
            OpCode::DecF => "decf",
            OpCode::Breakpoint => "breakpoint",
            OpCode::DebugCheckpoint => "debugcheckpoint",
            OpCode::Label => "label",
            OpCode::DbgPosition => "dbgposition",
            OpCode::DbgStatement => "dbgstatement",
            OpCode::DbgScopeBegin => "dbgscopebegin",
            OpCode::DbgScopeEnd => "dbgscopeend",
        }
    }

    /// Fixed operand shapes. JmpTable is variable-length and handled
    /// specially by the encoder and decoder.
    fn operand_kinds(self) -> &'static [OperandKind] {
        use OperandKind::*;
        match self {
            OpCode::LdNum
            | OpCode::LdStr
            | OpCode::LdGlobalFld
            | OpCode::LdFld
            | OpCode::StFld
            | OpCode::NewArray
            | OpCode::Closure
            | OpCode::Call
            | OpCode::TailCall
            | OpCode::Enter
            | OpCode::VarArgs => &[UInt],
            OpCode::InstanceCall => &[UInt, UInt],
            OpCode::LdLocF
            | OpCode::StLocF
            | OpCode::LdArgF
            | OpCode::StArgF
            | OpCode::LdUpValue
            | OpCode::StUpValue
            | OpCode::NewCell
            | OpCode::IncF
            | OpCode::DecF => &[Slot],
            OpCode::LdArrF | OpCode::StArrF => &[Slot, UInt],
            OpCode::Jmp
            | OpCode::JmpTrue
            | OpCode::JmpFalse
            | OpCode::JmpTrueP
            | OpCode::JmpFalseP => &[Target],
            _ => &[],
        }
    }
}

/// Operand shapes for decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandKind {
    /// u32 index or count
    UInt,
    /// u16 local/arg/upvalue slot
    Slot,
    /// u32 jump target (a symbolic label before linking)
    Target,
}

/// An instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Constant/function index or count, 4 bytes little-endian
    UInt(u32),
    /// Local/arg/upvalue slot, 2 bytes little-endian
    Slot(u16),
    /// Symbolic jump target, resolved to a u32 byte offset at link time
    Label(u32),
}

impl Operand {
    pub fn width(&self) -> usize {
        match self {
            Operand::UInt(_) => 4,
            Operand::Slot(_) => 2,
            Operand::Label(_) => 4,
        }
    }

    pub fn as_uint(&self) -> u32 {
        match self {
            Operand::UInt(v) => *v,
            Operand::Slot(v) => *v as u32,
            Operand::Label(v) => *v,
        }
    }
}

/// A single instruction: the opcode plus its operand list.
/// This is the form the code generator emits; the linker resolves labels and
/// flattens instructions to bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(op: OpCode) -> Self {
        Self { op, operands: Vec::new() }
    }

    pub fn with(op: OpCode, operand: Operand) -> Self {
        Self { op, operands: vec![operand] }
    }

    pub fn with2(op: OpCode, a: Operand, b: Operand) -> Self {
        Self { op, operands: vec![a, b] }
    }

    /// Encoded size in bytes: the opcode byte plus its operand payloads.
    /// Label and debug pseudo-ops have length zero and are erased.
    pub fn encoded_len(&self) -> usize {
        if self.op.is_pseudo() {
            return 0;
        }
        1 + self.operands.iter().map(Operand::width).sum::<usize>()
    }

    /// Append this instruction's bytes. `resolve` maps a label id to its
    /// final byte offset.
    pub fn encode_into<F>(&self, out: &mut Vec<u8>, resolve: F) -> Result<(), ScriptError>
    where
        F: Fn(u32) -> Option<u32>,
    {
        if self.op.is_pseudo() {
            return Ok(());
        }
        out.push(self.op as u8);
        for operand in &self.operands {
            match operand {
                Operand::UInt(v) => out.extend_from_slice(&v.to_le_bytes()),
                Operand::Slot(v) => out.extend_from_slice(&v.to_le_bytes()),
                Operand::Label(id) => {
                    let offset = resolve(*id).ok_or_else(|| {
                        ScriptError::runtime_error(format!("unresolved label {}", id))
                    })?;
                    out.extend_from_slice(&offset.to_le_bytes());
                }
            }
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, ScriptError> {
    if at + 4 > bytes.len() {
        return Err(ScriptError::runtime_error("truncated bytecode".to_string()));
    }
    Ok(u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]))
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, ScriptError> {
    if at + 2 > bytes.len() {
        return Err(ScriptError::runtime_error("truncated bytecode".to_string()));
    }
    Ok(u16::from_le_bytes([bytes[at], bytes[at + 1]]))
}

/// Decode a linked bytecode stream back into instructions with their byte
/// offsets. Jump targets come back as UInt offsets.
pub fn decode(bytes: &[u8]) -> Result<Vec<(u32, Instruction)>, ScriptError> {
    let mut out = Vec::new();
    let mut at = 0usize;
    while at < bytes.len() {
        let offset = at as u32;
        let op = OpCode::from_byte(bytes[at]).ok_or_else(|| {
            ScriptError::runtime_error(format!("invalid opcode {:#04x} at offset {}", bytes[at], at))
        })?;
        if op.is_pseudo() {
            return Err(ScriptError::runtime_error(format!(
                "pseudo-op {} survived linking at offset {}",
                op.mnemonic(),
                at
            )));
        }
        at += 1;

        let mut operands = Vec::new();
        if op == OpCode::JmpTable {
            let base = read_u32(bytes, at)?;
            let count = read_u32(bytes, at + 4)?;
            let default = read_u32(bytes, at + 8)?;
            at += 12;
            operands.push(Operand::UInt(base));
            operands.push(Operand::UInt(count));
            operands.push(Operand::UInt(default));
            for _ in 0..count {
                operands.push(Operand::UInt(read_u32(bytes, at)?));
                at += 4;
            }
        } else {
            for kind in op.operand_kinds() {
                match kind {
                    OperandKind::UInt | OperandKind::Target => {
                        operands.push(Operand::UInt(read_u32(bytes, at)?));
                        at += 4;
                    }
                    OperandKind::Slot => {
                        operands.push(Operand::Slot(read_u16(bytes, at)?));
                        at += 2;
                    }
                }
            }
        }
        out.push((offset, Instruction { op, operands }));
    }
    Ok(out)
}

/// Re-encode decoded instructions. `decode` then `encode` round-trips a
/// linked bytecode stream exactly.
pub fn encode(instructions: &[Instruction]) -> Result<Vec<u8>, ScriptError> {
    let mut out = Vec::new();
    for instruction in instructions {
        instruction.encode_into(&mut out, |id| Some(id))?;
    }
    Ok(out)
}

/// Render one decoded instruction for the disassembly listing
pub fn disassemble_instruction(offset: u32, instruction: &Instruction) -> String {
    let mut text = format!("{:06} {}", offset, instruction.op.mnemonic());
    for operand in &instruction.operands {
        match operand {
            Operand::UInt(v) => text.push_str(&format!(" {}", v)),
            Operand::Slot(v) => text.push_str(&format!(" #{}", v)),
            Operand::Label(v) => text.push_str(&format!(" @{}", v)),
        }
    }
    text
}
