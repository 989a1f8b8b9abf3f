//! Bytecode instruction set and container format.
//!
//! INSTRUCTION FORMAT (fixed width, 8 bytes):
//!
//!   | opcode: u8 | flags: u8 | arg0: u16 | arg1: u32 |
//!
//! CONTAINER LAYOUT (little endian):
//!
//!   signature[8] = "goat v.1"
//!   instructions_offset:      u64   (absolute file offset)
//!   data_descriptors_offset:  u64
//!   data_offset:              u64
//!   packed instruction array  (8 bytes each)
//!   packed descriptor array   (offset: u64, size: u32 — 12 bytes each)
//!   raw data blob             (string literals as wide chars, null terminated)
//!
//! Wide characters are 4-byte little-endian Unicode scalar values; a literal
//! of byte size `s` holds `s / 4 - 1` characters plus the trailing null.

use crate::errors::{BadBytecode, ImageError};
use std::path::Path;

/// Container signature, first 8 bytes of every compiled Goat program.
pub const SIGNATURE: [u8; 8] = *b"goat v.1";

/// Bytes per wide character in the data blob.
pub const WCHAR_SIZE: usize = 4;

/// Capacity of the per-thread scratch array fed by `ARG`.
pub const MAX_ARG_WORDS: usize = 3;

const HEADER_SIZE: usize = 32;
const INSTR_SIZE: usize = 8;
const DESCRIPTOR_SIZE: usize = 12;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop = 0,     //            → advance
    Arg = 1,     // arg1       → push arg1 into the scratch array
    End = 2,     //            → halt the process
    Pop = 3,     //            → pop and release the top of stack
    Nil = 4,     //            → push the null singleton
    ILoad32 = 5, // arg1       → push integer (arg1 as signed 32-bit)
    ILoad64 = 6, // ARG + arg1 → push integer (low word from ARG, high = arg1)
    SLoad = 7,   // arg1       → push the string literal with descriptor id arg1
    VLoad = 8,   // arg1       → push the variable named by descriptor arg1, or null
    Var = 9,     // arg1       → pop value, declare mutable variable
    Const = 10,  // arg1       → pop value, declare constant variable
    Store = 11,  // arg1       → assign named variable; top of stack stays
    Add = 12,    //            → pop right, pop left, push left + right
    Sub = 13,    //            → pop right, pop left, push left - right
    Func = 14,   // ARG(entry) + arg0 = argc, arg1 = first name descriptor
    Call = 15,   // arg0 = argc; top of stack is the callee
    Ret = 16,    //            → write return slot, unwind, resume caller
    Enter = 17,  //            → enter a nested lexical scope
    Leave = 18,  //            → push the scope object, restore the caller scope
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        Some(match byte {
            0 => Opcode::Nop,
            1 => Opcode::Arg,
            2 => Opcode::End,
            3 => Opcode::Pop,
            4 => Opcode::Nil,
            5 => Opcode::ILoad32,
            6 => Opcode::ILoad64,
            7 => Opcode::SLoad,
            8 => Opcode::VLoad,
            9 => Opcode::Var,
            10 => Opcode::Const,
            11 => Opcode::Store,
            12 => Opcode::Add,
            13 => Opcode::Sub,
            14 => Opcode::Func,
            15 => Opcode::Call,
            16 => Opcode::Ret,
            17 => Opcode::Enter,
            18 => Opcode::Leave,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Arg => "ARG",
            Opcode::End => "END",
            Opcode::Pop => "POP",
            Opcode::Nil => "NIL",
            Opcode::ILoad32 => "ILOAD32",
            Opcode::ILoad64 => "ILOAD64",
            Opcode::SLoad => "SLOAD",
            Opcode::VLoad => "VLOAD",
            Opcode::Var => "VAR",
            Opcode::Const => "CONST",
            Opcode::Store => "STORE",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Func => "FUNC",
            Opcode::Call => "CALL",
            Opcode::Ret => "RET",
            Opcode::Enter => "ENTER",
            Opcode::Leave => "LEAVE",
        }
    }
}

// ---------------------------------------------------------------------------
// Instruction record
// ---------------------------------------------------------------------------

/// One fixed-width instruction. `flags` is reserved and carried verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub opcode: u8,
    pub flags: u8,
    pub arg0: u16,
    pub arg1: u32,
}

impl Instr {
    pub fn new(op: Opcode, arg0: u16, arg1: u32) -> Instr {
        Instr { opcode: op as u8, flags: 0, arg0, arg1 }
    }

    pub fn encode(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.opcode;
        out[1] = self.flags;
        out[2..4].copy_from_slice(&self.arg0.to_le_bytes());
        out[4..8].copy_from_slice(&self.arg1.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Instr {
        debug_assert!(bytes.len() >= INSTR_SIZE);
        Instr {
            opcode: bytes[0],
            flags: bytes[1],
            arg0: u16::from_le_bytes([bytes[2], bytes[3]]),
            arg1: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Locates one entry in the data blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    /// Byte offset relative to the start of the data blob.
    pub offset: u64,
    /// Byte size including the trailing null wide char.
    pub size: u32,
}

// ---------------------------------------------------------------------------
// Bytecode image
// ---------------------------------------------------------------------------

/// A loaded bytecode image: the single input the runtime core consumes.
#[derive(Debug, Clone, Default)]
pub struct BytecodeImage {
    pub instructions: Vec<Instr>,
    pub descriptors: Vec<DataDescriptor>,
    pub data: Vec<u8>,
}

impl BytecodeImage {
    pub fn from_file(path: impl AsRef<Path>) -> Result<BytecodeImage, ImageError> {
        let bytes = std::fs::read(path)?;
        BytecodeImage::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<BytecodeImage, ImageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ImageError::Truncated);
        }
        if bytes[..8] != SIGNATURE {
            return Err(ImageError::BadSignature);
        }
        let read_u64 = |at: usize| {
            u64::from_le_bytes(bytes[at..at + 8].try_into().expect("header slice"))
        };
        let instr_off = read_u64(8) as usize;
        let desc_off = read_u64(16) as usize;
        let data_off = read_u64(24) as usize;

        if instr_off < HEADER_SIZE
            || desc_off < instr_off
            || data_off < desc_off
            || data_off > bytes.len()
        {
            return Err(ImageError::BadLayout);
        }
        let instr_bytes = &bytes[instr_off..desc_off];
        let desc_bytes = &bytes[desc_off..data_off];
        if instr_bytes.len() % INSTR_SIZE != 0 || desc_bytes.len() % DESCRIPTOR_SIZE != 0 {
            return Err(ImageError::BadLayout);
        }

        let instructions = instr_bytes
            .chunks_exact(INSTR_SIZE)
            .map(Instr::decode)
            .collect();
        let descriptors = desc_bytes
            .chunks_exact(DESCRIPTOR_SIZE)
            .map(|chunk| DataDescriptor {
                offset: u64::from_le_bytes(chunk[..8].try_into().expect("descriptor slice")),
                size: u32::from_le_bytes(chunk[8..].try_into().expect("descriptor slice")),
            })
            .collect();

        Ok(BytecodeImage {
            instructions,
            descriptors,
            data: bytes[data_off..].to_vec(),
        })
    }

    /// Emit the container bytes for this image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let instr_off = HEADER_SIZE;
        let desc_off = instr_off + self.instructions.len() * INSTR_SIZE;
        let data_off = desc_off + self.descriptors.len() * DESCRIPTOR_SIZE;

        let mut out = Vec::with_capacity(data_off + self.data.len());
        out.extend_from_slice(&SIGNATURE);
        out.extend_from_slice(&(instr_off as u64).to_le_bytes());
        out.extend_from_slice(&(desc_off as u64).to_le_bytes());
        out.extend_from_slice(&(data_off as u64).to_le_bytes());
        for instr in &self.instructions {
            out.extend_from_slice(&instr.encode());
        }
        for desc in &self.descriptors {
            out.extend_from_slice(&desc.offset.to_le_bytes());
            out.extend_from_slice(&desc.size.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode the wide-char string literal behind descriptor `id`.
    pub fn string_literal(&self, id: u32) -> Result<String, BadBytecode> {
        let desc = self
            .descriptors
            .get(id as usize)
            .ok_or(BadBytecode::BadDescriptor(id))?;
        let start = desc.offset as usize;
        let size = desc.size as usize;
        let end = start.checked_add(size).ok_or(BadBytecode::BadLiteral(id))?;
        if end > self.data.len() || size < WCHAR_SIZE || size % WCHAR_SIZE != 0 {
            return Err(BadBytecode::BadLiteral(id));
        }
        let words = self.data[start..end].chunks_exact(WCHAR_SIZE);
        let mut text = String::with_capacity(size / WCHAR_SIZE - 1);
        for (i, chunk) in words.enumerate() {
            let word = u32::from_le_bytes(chunk.try_into().expect("wchar slice"));
            if i == size / WCHAR_SIZE - 1 {
                if word != 0 {
                    return Err(BadBytecode::BadLiteral(id));
                }
                break;
            }
            let ch = char::from_u32(word).ok_or(BadBytecode::BadLiteral(id))?;
            text.push(ch);
        }
        Ok(text)
    }

    /// Pretty-print every instruction plus the string table.
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "=== {} instructions, {} data descriptors ===",
            self.instructions.len(),
            self.descriptors.len()
        );
        for (i, instr) in self.instructions.iter().enumerate() {
            let name = Opcode::from_u8(instr.opcode)
                .map(Opcode::name)
                .unwrap_or("???");
            let _ = writeln!(
                out,
                "  {:4}  {:<8} flags={:<3} arg0={:<5} arg1={}",
                i, name, instr.flags, instr.arg0, instr.arg1
            );
        }
        for id in 0..self.descriptors.len() as u32 {
            match self.string_literal(id) {
                Ok(text) => {
                    let _ = writeln!(out, "  str[{}] = {:?}", id, text);
                }
                Err(_) => {
                    let _ = writeln!(out, "  str[{}] = <malformed>", id);
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Image builder
// ---------------------------------------------------------------------------

/// Assembles an in-memory image: instructions plus an interned string table.
/// This is the tooling counterpart of the reader; general-purpose bytecode
/// serialization stays out of the runtime core.
#[derive(Debug, Default)]
pub struct ImageBuilder {
    instructions: Vec<Instr>,
    strings: Vec<String>,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder::default()
    }

    /// Append an instruction, returning its index.
    pub fn emit(&mut self, op: Opcode, arg0: u16, arg1: u32) -> usize {
        self.instructions.push(Instr::new(op, arg0, arg1));
        self.instructions.len() - 1
    }

    /// Next instruction index (useful for entry points before emitting).
    pub fn here(&self) -> usize {
        self.instructions.len()
    }

    /// Intern a string literal, returning its data-descriptor id.
    pub fn intern(&mut self, text: &str) -> u32 {
        for (i, existing) in self.strings.iter().enumerate() {
            if existing == text {
                return i as u32;
            }
        }
        self.strings.push(text.to_string());
        self.strings.len() as u32 - 1
    }

    pub fn finish(self) -> BytecodeImage {
        let mut data = Vec::new();
        let mut descriptors = Vec::with_capacity(self.strings.len());
        for text in &self.strings {
            let offset = data.len() as u64;
            for ch in text.chars() {
                data.extend_from_slice(&(ch as u32).to_le_bytes());
            }
            data.extend_from_slice(&0u32.to_le_bytes());
            descriptors.push(DataDescriptor {
                offset,
                size: ((text.chars().count() + 1) * WCHAR_SIZE) as u32,
            });
        }
        BytecodeImage {
            instructions: self.instructions,
            descriptors,
            data,
        }
    }
}
