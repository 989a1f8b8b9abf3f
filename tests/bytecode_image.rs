//! Tests for the bytecode container: instruction encoding, the bit-exact
//! reader, literal decoding and the disassembler.

use goat::bytecode::{DataDescriptor, SIGNATURE, WCHAR_SIZE};
use goat::errors::BadBytecode;
use goat::{BytecodeImage, ImageBuilder, ImageError, Instr, Opcode};

// ─── Instruction encoding ─────────────────────────────────────────────────────

#[test]
fn instr_encode_decode_round_trip() {
    let instr = Instr {
        opcode: Opcode::ILoad32 as u8,
        flags: 0x5a,
        arg0: 0x1234,
        arg1: 0xdead_beef,
    };
    let bytes = instr.encode();
    assert_eq!(bytes.len(), 8);
    assert_eq!(Instr::decode(&bytes), instr);
}

#[test]
fn instr_layout_is_little_endian() {
    let instr = Instr::new(Opcode::SLoad, 0x0102, 0x0304_0506);
    let bytes = instr.encode();
    assert_eq!(bytes[0], Opcode::SLoad as u8);
    assert_eq!(bytes[1], 0);
    assert_eq!(&bytes[2..4], &[0x02, 0x01]);
    assert_eq!(&bytes[4..8], &[0x06, 0x05, 0x04, 0x03]);
}

#[test]
fn opcode_from_u8_rejects_unknown() {
    assert_eq!(Opcode::from_u8(18), Some(Opcode::Leave));
    assert_eq!(Opcode::from_u8(19), None);
    assert_eq!(Opcode::from_u8(0xff), None);
}

// ─── Container round trip ─────────────────────────────────────────────────────

#[test]
fn container_round_trip() {
    let mut b = ImageBuilder::new();
    let foo = b.intern("foo");
    let bar = b.intern("bär");
    b.emit(Opcode::SLoad, 0, foo);
    b.emit(Opcode::SLoad, 0, bar);
    b.emit(Opcode::Add, 0, 0);
    b.emit(Opcode::End, 0, 0);
    let image = b.finish();

    let bytes = image.to_bytes();
    assert_eq!(&bytes[..8], &SIGNATURE);

    let loaded = BytecodeImage::from_bytes(&bytes).expect("load should succeed");
    assert_eq!(loaded.instructions, image.instructions);
    assert_eq!(loaded.descriptors, image.descriptors);
    assert_eq!(loaded.string_literal(foo).unwrap(), "foo");
    assert_eq!(loaded.string_literal(bar).unwrap(), "bär");
}

#[test]
fn intern_deduplicates() {
    let mut b = ImageBuilder::new();
    let a = b.intern("x");
    let b2 = b.intern("y");
    let a2 = b.intern("x");
    assert_eq!(a, a2);
    assert_ne!(a, b2);
}

#[test]
fn literal_sizes_count_the_trailing_null() {
    let mut b = ImageBuilder::new();
    let id = b.intern("abc");
    let image = b.finish();
    let desc = image.descriptors[id as usize];
    assert_eq!(desc.size as usize, 4 * WCHAR_SIZE);
}

// ─── Malformed containers ─────────────────────────────────────────────────────

#[test]
fn rejects_bad_signature() {
    let mut bytes = ImageBuilder::new().finish().to_bytes();
    bytes[0] = b'x';
    assert!(matches!(
        BytecodeImage::from_bytes(&bytes),
        Err(ImageError::BadSignature)
    ));
}

#[test]
fn rejects_truncated_header() {
    assert!(matches!(
        BytecodeImage::from_bytes(b"goat v.1"),
        Err(ImageError::Truncated)
    ));
}

#[test]
fn rejects_out_of_order_offsets() {
    let mut b = ImageBuilder::new();
    b.emit(Opcode::End, 0, 0);
    let mut bytes = b.finish().to_bytes();
    // data offset pointing before the descriptor section
    bytes[24..32].copy_from_slice(&8u64.to_le_bytes());
    assert!(matches!(
        BytecodeImage::from_bytes(&bytes),
        Err(ImageError::BadLayout)
    ));
}

#[test]
fn literal_out_of_range_is_bad_bytecode() {
    let image = ImageBuilder::new().finish();
    assert!(matches!(
        image.string_literal(7),
        Err(BadBytecode::BadDescriptor(7))
    ));
}

#[test]
fn literal_without_terminator_is_bad_bytecode() {
    let image = BytecodeImage {
        instructions: Vec::new(),
        descriptors: vec![DataDescriptor { offset: 0, size: 4 }],
        data: 0x41u32.to_le_bytes().to_vec(), // one char, no null
    };
    assert!(matches!(
        image.string_literal(0),
        Err(BadBytecode::BadLiteral(0))
    ));
}

#[test]
fn literal_with_invalid_scalar_is_bad_bytecode() {
    let mut data = Vec::new();
    data.extend_from_slice(&0xd800u32.to_le_bytes()); // lone surrogate
    data.extend_from_slice(&0u32.to_le_bytes());
    let image = BytecodeImage {
        instructions: Vec::new(),
        descriptors: vec![DataDescriptor { offset: 0, size: 8 }],
        data,
    };
    assert!(matches!(
        image.string_literal(0),
        Err(BadBytecode::BadLiteral(0))
    ));
}

// ─── Disassembler ─────────────────────────────────────────────────────────────

#[test]
fn disassembly_names_opcodes_and_strings() {
    let mut b = ImageBuilder::new();
    let id = b.intern("greeting");
    b.emit(Opcode::SLoad, 0, id);
    b.emit(Opcode::End, 0, 0);
    let text = b.finish().disassemble();
    assert!(text.contains("SLOAD"));
    assert!(text.contains("END"));
    assert!(text.contains("\"greeting\""));
}
