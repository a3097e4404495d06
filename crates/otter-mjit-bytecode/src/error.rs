//! Bytecode errors

use thiserror::Error;

/// Errors that can occur while decoding or validating bytecode
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BytecodeError {
    /// Invalid opcode byte
    #[error("Invalid opcode 0x{opcode:02x} at byte offset {offset}")]
    InvalidOpcode {
        /// The offending byte
        opcode: u8,
        /// Byte offset of the opcode
        offset: usize,
    },

    /// Operand bytes ran past the end of the stream
    #[error("Unexpected end of bytecode at byte offset {0}")]
    UnexpectedEnd(usize),

    /// Operand refers to something the function does not have
    #[error("Invalid operand at pc {pc}: {detail}")]
    InvalidOperand {
        /// Instruction index
        pc: usize,
        /// What was wrong with it
        detail: String,
    },

    /// Jump leaves the function body
    #[error("Jump at pc {pc} with offset {offset} leaves the function (len={len})")]
    JumpOutOfRange {
        /// Instruction index of the jump
        pc: usize,
        /// Relative offset
        offset: i32,
        /// Number of instructions in the function
        len: usize,
    },
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
