//! # Otter method-JIT bytecode
//!
//! The stack bytecode consumed by the Otter method JIT.
//!
//! ## Design Principles
//!
//! - **Stack-based**: operations pop their operands and push their results
//! - **Fixed stack effects**: every instruction declares how many values it
//!   consumes and produces, so compilers can check themselves against it
//! - **Byte-encoded**: an opcode byte followed by little-endian inline operands
//! - **Serializable**: every type derives `serde` traits

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod constant;
pub mod error;
pub mod function;
pub mod instruction;
pub mod operand;

pub use constant::{Constant, ConstantPool};
pub use error::{BytecodeError, Result};
pub use function::{Function, FunctionBuilder, ObjectTemplate};
pub use instruction::{Instruction, Opcode, StackEffect};
pub use operand::{ArgIndex, ConstantIndex, JumpOffset, LocalIndex, TemplateIndex};

/// Bytecode format version
pub const BYTECODE_VERSION: u32 = 1;
