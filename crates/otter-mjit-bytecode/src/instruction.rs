//! Bytecode instructions (opcodes)

use serde::{Deserialize, Serialize};

use crate::error::{BytecodeError, Result};
use crate::operand::{ArgIndex, ConstantIndex, JumpOffset, LocalIndex, TemplateIndex};

/// Bytecode opcodes
///
/// Stack-based instruction set. Operands live on the operand stack; the few
/// inline operands (indices, immediates, jump offsets) follow the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // ==================== Misc ====================
    /// No operation
    Nop = 0x00,
    /// Marks the head of a loop (target of a back edge)
    LoopHead = 0x01,

    // ==================== Constants ====================
    /// Push undefined
    Undefined = 0x08,
    /// Push null
    Null = 0x09,
    /// Push true
    True = 0x0A,
    /// Push false
    False = 0x0B,
    /// Push a 32-bit integer immediate
    Int32 = 0x0C,
    /// Push a number from the constant pool
    Double = 0x0D,
    /// Push a string from the constant pool
    String = 0x0E,

    // ==================== Variables ====================
    /// Push locals\[idx\]
    GetLocal = 0x10,
    /// locals\[idx\] = top (value stays on the stack)
    SetLocal = 0x11,
    /// Push args\[idx\]
    GetArg = 0x12,
    /// args\[idx\] = top (value stays on the stack)
    SetArg = 0x13,

    // ==================== Increment / decrement ====================
    /// `++local`
    IncLocal = 0x18,
    /// `--local`
    DecLocal = 0x19,
    /// `local++`
    LocalInc = 0x1A,
    /// `local--`
    LocalDec = 0x1B,
    /// `++arg`
    IncArg = 0x1C,
    /// `--arg`
    DecArg = 0x1D,
    /// `arg++`
    ArgInc = 0x1E,
    /// `arg--`
    ArgDec = 0x1F,

    // ==================== Stack ====================
    /// Discard the top value
    Pop = 0x20,
    /// Duplicate the top value
    Dup = 0x21,
    /// Swap the two top values
    Swap = 0x22,

    // ==================== Arithmetic ====================
    /// lhs + rhs
    Add = 0x28,
    /// lhs - rhs
    Sub = 0x29,
    /// +value (ToNumber)
    Pos = 0x2A,

    // ==================== Bitwise ====================
    /// lhs | rhs
    BitOr = 0x30,
    /// lhs & rhs
    BitAnd = 0x31,
    /// lhs ^ rhs
    BitXor = 0x32,
    /// ~value
    BitNot = 0x33,
    /// lhs << rhs
    Lsh = 0x34,
    /// lhs >> rhs
    Rsh = 0x35,
    /// lhs >>> rhs
    Ursh = 0x36,

    // ==================== Comparison ====================
    /// lhs == rhs
    Eq = 0x40,
    /// lhs != rhs
    Ne = 0x41,
    /// lhs === rhs
    StrictEq = 0x42,
    /// lhs !== rhs
    StrictNe = 0x43,
    /// lhs < rhs
    Lt = 0x44,
    /// lhs <= rhs
    Le = 0x45,
    /// lhs > rhs
    Gt = 0x46,
    /// lhs >= rhs
    Ge = 0x47,

    // ==================== Logical / type ====================
    /// !value
    Not = 0x50,
    /// typeof value
    TypeOf = 0x51,

    // ==================== Control flow ====================
    /// Unconditional jump
    Goto = 0x60,
    /// Pop; jump if falsy
    IfEq = 0x61,
    /// Pop; jump if truthy
    IfNe = 0x62,
    /// Jump keeping the value if falsy, else pop (`&&`)
    And = 0x63,
    /// Jump keeping the value if truthy, else pop (`||`)
    Or = 0x64,

    // ==================== Elements ====================
    /// obj\[key\]
    GetElem = 0x70,
    /// obj\[key\] = value (leaves value)
    SetElem = 0x71,

    // ==================== Literals ====================
    /// Push a new empty object with no recorded layout
    NewInit = 0x78,
    /// Push a new object laid out from a template
    NewObject = 0x79,
    /// Push a new array literal of the given length
    NewArray = 0x7A,
    /// Define a named property on the literal under construction
    InitProp = 0x7B,
    /// Define a method on the literal under construction
    InitMethod = 0x7C,
    /// Define an element on the literal under construction
    InitElem = 0x7D,
    /// End of a literal
    EndInit = 0x7E,

    // ==================== Return ====================
    /// Return the top value
    Return = 0x90,
    /// Return undefined
    ReturnUndefined = 0x91,
}

impl Opcode {
    /// Convert from raw byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Nop,
            0x01 => Self::LoopHead,

            0x08 => Self::Undefined,
            0x09 => Self::Null,
            0x0A => Self::True,
            0x0B => Self::False,
            0x0C => Self::Int32,
            0x0D => Self::Double,
            0x0E => Self::String,

            0x10 => Self::GetLocal,
            0x11 => Self::SetLocal,
            0x12 => Self::GetArg,
            0x13 => Self::SetArg,

            0x18 => Self::IncLocal,
            0x19 => Self::DecLocal,
            0x1A => Self::LocalInc,
            0x1B => Self::LocalDec,
            0x1C => Self::IncArg,
            0x1D => Self::DecArg,
            0x1E => Self::ArgInc,
            0x1F => Self::ArgDec,

            0x20 => Self::Pop,
            0x21 => Self::Dup,
            0x22 => Self::Swap,

            0x28 => Self::Add,
            0x29 => Self::Sub,
            0x2A => Self::Pos,

            0x30 => Self::BitOr,
            0x31 => Self::BitAnd,
            0x32 => Self::BitXor,
            0x33 => Self::BitNot,
            0x34 => Self::Lsh,
            0x35 => Self::Rsh,
            0x36 => Self::Ursh,

            0x40 => Self::Eq,
            0x41 => Self::Ne,
            0x42 => Self::StrictEq,
            0x43 => Self::StrictNe,
            0x44 => Self::Lt,
            0x45 => Self::Le,
            0x46 => Self::Gt,
            0x47 => Self::Ge,

            0x50 => Self::Not,
            0x51 => Self::TypeOf,

            0x60 => Self::Goto,
            0x61 => Self::IfEq,
            0x62 => Self::IfNe,
            0x63 => Self::And,
            0x64 => Self::Or,

            0x70 => Self::GetElem,
            0x71 => Self::SetElem,

            0x78 => Self::NewInit,
            0x79 => Self::NewObject,
            0x7A => Self::NewArray,
            0x7B => Self::InitProp,
            0x7C => Self::InitMethod,
            0x7D => Self::InitElem,
            0x7E => Self::EndInit,

            0x90 => Self::Return,
            0x91 => Self::ReturnUndefined,
            _ => return None,
        })
    }

    /// Convert to raw byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Size in bytes of the inline operands following this opcode
    pub const fn operand_size(self) -> usize {
        match self {
            Self::GetLocal
            | Self::SetLocal
            | Self::GetArg
            | Self::SetArg
            | Self::IncLocal
            | Self::DecLocal
            | Self::LocalInc
            | Self::LocalDec
            | Self::IncArg
            | Self::DecArg
            | Self::ArgInc
            | Self::ArgDec => 2,
            Self::Int32
            | Self::Double
            | Self::String
            | Self::Goto
            | Self::IfEq
            | Self::IfNe
            | Self::And
            | Self::Or
            | Self::NewObject
            | Self::NewArray
            | Self::InitProp
            | Self::InitMethod => 4,
            _ => 0,
        }
    }

    /// Get the name of this opcode
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "Nop",
            Self::LoopHead => "LoopHead",
            Self::Undefined => "Undefined",
            Self::Null => "Null",
            Self::True => "True",
            Self::False => "False",
            Self::Int32 => "Int32",
            Self::Double => "Double",
            Self::String => "String",
            Self::GetLocal => "GetLocal",
            Self::SetLocal => "SetLocal",
            Self::GetArg => "GetArg",
            Self::SetArg => "SetArg",
            Self::IncLocal => "IncLocal",
            Self::DecLocal => "DecLocal",
            Self::LocalInc => "LocalInc",
            Self::LocalDec => "LocalDec",
            Self::IncArg => "IncArg",
            Self::DecArg => "DecArg",
            Self::ArgInc => "ArgInc",
            Self::ArgDec => "ArgDec",
            Self::Pop => "Pop",
            Self::Dup => "Dup",
            Self::Swap => "Swap",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Pos => "Pos",
            Self::BitOr => "BitOr",
            Self::BitAnd => "BitAnd",
            Self::BitXor => "BitXor",
            Self::BitNot => "BitNot",
            Self::Lsh => "Lsh",
            Self::Rsh => "Rsh",
            Self::Ursh => "Ursh",
            Self::Eq => "Eq",
            Self::Ne => "Ne",
            Self::StrictEq => "StrictEq",
            Self::StrictNe => "StrictNe",
            Self::Lt => "Lt",
            Self::Le => "Le",
            Self::Gt => "Gt",
            Self::Ge => "Ge",
            Self::Not => "Not",
            Self::TypeOf => "TypeOf",
            Self::Goto => "Goto",
            Self::IfEq => "IfEq",
            Self::IfNe => "IfNe",
            Self::And => "And",
            Self::Or => "Or",
            Self::GetElem => "GetElem",
            Self::SetElem => "SetElem",
            Self::NewInit => "NewInit",
            Self::NewObject => "NewObject",
            Self::NewArray => "NewArray",
            Self::InitProp => "InitProp",
            Self::InitMethod => "InitMethod",
            Self::InitElem => "InitElem",
            Self::EndInit => "EndInit",
            Self::Return => "Return",
            Self::ReturnUndefined => "ReturnUndefined",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of values an instruction pops and pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEffect {
    /// Values consumed from the top of the stack
    pub uses: u32,
    /// Values produced onto the stack
    pub defs: u32,
}

impl StackEffect {
    /// Create a stack effect
    pub const fn new(uses: u32, defs: u32) -> Self {
        Self { uses, defs }
    }

    /// Net change in stack depth
    pub const fn delta(self) -> i64 {
        self.defs as i64 - self.uses as i64
    }
}

/// A decoded instruction with its operands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Instruction {
    // Misc
    Nop,
    LoopHead,

    // Constants
    Undefined,
    Null,
    True,
    False,
    Int32 { value: i32 },
    Double { idx: ConstantIndex },
    String { idx: ConstantIndex },

    // Variables
    GetLocal { idx: LocalIndex },
    SetLocal { idx: LocalIndex },
    GetArg { idx: ArgIndex },
    SetArg { idx: ArgIndex },

    // Increment / decrement
    IncLocal { idx: LocalIndex },
    DecLocal { idx: LocalIndex },
    LocalInc { idx: LocalIndex },
    LocalDec { idx: LocalIndex },
    IncArg { idx: ArgIndex },
    DecArg { idx: ArgIndex },
    ArgInc { idx: ArgIndex },
    ArgDec { idx: ArgIndex },

    // Stack
    Pop,
    Dup,
    Swap,

    // Arithmetic
    Add,
    Sub,
    Pos,

    // Bitwise
    BitOr,
    BitAnd,
    BitXor,
    BitNot,
    Lsh,
    Rsh,
    Ursh,

    // Comparison
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical / type
    Not,
    TypeOf,

    // Control flow
    Goto { offset: JumpOffset },
    IfEq { offset: JumpOffset },
    IfNe { offset: JumpOffset },
    And { offset: JumpOffset },
    Or { offset: JumpOffset },

    // Elements
    GetElem,
    SetElem,

    // Literals
    NewInit,
    NewObject { template: TemplateIndex },
    NewArray { count: u32 },
    InitProp { name: ConstantIndex },
    InitMethod { name: ConstantIndex },
    InitElem,
    EndInit,

    // Return
    Return,
    ReturnUndefined,
}

impl Instruction {
    /// The opcode of this instruction
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Nop => Opcode::Nop,
            Self::LoopHead => Opcode::LoopHead,
            Self::Undefined => Opcode::Undefined,
            Self::Null => Opcode::Null,
            Self::True => Opcode::True,
            Self::False => Opcode::False,
            Self::Int32 { .. } => Opcode::Int32,
            Self::Double { .. } => Opcode::Double,
            Self::String { .. } => Opcode::String,
            Self::GetLocal { .. } => Opcode::GetLocal,
            Self::SetLocal { .. } => Opcode::SetLocal,
            Self::GetArg { .. } => Opcode::GetArg,
            Self::SetArg { .. } => Opcode::SetArg,
            Self::IncLocal { .. } => Opcode::IncLocal,
            Self::DecLocal { .. } => Opcode::DecLocal,
            Self::LocalInc { .. } => Opcode::LocalInc,
            Self::LocalDec { .. } => Opcode::LocalDec,
            Self::IncArg { .. } => Opcode::IncArg,
            Self::DecArg { .. } => Opcode::DecArg,
            Self::ArgInc { .. } => Opcode::ArgInc,
            Self::ArgDec { .. } => Opcode::ArgDec,
            Self::Pop => Opcode::Pop,
            Self::Dup => Opcode::Dup,
            Self::Swap => Opcode::Swap,
            Self::Add => Opcode::Add,
            Self::Sub => Opcode::Sub,
            Self::Pos => Opcode::Pos,
            Self::BitOr => Opcode::BitOr,
            Self::BitAnd => Opcode::BitAnd,
            Self::BitXor => Opcode::BitXor,
            Self::BitNot => Opcode::BitNot,
            Self::Lsh => Opcode::Lsh,
            Self::Rsh => Opcode::Rsh,
            Self::Ursh => Opcode::Ursh,
            Self::Eq => Opcode::Eq,
            Self::Ne => Opcode::Ne,
            Self::StrictEq => Opcode::StrictEq,
            Self::StrictNe => Opcode::StrictNe,
            Self::Lt => Opcode::Lt,
            Self::Le => Opcode::Le,
            Self::Gt => Opcode::Gt,
            Self::Ge => Opcode::Ge,
            Self::Not => Opcode::Not,
            Self::TypeOf => Opcode::TypeOf,
            Self::Goto { .. } => Opcode::Goto,
            Self::IfEq { .. } => Opcode::IfEq,
            Self::IfNe { .. } => Opcode::IfNe,
            Self::And { .. } => Opcode::And,
            Self::Or { .. } => Opcode::Or,
            Self::GetElem => Opcode::GetElem,
            Self::SetElem => Opcode::SetElem,
            Self::NewInit => Opcode::NewInit,
            Self::NewObject { .. } => Opcode::NewObject,
            Self::NewArray { .. } => Opcode::NewArray,
            Self::InitProp { .. } => Opcode::InitProp,
            Self::InitMethod { .. } => Opcode::InitMethod,
            Self::InitElem => Opcode::InitElem,
            Self::EndInit => Opcode::EndInit,
            Self::Return => Opcode::Return,
            Self::ReturnUndefined => Opcode::ReturnUndefined,
        }
    }

    /// Stack effect along the fall-through edge
    pub const fn stack_effect(&self) -> StackEffect {
        match self {
            Self::Nop | Self::LoopHead | Self::Goto { .. } | Self::EndInit => {
                StackEffect::new(0, 0)
            }
            Self::Undefined
            | Self::Null
            | Self::True
            | Self::False
            | Self::Int32 { .. }
            | Self::Double { .. }
            | Self::String { .. }
            | Self::GetLocal { .. }
            | Self::GetArg { .. }
            | Self::IncLocal { .. }
            | Self::DecLocal { .. }
            | Self::LocalInc { .. }
            | Self::LocalDec { .. }
            | Self::IncArg { .. }
            | Self::DecArg { .. }
            | Self::ArgInc { .. }
            | Self::ArgDec { .. }
            | Self::NewInit
            | Self::NewObject { .. }
            | Self::NewArray { .. } => StackEffect::new(0, 1),
            Self::SetLocal { .. }
            | Self::SetArg { .. }
            | Self::Pos
            | Self::BitNot
            | Self::Not
            | Self::TypeOf => StackEffect::new(1, 1),
            Self::Pop
            | Self::IfEq { .. }
            | Self::IfNe { .. }
            | Self::And { .. }
            | Self::Or { .. }
            | Self::Return => StackEffect::new(1, 0),
            Self::Dup => StackEffect::new(1, 2),
            Self::Swap => StackEffect::new(2, 2),
            Self::Add
            | Self::Sub
            | Self::BitOr
            | Self::BitAnd
            | Self::BitXor
            | Self::Lsh
            | Self::Rsh
            | Self::Ursh
            | Self::Eq
            | Self::Ne
            | Self::StrictEq
            | Self::StrictNe
            | Self::Lt
            | Self::Le
            | Self::Gt
            | Self::Ge
            | Self::GetElem
            | Self::InitProp { .. }
            | Self::InitMethod { .. } => StackEffect::new(2, 1),
            Self::SetElem | Self::InitElem => StackEffect::new(3, 1),
            Self::ReturnUndefined => StackEffect::new(0, 0),
        }
    }

    /// Stack effect along the taken edge of a jump
    ///
    /// `And`/`Or` leave their operand on the stack when they jump.
    pub const fn taken_stack_effect(&self) -> Option<StackEffect> {
        match self {
            Self::Goto { .. } => Some(StackEffect::new(0, 0)),
            Self::IfEq { .. } | Self::IfNe { .. } => Some(StackEffect::new(1, 0)),
            Self::And { .. } | Self::Or { .. } => Some(StackEffect::new(1, 1)),
            _ => None,
        }
    }

    /// Relative jump offset, if this is a jump
    pub const fn jump_offset(&self) -> Option<JumpOffset> {
        match self {
            Self::Goto { offset }
            | Self::IfEq { offset }
            | Self::IfNe { offset }
            | Self::And { offset }
            | Self::Or { offset } => Some(*offset),
            _ => None,
        }
    }

    /// Control never falls through to the next instruction
    pub const fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Goto { .. } | Self::Return | Self::ReturnUndefined
        )
    }

    /// Append the byte encoding of this instruction
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode().to_byte());
        match *self {
            Self::GetLocal { idx }
            | Self::SetLocal { idx }
            | Self::IncLocal { idx }
            | Self::DecLocal { idx }
            | Self::LocalInc { idx }
            | Self::LocalDec { idx } => out.extend_from_slice(&idx.index().to_le_bytes()),
            Self::GetArg { idx }
            | Self::SetArg { idx }
            | Self::IncArg { idx }
            | Self::DecArg { idx }
            | Self::ArgInc { idx }
            | Self::ArgDec { idx } => out.extend_from_slice(&idx.index().to_le_bytes()),
            Self::Int32 { value } => out.extend_from_slice(&value.to_le_bytes()),
            Self::Double { idx } | Self::String { idx } => {
                out.extend_from_slice(&idx.index().to_le_bytes())
            }
            Self::InitProp { name } | Self::InitMethod { name } => {
                out.extend_from_slice(&name.index().to_le_bytes())
            }
            Self::Goto { offset }
            | Self::IfEq { offset }
            | Self::IfNe { offset }
            | Self::And { offset }
            | Self::Or { offset } => out.extend_from_slice(&offset.offset().to_le_bytes()),
            Self::NewObject { template } => out.extend_from_slice(&template.index().to_le_bytes()),
            Self::NewArray { count } => out.extend_from_slice(&count.to_le_bytes()),
            _ => {}
        }
    }

    /// Decode one instruction at `offset`; returns it and the byte length consumed
    pub fn decode(bytes: &[u8], offset: usize) -> Result<(Self, usize)> {
        let byte = *bytes.get(offset).ok_or(BytecodeError::UnexpectedEnd(offset))?;
        let opcode = Opcode::from_byte(byte).ok_or(BytecodeError::InvalidOpcode {
            opcode: byte,
            offset,
        })?;
        let size = opcode.operand_size();
        let operands = bytes
            .get(offset + 1..offset + 1 + size)
            .ok_or(BytecodeError::UnexpectedEnd(offset + 1))?;
        let u16_at = || u16::from_le_bytes([operands[0], operands[1]]);
        let u32_at = || u32::from_le_bytes([operands[0], operands[1], operands[2], operands[3]]);
        let i32_at = || i32::from_le_bytes([operands[0], operands[1], operands[2], operands[3]]);

        let instruction = match opcode {
            Opcode::Nop => Self::Nop,
            Opcode::LoopHead => Self::LoopHead,
            Opcode::Undefined => Self::Undefined,
            Opcode::Null => Self::Null,
            Opcode::True => Self::True,
            Opcode::False => Self::False,
            Opcode::Int32 => Self::Int32 { value: i32_at() },
            Opcode::Double => Self::Double {
                idx: ConstantIndex(u32_at()),
            },
            Opcode::String => Self::String {
                idx: ConstantIndex(u32_at()),
            },
            Opcode::GetLocal => Self::GetLocal {
                idx: LocalIndex(u16_at()),
            },
            Opcode::SetLocal => Self::SetLocal {
                idx: LocalIndex(u16_at()),
            },
            Opcode::GetArg => Self::GetArg {
                idx: ArgIndex(u16_at()),
            },
            Opcode::SetArg => Self::SetArg {
                idx: ArgIndex(u16_at()),
            },
            Opcode::IncLocal => Self::IncLocal {
                idx: LocalIndex(u16_at()),
            },
            Opcode::DecLocal => Self::DecLocal {
                idx: LocalIndex(u16_at()),
            },
            Opcode::LocalInc => Self::LocalInc {
                idx: LocalIndex(u16_at()),
            },
            Opcode::LocalDec => Self::LocalDec {
                idx: LocalIndex(u16_at()),
            },
            Opcode::IncArg => Self::IncArg {
                idx: ArgIndex(u16_at()),
            },
            Opcode::DecArg => Self::DecArg {
                idx: ArgIndex(u16_at()),
            },
            Opcode::ArgInc => Self::ArgInc {
                idx: ArgIndex(u16_at()),
            },
            Opcode::ArgDec => Self::ArgDec {
                idx: ArgIndex(u16_at()),
            },
            Opcode::Pop => Self::Pop,
            Opcode::Dup => Self::Dup,
            Opcode::Swap => Self::Swap,
            Opcode::Add => Self::Add,
            Opcode::Sub => Self::Sub,
            Opcode::Pos => Self::Pos,
            Opcode::BitOr => Self::BitOr,
            Opcode::BitAnd => Self::BitAnd,
            Opcode::BitXor => Self::BitXor,
            Opcode::BitNot => Self::BitNot,
            Opcode::Lsh => Self::Lsh,
            Opcode::Rsh => Self::Rsh,
            Opcode::Ursh => Self::Ursh,
            Opcode::Eq => Self::Eq,
            Opcode::Ne => Self::Ne,
            Opcode::StrictEq => Self::StrictEq,
            Opcode::StrictNe => Self::StrictNe,
            Opcode::Lt => Self::Lt,
            Opcode::Le => Self::Le,
            Opcode::Gt => Self::Gt,
            Opcode::Ge => Self::Ge,
            Opcode::Not => Self::Not,
            Opcode::TypeOf => Self::TypeOf,
            Opcode::Goto => Self::Goto {
                offset: JumpOffset(i32_at()),
            },
            Opcode::IfEq => Self::IfEq {
                offset: JumpOffset(i32_at()),
            },
            Opcode::IfNe => Self::IfNe {
                offset: JumpOffset(i32_at()),
            },
            Opcode::And => Self::And {
                offset: JumpOffset(i32_at()),
            },
            Opcode::Or => Self::Or {
                offset: JumpOffset(i32_at()),
            },
            Opcode::GetElem => Self::GetElem,
            Opcode::SetElem => Self::SetElem,
            Opcode::NewInit => Self::NewInit,
            Opcode::NewObject => Self::NewObject {
                template: TemplateIndex(u32_at()),
            },
            Opcode::NewArray => Self::NewArray { count: u32_at() },
            Opcode::InitProp => Self::InitProp {
                name: ConstantIndex(u32_at()),
            },
            Opcode::InitMethod => Self::InitMethod {
                name: ConstantIndex(u32_at()),
            },
            Opcode::InitElem => Self::InitElem,
            Opcode::EndInit => Self::EndInit,
            Opcode::Return => Self::Return,
            Opcode::ReturnUndefined => Self::ReturnUndefined,
        };
        Ok((instruction, 1 + size))
    }
}

/// Decode a whole instruction stream
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (instruction, len) = Instruction::decode(bytes, offset)?;
        instructions.push(instruction);
        offset += len;
    }
    Ok(instructions)
}

/// Encode a whole instruction stream
pub fn encode_all(instructions: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instructions.len() * 3);
    for instruction in instructions {
        instruction.encode(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        let ops = [
            Opcode::Undefined,
            Opcode::Add,
            Opcode::Ursh,
            Opcode::Goto,
            Opcode::InitElem,
            Opcode::Return,
        ];

        for op in ops {
            let byte = op.to_byte();
            let decoded = Opcode::from_byte(byte);
            assert_eq!(decoded, Some(op));
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_byte(0xFF), None);
        let err = Instruction::decode(&[0xFF], 0).expect_err("0xFF is not an opcode");
        assert_eq!(
            err,
            BytecodeError::InvalidOpcode {
                opcode: 0xFF,
                offset: 0
            }
        );
    }

    #[test]
    fn test_opcode_name() {
        assert_eq!(Opcode::Add.name(), "Add");
        assert_eq!(Opcode::Undefined.name(), "Undefined");
        assert_eq!(Opcode::Goto.to_string(), "Goto");
    }

    #[test]
    fn test_decode_inline_operands() {
        let program = [
            Instruction::GetLocal {
                idx: LocalIndex(258),
            },
            Instruction::Int32 { value: -7 },
            Instruction::BitOr,
            Instruction::IfEq {
                offset: JumpOffset(-3),
            },
            Instruction::ReturnUndefined,
        ];
        let bytes = encode_all(&program);
        assert_eq!(bytes[0], Opcode::GetLocal.to_byte());
        assert_eq!(&bytes[1..3], &[2, 1]);
        assert_eq!(decode_all(&bytes).expect("stream should decode"), program);
    }

    #[test]
    fn test_truncated_operand() {
        let mut bytes = Vec::new();
        Instruction::Int32 { value: 1 }.encode(&mut bytes);
        bytes.pop();
        assert_eq!(decode_all(&bytes), Err(BytecodeError::UnexpectedEnd(1)));
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Instruction::SetElem.stack_effect(), StackEffect::new(3, 1));
        assert_eq!(Instruction::Dup.stack_effect().delta(), 1);
        let and = Instruction::And {
            offset: JumpOffset(2),
        };
        assert_eq!(and.stack_effect().delta(), -1);
        assert_eq!(and.taken_stack_effect().map(StackEffect::delta), Some(0));
        assert!(Instruction::ReturnUndefined.is_terminator());
        assert!(!Instruction::IfNe {
            offset: JumpOffset(1)
        }
        .is_terminator());
    }
}
