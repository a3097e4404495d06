//! Function bytecode representation

use serde::{Deserialize, Serialize};

use crate::constant::{Constant, ConstantPool};
use crate::error::{BytecodeError, Result};
use crate::instruction::{self, Instruction};
use crate::operand::{ConstantIndex, TemplateIndex};

/// Layout of an object literal, fixed when the literal is opened
///
/// Property `i` lives in named slot `i` of objects created from the template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTemplate {
    /// Property names (string constants), in slot order
    pub properties: Vec<ConstantIndex>,
}

impl ObjectTemplate {
    /// Create a template from property names
    pub fn new(properties: Vec<ConstantIndex>) -> Self {
        Self { properties }
    }

    /// Slot holding `name`, if the template declares it
    pub fn slot_of(&self, name: ConstantIndex) -> Option<u32> {
        self.properties
            .iter()
            .position(|&p| p == name)
            .map(|slot| slot as u32)
    }
}

/// A bytecode function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Function name (empty for anonymous)
    pub name: Option<String>,

    /// Number of formal arguments
    pub param_count: u16,

    /// Number of local variables
    pub local_count: u16,

    /// Bytecode instructions; the pc of an instruction is its index
    pub instructions: Vec<Instruction>,

    /// Numbers and strings referenced by the instructions
    pub constants: ConstantPool,

    /// Object-literal layouts referenced by `NewObject`
    pub templates: Vec<ObjectTemplate>,
}

impl Function {
    /// Create a new function builder
    pub fn builder() -> FunctionBuilder {
        FunctionBuilder::new()
    }

    /// Get the function name or `<anonymous>`
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    /// String constant at `idx`
    pub fn string_constant(&self, idx: ConstantIndex) -> Option<&str> {
        self.constants.get(idx.index()).and_then(Constant::as_str)
    }

    /// Number constant at `idx`
    pub fn number_constant(&self, idx: ConstantIndex) -> Option<f64> {
        self.constants.get(idx.index()).and_then(Constant::as_number)
    }

    /// Template at `idx`
    pub fn template(&self, idx: TemplateIndex) -> Option<&ObjectTemplate> {
        self.templates.get(idx.index() as usize)
    }

    /// Absolute target of the jump at `pc`
    pub fn jump_target(&self, pc: usize) -> Option<usize> {
        let offset = self.instructions.get(pc)?.jump_offset()?;
        offset
            .target(pc)
            .filter(|&target| target < self.instructions.len())
    }

    /// Byte encoding of the instruction stream
    pub fn encode_instructions(&self) -> Vec<u8> {
        instruction::encode_all(&self.instructions)
    }

    /// Check that every operand refers to something this function has
    pub fn validate(&self) -> Result<()> {
        let len = self.instructions.len();
        for (pc, instruction) in self.instructions.iter().enumerate() {
            if let Some(offset) = instruction.jump_offset()
                && self.jump_target(pc).is_none()
            {
                return Err(BytecodeError::JumpOutOfRange {
                    pc,
                    offset: offset.offset(),
                    len,
                });
            }
            let bad = |detail: String| Err(BytecodeError::InvalidOperand { pc, detail });
            match *instruction {
                Instruction::GetLocal { idx }
                | Instruction::SetLocal { idx }
                | Instruction::IncLocal { idx }
                | Instruction::DecLocal { idx }
                | Instruction::LocalInc { idx }
                | Instruction::LocalDec { idx }
                    if idx.index() >= self.local_count =>
                {
                    return bad(format!("local {} of {}", idx.index(), self.local_count));
                }
                Instruction::GetArg { idx }
                | Instruction::SetArg { idx }
                | Instruction::IncArg { idx }
                | Instruction::DecArg { idx }
                | Instruction::ArgInc { idx }
                | Instruction::ArgDec { idx }
                    if idx.index() >= self.param_count =>
                {
                    return bad(format!("argument {} of {}", idx.index(), self.param_count));
                }
                Instruction::Double { idx } if self.number_constant(idx).is_none() => {
                    return bad(format!("constant {} is not a number", idx.index()));
                }
                Instruction::String { idx }
                | Instruction::InitProp { name: idx }
                | Instruction::InitMethod { name: idx }
                    if self.string_constant(idx).is_none() =>
                {
                    return bad(format!("constant {} is not a string", idx.index()));
                }
                Instruction::NewObject { template } if self.template(template).is_none() => {
                    return bad(format!("template {}", template.index()));
                }
                _ => {}
            }
        }
        for template in &self.templates {
            for &name in &template.properties {
                if self.string_constant(name).is_none() {
                    return Err(BytecodeError::InvalidOperand {
                        pc: 0,
                        detail: format!("template property {} is not a string", name.index()),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Builder for creating functions
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    name: Option<String>,
    param_count: u16,
    local_count: u16,
    instructions: Vec<Instruction>,
    constants: ConstantPool,
    templates: Vec<ObjectTemplate>,
}

impl FunctionBuilder {
    /// Create a new function builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set function name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set parameter count
    pub fn param_count(mut self, count: u16) -> Self {
        self.param_count = count;
        self
    }

    /// Set local variable count
    pub fn local_count(mut self, count: u16) -> Self {
        self.local_count = count;
        self
    }

    /// Set all instructions
    pub fn instructions(mut self, instructions: Vec<Instruction>) -> Self {
        self.instructions = instructions;
        self
    }

    /// Add a single instruction
    pub fn instruction(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// Replace the instructions with a decoded byte stream
    pub fn bytecode(mut self, bytes: &[u8]) -> Result<Self> {
        self.instructions = instruction::decode_all(bytes)?;
        Ok(self)
    }

    /// Intern a number constant
    pub fn number(&mut self, n: f64) -> ConstantIndex {
        ConstantIndex(self.constants.add_number(n))
    }

    /// Intern a string constant
    pub fn string(&mut self, s: &str) -> ConstantIndex {
        ConstantIndex(self.constants.add_string(s))
    }

    /// Register an object-literal template with the given property names
    pub fn template(&mut self, properties: &[&str]) -> TemplateIndex {
        let properties = properties.iter().map(|p| self.string(p)).collect();
        self.templates.push(ObjectTemplate::new(properties));
        TemplateIndex(self.templates.len() as u32 - 1)
    }

    /// Build the function
    pub fn build(self) -> Function {
        Function {
            name: self.name,
            param_count: self.param_count,
            local_count: self.local_count,
            instructions: self.instructions,
            constants: self.constants,
            templates: self.templates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{JumpOffset, LocalIndex};

    #[test]
    fn test_function_builder() {
        let mut builder = Function::builder().name("or_zero").param_count(1);
        let half = builder.number(2.5);
        let func = builder
            .instruction(Instruction::Double { idx: half })
            .instruction(Instruction::Int32 { value: 0 })
            .instruction(Instruction::BitOr)
            .instruction(Instruction::Return)
            .build();

        assert_eq!(func.display_name(), "or_zero");
        assert_eq!(func.param_count, 1);
        assert_eq!(func.instructions.len(), 4);
        assert_eq!(func.number_constant(half), Some(2.5));
        func.validate().expect("function should validate");
    }

    #[test]
    fn test_templates() {
        let mut builder = Function::builder();
        let t = builder.template(&["x", "y"]);
        let y = builder.string("y");
        let func = builder.build();
        let template = func.template(t).expect("template should exist");
        assert_eq!(template.slot_of(y), Some(1));
        assert_eq!(func.string_constant(template.properties[0]), Some("x"));
    }

    #[test]
    fn test_validate_rejects_bad_operands() {
        let func = Function::builder()
            .local_count(1)
            .instruction(Instruction::GetLocal {
                idx: LocalIndex(1),
            })
            .instruction(Instruction::Return)
            .build();
        assert!(matches!(
            func.validate(),
            Err(BytecodeError::InvalidOperand { pc: 0, .. })
        ));

        let func = Function::builder()
            .instruction(Instruction::Goto {
                offset: JumpOffset(5),
            })
            .build();
        assert!(matches!(
            func.validate(),
            Err(BytecodeError::JumpOutOfRange { pc: 0, .. })
        ));
    }

    #[test]
    fn test_bytecode_stream() {
        let func = Function::builder()
            .param_count(1)
            .instruction(Instruction::GetArg {
                idx: crate::ArgIndex(0),
            })
            .instruction(Instruction::Return)
            .build();
        let bytes = func.encode_instructions();
        let decoded = Function::builder()
            .param_count(1)
            .bytecode(&bytes)
            .expect("bytes should decode")
            .build();
        assert_eq!(decoded.instructions, func.instructions);

        let json = serde_json::to_string(&func.instructions).expect("serialize");
        assert!(json.contains("GetArg"));
    }
}
