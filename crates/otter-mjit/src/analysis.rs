//! Pre-pass over the bytecode: stack depth at every reachable pc, jump
//! targets and loop heads.

use otter_mjit_bytecode::{Function, Instruction};

use crate::compiler::{JitError, JitResult};

/// Control-flow facts the compiler needs before emitting anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    /// Operand stack depth on entry to each pc; `None` if unreachable
    pub depths: Vec<Option<u32>>,
    /// Pcs some jump lands on
    pub jump_targets: Vec<bool>,
    /// Pcs a backward jump lands on
    pub loop_heads: Vec<bool>,
    /// Deepest stack anywhere in the function
    pub max_depth: u32,
}

impl Analysis {
    /// Does a jump land on `pc`
    pub fn is_jump_target(&self, pc: usize) -> bool {
        self.jump_targets.get(pc).copied().unwrap_or(false)
    }

    /// Is `pc` reachable from the entry
    pub fn is_reachable(&self, pc: usize) -> bool {
        self.depths.get(pc).copied().flatten().is_some()
    }

    /// Entry depth of `pc`
    pub fn depth(&self, pc: usize) -> Option<u32> {
        self.depths.get(pc).copied().flatten()
    }
}

fn apply(pc: usize, depth: u32, uses: u32, defs: u32) -> JitResult<u32> {
    depth
        .checked_sub(uses)
        .map(|d| d + defs)
        .ok_or(JitError::StackUnderflow { pc })
}

/// Walk every path from the entry, checking that depths agree at merges
pub fn analyze(function: &Function) -> JitResult<Analysis> {
    let len = function.instructions.len();
    let mut analysis = Analysis {
        depths: vec![None; len],
        jump_targets: vec![false; len],
        loop_heads: vec![false; len],
        max_depth: 0,
    };
    if len == 0 {
        return Err(JitError::FallsOffEnd { pc: 0 });
    }

    let mut worklist = vec![(0usize, 0u32)];
    while let Some((pc, depth)) = worklist.pop() {
        match analysis.depths[pc] {
            Some(expected) if expected == depth => continue,
            Some(expected) => {
                return Err(JitError::StackDepthMismatch {
                    pc,
                    expected,
                    found: depth,
                });
            }
            None => analysis.depths[pc] = Some(depth),
        }
        analysis.max_depth = analysis.max_depth.max(depth);

        let instruction: &Instruction = &function.instructions[pc];
        if let Some(taken) = instruction.taken_stack_effect() {
            let target = function
                .jump_target(pc)
                .ok_or(JitError::InvalidJumpTarget { pc })?;
            analysis.jump_targets[target] = true;
            if target <= pc {
                analysis.loop_heads[target] = true;
            }
            let after = apply(pc, depth, taken.uses, taken.defs)?;
            analysis.max_depth = analysis.max_depth.max(after);
            worklist.push((target, after));
        }
        if instruction.is_terminator() {
            continue;
        }
        let effect = instruction.stack_effect();
        let after = apply(pc, depth, effect.uses, effect.defs)?;
        analysis.max_depth = analysis.max_depth.max(after);
        if pc + 1 >= len {
            return Err(JitError::FallsOffEnd { pc });
        }
        worklist.push((pc + 1, after));
    }

    tracing::trace!(
        function = function.display_name(),
        max_depth = analysis.max_depth,
        targets = analysis.jump_targets.iter().filter(|&&t| t).count(),
        "analyzed bytecode"
    );
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_mjit_bytecode::{FunctionBuilder, JumpOffset, LocalIndex};

    #[test]
    fn test_depths_and_loop_heads() {
        // i = 0; loop: if !(i < 3) break; i++; goto loop
        let function = FunctionBuilder::new()
            .local_count(1)
            .instructions(vec![
                Instruction::Int32 { value: 0 },
                Instruction::SetLocal { idx: LocalIndex(0) },
                Instruction::Pop,
                Instruction::LoopHead,
                Instruction::GetLocal { idx: LocalIndex(0) },
                Instruction::Int32 { value: 3 },
                Instruction::Lt,
                Instruction::IfEq { offset: JumpOffset(4) },
                Instruction::IncLocal { idx: LocalIndex(0) },
                Instruction::Pop,
                Instruction::Goto { offset: JumpOffset(-7) },
                Instruction::ReturnUndefined,
            ])
            .build();
        let analysis = analyze(&function).expect("valid");
        assert_eq!(analysis.depth(3), Some(0));
        assert_eq!(analysis.depth(6), Some(2));
        assert_eq!(analysis.depth(11), Some(0));
        assert!(analysis.loop_heads[3]);
        assert!(analysis.is_jump_target(11));
        assert!(!analysis.is_jump_target(8));
        assert_eq!(analysis.max_depth, 2);
    }

    #[test]
    fn test_and_keeps_operand_on_taken_edge() {
        let function = FunctionBuilder::new()
            .instructions(vec![
                Instruction::True,
                Instruction::And { offset: JumpOffset(2) },
                Instruction::False,
                Instruction::Return,
            ])
            .build();
        let analysis = analyze(&function).expect("valid");
        assert_eq!(analysis.depth(3), Some(1));
    }

    #[test]
    fn test_mismatched_merge_is_rejected() {
        let function = FunctionBuilder::new()
            .instructions(vec![
                Instruction::True,
                Instruction::IfEq { offset: JumpOffset(2) },
                Instruction::Null,
                Instruction::ReturnUndefined,
            ])
            .build();
        assert!(matches!(
            analyze(&function),
            Err(JitError::StackDepthMismatch { pc: 3, .. })
        ));
    }

    #[test]
    fn test_underflow_and_fall_off() {
        let underflow = FunctionBuilder::new().instruction(Instruction::Pop).build();
        assert!(matches!(analyze(&underflow), Err(JitError::StackUnderflow { pc: 0 })));
        let falls = FunctionBuilder::new().instruction(Instruction::Null).build();
        assert!(matches!(analyze(&falls), Err(JitError::FallsOffEnd { pc: 0 })));
    }
}
