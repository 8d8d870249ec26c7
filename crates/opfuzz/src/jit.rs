//! Threaded-code JIT backend for compiled units.
//!
//! ## Lowering model
//!
//! Each instruction is lowered to one [`LoweredOp`] with its operand fully
//! resolved: table indices become names or constants, block references
//! become instruction offsets. A dispatch loop would then run the ops by
//! offset. Lowering fails on anything the backend cannot resolve, which is
//! what the fuzzer looks for.

use crate::errors::JitError;
use crate::opcodes::{CMP_OP, Opcode, OperandTable};
use crate::operand::Operand;
use crate::unit::CompiledUnit;

/// A single lowered instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum LoweredOp {
    /// Operates on the stack only.
    Stack(Opcode),
    /// Operand is a count or flag word.
    Counted { opcode: Opcode, count: u32 },
    Const { opcode: Opcode, value: Operand },
    Named { opcode: Opcode, name: String },
    Compare(&'static str),
    Jump { opcode: Opcode, target: usize },
}

/// Lowered form of one unit, ready for dispatch.
#[derive(Debug, Clone)]
pub struct JitCode {
    pub qualname: String,
    pub ops: Vec<LoweredOp>,
    /// Deepest operand stack reached on any path.
    pub max_stack_depth: usize,
}

impl JitCode {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Backend consuming verified units.
pub trait JitCompiler {
    fn compile(&self, unit: &CompiledUnit) -> Result<JitCode, JitError>;
}

/// Opcodes the backend has no lowering for: static-typing extensions,
/// generators and coroutines, and context-manager cleanup.
fn is_unsupported(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        LOAD_CLASS
            | INVOKE_FUNCTION
            | INVOKE_METHOD
            | LOAD_FIELD
            | STORE_FIELD
            | CAST
            | PRIMITIVE_BOX
            | PRIMITIVE_UNBOX
            | TP_ALLOC
            | CHECK_ARGS
            | BUILD_CHECKED_MAP
            | BUILD_CHECKED_LIST
            | PRIMITIVE_LOAD_CONST
            | LOAD_LOCAL
            | STORE_LOCAL
            | REFINE_TYPE
            | READONLY_OPERATION
            | YIELD_VALUE
            | YIELD_FROM
            | GET_YIELD_FROM_ITER
            | GET_AITER
            | GET_ANEXT
            | GET_AWAITABLE
            | BEFORE_ASYNC_WITH
            | WITH_CLEANUP_START
            | WITH_CLEANUP_FINISH
            | POP_EXCEPT
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadedJit {
    enabled: bool,
}

impl Default for ThreadedJit {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedJit {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lower(&self, unit: &CompiledUnit, offset: usize) -> Result<LoweredOp, JitError> {
        let Some(instr) = unit.instructions.get(offset) else {
            return Err(JitError::EmptyUnit(unit.qualname.clone()));
        };
        let opcode = instr.opcode;
        let invalid = || JitError::InvalidOperand {
            unit: unit.qualname.clone(),
            offset,
            opcode,
        };
        if is_unsupported(opcode) {
            return Err(JitError::UnsupportedOpcode {
                unit: unit.qualname.clone(),
                offset,
                opcode,
            });
        }
        if opcode.is_jump() {
            let target = instr
                .target
                .and_then(|block| unit.block_offset(block))
                .filter(|target| *target < unit.len())
                .ok_or_else(|| JitError::UnresolvedTarget {
                    unit: unit.qualname.clone(),
                    offset,
                })?;
            return Ok(LoweredOp::Jump { opcode, target });
        }
        let index = usize::try_from(instr.ioparg).map_err(|_| invalid())?;
        let lowered = match opcode.operand_table() {
            Some(OperandTable::Consts) => LoweredOp::Const {
                opcode,
                value: unit.consts.get(index).cloned().ok_or_else(invalid)?,
            },
            Some(OperandTable::Names) => LoweredOp::Named {
                opcode,
                name: unit.names.get(index).cloned().ok_or_else(invalid)?,
            },
            Some(OperandTable::Varnames) => LoweredOp::Named {
                opcode,
                name: unit.varnames.get(index).cloned().ok_or_else(invalid)?,
            },
            Some(OperandTable::Closure) => LoweredOp::Named {
                opcode,
                name: unit.closure_name(index).cloned().ok_or_else(invalid)?,
            },
            None if opcode == Opcode::COMPARE_OP => {
                // The last table entry is a sentinel, not an operator.
                let operator = CMP_OP
                    .get(index)
                    .filter(|op| **op != "BAD")
                    .ok_or_else(invalid)?;
                LoweredOp::Compare(*operator)
            }
            None if opcode.stack_effect(0, false) != opcode.stack_effect(1, false) => {
                LoweredOp::Counted {
                    opcode,
                    count: instr.ioparg,
                }
            }
            None => LoweredOp::Stack(opcode),
        };
        Ok(lowered)
    }
}

/// Maximum operand stack depth over all reachable paths. The first depth
/// seen at an offset wins.
fn max_stack_depth(unit: &CompiledUnit) -> usize {
    let mut visited = vec![false; unit.len()];
    let mut worklist: Vec<(usize, i64)> = vec![(0, 0)];
    let mut max_depth: i64 = 0;
    while let Some((offset, depth)) = worklist.pop() {
        let (Some(instr), Some(seen)) = (unit.instructions.get(offset), visited.get_mut(offset))
        else {
            continue;
        };
        if *seen {
            continue;
        }
        *seen = true;
        max_depth = max_depth.max(depth);
        let opcode = instr.opcode;
        if let Some(target) = instr.target.and_then(|t| unit.block_offset(t)) {
            let effect = opcode.stack_effect(instr.ioparg, true).unwrap_or(0);
            worklist.push((target, depth.saturating_add(effect)));
        }
        if !opcode.is_terminator() {
            let effect = opcode.stack_effect(instr.ioparg, false).unwrap_or(0);
            let next = depth.saturating_add(effect);
            max_depth = max_depth.max(next);
            worklist.push((offset.saturating_add(1), next));
        }
    }
    usize::try_from(max_depth).unwrap_or(0)
}

impl JitCompiler for ThreadedJit {
    fn compile(&self, unit: &CompiledUnit) -> Result<JitCode, JitError> {
        if !self.enabled {
            return Err(JitError::Disabled);
        }
        if unit.is_empty() {
            return Err(JitError::EmptyUnit(unit.qualname.clone()));
        }
        let ops = (0..unit.len())
            .map(|offset| self.lower(unit, offset))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(JitCode {
            qualname: unit.qualname.clone(),
            ops,
            max_stack_depth: max_stack_depth(unit),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;
    use crate::frontend::compile;
    use crate::interceptor::DirectEmitter;
    use crate::unit::{Instruction, UnitKind};

    fn function(source: &str) -> CompiledUnit {
        let module = compile(source, &mut DirectEmitter).unwrap();
        module.code_constants().next().unwrap().as_ref().clone()
    }

    #[test]
    fn test_lowers_function() {
        let unit = function("def f(a):\n    b = a < 3\n    return b\n");
        let code = ThreadedJit::new().compile(&unit).unwrap();
        assert_eq!(code.len(), unit.len());
        assert_eq!(
            code.ops[0],
            LoweredOp::Named {
                opcode: Opcode::LOAD_FAST,
                name: "a".into()
            }
        );
        assert!(code.ops.contains(&LoweredOp::Compare("<")));
        assert_eq!(code.max_stack_depth, 2);
    }

    #[test]
    fn test_disabled() {
        let mut jit = ThreadedJit::new();
        jit.set_enabled(false);
        assert!(!jit.is_enabled());
        let unit = function("def f():\n    pass\n");
        assert_eq!(jit.compile(&unit).unwrap_err(), JitError::Disabled);
    }

    #[test]
    fn test_rejects_unsupported_opcode() {
        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        unit.push(Instruction::new(Opcode::YIELD_VALUE, Operand::Int(0), 0));
        let err = ThreadedJit::new().compile(&unit).unwrap_err();
        assert!(matches!(
            err,
            JitError::UnsupportedOpcode {
                opcode: Opcode::YIELD_VALUE,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_unresolvable_operands() {
        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        unit.push(Instruction::new(Opcode::LOAD_GLOBAL, Operand::from("g"), 0));
        let err = ThreadedJit::new().compile(&unit).unwrap_err();
        assert!(matches!(err, JitError::InvalidOperand { offset: 0, .. }));

        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        unit.push(Instruction::new(Opcode::COMPARE_OP, Operand::Int(11), 11));
        let err = ThreadedJit::new().compile(&unit).unwrap_err();
        assert!(matches!(err, JitError::InvalidOperand { .. }));
    }

    #[test]
    fn test_rejects_unplaced_jump_target() {
        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        let block = unit.new_block();
        unit.push(Instruction::jump(Opcode::JUMP_FORWARD, block));
        let err = ThreadedJit::new().compile(&unit).unwrap_err();
        assert_eq!(
            err,
            JitError::UnresolvedTarget {
                unit: "f".into(),
                offset: 0
            }
        );
    }

    #[test]
    fn test_rejects_empty_unit() {
        let unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        assert_eq!(
            ThreadedJit::new().compile(&unit).unwrap_err(),
            JitError::EmptyUnit("f".into())
        );
    }
}
