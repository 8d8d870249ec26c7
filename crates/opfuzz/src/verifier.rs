//! Structural checks run on every compiled unit before it reaches the JIT.
//!
//! The verifier walks each unit once for operand ranges, then simulates the
//! operand stack over the control-flow graph. Nested units stored as code
//! constants are checked too.

use crate::errors::VerificationError;
use crate::opcodes::{CMP_OP, Opcode};
use crate::unit::{CompiledUnit, UnitKind};

/// Decides whether a unit is well-formed enough to hand to the JIT.
pub trait Verifier {
    fn validate(&self, unit: &CompiledUnit) -> Result<(), VerificationError>;
}

impl<F> Verifier for F
where
    F: Fn(&CompiledUnit) -> Result<(), VerificationError>,
{
    fn validate(&self, unit: &CompiledUnit) -> Result<(), VerificationError> {
        self(unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuralVerifier {
    pub cmp_op_domain: u32,
}

impl Default for StructuralVerifier {
    fn default() -> Self {
        Self {
            cmp_op_domain: u32::try_from(CMP_OP.len()).unwrap_or(u32::MAX),
        }
    }
}

impl StructuralVerifier {
    pub fn new(cmp_op_domain: u32) -> Self {
        Self { cmp_op_domain }
    }

    fn check_operands(&self, unit: &CompiledUnit) -> Result<(), VerificationError> {
        if unit.kind == UnitKind::Function && unit.varnames.len() < unit.argcount {
            return Err(VerificationError::MissingParameterSlots {
                unit: unit.qualname.clone(),
                argcount: unit.argcount,
                slots: unit.varnames.len(),
            });
        }
        for (offset, instr) in unit.instructions.iter().enumerate() {
            let opcode = instr.opcode;
            match (instr.target, opcode.is_jump()) {
                (Some(_), false) => {
                    return Err(VerificationError::UnexpectedTarget {
                        unit: unit.qualname.clone(),
                        offset,
                        opcode,
                    });
                }
                (target, true) => {
                    if target.and_then(|t| unit.block_offset(t)).is_none() {
                        return Err(VerificationError::MissingTarget {
                            unit: unit.qualname.clone(),
                            offset,
                            opcode,
                        });
                    }
                    continue;
                }
                (None, false) => {}
            }
            if let Some(table) = opcode.operand_table() {
                let len = unit.table_len(table);
                if usize::try_from(instr.ioparg).map_or(true, |index| index >= len) {
                    return Err(VerificationError::IndexOutOfRange {
                        unit: unit.qualname.clone(),
                        offset,
                        opcode,
                        table,
                        index: instr.ioparg,
                        len,
                    });
                }
            }
            if opcode == Opcode::COMPARE_OP && instr.ioparg >= self.cmp_op_domain {
                return Err(VerificationError::BadComparison {
                    unit: unit.qualname.clone(),
                    offset,
                    index: instr.ioparg,
                    domain: self.cmp_op_domain,
                });
            }
        }
        Ok(())
    }

    /// Propagates stack depths along every reachable edge. Each offset must
    /// be reached with a single depth, and no path may leave the stream.
    fn check_stack(&self, unit: &CompiledUnit) -> Result<(), VerificationError> {
        let name = || unit.qualname.clone();
        let mut depths: Vec<Option<i64>> = vec![None; unit.len()];
        let mut worklist: Vec<(usize, i64)> = vec![(0, 0)];

        while let Some((offset, depth)) = worklist.pop() {
            let (Some(instr), Some(seen)) = (unit.instructions.get(offset), depths.get_mut(offset))
            else {
                return Err(VerificationError::FallsOffEnd { unit: name() });
            };
            match *seen {
                Some(previous) if previous != depth => {
                    return Err(VerificationError::DepthMismatch {
                        unit: name(),
                        offset,
                        left: previous,
                        right: depth,
                    });
                }
                Some(_) => continue,
                None => *seen = Some(depth),
            }

            let opcode = instr.opcode;
            let unknown = || {
                VerificationError::Custom(format!(
                    "{}@{offset}: stack effect of {opcode} with operand {} is unknown",
                    unit.qualname, instr.ioparg
                ))
            };
            let needed = opcode.stack_inputs(instr.ioparg).ok_or_else(unknown)?;
            if depth < needed {
                return Err(VerificationError::StackUnderflow {
                    unit: name(),
                    offset,
                    opcode,
                    needed,
                    depth,
                });
            }

            if let Some(target) = instr.target.and_then(|t| unit.block_offset(t)) {
                let effect = opcode.stack_effect(instr.ioparg, true).ok_or_else(unknown)?;
                worklist.push((target, depth.saturating_add(effect)));
            }
            if !opcode.is_terminator() {
                let effect = opcode.stack_effect(instr.ioparg, false).ok_or_else(unknown)?;
                worklist.push((offset.saturating_add(1), depth.saturating_add(effect)));
            }
        }
        Ok(())
    }
}

impl Verifier for StructuralVerifier {
    fn validate(&self, unit: &CompiledUnit) -> Result<(), VerificationError> {
        let mut pending = vec![unit];
        while let Some(unit) = pending.pop() {
            self.check_operands(unit)?;
            self.check_stack(unit)?;
            pending.extend(unit.code_constants().map(|nested| &**nested));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::frontend::compile;
    use crate::interceptor::DirectEmitter;
    use crate::operand::Operand;
    use crate::unit::Instruction;

    fn unit_with(instructions: Vec<Instruction>) -> CompiledUnit {
        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        unit.instructions = instructions;
        unit
    }

    #[test]
    fn test_accepts_front_end_output() {
        let source = "def f(a, b=1):\n    x = [a, b]\n    for i in x:\n        if i == 2 or i:\n            break\n    return {'k': a, 'j': b}\nwhile f(1):\n    del y\n";
        let unit = compile(source, &mut DirectEmitter).unwrap();
        StructuralVerifier::default().validate(&unit).unwrap();
    }

    #[test]
    fn test_rejects_out_of_range_operand() {
        let mut unit = unit_with(vec![
            Instruction::new(Opcode::LOAD_FAST, Operand::from("a"), 3),
            Instruction::new(Opcode::RETURN_VALUE, Operand::Int(0), 0),
        ]);
        unit.varnames.get_index("a".into());
        let err = StructuralVerifier::default().validate(&unit).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::IndexOutOfRange { index: 3, len: 1, .. }
        ));
    }

    #[test]
    fn test_rejects_bad_comparison() {
        let unit = unit_with(vec![
            Instruction::new(Opcode::COMPARE_OP, Operand::Int(12), 12),
        ]);
        let err = StructuralVerifier::default().validate(&unit).unwrap_err();
        assert!(matches!(err, VerificationError::BadComparison { index: 12, .. }));
    }

    #[test]
    fn test_rejects_underflow() {
        let unit = unit_with(vec![
            Instruction::new(Opcode::POP_TOP, Operand::Int(0), 0),
            Instruction::new(Opcode::RETURN_VALUE, Operand::Int(0), 0),
        ]);
        let err = StructuralVerifier::default().validate(&unit).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::StackUnderflow {
                offset: 0,
                needed: 1,
                depth: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_falling_off_the_end() {
        let mut unit = unit_with(vec![]);
        unit.consts.get_index(Operand::None);
        unit.push(Instruction::new(Opcode::LOAD_CONST, Operand::None, 0));
        let err = StructuralVerifier::default().validate(&unit).unwrap_err();
        assert_eq!(err, VerificationError::FallsOffEnd { unit: "f".into() });
    }

    #[test]
    fn test_rejects_depth_mismatch_at_merge() {
        let mut unit = unit_with(vec![]);
        unit.consts.get_index(Operand::None);
        let merge = unit.new_block();
        unit.push(Instruction::new(Opcode::LOAD_CONST, Operand::None, 0));
        unit.push(Instruction::jump(Opcode::JUMP_IF_TRUE_OR_POP, merge));
        unit.push(Instruction::new(Opcode::LOAD_CONST, Operand::None, 0));
        unit.push(Instruction::new(Opcode::LOAD_CONST, Operand::None, 0));
        unit.place_block(merge);
        unit.push(Instruction::new(Opcode::RETURN_VALUE, Operand::Int(0), 0));
        let err = StructuralVerifier::default().validate(&unit).unwrap_err();
        assert!(matches!(err, VerificationError::DepthMismatch { .. }));
    }

    #[test]
    fn test_checks_nested_units() {
        let inner = unit_with(vec![Instruction::new(Opcode::POP_TOP, Operand::Int(0), 0)]);
        let mut outer = CompiledUnit::new(1, "m", "m", UnitKind::Module);
        outer.consts.get_index(Operand::Code(Arc::new(inner)));
        outer.push(Instruction::new(Opcode::LOAD_CONST, Operand::None, 0));
        outer.push(Instruction::new(Opcode::RETURN_VALUE, Operand::Int(0), 0));
        let err = StructuralVerifier::default().validate(&outer).unwrap_err();
        assert!(matches!(err, VerificationError::StackUnderflow { .. }));
    }

    #[test]
    fn test_closures_are_verifiers() {
        let reject = |_: &CompiledUnit| -> Result<(), VerificationError> {
            Err(VerificationError::Custom("no".into()))
        };
        let unit = unit_with(vec![]);
        assert_eq!(
            reject.validate(&unit),
            Err(VerificationError::Custom("no".into()))
        );
    }
}
