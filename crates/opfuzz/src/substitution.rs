//! Opcode substitution within a stack-effect class.
//!
//! A substitution removes the original instruction's table entry (if any)
//! and installs a fresh operand for the replacement opcode.
//! [`is_feasible`] guards the table invariants the removal could break.

use rand::Rng;

use crate::errors::FuzzerError;
use crate::opcodes::{Opcode, OperandTable, StackEffectClass, substitution_pool};
use crate::operand::Operand;
use crate::randomizer::Randomizer;
use crate::unit::CompiledUnit;

/// Whether `opcode` can ever be substituted.
pub fn is_eligible(opcode: Opcode) -> bool {
    matches!(opcode.stack_effect_class(), StackEffectClass::Fixed(_))
        && opcode_pool(opcode).len() > 1
}

fn opcode_pool(opcode: Opcode) -> &'static [Opcode] {
    match opcode.stack_effect_class() {
        StackEffectClass::Fixed(delta) => substitution_pool(delta),
        _ => &[],
    }
}

/// Draws a replacement uniformly from `opcode`'s class, `opcode` excluded.
pub fn pick_replacement<R: Rng + ?Sized>(rng: &mut R, opcode: Opcode) -> Option<Opcode> {
    let pool = opcode_pool(opcode);
    let own = pool.iter().position(|candidate| *candidate == opcode)?;
    let others = pool.len().checked_sub(1).filter(|n| *n > 0)?;
    let mut pick = rng.gen_range(0..others);
    if pick >= own {
        pick += 1;
    }
    pool.get(pick).copied()
}

/// Encoded operand range for opcodes that do not read a table.
pub fn operand_domain(opcode: Opcode, randomizer: &Randomizer, cmp_op_domain: u32) -> (u32, u32) {
    if opcode == Opcode::COMPARE_OP {
        (0, cmp_op_domain.saturating_sub(1))
    } else {
        (randomizer.min_oparg, randomizer.max_oparg)
    }
}

/// Guard protecting table invariants.
///
/// Removing `original`'s entry must leave its table non-empty. It must not
/// renumber an entry an emitted instruction already refers to, nor drop a
/// parameter slot. Reusing the entry in place requires that nothing refers
/// to it yet. The replacement's table must have room for one
/// more encodable index.
pub fn is_feasible(
    unit: &CompiledUnit,
    original: Opcode,
    operand: &Operand,
    replacement: Opcode,
    max_oparg: u32,
) -> bool {
    let same_table =
        original.operand_table().is_some() && original.operand_table() == replacement.operand_table();
    removal_is_safe(unit, original, operand, same_table) && can_grow(unit, replacement, max_oparg)
}

fn removal_is_safe(unit: &CompiledUnit, opcode: Opcode, operand: &Operand, in_place: bool) -> bool {
    let Some(table) = opcode.operand_table() else {
        return true;
    };
    let becomes_empty = match table {
        OperandTable::Consts => unit.consts.would_become_empty(operand),
        _ => {
            let Some(name) = operand.as_str() else {
                return false;
            };
            let key = name.to_string();
            match table {
                OperandTable::Names => unit.names.would_become_empty(&key),
                OperandTable::Varnames => unit.varnames.would_become_empty(&key),
                _ if unit.freevars.contains(&key) => unit.freevars.would_become_empty(&key),
                _ => unit.cellvars.would_become_empty(&key),
            }
        }
    };
    let Some(index) = unit.table_index(table, operand) else {
        return false;
    };
    if becomes_empty {
        return false;
    }
    if in_place {
        return !unit.references(table, index);
    }
    if table == OperandTable::Varnames && index < unit.argcount {
        return false;
    }
    !unit.references_at_or_above(table, index)
}

fn can_grow(unit: &CompiledUnit, opcode: Opcode, max_oparg: u32) -> bool {
    match opcode.operand_table() {
        Some(table) => u32::try_from(unit.table_len(table)).is_ok_and(|len| len < max_oparg),
        None => true,
    }
}

/// Random encoded operand for a `replacement` that reads no table.
pub fn untabled_operand<R: Rng + ?Sized>(
    rng: &mut R,
    randomizer: &Randomizer,
    cmp_op_domain: u32,
    replacement: Opcode,
) -> Operand {
    let (lower, upper) = operand_domain(replacement, randomizer, cmp_op_domain);
    Operand::Int(i64::from(rng.gen_range(lower..=upper)))
}

/// Drops `original`'s table entry and makes `new_operand` resident in
/// `replacement`'s table.
///
/// When both opcodes read the same table the vacated index is reused.
/// `new_operand` must not already be in the target table.
pub fn install_operand(
    unit: &mut CompiledUnit,
    original: Opcode,
    replacement: Opcode,
    operand: &Operand,
    new_operand: &Operand,
) -> Result<(), FuzzerError> {
    let source = original.operand_table();
    let target = replacement.operand_table();

    if let Some(table) = source.filter(|table| Some(*table) == target) {
        replace_entry(unit, table, operand, new_operand.clone())?;
        return Ok(());
    }

    if let Some(table) = source {
        remove_entry(unit, table, operand)?;
    }
    if target.is_some() {
        unit.encode_operand(replacement, new_operand)?;
    }
    Ok(())
}

/// Replaces `old` with `new` in `table`, keeping the slot. Returns the
/// encoded index of `new`.
pub fn replace_entry(
    unit: &mut CompiledUnit,
    table: OperandTable,
    old: &Operand,
    new: Operand,
) -> Result<usize, FuzzerError> {
    // Replacing with a resident key drops `old`, which compacts the table.
    if old.key() != new.key() && unit.table_contains(table, &new) {
        if let Some(index) = unit.table_index(table, old) {
            if unit.references_at_or_above(table, index) {
                return Err(FuzzerError::WouldRenumber {
                    table,
                    key: old.to_string(),
                });
            }
        }
    }
    if table == OperandTable::Consts {
        return Ok(unit.consts.replace(old, new));
    }
    let (Some(old_name), Some(new_name)) = (old.as_str(), new.as_str()) else {
        return Err(FuzzerError::OperandTypeMismatch {
            opcode: Opcode::NOP,
            table,
            operand: new.to_string(),
        });
    };
    let (old_name, new_name) = (old_name.to_string(), new_name.to_string());
    let index = match table {
        OperandTable::Names => unit.names.replace_key(&old_name, new_name),
        OperandTable::Varnames => unit.varnames.replace_key(&old_name, new_name),
        _ => {
            if unit.freevars.contains(&old_name) || !unit.cellvars.contains(&old_name) {
                unit.cellvars.len() + unit.freevars.replace_key(&old_name, new_name)
            } else {
                unit.cellvars.replace_key(&old_name, new_name)
            }
        }
    };
    Ok(index)
}

fn remove_entry(
    unit: &mut CompiledUnit,
    table: OperandTable,
    operand: &Operand,
) -> Result<(), FuzzerError> {
    let removed = match table {
        OperandTable::Consts => unit.consts.remove(operand),
        _ => {
            let key = operand
                .as_str()
                .ok_or_else(|| FuzzerError::MissingEntry {
                    table,
                    key: operand.to_string(),
                })?
                .to_string();
            match table {
                OperandTable::Names => unit.names.remove(&key),
                OperandTable::Varnames => unit.varnames.remove(&key),
                _ => match unit.freevars.remove(&key) {
                    Some(index) => Some(index),
                    None => unit.cellvars.remove(&key),
                },
            }
        }
    };
    if removed.is_none() {
        return Err(FuzzerError::MissingEntry {
            table,
            key: operand.to_string(),
        });
    }
    if unit.table_len(table) == 0 {
        return Err(FuzzerError::TableWouldBeEmpty { table });
    }
    Ok(())
}
