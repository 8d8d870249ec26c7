//! The pre-emission hook through which every instruction reaches a unit.
//!
//! The front end never pushes instructions itself: it hands each opcode and
//! its logical argument to an [`EmitHook`]. [`DirectEmitter`] encodes and
//! appends unchanged. [`FuzzingEmitter`] mutates on the way through.

use std::collections::{BTreeSet, HashMap};

use rand::Rng;
use serde::Serialize;
use tracing::trace;

use crate::errors::FuzzerError;
use crate::opcodes::{Opcode, OperandTable, StackEffectClass};
use crate::operand::{ConstKey, Operand};
use crate::randomizer::{MAX_RESAMPLE_ATTEMPTS, Randomizer};
use crate::substitution::{self, is_eligible, is_feasible, pick_replacement};
use crate::unit::{BlockId, CompiledUnit, Instruction};

/// Logical argument of an instruction as produced by the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Operand),
    Block(BlockId),
}

impl From<Operand> for Arg {
    fn from(operand: Operand) -> Self {
        Arg::Value(operand)
    }
}

impl From<BlockId> for Arg {
    fn from(block: BlockId) -> Self {
        Arg::Block(block)
    }
}

pub trait EmitHook {
    /// Called when the front end starts emitting a new scope. `symbols`
    /// holds every identifier the scope's source mentions.
    fn begin_unit(&mut self, _unit: &CompiledUnit, _symbols: &BTreeSet<String>) {}

    /// Encodes `arg` for `opcode` and appends the resulting instruction.
    fn emit(&mut self, unit: &mut CompiledUnit, opcode: Opcode, arg: Arg)
    -> Result<(), FuzzerError>;

    /// Called once the scope's last instruction has been emitted.
    fn end_unit(&mut self, _unit: &CompiledUnit) {}
}

/// Appends a jump. Block references are structural and never mutated.
fn emit_jump(unit: &mut CompiledUnit, opcode: Opcode, block: BlockId) -> Result<(), FuzzerError> {
    if !opcode.is_jump() {
        return Err(FuzzerError::StrayBlockTarget(block.0));
    }
    unit.push(Instruction::jump(opcode, block));
    Ok(())
}

/// Emits every instruction as given.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectEmitter;

impl EmitHook for DirectEmitter {
    fn emit(
        &mut self,
        unit: &mut CompiledUnit,
        opcode: Opcode,
        arg: Arg,
    ) -> Result<(), FuzzerError> {
        match arg {
            Arg::Block(block) => emit_jump(unit, opcode, block),
            Arg::Value(operand) => {
                let ioparg = unit.encode_operand(opcode, &operand)?;
                unit.push(Instruction::new(opcode, operand, ioparg));
                Ok(())
            }
        }
    }
}

/// Replacement chosen for each original operand value within one unit.
#[derive(Debug, Default, Clone)]
pub struct MutationRecord(HashMap<ConstKey, Operand>);

impl MutationRecord {
    pub fn get(&self, original: &Operand) -> Option<&Operand> {
        self.0.get(&original.key())
    }

    pub fn insert(&mut self, original: &Operand, replacement: Operand) {
        self.0.insert(original.key(), replacement);
    }

    /// Whether `value` is already used as an original or a replacement.
    pub fn mentions(&self, value: &Operand) -> bool {
        let key = value.key();
        self.0.contains_key(&key) || self.0.values().any(|replacement| replacement.key() == key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What happened to the instructions seen by a [`FuzzingEmitter`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MutationStats {
    pub substitutions: u64,
    pub operand_randomizations: u64,
    pub oparg_randomizations: u64,
    pub unchanged: u64,
    pub jumps: u64,
}

impl MutationStats {
    pub fn merge(&mut self, other: &MutationStats) {
        self.substitutions += other.substitutions;
        self.operand_randomizations += other.operand_randomizations;
        self.oparg_randomizations += other.oparg_randomizations;
        self.unchanged += other.unchanged;
        self.jumps += other.jumps;
    }
}

/// Mutation state of the unit currently being emitted.
#[derive(Debug, Default)]
struct UnitMutations {
    record: MutationRecord,
    /// Identifiers of the unit's source and names installed by substitution.
    /// Fresh names never take one, so an original emitted later cannot
    /// resolve to a renamed slot.
    reserved: BTreeSet<String>,
}

/// Hook that substitutes opcodes and randomizes operands before emission.
pub struct FuzzingEmitter<'a, R: Rng + ?Sized> {
    rng: &'a mut R,
    randomizer: Randomizer,
    substitution_percent: u8,
    cmp_op_domain: u32,
    /// Nested scopes push their own.
    units: Vec<UnitMutations>,
    stats: MutationStats,
}

impl<'a, R: Rng + ?Sized> FuzzingEmitter<'a, R> {
    pub fn new(
        rng: &'a mut R,
        randomizer: Randomizer,
        substitution_percent: u8,
        cmp_op_domain: u32,
    ) -> Self {
        Self {
            rng,
            randomizer,
            substitution_percent,
            cmp_op_domain,
            units: Vec::new(),
            stats: MutationStats::default(),
        }
    }

    pub fn stats(&self) -> MutationStats {
        self.stats
    }

    fn roll_substitution(&mut self) -> bool {
        self.rng.gen_range(1..=100u8) <= self.substitution_percent
    }

    fn try_substitute(
        &mut self,
        unit: &mut CompiledUnit,
        opcode: Opcode,
        operand: &Operand,
    ) -> Result<Option<Instruction>, FuzzerError> {
        if !self.roll_substitution() || !is_eligible(opcode) {
            return Ok(None);
        }
        let Some(replacement) = pick_replacement(&mut *self.rng, opcode) else {
            return Ok(None);
        };
        if !is_feasible(unit, opcode, operand, replacement, self.randomizer.max_oparg) {
            trace!(%opcode, %replacement, unit = %unit.qualname, "substitution infeasible");
            return Ok(None);
        }
        let new_operand = match replacement.operand_table() {
            Some(table) => {
                let seed = match table {
                    OperandTable::Consts => operand.clone(),
                    _ => Operand::Str(String::new()),
                };
                let Some(fresh) = self.fresh_operand(unit, table, &seed) else {
                    trace!(%opcode, %replacement, %table, "no fresh operand available");
                    return Ok(None);
                };
                if let (Some(name), Some(current)) = (fresh.as_str(), self.units.last_mut()) {
                    current.reserved.insert(name.to_string());
                }
                fresh
            }
            None => substitution::untabled_operand(
                &mut *self.rng,
                &self.randomizer,
                self.cmp_op_domain,
                replacement,
            ),
        };
        substitution::install_operand(unit, opcode, replacement, operand, &new_operand)?;
        let ioparg = unit.encode_operand(replacement, &new_operand)?;
        trace!(
            %opcode,
            %replacement,
            from = %operand,
            to = %new_operand,
            ioparg,
            "substituted opcode"
        );
        Ok(Some(Instruction::new(replacement, new_operand, ioparg)))
    }

    /// Whether introducing `value` into `table` could merge it with a slot
    /// that is, or will be, referenced under another name.
    fn is_taken(&self, unit: &CompiledUnit, table: OperandTable, value: &Operand) -> bool {
        if unit.table_contains(table, value) {
            return true;
        }
        let Some(current) = self.units.last() else {
            return false;
        };
        current.record.mentions(value)
            || value
                .as_str()
                .is_some_and(|name| current.reserved.contains(name))
    }

    /// A value shaped like `seed` that is not taken in `table`.
    fn fresh_operand(
        &mut self,
        unit: &CompiledUnit,
        table: OperandTable,
        seed: &Operand,
    ) -> Option<Operand> {
        for _ in 0..MAX_RESAMPLE_ATTEMPTS {
            let candidate = self.randomizer.operand(&mut *self.rng, seed);
            if !self.is_taken(unit, table, &candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Replacement for `original` in `table`, reusing the unit's record.
    ///
    /// When no fresh value can be found the original is kept, which leaves
    /// its slot untouched.
    fn replacement_for(
        &mut self,
        unit: &CompiledUnit,
        table: OperandTable,
        original: &Operand,
    ) -> Operand {
        if let Some(previous) = self
            .units
            .last()
            .and_then(|current| current.record.get(original))
        {
            return previous.clone();
        }
        let replacement = self
            .fresh_operand(unit, table, original)
            .unwrap_or_else(|| original.clone());
        if let Some(current) = self.units.last_mut() {
            current.record.insert(original, replacement.clone());
        }
        replacement
    }

    fn randomize_operand(
        &mut self,
        unit: &mut CompiledUnit,
        opcode: Opcode,
        operand: Operand,
        ioparg: u32,
    ) -> Result<Instruction, FuzzerError> {
        match opcode.operand_table() {
            Some(OperandTable::Consts) if opcode == Opcode::LOAD_CONST => {
                self.stats.unchanged += 1;
                Ok(Instruction::new(opcode, operand, ioparg))
            }
            Some(table) => {
                let randomized = self.replacement_for(unit, table, &operand);
                let index = substitution::replace_entry(unit, table, &operand, randomized.clone())?;
                let ioparg =
                    u32::try_from(index).map_err(|_| FuzzerError::TableOverflow { table })?;
                trace!(%opcode, %table, from = %operand, to = %randomized, ioparg, "randomized operand");
                self.stats.operand_randomizations += 1;
                Ok(Instruction::new(opcode, randomized, ioparg))
            }
            None => {
                let new_ioparg = self.randomize_ioparg(opcode, ioparg);
                if new_ioparg == ioparg {
                    self.stats.unchanged += 1;
                } else {
                    trace!(%opcode, from = ioparg, to = new_ioparg, "randomized encoded operand");
                    self.stats.oparg_randomizations += 1;
                }
                Ok(Instruction::new(opcode, operand, new_ioparg))
            }
        }
    }

    fn randomize_ioparg(&mut self, opcode: Opcode, ioparg: u32) -> u32 {
        match opcode.stack_effect_class() {
            StackEffectClass::Exempt | StackEffectClass::Variable => ioparg,
            _ if opcode == Opcode::COMPARE_OP => {
                let upper = self.cmp_op_domain.saturating_sub(1);
                self.randomizer.oparg(&mut *self.rng, ioparg, 0, upper)
            }
            _ => self.randomizer.any_oparg(&mut *self.rng, ioparg),
        }
    }
}

impl<R: Rng + ?Sized> EmitHook for FuzzingEmitter<'_, R> {
    fn begin_unit(&mut self, _unit: &CompiledUnit, symbols: &BTreeSet<String>) {
        self.units.push(UnitMutations {
            record: MutationRecord::default(),
            reserved: symbols.clone(),
        });
    }

    fn emit(
        &mut self,
        unit: &mut CompiledUnit,
        opcode: Opcode,
        arg: Arg,
    ) -> Result<(), FuzzerError> {
        let operand = match arg {
            Arg::Block(block) => {
                self.stats.jumps += 1;
                return emit_jump(unit, opcode, block);
            }
            Arg::Value(operand) => operand,
        };
        let ioparg = unit.encode_operand(opcode, &operand)?;

        let instruction = match self.try_substitute(unit, opcode, &operand)? {
            Some(instruction) => {
                self.stats.substitutions += 1;
                instruction
            }
            None => self.randomize_operand(unit, opcode, operand, ioparg)?,
        };
        unit.push(instruction);
        Ok(())
    }

    fn end_unit(&mut self, unit: &CompiledUnit) {
        if let Some(finished) = self.units.pop() {
            trace!(unit = %unit.qualname, renamed = finished.record.len(), "finished unit");
        }
    }
}
