//! Instructions and compiled units.

use std::fmt;
use std::sync::Arc;

use crate::errors::FuzzerError;
use crate::opcodes::{Opcode, OperandTable};
use crate::operand::Operand;
use crate::tables::{ConstPool, IndexedTable};

/// Reference to a position in a unit's instruction stream, resolved when
/// the block is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// A single emitted instruction. Never modified after emission.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Operand,
    /// Encoded operand as it appears in the final stream.
    pub ioparg: u32,
    pub target: Option<BlockId>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operand: Operand, ioparg: u32) -> Self {
        Self {
            opcode,
            operand,
            ioparg,
            target: None,
        }
    }

    pub fn jump(opcode: Opcode, target: BlockId) -> Self {
        Self {
            opcode,
            operand: Operand::Int(0),
            ioparg: 0,
            target: Some(target),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Module,
    Function,
}

/// The instruction stream and operand tables of one callable scope.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    /// Unique within one front-end run; identifies the unit as a constant.
    pub id: u64,
    pub name: String,
    pub qualname: String,
    pub kind: UnitKind,
    pub argcount: usize,
    pub first_lineno: usize,
    pub instructions: Vec<Instruction>,
    pub names: IndexedTable<String>,
    pub varnames: IndexedTable<String>,
    pub freevars: IndexedTable<String>,
    pub cellvars: IndexedTable<String>,
    pub consts: ConstPool,
    blocks: Vec<Option<usize>>,
}

impl CompiledUnit {
    pub fn new(id: u64, name: impl Into<String>, qualname: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            id,
            name: name.into(),
            qualname: qualname.into(),
            kind,
            argcount: 0,
            first_lineno: 1,
            instructions: Vec::new(),
            names: IndexedTable::new(),
            varnames: IndexedTable::new(),
            freevars: IndexedTable::new(),
            cellvars: IndexedTable::new(),
            consts: ConstPool::new(),
            blocks: Vec::new(),
        }
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = u32::try_from(self.blocks.len()).unwrap_or(u32::MAX);
        self.blocks.push(None);
        BlockId(id)
    }

    /// Places `block` at the current end of the instruction stream.
    pub fn place_block(&mut self, block: BlockId) {
        let offset = self.instructions.len();
        let slot = usize::try_from(block.0)
            .ok()
            .and_then(|index| self.blocks.get_mut(index));
        if let Some(slot) = slot {
            *slot = Some(offset);
        }
    }

    pub fn block_offset(&self, block: BlockId) -> Option<usize> {
        usize::try_from(block.0)
            .ok()
            .and_then(|index| self.blocks.get(index))
            .copied()
            .flatten()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Number of captured-variable slots: cells first, then free variables.
    pub fn closure_len(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    /// Encoded captured-slot index of `name`, searching free variables first.
    pub fn closure_index(&self, name: &str) -> Option<usize> {
        let key = name.to_string();
        if let Some(free) = self.freevars.index_of(&key) {
            return Some(self.cellvars.len() + free);
        }
        self.cellvars.index_of(&key)
    }

    /// Name behind an encoded captured-slot index.
    pub fn closure_name(&self, index: usize) -> Option<&String> {
        match index.checked_sub(self.cellvars.len()) {
            Some(free) => self.freevars.get(free),
            None => self.cellvars.get(index),
        }
    }

    pub fn table_len(&self, table: OperandTable) -> usize {
        match table {
            OperandTable::Names => self.names.len(),
            OperandTable::Varnames => self.varnames.len(),
            OperandTable::Closure => self.closure_len(),
            OperandTable::Consts => self.consts.len(),
        }
    }

    /// Encoded index of `value` in `table`, without inserting it.
    pub fn table_index(&self, table: OperandTable, value: &Operand) -> Option<usize> {
        if table == OperandTable::Consts {
            return self.consts.index_of(value);
        }
        let name = value.as_str()?;
        match table {
            OperandTable::Names => self.names.index_of(&name.to_string()),
            OperandTable::Varnames => self.varnames.index_of(&name.to_string()),
            _ => self.closure_index(name),
        }
    }

    pub fn table_contains(&self, table: OperandTable, value: &Operand) -> bool {
        self.table_index(table, value).is_some()
    }

    /// Whether an emitted instruction refers to `table` at exactly `index`.
    pub fn references(&self, table: OperandTable, index: usize) -> bool {
        self.instructions.iter().any(|instr| {
            instr.target.is_none()
                && instr.opcode.operand_table() == Some(table)
                && usize::try_from(instr.ioparg).is_ok_and(|encoded| encoded == index)
        })
    }

    /// Whether an emitted instruction refers to `table` at `index` or above.
    pub fn references_at_or_above(&self, table: OperandTable, index: usize) -> bool {
        self.instructions.iter().any(|instr| {
            instr.target.is_none()
                && instr.opcode.operand_table() == Some(table)
                && usize::try_from(instr.ioparg).is_ok_and(|encoded| encoded >= index)
        })
    }

    /// Nested units stored in the constant pool.
    pub fn code_constants(&self) -> impl Iterator<Item = &Arc<CompiledUnit>> {
        self.consts.values().filter_map(|value| match value {
            Operand::Code(unit) => Some(unit),
            _ => None,
        })
    }

    /// Resolves `operand` against `opcode`'s table, inserting it when absent,
    /// and returns the encoded operand.
    pub fn encode_operand(&mut self, opcode: Opcode, operand: &Operand) -> Result<u32, FuzzerError> {
        let Some(table) = opcode.operand_table() else {
            return match operand {
                Operand::Int(value) => u32::try_from(*value).ok(),
                _ => None,
            }
            .ok_or_else(|| FuzzerError::UnencodableOperand {
                opcode,
                operand: operand.to_string(),
            });
        };
        let index = if table == OperandTable::Consts {
            self.consts.get_index(operand.clone())
        } else {
            let name = operand
                .as_str()
                .ok_or_else(|| FuzzerError::OperandTypeMismatch {
                    opcode,
                    table,
                    operand: operand.to_string(),
                })?
                .to_string();
            match table {
                OperandTable::Names => self.names.get_index(name),
                OperandTable::Varnames => self.varnames.get_index(name),
                _ => match self.closure_index(&name) {
                    Some(index) => index,
                    None => self.cellvars.len() + self.freevars.get_index(name),
                },
            }
        };
        u32::try_from(index).map_err(|_| FuzzerError::TableOverflow { table })
    }

    fn write_level(&self, f: &mut fmt::Formatter<'_>, level: usize) -> fmt::Result {
        writeln!(f, "Code object {} at level {level}", self.qualname)?;
        for (offset, instr) in self.instructions.iter().enumerate() {
            match instr.target {
                Some(target) => writeln!(
                    f,
                    "  {offset:>4} {:<28} -> {}",
                    instr.opcode.name(),
                    self.block_offset(target)
                        .map_or_else(|| target.to_string(), |o| o.to_string())
                )?,
                None => writeln!(
                    f,
                    "  {offset:>4} {:<28} {:>10} ({})",
                    instr.opcode.name(),
                    instr.ioparg,
                    instr.operand
                )?,
            }
        }
        let consts: Vec<String> = self.consts.values().map(ToString::to_string).collect();
        writeln!(f, "Consts: ({})", consts.join(", "))?;
        writeln!(f, "Names: {:?}", self.names.keys().collect::<Vec<_>>())?;
        writeln!(f, "Varnames: {:?}", self.varnames.keys().collect::<Vec<_>>())?;
        writeln!(f, "Cellvars: {:?}", self.cellvars.keys().collect::<Vec<_>>())?;
        writeln!(f, "Freevars: {:?}", self.freevars.keys().collect::<Vec<_>>())?;
        Ok(())
    }
}

impl fmt::Display for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack: Vec<(&CompiledUnit, usize)> = vec![(self, 0)];
        while let Some((unit, level)) = stack.pop() {
            unit.write_level(f, level)?;
            writeln!(f)?;
            for nested in unit.code_constants() {
                stack.push((nested, level + 1));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_resolve_after_placement() {
        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        let block = unit.new_block();
        assert_eq!(unit.block_offset(block), None);
        unit.push(Instruction::new(Opcode::NOP, Operand::Int(0), 0));
        unit.place_block(block);
        assert_eq!(unit.block_offset(block), Some(1));
    }

    #[test]
    fn test_closure_encoding_places_cells_first() {
        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        unit.cellvars.get_index("c0".into());
        unit.cellvars.get_index("c1".into());
        unit.freevars.get_index("f0".into());
        assert_eq!(unit.closure_index("c1"), Some(1));
        assert_eq!(unit.closure_index("f0"), Some(2));
        assert_eq!(unit.closure_name(2).map(String::as_str), Some("f0"));
        assert_eq!(unit.closure_index("missing"), None);
        assert_eq!(unit.closure_len(), 3);
    }

    #[test]
    fn test_references_at_or_above() {
        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        unit.push(Instruction::new(Opcode::LOAD_FAST, Operand::from("a"), 2));
        assert!(unit.references_at_or_above(OperandTable::Varnames, 1));
        assert!(!unit.references_at_or_above(OperandTable::Varnames, 3));
        assert!(!unit.references_at_or_above(OperandTable::Names, 0));
        assert!(unit.references(OperandTable::Varnames, 2));
        assert!(!unit.references(OperandTable::Varnames, 1));
    }

    #[test]
    fn test_table_index_does_not_insert() {
        let mut unit = CompiledUnit::new(0, "f", "f", UnitKind::Function);
        unit.cellvars.get_index("c".into());
        unit.freevars.get_index("v".into());
        unit.consts.get_index(Operand::Int(4));
        assert_eq!(unit.table_index(OperandTable::Closure, &Operand::from("v")), Some(1));
        assert_eq!(unit.table_index(OperandTable::Consts, &Operand::Int(4)), Some(0));
        assert!(!unit.table_contains(OperandTable::Names, &Operand::from("c")));
        assert!(!unit.table_contains(OperandTable::Varnames, &Operand::Int(4)));
        assert_eq!(unit.table_len(OperandTable::Names), 0);
    }

    #[test]
    fn test_display_walks_nested_units() {
        let inner = CompiledUnit::new(1, "inner", "outer.inner", UnitKind::Function);
        let mut outer = CompiledUnit::new(0, "outer", "outer", UnitKind::Module);
        outer.consts.get_index(Operand::Code(Arc::new(inner)));
        let dump = outer.to_string();
        assert!(dump.contains("Code object outer at level 0"));
        assert!(dump.contains("Code object outer.inner at level 1"));
    }
}
