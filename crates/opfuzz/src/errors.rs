use crate::opcodes::{Opcode, OperandTable};

/// Invariant violations in the fuzzer's own bookkeeping.
///
/// These are never reported as findings: an error of this type means the
/// harness itself produced an inconsistent unit, so the run must stop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FuzzerError {
    #[error("{opcode}: operand {operand} cannot live in the {table} table")]
    OperandTypeMismatch {
        opcode: Opcode,
        table: OperandTable,
        operand: String,
    },
    #[error("{opcode}: operand {operand} is not an encodable integer")]
    UnencodableOperand { opcode: Opcode, operand: String },
    #[error("{table} table has no entry for {key}")]
    MissingEntry { table: OperandTable, key: String },
    #[error("{table} table would exceed the encodable operand range")]
    TableOverflow { table: OperandTable },
    #[error("{table} table would become empty")]
    TableWouldBeEmpty { table: OperandTable },
    #[error("dropping {key} would renumber referenced entries of the {table} table")]
    WouldRenumber { table: OperandTable, key: String },
    #[error("block target {0} used outside of a jump instruction")]
    StrayBlockTarget(u32),
    #[error("Internal Error. This is most likely a bug: {0}")]
    Internal(String),
}

/// A front-end failure: the text is not a program the front end accepts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    #[error("fuzzer invariant violated: {0}")]
    Fuzzer(#[from] FuzzerError),
}

/// Rejection reasons reported by the structural verifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("{unit}@{offset}: {opcode} operand {index} out of range for {table} table of length {len}")]
    IndexOutOfRange {
        unit: String,
        offset: usize,
        opcode: Opcode,
        table: OperandTable,
        index: u32,
        len: usize,
    },
    #[error("{unit}@{offset}: comparison operator {index} outside of domain {domain}")]
    BadComparison {
        unit: String,
        offset: usize,
        index: u32,
        domain: u32,
    },
    #[error("{unit}@{offset}: {opcode} has no resolvable jump target")]
    MissingTarget {
        unit: String,
        offset: usize,
        opcode: Opcode,
    },
    #[error("{unit}@{offset}: {opcode} is not a jump but carries a target")]
    UnexpectedTarget {
        unit: String,
        offset: usize,
        opcode: Opcode,
    },
    #[error("{unit}@{offset}: {opcode} needs {needed} stack entries, found {depth}")]
    StackUnderflow {
        unit: String,
        offset: usize,
        opcode: Opcode,
        needed: i64,
        depth: i64,
    },
    #[error("{unit}@{offset}: inconsistent stack depth at merge point ({left} vs {right})")]
    DepthMismatch {
        unit: String,
        offset: usize,
        left: i64,
        right: i64,
    },
    #[error("{unit}: execution falls off the end of the instruction stream")]
    FallsOffEnd { unit: String },
    #[error("{unit}: {argcount} parameters but only {slots} local slots")]
    MissingParameterSlots {
        unit: String,
        argcount: usize,
        slots: usize,
    },
    #[error("{0}")]
    Custom(String),
}

/// Internal errors reported by the JIT backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JitError {
    #[error("{unit}: unsupported opcode {opcode} at offset {offset}")]
    UnsupportedOpcode {
        unit: String,
        offset: usize,
        opcode: Opcode,
    },
    #[error("{unit}: operand of {opcode} at offset {offset} does not resolve")]
    InvalidOperand {
        unit: String,
        offset: usize,
        opcode: Opcode,
    },
    #[error("{unit}: jump at offset {offset} has no target")]
    UnresolvedTarget { unit: String, offset: usize },
    #[error("{0}: nothing to compile")]
    EmptyUnit(String),
    #[error("JIT compilation disabled")]
    Disabled,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error deserializing config from env: {err}. From config: {from:?}")]
    ConfigDeserializationError { err: envy::Error, from: String },
    #[error("Invalid range for {field}: {min} > {max}")]
    InvalidRange {
        field: &'static str,
        min: String,
        max: String,
    },
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}
