//! Mutation-based fuzzer for a stack-machine compiler backend.
//!
//! Source text is compiled by [`frontend`], with every instruction routed
//! through a [`FuzzingEmitter`] that substitutes opcodes and randomizes
//! operands. The [`Fuzzer`] then hands the mutated unit to a [`Verifier`]
//! and a [`JitCompiler`] and classifies what happened.

pub mod config;
pub mod driver;
pub mod errors;
pub mod frontend;
pub mod interceptor;
pub mod jit;
pub mod opcodes;
pub mod operand;
pub mod randomizer;
pub mod substitution;
pub mod tables;
pub mod unit;
pub mod verifier;

pub use config::FuzzerConfig;
pub use driver::{CampaignReport, Finding, FuzzOutcome, FuzzResult, Fuzzer, wrap_source};
pub use errors::{CompileError, FuzzerError, JitError, SyntaxError, VerificationError};
pub use interceptor::{Arg, DirectEmitter, EmitHook, FuzzingEmitter, MutationStats};
pub use jit::{JitCode, JitCompiler, ThreadedJit};
pub use opcodes::{Opcode, OperandTable, StackEffectClass};
pub use operand::Operand;
pub use unit::{CompiledUnit, Instruction};
pub use verifier::{StructuralVerifier, Verifier};
