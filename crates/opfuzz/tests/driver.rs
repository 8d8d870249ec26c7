#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use opfuzz::errors::{JitError, VerificationError};
use opfuzz::frontend::compile;
use opfuzz::jit::{JitCode, JitCompiler};
use opfuzz::{
    CompiledUnit, DirectEmitter, FuzzOutcome, Fuzzer, FuzzerConfig, Opcode, Operand, wrap_source,
};

fn config(percent: u8, seed: u64) -> FuzzerConfig {
    FuzzerConfig::default()
        .with_seed(seed)
        .with_substitution_percent(percent)
}

fn wrapper(unit: &CompiledUnit) -> &CompiledUnit {
    unit.code_constants().next().unwrap()
}

struct FailingJit;

impl JitCompiler for FailingJit {
    fn compile(&self, unit: &CompiledUnit) -> Result<JitCode, JitError> {
        Err(JitError::EmptyUnit(unit.qualname.clone()))
    }
}

#[test]
fn test_operand_only_randomization_keeps_shape() {
    let source = "x = 1\ny = x + 2";
    let reference = compile(&wrap_source(source), &mut DirectEmitter).unwrap();

    let mut fuzzer = Fuzzer::new(config(0, 42)).unwrap();
    let result = fuzzer.fuzz(source).unwrap();
    assert_eq!(result.outcome, FuzzOutcome::Success);
    assert_eq!(result.detail, None);
    assert_eq!(result.stats.substitutions, 0);

    let unit = result.unit.unwrap();
    let fuzzed = wrapper(&unit);
    let expected = wrapper(&reference);
    assert_eq!(fuzzed.len(), expected.len());
    let opcodes = |u: &CompiledUnit| u.instructions.iter().map(|i| i.opcode).collect::<Vec<_>>();
    assert_eq!(opcodes(fuzzed), opcodes(expected));
    assert!(!fuzzed.varnames.contains(&"x".to_string()));
}

#[test]
fn test_malformed_source_is_a_syntax_error() {
    let mut fuzzer = Fuzzer::new(config(50, 1)).unwrap();
    let result = fuzzer.fuzz("def f(:").unwrap();
    assert!(result.unit.is_none());
    assert_eq!(result.outcome, FuzzOutcome::SyntaxError);
    assert!(result.detail.is_some());
}

#[test]
fn test_rejecting_verifier_keeps_unit() {
    let reject = |_: &CompiledUnit| -> Result<(), VerificationError> {
        Err(VerificationError::Custom("rejected".into()))
    };
    let mut fuzzer = Fuzzer::new(config(50, 1)).unwrap().with_verifier(reject);
    let result = fuzzer.fuzz("x = 1\ny = x + 2").unwrap();
    assert_eq!(result.outcome, FuzzOutcome::VerificationError);
    assert!(result.unit.is_some());
    assert_eq!(result.detail.as_deref(), Some("rejected"));
}

#[test]
fn test_jit_errors_are_caught() {
    let accept = |_: &CompiledUnit| -> Result<(), VerificationError> { Ok(()) };
    let mut fuzzer = Fuzzer::new(config(0, 1))
        .unwrap()
        .with_verifier(accept)
        .with_jit(FailingJit);
    let result = fuzzer.fuzz("x = 1").unwrap();
    assert_eq!(result.outcome, FuzzOutcome::ErrorCaughtByJit);
    assert!(result.unit.is_some());

    let mut fuzzer = Fuzzer::new(config(0, 1))
        .unwrap()
        .with_verifier(accept)
        .with_jit(FailingJit)
        .without_jit();
    assert_eq!(fuzzer.fuzz("x = 1").unwrap().outcome, FuzzOutcome::Success);
}

#[test]
fn test_substitution_preserves_stack_effect_classes() {
    let source = "a = b + c\nd = -a\ne = f(a, d)\ng.h = e\ndel a\nimport os\n";
    let reference = compile(&wrap_source(source), &mut DirectEmitter).unwrap();
    let expected = wrapper(&reference);
    let mut fuzzer = Fuzzer::new(config(100, 7)).unwrap();
    let mut substituted = 0;
    for _ in 0..20 {
        let result = fuzzer.fuzz(source).unwrap();
        substituted += result.stats.substitutions;
        let unit = result.unit.unwrap();
        let fuzzed = wrapper(&unit);
        assert_eq!(fuzzed.len(), expected.len());
        for (mutated, original) in fuzzed.instructions.iter().zip(&expected.instructions) {
            assert_eq!(
                mutated.opcode.stack_effect_class(),
                original.opcode.stack_effect_class(),
                "{} replaced by {}",
                original.opcode,
                mutated.opcode
            );
        }
    }
    assert!(substituted > 0);
}

#[test]
fn test_renaming_is_consistent_within_a_unit() {
    let mut fuzzer = Fuzzer::new(config(0, 99)).unwrap();
    let result = fuzzer.fuzz("a = 1\nb = a\nc = a\n").unwrap();
    let unit = result.unit.unwrap();
    let function = wrapper(&unit);
    let uses: Vec<_> = function
        .instructions
        .iter()
        .filter(|i| matches!(i.opcode, Opcode::STORE_FAST | Opcode::LOAD_FAST))
        .collect();
    // STORE a, LOAD a, STORE b, LOAD a, STORE c
    assert_eq!(uses.len(), 5);
    assert_eq!(uses[0].operand, uses[1].operand);
    assert_eq!(uses[0].operand, uses[3].operand);
    assert_eq!(uses[0].ioparg, uses[3].ioparg);
    assert_ne!(uses[0].operand, Operand::from("a"));
    assert_ne!(uses[2].operand, uses[4].operand);
}

#[test]
fn test_tables_never_empty_after_substitution() {
    let source = "x = y\nz = x.attr\nfor i in z:\n  w = i * x\n  del w\n";
    let mut fuzzer = Fuzzer::new(config(100, 13)).unwrap();
    for _ in 0..50 {
        let result = fuzzer.fuzz(source).unwrap();
        let unit = result.unit.unwrap();
        let function = wrapper(&unit);
        for instr in &function.instructions {
            if let (Some(table), None) = (instr.opcode.operand_table(), instr.target) {
                let len = function.table_len(table);
                assert!(len > 0, "{table} table empty after {}", instr.opcode);
                assert!((instr.ioparg as usize) < len);
            }
        }
    }
}

#[test]
fn test_single_entry_names_table_falls_back() {
    let mut fuzzer = Fuzzer::new(config(100, 5)).unwrap();
    for _ in 0..20 {
        let result = fuzzer.fuzz("x").unwrap();
        let unit = result.unit.unwrap();
        let function = wrapper(&unit);
        let first = &function.instructions[0];
        assert_eq!(first.opcode, Opcode::LOAD_GLOBAL);
        assert_ne!(first.operand, Operand::from("x"));
        assert!(!function.names.is_empty());
    }
}

#[test]
fn test_nested_functions_get_their_own_tables() {
    let source = "def inner(p):\n  return p\nq = inner(1)\n";
    let mut fuzzer = Fuzzer::new(config(0, 3)).unwrap();
    let result = fuzzer.fuzz(source).unwrap();
    let unit = result.unit.unwrap();
    let outer = wrapper(&unit);
    let inner = outer.code_constants().next().unwrap();
    assert_eq!(inner.argcount, 1);
    assert_eq!(inner.varnames.len(), 1);
    assert!(!inner.varnames.contains(&"p".to_string()));
    assert_eq!(outer.varnames.len(), 2);
}

/// Every tabled instruction's operand is the entry its index points at.
fn assert_operands_resolve(unit: &CompiledUnit) {
    for (offset, instr) in unit.instructions.iter().enumerate() {
        let (Some(table), None) = (instr.opcode.operand_table(), instr.target) else {
            continue;
        };
        assert_eq!(
            unit.table_index(table, &instr.operand),
            Some(instr.ioparg as usize),
            "{}@{offset}: {} {} points at a different {table} entry",
            unit.qualname,
            instr.opcode,
            instr.operand
        );
    }
    for nested in unit.code_constants() {
        assert_operands_resolve(nested);
    }
}

#[test]
fn test_short_fresh_names_never_alias_source_names() {
    let corpus = [
        "a = b\nc = a + d\ne = c.f\nb = e\ng = a * b * c * d * e\n",
        "def h(p, q):\n  r = p + q\n  def k():\n    return r + p\n  return k\ns = h(t, u)\nv = s.w\n",
        "import m.n\nfrom o import p as q\nx = q(m, y)\nz = x.n\n",
    ];
    for percent in [0, 50] {
        for seed in 0..300 {
            let config = FuzzerConfig {
                min_str_len: 1,
                max_str_len: 1,
                ..config(percent, seed)
            };
            let mut fuzzer = Fuzzer::new(config).unwrap();
            for source in corpus {
                let result = fuzzer.fuzz(source).unwrap();
                if let Some(detail) = &result.detail {
                    assert!(!detail.contains("out of range"), "seed {seed}: {detail}");
                }
                assert_operands_resolve(&result.unit.unwrap());
            }
        }
    }
}

#[test]
fn test_deeply_nested_input_is_a_syntax_error() {
    let mut fuzzer = Fuzzer::new(config(50, 1)).unwrap();
    let source = format!("x = {}1{}", "(".repeat(100_000), ")".repeat(100_000));
    let result = fuzzer.fuzz(&source).unwrap();
    assert_eq!(result.outcome, FuzzOutcome::SyntaxError);
    assert!(result.detail.unwrap().contains("too many nested parentheses"));
}
