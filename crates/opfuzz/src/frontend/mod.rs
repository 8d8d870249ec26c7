//! Front end for the source language: text in, compiled units out.
//!
//! Every instruction produced here passes through an [`EmitHook`], which is
//! where the fuzzer intercepts emission.

pub mod ast;
mod codegen;
pub mod lexer;
pub mod parser;
pub mod symbols;

use tracing::debug;

use crate::errors::CompileError;
use crate::interceptor::EmitHook;
use crate::unit::CompiledUnit;

/// Compiles `source` into its module unit. Nested function units are stored
/// as code constants of their enclosing unit.
pub fn compile(source: &str, hook: &mut dyn EmitHook) -> Result<CompiledUnit, CompileError> {
    let body = parser::parse(source)?;
    let scope = symbols::analyze(&body)?;
    let unit = codegen::CodeGenerator::new(hook).compile_module(&scope, &body)?;
    debug!(
        instructions = unit.len(),
        consts = unit.consts.len(),
        "Compiled module"
    );
    Ok(unit)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;
    use crate::interceptor::DirectEmitter;
    use crate::opcodes::Opcode;
    use crate::operand::Operand;
    use crate::unit::UnitKind;

    fn opcodes(unit: &CompiledUnit) -> Vec<Opcode> {
        unit.instructions.iter().map(|i| i.opcode).collect()
    }

    fn only_function(unit: &CompiledUnit) -> &CompiledUnit {
        let mut nested = unit.code_constants();
        let function = nested.next().expect("a nested unit");
        assert!(nested.next().is_none());
        function
    }

    #[test]
    fn test_module_assignment() {
        let unit = compile("x = 1\ny = x + 2\n", &mut DirectEmitter).unwrap();
        use Opcode::*;
        assert_eq!(
            opcodes(&unit),
            vec![
                LOAD_CONST,
                STORE_NAME,
                LOAD_NAME,
                LOAD_CONST,
                BINARY_ADD,
                STORE_NAME,
                LOAD_CONST,
                RETURN_VALUE
            ]
        );
        assert_eq!(unit.names.keys().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(unit.consts.len(), 3);
        assert_eq!(unit.kind, UnitKind::Module);
    }

    #[test]
    fn test_function_uses_fast_locals() {
        let unit = compile("def f(a, b=2):\n    c = a + b\n    return c\n", &mut DirectEmitter)
            .unwrap();
        let function = only_function(&unit);
        assert_eq!(function.argcount, 2);
        assert_eq!(
            function.varnames.keys().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert!(function.instructions.iter().any(|i| i.opcode == Opcode::STORE_FAST));
        let make = unit
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::MAKE_FUNCTION)
            .unwrap();
        assert_eq!(make.ioparg, 0x01);
    }

    #[test]
    fn test_closure_cells_and_free_vars() {
        let source = "def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n";
        let unit = compile(source, &mut DirectEmitter).unwrap();
        let outer = only_function(&unit);
        assert_eq!(outer.cellvars.keys().collect::<Vec<_>>(), vec!["x"]);
        assert!(outer.instructions.iter().any(|i| i.opcode == Opcode::LOAD_CLOSURE));
        let inner = only_function(outer);
        assert_eq!(inner.qualname, "outer.<locals>.inner");
        assert_eq!(inner.freevars.keys().collect::<Vec<_>>(), vec!["x"]);
        assert!(inner.instructions.iter().any(|i| i.opcode == Opcode::LOAD_DEREF));
    }

    #[test]
    fn test_loops_resolve_their_blocks() {
        let source = "for i in range(3):\n    if i:\n        continue\n    break\nwhile x:\n    x -= 1\n";
        let unit = compile(source, &mut DirectEmitter).unwrap();
        for instr in &unit.instructions {
            if let Some(target) = instr.target {
                assert!(instr.opcode.is_jump());
                assert!(unit.block_offset(target).is_some());
            }
        }
        assert!(unit.instructions.iter().any(|i| i.opcode == Opcode::FOR_ITER));
    }

    #[test]
    fn test_every_unit_ends_with_return() {
        let unit = compile("def f():\n    pass\n", &mut DirectEmitter).unwrap();
        for u in [&unit, only_function(&unit)] {
            let tail: Vec<_> = u.instructions.iter().rev().take(2).collect();
            assert_eq!(tail[0].opcode, Opcode::RETURN_VALUE);
            assert_eq!(tail[1].opcode, Opcode::LOAD_CONST);
            assert_eq!(tail[1].operand, Operand::None);
        }
    }

    #[test]
    fn test_keyword_call_and_imports() {
        let source = "import os.path as p\nfrom m import a, b as c\nf(1, key=2)\no.m(3)\n";
        let unit = compile(source, &mut DirectEmitter).unwrap();
        let ops = opcodes(&unit);
        assert!(ops.contains(&Opcode::IMPORT_NAME));
        assert!(ops.contains(&Opcode::IMPORT_FROM));
        assert!(ops.contains(&Opcode::CALL_FUNCTION_KW));
        assert!(ops.contains(&Opcode::LOAD_METHOD));
        assert!(ops.contains(&Opcode::CALL_METHOD));
        assert!(unit.names.contains(&"c".to_string()));
        assert!(unit.names.contains(&"p".to_string()));
    }

    #[test]
    fn test_syntax_errors_propagate() {
        let err = compile("def f(:\n", &mut DirectEmitter).unwrap_err();
        assert!(matches!(err, CompileError::Syntax(_)));
    }
}
