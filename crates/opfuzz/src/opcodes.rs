//! Instruction set of the target stack machine.
//!
//! Every opcode belongs to exactly one [`StackEffectClass`]. Fixed classes
//! are the substitution pools: swapping an opcode for another member of its
//! class keeps the net stack delta of the instruction stream unchanged.

use std::collections::HashMap;
use std::sync::LazyLock;

use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Comparison operators addressed by `COMPARE_OP`, in encoding order.
pub const CMP_OP: [&str; 12] = [
    "<",
    "<=",
    "==",
    "!=",
    ">",
    ">=",
    "in",
    "not in",
    "is",
    "is not",
    "exception match",
    "BAD",
];

#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    PartialOrd,
    Ord,
    Hash,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
pub enum Opcode {
    // Stack manipulation
    POP_TOP,
    ROT_TWO,
    ROT_THREE,
    ROT_FOUR,
    DUP_TOP,
    DUP_TOP_TWO,
    NOP,
    EXTENDED_ARG,

    // Unary operations
    UNARY_POSITIVE,
    UNARY_NEGATIVE,
    UNARY_NOT,
    UNARY_INVERT,

    // Binary operations
    BINARY_MATRIX_MULTIPLY,
    BINARY_POWER,
    BINARY_MULTIPLY,
    BINARY_MODULO,
    BINARY_ADD,
    BINARY_SUBTRACT,
    BINARY_SUBSCR,
    BINARY_FLOOR_DIVIDE,
    BINARY_TRUE_DIVIDE,
    BINARY_LSHIFT,
    BINARY_RSHIFT,
    BINARY_AND,
    BINARY_XOR,
    BINARY_OR,

    // In-place operations
    INPLACE_MATRIX_MULTIPLY,
    INPLACE_FLOOR_DIVIDE,
    INPLACE_TRUE_DIVIDE,
    INPLACE_ADD,
    INPLACE_SUBTRACT,
    INPLACE_MULTIPLY,
    INPLACE_MODULO,
    INPLACE_POWER,
    INPLACE_LSHIFT,
    INPLACE_RSHIFT,
    INPLACE_AND,
    INPLACE_XOR,
    INPLACE_OR,

    // Subscripts, attributes and containers
    STORE_SUBSCR,
    DELETE_SUBSCR,
    LOAD_ATTR,
    STORE_ATTR,
    DELETE_ATTR,
    LOAD_METHOD,
    LIST_APPEND,
    SET_ADD,
    MAP_ADD,

    // Iteration, generators and async
    GET_AITER,
    GET_ANEXT,
    GET_ITER,
    GET_YIELD_FROM_ITER,
    GET_AWAITABLE,
    BEFORE_ASYNC_WITH,
    YIELD_VALUE,
    YIELD_FROM,

    // Blocks and context managers
    SETUP_ANNOTATIONS,
    POP_BLOCK,
    POP_EXCEPT,
    WITH_CLEANUP_START,
    WITH_CLEANUP_FINISH,
    PRINT_EXPR,
    LOAD_BUILD_CLASS,

    // Names and imports
    LOAD_NAME,
    STORE_NAME,
    DELETE_NAME,
    LOAD_GLOBAL,
    STORE_GLOBAL,
    DELETE_GLOBAL,
    IMPORT_NAME,
    IMPORT_FROM,
    IMPORT_STAR,

    // Local slots
    LOAD_FAST,
    STORE_FAST,
    DELETE_FAST,

    // Captured slots
    LOAD_CLOSURE,
    LOAD_DEREF,
    STORE_DEREF,
    DELETE_DEREF,
    LOAD_CLASSDEREF,

    // Constants and comparisons
    LOAD_CONST,
    COMPARE_OP,

    // Operand-dependent stack effect
    MAKE_FUNCTION,
    CALL_FUNCTION,
    CALL_FUNCTION_KW,
    CALL_FUNCTION_EX,
    CALL_METHOD,
    BUILD_TUPLE,
    BUILD_LIST,
    BUILD_SET,
    BUILD_MAP,
    BUILD_STRING,
    BUILD_CONST_KEY_MAP,
    BUILD_MAP_UNPACK,
    BUILD_MAP_UNPACK_WITH_CALL,
    BUILD_LIST_UNPACK,
    BUILD_TUPLE_UNPACK,
    BUILD_TUPLE_UNPACK_WITH_CALL,
    BUILD_SET_UNPACK,
    UNPACK_SEQUENCE,
    UNPACK_EX,

    // Control transfer
    FOR_ITER,
    JUMP_ABSOLUTE,
    JUMP_FORWARD,
    JUMP_IF_FALSE_OR_POP,
    JUMP_IF_TRUE_OR_POP,
    POP_JUMP_IF_FALSE,
    POP_JUMP_IF_TRUE,
    RETURN_VALUE,
    RAISE_VARARGS,

    // Static typing extensions, operands live in the constant pool
    LOAD_CLASS,
    INVOKE_FUNCTION,
    INVOKE_METHOD,
    LOAD_FIELD,
    STORE_FIELD,
    CAST,
    PRIMITIVE_BOX,
    PRIMITIVE_UNBOX,
    TP_ALLOC,
    CHECK_ARGS,
    BUILD_CHECKED_MAP,
    BUILD_CHECKED_LIST,
    PRIMITIVE_LOAD_CONST,
    LOAD_LOCAL,
    STORE_LOCAL,
    REFINE_TYPE,
    LOAD_METHOD_SUPER,
    LOAD_ATTR_SUPER,
    FUNC_CREDENTIAL,
    READONLY_OPERATION,
}

/// Partition of the instruction set by net stack delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackEffectClass {
    /// Always changes the stack depth by the given amount.
    Fixed(i8),
    /// Stack delta is a function of the encoded operand.
    Variable,
    /// Control transfers and constant loads. Never substituted.
    Exempt,
    /// No class is known. Left unchanged.
    Unclassified,
}

/// Per-unit table an opcode's operand is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum OperandTable {
    #[strum(serialize = "names")]
    Names,
    #[strum(serialize = "varnames")]
    Varnames,
    #[strum(serialize = "closure")]
    Closure,
    #[strum(serialize = "consts")]
    Consts,
}

/// Substitution pools, keyed by fixed stack delta.
static POOLS: LazyLock<HashMap<i8, Vec<Opcode>>> = LazyLock::new(|| {
    let mut pools: HashMap<i8, Vec<Opcode>> = HashMap::new();
    for opcode in Opcode::iter() {
        if let StackEffectClass::Fixed(delta) = opcode.stack_effect_class() {
            pools.entry(delta).or_default().push(opcode);
        }
    }
    pools
});

/// Every opcode sharing the fixed stack delta `delta`, the original included.
pub fn substitution_pool(delta: i8) -> &'static [Opcode] {
    POOLS.get(&delta).map(Vec::as_slice).unwrap_or_default()
}

impl Opcode {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn stack_effect_class(self) -> StackEffectClass {
        use Opcode::*;
        match self {
            FOR_ITER | JUMP_ABSOLUTE | JUMP_FORWARD | JUMP_IF_FALSE_OR_POP
            | JUMP_IF_TRUE_OR_POP | POP_JUMP_IF_FALSE | POP_JUMP_IF_TRUE | RETURN_VALUE
            | RAISE_VARARGS | LOAD_CONST => StackEffectClass::Exempt,

            MAKE_FUNCTION | CALL_FUNCTION | CALL_FUNCTION_KW | CALL_FUNCTION_EX | CALL_METHOD
            | BUILD_TUPLE | BUILD_LIST | BUILD_SET | BUILD_MAP | BUILD_STRING
            | BUILD_CONST_KEY_MAP | BUILD_MAP_UNPACK | BUILD_MAP_UNPACK_WITH_CALL
            | BUILD_LIST_UNPACK | BUILD_TUPLE_UNPACK | BUILD_TUPLE_UNPACK_WITH_CALL
            | BUILD_SET_UNPACK | UNPACK_SEQUENCE | UNPACK_EX => StackEffectClass::Variable,

            ROT_TWO | ROT_THREE | ROT_FOUR | NOP | UNARY_POSITIVE | UNARY_NEGATIVE
            | UNARY_NOT | UNARY_INVERT | GET_AITER | GET_ITER | GET_YIELD_FROM_ITER
            | GET_AWAITABLE | SETUP_ANNOTATIONS | YIELD_VALUE | POP_BLOCK | DELETE_NAME
            | DELETE_GLOBAL | LOAD_ATTR | DELETE_FAST | DELETE_DEREF | EXTENDED_ARG => {
                StackEffectClass::Fixed(0)
            }

            DUP_TOP | GET_ANEXT | BEFORE_ASYNC_WITH | LOAD_BUILD_CLASS | LOAD_NAME
            | IMPORT_FROM | LOAD_GLOBAL | LOAD_FAST | LOAD_CLOSURE | LOAD_DEREF
            | FUNC_CREDENTIAL | LOAD_CLASSDEREF | LOAD_METHOD => StackEffectClass::Fixed(1),

            DUP_TOP_TWO | WITH_CLEANUP_START => StackEffectClass::Fixed(2),

            POP_TOP | BINARY_MATRIX_MULTIPLY | INPLACE_MATRIX_MULTIPLY | BINARY_POWER
            | BINARY_MULTIPLY | BINARY_MODULO | BINARY_ADD | BINARY_SUBTRACT | BINARY_SUBSCR
            | BINARY_FLOOR_DIVIDE | BINARY_TRUE_DIVIDE | INPLACE_FLOOR_DIVIDE
            | INPLACE_TRUE_DIVIDE | INPLACE_ADD | INPLACE_SUBTRACT | INPLACE_MULTIPLY
            | INPLACE_MODULO | BINARY_LSHIFT | BINARY_RSHIFT | BINARY_AND | BINARY_XOR
            | BINARY_OR | INPLACE_POWER | PRINT_EXPR | YIELD_FROM | INPLACE_LSHIFT
            | INPLACE_RSHIFT | INPLACE_AND | INPLACE_XOR | INPLACE_OR | IMPORT_STAR
            | STORE_NAME | DELETE_ATTR | STORE_GLOBAL | IMPORT_NAME | STORE_FAST
            | STORE_DEREF | LIST_APPEND | SET_ADD | LOAD_METHOD_SUPER => {
                StackEffectClass::Fixed(-1)
            }

            DELETE_SUBSCR | STORE_ATTR | MAP_ADD | LOAD_ATTR_SUPER => StackEffectClass::Fixed(-2),

            STORE_SUBSCR | WITH_CLEANUP_FINISH | POP_EXCEPT => StackEffectClass::Fixed(-3),

            COMPARE_OP | LOAD_CLASS | INVOKE_FUNCTION | INVOKE_METHOD | LOAD_FIELD
            | STORE_FIELD | CAST | PRIMITIVE_BOX | PRIMITIVE_UNBOX | TP_ALLOC | CHECK_ARGS
            | BUILD_CHECKED_MAP | BUILD_CHECKED_LIST | PRIMITIVE_LOAD_CONST | LOAD_LOCAL
            | STORE_LOCAL | REFINE_TYPE | READONLY_OPERATION => StackEffectClass::Unclassified,
        }
    }

    pub fn operand_table(self) -> Option<OperandTable> {
        use Opcode::*;
        match self {
            LOAD_NAME | LOAD_GLOBAL | STORE_GLOBAL | DELETE_GLOBAL | STORE_NAME | DELETE_NAME
            | IMPORT_NAME | IMPORT_FROM | STORE_ATTR | LOAD_ATTR | DELETE_ATTR | LOAD_METHOD => {
                Some(OperandTable::Names)
            }
            LOAD_FAST | STORE_FAST | DELETE_FAST => Some(OperandTable::Varnames),
            LOAD_DEREF | STORE_DEREF | DELETE_DEREF | LOAD_CLASSDEREF | LOAD_CLOSURE => {
                Some(OperandTable::Closure)
            }
            LOAD_CONST | LOAD_CLASS | INVOKE_FUNCTION | INVOKE_METHOD | LOAD_FIELD
            | STORE_FIELD | CAST | PRIMITIVE_BOX | PRIMITIVE_UNBOX | TP_ALLOC | CHECK_ARGS
            | BUILD_CHECKED_MAP | BUILD_CHECKED_LIST | PRIMITIVE_LOAD_CONST | LOAD_LOCAL
            | STORE_LOCAL | REFINE_TYPE | LOAD_METHOD_SUPER | LOAD_ATTR_SUPER
            | FUNC_CREDENTIAL | READONLY_OPERATION => Some(OperandTable::Consts),
            _ => None,
        }
    }

    /// Opcodes whose operand is a block reference.
    pub fn is_jump(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            FOR_ITER
                | JUMP_ABSOLUTE
                | JUMP_FORWARD
                | JUMP_IF_FALSE_OR_POP
                | JUMP_IF_TRUE_OR_POP
                | POP_JUMP_IF_FALSE
                | POP_JUMP_IF_TRUE
        )
    }

    /// Opcodes after which control never falls through.
    pub fn is_terminator(self) -> bool {
        use Opcode::*;
        matches!(self, JUMP_ABSOLUTE | JUMP_FORWARD | RETURN_VALUE | RAISE_VARARGS)
    }

    /// Net stack delta of one execution. `jump` selects the taken edge of a
    /// conditional jump. `None` when the delta cannot be determined statically.
    pub fn stack_effect(self, oparg: u32, jump: bool) -> Option<i64> {
        use Opcode::*;
        let n = i64::from(oparg);
        if let StackEffectClass::Fixed(delta) = self.stack_effect_class() {
            return Some(i64::from(delta));
        }
        let effect = match self {
            LOAD_CONST => 1,
            FOR_ITER => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            JUMP_ABSOLUTE | JUMP_FORWARD => 0,
            JUMP_IF_FALSE_OR_POP | JUMP_IF_TRUE_OR_POP => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            POP_JUMP_IF_FALSE | POP_JUMP_IF_TRUE | RETURN_VALUE => -1,
            RAISE_VARARGS => -n,

            MAKE_FUNCTION => -1 - i64::from((oparg & 0x0f).count_ones()),
            CALL_FUNCTION => -n,
            CALL_FUNCTION_KW | CALL_METHOD => -n - 1,
            CALL_FUNCTION_EX => -1 - i64::from(oparg & 0x01),
            BUILD_TUPLE | BUILD_LIST | BUILD_SET | BUILD_STRING | BUILD_MAP_UNPACK
            | BUILD_MAP_UNPACK_WITH_CALL | BUILD_LIST_UNPACK | BUILD_TUPLE_UNPACK
            | BUILD_TUPLE_UNPACK_WITH_CALL | BUILD_SET_UNPACK => 1 - n,
            BUILD_MAP => 1 - 2 * n,
            BUILD_CONST_KEY_MAP => -n,
            UNPACK_SEQUENCE => n - 1,
            UNPACK_EX => i64::from(oparg & 0xff) + i64::from(oparg >> 8),

            COMPARE_OP | STORE_LOCAL => -1,
            STORE_FIELD => -2,
            LOAD_CLASS | TP_ALLOC | PRIMITIVE_LOAD_CONST | LOAD_LOCAL => 1,
            LOAD_FIELD | CAST | PRIMITIVE_BOX | PRIMITIVE_UNBOX | CHECK_ARGS | REFINE_TYPE
            | READONLY_OPERATION => 0,
            _ => return None,
        };
        Some(effect)
    }

    /// Stack entries an instruction consumes before pushing its results.
    pub fn stack_inputs(self, oparg: u32) -> Option<i64> {
        use Opcode::*;
        let n = i64::from(oparg);
        let inputs = match self {
            NOP | EXTENDED_ARG | SETUP_ANNOTATIONS | POP_BLOCK | LOAD_BUILD_CLASS | LOAD_NAME
            | DELETE_NAME | LOAD_GLOBAL | DELETE_GLOBAL | LOAD_FAST | DELETE_FAST
            | LOAD_CLOSURE | LOAD_DEREF | DELETE_DEREF | LOAD_CLASSDEREF | LOAD_CONST
            | JUMP_ABSOLUTE | JUMP_FORWARD | FUNC_CREDENTIAL | LOAD_CLASS | TP_ALLOC
            | PRIMITIVE_LOAD_CONST | LOAD_LOCAL | CHECK_ARGS | READONLY_OPERATION => 0,

            POP_TOP | DUP_TOP | UNARY_POSITIVE | UNARY_NEGATIVE | UNARY_NOT | UNARY_INVERT
            | GET_AITER | GET_ANEXT | GET_ITER | GET_YIELD_FROM_ITER | GET_AWAITABLE
            | BEFORE_ASYNC_WITH | YIELD_VALUE | WITH_CLEANUP_START | PRINT_EXPR | LOAD_ATTR
            | DELETE_ATTR | LOAD_METHOD | LIST_APPEND | SET_ADD | STORE_NAME | STORE_GLOBAL
            | IMPORT_FROM | IMPORT_STAR | STORE_FAST | STORE_DEREF | FOR_ITER
            | JUMP_IF_FALSE_OR_POP | JUMP_IF_TRUE_OR_POP | POP_JUMP_IF_FALSE
            | POP_JUMP_IF_TRUE | RETURN_VALUE | UNPACK_SEQUENCE | UNPACK_EX | LOAD_FIELD
            | CAST | PRIMITIVE_BOX | PRIMITIVE_UNBOX | STORE_LOCAL | REFINE_TYPE => 1,

            ROT_TWO | DUP_TOP_TWO | BINARY_MATRIX_MULTIPLY | BINARY_POWER | BINARY_MULTIPLY
            | BINARY_MODULO | BINARY_ADD | BINARY_SUBTRACT | BINARY_SUBSCR
            | BINARY_FLOOR_DIVIDE | BINARY_TRUE_DIVIDE | BINARY_LSHIFT | BINARY_RSHIFT
            | BINARY_AND | BINARY_XOR | BINARY_OR | INPLACE_MATRIX_MULTIPLY
            | INPLACE_FLOOR_DIVIDE | INPLACE_TRUE_DIVIDE | INPLACE_ADD | INPLACE_SUBTRACT
            | INPLACE_MULTIPLY | INPLACE_MODULO | INPLACE_POWER | INPLACE_LSHIFT
            | INPLACE_RSHIFT | INPLACE_AND | INPLACE_XOR | INPLACE_OR | DELETE_SUBSCR
            | STORE_ATTR | MAP_ADD | YIELD_FROM | IMPORT_NAME | COMPARE_OP | STORE_FIELD => 2,

            ROT_THREE | STORE_SUBSCR | WITH_CLEANUP_FINISH | POP_EXCEPT | LOAD_METHOD_SUPER
            | LOAD_ATTR_SUPER => 3,

            ROT_FOUR => 4,

            RAISE_VARARGS | BUILD_TUPLE | BUILD_LIST | BUILD_SET | BUILD_STRING
            | BUILD_MAP_UNPACK | BUILD_MAP_UNPACK_WITH_CALL | BUILD_LIST_UNPACK
            | BUILD_TUPLE_UNPACK | BUILD_TUPLE_UNPACK_WITH_CALL | BUILD_SET_UNPACK => n,
            BUILD_MAP => 2 * n,
            BUILD_CONST_KEY_MAP => n + 1,
            MAKE_FUNCTION => 2 + i64::from((oparg & 0x0f).count_ones()),
            CALL_FUNCTION => n + 1,
            CALL_FUNCTION_KW | CALL_METHOD => n + 2,
            CALL_FUNCTION_EX => 2 + i64::from(oparg & 0x01),

            INVOKE_FUNCTION | INVOKE_METHOD | BUILD_CHECKED_MAP | BUILD_CHECKED_LIST => {
                return None;
            }
        };
        Some(inputs)
    }
}
