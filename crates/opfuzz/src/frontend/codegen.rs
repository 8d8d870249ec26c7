//! Lowers the syntax tree to instructions, one unit per scope.
//!
//! Every instruction goes through the [`EmitHook`]; only block placement is
//! done directly on the unit.

use std::slice;
use std::sync::Arc;

use crate::errors::{CompileError, FuzzerError};
use crate::interceptor::{Arg, EmitHook};
use crate::opcodes::Opcode;
use crate::operand::Operand;
use crate::unit::{BlockId, CompiledUnit, UnitKind};

use super::ast::{BinOp, BoolOp, Constant, Expr, FunctionDef, Stmt, StmtKind, UnaryOp};
use super::symbols::{NameAccess, Scope, ScopeKind};

struct LoopBlocks {
    head: BlockId,
    exit: BlockId,
    /// `for` loops keep their iterator on the stack.
    has_iterator: bool,
}

struct UnitState<'s> {
    unit: CompiledUnit,
    scope: &'s Scope,
    children: slice::Iter<'s, Scope>,
    loops: Vec<LoopBlocks>,
}

#[derive(Clone, Copy)]
enum NameOp {
    Load,
    Store,
    Delete,
}

pub(crate) struct CodeGenerator<'h> {
    hook: &'h mut dyn EmitHook,
    next_id: u64,
}

fn constant_operand(constant: &Constant) -> Operand {
    match constant {
        Constant::None => Operand::None,
        Constant::Bool(b) => Operand::Bool(*b),
        Constant::Int(i) => Operand::Int(*i),
        Constant::Float(f) => Operand::Float(*f),
        Constant::Complex { re, im } => Operand::Complex { re: *re, im: *im },
        Constant::Str(s) => Operand::Str(s.clone()),
        Constant::Bytes(b) => Operand::Bytes(b.clone()),
        Constant::Tuple(items) => Operand::Tuple(items.iter().map(constant_operand).collect()),
        Constant::FrozenSet(items) => Operand::frozen_set(items.iter().map(constant_operand)),
    }
}

fn count(n: usize) -> Result<Operand, FuzzerError> {
    i64::try_from(n)
        .map(Operand::Int)
        .map_err(|_| FuzzerError::Internal(format!("count {n} does not fit an operand")))
}

fn binary_opcode(op: BinOp, inplace: bool) -> Opcode {
    use Opcode::*;
    match (op, inplace) {
        (BinOp::Add, false) => BINARY_ADD,
        (BinOp::Sub, false) => BINARY_SUBTRACT,
        (BinOp::Mul, false) => BINARY_MULTIPLY,
        (BinOp::MatMul, false) => BINARY_MATRIX_MULTIPLY,
        (BinOp::Div, false) => BINARY_TRUE_DIVIDE,
        (BinOp::FloorDiv, false) => BINARY_FLOOR_DIVIDE,
        (BinOp::Mod, false) => BINARY_MODULO,
        (BinOp::Pow, false) => BINARY_POWER,
        (BinOp::LShift, false) => BINARY_LSHIFT,
        (BinOp::RShift, false) => BINARY_RSHIFT,
        (BinOp::BitAnd, false) => BINARY_AND,
        (BinOp::BitOr, false) => BINARY_OR,
        (BinOp::BitXor, false) => BINARY_XOR,
        (BinOp::Add, true) => INPLACE_ADD,
        (BinOp::Sub, true) => INPLACE_SUBTRACT,
        (BinOp::Mul, true) => INPLACE_MULTIPLY,
        (BinOp::MatMul, true) => INPLACE_MATRIX_MULTIPLY,
        (BinOp::Div, true) => INPLACE_TRUE_DIVIDE,
        (BinOp::FloorDiv, true) => INPLACE_FLOOR_DIVIDE,
        (BinOp::Mod, true) => INPLACE_MODULO,
        (BinOp::Pow, true) => INPLACE_POWER,
        (BinOp::LShift, true) => INPLACE_LSHIFT,
        (BinOp::RShift, true) => INPLACE_RSHIFT,
        (BinOp::BitAnd, true) => INPLACE_AND,
        (BinOp::BitOr, true) => INPLACE_OR,
        (BinOp::BitXor, true) => INPLACE_XOR,
    }
}

fn name_opcode(access: NameAccess, op: NameOp) -> Opcode {
    use Opcode::*;
    match (access, op) {
        (NameAccess::Name, NameOp::Load) => LOAD_NAME,
        (NameAccess::Name, NameOp::Store) => STORE_NAME,
        (NameAccess::Name, NameOp::Delete) => DELETE_NAME,
        (NameAccess::Fast, NameOp::Load) => LOAD_FAST,
        (NameAccess::Fast, NameOp::Store) => STORE_FAST,
        (NameAccess::Fast, NameOp::Delete) => DELETE_FAST,
        (NameAccess::Deref, NameOp::Load) => LOAD_DEREF,
        (NameAccess::Deref, NameOp::Store) => STORE_DEREF,
        (NameAccess::Deref, NameOp::Delete) => DELETE_DEREF,
        (NameAccess::Global, NameOp::Load) => LOAD_GLOBAL,
        (NameAccess::Global, NameOp::Store) => STORE_GLOBAL,
        (NameAccess::Global, NameOp::Delete) => DELETE_GLOBAL,
    }
}

impl<'h> CodeGenerator<'h> {
    pub(crate) fn new(hook: &'h mut dyn EmitHook) -> Self {
        Self { hook, next_id: 0 }
    }

    pub(crate) fn compile_module(
        &mut self,
        scope: &Scope,
        body: &[Stmt],
    ) -> Result<CompiledUnit, CompileError> {
        self.compile_unit(scope, body, 1)
    }

    fn compile_unit(
        &mut self,
        scope: &Scope,
        body: &[Stmt],
        first_lineno: usize,
    ) -> Result<CompiledUnit, CompileError> {
        let kind = match scope.kind {
            ScopeKind::Module => UnitKind::Module,
            ScopeKind::Function => UnitKind::Function,
        };
        let mut unit = CompiledUnit::new(self.next_id, &scope.name, &scope.qualname, kind);
        self.next_id += 1;
        unit.argcount = scope.params.len();
        unit.first_lineno = first_lineno;
        for param in &scope.params {
            unit.varnames.get_index(param.clone());
        }
        for cell in &scope.cellvars {
            unit.cellvars.get_index(cell.clone());
        }
        for free in &scope.freevars {
            unit.freevars.get_index(free.clone());
        }

        self.hook.begin_unit(&unit, &scope.identifiers());
        let mut state = UnitState {
            unit,
            scope,
            children: scope.children.iter(),
            loops: Vec::new(),
        };
        self.block(&mut state, body)?;
        self.emit(&mut state, Opcode::LOAD_CONST, Operand::None)?;
        self.emit(&mut state, Opcode::RETURN_VALUE, Operand::Int(0))?;
        self.hook.end_unit(&state.unit);
        Ok(state.unit)
    }

    fn emit(
        &mut self,
        state: &mut UnitState<'_>,
        opcode: Opcode,
        arg: impl Into<Arg>,
    ) -> Result<(), FuzzerError> {
        self.hook.emit(&mut state.unit, opcode, arg.into())
    }

    fn op(&mut self, state: &mut UnitState<'_>, opcode: Opcode) -> Result<(), FuzzerError> {
        self.emit(state, opcode, Operand::Int(0))
    }

    fn name(
        &mut self,
        state: &mut UnitState<'_>,
        name: &str,
        op: NameOp,
    ) -> Result<(), FuzzerError> {
        let opcode = name_opcode(state.scope.access(name), op);
        self.emit(state, opcode, Operand::from(name))
    }

    fn block(&mut self, state: &mut UnitState<'_>, body: &[Stmt]) -> Result<(), CompileError> {
        body.iter().try_for_each(|stmt| self.stmt(state, stmt))
    }

    fn stmt(&mut self, state: &mut UnitState<'_>, stmt: &Stmt) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.expr(state, expr)?;
                self.op(state, Opcode::POP_TOP)?;
            }
            StmtKind::Assign { targets, value } => {
                self.expr(state, value)?;
                if let Some((last, rest)) = targets.split_last() {
                    for target in rest {
                        self.op(state, Opcode::DUP_TOP)?;
                        self.store(state, target)?;
                    }
                    self.store(state, last)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(state, target, *op, value)?,
            StmtKind::Pass | StmtKind::Global(_) | StmtKind::Nonlocal(_) => {}
            StmtKind::Break => {
                let Some(exit) = state.loops.last().map(|l| (l.exit, l.has_iterator)) else {
                    return Err(FuzzerError::Internal("break outside loop".into()).into());
                };
                if exit.1 {
                    self.op(state, Opcode::POP_TOP)?;
                }
                self.emit(state, Opcode::JUMP_ABSOLUTE, exit.0)?;
            }
            StmtKind::Continue => {
                let Some(head) = state.loops.last().map(|l| l.head) else {
                    return Err(FuzzerError::Internal("continue outside loop".into()).into());
                };
                self.emit(state, Opcode::JUMP_ABSOLUTE, head)?;
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.expr(state, value)?,
                    None => self.emit(state, Opcode::LOAD_CONST, Operand::None)?,
                }
                self.op(state, Opcode::RETURN_VALUE)?;
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(state, target)?;
                }
            }
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    self.emit(state, Opcode::LOAD_CONST, Operand::Int(0))?;
                    self.emit(state, Opcode::LOAD_CONST, Operand::None)?;
                    self.emit(state, Opcode::IMPORT_NAME, Operand::from(alias.name.as_str()))?;
                    let mut components = alias.name.split('.');
                    let head = components.next().unwrap_or(&alias.name);
                    match &alias.asname {
                        Some(asname) => {
                            for component in components {
                                self.emit(state, Opcode::IMPORT_FROM, Operand::from(component))?;
                                self.op(state, Opcode::ROT_TWO)?;
                                self.op(state, Opcode::POP_TOP)?;
                            }
                            self.name(state, asname, NameOp::Store)?;
                        }
                        None => self.name(state, head, NameOp::Store)?,
                    }
                }
            }
            StmtKind::ImportFrom {
                module,
                level,
                names,
            } => {
                let fromlist = if names.is_empty() {
                    vec![Operand::from("*")]
                } else {
                    names
                        .iter()
                        .map(|alias| Operand::from(alias.name.as_str()))
                        .collect()
                };
                self.emit(state, Opcode::LOAD_CONST, Operand::Int(i64::from(*level)))?;
                self.emit(state, Opcode::LOAD_CONST, Operand::Tuple(fromlist))?;
                self.emit(state, Opcode::IMPORT_NAME, Operand::from(module.as_str()))?;
                if names.is_empty() {
                    self.op(state, Opcode::IMPORT_STAR)?;
                } else {
                    for alias in names {
                        self.emit(state, Opcode::IMPORT_FROM, Operand::from(alias.name.as_str()))?;
                        let bound = alias.asname.as_deref().unwrap_or(&alias.name);
                        self.name(state, bound, NameOp::Store)?;
                    }
                    self.op(state, Opcode::POP_TOP)?;
                }
            }
            StmtKind::Raise { exc, cause } => {
                let mut argc = 0;
                for expr in [exc, cause].into_iter().flatten() {
                    self.expr(state, expr)?;
                    argc += 1;
                }
                self.emit(state, Opcode::RAISE_VARARGS, Operand::Int(argc))?;
            }
            StmtKind::If { test, body, orelse } => {
                let otherwise = state.unit.new_block();
                self.expr(state, test)?;
                self.emit(state, Opcode::POP_JUMP_IF_FALSE, otherwise)?;
                self.block(state, body)?;
                if orelse.is_empty() {
                    state.unit.place_block(otherwise);
                } else {
                    let end = state.unit.new_block();
                    self.emit(state, Opcode::JUMP_FORWARD, end)?;
                    state.unit.place_block(otherwise);
                    self.block(state, orelse)?;
                    state.unit.place_block(end);
                }
            }
            StmtKind::While { test, body } => {
                let head = state.unit.new_block();
                let exit = state.unit.new_block();
                state.unit.place_block(head);
                self.expr(state, test)?;
                self.emit(state, Opcode::POP_JUMP_IF_FALSE, exit)?;
                self.loop_body(state, head, exit, false, body)?;
                state.unit.place_block(exit);
            }
            StmtKind::For { target, iter, body } => {
                let head = state.unit.new_block();
                let exit = state.unit.new_block();
                self.expr(state, iter)?;
                self.op(state, Opcode::GET_ITER)?;
                state.unit.place_block(head);
                self.emit(state, Opcode::FOR_ITER, exit)?;
                self.store(state, target)?;
                self.loop_body(state, head, exit, true, body)?;
                state.unit.place_block(exit);
            }
            StmtKind::FunctionDef(def) => self.function_def(state, def)?,
        }
        Ok(())
    }

    fn loop_body(
        &mut self,
        state: &mut UnitState<'_>,
        head: BlockId,
        exit: BlockId,
        has_iterator: bool,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        state.loops.push(LoopBlocks {
            head,
            exit,
            has_iterator,
        });
        let result = self.block(state, body);
        state.loops.pop();
        result?;
        self.emit(state, Opcode::JUMP_ABSOLUTE, head)?;
        Ok(())
    }

    fn function_def(
        &mut self,
        state: &mut UnitState<'_>,
        def: &FunctionDef,
    ) -> Result<(), CompileError> {
        let scope = state.children.next().ok_or_else(|| {
            FuzzerError::Internal(format!("no scope recorded for function {}", def.name))
        })?;
        let mut flags = 0;
        if !def.defaults.is_empty() {
            for default in &def.defaults {
                self.expr(state, default)?;
            }
            self.emit(state, Opcode::BUILD_TUPLE, count(def.defaults.len())?)?;
            flags |= 0x01;
        }
        if !scope.freevars.is_empty() {
            for free in &scope.freevars {
                self.emit(state, Opcode::LOAD_CLOSURE, Operand::from(free.as_str()))?;
            }
            self.emit(state, Opcode::BUILD_TUPLE, count(scope.freevars.len())?)?;
            flags |= 0x08;
        }
        let code = self.compile_unit(scope, &def.body, def.line)?;
        self.emit(state, Opcode::LOAD_CONST, Operand::Code(Arc::new(code)))?;
        self.emit(state, Opcode::LOAD_CONST, Operand::from(scope.qualname.as_str()))?;
        self.emit(state, Opcode::MAKE_FUNCTION, Operand::Int(flags))?;
        self.name(state, &def.name, NameOp::Store)?;
        Ok(())
    }

    fn aug_assign(
        &mut self,
        state: &mut UnitState<'_>,
        target: &Expr,
        op: BinOp,
        value: &Expr,
    ) -> Result<(), CompileError> {
        let inplace = binary_opcode(op, true);
        match target {
            Expr::Name(name) => {
                self.name(state, name, NameOp::Load)?;
                self.expr(state, value)?;
                self.op(state, inplace)?;
                self.name(state, name, NameOp::Store)?;
            }
            Expr::Attribute { value: object, attr } => {
                self.expr(state, object)?;
                self.op(state, Opcode::DUP_TOP)?;
                self.emit(state, Opcode::LOAD_ATTR, Operand::from(attr.as_str()))?;
                self.expr(state, value)?;
                self.op(state, inplace)?;
                self.op(state, Opcode::ROT_TWO)?;
                self.emit(state, Opcode::STORE_ATTR, Operand::from(attr.as_str()))?;
            }
            Expr::Subscript {
                value: object,
                index,
            } => {
                self.expr(state, object)?;
                self.expr(state, index)?;
                self.op(state, Opcode::DUP_TOP_TWO)?;
                self.op(state, Opcode::BINARY_SUBSCR)?;
                self.expr(state, value)?;
                self.op(state, inplace)?;
                self.op(state, Opcode::ROT_THREE)?;
                self.op(state, Opcode::STORE_SUBSCR)?;
            }
            _ => {
                return Err(
                    FuzzerError::Internal("invalid augmented assignment target".into()).into(),
                );
            }
        }
        Ok(())
    }

    /// Stores the value on top of the stack into `target`.
    fn store(&mut self, state: &mut UnitState<'_>, target: &Expr) -> Result<(), CompileError> {
        match target {
            Expr::Name(name) => self.name(state, name, NameOp::Store)?,
            Expr::Attribute { value, attr } => {
                self.expr(state, value)?;
                self.emit(state, Opcode::STORE_ATTR, Operand::from(attr.as_str()))?;
            }
            Expr::Subscript { value, index } => {
                self.expr(state, value)?;
                self.expr(state, index)?;
                self.op(state, Opcode::STORE_SUBSCR)?;
            }
            Expr::Tuple(items) | Expr::List(items) => {
                self.emit(state, Opcode::UNPACK_SEQUENCE, count(items.len())?)?;
                for item in items {
                    self.store(state, item)?;
                }
            }
            _ => return Err(FuzzerError::Internal("invalid assignment target".into()).into()),
        }
        Ok(())
    }

    fn delete(&mut self, state: &mut UnitState<'_>, target: &Expr) -> Result<(), CompileError> {
        match target {
            Expr::Name(name) => self.name(state, name, NameOp::Delete)?,
            Expr::Attribute { value, attr } => {
                self.expr(state, value)?;
                self.emit(state, Opcode::DELETE_ATTR, Operand::from(attr.as_str()))?;
            }
            Expr::Subscript { value, index } => {
                self.expr(state, value)?;
                self.expr(state, index)?;
                self.op(state, Opcode::DELETE_SUBSCR)?;
            }
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.delete(state, item)?;
                }
            }
            _ => return Err(FuzzerError::Internal("invalid delete target".into()).into()),
        }
        Ok(())
    }

    fn exprs(&mut self, state: &mut UnitState<'_>, items: &[Expr]) -> Result<(), CompileError> {
        items.iter().try_for_each(|item| self.expr(state, item))
    }

    fn expr(&mut self, state: &mut UnitState<'_>, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Name(name) => self.name(state, name, NameOp::Load)?,
            Expr::Const(constant) => {
                self.emit(state, Opcode::LOAD_CONST, constant_operand(constant))?;
            }
            Expr::Tuple(items) => {
                self.exprs(state, items)?;
                self.emit(state, Opcode::BUILD_TUPLE, count(items.len())?)?;
            }
            Expr::List(items) => {
                self.exprs(state, items)?;
                self.emit(state, Opcode::BUILD_LIST, count(items.len())?)?;
            }
            Expr::Set(items) => {
                self.exprs(state, items)?;
                self.emit(state, Opcode::BUILD_SET, count(items.len())?)?;
            }
            Expr::Dict(pairs) => {
                let constant_keys: Option<Vec<Operand>> = pairs
                    .iter()
                    .map(|(key, _)| match key {
                        Expr::Const(c) => Some(constant_operand(c)),
                        _ => None,
                    })
                    .collect();
                match constant_keys {
                    Some(keys) if keys.len() > 1 => {
                        for (_, value) in pairs {
                            self.expr(state, value)?;
                        }
                        self.emit(state, Opcode::LOAD_CONST, Operand::Tuple(keys))?;
                        self.emit(state, Opcode::BUILD_CONST_KEY_MAP, count(pairs.len())?)?;
                    }
                    _ => {
                        for (key, value) in pairs {
                            self.expr(state, key)?;
                            self.expr(state, value)?;
                        }
                        self.emit(state, Opcode::BUILD_MAP, count(pairs.len())?)?;
                    }
                }
            }
            Expr::BinOp { op, left, right } => {
                self.expr(state, left)?;
                self.expr(state, right)?;
                self.op(state, binary_opcode(*op, false))?;
            }
            Expr::UnaryOp { op, operand } => {
                self.expr(state, operand)?;
                let opcode = match op {
                    UnaryOp::Pos => Opcode::UNARY_POSITIVE,
                    UnaryOp::Neg => Opcode::UNARY_NEGATIVE,
                    UnaryOp::Not => Opcode::UNARY_NOT,
                    UnaryOp::Invert => Opcode::UNARY_INVERT,
                };
                self.op(state, opcode)?;
            }
            Expr::BoolOp { op, values } => {
                let jump = match op {
                    BoolOp::And => Opcode::JUMP_IF_FALSE_OR_POP,
                    BoolOp::Or => Opcode::JUMP_IF_TRUE_OR_POP,
                };
                let end = state.unit.new_block();
                if let Some((last, rest)) = values.split_last() {
                    for value in rest {
                        self.expr(state, value)?;
                        self.emit(state, jump, end)?;
                    }
                    self.expr(state, last)?;
                }
                state.unit.place_block(end);
            }
            Expr::Compare { op, left, right } => {
                self.expr(state, left)?;
                self.expr(state, right)?;
                self.emit(state, Opcode::COMPARE_OP, Operand::Int(i64::from(*op)))?;
            }
            Expr::Call {
                func,
                args,
                keywords,
            } => self.call(state, func, args, keywords)?,
            Expr::Attribute { value, attr } => {
                self.expr(state, value)?;
                self.emit(state, Opcode::LOAD_ATTR, Operand::from(attr.as_str()))?;
            }
            Expr::Subscript { value, index } => {
                self.expr(state, value)?;
                self.expr(state, index)?;
                self.op(state, Opcode::BINARY_SUBSCR)?;
            }
        }
        Ok(())
    }

    fn call(
        &mut self,
        state: &mut UnitState<'_>,
        func: &Expr,
        args: &[Expr],
        keywords: &[(String, Expr)],
    ) -> Result<(), CompileError> {
        if let (Expr::Attribute { value, attr }, true) = (func, keywords.is_empty()) {
            self.expr(state, value)?;
            self.emit(state, Opcode::LOAD_METHOD, Operand::from(attr.as_str()))?;
            self.exprs(state, args)?;
            self.emit(state, Opcode::CALL_METHOD, count(args.len())?)?;
            return Ok(());
        }
        self.expr(state, func)?;
        self.exprs(state, args)?;
        if keywords.is_empty() {
            self.emit(state, Opcode::CALL_FUNCTION, count(args.len())?)?;
            return Ok(());
        }
        for (_, value) in keywords {
            self.expr(state, value)?;
        }
        let names = keywords
            .iter()
            .map(|(name, _)| Operand::from(name.as_str()))
            .collect();
        self.emit(state, Opcode::LOAD_CONST, Operand::Tuple(names))?;
        self.emit(
            state,
            Opcode::CALL_FUNCTION_KW,
            count(args.len() + keywords.len())?,
        )?;
        Ok(())
    }
}
