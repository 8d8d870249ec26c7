//! Scope analysis: decides for every name whether it is a local slot, a
//! captured cell, a free variable or a global.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::errors::SyntaxError;

use super::ast::{Expr, FunctionDef, Stmt, StmtKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
}

/// How a name is read and written inside one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameAccess {
    /// Module-level dictionary access.
    Name,
    Fast,
    Deref,
    Global,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: String,
    pub qualname: String,
    pub params: Vec<String>,
    /// Bound names in first-binding order, parameters first.
    locals: Vec<String>,
    local_set: HashSet<String>,
    explicit_globals: HashSet<String>,
    nonlocals: HashMap<String, (usize, usize)>,
    uses: HashSet<String>,
    /// Every identifier the scope's own source text mentions.
    mentioned: BTreeSet<String>,
    pub cellvars: BTreeSet<String>,
    pub freevars: BTreeSet<String>,
    /// Nested function scopes in source order.
    pub children: Vec<Scope>,
}

impl Scope {
    fn new(kind: ScopeKind, name: &str, qualname: String, params: Vec<String>) -> Self {
        let mut scope = Self {
            kind,
            name: name.to_string(),
            qualname,
            params: Vec::new(),
            locals: Vec::new(),
            local_set: HashSet::new(),
            explicit_globals: HashSet::new(),
            nonlocals: HashMap::new(),
            uses: HashSet::new(),
            mentioned: BTreeSet::new(),
            cellvars: BTreeSet::new(),
            freevars: BTreeSet::new(),
            children: Vec::new(),
        };
        for param in &params {
            scope.bind(param);
        }
        scope.params = params;
        scope
    }

    fn mention(&mut self, name: &str) {
        if !self.mentioned.contains(name) {
            self.mentioned.insert(name.to_string());
        }
    }

    fn bind(&mut self, name: &str) {
        self.mention(name);
        if self.local_set.insert(name.to_string()) {
            self.locals.push(name.to_string());
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.local_set.contains(name)
            && !self.explicit_globals.contains(name)
            && !self.nonlocals.contains_key(name)
    }

    pub fn access(&self, name: &str) -> NameAccess {
        if self.kind == ScopeKind::Module {
            return NameAccess::Name;
        }
        if self.explicit_globals.contains(name) {
            NameAccess::Global
        } else if self.cellvars.contains(name) || self.freevars.contains(name) {
            NameAccess::Deref
        } else if self.is_local(name) {
            NameAccess::Fast
        } else {
            NameAccess::Global
        }
    }

    /// Identifiers that can land in this scope's operand tables: names,
    /// attributes, import paths and captured variables.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut identifiers = self.mentioned.clone();
        identifiers.extend(self.cellvars.iter().cloned());
        identifiers.extend(self.freevars.iter().cloned());
        identifiers
    }

    pub fn child_qualname(&self, name: &str) -> String {
        match self.kind {
            ScopeKind::Module => name.to_string(),
            ScopeKind::Function => format!("{}.<locals>.{name}", self.qualname),
        }
    }
}

/// Builds the scope tree of a module and resolves captured variables.
pub fn analyze(body: &[Stmt]) -> Result<Scope, SyntaxError> {
    let mut module = Scope::new(ScopeKind::Module, "<module>", "<module>".to_string(), Vec::new());
    collect_block(&mut module, body)?;
    let mut frames = Vec::new();
    for child in &mut module.children {
        resolve(child, &mut frames)?;
    }
    Ok(module)
}

fn collect_block(scope: &mut Scope, body: &[Stmt]) -> Result<(), SyntaxError> {
    body.iter().try_for_each(|stmt| collect_stmt(scope, stmt))
}

fn collect_stmt(scope: &mut Scope, stmt: &Stmt) -> Result<(), SyntaxError> {
    let error = |message: String| SyntaxError::new(stmt.line, stmt.column, message);
    match &stmt.kind {
        StmtKind::Expr(expr) => collect_expr(scope, expr),
        StmtKind::Assign { targets, value } => {
            collect_expr(scope, value);
            for target in targets {
                collect_target(scope, target);
            }
        }
        StmtKind::AugAssign { target, value, .. } => {
            collect_expr(scope, target);
            collect_expr(scope, value);
            collect_target(scope, target);
        }
        StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        StmtKind::Return(value) => {
            if let Some(value) = value {
                collect_expr(scope, value);
            }
        }
        StmtKind::Delete(targets) => {
            for target in targets {
                collect_target(scope, target);
            }
        }
        StmtKind::Global(names) => {
            for name in names {
                if scope.params.contains(name) {
                    return Err(error(format!("name '{name}' is parameter and global")));
                }
                if scope.nonlocals.contains_key(name) {
                    return Err(error(format!("name '{name}' is nonlocal and global")));
                }
                scope.mention(name);
                scope.explicit_globals.insert(name.clone());
            }
        }
        StmtKind::Nonlocal(names) => {
            for name in names {
                if scope.params.contains(name) {
                    return Err(error(format!("name '{name}' is parameter and nonlocal")));
                }
                if scope.explicit_globals.contains(name) {
                    return Err(error(format!("name '{name}' is nonlocal and global")));
                }
                scope.mention(name);
                scope
                    .nonlocals
                    .insert(name.clone(), (stmt.line, stmt.column));
            }
        }
        StmtKind::Import(aliases) => {
            for alias in aliases {
                scope.mention(&alias.name);
                for component in alias.name.split('.') {
                    scope.mention(component);
                }
                let bound = match &alias.asname {
                    Some(asname) => asname.as_str(),
                    None => alias.name.split('.').next().unwrap_or(&alias.name),
                };
                scope.bind(bound);
            }
        }
        StmtKind::ImportFrom { module, names, .. } => {
            scope.mention(module);
            for alias in names {
                scope.mention(&alias.name);
                scope.bind(alias.asname.as_deref().unwrap_or(&alias.name));
            }
        }
        StmtKind::Raise { exc, cause } => {
            for expr in [exc, cause].into_iter().flatten() {
                collect_expr(scope, expr);
            }
        }
        StmtKind::If { test, body, orelse } => {
            collect_expr(scope, test);
            collect_block(scope, body)?;
            collect_block(scope, orelse)?;
        }
        StmtKind::While { test, body } => {
            collect_expr(scope, test);
            collect_block(scope, body)?;
        }
        StmtKind::For { target, iter, body } => {
            collect_expr(scope, iter);
            collect_target(scope, target);
            collect_block(scope, body)?;
        }
        StmtKind::FunctionDef(def) => collect_function(scope, def)?,
    }
    Ok(())
}

fn collect_function(scope: &mut Scope, def: &FunctionDef) -> Result<(), SyntaxError> {
    for default in &def.defaults {
        collect_expr(scope, default);
    }
    scope.bind(&def.name);
    let mut child = Scope::new(
        ScopeKind::Function,
        &def.name,
        scope.child_qualname(&def.name),
        def.params.clone(),
    );
    collect_block(&mut child, &def.body)?;
    scope.children.push(child);
    Ok(())
}

fn collect_target(scope: &mut Scope, target: &Expr) {
    match target {
        Expr::Name(name) => scope.bind(name),
        Expr::Tuple(items) | Expr::List(items) => {
            for item in items {
                collect_target(scope, item);
            }
        }
        Expr::Attribute { value, attr } => {
            scope.mention(attr);
            collect_expr(scope, value);
        }
        Expr::Subscript { value, index } => {
            collect_expr(scope, value);
            collect_expr(scope, index);
        }
        other => collect_expr(scope, other),
    }
}

fn collect_expr(scope: &mut Scope, expr: &Expr) {
    match expr {
        Expr::Name(name) => {
            scope.mention(name);
            scope.uses.insert(name.clone());
        }
        Expr::Const(_) => {}
        Expr::Tuple(items) | Expr::List(items) | Expr::Set(items) => {
            for item in items {
                collect_expr(scope, item);
            }
        }
        Expr::Dict(pairs) => {
            for (key, value) in pairs {
                collect_expr(scope, key);
                collect_expr(scope, value);
            }
        }
        Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
            collect_expr(scope, left);
            collect_expr(scope, right);
        }
        Expr::UnaryOp { operand, .. } => collect_expr(scope, operand),
        Expr::BoolOp { values, .. } => {
            for value in values {
                collect_expr(scope, value);
            }
        }
        Expr::Call {
            func,
            args,
            keywords,
        } => {
            collect_expr(scope, func);
            for arg in args.iter().chain(keywords.iter().map(|(_, value)| value)) {
                collect_expr(scope, arg);
            }
        }
        Expr::Attribute { value, attr } => {
            scope.mention(attr);
            collect_expr(scope, value);
        }
        Expr::Subscript { value, index } => {
            collect_expr(scope, value);
            collect_expr(scope, index);
        }
    }
}

/// Binding facts of an enclosing function, nearest last.
struct Frame {
    locals: HashSet<String>,
    globals: HashSet<String>,
}

/// Whether `name` resolves to a binding of an enclosing function.
fn bound_in_enclosing(frames: &[Frame], name: &str) -> bool {
    for frame in frames.iter().rev() {
        if frame.globals.contains(name) {
            return false;
        }
        if frame.locals.contains(name) {
            return true;
        }
    }
    false
}

/// Resolves `scope` and its children, returning the names it captures from
/// enclosing functions.
fn resolve(scope: &mut Scope, frames: &mut Vec<Frame>) -> Result<(), SyntaxError> {
    let locals: HashSet<String> = scope
        .locals
        .iter()
        .filter(|name| scope.is_local(name))
        .cloned()
        .collect();

    frames.push(Frame {
        locals: locals.clone(),
        globals: scope.explicit_globals.clone(),
    });
    let mut captured_by_children = BTreeSet::new();
    for child in &mut scope.children {
        resolve(child, frames)?;
        captured_by_children.extend(child.freevars.iter().cloned());
    }
    frames.pop();

    let mut needed: BTreeSet<String> = scope
        .uses
        .iter()
        .chain(scope.nonlocals.keys())
        .filter(|name| !locals.contains(*name) && !scope.explicit_globals.contains(*name))
        .cloned()
        .collect();
    for name in captured_by_children {
        if locals.contains(&name) {
            scope.cellvars.insert(name);
        } else {
            needed.insert(name);
        }
    }

    for name in needed {
        if bound_in_enclosing(frames, &name) {
            scope.freevars.insert(name);
        } else if let Some((line, column)) = scope.nonlocals.get(&name) {
            return Err(SyntaxError::new(
                *line,
                *column,
                format!("no binding for nonlocal '{name}' found"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;
    use crate::frontend::parser::parse;

    fn analyze_source(source: &str) -> Scope {
        analyze(&parse(source).unwrap()).unwrap()
    }

    #[test]
    fn test_module_names_use_name_access() {
        let module = analyze_source("x = 1\ny = x");
        assert_eq!(module.access("x"), NameAccess::Name);
        assert!(module.children.is_empty());
    }

    #[test]
    fn test_function_locals_and_globals() {
        let module = analyze_source("def f(a):\n  global g\n  b = a\n  g = b\n  return len(b)\n");
        let f = &module.children[0];
        assert_eq!(f.qualname, "f");
        assert_eq!(f.access("a"), NameAccess::Fast);
        assert_eq!(f.access("b"), NameAccess::Fast);
        assert_eq!(f.access("g"), NameAccess::Global);
        assert_eq!(f.access("len"), NameAccess::Global);
    }

    #[test]
    fn test_closures_create_cells_and_free_variables() {
        let module = analyze_source(
            "def outer():\n  x = 1\n  def middle():\n    def inner():\n      return x\n    return inner\n  return middle\n",
        );
        let outer = &module.children[0];
        let middle = &outer.children[0];
        let inner = &middle.children[0];
        assert_eq!(inner.qualname, "outer.<locals>.middle.<locals>.inner");
        assert!(outer.cellvars.contains("x"));
        assert!(middle.freevars.contains("x"));
        assert!(inner.freevars.contains("x"));
        assert_eq!(outer.access("x"), NameAccess::Deref);
        assert_eq!(inner.access("x"), NameAccess::Deref);
    }

    #[test]
    fn test_nonlocal_rebinding() {
        let module = analyze_source(
            "def counter():\n  n = 0\n  def bump():\n    nonlocal n\n    n += 1\n  return bump\n",
        );
        let counter = &module.children[0];
        assert!(counter.cellvars.contains("n"));
        assert!(counter.children[0].freevars.contains("n"));
        assert_eq!(counter.children[0].access("n"), NameAccess::Deref);
    }

    #[test]
    fn test_global_in_enclosing_scope_is_not_captured() {
        let module =
            analyze_source("def f():\n  global x\n  x = 1\n  def g():\n    return x\n  return g\n");
        let f = &module.children[0];
        assert!(f.cellvars.is_empty());
        assert_eq!(f.children[0].access("x"), NameAccess::Global);
    }

    #[test]
    fn test_scope_errors() {
        let unbound = parse("def f():\n  def g():\n    nonlocal missing\n    missing = 1\n").unwrap();
        let err = analyze(&unbound).unwrap_err();
        assert_eq!(err.line, 3);
        let param = parse("def f(a):\n  global a\n").unwrap();
        assert!(analyze(&param).is_err());
    }

    #[test]
    fn test_identifiers_cover_every_table_name() {
        let module = analyze_source(
            "import os.path as p\nfrom pkg import item as alias\ndef f(a):\n  global g\n  a.attr = b\n  def h():\n    return a\n  return h\n",
        );
        let identifiers = module.identifiers();
        for name in ["os.path", "os", "path", "p", "pkg", "item", "alias", "f"] {
            assert!(identifiers.contains(name), "module misses {name}");
        }
        assert!(!identifiers.contains("attr"));
        let f = module.children[0].identifiers();
        for name in ["a", "g", "attr", "b", "h"] {
            assert!(f.contains(name), "f misses {name}");
        }
        let h = module.children[0].children[0].identifiers();
        assert!(h.contains("a"));
        assert!(!h.contains("b"));
    }
}
