//! Recursive-descent parser over the token stream.

use crate::errors::SyntaxError;
use crate::opcodes::CMP_OP;

use super::ast::{Alias, BinOp, BoolOp, Constant, Expr, FunctionDef, Stmt, StmtKind, UnaryOp};
use super::lexer::{Spanned, Token, tokenize};

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// Bound on syntactic nesting, counted in parser recursion levels. Every
/// later pass recurses over the tree, so this also bounds their depth.
const MAX_NESTING: usize = 100;

const NESTED_EXPRESSIONS: &str = "too many nested parentheses";
const NESTED_BLOCKS: &str = "too many statically nested blocks";

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

fn cmp_index(symbol: &str) -> u32 {
    CMP_OP
        .iter()
        .position(|op| *op == symbol)
        .and_then(|i| u32::try_from(i).ok())
        .unwrap_or(0)
}

pub fn parse(source: &str) -> Result<Vec<Stmt>, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_module()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    function_depth: usize,
    loop_depth: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            function_depth: 0,
            loop_depth: 0,
            depth: 0,
        }
    }

    fn deepen(&mut self, message: &'static str) -> Result<(), SyntaxError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(message));
        }
        self.depth += 1;
        Ok(())
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T>(
        &mut self,
        message: &'static str,
        parse: impl FnOnce(&mut Self) -> Result<T, SyntaxError>,
    ) -> Result<T, SyntaxError> {
        self.deepen(message)?;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Runs `parse`, which may deepen once per loop iteration, and restores
    /// the depth afterwards.
    fn restoring<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, SyntaxError>,
    ) -> Result<T, SyntaxError> {
        let depth = self.depth;
        let result = parse(self);
        self.depth = depth;
        result
    }

    fn current(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos).or_else(|| self.tokens.last())
    }

    fn peek(&self) -> &Token {
        self.current().map_or(&Token::Eof, |s| &s.token)
    }

    fn peek_next(&self) -> &Token {
        self.tokens.get(self.pos + 1).map_or(&Token::Eof, |s| &s.token)
    }

    fn position(&self) -> (usize, usize) {
        self.current().map_or((1, 1), |s| (s.line, s.column))
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        let (line, column) = self.position();
        SyntaxError::new(line, column, message)
    }

    fn unexpected(&self) -> SyntaxError {
        let message = match self.peek() {
            Token::Eof => "unexpected EOF while parsing".to_string(),
            Token::Indent => "unexpected indent".to_string(),
            Token::Dedent => "unindent does not match".to_string(),
            Token::Newline => "invalid syntax".to_string(),
            token => format!("invalid syntax near {token:?}"),
        };
        self.error(message)
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Token::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let found = self.at_op(op);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_op(&mut self, op: &str) -> Result<(), SyntaxError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.at_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), SyntaxError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{keyword}'")))
        }
    }

    fn expect_name(&mut self) -> Result<String, SyntaxError> {
        match self.peek() {
            Token::Name(name) if !is_keyword(name) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn expect_newline(&mut self) -> Result<(), SyntaxError> {
        match self.peek() {
            Token::Newline => {
                self.pos += 1;
                Ok(())
            }
            Token::Eof => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    fn parse_module(mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Token::Eof => return Ok(body),
                Token::Newline => {
                    self.pos += 1;
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let (line, column) = self.position();
        let kind = match self.peek() {
            Token::Name(n) if n == "if" => {
                self.pos += 1;
                self.parse_if()?
            }
            Token::Name(n) if n == "while" => {
                self.pos += 1;
                let test = self.parse_test()?;
                let body = self.parse_loop_body()?;
                StmtKind::While { test, body }
            }
            Token::Name(n) if n == "for" => {
                self.pos += 1;
                let target = self.parse_target_list()?;
                self.expect_keyword("in")?;
                let iter = self.parse_testlist()?;
                let body = self.parse_loop_body()?;
                StmtKind::For { target, iter, body }
            }
            Token::Name(n) if n == "def" => {
                self.pos += 1;
                StmtKind::FunctionDef(self.parse_def(line)?)
            }
            _ => return self.parse_simple_statements(),
        };
        Ok(vec![Stmt { kind, line, column }])
    }

    fn parse_if(&mut self) -> Result<StmtKind, SyntaxError> {
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let (line, column) = self.position();
        let orelse = if self.eat_keyword("elif") {
            vec![Stmt {
                kind: self.nested(NESTED_BLOCKS, Self::parse_if)?,
                line,
                column,
            }]
        } else if self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn parse_loop_body(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        body
    }

    fn parse_def(&mut self, line: usize) -> Result<FunctionDef, SyntaxError> {
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let mut params: Vec<String> = Vec::new();
        let mut defaults = Vec::new();
        while !self.at_op(")") {
            let param = self.expect_name()?;
            if params.contains(&param) {
                return Err(self.error(format!(
                    "duplicate argument '{param}' in function definition"
                )));
            }
            params.push(param);
            if self.eat_op("=") {
                defaults.push(self.parse_test()?);
            } else if !defaults.is_empty() {
                return Err(self.error("non-default argument follows default argument"));
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;

        let saved_loops = std::mem::take(&mut self.loop_depth);
        self.function_depth += 1;
        let body = self.parse_block();
        self.function_depth -= 1;
        self.loop_depth = saved_loops;

        Ok(FunctionDef {
            name,
            params,
            defaults,
            body: body?,
            line,
        })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.nested(NESTED_BLOCKS, Self::parse_block_body)
    }

    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Token::Newline) {
            return self.parse_simple_statements();
        }
        self.pos += 1;
        if !matches!(self.peek(), Token::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.pos += 1;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Token::Dedent => {
                    self.pos += 1;
                    return Ok(body);
                }
                Token::Eof => return Ok(body),
                Token::Newline => {
                    self.pos += 1;
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
    }

    fn parse_simple_statements(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let mut statements = Vec::new();
        loop {
            let (line, column) = self.position();
            let kind = self.parse_small_statement()?;
            statements.push(Stmt { kind, line, column });
            if !self.eat_op(";") || matches!(self.peek(), Token::Newline | Token::Eof) {
                break;
            }
        }
        self.expect_newline()?;
        Ok(statements)
    }

    fn parse_small_statement(&mut self) -> Result<StmtKind, SyntaxError> {
        let keyword = match self.peek() {
            Token::Name(n) if is_keyword(n) => n.clone(),
            _ => return self.parse_expression_statement(),
        };
        match keyword.as_str() {
            "pass" => {
                self.pos += 1;
                Ok(StmtKind::Pass)
            }
            "break" | "continue" => {
                if self.loop_depth == 0 {
                    return Err(self.error(format!("'{keyword}' outside loop")));
                }
                self.pos += 1;
                Ok(if keyword == "break" {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                })
            }
            "return" => {
                if self.function_depth == 0 {
                    return Err(self.error("'return' outside function"));
                }
                self.pos += 1;
                let value = if self.starts_expression() {
                    Some(self.parse_testlist()?)
                } else {
                    None
                };
                Ok(StmtKind::Return(value))
            }
            "del" => {
                self.pos += 1;
                let targets = match self.parse_target_list()? {
                    Expr::Tuple(items) => items,
                    target => vec![target],
                };
                for target in &targets {
                    self.check_target(target, "delete")?;
                }
                Ok(StmtKind::Delete(targets))
            }
            "global" | "nonlocal" => {
                if keyword == "nonlocal" && self.function_depth == 0 {
                    return Err(self.error("nonlocal declaration not allowed at module level"));
                }
                self.pos += 1;
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                Ok(if keyword == "global" {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                })
            }
            "import" => {
                self.pos += 1;
                let mut aliases = Vec::new();
                loop {
                    let name = self.parse_dotted_name()?;
                    let asname = if self.eat_keyword("as") {
                        Some(self.expect_name()?)
                    } else {
                        None
                    };
                    aliases.push(Alias { name, asname });
                    if !self.eat_op(",") {
                        break;
                    }
                }
                Ok(StmtKind::Import(aliases))
            }
            "from" => {
                self.pos += 1;
                self.parse_import_from()
            }
            "raise" => {
                self.pos += 1;
                let exc = if self.starts_expression() {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                let cause = if exc.is_some() && self.eat_keyword("from") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                Ok(StmtKind::Raise { exc, cause })
            }
            "None" | "True" | "False" | "not" => self.parse_expression_statement(),
            _ => Err(self.unexpected()),
        }
    }

    fn parse_dotted_name(&mut self) -> Result<String, SyntaxError> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_import_from(&mut self) -> Result<StmtKind, SyntaxError> {
        let mut level = 0;
        while self.eat_op(".") {
            level += 1;
        }
        let module = if self.at_keyword("import") {
            if level == 0 {
                return Err(self.unexpected());
            }
            String::new()
        } else {
            self.parse_dotted_name()?
        };
        self.expect_keyword("import")?;
        if self.eat_op("*") {
            if self.function_depth > 0 {
                return Err(self.error("import * only allowed at module level"));
            }
            return Ok(StmtKind::ImportFrom {
                module,
                level,
                names: Vec::new(),
            });
        }
        let parenthesized = self.eat_op("(");
        let mut names = Vec::new();
        loop {
            let name = self.expect_name()?;
            let asname = if self.eat_keyword("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(Alias { name, asname });
            if !self.eat_op(",") || (parenthesized && self.at_op(")")) {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(StmtKind::ImportFrom {
            module,
            level,
            names,
        })
    }

    fn parse_expression_statement(&mut self) -> Result<StmtKind, SyntaxError> {
        let first = self.parse_testlist()?;
        if let Some(op) = self.augmented_operator() {
            self.pos += 1;
            if !matches!(
                first,
                Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. }
            ) {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.parse_testlist()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }
        if !self.at_op("=") {
            return Ok(StmtKind::Expr(first));
        }
        let mut targets = vec![first];
        while self.eat_op("=") {
            targets.push(self.parse_testlist()?);
        }
        let value = targets.pop().ok_or_else(|| self.unexpected())?;
        for target in &targets {
            self.check_target(target, "assign to")?;
        }
        Ok(StmtKind::Assign { targets, value })
    }

    fn augmented_operator(&self) -> Option<BinOp> {
        let Token::Op(op) = self.peek() else {
            return None;
        };
        let op = match *op {
            "+=" => BinOp::Add,
            "-=" => BinOp::Sub,
            "*=" => BinOp::Mul,
            "@=" => BinOp::MatMul,
            "/=" => BinOp::Div,
            "//=" => BinOp::FloorDiv,
            "%=" => BinOp::Mod,
            "**=" => BinOp::Pow,
            "<<=" => BinOp::LShift,
            ">>=" => BinOp::RShift,
            "&=" => BinOp::BitAnd,
            "|=" => BinOp::BitOr,
            "^=" => BinOp::BitXor,
            _ => return None,
        };
        Some(op)
    }

    fn check_target(&self, target: &Expr, action: &str) -> Result<(), SyntaxError> {
        match target {
            Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. } => Ok(()),
            Expr::Tuple(items) | Expr::List(items) => {
                items.iter().try_for_each(|item| self.check_target(item, action))
            }
            Expr::Const(_) => Err(self.error(format!("cannot {action} literal"))),
            Expr::Call { .. } => Err(self.error(format!("cannot {action} function call"))),
            _ => Err(self.error(format!("cannot {action} operator"))),
        }
    }

    /// Targets of `for` and `del`: comma-separated, stopping before `in`.
    fn parse_target_list(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_bitor()?;
        if !self.at_op(",") {
            self.check_target(&first, "assign to")?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_bitor()?);
        }
        let target = Expr::Tuple(items);
        self.check_target(&target, "assign to")?;
        Ok(target)
    }

    fn starts_expression(&self) -> bool {
        match self.peek() {
            Token::Name(n) => {
                !is_keyword(n) || matches!(n.as_str(), "None" | "True" | "False" | "not")
            }
            Token::Int(_)
            | Token::Float(_)
            | Token::Imaginary(_)
            | Token::Str(_)
            | Token::Bytes(_) => true,
            Token::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~"),
            _ => false,
        }
    }

    /// Comma-separated expressions; more than one makes a tuple.
    fn parse_testlist(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(make_tuple(items))
    }

    fn parse_test(&mut self) -> Result<Expr, SyntaxError> {
        self.nested(NESTED_EXPRESSIONS, Self::parse_or)
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_and()?;
        if !self.at_keyword("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("or") {
            values.push(self.parse_and()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::Or,
            values,
        })
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_not()?;
        if !self.at_keyword("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("and") {
            values.push(self.parse_not()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::And,
            values,
        })
    }

    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_keyword("not") {
            let operand = self.nested(NESTED_EXPRESSIONS, Self::parse_not)?;
            return Ok(Expr::UnaryOp {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn comparison_operator(&mut self) -> Option<u32> {
        let symbol = match self.peek() {
            Token::Op(op @ ("<" | "<=" | "==" | "!=" | ">" | ">=")) => *op,
            Token::Name(n) if n == "in" => "in",
            Token::Name(n) if n == "not" && matches!(self.peek_next(), Token::Name(m) if m == "in") => {
                self.pos += 1;
                "not in"
            }
            Token::Name(n) if n == "is" => {
                if matches!(self.peek_next(), Token::Name(m) if m == "not") {
                    self.pos += 1;
                    "is not"
                } else {
                    "is"
                }
            }
            _ => return None,
        };
        self.pos += 1;
        Some(cmp_index(symbol))
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.parse_bitor()?;
        let Some(op) = self.comparison_operator() else {
            return Ok(left);
        };
        let right = self.parse_bitor()?;
        if self.comparison_operator().is_some() {
            return Err(self.error("chained comparisons are not supported"));
        }
        let right = if op == cmp_index("in") || op == cmp_index("not in") {
            fold_membership(right)
        } else {
            right
        };
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_binary(
        &mut self,
        operators: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, SyntaxError>,
    ) -> Result<Expr, SyntaxError> {
        self.restoring(|parser| {
            let mut left = next(parser)?;
            'outer: loop {
                for (symbol, op) in operators {
                    if parser.eat_op(symbol) {
                        parser.deepen(NESTED_EXPRESSIONS)?;
                        let right = next(parser)?;
                        left = Expr::BinOp {
                            op: *op,
                            left: Box::new(left),
                            right: Box::new(right),
                        };
                        continue 'outer;
                    }
                }
                return Ok(left);
            }
        })
    }

    fn parse_bitor(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(&[("|", BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(&[("^", BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(&[("&", BinOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(
            &[("<<", BinOp::LShift), (">>", BinOp::RShift)],
            Self::parse_arith,
        )
    }

    fn parse_arith(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::parse_term)
    }

    fn parse_term(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_binary(
            &[
                ("*", BinOp::Mul),
                ("@", BinOp::MatMul),
                ("//", BinOp::FloorDiv),
                ("/", BinOp::Div),
                ("%", BinOp::Mod),
            ],
            Self::parse_factor,
        )
    }

    fn parse_factor(&mut self) -> Result<Expr, SyntaxError> {
        let op = if self.eat_op("-") {
            UnaryOp::Neg
        } else if self.eat_op("+") {
            UnaryOp::Pos
        } else if self.eat_op("~") {
            UnaryOp::Invert
        } else {
            return self.parse_power();
        };
        let operand = self.nested(NESTED_EXPRESSIONS, Self::parse_factor)?;
        Ok(fold_unary(op, operand))
    }

    fn parse_power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.parse_atom_expr()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        let exponent = self.nested(NESTED_EXPRESSIONS, Self::parse_factor)?;
        Ok(Expr::BinOp {
            op: BinOp::Pow,
            left: Box::new(base),
            right: Box::new(exponent),
        })
    }

    fn parse_atom_expr(&mut self) -> Result<Expr, SyntaxError> {
        self.restoring(Self::parse_trailers)
    }

    fn parse_trailers(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.parse_atom()?;
        loop {
            if matches!(self.peek(), Token::Op("(" | "[" | ".")) {
                self.deepen(NESTED_EXPRESSIONS)?;
            }
            if self.eat_op("(") {
                let (args, keywords) = self.parse_call_arguments()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    keywords,
                };
            } else if self.eat_op("[") {
                let index = self.parse_testlist()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn parse_call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), SyntaxError> {
        let mut args = Vec::new();
        let mut keywords: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            let keyword = match (self.peek(), self.peek_next()) {
                (Token::Name(name), Token::Op("=")) if !is_keyword(name) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.pos += 2;
                if keywords.iter().any(|(existing, _)| *existing == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                keywords.push((name, self.parse_test()?));
            } else {
                if !keywords.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.parse_test()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, keywords))
    }

    fn parse_atom(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek().clone() {
            Token::Name(name) => {
                let constant = match name.as_str() {
                    "None" => Constant::None,
                    "True" => Constant::Bool(true),
                    "False" => Constant::Bool(false),
                    _ => return self.expect_name().map(Expr::Name),
                };
                self.pos += 1;
                Ok(Expr::Const(constant))
            }
            Token::Int(value) => {
                self.pos += 1;
                Ok(Expr::Const(Constant::Int(value)))
            }
            Token::Float(value) => {
                self.pos += 1;
                Ok(Expr::Const(Constant::Float(value)))
            }
            Token::Imaginary(im) => {
                self.pos += 1;
                Ok(Expr::Const(Constant::Complex { re: 0.0, im }))
            }
            Token::Str(_) | Token::Bytes(_) => self.parse_strings(),
            Token::Op("(") => {
                self.pos += 1;
                if self.eat_op(")") {
                    return Ok(Expr::Const(Constant::Tuple(Vec::new())));
                }
                let first = self.parse_test()?;
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op(")") {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect_op(")")?;
                Ok(make_tuple(items))
            }
            Token::Op("[") => {
                self.pos += 1;
                let items = self.parse_sequence("]")?;
                Ok(Expr::List(items))
            }
            Token::Op("{") => {
                self.pos += 1;
                self.parse_brace()
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_sequence(&mut self, close: &str) -> Result<Vec<Expr>, SyntaxError> {
        let mut items = Vec::new();
        while !self.at_op(close) {
            items.push(self.parse_test()?);
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(close)?;
        Ok(items)
    }

    fn parse_brace(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let first = self.parse_test()?;
        if !self.eat_op(":") {
            let mut items = vec![first];
            if self.eat_op(",") {
                items.extend(self.parse_sequence("}")?);
            } else {
                self.expect_op("}")?;
            }
            return Ok(Expr::Set(items));
        }
        let mut pairs = vec![(first, self.parse_test()?)];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            let key = self.parse_test()?;
            self.expect_op(":")?;
            pairs.push((key, self.parse_test()?));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(pairs))
    }

    /// Adjacent literals concatenate; text and bytes cannot mix.
    fn parse_strings(&mut self) -> Result<Expr, SyntaxError> {
        let mut text: Option<String> = None;
        let mut bytes: Option<Vec<u8>> = None;
        loop {
            match self.peek().clone() {
                Token::Str(s) if bytes.is_none() => text.get_or_insert_with(String::new).push_str(&s),
                Token::Bytes(b) if text.is_none() => bytes.get_or_insert_with(Vec::new).extend(b),
                Token::Str(_) | Token::Bytes(_) => {
                    return Err(self.error("cannot mix bytes and nonbytes literals"));
                }
                _ => break,
            }
            self.pos += 1;
        }
        Ok(Expr::Const(match (text, bytes) {
            (_, Some(b)) => Constant::Bytes(b),
            (Some(s), None) => Constant::Str(s),
            (None, None) => return Err(self.unexpected()),
        }))
    }
}

/// All-constant tuples become a single constant.
fn make_tuple(items: Vec<Expr>) -> Expr {
    if items.iter().all(|item| matches!(item, Expr::Const(_))) {
        let constants = items
            .into_iter()
            .filter_map(|item| match item {
                Expr::Const(c) => Some(c),
                _ => None,
            })
            .collect();
        return Expr::Const(Constant::Tuple(constants));
    }
    Expr::Tuple(items)
}

/// Negated numeric literals fold into constants, keeping signed zeros.
fn fold_unary(op: UnaryOp, operand: Expr) -> Expr {
    if op == UnaryOp::Neg {
        let folded = match &operand {
            Expr::Const(Constant::Int(i)) => i.checked_neg().map(Constant::Int),
            Expr::Const(Constant::Float(f)) => Some(Constant::Float(-f)),
            Expr::Const(Constant::Complex { re, im }) => Some(Constant::Complex {
                re: -re,
                im: -im,
            }),
            _ => None,
        };
        if let Some(constant) = folded {
            return Expr::Const(constant);
        }
    }
    Expr::UnaryOp {
        op,
        operand: Box::new(operand),
    }
}

/// Constant right-hand sides of membership tests become immutable
/// constants: sets turn into frozen sets and lists into tuples.
fn fold_membership(right: Expr) -> Expr {
    let constants = |items: &[Expr]| -> Option<Vec<Constant>> {
        items
            .iter()
            .map(|item| match item {
                Expr::Const(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    };
    let folded = match &right {
        Expr::Set(items) => constants(items).map(Constant::FrozenSet),
        Expr::List(items) => constants(items).map(Constant::Tuple),
        _ => None,
    };
    folded.map_or(right, Expr::Const)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[allow(clippy::indexing_slicing, clippy::as_conversions)]
mod tests {
    use super::*;

    fn parse_expr(source: &str) -> Expr {
        match parse(source).unwrap().remove(0).kind {
            StmtKind::Expr(expr) => expr,
            other => panic!("expected expression, got {other:?}"),
        }
    }

    #[test]
    fn test_assignment_and_binop() {
        let body = parse("x = 1\ny = x + 2").unwrap();
        assert_eq!(body.len(), 2);
        match &body[1].kind {
            StmtKind::Assign { targets, value } => {
                assert_eq!(targets, &vec![Expr::Name("y".into())]);
                assert!(matches!(value, Expr::BinOp { op: BinOp::Add, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(body[1].line, 2);
    }

    #[test]
    fn test_malformed_def_is_error() {
        let err = parse("def wrapper_function():\n  def f(:").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(parse("def f(:").is_err());
    }

    #[test]
    fn test_precedence() {
        match parse_expr("1 + 2 * 3") {
            Expr::BinOp { op: BinOp::Add, right, .. } => {
                assert!(matches!(*right, Expr::BinOp { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Unary minus binds looser than power.
        assert!(matches!(
            parse_expr("-x ** 2"),
            Expr::UnaryOp {
                op: UnaryOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn test_negative_literals_fold() {
        assert_eq!(parse_expr("-1"), Expr::Const(Constant::Int(-1)));
        match parse_expr("-0.0") {
            Expr::Const(Constant::Float(f)) => assert!(f == 0.0 && f.is_sign_negative()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            parse_expr("(1, (-2, 'a'))"),
            Expr::Const(Constant::Tuple(vec![
                Constant::Int(1),
                Constant::Tuple(vec![Constant::Int(-2), Constant::Str("a".into())]),
            ]))
        );
    }

    #[test]
    fn test_comparisons() {
        match parse_expr("a not in {1, 2}") {
            Expr::Compare { op, right, .. } => {
                assert_eq!(op, 7);
                assert!(matches!(*right, Expr::Const(Constant::FrozenSet(_))));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse_expr("a is not b"), Expr::Compare { op: 9, .. }));
        assert!(parse("a < b < c").is_err());
    }

    #[test]
    fn test_calls_and_trailers() {
        match parse_expr("obj.method(1, key=2)[0]") {
            Expr::Subscript { value, .. } => match *value {
                Expr::Call { args, keywords, .. } => {
                    assert_eq!(args.len(), 1);
                    assert_eq!(keywords[0].0, "key");
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("f(a=1, 2)").is_err());
    }

    #[test]
    fn test_compound_statements() {
        let source = "def f(a, b=1):\n  for i in a:\n    if i:\n      break\n    elif b:\n      continue\n    else:\n      pass\n  while b: b -= 1\n  return a, b\n";
        let body = parse(source).unwrap();
        match &body[0].kind {
            StmtKind::FunctionDef(def) => {
                assert_eq!(def.params, vec!["a", "b"]);
                assert_eq!(def.defaults.len(), 1);
                assert_eq!(def.body.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_context_errors() {
        assert!(parse("return 1").is_err());
        assert!(parse("break").is_err());
        assert!(parse("def f():\n  while x:\n    def g():\n      break\n").is_err());
        assert!(parse("nonlocal x").is_err());
        assert!(parse("def f():\n  from m import *\n").is_err());
        assert!(parse("1 = x").is_err());
        assert!(parse("f() += 1").is_err());
        assert!(parse("def f(a=1, b):\n  pass\n").is_err());
    }

    #[test]
    fn test_imports() {
        let body = parse("import a.b as c, d\nfrom ..pkg import (x, y as z)\nfrom m import *").unwrap();
        assert!(matches!(&body[0].kind, StmtKind::Import(aliases) if aliases.len() == 2));
        match &body[1].kind {
            StmtKind::ImportFrom { module, level, names } => {
                assert_eq!(module, "pkg");
                assert_eq!(*level, 2);
                assert_eq!(names[1].asname.as_deref(), Some("z"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&body[2].kind, StmtKind::ImportFrom { names, .. } if names.is_empty()));
    }

    #[test]
    fn test_multiple_targets_and_unpacking() {
        match &parse("a = b, c = 1, 2").unwrap()[0].kind {
            StmtKind::Assign { targets, value } => {
                assert_eq!(targets.len(), 2);
                assert!(matches!(&targets[1], Expr::Tuple(items) if items.len() == 2));
                assert!(matches!(value, Expr::Const(Constant::Tuple(_))));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let deep = format!("x = {}1{}", "(".repeat(1000), ")".repeat(1000));
        let err = parse(&deep).unwrap_err();
        assert_eq!(err.message, "too many nested parentheses");

        let chain = format!("x = 1{}", " + 1".repeat(5000));
        assert!(parse(&chain).is_err());
        let attributes = format!("x = a{}", ".b".repeat(5000));
        assert!(parse(&attributes).is_err());
        let negations = format!("x = {}1", "not ".repeat(5000));
        assert!(parse(&negations).is_err());

        let mut blocks = String::new();
        for level in 0..150 {
            blocks.push_str(&format!("{}if x:\n", " ".repeat(level)));
        }
        blocks.push_str(&format!("{}pass\n", " ".repeat(150)));
        let err = parse(&blocks).unwrap_err();
        assert_eq!(err.message, "too many statically nested blocks");
    }

    #[test]
    fn test_moderate_nesting_parses() {
        let nested = format!("x = {}1{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(parse(&nested).unwrap().len(), 1);
        let chain = format!("x = 1{}", " + 1".repeat(40));
        assert_eq!(parse(&chain).unwrap().len(), 1);
        let mut elifs = "if a:\n  pass\n".to_string();
        for _ in 0..30 {
            elifs.push_str("elif a:\n  pass\n");
        }
        assert_eq!(parse(&elifs).unwrap().len(), 1);
    }
}
