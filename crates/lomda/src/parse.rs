//! The surface parser: a deterministic, tokenless recursive descent with the
//! PEMDAS precedence ladder (parentheses, exponent, unary, mul/div/mod,
//! add/sub, comparison, boolean, assignment, tuple).
//!
//! Comments run from `#` to end of line. Statements are separated by `;`;
//! `let`, `import`, `from` and `type` consume the rest of the sequence as
//! their body.

use crate::{
    ast::{AdtVariant, BinOp, CmpOp, Expr, LetBinding, MathFn, SwitchArm, TupleSide},
    error::{LomdaError, RunResult},
    types::Type,
};

/// Words that can never be variables.
const KEYWORDS: &[&str] = &[
    "if", "then", "else", "while", "do", "for", "in", "let", "import", "from", "as", "type", "switch", "fold",
    "map", "into", "over", "left", "right", "of", "true", "false", "void", "input", "lambda", "thunk", "print",
    "insert", "remove", "at", "and", "or", "not", "mod", "isa", "equals", "is", "sin", "cos", "tan", "asin",
    "acos", "atan", "sinh", "cosh", "tanh", "log", "sqrt", "exp", "max", "min",
];

/// Parses a whole program into a single expression.
pub(crate) fn parse_program(src: &str) -> RunResult<Expr> {
    let mut p = Parser { src, pos: 0 };
    let program = p.parse_sequence()?;
    p.skip_ws();
    if !p.at_end() {
        return Err(p.error("unexpected trailing input"));
    }
    Ok(program)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> LomdaError {
        let rest: String = self.src[self.pos..].chars().take(24).collect();
        LomdaError::parser(format!("{msg}; see:\n\t{rest}"))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let bytes = self.src.as_bytes();
        let mut in_comment = false;
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            if in_comment {
                if b == b'\n' {
                    in_comment = false;
                }
                self.pos += 1;
            } else if b == b'#' {
                in_comment = true;
                self.pos += 1;
            } else if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    /// Consumes the literal symbol if present (after whitespace).
    fn eat_sym(&mut self, sym: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(sym) {
            self.pos += sym.len();
            true
        } else {
            false
        }
    }

    fn peek_sym(&mut self, sym: &str) -> bool {
        self.skip_ws();
        self.rest().starts_with(sym)
    }

    /// Consumes the keyword if present with a word boundary after it.
    fn eat_keyword(&mut self, kw: &str) -> bool {
        self.skip_ws();
        let rest = self.rest();
        if rest.starts_with(kw) {
            let after = rest.as_bytes().get(kw.len()).copied();
            if !after.is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_') {
                self.pos += kw.len();
                return true;
            }
        }
        false
    }

    fn peek_keyword(&mut self, kw: &str) -> bool {
        self.skip_ws();
        let rest = self.rest();
        rest.starts_with(kw) && {
            let after = rest.as_bytes().get(kw.len()).copied();
            !after.is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        }
    }

    fn parse_identifier(&mut self) -> RunResult<String> {
        self.skip_ws();
        let bytes = self.src.as_bytes();
        let start = self.pos;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphabetic() || bytes[end] == b'_') {
            end += 1;
        }
        if end == start {
            return Err(self.error("expected an identifier"));
        }
        self.pos = end;
        Ok(self.src[start..end].to_owned())
    }

    fn parse_variable(&mut self) -> RunResult<String> {
        let start = self.pos;
        let id = self.parse_identifier()?;
        if KEYWORDS.contains(&id.as_str()) {
            self.pos = start;
            return Err(self.error("expected an identifier"));
        }
        Ok(id)
    }

    // ---- statements ----

    fn parse_sequence(&mut self) -> RunResult<Expr> {
        self.skip_ws();
        if self.peek_keyword("let") {
            return self.parse_let();
        }
        if self.peek_keyword("import") {
            return self.parse_import();
        }
        if self.peek_keyword("from") {
            return self.parse_from_import();
        }
        if self.peek_keyword("type") {
            return self.parse_adt_decl();
        }
        let first = self.parse_statement()?;
        self.skip_ws();
        if self.eat_sym(";") {
            self.skip_ws();
            if self.at_end() || self.peek() == Some(b'}') {
                return Ok(first);
            }
            let rest = self.parse_sequence()?;
            let mut items = vec![first];
            match rest {
                Expr::Seq(mut tail) => items.append(&mut tail),
                other => items.push(other),
            }
            return Ok(Expr::Seq(items));
        }
        Ok(first)
    }

    fn parse_statement(&mut self) -> RunResult<Expr> {
        if self.eat_keyword("while") {
            let cond = self.parse_inner()?;
            let body = self.parse_body()?;
            return Ok(Expr::While {
                cond: cond.boxed(),
                body: body.boxed(),
                always_enter: false,
            });
        }
        if self.eat_keyword("do") {
            let body = self.parse_body()?;
            if !self.eat_keyword("while") {
                return Err(self.error("expected 'while' to close a do-loop"));
            }
            let cond = self.parse_inner()?;
            return Ok(Expr::While {
                cond: cond.boxed(),
                body: body.boxed(),
                always_enter: true,
            });
        }
        if self.eat_keyword("for") {
            let var = self.parse_variable()?;
            if !self.eat_keyword("in") {
                return Err(self.error("expected 'in' in a for-loop"));
            }
            let iter = self.parse_inner()?;
            let body = self.parse_body()?;
            return Ok(Expr::For {
                var,
                iter: iter.boxed(),
                body: body.boxed(),
            });
        }
        if self.eat_keyword("insert") {
            let elem = self.parse_inner()?;
            if !self.eat_keyword("into") {
                return Err(self.error("expected 'into' in an insert statement"));
            }
            let list = self.parse_inner()?;
            if !self.eat_keyword("at") {
                return Err(self.error("expected 'at' in an insert statement"));
            }
            let index = self.parse_inner()?;
            return Ok(Expr::ListAdd {
                list: list.boxed(),
                index: index.boxed(),
                elem: elem.boxed(),
            });
        }
        if self.eat_keyword("remove") {
            if !self.eat_keyword("from") {
                return Err(self.error("expected 'from' in a remove statement"));
            }
            let list = self.parse_inner()?;
            if !self.eat_keyword("at") {
                return Err(self.error("expected 'at' in a remove statement"));
            }
            let index = self.parse_inner()?;
            return Ok(Expr::ListRemove {
                list: list.boxed(),
                index: index.boxed(),
            });
        }
        if self.eat_keyword("print") {
            let mut args = vec![self.parse_inner()?];
            while self.eat_sym(",") {
                args.push(self.parse_inner()?);
            }
            return Ok(Expr::Print(args));
        }
        self.parse_expr()
    }

    /// A code body: `{ program }` or a single expression.
    fn parse_body(&mut self) -> RunResult<Expr> {
        self.skip_ws();
        if self.eat_sym("{") {
            let body = self.parse_sequence()?;
            if !self.eat_sym("}") {
                return Err(self.error("expected '}' to close a block"));
            }
            return Ok(body);
        }
        self.parse_inner()
    }

    fn parse_let(&mut self) -> RunResult<Expr> {
        assert!(self.eat_keyword("let"), "caller checked the keyword");
        let mut bindings = Vec::new();
        loop {
            let name = self.parse_variable()?;
            self.skip_ws();
            // A parenthesized parameter list marks the recursive lambda sugar.
            if self.peek() == Some(b'(') {
                self.eat_sym("(");
                let mut params = Vec::new();
                self.skip_ws();
                if self.peek() != Some(b')') {
                    loop {
                        params.push(self.parse_variable()?);
                        if !self.eat_sym(",") {
                            break;
                        }
                    }
                }
                if !self.eat_sym(")") {
                    return Err(self.error("expected ')' to close a parameter list"));
                }
                if !self.eat_sym("=") {
                    return Err(self.error("expected '=' in a let binding"));
                }
                let body = self.parse_no_assign()?;
                bindings.push(LetBinding {
                    name,
                    expr: Expr::Lambda(params, body.boxed()),
                    rec: true,
                });
            } else {
                if !self.eat_sym("=") {
                    return Err(self.error("expected '=' in a let binding"));
                }
                let expr = self.parse_no_assign()?;
                bindings.push(LetBinding {
                    name,
                    expr,
                    rec: false,
                });
            }
            if self.eat_sym(",") {
                continue;
            }
            break;
        }
        if !self.eat_sym(";") {
            return Err(self.error("let statement must be followed by a valid sequence"));
        }
        let body = self.parse_sequence()?;
        Ok(Expr::Let {
            bindings,
            body: body.boxed(),
        })
    }

    fn parse_import(&mut self) -> RunResult<Expr> {
        assert!(self.eat_keyword("import"), "caller checked the keyword");
        let mut imports = Vec::new();
        loop {
            let module = self.parse_variable()?;
            let name = if self.eat_keyword("as") {
                self.parse_variable()?
            } else {
                module.clone()
            };
            imports.push((module, name));
            if self.eat_sym(",") {
                continue;
            }
            break;
        }
        if !self.eat_sym(";") {
            return Err(self.error("import statement must be followed by a valid sequence"));
        }
        let mut body = self.parse_sequence()?;
        for (module, name) in imports.into_iter().rev() {
            body = Expr::Import {
                module,
                name,
                body: body.boxed(),
            };
        }
        Ok(body)
    }

    fn parse_from_import(&mut self) -> RunResult<Expr> {
        assert!(self.eat_keyword("from"), "caller checked the keyword");
        let module = self.parse_variable()?;
        if !self.eat_keyword("import") {
            return Err(self.error("expected 'import' in a from-import statement"));
        }
        let mut names = vec![self.parse_variable()?];
        while self.eat_sym(",") {
            names.push(self.parse_variable()?);
        }
        if !self.eat_sym(";") {
            return Err(self.error("import statement must be followed by a valid sequence"));
        }
        let body = self.parse_sequence()?;
        Ok(Expr::FromImport {
            module,
            names,
            body: body.boxed(),
        })
    }

    fn parse_adt_decl(&mut self) -> RunResult<Expr> {
        assert!(self.eat_keyword("type"), "caller checked the keyword");
        let name = self.parse_variable()?;
        if !self.eat_sym("=") {
            return Err(self.error("expected '=' in a type declaration"));
        }
        let mut variants = Vec::new();
        loop {
            let kind = self.parse_variable()?;
            let mut field_types = Vec::new();
            if self.eat_sym("(") {
                self.skip_ws();
                if self.peek() != Some(b')') {
                    loop {
                        field_types.push(self.parse_type()?);
                        if !self.eat_sym(",") {
                            break;
                        }
                    }
                }
                if !self.eat_sym(")") {
                    return Err(self.error("expected ')' to close constructor fields"));
                }
            }
            variants.push(AdtVariant { kind, field_types });
            if self.eat_sym("|") {
                continue;
            }
            break;
        }
        if !self.eat_sym(";") {
            return Err(self.error("type declaration must be followed by a valid sequence"));
        }
        let body = self.parse_sequence()?;
        Ok(Expr::AdtDecl {
            name,
            variants,
            body: body.boxed(),
        })
    }

    fn parse_type(&mut self) -> RunResult<Type> {
        self.skip_ws();
        if self.eat_sym("[") {
            let inner = self.parse_type()?;
            if !self.eat_sym("]") {
                return Err(self.error("expected ']' in a list type"));
            }
            return Ok(Type::List(inner.boxed()));
        }
        if self.eat_sym("(") {
            let left = self.parse_type()?;
            if self.eat_sym("*") {
                let right = self.parse_type()?;
                if !self.eat_sym(")") {
                    return Err(self.error("expected ')' in a tuple type"));
                }
                return Ok(Type::Tuple(left.boxed(), right.boxed()));
            }
            if !self.eat_sym(")") {
                return Err(self.error("expected ')' in a type"));
            }
            return Ok(left);
        }
        let name = self.parse_identifier()?;
        match name.as_str() {
            "int" | "Z" => Ok(Type::Int),
            "real" | "R" => Ok(Type::Real),
            "string" | "S" => Ok(Type::Str),
            "bool" | "boolean" | "B" => Ok(Type::Bool),
            "void" => Ok(Type::Void),
            other => Ok(Type::Adt(other.to_owned())),
        }
    }

    // ---- the precedence ladder ----

    /// Full expression: the tuple level (loosest).
    fn parse_expr(&mut self) -> RunResult<Expr> {
        let left = self.parse_inner()?;
        self.skip_ws();
        if self.peek() == Some(b',') {
            self.eat_sym(",");
            let right = self.parse_expr()?;
            return Ok(Expr::Tuple(left.boxed(), right.boxed()));
        }
        Ok(left)
    }

    /// Assignment level: everything below the tuple comma.
    fn parse_inner(&mut self) -> RunResult<Expr> {
        let left = self.parse_or()?;
        self.skip_ws();
        if self.peek() == Some(b'=') && !self.rest().starts_with("==") {
            self.eat_sym("=");
            let right = self.parse_inner()?;
            return Ok(Expr::Assign(left.boxed(), right.boxed()));
        }
        Ok(left)
    }

    /// Expression with assignment excluded; used where `=` belongs to the
    /// surrounding construct (let binders).
    fn parse_no_assign(&mut self) -> RunResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(left.boxed(), right.boxed());
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat_keyword("and") {
            let right = self.parse_equality()?;
            left = Expr::And(left.boxed(), right.boxed());
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.eat_sym("==") {
                CmpOp::Eq
            } else if self.eat_sym("!=") {
                CmpOp::Neq
            } else if self.eat_keyword("equals") {
                CmpOp::Eq
            } else if self.peek_keyword("is") {
                self.eat_keyword("is");
                if self.eat_keyword("not") {
                    CmpOp::Neq
                } else {
                    CmpOp::Eq
                }
            } else {
                return Ok(left);
            };
            let right = self.parse_comparison()?;
            left = Expr::Compare(op, left.boxed(), right.boxed());
        }
    }

    fn parse_comparison(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.eat_sym(">=") {
                CmpOp::Geq
            } else if self.eat_sym("<=") {
                CmpOp::Leq
            } else if self.eat_sym(">") {
                CmpOp::Gt
            } else if self.eat_sym("<") {
                CmpOp::Lt
            } else {
                return Ok(left);
            };
            let right = self.parse_additive()?;
            left = Expr::Compare(op, left.boxed(), right.boxed());
        }
    }

    fn parse_additive(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_sym("+") {
                BinOp::Add
            } else if self.peek_sym("-") && !self.peek_sym("->") {
                self.eat_sym("-");
                BinOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, left.boxed(), right.boxed());
        }
    }

    fn parse_multiplicative(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_membership()?;
        loop {
            let op = if self.eat_sym("*") {
                BinOp::Mul
            } else if self.eat_sym("/") {
                BinOp::Div
            } else if self.eat_keyword("mod") {
                BinOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.parse_membership()?;
            left = Expr::Binary(op, left.boxed(), right.boxed());
        }
    }

    fn parse_membership(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            if self.eat_keyword("in") {
                let right = self.parse_unary()?;
                left = Expr::Has(left.boxed(), right.boxed());
            } else if self.eat_keyword("isa") {
                let shape = self.parse_identifier()?;
                left = Expr::Isa(left.boxed(), shape);
            } else if self.eat_keyword("as") {
                let target = self.parse_identifier()?;
                left = Expr::Cast(left.boxed(), target);
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_unary(&mut self) -> RunResult<Expr> {
        self.skip_ws();
        if self.eat_keyword("not") {
            let operand = self.parse_unary()?;
            return Ok(Expr::Not(operand.boxed()));
        }
        if self.peek() == Some(b'-') && !self.rest().starts_with("->") {
            self.eat_sym("-");
            let operand = self.parse_unary()?;
            return Ok(Expr::Binary(BinOp::Mul, Expr::Int(-1).boxed(), operand.boxed()));
        }
        if self.eat_keyword("fold") {
            let list = self.parse_no_assign()?;
            if !self.eat_keyword("into") {
                return Err(self.error("expected 'into' in a fold expression"));
            }
            let func = self.parse_body()?;
            if !self.eat_keyword("from") {
                return Err(self.error("expected 'from' in a fold expression"));
            }
            let base = self.parse_body()?;
            return Ok(Expr::Fold {
                list: list.boxed(),
                func: func.boxed(),
                base: base.boxed(),
            });
        }
        if self.eat_keyword("map") {
            let func = self.parse_no_assign()?;
            if !self.eat_keyword("over") {
                return Err(self.error("expected 'over' in a map expression"));
            }
            let list = self.parse_no_assign()?;
            return Ok(Expr::Map {
                func: func.boxed(),
                list: list.boxed(),
            });
        }
        if self.peek_keyword("left") {
            self.eat_keyword("left");
            if !self.eat_keyword("of") {
                return Err(self.error("expected 'of' after 'left'"));
            }
            let operand = self.parse_unary()?;
            return Ok(Expr::TupleAccess(operand.boxed(), TupleSide::Left));
        }
        if self.peek_keyword("right") {
            self.eat_keyword("right");
            if !self.eat_keyword("of") {
                return Err(self.error("expected 'of' after 'right'"));
            }
            let operand = self.parse_unary()?;
            return Ok(Expr::TupleAccess(operand.boxed(), TupleSide::Right));
        }
        if self.eat_keyword("if") {
            let cond = self.parse_inner()?;
            if !self.eat_keyword("then") {
                return Err(self.error("expected 'then' in a conditional"));
            }
            let then_exp = self.parse_body()?;
            if !self.eat_keyword("else") {
                return Err(self.error("expected 'else' in a conditional"));
            }
            let else_exp = self.parse_body()?;
            return Ok(Expr::If(cond.boxed(), then_exp.boxed(), else_exp.boxed()));
        }
        if self.eat_keyword("switch") {
            return self.parse_switch();
        }
        if self.eat_keyword("thunk") {
            let operand = self.parse_unary()?;
            return Ok(Expr::Thunk(operand.boxed()));
        }
        for fun in [
            MathFn::Asin,
            MathFn::Acos,
            MathFn::Atan,
            MathFn::Sinh,
            MathFn::Cosh,
            MathFn::Tanh,
            MathFn::Sin,
            MathFn::Cos,
            MathFn::Tan,
            MathFn::Log,
            MathFn::Sqrt,
            MathFn::Exp,
            MathFn::Max,
            MathFn::Min,
        ] {
            let name: &'static str = fun.into();
            if self.eat_keyword(name) {
                let operand = self.parse_postfix()?;
                return Ok(Expr::MathFn(fun, operand.boxed()));
            }
        }
        self.parse_power()
    }

    fn parse_switch(&mut self) -> RunResult<Expr> {
        let scrutinee = self.parse_postfix()?;
        if !self.eat_keyword("in") {
            return Err(self.error("expected 'in' in a switch expression"));
        }
        let mut arms = Vec::new();
        loop {
            let kind = self.parse_variable()?;
            let mut params = Vec::new();
            if self.eat_sym("(") {
                self.skip_ws();
                if self.peek() != Some(b')') {
                    loop {
                        params.push(self.parse_variable()?);
                        if !self.eat_sym(",") {
                            break;
                        }
                    }
                }
                if !self.eat_sym(")") {
                    return Err(self.error("expected ')' to close switch bindings"));
                }
            }
            if !self.eat_sym("->") {
                return Err(self.error("expected '->' in a switch arm"));
            }
            let body = self.parse_body()?;
            arms.push(SwitchArm { kind, params, body });
            if self.eat_sym("|") {
                continue;
            }
            break;
        }
        Ok(Expr::Switch {
            scrutinee: scrutinee.boxed(),
            arms,
        })
    }

    fn parse_power(&mut self) -> RunResult<Expr> {
        let base = self.parse_postfix()?;
        if self.eat_sym("^") {
            // Right-associative.
            let exponent = self.parse_power()?;
            return Ok(Expr::Binary(BinOp::Pow, base.boxed(), exponent.boxed()));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> RunResult<Expr> {
        self.skip_ws();
        // `d/dx f(3)` groups as `(d/dx f)(3)`: the differentiated function,
        // applied. The operand is a primary; postfix forms bind outside.
        let mut base = if self.rest().starts_with("d/d") {
            self.pos += 3;
            let var = self.parse_variable()?;
            let operand = self.parse_primary()?;
            Expr::Derivative(operand.boxed(), var)
        } else {
            self.parse_primary()?
        };
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'(') => {
                    self.eat_sym("(");
                    let mut args = Vec::new();
                    self.skip_ws();
                    if self.peek() != Some(b')') {
                        loop {
                            args.push(self.parse_inner()?);
                            if !self.eat_sym(",") {
                                break;
                            }
                        }
                    }
                    if !self.eat_sym(")") {
                        return Err(self.error("expected ')' to close an argument list"));
                    }
                    base = Expr::Apply(base.boxed(), args);
                }
                Some(b'[') => {
                    self.eat_sym("[");
                    self.skip_ws();
                    let from = if self.peek() == Some(b':') {
                        None
                    } else {
                        Some(self.parse_inner()?)
                    };
                    if self.eat_sym(":") {
                        self.skip_ws();
                        let to = if self.peek() == Some(b']') {
                            None
                        } else {
                            Some(self.parse_inner()?)
                        };
                        if !self.eat_sym("]") {
                            return Err(self.error("expected ']' to close a slice"));
                        }
                        base = Expr::ListSlice(base.boxed(), from.map(Expr::boxed), to.map(Expr::boxed));
                    } else {
                        if !self.eat_sym("]") {
                            return Err(self.error("expected ']' to close an index"));
                        }
                        let Some(index) = from else {
                            return Err(self.error("expected an index expression"));
                        };
                        base = Expr::ListAccess(base.boxed(), index.boxed());
                    }
                }
                Some(b'.') => {
                    // Disambiguate from a real literal like `1.5`.
                    if matches!(base, Expr::Int(_) | Expr::Real(_)) {
                        return Ok(base);
                    }
                    self.eat_sym(".");
                    let key = self.parse_identifier()?;
                    base = Expr::DictAccess(base.boxed(), key);
                }
                _ => return Ok(base),
            }
        }
    }

    fn parse_primary(&mut self) -> RunResult<Expr> {
        self.skip_ws();
        let Some(b) = self.peek() else {
            return Err(self.error("unexpected end of input"));
        };
        if b.is_ascii_digit() {
            return self.parse_number();
        }
        if b == b'"' {
            return self.parse_string();
        }
        if b == b'(' {
            self.eat_sym("(");
            let inner = self.parse_expr()?;
            if !self.eat_sym(")") {
                return Err(self.error("expected ')'"));
            }
            return Ok(inner);
        }
        if b == b'[' {
            self.eat_sym("[");
            let mut items = Vec::new();
            self.skip_ws();
            if self.peek() != Some(b']') {
                loop {
                    items.push(self.parse_inner()?);
                    if !self.eat_sym(",") {
                        break;
                    }
                }
            }
            if !self.eat_sym("]") {
                return Err(self.error("expected ']' to close a list"));
            }
            return Ok(Expr::List(items));
        }
        if b == b'{' {
            self.eat_sym("{");
            let mut entries = Vec::new();
            self.skip_ws();
            if self.peek() != Some(b'}') {
                loop {
                    let key = self.parse_identifier()?;
                    if !self.eat_sym(":") {
                        return Err(self.error("expected ':' in a dictionary entry"));
                    }
                    let value = self.parse_inner()?;
                    entries.push((key, value));
                    if !self.eat_sym(",") {
                        break;
                    }
                }
            }
            if !self.eat_sym("}") {
                return Err(self.error("expected '}' to close a dictionary"));
            }
            return Ok(Expr::Dict(entries));
        }
        if self.rest().starts_with("||") {
            self.pos += 2;
            let inner = self.parse_inner()?;
            if !self.eat_sym("||") {
                return Err(self.error("expected '||' to close a norm"));
            }
            return Ok(Expr::Norm(inner.boxed()));
        }
        if b == b'|' {
            self.eat_sym("|");
            let inner = self.parse_inner()?;
            if !self.eat_sym("|") {
                return Err(self.error("expected '|' to close a magnitude"));
            }
            return Ok(Expr::Magnitude(inner.boxed()));
        }
        if self.eat_keyword("true") {
            return Ok(Expr::True);
        }
        if self.eat_keyword("false") {
            return Ok(Expr::False);
        }
        if self.eat_keyword("void") {
            return Ok(Expr::Void);
        }
        if self.eat_keyword("input") {
            return Ok(Expr::Input);
        }
        if self.eat_keyword("lambda") {
            if !self.eat_sym("(") {
                return Err(self.error("expected '(' after 'lambda'"));
            }
            let mut params = Vec::new();
            self.skip_ws();
            if self.peek() != Some(b')') {
                loop {
                    params.push(self.parse_variable()?);
                    if !self.eat_sym(",") {
                        break;
                    }
                }
            }
            if !self.eat_sym(")") {
                return Err(self.error("expected ')' to close a parameter list"));
            }
            let body = self.parse_body()?;
            return Ok(Expr::Lambda(params, body.boxed()));
        }
        let start = self.pos;
        if let Ok(id) = self.parse_identifier() {
            if KEYWORDS.contains(&id.as_str()) {
                self.pos = start;
                return Err(self.error("unexpected keyword"));
            }
            return Ok(Expr::Var(id));
        }
        Err(self.error("unrecognized expression"))
    }

    fn parse_number(&mut self) -> RunResult<Expr> {
        let bytes = self.src.as_bytes();
        let start = self.pos;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let mut is_real = false;
        if end < bytes.len() && bytes[end] == b'.' && bytes.get(end + 1).is_some_and(u8::is_ascii_digit) {
            is_real = true;
            end += 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
        let text = &self.src[start..end];
        self.pos = end;
        if is_real {
            text.parse::<f64>()
                .map(Expr::Real)
                .map_err(|_| self.error("malformed real literal"))
        } else {
            text.parse::<i64>()
                .map(Expr::Int)
                .map_err(|_| self.error("integer literal is out of range"))
        }
    }

    fn parse_string(&mut self) -> RunResult<Expr> {
        let bytes = self.src.as_bytes();
        debug_assert_eq!(bytes[self.pos], b'"');
        let mut out = String::new();
        let mut i = self.pos + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'"' => {
                    self.pos = i + 1;
                    return Ok(Expr::Str(out));
                }
                b'\\' => {
                    let escaped = bytes.get(i + 1).copied();
                    match escaped {
                        Some(b'"') => out.push('"'),
                        Some(b'\\') => out.push('\\'),
                        Some(b'n') => out.push('\n'),
                        Some(b't') => out.push('\t'),
                        _ => return Err(self.error("unrecognized escape sequence")),
                    }
                    i += 2;
                }
                _ => {
                    // Copy a full UTF-8 scalar.
                    let ch_len = utf8_len(bytes[i]);
                    out.push_str(&self.src[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
        Err(self.error("unterminated string literal"))
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parses(src: &str) -> Expr {
        parse_program(src).expect("program parses")
    }

    #[test]
    fn pemdas_orders_product_over_sum() {
        assert_eq!(parses("1 + 2 * 3").to_string(), "1 + 2 * 3");
        assert_eq!(parses("(1 + 2) * 3").to_string(), "1 + 2 * 3");
        assert!(matches!(parses("1 + 2 * 3"), Expr::Binary(BinOp::Add, ..)));
        assert!(matches!(parses("(1 + 2) * 3"), Expr::Binary(BinOp::Mul, ..)));
    }

    #[test]
    fn exponent_is_right_associative() {
        let e = parses("2 ^ 3 ^ 2");
        let Expr::Binary(BinOp::Pow, _, r) = e else {
            panic!("expected a power")
        };
        assert!(matches!(*r, Expr::Binary(BinOp::Pow, ..)));
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let e = parses("-x ^ 2");
        // -(x^2): multiplication by -1 wrapping the power.
        let Expr::Binary(BinOp::Mul, l, r) = e else {
            panic!("expected a negation product")
        };
        assert_eq!(*l, Expr::Int(-1));
        assert!(matches!(*r, Expr::Binary(BinOp::Pow, ..)));
    }

    #[test]
    fn let_with_recursive_sugar() {
        let e = parses("let f(x) = x * 2; f(4)");
        let Expr::Let { bindings, .. } = e else { panic!("expected let") };
        assert!(bindings[0].rec);
        assert!(matches!(bindings[0].expr, Expr::Lambda(..)));
    }

    #[test]
    fn derivative_takes_a_primary_operand() {
        // d/dx (x*x) differentiates the product.
        assert!(matches!(parses("d/dx (x * x)"), Expr::Derivative(..)));
        // d/dx f(3) is the differentiated function applied at 3.
        let e = parses("d/dx f(3)");
        let Expr::Apply(op, args) = e else { panic!("expected an application") };
        assert!(matches!(*op, Expr::Derivative(..)));
        assert_eq!(args.len(), 1);
        // Without parentheses the derivative binds only the next primary.
        let e = parses("d/dx x * x");
        assert!(matches!(e, Expr::Binary(BinOp::Mul, ..)));
    }

    #[test]
    fn comments_are_ignored() {
        assert_eq!(parses("1 + # comment\n 2").to_string(), "1 + 2");
    }

    #[test]
    fn hash_inside_string_is_not_a_comment() {
        let e = parses("\"a # b\"");
        assert_eq!(e, Expr::Str("a # b".into()));
    }

    #[test]
    fn statements_sequence_on_semicolons() {
        let e = parses("print 1; print 2; 3");
        let Expr::Seq(items) = e else { panic!("expected sequence") };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn slice_endpoints_are_optional() {
        assert!(matches!(parses("xs[1:2]"), Expr::ListSlice(..)));
        assert!(matches!(parses("xs[:2]"), Expr::ListSlice(_, None, Some(_))));
        assert!(matches!(parses("xs[1:]"), Expr::ListSlice(_, Some(_), None)));
        assert!(matches!(parses("xs[:]"), Expr::ListSlice(_, None, None)));
    }

    #[test]
    fn fold_and_map_forms() {
        assert!(matches!(
            parses("fold [1,2] into lambda (a, b) a + b from 0"),
            Expr::Fold { .. }
        ));
        assert!(matches!(parses("map lambda (x) x over [1]"), Expr::Map { .. }));
    }

    #[test]
    fn switch_arms_split_on_pipes() {
        let e = parses("type T = A(int) | B; switch A(1) in A(n) -> n | B() -> 0");
        let Expr::AdtDecl { variants, body, .. } = e else {
            panic!("expected a type declaration")
        };
        assert_eq!(variants.len(), 2);
        assert!(matches!(*body, Expr::Switch { .. }));
    }

    #[test]
    fn magnitude_and_norm() {
        assert!(matches!(parses("|x|"), Expr::Magnitude(_)));
        assert!(matches!(parses("||x||"), Expr::Norm(_)));
    }

    #[test]
    fn keywords_are_not_variables() {
        assert!(parse_program("let then = 1; then").is_err());
    }

    #[test]
    fn unterminated_string_is_a_parser_error() {
        let err = parse_program("\"abc").unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Parser);
    }

    #[test]
    fn tuples_nest_to_the_right() {
        let e = parses("(1, 2, 3)");
        let Expr::Tuple(_, r) = e else { panic!("expected tuple") };
        assert!(matches!(*r, Expr::Tuple(..)));
    }
}
