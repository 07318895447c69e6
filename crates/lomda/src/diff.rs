//! Numeric differentiation: evaluates `∂e/∂x` at the point described by a
//! value environment, using a parallel derivative environment for the seed
//! derivatives of bound names.

use crate::{
    ast::{BinOp, Expr, MathFn, TupleSide},
    env,
    error::{debug, LomdaError, RunResult},
    eval::Interp,
    heap::{HeapData, HeapId, Lambda},
    ops, symb,
    value::Value,
};

fn calc_err(exp: &Expr) -> LomdaError {
    LomdaError::calculus(format!("expression '{exp}' is non-differentiable"))
}

impl Interp<'_> {
    /// Evaluates `d/dx e`: mirrors the current environment into a derivative
    /// environment (lambdas become symbolically differentiated lambdas, other
    /// bindings become constant seeds, with identity-diagonal seeding when the
    /// differentiation variable is itself a container), then runs the numeric
    /// derivative pass.
    pub(crate) fn eval_derivative(&mut self, func: &Expr, var: &str, env_id: HeapId) -> RunResult<Value> {
        if !func.is_differentiable() {
            return Err(LomdaError::runtime(format!(
                "expression '{func}' is non-differentiable"
            )));
        }

        let mut denv = env::empty(&mut self.heap);
        let frames = env::chain(&self.heap, env_id);
        for frame_id in frames.into_iter().rev() {
            let bindings: Vec<(String, Value)> = match self.heap.get(frame_id) {
                HeapData::Frame(f) => f.store.iter().map(|(n, v)| (n.clone(), v.borrow_copy())).collect(),
                _ => unreachable!("environment chain holds frames"),
            };
            for (name, v) in bindings {
                let entry = if let Value::Ref(id) = &v
                    && let HeapData::Lambda(lambda) = self.heap.get(*id)
                {
                    // d/dx lambda (y) f(y) = lambda (y) d/dx f(y)
                    let params = lambda.params.clone();
                    let body = Expr::Derivative(lambda.body.clone().boxed(), var.to_owned());
                    let captured = lambda.env;
                    let captured = captured.map(|e| env::clone_chain(&mut self.heap, e));
                    Some(Value::Ref(self.heap.allocate(HeapData::Lambda(Lambda {
                        params,
                        body,
                        env: captured,
                    }))))
                } else {
                    let c = i64::from(name == var);
                    self.derive_seed(var, &v, &v, c)
                };
                // Non-differentiable bindings simply have no seed.
                if let Some(entry) = entry {
                    let next = env::extend(&mut self.heap, denv, name, entry);
                    self.heap.dec_ref(denv);
                    denv = next;
                }
            }
        }

        let result = self.derivative_of(func, var, env_id, denv);
        self.heap.dec_ref(denv);
        result
    }

    /// A constant's derivative: the structure of `v` with `c` at every
    /// numeric leaf. Lambdas differentiate into lambdas; booleans, strings
    /// and other opaque shapes have no derivative (`None`).
    pub(crate) fn derive_const(&mut self, x: &str, v: &Value, c: i64) -> Option<Value> {
        match v {
            Value::Int(_) | Value::Real(_) => Some(Value::Int(c)),
            Value::Bool(_) | Value::Void => None,
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Str(_) => None,
                    HeapData::List(items) => {
                        let items: Vec<Value> = items.iter().map(Value::borrow_copy).collect();
                        let mut out = Vec::with_capacity(items.len());
                        for item in &items {
                            match self.derive_const(x, item, c) {
                                Some(d) => out.push(d),
                                None => {
                                    for d in out {
                                        d.drop_with_heap(&mut self.heap);
                                    }
                                    return None;
                                }
                            }
                        }
                        Some(Value::Ref(self.heap.allocate(HeapData::List(out))))
                    }
                    HeapData::Dict(entries) => {
                        let entries: Vec<(String, Value)> =
                            entries.iter().map(|(k, v)| (k.clone(), v.borrow_copy())).collect();
                        let mut out = indexmap::IndexMap::new();
                        for (k, item) in &entries {
                            match self.derive_const(x, item, c) {
                                Some(d) => {
                                    out.insert(k.clone(), d);
                                }
                                None => {
                                    for (_, d) in out {
                                        d.drop_with_heap(&mut self.heap);
                                    }
                                    return None;
                                }
                            }
                        }
                        Some(Value::Ref(self.heap.allocate(HeapData::Dict(out))))
                    }
                    HeapData::Tuple(l, r) => {
                        let (l, r) = (l.borrow_copy(), r.borrow_copy());
                        let dl = self.derive_const(x, &l, c)?;
                        let Some(dr) = self.derive_const(x, &r, c) else {
                            dl.drop_with_heap(&mut self.heap);
                            return None;
                        };
                        Some(Value::Ref(self.heap.allocate(HeapData::Tuple(dl, dr))))
                    }
                    HeapData::Lambda(lambda) => {
                        let params = lambda.params.clone();
                        let body = Expr::Derivative(lambda.body.clone().boxed(), x.to_owned());
                        let captured = lambda.env;
                        let captured = captured.map(|e| env::clone_chain(&mut self.heap, e));
                        Some(Value::Ref(self.heap.allocate(HeapData::Lambda(Lambda {
                            params,
                            body,
                            env: captured,
                        }))))
                    }
                    _ => None,
                }
            }
        }
    }

    /// The seed `dy/dx ≈ c`: for every leaf position of `xv`, the structure
    /// of `y` zero-filled; the identity post-pass then raises the matched
    /// diagonal to 1 when `c` is 1.
    fn derive_seed(&mut self, x: &str, y: &Value, xv: &Value, c: i64) -> Option<Value> {
        let result = match xv {
            Value::Int(_) | Value::Real(_) => return self.derive_const(x, y, c),
            Value::Bool(_) | Value::Void => return None,
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Str(_) => return None,
                    HeapData::List(items) => {
                        let items: Vec<Value> = items.iter().map(Value::borrow_copy).collect();
                        let mut out = Vec::with_capacity(items.len());
                        for item in &items {
                            match self.derive_seed(x, y, item, 0) {
                                Some(d) => out.push(d),
                                None => {
                                    for d in out {
                                        d.drop_with_heap(&mut self.heap);
                                    }
                                    return None;
                                }
                            }
                        }
                        Value::Ref(self.heap.allocate(HeapData::List(out)))
                    }
                    HeapData::Dict(entries) => {
                        let entries: Vec<(String, Value)> =
                            entries.iter().map(|(k, v)| (k.clone(), v.borrow_copy())).collect();
                        let mut out = indexmap::IndexMap::new();
                        for (k, item) in &entries {
                            match self.derive_seed(x, y, item, 0) {
                                Some(d) => {
                                    out.insert(k.clone(), d);
                                }
                                None => {
                                    for (_, d) in out {
                                        d.drop_with_heap(&mut self.heap);
                                    }
                                    return None;
                                }
                            }
                        }
                        Value::Ref(self.heap.allocate(HeapData::Dict(out)))
                    }
                    HeapData::Tuple(l, r) => {
                        let (l, r) = (l.borrow_copy(), r.borrow_copy());
                        let dl = self.derive_seed(x, y, &l, 0)?;
                        let Some(dr) = self.derive_seed(x, y, &r, 0) else {
                            dl.drop_with_heap(&mut self.heap);
                            return None;
                        };
                        Value::Ref(self.heap.allocate(HeapData::Tuple(dl, dr)))
                    }
                    _ => return None,
                }
            }
        };
        if c == 1 {
            self.resolve_identity(&result, &mut Vec::new());
        }
        Some(result)
    }

    /// Walks matched-index paths: an even-length path whose first half equals
    /// its second half lies on the diagonal, and its leaf becomes 1.
    fn resolve_identity(&mut self, v: &Value, path: &mut Vec<usize>) {
        let Value::Ref(id) = v else {
            return;
        };
        let id = *id;
        let children: Vec<Value> = match self.heap.get(id) {
            HeapData::List(items) => items.iter().map(Value::borrow_copy).collect(),
            HeapData::Dict(entries) => entries.values().map(Value::borrow_copy).collect(),
            HeapData::Tuple(l, r) => vec![l.borrow_copy(), r.borrow_copy()],
            _ => return,
        };
        for (i, child) in children.iter().enumerate() {
            path.push(i);
            match child {
                Value::Int(_) | Value::Real(_) => {
                    let n = path.len();
                    if n % 2 == 0 && path[..n / 2] == path[n / 2..] {
                        let one = match child {
                            Value::Real(_) => Value::Real(1.0),
                            _ => Value::Int(1),
                        };
                        set_child(&mut self.heap, id, i, one);
                    }
                }
                Value::Ref(_) => self.resolve_identity(child, path),
                _ => {}
            }
            path.pop();
        }
    }

    /// Computes `∂exp/∂x` at the point described by `env_id`, with `denv`
    /// holding the known sub-derivatives of bound names.
    pub(crate) fn derivative_of(&mut self, exp: &Expr, x: &str, env_id: HeapId, denv: HeapId) -> RunResult<Value> {
        match exp {
            // d/dx c = 0, shaped like the point value of x.
            Expr::Int(_) | Expr::Real(_) => {
                let xval = env::lookup(&self.heap, env_id, x).map(Value::borrow_copy);
                match xval {
                    Some(v) => self
                        .derive_const(x, &v, 0)
                        .ok_or_else(|| calc_err(exp)),
                    None => Ok(Value::Int(0)),
                }
            }

            Expr::Var(name) => match env::lookup(&self.heap, denv, name) {
                Some(dv) => Ok(dv.clone_with_heap(&self.heap)),
                None => Err(LomdaError::calculus(format!(
                    "derivative of variable '{name}' is not known within this context"
                ))),
            },

            Expr::Binary(BinOp::Add, l, r) | Expr::Binary(BinOp::Sub, l, r) => {
                let da = self.derivative_of(l, x, env_id, denv)?;
                let db = match self.derivative_of(r, x, env_id, denv) {
                    Ok(v) => v,
                    Err(e) => {
                        da.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = if matches!(exp, Expr::Binary(BinOp::Add, ..)) {
                    ops::add(&mut self.heap, &da, &db)
                } else {
                    ops::sub(&mut self.heap, &da, &db)
                };
                da.drop_with_heap(&mut self.heap);
                db.drop_with_heap(&mut self.heap);
                result
            }

            // d/dx (a b) = a b' + b a'
            Expr::Binary(BinOp::Mul, l, r) => {
                let dl = self.derivative_of(l, x, env_id, denv)?;
                let dr = match self.derivative_of(r, x, env_id, denv) {
                    Ok(v) => v,
                    Err(e) => {
                        dl.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let lv = self.eval_forced(l, env_id);
                let lv = match lv {
                    Ok(v) => v,
                    Err(e) => {
                        dl.drop_with_heap(&mut self.heap);
                        dr.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let rv = self.eval_forced(r, env_id);
                let rv = match rv {
                    Ok(v) => v,
                    Err(e) => {
                        dl.drop_with_heap(&mut self.heap);
                        dr.drop_with_heap(&mut self.heap);
                        lv.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                debug("calculus", format!("l = {}", lv.display(&self.heap)));
                debug("calculus", format!("r = {}", rv.display(&self.heap)));
                // A container differentiation variable widens dl/dr by the
                // seed axes, so the products contract value axes only.
                let lrank = ops::rank(&self.heap, &lv);
                let a = ops::mul_value_by_deriv(&mut self.heap, &lv, &dr);
                let b = ops::mul_deriv_by_value(&mut self.heap, &dl, &rv, lrank);
                lv.drop_with_heap(&mut self.heap);
                rv.drop_with_heap(&mut self.heap);
                dl.drop_with_heap(&mut self.heap);
                dr.drop_with_heap(&mut self.heap);
                let (a, b) = (a?, b?);
                let sum = ops::add(&mut self.heap, &a, &b);
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                sum
            }

            // d/dx (a/b) = (b a' - a b') / b^2
            Expr::Binary(BinOp::Div, l, r) => {
                let dl = self.derivative_of(l, x, env_id, denv)?;
                let dr = match self.derivative_of(r, x, env_id, denv) {
                    Ok(v) => v,
                    Err(e) => {
                        dl.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let parts = (|| -> RunResult<Value> {
                    let lv = self.eval_forced(l, env_id)?;
                    let rv = match self.eval_forced(r, env_id) {
                        Ok(v) => v,
                        Err(e) => {
                            lv.drop_with_heap(&mut self.heap);
                            return Err(e);
                        }
                    };
                    let num_a = ops::mul(&mut self.heap, &rv, &dl);
                    let num_b = ops::mul(&mut self.heap, &lv, &dr);
                    let den = ops::mul(&mut self.heap, &rv, &rv);
                    lv.drop_with_heap(&mut self.heap);
                    rv.drop_with_heap(&mut self.heap);
                    let (num_a, num_b, den) = match (num_a, num_b, den) {
                        (Ok(a), Ok(b), Ok(d)) => (a, b, d),
                        (a, b, d) => {
                            for v in [a, b, d].into_iter().flatten() {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(calc_err(exp));
                        }
                    };
                    let num = ops::sub(&mut self.heap, &num_a, &num_b);
                    num_a.drop_with_heap(&mut self.heap);
                    num_b.drop_with_heap(&mut self.heap);
                    let num = match num {
                        Ok(n) => n,
                        Err(e) => {
                            den.drop_with_heap(&mut self.heap);
                            return Err(e);
                        }
                    };
                    let out = ops::div(&mut self.heap, &num, &den);
                    num.drop_with_heap(&mut self.heap);
                    den.drop_with_heap(&mut self.heap);
                    out
                })();
                dl.drop_with_heap(&mut self.heap);
                dr.drop_with_heap(&mut self.heap);
                parts
            }

            // d/dx (b^p) = b^(p-1) (p b' + b ln(b) p')  for numeric p
            Expr::Binary(BinOp::Pow, l, r) => {
                let lv = self.eval_forced(l, env_id)?;
                let rv = match self.eval_forced(r, env_id) {
                    Ok(v) => v,
                    Err(e) => {
                        lv.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                if !rv.is_number() {
                    let msg = format!("differentiation is not defined in exponentiation between {l} and {r}");
                    lv.drop_with_heap(&mut self.heap);
                    rv.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::calculus(msg));
                }
                let dl = match self.derivative_of(l, x, env_id, denv) {
                    Ok(v) => v,
                    Err(e) => {
                        lv.drop_with_heap(&mut self.heap);
                        rv.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let dr = match self.derivative_of(r, x, env_id, denv) {
                    Ok(v) => v,
                    Err(e) => {
                        lv.drop_with_heap(&mut self.heap);
                        rv.drop_with_heap(&mut self.heap);
                        dl.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = (|| -> RunResult<Value> {
                    // B = p b' + b ln(b) p'
                    let gf = ops::mul(&mut self.heap, &rv, &dl)?;
                    let logf = match ops::val_log(&mut self.heap, &lv) {
                        Ok(v) => v,
                        Err(e) => {
                            gf.drop_with_heap(&mut self.heap);
                            return Err(e);
                        }
                    };
                    let flf = ops::mul(&mut self.heap, &lv, &logf);
                    logf.drop_with_heap(&mut self.heap);
                    let flf = match flf {
                        Ok(v) => v,
                        Err(e) => {
                            gf.drop_with_heap(&mut self.heap);
                            return Err(e);
                        }
                    };
                    let flfg = ops::mul(&mut self.heap, &flf, &dr);
                    flf.drop_with_heap(&mut self.heap);
                    let flfg = match flfg {
                        Ok(v) => v,
                        Err(e) => {
                            gf.drop_with_heap(&mut self.heap);
                            return Err(e);
                        }
                    };
                    let b_part = ops::add(&mut self.heap, &gf, &flfg);
                    gf.drop_with_heap(&mut self.heap);
                    flfg.drop_with_heap(&mut self.heap);
                    let b_part = b_part?;

                    // A = b^(p-1)
                    let lowered = Value::Real(rv.as_f64().expect("checked number") - 1.0);
                    let a_part = ops::pow(&mut self.heap, &lv, &lowered);
                    let a_part = match a_part {
                        Ok(v) => v,
                        Err(e) => {
                            b_part.drop_with_heap(&mut self.heap);
                            return Err(e);
                        }
                    };
                    let out = ops::mul(&mut self.heap, &a_part, &b_part);
                    a_part.drop_with_heap(&mut self.heap);
                    b_part.drop_with_heap(&mut self.heap);
                    out
                })();
                lv.drop_with_heap(&mut self.heap);
                rv.drop_with_heap(&mut self.heap);
                dl.drop_with_heap(&mut self.heap);
                dr.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Binary(BinOp::Mod, ..) => Err(calc_err(exp)),

            // d/dx f(u_1, ..., u_n) = sum_i (∂f/∂p_i)(u_1..u_n) * u_i'
            Expr::Apply(op, args) => {
                let f = self.eval_forced(op, env_id)?;
                let params = match &f {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Lambda(lambda) => lambda.params.clone(),
                        _ => {
                            f.drop_with_heap(&mut self.heap);
                            return Err(LomdaError::expected_type(op, "lambda"));
                        }
                    },
                    _ => {
                        f.drop_with_heap(&mut self.heap);
                        return Err(LomdaError::expected_type(op, "lambda"));
                    }
                };
                f.drop_with_heap(&mut self.heap);
                if params.len() != args.len() {
                    return Err(LomdaError::runtime(format!(
                        "lambda of {} arguments cannot be applied to {} arguments",
                        params.len(),
                        args.len()
                    )));
                }

                let mut total: Option<Value> = None;
                for (param, arg) in params.iter().zip(args) {
                    let partial = Expr::Apply(symb::symb_diff(op, param).boxed(), args.clone());
                    let dfi = match self.eval_forced(&partial, env_id) {
                        Ok(v) => v,
                        Err(e) => {
                            if let Some(t) = total {
                                t.drop_with_heap(&mut self.heap);
                            }
                            return Err(e);
                        }
                    };
                    let darg = match self.derivative_of(arg, x, env_id, denv) {
                        Ok(v) => v,
                        Err(e) => {
                            dfi.drop_with_heap(&mut self.heap);
                            if let Some(t) = total {
                                t.drop_with_heap(&mut self.heap);
                            }
                            return Err(e);
                        }
                    };
                    let term = ops::mul(&mut self.heap, &dfi, &darg);
                    dfi.drop_with_heap(&mut self.heap);
                    darg.drop_with_heap(&mut self.heap);
                    let term = match term {
                        Ok(v) => v,
                        Err(e) => {
                            if let Some(t) = total {
                                t.drop_with_heap(&mut self.heap);
                            }
                            return Err(e);
                        }
                    };
                    total = match total {
                        None => Some(term),
                        Some(prev) => {
                            let sum = ops::add(&mut self.heap, &prev, &term);
                            prev.drop_with_heap(&mut self.heap);
                            term.drop_with_heap(&mut self.heap);
                            Some(sum?)
                        }
                    };
                }
                Ok(total.unwrap_or(Value::Int(0)))
            }

            // d/dx lambda (y) f = lambda (y) d/dx f
            Expr::Lambda(params, body) => {
                let captured = env::clone_chain(&mut self.heap, env_id);
                Ok(Value::Ref(self.heap.allocate(HeapData::Lambda(Lambda {
                    params: params.clone(),
                    body: symb::symb_diff(body, x),
                    env: Some(captured),
                }))))
            }

            Expr::Let { bindings, body } => {
                let mut cur = env::clone_chain(&mut self.heap, env_id);
                let mut dcur = env::clone_chain(&mut self.heap, denv);
                let mut lambda_ids = Vec::new();
                for binding in bindings {
                    let v = self.evaluate(&binding.expr, cur);
                    let v = match v {
                        Ok(v) => v,
                        Err(e) => {
                            self.heap.dec_ref(cur);
                            self.heap.dec_ref(dcur);
                            return Err(e);
                        }
                    };
                    let dv = self.derivative_of(&binding.expr, x, cur, dcur);
                    let dv = match dv {
                        Ok(dv) => dv,
                        Err(e) => {
                            v.drop_with_heap(&mut self.heap);
                            self.heap.dec_ref(cur);
                            self.heap.dec_ref(dcur);
                            return Err(e);
                        }
                    };
                    let bound = v.shallow_copy(&mut self.heap);
                    v.drop_with_heap(&mut self.heap);
                    if let Value::Ref(id) = &bound
                        && matches!(self.heap.get(*id), HeapData::Lambda(_))
                    {
                        lambda_ids.push(*id);
                    }
                    let next = env::extend(&mut self.heap, cur, binding.name.clone(), bound);
                    self.heap.dec_ref(cur);
                    cur = next;
                    let dnext = env::extend(&mut self.heap, dcur, binding.name.clone(), dv);
                    self.heap.dec_ref(dcur);
                    dcur = dnext;
                }
                for id in lambda_ids {
                    let snapshot = env::clone_chain(&mut self.heap, cur);
                    let old = match self.heap.get_mut(id) {
                        HeapData::Lambda(lambda) => lambda.env.replace(snapshot),
                        _ => unreachable!("tracked id is a lambda"),
                    };
                    if let Some(old) = old {
                        self.heap.dec_ref(old);
                    }
                }
                let result = self.derivative_of(body, x, cur, dcur);
                self.heap.dec_ref(cur);
                self.heap.dec_ref(dcur);
                result
            }

            Expr::If(cond, then_exp, else_exp) => {
                let c = self.eval_forced(cond, env_id)?;
                let Value::Bool(b) = c else {
                    c.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(cond, "boolean"));
                };
                if b {
                    self.derivative_of(then_exp, x, env_id, denv)
                } else {
                    self.derivative_of(else_exp, x, env_id, denv)
                }
            }

            Expr::While {
                cond,
                body,
                always_enter,
            } => {
                let mut skip = *always_enter;
                let mut last = Value::Void;
                loop {
                    let c = self.eval_forced(cond, env_id)?;
                    let Value::Bool(b) = c else {
                        c.drop_with_heap(&mut self.heap);
                        last.drop_with_heap(&mut self.heap);
                        return Err(LomdaError::expected_type(cond, "boolean"));
                    };
                    if skip || b {
                        skip = false;
                        last.drop_with_heap(&mut self.heap);
                        last = self.derivative_of(body, x, env_id, denv)?;
                    } else {
                        return Ok(last);
                    }
                }
            }

            Expr::For { var, iter, body } => {
                let list = self.eval_forced(iter, env_id)?;
                let Some(items) = ops::list_items(&self.heap, &list) else {
                    list.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(iter, "list"));
                };
                let items: Vec<Value> = items.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
                list.drop_with_heap(&mut self.heap);

                let dlist = match self.derivative_of(iter, x, env_id, denv) {
                    Ok(v) => v,
                    Err(e) => {
                        for v in items {
                            v.drop_with_heap(&mut self.heap);
                        }
                        return Err(e);
                    }
                };
                let Some(ditems) = ops::list_items(&self.heap, &dlist) else {
                    dlist.drop_with_heap(&mut self.heap);
                    for v in items {
                        v.drop_with_heap(&mut self.heap);
                    }
                    return Err(calc_err(exp));
                };
                let ditems: Vec<Value> = ditems.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
                dlist.drop_with_heap(&mut self.heap);

                let mut last = Value::Void;
                let mut pairs = items.into_iter().zip(ditems);
                loop {
                    let Some((v, dv)) = pairs.next() else { break };
                    let frame = env::extend(&mut self.heap, env_id, var.clone(), v);
                    let dframe = env::extend(&mut self.heap, denv, var.clone(), dv);
                    last.drop_with_heap(&mut self.heap);
                    let result = self.derivative_of(body, x, frame, dframe);
                    self.heap.dec_ref(frame);
                    self.heap.dec_ref(dframe);
                    match result {
                        Ok(v) => last = v,
                        Err(e) => {
                            for (v, dv) in pairs {
                                v.drop_with_heap(&mut self.heap);
                                dv.drop_with_heap(&mut self.heap);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(last)
            }

            // d/dx [u_0, u_1, ...] = [d/dx u_0, d/dx u_1, ...]
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match self.derivative_of(item, x, env_id, denv) {
                        Ok(v) => out.push(v),
                        Err(e) => {
                            for v in out {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::List(out))))
            }

            Expr::Dict(entries) => {
                let mut out = indexmap::IndexMap::new();
                for (k, e) in entries {
                    match self.derivative_of(e, x, env_id, denv) {
                        Ok(v) => {
                            out.insert(k.clone(), v);
                        }
                        Err(err) => {
                            for (_, v) in out {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(err);
                        }
                    }
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::Dict(out))))
            }

            // d/dx (L, R) = (d/dx L, d/dx R)
            Expr::Tuple(l, r) => {
                let dl = self.derivative_of(l, x, env_id, denv)?;
                let dr = match self.derivative_of(r, x, env_id, denv) {
                    Ok(v) => v,
                    Err(e) => {
                        dl.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                Ok(Value::Ref(self.heap.allocate(HeapData::Tuple(dl, dr))))
            }

            Expr::ListAccess(list, index) => {
                let dlist = self.derivative_of(list, x, env_id, denv)?;
                let Some(items) = ops::list_items(&self.heap, &dlist) else {
                    dlist.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(list, "list"));
                };
                let idx = self.eval_forced(index, env_id)?;
                let result = match idx.as_int() {
                    Some(i) if i >= 0 && (i as usize) < items.len() => {
                        Ok(items[i as usize].clone_with_heap(&self.heap))
                    }
                    Some(i) => Err(LomdaError::runtime(format!("index {i} is out of bounds"))),
                    None => Err(LomdaError::expected_type(index, "integer")),
                };
                idx.drop_with_heap(&mut self.heap);
                dlist.drop_with_heap(&mut self.heap);
                result
            }

            Expr::ListSlice(list, from, to) => {
                // The derivative of a slice is the same slice of the derivative.
                let dlist = self.derivative_of(list, x, env_id, denv)?;
                let result = (|this: &mut Self| -> RunResult<Value> {
                    let Some(items) = ops::list_items(&this.heap, &dlist) else {
                        return Err(LomdaError::expected_type(list, "list"));
                    };
                    let len = items.len();
                    let i = match from {
                        Some(e) => {
                            let v = this.eval_forced(e, env_id)?;
                            let i = v.as_int();
                            v.drop_with_heap(&mut this.heap);
                            i.ok_or_else(|| LomdaError::expected_type(e, "integer"))? as usize
                        }
                        None => 0,
                    };
                    let j = match to {
                        Some(e) => {
                            let v = this.eval_forced(e, env_id)?;
                            let jv = v.as_int();
                            v.drop_with_heap(&mut this.heap);
                            jv.ok_or_else(|| LomdaError::expected_type(e, "integer"))? as usize
                        }
                        None => len,
                    };
                    if i > len || j > len {
                        return Err(LomdaError::runtime(format!(
                            "slice {i}:{j} is out of bounds of list of length {len}"
                        )));
                    }
                    let out: Vec<Value> = items
                        .iter()
                        .skip(i)
                        .take(j.saturating_sub(i))
                        .map(|v| v.clone_with_heap(&this.heap))
                        .collect();
                    Ok(Value::Ref(this.heap.allocate(HeapData::List(out))))
                })(self);
                dlist.drop_with_heap(&mut self.heap);
                result
            }

            Expr::DictAccess(dict, key) => {
                let ddict = self.derivative_of(dict, x, env_id, denv)?;
                let result = match &ddict {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Dict(entries) => match entries.get(key) {
                            Some(v) => Ok(v.clone_with_heap(&self.heap)),
                            None => Err(LomdaError::runtime(format!("key '{key}' is not defined in {dict}"))),
                        },
                        _ => Err(LomdaError::expected_type(dict, "dictionary")),
                    },
                    _ => Err(LomdaError::expected_type(dict, "dictionary")),
                };
                ddict.drop_with_heap(&mut self.heap);
                result
            }

            // d/dx left of T = left of dT/dx
            Expr::TupleAccess(tuple, side) => {
                let dt = self.derivative_of(tuple, x, env_id, denv)?;
                let result = match &dt {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Tuple(l, r) => {
                            let v = match side {
                                TupleSide::Left => l,
                                TupleSide::Right => r,
                            };
                            Ok(v.clone_with_heap(&self.heap))
                        }
                        _ => Err(LomdaError::expected_type(tuple, "tuple")),
                    },
                    _ => Err(LomdaError::expected_type(tuple, "tuple")),
                };
                dt.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Magnitude(e) => {
                let v = self.eval_forced(e, env_id)?;
                if !v.is_number() {
                    let msg = format!("expression '{}' is not of numerical type", v.display(&self.heap));
                    v.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::runtime(msg));
                }
                let sign = if v.as_f64().expect("checked number") >= 0.0 { 1 } else { -1 };
                v.drop_with_heap(&mut self.heap);
                let dv = self.derivative_of(e, x, env_id, denv)?;
                let result = ops::mul(&mut self.heap, &Value::Int(sign), &dv);
                dv.drop_with_heap(&mut self.heap);
                result
            }

            Expr::MathFn(fun, e) => self.math_derivative(*fun, e, exp, x, env_id, denv),

            Expr::Thunk(body) => self.derivative_of(body, x, env_id, denv),

            // Nested derivatives compose: rewrite symbolically, then resume
            // the numeric pass. When the rewrite makes no progress (a bare
            // residual wrapper), evaluate the inner derivative to a value and
            // differentiate that: lambdas pick up another symbolic layer,
            // and anything else is constant with respect to `x`.
            Expr::Derivative(inner, y) => {
                let rewritten = symb::symb_diff(inner, y);
                if matches!(&rewritten, Expr::Derivative(i, v) if i == inner && v == y) {
                    let v = self.eval_derivative(inner, y, env_id)?;
                    let out = self.derive_const(x, &v, 0);
                    v.drop_with_heap(&mut self.heap);
                    return out.ok_or_else(|| calc_err(exp));
                }
                self.derivative_of(&rewritten, x, env_id, denv)
            }

            Expr::Fold { list, func, base } => self.fold_derivative(list, func, base, x, env_id, denv),

            Expr::Map { func, list } => self.map_derivative(func, list, x, env_id, denv),

            Expr::Seq(_) | Expr::Assign(..) => Err(calc_err(exp)),

            _ => Err(calc_err(exp)),
        }
    }

    fn math_derivative(
        &mut self,
        fun: MathFn,
        e: &Expr,
        whole: &Expr,
        x: &str,
        env_id: HeapId,
        denv: HeapId,
    ) -> RunResult<Value> {
        let v = self.eval_forced(e, env_id)?;
        let Some(z) = v.as_f64() else {
            v.drop_with_heap(&mut self.heap);
            return Err(LomdaError::type_err(format!(
                "{fun} is undefined for inputs outside of R"
            )));
        };
        v.drop_with_heap(&mut self.heap);
        let dv = self.derivative_of(e, x, env_id, denv)?;
        let Some(dz) = dv.as_f64() else {
            dv.drop_with_heap(&mut self.heap);
            return Err(calc_err(whole));
        };
        dv.drop_with_heap(&mut self.heap);
        let out = match fun {
            MathFn::Sin => dz * z.cos(),
            MathFn::Cos => -dz * z.sin(),
            MathFn::Tan => dz / (z.cos() * z.cos()),
            MathFn::Asin => dz / (1.0 - z * z).sqrt(),
            MathFn::Acos => -dz / (1.0 - z * z).sqrt(),
            MathFn::Atan => dz / (1.0 + z * z),
            MathFn::Sinh => dz * z.cosh(),
            MathFn::Cosh => dz * z.sinh(),
            MathFn::Tanh => dz / (z.cosh() * z.cosh()),
            MathFn::Log => dz / z,
            MathFn::Sqrt => dz / (2.0 * z.sqrt()),
            MathFn::Exp => dz * z.exp(),
            MathFn::Max | MathFn::Min => return Err(calc_err(whole)),
        };
        Ok(Value::Real(out))
    }

    /// Fold derivative: thread both the accumulator and its derivative,
    /// using the fold function's partials with respect to each parameter.
    fn fold_derivative(
        &mut self,
        list: &Expr,
        func: &Expr,
        base: &Expr,
        x: &str,
        env_id: HeapId,
        denv: HeapId,
    ) -> RunResult<Value> {
        let lst = self.eval_forced(list, env_id)?;
        let Some(items) = ops::list_items(&self.heap, &lst) else {
            lst.drop_with_heap(&mut self.heap);
            return Err(LomdaError::expected_type(list, "list"));
        };
        let items: Vec<Value> = items.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
        lst.drop_with_heap(&mut self.heap);
        if items.is_empty() {
            return self.derivative_of(base, x, env_id, denv);
        }

        let f = self.eval_forced(func, env_id)?;
        let params = match &f {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Lambda(lambda) if lambda.params.len() == 2 => lambda.params.clone(),
                _ => {
                    for v in items {
                        v.drop_with_heap(&mut self.heap);
                    }
                    f.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::runtime(format!(
                        "function defined by '{func}' does not take exactly two arguments"
                    )));
                }
            },
            _ => {
                for v in items {
                    v.drop_with_heap(&mut self.heap);
                }
                f.drop_with_heap(&mut self.heap);
                return Err(LomdaError::expected_type(func, "lambda"));
            }
        };

        let mut ditems = Vec::new();
        let dlist = self.derivative_of(list, x, env_id, denv);
        let cleanup = |this: &mut Self, items: Vec<Value>, ditems: Vec<Value>, f: Value| {
            for v in items {
                v.drop_with_heap(&mut this.heap);
            }
            for v in ditems {
                v.drop_with_heap(&mut this.heap);
            }
            f.drop_with_heap(&mut this.heap);
        };
        match dlist {
            Ok(dv) => {
                if let Some(ds) = ops::list_items(&self.heap, &dv) {
                    ditems = ds.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
                }
                dv.drop_with_heap(&mut self.heap);
            }
            Err(e) => {
                cleanup(self, items, ditems, f);
                return Err(e);
            }
        }
        if ditems.len() != items.len() {
            cleanup(self, items, ditems, f);
            return Err(LomdaError::calculus(format!(
                "derivative of '{list}' does not match its shape"
            )));
        }

        // Partials of the fold function with respect to each of its two
        // parameters, as lambda values.
        let df_a = match self.derivative_of(func, &params[0], env_id, denv) {
            Ok(v) => v,
            Err(e) => {
                cleanup(self, items, ditems, f);
                return Err(e);
            }
        };
        let df_b = match self.derivative_of(func, &params[1], env_id, denv) {
            Ok(v) => v,
            Err(e) => {
                df_a.drop_with_heap(&mut self.heap);
                cleanup(self, items, ditems, f);
                return Err(e);
            }
        };

        let result = (|this: &mut Self| -> RunResult<Value> {
            let mut acc = this.evaluate(base, env_id)?;
            let mut dacc = match this.derivative_of(base, x, env_id, denv) {
                Ok(v) => v,
                Err(e) => {
                    acc.drop_with_heap(&mut this.heap);
                    return Err(e);
                }
            };
            for (v, dv) in items.iter().zip(&ditems) {
                let args = vec![acc.clone_with_heap(&this.heap), v.clone_with_heap(&this.heap)];
                let fa = this.apply_lambda(&df_a, args);
                let fa = match fa {
                    Ok(v) => v,
                    Err(e) => {
                        acc.drop_with_heap(&mut this.heap);
                        dacc.drop_with_heap(&mut this.heap);
                        return Err(e);
                    }
                };
                let args = vec![acc.clone_with_heap(&this.heap), v.clone_with_heap(&this.heap)];
                let fb = this.apply_lambda(&df_b, args);
                let fb = match fb {
                    Ok(v) => v,
                    Err(e) => {
                        fa.drop_with_heap(&mut this.heap);
                        acc.drop_with_heap(&mut this.heap);
                        dacc.drop_with_heap(&mut this.heap);
                        return Err(e);
                    }
                };
                let args = vec![acc, v.clone_with_heap(&this.heap)];
                // acc moves into the application; the new accumulator replaces it.
                let next_acc = this.apply_lambda(&f, args);
                let next_acc = match next_acc {
                    Ok(v) => v,
                    Err(e) => {
                        fa.drop_with_heap(&mut this.heap);
                        fb.drop_with_heap(&mut this.heap);
                        dacc.drop_with_heap(&mut this.heap);
                        return Err(e);
                    }
                };
                acc = next_acc;

                // dacc' = fa * dacc + fb * dv
                let t1 = ops::mul(&mut this.heap, &fa, &dacc);
                let t2 = ops::mul(&mut this.heap, &fb, dv);
                fa.drop_with_heap(&mut this.heap);
                fb.drop_with_heap(&mut this.heap);
                dacc.drop_with_heap(&mut this.heap);
                let (t1, t2) = match (t1, t2) {
                    (Ok(a), Ok(b)) => (a, b),
                    (a, b) => {
                        for v in [a, b].into_iter().flatten() {
                            v.drop_with_heap(&mut this.heap);
                        }
                        acc.drop_with_heap(&mut this.heap);
                        return Err(LomdaError::calculus(format!(
                            "fold of '{func}' is non-differentiable at this point"
                        )));
                    }
                };
                let next_dacc = ops::add(&mut this.heap, &t1, &t2);
                t1.drop_with_heap(&mut this.heap);
                t2.drop_with_heap(&mut this.heap);
                dacc = match next_dacc {
                    Ok(v) => v,
                    Err(e) => {
                        acc.drop_with_heap(&mut this.heap);
                        return Err(e);
                    }
                };
            }
            acc.drop_with_heap(&mut this.heap);
            Ok(dacc)
        })(self);

        df_a.drop_with_heap(&mut self.heap);
        df_b.drop_with_heap(&mut self.heap);
        cleanup(self, items, ditems, f);
        result
    }

    /// Map derivative: chain rule per element, `f'(u_i) * u_i'`.
    fn map_derivative(
        &mut self,
        func: &Expr,
        list: &Expr,
        x: &str,
        env_id: HeapId,
        denv: HeapId,
    ) -> RunResult<Value> {
        let f = self.eval_forced(func, env_id)?;
        let param = match &f {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Lambda(lambda) if lambda.params.len() == 1 => lambda.params[0].clone(),
                _ => {
                    f.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::runtime(format!(
                        "map function '{func}' does not take exactly one argument"
                    )));
                }
            },
            _ => {
                f.drop_with_heap(&mut self.heap);
                return Err(LomdaError::expected_type(func, "lambda"));
            }
        };
        f.drop_with_heap(&mut self.heap);

        // Differentiate the function with respect to its own parameter.
        let df = self.derivative_of(func, &param, env_id, denv)?;

        let result = (|this: &mut Self| -> RunResult<Value> {
            let vs = this.eval_forced(list, env_id)?;
            let dvs = match this.derivative_of(list, x, env_id, denv) {
                Ok(v) => v,
                Err(e) => {
                    vs.drop_with_heap(&mut this.heap);
                    return Err(e);
                }
            };
            if let (Some(items), Some(ditems)) = (ops::list_items(&this.heap, &vs), ops::list_items(&this.heap, &dvs))
            {
                let items: Vec<Value> = items.iter().map(|v| v.clone_with_heap(&this.heap)).collect();
                let ditems: Vec<Value> = ditems.iter().map(|v| v.clone_with_heap(&this.heap)).collect();
                vs.drop_with_heap(&mut this.heap);
                dvs.drop_with_heap(&mut this.heap);
                let mut out: Vec<Value> = Vec::with_capacity(items.len());
                let mut pairs = items.into_iter().zip(ditems);
                loop {
                    let Some((v, dv)) = pairs.next() else { break };
                    let elem = this.apply_lambda(&df, vec![v]);
                    let elem = match elem {
                        Ok(e) => e,
                        Err(e) => {
                            dv.drop_with_heap(&mut this.heap);
                            for (v, dv) in pairs {
                                v.drop_with_heap(&mut this.heap);
                                dv.drop_with_heap(&mut this.heap);
                            }
                            for v in out {
                                v.drop_with_heap(&mut this.heap);
                            }
                            return Err(e);
                        }
                    };
                    let cell = ops::mul(&mut this.heap, &elem, &dv);
                    elem.drop_with_heap(&mut this.heap);
                    dv.drop_with_heap(&mut this.heap);
                    match cell {
                        Ok(c) => out.push(c),
                        Err(e) => {
                            for (v, dv) in pairs {
                                v.drop_with_heap(&mut this.heap);
                                dv.drop_with_heap(&mut this.heap);
                            }
                            for v in out {
                                v.drop_with_heap(&mut this.heap);
                            }
                            return Err(e);
                        }
                    }
                }
                return Ok(Value::Ref(this.heap.allocate(HeapData::List(out))));
            }

            // Not a list: warn, then apply the chain rule to the value itself.
            if let Err(e) = crate::error::warn(
                crate::error::ErrorCategory::Runtime,
                format!("expression '{list}' does not evaluate as list"),
            ) {
                vs.drop_with_heap(&mut this.heap);
                dvs.drop_with_heap(&mut this.heap);
                return Err(e);
            }
            let elem = this.apply_lambda(&df, vec![vs]);
            let elem = match elem {
                Ok(v) => v,
                Err(e) => {
                    dvs.drop_with_heap(&mut this.heap);
                    return Err(e);
                }
            };
            let cell = ops::mul(&mut this.heap, &elem, &dvs);
            elem.drop_with_heap(&mut this.heap);
            dvs.drop_with_heap(&mut this.heap);
            cell
        })(self);

        df.drop_with_heap(&mut self.heap);
        result
    }
}

fn set_child(heap: &mut crate::heap::Heap, id: HeapId, index: usize, value: Value) {
    let old = match heap.get_mut(id) {
        HeapData::List(items) => std::mem::replace(&mut items[index], value),
        HeapData::Dict(entries) => {
            let (_, slot) = entries.get_index_mut(index).expect("index within dictionary");
            std::mem::replace(slot, value)
        }
        HeapData::Tuple(l, r) => {
            let slot = if index == 0 { l } else { r };
            std::mem::replace(slot, value)
        }
        _ => return,
    };
    old.drop_with_heap(heap);
}
