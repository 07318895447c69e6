//! The evaluator: a recursive tree walker over the expression family,
//! threading the reference-counted heap and the lexical environment chain.

use ahash::AHashMap;

use crate::{
    ast::{BinOp, Expr, TupleSide},
    config, env,
    error::{warn, ErrorCategory, LomdaError, RunResult},
    heap::{AdtInstance, Heap, HeapData, HeapId, Lambda, Thunk},
    io::{self, PrintWriter},
    modules, ops, parse,
    value::{values_equal, Value},
};

/// Evaluator nesting bound; exceeding it is a runtime error rather than a
/// stack overflow.
pub(crate) const MAX_RECURSION_DEPTH: usize = 300;

/// The interpreter state threaded through evaluation: the value heap, the
/// print writer, the process-local module cache, and the recursion guard.
pub(crate) struct Interp<'a> {
    pub heap: Heap,
    pub print: &'a mut dyn PrintWriter,
    modules: AHashMap<String, Value>,
    depth: usize,
}

impl<'a> Interp<'a> {
    pub fn new(print: &'a mut dyn PrintWriter) -> Self {
        Self {
            heap: Heap::new(),
            print,
            modules: AHashMap::new(),
            depth: 0,
        }
    }

    /// Evaluates a whole program under a fresh empty environment, forcing the
    /// final value.
    pub fn run(&mut self, program: &Expr) -> RunResult<Value> {
        let root = env::empty(&mut self.heap);
        let result = self.evaluate(program, root);
        self.heap.dec_ref(root);
        let value = result?;
        self.force(value)
    }

    /// Transparently forces thunks until a non-thunk value remains.
    pub fn force(&mut self, value: Value) -> RunResult<Value> {
        let Value::Ref(id) = value else { return Ok(value) };
        let (body, tenv, cached) = match self.heap.get(id) {
            HeapData::Thunk(t) => (t.body.clone(), t.env, t.cached.as_ref().map(Value::borrow_copy)),
            _ => return Ok(value),
        };
        if let Some(c) = cached {
            let out = c.clone_with_heap(&self.heap);
            value.drop_with_heap(&mut self.heap);
            return self.force(out);
        }
        self.depth += 1;
        if self.depth > MAX_RECURSION_DEPTH {
            self.depth -= 1;
            value.drop_with_heap(&mut self.heap);
            return Err(LomdaError::runtime("exceeded maximum recursion depth"));
        }
        let result = self.evaluate(&body, tenv);
        self.depth -= 1;
        let result = match result {
            Ok(v) => v,
            Err(e) => {
                value.drop_with_heap(&mut self.heap);
                return Err(e);
            }
        };
        let cache_copy = result.clone_with_heap(&self.heap);
        if let HeapData::Thunk(t) = self.heap.get_mut(id) {
            let old = t.cached.replace(cache_copy);
            debug_assert!(old.is_none(), "thunk forced twice without caching");
        }
        value.drop_with_heap(&mut self.heap);
        self.force(result)
    }

    /// Evaluates and forces, for every point a non-thunk value is required.
    pub fn eval_forced(&mut self, exp: &Expr, env: HeapId) -> RunResult<Value> {
        let v = self.evaluate(exp, env)?;
        self.force(v)
    }

    /// Produces the value of `exp` in the given environment.
    pub fn evaluate(&mut self, exp: &Expr, env: HeapId) -> RunResult<Value> {
        match exp {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Real(r) => Ok(Value::Real(*r)),
            Expr::True => Ok(Value::Bool(true)),
            Expr::False => Ok(Value::Bool(false)),
            Expr::Void => Ok(Value::Void),
            Expr::Str(s) => Ok(Value::Ref(self.heap.allocate(HeapData::Str(s.clone())))),

            Expr::Var(name) => match env::lookup(&self.heap, env, name) {
                Some(v) => Ok(v.clone_with_heap(&self.heap)),
                None => Err(LomdaError::runtime(format!("variable '{name}' was not recognized"))),
            },

            Expr::List(items) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    match self.evaluate(item, env) {
                        Ok(v) => vals.push(v),
                        Err(e) => {
                            for v in vals {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::List(vals))))
            }

            Expr::Dict(entries) => {
                let mut map = indexmap::IndexMap::new();
                for (key, e) in entries {
                    match self.evaluate(e, env) {
                        Ok(v) => {
                            if let Some(old) = map.insert(key.clone(), v) {
                                old.drop_with_heap(&mut self.heap);
                            }
                        }
                        Err(err) => {
                            for (_, v) in map {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(err);
                        }
                    }
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::Dict(map))))
            }

            Expr::Tuple(l, r) => {
                let lv = self.evaluate(l, env)?;
                let rv = match self.evaluate(r, env) {
                    Ok(v) => v,
                    Err(e) => {
                        lv.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                Ok(Value::Ref(self.heap.allocate(HeapData::Tuple(lv, rv))))
            }

            Expr::Lambda(params, body) => {
                let captured = env::clone_chain(&mut self.heap, env);
                Ok(Value::Ref(self.heap.allocate(HeapData::Lambda(Lambda {
                    params: params.clone(),
                    body: (**body).clone(),
                    env: Some(captured),
                }))))
            }

            Expr::Thunk(body) => {
                let captured = env::clone_chain(&mut self.heap, env);
                Ok(Value::Ref(self.heap.allocate(HeapData::Thunk(Thunk {
                    body: (**body).clone(),
                    env: captured,
                    cached: None,
                }))))
            }

            Expr::Apply(op, args) => {
                let f = self.eval_forced(op, env)?;
                if !matches!(&f, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Lambda(_))) {
                    f.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(op, "lambda"));
                }
                let mut vals = Vec::with_capacity(args.len());
                for arg in args {
                    match self.evaluate(arg, env) {
                        Ok(v) => vals.push(v),
                        Err(e) => {
                            for v in vals {
                                v.drop_with_heap(&mut self.heap);
                            }
                            f.drop_with_heap(&mut self.heap);
                            return Err(e);
                        }
                    }
                }
                let result = self.apply_lambda(&f, vals);
                f.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Binary(op, l, r) => {
                let a = self.eval_forced(l, env)?;
                let b = match self.eval_forced(r, env) {
                    Ok(v) => v,
                    Err(e) => {
                        a.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = match op {
                    BinOp::Add => ops::add(&mut self.heap, &a, &b),
                    BinOp::Sub => ops::sub(&mut self.heap, &a, &b),
                    BinOp::Mul => ops::mul(&mut self.heap, &a, &b),
                    BinOp::Div => ops::div(&mut self.heap, &a, &b),
                    BinOp::Mod => ops::modulo(&mut self.heap, &a, &b),
                    BinOp::Pow => ops::pow(&mut self.heap, &a, &b),
                };
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Compare(op, l, r) => {
                let a = self.eval_forced(l, env)?;
                let b = match self.eval_forced(r, env) {
                    Ok(v) => v,
                    Err(e) => {
                        a.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = ops::compare(*op, &a, &b);
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                Ok(result)
            }

            Expr::And(l, r) | Expr::Or(l, r) => {
                let a = self.eval_forced(l, env)?;
                let b = match self.eval_forced(r, env) {
                    Ok(v) => v,
                    Err(e) => {
                        a.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = match (&a, &b) {
                    (Value::Bool(x), Value::Bool(y)) => {
                        if matches!(exp, Expr::And(..)) {
                            Ok(Value::Bool(*x && *y))
                        } else {
                            Ok(Value::Bool(*x || *y))
                        }
                    }
                    _ => Err(LomdaError::runtime(format!(
                        "boolean operations are not defined on non-booleans (see: '{exp}')"
                    ))),
                };
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Not(e) => {
                let v = self.eval_forced(e, env)?;
                let result = match &v {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    _ => Err(LomdaError::expected_type(e, "boolean")),
                };
                v.drop_with_heap(&mut self.heap);
                result
            }

            Expr::If(cond, then_exp, else_exp) => {
                let c = self.eval_forced(cond, env)?;
                let Value::Bool(b) = c else {
                    c.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(cond, "boolean"));
                };
                if b {
                    self.evaluate(then_exp, env)
                } else {
                    self.evaluate(else_exp, env)
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
                    let c = self.eval_forced(cond, env)?;
                    let Value::Bool(b) = c else {
                        c.drop_with_heap(&mut self.heap);
                        last.drop_with_heap(&mut self.heap);
                        return Err(LomdaError::expected_type(cond, "boolean"));
                    };
                    if skip || b {
                        skip = false;
                        last.drop_with_heap(&mut self.heap);
                        last = self.evaluate(body, env)?;
                    } else {
                        return Ok(last);
                    }
                }
            }

            Expr::For { var, iter, body } => {
                let list = self.eval_forced(iter, env)?;
                let Some(items) = ops::list_items(&self.heap, &list) else {
                    list.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(iter, "list"));
                };
                let items: Vec<Value> = items.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
                list.drop_with_heap(&mut self.heap);
                let mut last = Value::Void;
                let mut items = items.into_iter();
                loop {
                    let Some(x) = items.next() else { break };
                    let frame = env::extend(&mut self.heap, env, var.clone(), x);
                    last.drop_with_heap(&mut self.heap);
                    let result = self.evaluate(body, frame);
                    self.heap.dec_ref(frame);
                    match result {
                        Ok(v) => last = v,
                        Err(e) => {
                            for v in items {
                                v.drop_with_heap(&mut self.heap);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(last)
            }

            Expr::Let { bindings, body } => {
                // Operate on a clone so the let cannot disturb the caller's frames.
                let mut cur = env::clone_chain(&mut self.heap, env);
                let mut lambda_ids = Vec::new();
                for binding in bindings {
                    let v = match self.evaluate(&binding.expr, cur) {
                        Ok(v) => v,
                        Err(e) => {
                            self.heap.dec_ref(cur);
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
                }
                // Recursion post-pass: every bound lambda captures the fully
                // constructed environment, enabling self-reference.
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
                let result = self.evaluate(body, cur);
                self.heap.dec_ref(cur);
                result
            }

            Expr::Seq(exps) => {
                let mut last = Value::Void;
                for e in exps {
                    last.drop_with_heap(&mut self.heap);
                    last = self.evaluate(e, env)?;
                }
                Ok(last)
            }

            Expr::Assign(target, source) => {
                let v = self.eval_forced(source, env)?;
                let copy = v.clone_with_heap(&self.heap);
                if let Err(e) = self.assign(target, copy, env) {
                    v.drop_with_heap(&mut self.heap);
                    return Err(e);
                }
                Ok(v)
            }

            Expr::ListAccess(list, index) => {
                let container = self.eval_forced(list, env)?;
                let idx = match self.eval_index(index, env) {
                    Ok(i) => i,
                    Err(e) => {
                        container.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = match &container {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::List(items) => match items.get(idx) {
                            Some(v) => Ok(v.clone_with_heap(&self.heap)),
                            None => Err(LomdaError::runtime(format!(
                                "index {idx} is out of bounds of list of length {}",
                                items.len()
                            ))),
                        },
                        _ => Err(LomdaError::expected_type(list, "list")),
                    },
                    _ => Err(LomdaError::expected_type(list, "list")),
                };
                container.drop_with_heap(&mut self.heap);
                result
            }

            Expr::ListSlice(list, from, to) => {
                let container = self.eval_forced(list, env)?;
                let result = self.slice(list, &container, from.as_deref(), to.as_deref(), env);
                container.drop_with_heap(&mut self.heap);
                result
            }

            Expr::ListAdd { list, index, elem } => {
                let container = self.eval_forced(list, env)?;
                let Some(id) = container.as_list_id(&self.heap) else {
                    container.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(list, "list"));
                };
                let idx = match self.eval_index(index, env) {
                    Ok(i) => i,
                    Err(e) => {
                        container.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let elem = match self.evaluate(elem, env) {
                    Ok(v) => v,
                    Err(e) => {
                        container.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = {
                    let HeapData::List(items) = self.heap.get_mut(id) else {
                        unreachable!("checked list")
                    };
                    if idx > items.len() {
                        Err((elem, items.len()))
                    } else {
                        items.insert(idx, elem);
                        Ok(())
                    }
                };
                container.drop_with_heap(&mut self.heap);
                match result {
                    Ok(()) => Ok(Value::Void),
                    Err((elem, len)) => {
                        elem.drop_with_heap(&mut self.heap);
                        Err(LomdaError::runtime(format!(
                            "index {idx} is out of bounds of list of length {len}"
                        )))
                    }
                }
            }

            Expr::ListRemove { list, index } => {
                let container = self.eval_forced(list, env)?;
                let Some(id) = container.as_list_id(&self.heap) else {
                    container.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(list, "list"));
                };
                let idx = match self.eval_index(index, env) {
                    Ok(i) => i,
                    Err(e) => {
                        container.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = {
                    let HeapData::List(items) = self.heap.get_mut(id) else {
                        unreachable!("checked list")
                    };
                    if idx < items.len() {
                        Ok(items.remove(idx))
                    } else {
                        Err(items.len())
                    }
                };
                container.drop_with_heap(&mut self.heap);
                result.map_err(|len| {
                    LomdaError::runtime(format!("index {idx} is out of bounds of list of length {len}"))
                })
            }

            Expr::DictAccess(dict, key) => {
                let container = self.eval_forced(dict, env)?;
                let result = match &container {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Dict(entries) => match entries.get(key) {
                            Some(v) => Ok(v.clone_with_heap(&self.heap)),
                            None => Err(LomdaError::runtime(format!("key '{key}' is not defined in {dict}"))),
                        },
                        _ => Err(LomdaError::expected_type(dict, "dictionary")),
                    },
                    _ => Err(LomdaError::expected_type(dict, "dictionary")),
                };
                container.drop_with_heap(&mut self.heap);
                result
            }

            Expr::TupleAccess(tuple, side) => {
                let container = self.eval_forced(tuple, env)?;
                let result = match &container {
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
                container.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Derivative(func, var) => self.eval_derivative(func, var, env),

            Expr::Magnitude(e) => {
                let v = self.eval_forced(e, env)?;
                let result = ops::magnitude(&self.heap, &v);
                v.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Norm(e) => {
                let v = self.eval_forced(e, env)?;
                let result = ops::norm(&self.heap, &v);
                v.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Print(args) => {
                for (i, arg) in args.iter().enumerate() {
                    let v = self.eval_forced(arg, env)?;
                    if i > 0 {
                        self.print.stdout_push(' ');
                    }
                    let text = v.display(&self.heap);
                    self.print.stdout_write(text.into());
                    v.drop_with_heap(&mut self.heap);
                }
                self.print.stdout_push('\n');
                Ok(Value::Void)
            }

            Expr::Input => {
                let line = io::read_input_line();
                Ok(Value::Ref(self.heap.allocate(HeapData::Str(line))))
            }

            Expr::Cast(e, target) => {
                let v = self.eval_forced(e, env)?;
                let result = self.cast(&v, target);
                v.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Isa(e, shape) => {
                let v = self.eval_forced(e, env)?;
                let result = self.isa(&v, shape);
                v.drop_with_heap(&mut self.heap);
                Ok(Value::Bool(result))
            }

            Expr::Has(item, set) => {
                let x = self.eval_forced(item, env)?;
                let xs = match self.eval_forced(set, env) {
                    Ok(v) => v,
                    Err(e) => {
                        x.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let result = self.membership(item, &x, set, &xs);
                x.drop_with_heap(&mut self.heap);
                xs.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Fold { list, func, base } => self.eval_fold(list, func, base, env),

            Expr::Map { func, list } => self.eval_map(func, list, env),

            Expr::MathFn(fun, e) => {
                let v = self.eval_forced(e, env)?;
                let result = ops::math_fn(&mut self.heap, *fun, &v);
                v.drop_with_heap(&mut self.heap);
                result
            }

            Expr::Import { module, name, body } => {
                let value = self.load_module(module)?;
                let frame = env::extend(&mut self.heap, env, name.clone(), value);
                let result = self.evaluate(body, frame);
                self.heap.dec_ref(frame);
                result
            }

            Expr::FromImport { module, names, body } => {
                let value = self.load_module(module)?;
                let Value::Ref(id) = &value else {
                    value.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::io(format!("module '{module}' has no named bindings")));
                };
                let mut cur = env;
                self.heap.inc_ref(cur);
                for name in names {
                    let entry = match self.heap.get(*id) {
                        HeapData::Dict(entries) => entries.get(name).map(|v| v.clone_with_heap(&self.heap)),
                        _ => None,
                    };
                    let Some(entry) = entry else {
                        value.drop_with_heap(&mut self.heap);
                        self.heap.dec_ref(cur);
                        return Err(LomdaError::io(format!("module '{module}' does not define '{name}'")));
                    };
                    let next = env::extend(&mut self.heap, cur, name.clone(), entry);
                    self.heap.dec_ref(cur);
                    cur = next;
                }
                value.drop_with_heap(&mut self.heap);
                let result = self.evaluate(body, cur);
                self.heap.dec_ref(cur);
                result
            }

            Expr::AdtDecl { name, variants, body } => {
                let mut cur = env;
                self.heap.inc_ref(cur);
                for variant in variants {
                    let arity = variant.field_types.len();
                    let params: Vec<String> = (0..arity).map(|i| format!("#{i}")).collect();
                    let ctor = Value::Ref(self.heap.allocate(HeapData::Lambda(Lambda {
                        params,
                        body: Expr::AdtMake {
                            type_name: name.clone(),
                            kind: variant.kind.clone(),
                            arity,
                        },
                        env: None,
                    })));
                    let next = env::extend(&mut self.heap, cur, variant.kind.clone(), ctor);
                    self.heap.dec_ref(cur);
                    cur = next;
                }
                let result = self.evaluate(body, cur);
                self.heap.dec_ref(cur);
                result
            }

            Expr::AdtMake { type_name, kind, arity } => {
                let mut fields = Vec::with_capacity(*arity);
                for i in 0..*arity {
                    let param = format!("#{i}");
                    let v = env::lookup(&self.heap, env, &param)
                        .expect("constructor frame binds its parameters")
                        .clone_with_heap(&self.heap);
                    fields.push(v);
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::Adt(AdtInstance {
                    type_name: type_name.clone(),
                    kind: kind.clone(),
                    fields,
                }))))
            }

            Expr::Switch { scrutinee, arms } => {
                let v = self.eval_forced(scrutinee, env)?;
                let (kind, fields) = match &v {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Adt(adt) => (
                            adt.kind.clone(),
                            adt.fields.iter().map(|f| f.clone_with_heap(&self.heap)).collect::<Vec<_>>(),
                        ),
                        _ => {
                            v.drop_with_heap(&mut self.heap);
                            return Err(LomdaError::expected_type(scrutinee, "a data value"));
                        }
                    },
                    _ => {
                        v.drop_with_heap(&mut self.heap);
                        return Err(LomdaError::expected_type(scrutinee, "a data value"));
                    }
                };
                v.drop_with_heap(&mut self.heap);
                let Some(arm) = arms.iter().find(|arm| arm.kind == kind) else {
                    for f in fields {
                        f.drop_with_heap(&mut self.heap);
                    }
                    return Err(LomdaError::runtime(format!(
                        "switch does not handle constructor '{kind}'"
                    )));
                };
                if arm.params.len() != fields.len() {
                    let fields_len = fields.len();
                    for f in fields {
                        f.drop_with_heap(&mut self.heap);
                    }
                    return Err(LomdaError::runtime(format!(
                        "constructor '{kind}' carries {} fields, but the arm binds {}",
                        fields_len,
                        arm.params.len()
                    )));
                }
                let mut cur = env;
                self.heap.inc_ref(cur);
                for (param, field) in arm.params.iter().zip(fields) {
                    let next = env::extend(&mut self.heap, cur, param.clone(), field);
                    self.heap.dec_ref(cur);
                    cur = next;
                }
                let result = self.evaluate(&arm.body, cur);
                self.heap.dec_ref(cur);
                result
            }

            Expr::Builtin(builtin) => modules::call_builtin(self, *builtin, env),
        }
    }

    /// Function application: clone the closure's captured environment, extend
    /// with parameter bindings in order, evaluate the body, release.
    pub fn apply_lambda(&mut self, f: &Value, args: Vec<Value>) -> RunResult<Value> {
        let Value::Ref(id) = f else {
            for a in args {
                a.drop_with_heap(&mut self.heap);
            }
            return Err(LomdaError::type_err("cannot apply a non-lambda value"));
        };
        let (params, body, captured) = match self.heap.get(*id) {
            HeapData::Lambda(lambda) => (lambda.params.clone(), lambda.body.clone(), lambda.env),
            _ => {
                for a in args {
                    a.drop_with_heap(&mut self.heap);
                }
                return Err(LomdaError::type_err("cannot apply a non-lambda value"));
            }
        };
        if params.len() != args.len() {
            let msg = format!(
                "lambda of {} arguments cannot be applied to {} arguments",
                params.len(),
                args.len()
            );
            for a in args {
                a.drop_with_heap(&mut self.heap);
            }
            return Err(LomdaError::runtime(msg));
        }
        let mut cur = match captured {
            Some(e) => env::clone_chain(&mut self.heap, e),
            None => env::empty(&mut self.heap),
        };
        for (param, arg) in params.iter().zip(args) {
            let next = env::extend(&mut self.heap, cur, param.clone(), arg);
            self.heap.dec_ref(cur);
            cur = next;
        }
        self.depth += 1;
        let result = if self.depth > MAX_RECURSION_DEPTH {
            Err(LomdaError::runtime("exceeded maximum recursion depth"))
        } else {
            self.evaluate(&body, cur)
        };
        self.depth -= 1;
        self.heap.dec_ref(cur);
        result
    }

    fn eval_index(&mut self, index: &Expr, env: HeapId) -> RunResult<usize> {
        let v = self.eval_forced(index, env)?;
        let result = match v.as_int() {
            Some(i) if i >= 0 => Ok(i as usize),
            Some(i) => Err(LomdaError::runtime(format!("index {i} is out of bounds"))),
            None => Err(LomdaError::expected_type(index, "integer")),
        };
        v.drop_with_heap(&mut self.heap);
        result
    }

    fn slice(
        &mut self,
        list: &Expr,
        container: &Value,
        from: Option<&Expr>,
        to: Option<&Expr>,
        env: HeapId,
    ) -> RunResult<Value> {
        let Some(id) = container.as_list_id(&self.heap) else {
            return Err(LomdaError::expected_type(list, "list"));
        };
        let len = match self.heap.get(id) {
            HeapData::List(items) => items.len(),
            _ => unreachable!("checked list"),
        };
        let i = match from {
            Some(e) => self.eval_index(e, env)?,
            None => 0,
        };
        let j = match to {
            Some(e) => self.eval_index(e, env)?,
            None => len,
        };
        if i > len || j > len {
            return Err(LomdaError::runtime(format!(
                "slice {i}:{j} is out of bounds of list of length {len}"
            )));
        }
        let items: Vec<Value> = match self.heap.get(id) {
            HeapData::List(items) => items
                .iter()
                .skip(i)
                .take(j.saturating_sub(i))
                .map(|v| v.clone_with_heap(&self.heap))
                .collect(),
            _ => unreachable!("checked list"),
        };
        Ok(Value::Ref(self.heap.allocate(HeapData::List(items))))
    }

    /// Assignment through an l-value. Takes ownership of `value`'s reference.
    ///
    /// Container targets are overwritten in place (aliases observe the
    /// change); primitive slots are replaced and require a matching tag.
    fn assign(&mut self, target: &Expr, value: Value, env: HeapId) -> RunResult<()> {
        match target {
            Expr::Var(name) => {
                let Some(old) = env::lookup(&self.heap, env, name) else {
                    value.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::runtime(format!("variable '{name}' was not recognized")));
                };
                let old = old.borrow_copy();
                match self.reconcile(&old, value)? {
                    None => Ok(()),
                    Some(v) => {
                        env::set(&mut self.heap, env, name, v).map_err(|v| {
                            let err = LomdaError::runtime(format!("variable '{name}' was not recognized"));
                            v.drop_with_heap(&mut self.heap);
                            err
                        })
                    }
                }
            }
            Expr::ListAccess(list, index) => {
                let container = self.eval_forced(list, env)?;
                let Some(id) = container.as_list_id(&self.heap) else {
                    container.drop_with_heap(&mut self.heap);
                    value.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(list, "list"));
                };
                container.drop_with_heap(&mut self.heap);
                let idx = match self.eval_index(index, env) {
                    Ok(i) => i,
                    Err(e) => {
                        value.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                };
                let old = match self.heap.get(id) {
                    HeapData::List(items) => items.get(idx).map(Value::borrow_copy),
                    _ => unreachable!("checked list"),
                };
                let Some(old) = old else {
                    value.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::runtime(format!("index {idx} is out of bounds")));
                };
                match self.reconcile(&old, value)? {
                    None => Ok(()),
                    Some(v) => {
                        let old = match self.heap.get_mut(id) {
                            HeapData::List(items) => std::mem::replace(&mut items[idx], v),
                            _ => unreachable!("checked list"),
                        };
                        old.drop_with_heap(&mut self.heap);
                        Ok(())
                    }
                }
            }
            Expr::DictAccess(dict, key) => {
                let container = self.eval_forced(dict, env)?;
                let Value::Ref(id) = container else {
                    container.drop_with_heap(&mut self.heap);
                    value.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(dict, "dictionary"));
                };
                if !matches!(self.heap.get(id), HeapData::Dict(_)) {
                    container.drop_with_heap(&mut self.heap);
                    value.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(dict, "dictionary"));
                }
                container.drop_with_heap(&mut self.heap);
                let old = match self.heap.get(id) {
                    HeapData::Dict(entries) => entries.get(key).map(Value::borrow_copy),
                    _ => unreachable!("checked dictionary"),
                };
                match old {
                    // Assigning a fresh key extends the dictionary.
                    None => {
                        let HeapData::Dict(entries) = self.heap.get_mut(id) else {
                            unreachable!("checked dictionary")
                        };
                        entries.insert(key.clone(), value);
                        Ok(())
                    }
                    Some(old) => match self.reconcile(&old, value)? {
                        None => Ok(()),
                        Some(v) => {
                            let old = match self.heap.get_mut(id) {
                                HeapData::Dict(entries) => entries.insert(key.clone(), v),
                                _ => unreachable!("checked dictionary"),
                            };
                            if let Some(old) = old {
                                old.drop_with_heap(&mut self.heap);
                            }
                            Ok(())
                        }
                    },
                }
            }
            Expr::TupleAccess(tuple, side) => {
                let container = self.eval_forced(tuple, env)?;
                let Value::Ref(id) = container else {
                    container.drop_with_heap(&mut self.heap);
                    value.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(tuple, "tuple"));
                };
                if !matches!(self.heap.get(id), HeapData::Tuple(..)) {
                    container.drop_with_heap(&mut self.heap);
                    value.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::expected_type(tuple, "tuple"));
                }
                container.drop_with_heap(&mut self.heap);
                let old = match self.heap.get(id) {
                    HeapData::Tuple(l, r) => match side {
                        TupleSide::Left => l.borrow_copy(),
                        TupleSide::Right => r.borrow_copy(),
                    },
                    _ => unreachable!("checked tuple"),
                };
                match self.reconcile(&old, value)? {
                    None => Ok(()),
                    Some(v) => {
                        let old = match self.heap.get_mut(id) {
                            HeapData::Tuple(l, r) => match side {
                                TupleSide::Left => std::mem::replace(l, v),
                                TupleSide::Right => std::mem::replace(r, v),
                            },
                            _ => unreachable!("checked tuple"),
                        };
                        old.drop_with_heap(&mut self.heap);
                        Ok(())
                    }
                }
            }
            _ => {
                value.drop_with_heap(&mut self.heap);
                Err(LomdaError::type_err(format!("cannot assign to '{target}'")))
            }
        }
    }

    /// Core of the polymorphic set operation. Same-kind containers are
    /// overwritten in place (returning `None`); primitives with matching tags
    /// replace the slot (returning the value to store); mismatched tags fail.
    /// A void slot accepts any replacement.
    fn reconcile(&mut self, old: &Value, new: Value) -> RunResult<Option<Value>> {
        match (old, &new) {
            (Value::Int(_), Value::Int(_))
            | (Value::Real(_), Value::Real(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Void, _) => Ok(Some(new)),
            (Value::Ref(o), Value::Ref(n)) => {
                let same_kind = std::mem::discriminant(self.heap.get(*o)) == std::mem::discriminant(self.heap.get(*n));
                if !same_kind {
                    let msg = format!(
                        "cannot assign a {} to a slot holding a {}",
                        new.type_name(&self.heap),
                        old.type_name(&self.heap)
                    );
                    new.drop_with_heap(&mut self.heap);
                    return Err(LomdaError::type_err(msg));
                }
                if o == n {
                    new.drop_with_heap(&mut self.heap);
                    return Ok(None);
                }
                // Structural copy into the existing slot so aliases observe
                // the assignment. The incoming cells are shared by reference.
                let copy = new.shallow_copy(&mut self.heap);
                new.drop_with_heap(&mut self.heap);
                let Value::Ref(copy_id) = copy else {
                    unreachable!("shallow copy of a ref is a ref")
                };
                let fresh = self.heap.replace(copy_id, HeapData::Str(String::new()));
                let stale = self.heap.replace(*o, fresh);
                let mut children = Vec::new();
                stale.child_ids(&mut children);
                drop(stale);
                for child in children {
                    self.heap.dec_ref(child);
                }
                self.heap.dec_ref(copy_id);
                Ok(None)
            }
            _ => {
                let msg = format!(
                    "cannot assign a {} to a slot holding a {}",
                    new.type_name(&self.heap),
                    old.type_name(&self.heap)
                );
                new.drop_with_heap(&mut self.heap);
                Err(LomdaError::type_err(msg))
            }
        }
    }

    fn cast(&mut self, v: &Value, target: &str) -> RunResult<Value> {
        let fail = |v: &Value, heap: &Heap| {
            Err(LomdaError::type_err(format!(
                "cannot cast {} to {target}",
                v.display(heap)
            )))
        };
        match target {
            "string" => {
                let text = match v.as_str(&self.heap) {
                    Some(s) => s.to_owned(),
                    None => v.display(&self.heap),
                };
                Ok(Value::Ref(self.heap.allocate(HeapData::Str(text))))
            }
            "int" | "integer" => match v {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Real(r) => Ok(Value::Int(*r as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                _ => match v.as_str(&self.heap) {
                    Some(s) => match s.trim().parse::<i64>() {
                        Ok(n) => Ok(Value::Int(n)),
                        Err(_) => fail(v, &self.heap),
                    },
                    None => fail(v, &self.heap),
                },
            },
            "real" => match v {
                Value::Int(n) => Ok(Value::Real(*n as f64)),
                Value::Real(r) => Ok(Value::Real(*r)),
                _ => match v.as_str(&self.heap) {
                    Some(s) => match s.trim().parse::<f64>() {
                        Ok(r) => Ok(Value::Real(r)),
                        Err(_) => fail(v, &self.heap),
                    },
                    None => fail(v, &self.heap),
                },
            },
            "bool" | "boolean" => match v {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Int(n) => Ok(Value::Bool(*n != 0)),
                _ => match v.as_str(&self.heap) {
                    Some("true") => Ok(Value::Bool(true)),
                    Some("false") => Ok(Value::Bool(false)),
                    _ => fail(v, &self.heap),
                },
            },
            _ => Err(LomdaError::type_err(format!("unrecognized cast target '{target}'"))),
        }
    }

    fn isa(&self, v: &Value, shape: &str) -> bool {
        match shape {
            "int" | "integer" => matches!(v, Value::Int(_)),
            "real" => matches!(v, Value::Real(_)),
            "number" => v.is_number(),
            "bool" | "boolean" => matches!(v, Value::Bool(_)),
            "void" => matches!(v, Value::Void),
            "string" => v.as_str(&self.heap).is_some(),
            "list" => matches!(v, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::List(_))),
            "dict" | "dictionary" => {
                matches!(v, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Dict(_)))
            }
            "tuple" => matches!(v, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Tuple(..))),
            "lambda" => matches!(v, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Lambda(_))),
            other => match v {
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::Adt(adt) => adt.type_name == other || adt.kind == other,
                    _ => false,
                },
                _ => false,
            },
        }
    }

    fn membership(&mut self, item: &Expr, x: &Value, set: &Expr, xs: &Value) -> RunResult<Value> {
        if let Some(items) = ops::list_items(&self.heap, xs) {
            let found = items.iter().any(|v| values_equal(&self.heap, x, v));
            return Ok(Value::Bool(found));
        }
        if let Value::Ref(id) = xs {
            match self.heap.get(*id) {
                HeapData::Dict(entries) => {
                    let Some(key) = x.as_str(&self.heap) else {
                        return Err(LomdaError::expected_type(item, "string"));
                    };
                    return Ok(Value::Bool(entries.contains_key(key)));
                }
                HeapData::Str(hay) => {
                    let Some(needle) = x.as_str(&self.heap) else {
                        return Err(LomdaError::expected_type(item, "string"));
                    };
                    return Ok(Value::Bool(hay.contains(needle)));
                }
                _ => {}
            }
        }
        Err(LomdaError::expected_type(set, "list"))
    }

    fn eval_fold(&mut self, list: &Expr, func: &Expr, base: &Expr, env: HeapId) -> RunResult<Value> {
        let lst = self.eval_forced(list, env)?;
        let Some(items) = ops::list_items(&self.heap, &lst) else {
            lst.drop_with_heap(&mut self.heap);
            return Err(LomdaError::expected_type(list, "list"));
        };
        let items: Vec<Value> = items.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
        lst.drop_with_heap(&mut self.heap);

        let f = match self.eval_forced(func, env) {
            Ok(v) => v,
            Err(e) => {
                for v in items {
                    v.drop_with_heap(&mut self.heap);
                }
                return Err(e);
            }
        };
        let arity_ok = matches!(&f, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Lambda(l) if l.params.len() == 2));
        if !arity_ok {
            for v in items {
                v.drop_with_heap(&mut self.heap);
            }
            f.drop_with_heap(&mut self.heap);
            return Err(LomdaError::runtime(format!(
                "function defined by '{func}' does not take exactly two arguments"
            )));
        }

        let mut acc = match self.evaluate(base, env) {
            Ok(v) => v,
            Err(e) => {
                for v in items {
                    v.drop_with_heap(&mut self.heap);
                }
                f.drop_with_heap(&mut self.heap);
                return Err(e);
            }
        };
        let mut items = items.into_iter();
        loop {
            let Some(x) = items.next() else { break };
            let next = self.apply_lambda(&f, vec![acc, x]);
            match next {
                Ok(v) => acc = v,
                Err(e) => {
                    for v in items {
                        v.drop_with_heap(&mut self.heap);
                    }
                    f.drop_with_heap(&mut self.heap);
                    return Err(e);
                }
            }
        }
        f.drop_with_heap(&mut self.heap);
        Ok(acc)
    }

    fn eval_map(&mut self, func: &Expr, list: &Expr, env: HeapId) -> RunResult<Value> {
        let vs = self.eval_forced(list, env)?;
        let f = match self.eval_forced(func, env) {
            Ok(v) => v,
            Err(e) => {
                vs.drop_with_heap(&mut self.heap);
                return Err(e);
            }
        };
        let arity_ok = matches!(&f, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Lambda(l) if l.params.len() == 1));
        if !arity_ok {
            vs.drop_with_heap(&mut self.heap);
            f.drop_with_heap(&mut self.heap);
            return Err(LomdaError::runtime(format!(
                "map function '{func}' does not take exactly one argument"
            )));
        }

        if let Some(items) = ops::list_items(&self.heap, &vs) {
            let items: Vec<Value> = items.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
            vs.drop_with_heap(&mut self.heap);
            let mut out = Vec::with_capacity(items.len());
            let mut items = items.into_iter();
            loop {
                let Some(x) = items.next() else { break };
                match self.apply_lambda(&f, vec![x]) {
                    Ok(v) => out.push(v),
                    Err(e) => {
                        for v in items {
                            v.drop_with_heap(&mut self.heap);
                        }
                        for v in out {
                            v.drop_with_heap(&mut self.heap);
                        }
                        f.drop_with_heap(&mut self.heap);
                        return Err(e);
                    }
                }
            }
            f.drop_with_heap(&mut self.heap);
            return Ok(Value::Ref(self.heap.allocate(HeapData::List(out))));
        }

        // Not a list: a warning by default, then apply the function directly.
        if let Err(e) = warn(
            ErrorCategory::Runtime,
            format!("expression '{list}' does not evaluate as list"),
        ) {
            vs.drop_with_heap(&mut self.heap);
            f.drop_with_heap(&mut self.heap);
            return Err(e);
        }
        let result = self.apply_lambda(&f, vec![vs]);
        f.drop_with_heap(&mut self.heap);
        result
    }

    /// Resolves and evaluates a module, consulting the cache when enabled.
    fn load_module(&mut self, name: &str) -> RunResult<Value> {
        if config::use_module_caching()
            && let Some(v) = self.modules.get(name)
        {
            let v = v.borrow_copy();
            return Ok(v.clone_with_heap(&self.heap));
        }
        let value = if let Some(v) = modules::load_stdlib(self, name)? {
            v
        } else {
            let path = format!("{name}.lom");
            let source = std::fs::read_to_string(&path)
                .map_err(|_| LomdaError::io(format!("could not load module from '{path}'")))?;
            let program = parse::parse_program(&source)?;
            let root = env::empty(&mut self.heap);
            let result = self.evaluate(&program, root);
            self.heap.dec_ref(root);
            let v = result?;
            self.force(v)?
        };
        if config::use_module_caching() {
            let cached = value.clone_with_heap(&self.heap);
            if let Some(old) = self.modules.insert(name.to_owned(), cached) {
                old.drop_with_heap(&mut self.heap);
            }
        }
        Ok(value)
    }

    /// Releases the module cache; called before the heap is torn down.
    pub fn clear_module_cache(&mut self) {
        for (_, v) in std::mem::take(&mut self.modules) {
            v.drop_with_heap(&mut self.heap);
        }
    }
}
