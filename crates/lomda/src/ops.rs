//! Value-level arithmetic: the operator semantics shared by evaluation and
//! differentiation.
//!
//! Arithmetic promotes integers to reals when either side is real, extends
//! pointwise to equal-length lists, and gives list-of-list matrices standard
//! matrix semantics (matrix x matrix, matrix x vector, dot product).
//! Plain multiplication is bounded at rank-2 operands; the derivative engine
//! uses [`mul_value_by_deriv`] and [`mul_deriv_by_value`], which contract
//! value axes only so the trailing seed axes of a container differentiation
//! variable ride along pointwise.

use crate::{
    ast::{CmpOp, MathFn},
    error::{LomdaError, RunResult},
    heap::{Heap, HeapData},
    value::Value,
};

/// Matrix power series terminate when the term's Frobenius norm drops under this.
const TAYLOR_EPSILON: f64 = 1e-4;

impl Value {
    /// Non-owning bit copy used while traversing containers. The copy borrows
    /// the container's reference; it must never be dropped with the heap.
    pub(crate) fn borrow_copy(&self) -> Self {
        match self {
            Self::Int(n) => Self::Int(*n),
            Self::Real(r) => Self::Real(*r),
            Self::Bool(b) => Self::Bool(*b),
            Self::Void => Self::Void,
            Self::Ref(id) => Self::Ref(*id),
        }
    }
}

/// Reads the elements of a list value as borrowed copies.
pub(crate) fn list_items(heap: &Heap, v: &Value) -> Option<Vec<Value>> {
    match v {
        Value::Ref(id) => match heap.get(*id) {
            HeapData::List(items) => Some(items.iter().map(Value::borrow_copy).collect()),
            _ => None,
        },
        _ => None,
    }
}

/// The number of elements when `v` is a list of numbers.
pub(crate) fn is_vector(heap: &Heap, v: &Value) -> Option<usize> {
    let items = list_items(heap, v)?;
    if items.iter().all(Value::is_number) {
        Some(items.len())
    } else {
        None
    }
}

/// The dimensions when `v` is a rectangular, non-empty list of number rows.
pub(crate) fn is_matrix(heap: &Heap, v: &Value) -> Option<(usize, usize)> {
    let rows = list_items(heap, v)?;
    if rows.is_empty() {
        return None;
    }
    let cols = is_vector(heap, &rows[0])?;
    if cols == 0 {
        return None;
    }
    for row in &rows[1..] {
        if is_vector(heap, row) != Some(cols) {
            return None;
        }
    }
    Some((rows.len(), cols))
}

/// Nesting depth along first elements: scalars are rank 0, vectors rank 1.
pub(crate) fn rank(heap: &Heap, v: &Value) -> usize {
    let mut depth = 0;
    let mut cur = v.borrow_copy();
    while let Some(items) = list_items(heap, &cur) {
        depth += 1;
        match items.first() {
            Some(first) => cur = first.borrow_copy(),
            None => break,
        }
    }
    depth
}

/// An n-by-n identity matrix of integer entries.
pub(crate) fn identity_matrix(heap: &mut Heap, n: usize) -> Value {
    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let row: Vec<Value> = (0..n).map(|j| Value::Int(i64::from(i == j))).collect();
        rows.push(Value::Ref(heap.allocate(HeapData::List(row))));
    }
    Value::Ref(heap.allocate(HeapData::List(rows)))
}

/// Frobenius-sense negligibility test for power-series terms.
fn is_negligible_matrix(heap: &Heap, v: &Value) -> bool {
    let Some(rows) = list_items(heap, v) else { return true };
    let mut sum = 0.0;
    for row in rows {
        let Some(entries) = list_items(heap, &row) else {
            return true;
        };
        for entry in entries {
            let f = entry.as_f64().unwrap_or(0.0);
            sum += f * f;
        }
    }
    sum <= TAYLOR_EPSILON * TAYLOR_EPSILON
}

fn numeric_pair(a: &Value, b: &Value) -> Option<(f64, f64)> {
    Some((a.as_f64()?, b.as_f64()?))
}

fn binop_error(verb: &str, heap: &Heap, a: &Value, b: &Value) -> LomdaError {
    LomdaError::runtime(format!(
        "{verb} is not defined between {} and {}",
        a.display(heap),
        b.display(heap)
    ))
}

/// Pointwise addition, with integer overflow promoting to real.
pub(crate) fn add(heap: &mut Heap, a: &Value, b: &Value) -> RunResult<Value> {
    elementwise(heap, a, b, "addition", |x, y| x.checked_add(y), |x, y| x + y)
}

/// Pointwise subtraction.
pub(crate) fn sub(heap: &mut Heap, a: &Value, b: &Value) -> RunResult<Value> {
    elementwise(heap, a, b, "subtraction", |x, y| x.checked_sub(y), |x, y| x - y)
}

fn elementwise(
    heap: &mut Heap,
    a: &Value,
    b: &Value,
    verb: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    real_op: fn(f64, f64) -> f64,
) -> RunResult<Value> {
    if let Some(xs) = list_items(heap, a) {
        let Some(ys) = list_items(heap, b) else {
            return Err(binop_error(verb, heap, a, b));
        };
        if xs.len() != ys.len() {
            return Err(LomdaError::runtime(format!(
                "cannot combine lists {} and {} of differing lengths",
                a.display(heap),
                b.display(heap)
            )));
        }
        let mut out = Vec::with_capacity(xs.len());
        for (x, y) in xs.iter().zip(&ys) {
            match elementwise(heap, x, y, verb, int_op, real_op) {
                Ok(v) => out.push(v),
                Err(e) => {
                    for v in out {
                        v.drop_with_heap(heap);
                    }
                    return Err(e);
                }
            }
        }
        return Ok(Value::Ref(heap.allocate(HeapData::List(out))));
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(int_op(*x, *y)
            .map(Value::Int)
            .unwrap_or_else(|| Value::Real(real_op(*x as f64, *y as f64)))),
        _ => {
            let (x, y) = numeric_pair(a, b).ok_or_else(|| binop_error(verb, heap, a, b))?;
            Ok(Value::Real(real_op(x, y)))
        }
    }
}

/// Multiplication: scalars, scalar-by-list scaling, dot products, and the
/// recursive matrix contraction.
pub(crate) fn mul(heap: &mut Heap, a: &Value, b: &Value) -> RunResult<Value> {
    if list_items(heap, a).is_some() {
        if list_items(heap, b).is_some() {
            return mul_lists(heap, a, b);
        }
        // list * scalar: scale each element
        let xs = list_items(heap, a).expect("checked list");
        let mut out = Vec::with_capacity(xs.len());
        for x in &xs {
            match mul(heap, x, b) {
                Ok(v) => out.push(v),
                Err(e) => {
                    for v in out {
                        v.drop_with_heap(heap);
                    }
                    return Err(e);
                }
            }
        }
        return Ok(Value::Ref(heap.allocate(HeapData::List(out))));
    }
    if list_items(heap, b).is_some() {
        return mul(heap, b, a);
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x
            .checked_mul(*y)
            .map(Value::Int)
            .unwrap_or_else(|| Value::Real(*x as f64 * *y as f64))),
        _ => {
            let (x, y) = numeric_pair(a, b).ok_or_else(|| binop_error("multiplication", heap, a, b))?;
            Ok(Value::Real(x * y))
        }
    }
}

fn mul_lists(heap: &mut Heap, a: &Value, b: &Value) -> RunResult<Value> {
    let xs = list_items(heap, a).expect("checked list");
    let ys = list_items(heap, b).expect("checked list");
    if xs.is_empty() || ys.is_empty() {
        return Err(LomdaError::runtime("multiplication is not defined on empty lists"));
    }
    let ord_a = rank(heap, a);
    let ord_b = rank(heap, b);
    for ord in [ord_a, ord_b] {
        if ord > 2 {
            return Err(LomdaError::runtime(format!(
                "multiplication is not defined on tensors of rank {ord}"
            )));
        }
    }

    if ord_a >= 2 {
        // Row by row: (A * B)[i] = A[i] * B
        let mut out = Vec::with_capacity(xs.len());
        for row in &xs {
            match mul(heap, row, b) {
                Ok(v) => out.push(v),
                Err(e) => {
                    for v in out {
                        v.drop_with_heap(heap);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Value::Ref(heap.allocate(HeapData::List(out))))
    } else if ord_b >= 2 {
        // Vector by matrix: sum of scaled rows.
        contract(heap, &xs, &ys, a, b, None)
    } else {
        // Dot product of two vectors.
        contract(heap, &xs, &ys, a, b, Some(Value::Int(0)))
    }
}

/// Computes `sum_k xs[k] * ys[k]`, failing on length mismatch.
fn contract(
    heap: &mut Heap,
    xs: &[Value],
    ys: &[Value],
    a: &Value,
    b: &Value,
    zero: Option<Value>,
) -> RunResult<Value> {
    if xs.len() != ys.len() {
        return Err(LomdaError::runtime(format!(
            "multiplication is not defined on non-matching lists (see: {} * {})",
            a.display(heap),
            b.display(heap)
        )));
    }
    let mut acc = zero;
    for (x, y) in xs.iter().zip(ys) {
        let term = mul(heap, x, y)?;
        acc = match acc {
            None => Some(term),
            Some(prev) => {
                let next = add(heap, &prev, &term);
                prev.drop_with_heap(heap);
                term.drop_with_heap(heap);
                Some(next?)
            }
        };
    }
    Ok(acc.expect("non-empty operands"))
}

/// Multiplies a value into a derivative whose trailing axes carry the seed
/// shape of the differentiation variable.
///
/// Contraction consumes the value's trailing axis and the derivative's
/// leading axis; whatever the derivative carries beyond its value shape is
/// scaled and summed pointwise. With scalar seeds this coincides with
/// [`mul`]; with a matrix seed it is what lets `d/dm (m * m)` widen to the
/// per-entry gradients instead of failing the rank bound.
pub(crate) fn mul_value_by_deriv(heap: &mut Heap, a: &Value, db: &Value) -> RunResult<Value> {
    if rank(heap, a) >= 2 {
        // Peel a leading axis of the value: (a * db)[i] = a[i] * db.
        let rows = list_items(heap, a).expect("rank two needs a list");
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match mul_value_by_deriv(heap, row, db) {
                Ok(v) => out.push(v),
                Err(e) => {
                    for v in out {
                        v.drop_with_heap(heap);
                    }
                    return Err(e);
                }
            }
        }
        return Ok(Value::Ref(heap.allocate(HeapData::List(out))));
    }
    if let (Some(xs), Some(ys)) = (list_items(heap, a), list_items(heap, db)) {
        if xs.len() != ys.len() {
            return Err(LomdaError::runtime(format!(
                "multiplication is not defined on non-matching lists (see: {} * {})",
                a.display(heap),
                db.display(heap)
            )));
        }
        if xs.is_empty() {
            return Err(LomdaError::runtime("multiplication is not defined on empty lists"));
        }
        // Vector against the derivative's leading axis: sum of scaled slices.
        let mut acc: Option<Value> = None;
        for (x, y) in xs.iter().zip(&ys) {
            let term = match mul(heap, x, y) {
                Ok(v) => v,
                Err(e) => {
                    if let Some(prev) = acc {
                        prev.drop_with_heap(heap);
                    }
                    return Err(e);
                }
            };
            acc = match acc {
                None => Some(term),
                Some(prev) => {
                    let next = add(heap, &prev, &term);
                    prev.drop_with_heap(heap);
                    term.drop_with_heap(heap);
                    Some(next?)
                }
            };
        }
        return Ok(acc.expect("non-empty operands"));
    }
    mul(heap, a, db)
}

/// Multiplies a derivative into a value. The derivative's leading
/// `value_rank` axes are the differentiated value's own shape; its trailing
/// axes carry the seed. Contraction consumes the last value axis against the
/// value's leading axis, transposing the scalar coefficients out of the
/// value side so the seed slices stay intact.
pub(crate) fn mul_deriv_by_value(heap: &mut Heap, da: &Value, b: &Value, value_rank: usize) -> RunResult<Value> {
    if value_rank >= 2 {
        // Peel a leading value axis of the derivative.
        let Some(rows) = list_items(heap, da) else {
            return Err(binop_error("multiplication", heap, da, b));
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match mul_deriv_by_value(heap, row, b, value_rank - 1) {
                Ok(v) => out.push(v),
                Err(e) => {
                    for v in out {
                        v.drop_with_heap(heap);
                    }
                    return Err(e);
                }
            }
        }
        return Ok(Value::Ref(heap.allocate(HeapData::List(out))));
    }
    if value_rank == 1 {
        let Some(das) = list_items(heap, da) else {
            return Err(binop_error("multiplication", heap, da, b));
        };
        let Some(bs) = list_items(heap, b) else {
            return Err(binop_error("multiplication", heap, da, b));
        };
        if das.len() != bs.len() {
            return Err(LomdaError::runtime(format!(
                "multiplication is not defined on non-matching lists (see: {} * {})",
                da.display(heap),
                b.display(heap)
            )));
        }
        if das.is_empty() {
            return Err(LomdaError::runtime("multiplication is not defined on empty lists"));
        }
        if rank(heap, b) >= 2 {
            // (da * b)[j] = sum over k of b[k][j] * da[k].
            let cols = list_items(heap, &bs[0]).map(|row| row.len()).unwrap_or(0);
            let mut out: Vec<Value> = Vec::with_capacity(cols);
            for j in 0..cols {
                let mut acc: Option<Value> = None;
                for (da_k, b_k) in das.iter().zip(&bs) {
                    let coeff = match list_items(heap, b_k).and_then(|row| row.get(j).map(Value::borrow_copy)) {
                        Some(c) => c,
                        None => {
                            if let Some(prev) = acc {
                                prev.drop_with_heap(heap);
                            }
                            for v in out {
                                v.drop_with_heap(heap);
                            }
                            return Err(LomdaError::runtime(format!(
                                "multiplication is not defined on non-matching lists (see: {} * {})",
                                da.display(heap),
                                b.display(heap)
                            )));
                        }
                    };
                    let term = match mul(heap, &coeff, da_k) {
                        Ok(v) => v,
                        Err(e) => {
                            if let Some(prev) = acc {
                                prev.drop_with_heap(heap);
                            }
                            for v in out {
                                v.drop_with_heap(heap);
                            }
                            return Err(e);
                        }
                    };
                    acc = match acc {
                        None => Some(term),
                        Some(prev) => {
                            let next = add(heap, &prev, &term);
                            prev.drop_with_heap(heap);
                            term.drop_with_heap(heap);
                            match next {
                                Ok(v) => Some(v),
                                Err(e) => {
                                    for v in out {
                                        v.drop_with_heap(heap);
                                    }
                                    return Err(e);
                                }
                            }
                        }
                    };
                }
                out.push(acc.expect("non-empty operands"));
            }
            return Ok(Value::Ref(heap.allocate(HeapData::List(out))));
        }
        // Vector value: plain contraction with the seed slices scaled.
        let mut acc: Option<Value> = None;
        for (da_k, b_k) in das.iter().zip(&bs) {
            let term = match mul(heap, b_k, da_k) {
                Ok(v) => v,
                Err(e) => {
                    if let Some(prev) = acc {
                        prev.drop_with_heap(heap);
                    }
                    return Err(e);
                }
            };
            acc = match acc {
                None => Some(term),
                Some(prev) => {
                    let next = add(heap, &prev, &term);
                    prev.drop_with_heap(heap);
                    term.drop_with_heap(heap);
                    Some(next?)
                }
            };
        }
        return Ok(acc.expect("non-empty operands"));
    }
    mul(heap, da, b)
}

/// Division: the divisor must be a number; a list dividend divides pointwise.
/// Division by zero follows float semantics and surfaces NaN or infinity.
pub(crate) fn div(heap: &mut Heap, a: &Value, b: &Value) -> RunResult<Value> {
    if !b.is_number() {
        return Err(binop_error("division", heap, a, b));
    }
    if let Some(xs) = list_items(heap, a) {
        let mut out = Vec::with_capacity(xs.len());
        for x in &xs {
            match div(heap, x, b) {
                Ok(v) => out.push(v),
                Err(e) => {
                    for v in out {
                        v.drop_with_heap(heap);
                    }
                    return Err(e);
                }
            }
        }
        return Ok(Value::Ref(heap.allocate(HeapData::List(out))));
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) if *y != 0 => Ok(Value::Int(x / y)),
        _ => {
            let (x, y) = numeric_pair(a, b).ok_or_else(|| binop_error("division", heap, a, b))?;
            Ok(Value::Real(x / y))
        }
    }
}

/// Modulus on numbers; a zero divisor surfaces NaN.
pub(crate) fn modulo(heap: &mut Heap, a: &Value, b: &Value) -> RunResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) if *y != 0 => Ok(Value::Int(x % y)),
        _ => {
            let (x, y) = numeric_pair(a, b).ok_or_else(|| binop_error("modulus", heap, a, b))?;
            Ok(Value::Real(x % y))
        }
    }
}

/// Exponential of a number, or of a square matrix by truncated Taylor series.
pub(crate) fn val_exp(heap: &mut Heap, v: &Value) -> RunResult<Value> {
    if let Some(x) = v.as_f64() {
        return Ok(Value::Real(x.exp()));
    }
    let Some((rows, cols)) = is_matrix(heap, v) else {
        return Err(LomdaError::runtime(format!(
            "exponentiation is not defined on {}",
            v.display(heap)
        )));
    };
    if rows != cols {
        return Err(LomdaError::runtime(format!(
            "exponentiation is not defined on non-square matrix {}",
            v.display(heap)
        )));
    }

    // S = sum over n of v^n / n!, accumulated until the term is negligible.
    let mut term = identity_matrix(heap, rows);
    let mut sum = identity_matrix(heap, rows);
    let mut n = 1i64;
    while !is_negligible_matrix(heap, &term) {
        let raised = mul(heap, &term, v);
        term.drop_with_heap(heap);
        let raised = match raised {
            Ok(r) => r,
            Err(e) => {
                sum.drop_with_heap(heap);
                return Err(e);
            }
        };
        let divided = div(heap, &raised, &Value::Int(n));
        raised.drop_with_heap(heap);
        term = match divided {
            Ok(t) => t,
            Err(e) => {
                sum.drop_with_heap(heap);
                return Err(e);
            }
        };
        let next = add(heap, &sum, &term);
        sum.drop_with_heap(heap);
        sum = match next {
            Ok(s) => s,
            Err(e) => {
                term.drop_with_heap(heap);
                return Err(e);
            }
        };
        n += 1;
    }
    term.drop_with_heap(heap);
    Ok(sum)
}

/// Natural logarithm of a number, or of a square matrix by the Mercator
/// series, truncated on Frobenius negligibility.
pub(crate) fn val_log(heap: &mut Heap, v: &Value) -> RunResult<Value> {
    if let Some(x) = v.as_f64() {
        return Ok(Value::Real(x.ln()));
    }
    let Some((rows, cols)) = is_matrix(heap, v) else {
        return Err(LomdaError::runtime(format!(
            "logarithm is not defined on {}",
            v.display(heap)
        )));
    };
    if rows != cols {
        return Err(LomdaError::runtime(format!(
            "logarithm is not defined on non-square matrix {}",
            v.display(heap)
        )));
    }

    let identity = identity_matrix(heap, rows);
    // log v = -(sum over n of (I - v)^n / n); accumulate via v - I times (I - v)^(n-1).
    let seed = sub(heap, v, &identity);
    let x = sub(heap, &identity, v);
    identity.drop_with_heap(heap);
    let (seed, x) = match (seed, x) {
        (Ok(s), Ok(x)) => (s, x),
        (s, x) => {
            if let Ok(s) = s {
                s.drop_with_heap(heap);
            }
            if let Ok(x) = x {
                x.drop_with_heap(heap);
            }
            return Err(LomdaError::runtime(format!(
                "logarithm is not defined on {}",
                v.display(heap)
            )));
        }
    };
    let mut power = seed.clone_with_heap(heap);
    let mut sum = seed.clone_with_heap(heap);
    let mut term = seed;
    let mut n = 2i64;
    while !is_negligible_matrix(heap, &term) {
        let raised = mul(heap, &power, &x);
        power.drop_with_heap(heap);
        power = match raised {
            Ok(p) => p,
            Err(e) => {
                term.drop_with_heap(heap);
                sum.drop_with_heap(heap);
                x.drop_with_heap(heap);
                return Err(e);
            }
        };
        term.drop_with_heap(heap);
        let divided = div(heap, &power, &Value::Int(n));
        term = match divided {
            Ok(t) => t,
            Err(e) => {
                sum.drop_with_heap(heap);
                power.drop_with_heap(heap);
                x.drop_with_heap(heap);
                return Err(e);
            }
        };
        let next = add(heap, &sum, &term);
        sum.drop_with_heap(heap);
        sum = match next {
            Ok(s) => s,
            Err(e) => {
                term.drop_with_heap(heap);
                power.drop_with_heap(heap);
                x.drop_with_heap(heap);
                return Err(e);
            }
        };
        n += 1;
    }
    term.drop_with_heap(heap);
    power.drop_with_heap(heap);
    x.drop_with_heap(heap);
    Ok(sum)
}

/// Exponentiation. Integer exponents use fast squaring (identity-matrix
/// seeding for square matrices, reciprocal for negative exponents); real
/// exponents use `exp(p * log b)`.
pub(crate) fn pow(heap: &mut Heap, base: &Value, exponent: &Value) -> RunResult<Value> {
    match exponent {
        Value::Int(n) => pow_int(heap, base, *n),
        Value::Real(p) => {
            if let Some(x) = base.as_f64() {
                return Ok(Value::Real((p * x.ln()).exp()));
            }
            let ln = val_log(heap, base)?;
            let scaled = mul(heap, exponent, &ln);
            ln.drop_with_heap(heap);
            let scaled = scaled?;
            let result = val_exp(heap, &scaled);
            scaled.drop_with_heap(heap);
            result
        }
        _ => Err(binop_error("exponentiation", heap, base, exponent)),
    }
}

fn pow_int(heap: &mut Heap, base: &Value, n: i64) -> RunResult<Value> {
    if n < 0 {
        let one = Value::Real(1.0);
        let recip = div(heap, &one, base)?;
        // Negating i64::MIN overflows: square the reciprocal and halve.
        let result = if n == i64::MIN {
            let squared = mul(heap, &recip, &recip)?;
            let r = pow_int(heap, &squared, -(n / 2));
            squared.drop_with_heap(heap);
            r
        } else {
            pow_int(heap, &recip, -n)
        };
        recip.drop_with_heap(heap);
        return result;
    }

    // Identity seed: 1 for numbers, I for square matrices.
    let mut acc = if base.is_number() {
        Value::Int(1)
    } else if let Some((rows, cols)) = is_matrix(heap, base) {
        if rows != cols {
            return Err(LomdaError::runtime(format!(
                "exponentiation is not defined on non-square matrix {}",
                base.display(heap)
            )));
        }
        identity_matrix(heap, rows)
    } else {
        return Err(binop_error("exponentiation", heap, base, &Value::Int(n)));
    };

    if n == 0 {
        return Ok(acc);
    }
    let mut sq = base.shallow_copy(heap);
    let mut n = n;
    loop {
        if n & 1 == 1 {
            let next = mul(heap, &acc, &sq);
            acc.drop_with_heap(heap);
            match next {
                Ok(v) => acc = v,
                Err(e) => {
                    sq.drop_with_heap(heap);
                    return Err(e);
                }
            }
        }
        n >>= 1;
        if n == 0 {
            break;
        }
        let next = mul(heap, &sq, &sq);
        sq.drop_with_heap(heap);
        match next {
            Ok(v) => sq = v,
            Err(e) => {
                acc.drop_with_heap(heap);
                return Err(e);
            }
        }
    }
    sq.drop_with_heap(heap);
    Ok(acc)
}

/// Comparison semantics: numbers compare numerically, booleans support
/// equality, void equals void, everything else compares false.
pub(crate) fn compare(op: CmpOp, a: &Value, b: &Value) -> Value {
    if a.is_number() && b.is_number() {
        let (x, y) = (a.as_f64().expect("number"), b.as_f64().expect("number"));
        let res = match op {
            CmpOp::Eq => x == y,
            CmpOp::Neq => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Gt => x > y,
            CmpOp::Leq => x <= y,
            CmpOp::Geq => x >= y,
        };
        return Value::Bool(res);
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => match op {
            CmpOp::Eq => Value::Bool(x == y),
            CmpOp::Neq => Value::Bool(x != y),
            _ => Value::Bool(false),
        },
        (Value::Void, Value::Void) => Value::Bool(op == CmpOp::Eq),
        _ => Value::Bool(false),
    }
}

/// Determinant of a numeric matrix by Gaussian elimination with partial
/// pivoting. Returns an error on non-square input.
pub(crate) fn determinant(heap: &Heap, v: &Value) -> RunResult<f64> {
    let Some((rows, cols)) = is_matrix(heap, v) else {
        return Err(LomdaError::runtime(format!(
            "determinant is not defined on {}",
            v.display(heap)
        )));
    };
    if rows != cols {
        return Err(LomdaError::runtime(format!(
            "determinant is not defined on non-square matrix {}",
            v.display(heap)
        )));
    }
    let mut m = matrix_entries(heap, v).expect("checked matrix");
    let n = rows;
    let mut det = 1.0;
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .expect("non-empty range");
        if m[pivot][col] == 0.0 {
            return Ok(0.0);
        }
        if pivot != col {
            m.swap(pivot, col);
            det = -det;
        }
        det *= m[col][col];
        for row in col + 1..n {
            let factor = m[row][col] / m[col][col];
            for k in col..n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }
    Ok(det)
}

/// Numeric matrix contents as rows of floats.
pub(crate) fn matrix_entries(heap: &Heap, v: &Value) -> Option<Vec<Vec<f64>>> {
    let rows = list_items(heap, v)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let entries = list_items(heap, &row)?;
        let mut floats = Vec::with_capacity(entries.len());
        for e in entries {
            floats.push(e.as_f64()?);
        }
        out.push(floats);
    }
    Some(out)
}

/// Builds a numeric matrix value from rows of floats.
pub(crate) fn matrix_from_entries(heap: &mut Heap, entries: &[Vec<f64>]) -> Value {
    let mut rows = Vec::with_capacity(entries.len());
    for row in entries {
        let vals: Vec<Value> = row.iter().map(|&f| Value::Real(f)).collect();
        rows.push(Value::Ref(heap.allocate(HeapData::List(vals))));
    }
    Value::Ref(heap.allocate(HeapData::List(rows)))
}

/// Magnitude: absolute value for numbers, determinant for matrices, length
/// for other lists.
pub(crate) fn magnitude(heap: &Heap, v: &Value) -> RunResult<Value> {
    match v {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Real(r) => Ok(Value::Real(r.abs())),
        _ => {
            if is_matrix(heap, v).is_some() {
                return determinant(heap, v).map(Value::Real);
            }
            if let Some(items) = list_items(heap, v) {
                return Ok(Value::Int(items.len() as i64));
            }
            Err(LomdaError::type_err(format!(
                "magnitude is not defined on {}",
                v.display(heap)
            )))
        }
    }
}

/// Norm: absolute value for numbers, Euclidean norm for numeric vectors,
/// Frobenius norm for matrices.
pub(crate) fn norm(heap: &Heap, v: &Value) -> RunResult<Value> {
    if let Some(x) = v.as_f64() {
        return Ok(Value::Real(x.abs()));
    }
    if is_vector(heap, v).is_some() {
        let items = list_items(heap, v).expect("checked vector");
        let sum: f64 = items.iter().map(|x| {
            let f = x.as_f64().expect("checked numeric");
            f * f
        }).sum();
        return Ok(Value::Real(sum.sqrt()));
    }
    if is_matrix(heap, v).is_some() {
        let entries = matrix_entries(heap, v).expect("checked matrix");
        let sum: f64 = entries.iter().flatten().map(|f| f * f).sum();
        return Ok(Value::Real(sum.sqrt()));
    }
    Err(LomdaError::type_err(format!(
        "norm is not defined on {}",
        v.display(heap)
    )))
}

/// Evaluates a standard math function over a forced value.
pub(crate) fn math_fn(heap: &mut Heap, fun: MathFn, v: &Value) -> RunResult<Value> {
    let non_numeric = || {
        LomdaError::type_err(format!(
            "{fun} is undefined for inputs outside of R"
        ))
    };
    match fun {
        MathFn::Max | MathFn::Min => {
            let items = list_items(heap, v).ok_or_else(non_numeric)?;
            let mut best: Option<f64> = None;
            for item in &items {
                let x = item.as_f64().ok_or_else(non_numeric)?;
                best = Some(match best {
                    None => x,
                    Some(b) => {
                        if fun == MathFn::Max {
                            b.max(x)
                        } else {
                            b.min(x)
                        }
                    }
                });
            }
            best.map(Value::Real)
                .ok_or_else(|| LomdaError::runtime(format!("{fun} is not defined on empty lists")))
        }
        MathFn::Log => val_log(heap, v),
        MathFn::Exp => val_exp(heap, v),
        MathFn::Sqrt => {
            let x = v.as_f64().ok_or_else(non_numeric)?;
            Ok(Value::Real(x.sqrt()))
        }
        _ => {
            let x = v.as_f64().ok_or_else(non_numeric)?;
            let y = match fun {
                MathFn::Sin => x.sin(),
                MathFn::Cos => x.cos(),
                MathFn::Tan => x.tan(),
                MathFn::Asin => x.asin(),
                MathFn::Acos => x.acos(),
                MathFn::Atan => x.atan(),
                MathFn::Sinh => x.sinh(),
                MathFn::Cosh => x.cosh(),
                MathFn::Tanh => x.tanh(),
                _ => unreachable!("handled above"),
            };
            Ok(Value::Real(y))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(heap: &mut Heap, items: Vec<Value>) -> Value {
        Value::Ref(heap.allocate(HeapData::List(items)))
    }

    fn int_list(heap: &mut Heap, items: &[i64]) -> Value {
        let vals = items.iter().map(|&n| Value::Int(n)).collect();
        list(heap, vals)
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        let mut heap = Heap::new();
        assert_eq!(add(&mut heap, &Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(mul(&mut heap, &Value::Int(4), &Value::Int(5)).unwrap(), Value::Int(20));
        assert_eq!(div(&mut heap, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Int(3));
    }

    #[test]
    fn reals_promote() {
        let mut heap = Heap::new();
        assert_eq!(
            add(&mut heap, &Value::Int(2), &Value::Real(0.5)).unwrap(),
            Value::Real(2.5)
        );
    }

    #[test]
    fn division_by_zero_is_not_an_error() {
        let mut heap = Heap::new();
        let v = div(&mut heap, &Value::Int(1), &Value::Int(0)).unwrap();
        assert_eq!(v, Value::Real(f64::INFINITY));
        let v = div(&mut heap, &Value::Int(0), &Value::Int(0)).unwrap();
        let Value::Real(r) = v else { panic!("expected real") };
        assert!(r.is_nan());
    }

    #[test]
    fn list_addition_is_pointwise() {
        let mut heap = Heap::new();
        let a = int_list(&mut heap, &[1, 2]);
        let b = int_list(&mut heap, &[10, 20]);
        let c = add(&mut heap, &a, &b).unwrap();
        assert_eq!(c.display(&heap), "[11, 22]");
    }

    #[test]
    fn mismatched_lengths_fail() {
        let mut heap = Heap::new();
        let a = int_list(&mut heap, &[1, 2]);
        let b = int_list(&mut heap, &[1]);
        assert!(add(&mut heap, &a, &b).is_err());
    }

    #[test]
    fn dot_product() {
        let mut heap = Heap::new();
        let a = int_list(&mut heap, &[1, 2, 3]);
        let b = int_list(&mut heap, &[4, 5, 6]);
        assert_eq!(mul(&mut heap, &a, &b).unwrap(), Value::Int(32));
    }

    #[test]
    fn matrix_product() {
        let mut heap = Heap::new();
        let r0 = int_list(&mut heap, &[1, 2]);
        let r1 = int_list(&mut heap, &[3, 4]);
        let m = list(&mut heap, vec![r0, r1]);
        let sq = mul(&mut heap, &m, &m).unwrap();
        assert_eq!(sq.display(&heap), "[[7, 10], [15, 22]]");
    }

    #[test]
    fn matrix_vector_product() {
        let mut heap = Heap::new();
        let r0 = int_list(&mut heap, &[1, 2]);
        let r1 = int_list(&mut heap, &[3, 4]);
        let m = list(&mut heap, vec![r0, r1]);
        let v = int_list(&mut heap, &[1, 1]);
        let mv = mul(&mut heap, &m, &v).unwrap();
        assert_eq!(mv.display(&heap), "[3, 7]");
    }

    /// The elementary matrix with a single 1 at (i, j).
    fn e_matrix(heap: &mut Heap, i: usize, j: usize) -> Value {
        let mut rows = Vec::new();
        for r in 0..2 {
            let row: Vec<Value> = (0..2).map(|c| Value::Int(i64::from(r == i && c == j))).collect();
            rows.push(Value::Ref(heap.allocate(HeapData::List(row))));
        }
        Value::Ref(heap.allocate(HeapData::List(rows)))
    }

    /// The identity-diagonal seed for a 2-by-2 matrix variable: a 2-by-2
    /// nesting of elementary matrices.
    fn identity_seed(heap: &mut Heap) -> Value {
        let mut outer = Vec::new();
        for i in 0..2 {
            let row: Vec<Value> = (0..2).map(|j| e_matrix(heap, i, j)).collect();
            outer.push(Value::Ref(heap.allocate(HeapData::List(row))));
        }
        Value::Ref(heap.allocate(HeapData::List(outer)))
    }

    #[test]
    fn deriv_products_match_plain_multiplication_on_scalar_seeds() {
        let mut heap = Heap::new();
        let r0 = int_list(&mut heap, &[1, 2]);
        let r1 = int_list(&mut heap, &[3, 4]);
        let m = list(&mut heap, vec![r0, r1]);
        let d0 = int_list(&mut heap, &[5, 6]);
        let d1 = int_list(&mut heap, &[7, 8]);
        let dm = list(&mut heap, vec![d0, d1]);
        let plain_a = mul(&mut heap, &m, &dm).unwrap();
        let carried_a = mul_value_by_deriv(&mut heap, &m, &dm).unwrap();
        assert_eq!(plain_a.display(&heap), carried_a.display(&heap));
        let plain_b = mul(&mut heap, &dm, &m).unwrap();
        let carried_b = mul_deriv_by_value(&mut heap, &dm, &m, 2).unwrap();
        assert_eq!(plain_b.display(&heap), carried_b.display(&heap));
    }

    #[test]
    fn value_by_deriv_carries_seed_axes() {
        let mut heap = Heap::new();
        let r0 = int_list(&mut heap, &[1, 2]);
        let r1 = int_list(&mut heap, &[3, 4]);
        let m = list(&mut heap, vec![r0, r1]);
        let seed = identity_seed(&mut heap);
        // (m * dm)[0][0] = m00 E00 + m01 E10
        let out = mul_value_by_deriv(&mut heap, &m, &seed).unwrap();
        let items = list_items(&heap, &out).unwrap();
        let inner = list_items(&heap, &items[0]).unwrap();
        assert_eq!(inner[0].display(&heap), "[[1, 0], [2, 0]]");
    }

    #[test]
    fn deriv_by_value_transposes_the_contraction() {
        let mut heap = Heap::new();
        let r0 = int_list(&mut heap, &[1, 2]);
        let r1 = int_list(&mut heap, &[3, 4]);
        let m = list(&mut heap, vec![r0, r1]);
        let seed = identity_seed(&mut heap);
        // (dm * m)[0][0] = E00 m00 + E01 m10
        let out = mul_deriv_by_value(&mut heap, &seed, &m, 2).unwrap();
        let items = list_items(&heap, &out).unwrap();
        let inner = list_items(&heap, &items[0]).unwrap();
        assert_eq!(inner[0].display(&heap), "[[1, 3], [0, 0]]");
    }

    #[test]
    fn integer_power_uses_fast_exponentiation() {
        let mut heap = Heap::new();
        assert_eq!(pow(&mut heap, &Value::Int(2), &Value::Int(10)).unwrap(), Value::Int(1024));
        assert_eq!(pow(&mut heap, &Value::Int(5), &Value::Int(0)).unwrap(), Value::Int(1));
    }

    #[test]
    fn negative_power_is_reciprocal() {
        let mut heap = Heap::new();
        assert_eq!(
            pow(&mut heap, &Value::Int(2), &Value::Int(-2)).unwrap(),
            Value::Real(0.25)
        );
    }

    #[test]
    fn matrix_power_seeds_identity() {
        let mut heap = Heap::new();
        let r0 = int_list(&mut heap, &[1, 1]);
        let r1 = int_list(&mut heap, &[0, 1]);
        let m = list(&mut heap, vec![r0, r1]);
        let p = pow(&mut heap, &m, &Value::Int(3)).unwrap();
        assert_eq!(p.display(&heap), "[[1, 3], [0, 1]]");
        let id = pow(&mut heap, &m, &Value::Int(0)).unwrap();
        assert_eq!(id.display(&heap), "[[1, 0], [0, 1]]");
    }

    #[test]
    fn determinant_of_two_by_two() {
        let mut heap = Heap::new();
        let r0 = int_list(&mut heap, &[1, 2]);
        let r1 = int_list(&mut heap, &[3, 4]);
        let m = list(&mut heap, vec![r0, r1]);
        let d = determinant(&heap, &m).unwrap();
        assert!((d + 2.0).abs() < 1e-9);
    }

    #[test]
    fn magnitude_dispatches_on_shape() {
        let mut heap = Heap::new();
        assert_eq!(magnitude(&heap, &Value::Int(-4)).unwrap(), Value::Int(4));
        let xs = int_list(&mut heap, &[1, 2, 3]);
        assert_eq!(magnitude(&heap, &xs).unwrap(), Value::Int(3));
    }

    #[test]
    fn norm_of_vector_is_euclidean() {
        let mut heap = Heap::new();
        let xs = int_list(&mut heap, &[3, 4]);
        assert_eq!(norm(&heap, &xs).unwrap(), Value::Real(5.0));
    }

    #[test]
    fn comparisons_never_error() {
        assert_eq!(compare(CmpOp::Lt, &Value::Int(2), &Value::Real(3.0)), Value::Bool(true));
        assert_eq!(compare(CmpOp::Eq, &Value::Void, &Value::Void), Value::Bool(true));
        assert_eq!(compare(CmpOp::Eq, &Value::Bool(true), &Value::Int(1)), Value::Bool(false));
    }

    #[test]
    fn matrix_exponential_of_zero_is_identity() {
        let mut heap = Heap::new();
        let r0 = int_list(&mut heap, &[0, 0]);
        let r1 = int_list(&mut heap, &[0, 0]);
        let m = list(&mut heap, vec![r0, r1]);
        let e = val_exp(&mut heap, &m).unwrap();
        let entries = matrix_entries(&heap, &e).unwrap();
        assert_eq!(entries, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }
}
