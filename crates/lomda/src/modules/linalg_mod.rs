//! The `linalg` standard-library module.

use super::{arg, make_fn, make_module, BuiltinFn};
use crate::{
    error::{LomdaError, RunResult},
    eval::Interp,
    heap::{HeapData, HeapId},
    ops,
    value::Value,
};

pub(super) fn load(interp: &mut Interp) -> Value {
    let det = make_fn(interp, &["m"], BuiltinFn::Det);
    let gaussian = make_fn(interp, &["m", "b"], BuiltinFn::Gaussian);
    let trace = make_fn(interp, &["m"], BuiltinFn::Trace);
    let transpose = make_fn(interp, &["m"], BuiltinFn::Transpose);
    make_module(
        interp,
        vec![
            ("det", det),
            ("gaussian", gaussian),
            ("trace", trace),
            ("transpose", transpose),
        ],
    )
}

fn matrix_arg(interp: &mut Interp, env: HeapId, what: &str) -> RunResult<Vec<Vec<f64>>> {
    let m = arg(interp, env, "m")?;
    let entries = ops::matrix_entries(&interp.heap, &m);
    let result = entries.ok_or_else(|| {
        LomdaError::type_err(format!("{what} expects a matrix, not {}", m.display(&interp.heap)))
    });
    m.drop_with_heap(&mut interp.heap);
    result
}

pub(super) fn call(interp: &mut Interp, builtin: BuiltinFn, env: HeapId) -> RunResult<Value> {
    match builtin {
        BuiltinFn::Det => {
            let m = arg(interp, env, "m")?;
            let result = ops::determinant(&interp.heap, &m);
            m.drop_with_heap(&mut interp.heap);
            result.map(Value::Real)
        }
        BuiltinFn::Trace => {
            let m = matrix_arg(interp, env, "trace")?;
            if m.len() != m[0].len() {
                return Err(LomdaError::runtime("trace is not defined on non-square matrices"));
            }
            let sum: f64 = (0..m.len()).map(|i| m[i][i]).sum();
            Ok(Value::Real(sum))
        }
        BuiltinFn::Transpose => {
            let m = matrix_arg(interp, env, "transpose")?;
            let rows = m.len();
            let cols = m[0].len();
            let mut out = vec![vec![0.0; rows]; cols];
            for (i, row) in m.iter().enumerate() {
                for (j, &x) in row.iter().enumerate() {
                    out[j][i] = x;
                }
            }
            Ok(ops::matrix_from_entries(&mut interp.heap, &out))
        }
        BuiltinFn::Gaussian => {
            let m = matrix_arg(interp, env, "gaussian")?;
            let b = arg(interp, env, "b")?;
            let rhs: Option<Vec<f64>> =
                ops::list_items(&interp.heap, &b).and_then(|items| items.iter().map(Value::as_f64).collect());
            let msg = format!("gaussian expects a numeric vector, not {}", b.display(&interp.heap));
            b.drop_with_heap(&mut interp.heap);
            let rhs = rhs.ok_or_else(|| LomdaError::type_err(msg))?;
            let solution = solve(m, rhs)?;
            let items: Vec<Value> = solution.into_iter().map(Value::Real).collect();
            Ok(Value::Ref(interp.heap.allocate(HeapData::List(items))))
        }
        _ => unreachable!("dispatched to the linalg module"),
    }
}

/// Solves `m x = b` by Gaussian elimination with partial pivoting.
fn solve(mut m: Vec<Vec<f64>>, b: Vec<f64>) -> RunResult<Vec<f64>> {
    let n = m.len();
    if n != m[0].len() || b.len() != n {
        return Err(LomdaError::runtime(
            "gaussian expects a square matrix and a matching vector",
        ));
    }
    for (row, &x) in m.iter_mut().zip(&b) {
        row.push(x);
    }
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .expect("non-empty range");
        if m[pivot][col] == 0.0 {
            return Err(LomdaError::runtime("matrix is not invertible"));
        }
        m.swap(pivot, col);
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = m[row][col] / m[col][col];
            for k in col..=n {
                m[row][k] -= factor * m[col][k];
            }
        }
    }
    Ok((0..n).map(|i| m[i][n] / m[i][i]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_two_unknowns() {
        let m = vec![vec![2.0, 1.0], vec![1.0, 3.0]];
        let b = vec![5.0, 10.0];
        let x = solve(m, b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let m = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        let b = vec![1.0, 2.0];
        assert!(solve(m, b).is_err());
    }
}
