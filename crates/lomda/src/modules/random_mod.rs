//! The `random` standard-library module.
//!
//! Uses a seedable ChaCha generator so seeded runs are deterministic across
//! platforms.

use std::cell::RefCell;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{make_fn, make_module, num_arg, BuiltinFn};
use crate::{
    error::RunResult,
    eval::Interp,
    heap::HeapId,
    value::Value,
};

thread_local! {
    static RNG: RefCell<ChaCha8Rng> = RefCell::new(ChaCha8Rng::from_entropy());
}

pub(super) fn load(interp: &mut Interp) -> Value {
    let seed = make_fn(interp, &["n"], BuiltinFn::RandomSeed);
    let uniform = make_fn(interp, &["a", "b"], BuiltinFn::RandomUniform);
    let normal = make_fn(interp, &["m", "s"], BuiltinFn::RandomNormal);
    make_module(interp, vec![("seed", seed), ("uniform", uniform), ("normal", normal)])
}

pub(super) fn call(interp: &mut Interp, builtin: BuiltinFn, env: HeapId) -> RunResult<Value> {
    match builtin {
        BuiltinFn::RandomSeed => {
            let n = num_arg(interp, env, "n", "seed")?;
            RNG.with(|rng| *rng.borrow_mut() = ChaCha8Rng::seed_from_u64(n as u64));
            Ok(Value::Void)
        }
        BuiltinFn::RandomUniform => {
            let a = num_arg(interp, env, "a", "uniform")?;
            let b = num_arg(interp, env, "b", "uniform")?;
            let x = RNG.with(|rng| rng.borrow_mut().gen_range(0.0..1.0));
            Ok(Value::Real(a + x * (b - a)))
        }
        BuiltinFn::RandomNormal => {
            let m = num_arg(interp, env, "m", "normal")?;
            let s = num_arg(interp, env, "s", "normal")?;
            // Box-Muller transform.
            let (u1, u2) = RNG.with(|rng| {
                let mut rng = rng.borrow_mut();
                let u1: f64 = rng.gen_range(0.0..1.0);
                let u2: f64 = rng.gen_range(0.0..1.0);
                (u1.max(f64::MIN_POSITIVE), u2)
            });
            let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
            Ok(Value::Real(m + s * z))
        }
        _ => unreachable!("dispatched to the random module"),
    }
}
