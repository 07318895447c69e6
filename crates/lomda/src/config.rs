//! Process-wide interpreter configuration.
//!
//! All flags are read-mostly state set once at startup from command-line
//! parsing. Accessors are free functions so call sites stay terse
//! (`config::werror()`), matching the single-threaded execution model.

use std::sync::atomic::{AtomicBool, Ordering};

static WERROR: AtomicBool = AtomicBool::new(false);
static VERBOSITY: AtomicBool = AtomicBool::new(false);
static OPTIMIZE: AtomicBool = AtomicBool::new(false);
static USE_TYPES: AtomicBool = AtomicBool::new(false);
static MODULE_CACHING: AtomicBool = AtomicBool::new(false);

/// Whether warnings are promoted to fatal errors.
pub fn werror() -> bool {
    WERROR.load(Ordering::Relaxed)
}

pub fn set_werror(b: bool) {
    WERROR.store(b, Ordering::Relaxed);
}

/// Whether proof-step and debug logging is enabled.
pub fn verbosity() -> bool {
    VERBOSITY.load(Ordering::Relaxed)
}

pub fn set_verbosity(b: bool) {
    VERBOSITY.store(b, Ordering::Relaxed);
}

/// Whether the optimizer pass runs on parsed programs.
pub fn optimize() -> bool {
    OPTIMIZE.load(Ordering::Relaxed)
}

pub fn set_optimize(b: bool) {
    OPTIMIZE.store(b, Ordering::Relaxed);
}

/// Whether type-inference reporting is enabled.
pub fn use_types() -> bool {
    USE_TYPES.load(Ordering::Relaxed)
}

pub fn set_use_types(b: bool) {
    USE_TYPES.store(b, Ordering::Relaxed);
}

/// Whether evaluated modules are cached between imports.
pub fn use_module_caching() -> bool {
    MODULE_CACHING.load(Ordering::Relaxed)
}

pub fn set_use_module_caching(b: bool) {
    MODULE_CACHING.store(b, Ordering::Relaxed);
}
