//! Fiber management module

use std::rc::Rc;

pub(crate) mod fiber;
pub(crate) mod ident;

pub use fiber::{Fiber, State};

/// Suspends the fiber running on this thread and returns control to the
/// thread's root fiber.
///
/// # Panics
/// When called from the root fiber itself.
pub fn yield_now() {
    let current = Fiber::current();
    let fiber = Rc::as_ptr(&current);
    drop(current);
    // safety: a running fiber is kept alive by its entry point, a root by the registry
    unsafe { (*fiber).yield_now() };
}
