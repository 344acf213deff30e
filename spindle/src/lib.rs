//! Spindle provides stackful, cooperatively scheduled fibers.
//!
//! A [`Fiber`] owns its stack and runs a callback on it. [`Fiber::resume`]
//! switches into a fiber and returns once it calls [`yield_now`] or its
//! callback returns. Every switch goes through a per-thread anchor: the
//! thread's root fiber, or the hub fiber of a scheduler built on top.
//!
//! ```
//! use spindle::{Fiber, State};
//!
//! let fiber = Fiber::new(|| spindle::yield_now(), 0, false);
//! fiber.resume();
//! assert_eq!(fiber.state(), State::Ready);
//! fiber.resume();
//! assert_eq!(fiber.state(), State::Term);
//! ```

mod error;
mod utils;
pub mod config;
pub mod fiber;
pub mod runtime;
pub mod stack;

pub use config::FiberConfig;
pub use error::{Error, Result};
pub use fiber::{yield_now, Fiber, State};
pub use stack::{FiberStack, HeapStackAllocator, StackAllocator};
#[cfg(unix)]
pub use stack::GuardedStackAllocator;
