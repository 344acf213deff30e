//! Thread-bound fiber runtime: per-thread registry, the scheduler hub hook
//! and the entry point every task fiber starts at.

pub(crate) mod registry;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::rc::Rc;

use context::Transfer;

use crate::fiber::Fiber;
use crate::utils::InvariantViolation;

/// Installs the scheduler's hub fiber for this thread.
///
/// Fibers created with `run_in_scheduler` set switch against the hub when
/// resumed. The registry only holds it weakly; the scheduler keeps it alive.
pub fn set_hub_fiber(hub: &Rc<Fiber>) {
    registry::with_thread(|thread| thread.set_hub(hub));
}

pub fn clear_hub_fiber() {
    registry::with_thread(|thread| thread.clear_hub());
}

/// The hub installed on this thread, if any.
pub fn hub_fiber() -> Option<Rc<Fiber>> {
    registry::with_thread(|thread| thread.hub())
}

pub(crate) extern "C" fn fiber_entry(from: Transfer) -> ! {
    // safety: resume() names its live caller
    unsafe { Fiber::file_context(from) };

    // keeps the fiber, and the stack we run on, alive until the callback is done
    let fiber = Fiber::current();
    let callback = fiber.take_callback();

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        if let Some(violation) = payload.downcast_ref::<InvariantViolation>() {
            log::error!("fiber {}: {}", fiber.id(), violation);
            process::abort();
        }
        log::error!("fiber {} panicked: {}", fiber.id(), panic_message(payload.as_ref()));
    }

    fiber.finish();

    let raw = Rc::as_ptr(&fiber);
    drop(fiber);
    // safety: whoever resumed us still holds a reference until resume() returns
    unsafe { (*raw).yield_now() };

    unreachable!("terminated fiber was resumed")
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string payload"
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::fiber::{Fiber, State};

    use super::*;

    #[test]
    fn hub_is_held_weakly() {
        let hub = Fiber::new(|| {}, 0, false);
        set_hub_fiber(&hub);
        assert!(Rc::ptr_eq(&hub_fiber().unwrap(), &hub));

        hub.resume();
        drop(hub);
        assert!(hub_fiber().is_none());
        clear_hub_fiber();
    }

    #[test]
    fn participating_fiber_anchors_on_installed_root_hub() {
        let root = Fiber::current();
        set_hub_fiber(&root);

        let steps = Rc::new(Cell::new(0));
        let fiber = Fiber::new(
            {
                let steps = steps.clone();
                move || {
                    steps.set(1);
                    crate::yield_now();
                    steps.set(2);
                }
            },
            0,
            true,
        );

        fiber.resume();
        assert_eq!((steps.get(), fiber.state()), (1, State::Ready));
        fiber.resume();
        assert_eq!((steps.get(), fiber.state()), (2, State::Term));
        assert!(Rc::ptr_eq(&Fiber::current(), &root));

        clear_hub_fiber();
    }

    #[test]
    fn separate_hub_keeps_contexts_apart() {
        let root = Fiber::current();
        let steps = Rc::new(Cell::new(0));
        let task = Fiber::new(
            {
                let steps = steps.clone();
                move || {
                    steps.set(1);
                    crate::yield_now();
                    steps.set(2);
                }
            },
            0,
            true,
        );
        let hub = Fiber::new(
            {
                let task = task.clone();
                move || task.resume()
            },
            0,
            false,
        );
        set_hub_fiber(&hub);

        // the task yields straight to the root, leaving the hub inside its resume
        hub.resume();
        assert_eq!((steps.get(), task.state(), hub.state()), (1, State::Ready, State::Running));
        assert!(Rc::ptr_eq(&Fiber::current(), &root));

        task.resume();
        assert_eq!((steps.get(), task.state()), (2, State::Term));
        assert_eq!(hub.state(), State::Running);
        assert!(Rc::ptr_eq(&Fiber::current(), &root));

        clear_hub_fiber();
    }

    #[test]
    fn fiber_cannot_anchor_itself() {
        let fiber = Fiber::new(|| {}, 0, true);
        set_hub_fiber(&fiber);

        let payload = panic::catch_unwind(AssertUnwindSafe(|| fiber.resume())).unwrap_err();
        assert!(payload.is::<InvariantViolation>());
        assert_eq!(fiber.state(), State::Ready);

        clear_hub_fiber();
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn panicking_callback_terminates() {
        let fiber = Fiber::new(|| panic!("callback failure"), 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert!(Fiber::current().is_root());
    }

    #[test]
    fn describes_panic_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42), "non-string payload");
    }
}
