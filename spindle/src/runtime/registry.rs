use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};

use crate::fiber::Fiber;
use crate::utils::fiber_assert;

thread_local! {
    /// Each thread gets its own independent fiber bookkeeping.
    static THREAD: ThreadContext = ThreadContext::new();
}

pub(crate) fn with_thread<T>(f: impl FnOnce(&ThreadContext) -> T) -> T {
    THREAD.with(f)
}

/// The fiber execution context of one OS thread.
///
/// Only code running on the owning thread touches it, and never across a
/// context switch, so plain cells are enough.
pub(crate) struct ThreadContext {
    /// Fiber executing right now. Never keeps it alive.
    current: Cell<Option<NonNull<Fiber>>>,
    root: RefCell<Option<Rc<Fiber>>>,
    hub: RefCell<Weak<Fiber>>,
}

impl ThreadContext {
    fn new() -> Self {
        ThreadContext {
            current: Cell::new(None),
            root: RefCell::new(None),
            hub: RefCell::new(Weak::new()),
        }
    }

    pub(crate) fn current(&self) -> Option<NonNull<Fiber>> {
        self.current.get()
    }

    pub(crate) fn set_current(&self, fiber: &Fiber) {
        self.current.set(Some(NonNull::from(fiber)));
    }

    /// Drops the registration if it points at `fiber`.
    pub(crate) fn forget_current(&self, fiber: &Fiber) {
        if self.current.get().is_some_and(|current| ptr::eq(current.as_ptr(), fiber)) {
            self.current.set(None);
        }
    }

    pub(crate) fn root(&self) -> Option<Rc<Fiber>> {
        self.root.borrow().clone()
    }

    pub(crate) fn install_root(&self, root: Rc<Fiber>) {
        let mut slot = self.root.borrow_mut();
        fiber_assert!(slot.is_none(), "thread root fiber already exists");
        *slot = Some(root);
    }

    /// Unregisters and drops the root fiber, if there is one.
    pub(crate) fn release_root(&self) {
        let root = self.root.borrow_mut().take();
        if let Some(root) = root {
            self.forget_current(&root);
        }
    }

    pub(crate) fn hub(&self) -> Option<Rc<Fiber>> {
        self.hub.borrow().upgrade()
    }

    pub(crate) fn set_hub(&self, hub: &Rc<Fiber>) {
        *self.hub.borrow_mut() = Rc::downgrade(hub);
    }

    pub(crate) fn clear_hub(&self) {
        *self.hub.borrow_mut() = Weak::new();
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // the root can't reach this thread local while it is being destroyed
        self.release_root();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::State;

    fn with_root() -> ThreadContext {
        let thread = ThreadContext::new();
        let root = Fiber::new_root();
        thread.set_current(&root);
        thread.install_root(root);
        thread
    }

    #[test]
    fn releasing_root_clears_current() {
        let thread = with_root();
        assert!(thread.current().is_some());

        thread.release_root();
        assert!(thread.current().is_none());
        assert!(thread.root().is_none());
    }

    #[test]
    fn releasing_root_keeps_other_registration() {
        let thread = with_root();
        let fiber = Fiber::new(|| {}, 0, false);
        thread.set_current(&fiber);

        thread.release_root();
        assert!(thread.current().is_some_and(|current| ptr::eq(current.as_ptr(), &*fiber)));

        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn teardown_releases_root() {
        let thread = with_root();
        let root = thread.root().unwrap();
        drop(thread);
        assert_eq!(Rc::strong_count(&root), 1);
        assert_eq!(root.state(), State::Running);
    }
}
