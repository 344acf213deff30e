//! Fiber is a stackful unit of execution, switched explicitly on one thread.

use std::cell::Cell;
use std::fmt;
use std::ptr;
use std::rc::{Rc, Weak};

use context::{Context, Transfer};

use crate::config;
use crate::fiber::ident;
use crate::runtime::{self, fiber_entry, registry};
use crate::stack::{self, FiberStack, HeapStackAllocator, StackAllocator};
use crate::utils::{fiber_assert, violation};

/// Lifecycle of a fiber.
///
/// Unstarted and suspended fibers are both `Ready`. Any completion, normal
/// or not, is `Term`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum State {
    Ready,
    Running,
    Term,
}

type Callback = Box<dyn FnOnce() + 'static>;

pub struct Fiber {
    id: u64,
    state: Cell<State>,
    /// `None` for a thread's root fiber.
    stack: Option<FiberStack>,
    /// Saved machine context, `None` while it executes.
    context: Cell<Option<Context>>,
    callback: Cell<Option<Callback>>,
    run_in_scheduler: bool,
    this: Weak<Fiber>,
}

impl Fiber {
    /// Creates a task fiber with a heap allocated stack.
    ///
    /// A `stack_size` of 0 picks [`config::stack_size`]. When
    /// `run_in_scheduler` is set, [`Fiber::resume`] switches against the
    /// thread's hub fiber instead of its root fiber.
    pub fn new<F>(callback: F, stack_size: usize, run_in_scheduler: bool) -> Rc<Fiber>
    where
        F: FnOnce() + 'static,
    {
        Fiber::with_allocator(callback, stack_size, run_in_scheduler, Rc::new(HeapStackAllocator))
    }

    /// Like [`Fiber::new`], with stack memory coming from `allocator`.
    pub fn with_allocator<F>(
        callback: F,
        stack_size: usize,
        run_in_scheduler: bool,
        allocator: Rc<dyn StackAllocator>,
    ) -> Rc<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let requested = match stack_size {
            0 => config::stack_size(),
            size => size,
        };
        let stack_size = requested.max(stack::min_stack_size());
        if stack_size != requested {
            log::debug!("raised {} byte stack request to {}", requested, stack_size);
        }
        let stack = FiberStack::new(stack_size, allocator)
            .unwrap_or_else(|error| violation(format!("{error}")));
        // safety: the stack outlives the context, both belong to this fiber
        let context = unsafe { Context::new(&stack.as_context_stack(), fiber_entry) };

        let id = ident::register();
        let fiber = Rc::new_cyclic(|this| Fiber {
            id,
            state: Cell::new(State::Ready),
            stack: Some(stack),
            context: Cell::new(Some(context)),
            callback: Cell::new(Some(Box::new(callback))),
            run_in_scheduler,
            this: this.clone(),
        });
        log::debug!("created fiber {} with a {} byte stack", id, stack_size);
        fiber
    }

    /// Stands for the thread's own execution.
    pub(crate) fn new_root() -> Rc<Fiber> {
        let id = ident::register();
        let root = Rc::new_cyclic(|this| Fiber {
            id,
            state: Cell::new(State::Running),
            stack: None,
            // filled by the first fiber resumed against it
            context: Cell::new(None),
            callback: Cell::new(None),
            run_in_scheduler: false,
            this: this.clone(),
        });
        log::debug!("created root fiber {}", id);
        root
    }

    /// The fiber executing on this thread.
    ///
    /// The first call on a thread creates its root fiber.
    pub fn current() -> Rc<Fiber> {
        registry::with_thread(|thread| {
            if let Some(current) = thread.current() {
                // safety: a registered fiber is alive, someone is resuming it
                return unsafe { current.as_ref() }.shared();
            }
            let root = Fiber::new_root();
            thread.set_current(&root);
            thread.install_root(root.clone());
            root
        })
    }

    /// Id of the fiber executing on this thread, or 0 before any fiber exists here.
    pub fn current_id() -> u64 {
        registry::with_thread(|thread| match thread.current() {
            // safety: see current()
            Some(current) => unsafe { current.as_ref() }.id,
            None => 0,
        })
    }

    /// Number of fibers alive in the process.
    pub fn total_live() -> u64 {
        ident::live()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    pub fn runs_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    pub fn stack(&self) -> Option<&FiberStack> {
        self.stack.as_ref()
    }

    /// Installs a new callback on a terminated fiber, reusing its stack.
    ///
    /// # Panics
    /// On the root fiber, or if the fiber has not terminated.
    pub fn reset<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        let Some(stack) = &self.stack else {
            violation(format!("root fiber {} cannot be reset", self.id))
        };
        fiber_assert!(
            self.state.get() == State::Term,
            "fiber {} reset while {:?}",
            self.id,
            self.state.get()
        );

        self.callback.set(Some(Box::new(callback)));
        // safety: see with_allocator()
        let context = unsafe { Context::new(&stack.as_context_stack(), fiber_entry) };
        self.context.set(Some(context));
        self.state.set(State::Ready);
        log::trace!("reset fiber {}", self.id);
    }

    /// Switches into this fiber and returns once it yields or terminates.
    ///
    /// The caller's context is parked in the caller's own fiber. In the
    /// usual call pattern the caller is the anchor: the hub for scheduler
    /// participants, the thread root otherwise.
    ///
    /// # Panics
    /// If the fiber is running or terminated.
    pub fn resume(&self) {
        let state = self.state.get();
        fiber_assert!(
            state != State::Term && state != State::Running,
            "fiber {} resumed while {:?}",
            self.id,
            state
        );

        let caller = Fiber::current();
        let anchor = self.anchor();
        if !Rc::ptr_eq(&caller, &anchor) {
            log::debug!(
                "fiber {} resumed from fiber {} instead of its anchor {}",
                self.id,
                caller.id,
                anchor.id
            );
        }
        // the caller is executing, so something else keeps it alive
        let caller_ptr = Rc::as_ptr(&caller);
        drop((caller, anchor));

        let context = self.take_context();
        registry::with_thread(|thread| thread.set_current(self));
        self.state.set(State::Running);

        log::trace!("resuming fiber {}", self.id);
        // safety: context was bound to our own stack, the caller outlives the switch
        let from = unsafe { context.resume(caller_ptr as usize) };
        unsafe { Fiber::file_context(from) };
    }

    /// Switches out of this fiber, back to the thread's root fiber.
    ///
    /// The way back always leads to the root fiber, even when the fiber was
    /// resumed by a scheduler hub. The hub stays suspended in its own
    /// `resume` call until someone switches to it.
    ///
    /// # Panics
    /// If the fiber is neither running nor terminated, or is a root fiber.
    pub fn yield_now(&self) {
        let state = self.state.get();
        fiber_assert!(
            state == State::Running || state == State::Term,
            "fiber {} yielded while {:?}",
            self.id,
            state
        );
        fiber_assert!(!self.is_root(), "root fiber {} cannot yield", self.id);

        let root = registry::with_thread(|thread| thread.root())
            .unwrap_or_else(|| violation(format!("fiber {} yielded on a thread without a root", self.id)));
        registry::with_thread(|thread| thread.set_current(&root));
        if state != State::Term {
            self.state.set(State::Ready);
        }

        let context = root.take_context();
        drop(root);
        log::trace!("fiber {} yielding", self.id);
        // safety: the root parked its context when it last switched away
        let from = unsafe { context.resume(self as *const Fiber as usize) };
        unsafe { Fiber::file_context(from) };
    }

    /// Root fibers anchor every fiber resumed from them, the hub stands in
    /// for scheduler participants when one is installed.
    fn anchor(&self) -> Rc<Fiber> {
        let root = registry::with_thread(|thread| thread.root()).unwrap_or_else(Fiber::current);
        let anchor = match self.run_in_scheduler {
            true => runtime::hub_fiber().unwrap_or(root),
            false => root,
        };
        fiber_assert!(
            !ptr::eq(Rc::as_ptr(&anchor), self),
            "fiber {} cannot anchor its own resume",
            self.id
        );
        anchor
    }

    /// Parks the context of whoever switched to us in the fiber they named.
    ///
    /// # Safety
    /// `from.data` must point at a live fiber.
    pub(crate) unsafe fn file_context(from: Transfer) {
        let suspended = from.data as *const Fiber;
        unsafe { (*suspended).context.set(Some(from.context)) };
    }

    fn take_context(&self) -> Context {
        self.context
            .take()
            .unwrap_or_else(|| violation(format!("fiber {} has no saved context", self.id)))
    }

    pub(crate) fn take_callback(&self) -> Callback {
        self.callback
            .take()
            .unwrap_or_else(|| violation(format!("fiber {} started without a callback", self.id)))
    }

    pub(crate) fn finish(&self) {
        self.state.set(State::Term);
    }

    fn shared(&self) -> Rc<Fiber> {
        self.this
            .upgrade()
            .unwrap_or_else(|| violation(format!("fiber {} is being destroyed", self.id)))
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("stack", &self.stack)
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        log::debug!("destroying fiber {}", self.id);
        ident::unregister();

        match self.stack.take() {
            Some(stack) => {
                fiber_assert!(
                    self.state.get() == State::Term,
                    "fiber {} destroyed while {:?}",
                    self.id,
                    self.state.get()
                );
                drop(stack);
                log::debug!("released stack of fiber {}", self.id);
            }
            None => {
                fiber_assert!(
                    self.callback.get_mut().is_none(),
                    "root fiber {} holds a callback",
                    self.id
                );
                fiber_assert!(
                    self.state.get() == State::Running,
                    "root fiber {} destroyed while {:?}",
                    self.id,
                    self.state.get()
                );
                // the registry unregisters its root before dropping it
            }
        }
    }
}
