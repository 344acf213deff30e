//! Stack memory for task fibers.
//!
//! A [`StackAllocator`] hands out raw blocks. A [`FiberStack`] owns one block
//! and gives it back to the allocator that produced it exactly once.

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::{Error, Result};

const STACK_ALIGN: usize = 16;

/// Fibers never get less than this, the entry point and unwinding need room.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Smallest stack handed to a fiber, at least [`MIN_STACK_SIZE`].
pub fn min_stack_size() -> usize {
    MIN_STACK_SIZE.max(context::stack::Stack::min_size())
}

/// Source of fiber stack memory.
pub trait StackAllocator {
    /// Returns a block of at least `size` writable bytes.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Releases a block.
    ///
    /// # Safety
    /// `block` must come from [`StackAllocator::allocate`] on this allocator,
    /// called with the same `size`, and must not have been released already.
    unsafe fn deallocate(&self, block: NonNull<u8>, size: usize);
}

/// Plain heap allocation. The default policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStackAllocator;

impl StackAllocator for HeapStackAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = heap_layout(size)?;
        // safety: layout has a non-zero size
        let pointer = unsafe { alloc::alloc(layout) };
        NonNull::new(pointer).ok_or_else(|| Error::StackAllocation {
            size,
            source: io::ErrorKind::OutOfMemory.into(),
        })
    }

    unsafe fn deallocate(&self, block: NonNull<u8>, size: usize) {
        // validated by allocate
        let layout = unsafe { Layout::from_size_align_unchecked(size, STACK_ALIGN) };
        unsafe { alloc::dealloc(block.as_ptr(), layout) };
    }
}

fn heap_layout(size: usize) -> Result<Layout> {
    if size == 0 {
        return Err(Error::StackAllocation {
            size,
            source: io::ErrorKind::InvalidInput.into(),
        });
    }
    Layout::from_size_align(size, STACK_ALIGN).map_err(|_| Error::StackAllocation {
        size,
        source: io::ErrorKind::InvalidInput.into(),
    })
}

/// Anonymous mappings protected from overflow by guard pages.
/// Demand paging ensures that physical memory is allocated only as necessary.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct GuardedStackAllocator {
    guard_pages: std::num::NonZeroUsize,
}

#[cfg(unix)]
impl GuardedStackAllocator {
    pub fn new(guard_pages: std::num::NonZeroUsize) -> Self {
        GuardedStackAllocator { guard_pages }
    }

    fn page_size() -> io::Result<usize> {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => Ok(size as usize),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// (guard length, whole mapping length), both page aligned.
    fn lengths(&self, size: usize) -> Result<(usize, usize)> {
        let overflow = || Error::StackAllocation {
            size,
            source: io::ErrorKind::InvalidInput.into(),
        };
        let page_size = Self::page_size().map_err(|source| Error::StackAllocation { size, source })?;
        let guard = self.guard_pages.get().checked_mul(page_size).ok_or_else(overflow)?;
        let usable = size.checked_next_multiple_of(page_size).ok_or_else(overflow)?;
        let length = guard.checked_add(usable).ok_or_else(overflow)?;
        Ok((guard, length))
    }
}

#[cfg(unix)]
impl Default for GuardedStackAllocator {
    fn default() -> Self {
        GuardedStackAllocator::new(std::num::NonZeroUsize::MIN)
    }
}

#[cfg(unix)]
impl StackAllocator for GuardedStackAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::StackAllocation {
                size,
                source: io::ErrorKind::InvalidInput.into(),
            });
        }
        let (guard, length) = self.lengths(size)?;

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            let source = io::Error::last_os_error();
            return Err(Error::StackAllocation { size, source });
        }

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, guard, libc::PROT_NONE) };
        if result == -1 {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(pointer, length) };
            return Err(Error::StackAllocation { size, source });
        }

        // safety: mmap succeeded, the offset stays inside the mapping
        Ok(unsafe { NonNull::new_unchecked((pointer as *mut u8).add(guard)) })
    }

    unsafe fn deallocate(&self, block: NonNull<u8>, size: usize) {
        // allocate() computed the same lengths successfully
        let Ok((guard, length)) = self.lengths(size) else {
            return;
        };
        let result = unsafe { libc::munmap(block.as_ptr().sub(guard) as *mut c_void, length) };
        debug_assert_eq!(result, 0);
    }
}

/// A uniquely owned stack block.
pub struct FiberStack {
    block: NonNull<u8>,
    size: usize,
    allocator: Rc<dyn StackAllocator>,
}

impl FiberStack {
    pub fn new(size: usize, allocator: Rc<dyn StackAllocator>) -> Result<Self> {
        let block = allocator.allocate(size)?;
        Ok(FiberStack {
            block,
            size,
            allocator,
        })
    }

    /// Lowest address of the block.
    pub fn as_ptr(&self) -> *const u8 {
        self.block.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    /// Non-owning view handed to the context switcher.
    pub(crate) fn as_context_stack(&self) -> context::stack::Stack {
        let bottom = self.block.as_ptr();
        // safety: part of same allocation, can't overflow
        let top = unsafe { bottom.add(self.size) };
        unsafe { context::stack::Stack::new(top as *mut c_void, bottom as *mut c_void) }
    }
}

impl fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberStack")
            .field("block", &self.block)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        // safety: the block came from this allocator and is released only here
        unsafe { self.allocator.deallocate(self.block, self.size) };
        log::trace!("released {} byte stack at {:p}", self.size, self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = FiberStack::new(4096, Rc::new(HeapStackAllocator)).unwrap();
        let view = stack.as_context_stack();
        assert_eq!(view.len(), 4096);
        assert_eq!(view.bottom() as *const u8, stack.as_ptr());
        unsafe {
            let pointer = (view.top() as *mut u8).sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn rejects_empty_stack() {
        let error = HeapStackAllocator.allocate(0).unwrap_err();
        assert!(matches!(error, Error::StackAllocation { size: 0, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn guarded_reads_and_writes() {
        let stack = FiberStack::new(10_000, Rc::new(GuardedStackAllocator::default())).unwrap();
        unsafe {
            let top = (stack.as_ptr() as *mut u8).add(stack.len() - 1);
            top.write(7);
            assert_eq!(top.read(), 7);
            let bottom = stack.as_ptr() as *mut u8;
            bottom.write(9);
            assert_eq!(bottom.read(), 9);
        }
    }

    #[test]
    fn floor_covers_context_minimum() {
        assert!(min_stack_size() >= MIN_STACK_SIZE);
        assert!(min_stack_size() >= context::stack::Stack::min_size());
    }

    #[cfg(unix)]
    #[test]
    fn guarded_rejects_overflowing_sizes() {
        let error = GuardedStackAllocator::default().allocate(usize::MAX).unwrap_err();
        assert!(matches!(error, Error::StackAllocation { size: usize::MAX, .. }));

        let allocator = GuardedStackAllocator::new(std::num::NonZeroUsize::MAX);
        assert!(allocator.allocate(4096).is_err());
    }

    #[cfg(unix)]
    #[test]
    #[ignore = "aborts process"]
    fn guarded_overflow() {
        let stack = FiberStack::new(4096, Rc::new(GuardedStackAllocator::default())).unwrap();
        unsafe {
            let pointer = (stack.as_ptr() as *mut u8).sub(1);
            pointer.write(123);
        }
    }
}
