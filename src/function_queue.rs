//! FIFO queue of type-erased callables.
//!
//! [`FunctionQueue`] is a thin specialisation of
//! [`HeterQueue`](crate::queue::HeterQueue) over the
//! [`Invoke`](crate::feature::Invoke) feature: every element is a callable
//! with the queue's signature, stored inline with no per-element boxing.
//!
//! ```
//! use heterokit::FunctionQueue;
//!
//! let mut jobs: FunctionQueue<(i32,), i32> = FunctionQueue::new();
//! jobs.push(|x: i32| x + 1);
//! jobs.push(move |x: i32| x * 2);
//! assert_eq!(jobs.try_invoke((10,)), Some(11));
//! assert_eq!(jobs.try_invoke((10,)), Some(20));
//! assert_eq!(jobs.try_invoke((10,)), None);
//! ```

use crate::malloc::{DefaultAllocator, PagedAllocator, UntypedAllocator};
use crate::feature::{Cons, FeatureListOf, Invoke, Nil};
use crate::queue::HeterQueue;

/// The feature list of a function queue: invocation only.
pub type InvokeFeatures<Args, Ret> = Cons<Invoke<Args, Ret>, Nil>;

/// FIFO queue of callables taking `Args` (a tuple of up to four argument
/// types) and returning `Ret`.
///
/// Callable state is stored tightly and linearly in the queue's pages;
/// elements are never moved after construction.
pub struct FunctionQueue<Args: 'static, Ret: 'static, A = DefaultAllocator>
where
    A: UntypedAllocator + PagedAllocator,
{
    queue: HeterQueue<InvokeFeatures<Args, Ret>, A>,
}

impl<Args: 'static, Ret: 'static, A> Default for FunctionQueue<Args, Ret, A>
where
    A: UntypedAllocator + PagedAllocator + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: 'static, Ret: 'static, A> FunctionQueue<Args, Ret, A>
where
    A: UntypedAllocator + PagedAllocator + Default,
{
    /// Creates an empty function queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: HeterQueue::new(),
        }
    }
}

impl<Args: 'static, Ret: 'static, A> FunctionQueue<Args, Ret, A>
where
    A: UntypedAllocator + PagedAllocator,
{
    /// Creates an empty function queue using `alloc`.
    #[must_use]
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            queue: HeterQueue::with_allocator(alloc),
        }
    }

    /// Adds a callable at the end of the queue.
    pub fn push<Fun>(&mut self, callable: Fun)
    where
        Fun: 'static,
        InvokeFeatures<Args, Ret>: FeatureListOf<Fun>,
    {
        self.queue.push(callable);
    }

    /// Invokes the oldest callable and removes it. Returns `None` on an
    /// empty queue.
    pub fn try_invoke(&mut self, args: Args) -> Option<Ret> {
        let op = self.queue.try_start_consume()?;
        // SAFETY: the element was constructed for this signature; the
        // operation owns it until commit.
        let ret = unsafe { op.runtime_type().invoke(op.element_ptr(), args) };
        op.commit();
        Some(ret)
    }

    /// Invokes the oldest callable without removing it.
    pub fn try_invoke_front(&mut self, args: Args) -> Option<Ret> {
        let op = self.queue.try_start_consume()?;
        // SAFETY: as in `try_invoke`; cancel returns the callable.
        let ret = unsafe { op.runtime_type().invoke(op.element_ptr(), args) };
        op.cancel();
        Some(ret)
    }

    /// Removes the oldest callable without invoking it. Returns false on
    /// an empty queue.
    pub fn try_pop(&mut self) -> bool {
        self.queue.try_pop()
    }

    /// True when the queue holds no callable.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.queue.empty()
    }

    /// Destroys every queued callable.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
