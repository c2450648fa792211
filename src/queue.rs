//! Non-concurrent heterogeneous FIFO queue.
//!
//! [`HeterQueue`] stores elements of arbitrary, distinct types contiguously
//! in a linked list of fixed-size pages. Each element is laid out as
//! `[control block][runtime type][padding][payload]`; elements too large for
//! a page are spilled to an external block while the in-page slot keeps a
//! descriptor. Pages are reclaimed as the consumer crosses them.
//!
//! Reentrancy is expressed through the borrow system: non-reentrant
//! operations take `&mut self` (no other queue operation can run while a
//! non-reentrant transaction is pending), reentrant operations take `&self`
//! and publish with the BUSY tag until committed. The queue is
//! single-threaded: it is neither `Send` nor `Sync`.
//!
//! ```
//! use heterokit::HeterQueue;
//!
//! let mut queue: HeterQueue = HeterQueue::new();
//! queue.push(7i32);
//! queue.push(2.5f64);
//! let consume = queue.try_start_consume().unwrap();
//! assert_eq!(consume.downcast_ref::<i32>(), Some(&7));
//! consume.commit();
//! ```

use alloc::alloc::Layout;
use core::cell::Cell;
use core::marker::PhantomData;
use core::mem;
use core::ptr;

use crate::malloc::{DefaultAllocator, PagedAllocator, ProgressGuarantee, UntypedAllocator};
use crate::arith;
use crate::control::{word_address, word_flags, CbFlags, ControlBlock, ExternalBlock, FLAGS_MASK};
use crate::error::{OutOfMemory, TryPushError};
use crate::feature::{
    CopyConstruct, DefaultConstruct, DefaultFeatures, Equal, FeatureList, FeatureListOf, Select,
};
use crate::runtime_type::RuntimeType;

/// Result of a slot allocation: the control block and the payload address
/// (in-page, or the external block base).
struct Allocation {
    cb: usize,
    user: usize,
}

/// Heterogeneous FIFO queue of elements with inline runtime type
/// descriptors.
///
/// `F` is the feature list carried by every element's descriptor; `A` is
/// the page/untyped allocator. See the [module docs](self).
pub struct HeterQueue<F: FeatureList = DefaultFeatures, A = DefaultAllocator>
where
    A: UntypedAllocator + PagedAllocator,
{
    /// Address of the oldest control block, or `SENTINEL`.
    head: Cell<usize>,
    /// Address one past the newest control block, or `SENTINEL`.
    tail: Cell<usize>,
    alloc: A,
    /// Erased element types need not be `Send`/`Sync`; neither is the queue.
    _marker: PhantomData<(*mut u8, F)>,
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator + Default> Default for HeterQueue<F, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator + Default> HeterQueue<F, A> {
    /// Creates an empty queue. No memory is allocated until the first put.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(A::default())
    }
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> HeterQueue<F, A> {
    /// Minimum guaranteed alignment of every element slot. At least 8, so
    /// that three low bits of every control word are free for the tag.
    pub const MIN_ALIGNMENT: usize = arith::max3(
        FLAGS_MASK + 1,
        mem::align_of::<ControlBlock>(),
        mem::align_of::<RuntimeType<F>>(),
    );

    const CB_SIZE: usize = arith::upper_align(mem::size_of::<ControlBlock>(), Self::MIN_ALIGNMENT);
    const RT_SIZE: usize =
        arith::upper_align(mem::size_of::<RuntimeType<F>>(), Self::MIN_ALIGNMENT);

    /// Never a valid control block address: lets a fresh queue defer its
    /// first page allocation.
    const SENTINEL: usize = A::PAGE_SIZE - 1;

    /// Largest payload (plus over-alignment slack) an in-page slot can
    /// hold; one control block is reserved at the page end for the
    /// page-jump marker.
    const MAX_INPAGE: usize = A::PAGE_SIZE - 2 * Self::CB_SIZE - Self::RT_SIZE;

    /// Definition-time checks on the allocator geometry.
    const GEOMETRY: () = {
        assert!(arith::is_power_of_two(A::PAGE_SIZE));
        assert!(arith::is_power_of_two(A::PAGE_ALIGNMENT));
        assert!(A::PAGE_ALIGNMENT >= A::PAGE_SIZE);
        assert!(A::PAGE_ALIGNMENT % Self::MIN_ALIGNMENT == 0);
        assert!(A::PAGE_SIZE > (Self::MIN_ALIGNMENT + mem::size_of::<ControlBlock>()) * 4);
    };

    /// Creates an empty queue using `alloc`. No memory is allocated until
    /// the first put.
    #[must_use]
    pub fn with_allocator(alloc: A) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::GEOMETRY;
        Self {
            head: Cell::new(Self::SENTINEL),
            tail: Cell::new(Self::SENTINEL),
            alloc,
            _marker: PhantomData,
        }
    }

    // ------------------------------------------------------------------
    // Raw slot access
    // ------------------------------------------------------------------

    #[inline]
    unsafe fn word(cb: usize) -> usize {
        (*(cb as *const ControlBlock)).next
    }

    #[inline]
    unsafe fn set_word(cb: usize, word: usize) {
        (*(cb as *mut ControlBlock)).next = word;
    }

    #[inline]
    fn type_slot(cb: usize) -> *mut RuntimeType<F> {
        (cb + Self::CB_SIZE) as *mut RuntimeType<F>
    }

    #[inline]
    fn external_slot(cb: usize) -> *mut ExternalBlock {
        (cb + Self::CB_SIZE + Self::RT_SIZE) as *mut ExternalBlock
    }

    /// Address of the payload of the element at `cb`.
    ///
    /// # Safety
    ///
    /// `cb` must be an initialised element slot (runtime type written; the
    /// EXTERNAL flag, if set, implies a valid descriptor).
    unsafe fn element_ptr_of(cb: usize) -> *mut u8 {
        let word = Self::word(cb);
        if word_flags(word).contains(CbFlags::EXTERNAL) {
            (*Self::external_slot(cb)).ptr
        } else {
            let rt = &*Self::type_slot(cb);
            arith::upper_align(cb + Self::CB_SIZE + Self::RT_SIZE, rt.alignment()) as *mut u8
        }
    }

    #[inline]
    fn end_of_page(addr: usize) -> usize {
        arith::lower_align(addr, A::PAGE_ALIGNMENT) + A::PAGE_SIZE - Self::CB_SIZE
    }

    // ------------------------------------------------------------------
    // Slot allocation
    // ------------------------------------------------------------------

    /// Bump-allocates a slot at the tail: control block, optional runtime
    /// type space, and `size` payload bytes at `align`. Spills to an
    /// external block when the payload can never fit in a page.
    ///
    /// `guarantee` of `None` means blocking (aborts on exhaustion); `Some`
    /// returns `None` instead of blocking.
    fn inplace_allocate(
        &self,
        mut size: usize,
        mut align: usize,
        include_type: bool,
        bits: usize,
        guarantee: Option<ProgressGuarantee>,
    ) -> Option<Allocation> {
        debug_assert!(arith::is_power_of_two(align));
        if align < Self::MIN_ALIGNMENT {
            align = Self::MIN_ALIGNMENT;
            size = arith::upper_align(size, Self::MIN_ALIGNMENT);
        }

        loop {
            let cb = self.tail.get();
            debug_assert!(cb == Self::SENTINEL || arith::is_aligned(cb, Self::MIN_ALIGNMENT));

            let mut new_tail = cb
                + if include_type {
                    Self::CB_SIZE + Self::RT_SIZE
                } else {
                    Self::CB_SIZE
                };
            new_tail = arith::upper_align(new_tail, align);
            let user = new_tail;
            new_tail += size;

            if new_tail <= Self::end_of_page(cb) {
                // SAFETY: the span [cb, new_tail) lies in the tail page and
                // is owned by the queue.
                unsafe { Self::set_word(cb, new_tail | bits) };
                self.tail.set(new_tail);
                return Some(Allocation { cb, user });
            } else if size + (align - Self::MIN_ALIGNMENT) <= Self::MAX_INPAGE {
                self.grow_tail_page(guarantee)?;
            } else {
                return self.external_allocate(size, align, bits, guarantee);
            }
        }
    }

    /// Installs a page-jump marker at the tail and chains a fresh page; on
    /// a virgin queue just allocates the first page.
    fn grow_tail_page(&self, guarantee: Option<ProgressGuarantee>) -> Option<()> {
        let page = match guarantee {
            None => self.alloc.allocate_page(),
            Some(g) => self.alloc.try_allocate_page(g)?,
        };
        let page = page.as_ptr() as usize;
        let tail = self.tail.get();
        if tail != Self::SENTINEL {
            // SAFETY: one control block is always reserved at the page end.
            unsafe { Self::set_word(tail, page | CbFlags::DEAD.bits()) };
        } else {
            self.head.set(page);
        }
        self.tail.set(page);
        Some(())
    }

    /// Allocates the payload outside the page list; the in-page slot holds
    /// control block, runtime type space and the external descriptor.
    fn external_allocate(
        &self,
        size: usize,
        align: usize,
        bits: usize,
        guarantee: Option<ProgressGuarantee>,
    ) -> Option<Allocation> {
        let layout = Layout::from_size_align(size, align).expect("invalid element layout");
        let block = match guarantee {
            None => self.alloc.allocate(layout),
            Some(g) => self.alloc.try_allocate(g, layout)?,
        };

        // Type space is reserved even for raw blocks so consumers find the
        // external descriptor at a fixed offset.
        let slot = self.inplace_allocate(
            mem::size_of::<ExternalBlock>(),
            mem::align_of::<ExternalBlock>(),
            true,
            bits,
            guarantee,
        );
        match slot {
            Some(slot) => unsafe {
                Self::external_slot(slot.cb).write(ExternalBlock {
                    ptr: block.as_ptr(),
                    size,
                    align,
                });
                let word = Self::word(slot.cb);
                debug_assert!(!word_flags(word).contains(CbFlags::EXTERNAL));
                Self::set_word(slot.cb, word | CbFlags::EXTERNAL.bits());
                Some(Allocation {
                    cb: slot.cb,
                    user: block.as_ptr() as usize,
                })
            },
            None => {
                // The external block was obtained but the in-page slot was
                // not; undo and report exhaustion.
                unsafe { self.alloc.deallocate(block, layout) };
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Put core
    // ------------------------------------------------------------------

    /// Allocates a typed slot and writes the runtime type. The payload is
    /// not yet constructed.
    fn start_put_slot<T: 'static>(
        &self,
        bits: usize,
        guarantee: Option<ProgressGuarantee>,
    ) -> Option<Allocation>
    where
        F: FeatureListOf<T>,
    {
        let rt = RuntimeType::<F>::of::<T>();
        self.start_dyn_put_slot(rt, bits, guarantee)
    }

    /// Allocates a slot for an element of runtime type `rt` and writes the
    /// descriptor.
    fn start_dyn_put_slot(
        &self,
        rt: RuntimeType<F>,
        bits: usize,
        guarantee: Option<ProgressGuarantee>,
    ) -> Option<Allocation> {
        let slot = self.inplace_allocate(rt.size(), rt.alignment(), true, bits, guarantee)?;
        // SAFETY: the slot reserves RT_SIZE bytes for the descriptor.
        unsafe { Self::type_slot(slot.cb).write(rt) };
        Some(slot)
    }

    /// Marks a slot dead, clearing BUSY and preserving EXTERNAL. Used when
    /// an element constructor fails and by transaction cancellation.
    unsafe fn retire_slot(&self, cb: usize) {
        let word = Self::word(cb);
        Self::set_word(cb, (word & !CbFlags::BUSY.bits()) | CbFlags::DEAD.bits());
    }

    // ------------------------------------------------------------------
    // Consume core
    // ------------------------------------------------------------------

    /// Claims the oldest consumable element, tagging it BUSY.
    fn claim_consume(&self) -> Option<usize> {
        let mut curr = self.head.get();
        let tail = self.tail.get();
        while curr != tail {
            // SAFETY: every control block between head and tail is
            // initialised.
            let word = unsafe { Self::word(curr) };
            if !word_flags(word).intersects(CbFlags::BUSY | CbFlags::DEAD) {
                unsafe { Self::set_word(curr, word | CbFlags::BUSY.bits()) };
                return Some(curr);
            }
            curr = word_address(word);
        }
        None
    }

    /// Destroys (optionally) and retires a claimed element, then advances
    /// the head.
    unsafe fn commit_consume(&self, cb: usize, run_destructor: bool) {
        if run_destructor {
            let rt = *Self::type_slot(cb);
            rt.destroy(Self::element_ptr_of(cb));
        }
        let word = Self::word(cb);
        debug_assert_eq!(
            word_flags(word) & (CbFlags::BUSY | CbFlags::DEAD),
            CbFlags::BUSY
        );
        Self::set_word(cb, (word & !CbFlags::BUSY.bits()) | CbFlags::DEAD.bits());
        self.clean_dead();
    }

    /// Returns a claimed element to the consumable state.
    unsafe fn cancel_consume(&self, cb: usize) {
        let word = Self::word(cb);
        debug_assert!(word_flags(word).contains(CbFlags::BUSY));
        Self::set_word(cb, word & !CbFlags::BUSY.bits());
    }

    /// Advances the head past dead slots; frees external blocks met on the
    /// way and every page the head leaves.
    fn clean_dead(&self) {
        let mut curr = self.head.get();
        let tail = self.tail.get();
        while curr != tail {
            // SAFETY: initialised slots between head and tail.
            let word = unsafe { Self::word(curr) };
            if word_flags(word) & (CbFlags::BUSY | CbFlags::DEAD) != CbFlags::DEAD {
                break;
            }
            let next = word_address(word);
            if word_flags(word).contains(CbFlags::EXTERNAL) {
                unsafe {
                    let desc = *Self::external_slot(curr);
                    let layout = Layout::from_size_align_unchecked(desc.size, desc.align);
                    self.alloc
                        .deallocate(ptr::NonNull::new_unchecked(desc.ptr), layout);
                }
            }
            if !arith::same_page(next, curr, A::PAGE_ALIGNMENT) {
                let page = arith::lower_align(curr, A::PAGE_ALIGNMENT);
                // SAFETY: the head is leaving this page; nothing live
                // remains in it.
                unsafe {
                    self.alloc
                        .deallocate_page(ptr::NonNull::new_unchecked(page as *mut u8));
                }
            }
            curr = next;
        }
        self.head.set(curr);
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// True when no consumable element exists.
    #[must_use]
    pub fn empty(&self) -> bool {
        let mut curr = self.head.get();
        let tail = self.tail.get();
        while curr != tail {
            // SAFETY: initialised slots between head and tail.
            let word = unsafe { Self::word(curr) };
            if !word_flags(word).intersects(CbFlags::BUSY | CbFlags::DEAD) {
                return false;
            }
            curr = word_address(word);
        }
        true
    }

    /// Iterates the live elements in FIFO order.
    ///
    /// The exclusive borrow keeps every yielded pointer valid for the
    /// iterator's lifetime.
    pub fn iter(&mut self) -> Iter<'_, F, A> {
        Iter {
            queue: &*self,
            curr: self.head.get(),
        }
    }

    // ------------------------------------------------------------------
    // Non-reentrant puts
    // ------------------------------------------------------------------

    /// Pushes `value` at the tail.
    pub fn push<T: 'static>(&mut self, value: T)
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(0, None)
            .expect("blocking allocation cannot fail");
        unsafe { (slot.user as *mut T).write(value) };
    }

    /// Default-constructs a `T` at the tail.
    pub fn emplace<T: Default + 'static>(&mut self)
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(0, None)
            .expect("blocking allocation cannot fail");
        unsafe { (slot.user as *mut T).write(T::default()) };
    }

    /// Pushes `value` without blocking beyond `guarantee`; on exhaustion the
    /// value is handed back and the queue is observably unchanged.
    pub fn try_push<T: 'static>(
        &mut self,
        guarantee: ProgressGuarantee,
        value: T,
    ) -> Result<(), TryPushError<T>>
    where
        F: FeatureListOf<T>,
    {
        match self.start_put_slot::<T>(0, Some(guarantee)) {
            Some(slot) => {
                unsafe { (slot.user as *mut T).write(value) };
                Ok(())
            }
            None => Err(TryPushError { value }),
        }
    }

    /// Pushes the value produced by `make`; when `make` fails the slot is
    /// retired and the error surfaces, with the queue observably unchanged.
    pub fn try_push_with<T: 'static, E>(
        &mut self,
        make: impl FnOnce() -> Result<T, E>,
    ) -> Result<(), E>
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(0, None)
            .expect("blocking allocation cannot fail");
        let guard = RetireGuard {
            queue: self,
            cb: slot.cb,
        };
        match make() {
            Ok(value) => {
                unsafe { (slot.user as *mut T).write(value) };
                mem::forget(guard);
                Ok(())
            }
            Err(error) => {
                drop(guard); // retires the slot
                Err(error)
            }
        }
    }

    /// Default-constructs an element of the runtime type `rt`.
    pub fn dyn_push<I>(&mut self, rt: RuntimeType<F>)
    where
        F: Select<DefaultConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, 0, None)
            .expect("blocking allocation cannot fail");
        let guard = RetireGuard {
            queue: self,
            cb: slot.cb,
        };
        unsafe { rt.default_construct(slot.user as *mut u8) };
        mem::forget(guard);
    }

    /// Copy-constructs an element of runtime type `rt` from `src`.
    ///
    /// # Safety
    ///
    /// `src` must reference a live value of the type `rt` was made for.
    pub unsafe fn dyn_push_copy<I>(&mut self, rt: RuntimeType<F>, src: *const u8)
    where
        F: Select<CopyConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, 0, None)
            .expect("blocking allocation cannot fail");
        let guard = RetireGuard {
            queue: self,
            cb: slot.cb,
        };
        rt.copy_construct(slot.user as *mut u8, src);
        mem::forget(guard);
    }

    /// Move-constructs an element of runtime type `rt` from `src`, leaving
    /// `src` logically vacated.
    ///
    /// # Safety
    ///
    /// `src` must reference a live value of the type `rt` was made for; the
    /// caller must not drop that value afterwards.
    pub unsafe fn dyn_push_move(&mut self, rt: RuntimeType<F>, src: *mut u8) {
        let slot = self
            .start_dyn_put_slot(rt, 0, None)
            .expect("blocking allocation cannot fail");
        rt.move_construct(slot.user as *mut u8, src);
    }

    /// Begins a put transaction for `value`. The element is constructed at
    /// once; dropping the transaction without committing cancels it.
    pub fn start_push<T: 'static>(&mut self, value: T) -> PutTransaction<'_, T, F, A>
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(0, None)
            .expect("blocking allocation cannot fail");
        let payload = slot.user as *mut T;
        unsafe { payload.write(value) };
        PutTransaction {
            queue: self,
            cb: slot.cb,
            payload,
        }
    }

    /// Begins a put transaction holding a default-constructed `T`.
    pub fn start_emplace<T: Default + 'static>(&mut self) -> PutTransaction<'_, T, F, A>
    where
        F: FeatureListOf<T>,
    {
        self.start_push(T::default())
    }

    /// Non-blocking form of [`start_push`](Self::start_push): on exhaustion
    /// the value is handed back and the queue is observably unchanged.
    pub fn try_start_push<T: 'static>(
        &mut self,
        guarantee: ProgressGuarantee,
        value: T,
    ) -> Result<PutTransaction<'_, T, F, A>, TryPushError<T>>
    where
        F: FeatureListOf<T>,
    {
        match self.start_put_slot::<T>(0, Some(guarantee)) {
            Some(slot) => {
                let payload = slot.user as *mut T;
                unsafe { payload.write(value) };
                Ok(PutTransaction {
                    queue: self,
                    cb: slot.cb,
                    payload,
                })
            }
            None => Err(TryPushError { value }),
        }
    }

    /// Begins a put transaction for a default-constructed element of
    /// runtime type `rt`.
    pub fn start_dyn_push<I>(&mut self, rt: RuntimeType<F>) -> DynPutTransaction<'_, F, A>
    where
        F: Select<DefaultConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, 0, None)
            .expect("blocking allocation cannot fail");
        let guard = RetireGuard {
            queue: self,
            cb: slot.cb,
        };
        unsafe { rt.default_construct(slot.user as *mut u8) };
        mem::forget(guard);
        DynPutTransaction {
            queue: self,
            cb: slot.cb,
            payload: slot.user as *mut u8,
        }
    }

    /// Begins a put transaction copy-constructed from `src`.
    ///
    /// # Safety
    ///
    /// `src` must reference a live value of the type `rt` was made for.
    pub unsafe fn start_dyn_push_copy<I>(
        &mut self,
        rt: RuntimeType<F>,
        src: *const u8,
    ) -> DynPutTransaction<'_, F, A>
    where
        F: Select<CopyConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, 0, None)
            .expect("blocking allocation cannot fail");
        let guard = RetireGuard {
            queue: self,
            cb: slot.cb,
        };
        rt.copy_construct(slot.user as *mut u8, src);
        mem::forget(guard);
        DynPutTransaction {
            queue: self,
            cb: slot.cb,
            payload: slot.user as *mut u8,
        }
    }

    /// Begins a put transaction move-constructed from `src`.
    ///
    /// # Safety
    ///
    /// As [`dyn_push_move`](Self::dyn_push_move).
    pub unsafe fn start_dyn_push_move(
        &mut self,
        rt: RuntimeType<F>,
        src: *mut u8,
    ) -> DynPutTransaction<'_, F, A> {
        let slot = self
            .start_dyn_put_slot(rt, 0, None)
            .expect("blocking allocation cannot fail");
        rt.move_construct(slot.user as *mut u8, src);
        DynPutTransaction {
            queue: self,
            cb: slot.cb,
            payload: slot.user as *mut u8,
        }
    }

    // ------------------------------------------------------------------
    // Reentrant puts
    // ------------------------------------------------------------------

    /// Pushes `value` while other operations on this queue may be pending.
    pub fn reentrant_push<T: 'static>(&self, value: T)
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(CbFlags::BUSY.bits(), None)
            .expect("blocking allocation cannot fail");
        unsafe {
            (slot.user as *mut T).write(value);
            let word = Self::word(slot.cb);
            Self::set_word(slot.cb, word & !CbFlags::BUSY.bits());
        }
    }

    /// Begins a reentrant put transaction: the element stays hidden (BUSY)
    /// until commit, and any `&self` operation remains usable meanwhile.
    /// Elements become visible in commit order, regardless of start order.
    pub fn start_reentrant_push<T: 'static>(
        &self,
        value: T,
    ) -> ReentrantPutTransaction<'_, T, F, A>
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(CbFlags::BUSY.bits(), None)
            .expect("blocking allocation cannot fail");
        let payload = slot.user as *mut T;
        unsafe { payload.write(value) };
        ReentrantPutTransaction {
            queue: self,
            cb: slot.cb,
            payload,
        }
    }

    /// Reentrant form of [`start_emplace`](Self::start_emplace).
    pub fn start_reentrant_emplace<T: Default + 'static>(
        &self,
    ) -> ReentrantPutTransaction<'_, T, F, A>
    where
        F: FeatureListOf<T>,
    {
        self.start_reentrant_push(T::default())
    }

    /// Reentrant form of [`start_dyn_push`](Self::start_dyn_push).
    pub fn start_reentrant_dyn_push<I>(
        &self,
        rt: RuntimeType<F>,
    ) -> ReentrantDynPutTransaction<'_, F, A>
    where
        F: Select<DefaultConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, CbFlags::BUSY.bits(), None)
            .expect("blocking allocation cannot fail");
        let guard = RetireGuard {
            queue: self,
            cb: slot.cb,
        };
        unsafe { rt.default_construct(slot.user as *mut u8) };
        mem::forget(guard);
        ReentrantDynPutTransaction {
            queue: self,
            cb: slot.cb,
            payload: slot.user as *mut u8,
        }
    }

    // ------------------------------------------------------------------
    // Consumes
    // ------------------------------------------------------------------

    /// Claims the oldest element for consumption; `None` when no
    /// consumable element exists.
    pub fn try_start_consume(&mut self) -> Option<ConsumeOperation<'_, F, A>> {
        let cb = self.claim_consume()?;
        Some(ConsumeOperation { queue: self, cb })
    }

    /// Reentrant form of [`try_start_consume`](Self::try_start_consume):
    /// the queue stays usable through `&self` while the operation is held.
    pub fn try_start_reentrant_consume(&self) -> Option<ReentrantConsumeOperation<'_, F, A>> {
        let cb = self.claim_consume()?;
        Some(ReentrantConsumeOperation { queue: self, cb })
    }

    /// Consumes and destroys the oldest element. Returns false when the
    /// queue has no consumable element.
    pub fn try_pop(&mut self) -> bool {
        match self.claim_consume() {
            Some(cb) => {
                unsafe { self.commit_consume(cb, true) };
                true
            }
            None => false,
        }
    }

    /// Consumes and destroys the oldest element.
    ///
    /// # Panics
    ///
    /// Panics when the queue has no consumable element.
    pub fn pop(&mut self) {
        assert!(self.try_pop(), "pop on an empty queue");
    }

    /// Consumes the oldest element and moves it out when its type is `T`.
    /// Returns `None` (leaving the queue untouched) on a type mismatch or
    /// an empty queue.
    pub fn try_pop_as<T: 'static>(&mut self) -> Option<T> {
        let cb = self.claim_consume()?;
        unsafe {
            let rt = *Self::type_slot(cb);
            if !rt.is::<T>() {
                self.cancel_consume(cb);
                return None;
            }
            let value = (Self::element_ptr_of(cb) as *mut T).read();
            self.commit_consume(cb, false);
            Some(value)
        }
    }

    /// Destroys every element. The queue keeps its last page for reuse.
    pub fn clear(&mut self) {
        while self.try_pop() {}
        debug_assert!(self.empty());
        // Trailing dead slots (cancelled puts, raw blocks) may still span
        // pages; crossing them releases those pages.
        self.clean_dead();
    }

    // ------------------------------------------------------------------
    // Value semantics
    // ------------------------------------------------------------------

    /// Deep-copies the queue: the copy observes the same element sequence.
    /// (An inherent method rather than `Clone` because the feature-lookup
    /// index cannot appear on a trait implementation.)
    #[must_use]
    pub fn duplicate<I>(&self) -> Self
    where
        F: Select<CopyConstruct, I>,
        A: Clone,
    {
        let copy = Self::with_allocator(self.alloc.clone());
        let mut walk = LiveWalk::new(self);
        while let Some(cb) = walk.next() {
            unsafe {
                let rt = *Self::type_slot(cb);
                let src = Self::element_ptr_of(cb);
                let slot = copy
                    .start_dyn_put_slot(rt, 0, None)
                    .expect("blocking allocation cannot fail");
                let guard = RetireGuard {
                    queue: &copy,
                    cb: slot.cb,
                };
                rt.copy_construct(slot.user as *mut u8, src);
                mem::forget(guard);
            }
        }
        copy
    }

    /// Pairwise element comparison under the `Equal` feature.
    #[must_use]
    pub fn content_eq<I>(&self, other: &Self) -> bool
    where
        F: Select<Equal, I>,
    {
        let mut a = LiveWalk::new(self);
        let mut b = LiveWalk::new(other);
        loop {
            match (a.next(), b.next()) {
                (None, None) => return true,
                (Some(ca), Some(cb)) => unsafe {
                    let rt_a = *Self::type_slot(ca);
                    let rt_b = *Self::type_slot(cb);
                    if rt_a != rt_b
                        || !rt_a.equals(Self::element_ptr_of(ca), Self::element_ptr_of(cb))
                    {
                        return false;
                    }
                },
                _ => return false,
            }
        }
    }
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> Drop for HeterQueue<F, A> {
    fn drop(&mut self) {
        self.clear();
        let tail = self.tail.get();
        if tail != Self::SENTINEL {
            log::trace!("releasing final queue page");
            let page = arith::lower_align(tail, A::PAGE_ALIGNMENT);
            // SAFETY: after clear() the final page holds no live element.
            unsafe {
                self.alloc
                    .deallocate_page(ptr::NonNull::new_unchecked(page as *mut u8));
            }
        }
    }
}

/// Walks live control blocks (shared helper for comparisons and copies).
struct LiveWalk<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a HeterQueue<F, A>,
    curr: usize,
}

impl<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> LiveWalk<'a, F, A> {
    fn new(queue: &'a HeterQueue<F, A>) -> Self {
        Self {
            queue,
            curr: queue.head.get(),
        }
    }

    fn next(&mut self) -> Option<usize> {
        let tail = self.queue.tail.get();
        while self.curr != tail {
            let cb = self.curr;
            // SAFETY: initialised slots between head and tail.
            let word = unsafe { HeterQueue::<F, A>::word(cb) };
            self.curr = word_address(word);
            if !word_flags(word).intersects(CbFlags::BUSY | CbFlags::DEAD) {
                return Some(cb);
            }
        }
        None
    }
}

/// Retires a slot when dropped; defused with `mem::forget` once the element
/// construction succeeded.
struct RetireGuard<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a HeterQueue<F, A>,
    cb: usize,
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> Drop for RetireGuard<'_, F, A> {
    fn drop(&mut self) {
        unsafe { self.queue.retire_slot(self.cb) };
    }
}

// ============================================================================
// Put transactions
// ============================================================================

macro_rules! transaction_common {
    () => {
        /// The runtime type of the in-flight element.
        #[must_use]
        pub fn complete_type(&self) -> RuntimeType<F> {
            unsafe { *HeterQueue::<F, A>::type_slot(self.cb) }
        }

        /// Allocates a raw side block bound to the in-flight element. The
        /// block carries no type and is reclaimed when the element is
        /// consumed (or the transaction cancelled).
        pub fn raw_allocate(&mut self, size: usize, align: usize) -> *mut u8 {
            let slot = self
                .queue
                .inplace_allocate(size, align, false, CbFlags::DEAD.bits(), None)
                .expect("blocking allocation cannot fail");
            slot.user as *mut u8
        }

        /// Non-blocking form of [`raw_allocate`](Self::raw_allocate).
        pub fn try_raw_allocate(
            &mut self,
            guarantee: ProgressGuarantee,
            size: usize,
            align: usize,
        ) -> Result<*mut u8, OutOfMemory> {
            match self.queue.inplace_allocate(
                size,
                align,
                false,
                CbFlags::DEAD.bits(),
                Some(guarantee),
            ) {
                Some(slot) => Ok(slot.user as *mut u8),
                None => Err(OutOfMemory),
            }
        }

        /// Copies `values` into a raw side block, returning the copy.
        /// `U: Copy` keeps the block free of destructors.
        pub fn raw_allocate_copy<U: Copy>(&mut self, values: &[U]) -> *mut U {
            let bytes = core::mem::size_of_val(values);
            let block = self.raw_allocate(bytes.max(1), mem::align_of::<U>()) as *mut U;
            unsafe { ptr::copy_nonoverlapping(values.as_ptr(), block, values.len()) };
            block
        }
    };
}

macro_rules! reentrant_commit {
    () => {
        /// Publishes the element (clears BUSY).
        pub fn commit(self) {
            let this = mem::ManuallyDrop::new(self);
            unsafe {
                let word = HeterQueue::<F, A>::word(this.cb);
                HeterQueue::<F, A>::set_word(this.cb, word & !CbFlags::BUSY.bits());
            }
        }

        /// Destroys the element and retires its slot.
        pub fn cancel(self) {
            drop(self);
        }
    };
}

/// Pending non-reentrant put of a statically typed element.
///
/// The element is already constructed; commit publishes it, dropping the
/// transaction cancels it (the slot is retired).
pub struct PutTransaction<'a, T, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a mut HeterQueue<F, A>,
    cb: usize,
    payload: *mut T,
}

impl<T: 'static, F: FeatureList, A: UntypedAllocator + PagedAllocator>
    PutTransaction<'_, T, F, A>
{
    transaction_common!();

    /// The in-flight element.
    #[must_use]
    pub fn element(&mut self) -> &mut T {
        unsafe { &mut *self.payload }
    }

    /// Raw address of the in-flight element.
    #[must_use]
    pub fn element_ptr(&self) -> *mut T {
        self.payload
    }

    /// Publishes the element. For a non-reentrant transaction the slot was
    /// never tagged, so this only relinquishes the cleanup duty.
    pub fn commit(self) {
        mem::forget(self);
    }

    /// Destroys the element and retires its slot.
    pub fn cancel(self) {
        drop(self);
    }
}

impl<T, F: FeatureList, A: UntypedAllocator + PagedAllocator> Drop
    for PutTransaction<'_, T, F, A>
{
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.payload);
            self.queue.retire_slot(self.cb);
        }
    }
}

/// Pending non-reentrant put of a dynamically typed element.
pub struct DynPutTransaction<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a mut HeterQueue<F, A>,
    cb: usize,
    payload: *mut u8,
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> DynPutTransaction<'_, F, A> {
    transaction_common!();

    /// Raw address of the in-flight element.
    #[must_use]
    pub fn element_ptr(&self) -> *mut u8 {
        self.payload
    }

    /// Publishes the element.
    pub fn commit(self) {
        mem::forget(self);
    }

    /// Destroys the element and retires its slot.
    pub fn cancel(self) {
        drop(self);
    }
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> Drop for DynPutTransaction<'_, F, A> {
    fn drop(&mut self) {
        unsafe {
            let rt = *HeterQueue::<F, A>::type_slot(self.cb);
            rt.destroy(self.payload);
            self.queue.retire_slot(self.cb);
        }
    }
}

/// Pending reentrant put of a statically typed element; hidden (BUSY) until
/// commit.
pub struct ReentrantPutTransaction<'a, T, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a HeterQueue<F, A>,
    cb: usize,
    payload: *mut T,
}

impl<T: 'static, F: FeatureList, A: UntypedAllocator + PagedAllocator>
    ReentrantPutTransaction<'_, T, F, A>
{
    transaction_common!();
    reentrant_commit!();

    /// The in-flight element.
    #[must_use]
    pub fn element(&mut self) -> &mut T {
        unsafe { &mut *self.payload }
    }

    /// Raw address of the in-flight element.
    #[must_use]
    pub fn element_ptr(&self) -> *mut T {
        self.payload
    }
}

impl<T, F: FeatureList, A: UntypedAllocator + PagedAllocator> Drop
    for ReentrantPutTransaction<'_, T, F, A>
{
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.payload);
            self.queue.retire_slot(self.cb);
        }
    }
}

/// Pending reentrant put of a dynamically typed element.
pub struct ReentrantDynPutTransaction<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a HeterQueue<F, A>,
    cb: usize,
    payload: *mut u8,
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> ReentrantDynPutTransaction<'_, F, A> {
    transaction_common!();
    reentrant_commit!();

    /// Raw address of the in-flight element.
    #[must_use]
    pub fn element_ptr(&self) -> *mut u8 {
        self.payload
    }
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> Drop
    for ReentrantDynPutTransaction<'_, F, A>
{
    fn drop(&mut self) {
        unsafe {
            let rt = *HeterQueue::<F, A>::type_slot(self.cb);
            rt.destroy(self.payload);
            self.queue.retire_slot(self.cb);
        }
    }
}

// ============================================================================
// Consume operations
// ============================================================================

macro_rules! consume_common {
    () => {
        /// The runtime type of the claimed element.
        #[must_use]
        pub fn runtime_type(&self) -> RuntimeType<F> {
            unsafe { *HeterQueue::<F, A>::type_slot(self.cb) }
        }

        /// Raw address of the claimed element's payload.
        #[must_use]
        pub fn element_ptr(&self) -> *mut u8 {
            unsafe { HeterQueue::<F, A>::element_ptr_of(self.cb) }
        }

        /// Borrows the element when its type is `T`.
        #[must_use]
        pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
            if self.runtime_type().is::<T>() {
                Some(unsafe { &*(self.element_ptr() as *const T) })
            } else {
                None
            }
        }

        /// Mutably borrows the element when its type is `T`.
        #[must_use]
        pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
            if self.runtime_type().is::<T>() {
                Some(unsafe { &mut *(self.element_ptr() as *mut T) })
            } else {
                None
            }
        }

        /// Destroys the element and advances the head.
        pub fn commit(self) {
            let this = mem::ManuallyDrop::new(self);
            unsafe { this.queue.commit_consume(this.cb, true) };
        }

        /// Returns the element to the consumable state.
        pub fn cancel(self) {
            drop(self);
        }
    };
}

/// Pending non-reentrant consume. Commit destroys the element and advances
/// the head; dropping (or `cancel`) returns the element to the queue.
pub struct ConsumeOperation<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a mut HeterQueue<F, A>,
    cb: usize,
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> ConsumeOperation<'_, F, A> {
    consume_common!();
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> Drop for ConsumeOperation<'_, F, A> {
    fn drop(&mut self) {
        unsafe { self.queue.cancel_consume(self.cb) };
    }
}

/// Pending reentrant consume: the queue remains usable through `&self`
/// while the element is held (hidden).
pub struct ReentrantConsumeOperation<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a HeterQueue<F, A>,
    cb: usize,
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> ReentrantConsumeOperation<'_, F, A> {
    consume_common!();
}

impl<F: FeatureList, A: UntypedAllocator + PagedAllocator> Drop
    for ReentrantConsumeOperation<'_, F, A>
{
    fn drop(&mut self) {
        unsafe { self.queue.cancel_consume(self.cb) };
    }
}

// ============================================================================
// Iteration
// ============================================================================

/// A live element observed through iteration.
pub struct ElementRef<'a, F: FeatureList> {
    rt: RuntimeType<F>,
    ptr: *mut u8,
    _lt: PhantomData<&'a ()>,
}

impl<'a, F: FeatureList> ElementRef<'a, F> {
    /// The element's runtime type.
    #[must_use]
    pub fn runtime_type(&self) -> RuntimeType<F> {
        self.rt
    }

    /// Raw address of the payload.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Borrows the payload when its type is `T`.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&'a T> {
        if self.rt.is::<T>() {
            Some(unsafe { &*(self.ptr as *const T) })
        } else {
            None
        }
    }
}

/// Forward input iterator over the live elements, in FIFO order.
///
/// Obtained from [`HeterQueue::iter`]; the exclusive borrow it holds keeps
/// every yielded [`ElementRef`] valid until the iterator is dropped.
pub struct Iter<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> {
    queue: &'a HeterQueue<F, A>,
    curr: usize,
}

impl<'a, F: FeatureList, A: UntypedAllocator + PagedAllocator> Iterator for Iter<'a, F, A> {
    type Item = ElementRef<'a, F>;

    fn next(&mut self) -> Option<Self::Item> {
        let tail = self.queue.tail.get();
        while self.curr != tail {
            let cb = self.curr;
            // SAFETY: initialised slots between head and tail; the borrow
            // held by the iterator freezes the queue.
            let word = unsafe { HeterQueue::<F, A>::word(cb) };
            self.curr = word_address(word);
            if !word_flags(word).intersects(CbFlags::BUSY | CbFlags::DEAD) {
                return Some(unsafe {
                    ElementRef {
                        rt: *HeterQueue::<F, A>::type_slot(cb),
                        ptr: HeterQueue::<F, A>::element_ptr_of(cb),
                        _lt: PhantomData,
                    }
                });
            }
        }
        None
    }
}
