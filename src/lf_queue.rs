//! Lock-free heterogeneous FIFO queue.
//!
//! [`LfHeterQueue`] offers the same element model as
//! [`HeterQueue`](crate::queue::HeterQueue) - inline runtime type
//! descriptors, paged storage, external blocks, raw side blocks, put
//! transactions and consume operations - under concurrent producers and
//! consumers. Three dials are fixed at type level:
//!
//! - producer cardinality ([`SingleProducer`] / [`MultiProducer`])
//! - consumer cardinality ([`SingleConsumer`] / [`MultiConsumer`])
//! - consistency ([`SeqCstModel`] / [`RelaxedModel`])
//!
//! Multi variants expose safe methods. Single variants expose the same
//! operations as `unsafe fn`s whose contract is "at most one thread on this
//! side at a time" (the usual SPSC discipline); in exchange they elide the
//! tail CAS or the page pinning. Consumers on multi-consumer queues pin the
//! page they walk so that a concurrent head advance cannot reclaim it under
//! them; the pin handshake is sequentially consistent regardless of the
//! consistency dial, which only relaxes element publication and claim
//! edges.
//!
//! Unlike the non-concurrent queue, publication is always deferred: a slot
//! is claimed with BUSY set and becomes consumable when the put commits, so
//! reentrancy needs no special variants here. Pages come from the
//! allocator zeroed: a control word of zero marks the unwritten frontier
//! and ends every consumer walk.

use alloc::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::malloc::{DefaultAllocator, PagedAllocator, ProgressGuarantee, UntypedAllocator};
use crate::arith;
use crate::backoff::Backoff;
use crate::control::{
    word_address, word_flags, AtomicControlBlock, CbFlags, ExternalBlock, FLAGS_MASK,
};
use crate::error::{OutOfMemory, TryPushError};
use crate::feature::{
    CopyConstruct, DefaultConstruct, DefaultFeatures, FeatureList, FeatureListOf, Select,
};
use crate::runtime_type::RuntimeType;

// ============================================================================
// Concurrency dials
// ============================================================================

/// Producer cardinality dial.
pub trait ProducerModel: 'static {
    /// Whether several threads may produce concurrently.
    const MULTI: bool;
}

/// One producing thread at a time; tail updates are plain stores.
pub struct SingleProducer;

/// Any number of producing threads; the tail is claimed by CAS.
pub struct MultiProducer;

impl ProducerModel for SingleProducer {
    const MULTI: bool = false;
}

impl ProducerModel for MultiProducer {
    const MULTI: bool = true;
}

/// Consumer cardinality dial.
pub trait ConsumerModel: 'static {
    /// Whether several threads may consume concurrently.
    const MULTI: bool;
}

/// One consuming thread at a time; page pinning is elided.
pub struct SingleConsumer;

/// Any number of consuming threads; walks pin the page they read.
pub struct MultiConsumer;

impl ConsumerModel for SingleConsumer {
    const MULTI: bool = false;
}

impl ConsumerModel for MultiConsumer {
    const MULTI: bool = true;
}

/// Memory consistency dial for element publication and claim edges.
pub trait OrderingModel: 'static {
    /// Ordering of stores that publish an element state.
    const PUBLISH: Ordering;
    /// Ordering of loads that observe element state.
    const OBSERVE: Ordering;
    /// Ordering of read-modify-write claims.
    const RMW: Ordering;
}

/// Every consumer observes commits in one total order.
pub struct SeqCstModel;

/// Matched acquire/release pairs only; cheaper on weakly ordered machines.
pub struct RelaxedModel;

impl OrderingModel for SeqCstModel {
    const PUBLISH: Ordering = Ordering::SeqCst;
    const OBSERVE: Ordering = Ordering::SeqCst;
    const RMW: Ordering = Ordering::SeqCst;
}

impl OrderingModel for RelaxedModel {
    const PUBLISH: Ordering = Ordering::Release;
    const OBSERVE: Ordering = Ordering::Acquire;
    const RMW: Ordering = Ordering::AcqRel;
}

/// Single-producer single-consumer alias.
pub type SpscLfQueue<F = DefaultFeatures, A = DefaultAllocator> =
    LfHeterQueue<F, A, SingleProducer, SingleConsumer, SeqCstModel>;

/// Multi-producer single-consumer alias.
pub type MpscLfQueue<F = DefaultFeatures, A = DefaultAllocator> =
    LfHeterQueue<F, A, MultiProducer, SingleConsumer, SeqCstModel>;

/// Multi-producer multi-consumer alias.
pub type MpmcLfQueue<F = DefaultFeatures, A = DefaultAllocator> =
    LfHeterQueue<F, A, MultiProducer, MultiConsumer, SeqCstModel>;

/// Result of a slot allocation.
struct Allocation {
    cb: usize,
    user: usize,
}

// ============================================================================
// Queue
// ============================================================================

/// Lock-free heterogeneous FIFO queue. See the [module docs](self).
pub struct LfHeterQueue<
    F: FeatureList = DefaultFeatures,
    A = DefaultAllocator,
    P = MultiProducer,
    C = MultiConsumer,
    O = SeqCstModel,
> where
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    head: AtomicUsize,
    tail: AtomicUsize,
    alloc: A,
    _marker: PhantomData<(F, P, C, O)>,
}

// SAFETY: puts require `T: Send`, so stored payloads may cross threads; the
// single-cardinality entry points are `unsafe fn`s carrying the one-thread
// contract, and everything else is synchronised by the queue protocol.
unsafe impl<F, A, P, C, O> Send for LfHeterQueue<F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator + Send,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
}

unsafe impl<F, A, P, C, O> Sync for LfHeterQueue<F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator + Sync,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
}

impl<F, A, P, C, O> Default for LfHeterQueue<F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator + Default,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F, A, P, C, O> LfHeterQueue<F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator + Default,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    /// Creates an empty queue. No memory is allocated until the first put.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(A::default())
    }
}

impl<F, A, P, C, O> LfHeterQueue<F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    /// Minimum guaranteed alignment of every element slot.
    pub const MIN_ALIGNMENT: usize = arith::max3(
        FLAGS_MASK + 1,
        mem::align_of::<AtomicControlBlock>(),
        mem::align_of::<RuntimeType<F>>(),
    );

    const CB_SIZE: usize =
        arith::upper_align(mem::size_of::<AtomicControlBlock>(), Self::MIN_ALIGNMENT);
    const RT_SIZE: usize =
        arith::upper_align(mem::size_of::<RuntimeType<F>>(), Self::MIN_ALIGNMENT);
    const SENTINEL: usize = A::PAGE_SIZE - 1;
    const MAX_INPAGE: usize = A::PAGE_SIZE - 2 * Self::CB_SIZE - Self::RT_SIZE;

    const GEOMETRY: () = {
        assert!(arith::is_power_of_two(A::PAGE_SIZE));
        assert!(arith::is_power_of_two(A::PAGE_ALIGNMENT));
        assert!(A::PAGE_ALIGNMENT >= A::PAGE_SIZE);
        assert!(A::PAGE_ALIGNMENT % Self::MIN_ALIGNMENT == 0);
        assert!(A::PAGE_SIZE > (Self::MIN_ALIGNMENT + mem::size_of::<AtomicControlBlock>()) * 4);
    };

    /// Creates an empty queue using `alloc`.
    #[must_use]
    pub fn with_allocator(alloc: A) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::GEOMETRY;
        Self {
            head: AtomicUsize::new(Self::SENTINEL),
            tail: AtomicUsize::new(Self::SENTINEL),
            alloc,
            _marker: PhantomData,
        }
    }

    // ------------------------------------------------------------------
    // Raw slot access
    // ------------------------------------------------------------------

    /// The atomic control word at `cb`.
    ///
    /// # Safety
    ///
    /// `cb` must lie in a live page of this queue.
    #[inline]
    unsafe fn word_at(cb: usize) -> &'static AtomicUsize {
        &(*(cb as *const AtomicControlBlock)).next
    }

    #[inline]
    fn type_slot(cb: usize) -> *mut RuntimeType<F> {
        (cb + Self::CB_SIZE) as *mut RuntimeType<F>
    }

    #[inline]
    fn external_slot(cb: usize) -> *mut ExternalBlock {
        (cb + Self::CB_SIZE + Self::RT_SIZE) as *mut ExternalBlock
    }

    /// Payload address of the element at `cb` (descriptor already written).
    ///
    /// # Safety
    ///
    /// `cb` must be an initialised element slot owned by the caller (BUSY).
    unsafe fn element_ptr_of(cb: usize) -> *mut u8 {
        let word = Self::word_at(cb).load(Ordering::Relaxed);
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

    #[inline]
    fn page_of(addr: usize) -> usize {
        arith::lower_align(addr, A::PAGE_ALIGNMENT)
    }

    // ------------------------------------------------------------------
    // Tail protocol
    // ------------------------------------------------------------------

    /// Claims `[tail, tail + span)` and writes the control word with
    /// `bits`. The word is stored before anything else so walkers never see
    /// a claimed-but-unwritten slot other than as the zero frontier.
    fn produce_slot(
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

        let mut backoff = Backoff::new();
        loop {
            let t = self.tail.load(Ordering::Acquire);
            if t == Self::SENTINEL {
                self.install_first_page(guarantee)?;
                continue;
            }

            let mut new_tail = t
                + if include_type {
                    Self::CB_SIZE + Self::RT_SIZE
                } else {
                    Self::CB_SIZE
                };
            new_tail = arith::upper_align(new_tail, align);
            let user = new_tail;
            new_tail += size;

            if new_tail <= Self::end_of_page(t) {
                if P::MULTI {
                    if self
                        .tail
                        .compare_exchange_weak(t, new_tail, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        backoff.spin();
                        continue;
                    }
                } else {
                    self.tail.store(new_tail, Ordering::Relaxed);
                }
                // SAFETY: the region [t, new_tail) is now exclusively ours.
                unsafe { Self::word_at(t).store(new_tail | bits, O::PUBLISH) };
                return Some(Allocation { cb: t, user });
            } else if size + (align - Self::MIN_ALIGNMENT) <= Self::MAX_INPAGE {
                self.grow_tail_page(t, guarantee)?;
            } else {
                return self.external_allocate(size, align, bits, guarantee);
            }
        }
    }

    /// Installs the first page, making head and tail point at it.
    fn install_first_page(&self, guarantee: Option<ProgressGuarantee>) -> Option<()> {
        let page = match guarantee {
            None => self.alloc.allocate_page_zeroed(),
            Some(g) => self.alloc.try_allocate_page_zeroed(g)?,
        };
        let page = page.as_ptr() as usize;
        match self.tail.compare_exchange(
            Self::SENTINEL,
            page,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.head.store(page, Ordering::SeqCst);
                Some(())
            }
            Err(_) => {
                // Lost the installation race; recycle the page.
                unsafe {
                    self.alloc
                        .deallocate_page_zeroed(ptr::NonNull::new_unchecked(page as *mut u8));
                }
                Some(())
            }
        }
    }

    /// Chains a fresh page after the page of `t`, leaving a page-jump
    /// marker at `t`. Losers of the tail race recycle their page and retry.
    fn grow_tail_page(&self, t: usize, guarantee: Option<ProgressGuarantee>) -> Option<()> {
        let page = match guarantee {
            None => self.alloc.allocate_page_zeroed(),
            Some(g) => self.alloc.try_allocate_page_zeroed(g)?,
        };
        let page = page.as_ptr() as usize;
        if P::MULTI {
            match self
                .tail
                .compare_exchange(t, page, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: the reserved end-of-page slot at `t` is ours.
                    unsafe {
                        Self::word_at(t).store(page | CbFlags::DEAD.bits(), O::PUBLISH);
                    }
                    Some(())
                }
                Err(_) => {
                    unsafe {
                        self.alloc
                            .deallocate_page_zeroed(ptr::NonNull::new_unchecked(page as *mut u8));
                    }
                    Some(())
                }
            }
        } else {
            self.tail.store(page, Ordering::Relaxed);
            unsafe {
                Self::word_at(t).store(page | CbFlags::DEAD.bits(), O::PUBLISH);
            }
            Some(())
        }
    }

    /// External-block path of `produce_slot`.
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

        let slot = self.produce_slot(
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
                // The slot is still BUSY (or DEAD for raw blocks), so no
                // consumer reads the flag before this is set.
                Self::word_at(slot.cb).fetch_or(CbFlags::EXTERNAL.bits(), O::PUBLISH);
                Some(Allocation {
                    cb: slot.cb,
                    user: block.as_ptr() as usize,
                })
            },
            None => {
                unsafe { self.alloc.deallocate(block, layout) };
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Put core (all puts publish deferred: BUSY until commit)
    // ------------------------------------------------------------------

    fn start_put_slot<T: 'static>(
        &self,
        guarantee: Option<ProgressGuarantee>,
    ) -> Option<Allocation>
    where
        F: FeatureListOf<T>,
    {
        self.start_dyn_put_slot(RuntimeType::<F>::of::<T>(), guarantee)
    }

    fn start_dyn_put_slot(
        &self,
        rt: RuntimeType<F>,
        guarantee: Option<ProgressGuarantee>,
    ) -> Option<Allocation> {
        let slot = self.produce_slot(
            rt.size(),
            rt.alignment(),
            true,
            CbFlags::BUSY.bits(),
            guarantee,
        )?;
        unsafe { Self::type_slot(slot.cb).write(rt) };
        Some(slot)
    }

    /// Publishes a BUSY slot (the put commit).
    unsafe fn publish_slot(&self, cb: usize) {
        let word = Self::word_at(cb).load(Ordering::Relaxed);
        debug_assert!(word_flags(word).contains(CbFlags::BUSY));
        Self::word_at(cb).store(word & !CbFlags::BUSY.bits(), O::PUBLISH);
    }

    /// Retires a BUSY slot (failed construction or cancelled put).
    unsafe fn retire_slot(&self, cb: usize) {
        let word = Self::word_at(cb).load(Ordering::Relaxed);
        debug_assert!(word_flags(word).contains(CbFlags::BUSY));
        Self::word_at(cb).store(
            (word & !CbFlags::BUSY.bits()) | CbFlags::DEAD.bits(),
            O::PUBLISH,
        );
    }

    // ------------------------------------------------------------------
    // Head protocol
    // ------------------------------------------------------------------

    /// Pins the page of `addr` and re-validates that the walk anchor is
    /// still the head; a stale anchor means pages may have been reclaimed.
    fn pin_validated(&self, addr: usize, anchor: usize) -> bool {
        self.alloc.pin_page(addr);
        if self.head.load(Ordering::SeqCst) == anchor {
            true
        } else {
            self.alloc.unpin_page(addr);
            false
        }
    }

    /// Walks from the head and claims the first consumable element.
    ///
    /// # Safety
    ///
    /// On single-consumer queues the caller must be the only consuming
    /// thread.
    unsafe fn claim_consume(&self) -> Option<usize> {
        let mut backoff = Backoff::new();
        'restart: loop {
            let anchor = self.head.load(Ordering::SeqCst);
            if anchor == Self::SENTINEL {
                // A producer may have installed the first page but not yet
                // published the head; only tail == sentinel means empty.
                if self.tail.load(Ordering::SeqCst) == Self::SENTINEL {
                    return None;
                }
                backoff.spin();
                continue 'restart;
            }
            if C::MULTI && !self.pin_validated(anchor, anchor) {
                continue 'restart;
            }

            let mut curr = anchor;
            loop {
                let word = Self::word_at(curr).load(O::OBSERVE);
                if word == 0 {
                    // Unwritten frontier: nothing consumable past here.
                    if C::MULTI {
                        self.alloc.unpin_page(curr);
                    }
                    return None;
                }
                let flags = word_flags(word);
                if !flags.intersects(CbFlags::BUSY | CbFlags::DEAD) {
                    match Self::word_at(curr).compare_exchange(
                        word,
                        word | CbFlags::BUSY.bits(),
                        O::RMW,
                        O::OBSERVE,
                    ) {
                        Ok(_) => {
                            // A BUSY element below the head anchor keeps its
                            // page alive without a pin: the head cannot
                            // advance past it.
                            if C::MULTI {
                                self.alloc.unpin_page(curr);
                            }
                            return Some(curr);
                        }
                        Err(_) => continue,
                    }
                }
                let next = word_address(word);
                if C::MULTI && !arith::same_page(next, curr, A::PAGE_ALIGNMENT) {
                    let pinned = self.pin_validated(next, anchor);
                    self.alloc.unpin_page(curr);
                    if !pinned {
                        continue 'restart;
                    }
                }
                curr = next;
            }
        }
    }

    /// Returns a claimed element to the consumable state.
    unsafe fn cancel_consume(&self, cb: usize) {
        let word = Self::word_at(cb).load(Ordering::Relaxed);
        debug_assert!(word_flags(word).contains(CbFlags::BUSY));
        Self::word_at(cb).store(word & !CbFlags::BUSY.bits(), O::PUBLISH);
    }

    /// Destroys (optionally) and retires a claimed element, then helps the
    /// head past the dead prefix.
    unsafe fn commit_consume(&self, cb: usize, run_destructor: bool) {
        if run_destructor {
            let rt = *Self::type_slot(cb);
            rt.destroy(Self::element_ptr_of(cb));
        }
        let word = Self::word_at(cb).load(Ordering::Relaxed);
        debug_assert_eq!(
            word_flags(word) & (CbFlags::BUSY | CbFlags::DEAD),
            CbFlags::BUSY
        );
        Self::word_at(cb).store(
            (word & !CbFlags::BUSY.bits()) | CbFlags::DEAD.bits(),
            O::PUBLISH,
        );
        self.advance_head();
    }

    /// Cooperatively advances the head across dead slots. The winner of
    /// each CAS owns the cleanup of the slot it crossed: external blocks
    /// are freed, and a page is reclaimed when the head leaves it (once
    /// its pins drain).
    fn advance_head(&self) {
        loop {
            let h = self.head.load(Ordering::SeqCst);
            if h == Self::SENTINEL {
                return;
            }
            if C::MULTI && !self.pin_validated(h, h) {
                continue;
            }
            // SAFETY: h is the validated head; its page is pinned (or we
            // are the only consumer).
            let word = unsafe { Self::word_at(h).load(O::OBSERVE) };
            let flags = word_flags(word);
            if word == 0 || flags & (CbFlags::BUSY | CbFlags::DEAD) != CbFlags::DEAD {
                if C::MULTI {
                    self.alloc.unpin_page(h);
                }
                return;
            }
            let next = word_address(word);
            match self
                .head
                .compare_exchange(h, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    // Exclusive cleanup duty for the slot at h.
                    if flags.contains(CbFlags::EXTERNAL) {
                        unsafe {
                            let desc = *Self::external_slot(h);
                            let layout = Layout::from_size_align_unchecked(desc.size, desc.align);
                            self.alloc
                                .deallocate(ptr::NonNull::new_unchecked(desc.ptr), layout);
                        }
                    }
                    let crossing = !arith::same_page(next, h, A::PAGE_ALIGNMENT);
                    if C::MULTI {
                        self.alloc.unpin_page(h);
                    }
                    if crossing {
                        let page = Self::page_of(h);
                        if C::MULTI {
                            let mut backoff = Backoff::new();
                            while self.alloc.pin_count(page) != 0 {
                                if backoff.is_maxed() {
                                    log::warn!("waiting for page pins to drain");
                                }
                                backoff.spin();
                            }
                        }
                        // SAFETY: the head has left this page and no pin
                        // remains; every slot in it is dead.
                        unsafe {
                            self.alloc
                                .deallocate_page(ptr::NonNull::new_unchecked(page as *mut u8));
                        }
                    }
                }
                Err(_) => {
                    if C::MULTI {
                        self.alloc.unpin_page(h);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared observers
    // ------------------------------------------------------------------

    /// Walk checking for any consumable element.
    ///
    /// # Safety
    ///
    /// On single-consumer queues the caller must be the consuming thread
    /// (no pins protect the walk there).
    unsafe fn empty_impl(&self) -> bool {
        let mut backoff = Backoff::new();
        'restart: loop {
            let anchor = self.head.load(Ordering::SeqCst);
            if anchor == Self::SENTINEL {
                if self.tail.load(Ordering::SeqCst) == Self::SENTINEL {
                    return true;
                }
                backoff.spin();
                continue 'restart;
            }
            if C::MULTI && !self.pin_validated(anchor, anchor) {
                continue 'restart;
            }
            let mut curr = anchor;
            loop {
                // Page pinned (or exclusive by the single-consumer
                // contract).
                let word = Self::word_at(curr).load(O::OBSERVE);
                if word == 0 {
                    if C::MULTI {
                        self.alloc.unpin_page(curr);
                    }
                    return true;
                }
                if !word_flags(word).intersects(CbFlags::BUSY | CbFlags::DEAD) {
                    if C::MULTI {
                        self.alloc.unpin_page(curr);
                    }
                    return false;
                }
                let next = word_address(word);
                if C::MULTI && !arith::same_page(next, curr, A::PAGE_ALIGNMENT) {
                    let pinned = self.pin_validated(next, anchor);
                    self.alloc.unpin_page(curr);
                    if !pinned {
                        continue 'restart;
                    }
                }
                curr = next;
            }
        }
    }

    /// Destroys every element. Exclusive access makes this safe for any
    /// cardinality.
    pub fn clear(&mut self) {
        // SAFETY: &mut self means no concurrent consumer.
        unsafe {
            while let Some(cb) = self.claim_consume() {
                self.commit_consume(cb, true);
            }
        }
        // Trailing dead slots (cancelled puts, raw blocks) may still span
        // pages; crossing them releases those pages.
        self.advance_head();
    }
}

impl<F, A, P, C, O> Drop for LfHeterQueue<F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    fn drop(&mut self) {
        self.clear();
        let head = self.head.load(Ordering::Relaxed);
        if head != Self::SENTINEL {
            log::trace!("releasing final queue page");
            let page = Self::page_of(head);
            // SAFETY: after clear() the final page holds no live element
            // and no consumer exists.
            unsafe {
                self.alloc
                    .deallocate_page(ptr::NonNull::new_unchecked(page as *mut u8));
            }
        }
    }
}

// ============================================================================
// Producer API
// ============================================================================

impl<F, A, C, O> LfHeterQueue<F, A, MultiProducer, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    C: ConsumerModel,
    O: OrderingModel,
{
    /// Pushes `value` at the tail and publishes it.
    pub fn push<T: Send + 'static>(&self, value: T)
    where
        F: FeatureListOf<T>,
    {
        // SAFETY: multi-producer protocol is thread-safe by construction.
        unsafe { self.push_unchecked(value) }
    }

    /// Pushes `value` without blocking beyond `guarantee`.
    pub fn try_push<T: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: T,
    ) -> Result<(), TryPushError<T>>
    where
        F: FeatureListOf<T>,
    {
        unsafe { self.try_push_unchecked(guarantee, value) }
    }

    /// Begins a put transaction; the element stays hidden until commit.
    pub fn start_push<T: Send + 'static>(&self, value: T) -> LfPutTransaction<'_, T, F, A, MultiProducer, C, O>
    where
        F: FeatureListOf<T>,
    {
        unsafe { self.start_push_unchecked(value) }
    }

    /// Non-blocking form of [`start_push`](Self::start_push).
    pub fn try_start_push<T: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: T,
    ) -> Result<LfPutTransaction<'_, T, F, A, MultiProducer, C, O>, TryPushError<T>>
    where
        F: FeatureListOf<T>,
    {
        unsafe { self.try_start_push_unchecked(guarantee, value) }
    }

    /// Default-constructs an element of runtime type `rt` and publishes it.
    pub fn dyn_push<I>(&self, rt: RuntimeType<F>)
    where
        F: Select<DefaultConstruct, I>,
    {
        unsafe { self.dyn_push_unchecked(rt) }
    }

    /// Copy-constructs an element of runtime type `rt` from `src`.
    ///
    /// # Safety
    ///
    /// `src` must reference a live value of the type `rt` was made for,
    /// and that value must be safe to share with this queue's consumers.
    pub unsafe fn dyn_push_copy<I>(&self, rt: RuntimeType<F>, src: *const u8)
    where
        F: Select<CopyConstruct, I>,
    {
        self.dyn_push_copy_unchecked(rt, src);
    }

    /// Move-constructs an element of runtime type `rt` from `src`.
    ///
    /// # Safety
    ///
    /// As [`dyn_push_copy`](Self::dyn_push_copy); additionally the caller
    /// must not drop the source value afterwards.
    pub unsafe fn dyn_push_move(&self, rt: RuntimeType<F>, src: *mut u8) {
        self.dyn_push_move_unchecked(rt, src);
    }

    /// Pushes the value produced by `make`; when `make` fails (or panics)
    /// the claimed slot is retired and the error surfaces with no element
    /// published.
    pub fn try_push_with<T: Send + 'static, E>(
        &self,
        make: impl FnOnce() -> Result<T, E>,
    ) -> Result<(), E>
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(None)
            .expect("blocking allocation cannot fail");
        let guard = LfRetireGuard {
            queue: self,
            cb: slot.cb,
        };
        match make() {
            Ok(value) => unsafe {
                mem::forget(guard);
                (slot.user as *mut T).write(value);
                self.publish_slot(slot.cb);
                Ok(())
            },
            Err(error) => {
                drop(guard); // retires the slot
                Err(error)
            }
        }
    }

    /// Begins a put transaction for a default-constructed element of
    /// runtime type `rt`; hidden until commit.
    pub fn start_dyn_push<I>(
        &self,
        rt: RuntimeType<F>,
    ) -> LfDynPutTransaction<'_, F, A, MultiProducer, C, O>
    where
        F: Select<DefaultConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, None)
            .expect("blocking allocation cannot fail");
        let guard = LfRetireGuard {
            queue: self,
            cb: slot.cb,
        };
        unsafe { rt.default_construct(slot.user as *mut u8) };
        mem::forget(guard);
        LfDynPutTransaction {
            queue: self,
            cb: slot.cb,
            payload: slot.user as *mut u8,
        }
    }

    /// Begins a put transaction copy-constructed from `src`; hidden until
    /// commit.
    ///
    /// # Safety
    ///
    /// As [`dyn_push_copy`](Self::dyn_push_copy).
    pub unsafe fn start_dyn_push_copy<I>(
        &self,
        rt: RuntimeType<F>,
        src: *const u8,
    ) -> LfDynPutTransaction<'_, F, A, MultiProducer, C, O>
    where
        F: Select<CopyConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, None)
            .expect("blocking allocation cannot fail");
        let guard = LfRetireGuard {
            queue: self,
            cb: slot.cb,
        };
        rt.copy_construct(slot.user as *mut u8, src);
        mem::forget(guard);
        LfDynPutTransaction {
            queue: self,
            cb: slot.cb,
            payload: slot.user as *mut u8,
        }
    }

    /// Begins a put transaction move-constructed from `src`; hidden until
    /// commit.
    ///
    /// # Safety
    ///
    /// As [`dyn_push_move`](Self::dyn_push_move).
    pub unsafe fn start_dyn_push_move(
        &self,
        rt: RuntimeType<F>,
        src: *mut u8,
    ) -> LfDynPutTransaction<'_, F, A, MultiProducer, C, O> {
        let slot = self
            .start_dyn_put_slot(rt, None)
            .expect("blocking allocation cannot fail");
        rt.move_construct(slot.user as *mut u8, src);
        LfDynPutTransaction {
            queue: self,
            cb: slot.cb,
            payload: slot.user as *mut u8,
        }
    }

    /// Alias of [`push`](Self::push): every lock-free put is reentrant.
    pub fn reentrant_push<T: Send + 'static>(&self, value: T)
    where
        F: FeatureListOf<T>,
    {
        self.push(value);
    }

    /// Alias of [`start_push`](Self::start_push).
    pub fn start_reentrant_push<T: Send + 'static>(
        &self,
        value: T,
    ) -> LfPutTransaction<'_, T, F, A, MultiProducer, C, O>
    where
        F: FeatureListOf<T>,
    {
        self.start_push(value)
    }
}

impl<F, A, C, O> LfHeterQueue<F, A, SingleProducer, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    C: ConsumerModel,
    O: OrderingModel,
{
    /// Pushes `value` at the tail and publishes it.
    ///
    /// # Safety
    ///
    /// At most one thread may produce on this queue at a time.
    pub unsafe fn push<T: Send + 'static>(&self, value: T)
    where
        F: FeatureListOf<T>,
    {
        self.push_unchecked(value);
    }

    /// Pushes `value` without blocking beyond `guarantee`.
    ///
    /// # Safety
    ///
    /// At most one thread may produce on this queue at a time.
    pub unsafe fn try_push<T: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: T,
    ) -> Result<(), TryPushError<T>>
    where
        F: FeatureListOf<T>,
    {
        self.try_push_unchecked(guarantee, value)
    }

    /// Begins a put transaction; the element stays hidden until commit.
    ///
    /// # Safety
    ///
    /// At most one thread may produce on this queue at a time, and the
    /// transaction must be finished on that thread.
    pub unsafe fn start_push<T: Send + 'static>(
        &self,
        value: T,
    ) -> LfPutTransaction<'_, T, F, A, SingleProducer, C, O>
    where
        F: FeatureListOf<T>,
    {
        self.start_push_unchecked(value)
    }

    /// Default-constructs an element of runtime type `rt` and publishes it.
    ///
    /// # Safety
    ///
    /// At most one thread may produce on this queue at a time.
    pub unsafe fn dyn_push<I>(&self, rt: RuntimeType<F>)
    where
        F: Select<DefaultConstruct, I>,
    {
        self.dyn_push_unchecked(rt);
    }
}

impl<F, A, P, C, O> LfHeterQueue<F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    unsafe fn push_unchecked<T: Send + 'static>(&self, value: T)
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(None)
            .expect("blocking allocation cannot fail");
        (slot.user as *mut T).write(value);
        self.publish_slot(slot.cb);
    }

    unsafe fn try_push_unchecked<T: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: T,
    ) -> Result<(), TryPushError<T>>
    where
        F: FeatureListOf<T>,
    {
        match self.start_put_slot::<T>(Some(guarantee)) {
            Some(slot) => {
                (slot.user as *mut T).write(value);
                self.publish_slot(slot.cb);
                Ok(())
            }
            None => Err(TryPushError { value }),
        }
    }

    unsafe fn start_push_unchecked<T: Send + 'static>(
        &self,
        value: T,
    ) -> LfPutTransaction<'_, T, F, A, P, C, O>
    where
        F: FeatureListOf<T>,
    {
        let slot = self
            .start_put_slot::<T>(None)
            .expect("blocking allocation cannot fail");
        let payload = slot.user as *mut T;
        payload.write(value);
        LfPutTransaction {
            queue: self,
            cb: slot.cb,
            payload,
        }
    }

    unsafe fn try_start_push_unchecked<T: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: T,
    ) -> Result<LfPutTransaction<'_, T, F, A, P, C, O>, TryPushError<T>>
    where
        F: FeatureListOf<T>,
    {
        match self.start_put_slot::<T>(Some(guarantee)) {
            Some(slot) => {
                let payload = slot.user as *mut T;
                payload.write(value);
                Ok(LfPutTransaction {
                    queue: self,
                    cb: slot.cb,
                    payload,
                })
            }
            None => Err(TryPushError { value }),
        }
    }

    unsafe fn dyn_push_unchecked<I>(&self, rt: RuntimeType<F>)
    where
        F: Select<DefaultConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, None)
            .expect("blocking allocation cannot fail");
        let guard = LfRetireGuard {
            queue: self,
            cb: slot.cb,
        };
        rt.default_construct(slot.user as *mut u8);
        mem::forget(guard);
        self.publish_slot(slot.cb);
    }

    unsafe fn dyn_push_copy_unchecked<I>(&self, rt: RuntimeType<F>, src: *const u8)
    where
        F: Select<CopyConstruct, I>,
    {
        let slot = self
            .start_dyn_put_slot(rt, None)
            .expect("blocking allocation cannot fail");
        let guard = LfRetireGuard {
            queue: self,
            cb: slot.cb,
        };
        rt.copy_construct(slot.user as *mut u8, src);
        mem::forget(guard);
        self.publish_slot(slot.cb);
    }

    unsafe fn dyn_push_move_unchecked(&self, rt: RuntimeType<F>, src: *mut u8) {
        let slot = self
            .start_dyn_put_slot(rt, None)
            .expect("blocking allocation cannot fail");
        rt.move_construct(slot.user as *mut u8, src);
        self.publish_slot(slot.cb);
    }
}

// ============================================================================
// Consumer API
// ============================================================================

impl<F, A, P, O> LfHeterQueue<F, A, P, MultiConsumer, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    O: OrderingModel,
{
    /// True when no consumable element was observed. Inherently a snapshot
    /// under concurrency.
    #[must_use]
    pub fn empty(&self) -> bool {
        // SAFETY: multi-consumer walks pin the pages they read.
        unsafe { self.empty_impl() }
    }

    /// Claims the oldest consumable element; `None` when no consumable
    /// element was observed.
    pub fn try_start_consume(&self) -> Option<LfConsumeOperation<'_, F, A, P, MultiConsumer, O>> {
        // SAFETY: multi-consumer protocol pins pages while walking.
        let cb = unsafe { self.claim_consume()? };
        Some(LfConsumeOperation { queue: self, cb })
    }

    /// Alias of [`try_start_consume`](Self::try_start_consume): every
    /// lock-free consume is reentrant.
    pub fn try_start_reentrant_consume(
        &self,
    ) -> Option<LfConsumeOperation<'_, F, A, P, MultiConsumer, O>> {
        self.try_start_consume()
    }

    /// Consumes and destroys the oldest element. Returns false when none
    /// was observed.
    pub fn try_pop(&self) -> bool {
        match self.try_start_consume() {
            Some(op) => {
                op.commit();
                true
            }
            None => false,
        }
    }

    /// Consumes the oldest element and moves it out when its type is `T`.
    pub fn try_pop_as<T: Send + 'static>(&self) -> Option<T> {
        let op = self.try_start_consume()?;
        op.take()
    }
}

impl<F, A, P, O> LfHeterQueue<F, A, P, SingleConsumer, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    O: OrderingModel,
{
    /// True when no consumable element was observed.
    ///
    /// # Safety
    ///
    /// At most one thread may consume or observe this queue at a time (no
    /// pins protect the walk on a single-consumer queue).
    #[must_use]
    pub unsafe fn empty(&self) -> bool {
        self.empty_impl()
    }

    /// Claims the oldest consumable element.
    ///
    /// # Safety
    ///
    /// At most one thread may consume on this queue at a time, and the
    /// operation must be finished on that thread.
    pub unsafe fn try_start_consume(
        &self,
    ) -> Option<LfConsumeOperation<'_, F, A, P, SingleConsumer, O>> {
        let cb = self.claim_consume()?;
        Some(LfConsumeOperation { queue: self, cb })
    }

    /// Consumes and destroys the oldest element.
    ///
    /// # Safety
    ///
    /// At most one thread may consume on this queue at a time.
    pub unsafe fn try_pop(&self) -> bool {
        match self.try_start_consume() {
            Some(op) => {
                op.commit();
                true
            }
            None => false,
        }
    }

    /// Consumes the oldest element and moves it out when its type is `T`.
    ///
    /// # Safety
    ///
    /// At most one thread may consume on this queue at a time.
    pub unsafe fn try_pop_as<T: Send + 'static>(&self) -> Option<T> {
        let op = self.try_start_consume()?;
        op.take()
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Retires a claimed slot when dropped; defused with `mem::forget` once the
/// element construction succeeded.
struct LfRetireGuard<'a, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    queue: &'a LfHeterQueue<F, A, P, C, O>,
    cb: usize,
}

impl<F, A, P, C, O> Drop for LfRetireGuard<'_, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    fn drop(&mut self) {
        unsafe { self.queue.retire_slot(self.cb) };
    }
}

/// Pending lock-free put. The element is hidden (BUSY) until
/// [`commit`](Self::commit); dropping cancels and retires the slot.
pub struct LfPutTransaction<'a, T, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    queue: &'a LfHeterQueue<F, A, P, C, O>,
    cb: usize,
    payload: *mut T,
}

impl<T: 'static, F, A, P, C, O> LfPutTransaction<'_, T, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    /// The runtime type of the in-flight element.
    #[must_use]
    pub fn complete_type(&self) -> RuntimeType<F> {
        unsafe { *LfHeterQueue::<F, A, P, C, O>::type_slot(self.cb) }
    }

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

    /// Allocates a raw side block bound to the in-flight element; it is
    /// reclaimed when the element is consumed.
    pub fn raw_allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        let slot = self
            .queue
            .produce_slot(size, align, false, CbFlags::DEAD.bits(), None)
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
        match self.queue.produce_slot(
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

    /// Copies `values` into a raw side block.
    pub fn raw_allocate_copy<U: Copy>(&mut self, values: &[U]) -> *mut U {
        let bytes = core::mem::size_of_val(values);
        let block = self.raw_allocate(bytes.max(1), mem::align_of::<U>()) as *mut U;
        unsafe { ptr::copy_nonoverlapping(values.as_ptr(), block, values.len()) };
        block
    }

    /// Publishes the element.
    pub fn commit(self) {
        let this = mem::ManuallyDrop::new(self);
        unsafe { this.queue.publish_slot(this.cb) };
    }

    /// Destroys the element and retires its slot.
    pub fn cancel(self) {
        drop(self);
    }
}

impl<T, F, A, P, C, O> Drop for LfPutTransaction<'_, T, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.payload);
            self.queue.retire_slot(self.cb);
        }
    }
}

/// Pending lock-free put of a dynamically typed element; hidden (BUSY)
/// until commit.
pub struct LfDynPutTransaction<'a, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    queue: &'a LfHeterQueue<F, A, P, C, O>,
    cb: usize,
    payload: *mut u8,
}

impl<F, A, P, C, O> LfDynPutTransaction<'_, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    /// The runtime type of the in-flight element.
    #[must_use]
    pub fn complete_type(&self) -> RuntimeType<F> {
        unsafe { *LfHeterQueue::<F, A, P, C, O>::type_slot(self.cb) }
    }

    /// Raw address of the in-flight element.
    #[must_use]
    pub fn element_ptr(&self) -> *mut u8 {
        self.payload
    }

    /// Allocates a raw side block bound to the in-flight element.
    pub fn raw_allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        let slot = self
            .queue
            .produce_slot(size, align, false, CbFlags::DEAD.bits(), None)
            .expect("blocking allocation cannot fail");
        slot.user as *mut u8
    }

    /// Publishes the element.
    pub fn commit(self) {
        let this = mem::ManuallyDrop::new(self);
        unsafe { this.queue.publish_slot(this.cb) };
    }

    /// Destroys the element and retires its slot.
    pub fn cancel(self) {
        drop(self);
    }
}

impl<F, A, P, C, O> Drop for LfDynPutTransaction<'_, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    fn drop(&mut self) {
        unsafe {
            let rt = *LfHeterQueue::<F, A, P, C, O>::type_slot(self.cb);
            rt.destroy(self.payload);
            self.queue.retire_slot(self.cb);
        }
    }
}

/// Pending lock-free consume. Commit destroys the element and helps the
/// head forward; dropping (or `cancel`) returns the element to the queue.
pub struct LfConsumeOperation<'a, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    queue: &'a LfHeterQueue<F, A, P, C, O>,
    cb: usize,
}

impl<F, A, P, C, O> LfConsumeOperation<'_, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    /// The runtime type of the claimed element.
    #[must_use]
    pub fn runtime_type(&self) -> RuntimeType<F> {
        unsafe { *LfHeterQueue::<F, A, P, C, O>::type_slot(self.cb) }
    }

    /// Raw address of the claimed element's payload.
    #[must_use]
    pub fn element_ptr(&self) -> *mut u8 {
        unsafe { LfHeterQueue::<F, A, P, C, O>::element_ptr_of(self.cb) }
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

    /// Moves the element out when its type is `T`; on a mismatch the
    /// element is returned to the queue.
    pub fn take<T: Send + 'static>(self) -> Option<T> {
        if !self.runtime_type().is::<T>() {
            self.cancel();
            return None;
        }
        let this = mem::ManuallyDrop::new(self);
        unsafe {
            let value = (this.element_ptr() as *mut T).read();
            this.queue.commit_consume(this.cb, false);
            Some(value)
        }
    }

    /// Destroys the element and helps the head forward.
    pub fn commit(self) {
        let this = mem::ManuallyDrop::new(self);
        unsafe { this.queue.commit_consume(this.cb, true) };
    }

    /// Returns the element to the consumable state.
    pub fn cancel(self) {
        let this = mem::ManuallyDrop::new(self);
        unsafe { this.queue.cancel_consume(this.cb) };
    }
}

impl<F, A, P, C, O> Drop for LfConsumeOperation<'_, F, A, P, C, O>
where
    F: FeatureList,
    A: UntypedAllocator + PagedAllocator,
    P: ProducerModel,
    C: ConsumerModel,
    O: OrderingModel,
{
    fn drop(&mut self) {
        unsafe { self.queue.cancel_consume(self.cb) };
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::feature::Equal;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    type Feats = crate::features![CopyConstruct, Equal, DefaultConstruct];
    type Mpmc = MpmcLfQueue<Feats>;

    /// Larger than a 64 KiB page.
    #[derive(Clone, PartialEq)]
    struct Huge([u8; 100_000]);

    impl Huge {
        fn filled(byte: u8) -> Self {
            Self([byte; 100_000])
        }
    }

    impl Default for Huge {
        fn default() -> Self {
            Self::filled(0)
        }
    }

    #[test]
    fn test_fifo_single_thread() {
        let queue = Mpmc::new();
        assert!(queue.empty());

        queue.push(1i32);
        queue.push(2i32);
        queue.push(3.5f64);
        assert!(!queue.empty());

        assert_eq!(queue.try_pop_as::<i32>(), Some(1));
        assert_eq!(queue.try_pop_as::<i32>(), Some(2));
        assert_eq!(queue.try_pop_as::<f64>(), Some(3.5));
        assert!(queue.empty());
        assert!(queue.try_start_consume().is_none());
    }

    #[test]
    fn test_transaction_hidden_until_commit() {
        let queue = Mpmc::new();
        let txn = queue.start_push(11u32);
        assert!(queue.empty());
        assert!(queue.try_start_consume().is_none());
        txn.commit();
        assert_eq!(queue.try_pop_as::<u32>(), Some(11));
    }

    #[test]
    fn test_transaction_cancel_is_invisible() {
        let queue = Mpmc::new();
        let txn = queue.start_push(1u32);
        txn.cancel();
        queue.push(2u32);
        assert_eq!(queue.try_pop_as::<u32>(), Some(2));
        assert!(queue.empty());
    }

    #[test]
    fn test_consume_cancel_restores_element() {
        let queue = Mpmc::new();
        queue.push(5i64);
        let op = queue.try_start_consume().unwrap();
        assert_eq!(op.downcast_ref::<i64>(), Some(&5));
        op.cancel();
        assert_eq!(queue.try_pop_as::<i64>(), Some(5));
    }

    #[test]
    fn test_busy_element_is_skipped() {
        let queue = Mpmc::new();
        queue.push(1u8);
        queue.push(2u8);
        let first = queue.try_start_consume().unwrap();
        // The claimed head element is hidden; the next one is served.
        let second = queue.try_start_consume().unwrap();
        assert_eq!(second.downcast_ref::<u8>(), Some(&2));
        second.cancel();
        first.commit();
        assert_eq!(queue.try_pop_as::<u8>(), Some(2));
    }

    #[test]
    fn test_try_push_with_failure_publishes_nothing() {
        let queue = Mpmc::new();
        let result: Result<(), &str> = queue.try_push_with(|| Err::<u32, _>("nope"));
        assert!(result.is_err());
        assert!(queue.empty());
        let ok: Result<(), &str> = queue.try_push_with(|| Ok(3u32));
        assert!(ok.is_ok());
        assert_eq!(queue.try_pop_as::<u32>(), Some(3));
    }

    #[test]
    fn test_dyn_push_family() {
        let queue = Mpmc::new();
        let rt = RuntimeType::<Feats>::of::<u32>();

        queue.dyn_push(rt);
        let src = 9u32;
        unsafe { queue.dyn_push_copy(rt, core::ptr::addr_of!(src).cast()) };
        let mut moved = 12u32;
        unsafe { queue.dyn_push_move(rt, core::ptr::addr_of_mut!(moved).cast()) };

        assert_eq!(queue.try_pop_as::<u32>(), Some(0));
        assert_eq!(queue.try_pop_as::<u32>(), Some(9));
        assert_eq!(queue.try_pop_as::<u32>(), Some(12));
    }

    #[test]
    fn test_start_dyn_push_transactions() {
        let queue = Mpmc::new();
        let rt = RuntimeType::<Feats>::of::<u32>();

        let txn = queue.start_dyn_push(rt);
        assert!(queue.empty());
        txn.commit();

        let src = 4u32;
        let txn = unsafe { queue.start_dyn_push_copy(rt, core::ptr::addr_of!(src).cast()) };
        txn.commit();

        assert_eq!(queue.try_pop_as::<u32>(), Some(0));
        assert_eq!(queue.try_pop_as::<u32>(), Some(4));
    }

    #[test]
    fn test_page_jump_across_many_elements() {
        let queue = Mpmc::new();
        // Several 64 KiB pages worth of u64 elements.
        for i in 0..10_000u64 {
            queue.push(i);
        }
        for i in 0..10_000u64 {
            assert_eq!(queue.try_pop_as::<u64>(), Some(i));
        }
        assert!(queue.empty());
    }

    #[test]
    fn test_oversized_element_roundtrip() {
        let queue = Mpmc::new();
        queue.push(Huge::filled(3));
        let op = queue.try_start_consume().unwrap();
        assert!(op.downcast_ref::<Huge>().unwrap().0.iter().all(|&b| b == 3));
        op.commit();
        assert!(queue.empty());
    }

    #[test]
    fn test_raw_block_survives_until_consume() {
        let queue = Mpmc::new();
        let mut txn = queue.start_push(0usize);
        let raw = txn.raw_allocate_copy(&[10u32, 20, 30]);
        *txn.element() = raw as usize;
        txn.commit();

        let op = queue.try_start_consume().unwrap();
        let addr = *op.downcast_ref::<usize>().unwrap();
        let values = unsafe { core::slice::from_raw_parts(addr as *const u32, 3) };
        assert_eq!(values, [10, 20, 30]);
        op.commit();
    }

    #[test]
    fn test_spsc_contract() {
        let queue: SpscLfQueue<Feats> = SpscLfQueue::new();
        unsafe {
            queue.push(1u16);
            queue.push(2u16);
            assert!(!queue.empty());
            assert_eq!(queue.try_pop_as::<u16>(), Some(1));
            assert_eq!(queue.try_pop_as::<u16>(), Some(2));
            assert!(queue.empty());
        }
    }

    #[test]
    fn test_relaxed_model_single_thread() {
        let queue: LfHeterQueue<Feats, DefaultAllocator, MultiProducer, MultiConsumer, RelaxedModel> =
            LfHeterQueue::new();
        queue.push(1u32);
        queue.push(2u32);
        assert_eq!(queue.try_pop_as::<u32>(), Some(1));
        assert_eq!(queue.try_pop_as::<u32>(), Some(2));
    }

    #[test]
    fn test_drop_with_pending_elements() {
        let queue = Mpmc::new();
        for i in 0..100u64 {
            queue.push(i);
        }
        queue.push(Huge::filled(0));
        drop(queue); // must release pages, the external block and elements
    }

    #[test]
    fn test_two_producers_one_consumer_smoke() {
        let queue = Arc::new(Mpmc::new());
        let mut handles = Vec::new();
        for producer in 0..2u64 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for seq in 0..1000u64 {
                    queue.push(producer << 32 | seq);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last_seen = [None::<u64>; 2];
        let mut count = 0;
        while let Some(value) = queue.try_pop_as::<u64>() {
            let producer = (value >> 32) as usize;
            let seq = value & 0xFFFF_FFFF;
            if let Some(previous) = last_seen[producer] {
                assert!(seq > previous, "per-producer order violated");
            }
            last_seen[producer] = Some(seq);
            count += 1;
        }
        assert_eq!(count, 2000);
    }
}
