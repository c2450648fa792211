//! End-to-end scenarios for the non-concurrent heterogeneous queue.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use heterokit::{
    DefaultAllocator, DefaultFeatures, HeterQueue, PagedAllocator, ProgressGuarantee,
    UntypedAllocator,
};

/// Wrapper around the default allocator that counts outstanding pages and
/// blocks, for leak assertions.
#[derive(Clone, Default)]
struct Counting {
    inner: DefaultAllocator,
    pages: Arc<AtomicIsize>,
    blocks: Arc<AtomicIsize>,
}

impl UntypedAllocator for Counting {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.inner.allocate(layout)
    }

    fn try_allocate(&self, guarantee: ProgressGuarantee, layout: Layout) -> Option<NonNull<u8>> {
        let block = self.inner.try_allocate(guarantee, layout)?;
        self.blocks.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.blocks.fetch_sub(1, Ordering::Relaxed);
        self.inner.deallocate(ptr, layout);
    }
}

impl PagedAllocator for Counting {
    const PAGE_SIZE: usize = DefaultAllocator::PAGE_SIZE;
    const PAGE_ALIGNMENT: usize = DefaultAllocator::PAGE_ALIGNMENT;

    fn allocate_page(&self) -> NonNull<u8> {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.inner.allocate_page()
    }

    fn try_allocate_page(&self, guarantee: ProgressGuarantee) -> Option<NonNull<u8>> {
        let page = self.inner.try_allocate_page(guarantee)?;
        self.pages.fetch_add(1, Ordering::Relaxed);
        Some(page)
    }

    fn allocate_page_zeroed(&self) -> NonNull<u8> {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.inner.allocate_page_zeroed()
    }

    fn try_allocate_page_zeroed(&self, guarantee: ProgressGuarantee) -> Option<NonNull<u8>> {
        let page = self.inner.try_allocate_page_zeroed(guarantee)?;
        self.pages.fetch_add(1, Ordering::Relaxed);
        Some(page)
    }

    unsafe fn deallocate_page(&self, page: NonNull<u8>) {
        self.pages.fetch_sub(1, Ordering::Relaxed);
        self.inner.deallocate_page(page);
    }

    unsafe fn deallocate_page_zeroed(&self, page: NonNull<u8>) {
        self.pages.fetch_sub(1, Ordering::Relaxed);
        self.inner.deallocate_page_zeroed(page);
    }

    fn pin_page(&self, addr: usize) {
        self.inner.pin_page(addr);
    }

    fn unpin_page(&self, addr: usize) {
        self.inner.unpin_page(addr);
    }

    fn pin_count(&self, addr: usize) -> usize {
        self.inner.pin_count(addr)
    }
}

#[test]
fn fifo_order_and_no_leaks() {
    let alloc = Counting::default();
    let pages = Arc::clone(&alloc.pages);
    let blocks = Arc::clone(&alloc.blocks);
    {
        let mut queue: HeterQueue<DefaultFeatures, Counting> = HeterQueue::with_allocator(alloc);
        queue.push(1i32);
        queue.push(2i32);
        queue.push(3.5f64);

        assert_eq!(queue.try_pop_as::<i32>(), Some(1));
        assert_eq!(queue.try_pop_as::<i32>(), Some(2));
        assert_eq!(queue.try_pop_as::<f64>(), Some(3.5));
        assert!(queue.empty());
    }
    assert_eq!(pages.load(Ordering::Relaxed), 0);
    assert_eq!(blocks.load(Ordering::Relaxed), 0);
}

#[test]
fn cancelled_transaction_never_surfaces() {
    let mut queue: HeterQueue = HeterQueue::new();

    let pending = queue.start_push(String::from("hello"));
    drop(pending);
    queue.push(42i32);

    let consume = queue.try_start_consume().expect("one element");
    assert_eq!(consume.downcast_ref::<i32>(), Some(&42));
    consume.commit();
    assert!(queue.empty());
}

#[derive(Clone, PartialEq)]
struct Label {
    text: *const u8,
    len: usize,
}

impl Default for Label {
    fn default() -> Self {
        Self {
            text: std::ptr::null(),
            len: 0,
        }
    }
}

#[test]
fn raw_block_outlives_commit() {
    let mut queue: HeterQueue = HeterQueue::new();

    let mut txn = queue.start_push(Label::default());
    let stored = txn.raw_allocate_copy(b"Hi!\0\0\0");
    txn.element().text = stored;
    txn.element().len = 3;
    txn.commit();

    let consume = queue.try_start_consume().expect("one element");
    let label = consume.downcast_ref::<Label>().expect("a Label");
    let bytes = unsafe { std::slice::from_raw_parts(label.text, label.len) };
    assert_eq!(bytes, b"Hi!");
    consume.commit();
}

/// 4 KiB pages; records the largest untyped allocation handed out.
#[derive(Clone, Default)]
struct Page4k {
    blocks: Arc<AtomicIsize>,
    largest_block: Arc<AtomicUsize>,
}

impl UntypedAllocator for Page4k {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.largest_block
            .fetch_max(layout.size(), Ordering::Relaxed);
        NonNull::new(unsafe { alloc(layout) }).expect("allocation failed")
    }

    fn try_allocate(&self, _guarantee: ProgressGuarantee, layout: Layout) -> Option<NonNull<u8>> {
        Some(self.allocate(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.blocks.fetch_sub(1, Ordering::Relaxed);
        dealloc(ptr.as_ptr(), layout);
    }
}

impl PagedAllocator for Page4k {
    const PAGE_SIZE: usize = 4096;
    const PAGE_ALIGNMENT: usize = 4096;

    fn allocate_page(&self) -> NonNull<u8> {
        let layout = Layout::from_size_align(4096, 4096).unwrap();
        NonNull::new(unsafe { alloc(layout) }).expect("page failed")
    }

    fn try_allocate_page(&self, _guarantee: ProgressGuarantee) -> Option<NonNull<u8>> {
        Some(self.allocate_page())
    }

    fn allocate_page_zeroed(&self) -> NonNull<u8> {
        let page = self.allocate_page();
        unsafe { std::ptr::write_bytes(page.as_ptr(), 0, 4096) };
        page
    }

    fn try_allocate_page_zeroed(&self, guarantee: ProgressGuarantee) -> Option<NonNull<u8>> {
        let page = self.try_allocate_page(guarantee)?;
        unsafe { std::ptr::write_bytes(page.as_ptr(), 0, 4096) };
        Some(page)
    }

    unsafe fn deallocate_page(&self, page: NonNull<u8>) {
        dealloc(page.as_ptr(), Layout::from_size_align(4096, 4096).unwrap());
    }

    unsafe fn deallocate_page_zeroed(&self, page: NonNull<u8>) {
        self.deallocate_page(page);
    }

    fn pin_page(&self, _addr: usize) {}

    fn unpin_page(&self, _addr: usize) {}

    fn pin_count(&self, _addr: usize) -> usize {
        0
    }
}

#[test]
fn oversized_payload_uses_one_external_block() {
    let alloc = Page4k::default();
    let blocks = Arc::clone(&alloc.blocks);
    let largest = Arc::clone(&alloc.largest_block);

    let mut queue: HeterQueue<DefaultFeatures, Page4k> = HeterQueue::with_allocator(alloc);
    queue.push([9u8; 8000]);

    assert_eq!(blocks.load(Ordering::Relaxed), 1);
    assert!(largest.load(Ordering::Relaxed) >= 8000);

    let consume = queue.try_start_consume().expect("one element");
    assert!(consume
        .downcast_ref::<[u8; 8000]>()
        .expect("the big array")
        .iter()
        .all(|&b| b == 9));
    consume.commit();

    assert_eq!(blocks.load(Ordering::Relaxed), 0, "external block freed");
}

#[test]
fn reentrant_consume_keeps_queue_usable() {
    let mut queue: HeterQueue = HeterQueue::new();
    queue.push(1i32); // A
    queue.push(2i32); // B
    queue.push(3i32); // C

    let held = queue.try_start_reentrant_consume().expect("A");
    assert_eq!(held.downcast_ref::<i32>(), Some(&1));

    queue.reentrant_push(4i32); // D, while A is in flight
    held.cancel();

    let seen: Vec<i32> = queue
        .iter()
        .map(|e| *e.downcast_ref::<i32>().unwrap())
        .collect();
    assert_eq!(seen, [1, 2, 3, 4]);
}

#[test]
fn mixed_type_churn_with_default_allocator() {
    let mut queue: HeterQueue = HeterQueue::new();
    for round in 0..50 {
        queue.push(round as u64);
        queue.push(format!("round {round}"));
        queue.push(vec![round; 32]);

        assert_eq!(queue.try_pop_as::<u64>(), Some(round as u64));
        assert_eq!(queue.try_pop_as::<String>(), Some(format!("round {round}")));
        assert_eq!(queue.try_pop_as::<Vec<i32>>(), Some(vec![round; 32]));
    }
    assert!(queue.empty());
}

#[test]
fn duplicate_observes_same_sequence() {
    let mut queue: HeterQueue = HeterQueue::new();
    queue.push(String::from("a"));
    queue.push(7u32);

    let mut copy = queue.duplicate();
    assert!(queue.content_eq(&copy));
    assert_eq!(copy.try_pop_as::<String>(), Some(String::from("a")));
    assert_eq!(copy.try_pop_as::<u32>(), Some(7));
    assert!(!queue.empty());
}
