//! # heterokit
//!
//! Heterogeneous container primitives for high performance applications.
//!
//! This library provides FIFO queues whose elements may have arbitrary,
//! distinct types, stored contiguously in paged memory together with a
//! compact runtime type descriptor - no common base trait, no per-element
//! boxing. Elements are constructed, copied, compared, hashed, invoked and
//! destroyed polymorphically through per-type feature tables resolved at
//! compile time.
//!
//! ## Module Organization
//!
//! The library is organized into the following categories:
//!
//! ### Foundation
//! - [`arith`] - Address and alignment arithmetic
//! - [`malloc`] - Untyped and paged allocator abstractions, page pinning
//! - [`error`] - Error types
//! - [`mod@backoff`] - Exponential backoff for contention management
//!
//! ### Runtime Types
//! - [`feature`] - Type features and compile-time feature lists
//! - [`runtime_type`] - The value-sized runtime type descriptor
//!
//! ### Queues
//! - [`queue`] - Non-concurrent paginated heterogeneous FIFO
//! - [`lf_queue`] - Lock-free heterogeneous FIFO with producer, consumer
//!   and consistency dials
//!
//! ### High-Level Facilities
//! - [`function_queue`] - FIFO of type-erased callables
//! - [`lifo`] - Typeless LIFO allocator and buffers
//!
//! ## Example
//!
//! ```
//! use heterokit::HeterQueue;
//!
//! let mut queue: HeterQueue = HeterQueue::new();
//! queue.push(42i32);
//! queue.push(1.25f64);
//!
//! let first = queue.try_start_consume().unwrap();
//! assert_eq!(first.downcast_ref::<i32>(), Some(&42));
//! first.commit();
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

extern crate alloc;

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

pub mod arith;

pub mod backoff;

pub mod error;

// =============================================================================
// Tier 1: Allocation (Depends on Tier 0)
// =============================================================================

pub mod malloc;

// =============================================================================
// Tier 2: Runtime Types (Depends on Tier 0)
// =============================================================================

pub mod feature;

pub mod runtime_type;

// =============================================================================
// Tier 3: Queue Plumbing (Depends on Tiers 0-2)
// =============================================================================

mod control;

// =============================================================================
// Tier 4: Queues (Depends on Tiers 0-3)
// =============================================================================

pub mod queue;

pub mod lf_queue;

// =============================================================================
// Tier 5: High-Level Facilities (Depends on Tiers 0-4)
// =============================================================================

pub mod function_queue;

pub mod lifo;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use crate::malloc::{DefaultAllocator, PagedAllocator, ProgressGuarantee, UntypedAllocator};
pub use crate::error::{OutOfMemory, TryPushError};
pub use crate::feature::{
    Cons, CopyConstruct, DebugFmt, DefaultConstruct, DefaultFeatures, Equal, Feature, FeatureList,
    HashValue, Invoke, Less, Nil,
};
pub use crate::function_queue::FunctionQueue;
pub use crate::lf_queue::{
    LfHeterQueue, MpmcLfQueue, MpscLfQueue, MultiConsumer, MultiProducer, RelaxedModel,
    SeqCstModel, SingleConsumer, SingleProducer, SpscLfQueue,
};
pub use crate::lifo::{LifoAllocator, LifoBuffer};
pub use crate::queue::HeterQueue;
pub use crate::runtime_type::RuntimeType;
