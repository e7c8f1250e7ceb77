//! # Tern VM Garbage Collector
//!
//! Page-based, non-moving mark-sweep heap.
//!
//! ## Design
//!
//! - **Pages**: Fixed-capacity pages measured in 16-byte units; objects start at unit offsets
//! - **Quicklists**: Exact-size free runs below a cutoff, with a non-empty bitmap
//! - **Freelist**: First-fit list of larger runs, split on allocation
//! - **Large objects**: A dedicated page per object, released when the object dies
//! - **Marking**: Bounded mark stack; overflow falls back to rescanning marked cells
//! - **Handles**: Objects are named by generation-checked [`GcRef`]s, so a stale
//!   handle never aliases a newer object that reuses the same space

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

mod error;
mod freelist;
mod handle;
pub mod heap;
mod page;
pub mod trace;

pub use error::{GcError, GcResult};
pub use handle::GcRef;
pub use heap::{GcConfig, GcStats, Heap};
pub use trace::{RootProvider, Trace, Tracer};

/// Allocation granularity in bytes
pub const UNIT_BYTES: usize = 16;
