//! # Egg Counters - Per-CPU Performance Counters in Shared Memory
//!
//! A process publishes named counters in a shared memory region with a fixed
//! binary layout. Any other process, typically the `egg-counters` inspection
//! tool, can attach to that region by pid and read live values without ever
//! synchronizing with, or blocking, the instrumented process.
//!
//! ## The Problem
//!
//! Instrumenting a hot path with a single shared integer makes every increment
//! fight for the cache line holding it. Exporting the values to another
//! process usually adds a lock, a socket or a background thread on top.
//!
//! ## The Solution
//!
//! 1. **Per-CPU shards**: each counter owns one 8-byte slot in one cache line
//!    per CPU. An increment looks up the current CPU (see [`cpu`]) and touches
//!    only that CPU's line.
//!
//! 2. **Plain adds**: increments are a relaxed load and store, no atomic
//!    read-modify-write. Two threads preempted on the same CPU can lose an
//!    update; counters accept that.
//!
//! 3. **Shared memory as the interface**: the region is a POSIX shared memory
//!    object named after the writer's pid (`/EggCounters-<pid>`). Readers map
//!    it read-only, validate the header and walk the descriptors. See
//!    [`layout`] for the byte-exact format.
//!
//! 4. **Aggregation on read**: [`Counter::get`] sums the shards.
//!
//! ## Quick Start
//!
//! ```rust
//! use egg_counters::{define_counter, Arena};
//!
//! define_counter!(REQUESTS, "Server", "Requests", "Requests handled");
//!
//! REQUESTS.increment();
//! REQUESTS.add(2);
//! assert_eq!(REQUESTS.get(), 3);
//!
//! // Another process would call Arena::attach(pid) instead.
//! for counter in Arena::local().counters() {
//!     println!("{}/{} = {}", counter.category(), counter.name(), counter.get());
//! }
//! ```
//!
//! ## Environment
//!
//! Setting `EGG_COUNTER_DISABLE_SHM` makes the process arena use private
//! memory. Counters keep working inside the process but nobody else can see
//! them.
//!
//! ## Observers
//!
//! | Feature | Module | Description |
//! |---------|--------|-------------|
//! | `table` | [`observers::table`] | Render counters as tables |
//! | `json` | [`observers::json`] | Serialize counters to JSON |
//! | `cli` | `egg-counters` binary | Inspect another process |

pub mod arena;
pub mod config;
pub mod counter;
pub mod cpu;
pub mod error;
pub mod layout;
pub mod observers;
mod region;

#[cfg(feature = "serde")]
pub mod snapshot;

pub use arena::Arena;
pub use config::ArenaConfig;
pub use counter::{Counter, LazyCounter, Observable};
pub use error::{ArenaError, AttachFailure, Result};
