//! Observers render counters for humans and tools.
//!
//! - [`table`] - Pretty-print counters as tables using the `tabled` crate
//! - [`json`] - Serialize counters to JSON
//!
//! Both work on any iterator of [`Observable`](crate::Observable) trait
//! objects, so they render local counters and counters discovered in another
//! process alike.
//!
//! # Feature Flags
//!
//! - `table` - Enables the [`table`] module
//! - `json` - Enables the [`json`] module
//! - `full` - Enables both
//!
//! # Example
//!
//! ```rust,ignore
//! use egg_counters::{Arena, Observable};
//! use egg_counters::observers::table::TableObserver;
//!
//! let arena = Arena::attach(pid)?;
//! let counters = arena.counters();
//! let output = TableObserver::new().render(counters.iter().map(|c| c as &dyn Observable));
//! println!("{output}");
//! ```

#[cfg(feature = "table")]
pub mod table;

#[cfg(feature = "json")]
pub mod json;
