//! Counter handles and the operations on their per-CPU shards.
//!
//! A counter's value is spread over one slot in each of its group's data
//! cells, one cell per CPU:
//!
//! ```text
//!                        ┌───────────────────────────────────────┐
//!   CPU 0 ──add──►       │ data[0] │ s0 │ s1 │ .. │ s7 │ 64 bytes │
//!   CPU 1 ──add──►       │ data[1] │ s0 │ s1 │ .. │ s7 │ 64 bytes │
//!        ...             │   ...                                  │
//!   CPU n ──add──►       │ data[n] │ s0 │ s1 │ .. │ s7 │ 64 bytes │
//!                        └───────────────────────────────────────┘
//!                                        │
//!                                        ▼
//!                            get() sums slot `position`
//!                                  of every cell
//! ```
//!
//! Increments are a plain load and store on the caller's shard: no lock, no
//! read-modify-write. Two threads that land on the same shard at the same time
//! can lose an update. That is the price of never bouncing a cache line
//! between CPUs, and counters accept it.

use std::fmt::{Debug, Display};
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::arena::Arena;
use crate::cpu;
use crate::layout::{CounterDescriptor, DataCell, COUNTERS_PER_GROUP};

/// Labels of a counter, decoded from its descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Labels {
    category: String,
    name: String,
    description: String,
}

/// Handle to a counter living in an [`Arena`].
///
/// The handle keeps the arena's region alive. Counters obtained from a reader
/// arena can only be read; [`add`](Counter::add) and [`reset`](Counter::reset)
/// do nothing on them.
///
/// # Examples
///
/// ```rust
/// use egg_counters::{Arena, ArenaConfig};
///
/// let arena = Arena::create(&ArenaConfig::new().with_shared(false));
/// let hits = arena.register("Cache", "Hits", "Number of cache hits").unwrap();
///
/// hits.increment();
/// hits.add(4);
/// assert_eq!(hits.get(), 5);
///
/// hits.reset();
/// assert_eq!(hits.get(), 0);
/// ```
#[derive(Clone)]
pub struct Counter {
    arena: Arena,
    values: NonNull<DataCell>,
    position: usize,
    ncpu: usize,
    writable: bool,
    /// Set when threads on different CPUs write different shards.
    sharded: bool,
    labels: Arc<Labels>,
}

// SAFETY: `values` points into the arena region kept alive by `arena`, and the
// shards are only accessed through atomics.
unsafe impl Send for Counter {}
unsafe impl Sync for Counter {}

impl Counter {
    /// # Panics
    ///
    /// If the descriptor does not fit the arena's region. Arenas validate
    /// descriptors before building counters from them.
    pub(crate) fn new(arena: Arena, descriptor: &CounterDescriptor) -> Self {
        let inner = arena.inner();
        let ncpu = inner.ncpu;
        let position = descriptor.position as usize;
        assert!(position < COUNTERS_PER_GROUP, "counter slot {position} out of range");
        let values = inner
            .region
            .data_cells(descriptor.cell as usize, ncpu)
            .unwrap_or_else(|| panic!("counter cell {} outside the region", descriptor.cell));
        let writable = arena.is_writable();

        Self {
            values,
            position,
            ncpu,
            writable,
            sharded: cpu::strategy().is_sharded(),
            labels: Arc::new(Labels {
                category: descriptor.category(),
                name: descriptor.name(),
                description: descriptor.description(),
            }),
            arena,
        }
    }

    #[inline]
    fn shard(&self, cpu: usize) -> &AtomicI64 {
        debug_assert!(cpu < self.ncpu);
        // SAFETY: `values` starts `ncpu` data cells inside the region, checked
        // in `new`, and the region outlives `self.arena`.
        unsafe { &(*self.values.as_ptr().add(cpu)).slots[self.position] }
    }

    /// Adds `delta` to the shard of the current CPU.
    #[inline]
    pub fn add(&self, delta: i64) {
        if !self.writable {
            return;
        }
        let shard = self.shard(cpu::current_cpu() % self.ncpu);
        if self.sharded {
            let value = shard.load(Ordering::Relaxed);
            shard.store(value.wrapping_add(delta), Ordering::Relaxed);
        } else {
            // Every thread shares shard 0.
            shard.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Adds one.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Subtracts `delta`.
    #[inline]
    pub fn sub(&self, delta: i64) {
        self.add(delta.wrapping_neg());
    }

    /// Sum of all shards.
    ///
    /// Approximate while other threads write; never blocks.
    pub fn get(&self) -> i64 {
        fence(Ordering::SeqCst);
        (0..self.ncpu)
            .map(|cpu| self.shard(cpu).load(Ordering::Relaxed))
            .fold(0, i64::wrapping_add)
    }

    /// Zeroes every shard.
    ///
    /// Increments racing with a reset may be lost or survive it.
    pub fn reset(&self) {
        if !self.writable {
            return;
        }
        for cpu in 0..self.ncpu {
            self.shard(cpu).store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    pub fn category(&self) -> &str {
        &self.labels.category
    }

    pub fn name(&self) -> &str {
        &self.labels.name
    }

    pub fn description(&self) -> &str {
        &self.labels.description
    }

    /// The arena this counter lives in.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}

impl Debug for Counter {
    /// Formats the counter showing non-zero shards.
    ///
    /// Output format: `category/name{ [cpu]:value [cpu]:value ... }`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}{{", self.category(), self.name())?;
        for cpu in 0..self.ncpu {
            let value = self.shard(cpu).load(Ordering::Relaxed);
            if value != 0 {
                write!(f, " [{cpu}]:{value}")?;
            }
        }
        write!(f, " }}")
    }
}

/// Read access shared by everything observers can render.
pub trait Observable: Debug {
    fn category(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Current aggregated value.
    fn value(&self) -> i64;
}

impl Observable for Counter {
    fn category(&self) -> &str {
        Counter::category(self)
    }

    fn name(&self) -> &str {
        Counter::name(self)
    }

    fn description(&self) -> &str {
        Counter::description(self)
    }

    fn value(&self) -> i64 {
        self.get()
    }
}

impl Display for dyn Observable + '_ {
    /// Formats the counter as `category/name:value`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.category(), self.name(), self.value())
    }
}

/// A counter usable from a `static`, registered on the process arena the first
/// time it is touched.
///
/// If the process arena is full, the counter is dropped: a warning is logged
/// once and every operation becomes a no-op. Use [`define_counter!`] to
/// declare one.
///
/// [`define_counter!`]: crate::define_counter
pub struct LazyCounter {
    category: &'static str,
    name: &'static str,
    description: &'static str,
    counter: OnceLock<Option<Counter>>,
}

impl LazyCounter {
    pub const fn new(category: &'static str, name: &'static str, description: &'static str) -> Self {
        Self {
            category,
            name,
            description,
            counter: OnceLock::new(),
        }
    }

    /// The registered counter, registering it now if needed. `None` if the
    /// process arena refused it.
    pub fn counter(&self) -> Option<&Counter> {
        self.counter
            .get_or_init(|| {
                Arena::local()
                    .register(self.category, self.name, self.description)
                    .ok()
            })
            .as_ref()
    }

    /// Registers the counter so it shows up in readers before its first use.
    pub fn register(&self) -> bool {
        self.counter().is_some()
    }

    #[inline]
    pub fn add(&self, delta: i64) {
        if let Some(counter) = self.counter() {
            counter.add(delta);
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn sub(&self, delta: i64) {
        self.add(delta.wrapping_neg());
    }

    pub fn get(&self) -> i64 {
        self.counter().map_or(0, Counter::get)
    }

    pub fn reset(&self) {
        if let Some(counter) = self.counter() {
            counter.reset();
        }
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }
}

impl Debug for LazyCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.counter.get() {
            Some(Some(counter)) => Debug::fmt(counter, f),
            _ => write!(f, "{}/{}{{ }}", self.category, self.name),
        }
    }
}

/// Declares a `static` [`LazyCounter`](crate::LazyCounter).
///
/// ```rust
/// egg_counters::define_counter!(pub HITS, "Cache", "Hits", "Number of cache hits");
///
/// HITS.increment();
/// assert!(HITS.get() >= 1);
/// ```
#[macro_export]
macro_rules! define_counter {
    ($(#[$attr:meta])* $vis:vis $ident:ident, $category:expr, $name:expr, $description:expr $(,)?) => {
        $(#[$attr])*
        $vis static $ident: $crate::LazyCounter =
            $crate::LazyCounter::new($category, $name, $description);
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;

    fn private_arena() -> Arena {
        Arena::create(&ArenaConfig::new().with_shared(false))
    }

    #[test]
    fn test_new_counter_is_zero() {
        let counter = private_arena().register("A", "B", "C").unwrap();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_increments_sum() {
        let counter = private_arena().register("A", "B", "C").unwrap();
        let mut expected = 0;
        for delta in [1, 5, 17, 0, 1000] {
            counter.add(delta);
            expected += delta;
            assert_eq!(counter.get(), expected);
        }
    }

    #[test]
    fn test_sub() {
        let counter = private_arena().register("A", "B", "C").unwrap();
        counter.add(10);
        counter.sub(3);
        assert_eq!(counter.get(), 7);
        counter.sub(10);
        assert_eq!(counter.get(), -3);
    }

    #[test]
    fn test_reset() {
        let counter = private_arena().register("A", "B", "C").unwrap();
        counter.add(42);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_counters_are_independent() {
        let arena = private_arena();
        let counters: Vec<Counter> = (0..12)
            .map(|i| arena.register("A", &format!("c{i}"), "").unwrap())
            .collect();
        for (i, counter) in counters.iter().enumerate() {
            counter.add(i as i64 + 1);
        }
        for (i, counter) in counters.iter().enumerate() {
            assert_eq!(counter.get(), i as i64 + 1);
        }
        counters[3].reset();
        assert_eq!(counters[2].get(), 3);
        assert_eq!(counters[3].get(), 0);
        assert_eq!(counters[4].get(), 5);
    }

    #[test]
    fn test_labels() {
        let counter = private_arena()
            .register("Cache", "Hits", "Number of cache hits")
            .unwrap();
        assert_eq!(counter.category(), "Cache");
        assert_eq!(counter.name(), "Hits");
        assert_eq!(counter.description(), "Number of cache hits");
    }

    #[test]
    fn test_handles_share_value() {
        let arena = private_arena();
        let counter = arena.register("A", "B", "C").unwrap();
        counter.add(2);
        let again = arena.counters().remove(0);
        again.add(3);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.clone().get(), 5);
    }

    #[test]
    fn test_counter_outlives_arena_handle() {
        let counter = private_arena().register("A", "B", "C").unwrap();
        counter.add(9);
        assert_eq!(counter.arena().len(), 1);
        assert_eq!(counter.get(), 9);
    }

    #[test]
    fn test_multiple_threads() {
        let counter = private_arena().register("A", "B", "C").unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // Threads sharing a CPU may lose updates.
        let total = counter.get();
        assert!(total > 0 && total <= 4000, "total = {total}");
    }

    #[test]
    fn test_debug() {
        let counter = private_arena().register("Cache", "Hits", "").unwrap();
        counter.add(5);
        let debug_str = format!("{:?}", counter);
        assert!(debug_str.starts_with("Cache/Hits{"));
        assert!(debug_str.contains(":5"));
        assert!(debug_str.ends_with("}"));
    }

    #[test]
    fn test_dyn_format() {
        let counter = private_arena().register("Cache", "Hits", "").unwrap();
        counter.add(1);
        let formatted = format!("{}", &counter as &dyn Observable);
        assert_eq!(formatted, "Cache/Hits:1");
    }

    crate::define_counter!(LAZY, "Lazy", "Counter", "Registered on first use");

    #[test]
    fn test_lazy_counter() {
        assert_eq!(LAZY.category(), "Lazy");
        assert_eq!(format!("{:?}", LAZY), "Lazy/Counter{ }");
        LAZY.increment();
        LAZY.add(2);
        assert_eq!(LAZY.get(), 3);
        assert!(LAZY.register());
        assert!(Arena::local()
            .counters()
            .iter()
            .any(|c| c.category() == "Lazy" && c.name() == "Counter"));
        LAZY.reset();
        assert_eq!(LAZY.get(), 0);
    }
}
