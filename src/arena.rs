//! Counter arenas: the writer side that publishes counters and the reader side
//! that discovers them in another process.
//!
//! # Publishing protocol
//!
//! Readers never lock anything. The writer orders its stores so that a reader
//! can tell how much of the region is ready:
//!
//! 1. The header is written with `size == 0`, then a full fence, then `size`.
//!    A region whose `size` is zero is not initialized yet.
//! 2. A new counter's descriptor is written, then a full fence, then the
//!    header's `n_counters` is bumped. A reader only walks `n_counters`
//!    descriptors.
//!
//! # Process arena
//!
//! [`Arena::local`] returns the process-wide writer, created on first use from
//! [`ArenaConfig::from_env`]. Its shared memory object is unlinked by an
//! `atexit` hook, so nothing survives a normal exit.

use std::fs::File;
use std::io::Read;
use std::mem::size_of;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, OnceLock};

use nix::fcntl::OFlag;
use nix::sys::mman;
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{shm_name, ArenaConfig, DISABLE_SHM_ENV};
use crate::counter::Counter;
use crate::cpu;
use crate::error::{ArenaError, AttachFailure, Result};
use crate::layout::{self, CounterDescriptor, ShmHeader, Slot, COUNTERS_PER_GROUP, HEADER_CELLS, MAGIC, MAX_REGION_SIZE};
use crate::region::Region;

static LOCAL: OnceLock<Arena> = OnceLock::new();
static UNLINK_AT_EXIT: OnceLock<String> = OnceLock::new();

/// Handle to a counter region.
///
/// Cloning is cheap; the region is released when the last handle, including
/// the ones held by [`Counter`]s, drops.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

pub(crate) struct ArenaInner {
    pub(crate) region: Region,
    pub(crate) ncpu: usize,
    first_offset: usize,
    name: Option<String>,
    kind: Kind,
}

enum Kind {
    /// The registration lock guards the list of published descriptors.
    Writer { registry: Mutex<Vec<CounterDescriptor>> },
    Reader { discovered: Vec<CounterDescriptor> },
}

impl Arena {
    /// The process-wide writer arena, created on first call.
    pub fn local() -> &'static Arena {
        LOCAL.get_or_init(|| Self::create_writer(&ArenaConfig::from_env(), false))
    }

    /// Creates a writer arena that is not the process arena.
    ///
    /// A shared memory object created here is unlinked when the last handle
    /// drops. The name must not collide with another live region.
    pub fn create(config: &ArenaConfig) -> Arena {
        Self::create_writer(config, true)
    }

    fn create_writer(config: &ArenaConfig, unlink_on_drop: bool) -> Arena {
        let ncpu = cpu::online_cpus();
        let len = config.region_len(ncpu);

        let shared = if config.shared {
            match Region::create_shared(&config.name, len, unlink_on_drop) {
                Ok(region) => {
                    if !unlink_on_drop {
                        unlink_at_exit(&config.name);
                    }
                    Some(region)
                }
                Err(err) => {
                    warn!(
                        name = %config.name,
                        %err,
                        "failed to create shared counter region, counters will not be available to external processes"
                    );
                    None
                }
            }
        } else {
            debug!("shared counter region disabled by {DISABLE_SHM_ENV}");
            None
        };

        let name = shared.as_ref().map(|_| config.name.clone());
        let region = shared.unwrap_or_else(|| Region::private(len));

        region.write_header(&ShmHeader::new(ncpu));
        fence(Ordering::SeqCst);
        region.write_size(len as u32);

        debug!(name = ?name, len, ncpu, "counter arena ready");

        Arena {
            inner: Arc::new(ArenaInner {
                region,
                ncpu,
                first_offset: HEADER_CELLS,
                name,
                kind: Kind::Writer {
                    registry: Mutex::new(Vec::new()),
                },
            }),
        }
    }

    /// Attaches to the counters published by process `pid`.
    pub fn attach(pid: u32) -> Result<Arena> {
        Self::attach_named(&shm_name(pid))
    }

    /// Attaches to the counter region published under `name`.
    ///
    /// The region is mapped read-only. All validation failures are reported as
    /// [`ArenaError::NotFound`]; no partial result is ever returned.
    pub fn attach_named(name: &str) -> Result<Arena> {
        Self::open_remote(name).map_err(|reason| {
            debug!(%name, %reason, "cannot attach counter region");
            ArenaError::NotFound {
                name: name.to_owned(),
                reason,
            }
        })
    }

    fn open_remote(name: &str) -> std::result::Result<Arena, AttachFailure> {
        let fd = mman::shm_open(name, OFlag::O_RDONLY, Mode::empty()).map_err(AttachFailure::Open)?;
        let mut file = File::from(fd);

        let mut raw = [0u8; size_of::<ShmHeader>()];
        file.read_exact(&mut raw).map_err(AttachFailure::Header)?;
        let header: ShmHeader = bytemuck::pod_read_unaligned(&raw);
        validate_header(&header, cpu::online_cpus())?;

        let size = header.size as usize;
        let actual = file.metadata().map_err(AttachFailure::Header)?.len();
        if actual < size as u64 {
            return Err(AttachFailure::Truncated {
                declared: size,
                actual,
            });
        }

        let region = Region::map_readonly(&file, size).map_err(AttachFailure::Map)?;
        let ncpu = header.ncpu as usize;
        let first_offset = header.first_offset as usize;

        let count = header.n_counters as usize;
        let mut discovered = Vec::with_capacity(count.min(layout::capacity(region.cells(), ncpu)));
        for index in 0..count {
            let slot = Slot::locate(index, first_offset, ncpu);
            if !region.contains(slot.descriptor_cell, slot.end_cell(ncpu) - slot.descriptor_cell) {
                return Err(AttachFailure::Corrupt { index });
            }
            let descriptor = region
                .descriptor(slot.descriptor_cell)
                .ok_or(AttachFailure::Corrupt { index })?;
            if descriptor.position as usize >= COUNTERS_PER_GROUP
                || !region.contains(descriptor.cell as usize, ncpu)
            {
                return Err(AttachFailure::Corrupt { index });
            }
            discovered.push(descriptor);
        }

        debug!(%name, counters = discovered.len(), ncpu, "attached counter region");

        Ok(Arena {
            inner: Arc::new(ArenaInner {
                region,
                ncpu,
                first_offset,
                name: Some(name.to_owned()),
                kind: Kind::Reader { discovered },
            }),
        })
    }

    /// Registers a counter and returns its handle.
    ///
    /// Registrations are serialized by the arena lock. There is no duplicate
    /// check: registering the same name twice publishes two counters.
    ///
    /// # Errors
    ///
    /// [`ArenaError::ReadOnly`] on a reader arena, [`ArenaError::Full`] when
    /// the region has no room left. Nothing is written in either case.
    pub fn register(&self, category: &str, name: &str, description: &str) -> Result<Counter> {
        let Kind::Writer { registry } = &self.inner.kind else {
            warn!(category, name, "refusing to register a counter on a read-only arena");
            return Err(ArenaError::ReadOnly);
        };
        let region = &self.inner.region;
        let ncpu = self.inner.ncpu;

        let mut registry = registry.lock();
        let slot = Slot::locate(registry.len(), self.inner.first_offset, ncpu);
        if !region.contains(slot.descriptor_cell, slot.end_cell(ncpu) - slot.descriptor_cell) {
            let capacity = layout::capacity(region.cells(), ncpu);
            warn!(category, name, capacity, "counter region is full, counter dropped");
            return Err(ArenaError::Full { capacity });
        }

        let descriptor = CounterDescriptor::new(slot.data_cell, slot.position, category, name, description);
        region.write_descriptor(slot.descriptor_cell, &descriptor);
        let counter = Counter::new(self.clone(), &descriptor);
        registry.push(descriptor);

        fence(Ordering::SeqCst);
        region.write_counter_count(registry.len() as u32);
        Ok(counter)
    }

    /// Handles to every counter, in registration order.
    ///
    /// For a writer these are the registered counters; for a reader, the ones
    /// discovered at attach time.
    pub fn counters(&self) -> Vec<Counter> {
        let descriptors = match &self.inner.kind {
            Kind::Writer { registry } => registry.lock().clone(),
            Kind::Reader { discovered } => discovered.clone(),
        };
        descriptors
            .iter()
            .map(|descriptor| Counter::new(self.clone(), descriptor))
            .collect()
    }

    /// Number of registered or discovered counters.
    pub fn len(&self) -> usize {
        match &self.inner.kind {
            Kind::Writer { registry } => registry.lock().len(),
            Kind::Reader { discovered } => discovered.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of counters the region can hold.
    pub fn capacity(&self) -> usize {
        layout::capacity(self.inner.region.cells(), self.inner.ncpu)
    }

    /// Number of CPU shards the region is laid out for.
    pub fn ncpu(&self) -> usize {
        self.inner.ncpu
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.inner.region.len()
    }

    /// Region size in cells.
    pub fn cells(&self) -> usize {
        self.inner.region.cells()
    }

    /// Whether the region lives in shared memory.
    pub fn is_shared(&self) -> bool {
        self.inner.region.is_shared()
    }

    /// Whether counters can be registered and modified through this arena.
    pub fn is_writable(&self) -> bool {
        matches!(self.inner.kind, Kind::Writer { .. })
    }

    /// Shared memory object name, if the region is shared.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Copy of the region header as currently stored.
    pub fn header(&self) -> ShmHeader {
        self.inner.region.header()
    }

    pub(crate) fn inner(&self) -> &ArenaInner {
        &self.inner
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.inner.name)
            .field("writable", &self.is_writable())
            .field("size", &self.size())
            .field("ncpu", &self.inner.ncpu)
            .field("counters", &self.len())
            .finish()
    }
}

/// Checks a header read from another process before anything is mapped.
fn validate_header(header: &ShmHeader, available_cpus: usize) -> std::result::Result<(), AttachFailure> {
    if header.magic != MAGIC {
        return Err(AttachFailure::BadMagic(header.magic));
    }
    let size = header.size as usize;
    if !(size_of::<ShmHeader>()..=MAX_REGION_SIZE).contains(&size) {
        return Err(AttachFailure::BadSize(size));
    }
    let declared = header.ncpu as usize;
    if declared == 0 || declared > available_cpus {
        return Err(AttachFailure::CpuMismatch {
            declared,
            available: available_cpus,
        });
    }
    if header.first_offset as usize != HEADER_CELLS {
        return Err(AttachFailure::LayoutMismatch(header.first_offset as usize));
    }
    Ok(())
}

extern "C" fn unlink_local_region() {
    if let Some(name) = UNLINK_AT_EXIT.get() {
        let _ = mman::shm_unlink(name.as_str());
    }
}

fn unlink_at_exit(name: &str) {
    if UNLINK_AT_EXIT.set(name.to_owned()).is_ok() {
        // SAFETY: the handler only reads a static and calls shm_unlink.
        if unsafe { libc::atexit(unlink_local_region) } != 0 {
            warn!(%name, "failed to register exit handler, counter region will outlive the process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/EggCountersTest-{}-{tag}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn shared_arena(tag: &str) -> (Arena, String) {
        let name = unique_name(tag);
        let arena = Arena::create(&ArenaConfig::new().with_name(name.clone()).with_pages(64));
        assert!(arena.is_shared(), "shared memory unavailable for {name}");
        (arena, name)
    }

    /// Writes raw bytes as a shared memory object, unlinked on drop.
    struct RawObject(String);

    impl RawObject {
        fn new(tag: &str, bytes: &[u8]) -> Self {
            let name = unique_name(tag);
            let fd = mman::shm_open(
                name.as_str(),
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                Mode::S_IRUSR | Mode::S_IWUSR,
            )
            .unwrap();
            File::from(fd).write_all(bytes).unwrap();
            Self(name)
        }
    }

    impl Drop for RawObject {
        fn drop(&mut self) {
            let _ = mman::shm_unlink(self.0.as_str());
        }
    }

    fn header_bytes(header: ShmHeader, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        bytes[..size_of::<ShmHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
        bytes
    }

    fn valid_header(size: usize) -> ShmHeader {
        let mut header = ShmHeader::new(1);
        header.size = size as u32;
        header
    }

    fn attach_failure(name: &str) -> AttachFailure {
        match Arena::attach_named(name) {
            Err(ArenaError::NotFound { reason, .. }) => reason,
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_writer_header() {
        let arena = Arena::create(&ArenaConfig::new().with_shared(false));
        let header = arena.header();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.size as usize, arena.size());
        assert_eq!(header.ncpu as usize, cpu::online_cpus());
        assert_eq!(header.first_offset as usize, HEADER_CELLS);
        assert_eq!(header.n_counters, 0);
        assert!(arena.is_writable());
        assert!(!arena.is_shared());
        assert!(arena.name().is_none());
    }

    #[test]
    fn test_register_publishes_count() {
        let arena = Arena::create(&ArenaConfig::new().with_shared(false));
        arena.register("Cache", "Hits", "Cache hits").unwrap();
        arena.register("Cache", "Misses", "Cache misses").unwrap();
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.header().n_counters, 2);
    }

    #[test]
    fn test_private_arena_operations() {
        let arena = Arena::create(&ArenaConfig::new().with_shared(false));
        let counter = arena.register("Cache", "Hits", "Cache hits").unwrap();
        for _ in 0..5 {
            counter.increment();
        }
        assert_eq!(counter.get(), 5);
        counter.add(10);
        assert_eq!(counter.get(), 15);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_attach_discovers_counters() {
        let (arena, name) = shared_arena("discover");
        let names: Vec<String> = (0..20).map(|i| format!("Counter{i}")).collect();
        for (i, counter_name) in names.iter().enumerate() {
            let counter = arena
                .register("Category", counter_name, &format!("Description {i}"))
                .unwrap();
            counter.add(i as i64);
        }

        let reader = Arena::attach_named(&name).unwrap();
        assert!(!reader.is_writable());
        assert_eq!(reader.ncpu(), arena.ncpu());
        assert_eq!(reader.size(), arena.size());

        let counters = reader.counters();
        assert_eq!(counters.len(), names.len());
        for (i, counter) in counters.iter().enumerate() {
            assert_eq!(counter.category(), "Category");
            assert_eq!(counter.name(), names[i]);
            assert_eq!(counter.description(), format!("Description {i}"));
            assert_eq!(counter.get(), i as i64);
        }
    }

    #[test]
    fn test_reader_sees_live_values() {
        let (arena, name) = shared_arena("live");
        let counter = arena.register("Net", "Packets", "Packets seen").unwrap();
        let reader = Arena::attach_named(&name).unwrap();
        let remote = reader.counters().remove(0);

        assert_eq!(remote.get(), 0);
        counter.add(7);
        assert_eq!(remote.get(), 7);
        counter.reset();
        assert_eq!(remote.get(), 0);
    }

    #[test]
    fn test_reader_ignores_later_registrations() {
        let (arena, name) = shared_arena("later");
        arena.register("A", "One", "").unwrap();
        let reader = Arena::attach_named(&name).unwrap();
        arena.register("A", "Two", "").unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(Arena::attach_named(&name).unwrap().len(), 2);
    }

    #[test]
    fn test_reader_mutation_is_noop() {
        let (arena, name) = shared_arena("noop");
        arena.register("A", "One", "").unwrap().add(3);
        let reader = Arena::attach_named(&name).unwrap();
        let remote = reader.counters().remove(0);
        remote.add(100);
        remote.reset();
        assert_eq!(remote.get(), 3);
    }

    #[test]
    fn test_register_on_reader() {
        let (_arena, name) = shared_arena("readonly");
        let reader = Arena::attach_named(&name).unwrap();
        assert!(matches!(
            reader.register("A", "B", "C"),
            Err(ArenaError::ReadOnly)
        ));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_register_until_full() {
        let arena = Arena::create(&ArenaConfig::new().with_shared(false).with_pages(1));
        let capacity = arena.capacity();
        assert!(capacity >= COUNTERS_PER_GROUP);
        for i in 0..capacity {
            arena.register("Fill", &format!("c{i}"), "").unwrap();
        }
        match arena.register("Fill", "overflow", "") {
            Err(ArenaError::Full { capacity: reported }) => assert_eq!(reported, capacity),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(arena.len(), capacity);
        assert_eq!(arena.header().n_counters as usize, capacity);
    }

    #[test]
    fn test_concurrent_registration() {
        let arena = Arena::create(&ArenaConfig::new().with_shared(false).with_pages(64));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let arena = arena.clone();
                std::thread::spawn(move || {
                    for i in 0..8 {
                        arena.register("Thread", &format!("t{t}-{i}"), "").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut names: Vec<String> = arena.counters().iter().map(|c| c.name().to_owned()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 32);
        assert_eq!(arena.header().n_counters, 32);
    }

    #[test]
    fn test_attach_missing() {
        assert!(matches!(
            attach_failure(&unique_name("missing")),
            AttachFailure::Open(_)
        ));
    }

    #[test]
    fn test_attach_missing_pid() {
        // pid 0 is never a user process
        assert!(matches!(
            Arena::attach(0),
            Err(ArenaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_attach_bad_magic() {
        let mut header = valid_header(4096);
        header.magic = 0xdead_beef;
        let object = RawObject::new("magic", &header_bytes(header, 4096));
        assert!(matches!(
            attach_failure(&object.0),
            AttachFailure::BadMagic(0xdead_beef)
        ));
    }

    #[test]
    fn test_attach_short_header() {
        let object = RawObject::new("short", &[0u8; 16]);
        assert!(matches!(attach_failure(&object.0), AttachFailure::Header(_)));
    }

    #[test]
    fn test_attach_unpublished_size() {
        let object = RawObject::new("unpublished", &header_bytes(valid_header(0), 4096));
        assert!(matches!(attach_failure(&object.0), AttachFailure::BadSize(0)));
    }

    #[test]
    fn test_attach_oversized() {
        let header = valid_header(MAX_REGION_SIZE + 1);
        let object = RawObject::new("oversized", &header_bytes(header, 4096));
        assert!(matches!(attach_failure(&object.0), AttachFailure::BadSize(_)));
    }

    #[test]
    fn test_attach_too_many_cpus() {
        let mut header = valid_header(4096);
        header.ncpu = (cpu::online_cpus() + 1) as u32;
        let object = RawObject::new("cpus", &header_bytes(header, 4096));
        assert!(matches!(
            attach_failure(&object.0),
            AttachFailure::CpuMismatch { .. }
        ));
    }

    #[test]
    fn test_attach_layout_mismatch() {
        let mut header = valid_header(4096);
        header.first_offset = 3;
        let object = RawObject::new("layout", &header_bytes(header, 4096));
        assert!(matches!(
            attach_failure(&object.0),
            AttachFailure::LayoutMismatch(3)
        ));
    }

    #[test]
    fn test_attach_truncated() {
        let object = RawObject::new("truncated", &header_bytes(valid_header(16384), 4096));
        assert!(matches!(
            attach_failure(&object.0),
            AttachFailure::Truncated { declared: 16384, actual: 4096 }
        ));
    }

    #[test]
    fn test_attach_counter_count_out_of_range() {
        let mut header = valid_header(4096);
        header.n_counters = 10_000;
        let object = RawObject::new("count", &header_bytes(header, 4096));
        assert!(matches!(
            attach_failure(&object.0),
            AttachFailure::Corrupt { .. }
        ));
    }

    #[test]
    fn test_attach_descriptor_out_of_range() {
        let mut header = valid_header(4096);
        header.n_counters = 1;
        let mut bytes = header_bytes(header, 4096);
        let slot = Slot::locate(0, HEADER_CELLS, 1);
        let descriptor = CounterDescriptor::new(1_000_000, 0, "Bad", "Cell", "");
        let offset = slot.descriptor_cell * layout::CELL_SIZE;
        bytes[offset..offset + size_of::<CounterDescriptor>()]
            .copy_from_slice(bytemuck::bytes_of(&descriptor));

        let object = RawObject::new("descriptor", &bytes);
        assert!(matches!(
            attach_failure(&object.0),
            AttachFailure::Corrupt { index: 0 }
        ));
    }

    #[test]
    fn test_validate_header() {
        assert!(validate_header(&valid_header(4096), 1).is_ok());

        let mut header = valid_header(4096);
        header.ncpu = 0;
        assert!(matches!(
            validate_header(&header, 4),
            Err(AttachFailure::CpuMismatch { declared: 0, .. })
        ));

        header.ncpu = 8;
        assert!(matches!(
            validate_header(&header, 4),
            Err(AttachFailure::CpuMismatch { declared: 8, available: 4 })
        ));
        assert!(validate_header(&header, 8).is_ok());
    }

    #[test]
    fn test_dropping_arena_unlinks() {
        let (arena, name) = shared_arena("unlink");
        let counter = arena.register("A", "B", "").unwrap();
        drop(arena);
        // The counter still holds the region.
        assert!(Arena::attach_named(&name).is_ok());
        drop(counter);
        assert!(Arena::attach_named(&name).is_err());
    }

    #[test]
    fn test_local_is_singleton() {
        let first = Arena::local();
        let second = Arena::local();
        assert!(std::ptr::eq(first, second));
        assert!(first.is_writable());
    }
}
