//! Backing memory of an arena.
//!
//! A [`Region`] is either a shared mapping (read-write for the writer,
//! read-only for readers) or a private heap block used when shared memory is
//! unavailable. Every conversion from a cell index to a typed view goes through
//! the accessors here, which check bounds against the region length.

use std::alloc::{self, Layout};
use std::fs::File;
use std::io;
use std::ptr::{self, addr_of_mut, NonNull};

use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman;
use nix::sys::stat::Mode;
use tracing::debug;

use crate::config::page_size;
use crate::layout::{CounterDescriptor, DataCell, ShmHeader, CELL_SIZE, DESCRIPTOR_CELLS, HEADER_CELLS};

enum Backing {
    /// Writer mapping. `unlink` names the object to remove on drop.
    Writable { _map: MmapMut, unlink: Option<String> },
    /// Reader mapping.
    ReadOnly { _map: Mmap },
    /// Private fallback, invisible to other processes.
    Private { layout: Layout },
}

pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the region is plain memory. Shards are accessed through atomics and
// descriptor/header writes are serialized by the owning arena's registration
// lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Creates, sizes and maps a new shared memory object.
    ///
    /// The object is created exclusively; on any failure after creation it is
    /// unlinked again. With `unlink_on_drop` the object is also unlinked when
    /// the region drops.
    pub(crate) fn create_shared(name: &str, len: usize, unlink_on_drop: bool) -> io::Result<Self> {
        let fd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP,
        )?;
        let file = File::from(fd);

        let mapped = file.set_len(len as u64).and_then(|()| {
            // SAFETY: the object was created exclusively by us and is exactly
            // `len` bytes long.
            unsafe { MmapOptions::new().len(len).map_mut(&file) }
        });
        let mut map = match mapped {
            Ok(map) => map,
            Err(err) => {
                let _ = mman::shm_unlink(name);
                return Err(err);
            }
        };

        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| io::Error::other("null mapping"))?;
        Ok(Self {
            base,
            len,
            backing: Backing::Writable {
                _map: map,
                unlink: unlink_on_drop.then(|| name.to_owned()),
            },
        })
    }

    /// Maps the first `len` bytes of `file` read-only.
    pub(crate) fn map_readonly(file: &File, len: usize) -> io::Result<Self> {
        // SAFETY: the caller checked that the object holds at least `len`
        // bytes. The writer may keep changing the contents, which readers
        // tolerate.
        let map = unsafe { MmapOptions::new().len(len).map(file) }?;
        let base = NonNull::new(map.as_ptr() as *mut u8).ok_or_else(|| io::Error::other("null mapping"))?;
        Ok(Self {
            base,
            len,
            backing: Backing::ReadOnly { _map: map },
        })
    }

    /// Allocates a zeroed, page aligned block of `len` bytes.
    pub(crate) fn private(len: usize) -> Self {
        let align = page_size().next_power_of_two().max(CELL_SIZE);
        let layout = Layout::from_size_align(len.max(CELL_SIZE), align)
            .expect("region length is capped far below isize::MAX");
        // SAFETY: the layout has a non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            alloc::handle_alloc_error(layout);
        };
        Self {
            base,
            len,
            backing: Backing::Private { layout },
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn cells(&self) -> usize {
        self.len / CELL_SIZE
    }

    pub(crate) fn is_shared(&self) -> bool {
        !matches!(self.backing, Backing::Private { .. })
    }

    pub(crate) fn is_writable(&self) -> bool {
        !matches!(self.backing, Backing::ReadOnly { .. })
    }

    /// Whether cells `cell .. cell + count` lie inside the region.
    pub(crate) fn contains(&self, cell: usize, count: usize) -> bool {
        cell.checked_add(count).is_some_and(|end| end <= self.cells())
    }

    fn cell_ptr(&self, cell: usize) -> *mut u8 {
        debug_assert!(cell < self.cells());
        // SAFETY: callers check `cell` against the region length.
        unsafe { self.base.as_ptr().add(cell * CELL_SIZE) }
    }

    /// Copies the header out of the region.
    pub(crate) fn header(&self) -> ShmHeader {
        assert!(self.contains(0, HEADER_CELLS));
        // SAFETY: in bounds, and the region is page aligned.
        unsafe { ptr::read_volatile(self.cell_ptr(0) as *const ShmHeader) }
    }

    /// Writes the whole header, `size` included.
    pub(crate) fn write_header(&self, header: &ShmHeader) {
        assert!(self.is_writable() && self.contains(0, HEADER_CELLS));
        // SAFETY: in bounds and writable.
        unsafe { ptr::write_volatile(self.cell_ptr(0) as *mut ShmHeader, *header) }
    }

    /// Stores the header's `size` field alone.
    pub(crate) fn write_size(&self, size: u32) {
        let header = self.header_ptr();
        // SAFETY: `header_ptr` checked bounds and writability.
        unsafe { ptr::write_volatile(addr_of_mut!((*header).size), size) }
    }

    /// Stores the header's `n_counters` field alone.
    pub(crate) fn write_counter_count(&self, n_counters: u32) {
        let header = self.header_ptr();
        // SAFETY: `header_ptr` checked bounds and writability.
        unsafe { ptr::write_volatile(addr_of_mut!((*header).n_counters), n_counters) }
    }

    fn header_ptr(&self) -> *mut ShmHeader {
        assert!(self.is_writable() && self.contains(0, HEADER_CELLS));
        self.cell_ptr(0) as *mut ShmHeader
    }

    /// Copies the descriptor stored at `cell`, if it lies inside the region.
    pub(crate) fn descriptor(&self, cell: usize) -> Option<CounterDescriptor> {
        if !self.contains(cell, DESCRIPTOR_CELLS) {
            return None;
        }
        // SAFETY: in bounds; cells are 64-byte aligned.
        Some(unsafe { ptr::read_volatile(self.cell_ptr(cell) as *const CounterDescriptor) })
    }

    /// Stores a descriptor at `cell`.
    ///
    /// # Panics
    ///
    /// If the region is read-only or the descriptor does not fit.
    pub(crate) fn write_descriptor(&self, cell: usize, descriptor: &CounterDescriptor) {
        assert!(self.is_writable(), "descriptor write on a read-only region");
        assert!(
            self.contains(cell, DESCRIPTOR_CELLS),
            "descriptor cell {cell} outside a region of {} cells",
            self.cells()
        );
        // SAFETY: checked above.
        unsafe { ptr::write_volatile(self.cell_ptr(cell) as *mut CounterDescriptor, *descriptor) }
    }

    /// Pointer to `count` consecutive data cells starting at `cell`.
    pub(crate) fn data_cells(&self, cell: usize, count: usize) -> Option<NonNull<DataCell>> {
        if count == 0 || !self.contains(cell, count) {
            return None;
        }
        NonNull::new(self.cell_ptr(cell) as *mut DataCell)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Private { layout } => {
                // SAFETY: allocated in `private` with this exact layout.
                unsafe { alloc::dealloc(self.base.as_ptr(), *layout) }
            }
            Backing::Writable {
                unlink: Some(name), ..
            } => {
                if let Err(err) = mman::shm_unlink(name.as_str()) {
                    debug!(%name, %err, "failed to unlink counter region");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Slot, MAGIC};
    use std::sync::atomic::Ordering;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::AtomicUsize;
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/EggCountersRegionTest-{}-{tag}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_private_region_is_zeroed() {
        let region = Region::private(4096);
        assert_eq!(region.len(), 4096);
        assert_eq!(region.cells(), 64);
        assert!(!region.is_shared());
        assert!(region.is_writable());
        assert_eq!(region.header().magic, 0);
        let cells = region.data_cells(10, 4).unwrap();
        let slot = unsafe { &(*cells.as_ptr().add(3)).slots[7] };
        assert_eq!(slot.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_header_fields() {
        let region = Region::private(4096);
        region.write_header(&ShmHeader::new(4));
        region.write_size(4096);
        region.write_counter_count(3);
        let header = region.header();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.size, 4096);
        assert_eq!(header.ncpu, 4);
        assert_eq!(header.n_counters, 3);
    }

    #[test]
    fn test_descriptor_bounds() {
        let region = Region::private(4096);
        let slot = Slot::locate(0, HEADER_CELLS, 1);
        let descriptor = CounterDescriptor::new(slot.data_cell, 0, "Cat", "Name", "Desc");
        region.write_descriptor(slot.descriptor_cell, &descriptor);
        assert_eq!(region.descriptor(slot.descriptor_cell), Some(descriptor));
        assert!(region.descriptor(63).is_none());
        assert!(region.descriptor(usize::MAX).is_none());
    }

    #[test]
    #[should_panic(expected = "outside a region")]
    fn test_descriptor_write_out_of_bounds() {
        let region = Region::private(4096);
        region.write_descriptor(63, &CounterDescriptor::new(0, 0, "", "", ""));
    }

    #[test]
    fn test_data_cells_bounds() {
        let region = Region::private(4096);
        assert!(region.data_cells(60, 4).is_some());
        assert!(region.data_cells(61, 4).is_none());
        assert!(region.data_cells(0, 0).is_none());
        assert!(region.data_cells(usize::MAX, 2).is_none());
    }

    #[test]
    fn test_shared_region_unlinks_on_drop() {
        let name = unique_name("drop");
        let region = Region::create_shared(&name, 4096, true).unwrap();
        assert!(region.is_shared());
        assert!(region.is_writable());

        let fd = mman::shm_open(name.as_str(), OFlag::O_RDONLY, Mode::empty()).unwrap();
        let reader = Region::map_readonly(&File::from(fd), 4096).unwrap();
        assert!(!reader.is_writable());

        region.write_header(&ShmHeader::new(2));
        assert_eq!(reader.header().ncpu, 2);

        drop(region);
        assert!(mman::shm_open(name.as_str(), OFlag::O_RDONLY, Mode::empty()).is_err());
        // The reader mapping outlives the name.
        assert_eq!(reader.header().magic, MAGIC);
    }

    #[test]
    fn test_shared_region_is_exclusive() {
        let name = unique_name("excl");
        let _region = Region::create_shared(&name, 4096, true).unwrap();
        assert!(Region::create_shared(&name, 4096, true).is_err());
    }
}
