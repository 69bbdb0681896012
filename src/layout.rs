//! Binary layout shared by the writer and any reader of a counter region.
//!
//! Everything in a region is addressed in 64-byte cells. A region starts with
//! a two-cell [`ShmHeader`], followed by a sequence of groups. Each group holds
//! [`COUNTERS_PER_GROUP`] descriptors (two cells each) and then one
//! [`DataCell`] per CPU shard:
//!
//! ```text
//!  cell 0        cell 2                 cell 18              cell 18 + ncpu
//!  ┌────────────┬──────────────────────┬────────────────────┬──────────────
//!  │ ShmHeader  │ CounterDescriptor x8 │ DataCell x ncpu    │ next group ...
//!  │ (2 cells)  │ (16 cells)           │ (slot p = counter p)│
//!  └────────────┴──────────────────────┴────────────────────┴──────────────
//! ```
//!
//! Counter `p` of a group reads `data[cpu].slots[p]`, so shards written from
//! different CPUs always land on different cache lines.
//!
//! This layout is a wire format: field order, sizes and the magic number must
//! not change without changing [`MAGIC`].

use std::sync::atomic::AtomicI64;

use bytemuck::{Pod, Zeroable};

/// Size of a cell, the addressing unit of a region. One cache line.
pub const CELL_SIZE: usize = 64;

/// Number of 8-byte slots in a [`DataCell`].
pub const SLOTS_PER_CELL: usize = CELL_SIZE / std::mem::size_of::<i64>();

/// Counters described by one group. Equal to [`SLOTS_PER_CELL`]: every counter
/// of a group owns one slot of each of the group's data cells.
pub const COUNTERS_PER_GROUP: usize = SLOTS_PER_CELL;

/// Cells occupied by the region header.
pub const HEADER_CELLS: usize = std::mem::size_of::<ShmHeader>() / CELL_SIZE;

/// Cells occupied by one counter descriptor.
pub const DESCRIPTOR_CELLS: usize = std::mem::size_of::<CounterDescriptor>() / CELL_SIZE;

/// Magic number identifying a counter region.
pub const MAGIC: u32 = 0x7116_7125;

/// Largest region a reader will agree to map.
pub const MAX_REGION_SIZE: usize = 4 * 1024 * 1024;

/// Capacity, in bytes including the terminator, of a descriptor's category.
pub const CATEGORY_LEN: usize = 20;
/// Capacity, in bytes including the terminator, of a descriptor's name.
pub const NAME_LEN: usize = 32;
/// Capacity, in bytes including the terminator, of a descriptor's description.
pub const DESCRIPTION_LEN: usize = 68;

/// Region header, stored in the first two cells.
///
/// `size` is written last by the writer, after a full fence. A reader must not
/// trust a header whose `size` is still zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ShmHeader {
    pub magic: u32,
    /// Total region size in bytes.
    pub size: u32,
    /// Number of CPU shards the region was laid out for.
    pub ncpu: u32,
    /// Cell offset of the first group.
    pub first_offset: u32,
    /// Number of published counters.
    pub n_counters: u32,
    pub padding: [u8; 108],
}

/// Describes one counter. Eight of these open every group.
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CounterDescriptor {
    /// First data cell of the group this counter belongs to.
    pub cell: u32,
    /// Slot of the counter within each data cell.
    pub position: u32,
    pub category: [u8; CATEGORY_LEN],
    pub name: [u8; NAME_LEN],
    pub description: [u8; DESCRIPTION_LEN],
}

/// One cache line worth of counter shards.
#[repr(C, align(64))]
pub struct DataCell {
    pub slots: [AtomicI64; SLOTS_PER_CELL],
}

const _: () = assert!(std::mem::size_of::<ShmHeader>() == 2 * CELL_SIZE);
const _: () = assert!(std::mem::size_of::<CounterDescriptor>() == 2 * CELL_SIZE);
const _: () = assert!(std::mem::size_of::<DataCell>() == CELL_SIZE);
const _: () = assert!(std::mem::align_of::<DataCell>() == CELL_SIZE);

impl ShmHeader {
    /// Header for a fresh region. `size` stays zero until the region is
    /// published.
    pub fn new(ncpu: usize) -> Self {
        Self {
            magic: MAGIC,
            size: 0,
            ncpu: ncpu as u32,
            first_offset: HEADER_CELLS as u32,
            n_counters: 0,
            padding: [0; 108],
        }
    }
}

impl CounterDescriptor {
    pub fn new(cell: usize, position: usize, category: &str, name: &str, description: &str) -> Self {
        let mut descriptor = Self::zeroed();
        descriptor.cell = cell as u32;
        descriptor.position = position as u32;
        write_fixed(&mut descriptor.category, category);
        write_fixed(&mut descriptor.name, name);
        write_fixed(&mut descriptor.description, description);
        descriptor
    }

    pub fn category(&self) -> String {
        read_fixed(&self.category)
    }

    pub fn name(&self) -> String {
        read_fixed(&self.name)
    }

    pub fn description(&self) -> String {
        read_fixed(&self.description)
    }
}

impl std::fmt::Debug for CounterDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterDescriptor")
            .field("cell", &self.cell)
            .field("position", &self.position)
            .field("category", &self.category())
            .field("name", &self.name())
            .field("description", &self.description())
            .finish()
    }
}

/// Cells taken by one group for a region laid out for `ncpu` shards.
#[inline]
pub const fn cells_per_group(ncpu: usize) -> usize {
    COUNTERS_PER_GROUP * DESCRIPTOR_CELLS + ncpu
}

/// Where the `index`-th registered counter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Cell of the counter's descriptor.
    pub descriptor_cell: usize,
    /// First data cell of the counter's group.
    pub data_cell: usize,
    /// Slot within each data cell.
    pub position: usize,
}

impl Slot {
    /// Locates counter `index` in a region whose groups start at
    /// `first_offset` and were laid out for `ncpu` shards.
    pub const fn locate(index: usize, first_offset: usize, ncpu: usize) -> Self {
        let group = index / COUNTERS_PER_GROUP;
        let position = index % COUNTERS_PER_GROUP;
        let group_start = first_offset + group * cells_per_group(ncpu);
        Self {
            descriptor_cell: group_start + position * DESCRIPTOR_CELLS,
            data_cell: group_start + COUNTERS_PER_GROUP * DESCRIPTOR_CELLS,
            position,
        }
    }

    /// One past the last cell this counter touches.
    pub const fn end_cell(&self, ncpu: usize) -> usize {
        self.data_cell + ncpu
    }
}

/// Number of counters a region of `cells` cells can hold.
pub const fn capacity(cells: usize, ncpu: usize) -> usize {
    if cells <= HEADER_CELLS {
        return 0;
    }
    (cells - HEADER_CELLS) / cells_per_group(ncpu) * COUNTERS_PER_GROUP
}

/// Copies `src` into `dst` as a NUL-terminated string, cutting on a char
/// boundary when it does not fit.
fn write_fixed<const N: usize>(dst: &mut [u8; N], src: &str) {
    let mut end = src.len().min(N - 1);
    while !src.is_char_boundary(end) {
        end -= 1;
    }
    dst[..end].copy_from_slice(&src.as_bytes()[..end]);
    dst[end..].fill(0);
}

fn read_fixed(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}
