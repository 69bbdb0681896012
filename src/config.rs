//! Writer configuration and region naming.
//!
//! The process-wide arena is built from [`ArenaConfig::from_env`]. Setting
//! `EGG_COUNTER_DISABLE_SHM` keeps counters in private memory, invisible to
//! other processes.

use std::ffi::OsStr;
use std::path::Path;

use crate::layout::{cells_per_group, CELL_SIZE, HEADER_CELLS, MAX_REGION_SIZE};

/// Environment variable that disables shared memory for the process arena.
pub const DISABLE_SHM_ENV: &str = "EGG_COUNTER_DISABLE_SHM";

/// Prefix of every counter region name. The writer's pid follows it.
pub const NAME_PREFIX: &str = "/EggCounters-";

/// Default region size, in pages.
pub const DEFAULT_PAGES: usize = 4;

/// Name of the shared memory object published by process `pid`.
pub fn shm_name(pid: u32) -> String {
    format!("{NAME_PREFIX}{pid}")
}

/// Extracts a pid from a command line target.
///
/// Accepts a bare pid, an object name such as `/EggCounters-1234`, or a path
/// under the shared memory mount such as `/dev/shm/EggCounters-1234`.
pub fn parse_target(target: &str) -> Option<u32> {
    let target = target.trim();
    let digits = match target.parse::<u32>() {
        Ok(pid) => return (pid != 0).then_some(pid),
        Err(_) => Path::new(target)
            .file_name()?
            .to_str()?
            .strip_prefix(&NAME_PREFIX[1..])?,
    };
    digits.parse::<u32>().ok().filter(|&pid| pid != 0)
}

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Whether a value of [`DISABLE_SHM_ENV`] turns shared memory off.
fn disables_shm(value: Option<&OsStr>) -> bool {
    match value.and_then(OsStr::to_str) {
        None => value.is_some(),
        Some(v) => !matches!(v.trim(), "" | "0" | "false" | "no"),
    }
}

/// Configuration of a writer arena.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Whether to publish counters through a shared memory object.
    pub shared: bool,
    /// Name of the shared memory object.
    pub name: String,
    /// Requested region size in pages.
    pub pages: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            shared: true,
            name: shm_name(nix::unistd::getpid().as_raw() as u32),
            pages: DEFAULT_PAGES,
        }
    }
}

impl ArenaConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration, with shared memory disabled if
    /// [`DISABLE_SHM_ENV`] says so.
    pub fn from_env() -> Self {
        let disabled = disables_shm(std::env::var_os(DISABLE_SHM_ENV).as_deref());
        Self::default().with_shared(!disabled)
    }

    /// Enables or disables shared memory.
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Sets the shared memory object name. Must start with `/`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the requested region size in pages. Values less than 1 are
    /// treated as 1.
    pub fn with_pages(mut self, pages: usize) -> Self {
        self.pages = pages.max(1);
        self
    }

    /// Region length in bytes for a writer with `ncpu` shards.
    ///
    /// At least one group always fits unless that alone would exceed
    /// [`MAX_REGION_SIZE`], which readers refuse to map.
    pub fn region_len(&self, ncpu: usize) -> usize {
        let page = page_size();
        let requested = self.pages.max(1) * page;
        let one_group = (HEADER_CELLS + cells_per_group(ncpu)) * CELL_SIZE;
        let len = requested.max(one_group.div_ceil(page) * page);
        len.min(MAX_REGION_SIZE / page * page)
    }
}
