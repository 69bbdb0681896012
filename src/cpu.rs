//! Best-effort identification of the CPU the calling thread runs on.
//!
//! Counters pick their write shard with [`current_cpu`], so this sits on the
//! hot path of every increment. The mechanism is chosen once, on first use,
//! from the fastest one available:
//!
//! 1. `rdtscp`, when the crate is compiled for a target with that feature. The
//!    kernel stores the processor number in `TSC_AUX`.
//! 2. The vDSO `getcpu` entry point, found with `dlopen(RTLD_NOLOAD)` + `dlsym`.
//! 3. `sched_getcpu(3)`.
//! 4. Nothing: every thread reports CPU 0.
//!
//! The answer can be stale by the time the caller uses it, since the thread
//! may migrate right after the lookup. Counters tolerate that.

use std::num::NonZeroUsize;
use std::sync::OnceLock;

use tracing::debug;

/// The mechanism backing [`current_cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStrategy {
    /// `rdtscp` instruction.
    Rdtscp,
    /// vDSO `getcpu`.
    Vdso,
    /// `sched_getcpu(3)`.
    Syscall,
    /// Always CPU 0.
    Fixed,
}

impl CpuStrategy {
    /// Whether threads on different CPUs get different answers.
    ///
    /// When this is `false` every writer shares shard 0 and increments have to
    /// be atomic read-modify-writes.
    pub fn is_sharded(self) -> bool {
        self != CpuStrategy::Fixed
    }
}

#[cfg(target_os = "linux")]
type GetCpuFn = unsafe extern "C" fn(*mut libc::c_uint, *mut libc::c_uint, *mut libc::c_void) -> libc::c_int;

enum Resolver {
    Rdtscp,
    #[cfg(target_os = "linux")]
    Vdso(GetCpuFn),
    Syscall,
    Fixed,
}

static RESOLVER: OnceLock<Resolver> = OnceLock::new();
static ONLINE_CPUS: OnceLock<usize> = OnceLock::new();

impl Resolver {
    fn select() -> Self {
        let resolver = Self::probe();
        debug!(strategy = ?resolver.strategy(), "selected cpu id strategy");
        resolver
    }

    fn probe() -> Self {
        if rdtscp_available() {
            return Resolver::Rdtscp;
        }
        #[cfg(target_os = "linux")]
        {
            if let Some(getcpu) = vdso::lookup() {
                return Resolver::Vdso(getcpu);
            }
            if nix::sched::sched_getcpu().is_ok() {
                return Resolver::Syscall;
            }
        }
        Resolver::Fixed
    }

    fn strategy(&self) -> CpuStrategy {
        match self {
            Resolver::Rdtscp => CpuStrategy::Rdtscp,
            #[cfg(target_os = "linux")]
            Resolver::Vdso(_) => CpuStrategy::Vdso,
            Resolver::Syscall => CpuStrategy::Syscall,
            Resolver::Fixed => CpuStrategy::Fixed,
        }
    }

    #[inline]
    fn current(&self) -> usize {
        match self {
            Resolver::Rdtscp => rdtscp_cpu(),
            #[cfg(target_os = "linux")]
            Resolver::Vdso(getcpu) => vdso::call(*getcpu),
            Resolver::Syscall => syscall_cpu(),
            Resolver::Fixed => 0,
        }
    }
}

#[inline]
fn resolver() -> &'static Resolver {
    RESOLVER.get_or_init(Resolver::select)
}

/// Returns the id of the CPU the caller is probably running on.
///
/// Never blocks and never fails; the worst case is `0`. The value is not
/// bounded by [`online_cpus`], callers reduce it modulo their shard count.
#[inline]
pub fn current_cpu() -> usize {
    resolver().current()
}

/// Returns the strategy [`current_cpu`] uses, selecting it if needed.
pub fn strategy() -> CpuStrategy {
    resolver().strategy()
}

/// Number of online logical CPUs.
///
/// This is the system count, not the process affinity mask, so that CPU ids
/// reported by [`current_cpu`] map to distinct shards.
pub fn online_cpus() -> usize {
    *ONLINE_CPUS.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if online > 0 {
            online as usize
        } else {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        }
    })
}

const fn rdtscp_available() -> bool {
    cfg!(all(
        target_os = "linux",
        target_arch = "x86_64",
        target_feature = "rdtscp"
    ))
}

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_feature = "rdtscp"))]
#[inline]
fn rdtscp_cpu() -> usize {
    let mut aux = 0u32;
    // SAFETY: the target feature guarantees the instruction is available.
    unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
    (aux & 0xfff) as usize
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64", target_feature = "rdtscp")))]
#[inline]
fn rdtscp_cpu() -> usize {
    0
}

#[cfg(target_os = "linux")]
#[inline]
fn syscall_cpu() -> usize {
    nix::sched::sched_getcpu().unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
#[inline]
fn syscall_cpu() -> usize {
    0
}

#[cfg(target_os = "linux")]
mod vdso {
    use std::ffi::CStr;
    use std::ptr;

    use super::GetCpuFn;

    const LIBRARIES: &[&CStr] = &[c"linux-vdso.so.1", c"linux-vdso64.so.1", c"linux-gate.so.1"];
    const SYMBOLS: &[&CStr] = &[c"__vdso_getcpu", c"__kernel_getcpu"];

    pub(super) fn lookup() -> Option<GetCpuFn> {
        for library in LIBRARIES {
            // SAFETY: RTLD_NOLOAD only hands out objects that are already mapped.
            let handle = unsafe {
                libc::dlopen(
                    library.as_ptr(),
                    libc::RTLD_LAZY | libc::RTLD_LOCAL | libc::RTLD_NOLOAD,
                )
            };
            if handle.is_null() {
                continue;
            }
            for symbol in SYMBOLS {
                // SAFETY: `handle` is a live handle returned by dlopen above.
                let address = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
                if address.is_null() {
                    continue;
                }
                // SAFETY: the vDSO getcpu entry points have the getcpu(2) signature.
                let getcpu: GetCpuFn = unsafe { std::mem::transmute(address) };
                let mut cpu: libc::c_uint = 0;
                // SAFETY: both optional out-pointers may be null.
                if unsafe { getcpu(&mut cpu, ptr::null_mut(), ptr::null_mut()) } == 0 {
                    // The vDSO stays mapped for the life of the process, so the
                    // handle is kept open.
                    return Some(getcpu);
                }
            }
            // SAFETY: nothing obtained from `handle` outlives this call.
            unsafe { libc::dlclose(handle) };
        }
        None
    }

    #[inline]
    pub(super) fn call(getcpu: GetCpuFn) -> usize {
        let mut cpu: libc::c_uint = 0;
        // SAFETY: `getcpu` was validated in `lookup`; null out-pointers are allowed.
        if unsafe { getcpu(&mut cpu, ptr::null_mut(), ptr::null_mut()) } == 0 {
            cpu as usize
        } else {
            0
        }
    }
}
