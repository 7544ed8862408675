//! The stable patching surface and the process-wide instance.
//!
//! Plugins link against a four-entry dispatch table that has to stay shaped
//! exactly like this; internally it is one trait with one implementation.
//! The generic helpers mirror the convenience layer the table's consumers
//! already use.

use std::cell::UnsafeCell;
use std::sync::LazyLock;

use crate::trampoline::Trampoline;

/// The four-entry patch dispatch table.
///
/// Every entry takes a patch site and a destination address and returns the
/// branch target the site held before the patch, 0 for a fresh slot.
///
/// # Safety
/// Sites must own the patched bytes and all patching must stay on a single
/// thread, as described in the crate docs.
pub trait BranchPatcher {
    unsafe fn write_branch_5(&self, site: usize, dst: usize) -> usize;
    unsafe fn write_branch_6(&self, site: usize, dst: usize) -> usize;
    unsafe fn write_call_5(&self, site: usize, dst: usize) -> usize;
    unsafe fn write_call_6(&self, site: usize, dst: usize) -> usize;

    /// Length-generic jump form; `N` is 5 or 6.
    ///
    /// # Safety
    /// Same rules as the concrete entries.
    unsafe fn write_branch<const N: usize>(&self, site: usize, dst: usize) -> usize
    where
        Self: Sized,
    {
        match N {
            5 => unsafe { self.write_branch_5(site, dst) },
            6 => unsafe { self.write_branch_6(site, dst) },
            _ => panic!("branch length must be 5 or 6, got {N}"),
        }
    }

    /// Length-generic call form; `N` is 5 or 6.
    ///
    /// # Safety
    /// Same rules as the concrete entries.
    unsafe fn write_call<const N: usize>(&self, site: usize, dst: usize) -> usize
    where
        Self: Sized,
    {
        match N {
            5 => unsafe { self.write_call_5(site, dst) },
            6 => unsafe { self.write_call_6(site, dst) },
            _ => panic!("call length must be 5 or 6, got {N}"),
        }
    }
}

/// Owner of the process-wide [`Trampoline`].
///
/// Interior mutability without a lock: initialization and patching happen on
/// one thread before the rest of the process can observe the patched code,
/// so handing out exclusive access from a shared reference is sound under
/// that contract.
pub struct GlobalTrampoline {
    inner: UnsafeCell<Trampoline>,
}

// Safety: patching is confined to a single thread during startup; the cell
// is never touched concurrently. See crate docs.
unsafe impl Sync for GlobalTrampoline {}
unsafe impl Send for GlobalTrampoline {}

impl GlobalTrampoline {
    /// Exclusive access to the underlying pool.
    ///
    /// # Safety
    /// The caller must be the single patching thread and must not hold two
    /// returned references at once.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut Trampoline {
        unsafe { &mut *self.inner.get() }
    }
}

impl BranchPatcher for GlobalTrampoline {
    unsafe fn write_branch_5(&self, site: usize, dst: usize) -> usize {
        unsafe { self.get().write_branch_5(site, dst) }
    }

    unsafe fn write_branch_6(&self, site: usize, dst: usize) -> usize {
        unsafe { self.get().write_branch_6(site, dst) }
    }

    unsafe fn write_call_5(&self, site: usize, dst: usize) -> usize {
        unsafe { self.get().write_call_5(site, dst) }
    }

    unsafe fn write_call_6(&self, site: usize, dst: usize) -> usize {
        unsafe { self.get().write_call_6(site, dst) }
    }
}

static TRAMPOLINE: LazyLock<GlobalTrampoline> = LazyLock::new(|| GlobalTrampoline {
    inner: UnsafeCell::new(Trampoline::with_name("global trampoline")),
});

/// The process-wide trampoline, constructed on first use and alive until
/// process teardown.
pub fn trampoline() -> &'static GlobalTrampoline {
    &TRAMPOLINE
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::trampoline::JMP_SIZE;

    #[test]
    fn returns_the_same_instance_every_time() {
        assert!(std::ptr::eq(trampoline(), trampoline()));
    }

    // The only test that touches the global instance; everything else works
    // on locally owned trampolines.
    #[test]
    fn global_instance_patches_through_the_dispatch_table() {
        let pool = Box::leak(vec![0u8; 64].into_boxed_slice());
        let slot = Box::leak(vec![0x90u8; 16].into_boxed_slice());
        let site = slot.as_ptr() as usize;

        let global = trampoline();
        unsafe {
            global
                .get()
                .install(NonNull::new(pool.as_mut_ptr()).unwrap(), 64, None)
        };

        let patcher: &dyn BranchPatcher = global;
        let prior = unsafe { patcher.write_branch_5(site, 0x1234_5678_9ABC_DEF0) };

        assert_eq!(prior, 0);
        assert_eq!(slot[0], 0xE9);

        let generic = unsafe { global.write_branch::<5>(site, 0x1234_5678_9ABC_DEF0) };
        let displacement =
            i32::from_le_bytes(slot[1..JMP_SIZE].try_into().unwrap()) as isize as usize;
        assert_eq!(generic, (site + JMP_SIZE).wrapping_add(displacement));
    }
}
