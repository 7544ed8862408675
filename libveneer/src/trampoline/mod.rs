//! The veneer pool and the four branch-patching operations.
//!
//! One [`Trampoline`] owns a read-write-execute pool, a bump pointer into
//! it, and two indexes that map destination addresses to the veneer already
//! emitted for them. Patching a site therefore costs pool space once per
//! distinct destination, not once per site.
//!
//! All operations assume the single-threaded patching contract from the
//! crate docs. There is no locking here.

pub mod assembly;


pub use assembly::{ABS_JMP_SIZE, ADDR_SLOT_SIZE, IND_JMP_SIZE, JMP_SIZE};

use std::ptr::NonNull;

use ahash::AHashMap;
use libc::c_void;

use crate::common::format_bytes;
use crate::fatal;
use crate::region::{self, MemoryMap};

/// Deferred release of a pool block, called with base and capacity when the
/// block is replaced or the pool is dropped.
pub type Releaser = Box<dyn FnMut(NonNull<c_void>, usize)>;

/// Executable pool, veneer indexes and the patching entry points.
pub struct Trampoline {
    name: String,
    data: Option<NonNull<u8>>,
    capacity: usize,
    size: usize,
    releaser: Option<Releaser>,
    branch5: AHashMap<usize, usize>,
    branch6: AHashMap<usize, usize>,
}

impl Trampoline {
    pub fn new() -> Self {
        Self::with_name("trampoline")
    }

    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            data: None,
            capacity: 0,
            size: 0,
            releaser: None,
            branch5: AHashMap::new(),
            branch6: AHashMap::new(),
        }
    }

    /// Reserves a `size`-byte pool near `anchor` and adopts it.
    ///
    /// With no anchor the pool is placed at the end of the host image's
    /// `.text` section (end of image when the section is missing), which
    /// puts the whole code section within rel32 reach of every veneer.
    ///
    /// Halts when no region within reach can be claimed; a process that
    /// cannot place its pool cannot patch anything.
    ///
    /// # Safety
    /// Caller must be the single patching thread; see crate docs.
    #[cfg(windows)]
    pub unsafe fn create(&mut self, size: usize, anchor: Option<usize>) {
        use crate::os::windows::{pe, winapi};

        if size == 0 {
            fatal::halt("cannot create a trampoline with a zero size");
        }

        let anchor = anchor.unwrap_or_else(|| {
            let module = match winapi::host_module() {
                Ok(module) => module,
                Err(err) => fatal::halt(&format!("failed to find host module: {err}")),
            };

            match unsafe { pe::code_section_end(module) } {
                Ok(end) => end,
                Err(err) => {
                    fatal::halt(&format!("failed to locate host code section: {err}"))
                }
            }
        });

        let releaser: Releaser = Box::new(|block, _size| {
            if let Err(err) =
                unsafe { winapi::virtual_free(block.as_ptr(), winapi::FreeType::Release) }
            {
                log::error!("failed to release trampoline pool: {err}");
            }
        });

        unsafe { self.create_in(&mut region::ProcessMap, size, anchor, releaser) }
    }

    /// Core of [`Trampoline::create`], parameterized over the memory map so
    /// placement can be exercised without touching the live address space.
    ///
    /// # Safety
    /// Blocks handed out by `map.reserve` must be valid for reads, writes
    /// and execution for `size` bytes.
    pub unsafe fn create_in(
        &mut self,
        map: &mut impl MemoryMap,
        size: usize,
        anchor: usize,
        releaser: Releaser,
    ) {
        match region::find_free_region(map, anchor, size) {
            Some(block) => {
                log::info!(
                    "{}: claimed {} at {:p}, anchor 0x{anchor:X}",
                    self.name,
                    format_bytes(size),
                    block.as_ptr(),
                );

                unsafe { self.install(block.cast(), size, Some(releaser)) };
            }
            None => fatal::halt(&format!(
                "{}: no free region of {} within 2 GiB of anchor 0x{anchor:X}",
                self.name,
                format_bytes(size),
            )),
        }
    }

    /// Adopts `base .. base + size` as the pool, replacing any prior block.
    ///
    /// The block is filled with `int3` so control flow that strays into
    /// unused veneer space traps immediately. The prior block, if any, is
    /// handed back to its releaser and all recorded veneers are forgotten.
    ///
    /// # Safety
    /// `base` must be valid for reads, writes and execution for `size`
    /// bytes and stay so until the pool is replaced or dropped.
    pub unsafe fn install(&mut self, base: NonNull<u8>, size: usize, releaser: Option<Releaser>) {
        unsafe { std::ptr::write_bytes(base.as_ptr(), assembly::OP_INT3, size) };

        self.release();

        self.data = Some(base);
        self.capacity = size;
        self.size = 0;
        self.releaser = releaser;

        self.log_stats();
    }

    /// Bump-allocates `size` bytes of pool memory.
    ///
    /// Exhaustion is a configuration failure: the pool was sized too small
    /// for the number of distinct destinations, and every further patch
    /// would be dropped. Halts instead of returning.
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        let Some(data) = self.data else {
            fatal::halt(&format!("{}: allocation from an empty pool", self.name));
        };

        if size > self.free_size() {
            fatal::halt(&format!(
                "{}: pool exhausted, requested {size} bytes with {} free",
                self.name,
                self.free_size(),
            ));
        }

        let block = unsafe { NonNull::new_unchecked(data.as_ptr().add(self.size)) };
        self.size += size;

        self.log_stats();

        block
    }

    /// Bump-allocates room for one `T`.
    pub fn allocate_one<T>(&mut self) -> NonNull<T> {
        self.allocate(std::mem::size_of::<T>()).cast()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.capacity == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated_size(&self) -> usize {
        self.size
    }

    pub fn free_size(&self) -> usize {
        self.capacity - self.size
    }

    /// Routes a 5-byte `jmp rel32` at `site` through the pool to `dst`.
    ///
    /// Returns the branch target the site held before the patch, or 0 for a
    /// fresh (`nop`-led) slot.
    ///
    /// # Safety
    /// `site` must point to at least 5 bytes of patchable code, and the
    /// caller must uphold the single-threaded patching contract.
    pub unsafe fn write_branch_5(&mut self, site: usize, dst: usize) -> usize {
        let prior = unsafe { prior_target(site, JMP_SIZE) };
        unsafe { self.patch_rel32(site, dst, assembly::OP_JMP_REL32) };
        prior
    }

    /// As [`Trampoline::write_branch_5`], with `call rel32` at the site.
    ///
    /// # Safety
    /// Same rules as [`Trampoline::write_branch_5`].
    pub unsafe fn write_call_5(&mut self, site: usize, dst: usize) -> usize {
        let prior = unsafe { prior_target(site, JMP_SIZE) };
        unsafe { self.patch_rel32(site, dst, assembly::OP_CALL_REL32) };
        prior
    }

    /// Routes a 6-byte `jmp [rip+rel32]` at `site` through an 8-byte pool
    /// slot holding `dst`.
    ///
    /// Returns the branch target the site held before the patch, or 0 for a
    /// fresh (`nop`-led) slot.
    ///
    /// # Safety
    /// `site` must point to at least 6 bytes of patchable code, and the
    /// caller must uphold the single-threaded patching contract.
    pub unsafe fn write_branch_6(&mut self, site: usize, dst: usize) -> usize {
        let prior = unsafe { prior_target(site, IND_JMP_SIZE) };
        unsafe { self.patch_indirect(site, dst, assembly::MODRM_JMP_RIP) };
        prior
    }

    /// As [`Trampoline::write_branch_6`], with `call [rip+rel32]` at the site.
    ///
    /// # Safety
    /// Same rules as [`Trampoline::write_branch_6`].
    pub unsafe fn write_call_6(&mut self, site: usize, dst: usize) -> usize {
        let prior = unsafe { prior_target(site, IND_JMP_SIZE) };
        unsafe { self.patch_indirect(site, dst, assembly::MODRM_CALL_RIP) };
        prior
    }

    /// `E9`/`E8` site encoding through a 14-byte absolute-jump veneer.
    unsafe fn patch_rel32(&mut self, site: usize, dst: usize, opcode: u8) {
        let veneer = match self.branch5.get(&dst) {
            Some(&veneer) => veneer,
            None => {
                let veneer = self.allocate(ABS_JMP_SIZE).as_ptr() as usize;
                self.branch5.insert(dst, veneer);
                veneer
            }
        };

        let Some(displacement) = assembly::rel32(site + JMP_SIZE, veneer) else {
            // The pool sits within reach of the image; a site this far away
            // means the pool was anchored against the wrong module.
            fatal::halt(&format!(
                "{}: veneer at 0x{veneer:X} out of rel32 range of site 0x{site:X}",
                self.name,
            ));
        };

        unsafe {
            write_code(site, &assembly::encode_rel_branch(opcode, displacement));

            // The veneer body lands after the site bytes, also on reuse.
            // Benign while patching stays on one thread; nothing can enter
            // the veneer before the site branch exists.
            let body = assembly::encode_absolute_jump(dst);
            std::ptr::copy_nonoverlapping(body.as_ptr(), veneer as *mut u8, body.len());
        }
    }

    /// `FF 25`/`FF 15` site encoding against an 8-byte address slot.
    unsafe fn patch_indirect(&mut self, site: usize, dst: usize, modrm: u8) {
        let slot = match self.branch6.get(&dst) {
            Some(&slot) => slot,
            None => {
                let slot = self.allocate_one::<u64>().as_ptr() as usize;
                self.branch6.insert(dst, slot);
                slot
            }
        };

        let Some(displacement) = assembly::rel32(site + IND_JMP_SIZE, slot) else {
            fatal::halt(&format!(
                "{}: address slot at 0x{slot:X} out of rel32 range of site 0x{site:X}",
                self.name,
            ));
        };

        unsafe {
            write_code(site, &assembly::encode_indirect_branch(modrm, displacement));

            // Slot may be unaligned; the bump pointer only guarantees
            // contiguity.
            std::ptr::write_unaligned(slot as *mut u64, dst as u64);
        }
    }

    /// Returns the current block to its releaser and forgets every veneer.
    fn release(&mut self) {
        if let (Some(block), Some(mut releaser)) = (self.data, self.releaser.take()) {
            releaser(block.cast(), self.capacity);
        }

        self.branch5.clear();
        self.branch6.clear();
        self.data = None;
        self.capacity = 0;
        self.size = 0;
    }

    fn log_stats(&self) {
        let pct = if self.capacity == 0 {
            0.0
        } else {
            (self.size as f64 / self.capacity as f64) * 100.0
        };

        log::debug!(
            "{} => {} / {} ({pct:05.2}%)",
            self.name,
            format_bytes(self.size),
            format_bytes(self.capacity),
        );
    }
}

impl Default for Trampoline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        self.release();
    }
}

/// Branch target encoded at `site` before a patch.
///
/// A `nop` first byte marks a slot that never held a branch. Anything else
/// is taken to end in a rel32 displacement based at the next instruction,
/// which covers both slot widths and both branch flavors.
unsafe fn prior_target(site: usize, len: usize) -> usize {
    let first = unsafe { std::ptr::read(site as *const u8) };
    if first == assembly::OP_NOP {
        return 0;
    }

    let displacement = unsafe { std::ptr::read_unaligned((site + len - 4) as *const i32) };

    (site + len).wrapping_add(displacement as isize as usize)
}

/// Writes `bytes` over code at `site`.
///
/// The single place that touches foreign code pages. On Windows the page
/// protection is lifted for the duration of the write and restored after.
/// When the protection change is refused the patch is dropped with an error
/// log; the site keeps its old bytes and the caller proceeds, per the
/// degradation contract. Non-Windows builds exist for host-side tests,
/// where patch slots are ordinary writable memory.
unsafe fn write_code(site: usize, bytes: &[u8]) {
    #[cfg(windows)]
    {
        use windows::Win32::System::Memory::PAGE_EXECUTE_READWRITE;

        use crate::os::windows::winapi::with_virtual_protect;

        let result = unsafe {
            with_virtual_protect(
                site as *mut c_void,
                PAGE_EXECUTE_READWRITE,
                bytes.len(),
                || {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), site as *mut u8, bytes.len());
                },
            )
        };

        if let Err(err) = result {
            log::error!("cannot make 0x{site:X} writable, patch dropped: {err}");
        }
    }

    #[cfg(not(windows))]
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), site as *mut u8, bytes.len());
    }
}
