//! WinAPI wrapper
//!
//! Thin safe wrappers over the Win32 calls the patcher needs. Raw calls and
//! raw OS types stay inside this module.

use std::ptr::NonNull;

use libc::c_void;
use thiserror::Error;
use windows::Win32::Foundation::{GetLastError, HANDLE, HMODULE};
use windows::Win32::System::Diagnostics::Debug::IsDebuggerPresent;
use windows::Win32::System::LibraryLoader::GetModuleHandleA;
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_FREE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_PROTECTION_FLAGS,
    VIRTUAL_ALLOCATION_TYPE, VIRTUAL_FREE_TYPE, VirtualAlloc, VirtualFree, VirtualProtect,
    VirtualQuery,
};
use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows::Win32::System::Threading::GetCurrentProcess;

#[derive(Debug, Error)]
pub enum WinapiError {
    #[error("Windows core API error: {0}")]
    WindowsCore(#[from] windows::core::Error),

    #[error("Input PTR is NULL")]
    InputNullPtr,

    #[error("Size can't be zero")]
    ZeroSize,

    #[error("VirtualQuery failed with error code: {0}")]
    VirtualQuery(u32),
}

pub type WinapiResult<T> = std::result::Result<T, WinapiError>;

/// Wrapped WinAPI type MEMORY_BASIC_INFORMATION
pub struct MemoryBasicInformation {
    pub base_address: usize,
    pub region_size: usize,
    pub state: u32,
    pub protect: u32,
}

impl MemoryBasicInformation {
    pub fn is_free(&self) -> bool {
        self.state == MEM_FREE.0
    }
}

/// WinAPI: VirtualQuery(...)
///
/// Address 0 is a valid query target here. The region walk starts at the
/// bottom of the address space when the anchor sits below the 2 GiB pull
/// range, and `VirtualQuery` answers for that region like any other.
pub fn virtual_query(addr: usize) -> WinapiResult<MemoryBasicInformation> {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let info_size = std::mem::size_of::<MEMORY_BASIC_INFORMATION>();

    let result = unsafe { VirtualQuery(Some(addr as *const c_void), &mut info, info_size) };

    if result == 0 {
        let last_error = unsafe { GetLastError().0 };
        return Err(WinapiError::VirtualQuery(last_error));
    }

    Ok(MemoryBasicInformation {
        base_address: info.BaseAddress as usize,
        region_size: info.RegionSize,
        state: info.State.0,
        protect: info.Protect.0,
    })
}

/// Memory allocation types for VirtualAlloc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    Commit,
    Reserve,
    CommitReserve,
}

impl From<AllocationType> for VIRTUAL_ALLOCATION_TYPE {
    fn from(value: AllocationType) -> Self {
        match value {
            AllocationType::Commit => MEM_COMMIT,
            AllocationType::Reserve => MEM_RESERVE,
            AllocationType::CommitReserve => MEM_COMMIT | MEM_RESERVE,
        }
    }
}

/// Memory free types for VirtualFree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeType {
    Release,
}

impl From<FreeType> for VIRTUAL_FREE_TYPE {
    fn from(value: FreeType) -> Self {
        match value {
            FreeType::Release => windows::Win32::System::Memory::MEM_RELEASE,
        }
    }
}

/// WinAPI: VirtualAlloc(...)
///
/// # Safety
/// Same rules as `VirtualAlloc`. Zero sizes and NULL results are turned
/// into errors here.
pub unsafe fn virtual_alloc(
    address: Option<*const c_void>,
    size: usize,
    allocation_type: AllocationType,
    protection: PAGE_PROTECTION_FLAGS,
) -> WinapiResult<*mut c_void> {
    if size == 0 {
        return Err(WinapiError::ZeroSize);
    }

    let result = unsafe { VirtualAlloc(address, size, allocation_type.into(), protection) };

    if result.is_null() {
        return Err(WinapiError::WindowsCore(windows::core::Error::from_win32()));
    }

    Ok(result)
}

/// WinAPI: VirtualFree(...)
///
/// # Safety
/// Same rules as `VirtualFree`; NULL addresses are rejected with an error.
pub unsafe fn virtual_free(address: *mut c_void, free_type: FreeType) -> WinapiResult<()> {
    if address.is_null() {
        return Err(WinapiError::InputNullPtr);
    }

    // Per WinAPI docs, 'dwSize' must be 0 if 'dwFreeType' is MEM_RELEASE.
    let size = match free_type {
        FreeType::Release => 0,
    };

    unsafe { VirtualFree(address, size, free_type.into()) }?;

    Ok(())
}

/// WinAPI: VirtualProtect(...)
///
/// Returns the protection flags the range carried before the change.
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub fn virtual_protect(
    ptr: *mut c_void,
    protection: PAGE_PROTECTION_FLAGS,
    size: usize,
) -> WinapiResult<PAGE_PROTECTION_FLAGS> {
    if ptr.is_null() {
        return Err(WinapiError::InputNullPtr);
    }

    if size == 0 {
        return Err(WinapiError::ZeroSize);
    }

    let mut old_protect = PAGE_PROTECTION_FLAGS(0);

    unsafe { VirtualProtect(ptr, size, protection, &mut old_protect)? }

    Ok(old_protect)
}

/// Runs `func` with the protection of `ptr .. ptr + size` switched to
/// `protection`, restoring the prior protection afterwards.
///
/// Every write into foreign code pages in this crate goes through here, so
/// the protect/restore pairing lives in exactly one place. A failed restore
/// is logged and swallowed: the write already happened and the page being
/// left more permissive is the lesser problem.
///
/// # Safety
/// Same rules as `VirtualProtect`; `func` must keep its accesses inside the
/// unprotected range.
pub unsafe fn with_virtual_protect<T>(
    ptr: *mut c_void,
    protection: PAGE_PROTECTION_FLAGS,
    size: usize,
    func: impl FnOnce() -> T,
) -> WinapiResult<T> {
    let old_protect = virtual_protect(ptr, protection, size)?;

    let result = func();

    if let Err(err) = virtual_protect(ptr, old_protect, size) {
        log::warn!("failed to restore protection at {ptr:p}: {err}");
    }

    Ok(result)
}

/// WinAPI: GetSystemInfo(...), allocation granularity only.
///
/// The granularity is the quantum `VirtualAlloc` aligns reservations to,
/// 64 KiB on every shipping Windows so far.
pub fn allocation_granularity() -> usize {
    let mut system_info: SYSTEM_INFO = unsafe { std::mem::zeroed() };

    unsafe { GetSystemInfo(&mut system_info) };

    system_info.dwAllocationGranularity as usize
}

/// WinAPI: IsDebuggerPresent()
pub fn is_debugger_present() -> bool {
    unsafe { IsDebuggerPresent() }.as_bool()
}

/// Wrapper for WinAPI HANDLE values that are known non-null.
#[derive(Debug)]
pub struct Handle {
    ptr: NonNull<c_void>,
}

impl Handle {
    /// # Safety
    /// - If `ptr` is NULL, error will be returned
    pub unsafe fn new(ptr: *mut c_void) -> WinapiResult<Self> {
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr }),
            None => Err(WinapiError::InputNullPtr),
        }
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }
}

impl From<Handle> for HANDLE {
    fn from(value: Handle) -> Self {
        HANDLE(value.as_ptr())
    }
}

impl TryFrom<HANDLE> for Handle {
    type Error = WinapiError;

    fn try_from(value: HANDLE) -> Result<Self, Self::Error> {
        unsafe { Handle::new(value.0) }
    }
}

/// Wrapper for WinAPI HMODULE values that are known non-null.
#[derive(Debug, Clone, Copy)]
pub struct HModule {
    ptr: NonNull<c_void>,
}

impl HModule {
    /// # Safety
    /// - If `ptr` is NULL, error will be returned
    pub unsafe fn new(ptr: *mut c_void) -> WinapiResult<Self> {
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr }),
            None => Err(WinapiError::InputNullPtr),
        }
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }
}

impl From<HModule> for HMODULE {
    fn from(value: HModule) -> Self {
        Self(value.as_ptr())
    }
}

impl TryFrom<HMODULE> for HModule {
    type Error = WinapiError;

    fn try_from(value: HMODULE) -> Result<Self, Self::Error> {
        unsafe { HModule::new(value.0) }
    }
}

/// WinAPI: GetCurrentProcess()
pub fn get_current_process() -> WinapiResult<Handle> {
    let handle = unsafe { GetCurrentProcess() };

    handle.try_into()
}

/// WinAPI: GetModuleHandleA(NULL), the image that started the process.
pub fn host_module() -> WinapiResult<HModule> {
    let hmodule = unsafe { GetModuleHandleA(None) }?;

    hmodule.try_into()
}

/// Wrapper for WinAPI MODULEINFO type
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModuleInfo {
    pub base_of_dll: *mut c_void,
    pub size_of_image: u32,
    pub entry_point: *mut c_void,
}

impl From<MODULEINFO> for ModuleInfo {
    fn from(value: MODULEINFO) -> Self {
        Self {
            base_of_dll: value.lpBaseOfDll,
            size_of_image: value.SizeOfImage,
            entry_point: value.EntryPoint,
        }
    }
}

/// WinAPI: GetModuleInformation(...)
pub fn get_module_information(module_handle: HModule) -> WinapiResult<ModuleInfo> {
    let process_handle = get_current_process()?;

    let mut module_info = MODULEINFO::default();

    unsafe {
        GetModuleInformation(
            process_handle.into(),
            module_handle.into(),
            &mut module_info,
            std::mem::size_of::<MODULEINFO>() as u32,
        )?;
    }

    Ok(module_info.into())
}
