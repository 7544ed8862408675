//! Locating the code section of the live host image.
//!
//! The pool anchor defaults to the end of the image's `.text` section, which
//! keeps every address in the code section within rel32 reach of a pool
//! placed next to the anchor.

use goblin::pe::PE;
use goblin::pe::options::ParseOptions;
use thiserror::Error;

use super::winapi::{HModule, WinapiError, get_module_information};

#[derive(Debug, Error)]
pub enum PeError {
    #[error("WinAPI error: {0}")]
    WinapiError(#[from] WinapiError),

    #[error("PE parser error: {0}")]
    GoblinError(#[from] goblin::error::Error),
}

pub type PeResult<T> = std::result::Result<T, PeError>;

/// One past the last byte of the module's `.text` section, or one past the
/// whole image when no `.text` section exists.
///
/// # Safety
/// `module` must be a module loaded in the current process; its image is
/// read in place.
pub unsafe fn code_section_end(module: HModule) -> PeResult<usize> {
    let module_info = get_module_information(module)?;

    let base = module_info.base_of_dll as usize;
    let image =
        unsafe { std::slice::from_raw_parts(base as *const u8, module_info.size_of_image as usize) };

    // Header-only parse of the mapped image. RVA resolution and TLS parsing
    // expect file layout, not the loader's in-memory layout.
    let mut pe_opts = ParseOptions::default();
    pe_opts.resolve_rva = false;
    pe_opts.parse_mode = goblin::options::ParseMode::Permissive;
    pe_opts.parse_tls_data = false;

    let pe_view = PE::parse_with_opts(image, &pe_opts)?;

    for section in &pe_view.sections {
        if section.name().unwrap_or_default() == ".text" {
            let end = base + section.virtual_address as usize + section.virtual_size as usize;

            log::debug!(
                ".text section of host image ends at 0x{end:X} (base 0x{base:X})"
            );

            return Ok(end);
        }
    }

    log::debug!("host image has no .text section, anchoring at end of image");

    Ok(base + module_info.size_of_image as usize)
}
