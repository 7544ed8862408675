//! libveneer
//! Executable-memory pool and inline branch patcher for 64-bit PE images.
//!
//! A relative `jmp`/`call` on x86-64 reaches at most 2 GiB in either
//! direction, so a 5 or 6 byte patch cannot point at an arbitrary 64-bit
//! destination on its own. This crate reserves a read-write-execute pool
//! inside the 2 GiB neighborhood of the host image and routes every patch
//! through a small veneer in that pool: the site gets a short branch it can
//! encode, the veneer carries the full 8-byte destination.
//!
//! Patching contract: pool setup and all patching happen on a single thread,
//! normally during process startup before any other thread can execute the
//! affected code. Nothing in this crate locks; callers that patch later are
//! responsible for their own quiescence.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("libveneer targets 64-bit processes only");

pub mod api;
pub mod common;
pub mod os;
pub mod region;
pub mod trampoline;

mod fatal;

pub use api::{BranchPatcher, trampoline};
pub use trampoline::{Releaser, Trampoline};
