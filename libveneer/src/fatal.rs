//! Last-resort failure handling.
//!
//! A misplaced pool or a half-applied patch leaves the image in a state
//! where any further control transfer may land in broken code. There is no
//! recovery path for that, so the useful thing to do is stop while the
//! state is still inspectable.

/// Logs `reason`, waits for a debugger, then aborts the process.
///
/// Never returns to the caller. Test builds panic instead so the fatal
/// paths can be asserted with `#[should_panic]`.
pub(crate) fn halt(reason: &str) -> ! {
    log::error!("{reason}");

    #[cfg(test)]
    panic!("{}", reason);

    #[cfg(not(test))]
    {
        #[cfg(windows)]
        while !crate::os::windows::winapi::is_debugger_present() {
            std::hint::spin_loop();
        }

        std::process::abort()
    }
}
