/*
 * Runtime Utilities and Support Functions
 *
 * This module contains the support code used throughout the runtime:
 * the logger bootstrap and the fatal-error exit path.
 *
 * Why this is important:
 * - Provides essential debugging and logging infrastructure
 * - Gives broken-invariant discoveries a single, loud exit path
 * - Enables consistent diagnostics across the runtime
 *
 * Key components:
 * - logger: structured logging bootstrap for tests and demo programs
 * - fatal / fatal_os: report an unrecoverable error and exit non-zero
 */

pub mod logger;

/// Reports an unrecoverable programming error and terminates the image.
///
/// The runtime has no way to unwind a process that discovers a broken
/// invariant (out of memory, PRI PAR overflow, mismatched unit assertion),
/// so the whole program exits non-zero after surfacing the diagnostic.
pub fn fatal(what: &str) -> ! {
    log::error!("{}", what);
    eprintln!("cxr: {}", what);
    std::process::exit(1);
}

/// Like [`fatal`], but appends the current OS error.
///
/// Used by the hardware layer after a failed libc call.
pub fn fatal_os(what: &str) -> ! {
    let err = std::io::Error::last_os_error();
    log::error!("{}: {}", what, err);
    eprintln!("cxr: {}: {}", what, err);
    std::process::exit(1);
}
