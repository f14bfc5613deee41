//! CLI Exit Code Registry
//!
//! Single source of truth for `lbridge` exit codes. Scripts that drive the
//! runner depend on these values.
//!
//! | Code | Meaning                                           |
//! |------|---------------------------------------------------|
//! | 0    | Success                                           |
//! | 1    | General error (unspecified)                       |
//! | 2    | Usage error (bad arguments, invalid config)       |
//! | 3    | I/O error (script or config unreadable)           |
//! | 4    | Script failed to compile                          |
//! | 5    | Script raised a fault that nothing caught         |
//! | 6    | Memory, instruction or time limit hit             |

use lunabridge::Error;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - engine failures with no better code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, invalid config values.
pub const EXIT_USAGE: u8 = 2;

/// Script or config file could not be read.
pub const EXIT_IO: u8 = 3;

/// Script failed to compile.
pub const EXIT_SYNTAX: u8 = 4;

/// Script raised an uncaught fault.
pub const EXIT_FAULT: u8 = 5;

/// Memory cap, instruction limit or time limit stopped the script.
pub const EXIT_LIMIT: u8 = 6;

/// Map a bridge error to its exit code.
pub fn bridge_exit_code(err: &Error) -> u8 {
    match err {
        Error::Config(_) => EXIT_USAGE,
        Error::Io(_) => EXIT_IO,
        Error::Syntax(_) => EXIT_SYNTAX,
        Error::ScriptFault(_) | Error::Host(_) | Error::UnconvertibleType { .. } => EXIT_FAULT,
        Error::LimitExceeded(_) | Error::OutOfMemory(_) | Error::StackExhausted => EXIT_LIMIT,
        _ => EXIT_ERROR,
    }
}
