//! Process exit codes.

use crate::signal::is_interrupted;

pub mod codes {
    pub const SUCCESS: i32 = 0;
    /// A stage failed.
    pub const FAILURE: i32 = 1;
    /// Bad command line.
    pub const USAGE: i32 = 2;
    /// Interrupted by SIGINT (128 + 2).
    pub const INTERRUPTED: i32 = 130;
}

/// Map a pipeline error to an exit code.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if is_interrupted(error) {
        codes::INTERRUPTED
    } else {
        codes::FAILURE
    }
}
