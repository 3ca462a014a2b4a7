//! One module per subcommand, mirroring the teacher's one-file-per-command
//! layout. Each `run` returns a process exit code per SPEC_FULL.md §6:
//! 0 success, 1 error, 2 nothing to do.

pub mod start;
pub mod status;
pub mod stop;
pub mod verify;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_NOTHING_TO_DO: i32 = 2;
