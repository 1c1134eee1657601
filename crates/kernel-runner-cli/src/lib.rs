//! Kernel runner command-line front end.
//!
//! The modules are exposed as a library so the argument handling and exit
//! code mapping can be tested without spawning the binary.

pub mod cli;
pub mod exit;
pub mod fs_io;
pub mod logging;
