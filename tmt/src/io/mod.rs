//! Side-effecting helpers: processes, files, network, user output.

pub mod cancel;
pub mod config;
pub mod files;
pub mod git;
pub mod http;
pub mod output;
pub mod persist;
pub mod process;
pub mod workdir;
