//! Subcommand implementations. Each module exposes `make_subcommand` to
//! build the clap definition and `execute` to run it.

pub mod build;
pub mod render;
pub mod serve;
pub mod start;
pub mod stop;
pub mod watch;
