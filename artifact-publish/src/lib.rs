//! artifact-publish: CLI and configuration layer over `artifact-publish-core`.

pub mod cli;
pub mod load_config;

pub use cli::{run, Cli, Commands};
