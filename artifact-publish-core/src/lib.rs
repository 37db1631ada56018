#![doc = "artifact-publish-core: core logic library for artifact-publish."]

//! This crate contains the publication protocol and everything it needs:
//! data model and capability traits, identity resolution, the command-backed
//! generator, the git-backed target repository, the publisher state machine
//! and the pipeline driver.
//!
//! # Usage
//! Add this as a dependency for anything that generates artifacts and commits
//! them into downstream repositories. The CLI crate only adds config loading
//! and argument parsing on top.

pub mod contract;
pub mod error;
#[cfg(any(test, feature = "test-export-mocks"))]
pub mod fakes;
pub mod generator;
pub mod git;
pub mod identity;
pub mod pipeline;
pub mod publisher;
