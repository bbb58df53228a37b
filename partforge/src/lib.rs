//! An incremental, dependency-ordered lifecycle engine for multi-part
//! builds.
//!
//! A declarative document describes a set of named parts; each part pulls
//! its sources, builds artifacts, stages them into a shared directory and
//! primes the final payload. The engine orders parts by their declared
//! dependencies, persists per-step state so unchanged work is skipped,
//! detects configuration drift (dirty) and source drift (outdated), keeps
//! overlapping staged content consistent, and resolves the runtime
//! library closure of primed binaries.

#![warn(rust_2018_idioms)]
#![warn(clippy::clone_on_ref_ptr)]

pub mod arch;
pub mod collisions;
pub mod elf;
pub mod env;
pub mod errors;
pub mod fileset;
pub mod graph;
pub mod lifecycle;
pub mod part;
pub mod plugins;
pub mod project;
pub mod repo;
pub mod runner;
pub mod scriptlets;
pub mod sources;
pub mod states;
pub mod status;
pub mod steps;

pub use crate::errors::{Error, Result};
pub use crate::lifecycle::{LifecycleManager, OutdatedStepAction};
pub use crate::plugins::{Plugin, PluginV1, PluginV2, Registry};
pub use crate::project::{PartData, ProjectOptions};
pub use crate::repo::{NullRepository, PackageRepository};
pub use crate::states::{GlobalState, Grade};
pub use crate::steps::Step;
