#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod disk;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod launch;
pub mod logging;
pub mod paths;
pub mod progress;
pub mod reconcile;
pub mod sidecar;
pub mod sync;
