#![forbid(unsafe_code)]
//! VDFS public API facade.
//!
//! Re-exports the engine from `vdfs-core` through a stable external
//! interface. The CLI depends on this crate only.

pub use vdfs_core::*;
