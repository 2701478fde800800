//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (`core-auth`, `core-runtime`). Host applications can depend
//! on `mail-auth-workspace` and enable `desktop-shims` to get the desktop
//! bridge defaults without wiring each crate individually.

pub use core_auth as auth;
pub use core_runtime as runtime;
