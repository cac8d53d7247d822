//! Engine-specific glue between the syscall shim and the WebAssembly runtime.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

pub mod common;
pub mod wasmtime;
