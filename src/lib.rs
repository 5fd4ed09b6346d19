//! Linear scan register allocation for a Dex-style register IR
//!
//! Methods in SSA form go in; they come out with every operand rewritten to a
//! register and with the spill, reload and phi moves inserted.

pub mod config;
pub mod driver;
pub mod error;
pub mod ir;
pub mod regalloc;
mod utils;

pub use config::{AllocatorConfig, WidePairing};
pub use error::AllocError;
pub use regalloc::{allocate_registers, Allocation};
