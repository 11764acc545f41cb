#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("hookscan only supports x86_64 targets");

pub mod addr;
pub mod alloc;
pub mod catalog;
pub mod clearance;
pub mod code;
pub mod hook;
pub mod mem;
pub mod pattern;
pub mod protect;
pub mod scan;

pub use addr::Address;
pub use pattern::Pattern;
pub use scan::{CancelToken, ScanOptions, ScanProgress, ScanTarget, TargetFlags};
