//! # Code
//!
//! Machine-code helpers: jump encodings and redirect recognition.

pub mod x64;
