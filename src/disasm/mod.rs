//! Instruction decoding for diagnostics

pub mod preview;
