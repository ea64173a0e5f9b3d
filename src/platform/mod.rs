//! Host and target description

pub mod catalog;
pub mod host;
