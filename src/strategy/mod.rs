//! Strategy selection and loader configuration

pub mod config;
pub mod selector;
