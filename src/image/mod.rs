//! Shellcode images: loading, entry resolution and container generation

pub mod container;
pub mod elf;
pub mod loader;
pub mod pe;
