//! Process-level helpers shared by mailbus binaries.

pub mod bootstrap;
