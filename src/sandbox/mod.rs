//! Sandbox module containing all execution-related components.

pub mod backend;
pub mod collector;
pub mod config;
pub mod io;
pub mod manager;
pub mod request;
pub mod result;
pub mod rewrite;
pub mod runtime;
pub mod workspace;
