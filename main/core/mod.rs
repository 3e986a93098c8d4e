//! Runtime-wide infrastructure: configuration and support types.

pub mod configuration;
