//! The untrusted→trusted syscall surface: argument/return types, syscall
//! numbers, and the handler implementations.

pub mod handler;
pub mod numbers;
pub mod table;
pub mod types;
