//! Deterministic, pure logic shared by the agents.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod history;
pub mod plan;
pub mod shape;
pub mod transcript;
pub mod types;
