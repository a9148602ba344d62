//! Autonomous penetration-test agent built on a Plan-Execute-Knowledge loop.
//!
//! A strategy planner keeps a hierarchical task plan, a round-bounded
//! executor runs one task at a time against the target, and a knowledge
//! aggregator folds what was learned back into a running corpus.
//!
//! - **[`core`]**: Pure data and logic (plan text, transcripts, output shapes).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (oracle HTTP, remote shells,
//!   telemetry, config and state files). Behind traits so tests can fake them.
//! - **[`agents`]**: The oracle-backed components.
//!
//! [`looping`] wires the agents into the controller used by `pentest-agent run`.

pub mod agents;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
