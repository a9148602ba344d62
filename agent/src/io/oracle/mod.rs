//! Reasoning oracle interface.
//!
//! Every component talks to the oracle through [`Oracle::invoke`], naming the
//! [`OutputShape`] it needs. Implementations are interchangeable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::shape::{OutputShape, ParsedValue};
use crate::core::transcript::Message;
use crate::error::OracleError;

pub mod openai;

pub use openai::OpenAiOracle;

/// Token accounting reported by the oracle, recorded as telemetry cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub value: ParsedValue,
    pub usage: Option<Usage>,
}

impl OracleReply {
    pub fn new(value: ParsedValue) -> Self {
        Self { value, usage: None }
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Send `messages` and parse the reply according to `shape`.
    ///
    /// Structured replies are returned as raw JSON; callers validate them
    /// against the schema they asked for.
    async fn invoke(
        &self,
        messages: &[Message],
        shape: &OutputShape,
    ) -> Result<OracleReply, OracleError>;

    /// Model identifier for telemetry.
    fn model(&self) -> &str;
}
