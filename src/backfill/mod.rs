// ABOUTME: Backfill module: batch invoker, retry policies and loop controllers
// ABOUTME: One controller per job kind drives a remote batch processor to completion

pub mod controller;
pub mod invoker;
pub mod retry;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

pub use controller::{
    BackfillController, BackfillReport, BackfillSnapshot, LoopOutcome, LoopSettings,
    StartOutcome, StopHandle,
};
pub use invoker::{BatchEndpoint, BatchInvoker, InvokeOptions};
pub use retry::{ConnectionRetryPolicy, LoopRetryPolicy, RetryDecision};

/// The record types that can be backfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackfillKind {
    /// Chunks without an embedding vector
    Embeddings,
    /// Chunks not yet run through named-entity extraction
    Entities,
    /// Calls without a deal heat score
    DealHeat,
}

impl BackfillKind {
    pub const ALL: [BackfillKind; 3] = [
        BackfillKind::Embeddings,
        BackfillKind::Entities,
        BackfillKind::DealHeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillKind::Embeddings => "embeddings",
            BackfillKind::Entities => "entities",
            BackfillKind::DealHeat => "deal-heat",
        }
    }

    /// Request body for one batch of this kind.
    pub fn request_body(&self, batch_size: u32) -> Value {
        match self {
            BackfillKind::Embeddings => json!({
                "backfill_embeddings": true,
                "batch_size": batch_size,
            }),
            BackfillKind::Entities => json!({
                "backfill_entities": true,
                "batch_size": batch_size,
            }),
            BackfillKind::DealHeat => json!({
                "backfill": true,
                "batch_size": batch_size,
            }),
        }
    }
}

impl fmt::Display for BackfillKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            BackfillKind::Embeddings => "embeddings",
            BackfillKind::Entities => "entity extraction",
            BackfillKind::DealHeat => "deal heat",
        };
        f.write_str(label)
    }
}

impl FromStr for BackfillKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "embeddings" | "embedding" => Ok(BackfillKind::Embeddings),
            "entities" | "ner" => Ok(BackfillKind::Entities),
            "deal-heat" | "deal_heat" | "dealheat" => Ok(BackfillKind::DealHeat),
            other => Err(format!(
                "unknown backfill kind '{}' (expected embeddings, entities or deal-heat)",
                other
            )),
        }
    }
}
