//! Council orchestration core: a three-stage concurrent LLM pipeline.
//!
//! Stage 1 fans a user question out to multiple streaming model calls,
//! Stage 2 has peer reviewers rank the anonymized answers, and Stage 3 has a
//! chairman chain synthesize the final response — all streamed token-by-token
//! to the caller as a lazy sequence of typed events.
//!
//! The crate is transport-agnostic: each stage returns a
//! `tokio::sync::mpsc::Receiver<CouncilEvent>` the caller can forward to
//! SSE, gRPC, or a queue. Storage concerns (model lists, presets, business
//! context) attach through the `RoleStore`, `PresetStore`, and
//! `ContextSource` traits.

pub mod client;
pub mod compose;
pub mod config;
pub mod council;
pub mod error;
pub mod events;
pub mod mux;
pub mod presets;
pub mod registry;
pub mod safety;
pub mod telemetry;

pub use client::breaker::{BreakerConfig, BreakerRegistry, Execution};
pub use client::http::ModelClient;
pub use client::{Message, ModelRequest, Role};
pub use config::CouncilConfig;
pub use council::stage1::Stage1Request;
pub use council::stage2::{Stage2Outcome, Stage2Request};
pub use council::stage3::Stage3Request;
pub use council::{Council, CouncilOptions, FullCouncilOutcome};
pub use error::CouncilError;
pub use events::{CouncilEvent, Stage1Result, Stage2Result, Stage3Result, StreamEvent, Usage};
pub use mux::{ModelOutput, MuxEvent, StagePlan};
