//! Vision Extract - streaming event extraction from images and OCR text.
//!
//! A request is routed to a cloud vision API, a chat-completion server or a
//! supervised local OCR bridge (optionally chained: OCR first, then an LLM),
//! and progress is relayed as newline-delimited JSON frames.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod record_store;
pub mod schema;
pub mod supervisor;

pub use codec::Frame;
pub use coordinator::Coordinator;
pub use orchestrator::Orchestrator;
pub use providers::{FrameStream, Provider, ProviderKind, Providers};
pub use schema::{ExtractionRequest, ProviderConfig, Strategy};
pub use supervisor::{Supervisor, Tier};
