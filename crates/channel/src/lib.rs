//! Channel adapters - the process's edges to external collaborators
//!
//! - **Ingress** (`ingress`) - channel webhook and scheduler fire payloads to runtime input
//! - **Egress** (`egress`) - replies back to the chat channel API, and the chat's history
//! - **Blob** (`blob`) - ontology document fetch from a file tree or HTTP bucket
//! - **Scheduler** (`scheduler`) - delayed continuation submission, in-process or remote
//!
//! # Architecture
//!
//! ```text
//! Webhook JSON → parse_webhook → TurnRuntime → ReplySink
//!                                    ↓
//!                          WorkflowScheduler → ContinuationFire → TurnRuntime
//! ```

pub mod blob;
pub mod egress;
pub mod ingress;
pub mod scheduler;

pub use blob::{blob_source_from_config, FileBlobSource, HttpBlobSource};
pub use egress::{
    chat_history_from_config, reply_sink_from_config, ChannelApiClient, ChatHistory, EgressError,
    HistoryEntry, InMemoryReplySink, NoopReplySink, ReplySink, MAX_HISTORY,
};
pub use ingress::{
    parse_webhook, parse_webhook_value, IgnoreReason, IngressError, IngressEvent,
    IngressEventType, SCHEDULER_SOURCE,
};
pub use scheduler::{HttpWorkflowScheduler, LocalWorkflowScheduler};
