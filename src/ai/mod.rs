//! AI Integration Layer
//!
//! Completion clients, the retry policy that wraps every billable call, and
//! recovery of structured records from raw model output.

pub mod provider;
pub mod recovery;
pub mod retry;
pub mod timeout;

pub use provider::{
    AnthropicClient, ChunkCallback, CompletionClient, CompletionRequest, CompletionResponse,
    OpenAiClient, ResponseMetadata, ResponseTiming, SharedClient, StreamFinish, TokenUsage,
    create_client,
};
pub use recovery::{
    FieldKind, FieldSpec, ParsedRecord, RecordSchema, RecoveryStrategy, ResponseRecoveryParser,
};
pub use retry::{AttemptContext, AttemptUsage, RetryPolicy};
pub use timeout::with_timeout;
