// Provider adapter layer.
// Canonical chat model, the per-vendor translators, and the upstream
// concurrency gate. Everything provider-specific lives below this module.

pub mod adapter;
pub mod anthropic;
pub mod error;
pub mod google;
pub mod model;
pub mod openai;
pub mod schema;
pub mod throttle;


// Re-export the types the rest of the gateway works with.
pub use adapter::{
    adapter_for, Capabilities, ChatRequest, ChunkStream, Provider, ProviderAdapter,
    ProviderConfig, ResponseFormat, ThinkingOptions, ToolChoice,
};
pub use error::GatewayError;
pub use model::{
    ContentPart, FinishReason, Message, MessageContent, Response, ResponseChunk, Role, ToolCall,
    ToolDefinition, ToolErrorKind, ToolOutcome, Usage,
};
pub use throttle::Throttler;
