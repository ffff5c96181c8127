pub mod chat;
pub mod config;
pub mod llm;
pub mod server;
pub mod tools;

// Re-export commonly used items for convenience.
pub use chat::{ChatOrchestrator, SessionManager, TurnRequest};
pub use config::ConfigStore;
pub use llm::{GatewayError, Message, Provider, Response, Role};
pub use server::{router, AppState};
pub use tools::{FnTool, ToolProvider, ToolRegistry};
