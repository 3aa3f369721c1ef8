//! modelgate: LLM inference gateway and experiment platform
//!
//! Accepts OpenAI-compatible chat-completion requests, normalizes them into
//! a provider-agnostic representation, dispatches to upstream providers with
//! fallback and retry, streams responses back, and persists every completion
//! into a tenant-scoped analytics store that users can query, annotate and
//! group into experiments.

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod metrics;
pub mod providers;
pub mod runner;
pub mod server;
pub mod services;
pub mod storage;
pub mod streaming;
pub mod templates;

pub use config::Config;
pub use domain::{
    AgentCompletion, AgentInput, AgentOutput, Annotation, Experiment, File, LLMUsage, Message,
    MessageContent, MessageRole, ModelData, ProviderId, TenantData, ToolCallRequest, Trace,
    Version,
};
pub use error::{ApiError, ErrorCode, ProviderError, ProviderErrorKind};
pub use events::{Event, EventHandler, SystemEventRouter, TenantEventRouter};
pub use providers::{ParsedResponse, Provider, ProviderFactory, ProviderOptions};
pub use runner::{CacheUsage, FallbackOption, Runner, StreamEvent};
pub use server::{build_router, build_state, run_server, AppState};
pub use services::{CompletionRunnerService, ExperimentService, SecurityService};
pub use storage::{CompletionStore, RelationalStorage};
pub use streaming::{RunnerOutput, RunnerOutputChunk, StreamingContext, ThinkTagStreamingContext};
pub use templates::TemplateManager;
