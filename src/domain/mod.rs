//! Shared domain model: messages, files, versions, completions, experiments

pub mod agent;
pub mod annotation;
pub mod completion;
pub mod experiment;
pub mod file;
pub mod hashing;
pub mod message;
pub mod models;
pub mod tenant;
pub mod tool_call;
pub mod usage;
pub mod version;

pub use agent::{Agent, AgentInput, AgentOutput, OutputError};
pub use annotation::{Annotation, AnnotationContext, AnnotationTarget, Metric, MetricValue};
pub use completion::{AgentCompletion, CompletionSource, CompletionStatus, Trace};
pub use experiment::Experiment;
pub use file::File;
pub use message::{Message, MessageContent, MessageRole};
pub use models::{model_data, ModelData, ProviderId};
pub use tenant::{ApiKey, TenantData};
pub use tool_call::{ToolCallRequest, ToolCallResult, ToolChoice, ToolDefinition};
pub use usage::LLMUsage;
pub use version::{ReasoningEffort, Version};
