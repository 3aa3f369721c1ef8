//! Application services on top of storage and the runner

pub mod annotations;
pub mod api_keys;
pub mod completion_runner;
pub mod experiments;
pub mod previews;
pub mod security;
pub mod storer;

pub use annotations::AnnotationService;
pub use api_keys::{ApiKeyService, MintedKey};
pub use completion_runner::{CompletionRequestHandler, CompletionRunnerService, RunParams};
pub use experiments::{CreateExperimentRequest, ExperimentService};
pub use security::SecurityService;
pub use storer::{CompletionStorer, StoreCompletionHandler, UserConnectedHandler};
