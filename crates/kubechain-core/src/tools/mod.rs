//! Direct tool execution: builtin functions and external APIs

pub mod builtin;
pub mod external_api;

pub use builtin::{execute_builtin, format_number, BuiltinError};
pub use external_api::{
    ExternalApiClient, ExternalApiClientFactory, HttpExternalApiClient, HttpExternalApiFactory,
    ToolBackendRegistry,
};
