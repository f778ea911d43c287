//! kubechain core
//!
//! Level-triggered control plane for LLM agent tasks:
//! - `api`: resource kinds, conversation types, manifests
//! - `store`: versioned object store with watch notifications
//! - `runtime`: work queue and controller manager
//! - `controller`: reconcilers for every kind
//! - `llm`, `mcp`, `approval`, `tools`: clients behind the reconcilers

pub mod api;
pub mod approval;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod llm;
pub mod mcp;
pub mod paths;
pub mod runtime;
pub mod secrets;
pub mod store;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;
