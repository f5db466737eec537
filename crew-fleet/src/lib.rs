//! crew-fleet: multi-tenant chat bot backend.
//!
//! Every team (tenant) owns one long-lived, stateful crew that answers its
//! chat requests. Crews are reused across requests so conversational context
//! survives, and the whole fleet of crews and chat connections is started,
//! monitored and shut down together:
//! - `crew`: per-tenant crew lifecycle (create, reuse, bound execution, idle
//!   tracking, teardown)
//! - `fleet`: loads tenant configs and binds a chat connection to each crew
//! - `transport`, `store`, `llm`: the chat, configuration and crew collaborators

pub mod config;
pub mod crew;
pub mod error;
pub mod fleet;
pub mod llm;
pub mod store;
pub mod transport;
pub mod worker;
