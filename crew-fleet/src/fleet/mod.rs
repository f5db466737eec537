//! Fleet orchestration.
//!
//! Loads every team's configuration, gives each eligible team a crew and a
//! chat connection routed to that crew, and starts, stops and notifies the
//! whole fleet together. A team that fails to start is logged and skipped;
//! it never takes the rest of the fleet down with it.

mod orchestrator;

pub use orchestrator::{
    BindingStatus, BroadcastKind, BroadcastReport, FleetOrchestrator, FleetStatus, OFFLINE_NOTICE,
    StartReport, TenantRouter, render_notice,
};
