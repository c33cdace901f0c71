pub mod bridge;
pub mod coordinator;
pub mod fanout;
pub mod pipeline;

// Grouped subsystems
pub mod server; // HTTP ingress + WebSocket broadcast + status

pub mod runtime {
    pub use telemux_common::threading::{ThreadHandle, ThreadRegistry, ThreadSummary};
}

pub use telemux_core::snapshot;
