//! The relay runtime: supervisor, activation flow, and the three
//! long-lived loops (inbound, outbound, heartbeat), all sharing one
//! cancellation token.

pub mod activation;
pub mod heartbeat;
pub mod inbound;
pub mod outbound;
pub mod supervisor;

pub use activation::{activate_agent, ActivationError};
pub use heartbeat::{HeartbeatEnd, HeartbeatLoop};
pub use inbound::InboundPipeline;
pub use outbound::OutboundDispatcher;
pub use supervisor::{AgentState, RunEnd, Supervisor, SupervisorError};
