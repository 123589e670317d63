//! Agent identification and the agent registry.

pub mod detector;
pub mod procfs;
mod registry;

pub use detector::{
    AgentDetector, AgentStatus, Clock, ConnectionProcess, DeclaredIdentity, DetectedAgent,
    IdentitySource, UNKNOWN_AGENT_ID, UNKNOWN_AGENT_NAME, process_identity,
};
pub use procfs::{MemoryProcFs, ProcFs, SystemProcFs};
pub use registry::{AgentRecord, AgentRegistry, Registration};
