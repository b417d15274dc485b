//! Per-node change protocol: messages, durable state and the state machine

pub mod messages;
pub mod processor;
pub mod server;
pub mod state;

pub use messages::{
    AcceptRejectBody, AcceptRejectResponse, ChangeDetails, ChangeRequestState, CommitMessage,
    DiscoverResponse, ForceStateMessage, LineageEntry, MutationContext, PrepareMessage, Rejection,
    RejectionReason, RollbackMessage, ServerMode, TopologyView,
};
pub use processor::{ChangeProcessor, TopologyListener, TopologyProcessor};
pub use server::NomadServer;
pub use state::{NodeProtocolState, StateRepository};
