// Correlated request/response messaging between the page context and the
// privileged process

pub mod client;
pub mod contract;
pub mod envelope;
pub mod transport;

pub use client::{MessageBridge, PendingCall, DEFAULT_TIMEOUT};
pub use contract::{
    AddMembership, AddOrUpdateRating, BridgeRequest, CheckMembership, GetRating, GetUser,
    ListMemberships, RemoveMembership, Search, SignIn, SignOut,
};
pub use envelope::{RequestEnvelope, RequestType, ResponseEnvelope, ResponseType};
pub use transport::{HttpTransport, Inbox, LocalTransport, Transport, DEFAULT_CHANNEL_CAPACITY};
