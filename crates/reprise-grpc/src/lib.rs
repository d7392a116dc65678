//! Reprise gRPC Server
//!
//! Exposes the Reprise session orchestrator over a bidirectional gRPC stream.
//! Each stream is one replay session.
//!
//! # Architecture
//!
//! The server holds no resource data of its own. Whenever the execution
//! context needs a blob that is not in the resource cache, the request goes
//! back to the client over the same stream, and the client answers with the
//! bytes or an error. All sessions share one execution context, so requests
//! from different clients are processed one at a time.
//!
//! # Example Flow
//!
//! ```text
//! Client                                    Server
//! │                                           │
//! │  Prewarm{prerun_id: "lvlA", ...}          │
//! │ ─────────────────────────────────────────>│
//! │                                           │
//! │       ResourceRequest{key: "lvlA"}        │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │  ResourceResponse{data: ...}              │
//! │ ─────────────────────────────────────────>│
//! │                                           │
//! │  Replay{replay_id: "lvlA_draw", ...}      │
//! │ ─────────────────────────────────────────>│
//! │                                           │
//! │       Postback{data: ...}                 │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │       ReplayFinished{}                    │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │       PrimeState{prerun_id: "lvlA", ...}  │
//! │<───────────────────────────────────────── │
//! ```

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("reprise.v1");
}

mod connection;
mod remote_resources;
mod server;

pub use connection::GrpcConnection;
pub use remote_resources::{RemoteResources, ResponseHandler};
pub use server::{AUTH_TOKEN_HEADER, BoundServer, ReplayServer, ReplayService};

// Re-export proto types for convenience
pub use proto::{
    ClientMessage, ReplayRequest, ServerMessage, replayer_client::ReplayerClient,
    replayer_server::ReplayerServer as ReplayerGrpcServer,
};
