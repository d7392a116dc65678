//! A replay session carried by one gRPC stream.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};

use reprise::resource::ResourceLoader;
use reprise::{
    Connection, CrashReport, PostbackError, PostbackSink, ReplaySessionRequest, SessionHandle,
    SessionId,
};

use crate::proto::{self, ServerMessage, server_message::Msg as ServerMsg};
use crate::remote_resources::RemoteResources;

/// Sending half of the server stream.
///
/// Closing it drops the sender, so the response stream ends even while
/// clones of this handle are still held elsewhere (for example by a primed
/// state's environment inside the shared context).
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    tx: Arc<RwLock<Option<mpsc::Sender<ServerMessage>>>>,
}

impl Outbound {
    pub(crate) fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            tx: Arc::new(RwLock::new(Some(tx))),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<ServerMessage>> {
        self.tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue `msg`, waiting for room. Returns whether it was queued.
    pub(crate) async fn send(&self, msg: ServerMsg) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        tx.send(ServerMessage { msg: Some(msg) }).await.is_ok()
    }

    /// Queue `msg` without waiting; a full queue hands it to a background task.
    pub(crate) fn send_nowait(&self, msg: ServerMsg) {
        let Some(tx) = self.sender() else {
            tracing::debug!("client stream closed, dropping message");
            return;
        };
        match tx.try_send(ServerMessage { msg: Some(msg) }) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(msg)) => {
                tokio::spawn(async move {
                    let _ = tx.send(msg).await;
                });
            }
        }
    }

    pub(crate) fn close(&self) {
        self.tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Lets other sessions reach this client.
#[derive(Debug)]
struct GrpcSessionHandle {
    outbound: Outbound,
}

impl SessionHandle for GrpcSessionHandle {
    fn request_prime(&self, state_id: &str, cleanup_id: &str) {
        self.outbound
            .send_nowait(ServerMsg::PrimeState(proto::PrimeState {
                prerun_id: state_id.to_string(),
                cleanup_id: cleanup_id.to_string(),
            }));
    }

    fn upload_crash(&self, report: &CrashReport) {
        self.outbound
            .send_nowait(ServerMsg::CrashReport(proto::CrashReport {
                reason: report.reason.clone(),
            }));
    }
}

/// Streams postback data to the client.
#[derive(Debug)]
struct GrpcPostbacks {
    outbound: Outbound,
}

#[async_trait]
impl PostbackSink for GrpcPostbacks {
    async fn post(&self, data: Vec<u8>) -> Result<(), PostbackError> {
        if self
            .outbound
            .send(ServerMsg::Postback(proto::Postback { data }))
            .await
        {
            Ok(())
        } else {
            Err(PostbackError("client stream closed".to_string()))
        }
    }
}

/// The orchestrator's view of one gRPC session.
pub struct GrpcConnection {
    id: SessionId,
    requests: mpsc::UnboundedReceiver<ReplaySessionRequest>,
    outbound: Outbound,
    resources: Arc<RemoteResources>,
    handle: Arc<GrpcSessionHandle>,
}

impl fmt::Debug for GrpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl GrpcConnection {
    pub(crate) fn new(
        id: SessionId,
        requests: mpsc::UnboundedReceiver<ReplaySessionRequest>,
        outbound: Outbound,
        resources: Arc<RemoteResources>,
    ) -> Self {
        let handle = Arc::new(GrpcSessionHandle {
            outbound: outbound.clone(),
        });
        Self {
            id,
            requests,
            outbound,
            resources,
            handle,
        }
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn next_request(&mut self) -> Option<ReplaySessionRequest> {
        self.requests.recv().await
    }

    async fn send_finished(&mut self) {
        if !self
            .outbound
            .send(ServerMsg::Finished(proto::ReplayFinished {}))
            .await
        {
            tracing::warn!(session = %self.id, "client gone before replay finished was sent");
        }
    }

    fn handle(&self) -> Arc<dyn SessionHandle> {
        self.handle.clone()
    }

    fn resources(&self) -> Arc<dyn ResourceLoader> {
        self.resources.clone()
    }

    fn postbacks(&self) -> Arc<dyn PostbackSink> {
        Arc::new(GrpcPostbacks {
            outbound: self.outbound.clone(),
        })
    }
}
