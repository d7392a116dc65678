//! Resource loading backed by the gRPC stream.
//!
//! Implements [`ResourceLoader`] by sending a request to the client over the
//! bidirectional stream and waiting for the matching response.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};

use reprise::resource::{ResourceError, ResourceLoader};

use crate::connection::Outbound;
use crate::proto::{
    self, ClientMessage, client_message::Msg as ClientMsg, resource_response,
    server_message::Msg as ServerMsg,
};

/// Bytes or the client's error message.
type Fetched = Result<Vec<u8>, String>;

/// Requests awaiting a response, keyed by request id.
#[derive(Debug, Default)]
struct Pending {
    requests: HashMap<u64, oneshot::Sender<Fetched>>,
    /// Set once the client stream ends; later requests fail immediately.
    closed: bool,
}

/// Loader that fetches every resource from the connected client.
#[derive(Debug)]
pub struct RemoteResources {
    outbound: Outbound,
    pending: Arc<Mutex<Pending>>,
    next_request_id: AtomicU64,
}

impl RemoteResources {
    pub(crate) fn new(outbound: Outbound) -> Self {
        Self {
            outbound,
            pending: Arc::new(Mutex::new(Pending::default())),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Get a handle for processing client responses.
    ///
    /// Incoming `ClientMessage`s should be passed to it so resource responses
    /// reach their pending requests.
    pub fn response_handler(&self) -> ResponseHandler {
        ResponseHandler {
            pending: Arc::clone(&self.pending),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl ResourceLoader for RemoteResources {
    async fn load(&self, key: &str) -> Result<Vec<u8>, ResourceError> {
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(ResourceError::ChannelClosed);
            }
            pending.requests.insert(request_id, tx);
        }

        let sent = self
            .outbound
            .send(ServerMsg::ResourceRequest(proto::ResourceRequest {
                request_id,
                key: key.to_string(),
            }))
            .await;
        if !sent {
            self.pending.lock().await.requests.remove(&request_id);
            return Err(ResourceError::ChannelClosed);
        }
        tracing::trace!(request_id, key, "resource requested from client");

        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(message)) => Err(ResourceError::Remote {
                key: key.to_string(),
                message,
            }),
            Err(_) => Err(ResourceError::ChannelClosed),
        }
    }
}

/// Handle for dispatching client responses to pending resource requests.
#[derive(Debug)]
pub struct ResponseHandler {
    pending: Arc<Mutex<Pending>>,
}

impl ResponseHandler {
    /// Dispatch a client message to its pending request.
    ///
    /// Returns `true` if the message was a resource response.
    pub async fn handle(&self, msg: &ClientMessage) -> bool {
        let Some(ClientMsg::ResourceResponse(resp)) = &msg.msg else {
            return false;
        };

        let fetched = match &resp.result {
            Some(resource_response::Result::Data(data)) => Ok(data.clone()),
            Some(resource_response::Result::Error(message)) => Err(message.clone()),
            None => Err("empty resource response".to_string()),
        };

        let mut pending = self.pending.lock().await;
        match pending.requests.remove(&resp.request_id) {
            Some(sender) => {
                let _ = sender.send(fetched);
            }
            None => tracing::debug!(request_id = resp.request_id, "response for unknown request"),
        }
        true
    }

    /// Fail every pending and future request.
    ///
    /// Called once the client stream ends, so a replay waiting on a resource
    /// does not hold the shared context forever.
    pub async fn close(&self) {
        let mut pending = self.pending.lock().await;
        pending.closed = true;
        pending.requests.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::proto::ServerMessage;

    fn response(request_id: u64, result: resource_response::Result) -> ClientMessage {
        ClientMessage {
            msg: Some(ClientMsg::ResourceResponse(proto::ResourceResponse {
                request_id,
                result: Some(result),
            })),
        }
    }

    async fn next_request(rx: &mut mpsc::Receiver<ServerMessage>) -> proto::ResourceRequest {
        match rx.recv().await.unwrap().msg {
            Some(ServerMsg::ResourceRequest(req)) => req,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_round_trips_through_client() {
        let (tx, mut rx) = mpsc::channel(4);
        let resources = Arc::new(RemoteResources::new(Outbound::new(tx)));
        let handler = resources.response_handler();

        let load = tokio::spawn({
            let resources = Arc::clone(&resources);
            async move { resources.load("texture").await }
        });

        let req = next_request(&mut rx).await;
        assert_eq!(req.key, "texture");
        assert!(
            handler
                .handle(&response(
                    req.request_id,
                    resource_response::Result::Data(b"pixels".to_vec())
                ))
                .await
        );
        assert_eq!(load.await.unwrap().unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn test_client_error_is_reported() {
        let (tx, mut rx) = mpsc::channel(4);
        let resources = Arc::new(RemoteResources::new(Outbound::new(tx)));
        let handler = resources.response_handler();

        let load = tokio::spawn({
            let resources = Arc::clone(&resources);
            async move { resources.load("missing").await }
        });

        let req = next_request(&mut rx).await;
        handler
            .handle(&response(
                req.request_id,
                resource_response::Result::Error("no such blob".to_string()),
            ))
            .await;

        match load.await.unwrap() {
            Err(ResourceError::Remote { key, message }) => {
                assert_eq!(key, "missing");
                assert_eq!(message, "no such blob");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_later_requests() {
        let (tx, mut rx) = mpsc::channel(4);
        let resources = Arc::new(RemoteResources::new(Outbound::new(tx)));
        let handler = resources.response_handler();

        let load = tokio::spawn({
            let resources = Arc::clone(&resources);
            async move { resources.load("slow").await }
        });
        next_request(&mut rx).await;

        handler.close().await;
        assert!(matches!(
            load.await.unwrap(),
            Err(ResourceError::ChannelClosed)
        ));
        assert!(matches!(
            resources.load("later").await,
            Err(ResourceError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_non_resource_messages_are_not_handled() {
        let (tx, _rx) = mpsc::channel(4);
        let resources = RemoteResources::new(Outbound::new(tx));
        let handler = resources.response_handler();

        let msg = ClientMessage {
            msg: Some(ClientMsg::Request(proto::ReplayRequest { req: None })),
        };
        assert!(!handler.handle(&msg).await);
    }
}
