//! gRPC server implementation for the Replayer service.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tonic::service::Interceptor;
use tonic::{Request, Response, Status, Streaming};

use reprise::{Orchestrator, ReplaySessionRequest, SessionId};

use crate::connection::{GrpcConnection, Outbound};
use crate::proto::{
    self, ClientMessage, ServerMessage, client_message::Msg as ClientMsg, replay_request::Req,
};
use crate::remote_resources::{RemoteResources, ResponseHandler};

/// Metadata key carrying the auth token.
pub const AUTH_TOKEN_HEADER: &str = "auth-token";

const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Time of the last client message, shared by every session.
#[derive(Debug, Clone)]
struct Activity {
    start: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// The Replayer gRPC service implementation.
#[derive(Clone, Debug)]
pub struct ReplayService {
    orchestrator: Orchestrator,
    activity: Activity,
}

impl ReplayService {
    /// Create a service running every session through `orchestrator`.
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            activity: Activity::new(),
        }
    }
}

type SessionStream = Pin<Box<dyn Stream<Item = Result<ServerMessage, Status>> + Send>>;

#[tonic::async_trait]
impl proto::replayer_server::Replayer for ReplayService {
    type SessionStream = SessionStream;

    async fn session(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let client_stream = request.into_inner();
        self.activity.touch();

        let id = SessionId::next();
        let (server_tx, server_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_DEPTH);
        let outbound = Outbound::new(server_tx);
        let resources = Arc::new(RemoteResources::new(outbound.clone()));

        // Unbounded so a client queueing requests ahead never blocks the
        // reader while a replay waits on one of its resource responses.
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_client(
            id,
            client_stream,
            resources.response_handler(),
            request_tx,
            self.activity.clone(),
        ));

        let conn = GrpcConnection::new(id, request_rx, outbound.clone(), resources);
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let end = orchestrator.run(conn).await;
            tracing::info!(session = %id, ?end, "session closed");
            outbound.close();
        });

        let stream = ReceiverStream::new(server_rx);
        Ok(Response::new(Box::pin(stream.map(Ok)) as SessionStream))
    }
}

/// Demultiplex one client stream into resource responses and requests.
async fn read_client(
    id: SessionId,
    mut client_stream: Streaming<ClientMessage>,
    responses: ResponseHandler,
    requests: mpsc::UnboundedSender<ReplaySessionRequest>,
    activity: Activity,
) {
    while let Some(msg) = client_stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(status) => {
                tracing::warn!(session = %id, %status, "client stream failed");
                break;
            }
        };
        activity.touch();

        if responses.handle(&msg).await {
            continue;
        }

        match msg.msg {
            Some(ClientMsg::Request(req)) => match convert_request(req) {
                Some(request) => {
                    if requests.send(request).is_err() {
                        tracing::debug!(session = %id, "session ended, dropping request");
                    }
                }
                None => tracing::warn!(session = %id, "ignoring empty replay request"),
            },
            _ => tracing::warn!(session = %id, "ignoring unexpected client message"),
        }
    }

    responses.close().await;
    tracing::debug!(session = %id, "client stream closed");
}

fn convert_request(req: proto::ReplayRequest) -> Option<ReplaySessionRequest> {
    match req.req? {
        Req::Replay(r) => Some(ReplaySessionRequest::replay(r.replay_id, r.dependent_id)),
        Req::Prewarm(p) => Some(ReplaySessionRequest::prewarm(p.prerun_id, p.cleanup_id)),
    }
}

/// Rejects calls that do not carry the configured auth token.
#[derive(Debug, Clone)]
struct AuthInterceptor {
    token: Option<Arc<str>>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let Some(expected) = &self.token else {
            return Ok(request);
        };
        match request.metadata().get(AUTH_TOKEN_HEADER) {
            Some(token) if token.as_bytes() == expected.as_bytes() => Ok(request),
            _ => Err(Status::unauthenticated("missing or invalid auth token")),
        }
    }
}

/// Server configuration and runner.
#[derive(Debug)]
pub struct ReplayServer {
    orchestrator: Orchestrator,
    auth_token: Option<Arc<str>>,
    idle_timeout: Option<Duration>,
}

impl ReplayServer {
    /// Create a server for `orchestrator` with no auth and no idle timeout.
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            auth_token: None,
            idle_timeout: None,
        }
    }

    /// Require every call to carry `token` in the `auth-token` metadata.
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(Arc::from(token.into()));
        self
    }

    /// Shut down after `timeout` without any client message. Zero disables.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Bind `127.0.0.1:<port>`; port 0 picks a free port.
    pub async fn bind(self, port: u16) -> std::io::Result<BoundServer> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(BoundServer {
            server: self,
            listener,
            local_addr,
        })
    }
}

/// A server with its listening socket open.
#[derive(Debug)]
pub struct BoundServer {
    server: ReplayServer,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundServer {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until Ctrl+C, SIGTERM, or the idle timeout.
    pub async fn serve(self) -> Result<(), tonic::transport::Error> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Run until `signal` completes or the idle timeout.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<(), tonic::transport::Error>
    where
        F: Future<Output = ()> + Send,
    {
        let ReplayServer {
            orchestrator,
            auth_token,
            idle_timeout,
        } = self.server;
        let service = ReplayService::new(orchestrator);
        let activity = service.activity.clone();

        let shutdown = async move {
            match idle_timeout {
                Some(timeout) => tokio::select! {
                    () = signal => {}
                    () = wait_idle(activity, timeout) => {}
                },
                None => signal.await,
            }
        };

        tracing::info!(addr = %self.local_addr, "starting gRPC server");

        tonic::transport::Server::builder()
            .add_service(proto::replayer_server::ReplayerServer::with_interceptor(
                service,
                AuthInterceptor { token: auth_token },
            ))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), shutdown)
            .await?;

        tracing::info!("gRPC server shut down");
        Ok(())
    }
}

async fn wait_idle(activity: Activity, timeout: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= timeout {
            tracing::info!(?timeout, "no client activity, initiating shutdown");
            return;
        }
        tokio::time::sleep(timeout - idle).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn with_token(token: Option<&str>) -> Request<()> {
        let mut request = Request::new(());
        if let Some(token) = token {
            request
                .metadata_mut()
                .insert(AUTH_TOKEN_HEADER, token.parse().unwrap());
        }
        request
    }

    #[test]
    fn test_auth_interceptor() {
        let mut open = AuthInterceptor { token: None };
        assert!(open.call(with_token(None)).is_ok());

        let mut guarded = AuthInterceptor {
            token: Some(Arc::from("secret")),
        };
        assert!(guarded.call(with_token(Some("secret"))).is_ok());
        let denied = guarded.call(with_token(Some("guess"))).unwrap_err();
        assert_eq!(denied.code(), tonic::Code::Unauthenticated);
        assert!(guarded.call(with_token(None)).is_err());
    }

    #[test]
    fn test_convert_request() {
        let replay = proto::ReplayRequest {
            req: Some(Req::Replay(proto::ReplayCommand {
                replay_id: "draw".into(),
                dependent_id: "lvl".into(),
            })),
        };
        assert_eq!(
            convert_request(replay),
            Some(ReplaySessionRequest::replay("draw", "lvl"))
        );
        assert_eq!(convert_request(proto::ReplayRequest { req: None }), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_resets_on_activity() {
        let activity = Activity::new();
        let timeout = Duration::from_secs(10);

        let waiter = tokio::spawn(wait_idle(activity.clone(), timeout));
        tokio::time::sleep(Duration::from_secs(6)).await;
        activity.touch();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!waiter.is_finished());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(waiter.is_finished());
    }
}
