//! Integration tests for replay sessions over gRPC.
//!
//! These tests play the client side: they answer resource requests from an
//! in-memory blob store and check what the server streams back.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Request, Streaming};

use reprise::resource::InMemoryResourceCache;
use reprise::{InterpretSummary, ManifestContext, MemoryArena, MemorySizeCandidates, Orchestrator};
use reprise_grpc::proto::{
    self, ClientMessage, ServerMessage, client_message::Msg as ClientMsg, replay_request::Req,
    replayer_client::ReplayerClient, resource_response, server_message::Msg as ServerMsg,
};
use reprise_grpc::{AUTH_TOKEN_HEADER, ReplayServer};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("reprise_grpc=debug,reprise=debug")
            .with_test_writer()
            .init();
    });
}

/// Macro to log messages in tests (visible with --nocapture)
macro_rules! test_log {
    ($($arg:tt)*) => {
        eprintln!("[TEST] {}", format!($($arg)*));
    };
}

/// Blobs the client can serve.
fn blobs() -> HashMap<String, Vec<u8>> {
    let mut blobs = HashMap::new();
    blobs.insert("lvlA".into(), br#"{"resources": ["texture"]}"#.to_vec());
    blobs.insert("lvlA_exit".into(), br#"{"resources": []}"#.to_vec());
    blobs.insert(
        "lvlA_draw".into(),
        br#"{"resources": ["texture", "mesh"]}"#.to_vec(),
    );
    blobs.insert("texture".into(), vec![7; 64]);
    blobs.insert("mesh".into(), vec![3; 16]);
    blobs
}

fn orchestrator() -> Orchestrator {
    let arena = MemoryArena::reserve(&MemorySizeCandidates::from_sizes([1 << 20])).unwrap();
    Orchestrator::builder(ManifestContext::new(arena))
        .cache(Arc::new(InMemoryResourceCache::new(1 << 20)))
        .build()
}

/// Start a server on a free port; dropping the sender shuts it down.
async fn start_test_server(
    configure: impl FnOnce(ReplayServer) -> ReplayServer,
) -> (SocketAddr, oneshot::Sender<()>) {
    init_tracing();
    let bound = configure(ReplayServer::new(orchestrator()))
        .bind(0)
        .await
        .unwrap();
    let addr = bound.local_addr();
    test_log!("Server bound to {}", addr);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let result = bound
            .serve_with_shutdown(async {
                let _ = stop_rx.await;
            })
            .await;
        test_log!("Server task ended: {:?}", result);
    });

    (addr, stop_tx)
}

async fn connect_client(addr: SocketAddr) -> ReplayerClient<Channel> {
    ReplayerClient::connect(format!("http://{}", addr))
        .await
        .unwrap()
}

fn replay(replay_id: &str, dependent_id: &str) -> ClientMessage {
    ClientMessage {
        msg: Some(ClientMsg::Request(proto::ReplayRequest {
            req: Some(Req::Replay(proto::ReplayCommand {
                replay_id: replay_id.into(),
                dependent_id: dependent_id.into(),
            })),
        })),
    }
}

fn prewarm(prerun_id: &str, cleanup_id: &str) -> ClientMessage {
    ClientMessage {
        msg: Some(ClientMsg::Request(proto::ReplayRequest {
            req: Some(Req::Prewarm(proto::PrewarmCommand {
                prerun_id: prerun_id.into(),
                cleanup_id: cleanup_id.into(),
            })),
        })),
    }
}

/// Everything the server sent during a session.
#[derive(Debug, Default)]
struct Transcript {
    requested: Vec<String>,
    finished: usize,
    primes: Vec<(String, String)>,
    postbacks: Vec<Vec<u8>>,
    crashes: Vec<String>,
}

/// Answer resource requests until `done` holds or the server stream ends.
async fn drive(
    server_stream: &mut Streaming<ServerMessage>,
    client_tx: &mpsc::Sender<ClientMessage>,
    blobs: &HashMap<String, Vec<u8>>,
    transcript: &mut Transcript,
    mut done: impl FnMut(&Transcript) -> bool,
) {
    let result = timeout(Duration::from_secs(10), async {
        while !done(transcript) {
            let Some(msg) = server_stream.next().await else {
                return;
            };
            match msg.unwrap().msg {
                Some(ServerMsg::ResourceRequest(req)) => {
                    test_log!("Resource request: {}", req.key);
                    transcript.requested.push(req.key.clone());
                    let result = match blobs.get(&req.key) {
                        Some(data) => resource_response::Result::Data(data.clone()),
                        None => resource_response::Result::Error(format!("no blob {}", req.key)),
                    };
                    client_tx
                        .send(ClientMessage {
                            msg: Some(ClientMsg::ResourceResponse(proto::ResourceResponse {
                                request_id: req.request_id,
                                result: Some(result),
                            })),
                        })
                        .await
                        .unwrap();
                }
                Some(ServerMsg::Finished(_)) => transcript.finished += 1,
                Some(ServerMsg::PrimeState(p)) => {
                    transcript.primes.push((p.prerun_id, p.cleanup_id));
                }
                Some(ServerMsg::Postback(p)) => transcript.postbacks.push(p.data),
                Some(ServerMsg::CrashReport(c)) => transcript.crashes.push(c.reason),
                None => {}
            }
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prewarm_then_replay_over_grpc() {
    let (addr, _stop) = start_test_server(|s| s).await;
    let mut client = connect_client(addr).await;
    let blobs = blobs();

    let (client_tx, client_rx) = mpsc::channel::<ClientMessage>(32);
    client_tx.send(prewarm("lvlA", "lvlA_exit")).await.unwrap();
    client_tx.send(replay("lvlA_draw", "lvlA")).await.unwrap();

    let mut server_stream = client
        .session(ReceiverStream::new(client_rx))
        .await
        .unwrap()
        .into_inner();

    let mut transcript = Transcript::default();
    drive(
        &mut server_stream,
        &client_tx,
        &blobs,
        &mut transcript,
        |t| t.finished == 1 && !t.primes.is_empty(),
    )
    .await;

    // Each blob crosses the wire once; the cache serves repeats.
    assert_eq!(
        transcript.requested,
        vec!["lvlA", "texture", "lvlA_draw", "mesh"]
    );
    assert_eq!(
        transcript.primes,
        vec![("lvlA".to_string(), "lvlA_exit".to_string())]
    );
    assert_eq!(transcript.postbacks.len(), 1);
    let summary: InterpretSummary = serde_json::from_slice(&transcript.postbacks[0]).unwrap();
    assert_eq!(summary.state_id, "lvlA_draw");
    assert_eq!(summary.resources, 2);
    assert_eq!(summary.bytes, 80);

    // Closing our side ends the session and the server stream.
    drop(client_tx);
    let (closer_tx, _closer_rx) = mpsc::channel(1);
    drive(&mut server_stream, &closer_tx, &blobs, &mut transcript, |_| false).await;
    assert!(transcript.crashes.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_replay_state_is_acknowledged() {
    let (addr, _stop) = start_test_server(|s| s).await;
    let mut client = connect_client(addr).await;
    let blobs = blobs();

    let (client_tx, client_rx) = mpsc::channel::<ClientMessage>(32);
    client_tx.send(replay("unknown", "")).await.unwrap();
    client_tx.send(replay("lvlA_exit", "")).await.unwrap();

    let mut server_stream = client
        .session(ReceiverStream::new(client_rx))
        .await
        .unwrap()
        .into_inner();

    let mut transcript = Transcript::default();
    drive(
        &mut server_stream,
        &client_tx,
        &blobs,
        &mut transcript,
        |t| t.finished == 2,
    )
    .await;

    // The missing state still gets its Finished, so the client never stalls.
    assert_eq!(transcript.finished, 2);
    assert_eq!(transcript.requested, vec!["unknown", "lvlA_exit"]);
    assert_eq!(transcript.postbacks.len(), 1);
    assert!(transcript.crashes.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auth_token_required() {
    let (addr, _stop) = start_test_server(|s| s.auth_token("secret")).await;
    let mut client = connect_client(addr).await;

    let (_tx, rx) = mpsc::channel::<ClientMessage>(1);
    let status = client
        .session(ReceiverStream::new(rx))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auth_token_accepted() {
    let (addr, _stop) = start_test_server(|s| s.auth_token("secret")).await;
    let mut client = connect_client(addr).await;
    let blobs = blobs();

    let (client_tx, client_rx) = mpsc::channel::<ClientMessage>(8);
    client_tx.send(replay("lvlA_exit", "")).await.unwrap();

    let mut request = Request::new(ReceiverStream::new(client_rx));
    request
        .metadata_mut()
        .insert(AUTH_TOKEN_HEADER, "secret".parse().unwrap());
    let mut server_stream = client.session(request).await.unwrap().into_inner();

    let mut transcript = Transcript::default();
    drive(
        &mut server_stream,
        &client_tx,
        &blobs,
        &mut transcript,
        |t| t.finished == 1,
    )
    .await;
    assert_eq!(transcript.finished, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_timeout_shuts_down_server() {
    init_tracing();
    let bound = ReplayServer::new(orchestrator())
        .idle_timeout(Duration::from_millis(200))
        .bind(0)
        .await
        .unwrap();

    let served = timeout(
        Duration::from_secs(5),
        bound.serve_with_shutdown(std::future::pending()),
    )
    .await;
    assert!(served.is_ok(), "server did not stop when idle");
    served.unwrap().unwrap();
}
