//! The TCP server end to end, with clients on blocking threads

use dbzr_core::{Branch, ControlDir, InitializeOptions, LocalControlDir, LocalTransport, RepositoryFormat, Transport};
use dbzr_server::serve;
use dbzr_smart::open::connect;
use dbzr_smart::{RemoteControlDir, SmartServerHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start(dir: &TempDir, disabled: &[&str]) -> Running {
    let root: Arc<dyn Transport> = Arc::new(LocalTransport::new(dir.path()));
    let handler = Arc::new(SmartServerHandler::new(root).with_disabled_verbs(disabled.iter().copied()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(serve(listener, handler, async {
        let _ = stopped.await;
    }));
    Running { addr, stop, task }
}

/// Create `trunk` with a repository and an empty branch through `url`.
fn create_trunk(url: String) -> dbzr_core::Result<(u64, Vec<u8>)> {
    let (client, path) = connect(&url)?;
    let options = InitializeOptions {
        repository_format: Some(RepositoryFormat::default()),
        ..Default::default()
    };
    RemoteControlDir::initialize_ex(&client, &path, &options)?;
    let mut branch = RemoteControlDir::open(client, &path)?.create_branch()?;
    branch.last_revision_info()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_branch_over_tcp() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir, &[]).await;

    let url = format!("dbzr://{}/trunk", server.addr);
    let info = tokio::task::spawn_blocking(move || create_trunk(url)).await.unwrap().unwrap();
    assert_eq!(info, (0, b"null:".to_vec()));

    let local = LocalControlDir::open(Arc::new(LocalTransport::new(dir.path().join("trunk")))).unwrap();
    assert!(local.has_repository().unwrap());
    assert!(local.open_branch().is_ok());

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_old_server_emulation_over_tcp() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir, &["BzrDir.initialize_ex_1.16", "BzrDir.create_branch"]).await;

    let url = format!("dbzr://{}/trunk", server.addr);
    let info = tokio::task::spawn_blocking(move || create_trunk(url)).await.unwrap().unwrap();
    assert_eq!(info, (0, b"null:".to_vec()));
    let local = LocalControlDir::open(Arc::new(LocalTransport::new(dir.path().join("trunk")))).unwrap();
    assert!(local.has_repository().unwrap());

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_frame_drops_only_that_connection() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir, &[]).await;

    let mut bad = TcpStream::connect(server.addr).await.unwrap();
    bad.write_all(b"GARBAGE-HEADER!").await.unwrap();
    let mut buf = Vec::new();
    // The server hangs up without replying.
    let n = bad.read_to_end(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    let url = format!("dbzr://{}/trunk", server.addr);
    tokio::task::spawn_blocking(move || create_trunk(url)).await.unwrap().unwrap();

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}
