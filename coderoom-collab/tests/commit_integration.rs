//! Integration tests for repository linking and commits.
//!
//! Most tests use an in-process [`VcsRemote`]; the `git` tests run the real
//! command line against a local bare repository and are skipped when `git`
//! is not installed.

use async_trait::async_trait;
use coderoom_collab::protocol::{ClientMessage, ServerMessage};
use coderoom_collab::room::{VcsConfig, SEED_FILE_ID};
use coderoom_collab::vcs::{CommitOutcome, VcsError, VcsRemote};
use coderoom_collab::{CollabServer, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Remote that records what it was asked to publish.
#[derive(Default)]
struct RecordingRemote {
    fail_with: Option<String>,
    delay: Duration,
    seen: Mutex<Vec<(VcsConfig, String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl VcsRemote for RecordingRemote {
    async fn commit_and_push(
        &self,
        dir: &Path,
        message: &str,
        config: &VcsConfig,
    ) -> Result<CommitOutcome, VcsError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let index = std::fs::read_to_string(dir.join("index.html")).unwrap_or_default();
        let n = {
            let mut seen = self.seen.lock().unwrap();
            seen.push((config.clone(), message.to_string(), index));
            seen.len()
        };

        match &self.fail_with {
            Some(stderr) => Err(VcsError::Command { step: "push", stderr: stderr.clone() }),
            None => Ok(CommitOutcome {
                short_hash: format!("abc{n:04}"),
                author_name: "Room Bot".into(),
            }),
        }
    }
}

struct TestServer {
    url: String,
    sessions: tempfile::TempDir,
}

async fn start_server(config: ServerConfig, vcs: Option<Arc<dyn VcsRemote>>) -> TestServer {
    let sessions = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        sessions_root: sessions.path().to_path_buf(),
        ..config
    };
    let server = match vcs {
        Some(vcs) => CollabServer::with_vcs(config, vcs),
        None => CollabServer::new(config),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    TestServer { url, sessions }
}

async fn start_with_remote(remote: Arc<RecordingRemote>) -> TestServer {
    start_server(ServerConfig::default(), Some(remote as Arc<dyn VcsRemote>)).await
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::text(msg.encode().unwrap())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    recv_within(ws, Duration::from_secs(2)).await
}

async fn recv_within(ws: &mut Ws, limit: Duration) -> ServerMessage {
    loop {
        let frame = timeout(limit, ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let next = timeout(Duration::from_millis(150), ws.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

async fn joined(url: &str, room: &str, user: &str, name: &str) -> Ws {
    let mut ws = tokio_tungstenite::connect_async(url).await.unwrap().0;
    send(
        &mut ws,
        &ClientMessage::JoinRoom { room_id: room.into(), user_id: user.into(), username: name.into() },
    )
    .await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::RoomState { .. }));
    ws
}

/// Alice and Bob in room `R`, linked to `octo/site`, all notifications drained.
async fn linked_pair(url: &str, token: Option<&str>) -> (Ws, Ws) {
    let mut alice = joined(url, "R", "u1", "Alice").await;
    let mut bob = joined(url, "R", "u2", "Bob").await;
    recv(&mut alice).await; // user-joined

    send(
        &mut alice,
        &ClientMessage::GithubConnect {
            token: token.map(String::from),
            repo_full_name: "octo/site".into(),
            branch: None,
        },
    )
    .await;
    for ws in [&mut alice, &mut bob] {
        assert_eq!(
            recv(ws).await,
            ServerMessage::GithubConnected { repo_full_name: "octo/site".into(), branch: "main".into() }
        );
    }
    (alice, bob)
}

#[tokio::test]
async fn test_commit_success_reaches_whole_room() {
    let remote = Arc::new(RecordingRemote::default());
    let ts = start_with_remote(remote.clone()).await;
    let (mut alice, mut bob) = linked_pair(&ts.url, Some("ghp_secret")).await;

    send(
        &mut bob,
        &ClientMessage::CodeChange { file_id: SEED_FILE_ID, code: "<p>shipped</p>".into(), user_id: None },
    )
    .await;
    recv(&mut alice).await; // code-update

    send(&mut alice, &ClientMessage::GithubCommit { commit_message: "Initial commit".into() }).await;
    let expected = ServerMessage::CommitSuccess {
        commit_message: "Initial commit".into(),
        commit_hash: "abc0001".into(),
        author: "Room Bot".into(),
    };
    assert_eq!(recv(&mut alice).await, expected);
    assert_eq!(recv(&mut bob).await, expected);

    let seen = remote.seen.lock().unwrap();
    let (config, message, index) = &seen[0];
    assert_eq!(config.credential_token.as_deref(), Some("ghp_secret"));
    assert_eq!(config.branch, "main");
    assert_eq!(message, "Initial commit");
    assert_eq!(index, "<p>shipped</p>");

    // The snapshot stays on disk under the room id.
    let on_disk = std::fs::read_to_string(ts.sessions.path().join("R").join("index.html")).unwrap();
    assert_eq!(on_disk, "<p>shipped</p>");
}

#[tokio::test]
async fn test_default_token_fills_missing_one() {
    let remote = Arc::new(RecordingRemote::default());
    let config = ServerConfig {
        github_token: Some("server-token".into()),
        ..ServerConfig::default()
    };
    let ts = start_server(config, Some(remote.clone() as Arc<dyn VcsRemote>)).await;
    let (mut alice, _bob) = linked_pair(&ts.url, None).await;

    send(&mut alice, &ClientMessage::GithubCommit { commit_message: "m".into() }).await;
    assert!(matches!(recv(&mut alice).await, ServerMessage::CommitSuccess { .. }));
    let seen = remote.seen.lock().unwrap();
    assert_eq!(seen[0].0.credential_token.as_deref(), Some("server-token"));
}

#[tokio::test]
async fn test_commit_failure_goes_to_requester_only() {
    let remote = Arc::new(RecordingRemote {
        fail_with: Some("remote rejected".into()),
        ..RecordingRemote::default()
    });
    let ts = start_with_remote(remote).await;
    let (mut alice, mut bob) = linked_pair(&ts.url, Some("t")).await;

    send(&mut alice, &ClientMessage::GithubCommit { commit_message: "m".into() }).await;
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::CommitError { error: "git push failed: remote rejected".into() }
    );
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_second_commit_waits_for_first() {
    let remote = Arc::new(RecordingRemote {
        delay: Duration::from_millis(100),
        ..RecordingRemote::default()
    });
    let ts = start_with_remote(remote.clone()).await;
    let (mut alice, _bob) = linked_pair(&ts.url, Some("t")).await;

    send(&mut alice, &ClientMessage::GithubCommit { commit_message: "first".into() }).await;
    send(&mut alice, &ClientMessage::GithubCommit { commit_message: "second".into() }).await;

    let mut messages = Vec::new();
    for _ in 0..2 {
        match recv(&mut alice).await {
            ServerMessage::CommitSuccess { commit_message, .. } => messages.push(commit_message),
            other => panic!("Expected CommitSuccess, got {other:?}"),
        }
    }
    messages.sort();
    assert_eq!(messages, vec!["first", "second"]);
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_late_joiner_sees_link_state() {
    let ts = start_with_remote(Arc::new(RecordingRemote::default())).await;
    let (_alice, _bob) = linked_pair(&ts.url, Some("t")).await;

    let mut carol = tokio_tungstenite::connect_async(&ts.url).await.unwrap().0;
    send(
        &mut carol,
        &ClientMessage::JoinRoom { room_id: "r".into(), user_id: "u3".into(), username: "Carol".into() },
    )
    .await;
    match recv(&mut carol).await {
        ServerMessage::RoomState { github_connected, .. } => assert!(github_connected),
        other => panic!("Expected RoomState, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_repository_is_ignored() {
    let remote = Arc::new(RecordingRemote::default());
    let ts = start_with_remote(remote.clone()).await;
    let mut alice = joined(&ts.url, "R", "u1", "Alice").await;

    send(
        &mut alice,
        &ClientMessage::GithubConnect { token: None, repo_full_name: "no-slash".into(), branch: None },
    )
    .await;
    send(&mut alice, &ClientMessage::GithubCommit { commit_message: "m".into() }).await;
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::CommitError { error: "GitHub not configured for this room".into() }
    );
    assert!(remote.seen.lock().unwrap().is_empty());
}

// ── Real git ────────────────────────────────────────────────────

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(output.status.success(), "git {args:?} failed: {output:?}");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn git_config(host: String) -> ServerConfig {
    ServerConfig {
        github_host: host,
        commit_author_name: Some("Room Bot".into()),
        commit_author_email: Some("bot@example.com".into()),
        commit_timeout_secs: 30,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn test_git_commit_lands_in_remote() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let remotes = tempfile::tempdir().unwrap();
    let bare = remotes.path().join("octo").join("site.git");
    std::fs::create_dir_all(&bare).unwrap();
    run_git(&bare, &["init", "--bare"]);

    let ts = start_server(git_config(format!("file://{}", remotes.path().display())), None).await;
    let (mut alice, mut bob) = linked_pair(&ts.url, Some("ghp_secret")).await;

    send(&mut bob, &ClientMessage::FileCreate { file_name: "style.css".into() }).await;
    recv(&mut alice).await;
    recv(&mut bob).await;
    send(
        &mut alice,
        &ClientMessage::CodeChange { file_id: SEED_FILE_ID, code: "<h1>From the room</h1>".into(), user_id: None },
    )
    .await;
    recv(&mut bob).await; // code-update

    send(&mut alice, &ClientMessage::GithubCommit { commit_message: "Room snapshot".into() }).await;
    match recv_within(&mut alice, Duration::from_secs(20)).await {
        ServerMessage::CommitSuccess { commit_message, commit_hash, author } => {
            assert_eq!(commit_message, "Room snapshot");
            assert_eq!(commit_hash.len(), 7);
            assert_eq!(author, "Room Bot");
        }
        other => panic!("Expected CommitSuccess, got {other:?}"),
    }
    assert!(matches!(recv(&mut bob).await, ServerMessage::CommitSuccess { .. }));

    assert_eq!(run_git(&bare, &["show", "main:index.html"]), "<h1>From the room</h1>");
    assert_eq!(run_git(&bare, &["show", "main:style.css"]), "");
}

#[tokio::test]
async fn test_git_failure_never_leaks_token() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    // Nothing listens on port 1, so the push fails fast.
    let ts = start_server(git_config("127.0.0.1:1".into()), None).await;
    let (mut alice, mut bob) = linked_pair(&ts.url, Some("ghp_secret")).await;

    send(&mut alice, &ClientMessage::GithubCommit { commit_message: "m".into() }).await;
    match recv_within(&mut alice, Duration::from_secs(30)).await {
        ServerMessage::CommitError { error } => {
            assert!(!error.contains("ghp_secret"), "token leaked: {error}");
        }
        other => panic!("Expected CommitError, got {other:?}"),
    }
    assert_silent(&mut bob).await;
}
