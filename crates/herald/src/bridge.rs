// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subprocess client engine.
//!
//! One helper process is spawned per session with
//! `<command> <args..> --session-id <id> --auth-dir <dir>`. The two sides
//! exchange newline-delimited JSON over stdio: Herald writes
//! [`BridgeCommand`]s carrying a `request_id`, the helper writes
//! [`BridgeFrame`]s, either engine events or `response` frames answering a
//! command. stderr is inherited so helper logs land next to ours.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use herald_config::model::BridgeConfig;
use herald_core::{
    ChatSummary, ClientEngine, ConnectionState, ContactInfo, EngineEvent, EngineEventSender,
    EngineFactory, HeraldError, InboundMessage, MediaAttachment, SessionId,
};
use herald_session::DiskIdentityStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Disconnect reason reported when the helper exits on its own.
pub const BRIDGE_EXITED_REASON: &str = "BRIDGE_EXITED";

const DESTROY_GRACE: Duration = Duration::from_secs(5);

/// Commands written to the helper's stdin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    Initialize {
        request_id: String,
    },
    GetState {
        request_id: String,
    },
    GetChats {
        request_id: String,
    },
    GetContact {
        request_id: String,
        contact_id: String,
    },
    DownloadMedia {
        request_id: String,
        message_id: String,
        chat_id: String,
    },
    Destroy {
        request_id: String,
    },
}

impl BridgeCommand {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Initialize { request_id }
            | Self::GetState { request_id }
            | Self::GetChats { request_id }
            | Self::GetContact { request_id, .. }
            | Self::DownloadMedia { request_id, .. }
            | Self::Destroy { request_id } => request_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::GetState { .. } => "get_state",
            Self::GetChats { .. } => "get_chats",
            Self::GetContact { .. } => "get_contact",
            Self::DownloadMedia { .. } => "download_media",
            Self::Destroy { .. } => "destroy",
        }
    }
}

/// Frames read from the helper's stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    Qr {
        qr: String,
    },
    Authenticated,
    Ready,
    ChangeState {
        state: ConnectionState,
    },
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        reason: String,
    },
    Error {
        message: String,
    },
    Message {
        message: InboundMessage,
    },
    Response(BridgeResponse),
}

impl BridgeFrame {
    /// The engine event carried by this frame; `None` for responses.
    pub fn into_event(self) -> Option<EngineEvent> {
        Some(match self {
            Self::Qr { qr } => EngineEvent::Qr(qr),
            Self::Authenticated => EngineEvent::Authenticated,
            Self::Ready => EngineEvent::Ready,
            Self::ChangeState { state } => EngineEvent::ChangeState(state),
            Self::AuthFailure { message } => EngineEvent::AuthFailure(message),
            Self::Disconnected { reason } => EngineEvent::Disconnected(reason),
            Self::Error { message } => EngineEvent::Error(message),
            Self::Message { message } => EngineEvent::Message(message),
            Self::Response(_) => return None,
        })
    }
}

/// Answer to one [`BridgeCommand`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeResponse {
    pub request_id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl BridgeResponse {
    fn into_result(self) -> Result<serde_json::Value, HeraldError> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(HeraldError::engine(
                self.error
                    .unwrap_or_else(|| "bridge reported failure".to_string()),
                None,
            ))
        }
    }
}

type PendingMap = DashMap<String, oneshot::Sender<BridgeResponse>>;

/// A [`ClientEngine`] backed by a helper process.
pub struct BridgeEngine {
    session_id: SessionId,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: Arc<PendingMap>,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    request_timeout: Duration,
}

impl BridgeEngine {
    /// Takes ownership of a spawned helper and starts reading its frames.
    pub fn attach(
        session_id: SessionId,
        mut child: Child,
        events: EngineEventSender,
        request_timeout: Duration,
    ) -> Result<Self, HeraldError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HeraldError::Internal("bridge stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HeraldError::Internal("bridge stdout is not piped".to_string()))?;

        let pending = Arc::new(PendingMap::new());
        let closing = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_frames(
            session_id.clone(),
            stdout,
            events,
            Arc::clone(&pending),
            Arc::clone(&closing),
        ));

        Ok(Self {
            session_id,
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            closing,
            reader,
            request_timeout,
        })
    }

    fn next_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    async fn write(&self, command: &BridgeCommand) -> Result<(), HeraldError> {
        let mut line = serde_json::to_string(command)
            .map_err(|e| HeraldError::Internal(format!("failed to encode bridge command: {e}")))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HeraldError::engine("failed to write to bridge", Some(Box::new(e))))?;
        stdin
            .flush()
            .await
            .map_err(|e| HeraldError::engine("failed to flush bridge stdin", Some(Box::new(e))))
    }

    /// Sends `command` and waits for its response, bounded by `timeout` when given.
    async fn request(
        &self,
        command: BridgeCommand,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, HeraldError> {
        let request_id = command.request_id().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        if let Err(e) = self.write(&command).await {
            self.pending.remove(&request_id);
            return Err(e);
        }
        debug!(
            session_id = %self.session_id,
            command = command.name(),
            request_id = %request_id,
            "bridge command sent"
        );

        let response = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.remove(&request_id);
                    return Err(HeraldError::Timeout { duration });
                }
            },
            None => rx.await,
        };

        match response {
            Ok(response) => response.into_result(),
            Err(_) => Err(HeraldError::engine(
                format!("bridge exited before answering {}", command.name()),
                None,
            )),
        }
    }

    async fn query<T: DeserializeOwned>(&self, command: BridgeCommand) -> Result<T, HeraldError> {
        let name = command.name();
        let value = self.request(command, Some(self.request_timeout)).await?;
        serde_json::from_value(value).map_err(|e| {
            HeraldError::engine(
                format!("malformed {name} result from bridge: {e}"),
                Some(Box::new(e)),
            )
        })
    }
}

#[async_trait]
impl ClientEngine for BridgeEngine {
    async fn initialize(&self) -> Result<(), HeraldError> {
        // The session bounds the whole bind, so no per-request timeout here.
        self.request(
            BridgeCommand::Initialize {
                request_id: Self::next_request_id(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn state(&self) -> Result<ConnectionState, HeraldError> {
        self.query(BridgeCommand::GetState {
            request_id: Self::next_request_id(),
        })
        .await
    }

    async fn chats(&self) -> Result<Vec<ChatSummary>, HeraldError> {
        self.query(BridgeCommand::GetChats {
            request_id: Self::next_request_id(),
        })
        .await
    }

    async fn contact(&self, contact_id: &str) -> Result<Option<ContactInfo>, HeraldError> {
        self.query(BridgeCommand::GetContact {
            request_id: Self::next_request_id(),
            contact_id: contact_id.to_string(),
        })
        .await
    }

    async fn download_media(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<MediaAttachment>, HeraldError> {
        if !message.has_media {
            return Ok(None);
        }
        self.query(BridgeCommand::DownloadMedia {
            request_id: Self::next_request_id(),
            message_id: message.id.clone(),
            chat_id: message.chat_id.clone(),
        })
        .await
    }

    async fn destroy(&self) -> Result<(), HeraldError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let goodbye = self
            .request(
                BridgeCommand::Destroy {
                    request_id: Self::next_request_id(),
                },
                Some(DESTROY_GRACE.min(self.request_timeout)),
            )
            .await;
        if let Err(e) = goodbye {
            debug!(session_id = %self.session_id, error = %e, "bridge did not acknowledge destroy");
        }

        let child = self.child.lock().await.take();
        let result = match child {
            Some(mut child) => match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(session_id = %self.session_id, %status, "bridge already exited");
                    Ok(())
                }
                _ => child.kill().await.map_err(|e| {
                    HeraldError::engine("failed to kill bridge process", Some(Box::new(e)))
                }),
            },
            None => Ok(()),
        };

        self.reader.abort();
        self.pending.clear();
        info!(session_id = %self.session_id, "bridge released");
        result
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Routes helper output: responses to their waiters, everything else to the session.
async fn read_frames(
    session_id: SessionId,
    stdout: ChildStdout,
    events: EngineEventSender,
    pending: Arc<PendingMap>,
    closing: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match serde_json::from_str::<BridgeFrame>(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "unparseable bridge frame");
                        continue;
                    }
                };
                match frame {
                    BridgeFrame::Response(response) => {
                        match pending.remove(&response.request_id) {
                            Some((_, waiter)) => {
                                let _ = waiter.send(response);
                            }
                            None => {
                                debug!(
                                    session_id = %session_id,
                                    request_id = %response.request_id,
                                    "response for unknown or expired request"
                                );
                            }
                        }
                    }
                    other => {
                        if let Some(event) = other.into_event() {
                            if events.send(event).is_err() {
                                debug!(session_id = %session_id, "event receiver gone, stopping bridge reader");
                                break;
                            }
                        }
                    }
                }
            }
            Ok(None) => {
                // Dropping the waiters fails every in-flight request.
                pending.clear();
                if !closing.load(Ordering::SeqCst) {
                    warn!(session_id = %session_id, "bridge process exited");
                    let _ = events.send(EngineEvent::Disconnected(BRIDGE_EXITED_REASON.to_string()));
                }
                break;
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "error reading bridge stdout");
                pending.clear();
                if !closing.load(Ordering::SeqCst) {
                    let _ = events.send(EngineEvent::Disconnected(BRIDGE_EXITED_REASON.to_string()));
                }
                break;
            }
        }
    }
}

/// Spawns one [`BridgeEngine`] per session from `[engine.bridge]`.
pub struct BridgeEngineFactory {
    config: BridgeConfig,
    identities: DiskIdentityStore,
}

impl BridgeEngineFactory {
    pub fn new(config: BridgeConfig, identities: DiskIdentityStore) -> Self {
        Self { config, identities }
    }

    fn command(&self, session_id: &SessionId) -> Result<Command, HeraldError> {
        let program = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| HeraldError::Config("engine.bridge.command is not set".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.config.args)
            .arg("--session-id")
            .arg(session_id.as_str())
            .arg("--auth-dir")
            .arg(self.identities.session_dir(session_id))
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // The helper must not outlive us.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        Ok(cmd)
    }
}

#[async_trait]
impl EngineFactory for BridgeEngineFactory {
    async fn create(
        &self,
        session_id: &SessionId,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ClientEngine>, HeraldError> {
        let session_dir = self.identities.session_dir(session_id);
        tokio::fs::create_dir_all(&session_dir).await.map_err(|e| {
            HeraldError::engine(
                format!("failed to create credential dir {}", session_dir.display()),
                Some(Box::new(e)),
            )
        })?;

        let child = self.command(session_id)?.spawn().map_err(|e| {
            HeraldError::engine("failed to spawn bridge process", Some(Box::new(e)))
        })?;
        info!(
            session_id = %session_id,
            pid = child.id(),
            "bridge process spawned"
        );

        let engine = BridgeEngine::attach(
            session_id.clone(),
            child,
            events,
            self.config.request_timeout(),
        )?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    #[test]
    fn commands_serialize_with_type_tag() {
        let json = serde_json::to_value(BridgeCommand::GetContact {
            request_id: "r1".into(),
            contact_id: "111@c.us".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "get_contact", "request_id": "r1", "contact_id": "111@c.us"})
        );

        let json = serde_json::to_string(&BridgeCommand::Initialize {
            request_id: "r2".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"initialize","request_id":"r2"}"#);
    }

    #[test]
    fn event_frames_map_to_engine_events() {
        let cases = [
            (r#"{"type":"qr","qr":"2@abc"}"#, EngineEvent::Qr("2@abc".into())),
            (r#"{"type":"authenticated"}"#, EngineEvent::Authenticated),
            (r#"{"type":"ready"}"#, EngineEvent::Ready),
            (
                r#"{"type":"change_state","state":"CONFLICT"}"#,
                EngineEvent::ChangeState(ConnectionState::Conflict),
            ),
            (
                r#"{"type":"disconnected","reason":"NAVIGATION"}"#,
                EngineEvent::Disconnected("NAVIGATION".into()),
            ),
            (r#"{"type":"auth_failure"}"#, EngineEvent::AuthFailure(String::new())),
        ];
        for (raw, expected) in cases {
            let frame: BridgeFrame = serde_json::from_str(raw).unwrap();
            assert_eq!(frame.into_event(), Some(expected), "{raw}");
        }
    }

    #[test]
    fn message_frame_carries_inbound_message() {
        let raw = r#"{"type":"message","message":{"id":"m1","chat_id":"c1","sender_id":"u1","body":"hi","timestamp":"2026-01-01T00:00:00Z"}}"#;
        let frame: BridgeFrame = serde_json::from_str(raw).unwrap();
        match frame.into_event() {
            Some(EngineEvent::Message(message)) => {
                assert_eq!(message.id, "m1");
                assert_eq!(message.body, "hi");
                assert!(!message.is_group);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn response_frames_are_not_events() {
        let frame: BridgeFrame =
            serde_json::from_str(r#"{"type":"response","request_id":"r1","ok":true,"result":"CONNECTED"}"#)
                .unwrap();
        let BridgeFrame::Response(response) = frame.clone() else {
            panic!("expected response frame");
        };
        assert_eq!(response.request_id, "r1");
        assert!(frame.into_event().is_none());

        let value = response.into_result().unwrap();
        let state: ConnectionState = serde_json::from_value(value).unwrap();
        assert_eq!(state, ConnectionState::Connected);
    }

    #[test]
    fn failed_response_is_an_engine_error() {
        let response = BridgeResponse {
            request_id: "r1".into(),
            ok: false,
            result: serde_json::Value::Null,
            error: Some("not paired".into()),
        };
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), herald_core::ErrorKind::Engine);
        assert!(err.to_string().contains("not paired"));
    }

    #[tokio::test]
    async fn factory_without_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BridgeEngineFactory::new(
            BridgeConfig::default(),
            DiskIdentityStore::new(dir.path()),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = factory
            .create(&SessionId::parse("s1").unwrap(), tx)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), herald_core::ErrorKind::Config);
    }

    /// A helper that acknowledges `initialize`, emits a QR, then exits on the next command.
    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_helper_round_trip() {
        let script = r#"read line
id=$(printf '%s' "$line" | sed 's/.*"request_id":"\([^"]*\)".*/\1/')
printf '{"type":"response","request_id":"%s","ok":true}\n' "$id"
printf '{"type":"qr","qr":"2@abc"}\n'
read rest
"#;
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            command: Some("sh".into()),
            args: vec!["-c".into(), script.into(), "bridge".into()],
            env: BTreeMap::new(),
            request_timeout_secs: 5,
        };
        let factory = BridgeEngineFactory::new(config, DiskIdentityStore::new(dir.path()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SessionId::parse("s1").unwrap();

        let engine = factory.create(&id, tx).await.unwrap();
        assert!(dir.path().join("session-s1").is_dir());

        tokio::time::timeout(Duration::from_secs(5), engine.initialize())
            .await
            .unwrap()
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(EngineEvent::Qr("2@abc".into())));

        tokio::time::timeout(Duration::from_secs(10), engine.destroy())
            .await
            .unwrap()
            .unwrap();
        engine.destroy().await.unwrap();
    }
}
