//! Unix domain socket server for IPC
//!
//! Provides request-response communication and pushes outbound coordinator
//! events to subscribed clients.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::OutboundEvent;
use crate::playback::{PlaybackSignal, PlaybackSource};
use crate::state::{ArbiterInput, Input};

use super::protocol::{DaemonStatus, Request, Response};

const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Distinct playback sources one connection may register
const MAX_SOURCES_PER_CLIENT: usize = 8;

/// Playback sources registered by one connection, by name
type ClientSources = HashMap<String, PlaybackSource>;

/// Channels connecting client connections to the coordinator
#[derive(Clone)]
pub struct ClientLinks {
    pub input_tx: mpsc::UnboundedSender<Input>,
    pub events: broadcast::Sender<OutboundEvent>,
    pub playback: PlaybackSignal,
}

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    links: ClientLinks,
}

/// Shared server state
struct ServerState {
    status: DaemonStatus,
    start_time: std::time::Instant,
}

impl Server {
    /// Create a new IPC server
    pub fn new(socket_path: &Path, links: ClientLinks) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path)
            .context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            status: DaemonStatus::default(),
            start_time: std::time::Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            state,
            shutdown_tx,
            links,
        })
    }

    /// Mirror an outbound event into the status snapshot
    pub async fn apply_event(&self, event: &OutboundEvent) {
        let mut server_state = self.state.write().await;
        match event {
            OutboundEvent::StateChanged { state, previous } => {
                server_state.status.state = *state;
                debug!(from = %previous, to = %state, "IPC server: state updated");
            }
            OutboundEvent::Listening { on } => server_state.status.listening = *on,
            OutboundEvent::Avatar { asset } => server_state.status.avatar = Some(asset.clone()),
            _ => {}
        }
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref()
            .context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let state = Arc::clone(&self.state);
                    let links = self.links.clone();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, state, links) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(
        stream: UnixStream,
        state: Arc<RwLock<ServerState>>,
        links: ClientLinks,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let mut forwarder = None;
        // Dropped with the connection
        let mut sources = ClientSources::new();

        let result = Self::serve(
            &mut reader,
            &writer,
            &state,
            &links,
            &mut sources,
            &mut forwarder,
        )
        .await;

        if let Some(handle) = forwarder {
            handle.abort();
        }
        result
    }

    async fn serve<R: AsyncRead + Unpin>(
        reader: &mut R,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        state: &Arc<RwLock<ServerState>>,
        links: &ClientLinks,
        sources: &mut ClientSources,
        forwarder: &mut Option<JoinHandle<()>>,
    ) -> Result<()> {
        loop {
            let Some(msg_buf) = read_message(reader).await? else {
                debug!("client disconnected");
                return Ok(());
            };

            let mut subscription = None;
            let response = match serde_json::from_slice::<Request>(&msg_buf) {
                Ok(request) => {
                    debug!(?request, "received request");
                    if matches!(request, Request::Subscribe) && forwarder.is_none() {
                        // Subscribe before answering so nothing published after
                        // the confirmation is missed
                        subscription = Some(links.events.subscribe());
                    }
                    Self::process_request(request, state, links, sources).await
                }
                Err(e) => {
                    warn!(?e, "malformed request");
                    Response::Error {
                        code: "bad_request".to_string(),
                        message: e.to_string(),
                    }
                }
            };

            {
                let mut writer = writer.lock().await;
                send_message(&mut *writer, &response).await?;
            }

            if let Some(events) = subscription {
                debug!("client subscribed to notifications");
                *forwarder = Some(forward_notifications(events, Arc::clone(writer)));
            }
        }
    }

    /// Process a request and return a response
    async fn process_request(
        request: Request,
        state: &Arc<RwLock<ServerState>>,
        links: &ClientLinks,
        sources: &mut ClientSources,
    ) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => {
                let mut state = state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                state.status.playback_active = links.playback.is_active();
                Response::Status(state.status.clone())
            }

            Request::Subscribe => Response::Subscribed,

            Request::Presence { present } => {
                Self::enqueue(links, Input::Signal(ArbiterInput::PresenceChanged(present)))
            }

            Request::Detection { face } => Self::enqueue(links, Input::Detection { face }),

            Request::SetMicDesire { enabled } => {
                info!(enabled, "mic desire changed via IPC");
                Self::enqueue(links, Input::Signal(ArbiterInput::MicDesireChanged(enabled)))
            }

            Request::SpeakRequest { text } => Self::enqueue(links, Input::SpeakRequest { text }),

            Request::Playback { source, report } => {
                if !sources.contains_key(&source) && sources.len() >= MAX_SOURCES_PER_CLIENT {
                    warn!(%source, "playback source limit reached");
                    return Response::Error {
                        code: "too_many_sources".to_string(),
                        message: format!(
                            "at most {MAX_SOURCES_PER_CLIENT} playback sources per connection"
                        ),
                    };
                }
                let playback = sources
                    .entry(source.clone())
                    .or_insert_with(|| links.playback.register(source));
                let edge = playback.report(report);
                debug!(source = playback.name(), ?edge, "playback report applied");
                Response::Accepted
            }

            Request::Recognition { session, event } => Self::enqueue(
                links,
                Input::Signal(ArbiterInput::Recognition { session, event }),
            ),
        }
    }

    fn enqueue(links: &ClientLinks, input: Input) -> Response {
        match links.input_tx.send(input) {
            Ok(()) => Response::Accepted,
            Err(_) => Response::Error {
                code: "unavailable".to_string(),
                message: "coordinator is not running".to_string(),
            },
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Push every outbound event to one subscribed client
fn forward_notifications(
    mut events: broadcast::Receiver<OutboundEvent>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let msg = Response::Notification { event };
                    let mut writer = writer.lock().await;
                    if let Err(e) = send_message(&mut *writer, &msg).await {
                        debug!(?e, "subscriber went away");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "subscriber lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Read one length-prefixed message; `None` on clean disconnect
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];

    // Read message length (4-byte little-endian)
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        anyhow::bail!("message of {len} bytes exceeds limit");
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await
        .context("connection closed mid-message")?;
    Ok(Some(msg_buf))
}

/// Send a length-prefixed JSON message
async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    let msg_len = (msg_bytes.len() as u32).to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;

    Ok(())
}
