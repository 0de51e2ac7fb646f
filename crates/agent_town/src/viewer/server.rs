use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;

use super::protocol::{ViewerRequest, ViewerResponse, ViewerStream, VIEWER_PROTOCOL_VERSION};
use crate::runtime::TickBroadcast;
use crate::simulator::{SpeechEntry, TimestampMs};

pub const DEFAULT_VIEWER_BIND_ADDR: &str = "127.0.0.1:5010";
const SERVER_NAME: &str = "agent_town";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerServerConfig {
    pub bind_addr: String,
    pub world_id: String,
}

impl Default for ViewerServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_VIEWER_BIND_ADDR.to_string(),
            world_id: "town".to_string(),
        }
    }
}

impl ViewerServerConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_world_id(mut self, world_id: impl Into<String>) -> Self {
        self.world_id = world_id.into();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewerServerError {
    #[error("viewer io: {0}")]
    Io(#[from] std::io::Error),
    #[error("viewer serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Pushes every tick broadcast to connected viewers as newline-delimited
/// JSON. A viewer that falls behind the channel skips the ticks it missed.
pub struct ViewerServer {
    config: ViewerServerConfig,
    listener: TcpListener,
    ticks: broadcast::Sender<Arc<TickBroadcast>>,
}

impl ViewerServer {
    pub async fn bind(
        config: ViewerServerConfig,
        ticks: broadcast::Sender<Arc<TickBroadcast>>,
    ) -> Result<Self, ViewerServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            config,
            listener,
            ticks,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ViewerServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts viewers until `shutdown` resolves, then drops every open
    /// connection.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ViewerServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        tracing::info!(addr = %self.local_addr()?, "viewer server listening");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(error = %err, "viewer accept failed");
                            continue;
                        }
                    };
                    let rx = self.ticks.subscribe();
                    let world_id = self.config.world_id.clone();
                    connections.spawn(async move {
                        tracing::info!(%peer, "viewer connected");
                        match serve_stream(stream, rx, &world_id).await {
                            Ok(()) => tracing::info!(%peer, "viewer disconnected"),
                            Err(err) => tracing::warn!(%peer, error = %err, "viewer connection failed"),
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        connections.abort_all();
        Ok(())
    }
}

async fn serve_stream(
    stream: TcpStream,
    ticks: broadcast::Receiver<Arc<TickBroadcast>>,
    world_id: &str,
) -> Result<(), ViewerServerError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut session = ViewerSession::new(BufWriter::new(writer), ticks);
    session.send(&hello_ack(world_id)).await?;

    loop {
        tokio::select! {
            received = session.ticks.recv() => match received {
                Ok(payload) => session.push(payload).await?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "viewer lagged behind tick broadcast");
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => session.handle_line(&line, world_id).await?,
                None => break,
            },
        }
    }
    Ok(())
}

struct ViewerSession<W> {
    writer: W,
    ticks: broadcast::Receiver<Arc<TickBroadcast>>,
    subscribed: HashSet<ViewerStream>,
    latest: Option<Arc<TickBroadcast>>,
}

impl<W: AsyncWrite + Unpin> ViewerSession<W> {
    fn new(writer: W, ticks: broadcast::Receiver<Arc<TickBroadcast>>) -> Self {
        Self {
            writer,
            ticks,
            subscribed: default_streams(),
            latest: None,
        }
    }

    async fn handle_line(&mut self, line: &str, world_id: &str) -> Result<(), ViewerServerError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        match serde_json::from_str::<ViewerRequest>(trimmed) {
            Ok(request) => self.handle_request(request, world_id).await,
            Err(err) => {
                self.send(&ViewerResponse::Error {
                    message: format!("invalid request: {err}"),
                })
                .await
            }
        }
    }

    async fn handle_request(
        &mut self,
        request: ViewerRequest,
        world_id: &str,
    ) -> Result<(), ViewerServerError> {
        match request {
            ViewerRequest::Hello { client, version } => {
                tracing::debug!(client = %client, version, "viewer hello");
                self.send(&hello_ack(world_id)).await
            }
            ViewerRequest::Subscribe { streams } => {
                self.subscribed = if streams.is_empty() {
                    default_streams()
                } else {
                    streams.into_iter().collect()
                };
                Ok(())
            }
            ViewerRequest::RequestLatest => match self.latest.clone() {
                Some(payload) => self.emit(&payload, None, true).await,
                None => {
                    self.send(&ViewerResponse::Error {
                        message: "no tick broadcast yet".to_string(),
                    })
                    .await
                }
            },
        }
    }

    async fn push(&mut self, payload: Arc<TickBroadcast>) -> Result<(), ViewerServerError> {
        let since = self.latest.as_ref().map(|previous| previous.timestamp);
        self.emit(&payload, since, false).await?;
        self.latest = Some(payload);
        Ok(())
    }

    /// Writes the subscribed views of one tick. Speech frames carry only the
    /// lines spoken after `since`, the previous tick's timestamp. Speech and
    /// event frames are skipped when empty, unless `force`.
    async fn emit(
        &mut self,
        payload: &TickBroadcast,
        since: Option<TimestampMs>,
        force: bool,
    ) -> Result<(), ViewerServerError> {
        if self.subscribed.contains(&ViewerStream::Ticks) {
            self.send(&ViewerResponse::Tick {
                payload: payload.clone(),
            })
            .await?;
        }
        if self.subscribed.contains(&ViewerStream::Speech) {
            let entries: Vec<SpeechEntry> = payload
                .recent_speech
                .iter()
                .filter(|entry| since.map_or(true, |since| entry.at > since))
                .cloned()
                .collect();
            if force || !entries.is_empty() {
                self.send(&ViewerResponse::Speech {
                    tick: payload.tick,
                    entries,
                })
                .await?;
            }
        }
        if self.subscribed.contains(&ViewerStream::Events)
            && (force || !payload.transitions.is_empty())
        {
            self.send(&ViewerResponse::Events {
                tick: payload.tick,
                transitions: payload.transitions.clone(),
            })
            .await?;
        }
        Ok(())
    }

    async fn send(&mut self, response: &ViewerResponse) -> Result<(), ViewerServerError> {
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn default_streams() -> HashSet<ViewerStream> {
    HashSet::from([ViewerStream::Ticks])
}

fn hello_ack(world_id: &str) -> ViewerResponse {
    ViewerResponse::HelloAck {
        server: SERVER_NAME.to_string(),
        version: VIEWER_PROTOCOL_VERSION,
        world_id: world_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::simulator::{AgentKind, TilePos, World, WorldGrid, WorldSettings};

    fn payload(tick_count: u64) -> Arc<TickBroadcast> {
        let grid = WorldGrid::from_ascii(&["...", "..."], 32).expect("grid");
        let mut world = World::new(WorldSettings::default(), grid, Collaborators::default());
        for _ in 0..tick_count {
            world.advance_tick();
        }
        Arc::new(TickBroadcast::collect(&world, 5_000, Vec::new(), 0, None))
    }

    async fn read_response<R>(lines: &mut tokio::io::Lines<R>) -> ViewerResponse
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let line = lines
            .next_line()
            .await
            .expect("read line")
            .expect("line before eof");
        serde_json::from_str(&line).expect("parse response")
    }

    #[tokio::test]
    async fn viewer_gets_hello_then_ticks() {
        let (tx, _) = broadcast::channel(8);
        let config = ViewerServerConfig::default()
            .with_bind_addr("127.0.0.1:0")
            .with_world_id("test-town");
        let server = ViewerServer::bind(config, tx.clone())
            .await
            .expect("bind");
        let addr = server.local_addr().expect("addr");
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        match read_response(&mut lines).await {
            ViewerResponse::HelloAck {
                world_id, version, ..
            } => {
                assert_eq!(world_id, "test-town");
                assert_eq!(version, VIEWER_PROTOCOL_VERSION);
            }
            other => panic!("expected hello_ack, got {other:?}"),
        }

        // The connection subscribes after hello_ack is written.
        while tx.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        tx.send(payload(3)).expect("broadcast");
        match read_response(&mut lines).await {
            ViewerResponse::Tick { payload } => assert_eq!(payload.tick, 3),
            other => panic!("expected tick, got {other:?}"),
        }

        writer
            .write_all(b"not json\n{\"type\":\"request_latest\"}\n")
            .await
            .expect("write requests");
        assert!(matches!(
            read_response(&mut lines).await,
            ViewerResponse::Error { .. }
        ));
        match read_response(&mut lines).await {
            ViewerResponse::Tick { payload } => assert_eq!(payload.tick, 3),
            other => panic!("expected latest tick, got {other:?}"),
        }

        let _ = stop_tx.send(());
        handle.await.expect("join").expect("server run");
    }

    #[tokio::test]
    async fn session_filters_by_subscription() {
        let (tx, rx) = broadcast::channel(4);
        drop(tx);
        let mut session = ViewerSession::new(Vec::<u8>::new(), rx);
        session
            .handle_request(
                ViewerRequest::Subscribe {
                    streams: vec![ViewerStream::Events],
                },
                "town",
            )
            .await
            .expect("subscribe");
        session.push(payload(1)).await.expect("push");
        assert!(session.writer.is_empty());

        session
            .handle_request(ViewerRequest::RequestLatest, "town")
            .await
            .expect("latest");
        let written = String::from_utf8(session.writer.clone()).expect("utf8");
        let response: ViewerResponse =
            serde_json::from_str(written.trim()).expect("parse events frame");
        assert_eq!(
            response,
            ViewerResponse::Events {
                tick: 1,
                transitions: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn speech_frames_carry_only_new_lines() {
        let (tx, rx) = broadcast::channel(4);
        drop(tx);
        let mut session = ViewerSession::new(Vec::<u8>::new(), rx);
        session
            .handle_request(
                ViewerRequest::Subscribe {
                    streams: vec![ViewerStream::Speech],
                },
                "town",
            )
            .await
            .expect("subscribe");

        let grid = WorldGrid::from_ascii(&["....", "...."], 32).expect("grid");
        let mut world = World::new(WorldSettings::default(), grid, Collaborators::default());
        world
            .spawn_agent("ada", "Ada", AgentKind::Npc, Some(TilePos::new(1, 1)), 0)
            .expect("spawn");
        let mut frames = Vec::new();
        let tick = |world: &mut World, now| {
            world.advance_tick();
            Arc::new(TickBroadcast::collect(world, now, Vec::new(), 0, None))
        };

        world.speak("ada", "first line", 4_000).expect("speak");
        for (now, line) in [(5_000, None), (5_100, None), (5_200, Some("second line"))] {
            if let Some(line) = line {
                world.speak("ada", line, now - 50).expect("speak");
            }
            session.push(tick(&mut world, now)).await.expect("push");
            let written = String::from_utf8(std::mem::take(&mut session.writer)).expect("utf8");
            frames.push(written);
        }

        let messages = |frame: &str| -> Vec<String> {
            match serde_json::from_str::<ViewerResponse>(frame.trim()).expect("speech frame") {
                ViewerResponse::Speech { entries, .. } => {
                    entries.into_iter().map(|entry| entry.message).collect()
                }
                other => panic!("expected speech frame, got {other:?}"),
            }
        };
        assert_eq!(messages(&frames[0]), vec!["first line"]);
        assert!(frames[1].is_empty(), "repeated lines were resent");
        assert_eq!(messages(&frames[2]), vec!["second line"]);
    }
}
