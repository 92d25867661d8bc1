//! Server network layer handling WebSocket connections

use crate::config::ServerConfig;
use crate::relay::{ConnectError, PlayerHandle, Relay};
use crate::session::origin_key;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{decode, encode, ClientEvent, PlayerId, ServerEvent};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Upper bound on flushing the closing handshake to a client
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive settings applied to every connection
#[derive(Debug, Clone, Copy)]
struct Keepalive {
    ping_interval: Duration,
    idle_timeout: Duration,
}

/// WebSocket front end of the relay
pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay>,
    keepalive: Keepalive,
    next_client_id: PlayerId,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            relay: Arc::new(Relay::new(&config)),
            keepalive: Keepalive {
                ping_interval: config.ping_interval,
                idle_timeout: config.idle_timeout,
            },
            next_client_id: 1,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Starts the round cycle and accepts connections until `shutdown`
    /// resolves. The scheduler is stopped before client queues are closed.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.relay.start();
        info!("Server started successfully");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.next_client_id;
                        self.next_client_id = self.next_client_id.wrapping_add(1);

                        let relay = Arc::clone(&self.relay);
                        let keepalive = self.keepalive;
                        tokio::spawn(async move {
                            handle_connection(stream, peer, id, relay, keepalive).await;
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        self.relay.shutdown();
    }
}

/// Runs one client from handshake to cleanup
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: PlayerId,
    relay: Arc<Relay>,
    keepalive: Keepalive,
) {
    let mut headers = HeaderMap::new();
    let capture_headers = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        headers = request.headers().clone();
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, capture_headers).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let origin = origin_key(&headers, peer);
    let (mut sink, source) = ws_stream.split();

    let (handle, outbound) = match relay.connect(id, origin) {
        Ok(admitted) => admitted,
        Err(ConnectError::AlreadyPlaying) => {
            reject(&mut sink).await;
            return;
        }
        Err(_) => {
            close(&mut sink).await;
            return;
        }
    };

    tokio::select! {
        _ = write_loop(&mut sink, outbound, keepalive.ping_interval) => {
            debug!("Client {} writer finished", id);
        }
        _ = read_loop(source, &handle, keepalive.idle_timeout) => {
            debug!("Client {} reader finished", id);
        }
    }

    // Cleanup must not wait on a client that stopped reading
    drop(handle);
    close(&mut sink).await;
}

/// Sends the close frame, giving up on clients that never drain their socket
async fn close(sink: &mut WsSink) {
    match timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Close failed: {}", e),
        Err(_) => debug!("Client did not accept close within {:?}", CLOSE_TIMEOUT),
    }
}

/// Tells a turned-away client why before closing its socket
async fn reject(sink: &mut WsSink) {
    match encode(&ServerEvent::AlreadyPlaying(true)) {
        Ok(text) => {
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("Failed to deliver rejection: {}", e);
            }
        }
        Err(e) => error!("Failed to encode rejection: {}", e),
    }
    close(sink).await;
}

/// Drains the client's queue onto its socket and keeps the link alive.
/// Ends when the queue is closed or a write fails.
async fn write_loop(
    sink: &mut WsSink,
    mut outbound: mpsc::Receiver<ServerEvent>,
    ping_interval: Duration,
) {
    let mut ping = interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ping.tick().await;

    loop {
        let message = tokio::select! {
            event = outbound.recv() => match event {
                Some(event) => match encode(&event) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        error!("Failed to encode event: {}", e);
                        continue;
                    }
                },
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        if let Err(e) = sink.send(message).await {
            debug!("Write failed: {}", e);
            break;
        }
    }
}

/// Feeds the client's movement reports into the relay
///
/// Ends on close, transport error or when the client stays silent longer
/// than `idle_timeout`. Malformed frames are logged and skipped.
async fn read_loop(mut source: WsSource, handle: &PlayerHandle, idle_timeout: Duration) {
    loop {
        let frame = match timeout(idle_timeout, source.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => {
                info!("Client {} timed out", handle.id());
                break;
            }
        };

        match frame {
            Ok(Message::Text(text)) => match decode::<ClientEvent>(&text) {
                Ok(ClientEvent::PlayerMovement(movement)) => handle.relay_movement(movement),
                Err(e) => warn!("Ignoring frame from client {}: {}", handle.id(), e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from client {} failed: {}", handle.id(), e);
                break;
            }
        }
    }
}
