//! Headless client for poking a running relay by hand.
//!
//! Connects, logs every event the server pushes, walks in a small circle for
//! a number of steps and then leaves. Run several with different
//! `--forwarded-for` values to simulate players from distinct origins.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use shared::{decode, encode, ClientEvent, Movement, ServerEvent};
use std::time::Duration;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URL to connect to
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:3000")]
    server: String,

    /// Pretend to sit behind a proxy forwarding for this address
    #[arg(short = 'f', long)]
    forwarded_for: Option<String>,

    /// Number of movement updates to send before leaving
    #[arg(short = 'm', long, default_value = "20")]
    moves: u32,

    /// Milliseconds between movement updates
    #[arg(short = 'i', long, default_value = "250")]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut request = args.server.as_str().into_client_request()?;
    if let Some(address) = &args.forwarded_for {
        request
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_str(address)?);
    }

    info!("Connecting to: {}", args.server);
    let (ws_stream, _) = connect_async(request).await?;
    let (mut sink, mut source) = ws_stream.split();

    let mut ticker = interval(Duration::from_millis(args.interval_ms));
    let mut sent = 0u32;

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode::<ServerEvent>(&text) {
                    Ok(ServerEvent::AlreadyPlaying(_)) => {
                        warn!("Server says this origin is already playing");
                        break;
                    }
                    Ok(ServerEvent::PhaseChange(phase)) => {
                        let remaining = phase.remaining_at(shared::timestamp_millis());
                        info!("Phase {} ({}s left)", phase.name, remaining / 1000);
                    }
                    Ok(event) => info!("Received: {:?}", event),
                    Err(e) => warn!("Unreadable frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Server closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection error: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                if sent == args.moves {
                    info!("Test client finished");
                    break;
                }
                let movement = step(sent);
                info!("Sending movement: {:?}", movement);
                sink.send(Message::Text(encode(&ClientEvent::PlayerMovement(movement))?)).await?;
                sent += 1;
            }
        }
    }

    let _ = sink.close().await;
    Ok(())
}

/// Position and facing for step `n` of a walk around a circle
fn step(n: u32) -> Movement {
    let angle = n as f64 / 5.0;
    let (dx, dy) = (-angle.sin(), angle.cos());
    let animation = if dx.abs() > dy.abs() {
        if dx < 0.0 { "left" } else { "right" }
    } else if dy < 0.0 {
        "up"
    } else {
        "down"
    };

    Movement {
        x: 200.0 + 100.0 * angle.cos(),
        y: 200.0 + 100.0 * angle.sin(),
        animation_state: Some(animation.to_string()),
    }
}
