//! Reads `$$HAR` tracker sentences (from a file or stdin, e.g. a serial port
//! piped through `cat`) and forwards each one as a telemetry wire message to
//! the relay.

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::SinkExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message};

use lib_groundstation::ingestors::har::{HarError, HarSentence};
use lib_groundstation::loggers;

type Relay = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser, Debug)]
#[clap(about = "Forwards HAR tracker sentences to the telemetry relay", version)]
struct Args {
    #[clap(long, env = "HAR_BROKER_URL", default_value = "ws://localhost:8080", help = "Relay WebSocket URL.")]
    url: String,

    #[clap(long, help = "Read sentences from this file instead of stdin.")]
    input: Option<PathBuf>,

    #[clap(long, env = "HAR_BROKER_LOG_DIR", default_value = "./logs", help = "Directory for log files.")]
    log_dir: PathBuf,

    #[clap(long, env = "HAR_BROKER_LOG_LEVEL", default_value = "info", help = "Logging level.")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    url::Url::parse(&args.url).with_context(|| format!("invalid relay url '{}'", args.url))?;
    let _log_guard = loggers::setup_logging("har_broker", &args.log_dir, &args.log_level)?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut relay = connect_with_backoff(&args.url).await;
    let mut lines = reader.lines();
    let mut forwarded: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!("{}", line);

        let sentence = match HarSentence::parse(line) {
            Ok(sentence) => sentence,
            Err(HarError::NotHar) => continue,
            Err(e) => {
                tracing::warn!("Skipping malformed HAR sentence: {}", e);
                continue;
            }
        };

        tracing::info!(
            "Latitude: {}, Longitude: {}, Altitude: {} m, Temperature: {} °C, Pressure: {} hPa, Humidity: {} %",
            sentence.latitude,
            sentence.longitude,
            sentence.altitude,
            sentence.temperature,
            sentence.pressure,
            sentence.humidity
        );

        let message = sentence
            .to_wire_message(chrono::Utc::now().timestamp_millis())
            .to_string();
        while let Err(e) = relay.send(Message::Text(message.clone().into())).await {
            tracing::warn!("Relay send failed: {}. Reconnecting...", e);
            relay = connect_with_backoff(&args.url).await;
        }
        forwarded += 1;
    }

    let _ = relay.close(None).await;
    tracing::info!("Input ended. {} sentence(s) forwarded.", forwarded);
    Ok(())
}

async fn connect_with_backoff(url: &str) -> Relay {
    let mut backoff = Duration::from_secs(1);
    loop {
        match connect_async(url).await {
            Ok((stream, _)) => {
                tracing::info!("Connected to relay {}", url);
                return stream;
            }
            Err(e) => {
                tracing::error!("Failed to connect to relay {}: {}. Retrying in {}s...", url, e, backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, Duration::from_secs(60));
            }
        }
    }
}
