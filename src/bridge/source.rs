//! Upstream event sources: the chain observer feed, Postgres NOTIFY and an
//! in-process channel.

use std::io;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, error, info};

use super::message::UpstreamEvent;
use crate::error::{Error, Result};
use crate::rawblock;

/// A producer of upstream events.
///
/// `Ok(None)` means the source ended for good. Decode errors cover one
/// event only; any other error means the source is gone.
#[async_trait]
pub trait EventSource: Send {
    fn name(&self) -> &str;

    async fn next_event(&mut self) -> Result<Option<UpstreamEvent>>;
}

#[derive(Deserialize)]
struct FeedLine {
    height: i32,
    block: String,
}

/// Newline-delimited JSON from the chain observer, one
/// `{"height": .., "block": "<raw block hex>"}` object per connected block.
pub struct BlockFeed<R> {
    name: String,
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> BlockFeed<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            lines: reader.lines(),
        }
    }
}

impl BlockFeed<BufReader<TcpStream>> {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::UpstreamDisconnect(format!("chain feed {addr}: {e}")))?;
        info!(%addr, "connected to chain feed");
        Ok(Self::new(format!("chain feed {addr}"), BufReader::new(stream)))
    }
}

pub fn parse_feed_line(line: &str) -> Result<UpstreamEvent> {
    let FeedLine { height, block } = serde_json::from_str(line)?;
    let bytes = hex::decode(block.trim()).map_err(|e| Error::decode("chain feed block", e))?;
    let raw = rawblock::parse_block(&bytes).map_err(|e| Error::decode("chain feed block", e))?;
    Ok(UpstreamEvent::block_connected(height, &raw))
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for BlockFeed<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self) -> Result<Option<UpstreamEvent>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(line) => line,
                // a line that is not UTF-8 is consumed; the stream is still usable
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(Error::decode("chain feed line", e))
                }
                Err(e) => return Err(Error::UpstreamDisconnect(format!("{}: {e}", self.name))),
            };
            match line {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return parse_feed_line(&line).map(Some),
            }
        }
    }
}

/// `LISTEN` on a dedicated connection and turn notifications into events.
/// Payloads must be JSON.
pub struct PgNotifications {
    name: String,
    // keeps the connection open
    _client: tokio_postgres::Client,
    rx: mpsc::UnboundedReceiver<std::result::Result<tokio_postgres::Notification, tokio_postgres::Error>>,
}

impl PgNotifications {
    pub async fn listen(database_url: &str, channels: &[String]) -> Result<Self> {
        let (client, mut connection) = tokio_postgres::connect(database_url, NoTls).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let forward = match message {
                    Ok(AsyncMessage::Notification(n)) => Ok(n),
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(%notice, "postgres notice");
                        continue;
                    }
                    Ok(_) => continue,
                    Err(e) => Err(e),
                };
                let failed = forward.is_err();
                if tx.send(forward).is_err() || failed {
                    break;
                }
            }
        });

        for channel in channels {
            client.batch_execute(&format!("LISTEN \"{channel}\"")).await?;
            info!(%channel, "listening for notifications");
        }

        Ok(Self {
            name: format!("postgres notify {}", channels.join(",")),
            _client: client,
            rx,
        })
    }
}

pub fn parse_notification(channel: &str, payload: &str) -> Result<UpstreamEvent> {
    let payload: Value =
        serde_json::from_str(payload).map_err(|e| Error::decode(format!("{channel} payload"), e))?;
    Ok(UpstreamEvent::Notification {
        channel: channel.to_string(),
        payload,
    })
}

#[async_trait]
impl EventSource for PgNotifications {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self) -> Result<Option<UpstreamEvent>> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "notification connection failed");
                Err(Error::UpstreamDisconnect(format!("{}: {e}", self.name)))
            }
            Some(Ok(n)) => parse_notification(n.channel(), n.payload()).map(Some),
        }
    }
}

/// Events pushed from inside the process, e.g. a node callback.
pub struct ChannelSource {
    rx: mpsc::Receiver<UpstreamEvent>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<UpstreamEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    fn name(&self) -> &str {
        "in-process channel"
    }

    async fn next_event(&mut self) -> Result<Option<UpstreamEvent>> {
        Ok(self.rx.recv().await)
    }
}
