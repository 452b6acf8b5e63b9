//! Byte copying for both forward paths.
//!
//! # Responsibilities
//! - Stream a response body into a sink, flushing on a cadence
//! - Relay raw bytes both ways between two connections
//!
//! # Design Decisions
//! - A zero flush interval means copy everything, then flush once
//! - Relay directions run as sibling tasks; the first to finish wins
//! - The losing task is aborted, which drops its halves and closes both ends

use std::io;
use std::time::Duration;

use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::http::sink::ResponseSink;
use crate::http::transport::ResponseBody;
use crate::net::dial::BoxConnection;

/// Copy `body` into `sink`, returning the number of body bytes written.
///
/// With a nonzero `flush_interval`, buffered output is flushed at that
/// cadence while the body is still streaming.
pub async fn copy_response(
    sink: &mut dyn ResponseSink,
    mut body: ResponseBody,
    flush_interval: Duration,
) -> io::Result<u64> {
    let mut written = 0u64;

    if flush_interval.is_zero() {
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame?.into_data() {
                sink.write_body(&data).await?;
                written += data.len() as u64;
            }
        }
        sink.flush().await?;
        return Ok(written);
    }

    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut dirty = false;

    loop {
        tokio::select! {
            frame = body.frame() => {
                let Some(frame) = frame else { break };
                if let Ok(data) = frame?.into_data() {
                    sink.write_body(&data).await?;
                    written += data.len() as u64;
                    dirty |= !data.is_empty();
                }
            }
            _ = ticker.tick(), if dirty => {
                sink.flush().await?;
                dirty = false;
            }
        }
    }

    sink.flush().await?;
    Ok(written)
}

/// Which way a relay task was copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToTarget => write!(f, "client->target"),
            Direction::TargetToClient => write!(f, "target->client"),
        }
    }
}

/// First relay direction to stop.
#[derive(Debug)]
pub struct RelayEnd {
    pub direction: Direction,
    pub result: io::Result<u64>,
}

/// Aborts the relay tasks when the relay scope ends.
struct RelayTasks([JoinHandle<()>; 2]);

impl Drop for RelayTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Copy bytes between `client` and `target` until either direction stops.
///
/// Returns as soon as the first direction ends; the other is not awaited.
pub async fn relay(client: BoxConnection, target: BoxConnection) -> RelayEnd {
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);
    let (tx, mut rx) = mpsc::channel(2);

    let _tasks = RelayTasks([
        spawn_copy(Direction::ClientToTarget, client_read, target_write, tx.clone()),
        spawn_copy(Direction::TargetToClient, target_read, client_write, tx),
    ]);

    match rx.recv().await {
        Some(end) => end,
        None => RelayEnd {
            direction: Direction::ClientToTarget,
            result: Err(io::Error::other("relay tasks ended without reporting")),
        },
    }
}

fn spawn_copy<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    done: mpsc::Sender<RelayEnd>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = done.send(RelayEnd { direction, result }).await;
    })
}
