//! Length-prefixed TCP listener
//!
//! Each connection gets a reader task and a writer task sharing a
//! cancellation token. The reader forwards data chunks and handles echo
//! words; the writer drains the session's outbound channel, answers echo
//! requests and probes the client every few seconds to measure RTT.
//!
//! A `0` from the client is always answered with `0`. Only `0xFFFFFFFF`
//! completes our own probe.

use super::{link_pair, Inbound, Link, LinkEnds, TransportKind, UDP_CONV_FLAG};
use crate::config::TCP_ECHO_INTERVAL;
use crate::error::GateError;
use crate::rate_limit::SharedRateLimiter;
use log::{debug, error, info, warn};
use shared::stream::{read_chunk, write_chunk, write_echo_request, Chunk, FramingError};
use shared::CloseReason;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct TcpListener {
    listener: tokio::net::TcpListener,
    next_id: AtomicU32,
    write_timeout: Duration,
    echo_interval: Duration,
}

impl TcpListener {
    pub async fn bind(addr: &str, write_timeout: Duration) -> Result<Self, GateError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("TCP listener on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            next_id: AtomicU32::new(1),
            write_timeout,
            echo_interval: TCP_ECHO_INTERVAL,
        })
    }

    /// Period of the RTT probe sent to every connection
    pub fn with_echo_interval(mut self, echo_interval: Duration) -> Self {
        self.echo_interval = echo_interval;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn allocate_id(&self) -> u32 {
        // Stays below the UDP conversation space
        self.next_id.fetch_add(1, Ordering::Relaxed) % UDP_CONV_FLAG
    }

    /// Accepts until `shutdown` fires; `connect_limit` is shared with the UDP listener
    pub async fn run(self, accept_tx: mpsc::Sender<Link>, connect_limit: SharedRateLimiter, shutdown: CancellationToken) {
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        error!("TCP accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                },
            };

            if !connect_limit.allow() {
                warn!("Connect rate exceeded, dropping TCP connection from {}", addr);
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", addr, e);
            }

            let conn_id = self.allocate_id();
            let (link, ends) = link_pair(conn_id, TransportKind::Tcp, addr);
            spawn_connection(stream, ends, self.write_timeout, self.echo_interval, conn_id);
            debug!("TCP connection {} accepted from {}", conn_id, addr);

            if accept_tx.send(link).await.is_err() {
                warn!("Accept loop is gone, dropping TCP connection {}", conn_id);
            }
        }
        debug!("TCP listener stopped");
    }
}

/// Outstanding RTT probe, shared by the reader and the writer
#[derive(Default)]
struct Probe {
    sent_at: Mutex<Option<Instant>>,
}

impl Probe {
    fn start(&self) {
        *self.sent_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Completes the outstanding probe, returning its round trip
    fn complete(&self) -> Option<Duration> {
        self.sent_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|sent| sent.elapsed())
    }
}

fn spawn_connection(stream: TcpStream, ends: LinkEnds, write_timeout: Duration, echo_interval: Duration, conn_id: u32) {
    let (reader, writer) = stream.into_split();
    let cancel = CancellationToken::new();
    let probe = Arc::new(Probe::default());
    let (echo_tx, echo_rx) = mpsc::channel(8);

    let LinkEnds {
        inbound,
        outbound,
        closer,
        rtt,
    } = ends;

    tokio::spawn(read_loop(ReadSide {
        conn_id,
        reader,
        inbound: inbound.clone(),
        echo_tx,
        probe: Arc::clone(&probe),
        rtt,
        cancel: cancel.clone(),
    }));
    tokio::spawn(write_loop(WriteSide {
        conn_id,
        writer,
        inbound,
        outbound,
        closer,
        echo_rx,
        probe,
        write_timeout,
        echo_interval,
        cancel,
    }));
}

struct ReadSide {
    conn_id: u32,
    reader: OwnedReadHalf,
    inbound: mpsc::Sender<Inbound>,
    echo_tx: mpsc::Sender<()>,
    probe: Arc<Probe>,
    rtt: Arc<AtomicU32>,
    cancel: CancellationToken,
}

async fn read_loop(mut side: ReadSide) {
    let reason = loop {
        let chunk = tokio::select! {
            _ = side.cancel.cancelled() => return,
            chunk = read_chunk(&mut side.reader) => chunk,
        };

        match chunk {
            Ok(Chunk::Data(data)) => {
                if side.inbound.send(Inbound::Message(data)).await.is_err() {
                    break None;
                }
            }
            Ok(Chunk::EchoRequest) => {
                if side.echo_tx.try_send(()).is_err() {
                    debug!("TCP connection {} echo backlog full", side.conn_id);
                }
            }
            Ok(Chunk::EchoReply) => {
                if let Some(rtt) = side.probe.complete() {
                    side.rtt.store(rtt.as_millis() as u32, Ordering::Relaxed);
                }
            }
            Err(FramingError::TooLarge(len)) => {
                warn!("TCP connection {} sent a {} byte chunk, closing", side.conn_id, len);
                break Some(CloseReason::ServerKick);
            }
            Err(e) if e.is_eof() => break Some(CloseReason::ClientClose),
            Err(e) => {
                debug!("TCP connection {} read failed: {}", side.conn_id, e);
                break Some(CloseReason::ClientClose);
            }
        }
    };

    if let Some(reason) = reason {
        let _ = side.inbound.try_send(Inbound::Closed(reason));
    }
    side.cancel.cancel();
}

struct WriteSide {
    conn_id: u32,
    writer: OwnedWriteHalf,
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::Receiver<Vec<u8>>,
    closer: tokio::sync::oneshot::Receiver<CloseReason>,
    echo_rx: mpsc::Receiver<()>,
    probe: Arc<Probe>,
    write_timeout: Duration,
    echo_interval: Duration,
    cancel: CancellationToken,
}

async fn write_loop(mut side: WriteSide) {
    let mut probe_ticker = tokio::time::interval(side.echo_interval);
    // Skip the first tick since it fires immediately
    probe_ticker.tick().await;

    loop {
        let written = tokio::select! {
            _ = side.cancel.cancelled() => break,
            message = side.outbound.recv() => match message {
                Some(data) => timed(side.write_timeout, write_chunk(&mut side.writer, &data)).await,
                None => break,
            },
            // Echo requests are answered with four zero bytes
            Some(()) = side.echo_rx.recv() => {
                timed(side.write_timeout, write_echo_request(&mut side.writer)).await
            },
            _ = probe_ticker.tick() => {
                side.probe.start();
                timed(side.write_timeout, write_echo_request(&mut side.writer)).await
            },
            closed = &mut side.closer => {
                // Flush what the session queued before the close
                while let Ok(data) = side.outbound.try_recv() {
                    if timed(side.write_timeout, write_chunk(&mut side.writer, &data)).await.is_err() {
                        break;
                    }
                }
                if let Ok(reason) = closed {
                    debug!("Closing TCP connection {} ({})", side.conn_id, reason);
                }
                break;
            },
        };

        if let Err(e) = written {
            warn!("TCP connection {} write failed: {}", side.conn_id, e);
            let _ = side.inbound.try_send(Inbound::Closed(CloseReason::ServerKick));
            break;
        }
    }

    let _ = side.writer.shutdown().await;
    side.cancel.cancel();
}

async fn timed<F>(limit: Duration, write: F) -> Result<(), FramingError>
where
    F: std::future::Future<Output = Result<(), FramingError>>,
{
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(FramingError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}
