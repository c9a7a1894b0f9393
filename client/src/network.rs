//! Connection to a gate over TCP or reliable UDP
//!
//! Both transports run in a background task that turns the socket into a
//! stream of [`Event`]s and drains an outbound queue of whole chunks.
//! [`GateClient`] sits on top: it encodes and whitens frames with the current
//! keystream and decodes incoming chunks into [`ProtoFrame`]s.

use crate::error::ClientError;
use log::{debug, info, trace, warn};
use prost::Message;
use shared::enet::CONTROL_LEN;
use shared::proto::PacketHead;
use shared::stream::{self, Chunk};
use shared::{frame, now_ms, ByteCheckMode, CloseReason, EnetControl, Kcp, KcpConfig, Keystream, ProtoFrame};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const QUEUE_LEN: usize = 256;
const KCP_TICK: Duration = Duration::from_millis(10);
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(3);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Event {
    Chunk(Vec<u8>),
    /// The reason is only known when the gate sent an enet disconnect
    Closed(Option<CloseReason>),
}

pub struct GateClient {
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    events: mpsc::Receiver<Event>,
    task: JoinHandle<()>,
    keystream: Keystream,
    client_seq: u32,
    pending: VecDeque<ProtoFrame>,
}

impl GateClient {
    /// Connects over TCP; `dispatch` is the keystream the gate starts with
    pub async fn connect_tcp(gate: SocketAddr, dispatch: Keystream) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(gate).await?;
        stream.set_nodelay(true)?;
        info!("Connected to {} over tcp", gate);

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_LEN);
        let (events_tx, events_rx) = mpsc::channel(QUEUE_LEN);
        let task = tokio::spawn(run_tcp(stream, outbound_rx, events_tx));
        Ok(Self::new(outbound_tx, events_rx, task, dispatch))
    }

    /// Runs the enet connect exchange, then speaks KCP on the allocated conversation
    pub async fn connect_udp(gate: SocketAddr, byte_check: ByteCheckMode, dispatch: Keystream) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(if gate.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?;
        socket.connect(gate).await?;
        socket.send(&EnetControl::Connect.encode()).await?;

        let mut buf = [0u8; 64];
        let (conv, token) = loop {
            let len = tokio::time::timeout(ESTABLISH_TIMEOUT, socket.recv(&mut buf))
                .await
                .map_err(|_| ClientError::NoEstablish)??;
            match EnetControl::decode(&buf[..len]) {
                Some(EnetControl::Establish { conv, token }) => break (conv, token),
                Some(EnetControl::Disconnect { reason, .. }) => {
                    return Err(ClientError::Disconnected(Some(CloseReason::from_code(reason))))
                }
                _ => continue,
            }
        };
        info!("Connected to {} over udp, conv {:#010x}", gate, conv);

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_LEN);
        let (events_tx, events_rx) = mpsc::channel(QUEUE_LEN);
        let conversation = UdpConversation {
            socket,
            kcp: Kcp::new(conv, token, &KcpConfig::default()),
            byte_check,
            started: Instant::now(),
        };
        let task = tokio::spawn(conversation.run(outbound_rx, events_tx));
        Ok(Self::new(outbound_tx, events_rx, task, dispatch))
    }

    fn new(outbound: mpsc::Sender<Vec<u8>>, events: mpsc::Receiver<Event>, task: JoinHandle<()>, keystream: Keystream) -> Self {
        Self {
            outbound: Some(outbound),
            events,
            task,
            keystream,
            client_seq: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn keystream(&self) -> &Keystream {
        &self.keystream
    }

    /// Switches to a negotiated keystream for every later frame
    pub fn set_keystream(&mut self, keystream: Keystream) {
        self.keystream = keystream;
    }

    /// Sends one frame and returns the client sequence id it carried
    pub async fn send(&mut self, cmd_id: u16, body: &[u8]) -> Result<u32, ClientError> {
        self.client_seq = self.client_seq.wrapping_add(1);
        let head = PacketHead {
            client_sequence_id: self.client_seq,
            sent_ms: now_ms(),
            ..Default::default()
        };
        let bytes = frame::encode(cmd_id, &head.encode_to_vec(), body, &self.keystream)?;
        self.send_raw(bytes).await?;
        Ok(self.client_seq)
    }

    pub async fn send_message<M: Message>(&mut self, cmd_id: u16, message: &M) -> Result<u32, ClientError> {
        self.send(cmd_id, &message.encode_to_vec()).await
    }

    /// Sends an already encoded chunk as-is
    pub async fn send_raw(&mut self, bytes: Vec<u8>) -> Result<(), ClientError> {
        let outbound = self.outbound.as_ref().ok_or(ClientError::Disconnected(None))?;
        outbound
            .send(bytes)
            .await
            .map_err(|_| ClientError::Disconnected(None))
    }

    /// Next frame from the gate
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<ProtoFrame, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| ClientError::Timeout)?;
            match event {
                Some(Event::Chunk(chunk)) => match frame::decode(&chunk, &self.keystream) {
                    Ok(frames) => self.pending.extend(frames),
                    Err(e) => warn!("Dropping undecodable chunk: {}", e),
                },
                Some(Event::Closed(reason)) => return Err(ClientError::Disconnected(reason)),
                None => return Err(ClientError::Disconnected(None)),
            }
        }
    }

    /// Skips frames until one with `cmd_id` arrives
    pub async fn recv_cmd(&mut self, cmd_id: u16, timeout: Duration) -> Result<ProtoFrame, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.recv_timeout(remaining).await?;
            if frame.cmd_id == cmd_id {
                return Ok(frame);
            }
            trace!("Skipping cmd {} while waiting for {}", frame.cmd_id, cmd_id);
        }
    }

    /// Waits for the gate to close the connection, discarding frames
    pub async fn wait_disconnect(&mut self, timeout: Duration) -> Result<Option<CloseReason>, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv_timeout(remaining).await {
                Ok(_) => continue,
                Err(ClientError::Disconnected(reason)) => return Ok(reason),
                Err(e) => return Err(e),
            }
        }
    }

    /// Closes the connection and waits briefly for the transport to finish
    pub async fn close(mut self) {
        self.outbound.take();
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}

async fn run_tcp(stream: TcpStream, mut outbound: mpsc::Receiver<Vec<u8>>, events: mpsc::Sender<Event>) {
    let (mut reader, mut writer) = stream.into_split();
    let (echo_tx, mut echo_rx) = mpsc::channel::<()>(4);

    let read_events = events.clone();
    let read_task = tokio::spawn(async move {
        loop {
            match stream::read_chunk(&mut reader).await {
                Ok(Chunk::Data(data)) => {
                    if read_events.send(Event::Chunk(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Chunk::EchoRequest) => {
                    let _ = echo_tx.try_send(());
                }
                Ok(Chunk::EchoReply) => {}
                Err(e) => {
                    if !e.is_eof() {
                        debug!("Read from gate failed: {}", e);
                    }
                    let _ = read_events.send(Event::Closed(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        let result = tokio::select! {
            data = outbound.recv() => match data {
                Some(data) => stream::write_chunk(&mut writer, &data).await,
                None => break,
            },
            Some(()) = echo_rx.recv() => stream::write_echo_reply(&mut writer).await,
        };
        if let Err(e) = result {
            debug!("Write to gate failed: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
    read_task.abort();
}

struct UdpConversation {
    socket: UdpSocket,
    kcp: Kcp,
    byte_check: ByteCheckMode,
    started: Instant,
}

impl UdpConversation {
    fn now(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    async fn flush(&mut self) {
        self.kcp.update(self.now());
        self.kcp.flush();
        while let Some(mut datagram) = self.kcp.pop_output() {
            self.byte_check.seal(&mut datagram);
            if let Err(e) = self.socket.send(&datagram).await {
                debug!("Send to gate failed: {}", e);
            }
        }
    }

    async fn run(mut self, mut outbound: mpsc::Receiver<Vec<u8>>, events: mpsc::Sender<Event>) {
        let mut ticker = tokio::time::interval(KCP_TICK);
        let mut buf = vec![0u8; 2048];

        let reason = loop {
            tokio::select! {
                received = self.socket.recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        Err(e) => {
                            debug!("Receive from gate failed: {}", e);
                            break None;
                        }
                    };
                    if len == CONTROL_LEN {
                        if let Some(EnetControl::Disconnect { reason, .. }) = EnetControl::decode(&buf[..len]) {
                            let _ = events.send(Event::Closed(Some(CloseReason::from_code(reason)))).await;
                            return;
                        }
                        continue;
                    }
                    let Some(segment) = self.byte_check.open(&buf[..len]) else {
                        trace!("Dropping datagram with a bad trailer");
                        continue;
                    };
                    if let Err(e) = self.kcp.input(segment) {
                        trace!("Dropping segment: {}", e);
                        continue;
                    }
                    self.flush().await;
                    while let Some(message) = self.kcp.recv() {
                        if events.send(Event::Chunk(message)).await.is_err() {
                            break;
                        }
                    }
                }
                data = outbound.recv() => match data {
                    Some(data) => {
                        if let Err(e) = self.kcp.send(&data) {
                            warn!("Dropping outbound chunk: {}", e);
                            continue;
                        }
                        self.flush().await;
                    }
                    None => break Some(CloseReason::ClientClose),
                },
                _ = ticker.tick() => {
                    self.flush().await;
                    if self.kcp.is_dead() {
                        break None;
                    }
                }
            }
        };

        match reason {
            Some(reason) => {
                let bye = EnetControl::Disconnect {
                    conv: self.kcp.conv(),
                    token: self.kcp.token(),
                    reason: reason.code(),
                };
                let _ = self.socket.send(&bye.encode()).await;
            }
            None => {
                let _ = events.send(Event::Closed(Some(CloseReason::Timeout))).await;
            }
        }
    }
}
