//! Relay link for one service.
//!
//! [`spawn_link`] starts a task that keeps a TMTP connection to the
//! service's relay: connect with backoff, announce the protocol revision,
//! register or log in, then read frames until the connection drops. Once the
//! relay confirms the login a sender task drains the send queue, one record
//! at a time, each waiting for its ack.
//!
//! The caller talks to the task through a command channel (frame injection,
//! shutdown) and hears back on a notification channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use tmtp_shared::constants::{
    ACK_TIMEOUT_SECS, APP_NAME, DEFAULT_RELAY_PORT, IDLE_TIME_FRACTION, PROTOCOL_REVISION,
};
use tmtp_shared::{pack_frame, Frame, FrameParser, Op, OutboundHeader};
use tmtp_store::{OrHalt, Service};

use crate::backoff::{jittered, Backoff};
use crate::dispatch::{handle_frame, Event};
use crate::error::LinkError;
use crate::record::{compose, compose_presence_push};

const READ_CHUNK: usize = 16 * 1024;
const ACK_CHANNEL: usize = 8;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

// ---------------------------------------------------------------------------
// Commands, notifications, configuration
// ---------------------------------------------------------------------------

/// Commands sent from the application to the link task.
#[derive(Debug)]
pub enum LinkCommand {
    /// Dispatch a locally built frame as if the relay had sent it.
    Inject(Frame),
    Shutdown,
}

/// Notifications sent from the link task to the application.
#[derive(Debug, Clone)]
pub enum LinkNotification {
    Connected { addr: String },
    Event(Event),
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Handshaking,
    Authenticated,
    Stopped,
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connect_timeout: Duration,
    /// How long the sender waits for the ack of one record
    pub ack_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// The idle read timeout is the login period divided by this
    pub idle_fraction: u64,
    /// Capacity of the command and notification channels
    pub channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(ACK_TIMEOUT_SECS),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            idle_fraction: IDLE_TIME_FRACTION,
            channel_capacity: 256,
        }
    }
}

/// Handle returned by [`spawn_link`].
#[derive(Debug)]
pub struct LinkHandle {
    pub cmd_tx: mpsc::Sender<LinkCommand>,
    pub notif_rx: mpsc::Receiver<LinkNotification>,
    pub state: watch::Receiver<LinkState>,
    pub task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// Spawn the link task for `service`.
pub fn spawn_link(service: Arc<Service>, config: LinkConfig) -> LinkHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel(config.channel_capacity);
    let (notif_tx, notif_rx) = mpsc::channel(config.channel_capacity);
    let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

    let wake = Arc::new(Notify::new());
    {
        let wake = wake.clone();
        service.queue().on_enqueue(move || wake.notify_one());
    }

    let link = Link {
        service,
        config,
        notif_tx,
        state_tx,
        wake,
    };

    let task = tokio::spawn(async move {
        let mut backoff = Backoff::new(link.config.backoff_base, link.config.backoff_max);
        info!(service = %link.service.name(), "link started");

        loop {
            link.set_state(LinkState::Connecting);
            let (stream, addr) = match link.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        service = %link.service.name(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "connect failed"
                    );
                    if !link.pause(delay, &mut cmd_rx, false).await {
                        break;
                    }
                    continue;
                }
            };
            link.notify(LinkNotification::Connected { addr }).await;

            let result = link.run_connection(stream, &mut cmd_rx, &mut backoff).await;
            link.service.presence().clear_online();
            link.set_state(LinkState::Disconnected);

            let err = match result {
                Ok(()) => break,
                Err(e) => e,
            };
            link.notify(LinkNotification::Disconnected {
                reason: err.to_string(),
            })
            .await;

            let resume = match err {
                LinkError::Idle => {
                    let period = Duration::from_secs(link.service.config().login_period);
                    let rest = jittered(period, 20);
                    info!(
                        service = %link.service.name(),
                        rest_secs = rest.as_secs(),
                        "idle, disconnected until next login or send"
                    );
                    link.pause(rest, &mut cmd_rx, true).await
                }
                other => {
                    let delay = backoff.next_delay();
                    warn!(
                        service = %link.service.name(),
                        error = %other,
                        delay_ms = delay.as_millis() as u64,
                        "link closed"
                    );
                    link.pause(delay, &mut cmd_rx, false).await
                }
            };
            if !resume {
                break;
            }
        }

        link.set_state(LinkState::Stopped);
        info!(service = %link.service.name(), "link task terminated");
    });

    LinkHandle {
        cmd_tx,
        notif_rx,
        state: state_rx,
        task,
    }
}

struct Link {
    service: Arc<Service>,
    config: LinkConfig,
    notif_tx: mpsc::Sender<LinkNotification>,
    state_tx: watch::Sender<LinkState>,
    wake: Arc<Notify>,
}

/// Per-connection state, rebuilt on every reconnect.
struct Connection {
    writer: SharedWriter,
    ack_tx: mpsc::Sender<String>,
    ack_rx: Option<mpsc::Receiver<String>>,
    in_flight: Arc<AtomicBool>,
    sender: Option<JoinHandle<Result<(), LinkError>>>,
}

impl Link {
    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    async fn notify(&self, notification: LinkNotification) {
        let _ = self.notif_tx.send(notification).await;
    }

    async fn connect(&self) -> Result<(TcpStream, String), LinkError> {
        let mut addr = self.service.config().addr;
        if !addr.contains(':') {
            addr = format!("{addr}:{DEFAULT_RELAY_PORT}");
        }
        debug!(service = %self.service.name(), addr = %addr, "connecting");
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| LinkError::ConnectTimeout(addr.clone()))??;
        stream.set_nodelay(true)?;
        info!(service = %self.service.name(), addr = %addr, "connected to relay");
        Ok((stream, addr))
    }

    /// Wait out `delay` while still serving injected frames. With
    /// `until_wake`, a new queue entry ends the wait early. Returns false
    /// once shutdown is requested.
    async fn pause(
        &self,
        delay: Duration,
        cmd_rx: &mut mpsc::Receiver<LinkCommand>,
        until_wake: bool,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.wake.notified(), if until_wake => return true,
                cmd = cmd_rx.recv() => match cmd {
                    Some(LinkCommand::Inject(frame)) => {
                        match handle_frame(&self.service, frame).await {
                            Ok(event) => self.notify(LinkNotification::Event(event)).await,
                            Err(e) => warn!(service = %self.service.name(), error = %e, "injected frame failed"),
                        }
                    }
                    Some(LinkCommand::Shutdown) | None => return false,
                }
            }
        }
    }

    /// Drive one connection. `Ok` means shutdown was requested.
    async fn run_connection(
        &self,
        stream: TcpStream,
        cmd_rx: &mut mpsc::Receiver<LinkCommand>,
        backoff: &mut Backoff,
    ) -> Result<(), LinkError> {
        let (mut reader, writer) = stream.into_split();
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL);
        let mut conn = Connection {
            writer: Arc::new(Mutex::new(writer)),
            ack_tx,
            ack_rx: Some(ack_rx),
            in_flight: Arc::new(AtomicBool::new(false)),
            sender: None,
        };

        let result = self.serve(&mut reader, &mut conn, cmd_rx, backoff).await;
        if let Some(sender) = conn.sender.take() {
            sender.abort();
        }
        result
    }

    async fn serve(
        &self,
        reader: &mut OwnedReadHalf,
        conn: &mut Connection,
        cmd_rx: &mut mpsc::Receiver<LinkCommand>,
        backoff: &mut Backoff,
    ) -> Result<(), LinkError> {
        self.set_state(LinkState::Handshaking);
        let config = self.service.config();
        write_header(&conn.writer, &OutboundHeader::revision(PROTOCOL_REVISION)).await?;
        let hello = if config.is_registered() {
            OutboundHeader::login(&config.uid, &config.node)
        } else {
            OutboundHeader::register(&config.alias, APP_NAME)
        };
        write_header(&conn.writer, &hello).await?;

        let idle = idle_timeout(config.login_period, self.config.idle_fraction);
        let mut parser = FrameParser::new();
        let mut deferred = false;
        let mut pulsed = false;

        loop {
            let wait = idle.map(|d| if deferred { d + self.config.ack_timeout } else { d });
            tokio::select! {
                read = read_some(reader, parser.buffer_mut(), wait) => {
                    match read? {
                        Some(0) => return Err(LinkError::Closed),
                        Some(_) => {
                            deferred = false;
                            pulsed = false;
                            while let Some(frame) = parser.next_frame()? {
                                self.on_frame(conn, frame, true, backoff).await?;
                            }
                        }
                        None if conn.in_flight.load(Ordering::Acquire) && !deferred => {
                            debug!(service = %self.service.name(), "idle with an ack pending, waiting longer");
                            deferred = true;
                        }
                        None if !pulsed && conn.sender.is_some() => {
                            write_header(&conn.writer, &OutboundHeader::pulse()).await?;
                            pulsed = true;
                        }
                        None => return Err(LinkError::Idle),
                    }
                }

                done = join_sender(&mut conn.sender) => {
                    conn.sender = None;
                    done?;
                    return Err(LinkError::Closed);
                }

                cmd = cmd_rx.recv() => match cmd {
                    Some(LinkCommand::Inject(frame)) => {
                        self.on_frame(conn, frame, false, backoff).await?;
                    }
                    Some(LinkCommand::Shutdown) | None => {
                        info!(service = %self.service.name(), "link shutdown requested");
                        let _ = write_header(&conn.writer, &OutboundHeader::new(Op::Quit, "")).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dispatch one frame. Frames from the relay that carry a sender are
    /// acknowledged back once stored.
    async fn on_frame(
        &self,
        conn: &mut Connection,
        frame: Frame,
        from_relay: bool,
        backoff: &mut Backoff,
    ) -> Result<(), LinkError> {
        let needs_ack = from_relay && frame.header.needs_ack();
        let id = frame.header.id.clone();
        debug!(service = %self.service.name(), op = %frame.header.op, id = %id, "frame");

        let event = match handle_frame(&self.service, frame).await {
            Ok(event) => event,
            Err(e) if e.closes_link() => return Err(e.into()),
            Err(e) => {
                warn!(service = %self.service.name(), id = %id, error = %e, "frame refused");
                // A refused frame is refused again on redelivery.
                if needs_ack {
                    write_header(&conn.writer, &OutboundHeader::ack(&id)).await?;
                }
                return Ok(());
            }
        };

        if let Some(acked) = event.ack_id() {
            if conn.ack_tx.try_send(acked.to_string()).is_err() {
                warn!(service = %self.service.name(), id = acked, "ack channel blocked");
            }
        }
        if needs_ack {
            write_header(&conn.writer, &OutboundHeader::ack(&id)).await?;
        }

        let quit = event == Event::Quit;
        if matches!(event, Event::Online { login: true, .. }) {
            self.on_login(conn, backoff);
        }
        self.notify(LinkNotification::Event(event)).await;
        if quit {
            return Err(LinkError::Quit);
        }
        Ok(())
    }

    fn on_login(&self, conn: &mut Connection, backoff: &mut Backoff) {
        backoff.reset();
        self.set_state(LinkState::Authenticated);
        let Some(ack_rx) = conn.ack_rx.take() else {
            return;
        };
        info!(service = %self.service.name(), "logged in");
        let sender = Sender {
            service: self.service.clone(),
            writer: conn.writer.clone(),
            ack_rx,
            wake: self.wake.clone(),
            in_flight: conn.in_flight.clone(),
            ack_timeout: self.config.ack_timeout,
        };
        conn.sender = Some(tokio::spawn(sender.run()));
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

struct Sender {
    service: Arc<Service>,
    writer: SharedWriter,
    ack_rx: mpsc::Receiver<String>,
    wake: Arc<Notify>,
    in_flight: Arc<AtomicBool>,
    ack_timeout: Duration,
}

impl Sender {
    /// Push the presence list, then drain the queue until the connection
    /// fails. Returns only on a write error.
    async fn run(mut self) -> Result<(), LinkError> {
        let svc = self.service.clone();
        let push = tokio::task::spawn_blocking(move || {
            compose_presence_push(&svc).or_halt("presence push")
        })
        .await??;
        if let Some(push) = push {
            write_bytes(&self.writer, &push.bytes).await?;
        }

        // Entries whose ack timed out wait for the next connection.
        let mut skipped: HashSet<String> = HashSet::new();
        loop {
            let next = self
                .service
                .queue()
                .pending()
                .into_iter()
                .find(|e| !skipped.contains(&e.id));
            let Some(entry) = next else {
                self.wake.notified().await;
                continue;
            };

            let svc = self.service.clone();
            let queued = entry.clone();
            let composed =
                tokio::task::spawn_blocking(move || compose(&svc, &queued).or_halt("compose record"))
                    .await?;
            let record = match composed {
                Ok(Some(record)) => record,
                Ok(None) => {
                    info!(service = %self.service.name(), id = %entry.id, "content gone, dropping queue entry");
                    let svc = self.service.clone();
                    let id = entry.id.clone();
                    tokio::task::spawn_blocking(move || {
                        svc.queue().drop_entry(&id).or_halt("drop queue entry")
                    })
                    .await??;
                    continue;
                }
                Err(e) => {
                    error!(service = %self.service.name(), id = %entry.id, error = %e, "cannot compose send record");
                    skipped.insert(entry.id);
                    continue;
                }
            };

            write_bytes(&self.writer, &record.bytes).await?;
            self.in_flight.store(true, Ordering::Release);
            let acked = wait_for_ack(&mut self.ack_rx, &record.id, self.ack_timeout).await;
            self.in_flight.store(false, Ordering::Release);
            if acked {
                debug!(service = %self.service.name(), id = %record.id, "send acknowledged");
            } else {
                warn!(service = %self.service.name(), id = %record.id, "timeout awaiting ack");
                skipped.insert(record.id);
            }
        }
    }
}

/// Wait for the ack of `id`, ignoring acks for anything else. Returns false
/// on timeout or when the connection is gone.
async fn wait_for_ack(ack_rx: &mut mpsc::Receiver<String>, id: &str, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        match timeout_at(deadline, ack_rx.recv()).await {
            Ok(Some(got)) if got == id => return true,
            Ok(Some(got)) => warn!(expected = id, got = %got, "ack for another record"),
            Ok(None) | Err(_) => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

fn idle_timeout(login_period: u64, fraction: u64) -> Option<Duration> {
    let secs = login_period / fraction.max(1);
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Read more bytes into `buf`. `Ok(None)` means `wait` ran out first.
async fn read_some(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    wait: Option<Duration>,
) -> Result<Option<usize>, LinkError> {
    buf.reserve(READ_CHUNK);
    let read = reader.read_buf(buf);
    match wait {
        Some(wait) => match timeout(wait, read).await {
            Ok(n) => Ok(Some(n?)),
            Err(_) => Ok(None),
        },
        None => Ok(Some(read.await?)),
    }
}

async fn join_sender(sender: &mut Option<JoinHandle<Result<(), LinkError>>>) -> Result<(), LinkError> {
    match sender.as_mut() {
        Some(handle) => handle.await?,
        None => std::future::pending().await,
    }
}

async fn write_header(writer: &SharedWriter, header: &OutboundHeader) -> Result<(), LinkError> {
    let bytes = pack_frame(header, &[])?;
    write_bytes(writer, &bytes).await
}

async fn write_bytes(writer: &SharedWriter, bytes: &[u8]) -> Result<(), LinkError> {
    let mut writer = writer.lock().await;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use tmtp_shared::HeaderFor;
    use tmtp_store::{Checkpoint, CrashHook, DraftContent, Registry, ServiceConfig};

    use super::*;

    fn test_config() -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn open_service(dir: &tempfile::TempDir, addr: &str, uid: &str) -> Arc<Service> {
        let registry = Registry::open(dir.path(), CrashHook::disabled()).unwrap();
        registry
            .add_service(ServiceConfig {
                name: "home".into(),
                addr: addr.into(),
                uid: uid.into(),
                node: "n1".into(),
                alias: "ann".into(),
                ..Default::default()
            })
            .unwrap()
    }

    async fn read_frame(stream: &mut TcpStream) -> (Value, Vec<u8>) {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let len = usize::from_str_radix(std::str::from_utf8(&len).unwrap(), 16).unwrap();
        let mut head = vec![0u8; len];
        stream.read_exact(&mut head).await.unwrap();
        let head: Value = serde_json::from_slice(&head).unwrap();
        let data_len = head.get("DataLen").and_then(Value::as_u64).unwrap_or(0);
        let mut data = vec![0u8; data_len as usize];
        stream.read_exact(&mut data).await.unwrap();
        (head, data)
    }

    async fn send(stream: &mut TcpStream, head: Value, payload: &[u8]) {
        let bytes = pack_frame(&head, payload).unwrap();
        stream.write_all(&bytes).await.unwrap();
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ack_mismatch_keeps_waiting() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send("tb_000000000001".to_string()).await.unwrap();
        let late = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            late.send("ta_000000000001".to_string()).await.unwrap();
        });
        assert!(wait_for_ack(&mut rx, "ta_000000000001", Duration::from_secs(2)).await);

        tx.send("tc_000000000001".to_string()).await.unwrap();
        assert!(!wait_for_ack(&mut rx, "ta_000000000001", Duration::from_millis(50)).await);
    }

    #[test]
    fn test_idle_timeout_from_login_period() {
        assert_eq!(idle_timeout(600, 10), Some(Duration::from_secs(60)));
        assert_eq!(idle_timeout(0, 10), None);
        assert_eq!(idle_timeout(5, 10), None);
    }

    #[tokio::test]
    async fn test_login_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dir = tempfile::tempdir().unwrap();
        let svc = open_service(&dir, &addr, "u1");
        let draft = svc
            .save_draft(
                None,
                "",
                &DraftContent {
                    subject: "hi".into(),
                    to: vec![HeaderFor::user("u2")],
                    body: "hello".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        svc.send_draft(&draft.to_string()).unwrap();

        let mut link = spawn_link(svc.clone(), test_config());
        let (mut relay, _) = listener.accept().await.unwrap();

        let (rev, _) = read_frame(&mut relay).await;
        assert_eq!(rev["Op"], 0);
        assert_eq!(rev["Id"], PROTOCOL_REVISION);
        let (login, _) = read_frame(&mut relay).await;
        assert_eq!(login["Op"], 2);
        assert_eq!(login["Uid"], "u1");
        assert_eq!(login["Node"], "n1");

        send(
            &mut relay,
            json!({"Op": "info", "Info": "login ok", "Ohi": ["u2"]}),
            &[],
        )
        .await;

        let (post, data) = read_frame(&mut relay).await;
        assert_eq!(post["Op"], 7);
        let queued = format!("t{draft}");
        assert_eq!(post["Id"], queued.as_str());
        assert!(data.ends_with(b"hello"));

        send(
            &mut relay,
            json!({"Op": "ack", "Id": queued, "MsgId": "m5", "Posted": "2026-01-02T00:00:00Z"}),
            &[],
        )
        .await;
        eventually(|| svc.queue().is_empty()).await;
        assert_eq!(svc.threads().index("m5").unwrap().len(), 1);
        assert_eq!(svc.presence().online(), vec!["u2".to_string()]);
        assert_eq!(*link.state.borrow(), LinkState::Authenticated);

        let sub = br#"{"ThreadId":"m5","Subject":"re"}"#;
        let mut payload = sub.to_vec();
        payload.extend_from_slice(b"reply");
        send(
            &mut relay,
            json!({
                "Op": "delivery", "Id": "m6", "From": "u2",
                "Posted": "2026-01-03T00:00:00Z",
                "DataHead": sub.len(), "DataLen": payload.len()
            }),
            &payload,
        )
        .await;
        let (ack, _) = read_frame(&mut relay).await;
        assert_eq!(ack["Op"], 10);
        assert_eq!(ack["Id"], "m6");
        let ids: Vec<String> = svc.threads().index("m5").unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["m5".to_string(), "m6".to_string()]);

        link.cmd_tx.send(LinkCommand::Shutdown).await.unwrap();
        let (quit, _) = read_frame(&mut relay).await;
        assert_eq!(quit["Op"], 11);
        while link.notif_rx.recv().await.is_some() {}
        link.task.await.unwrap();
        assert_eq!(*link.state.borrow(), LinkState::Stopped);
    }

    #[tokio::test]
    async fn test_refused_and_ignored_frames_are_acked() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dir = tempfile::tempdir().unwrap();
        drop(open_service(&dir, &addr, "u1"));
        let registry = Registry::open(dir.path(), CrashHook::abort_at(Checkpoint::Staged)).unwrap();
        let svc = registry.get("home").unwrap();

        let mut link = spawn_link(svc.clone(), test_config());
        let (mut relay, _) = listener.accept().await.unwrap();
        read_frame(&mut relay).await;
        read_frame(&mut relay).await;
        send(&mut relay, json!({"Op": "info", "Info": "login ok"}), &[]).await;

        send(
            &mut relay,
            json!({"Op": "delivery", "Id": "m1", "From": "u2", "Posted": "2026-01-03T00:00:00Z", "DataLen": 2}),
            b"hi",
        )
        .await;
        let (ack, _) = read_frame(&mut relay).await;
        assert_eq!(ack["Op"], 10);
        assert_eq!(ack["Id"], "m1");

        send(&mut relay, json!({"Op": "ping", "Id": "p1", "From": "u3"}), &[]).await;
        let (ack, _) = read_frame(&mut relay).await;
        assert_eq!(ack["Op"], 10);
        assert_eq!(ack["Id"], "p1");
        assert_eq!(*link.state.borrow(), LinkState::Authenticated);

        link.cmd_tx.send(LinkCommand::Shutdown).await.unwrap();
        let (quit, _) = read_frame(&mut relay).await;
        assert_eq!(quit["Op"], 11);
        while link.notif_rx.recv().await.is_some() {}
        link.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_register_then_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dir = tempfile::tempdir().unwrap();
        let svc = open_service(&dir, &addr, "");

        let mut link = spawn_link(svc.clone(), test_config());
        let (mut relay, _) = listener.accept().await.unwrap();
        read_frame(&mut relay).await;
        let (register, _) = read_frame(&mut relay).await;
        assert_eq!(register["Op"], 1);
        assert_eq!(register["NewAlias"], "ann");

        send(&mut relay, json!({"Op": "registered", "Uid": "u9", "NodeId": "n9"}), &[]).await;
        eventually(|| svc.config().uid == "u9").await;
        drop(relay);

        let (mut relay, _) = listener.accept().await.unwrap();
        read_frame(&mut relay).await;
        let (login, _) = read_frame(&mut relay).await;
        assert_eq!(login["Op"], 2);
        assert_eq!(login["Uid"], "u9");
        assert_eq!(login["Node"], "n9");

        link.cmd_tx.send(LinkCommand::Shutdown).await.unwrap();
        while link.notif_rx.recv().await.is_some() {}
        link.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_framing_error_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dir = tempfile::tempdir().unwrap();
        let svc = open_service(&dir, &addr, "u1");

        let mut link = spawn_link(svc.clone(), test_config());
        let (mut relay, _) = listener.accept().await.unwrap();
        read_frame(&mut relay).await;
        read_frame(&mut relay).await;
        relay.write_all(b"zzzz{\"Op\":\"info\"}").await.unwrap();

        let (mut again, _) = listener.accept().await.unwrap();
        let (rev, _) = read_frame(&mut again).await;
        assert_eq!(rev["Op"], 0);

        let mut saw_disconnect = false;
        while let Ok(Some(n)) = timeout(Duration::from_millis(200), link.notif_rx.recv()).await {
            if matches!(n, LinkNotification::Disconnected { .. }) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
        link.cmd_tx.send(LinkCommand::Shutdown).await.unwrap();
        while link.notif_rx.recv().await.is_some() {}
        link.task.await.unwrap();
    }
}
