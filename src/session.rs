use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, PortConfig};
use crate::protocol::control::{
    self, ControlMessage, DeviceEvent, UHID_ID_GAMEPAD, UHID_ID_KEYBOARD, UHID_ID_MOUSE,
};

/// Forward-mode dialing: up to 100 attempts spaced 100 ms apart
const DIAL_ATTEMPTS: u32 = 100;
const DIAL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("control socket not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device metadata captured during the connect handshake
#[derive(Debug, Clone, Default)]
pub struct DeviceMeta {
    pub device_name: String,
    pub video_codec: u32,
    pub audio_codec: u32,
    pub initial_video_width: u32,
    pub initial_video_height: u32,
}

/// A freshly connected media socket, handed to exactly one pump per connect
/// through the session's connected channel. Ownership of the socket is the
/// rendezvous: the session cannot race past pump setup, and no second pump
/// can read the same connect.
pub struct MediaStream {
    pub stream: TcpStream,
    pub meta: DeviceMeta,
    pub cancel: CancellationToken,
}

/// Most recent decoded RGB(A) frame, refreshed by the snapshot decoder worker
#[derive(Default)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub type SessionMap = Arc<HashMap<u16, Arc<Session>>>;

/// Per-port runtime state. Created once at startup; the paired port worker
/// owns the sockets and drives the connect/teardown state machine.
pub struct Session {
    pub port: u16,

    connect_tx: mpsc::Sender<bool>,

    video_tx: mpsc::Sender<MediaStream>,
    pub video_rx: SharedReceiver<MediaStream>,

    audio_tx: mpsc::Sender<MediaStream>,
    pub audio_rx: SharedReceiver<MediaStream>,

    clipboard_tx: mpsc::Sender<String>,
    pub clipboard_rx: SharedReceiver<String>,

    uhid_output_tx: mpsc::Sender<String>,
    pub uhid_output_rx: SharedReceiver<String>,

    meta: RwLock<DeviceMeta>,

    control_writer: Mutex<Option<OwnedWriteHalf>>,

    /// Cancellation for pumps belonging to the current connect
    cancel: parking_lot::Mutex<CancellationToken>,

    /// Supervised scrcpy server child, owned by the ADB supervisor verbs
    pub scrcpy_server: Mutex<Option<Child>>,

    pub frame: RwLock<FrameBuffer>,

    connected_commands: RwLock<Vec<Vec<String>>>,
}

fn shared_channel<T>(capacity: usize) -> (mpsc::Sender<T>, SharedReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, Arc::new(Mutex::new(rx)))
}

impl Session {
    /// Create the session state plus the receiver end of the connection
    /// control channel, which belongs to the port worker.
    pub fn new(port: u16, port_config: &PortConfig) -> (Arc<Session>, mpsc::Receiver<bool>) {
        let (connect_tx, connect_rx) = mpsc::channel(1);
        let (video_tx, video_rx) = shared_channel(1);
        let (audio_tx, audio_rx) = shared_channel(1);
        let (clipboard_tx, clipboard_rx) = shared_channel(1);
        let (uhid_output_tx, uhid_output_rx) = shared_channel(1);

        let session = Arc::new(Session {
            port,
            connect_tx,
            video_tx,
            video_rx,
            audio_tx,
            audio_rx,
            clipboard_tx,
            clipboard_rx,
            uhid_output_tx,
            uhid_output_rx,
            meta: RwLock::new(DeviceMeta::default()),
            control_writer: Mutex::new(None),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            scrcpy_server: Mutex::new(None),
            frame: RwLock::new(FrameBuffer::default()),
            connected_commands: RwLock::new(port_config.connected_commands.clone()),
        });

        (session, connect_rx)
    }

    /// Ask the port worker to connect. Non-blocking; returns false when the
    /// request is contested (slot already occupied).
    pub fn request_connect(&self) -> bool {
        self.connect_tx.try_send(true).is_ok()
    }

    /// Ask the port worker to tear the connection down. Non-blocking,
    /// best-effort: a full slot drops the signal.
    pub fn request_disconnect(&self) -> bool {
        self.connect_tx.try_send(false).is_ok()
    }

    pub fn meta(&self) -> DeviceMeta {
        self.meta.read().clone()
    }

    /// Cancellation token of the current connect
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub async fn control_connected(&self) -> bool {
        self.control_writer.lock().await.is_some()
    }

    /// Write one control frame to the device. Frames are whole records, so
    /// serializing writers here keeps them intact on the wire.
    pub async fn write_control(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.control_writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;
        writer.write_all(data).await?;
        Ok(())
    }

    pub async fn write_control_message(&self, msg: &ControlMessage) -> Result<(), SessionError> {
        self.write_control(&msg.to_bytes()).await
    }

    pub fn connected_commands(&self) -> Vec<Vec<String>> {
        self.connected_commands.read().clone()
    }

    pub fn set_connected_commands(&self, commands: Vec<Vec<String>>) {
        *self.connected_commands.write() = commands;
    }

    /// Close everything belonging to the current connect: cancel pumps, drop
    /// the control writer, and drain any unconsumed stream handles.
    async fn teardown(&self) {
        let previous = {
            let mut guard = self.cancel.lock();
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        previous.cancel();

        self.control_writer.lock().await.take();

        // A receiver blocked in recv() holds the lock but also guarantees the
        // slot is empty, so skipping on contention is correct.
        if let Ok(mut rx) = self.video_rx.try_lock() {
            let _ = rx.try_recv();
        }
        if let Ok(mut rx) = self.audio_rx.try_lock() {
            let _ = rx.try_recv();
        }
    }
}

enum ConnectFailure {
    /// This attempt is abandoned; the worker returns to Idle
    Retry,

    /// The port stops accepting connects entirely
    Fatal,
}

/// Long-lived worker owning one port's sockets, driven exclusively by the
/// connection control channel: `true` connects, `false` tears down.
pub async fn run_port_worker(
    session: Arc<Session>,
    config: Arc<Config>,
    port_config: PortConfig,
    mut connect_rx: mpsc::Receiver<bool>,
) {
    let listener = if port_config.forward {
        None
    } else {
        match TcpListener::bind(("127.0.0.1", session.port)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(port = session.port, "Failed to bind device listener: {e}");
                return;
            }
        }
    };

    while let Some(connect) = connect_rx.recv().await {
        session.teardown().await;

        if !connect {
            debug!(port = session.port, "Session torn down");
            continue;
        }

        match establish(&session, &config, &port_config, listener.as_ref()).await {
            Ok(()) => info!(port = session.port, "Session connected"),
            Err(ConnectFailure::Retry) => {
                debug!(port = session.port, "Connect attempt abandoned");
                session.teardown().await;
            }
            Err(ConnectFailure::Fatal) => {
                warn!(port = session.port, "Port worker stopping");
                return;
            }
        }
    }
}

async fn establish(
    session: &Arc<Session>,
    config: &Arc<Config>,
    port_config: &PortConfig,
    listener: Option<&TcpListener>,
) -> Result<(), ConnectFailure> {
    let mut first = true;

    let mut video_socket = if port_config.video {
        Some(open_socket(session.port, port_config, listener, &mut first).await?)
    } else {
        None
    };

    let mut audio_socket = if port_config.audio {
        Some(open_socket(session.port, port_config, listener, &mut first).await?)
    } else {
        None
    };

    let mut control_socket = if port_config.control {
        Some(open_socket(session.port, port_config, listener, &mut first).await?)
    } else {
        None
    };

    // Device metadata arrives on the first feature-enabled socket
    let meta_socket = video_socket
        .as_mut()
        .or(audio_socket.as_mut())
        .or(control_socket.as_mut())
        .ok_or(ConnectFailure::Fatal)?;

    let device_name = read_device_name(meta_socket)
        .await
        .map_err(|_| ConnectFailure::Retry)?;

    let mut meta = DeviceMeta {
        device_name,
        ..DeviceMeta::default()
    };

    if let Some(socket) = video_socket.as_mut() {
        let mut header = [0u8; 12];
        socket
            .read_exact(&mut header)
            .await
            .map_err(|_| ConnectFailure::Retry)?;
        meta.video_codec = u32::from_be_bytes(header[0..4].try_into().unwrap());
        meta.initial_video_width = u32::from_be_bytes(header[4..8].try_into().unwrap());
        meta.initial_video_height = u32::from_be_bytes(header[8..12].try_into().unwrap());
    }

    if let Some(socket) = audio_socket.as_mut() {
        let mut header = [0u8; 4];
        socket
            .read_exact(&mut header)
            .await
            .map_err(|_| ConnectFailure::Retry)?;
        meta.audio_codec = u32::from_be_bytes(header);
    }

    *session.meta.write() = meta.clone();

    let cancel = session.cancel_token();

    if let Some(mut socket) = control_socket {
        register_uhid_devices(&mut socket, port_config)
            .await
            .map_err(|_| ConnectFailure::Retry)?;

        let (read_half, write_half) = socket.into_split();
        *session.control_writer.lock().await = Some(write_half);

        tokio::spawn(control_ingress(
            read_half,
            Arc::clone(session),
            cancel.clone(),
        ));
    }

    if let Some(stream) = video_socket {
        let _ = session
            .video_tx
            .send(MediaStream {
                stream,
                meta: meta.clone(),
                cancel: cancel.clone(),
            })
            .await;
    }

    if let Some(stream) = audio_socket {
        let _ = session
            .audio_tx
            .send(MediaStream {
                stream,
                meta: meta.clone(),
                cancel: cancel.clone(),
            })
            .await;
    }

    let connected = session.connected_commands();
    if !connected.is_empty() {
        let session = Arc::clone(session);
        let config = Arc::clone(config);
        let port_config = port_config.clone();
        tokio::spawn(async move {
            crate::command::run_sequence(&session, &config, &port_config, &connected).await;
        });
    }

    Ok(())
}

/// Open the next socket in the fixed order. In forward mode this dials the
/// device tunnel with retries, consuming the tunnel-ready dummy byte on the
/// first socket; otherwise it accepts from the bound listener.
async fn open_socket(
    port: u16,
    port_config: &PortConfig,
    listener: Option<&TcpListener>,
    first: &mut bool,
) -> Result<TcpStream, ConnectFailure> {
    let mut socket = if port_config.forward {
        dial(port).await?
    } else {
        let listener = listener.ok_or(ConnectFailure::Fatal)?;
        let (socket, _) = listener.accept().await.map_err(|_| ConnectFailure::Fatal)?;
        socket
    };

    if *first {
        *first = false;

        if port_config.forward {
            let mut dummy = [0u8; 1];
            socket
                .read_exact(&mut dummy)
                .await
                .map_err(|_| ConnectFailure::Retry)?;
        }
    }

    Ok(socket)
}

async fn dial(port: u16) -> Result<TcpStream, ConnectFailure> {
    for attempt in 0..DIAL_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(DIAL_BACKOFF).await;
        }

        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(socket) => {
                let _ = socket.set_nodelay(true);
                return Ok(socket);
            }
            Err(e) => debug!(port, attempt, "Dial failed: {e}"),
        }
    }

    warn!(port, "Giving up dialing the device tunnel");
    Err(ConnectFailure::Fatal)
}

/// Read the 64-byte device metadata block; the name is the prefix up to the
/// first NUL byte.
async fn read_device_name(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut data = [0u8; 64];
    socket.read_exact(&mut data).await?;

    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).into_owned())
}

async fn register_uhid_devices(
    socket: &mut TcpStream,
    port_config: &PortConfig,
) -> std::io::Result<()> {
    let devices = [
        (
            UHID_ID_KEYBOARD,
            &port_config.uhid_keyboard_report_desc,
            &port_config.uhid_keyboard_name,
            port_config.uhid_keyboard_vendor_id,
            port_config.uhid_keyboard_product_id,
        ),
        (
            UHID_ID_MOUSE,
            &port_config.uhid_mouse_report_desc,
            &port_config.uhid_mouse_name,
            port_config.uhid_mouse_vendor_id,
            port_config.uhid_mouse_product_id,
        ),
        (
            UHID_ID_GAMEPAD,
            &port_config.uhid_gamepad_report_desc,
            &port_config.uhid_gamepad_name,
            port_config.uhid_gamepad_vendor_id,
            port_config.uhid_gamepad_product_id,
        ),
    ];

    for (id, desc_hex, name, vendor_id, product_id) in devices {
        if desc_hex.is_empty() {
            continue;
        }

        // Validated at startup
        let descriptor = hex::decode(desc_hex)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad descriptor"))?;

        let frame = ControlMessage::UhidCreate {
            id,
            vendor_id,
            product_id,
            name: name.clone(),
            descriptor,
        };
        socket.write_all(&frame.to_bytes()).await?;
    }

    Ok(())
}

/// Per-connect reader consuming device -> host records on the control socket
/// and fanning them out to the session channels. Never touches the sockets
/// beyond its own read half.
async fn control_ingress(
    mut reader: OwnedReadHalf,
    session: Arc<Session>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            result = control::read_device_event(&mut reader) => match result {
                Ok(event) => event,
                Err(_) => return,
            },
        };

        match event {
            DeviceEvent::Clipboard { text } => {
                // Delivered as a JSON-quoted string; senders queue up rather
                // than block this reader
                let line = serde_json::Value::String(text).to_string();
                let tx = session.clipboard_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(line).await;
                });
            }
            DeviceEvent::ClipboardAck { sequence } => {
                let tx = session.clipboard_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(sequence.to_string()).await;
                });
            }
            DeviceEvent::UhidOutput { id, data } => {
                if id == UHID_ID_KEYBOARD {
                    let _ = session.uhid_output_tx.try_send(hex::encode(data));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::media;
    use tokio::io::AsyncWriteExt;

    fn forward_port_config() -> PortConfig {
        PortConfig {
            video: true,
            control: true,
            forward: true,
            ..PortConfig::default()
        }
    }

    async fn fake_device() -> (TcpListener, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn device_metadata(name: &str) -> Vec<u8> {
        let mut block = vec![0u8; 64];
        block[..name.len()].copy_from_slice(name.as_bytes());
        block
    }

    #[tokio::test]
    async fn test_forward_connect_handshake() {
        let (listener, port) = fake_device().await;
        let port_config = forward_port_config();
        let (session, connect_rx) = Session::new(port, &port_config);

        let config = Arc::new(Config::default());
        tokio::spawn(run_port_worker(
            Arc::clone(&session),
            config,
            port_config,
            connect_rx,
        ));

        assert!(session.request_connect());

        // Video socket: dummy byte, metadata, initial video record
        let (mut device_video, _) = listener.accept().await.unwrap();
        device_video.write_all(&[0x00]).await.unwrap();
        device_video
            .write_all(&device_metadata("Pixel 8"))
            .await
            .unwrap();
        let mut initial = Vec::new();
        initial.extend_from_slice(&0x68323634u32.to_be_bytes());
        initial.extend_from_slice(&1080u32.to_be_bytes());
        initial.extend_from_slice(&2400u32.to_be_bytes());
        device_video.write_all(&initial).await.unwrap();

        // Control socket
        let (mut device_control, _) = listener.accept().await.unwrap();

        // The connected channel releases exactly one waiter with the stream
        let mut media = {
            let mut rx = session.video_rx.lock().await;
            rx.recv().await.unwrap()
        };
        assert_eq!(media.meta.device_name, "Pixel 8");
        assert_eq!(media.meta.video_codec, 0x68323634);
        assert_eq!(media.meta.initial_video_width, 1080);
        assert_eq!(media.meta.initial_video_height, 2400);

        // Media packets flow through untouched
        let mut frame = Vec::new();
        frame.extend_from_slice(&7u64.to_be_bytes());
        frame.extend_from_slice(&3u32.to_be_bytes());
        frame.extend_from_slice(b"abc");
        device_video.write_all(&frame).await.unwrap();

        let packet = media::read_packet(&mut media.stream).await.unwrap();
        assert_eq!(packet.payload.as_ref(), b"abc");

        // Control writes reach the device
        assert!(session.control_connected().await);
        session
            .write_control_message(&ControlMessage::Rotate)
            .await
            .unwrap();
        let mut tag = [0u8; 1];
        device_control.read_exact(&mut tag).await.unwrap();
        assert_eq!(tag[0], 0x0B);

        // Device -> host records land on the session channels
        let mut ack = vec![1u8];
        ack.extend_from_slice(&42u64.to_be_bytes());
        device_control.write_all(&ack).await.unwrap();

        let line = {
            let mut rx = session.clipboard_rx.lock().await;
            rx.recv().await.unwrap()
        };
        assert_eq!(line, "42");
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pumps() {
        let (listener, port) = fake_device().await;
        let port_config = forward_port_config();
        let (session, connect_rx) = Session::new(port, &port_config);

        tokio::spawn(run_port_worker(
            Arc::clone(&session),
            Arc::new(Config::default()),
            port_config,
            connect_rx,
        ));

        session.request_connect();

        let (mut device_video, _) = listener.accept().await.unwrap();
        device_video.write_all(&[0x00]).await.unwrap();
        device_video.write_all(&device_metadata("dev")).await.unwrap();
        device_video.write_all(&[0u8; 12]).await.unwrap();
        let (_device_control, _) = listener.accept().await.unwrap();

        let media = {
            let mut rx = session.video_rx.lock().await;
            rx.recv().await.unwrap()
        };
        assert!(!media.cancel.is_cancelled());

        session.request_disconnect();
        media.cancel.cancelled().await;

        // The worker drops the control writer right after cancelling
        for _ in 0..50 {
            if !session.control_connected().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("control writer still present after teardown");
    }

    #[tokio::test]
    async fn test_uhid_devices_registered_on_connect() {
        let (listener, port) = fake_device().await;
        let port_config = PortConfig {
            control: true,
            forward: true,
            uhid_keyboard_report_desc: "aabb".to_string(),
            uhid_keyboard_vendor_id: 0x1234,
            ..PortConfig::default()
        };
        let (session, connect_rx) = Session::new(port, &port_config);

        tokio::spawn(run_port_worker(
            Arc::clone(&session),
            Arc::new(Config::default()),
            port_config,
            connect_rx,
        ));

        session.request_connect();

        // Control is the only enabled socket, so it carries the dummy byte
        // and the metadata block before the UHID registration arrives
        let (mut device_control, _) = listener.accept().await.unwrap();
        device_control.write_all(&[0x00]).await.unwrap();
        device_control
            .write_all(&device_metadata("dev"))
            .await
            .unwrap();

        let mut frame = vec![0u8; 12];
        device_control.read_exact(&mut frame).await.unwrap();
        assert_eq!(
            frame,
            vec![0x0C, 0x00, 0x01, 0x12, 0x34, 0x00, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB]
        );
    }

    #[tokio::test]
    async fn test_connect_slot_is_single() {
        let port_config = forward_port_config();
        let (session, _connect_rx) = Session::new(1, &port_config);

        // Nobody is draining the channel, so only the first signal fits
        assert!(session.request_connect());
        assert!(!session.request_disconnect());
    }
}
