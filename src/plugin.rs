use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::config::Config;
use crate::protocol::media;
use crate::session::{MediaStream, Session, SessionMap};

// Plugin stdin record tags
const RECORD_REQUEST: u8 = 0;
const RECORD_VIDEO_CONNECT: u8 = 1;
const RECORD_VIDEO_PACKET: u8 = 2;
const RECORD_AUDIO_CONNECT: u8 = 3;
const RECORD_AUDIO_PACKET: u8 = 4;
const RECORD_CLIPBOARD_TEXT: u8 = 5;
const RECORD_CLIPBOARD_SEQUENCE: u8 = 6;
const RECORD_UHID_OUTPUT: u8 = 7;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("failed to spawn plugin: {0}")]
    Spawn(std::io::Error),

    #[error("plugin self-description violated: {0}")]
    Protocol(&'static str),

    #[error("plugin IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct PluginIo {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

/// One spawned plugin process. Its stdin is a shared serial channel: the
/// mutex is held across every complete outgoing record, and across a whole
/// request/response exchange.
pub struct Plugin {
    pub id: String,
    pub single_endpoint: bool,
    io: Arc<Mutex<PluginIo>>,
    _child: Child,
}

/// All plugins plus the endpoint routing they declared
#[derive(Default)]
pub struct PluginSet {
    pub plugins: HashMap<String, Arc<Plugin>>,
    pub endpoints: HashMap<String, String>,
}

impl PluginSet {
    pub fn for_endpoint(&self, path: &str) -> Option<&Arc<Plugin>> {
        self.plugins.get(self.endpoints.get(path)?)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Plugin>> {
        self.plugins.get(id)
    }
}

/// Spawn every configured plugin and read its self-description. Any
/// violation is fatal to the gateway.
pub async fn load(config: &Config) -> Result<PluginSet, PluginError> {
    let mut set = PluginSet::default();

    for argv in &config.extensions {
        let Some(executable) = argv.first() else {
            return Err(PluginError::Protocol("empty plugin argv"));
        };

        let mut child = Command::new(executable)
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(PluginError::Spawn)?;

        let (Some(stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(PluginError::Protocol("plugin pipes unavailable"));
        };

        let described = read_self_description(&mut stdout).await;
        let (id, endpoints) = match described {
            Ok(description) => description,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        if set.plugins.contains_key(&id) {
            let _ = child.kill().await;
            return Err(PluginError::Protocol("duplicate plugin id"));
        }

        info!(id, ?endpoints, "Plugin loaded");

        for path in &endpoints {
            set.endpoints.insert(path.clone(), id.clone());
        }

        set.plugins.insert(
            id.clone(),
            Arc::new(Plugin {
                id,
                single_endpoint: endpoints.len() == 1,
                io: Arc::new(Mutex::new(PluginIo { stdin, stdout })),
                _child: child,
            }),
        );
    }

    Ok(set)
}

/// Parse the startup self-description: id, then the declared endpoint paths
async fn read_self_description<R>(stdout: &mut R) -> Result<(String, Vec<String>), PluginError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    stdout.read_exact(&mut len).await?;
    if len[0] < 1 {
        return Err(PluginError::Protocol("empty plugin id"));
    }

    let mut id = vec![0u8; len[0] as usize];
    stdout.read_exact(&mut id).await?;
    let id = String::from_utf8_lossy(&id).into_owned();

    stdout.read_exact(&mut len).await?;
    let endpoint_count = len[0] as usize;
    if endpoint_count < 1 {
        return Err(PluginError::Protocol("no endpoints declared"));
    }

    let mut endpoints = Vec::with_capacity(endpoint_count);
    for _ in 0..endpoint_count {
        stdout.read_exact(&mut len).await?;
        if len[0] < 2 {
            return Err(PluginError::Protocol("endpoint path too short"));
        }

        let mut path = vec![0u8; len[0] as usize];
        stdout.read_exact(&mut path).await?;
        let path = String::from_utf8_lossy(&path).trim().to_string();

        if !path.starts_with('/') || path.ends_with('/') {
            return Err(PluginError::Protocol("invalid endpoint path"));
        }

        endpoints.push(path);
    }

    Ok((id, endpoints))
}

/// Encode a delegated HTTP request. Multi-byte integers on the plugin
/// interface use the host's native byte order for compatibility with
/// existing plugins; only the first value of repeated parameters travels.
pub fn encode_request(
    port: u16,
    path: &str,
    single_endpoint: bool,
    query: &[(String, String)],
    headers: &[(String, String)],
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(RECORD_REQUEST);
    buf.extend_from_slice(&port.to_ne_bytes());

    if !single_endpoint {
        buf.push(path.len() as u8);
        buf.extend_from_slice(path.as_bytes());
    }

    for list in [query, headers] {
        buf.extend_from_slice(&(list.len() as u32).to_ne_bytes());
        for (name, value) in list {
            buf.extend_from_slice(&(name.len() as u32).to_ne_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_ne_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
    }

    buf
}

async fn read_status_and_headers<R>(stdout: &mut R) -> std::io::Result<(u16, Vec<(String, String)>)>
where
    R: AsyncRead + Unpin,
{
    let bad = || std::io::Error::new(std::io::ErrorKind::InvalidData, "bad plugin response");

    let mut head = [0u8; 3];
    stdout.read_exact(&mut head).await?;
    let status = u16::from_ne_bytes(head[0..2].try_into().unwrap());
    let header_count = head[2] as usize;

    let mut headers = Vec::with_capacity(header_count);
    let mut len = [0u8; 1];
    for _ in 0..header_count {
        stdout.read_exact(&mut len).await?;
        if len[0] < 1 {
            return Err(bad());
        }
        let mut name = vec![0u8; len[0] as usize];
        stdout.read_exact(&mut name).await?;

        stdout.read_exact(&mut len).await?;
        if len[0] < 1 {
            return Err(bad());
        }
        let mut value = vec![0u8; len[0] as usize];
        stdout.read_exact(&mut value).await?;

        headers.push((
            String::from_utf8_lossy(&name).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        ));
    }

    Ok((status, headers))
}

/// Read one body chunk; a zero size terminates the body
async fn read_chunk<R>(stdout: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut size = [0u8; 4];
    stdout.read_exact(&mut size).await?;
    let size = u32::from_ne_bytes(size) as usize;

    if size == 0 {
        return Ok(None);
    }

    let mut chunk = vec![0u8; size];
    stdout.read_exact(&mut chunk).await?;
    Ok(Some(chunk))
}

/// Read the command tail; the trailing target port is present whenever any
/// commands were returned
async fn read_command_tail<R>(stdout: &mut R) -> std::io::Result<(Vec<Vec<String>>, u16)>
where
    R: AsyncRead + Unpin,
{
    let bad = || std::io::Error::new(std::io::ErrorKind::InvalidData, "bad plugin command tail");

    let mut len = [0u8; 1];
    stdout.read_exact(&mut len).await?;
    let command_count = len[0] as usize;

    let mut commands = Vec::with_capacity(command_count);
    for _ in 0..command_count {
        stdout.read_exact(&mut len).await?;
        if len[0] < 1 {
            return Err(bad());
        }
        let argc = len[0] as usize;

        let mut command = Vec::with_capacity(argc);
        for index in 0..argc {
            stdout.read_exact(&mut len).await?;
            let mut arg = String::new();
            if len[0] > 0 {
                let mut bytes = vec![0u8; len[0] as usize];
                stdout.read_exact(&mut bytes).await?;
                arg = String::from_utf8_lossy(&bytes).into_owned();
            }

            // The verb position is lower-cased on receipt
            if index == 0 {
                arg = arg.to_lowercase();
            }
            command.push(arg);
        }
        commands.push(command);
    }

    let mut port = 0u16;
    if !commands.is_empty() {
        let mut bytes = [0u8; 2];
        stdout.read_exact(&mut bytes).await?;
        port = u16::from_ne_bytes(bytes);
    }

    Ok((commands, port))
}

/// Run one request/response exchange. Returns the status, response headers,
/// and a channel of body chunks; protocol violations silently drop the
/// response. Plugin-returned commands run asynchronously afterwards.
pub async fn exchange(
    plugin: Arc<Plugin>,
    port: u16,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    sessions: SessionMap,
    config: Arc<Config>,
) -> Option<(u16, Vec<(String, String)>, mpsc::Receiver<Bytes>)> {
    let mut io = Arc::clone(&plugin.io).lock_owned().await;

    let request = encode_request(port, &path, plugin.single_endpoint, &query, &headers);
    io.stdin.write_all(&request).await.ok()?;

    let (status, response_headers) = read_status_and_headers(&mut io.stdout).await.ok()?;

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        // Chunks are written through as they arrive; each one the plugin
        // flushes is observable in the HTTP response
        loop {
            match read_chunk(&mut io.stdout).await {
                Ok(Some(chunk)) => {
                    if tx.send(Bytes::from(chunk)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        drop(tx);

        let Ok((commands, tail_port)) = read_command_tail(&mut io.stdout).await else {
            return;
        };
        drop(io);

        if commands.is_empty() {
            return;
        }

        let target = if config.ports.len() == 1 {
            config.ports.keys().next().copied().unwrap_or(tail_port)
        } else {
            tail_port
        };

        let (Some(session), Some(port_config)) = (sessions.get(&target), config.ports.get(&target))
        else {
            return;
        };

        debug!(port = target, count = commands.len(), "Running plugin commands");
        crate::command::run_sequence(session, &config, port_config, &commands).await;
    });

    Some((status, response_headers, rx))
}

/// Write one stream record under the plugin mutex
async fn write_record(plugin: &Plugin, record: &[u8]) -> std::io::Result<()> {
    let mut io = plugin.io.lock().await;
    io.stdin.write_all(record).await
}

fn media_connect_record(tag: u8, port: u16, meta_fields: &[u32]) -> Vec<u8> {
    let mut record = vec![tag];
    record.extend_from_slice(&port.to_ne_bytes());
    for field in meta_fields {
        record.extend_from_slice(&field.to_ne_bytes());
    }
    record
}

fn media_packet_record(tag: u8, port: u16, packet: &media::MediaPacket) -> Vec<u8> {
    let mut record = Vec::with_capacity(3 + media::HEADER_LEN + packet.payload.len());
    record.push(tag);
    record.extend_from_slice(&port.to_ne_bytes());
    record.extend_from_slice(&packet.header);
    record.extend_from_slice(&packet.payload);
    record
}

/// Media pump bound to a plugin: announces each connect, then forwards every
/// framed packet. A plugin write failure requests teardown and ends the pump
/// for good; a device-side error just waits for the next connect.
async fn run_media_pump(plugin: Arc<Plugin>, session: Arc<Session>, video: bool) {
    let (connect_tag, packet_tag) = if video {
        (RECORD_VIDEO_CONNECT, RECORD_VIDEO_PACKET)
    } else {
        (RECORD_AUDIO_CONNECT, RECORD_AUDIO_PACKET)
    };

    loop {
        let media = {
            let receiver = if video {
                &session.video_rx
            } else {
                &session.audio_rx
            };
            let mut rx = receiver.lock().await;
            rx.recv().await
        };

        let Some(mut media) = media else { return };

        let connect = if video {
            media_connect_record(
                connect_tag,
                session.port,
                &[
                    media.meta.video_codec,
                    media.meta.initial_video_width,
                    media.meta.initial_video_height,
                ],
            )
        } else {
            media_connect_record(connect_tag, session.port, &[media.meta.audio_codec])
        };

        if write_record(&plugin, &connect).await.is_err() {
            session.request_disconnect();
            return;
        }

        loop {
            let packet = tokio::select! {
                _ = media.cancel.cancelled() => break,
                result = media::read_packet(&mut media.stream) => match result {
                    Ok(packet) => packet,
                    Err(_) => break,
                },
            };

            let record = media_packet_record(packet_tag, session.port, &packet);
            if write_record(&plugin, &record).await.is_err() {
                session.request_disconnect();
                return;
            }
        }
    }
}

/// Forward clipboard channel lines: JSON-quoted text as a text record,
/// decimal acknowledgments as a sequence record
async fn run_clipboard_pump(plugin: Arc<Plugin>, session: Arc<Session>) {
    loop {
        let line = {
            let mut rx = session.clipboard_rx.lock().await;
            rx.recv().await
        };
        let Some(line) = line else { return };

        let record = if let Ok(sequence) = line.parse::<u64>() {
            let mut record = vec![RECORD_CLIPBOARD_SEQUENCE];
            record.extend_from_slice(&session.port.to_ne_bytes());
            record.extend_from_slice(&sequence.to_ne_bytes());
            record
        } else {
            let mut record = vec![RECORD_CLIPBOARD_TEXT];
            record.extend_from_slice(&session.port.to_ne_bytes());
            record.extend_from_slice(&(line.len() as u32).to_ne_bytes());
            record.extend_from_slice(line.as_bytes());
            record
        };

        if write_record(&plugin, &record).await.is_err() {
            session.request_disconnect();
            return;
        }
    }
}

async fn run_uhid_output_pump(plugin: Arc<Plugin>, session: Arc<Session>) {
    loop {
        let line = {
            let mut rx = session.uhid_output_rx.lock().await;
            rx.recv().await
        };
        let Some(line) = line else { return };

        let Ok(data) = hex::decode(&line) else {
            session.request_disconnect();
            return;
        };

        let mut record = vec![RECORD_UHID_OUTPUT];
        record.extend_from_slice(&session.port.to_ne_bytes());
        record.extend_from_slice(&(data.len() as u16).to_ne_bytes());
        record.extend_from_slice(&data);

        if write_record(&plugin, &record).await.is_err() {
            session.request_disconnect();
            return;
        }
    }
}

/// Spawn the per-port stream pumps for every feature bound to a plugin.
/// Bindings naming an unknown plugin id are inert.
pub fn start_stream_pumps(config: &Config, sessions: &SessionMap, plugins: &PluginSet) {
    for (port, port_config) in &config.ports {
        let Some(session) = sessions.get(port) else {
            continue;
        };

        if port_config.video
            && !port_config.video_extension.is_empty()
            && let Some(plugin) = plugins.get(&port_config.video_extension)
        {
            tokio::spawn(run_media_pump(
                Arc::clone(plugin),
                Arc::clone(session),
                true,
            ));
        }

        if port_config.audio
            && !port_config.audio_extension.is_empty()
            && let Some(plugin) = plugins.get(&port_config.audio_extension)
        {
            tokio::spawn(run_media_pump(
                Arc::clone(plugin),
                Arc::clone(session),
                false,
            ));
        }

        if port_config.control {
            if !port_config.clipboard_stream_extension.is_empty()
                && let Some(plugin) = plugins.get(&port_config.clipboard_stream_extension)
            {
                tokio::spawn(run_clipboard_pump(Arc::clone(plugin), Arc::clone(session)));
            }

            if !port_config.uhid_keyboard_report_desc.is_empty()
                && !port_config.uhid_keyboard_output_extension.is_empty()
                && let Some(plugin) = plugins.get(&port_config.uhid_keyboard_output_extension)
            {
                tokio::spawn(run_uhid_output_pump(Arc::clone(plugin), Arc::clone(session)));
            }
        }
    }
}
