use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::VideoDecoderConfig;
use crate::pump::{Framing, PumpEnd, pump_to_writer};
use crate::session::{DeviceMeta, MediaStream, Session};

fn bytes_per_pixel(alpha: bool) -> usize {
    if alpha { 4 } else { 3 }
}

fn codec_format(codec: u32) -> Option<&'static str> {
    match codec {
        0x68323634 => Some("h264"),
        0x68323635 => Some("hevc"),
        0x0061_7631 => Some("av1"),
        _ => None,
    }
}

/// Argv for the decoder subprocess. The custom protocol takes the codec id,
/// a stream-mode flag, and an alpha flag; FFmpeg takes a full demux/rawvideo
/// pipeline with a transpose matching the device orientation.
fn decoder_args(
    config: &VideoDecoderConfig,
    meta: &DeviceMeta,
    stream_mode: bool,
) -> Option<Vec<String>> {
    if config.ffmpeg {
        let format = codec_format(meta.video_codec)?;
        let transpose = if meta.initial_video_width >= meta.initial_video_height {
            "transpose=1:landscape"
        } else {
            "transpose=1:portrait"
        };

        Some(
            [
                "-probesize",
                "32",
                "-analyzeduration",
                "0",
                "-re",
                "-f",
                format,
                "-i",
                "-",
                "-f",
                "rawvideo",
                "-pix_fmt",
                if config.alpha { "rgba" } else { "rgb24" },
                "-vf",
                transpose,
                "-",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        )
    } else {
        Some(vec![
            meta.video_codec.to_string(),
            if stream_mode { "1" } else { "0" }.to_string(),
            if config.alpha { "1" } else { "0" }.to_string(),
        ])
    }
}

/// Packets fed to FFmpeg lose their framing; the custom decoder receives the
/// header too
fn feed_framing(config: &VideoDecoderConfig) -> Framing {
    if config.ffmpeg {
        Framing::PayloadOnly
    } else {
        Framing::Framed
    }
}

fn spawn_decoder(
    config: &VideoDecoderConfig,
    meta: &DeviceMeta,
    stream_mode: bool,
) -> std::io::Result<Child> {
    let args = decoder_args(config, meta, stream_mode).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "unsupported video codec")
    })?;

    Command::new(&config.executable)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
}

/// Long-lived snapshot worker for one port: every successful video connect
/// respawns the decoder and refreshes the session's most-recent-frame buffer
/// until the connection dies.
pub async fn run_snapshot_worker(session: Arc<Session>, config: VideoDecoderConfig) {
    loop {
        let media = {
            let mut rx = session.video_rx.lock().await;
            rx.recv().await
        };

        let Some(media) = media else { return };
        debug!(port = session.port, "Snapshot decoder attached");
        decode_connection(&session, &config, media).await;
    }
}

async fn decode_connection(session: &Arc<Session>, config: &VideoDecoderConfig, media: MediaStream) {
    let MediaStream {
        stream,
        meta,
        cancel,
    } = media;

    let mut child = match spawn_decoder(config, &meta, false) {
        Ok(child) => child,
        Err(e) => {
            warn!(port = session.port, "Failed to start video decoder: {e}");
            return;
        }
    };

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return;
    };

    let reader = if config.ffmpeg {
        // FFmpeg emits bare frames at the initial dimensions
        let width = meta.initial_video_width;
        let height = meta.initial_video_height;
        let size = width as usize * height as usize * bytes_per_pixel(config.alpha);
        {
            let mut buffer = session.frame.write();
            buffer.width = width;
            buffer.height = height;
            buffer.data.resize(size, 0);
        }
        tokio::spawn(read_fixed_frames(
            stdout,
            Arc::clone(session),
            size,
            width,
            height,
        ))
    } else {
        tokio::spawn(read_sized_frames(
            stdout,
            Arc::clone(session),
            config.alpha,
        ))
    };

    let end = pump_to_writer(stream, stdin, cancel, feed_framing(config)).await;
    if end == PumpEnd::Sink {
        session.request_disconnect();
    }

    let _ = child.kill().await;
    reader.abort();
}

/// Custom decoder protocol: each frame is prefixed with its dimensions
/// (native-endian u32 pair), which may change mid-stream
async fn read_sized_frames(mut stdout: ChildStdout, session: Arc<Session>, alpha: bool) {
    let bpp = bytes_per_pixel(alpha);
    let mut dims = [0u8; 8];
    let mut frame = Vec::new();
    let mut width = 0u32;
    let mut height = 0u32;

    loop {
        if stdout.read_exact(&mut dims).await.is_err() {
            return;
        }

        let w = u32::from_ne_bytes(dims[0..4].try_into().unwrap());
        let h = u32::from_ne_bytes(dims[4..8].try_into().unwrap());
        if w != width || h != height {
            width = w;
            height = h;
            frame = vec![0u8; w as usize * h as usize * bpp];
        }

        if frame.is_empty() || stdout.read_exact(&mut frame).await.is_err() {
            return;
        }

        let mut buffer = session.frame.write();
        buffer.width = width;
        buffer.height = height;
        buffer.data.clear();
        buffer.data.extend_from_slice(&frame);
    }
}

/// FFmpeg emits fixed-size frames with no per-frame header
async fn read_fixed_frames(
    mut stdout: ChildStdout,
    session: Arc<Session>,
    size: usize,
    width: u32,
    height: u32,
) {
    if size == 0 {
        return;
    }

    let mut frame = vec![0u8; size];
    loop {
        if stdout.read_exact(&mut frame).await.is_err() {
            return;
        }

        let mut buffer = session.frame.write();
        buffer.width = width;
        buffer.height = height;
        buffer.data.clear();
        buffer.data.extend_from_slice(&frame);
    }
}

/// Per-request streaming mode: spawn a decoder for this connection and hand
/// back a channel of raw RGB(A) frames for the response body.
pub fn spawn_stream_decoder(
    session: Arc<Session>,
    config: &VideoDecoderConfig,
    media: MediaStream,
) -> std::io::Result<mpsc::Receiver<Bytes>> {
    let MediaStream {
        stream,
        meta,
        cancel,
    } = media;

    let frame_size = meta.initial_video_width as usize
        * meta.initial_video_height as usize
        * bytes_per_pixel(config.alpha);
    if frame_size == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "zero-sized video frame",
        ));
    }

    let mut child = spawn_decoder(config, &meta, true)?;
    let (Some(stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(std::io::Error::other("decoder pipes unavailable"));
    };

    let framing = feed_framing(config);
    {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if pump_to_writer(stream, stdin, cancel, framing).await == PumpEnd::Sink {
                session.request_disconnect();
            }
        });
    }

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut frame = vec![0u8; frame_size];
        loop {
            if stdout.read_exact(&mut frame).await.is_err() {
                session.request_disconnect();
                break;
            }

            if tx.send(Bytes::copy_from_slice(&frame)).await.is_err() {
                let _ = child.kill().await;
                session.request_disconnect();
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::session::Session;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::sync::CancellationToken;

    fn meta(codec: u32, width: u32, height: u32) -> DeviceMeta {
        DeviceMeta {
            device_name: "dev".to_string(),
            video_codec: codec,
            audio_codec: 0,
            initial_video_width: width,
            initial_video_height: height,
        }
    }

    #[test]
    fn test_custom_decoder_args() {
        let config = VideoDecoderConfig {
            executable: "decoder".to_string(),
            stream: true,
            alpha: true,
            ffmpeg: false,
        };

        let args = decoder_args(&config, &meta(0x68323634, 1080, 2400), true).unwrap();
        assert_eq!(args, vec!["1748121140", "1", "1"]);

        let args = decoder_args(&config, &meta(0x68323634, 1080, 2400), false).unwrap();
        assert_eq!(args[1], "0");
    }

    #[test]
    fn test_ffmpeg_decoder_args() {
        let config = VideoDecoderConfig {
            executable: "ffmpeg".to_string(),
            stream: false,
            alpha: false,
            ffmpeg: true,
        };

        let args = decoder_args(&config, &meta(0x68323634, 2400, 1080), false).unwrap();
        let rendered = args.join(" ");
        assert!(rendered.contains("-f h264"));
        assert!(rendered.contains("-pix_fmt rgb24"));
        assert!(rendered.contains("transpose=1:landscape"));

        let args = decoder_args(&config, &meta(0x68323635, 1080, 2400), false).unwrap();
        let rendered = args.join(" ");
        assert!(rendered.contains("-f hevc"));
        assert!(rendered.contains("transpose=1:portrait"));

        // Unknown codec has no FFmpeg demuxer mapping
        assert!(decoder_args(&config, &meta(0x1234, 1080, 2400), false).is_none());
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    /// Drive the stream decoder with `cat` standing in for a real decoder:
    /// whatever we feed as one framed packet comes back as one frame.
    #[tokio::test]
    async fn test_stream_decoder_with_cat() {
        let (device_side, gateway_side) = tcp_pair().await;
        let mut device_side = device_side;

        let config = VideoDecoderConfig {
            executable: "cat".to_string(),
            stream: true,
            alpha: true,
            ffmpeg: false,
        };

        // 2x2 RGBA frame = 16 bytes; one framed packet (12B header + 4B
        // payload) echoed by cat is exactly one frame
        let media = MediaStream {
            stream: gateway_side,
            meta: meta(0x68323634, 2, 2),
            cancel: CancellationToken::new(),
        };

        let (session, _rx) = Session::new(1, &PortConfig::default());
        let mut frames = spawn_stream_decoder(session, &config, media).unwrap();

        let mut packet = Vec::new();
        packet.extend_from_slice(&1u64.to_be_bytes());
        packet.extend_from_slice(&4u32.to_be_bytes());
        packet.extend_from_slice(b"rgba");
        device_side.write_all(&packet).await.unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[12..], b"rgba");
    }
}
