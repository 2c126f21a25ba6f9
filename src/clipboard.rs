use std::time::Duration;

use thiserror::Error;

use crate::protocol::control::ControlMessage;
use crate::session::{Session, SessionError};

#[derive(Error, Debug)]
pub enum ClipboardError {
    #[error("control socket not connected")]
    NotConnected,

    #[error("control write failed")]
    Wire,

    #[error("unexpected value on the clipboard channel")]
    Mismatch,

    #[error("clipboard wait timed out")]
    Timeout,
}

impl From<SessionError> for ClipboardError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotConnected => ClipboardError::NotConnected,
            SessionError::Io(_) => ClipboardError::Wire,
        }
    }
}

async fn next_line(session: &Session, timeout: Duration) -> Result<String, ClipboardError> {
    let receive = async {
        let mut rx = session.clipboard_rx.lock().await;
        rx.recv().await
    };

    match tokio::time::timeout(timeout, receive).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(ClipboardError::Mismatch),
        Err(_) => Err(ClipboardError::Timeout),
    }
}

/// Ask the device for its clipboard. With `wait`, block for the response and
/// return the JSON-quoted text; the single channel slot means a concurrent
/// sequence ack can land here instead, which is a failure.
pub async fn get(
    session: &Session,
    cut: bool,
    wait: Option<Duration>,
) -> Result<Option<String>, ClipboardError> {
    session
        .write_control_message(&ControlMessage::GetClipboard { cut })
        .await?;

    let Some(timeout) = wait else {
        return Ok(None);
    };

    let line = next_line(session, timeout).await?;
    if line.starts_with('"') && line.ends_with('"') {
        Ok(Some(line))
    } else {
        Err(ClipboardError::Mismatch)
    }
}

/// Push text into the device clipboard. With a wait duration, require the
/// device to acknowledge exactly our sequence number; `sequence == 0`
/// disables acknowledgments on the device side.
pub async fn set(
    session: &Session,
    text: String,
    sequence: u64,
    paste: bool,
    wait: Option<Duration>,
) -> Result<(), ClipboardError> {
    session
        .write_control_message(&ControlMessage::SetClipboard {
            sequence,
            paste,
            text,
        })
        .await?;

    let Some(timeout) = wait else {
        return Ok(());
    };

    let line = next_line(session, timeout).await?;
    if line == sequence.to_string() {
        Ok(())
    } else {
        Err(ClipboardError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::session::run_port_worker;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Boot a control-only forward session against an in-process fake device
    async fn connected_session() -> (Arc<Session>, tokio::net::TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let port_config = PortConfig {
            control: true,
            forward: true,
            ..PortConfig::default()
        };
        let (session, connect_rx) = Session::new(port, &port_config);

        tokio::spawn(run_port_worker(
            Arc::clone(&session),
            Arc::new(crate::config::Config::default()),
            port_config,
            connect_rx,
        ));

        session.request_connect();

        let (mut device, _) = listener.accept().await.unwrap();
        device.write_all(&[0x00]).await.unwrap();
        device.write_all(&[0u8; 64]).await.unwrap();

        // Wait for the control writer to land
        for _ in 0..100 {
            if session.control_connected().await {
                return (session, device);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session did not connect");
    }

    #[tokio::test]
    async fn test_set_clipboard_ack_roundtrip() {
        let (session, mut device) = connected_session().await;

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                set(
                    &session,
                    "hi".to_string(),
                    42,
                    false,
                    Some(Duration::from_millis(500)),
                )
                .await
            })
        };

        // The wire carries exactly [0x09][seq][paste][len][text]
        let mut frame = vec![0u8; 16];
        device.read_exact(&mut frame).await.unwrap();
        let mut expected = vec![0x09];
        expected.extend_from_slice(&42u64.to_be_bytes());
        expected.push(0x00);
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"hi");
        assert_eq!(frame, expected);

        // Acknowledge with the matching sequence
        let mut ack = vec![1u8];
        ack.extend_from_slice(&42u64.to_be_bytes());
        device.write_all(&ack).await.unwrap();

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_set_clipboard_wrong_ack_fails() {
        let (session, mut device) = connected_session().await;

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                set(
                    &session,
                    "hi".to_string(),
                    42,
                    false,
                    Some(Duration::from_millis(500)),
                )
                .await
            })
        };

        let mut frame = vec![0u8; 16];
        device.read_exact(&mut frame).await.unwrap();

        let mut ack = vec![1u8];
        ack.extend_from_slice(&7u64.to_be_bytes());
        device.write_all(&ack).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(ClipboardError::Mismatch)
        ));
    }

    #[tokio::test]
    async fn test_set_clipboard_timeout() {
        let (session, mut device) = connected_session().await;

        let result = set(
            &session,
            "hi".to_string(),
            1,
            false,
            Some(Duration::from_millis(50)),
        )
        .await;

        assert!(matches!(result, Err(ClipboardError::Timeout)));

        let mut frame = vec![0u8; 16];
        device.read_exact(&mut frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_clipboard_returns_quoted_text() {
        let (session, mut device) = connected_session().await;

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                get(&session, false, Some(Duration::from_millis(500))).await
            })
        };

        let mut frame = vec![0u8; 2];
        device.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, vec![0x08, 0x01]);

        let mut record = vec![0u8];
        record.extend_from_slice(&5u32.to_be_bytes());
        record.extend_from_slice(b"hello");
        device.write_all(&record).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), Some("\"hello\"".to_string()));
    }

    #[tokio::test]
    async fn test_get_clipboard_cut_flag() {
        let (session, mut device) = connected_session().await;

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { get(&session, true, None).await })
        };

        let mut frame = vec![0u8; 2];
        device.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, vec![0x08, 0x02]);

        // Fire-and-forget succeeds without any device response
        assert_eq!(task.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_clipboard_without_control_socket() {
        let port_config = PortConfig::default();
        let (session, _rx) = Session::new(1, &port_config);

        assert!(matches!(
            get(&session, false, None).await,
            Err(ClipboardError::NotConnected)
        ));
    }
}
