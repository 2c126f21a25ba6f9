use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL};
use thiserror::Error;
use tracing::debug;

use crate::adb;
use crate::clipboard::{self, ClipboardError};
use crate::config::{Config, PortConfig};
use crate::protocol::control::{
    ControlMessage, POINTER_ID_MOUSE, POINTER_ID_TOUCH, SCROLL_TICK, UHID_ID_GAMEPAD,
    UHID_ID_KEYBOARD, UHID_ID_MOUSE, uhid_gamepad_report, uhid_keyboard_report, uhid_mouse_report,
};
use crate::protocol::keycode::keycode;
use crate::session::{Session, SessionError};

/// Why a command halted. Sequences stop silently on the first error; the
/// synchronous single-command HTTP path maps these to status codes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error("malformed command")]
    Invalid,

    #[error("channel contested")]
    Busy,

    #[error("required resource not present")]
    Unavailable,

    #[error("control write failed")]
    Wire,

    #[error("wait timed out")]
    Timeout,
}

impl From<SessionError> for CommandError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotConnected => CommandError::Unavailable,
            SessionError::Io(_) => CommandError::Wire,
        }
    }
}

impl From<ClipboardError> for CommandError {
    fn from(e: ClipboardError) -> Self {
        match e {
            ClipboardError::NotConnected => CommandError::Unavailable,
            ClipboardError::Wire | ClipboardError::Mismatch => CommandError::Wire,
            ClipboardError::Timeout => CommandError::Timeout,
        }
    }
}

/// Verbs that may run before the control socket is connected
const PRE_CONTROL_VERBS: [&str; 7] = [
    "connect",
    "disconnect",
    "startscrcpyserver",
    "sleep",
    "adb",
    "setconnectedcommands",
    "createuhiddevices",
];

/// Run an ordered command sequence; the first failure halts it silently.
/// A `setconnectedcommands` takes effect once the sequence is done.
pub async fn run_sequence(
    session: &Arc<Session>,
    config: &Arc<Config>,
    port_config: &PortConfig,
    commands: &[Vec<String>],
) {
    let mut pending_connected: Option<String> = None;

    for command in commands {
        if let Err(e) = execute(session, config, port_config, command, &mut pending_connected).await
        {
            debug!(port = session.port, ?command, "Command halted: {e}");
            break;
        }
    }

    apply_pending(session, pending_connected);
}

/// Run one command for the synchronous HTTP path
pub async fn run_command(
    session: &Arc<Session>,
    config: &Arc<Config>,
    port_config: &PortConfig,
    command: &[String],
) -> Result<(), CommandError> {
    let mut pending_connected: Option<String> = None;
    let result = execute(session, config, port_config, command, &mut pending_connected).await;
    apply_pending(session, pending_connected);
    result
}

fn apply_pending(session: &Session, pending: Option<String>) {
    if let Some(json) = pending
        && let Ok(commands) = serde_json::from_str::<Vec<Vec<String>>>(&json)
    {
        session.set_connected_commands(commands);
    }
}

async fn execute(
    session: &Arc<Session>,
    config: &Arc<Config>,
    port_config: &PortConfig,
    command: &[String],
    pending_connected: &mut Option<String>,
) -> Result<(), CommandError> {
    let Some(verb) = command.first() else {
        return Err(CommandError::Invalid);
    };
    let verb = verb.as_str();
    let args = &command[1..];

    if !session.control_connected().await && !PRE_CONTROL_VERBS.contains(&verb) {
        return Err(CommandError::Unavailable);
    }

    match verb {
        "connect" => {
            arity(args, &[0])?;
            if session.request_connect() {
                Ok(())
            } else {
                Err(CommandError::Busy)
            }
        }

        "disconnect" => {
            arity(args, &[0])?;
            if adb::server_running(session).await {
                return Err(CommandError::Busy);
            }
            if session.request_disconnect() {
                Ok(())
            } else {
                Err(CommandError::Busy)
            }
        }

        "startscrcpyserver" => {
            if adb::start_server(session, config, port_config, args).await {
                Ok(())
            } else {
                Err(CommandError::Unavailable)
            }
        }

        "stopscrcpyserver" => {
            arity(args, &[0])?;
            if adb::stop_server(session).await {
                Ok(())
            } else {
                Err(CommandError::Unavailable)
            }
        }

        "createuhiddevices" => {
            let devices: [(u16, &str, &str, &str, &str); 3] = match args.len() {
                3 => [
                    (UHID_ID_KEYBOARD, args[0].as_str(), "", "", ""),
                    (UHID_ID_MOUSE, args[1].as_str(), "", "", ""),
                    (UHID_ID_GAMEPAD, args[2].as_str(), "", "", ""),
                ],
                12 => [
                    (
                        UHID_ID_KEYBOARD,
                        args[0].as_str(),
                        args[1].as_str(),
                        args[2].as_str(),
                        args[3].as_str(),
                    ),
                    (
                        UHID_ID_MOUSE,
                        args[4].as_str(),
                        args[5].as_str(),
                        args[6].as_str(),
                        args[7].as_str(),
                    ),
                    (
                        UHID_ID_GAMEPAD,
                        args[8].as_str(),
                        args[9].as_str(),
                        args[10].as_str(),
                        args[11].as_str(),
                    ),
                ],
                _ => return Err(CommandError::Invalid),
            };

            for (id, desc_hex, name, vendor, product) in devices {
                if desc_hex.is_empty() {
                    continue;
                }

                let descriptor = hex::decode(desc_hex).map_err(|_| CommandError::Invalid)?;
                let frame = ControlMessage::UhidCreate {
                    id,
                    vendor_id: optional_u16(vendor)?,
                    product_id: optional_u16(product)?,
                    name: name.to_string(),
                    descriptor,
                };
                session.write_control_message(&frame).await?;
            }
            Ok(())
        }

        "key" | "key2" => {
            arity(args, &[1, 4])?;

            let code = if verb == "key" {
                keycode(&args[0]).ok_or(CommandError::Invalid)?
            } else {
                int(&args[0])? as u32
            };

            if args.len() == 1 {
                send_keycode(session, false, code, 0, 0).await?;
                send_keycode(session, true, code, 0, 0).await
            } else {
                let up = parse_bool(&args[1])?;
                let repeat = int(&args[2])? as u32;
                let meta_state = int(&args[3])? as u32;
                send_keycode(session, up, code, repeat, meta_state).await
            }
        }

        "key3" => {
            arity(args, &[1, 2])?;
            let scancode = int(&args[0])? as u8;

            if args.len() == 1 {
                send_uhid(session, UHID_ID_KEYBOARD, uhid_keyboard_report(0, scancode)).await?;
                if scancode != 0 {
                    send_uhid(session, UHID_ID_KEYBOARD, uhid_keyboard_report(0, 0)).await?;
                }
                Ok(())
            } else {
                let modifiers = int(&args[1])? as u8;
                send_uhid(session, UHID_ID_KEYBOARD, uhid_keyboard_report(modifiers, scancode))
                    .await
            }
        }

        "type" | "typebase64" | "typebase64url" | "typehex" => {
            arity(args, &[1])?;
            if args[0].is_empty() {
                return Err(CommandError::Invalid);
            }

            let encoding = &verb[4..];
            let text = decode_text(encoding, &args[0])?;
            session
                .write_control_message(&ControlMessage::InjectText { text })
                .await?;
            Ok(())
        }

        "touch" | "touchdown" | "touchup" | "touchmove" => {
            if verb == "touch" {
                arity(args, &[4, 5])?;
            } else {
                arity(args, &[4])?;
            }

            let x = int(&args[0])? as u32;
            let y = int(&args[1])? as u32;
            let width = int(&args[2])? as u16;
            let height = int(&args[3])? as u16;

            match verb {
                "touchdown" => {
                    sdk_touch(session, 0, POINTER_ID_TOUCH, x, y, width, height, 1).await
                }
                "touchup" => sdk_touch(session, 1, POINTER_ID_TOUCH, x, y, width, height, 1).await,
                "touchmove" => {
                    sdk_touch(session, 2, POINTER_ID_TOUCH, x, y, width, height, 1).await
                }
                _ => {
                    sdk_touch(session, 0, POINTER_ID_TOUCH, x, y, width, height, 1).await?;
                    if args.len() == 5 {
                        sleep(&args[4]).await?;
                    }
                    sdk_touch(session, 1, POINTER_ID_TOUCH, x, y, width, height, 1).await
                }
            }
        }

        "mouseclick" => {
            arity(args, &[3, 4, 5, 6])?;
            let button = mouse_button(&args[0]);
            let x = int(&args[1])?;
            let y = int(&args[2])?;

            match args.len() {
                3 | 4 => {
                    send_uhid(
                        session,
                        UHID_ID_MOUSE,
                        uhid_mouse_report(button as u8, x as i8, y as i8, 0),
                    )
                    .await?;
                    if args.len() == 4 {
                        sleep(&args[3]).await?;
                    }
                    send_uhid(session, UHID_ID_MOUSE, uhid_mouse_report(0, 0, 0, 0)).await
                }
                _ => {
                    let width = int(&args[3])? as u16;
                    let height = int(&args[4])? as u16;
                    sdk_touch(
                        session,
                        0,
                        POINTER_ID_MOUSE,
                        x as u32,
                        y as u32,
                        width,
                        height,
                        button,
                    )
                    .await?;
                    if args.len() == 6 {
                        sleep(&args[5]).await?;
                    }
                    sdk_touch(
                        session,
                        1,
                        POINTER_ID_MOUSE,
                        x as u32,
                        y as u32,
                        width,
                        height,
                        button,
                    )
                    .await
                }
            }
        }

        "mousedown" => {
            arity(args, &[3, 5])?;
            let button = mouse_button(&args[0]);
            let x = int(&args[1])?;
            let y = int(&args[2])?;

            if args.len() == 3 {
                send_uhid(
                    session,
                    UHID_ID_MOUSE,
                    uhid_mouse_report(button as u8, x as i8, y as i8, 0),
                )
                .await
            } else {
                let width = int(&args[3])? as u16;
                let height = int(&args[4])? as u16;
                sdk_touch(
                    session,
                    0,
                    POINTER_ID_MOUSE,
                    x as u32,
                    y as u32,
                    width,
                    height,
                    button,
                )
                .await
            }
        }

        "mouseup" => {
            arity(args, &[0, 5])?;

            if args.is_empty() {
                send_uhid(session, UHID_ID_MOUSE, uhid_mouse_report(0, 0, 0, 0)).await
            } else {
                let button = mouse_button(&args[0]);
                let x = int(&args[1])? as u32;
                let y = int(&args[2])? as u32;
                let width = int(&args[3])? as u16;
                let height = int(&args[4])? as u16;
                sdk_touch(session, 1, POINTER_ID_MOUSE, x, y, width, height, button).await
            }
        }

        "mousemove" => {
            arity(args, &[2, 3, 5])?;

            match args.len() {
                2 => {
                    let x = int(&args[0])?;
                    let y = int(&args[1])?;
                    send_uhid(
                        session,
                        UHID_ID_MOUSE,
                        uhid_mouse_report(0, x as i8, y as i8, 0),
                    )
                    .await
                }
                3 => {
                    let button = mouse_button(&args[0]);
                    let x = int(&args[1])?;
                    let y = int(&args[2])?;
                    send_uhid(
                        session,
                        UHID_ID_MOUSE,
                        uhid_mouse_report(button as u8, x as i8, y as i8, 0),
                    )
                    .await
                }
                _ => {
                    let button = mouse_button(&args[0]);
                    let x = int(&args[1])? as u32;
                    let y = int(&args[2])? as u32;
                    let width = int(&args[3])? as u16;
                    let height = int(&args[4])? as u16;
                    sdk_touch(session, 2, POINTER_ID_MOUSE, x, y, width, height, button).await
                }
            }
        }

        "scrollleft" | "scrollright" | "scrollup" | "scrolldown" => {
            let direction = &verb[6..];

            match args.len() {
                0 | 2 => {
                    // UHID wheel; only a vertical axis exists on the mouse report
                    let wheel: i8 = match direction {
                        "up" => 1,
                        "down" => -1,
                        _ => return Ok(()),
                    };
                    send_uhid(session, UHID_ID_MOUSE, uhid_mouse_report(0, 0, 0, wheel)).await
                }
                4 => {
                    let x = int(&args[0])? as u32;
                    let y = int(&args[1])? as u32;
                    let width = int(&args[2])? as u16;
                    let height = int(&args[3])? as u16;

                    let (hscroll, vscroll) = match direction {
                        "left" => (-SCROLL_TICK, 0),
                        "right" => (SCROLL_TICK, 0),
                        "up" => (0, SCROLL_TICK),
                        _ => (0, -SCROLL_TICK),
                    };

                    session
                        .write_control_message(&ControlMessage::InjectScroll {
                            x,
                            y,
                            width,
                            height,
                            hscroll,
                            vscroll,
                            buttons: 0,
                        })
                        .await?;
                    Ok(())
                }
                _ => Err(CommandError::Invalid),
            }
        }

        "gamepadinput" => {
            arity(args, &[8])?;
            let report = uhid_gamepad_report(
                int(&args[0])? as u16,
                int(&args[1])? as u16,
                int(&args[2])? as u16,
                int(&args[3])? as u16,
                int(&args[4])? as u16,
                int(&args[5])? as u16,
                int(&args[6])? as u16,
                int(&args[7])? as u8,
            );
            send_uhid(session, UHID_ID_GAMEPAD, report).await
        }

        "openhardkeyboardsettings" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::OpenHardKeyboardSettings).await
        }

        "backorscreenon" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::BackOrScreenOn).await
        }

        "expandnotificationspanel" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::ExpandNotificationsPanel).await
        }

        "expandsettingspanel" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::ExpandSettingsPanel).await
        }

        "collapsepanels" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::CollapsePanels).await
        }

        "turnscreenon" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::SetScreenPower { on: true }).await
        }

        "turnscreenoff" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::SetScreenPower { on: false }).await
        }

        "rotate" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::Rotate).await
        }

        "startapp" => {
            arity(args, &[1])?;
            if args[0].is_empty() || args[0].len() > 255 {
                return Err(CommandError::Invalid);
            }
            simple(
                session,
                ControlMessage::StartApp {
                    name: args[0].clone(),
                },
            )
            .await
        }

        "resetvideo" => {
            arity(args, &[0])?;
            simple(session, ControlMessage::ResetVideo).await
        }

        "senddata" => {
            arity(args, &[1])?;
            let data = hex::decode(&args[0]).map_err(|_| CommandError::Invalid)?;
            if data.is_empty() {
                return Err(CommandError::Invalid);
            }
            session.write_control(&data).await?;
            Ok(())
        }

        "getclipboard" | "getclipboardcut" => {
            arity(args, &[0])?;
            clipboard::get(session, verb == "getclipboardcut", None).await?;
            Ok(())
        }

        "setclipboard"
        | "setclipboardbase64"
        | "setclipboardbase64url"
        | "setclipboardhex"
        | "setclipboardpaste"
        | "setclipboardpastebase64"
        | "setclipboardpastebase64url"
        | "setclipboardpastehex" => {
            arity(args, &[1, 2, 3])?;

            let rest = &verb["setclipboard".len()..];
            let (paste, encoding) = match rest.strip_prefix("paste") {
                Some(encoding) => (true, encoding),
                None => (false, rest),
            };

            let text = decode_text(encoding, &args[0])?;

            let sequence = if args.len() > 1 {
                args[1].parse::<u64>().map_err(|_| CommandError::Invalid)?
            } else {
                0
            };

            let wait = if args.len() == 3 {
                let timeout =
                    humantime::parse_duration(&args[2]).map_err(|_| CommandError::Invalid)?;
                (!timeout.is_zero()).then_some(timeout)
            } else {
                None
            };

            clipboard::set(session, text, sequence, paste, wait).await?;
            Ok(())
        }

        "sleep" => {
            arity(args, &[1])?;
            sleep(&args[0]).await
        }

        "adb" => {
            if args.is_empty() {
                return Err(CommandError::Invalid);
            }
            if adb::run_passthrough(config, port_config, args).await {
                Ok(())
            } else {
                Err(CommandError::Wire)
            }
        }

        "setconnectedcommands" => {
            arity(args, &[1])?;
            *pending_connected = Some(args[0].clone());
            Ok(())
        }

        _ => Err(CommandError::Invalid),
    }
}

/// Expand `${name}` tokens from query parameters; missing names expand empty
pub fn expand_command(tokens: &[String], query: &HashMap<String, String>) -> Vec<String> {
    tokens.iter().map(|t| expand_token(t, query)).collect()
}

fn expand_token(token: &str, query: &HashMap<String, String>) -> String {
    let mut out = String::new();
    let mut rest = token;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(value) = query.get(name) {
                    out.push_str(value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

fn arity(args: &[String], allowed: &[usize]) -> Result<(), CommandError> {
    if allowed.contains(&args.len()) {
        Ok(())
    } else {
        Err(CommandError::Invalid)
    }
}

fn int(value: &str) -> Result<i64, CommandError> {
    value.parse().map_err(|_| CommandError::Invalid)
}

fn optional_u16(value: &str) -> Result<u16, CommandError> {
    if value.is_empty() {
        Ok(0)
    } else {
        value.parse().map_err(|_| CommandError::Invalid)
    }
}

pub(crate) fn decode_text(encoding: &str, value: &str) -> Result<String, CommandError> {
    let bytes = match encoding {
        "" => return Ok(value.to_string()),
        "base64" => BASE64.decode(value).map_err(|_| CommandError::Invalid)?,
        "base64url" => BASE64_URL.decode(value).map_err(|_| CommandError::Invalid)?,
        "hex" => hex::decode(value).map_err(|_| CommandError::Invalid)?,
        _ => return Err(CommandError::Invalid),
    };

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_bool(value: &str) -> Result<bool, CommandError> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(CommandError::Invalid),
    }
}

/// Mouse button mask; unknown names fall through to no button
pub fn mouse_button(value: &str) -> u32 {
    match value {
        "1" | "left" => 1,
        "2" | "right" => 2,
        "4" | "middle" => 4,
        _ => 0,
    }
}

async fn sleep(duration: &str) -> Result<(), CommandError> {
    let duration = humantime::parse_duration(duration).map_err(|_| CommandError::Invalid)?;
    tokio::time::sleep(duration).await;
    Ok(())
}

async fn simple(session: &Session, msg: ControlMessage) -> Result<(), CommandError> {
    session.write_control_message(&msg).await?;
    Ok(())
}

async fn send_keycode(
    session: &Session,
    up: bool,
    keycode: u32,
    repeat: u32,
    meta_state: u32,
) -> Result<(), CommandError> {
    simple(
        session,
        ControlMessage::InjectKeycode {
            up,
            keycode,
            repeat,
            meta_state,
        },
    )
    .await
}

async fn send_uhid(session: &Session, id: u16, payload: Vec<u8>) -> Result<(), CommandError> {
    simple(session, ControlMessage::UhidInput { id, payload }).await
}

/// SDK pointer event shared by the touch and mouse verbs. The up action
/// carries zero pressure and an empty pressed mask.
#[allow(clippy::too_many_arguments)]
async fn sdk_touch(
    session: &Session,
    action: u8,
    pointer_id: i64,
    x: u32,
    y: u32,
    width: u16,
    height: u16,
    button: u32,
) -> Result<(), CommandError> {
    simple(
        session,
        ControlMessage::InjectTouch {
            action,
            pointer_id,
            x,
            y,
            width,
            height,
            pressure: if action != 1 { 0xFFFF } else { 0 },
            buttons_down: button,
            buttons_pressed: if action != 1 { button } else { 0 },
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::run_port_worker;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_session() -> (Arc<Session>, TcpStream, Arc<Config>, PortConfig) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let port_config = PortConfig {
            control: true,
            forward: true,
            ..PortConfig::default()
        };
        let (session, connect_rx) = Session::new(port, &port_config);
        let config = Arc::new(Config::default());

        tokio::spawn(run_port_worker(
            Arc::clone(&session),
            Arc::clone(&config),
            port_config.clone(),
            connect_rx,
        ));

        session.request_connect();

        let (mut device, _) = listener.accept().await.unwrap();
        device.write_all(&[0x00]).await.unwrap();
        device.write_all(&[0u8; 64]).await.unwrap();

        for _ in 0..100 {
            if session.control_connected().await {
                return (session, device, config, port_config);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session did not connect");
    }

    async fn assert_no_more_data(device: &mut TcpStream) {
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), device.read(&mut byte)).await;
        assert!(read.is_err(), "unexpected extra bytes on the control socket");
    }

    #[tokio::test]
    async fn test_key_press_emits_down_and_up() {
        let (session, mut device, config, port_config) = connected_session().await;

        run_command(
            &session,
            &config,
            &port_config,
            &["key".to_string(), "home".to_string()],
        )
        .await
        .unwrap();

        let mut frames = [0u8; 28];
        device.read_exact(&mut frames).await.unwrap();
        assert_eq!(
            &frames[..14],
            &[0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            &frames[14..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_unknown_key_halts() {
        let (session, mut device, config, port_config) = connected_session().await;

        let result = run_command(
            &session,
            &config,
            &port_config,
            &["key".to_string(), "nosuchkey".to_string()],
        )
        .await;

        assert_eq!(result, Err(CommandError::Invalid));
        assert_no_more_data(&mut device).await;
    }

    #[tokio::test]
    async fn test_sequence_halts_on_bad_verb() {
        let (session, mut device, config, port_config) = connected_session().await;

        let commands = vec![
            vec![
                "touch".to_string(),
                "10".to_string(),
                "20".to_string(),
                "100".to_string(),
                "200".to_string(),
            ],
            vec!["unknown".to_string()],
            vec!["key".to_string(), "home".to_string()],
        ];

        run_sequence(&session, &config, &port_config, &commands).await;

        // The touch emitted exactly two 32-byte frames; the trailing key
        // command never ran
        let mut frames = [0u8; 64];
        device.read_exact(&mut frames).await.unwrap();
        assert_eq!(frames[0], 0x02);
        assert_eq!(frames[1], 0); // down
        assert_eq!(frames[32], 0x02);
        assert_eq!(frames[33], 1); // up
        assert_no_more_data(&mut device).await;
    }

    #[tokio::test]
    async fn test_pre_gate_blocks_input_verbs() {
        let port_config = PortConfig::default();
        let (session, _rx) = Session::new(1, &port_config);
        let config = Arc::new(Config::default());

        let result = run_command(
            &session,
            &config,
            &port_config,
            &["rotate".to_string()],
        )
        .await;
        assert_eq!(result, Err(CommandError::Unavailable));

        // sleep is allowed before the control socket exists
        let result = run_command(
            &session,
            &config,
            &port_config,
            &["sleep".to_string(), "1ms".to_string()],
        )
        .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_connect_is_busy_when_contested() {
        let port_config = PortConfig::default();
        // No worker drains the channel, so the second signal is contested
        let (session, _rx) = Session::new(1, &port_config);
        let config = Arc::new(Config::default());

        let first = run_command(&session, &config, &port_config, &["connect".to_string()]).await;
        assert_eq!(first, Ok(()));

        let second = run_command(&session, &config, &port_config, &["connect".to_string()]).await;
        assert_eq!(second, Err(CommandError::Busy));
    }

    #[tokio::test]
    async fn test_senddata_writes_raw_bytes() {
        let (session, mut device, config, port_config) = connected_session().await;

        run_command(
            &session,
            &config,
            &port_config,
            &["senddata".to_string(), "0b".to_string()],
        )
        .await
        .unwrap();

        let mut byte = [0u8; 1];
        device.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], 0x0B);
    }

    #[tokio::test]
    async fn test_typebase64_decodes_before_injecting() {
        let (session, mut device, config, port_config) = connected_session().await;

        // "aGk=" is "hi"
        run_command(
            &session,
            &config,
            &port_config,
            &["typebase64".to_string(), "aGk=".to_string()],
        )
        .await
        .unwrap();

        let mut frame = [0u8; 7];
        device.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], 0x01);
        assert_eq!(&frame[1..5], &2u32.to_be_bytes());
        assert_eq!(&frame[5..], b"hi");
    }

    #[tokio::test]
    async fn test_startapp_rejects_long_names() {
        let (session, mut device, config, port_config) = connected_session().await;

        let result = run_command(
            &session,
            &config,
            &port_config,
            &["startapp".to_string(), "x".repeat(256)],
        )
        .await;

        assert_eq!(result, Err(CommandError::Invalid));
        assert_no_more_data(&mut device).await;
    }

    #[tokio::test]
    async fn test_setconnectedcommands_applies_after_sequence() {
        let (session, _device, config, port_config) = connected_session().await;

        run_sequence(
            &session,
            &config,
            &port_config,
            &[vec![
                "setconnectedcommands".to_string(),
                r#"[["rotate"]]"#.to_string(),
            ]],
        )
        .await;

        assert_eq!(
            session.connected_commands(),
            vec![vec!["rotate".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_scroll_up_uses_uhid_wheel() {
        let (session, mut device, config, port_config) = connected_session().await;

        run_command(&session, &config, &port_config, &["scrollup".to_string()])
            .await
            .unwrap();

        let mut frame = [0u8; 9];
        device.read_exact(&mut frame).await.unwrap();
        assert_eq!(
            frame,
            [0x0D, 0x00, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_expand_command() {
        let mut query = HashMap::new();
        query.insert("x".to_string(), "10".to_string());
        query.insert("pkg".to_string(), "org.example".to_string());

        let tokens = vec![
            "touch".to_string(),
            "${x}".to_string(),
            "${y}".to_string(),
            "app=${pkg}!".to_string(),
        ];
        assert_eq!(
            expand_command(&tokens, &query),
            vec!["touch", "10", "", "app=org.example!"]
        );

        // Unterminated markers stay literal
        assert_eq!(expand_token("${x", &query), "${x");
    }

    #[test]
    fn test_mouse_button_names() {
        assert_eq!(mouse_button("left"), 1);
        assert_eq!(mouse_button("2"), 2);
        assert_eq!(mouse_button("middle"), 4);
        assert_eq!(mouse_button("other"), 0);
    }
}
