use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Result, WireError};

// Host -> device message tags
const TYPE_INJECT_KEYCODE: u8 = 0x00;
const TYPE_INJECT_TEXT: u8 = 0x01;
const TYPE_INJECT_TOUCH: u8 = 0x02;
const TYPE_INJECT_SCROLL: u8 = 0x03;
const TYPE_BACK_OR_SCREEN_ON: u8 = 0x04;
const TYPE_EXPAND_NOTIFICATIONS: u8 = 0x05;
const TYPE_EXPAND_SETTINGS: u8 = 0x06;
const TYPE_COLLAPSE_PANELS: u8 = 0x07;
const TYPE_GET_CLIPBOARD: u8 = 0x08;
const TYPE_SET_CLIPBOARD: u8 = 0x09;
const TYPE_SET_SCREEN_POWER: u8 = 0x0A;
const TYPE_ROTATE: u8 = 0x0B;
const TYPE_UHID_CREATE: u8 = 0x0C;
const TYPE_UHID_INPUT: u8 = 0x0D;
const TYPE_OPEN_HARD_KEYBOARD_SETTINGS: u8 = 0x0F;
const TYPE_START_APP: u8 = 0x10;
const TYPE_RESET_VIDEO: u8 = 0x11;

/// Pointer id used for SDK touch events
pub const POINTER_ID_TOUCH: i64 = -2;

/// Pointer id used for SDK mouse events
pub const POINTER_ID_MOUSE: i64 = -1;

/// Scroll sentinel written for a full tick in either axis
pub const SCROLL_TICK: i16 = 0x7FFF;

/// UHID device ids registered by the gateway
pub const UHID_ID_KEYBOARD: u16 = 1;
pub const UHID_ID_MOUSE: u16 = 2;
pub const UHID_ID_GAMEPAD: u16 = 3;

/// Control messages written host -> device.
///
/// Every message is a self-contained tagged frame; multi-byte integers are
/// big-endian. `to_bytes`/`from_bytes` are exact inverses, which the tests
/// rely on to check the recorded wire bytes against the structured form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    InjectKeycode {
        up: bool,
        keycode: u32,
        repeat: u32,
        meta_state: u32,
    },

    InjectText {
        text: String,
    },

    InjectTouch {
        action: u8,
        pointer_id: i64,
        x: u32,
        y: u32,
        width: u16,
        height: u16,
        pressure: u16,
        buttons_down: u32,
        buttons_pressed: u32,
    },

    InjectScroll {
        x: u32,
        y: u32,
        width: u16,
        height: u16,
        hscroll: i16,
        vscroll: i16,
        buttons: u32,
    },

    /// Back key press, or screen-on when the display is off; encoded as a
    /// down/up pair of 0x04 events
    BackOrScreenOn,

    ExpandNotificationsPanel,

    ExpandSettingsPanel,

    CollapsePanels,

    /// Request the device clipboard; `cut` empties it on the device
    GetClipboard {
        cut: bool,
    },

    /// Push text into the device clipboard; a non-zero `sequence` asks the
    /// device for an acknowledgment carrying the same value
    SetClipboard {
        sequence: u64,
        paste: bool,
        text: String,
    },

    SetScreenPower {
        on: bool,
    },

    Rotate,

    /// Create a UHID device on the device side
    UhidCreate {
        id: u16,
        vendor_id: u16,
        product_id: u16,
        name: String,
        descriptor: Vec<u8>,
    },

    /// Feed an input report to a previously created UHID device
    UhidInput {
        id: u16,
        payload: Vec<u8>,
    },

    OpenHardKeyboardSettings,

    StartApp {
        name: String,
    },

    ResetVideo,
}

impl ControlMessage {
    /// Serialize to the wire representation
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            ControlMessage::InjectKeycode {
                up,
                keycode,
                repeat,
                meta_state,
            } => {
                buf.put_u8(TYPE_INJECT_KEYCODE);
                buf.put_u8(u8::from(*up));
                buf.put_u32(*keycode);
                buf.put_u32(*repeat);
                buf.put_u32(*meta_state);
            }
            ControlMessage::InjectText { text } => {
                buf.put_u8(TYPE_INJECT_TEXT);
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            ControlMessage::InjectTouch {
                action,
                pointer_id,
                x,
                y,
                width,
                height,
                pressure,
                buttons_down,
                buttons_pressed,
            } => {
                buf.put_u8(TYPE_INJECT_TOUCH);
                buf.put_u8(*action);
                buf.put_i64(*pointer_id);
                buf.put_u32(*x);
                buf.put_u32(*y);
                buf.put_u16(*width);
                buf.put_u16(*height);
                buf.put_u16(*pressure);
                buf.put_u32(*buttons_down);
                buf.put_u32(*buttons_pressed);
            }
            ControlMessage::InjectScroll {
                x,
                y,
                width,
                height,
                hscroll,
                vscroll,
                buttons,
            } => {
                buf.put_u8(TYPE_INJECT_SCROLL);
                buf.put_u32(*x);
                buf.put_u32(*y);
                buf.put_u16(*width);
                buf.put_u16(*height);
                buf.put_i16(*hscroll);
                buf.put_i16(*vscroll);
                buf.put_u32(*buttons);
            }
            ControlMessage::BackOrScreenOn => {
                buf.put_slice(&[TYPE_BACK_OR_SCREEN_ON, 0x00, TYPE_BACK_OR_SCREEN_ON, 0x01]);
            }
            ControlMessage::ExpandNotificationsPanel => buf.put_u8(TYPE_EXPAND_NOTIFICATIONS),
            ControlMessage::ExpandSettingsPanel => buf.put_u8(TYPE_EXPAND_SETTINGS),
            ControlMessage::CollapsePanels => buf.put_u8(TYPE_COLLAPSE_PANELS),
            ControlMessage::GetClipboard { cut } => {
                buf.put_u8(TYPE_GET_CLIPBOARD);
                buf.put_u8(if *cut { 0x02 } else { 0x01 });
            }
            ControlMessage::SetClipboard {
                sequence,
                paste,
                text,
            } => {
                buf.put_u8(TYPE_SET_CLIPBOARD);
                buf.put_u64(*sequence);
                buf.put_u8(u8::from(*paste));
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            ControlMessage::SetScreenPower { on } => {
                buf.put_u8(TYPE_SET_SCREEN_POWER);
                buf.put_u8(if *on { 0x02 } else { 0x00 });
            }
            ControlMessage::Rotate => buf.put_u8(TYPE_ROTATE),
            ControlMessage::UhidCreate {
                id,
                vendor_id,
                product_id,
                name,
                descriptor,
            } => {
                buf.put_u8(TYPE_UHID_CREATE);
                buf.put_u16(*id);
                buf.put_u16(*vendor_id);
                buf.put_u16(*product_id);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(descriptor.len() as u16);
                buf.put_slice(descriptor);
            }
            ControlMessage::UhidInput { id, payload } => {
                buf.put_u8(TYPE_UHID_INPUT);
                buf.put_u16(*id);
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
            ControlMessage::OpenHardKeyboardSettings => {
                buf.put_u8(TYPE_OPEN_HARD_KEYBOARD_SETTINGS)
            }
            ControlMessage::StartApp { name } => {
                buf.put_u8(TYPE_START_APP);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
            ControlMessage::ResetVideo => buf.put_u8(TYPE_RESET_VIDEO),
        }

        buf.freeze()
    }

    /// Parse one message from the front of `data`, returning it together with
    /// the number of bytes consumed
    pub fn from_bytes(data: &[u8]) -> Result<(ControlMessage, usize)> {
        let short = WireError::Malformed("truncated control message");

        let Some(&tag) = data.first() else {
            return Err(short);
        };

        match tag {
            TYPE_INJECT_KEYCODE => {
                if data.len() < 14 {
                    return Err(short);
                }
                Ok((
                    ControlMessage::InjectKeycode {
                        up: data[1] != 0,
                        keycode: u32::from_be_bytes(data[2..6].try_into().unwrap()),
                        repeat: u32::from_be_bytes(data[6..10].try_into().unwrap()),
                        meta_state: u32::from_be_bytes(data[10..14].try_into().unwrap()),
                    },
                    14,
                ))
            }
            TYPE_INJECT_TEXT => {
                if data.len() < 5 {
                    return Err(short);
                }
                let len = u32::from_be_bytes(data[1..5].try_into().unwrap()) as usize;
                if data.len() < 5 + len {
                    return Err(short);
                }
                Ok((
                    ControlMessage::InjectText {
                        text: String::from_utf8_lossy(&data[5..5 + len]).into_owned(),
                    },
                    5 + len,
                ))
            }
            TYPE_INJECT_TOUCH => {
                if data.len() < 32 {
                    return Err(short);
                }
                Ok((
                    ControlMessage::InjectTouch {
                        action: data[1],
                        pointer_id: i64::from_be_bytes(data[2..10].try_into().unwrap()),
                        x: u32::from_be_bytes(data[10..14].try_into().unwrap()),
                        y: u32::from_be_bytes(data[14..18].try_into().unwrap()),
                        width: u16::from_be_bytes(data[18..20].try_into().unwrap()),
                        height: u16::from_be_bytes(data[20..22].try_into().unwrap()),
                        pressure: u16::from_be_bytes(data[22..24].try_into().unwrap()),
                        buttons_down: u32::from_be_bytes(data[24..28].try_into().unwrap()),
                        buttons_pressed: u32::from_be_bytes(data[28..32].try_into().unwrap()),
                    },
                    32,
                ))
            }
            TYPE_INJECT_SCROLL => {
                if data.len() < 21 {
                    return Err(short);
                }
                Ok((
                    ControlMessage::InjectScroll {
                        x: u32::from_be_bytes(data[1..5].try_into().unwrap()),
                        y: u32::from_be_bytes(data[5..9].try_into().unwrap()),
                        width: u16::from_be_bytes(data[9..11].try_into().unwrap()),
                        height: u16::from_be_bytes(data[11..13].try_into().unwrap()),
                        hscroll: i16::from_be_bytes(data[13..15].try_into().unwrap()),
                        vscroll: i16::from_be_bytes(data[15..17].try_into().unwrap()),
                        buttons: u32::from_be_bytes(data[17..21].try_into().unwrap()),
                    },
                    21,
                ))
            }
            TYPE_BACK_OR_SCREEN_ON => {
                if data.len() < 4 || data[1] != 0x00 || data[2] != TYPE_BACK_OR_SCREEN_ON || data[3] != 0x01 {
                    return Err(WireError::Malformed("bad back-or-screen-on pair"));
                }
                Ok((ControlMessage::BackOrScreenOn, 4))
            }
            TYPE_EXPAND_NOTIFICATIONS => Ok((ControlMessage::ExpandNotificationsPanel, 1)),
            TYPE_EXPAND_SETTINGS => Ok((ControlMessage::ExpandSettingsPanel, 1)),
            TYPE_COLLAPSE_PANELS => Ok((ControlMessage::CollapsePanels, 1)),
            TYPE_GET_CLIPBOARD => {
                if data.len() < 2 {
                    return Err(short);
                }
                Ok((
                    ControlMessage::GetClipboard {
                        cut: data[1] == 0x02,
                    },
                    2,
                ))
            }
            TYPE_SET_CLIPBOARD => {
                if data.len() < 14 {
                    return Err(short);
                }
                let len = u32::from_be_bytes(data[10..14].try_into().unwrap()) as usize;
                if data.len() < 14 + len {
                    return Err(short);
                }
                Ok((
                    ControlMessage::SetClipboard {
                        sequence: u64::from_be_bytes(data[1..9].try_into().unwrap()),
                        paste: data[9] != 0,
                        text: String::from_utf8_lossy(&data[14..14 + len]).into_owned(),
                    },
                    14 + len,
                ))
            }
            TYPE_SET_SCREEN_POWER => {
                if data.len() < 2 {
                    return Err(short);
                }
                Ok((ControlMessage::SetScreenPower { on: data[1] == 0x02 }, 2))
            }
            TYPE_ROTATE => Ok((ControlMessage::Rotate, 1)),
            TYPE_UHID_CREATE => {
                if data.len() < 8 {
                    return Err(short);
                }
                let name_len = data[7] as usize;
                if data.len() < 10 + name_len {
                    return Err(short);
                }
                let desc_len = u16::from_be_bytes(
                    data[8 + name_len..10 + name_len].try_into().unwrap(),
                ) as usize;
                if data.len() < 10 + name_len + desc_len {
                    return Err(short);
                }
                Ok((
                    ControlMessage::UhidCreate {
                        id: u16::from_be_bytes(data[1..3].try_into().unwrap()),
                        vendor_id: u16::from_be_bytes(data[3..5].try_into().unwrap()),
                        product_id: u16::from_be_bytes(data[5..7].try_into().unwrap()),
                        name: String::from_utf8_lossy(&data[8..8 + name_len]).into_owned(),
                        descriptor: data[10 + name_len..10 + name_len + desc_len].to_vec(),
                    },
                    10 + name_len + desc_len,
                ))
            }
            TYPE_UHID_INPUT => {
                if data.len() < 5 {
                    return Err(short);
                }
                let len = u16::from_be_bytes(data[3..5].try_into().unwrap()) as usize;
                if data.len() < 5 + len {
                    return Err(short);
                }
                Ok((
                    ControlMessage::UhidInput {
                        id: u16::from_be_bytes(data[1..3].try_into().unwrap()),
                        payload: data[5..5 + len].to_vec(),
                    },
                    5 + len,
                ))
            }
            TYPE_OPEN_HARD_KEYBOARD_SETTINGS => Ok((ControlMessage::OpenHardKeyboardSettings, 1)),
            TYPE_START_APP => {
                if data.len() < 2 {
                    return Err(short);
                }
                let len = data[1] as usize;
                if data.len() < 2 + len {
                    return Err(short);
                }
                Ok((
                    ControlMessage::StartApp {
                        name: String::from_utf8_lossy(&data[2..2 + len]).into_owned(),
                    },
                    2 + len,
                ))
            }
            TYPE_RESET_VIDEO => Ok((ControlMessage::ResetVideo, 1)),
            _ => Err(WireError::Malformed("unknown control message tag")),
        }
    }
}

/// UHID keyboard input report: 8 bytes, modifiers in byte 0, scancode in byte 2
pub fn uhid_keyboard_report(modifiers: u8, scancode: u8) -> Vec<u8> {
    let mut report = vec![0u8; 8];
    report[0] = modifiers;
    report[2] = scancode;
    report
}

/// UHID mouse input report: button, x, y, wheel
pub fn uhid_mouse_report(button: u8, x: i8, y: i8, wheel: i8) -> Vec<u8> {
    vec![button, x as u8, y as u8, wheel as u8]
}

/// UHID gamepad input report: 15 bytes, little-endian within the payload
pub fn uhid_gamepad_report(
    left_x: u16,
    left_y: u16,
    right_x: u16,
    right_y: u16,
    left_trigger: u16,
    right_trigger: u16,
    buttons: u16,
    dpad: u8,
) -> Vec<u8> {
    let mut report = Vec::with_capacity(15);
    report.extend_from_slice(&left_x.to_le_bytes());
    report.extend_from_slice(&left_y.to_le_bytes());
    report.extend_from_slice(&right_x.to_le_bytes());
    report.extend_from_slice(&right_y.to_le_bytes());
    report.extend_from_slice(&left_trigger.to_le_bytes());
    report.extend_from_slice(&right_trigger.to_le_bytes());
    report.extend_from_slice(&buttons.to_le_bytes());
    report.push(dpad);
    report
}

/// Tagged records read device -> host on the control socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device clipboard content (tag 0)
    Clipboard { text: String },

    /// Acknowledgment of a set-clipboard sequence (tag 1)
    ClipboardAck { sequence: u64 },

    /// Output report from a UHID device (tag 2)
    UhidOutput { id: u16, data: Vec<u8> },
}

/// Read one device -> host record from the control socket
pub async fn read_device_event<R>(reader: &mut R) -> Result<DeviceEvent>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).await?;

    match tag[0] {
        0 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len).await?;
            let mut text = vec![0u8; u32::from_be_bytes(len) as usize];
            reader.read_exact(&mut text).await?;
            Ok(DeviceEvent::Clipboard {
                text: String::from_utf8_lossy(&text).into_owned(),
            })
        }
        1 => {
            let mut seq = [0u8; 8];
            reader.read_exact(&mut seq).await?;
            Ok(DeviceEvent::ClipboardAck {
                sequence: u64::from_be_bytes(seq),
            })
        }
        2 => {
            // [device id u16][size u16]; the size is the low 16 bits of what
            // the device sends, matching what actual devices emit
            let mut head = [0u8; 4];
            reader.read_exact(&mut head).await?;
            let id = u16::from_be_bytes(head[0..2].try_into().unwrap());
            let size = u16::from_be_bytes(head[2..4].try_into().unwrap()) as usize;
            let mut data = vec![0u8; size];
            reader.read_exact(&mut data).await?;
            Ok(DeviceEvent::UhidOutput { id, data })
        }
        _ => Err(WireError::Malformed("unknown device message tag")),
    }
}
