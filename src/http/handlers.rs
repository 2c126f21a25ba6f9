use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::{AppState, Username, auth};
use crate::clipboard::{self, ClipboardError};
use crate::command::{self, CommandError};
use crate::config::PortConfig;
use crate::pump::{self, Framing};
use crate::session::Session;
use crate::{adb, decoder, plugin};

/// Per-request context: parsed query (pairs and first-value map), origin,
/// and the username stamped by the policy middleware
pub struct ReqCtx {
    pub pairs: Vec<(String, String)>,
    pub map: HashMap<String, String>,
    pub origin: Option<String>,
    pub username: Option<String>,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ReqCtx
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let pairs: Vec<(String, String)> = parts
            .uri
            .query()
            .and_then(|q| serde_urlencoded::from_str(q).ok())
            .unwrap_or_default();

        let mut map = HashMap::new();
        for (name, value) in &pairs {
            map.entry(name.clone()).or_insert_with(|| value.clone());
        }

        let origin = parts
            .headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let username = parts.extensions.get::<Username>().map(|u| u.0.clone());

        Ok(ReqCtx {
            pairs,
            map,
            origin,
            username,
        })
    }
}

impl ReqCtx {
    fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some("true") | Some("1") | Some("t"))
    }
}

/// A resolved target port
pub struct Target {
    pub port: u16,
    pub session: Arc<Session>,
    pub port_config: PortConfig,
}

/// Resolve the target port from the query (or an endpoint binding), then
/// apply the per-user port allow-list
pub fn resolve(
    state: &AppState,
    ctx: &ReqCtx,
    bound_port: Option<u16>,
) -> Result<Target, StatusCode> {
    let port = match bound_port {
        Some(port) => port,
        None => state
            .config
            .resolve_port(ctx.get("port"))
            .ok_or(StatusCode::BAD_REQUEST)?,
    };

    if !state.config.users.is_empty() {
        let username = ctx.username.as_deref().unwrap_or("");
        if !auth::port_allowed(&state.config, port, username) {
            return Err(StatusCode::FORBIDDEN);
        }
    }

    let session = state.sessions.get(&port).ok_or(StatusCode::NOT_FOUND)?;
    let port_config = state
        .config
        .ports
        .get(&port)
        .ok_or(StatusCode::NOT_FOUND)?
        .clone();

    Ok(Target {
        port,
        session: Arc::clone(session),
        port_config,
    })
}

fn command_status(result: Result<(), CommandError>) -> StatusCode {
    match result {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(CommandError::Invalid) => StatusCode::BAD_REQUEST,
        Err(CommandError::Busy) => StatusCode::SERVICE_UNAVAILABLE,
        Err(CommandError::Unavailable) => StatusCode::NOT_FOUND,
        Err(CommandError::Wire) | Err(CommandError::Timeout) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn clipboard_status(error: &ClipboardError) -> StatusCode {
    match error {
        ClipboardError::NotConnected => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run one command synchronously and answer with the mapped status
async fn run(state: &AppState, target: &Target, tokens: Vec<String>) -> Response {
    let result = command::run_command(
        &target.session,
        &state.config,
        &target.port_config,
        &tokens,
    )
    .await;
    command_status(result).into_response()
}

/// Shorthand for handlers that require the control feature
fn control_gate(target: &Target) -> Result<(), StatusCode> {
    if target.port_config.control {
        Ok(())
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

fn tokens(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

pub async fn connect(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    match resolve(&state, &ctx, None) {
        Ok(target) => run(&state, &target, tokens(&["connect"])).await,
        Err(status) => status.into_response(),
    }
}

pub async fn disconnect(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    match resolve(&state, &ctx, None) {
        Ok(target) => run(&state, &target, tokens(&["disconnect"])).await,
        Err(status) => status.into_response(),
    }
}

pub async fn start_scrcpy_server(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    match resolve(&state, &ctx, None) {
        Ok(target) => run(&state, &target, tokens(&["startscrcpyserver"])).await,
        Err(status) => status.into_response(),
    }
}

pub async fn stop_scrcpy_server(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    match resolve(&state, &ctx, None) {
        Ok(target) => run(&state, &target, tokens(&["stopscrcpyserver"])).await,
        Err(status) => status.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Port information
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub enum InfoKind {
    DeviceName,
    VideoCodec,
    AudioCodec,
    InitialVideoWidth,
    InitialVideoHeight,
}

pub async fn port_info(State(state): State<AppState>, ctx: ReqCtx, kind: InfoKind) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };

    info_response(&target, kind)
}

pub fn info_response(target: &Target, kind: InfoKind) -> Response {
    let meta = target.session.meta();

    let body = match kind {
        InfoKind::DeviceName => {
            if meta.device_name.is_empty() {
                return StatusCode::NOT_FOUND.into_response();
            }
            meta.device_name
        }
        InfoKind::VideoCodec => match meta.video_codec {
            0 => return StatusCode::NOT_FOUND.into_response(),
            codec => codec.to_string(),
        },
        InfoKind::AudioCodec => match meta.audio_codec {
            0 => return StatusCode::NOT_FOUND.into_response(),
            codec => codec.to_string(),
        },
        InfoKind::InitialVideoWidth => match meta.initial_video_width {
            0 => return StatusCode::NOT_FOUND.into_response(),
            width => width.to_string(),
        },
        InfoKind::InitialVideoHeight => match meta.initial_video_height {
            0 => return StatusCode::NOT_FOUND.into_response(),
            height => height.to_string(),
        },
    };

    body.into_response()
}

pub async fn ports(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let mut visible = HashMap::new();

    for (port, port_config) in &state.config.ports {
        let allowed = state.config.users.is_empty()
            || auth::port_allowed(
                &state.config,
                *port,
                ctx.username.as_deref().unwrap_or(""),
            );
        if allowed {
            visible.insert(*port, port_config.clone());
        }
    }

    Json(visible).into_response()
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    Press,
    Down,
    Up,
}

pub async fn key(State(state): State<AppState>, ctx: ReqCtx, mode: KeyMode) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let repeat = ctx.get("repeat").unwrap_or("0").to_string();
    let meta_state = ctx.get("metastate").unwrap_or("0").to_string();

    let command = if let Some(name) = ctx.get("key") {
        match mode {
            KeyMode::Press => vec!["key".to_string(), name.to_string()],
            KeyMode::Down => vec![
                "key".to_string(),
                name.to_string(),
                "false".to_string(),
                repeat,
                meta_state,
            ],
            KeyMode::Up => vec![
                "key".to_string(),
                name.to_string(),
                "true".to_string(),
                repeat,
                meta_state,
            ],
        }
    } else if let Some(code) = ctx.get("code") {
        match mode {
            KeyMode::Press => vec!["key2".to_string(), code.to_string()],
            KeyMode::Down => vec![
                "key2".to_string(),
                code.to_string(),
                "false".to_string(),
                repeat,
                meta_state,
            ],
            KeyMode::Up => vec![
                "key2".to_string(),
                code.to_string(),
                "true".to_string(),
                repeat,
                meta_state,
            ],
        }
    } else if let Some(scancode) = ctx.get("scancode") {
        if mode != KeyMode::Press {
            return StatusCode::BAD_REQUEST.into_response();
        }
        let mut command = vec!["key3".to_string(), scancode.to_string()];
        if let Some(modifiers) = ctx.get("modifiers") {
            command.push(modifiers.to_string());
        }
        command
    } else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    run(&state, &target, command).await
}

pub async fn named_key(State(state): State<AppState>, ctx: ReqCtx, name: &'static str) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    run(&state, &target, tokens(&["key", name])).await
}

pub async fn type_text(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let command = if let Some(text) = ctx.get("text") {
        vec!["type".to_string(), text.to_string()]
    } else if let Some(text) = ctx.get("base64") {
        vec!["typebase64".to_string(), text.to_string()]
    } else if let Some(text) = ctx.get("base64url") {
        vec!["typebase64url".to_string(), text.to_string()]
    } else if let Some(text) = ctx.get("hex") {
        vec!["typehex".to_string(), text.to_string()]
    } else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    run(&state, &target, command).await
}

pub async fn touch(State(state): State<AppState>, ctx: ReqCtx, action: &'static str) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let (Some(x), Some(y), Some(width), Some(height)) = (
        ctx.get("x"),
        ctx.get("y"),
        ctx.get("width"),
        ctx.get("height"),
    ) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut command = vec![
        format!("touch{action}"),
        x.to_string(),
        y.to_string(),
        width.to_string(),
        height.to_string(),
    ];

    if action.is_empty()
        && let Some(duration) = ctx.get("duration")
    {
        command.push(duration.to_string());
    }

    run(&state, &target, command).await
}

pub async fn mouse(State(state): State<AppState>, ctx: ReqCtx, action: &'static str) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let size = match (ctx.get("width"), ctx.get("height")) {
        (Some(width), Some(height)) => Some((width.to_string(), height.to_string())),
        (None, None) => None,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    let verb = format!("mouse{action}");
    let command = match action {
        "up" if ctx.get("x").is_none() => vec![verb],
        "move" => {
            let (Some(x), Some(y)) = (ctx.get("x"), ctx.get("y")) else {
                return StatusCode::BAD_REQUEST.into_response();
            };

            match (&size, ctx.get("button")) {
                (Some((width, height)), button) => vec![
                    verb,
                    button.unwrap_or("0").to_string(),
                    x.to_string(),
                    y.to_string(),
                    width.clone(),
                    height.clone(),
                ],
                (None, Some(button)) => vec![
                    verb,
                    button.to_string(),
                    x.to_string(),
                    y.to_string(),
                ],
                (None, None) => vec![verb, x.to_string(), y.to_string()],
            }
        }
        _ => {
            let (Some(button), Some(x), Some(y)) =
                (ctx.get("button"), ctx.get("x"), ctx.get("y"))
            else {
                return StatusCode::BAD_REQUEST.into_response();
            };

            let mut command = vec![verb, button.to_string(), x.to_string(), y.to_string()];
            if let Some((width, height)) = size {
                command.push(width);
                command.push(height);
            }
            if action == "click"
                && let Some(duration) = ctx.get("duration")
            {
                command.push(duration.to_string());
            }
            command
        }
    };

    run(&state, &target, command).await
}

pub async fn scroll(
    State(state): State<AppState>,
    ctx: ReqCtx,
    direction: &'static str,
) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let verb = format!("scroll{direction}");
    let command = match (
        ctx.get("x"),
        ctx.get("y"),
        ctx.get("width"),
        ctx.get("height"),
    ) {
        (Some(x), Some(y), Some(width), Some(height)) => vec![
            verb,
            x.to_string(),
            y.to_string(),
            width.to_string(),
            height.to_string(),
        ],
        (None, None, None, None) => vec![verb],
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    run(&state, &target, command).await
}

pub async fn gamepad_input(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let mut command = vec!["gamepadinput".to_string()];
    for name in [
        "leftx",
        "lefty",
        "rightx",
        "righty",
        "lefttrigger",
        "righttrigger",
        "buttons",
        "dpad",
    ] {
        let Some(value) = ctx.get(name) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        command.push(value.to_string());
    }

    run(&state, &target, command).await
}

pub async fn simple_verb(
    State(state): State<AppState>,
    ctx: ReqCtx,
    verb: &'static str,
) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    run(&state, &target, tokens(&[verb])).await
}

pub async fn send_data(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let data = ctx.get("data").unwrap_or_default().to_string();
    run(&state, &target, vec!["senddata".to_string(), data]).await
}

// ---------------------------------------------------------------------------
// Clipboard
// ---------------------------------------------------------------------------

fn required_timeout(ctx: &ReqCtx) -> Result<Duration, StatusCode> {
    let timeout = ctx
        .get("timeout")
        .and_then(|t| humantime::parse_duration(t).ok())
        .ok_or(StatusCode::BAD_REQUEST)?;

    if timeout.is_zero() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(timeout)
}

pub async fn get_clipboard(State(state): State<AppState>, ctx: ReqCtx, sync: bool) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let cut = ctx.flag("cut");

    if !sync {
        return match clipboard::get(&target.session, cut, None).await {
            Ok(_) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => clipboard_status(&e).into_response(),
        };
    }

    let timeout = match required_timeout(&ctx) {
        Ok(timeout) => timeout,
        Err(status) => return status.into_response(),
    };

    match clipboard::get(&target.session, cut, Some(timeout)).await {
        Ok(Some(body)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Ok(None) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Err(e) => clipboard_status(&e).into_response(),
    }
}

pub async fn set_clipboard(State(state): State<AppState>, ctx: ReqCtx, sync: bool) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = control_gate(&target) {
        return status.into_response();
    }

    let text = if let Some(text) = ctx.get("text") {
        text.to_string()
    } else if let Some(encoded) = ctx.get("base64") {
        match command::decode_text("base64", encoded) {
            Ok(text) => text,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        }
    } else if let Some(encoded) = ctx.get("base64url") {
        match command::decode_text("base64url", encoded) {
            Ok(text) => text,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        }
    } else if let Some(encoded) = ctx.get("hex") {
        match command::decode_text("hex", encoded) {
            Ok(text) => text,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        }
    } else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let sequence = match ctx.get("sequence") {
        Some(value) => match value.parse::<u64>() {
            Ok(sequence) => sequence,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        },
        None => 0,
    };

    let paste = ctx.flag("paste");

    let wait = if sync {
        match required_timeout(&ctx) {
            Ok(timeout) => Some(timeout),
            Err(status) => return status.into_response(),
        }
    } else {
        None
    };

    match clipboard::set(&target.session, text, sequence, paste, wait).await {
        Ok(()) if sync => Json(serde_json::json!({ "sequence": sequence.to_string() }))
            .into_response(),
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => clipboard_status(&e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

fn body_from(rx: mpsc::Receiver<Bytes>) -> Body {
    Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
}

fn stream_response(
    headers: Vec<(&'static str, String)>,
    expose: &'static str,
    origin_present: bool,
    body: Body,
) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);

    if origin_present {
        builder = builder.header(header::ACCESS_CONTROL_EXPOSE_HEADERS, expose);
    }

    for (name, value) in headers {
        if let Ok(value) = HeaderValue::from_str(&value) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Framed or payload-only media stream; also serves the outbound raw-socket
/// mode when the caller supplied `network`/`address`
pub async fn media_stream(target: Target, ctx: &ReqCtx, video: bool, framing: Framing) -> Response {
    let port_config = &target.port_config;

    if video {
        if !port_config.video || !port_config.video_extension.is_empty() {
            return StatusCode::NOT_FOUND.into_response();
        }
        // Snapshot decoding owns the video stream
        if let Some(decoder) = &port_config.video_decoder
            && !decoder.stream
        {
            return StatusCode::NOT_FOUND.into_response();
        }
    } else if !port_config.audio || !port_config.audio_extension.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let media = {
        let receiver = if video {
            &target.session.video_rx
        } else {
            &target.session.audio_rx
        };
        let mut rx = receiver.lock().await;
        rx.recv().await
    };
    let Some(media) = media else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    if let (Some(network), Some(address)) = (ctx.get("network"), ctx.get("address")) {
        return match pump::dial_raw(network, address).await {
            Ok(writer) => {
                pump::spawn_raw_pump(Arc::clone(&target.session), media, framing, writer);
                StatusCode::NO_CONTENT.into_response()
            }
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
    }

    let meta = media.meta.clone();
    let rx = pump::spawn_body_pump(Arc::clone(&target.session), media, framing);

    if video {
        stream_response(
            vec![
                ("Device-Name", meta.device_name),
                ("Codec", meta.video_codec.to_string()),
                ("Initial-Width", meta.initial_video_width.to_string()),
                ("Initial-Height", meta.initial_video_height.to_string()),
            ],
            "Device-Name, Codec, Initial-Width, Initial-Height",
            ctx.origin.is_some(),
            body_from(rx),
        )
    } else {
        stream_response(
            vec![
                ("Device-Name", meta.device_name),
                ("Codec", meta.audio_codec.to_string()),
            ],
            "Device-Name, Codec",
            ctx.origin.is_some(),
            body_from(rx),
        )
    }
}

pub async fn video_stream(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };

    let framing = Framing::from_stripheader(ctx.flag("stripheader"));
    media_stream(target, &ctx, true, framing).await
}

pub async fn audio_stream(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };

    let framing = Framing::from_stripheader(ctx.flag("stripheader"));
    media_stream(target, &ctx, false, framing).await
}

/// Decoded RGB(A) frame stream through a per-request decoder
pub async fn rgb_video_stream(target: Target, ctx: &ReqCtx) -> Response {
    let port_config = &target.port_config;

    let Some(decoder_config) = port_config.video_decoder.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !port_config.video || !port_config.video_extension.is_empty() || !decoder_config.stream {
        return StatusCode::NOT_FOUND.into_response();
    }

    let media = {
        let mut rx = target.session.video_rx.lock().await;
        rx.recv().await
    };
    let Some(media) = media else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let meta = media.meta.clone();
    let rx = match decoder::spawn_stream_decoder(Arc::clone(&target.session), &decoder_config, media)
    {
        Ok(rx) => rx,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    stream_response(
        vec![
            ("Content-Type", "application/octet-stream".to_string()),
            ("Device-Name", meta.device_name),
            ("Width", meta.initial_video_width.to_string()),
            ("Height", meta.initial_video_height.to_string()),
        ],
        "Device-Name, Width, Height",
        ctx.origin.is_some(),
        body_from(rx),
    )
}

/// Most recent decoded frame from the snapshot worker
pub async fn video_frame(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };

    video_frame_response(&target, &ctx)
}

pub fn video_frame_response(target: &Target, ctx: &ReqCtx) -> Response {
    let port_config = &target.port_config;

    let Some(decoder_config) = &port_config.video_decoder else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !port_config.video || decoder_config.stream {
        return StatusCode::NOT_FOUND.into_response();
    }

    let (data, width, height) = {
        let frame = target.session.frame.read();
        if frame.data.is_empty() {
            return StatusCode::NOT_FOUND.into_response();
        }
        (frame.data.clone(), frame.width, frame.height)
    };

    stream_response(
        vec![
            ("Content-Type", "application/octet-stream".to_string()),
            ("Device-Name", target.session.meta().device_name),
            ("Width", width.to_string()),
            ("Height", height.to_string()),
        ],
        "Device-Name, Width, Height",
        ctx.origin.is_some(),
        Body::from(data),
    )
}

pub async fn clipboard_stream(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };

    clipboard_stream_response(&target)
}

pub fn clipboard_stream_response(target: &Target) -> Response {
    if !target.port_config.control || !target.port_config.clipboard_stream_extension.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let rx = pump::spawn_line_pump(Arc::clone(&target.session.clipboard_rx));
    Response::new(body_from(rx))
}

pub async fn uhid_keyboard_output_stream(State(state): State<AppState>, ctx: ReqCtx) -> Response {
    let target = match resolve(&state, &ctx, None) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };

    uhid_keyboard_output_response(&target)
}

pub fn uhid_keyboard_output_response(target: &Target) -> Response {
    let port_config = &target.port_config;
    if !port_config.control
        || port_config.uhid_keyboard_report_desc.is_empty()
        || !port_config.uhid_keyboard_output_extension.is_empty()
    {
        return StatusCode::NOT_FOUND.into_response();
    }

    let rx = pump::spawn_line_pump(Arc::clone(&target.session.uhid_output_rx));
    Response::new(body_from(rx))
}

// ---------------------------------------------------------------------------
// Device listings
// ---------------------------------------------------------------------------

pub async fn list_response(state: &AppState, target: &Target, flag: &'static str) -> Response {
    match adb::list_query(&state.config, &target.port_config, flag).await {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            output,
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Plugin-delegated endpoints
// ---------------------------------------------------------------------------

pub async fn plugin_endpoint(
    State(state): State<AppState>,
    ctx: ReqCtx,
    headers: HeaderMap,
    path: String,
) -> Response {
    let Some(plugin) = state.plugins.for_endpoint(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let port = state.config.resolve_port(ctx.get("port")).unwrap_or(0);

    // First value of each query parameter and header
    let mut query = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (name, value) in &ctx.pairs {
        if seen.insert(name.clone()) {
            query.push((name.clone(), value.clone()));
        }
    }

    let mut header_pairs = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (name, value) in headers.iter() {
        if seen.insert(name.as_str().to_string())
            && let Ok(value) = value.to_str()
        {
            header_pairs.push((name.as_str().to_string(), value.to_string()));
        }
    }

    let exchange = plugin::exchange(
        Arc::clone(plugin),
        port,
        path,
        query,
        header_pairs,
        Arc::clone(&state.sessions),
        Arc::clone(&state.config),
    )
    .await;

    let Some((status, response_headers, rx)) = exchange else {
        // Protocol violations silently drop the response
        return StatusCode::OK.into_response();
    };

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));

    if ctx.origin.is_some() && !response_headers.is_empty() {
        builder = builder.header(header::ACCESS_CONTROL_EXPOSE_HEADERS, "*");
    }

    for (name, value) in &response_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(body_from(rx))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
