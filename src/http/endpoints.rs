use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use super::handlers::{self, InfoKind, ReqCtx};
use super::AppState;
use crate::clipboard;
use crate::command;
use crate::config::ResponseKind;
use crate::pump::Framing;

/// Register every configured endpoint that carries a command template or a
/// canned response kind
pub fn register(mut router: Router<AppState>, state: &AppState) -> Router<AppState> {
    for (path, endpoint) in &state.config.endpoints {
        let bound_port = endpoint.port;

        if let Some(commands) = &endpoint.commands {
            let commands = commands.clone();
            router = router.route(
                path,
                get(move |state: State<AppState>, ctx: ReqCtx| {
                    command_endpoint(state, ctx, bound_port, commands.clone())
                }),
            );
        } else if let Some(kind) = endpoint.response {
            let clipboard_timeout = endpoint
                .clipboard_timeout
                .as_deref()
                .and_then(|t| humantime::parse_duration(t).ok());
            router = router.route(
                path,
                get(move |state: State<AppState>, ctx: ReqCtx| {
                    response_endpoint(state, ctx, bound_port, kind, clipboard_timeout)
                }),
            );
        }
    }

    router
}

/// Expand `${name}` tokens from the query and run the sequence detached;
/// sequences report no partial progress upstream
async fn command_endpoint(
    State(state): State<AppState>,
    ctx: ReqCtx,
    bound_port: Option<u16>,
    commands: Vec<Vec<String>>,
) -> Response {
    let target = match handlers::resolve(&state, &ctx, bound_port) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };

    let expanded: Vec<Vec<String>> = commands
        .iter()
        .map(|command| command::expand_command(command, &ctx.map))
        .collect();

    let session = Arc::clone(&target.session);
    let config = Arc::clone(&state.config);
    let port_config = target.port_config.clone();
    tokio::spawn(async move {
        command::run_sequence(&session, &config, &port_config, &expanded).await;
    });

    StatusCode::NO_CONTENT.into_response()
}

async fn response_endpoint(
    State(state): State<AppState>,
    ctx: ReqCtx,
    bound_port: Option<u16>,
    kind: ResponseKind,
    clipboard_timeout: Option<Duration>,
) -> Response {
    let target = match handlers::resolve(&state, &ctx, bound_port) {
        Ok(target) => target,
        Err(status) => return status.into_response(),
    };

    match kind {
        ResponseKind::VideoStream => {
            handlers::media_stream(target, &ctx, true, Framing::Framed).await
        }
        ResponseKind::RawVideoStream => {
            handlers::media_stream(target, &ctx, true, Framing::PayloadOnly).await
        }
        ResponseKind::RgbVideoStream => handlers::rgb_video_stream(target, &ctx).await,
        ResponseKind::AudioStream => {
            handlers::media_stream(target, &ctx, false, Framing::Framed).await
        }
        ResponseKind::RawAudioStream => {
            handlers::media_stream(target, &ctx, false, Framing::PayloadOnly).await
        }
        ResponseKind::ClipboardStream => handlers::clipboard_stream_response(&target),
        ResponseKind::UhidKeyboardOutputStream => {
            handlers::uhid_keyboard_output_response(&target)
        }
        ResponseKind::Clipboard => {
            if !target.port_config.control {
                return StatusCode::NOT_FOUND.into_response();
            }

            // Presence and positivity are enforced at startup
            let Some(timeout) = clipboard_timeout else {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            };

            match clipboard::get(&target.session, ctx.map.contains_key("cut"), Some(timeout)).await
            {
                Ok(Some(body)) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    body,
                )
                    .into_response(),
                _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        ResponseKind::DeviceName => handlers::info_response(&target, InfoKind::DeviceName),
        ResponseKind::VideoCodec => handlers::info_response(&target, InfoKind::VideoCodec),
        ResponseKind::AudioCodec => handlers::info_response(&target, InfoKind::AudioCodec),
        ResponseKind::InitialVideoWidth => {
            handlers::info_response(&target, InfoKind::InitialVideoWidth)
        }
        ResponseKind::InitialVideoHeight => {
            handlers::info_response(&target, InfoKind::InitialVideoHeight)
        }
        ResponseKind::VideoFrame => handlers::video_frame_response(&target, &ctx),
        ResponseKind::Encoders => handlers::list_response(&state, &target, "list_encoders").await,
        ResponseKind::Displays => handlers::list_response(&state, &target, "list_displays").await,
        ResponseKind::Cameras => handlers::list_response(&state, &target, "list_cameras").await,
        ResponseKind::CameraSizes => {
            handlers::list_response(&state, &target, "list_camera_sizes").await
        }
        ResponseKind::Apps => handlers::list_response(&state, &target, "list_apps").await,
    }
}
