use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use tower_http::services::ServeDir;

use crate::config::Config;
use crate::plugin::PluginSet;
use crate::session::SessionMap;

pub mod auth;
pub mod endpoints;
pub mod handlers;

use handlers::{InfoKind, KeyMode, ReqCtx};

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionMap,
    pub plugins: Arc<PluginSet>,
}

/// Username stamped into request extensions by the policy middleware
#[derive(Clone)]
pub struct Username(pub String);

/// Build the full router: built-in routes (unless overridden by configured
/// endpoints), configured endpoints, plugin endpoints, the uniform policy
/// middleware, and the optional static root.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new();

    for (path, route) in builtin_routes() {
        if let Some(endpoint) = state.config.endpoints.get(path) {
            if endpoint.commands.is_some() || endpoint.response.is_some() {
                continue; // the configured endpoint owns this path
            }
            if endpoint.users.is_empty() {
                continue; // declared with nobody allowed: disabled
            }
        }
        router = router.route(path, route);
    }

    router = endpoints::register(router, &state);

    for path in state.plugins.endpoints.keys() {
        let owned = path.clone();
        router = router.route(
            path,
            get(move |state: State<AppState>, ctx: ReqCtx, headers: HeaderMap| {
                handlers::plugin_endpoint(state, ctx, headers, owned.clone())
            }),
        );
    }

    let mut router = router.layer(middleware::from_fn_with_state(state.clone(), policy));

    if !state.config.static_dir.is_empty() {
        router = router.fallback_service(ServeDir::new(&state.config.static_dir));
    }

    router.with_state(state)
}

/// The normalized per-request policy: `Cache-Control: no-store` everywhere,
/// the OPTIONS/CORS contract, 405 with `Allow` for other methods, and
/// authentication plus the endpoint allow-list when users are configured.
async fn policy(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let method = req.method().clone();

    let mut response = if method == Method::OPTIONS {
        preflight(&req, origin.as_deref())
    } else if method == Method::GET {
        match authorize(&state, &mut req) {
            Ok(()) => next.run(req).await,
            Err(response) => response,
        }
    } else {
        let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("OPTIONS, GET"));
        response
    };

    if method != Method::OPTIONS
        && let Some(origin) = &origin
    {
        let headers = response.headers_mut();
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }

    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

fn preflight(req: &Request, origin: Option<&str>) -> Response {
    let mut response = Response::new(Body::empty());
    let requested_method = req.headers().get(header::ACCESS_CONTROL_REQUEST_METHOD);

    if requested_method.is_none() {
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("OPTIONS, GET"));
    } else if let Some(origin) = origin {
        let requested_headers = req.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS).cloned();
        let headers = response.headers_mut();

        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET"),
        );
        if let Some(requested) = requested_headers {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
        }
    }

    response
}

fn authorize(state: &AppState, req: &mut Request) -> Result<(), Response> {
    if state.config.users.is_empty() {
        return Ok(());
    }

    let query: HashMap<String, String> = req
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .map(|pairs| {
            let mut map = HashMap::new();
            for (name, value) in pairs {
                map.entry(name).or_insert(value);
            }
            map
        })
        .unwrap_or_default();

    match auth::authenticate(&state.config, &query, req.headers()) {
        auth::AuthOutcome::User(username) => {
            if !auth::endpoint_allows(&state.config, req.uri().path(), &username) {
                return Err(StatusCode::FORBIDDEN.into_response());
            }
            req.extensions_mut().insert(Username(username));
            Ok(())
        }
        auth::AuthOutcome::Unauthorized { challenge } => {
            let mut response = StatusCode::UNAUTHORIZED.into_response();
            if challenge {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
            }
            Err(response)
        }
        auth::AuthOutcome::BadRequest => Err(StatusCode::BAD_REQUEST.into_response()),
    }
}

type StateRouter = MethodRouter<AppState>;

fn builtin_routes() -> Vec<(&'static str, StateRouter)> {
    let named_keys: [(&'static str, &'static str); 14] = [
        ("/power", "power"),
        ("/sleep", "sleep"),
        ("/wake-up", "wakeup"),
        ("/back", "back"),
        ("/home", "home"),
        ("/menu", "menu"),
        ("/app-switch", "appswitch"),
        ("/assist", "assist"),
        ("/voice-assist", "voiceassist"),
        ("/all-apps", "allapps"),
        ("/volume-up", "volumeup"),
        ("/volume-down", "volumedown"),
        ("/brightness-up", "brightnessup"),
        ("/brightness-down", "brightnessdown"),
    ];

    let simple_verbs: [(&'static str, &'static str); 8] = [
        ("/back-or-screen-on", "backorscreenon"),
        ("/expand-notifications-panel", "expandnotificationspanel"),
        ("/expand-settings-panel", "expandsettingspanel"),
        ("/collapse-panels", "collapsepanels"),
        ("/turn-screen-on", "turnscreenon"),
        ("/turn-screen-off", "turnscreenoff"),
        ("/rotate", "rotate"),
        ("/open-hard-keyboard-settings", "openhardkeyboardsettings"),
    ];

    let touch_actions: [(&'static str, &'static str); 4] = [
        ("/touch", ""),
        ("/touch-down", "down"),
        ("/touch-up", "up"),
        ("/touch-move", "move"),
    ];

    let mouse_actions: [(&'static str, &'static str); 4] = [
        ("/mouse-click", "click"),
        ("/mouse-down", "down"),
        ("/mouse-up", "up"),
        ("/mouse-move", "move"),
    ];

    let scroll_directions: [(&'static str, &'static str); 4] = [
        ("/scroll-left", "left"),
        ("/scroll-right", "right"),
        ("/scroll-up", "up"),
        ("/scroll-down", "down"),
    ];

    let mut routes: Vec<(&'static str, StateRouter)> = vec![
        ("/connect", get(handlers::connect)),
        ("/disconnect", get(handlers::disconnect)),
        ("/start-scrcpy-server", get(handlers::start_scrcpy_server)),
        ("/stop-scrcpy-server", get(handlers::stop_scrcpy_server)),
        (
            "/device-name",
            info_route(InfoKind::DeviceName),
        ),
        ("/video-codec", info_route(InfoKind::VideoCodec)),
        ("/audio-codec", info_route(InfoKind::AudioCodec)),
        (
            "/initial-video-width",
            info_route(InfoKind::InitialVideoWidth),
        ),
        (
            "/initial-video-height",
            info_route(InfoKind::InitialVideoHeight),
        ),
        ("/ports", get(handlers::ports)),
        ("/send-data", get(handlers::send_data)),
        ("/video", get(handlers::video_stream)),
        ("/audio", get(handlers::audio_stream)),
        ("/video-frame", get(handlers::video_frame)),
        ("/clipboard", get(handlers::clipboard_stream)),
        (
            "/uhid-keyboard-output",
            get(handlers::uhid_keyboard_output_stream),
        ),
        (
            "/key",
            get(|state: State<AppState>, ctx: ReqCtx| handlers::key(state, ctx, KeyMode::Press)),
        ),
        (
            "/key-down",
            get(|state: State<AppState>, ctx: ReqCtx| handlers::key(state, ctx, KeyMode::Down)),
        ),
        (
            "/key-up",
            get(|state: State<AppState>, ctx: ReqCtx| handlers::key(state, ctx, KeyMode::Up)),
        ),
        ("/type", get(handlers::type_text)),
        ("/gamepad-input", get(handlers::gamepad_input)),
        (
            "/get-clipboard",
            get(|state: State<AppState>, ctx: ReqCtx| handlers::get_clipboard(state, ctx, false)),
        ),
        (
            "/get-clipboard-sync",
            get(|state: State<AppState>, ctx: ReqCtx| handlers::get_clipboard(state, ctx, true)),
        ),
        (
            "/set-clipboard",
            get(|state: State<AppState>, ctx: ReqCtx| handlers::set_clipboard(state, ctx, false)),
        ),
        (
            "/set-clipboard-sync",
            get(|state: State<AppState>, ctx: ReqCtx| handlers::set_clipboard(state, ctx, true)),
        ),
    ];

    for (path, name) in named_keys {
        routes.push((
            path,
            get(move |state: State<AppState>, ctx: ReqCtx| handlers::named_key(state, ctx, name)),
        ));
    }

    for (path, verb) in simple_verbs {
        routes.push((
            path,
            get(move |state: State<AppState>, ctx: ReqCtx| handlers::simple_verb(state, ctx, verb)),
        ));
    }

    for (path, action) in touch_actions {
        routes.push((
            path,
            get(move |state: State<AppState>, ctx: ReqCtx| handlers::touch(state, ctx, action)),
        ));
    }

    for (path, action) in mouse_actions {
        routes.push((
            path,
            get(move |state: State<AppState>, ctx: ReqCtx| handlers::mouse(state, ctx, action)),
        ));
    }

    for (path, direction) in scroll_directions {
        routes.push((
            path,
            get(move |state: State<AppState>, ctx: ReqCtx| {
                handlers::scroll(state, ctx, direction)
            }),
        ));
    }

    routes
}

fn info_route(kind: InfoKind) -> StateRouter {
    get(move |state: State<AppState>, ctx: ReqCtx| handlers::port_info(state, ctx, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::session::Session;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_state() -> AppState {
        let mut config = Config::default();
        config.address = "127.0.0.1:0".to_string();
        config.ports.insert(
            27183,
            PortConfig {
                video: true,
                control: true,
                ..PortConfig::default()
            },
        );

        let port_config = config.ports[&27183].clone();
        let (session, _rx) = Session::new(27183, &port_config);

        let mut sessions = HashMap::new();
        sessions.insert(27183, session);

        AppState {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            plugins: Arc::new(PluginSet::default()),
        }
    }

    #[tokio::test]
    async fn test_options_without_request_method() {
        let router = build_router(test_state());

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("OPTIONS")
                    .uri("/connect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["Allow"], "OPTIONS, GET");
        assert_eq!(response.headers()["Cache-Control"], "no-store");
    }

    #[tokio::test]
    async fn test_options_preflight_echoes_cors() {
        let router = build_router(test_state());

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("OPTIONS")
                    .uri("/connect")
                    .header("Origin", "http://example.com")
                    .header("Access-Control-Request-Method", "GET")
                    .header("Access-Control-Request-Headers", "X-Test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["Vary"], "Origin");
        assert_eq!(
            response.headers()["Access-Control-Allow-Origin"],
            "http://example.com"
        );
        assert_eq!(response.headers()["Access-Control-Allow-Methods"], "GET");
        assert_eq!(response.headers()["Access-Control-Allow-Headers"], "X-Test");
    }

    #[tokio::test]
    async fn test_unknown_method_gets_405() {
        let router = build_router(test_state());

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/connect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()["Allow"], "OPTIONS, GET");
    }

    #[tokio::test]
    async fn test_missing_port_on_multi_port_config() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.ports.insert(27185, PortConfig::default());
        state.config = Arc::new(config);

        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/device-name")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_port_is_404() {
        let router = build_router(test_state());

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/device-name?port=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_auth_required_when_users_configured() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.users.insert(
            "alice".to_string(),
            crate::config::UserConfig {
                password: "pw".to_string(),
                allowed_ports: vec![27183],
            },
        );
        state.config = Arc::new(config);
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/device-name")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["WWW-Authenticate"], "Basic");

        // Query credentials work; the device name is still unset, so 404
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/device-name?username=alice&password=pw")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_half_credentials_are_rejected() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.users.insert(
            "alice".to_string(),
            crate::config::UserConfig {
                password: "pw".to_string(),
                allowed_ports: vec![27183],
            },
        );
        state.config = Arc::new(config);
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/device-name?username=alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_port_acl_enforced() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.users.insert(
            "alice".to_string(),
            crate::config::UserConfig {
                password: "pw".to_string(),
                allowed_ports: vec![], // no ports
            },
        );
        state.config = Arc::new(config);
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/device-name?username=alice&password=pw&port=27183")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ports_lists_configuration() {
        let router = build_router(test_state());

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/ports")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed.get("27183").is_some());
        assert_eq!(parsed["27183"]["video"], serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn test_key_requires_selector() {
        let router = build_router(test_state());

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/key?port=27183")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_key_without_control_socket_is_404() {
        let router = build_router(test_state());

        // Control is configured but no device is connected
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/key?key=home")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_custom_endpoint_overrides_builtin() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.endpoints.insert(
            "/rotate".to_string(),
            crate::config::EndpointConfig {
                commands: Some(vec![vec!["rotate".to_string()]]),
                ..Default::default()
            },
        );
        state.config = Arc::new(config);
        let router = build_router(state);

        // The command endpoint answers 204 and runs the sequence detached
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/rotate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_video_stream_404_when_feature_disabled() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.ports.get_mut(&27183).unwrap().video = false;
        state.config = Arc::new(config);
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/video")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_video_stream_404_when_bound_to_plugin() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.ports.get_mut(&27183).unwrap().video_extension = "plugin".to_string();
        state.config = Arc::new(config);
        let router = build_router(state);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/video")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
