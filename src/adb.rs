use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::{Config, PortConfig};
use crate::session::Session;

/// Grace period between the teardown signal and killing the old server
const STOP_GRACE: Duration = Duration::from_secs(1);

/// ADB invocation pieces for one port: executable, then options plus the
/// device selector derived from `adbDevice`
pub fn derive_argv(config: &Config, port_config: &PortConfig) -> (String, Vec<String>) {
    let mut invocation = config.adb_invocation(port_config).into_iter();
    let executable = invocation.next().unwrap_or_else(|| "adb".to_string());
    let mut args: Vec<String> = invocation.collect();

    match port_config.adb_device.as_str() {
        "" => {}
        "usb" => args.push("-d".to_string()),
        "tcpip" => args.push("-e".to_string()),
        serial => {
            args.push("-s".to_string());
            args.push(serial.to_string());
        }
    }

    (executable, args)
}

/// The `adb shell app_process` tail that starts the scrcpy server
pub fn scrcpy_server_args(port_config: &PortConfig, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "shell".to_string(),
        format!("CLASSPATH={}", port_config.scrcpy_server),
        "app_process".to_string(),
        "/".to_string(),
        "com.genymobile.scrcpy.Server".to_string(),
        port_config.scrcpy_server_version.clone(),
    ];

    if !port_config.video {
        args.push("video=false".to_string());
    }

    if !port_config.audio {
        args.push("audio=false".to_string());
    }

    if port_config.control {
        if !port_config.clipboard_autosync {
            args.push("clipboard_autosync=false".to_string());
        }
    } else {
        args.push("control=false".to_string());
    }

    if !port_config.cleanup {
        args.push("cleanup=false".to_string());
    }

    if !port_config.power_on {
        args.push("power_on=false".to_string());
    }

    if port_config.forward {
        args.push("tunnel_forward=true".to_string());
    }

    args.extend(port_config.scrcpy_server_options.iter().cloned());
    args.extend(extra.iter().cloned());

    args
}

/// Spawn a supervised child with its output routed to the gateway's stderr
fn spawn_supervised(executable: &str, args: &[String]) -> std::io::Result<Child> {
    let mut child = Command::new(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut stderr = tokio::io::stderr();
            let _ = tokio::io::copy(&mut stdout, &mut stderr).await;
        });
    }

    Ok(child)
}

/// Stop a running child: best-effort teardown signal, a fixed grace, then
/// kill-and-wait
async fn stop_child(session: &Session, mut child: Child) {
    if session.request_disconnect() {
        tokio::time::sleep(STOP_GRACE).await;
    }

    if let Err(e) = child.kill().await {
        warn!(port = session.port, "Failed to kill scrcpy server: {e}");
    }
    let _ = child.wait().await;
}

/// Start (or restart) the scrcpy server for a port over ADB
pub async fn start_server(
    session: &Session,
    config: &Config,
    port_config: &PortConfig,
    extra: &[String],
) -> bool {
    if port_config.scrcpy_server.is_empty() {
        return false;
    }

    let mut guard = session.scrcpy_server.lock().await;

    if let Some(old) = guard.take() {
        stop_child(session, old).await;
    }

    let (executable, mut args) = derive_argv(config, port_config);
    args.extend(scrcpy_server_args(port_config, extra));

    info!(port = session.port, "Starting scrcpy server: {executable} {args:?}");

    match spawn_supervised(&executable, &args) {
        Ok(child) => {
            *guard = Some(child);
            true
        }
        Err(e) => {
            warn!(port = session.port, "Failed to start scrcpy server: {e}");
            false
        }
    }
}

/// Stop the supervised scrcpy server; false when none is running
pub async fn stop_server(session: &Session) -> bool {
    let mut guard = session.scrcpy_server.lock().await;

    match guard.take() {
        Some(child) => {
            stop_child(session, child).await;
            true
        }
        None => false,
    }
}

/// Whether a supervised server child currently exists
pub async fn server_running(session: &Session) -> bool {
    session.scrcpy_server.lock().await.is_some()
}

/// Pass-through ADB subcommand; the exit status is the only result
pub async fn run_passthrough(config: &Config, port_config: &PortConfig, args: &[String]) -> bool {
    // `adb connect` / `adb disconnect` with no further arguments target the
    // configured device address directly, without a `-s`/`-d`/`-e` selector
    let targets_device = args.len() == 1
        && (args[0] == "connect" || args[0] == "disconnect")
        && !port_config.adb_device.is_empty()
        && port_config.adb_device != "usb"
        && port_config.adb_device != "tcpip";

    let (executable, argv) = if targets_device {
        let mut invocation = config.adb_invocation(port_config).into_iter();
        let executable = invocation.next().unwrap_or_else(|| "adb".to_string());
        let mut argv: Vec<String> = invocation.collect();
        argv.push(args[0].clone());
        argv.push(port_config.adb_device.clone());
        (executable, argv)
    } else {
        let (executable, mut argv) = derive_argv(config, port_config);
        argv.extend(args.iter().cloned());
        (executable, argv)
    };

    let child = match spawn_supervised(&executable, &argv) {
        Ok(child) => child,
        Err(_) => return false,
    };

    matches!(child.wait_with_output().await, Ok(output) if output.status.success())
}

/// Run the scrcpy server in a one-shot listing mode (`list_encoders`,
/// `list_displays`, ...) and capture its output
pub async fn list_query(
    config: &Config,
    port_config: &PortConfig,
    flag: &str,
) -> std::io::Result<Vec<u8>> {
    if port_config.scrcpy_server.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no scrcpy server configured",
        ));
    }

    let (executable, mut args) = derive_argv(config, port_config);
    args.extend(scrcpy_server_args(port_config, &[format!("{flag}=true")]));

    let output = Command::new(&executable)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await?;

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_config() -> PortConfig {
        PortConfig {
            video: true,
            audio: false,
            control: true,
            forward: true,
            scrcpy_server: "/data/local/tmp/scrcpy-server".to_string(),
            scrcpy_server_version: "3.1".to_string(),
            ..PortConfig::default()
        }
    }

    #[test]
    fn test_derive_argv_selectors() {
        let config = Config::default();

        let mut pc = port_config();
        assert_eq!(derive_argv(&config, &pc), ("adb".to_string(), vec![]));

        pc.adb_device = "usb".to_string();
        assert_eq!(derive_argv(&config, &pc).1, vec!["-d".to_string()]);

        pc.adb_device = "tcpip".to_string();
        assert_eq!(derive_argv(&config, &pc).1, vec!["-e".to_string()]);

        pc.adb_device = "0A1B2C3D".to_string();
        assert_eq!(
            derive_argv(&config, &pc).1,
            vec!["-s".to_string(), "0A1B2C3D".to_string()]
        );
    }

    #[test]
    fn test_scrcpy_server_args_shape() {
        let pc = port_config();
        let args = scrcpy_server_args(&pc, &[]);

        assert_eq!(args[0], "shell");
        assert_eq!(args[1], "CLASSPATH=/data/local/tmp/scrcpy-server");
        assert_eq!(args[2], "app_process");
        assert_eq!(args[3], "/");
        assert_eq!(args[4], "com.genymobile.scrcpy.Server");
        assert_eq!(args[5], "3.1");

        // audio off, control on without autosync, no cleanup/power_on, forward
        assert!(args.contains(&"audio=false".to_string()));
        assert!(args.contains(&"clipboard_autosync=false".to_string()));
        assert!(args.contains(&"cleanup=false".to_string()));
        assert!(args.contains(&"power_on=false".to_string()));
        assert!(args.contains(&"tunnel_forward=true".to_string()));
        assert!(!args.contains(&"video=false".to_string()));
        assert!(!args.contains(&"control=false".to_string()));
    }

    #[test]
    fn test_scrcpy_server_args_flags_follow_config() {
        let mut pc = port_config();
        pc.control = false;
        pc.clipboard_autosync = true;
        pc.cleanup = true;
        pc.power_on = true;
        pc.forward = false;
        pc.scrcpy_server_options = vec!["max_size=1920".to_string()];

        let args = scrcpy_server_args(&pc, &["log_level=debug".to_string()]);

        assert!(args.contains(&"control=false".to_string()));
        assert!(!args.contains(&"clipboard_autosync=false".to_string()));
        assert!(!args.contains(&"cleanup=false".to_string()));
        assert!(!args.contains(&"power_on=false".to_string()));
        assert!(!args.contains(&"tunnel_forward=true".to_string()));
        assert_eq!(args[args.len() - 2], "max_size=1920");
        assert_eq!(args[args.len() - 1], "log_level=debug");
    }
}
