use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::PlayerConfig;
use crate::error::PlayerError;

pub const PLAYER_ENV_KEY: &str = "ANISYNC_PLAYER";

const SOCKET_WAIT_ATTEMPTS: u32 = 50;
const SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(200);

/// mpv IPC command envelope.
#[derive(Debug, Serialize)]
struct MpvCommand<'a> {
    command: &'a [Value],
}

/// mpv IPC reply envelope. Event lines lack `error` and fail to parse,
/// which is how they get skipped.
#[derive(Debug, Deserialize)]
struct MpvResponse {
    error: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Control channel to a running player. Each command opens the socket
/// fresh; a connect failure is the end-of-session signal.
pub struct MpvHandle {
    socket_path: PathBuf,
    child: Option<Child>,
}

pub fn detect_player(config: &PlayerConfig) -> String {
    std::env::var(PLAYER_ENV_KEY)
        .ok()
        .filter(|val| !val.trim().is_empty())
        .unwrap_or_else(|| config.command.clone())
}

/// Starts the player against `url` with an IPC server attached and waits
/// for the control socket to come up.
pub async fn launch_player(
    config: &PlayerConfig,
    url: &str,
    title: &str,
) -> Result<MpvHandle, PlayerError> {
    let player = detect_player(config);
    let socket_path = std::env::temp_dir().join(format!("anisync-mpv-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&socket_path);

    let mut cmd = Command::new(&player);
    cmd.arg(format!("--input-ipc-server={}", socket_path.display()));
    cmd.arg("--quiet");
    cmd.arg("--terminal=no");
    cmd.arg(format!("--force-media-title={title}"));
    for extra in shlex::split(&config.extra_args).unwrap_or_default() {
        cmd.arg(extra);
    }
    cmd.arg(url);
    cmd.stdout(Stdio::null()).stderr(Stdio::null());

    let mut child = cmd.spawn().map_err(|err| {
        let reason = if err.kind() == std::io::ErrorKind::NotFound {
            format!("not found; install mpv or set {PLAYER_ENV_KEY} to a valid command")
        } else {
            err.to_string()
        };
        PlayerError::Launch {
            command: player.clone(),
            reason,
        }
    })?;

    for _ in 0..SOCKET_WAIT_ATTEMPTS {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(PlayerError::Launch {
                command: player,
                reason: format!("exited with status {status} before the IPC socket came up"),
            });
        }
        if UnixStream::connect(&socket_path).await.is_ok() {
            debug!("player control socket ready at {}", socket_path.display());
            return Ok(MpvHandle {
                socket_path,
                child: Some(child),
            });
        }
        tokio::time::sleep(SOCKET_WAIT_INTERVAL).await;
    }

    let _ = child.kill().await;
    Err(PlayerError::Launch {
        command: player,
        reason: String::from("IPC socket never came up"),
    })
}

impl MpvHandle {
    /// Control channel to an already-running player, no child process.
    pub fn attach(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            child: None,
        }
    }

    /// Numeric property read. `Ok(None)` covers both "property not yet
    /// available" and non-numeric replies; only a dead socket is an error.
    pub async fn get_property_f64(&self, name: &str) -> Result<Option<f64>, PlayerError> {
        let response = self.command(&[json!("get_property"), json!(name)]).await?;
        if response.error != "success" {
            return Ok(None);
        }
        Ok(response.data.as_ref().and_then(Value::as_f64))
    }

    pub async fn seek_absolute(&self, seconds: u32) -> Result<(), PlayerError> {
        let response = self
            .command(&[json!("seek"), json!(seconds), json!("absolute")])
            .await?;
        if response.error != "success" {
            return Err(PlayerError::Protocol(response.error));
        }
        Ok(())
    }

    async fn command(&self, args: &[Value]) -> Result<MpvResponse, PlayerError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(PlayerError::ChannelClosed)?;
        let (read_half, mut write_half) = stream.into_split();

        let mut payload = serde_json::to_string(&MpvCommand { command: args })
            .map_err(|err| PlayerError::Protocol(err.to_string()))?;
        payload.push('\n');
        write_half
            .write_all(payload.as_bytes())
            .await
            .map_err(PlayerError::ChannelClosed)?;

        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(PlayerError::ChannelClosed)?
        {
            if let Ok(response) = serde_json::from_str::<MpvResponse>(&line) {
                return Ok(response);
            }
        }
        Err(PlayerError::ChannelClosed(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "player closed the control socket",
        )))
    }

    /// Reaps the player process after the channel has closed.
    pub async fn reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.wait().await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
