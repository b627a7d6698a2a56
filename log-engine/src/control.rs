// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The control socket.
//!
//! A line-oriented protocol over a Unix domain socket: one command per
//! line, responses lead with `OK` or `FAIL`; multi-line payloads end
//! with a lone `.`. Commands are executed on the main loop; the
//! control server only parses, forwards and formats.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Parsed control commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Reload,
    Stop,
    Reopen,
    LogLevel(u8),
    ConfigId,
    ConfigGet,
    ConfigVerify,
    ListFiles,
    ExportConfigGraph,
    Stats,
    AttachLogs { seconds: u64, level: Option<u8> },
}

/// Main-loop answers.
#[derive(Debug)]
pub enum ControlResponse {
    Ok,
    OkPayload(String),
    Fail(String),
    /// Stream live logs to this connection for the given duration.
    AttachLogs { seconds: u64 },
}

pub struct ControlCommand {
    pub request: ControlRequest,
    pub respond: oneshot::Sender<ControlResponse>,
}

pub fn parse_request(line: &str) -> Result<ControlRequest, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_uppercase();
    let request = match verb.as_str() {
        "RELOAD" => ControlRequest::Reload,
        "STOP" => ControlRequest::Stop,
        "REOPEN" => ControlRequest::Reopen,
        "STATS" => ControlRequest::Stats,
        "LISTFILES" => ControlRequest::ListFiles,
        "EXPORT_CONFIG_GRAPH" => ControlRequest::ExportConfigGraph,
        "LOG" => {
            let sub = words.next().unwrap_or_default().to_ascii_uppercase();
            if sub != "LEVEL" {
                return Err(format!("unknown LOG subcommand {sub:?}"));
            }
            let level: u8 = words
                .next()
                .and_then(|w| w.parse().ok())
                .ok_or("LOG LEVEL needs a numeric argument")?;
            ControlRequest::LogLevel(level)
        }
        "CONFIG" => {
            let sub = words.next().unwrap_or_default().to_ascii_uppercase();
            match sub.as_str() {
                "ID" => ControlRequest::ConfigId,
                "GET" => ControlRequest::ConfigGet,
                "VERIFY" => ControlRequest::ConfigVerify,
                other => return Err(format!("unknown CONFIG subcommand {other:?}")),
            }
        }
        "ATTACH" => {
            let what = words.next().unwrap_or_default().to_ascii_uppercase();
            if what != "LOGS" {
                return Err(format!("unsupported ATTACH target {what:?}"));
            }
            let seconds = words.next().and_then(|w| w.parse().ok()).unwrap_or(10);
            let level = words.next().and_then(|w| w.parse().ok());
            ControlRequest::AttachLogs { seconds, level }
        }
        "" => return Err("empty command".into()),
        other => return Err(format!("unknown command {other:?}")),
    };
    Ok(request)
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    commands: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
}

impl ControlServer {
    pub fn bind(
        path: &Path,
        commands: mpsc::Sender<ControlCommand>,
        cancel: CancellationToken,
    ) -> std::io::Result<ControlServer> {
        // a previous run's socket would make bind fail
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        Ok(ControlServer {
            listener,
            path: path.to_path_buf(),
            commands,
            cancel,
        })
    }

    pub async fn run(self) {
        tracing::info!(path = %self.path.display(), "control socket listening");
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let Ok((stream, _)) = accepted else {
                continue;
            };
            let commands = self.commands.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, commands).await {
                    tracing::debug!(%err, "control connection error");
                }
            });
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    stream: UnixStream,
    commands: mpsc::Sender<ControlCommand>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let request = match parse_request(&line) {
            Ok(request) => request,
            Err(reason) => {
                write_half
                    .write_all(format!("FAIL {reason}\n").as_bytes())
                    .await?;
                continue;
            }
        };

        let (respond, response) = oneshot::channel();
        if commands
            .send(ControlCommand { request, respond })
            .await
            .is_err()
        {
            write_half.write_all(b"FAIL engine is shutting down\n").await?;
            break;
        }
        match response.await {
            Ok(ControlResponse::Ok) => write_half.write_all(b"OK\n").await?,
            Ok(ControlResponse::OkPayload(payload)) => {
                let mut out = String::from("OK\n");
                out.push_str(&payload);
                if !payload.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(".\n");
                write_half.write_all(out.as_bytes()).await?;
            }
            Ok(ControlResponse::Fail(reason)) => {
                write_half
                    .write_all(format!("FAIL {reason}\n").as_bytes())
                    .await?;
            }
            Ok(ControlResponse::AttachLogs { seconds }) => {
                write_half.write_all(b"OK attaching\n").await?;
                stream_logs(&mut write_half, Duration::from_secs(seconds)).await?;
                write_half.write_all(b".\n").await?;
            }
            Err(_) => {
                write_half.write_all(b"FAIL no response\n").await?;
            }
        }
    }
    Ok(())
}

async fn stream_logs(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    duration: Duration,
) -> std::io::Result<()> {
    let mut rx = crate::logging::attach_subscribe();
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        let chunk = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            chunk = rx.recv() => chunk,
        };
        match chunk {
            Ok(bytes) => write_half.write_all(&bytes).await?,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(parse_request("RELOAD").unwrap(), ControlRequest::Reload);
        assert_eq!(parse_request("stop").unwrap(), ControlRequest::Stop);
        assert_eq!(
            parse_request("LOG LEVEL 2").unwrap(),
            ControlRequest::LogLevel(2)
        );
        assert_eq!(parse_request("CONFIG ID").unwrap(), ControlRequest::ConfigId);
        assert_eq!(
            parse_request("ATTACH LOGS 30 2").unwrap(),
            ControlRequest::AttachLogs {
                seconds: 30,
                level: Some(2)
            }
        );
        assert_eq!(
            parse_request("ATTACH LOGS").unwrap(),
            ControlRequest::AttachLogs {
                seconds: 10,
                level: None
            }
        );
    }

    #[test]
    fn bad_commands_fail() {
        assert!(parse_request("FROB").is_err());
        assert!(parse_request("LOG VOLUME 3").is_err());
        assert!(parse_request("CONFIG DELETE").is_err());
        assert!(parse_request("").is_err());
    }
}
