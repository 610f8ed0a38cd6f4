//! NUT daemon session
//!
//! One TCP session per client. All verbs take `&mut self`; the protocol
//! is strictly request/response on a single connection.

use crate::error::NutError;
use crate::protocol::{check_err, quote, split_value_list, tokenize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, trace};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3493;

/// Opaque tracking identifier returned by the daemon for an instant
/// command.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackingId(pub String);

impl std::fmt::Display for TrackingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Poll state of a tracked instant command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingResult {
    Pending,
    Success,
    Failure,
}

/// One session against the NUT daemon.
pub struct NutClient {
    stream: BufStream<TcpStream>,
    tracking_enabled: bool,
}

impl NutClient {
    /// Connect to a NUT daemon.
    pub async fn connect(host: &str, port: u16) -> Result<Self, NutError> {
        let stream = TcpStream::connect((host, port)).await?;
        debug!(%host, port, "connected to NUT daemon");
        Ok(Self {
            stream: BufStream::new(stream),
            tracking_enabled: false,
        })
    }

    /// Connect to the local daemon on the default port.
    pub async fn connect_local() -> Result<Self, NutError> {
        Self::connect(DEFAULT_HOST, DEFAULT_PORT).await
    }

    /// Authenticate the session (required for the command path).
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), NutError> {
        self.send_line(&format!("USERNAME {}", quote(username)))
            .await?;
        self.expect_ok().await?;
        self.send_line(&format!("PASSWORD {}", quote(password)))
            .await?;
        self.expect_ok().await?;
        Ok(())
    }

    /// Names of all devices the daemon currently exposes.
    pub async fn list_devices(&mut self) -> Result<Vec<String>, NutError> {
        self.send_line("LIST UPS").await?;
        let lines = self.read_list("UPS").await?;
        Ok(lines
            .into_iter()
            .filter_map(|tokens| {
                // UPS <name> "<description>"
                (tokens.first().map(String::as_str) == Some("UPS"))
                    .then(|| tokens.get(1).cloned())
                    .flatten()
            })
            .collect())
    }

    /// Read one variable as an ordered value list.
    pub async fn get_variable(
        &mut self,
        device: &str,
        name: &str,
    ) -> Result<Vec<String>, NutError> {
        self.send_line(&format!("GET VAR {} {}", quote(device), quote(name)))
            .await?;
        let line = self.read_line().await?;
        let line = check_err(&line)?;
        let tokens = tokenize(line);
        // VAR <device> <name> "<value>"
        if tokens.len() < 4 || tokens[0] != "VAR" {
            return Err(NutError::Protocol(format!("unexpected reply: {line}")));
        }
        Ok(split_value_list(&tokens[3]))
    }

    /// All variables of a device, each as an ordered value list.
    pub async fn get_all_variables(
        &mut self,
        device: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, NutError> {
        self.send_line(&format!("LIST VAR {}", quote(device))).await?;
        let lines = self.read_list("VAR").await?;
        let mut vars = BTreeMap::new();
        for tokens in lines {
            // VAR <device> <name> "<value>"
            if tokens.len() >= 4 && tokens[0] == "VAR" {
                vars.insert(tokens[2].clone(), split_value_list(&tokens[3]));
            }
        }
        Ok(vars)
    }

    /// Instant commands a device supports.
    pub async fn list_commands(&mut self, device: &str) -> Result<Vec<String>, NutError> {
        self.send_line(&format!("LIST CMD {}", quote(device))).await?;
        let lines = self.read_list("CMD").await?;
        Ok(lines
            .into_iter()
            .filter_map(|tokens| {
                (tokens.first().map(String::as_str) == Some("CMD"))
                    .then(|| tokens.get(2).cloned())
                    .flatten()
            })
            .collect())
    }

    /// Issue an instant command and return the daemon's tracking ID.
    pub async fn send_instant_command(
        &mut self,
        device: &str,
        command: &str,
        argument: Option<&str>,
    ) -> Result<TrackingId, NutError> {
        if !self.tracking_enabled {
            self.send_line("SET TRACKING ON").await?;
            self.expect_ok().await?;
            self.tracking_enabled = true;
        }

        let line = match argument {
            Some(arg) => format!(
                "INSTCMD {} {} {}",
                quote(device),
                quote(command),
                quote(arg)
            ),
            None => format!("INSTCMD {} {}", quote(device), quote(command)),
        };
        self.send_line(&line).await?;

        let reply = self.read_line().await?;
        let reply = check_err(&reply)?;
        let tokens = tokenize(reply);
        // OK TRACKING <id>
        match tokens.as_slice() {
            [ok, tracking, id] if ok == "OK" && tracking == "TRACKING" => {
                trace!(%device, %command, %id, "instant command accepted");
                Ok(TrackingId(id.clone()))
            }
            _ => Err(NutError::Protocol(format!("unexpected reply: {reply}"))),
        }
    }

    /// Poll a tracking ID.
    pub async fn poll_tracking(&mut self, id: &TrackingId) -> Result<TrackingResult, NutError> {
        self.send_line(&format!("GET TRACKING {}", quote(&id.0)))
            .await?;
        let line = self.read_line().await?;
        let line = check_err(&line)?;
        match line.trim() {
            "PENDING" => Ok(TrackingResult::Pending),
            "SUCCESS" => Ok(TrackingResult::Success),
            _ => Ok(TrackingResult::Failure),
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), NutError> {
        trace!(%line, "nut >>");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, NutError> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(NutError::Communication("connection closed".into()));
        }
        let line = line.trim_end().to_string();
        trace!(%line, "nut <<");
        Ok(line)
    }

    /// Read a `BEGIN LIST … / END LIST …` block and return the tokenized
    /// body lines.
    async fn read_list(&mut self, kind: &str) -> Result<Vec<Vec<String>>, NutError> {
        let first = self.read_line().await?;
        let first = check_err(&first)?;
        if !first.starts_with(&format!("BEGIN LIST {kind}")) {
            return Err(NutError::Protocol(format!("unexpected reply: {first}")));
        }

        let mut items = Vec::new();
        loop {
            let line = self.read_line().await?;
            let line = check_err(&line)?;
            if line.starts_with(&format!("END LIST {kind}")) {
                break;
            }
            items.push(tokenize(&line));
        }
        Ok(items)
    }

    async fn expect_ok(&mut self) -> Result<(), NutError> {
        let line = self.read_line().await?;
        let line = check_err(&line)?;
        if line.starts_with("OK") {
            Ok(())
        } else {
            Err(NutError::Protocol(format!("expected OK, got: {line}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    /// Serve one scripted NUT session: for each (expected request,
    /// response lines) pair, read a line and answer.
    async fn scripted_daemon(script: Vec<(&'static str, Vec<&'static str>)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            for (expected, responses) in script {
                let mut line = String::new();
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    line.push_str(std::str::from_utf8(&buf[..n]).unwrap());
                    if line.ends_with('\n') {
                        break;
                    }
                }
                assert_eq!(line.trim_end(), expected);
                for response in responses {
                    socket
                        .write_all(format!("{response}\n").as_bytes())
                        .await
                        .unwrap();
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn list_devices_parses_names() {
        let port = scripted_daemon(vec![(
            "LIST UPS",
            vec![
                "BEGIN LIST UPS",
                r#"UPS ups-1 "Smart UPS""#,
                r#"UPS epdu-2 "Rack ePDU""#,
                "END LIST UPS",
            ],
        )])
        .await;

        let mut client = NutClient::connect("127.0.0.1", port).await.unwrap();
        let devices = client.list_devices().await.unwrap();
        assert_eq!(devices, vec!["ups-1", "epdu-2"]);
    }

    #[tokio::test]
    async fn get_variable_splits_comma_lists() {
        let port = scripted_daemon(vec![(
            "GET VAR ups-1 ambient.count",
            vec![r#"VAR ups-1 ambient.count "3""#],
        )])
        .await;

        let mut client = NutClient::connect("127.0.0.1", port).await.unwrap();
        let values = client.get_variable("ups-1", "ambient.count").await.unwrap();
        assert_eq!(values, vec!["3"]);
    }

    #[tokio::test]
    async fn missing_variable_is_not_found() {
        let port = scripted_daemon(vec![(
            "GET VAR ups-1 no.such.var",
            vec!["ERR VAR-NOT-SUPPORTED"],
        )])
        .await;

        let mut client = NutClient::connect("127.0.0.1", port).await.unwrap();
        let err = client.get_variable("ups-1", "no.such.var").await.unwrap_err();
        assert!(matches!(err, NutError::NotFound(_)));
    }

    #[tokio::test]
    async fn instant_command_enables_tracking_once() {
        let port = scripted_daemon(vec![
            ("SET TRACKING ON", vec!["OK"]),
            ("INSTCMD ups-1 load.off", vec!["OK TRACKING 42-abc"]),
            ("INSTCMD ups-1 load.on", vec!["OK TRACKING 43-def"]),
            ("GET TRACKING 42-abc", vec!["PENDING"]),
            ("GET TRACKING 42-abc", vec!["SUCCESS"]),
        ])
        .await;

        let mut client = NutClient::connect("127.0.0.1", port).await.unwrap();
        let id1 = client
            .send_instant_command("ups-1", "load.off", None)
            .await
            .unwrap();
        assert_eq!(id1, TrackingId("42-abc".into()));
        let id2 = client
            .send_instant_command("ups-1", "load.on", None)
            .await
            .unwrap();
        assert_eq!(id2, TrackingId("43-def".into()));

        assert_eq!(
            client.poll_tracking(&id1).await.unwrap(),
            TrackingResult::Pending
        );
        assert_eq!(
            client.poll_tracking(&id1).await.unwrap(),
            TrackingResult::Success
        );
    }
}
