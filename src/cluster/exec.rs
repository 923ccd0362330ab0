//! Pod exec over the Kubernetes websocket channel protocol
//!
//! The API server multiplexes the command's streams over binary frames
//! whose first byte is the channel: 1 is stdout, 2 is stderr and 3 carries
//! the final status object.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::kube::ClusterConnection;
use super::{ExecError, ExecOutput, PodExec};
use crate::workload::DEVICE_CONTAINER;

/// Subprotocol negotiated with the API server
pub const EXEC_SUBPROTOCOL: &str = "v4.channel.k8s.io";

const STDOUT_CHANNEL: u8 = 1;
const STDERR_CHANNEL: u8 = 2;
const STATUS_CHANNEL: u8 = 3;

#[derive(Deserialize)]
struct ExecStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

/// Exec client connecting straight to the API server.
///
/// Certificate verification follows the platform roots; contexts marked
/// `insecure` are not honored here.
#[derive(Debug, Clone)]
pub struct WebSocketExec {
    connection: ClusterConnection,
}

impl WebSocketExec {
    pub fn new(connection: ClusterConnection) -> Self {
        Self { connection }
    }
}

/// Build the `wss://.../exec` URL for `command` in the device container
pub fn exec_url(server: &str, namespace: &str, pod: &str, command: &[String]) -> Result<Url, ExecError> {
    let mut url = Url::parse(server.trim_end_matches('/'))
        .map_err(|e| ExecError::Connect(pod.to_string(), e.to_string()))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|_| ExecError::Connect(pod.to_string(), format!("bad scheme {}", scheme)))?;
    url.set_path(&format!("/api/v1/namespaces/{}/pods/{}/exec", namespace, pod));
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("container", DEVICE_CONTAINER)
            .append_pair("stdout", "true")
            .append_pair("stderr", "true");
        for part in command {
            query.append_pair("command", part);
        }
    }
    Ok(url)
}

/// Split one binary frame into its channel output.
///
/// Returns `Some(Err)` for a failed status frame.
fn apply_frame(frame: &[u8], output: &mut ExecOutput) -> Option<Result<(), String>> {
    let (&channel, payload) = frame.split_first()?;
    let text = String::from_utf8_lossy(payload);
    match channel {
        STDOUT_CHANNEL => output.stdout.push_str(&text),
        STDERR_CHANNEL => output.stderr.push_str(&text),
        STATUS_CHANNEL if !payload.is_empty() => {
            let status: ExecStatus = match serde_json::from_slice(payload) {
                Ok(s) => s,
                Err(e) => return Some(Err(e.to_string())),
            };
            output.success = status.status == "Success";
            if !output.success && !status.message.is_empty() {
                output.stderr.push_str(&status.message);
            }
        }
        _ => {}
    }
    Some(Ok(()))
}

#[async_trait]
impl PodExec for WebSocketExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        let url = exec_url(&self.connection.server, namespace, pod, command)?;
        debug!("Exec in {}: {}", pod, command.join(" "));

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ExecError::Connect(pod.to_string(), e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(EXEC_SUBPROTOCOL),
        );
        if let Some(token) = &self.connection.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ExecError::Connect(pod.to_string(), e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ExecError::Connect(pod.to_string(), e.to_string()))?;

        // The status frame is authoritative; a stream closed without one
        // counts as success
        let mut output = ExecOutput {
            success: true,
            ..Default::default()
        };
        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| ExecError::Protocol(e.to_string()))?;
            match message {
                Message::Binary(data) => {
                    if let Some(Err(e)) = apply_frame(&data, &mut output) {
                        return Err(ExecError::Protocol(e));
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::argv;

    #[test]
    fn test_exec_url() {
        let url = exec_url(
            "https://10.0.0.1:6443/",
            "lab",
            "sw1",
            &argv(&["ovs-vsctl", "list-ports", "br0"]),
        )
        .unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/api/v1/namespaces/lab/pods/sw1/exec");
        let commands: Vec<String> = url
            .query_pairs()
            .filter(|(k, _)| k == "command")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(commands, vec!["ovs-vsctl", "list-ports", "br0"]);
        assert!(url.query().unwrap().contains("container=pod"));
    }

    #[test]
    fn test_frames_split_by_channel() {
        let mut output = ExecOutput::default();
        apply_frame(b"\x01hello ", &mut output);
        apply_frame(b"\x01world", &mut output);
        apply_frame(b"\x02warn", &mut output);
        let mut status = vec![STATUS_CHANNEL];
        status.extend_from_slice(br#"{"status":"Success"}"#);
        apply_frame(&status, &mut output);
        assert_eq!(output.stdout, "hello world");
        assert_eq!(output.stderr, "warn");
        assert!(output.success);
    }

    #[test]
    fn test_failure_status_frame() {
        let mut output = ExecOutput {
            success: true,
            ..Default::default()
        };
        let mut frame = vec![STATUS_CHANNEL];
        frame.extend_from_slice(
            br#"{"status":"Failure","message":"command terminated with non-zero exit code"}"#,
        );
        assert_eq!(apply_frame(&frame, &mut output), Some(Ok(())));
        assert!(!output.success);
        assert!(output.stderr.contains("non-zero exit code"));
    }
}
