//! Health checks for wallet-rpc nodes.
//!
//! Four strategies, cheapest first:
//! - `pid`: the recorded pid exists and its command line names wallet-rpc
//! - `port`: something accepts TCP connections on `host:port`
//! - `api`: `get_version` over JSON-RPC answers (the authoritative signal)
//! - `full`: all three, with `status` taken from `api`

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;

use crate::config::HealthConfig;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::process::{ProcessProbe, SystemProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMethod {
    Pid,
    Port,
    Api,
    Full,
}

impl CheckMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckMethod::Pid => "pid",
            CheckMethod::Port => "port",
            CheckMethod::Api => "api",
            CheckMethod::Full => "full",
        }
    }
}

impl fmt::Display for CheckMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pid" => Ok(CheckMethod::Pid),
            "port" => Ok(CheckMethod::Port),
            "api" => Ok(CheckMethod::Api),
            "full" => Ok(CheckMethod::Full),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

/// Outcome of one check. Never mutated after it is produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthVerdict {
    pub status: bool,
    pub method: CheckMethod,
    pub details: Details,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Details {
    Pid(PidDetails),
    Port(PortDetails),
    Api(ApiDetails),
    Full(Box<FullDetails>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PidDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_wallet_rpc: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortDetails {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullDetails {
    pub checks: FullChecks,
    pub summary: Summary,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullChecks {
    pub pid: HealthVerdict,
    pub port: HealthVerdict,
    pub api: HealthVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub pid_alive: bool,
    pub port_in_use: bool,
    pub api_responding: bool,
}

impl HealthVerdict {
    pub fn message(&self) -> &str {
        match &self.details {
            Details::Pid(d) => &d.message,
            Details::Port(d) => &d.message,
            Details::Api(d) => &d.message,
            Details::Full(d) => &d.message,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.details {
            Details::Port(d) => d.error.as_deref(),
            Details::Api(d) => d.error.as_deref(),
            Details::Pid(_) | Details::Full(_) => None,
        }
    }

    /// Details as stored in `worked_data`, stamped with `last_check`.
    pub fn worked_data(&self, now: DateTime<Utc>) -> Value {
        match serde_json::to_value(&self.details) {
            Ok(Value::Object(mut map)) => {
                map.insert("last_check".into(), Value::String(now.to_rfc3339()));
                Value::Object(map)
            }
            _ => json!({
                "method": self.method,
                "message": self.message(),
                "last_check": now.to_rfc3339(),
            }),
        }
    }

    fn pid(status: bool, details: PidDetails) -> Self {
        Self {
            status,
            method: CheckMethod::Pid,
            details: Details::Pid(details),
        }
    }
}

/// `full` verdict from its three parts. `status` is exactly the api status.
pub fn combine_full(
    pid: HealthVerdict,
    port: HealthVerdict,
    api: HealthVerdict,
    timestamp: DateTime<Utc>,
) -> HealthVerdict {
    let summary = Summary {
        pid_alive: pid.status,
        port_in_use: port.status,
        api_responding: api.status,
    };
    HealthVerdict {
        status: api.status,
        method: CheckMethod::Full,
        details: Details::Full(Box::new(FullDetails {
            message: full_message(summary).to_string(),
            summary,
            checks: FullChecks { pid, port, api },
            timestamp,
        })),
    }
}

/// First matching rule wins.
pub fn full_message(summary: Summary) -> &'static str {
    if summary.api_responding {
        "Process is fully operational"
    } else if summary.port_in_use {
        "Port is occupied but API is not responding"
    } else if summary.pid_alive {
        "Process exists but port is not in use"
    } else {
        "Process is not running"
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<VersionResult>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct VersionResult {
    #[serde(default)]
    version: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// `PidDetails::reason` when the command line could not be read.
pub const INTROSPECTION_UNAVAILABLE: &str = "IntrospectionUnavailable";

/// Runs health checks. Never writes to the node it inspects.
pub struct HealthChecker<P = SystemProbe> {
    client: reqwest::Client,
    port_timeout: Duration,
    expected_binary: String,
    probe: P,
}

impl HealthChecker<SystemProbe> {
    pub fn from_config(cfg: &HealthConfig) -> Result<Self> {
        Self::with_probe(cfg, SystemProbe)
    }
}

impl<P: ProcessProbe> HealthChecker<P> {
    pub fn with_probe(cfg: &HealthConfig, probe: P) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.api_timeout())
            .connect_timeout(cfg.api_timeout())
            .no_proxy()
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            port_timeout: cfg.port_timeout(),
            expected_binary: cfg.expected_binary.clone(),
            probe,
        })
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub async fn check(&self, node: &Node, method: CheckMethod) -> HealthVerdict {
        match method {
            CheckMethod::Pid => self.check_pid(node),
            CheckMethod::Port => self.check_port(node).await,
            CheckMethod::Api => self.check_api(node).await,
            CheckMethod::Full => self.check_full(node).await,
        }
    }

    /// Fast but advisory: pids get reused.
    pub fn check_pid(&self, node: &Node) -> HealthVerdict {
        let Some(pid) = node.pid else {
            return HealthVerdict::pid(
                false,
                PidDetails {
                    pid: None,
                    cmdline: None,
                    is_wallet_rpc: None,
                    reason: None,
                    message: "PID not set".into(),
                },
            );
        };

        if !self.probe.exists(pid) {
            return HealthVerdict::pid(
                false,
                PidDetails {
                    pid: Some(pid),
                    cmdline: None,
                    is_wallet_rpc: None,
                    reason: None,
                    message: "Process not found".into(),
                },
            );
        }

        match self.probe.cmdline(pid) {
            Ok(cmdline) => {
                let matches = cmdline.contains(&self.expected_binary);
                let message = if matches {
                    "Process is running".to_string()
                } else {
                    format!("Process exists but is not {}", self.expected_binary)
                };
                HealthVerdict::pid(
                    matches,
                    PidDetails {
                        pid: Some(pid),
                        cmdline: Some(cmdline),
                        is_wallet_rpc: Some(matches),
                        reason: None,
                        message,
                    },
                )
            }
            Err(e) => {
                log::debug!("cmdline of pid {pid} unavailable: {e}");
                HealthVerdict::pid(
                    false,
                    PidDetails {
                        pid: Some(pid),
                        cmdline: Some("unknown".into()),
                        is_wallet_rpc: None,
                        reason: Some(INTROSPECTION_UNAVAILABLE.into()),
                        message: "Process exists but its command line cannot be inspected".into(),
                    },
                )
            }
        }
    }

    /// Liveness proxy only: whoever holds the port passes.
    pub async fn check_port(&self, node: &Node) -> HealthVerdict {
        let attempt =
            tokio::time::timeout(self.port_timeout, TcpStream::connect((node.host.as_str(), node.port)))
                .await;

        let error = match attempt {
            Ok(Ok(_stream)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("connection timed out after {:?}", self.port_timeout)),
        };

        HealthVerdict {
            status: error.is_none(),
            method: CheckMethod::Port,
            details: Details::Port(PortDetails {
                host: node.host.clone(),
                port: node.port,
                message: if error.is_none() {
                    "Port is in use".into()
                } else {
                    "Port is not in use".into()
                },
                error,
            }),
        }
    }

    pub async fn check_api(&self, node: &Node) -> HealthVerdict {
        let failed = |url: Option<String>, status_code: Option<u16>, error: String, message: &str| {
            HealthVerdict {
                status: false,
                method: CheckMethod::Api,
                details: Details::Api(ApiDetails {
                    url,
                    version: None,
                    status_code,
                    error: Some(error),
                    message: message.to_string(),
                }),
            }
        };

        let url = match url::Url::parse(&format!("http://{}/json_rpc", node.address())) {
            Ok(url) => url,
            Err(e) => return failed(None, None, format!("invalid RPC url: {e}"), "API check failed"),
        };
        let url_str = url.to_string();

        let mut request = self.client.post(url).json(&json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": "get_version",
        }));
        if let Some((user, pass)) = node.credentials() {
            request = request.basic_auth(user, Some(pass));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return failed(Some(url_str), None, e.to_string(), "API check failed"),
        };

        let status = response.status();
        if !status.is_success() {
            return failed(
                Some(url_str),
                Some(status.as_u16()),
                format!("HTTP {status}"),
                "API returned error",
            );
        }

        let body: RpcResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return failed(
                    Some(url_str),
                    Some(status.as_u16()),
                    format!("unparseable response: {e}"),
                    "API check failed",
                );
            }
        };

        match (body.result, body.error) {
            (Some(result), _) => HealthVerdict {
                status: true,
                method: CheckMethod::Api,
                details: Details::Api(ApiDetails {
                    url: Some(url_str),
                    version: result.version.map(|v| match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    }),
                    status_code: Some(status.as_u16()),
                    error: None,
                    message: "API is responding".into(),
                }),
            },
            (None, Some(err)) => failed(
                Some(url_str),
                Some(status.as_u16()),
                format!("RPC error {}: {}", err.code, err.message),
                "API returned error",
            ),
            (None, None) => failed(
                Some(url_str),
                Some(status.as_u16()),
                "response carries neither result nor error".into(),
                "API check failed",
            ),
        }
    }

    pub async fn check_full(&self, node: &Node) -> HealthVerdict {
        let pid = self.check_pid(node);
        let (port, api) = tokio::join!(self.check_port(node), self.check_api(node));
        combine_full(pid, port, api, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use tokio::net::TcpListener;

    use super::*;
    use crate::node::fixture;
    use crate::process::testing::FakeProbe;

    fn config() -> HealthConfig {
        HealthConfig {
            port_timeout_ms: 500,
            api_timeout_ms: 1_000,
            expected_binary: "monero-wallet-rpc".into(),
        }
    }

    fn checker(probe: FakeProbe) -> HealthChecker<FakeProbe> {
        HealthChecker::with_probe(&config(), probe).unwrap()
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Minimal wallet-rpc stand-in answering `get_version`.
    async fn fake_rpc(require_auth: bool) -> (u16, tokio::task::JoinHandle<()>) {
        async fn version(Json(_body): Json<Value>) -> (StatusCode, Json<Value>) {
            (StatusCode::OK, Json(json!({"id": "0", "jsonrpc": "2.0", "result": {"version": 65562}})))
        }

        async fn version_with_auth(
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> (StatusCode, Json<Value>) {
            // "rpc:secret"
            if headers.get("authorization").and_then(|h| h.to_str().ok())
                != Some("Basic cnBjOnNlY3JldA==")
            {
                return (StatusCode::UNAUTHORIZED, Json(json!({})));
            }
            assert_eq!(body["method"], "get_version");
            (StatusCode::OK, Json(json!({"id": "0", "jsonrpc": "2.0", "result": {"version": 65562}})))
        }

        let app = if require_auth {
            axum::Router::new().route("/json_rpc", post(version_with_auth))
        } else {
            axum::Router::new().route("/json_rpc", post(version))
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (port, handle)
    }

    fn verdict(method: CheckMethod, status: bool) -> HealthVerdict {
        let details = match method {
            CheckMethod::Pid => Details::Pid(PidDetails {
                pid: None,
                cmdline: None,
                is_wallet_rpc: None,
                reason: None,
                message: String::new(),
            }),
            CheckMethod::Port => Details::Port(PortDetails {
                host: "127.0.0.1".into(),
                port: 1,
                error: None,
                message: String::new(),
            }),
            _ => Details::Api(ApiDetails {
                url: None,
                version: None,
                status_code: None,
                error: None,
                message: String::new(),
            }),
        };
        HealthVerdict {
            status,
            method,
            details,
        }
    }

    #[test]
    fn method_parsing() {
        assert_eq!("pid".parse::<CheckMethod>().unwrap(), CheckMethod::Pid);
        assert_eq!("FULL".parse::<CheckMethod>().unwrap(), CheckMethod::Full);
        assert!(matches!(
            "ping".parse::<CheckMethod>(),
            Err(Error::InvalidMethod(m)) if m == "ping"
        ));
    }

    #[test]
    fn full_status_always_follows_api() {
        for bits in 0..8u8 {
            let (pid, port, api) = (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
            let full = combine_full(
                verdict(CheckMethod::Pid, pid),
                verdict(CheckMethod::Port, port),
                verdict(CheckMethod::Api, api),
                Utc::now(),
            );
            assert_eq!(full.status, api, "pid={pid} port={port} api={api}");

            let Details::Full(details) = &full.details else {
                panic!("expected full details");
            };
            assert_eq!(
                details.summary,
                Summary {
                    pid_alive: pid,
                    port_in_use: port,
                    api_responding: api
                }
            );
        }
    }

    #[test]
    fn full_message_precedence() {
        let s = |pid_alive, port_in_use, api_responding| Summary {
            pid_alive,
            port_in_use,
            api_responding,
        };
        assert_eq!(full_message(s(false, false, true)), "Process is fully operational");
        assert_eq!(full_message(s(true, true, false)), "Port is occupied but API is not responding");
        assert_eq!(full_message(s(false, true, false)), "Port is occupied but API is not responding");
        assert_eq!(full_message(s(true, false, false)), "Process exists but port is not in use");
        assert_eq!(full_message(s(false, false, false)), "Process is not running");
    }

    #[test]
    fn pid_check_without_pid() {
        let v = checker(FakeProbe::default()).check_pid(&fixture(1, 18082));
        assert!(!v.status);
        assert_eq!(v.message(), "PID not set");
    }

    #[test]
    fn pid_check_distinguishes_missing_and_wrong_process() {
        let probe = FakeProbe::default()
            .with_process(100, "/usr/bin/monero-wallet-rpc --rpc-bind-port 18082")
            .with_process(200, "/usr/sbin/nginx -g daemon off;");
        let checker = checker(probe);
        let mut node = fixture(1, 18082);

        node.pid = Some(100);
        let v = checker.check_pid(&node);
        assert!(v.status);
        assert_eq!(v.message(), "Process is running");

        node.pid = Some(200);
        let v = checker.check_pid(&node);
        assert!(!v.status);
        assert_eq!(v.message(), "Process exists but is not monero-wallet-rpc");

        node.pid = Some(300);
        let v = checker.check_pid(&node);
        assert!(!v.status);
        assert_eq!(v.message(), "Process not found");
    }

    #[test]
    fn pid_check_without_introspection_fails_with_reason() {
        let probe = FakeProbe::default().with_opaque_process(100);
        let mut node = fixture(1, 18082);
        node.pid = Some(100);

        let v = checker(probe).check_pid(&node);
        assert!(!v.status);
        let Details::Pid(details) = &v.details else {
            panic!("expected pid details");
        };
        assert_eq!(details.reason.as_deref(), Some("IntrospectionUnavailable"));
        assert_eq!(details.cmdline.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn port_check_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = fixture(1, listener.local_addr().unwrap().port());
        let checker = checker(FakeProbe::default());

        let v = checker.check_port(&node).await;
        assert!(v.status);
        assert_eq!(v.message(), "Port is in use");

        drop(listener);
        let v = checker.check_port(&node).await;
        assert!(!v.status);
        assert!(v.error().is_some());
    }

    #[tokio::test]
    async fn api_check_against_closed_port_fails_fast() {
        let node = fixture(1, closed_port().await);
        let started = Instant::now();

        let v = checker(FakeProbe::default()).check_api(&node).await;

        assert!(!v.status);
        assert!(v.error().is_some_and(|e| !e.is_empty()));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn api_check_reports_version() {
        let (port, server) = fake_rpc(false).await;
        let v = checker(FakeProbe::default())
            .check_api(&fixture(1, port))
            .await;
        server.abort();

        assert!(v.status, "{v:?}");
        let Details::Api(details) = &v.details else {
            panic!("expected api details");
        };
        assert_eq!(details.version.as_deref(), Some("65562"));
        assert_eq!(details.url.as_deref(), Some(format!("http://127.0.0.1:{port}/json_rpc").as_str()));
    }

    #[tokio::test]
    async fn api_check_sends_basic_auth() {
        let (port, server) = fake_rpc(true).await;
        let checker = checker(FakeProbe::default());
        let mut node = fixture(1, port);

        let v = checker.check_api(&node).await;
        assert!(!v.status);
        assert_eq!(v.message(), "API returned error");
        let Details::Api(details) = &v.details else {
            panic!("expected api details");
        };
        assert_eq!(details.status_code, Some(401));

        node.username = Some("rpc".into());
        node.password = Some("secret".into());
        let v = checker.check_api(&node).await;
        server.abort();
        assert!(v.status, "{v:?}");
    }

    #[tokio::test]
    async fn full_check_uses_api_as_authority() {
        let (port, server) = fake_rpc(false).await;
        let v = checker(FakeProbe::default())
            .check(&fixture(1, port), CheckMethod::Full)
            .await;
        server.abort();

        assert!(v.status);
        assert_eq!(v.message(), "Process is fully operational");
        let Details::Full(details) = &v.details else {
            panic!("expected full details");
        };
        assert!(!details.summary.pid_alive);
        assert!(details.summary.port_in_use);
    }

    #[tokio::test]
    async fn full_check_on_dead_node() {
        let v = checker(FakeProbe::default())
            .check(&fixture(1, closed_port().await), CheckMethod::Full)
            .await;
        assert!(!v.status);
        assert_eq!(v.message(), "Process is not running");
    }

    #[test]
    fn worked_data_is_tagged_and_stamped() {
        let v = checker(FakeProbe::default()).check_pid(&fixture(1, 18082));
        let now = Utc::now();
        let data = v.worked_data(now);

        assert_eq!(data["method"], "pid");
        assert_eq!(data["message"], "PID not set");
        assert_eq!(data["last_check"], now.to_rfc3339());
    }
}
