//! Health probe logic.
//!
//! Performs an HTTP GET against `{host}:{port}{path}` and turns the
//! response into a [`ProbeOutcome`]. The prober is a trait so the control
//! loop can be driven by scripted outcomes in tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use fleetgrid_state::{HealthReport, ResourceUsage, ServerInstance};

/// Probe schedule and request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Seconds between probe cycles.
    pub interval_secs: u64,
    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,
    /// HTTP path to probe.
    pub path: String,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_ms: 5000,
            path: "/health".to_string(),
        }
    }
}

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    /// The endpoint answered 2xx.
    Healthy {
        latency: Duration,
        usage: ResourceUsage,
    },
    /// The endpoint answered with a non-2xx status.
    Unhealthy { latency: Duration, status: u16 },
    /// No response: connection error, protocol error, or timeout.
    Failed,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    /// Registry update for this outcome. Fields the outcome cannot vouch
    /// for are left as `None` so the last known values survive.
    pub fn into_report(self) -> HealthReport {
        match self {
            Self::Healthy { latency, usage } => HealthReport {
                healthy: true,
                response_time: Some(millis(latency)),
                resource_usage: Some(usage),
            },
            Self::Unhealthy { latency, .. } => HealthReport {
                healthy: false,
                response_time: Some(millis(latency)),
                resource_usage: None,
            },
            Self::Failed => HealthReport {
                healthy: false,
                response_time: None,
                resource_usage: None,
            },
        }
    }
}

/// Something that can probe an instance.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, instance: &ServerInstance) -> ProbeOutcome;
}

/// Production prober speaking HTTP/1.1 over a fresh TCP connection.
#[derive(Debug, Clone)]
pub struct HttpProber {
    path: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn from_config(config: &HealthCheckConfig) -> Self {
        Self::new(config.path.clone(), config.timeout())
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::from_config(&HealthCheckConfig::default())
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, instance: &ServerInstance) -> ProbeOutcome {
        http_probe(&instance.endpoint(), &self.path, self.timeout).await
    }
}

/// Perform an HTTP health probe against `address` (`host:port`).
///
/// Latency covers connect through the last body byte.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();

    match tokio::time::timeout(timeout, fetch(address, path)).await {
        Ok(Some((status, body))) => {
            let latency = started.elapsed();
            if status.is_success() {
                ProbeOutcome::Healthy {
                    latency,
                    usage: parse_resource_usage(&body),
                }
            } else {
                debug!(%status, %address, path, "health probe non-2xx");
                ProbeOutcome::Unhealthy {
                    latency,
                    status: status.as_u16(),
                }
            }
        }
        Ok(None) => ProbeOutcome::Failed,
        Err(_) => {
            debug!(
                %address,
                path,
                timeout_ms = timeout.as_millis() as u64,
                "health probe timed out"
            );
            ProbeOutcome::Failed
        }
    }
}

async fn fetch(address: &str, path: &str) -> Option<(http::StatusCode, Bytes)> {
    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %address, "health probe connection failed");
            return None;
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %address, "health probe handshake failed");
            return None;
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", address)
        .header("user-agent", "fleetgrid-health/0.1")
        .body(http_body_util::Empty::<Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, path, "invalid health probe request");
            return None;
        }
    };

    let resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, %address, "health probe request failed");
            return None;
        }
    };

    let status = resp.status();
    let body = match resp.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            // The status line already arrived; judge on that alone.
            debug!(error = %e, %address, "health probe body read failed");
            Bytes::new()
        }
    };
    Some((status, body))
}

/// Extract `metrics.resourceUsage.{cpuUsage,memoryUsage}` from a health
/// payload. Missing, malformed, or non-numeric fields read as 0.
pub fn parse_resource_usage(body: &[u8]) -> ResourceUsage {
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(body) else {
        return ResourceUsage::default();
    };
    let field = |name: &str| {
        payload
            .pointer(&format!("/metrics/resourceUsage/{name}"))
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0)
    };
    ResourceUsage {
        cpu_usage: field("cpuUsage"),
        memory_usage: field("memoryUsage"),
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a fixed HTTP response to every connection.
    async fn canned_server(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => read += n,
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    #[test]
    fn parse_full_payload() {
        let body = br#"{"status":"ok","metrics":{"resourceUsage":{"cpuUsage":42.5,"memoryUsage":61}}}"#;
        let usage = parse_resource_usage(body);
        assert_eq!(usage.cpu_usage, 42.5);
        assert_eq!(usage.memory_usage, 61.0);
    }

    #[test]
    fn parse_missing_fields_default_to_zero() {
        assert_eq!(parse_resource_usage(b""), ResourceUsage::default());
        assert_eq!(parse_resource_usage(b"not json"), ResourceUsage::default());
        assert_eq!(parse_resource_usage(br#"{"metrics":{}}"#), ResourceUsage::default());

        let partial = parse_resource_usage(
            br#"{"metrics":{"resourceUsage":{"cpuUsage":"high","memoryUsage":12}}}"#,
        );
        assert_eq!(partial.cpu_usage, 0.0);
        assert_eq!(partial.memory_usage, 12.0);
    }

    #[test]
    fn outcome_reports_keep_unknown_fields_empty() {
        let healthy = ProbeOutcome::Healthy {
            latency: Duration::from_millis(25),
            usage: ResourceUsage {
                cpu_usage: 10.0,
                memory_usage: 20.0,
            },
        }
        .into_report();
        assert!(healthy.healthy);
        assert_eq!(healthy.response_time, Some(25.0));
        assert!(healthy.resource_usage.is_some());

        let unhealthy = ProbeOutcome::Unhealthy {
            latency: Duration::from_millis(7),
            status: 503,
        }
        .into_report();
        assert!(!unhealthy.healthy);
        assert_eq!(unhealthy.response_time, Some(7.0));
        assert_eq!(unhealthy.resource_usage, None);

        let failed = ProbeOutcome::Failed.into_report();
        assert!(!failed.healthy);
        assert_eq!(failed.response_time, None);
        assert_eq!(failed.resource_usage, None);
    }

    #[test]
    fn default_config_matches_probe_contract() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.timeout(), Duration::from_millis(5000));
        assert_eq!(config.path, "/health");
    }

    #[tokio::test]
    async fn http_probe_success_parses_metrics() {
        let addr = canned_server(
            "200 OK",
            r#"{"metrics":{"resourceUsage":{"cpuUsage":33,"memoryUsage":44}}}"#,
        )
        .await;

        let outcome = http_probe(&addr, "/health", Duration::from_secs(2)).await;
        match outcome {
            ProbeOutcome::Healthy { usage, .. } => {
                assert_eq!(usage.cpu_usage, 33.0);
                assert_eq!(usage.memory_usage, 44.0);
            }
            other => panic!("expected healthy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_probe_non_2xx_is_unhealthy() {
        let addr = canned_server("503 Service Unavailable", "{}").await;
        let outcome = http_probe(&addr, "/health", Duration::from_secs(2)).await;
        assert!(matches!(outcome, ProbeOutcome::Unhealthy { status: 503, .. }));
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_returns_failed() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let outcome = http_probe(&addr, "/health", Duration::from_millis(500)).await;
        assert_eq!(outcome, ProbeOutcome::Failed);
    }

    #[tokio::test]
    async fn http_probe_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Accept and hold the socket open without answering.
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let outcome = http_probe(&addr, "/health", Duration::from_millis(100)).await;
        assert_eq!(outcome, ProbeOutcome::Failed);
    }

    #[tokio::test]
    async fn http_prober_uses_instance_endpoint() {
        let addr = canned_server("200 OK", "{}").await;
        let (host, port) = addr.rsplit_once(':').unwrap();
        let instance = ServerInstance {
            id: "api-1".into(),
            host: host.to_string(),
            port: port.parse().unwrap(),
            weight: 1.0,
            current_connections: 0,
            max_connections: 10,
            healthy: false,
            last_health_check: 0,
            response_time: 0.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
        };

        let prober = HttpProber::new("/health", Duration::from_secs(2));
        assert!(prober.probe(&instance).await.is_healthy());
    }
}
