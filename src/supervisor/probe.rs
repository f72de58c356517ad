use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::process::ProcessRole;
use crate::core::Allocation;

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeResult {
    Healthy,
    Unhealthy { reason: String },
    Exited { role: ProcessRole, code: Option<i32> },
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Checks that an allocated site answers.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, allocation: &Allocation) -> Result<(), String>;
}

/// Sends `HEAD /` with the site's `Host` header to the allocated port.
/// Any HTTP reply, whatever the status, counts as serving.
pub struct HttpProbe {
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, allocation: &Allocation) -> Result<(), String> {
        tokio::time::timeout(self.timeout, head_request(allocation))
            .await
            .map_err(|_| format!("no response within {}ms", self.timeout.as_millis()))?
    }
}

async fn head_request(allocation: &Allocation) -> Result<(), String> {
    let addr = SocketAddr::new(allocation.address(), allocation.port);
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("connect {}: {}", addr, e))?;

    let request = format!(
        "HEAD / HTTP/1.1\r\nHost: {}\r\nUser-Agent: furnace-probe\r\nConnection: close\r\n\r\n",
        allocation.hostname()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| format!("write to {}: {}", addr, e))?;

    let mut reply = [0u8; 5];
    let mut read = 0;
    while read < reply.len() {
        let n = stream
            .read(&mut reply[read..])
            .await
            .map_err(|e| format!("read from {}: {}", addr, e))?;
        if n == 0 {
            break;
        }
        read += n;
    }

    if &reply[..read] == b"HTTP/" {
        Ok(())
    } else {
        Err(format!("{} did not answer with HTTP", addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HostnameBinding;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    fn allocation(port: u16) -> Allocation {
        Allocation {
            recipe_name: "alpha".into(),
            port,
            hostname_binding: HostnameBinding {
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                hostname: "alpha.test".into(),
            },
        }
    }

    #[tokio::test]
    async fn http_reply_is_healthy_and_carries_host_header() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let n = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let probe = HttpProbe::new(Duration::from_secs(2));
        assert_eq!(probe.check(&allocation(port)).await, Ok(()));

        let request = server.await.unwrap();
        assert!(request.starts_with("HEAD / HTTP/1.1\r\n"));
        assert!(request.contains("Host: alpha.test\r\n"));
    }

    #[tokio::test]
    async fn non_http_reply_is_unhealthy() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"SSH-2.0-OpenSSH\r\n").await;
        });

        let probe = HttpProbe::new(Duration::from_secs(2));
        assert!(probe.check(&allocation(port)).await.is_err());
    }

    #[tokio::test]
    async fn closed_port_is_unhealthy() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = HttpProbe::new(Duration::from_secs(2));
        let err = probe.check(&allocation(port)).await.unwrap_err();
        assert!(err.starts_with("connect"));
    }

    #[test]
    fn probe_results_serialize_with_status_tag() {
        let json = serde_json::to_value(ProbeResult::Exited {
            role: ProcessRole::Serving,
            code: Some(1),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "exited", "role": "serving", "code": 1})
        );
    }
}
