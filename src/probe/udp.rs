//! UDP dial probe.
//!
//! Success only means the socket connected; no payload is exchanged, so an
//! unreachable peer may still report up.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::db::{CheckStatus, Target};

use super::{CheckResult, Checker, ErrorKind};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct UdpChecker;

#[async_trait]
impl Checker for UdpChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();
        let address = format!("{}:{}", target.address, target.port);

        let dial = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&address).await?;
            Ok::<(), std::io::Error>(())
        };

        match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
            Ok(Ok(())) => CheckResult {
                status: CheckStatus::Up,
                response_time_ms: start.elapsed().as_millis() as i64,
                message: "UDP connection successful".to_string(),
                ..Default::default()
            },
            Ok(Err(e)) => CheckResult::failed(
                ErrorKind::NetworkError,
                format!("UDP connection failed: {}", e),
                start.elapsed().as_millis() as i64,
            ),
            Err(_) => CheckResult::failed(
                ErrorKind::Timeout,
                format!("UDP connection to {} timed out", address),
                start.elapsed().as_millis() as i64,
            ),
        }
    }
}
