//! TCP dial probe.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::db::{CheckStatus, Target};

use super::{CheckResult, Checker, ErrorKind};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpChecker;

#[async_trait]
impl Checker for TcpChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();
        let address = format!("{}:{}", target.address, target.port);

        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => CheckResult {
                status: CheckStatus::Up,
                response_time_ms: start.elapsed().as_millis() as i64,
                message: "TCP connection successful".to_string(),
                ..Default::default()
            },
            Ok(Err(e)) => CheckResult::failed(
                ErrorKind::NetworkError,
                format!("TCP connection failed: {}", e),
                start.elapsed().as_millis() as i64,
            ),
            Err(_) => CheckResult::failed(
                ErrorKind::Timeout,
                format!("TCP connection to {} timed out", address),
                start.elapsed().as_millis() as i64,
            ),
        }
    }
}
