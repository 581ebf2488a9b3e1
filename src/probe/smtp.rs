//! SMTP server probe.
//!
//! Speaks the SMTP dialog directly over a plain or TLS stream. The
//! [`SmtpSession`] type is shared with the mail notifier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::db::{CheckStatus, Target};

use super::{CheckResult, Checker, ErrorKind, RequestDetails};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("smtp i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("smtp dial timed out")]
    Timeout,
    #[error("tls error: {0}")]
    Tls(String),
    #[error("unexpected reply to {command}: {code} {text}")]
    Reply {
        command: String,
        code: u16,
        text: String,
    },
}

/// One server reply, possibly multi-line.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }

    /// EHLO capability test, e.g. `STARTTLS` or `AUTH`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.lines
            .iter()
            .any(|line| line.to_uppercase().starts_with(capability))
    }

    fn text(&self) -> String {
        self.lines.join(" / ")
    }
}

enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl SmtpStream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SmtpStream::Plain(s) => s.read(buf).await,
            SmtpStream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            SmtpStream::Plain(s) => s.write_all(buf).await,
            SmtpStream::Tls(s) => s.write_all(buf).await,
        }
    }
}

/// A live SMTP dialog.
pub(crate) struct SmtpSession {
    stream: SmtpStream,
    buf: Vec<u8>,
}

impl SmtpSession {
    /// Dial `host:port`, optionally with implicit TLS, and consume the
    /// 220 greeting.
    pub async fn connect(host: &str, port: u16, implicit_tls: bool) -> Result<Self, SmtpError> {
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SmtpError::Timeout)??;

        let stream = if implicit_tls {
            SmtpStream::Tls(Box::new(tls_wrap(tcp, host).await?))
        } else {
            SmtpStream::Plain(tcp)
        };

        let mut session = Self {
            stream,
            buf: Vec::new(),
        };
        let greeting = session.read_reply().await?;
        if greeting.code != 220 {
            return Err(SmtpError::Reply {
                command: "connect".to_string(),
                code: greeting.code,
                text: greeting.text(),
            });
        }
        Ok(session)
    }

    pub async fn command(&mut self, line: &str) -> Result<Reply, SmtpError> {
        self.stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .await?;
        self.read_reply().await
    }

    /// Send a command and require a 2xx/3xx reply.
    pub async fn expect(&mut self, line: &str) -> Result<Reply, SmtpError> {
        let reply = self.command(line).await?;
        if !reply.is_positive() {
            return Err(SmtpError::Reply {
                command: line.split_whitespace().next().unwrap_or(line).to_string(),
                code: reply.code,
                text: reply.text(),
            });
        }
        Ok(reply)
    }

    pub async fn ehlo(&mut self, domain: &str) -> Result<Reply, SmtpError> {
        self.expect(&format!("EHLO {}", domain)).await
    }

    /// Upgrade the connection with STARTTLS. Only valid on a plain stream.
    pub async fn starttls(mut self, host: &str) -> Result<Self, SmtpError> {
        self.expect("STARTTLS").await?;
        match self.stream {
            SmtpStream::Plain(tcp) => Ok(Self {
                stream: SmtpStream::Tls(Box::new(tls_wrap(tcp, host).await?)),
                buf: Vec::new(),
            }),
            SmtpStream::Tls(_) => Err(SmtpError::Tls("connection is already TLS".to_string())),
        }
    }

    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), SmtpError> {
        let token = BASE64.encode(format!("\0{}\0{}", username, password));
        self.expect(&format!("AUTH PLAIN {}", token)).await?;
        Ok(())
    }

    /// Send a message body after MAIL FROM/RCPT TO.
    pub async fn data(&mut self, body: &str) -> Result<(), SmtpError> {
        let reply = self.command("DATA").await?;
        if reply.code != 354 {
            return Err(SmtpError::Reply {
                command: "DATA".to_string(),
                code: reply.code,
                text: reply.text(),
            });
        }
        self.stream.write_all(body.as_bytes()).await?;
        self.stream.write_all(b"\r\n.\r\n").await?;
        let reply = self.read_reply().await?;
        if !reply.is_positive() {
            return Err(SmtpError::Reply {
                command: "DATA".to_string(),
                code: reply.code,
                text: reply.text(),
            });
        }
        Ok(())
    }

    pub async fn quit(&mut self) -> Result<(), SmtpError> {
        self.expect("QUIT").await?;
        Ok(())
    }

    /// Read a full (possibly multi-line) reply.
    async fn read_reply(&mut self) -> Result<Reply, SmtpError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.len() < 4 {
                return Err(SmtpError::Reply {
                    command: "read".to_string(),
                    code: 0,
                    text: line,
                });
            }
            let code: u16 = line[..3].parse().map_err(|_| SmtpError::Reply {
                command: "read".to_string(),
                code: 0,
                text: line.clone(),
            })?;
            let last = line.as_bytes()[3] != b'-';
            lines.push(line[4..].to_string());
            if last {
                return Ok(Reply { code, lines });
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, SmtpError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                if line.ends_with(b"\n") {
                    line.pop();
                }
                if line.ends_with(b"\r") {
                    line.pop();
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            let mut chunk = [0u8; 512];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(SmtpError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

async fn tls_wrap(tcp: TcpStream, host: &str) -> Result<TlsStream<TcpStream>, SmtpError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };
    let config = Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| SmtpError::Tls(format!("invalid server name: {}", host)))?;
    TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| SmtpError::Tls(e.to_string()))
}

pub struct SmtpChecker;

#[async_trait]
impl Checker for SmtpChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let start = Instant::now();

        let host = target.address.clone();
        let port = if target.port != 0 {
            target.port
        } else if target.smtp.use_tls {
            465
        } else {
            25
        };
        let address = format!("{}:{}", host, port);

        let outcome = run_smtp_dialog(target, &host, port).await;
        let response_time = start.elapsed().as_millis() as i64;

        let mut result = match outcome {
            Ok(dialog) => {
                let mut message = if target.smtp.use_tls {
                    "SMTPS server is operational".to_string()
                } else {
                    "SMTP server is operational".to_string()
                };
                if dialog.authenticated {
                    message.push_str(" (authenticated)");
                }
                if dialog.starttls {
                    message.push_str(" (STARTTLS verified)");
                }

                let mut data = serde_json::Map::new();
                data.insert("starttls".to_string(), dialog.starttls.into());
                data.insert("authenticated".to_string(), dialog.authenticated.into());
                data.insert("host".to_string(), host.clone().into());

                CheckResult {
                    status: CheckStatus::Up,
                    response_time_ms: response_time,
                    message,
                    data,
                    ..Default::default()
                }
            }
            Err(DialogError::Degraded(message)) => CheckResult {
                status: CheckStatus::Degraded,
                response_time_ms: response_time,
                message,
                ..Default::default()
            },
            Err(DialogError::Down(kind, message)) => {
                CheckResult::failed(kind, message, response_time)
            }
        };

        result.request = RequestDetails {
            method: "SMTP".to_string(),
            url: address,
            ..Default::default()
        };
        result
    }
}

struct DialogOutcome {
    starttls: bool,
    authenticated: bool,
}

enum DialogError {
    Degraded(String),
    Down(ErrorKind, String),
}

impl From<SmtpError> for DialogError {
    fn from(e: SmtpError) -> Self {
        match e {
            SmtpError::Timeout => DialogError::Down(ErrorKind::Timeout, e.to_string()),
            SmtpError::Io(_) => {
                DialogError::Down(ErrorKind::NetworkError, format!("Connection failed: {}", e))
            }
            SmtpError::Tls(_) => DialogError::Down(ErrorKind::SslError, e.to_string()),
            SmtpError::Reply { .. } => DialogError::Down(ErrorKind::ProtocolError, e.to_string()),
        }
    }
}

async fn run_smtp_dialog(
    target: &Target,
    host: &str,
    port: u16,
) -> Result<DialogOutcome, DialogError> {
    let mut session = SmtpSession::connect(host, port, target.smtp.use_tls).await?;
    let ehlo = session.ehlo("netpulse.local").await?;

    let mut starttls = false;
    if target.smtp.check_starttls && !target.smtp.use_tls {
        if !ehlo.has_capability("STARTTLS") {
            return Err(DialogError::Degraded(
                "STARTTLS not supported by server".to_string(),
            ));
        }
        session = session
            .starttls(host)
            .await
            .map_err(|e| DialogError::Degraded(format!("STARTTLS upgrade failed: {}", e)))?;
        session.ehlo("netpulse.local").await?;
        starttls = true;
    }

    let mut authenticated = false;
    if !target.smtp.username.is_empty() && !target.smtp.password.is_empty() {
        session
            .auth_plain(&target.smtp.username, &target.smtp.password)
            .await
            .map_err(|e| {
                DialogError::Down(
                    ErrorKind::ProtocolError,
                    format!("SMTP authentication failed: {}", e),
                )
            })?;
        authenticated = true;
    }

    let mail_from = if target.smtp.mail_from.is_empty() {
        "test@example.com"
    } else {
        &target.smtp.mail_from
    };
    session
        .expect(&format!("MAIL FROM:<{}>", mail_from))
        .await
        .map_err(|e| {
            DialogError::Down(
                ErrorKind::ProtocolError,
                format!("MAIL FROM command failed: {}", e),
            )
        })?;

    if !target.smtp.mail_to.is_empty() {
        session
            .expect(&format!("RCPT TO:<{}>", target.smtp.mail_to))
            .await
            .map_err(|e| DialogError::Degraded(format!("RCPT TO command failed: {}", e)))?;
    }

    session
        .expect("RSET")
        .await
        .map_err(|e| DialogError::Degraded(format!("RSET command failed: {}", e)))?;
    session
        .quit()
        .await
        .map_err(|e| DialogError::Degraded(format!("QUIT command failed: {}", e)))?;

    Ok(DialogOutcome {
        starttls,
        authenticated,
    })
}
