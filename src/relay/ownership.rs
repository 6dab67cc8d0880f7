//! Port ownership. Exactly one relay owns the port; a newcomer confirms the
//! occupant is a relay, asks it to leave over the loopback shutdown
//! endpoint, and takes the port once released.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, Instant};

use crate::error::{AppError, ExitCode};

/// Default port the relay binds.
pub const DEFAULT_RELAY_PORT: u16 = 9223;

/// How long a newcomer waits for the evicted relay to release the port.
const EVICTION_DEADLINE: Duration = Duration::from_secs(5);

/// Delay between bind retries during eviction.
const EVICTION_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the relay port, evicting a previous relay instance if one holds it.
///
/// # Errors
///
/// Returns `AppError` when the port is held by something that is not a
/// relay, or when the old relay does not release the port in time.
pub async fn bind_or_evict(host: &str, port: u16) -> Result<TcpListener, AppError> {
    let addr = format!("{host}:{port}");
    let first_err = match TcpListener::bind(&addr).await {
        Ok(listener) => return Ok(listener),
        Err(e) => e,
    };

    // Only evict something that answers like a relay.
    if http_request("GET", host, port, "/version", None).await.is_err() {
        return Err(AppError {
            message: format!("cannot bind {addr}: {first_err} (and the occupant is not a relay)"),
            code: ExitCode::ConnectionError,
        });
    }

    tracing::info!(%addr, "port held by another relay, requesting shutdown");
    let _ = http_request("POST", host, port, "/shutdown", None).await;

    let deadline = Instant::now() + EVICTION_DEADLINE;
    loop {
        tokio::time::sleep(EVICTION_BACKOFF).await;
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "port takeover complete");
                return Ok(listener);
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(AppError {
                        message: format!(
                            "previous relay did not release {addr} within 5s: {e}"
                        ),
                        code: ExitCode::TimeoutError,
                    });
                }
            }
        }
    }
}

/// Check whether a relay answers its health probe on `host:port`.
pub async fn probe(host: &str, port: u16) -> bool {
    http_request("HEAD", host, port, "/", None).await.is_ok()
}

/// Minimal HTTP/1.1 request against a loopback relay, returning the response
/// body.
///
/// The relay's own endpoints speak plain HTTP on loopback; a raw socket
/// exchange keeps the boot path and the CLI wrappers free of a client stack.
///
/// # Errors
///
/// Returns `AppError` on connect/write/read failure or a non-2xx status.
pub async fn http_request(
    method: &str,
    host: &str,
    port: u16,
    path: &str,
    json_body: Option<&str>,
) -> Result<String, AppError> {
    let addr = format!("{host}:{port}");
    let connect = TcpStream::connect(&addr);
    let mut stream = tokio::time::timeout(Duration::from_secs(2), connect)
        .await
        .map_err(|_| AppError {
            message: format!("connection to {addr} timed out"),
            code: ExitCode::TimeoutError,
        })?
        .map_err(|e| AppError {
            message: format!("connection failed to {addr}: {e}"),
            code: ExitCode::ConnectionError,
        })?;

    let body = json_body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len(),
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| AppError {
            message: format!("write failed: {e}"),
            code: ExitCode::ConnectionError,
        })?;

    let mut response = Vec::with_capacity(4096);
    let read = stream.read_to_end(&mut response);
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .map_err(|_| AppError {
            message: "read timed out".into(),
            code: ExitCode::TimeoutError,
        })?
        .map_err(|e| AppError {
            message: format!("read failed: {e}"),
            code: ExitCode::ConnectionError,
        })?;

    parse_response(&response)
}

/// Split a raw HTTP response into status check + body.
fn parse_response(raw: &[u8]) -> Result<String, AppError> {
    let text = String::from_utf8_lossy(raw);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return Err(AppError {
            message: "malformed HTTP response".into(),
            code: ExitCode::ConnectionError,
        });
    };
    let status_line = head.lines().next().unwrap_or_default();
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| (200..300).contains(&code));
    if ok {
        Ok(body.to_owned())
    } else {
        Err(AppError {
            message: format!("unexpected HTTP status: {status_line}"),
            code: ExitCode::ConnectionError,
        })
    }
}
