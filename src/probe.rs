//! Readiness probing.
//!
//! After spawn the supervisor polls the declared port at a fixed interval
//! until the runtime's timeout elapses. A failed attempt (refused
//! connection, request timeout, unexpected status) is not fatal; only the
//! overall deadline is.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::process::ExitInfo;
use crate::runtime::Readiness;

/// Upper bound for a single probe attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    TimedOut,
    /// The process exited before it became ready.
    Exited(ExitInfo),
}

/// Polls `port` until it is ready, the deadline passes, or `exited` reports
/// that the process is gone.
pub async fn wait_until_ready(
    readiness: Readiness,
    port: u16,
    interval: Duration,
    timeout: Duration,
    mut exited: watch::Receiver<Option<ExitInfo>>,
) -> ProbeOutcome {
    let client = match readiness {
        Readiness::Http { .. } => reqwest::Client::builder()
            .no_proxy()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .ok(),
        Readiness::Tcp => None,
    };
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if let Some(info) = exited.borrow().clone() {
            return ProbeOutcome::Exited(info);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = probe_once(readiness, port, client.as_ref());
        if let Ok(true) = tokio::time::timeout(remaining.min(ATTEMPT_TIMEOUT), attempt).await {
            return ProbeOutcome::Ready;
        }

        let wake = (Instant::now() + interval).min(deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            changed = exited.changed() => {
                if changed.is_err() {
                    tokio::time::sleep_until(wake).await;
                }
            }
        }
    }
    if let Some(info) = exited.borrow().clone() {
        return ProbeOutcome::Exited(info);
    }
    ProbeOutcome::TimedOut
}

/// One readiness attempt.
pub async fn probe_once(readiness: Readiness, port: u16, client: Option<&reqwest::Client>) -> bool {
    match readiness {
        Readiness::Tcp => TcpStream::connect(("localhost", port)).await.is_ok(),
        Readiness::Http { accepted } => {
            let Some(client) = client else {
                return false;
            };
            match client.get(format!("http://localhost:{}/", port)).send().await {
                Ok(response) => accepted.contains(&response.status().as_u16()),
                Err(_) => false,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A minimal HTTP responder for readiness tests.

    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Binds an ephemeral port on 127.0.0.1 and answers every request with
    /// `status`. Returns the port; the server lives until the runtime ends.
    pub async fn serve_status(status: u16) -> u16 {
        serve_status_after(status, Duration::ZERO).await
    }

    /// Like [`serve_status`], but holds each response back for `delay`.
    pub async fn serve_status_after(status: u16, delay: Duration) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buffer = [0u8; 1024];
                    let _ = socket.read(&mut buffer).await;
                    tokio::time::sleep(delay).await;
                    let response = format!(
                        "HTTP/1.1 {} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        port
    }

    /// A port nothing is listening on.
    pub async fn closed_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{closed_port, serve_status};
    use super::*;

    const HTTP_OK: Readiness = Readiness::Http { accepted: &[200] };

    #[tokio::test]
    async fn http_probe_accepts_configured_codes() {
        let ok = serve_status(200).await;
        let forbidden = serve_status(403).await;
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        assert!(probe_once(HTTP_OK, ok, Some(&client)).await);
        assert!(!probe_once(HTTP_OK, forbidden, Some(&client)).await);
        let lenient = Readiness::Http {
            accepted: &[200, 403],
        };
        assert!(probe_once(lenient, forbidden, Some(&client)).await);
    }

    #[tokio::test]
    async fn tcp_probe_needs_a_listener() {
        let open = serve_status(200).await;
        assert!(probe_once(Readiness::Tcp, open, None).await);
        let closed = closed_port().await;
        assert!(!probe_once(Readiness::Tcp, closed, None).await);
    }

    #[tokio::test]
    async fn wait_until_ready_returns_once_serving() {
        let port = serve_status(200).await;
        let (_tx, rx) = watch::channel(None);
        let outcome = wait_until_ready(
            HTTP_OK,
            port,
            Duration::from_millis(50),
            Duration::from_secs(2),
            rx,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Ready);
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_on_silence() {
        let port = closed_port().await;
        let (_tx, rx) = watch::channel(None);
        let started = std::time::Instant::now();
        let outcome = wait_until_ready(
            Readiness::Tcp,
            port,
            Duration::from_millis(100),
            Duration::from_millis(600),
            rx,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1200), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn wait_until_ready_stops_when_process_exits() {
        let port = closed_port().await;
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(Some(ExitInfo::new(Some(1))));
        });
        let outcome = wait_until_ready(
            Readiness::Tcp,
            port,
            Duration::from_millis(500),
            Duration::from_secs(5),
            rx,
        )
        .await;
        match outcome {
            ProbeOutcome::Exited(info) => assert_eq!(info.code, Some(1)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
