use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use playlab_core::{PlayError, PollTarget, RetryPolicy, poll_until};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Per-request budget for one probe attempt; the overall budget belongs to
/// the retry policy.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Lightweight HEAD probe against a locally bound port. A 200 means ready;
/// refused connections and timeouts mean "not yet", never failure.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        HttpProbe {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn check(&self) -> bool {
        match self
            .client
            .head(&self.url)
            .timeout(PROBE_REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %self.url, "probe not ready: {e}");
                false
            }
        }
    }
}

/// Incremental scan of a growing log file for a marker substring.
///
/// The byte offset is explicit state carried between polls, advanced only
/// past complete lines, so every poll reads just the newly appended output.
/// A log file that does not exist yet is simply "not yet ready".
pub struct LogMarkerProbe {
    path: PathBuf,
    pattern: String,
    offset: u64,
}

impl LogMarkerProbe {
    pub fn new(path: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        LogMarkerProbe {
            path: path.into(),
            pattern: pattern.into(),
            offset: 0,
        }
    }

    /// Scans newly appended complete lines; on a match returns the full line
    /// as the discovered connection string.
    pub fn scan(&mut self) -> std::io::Result<Option<String>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            if !line.ends_with('\n') {
                // Partial line still being written; re-read it next poll.
                return Ok(None);
            }
            self.offset += n as u64;
            if line.contains(&self.pattern) {
                return Ok(Some(line.trim_end().to_string()));
            }
        }
    }
}

/// How a given service announces that it is ready.
pub enum ReadinessStrategy {
    Endpoint(HttpProbe),
    LogMarker(LogMarkerProbe),
}

/// Binds one readiness strategy to the supervised process it belongs to.
/// The liveness check is the fatal guard: a child that already exited will
/// never become ready, so polling on would only waste the timeout budget and
/// bury the real failure.
pub struct ReadinessCheck<'a> {
    supervisor: &'a mut ProcessSupervisor,
    strategy: ReadinessStrategy,
}

#[async_trait]
impl PollTarget for ReadinessCheck<'_> {
    type Output = String;

    async fn attempt(&mut self) -> Result<Option<String>, PlayError> {
        if !self.supervisor.is_alive()? {
            let status = self
                .supervisor
                .exit_status()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "never started".to_string());
            return Err(PlayError::ServiceCrashed {
                service: self.supervisor.name().to_string(),
                status,
                log_tail: self.supervisor.log_tail(30),
            });
        }

        match &mut self.strategy {
            ReadinessStrategy::Endpoint(probe) => {
                Ok(probe.check().await.then(|| probe.url().to_string()))
            }
            ReadinessStrategy::LogMarker(probe) => Ok(probe.scan()?),
        }
    }
}

/// Drives the strategy under the service's retry budget and returns the
/// connection string discovered by the probe.
pub async fn await_ready(
    supervisor: &mut ProcessSupervisor,
    strategy: ReadinessStrategy,
    policy: &RetryPolicy,
) -> Result<String, PlayError> {
    let what = format!("{} readiness", supervisor.name());
    let mut check = ReadinessCheck {
        supervisor,
        strategy,
    };
    poll_until(policy, &what, &mut check).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_probe_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut probe = LogMarkerProbe::new(dir.path().join("absent.log"), "ready");
        assert_eq!(probe.scan().unwrap(), None);
    }

    #[test]
    fn log_probe_scans_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        let mut probe = LogMarkerProbe::new(&path, ":8888/lab");

        std::fs::write(&path, "starting up\nloading kernels\n").unwrap();
        assert_eq!(probe.scan().unwrap(), None);
        let after_first = probe.offset;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "serving at http://127.0.0.1:8888/lab?token=abc").unwrap();
        let found = probe.scan().unwrap().unwrap();
        assert_eq!(found, "serving at http://127.0.0.1:8888/lab?token=abc");
        // Scanned bytes are never re-read.
        assert!(probe.offset > after_first);
    }

    #[test]
    fn log_probe_holds_back_on_partial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        std::fs::write(&path, "serving at :8888/lab").unwrap();

        let mut probe = LogMarkerProbe::new(&path, ":8888/lab");
        // No trailing newline yet, so the line is not complete.
        assert_eq!(probe.scan().unwrap(), None);
        assert_eq!(probe.offset, 0);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file).unwrap();
        assert!(probe.scan().unwrap().is_some());
    }

    #[tokio::test]
    async fn http_probe_is_pending_on_a_closed_port() {
        // Bind-then-drop guarantees the port is closed right now.
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = HttpProbe::new(format!("http://127.0.0.1:{port}/"));
        assert!(!probe.check().await);
    }

    #[tokio::test]
    async fn http_probe_succeeds_against_a_live_endpoint() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let probe = HttpProbe::new(format!("http://127.0.0.1:{port}/"));
        assert!(probe.check().await);
        server.await.unwrap();
    }
}
