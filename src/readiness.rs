use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::DeskError;

/// One connection attempt against the backend listener.
pub(crate) trait Connector: Send + Sync {
    fn attempt(&self, host: &str, port: u16) -> bool;
}

pub(crate) struct TcpConnector {
    pub(crate) connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(200),
        }
    }
}

impl Connector for TcpConnector {
    fn attempt(&self, host: &str, port: u16) -> bool {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(_) => return false,
        };
        addrs.iter().any(|address| {
            TcpStream::connect_timeout(address, self.connect_timeout)
                .map(|stream| {
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                })
                .is_ok()
        })
    }
}

/// Polls `host:port` every `interval` until a connection succeeds.
///
/// Without a timeout the probe retries forever; failed attempts are never reported.
#[derive(Debug, Clone)]
pub(crate) struct ReadinessProbe {
    host: String,
    port: u16,
    interval: Duration,
    timeout: Option<Duration>,
}

pub(crate) type ProbeResult = Result<u64, DeskError>;

impl ReadinessProbe {
    pub(crate) fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            interval: Duration::from_millis(250),
            timeout: None,
        }
    }

    pub(crate) fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub(crate) fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Blocks until the first successful attempt and returns how many attempts it took.
    pub(crate) fn wait(&self, connector: &dyn Connector) -> ProbeResult {
        let never_cancelled = AtomicBool::new(false);
        match self.poll(connector, &never_cancelled) {
            Some(result) => result,
            None => Err(DeskError::Lifecycle("readiness probe cancelled".to_string())),
        }
    }

    /// Runs the probe on a background thread. `on_ready` fires at most once, and never
    /// after the returned handle has been cancelled.
    pub(crate) fn spawn<F>(self, connector: Arc<dyn Connector>, on_ready: F) -> ProbeHandle
    where
        F: FnOnce(ProbeResult) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let thread_cancelled = Arc::clone(&cancelled);
        let thread = thread::spawn(move || {
            if let Some(result) = self.poll(connector.as_ref(), &thread_cancelled) {
                if !thread_cancelled.load(Ordering::Acquire) {
                    on_ready(result);
                }
            }
        });
        ProbeHandle {
            cancelled,
            thread: Some(thread),
        }
    }

    fn poll(&self, connector: &dyn Connector, cancelled: &AtomicBool) -> Option<ProbeResult> {
        let started = Instant::now();
        let mut attempts: u64 = 0;
        loop {
            thread::sleep(self.interval);
            if cancelled.load(Ordering::Acquire) {
                return None;
            }
            attempts += 1;
            if connector.attempt(&self.host, self.port) {
                log::debug!(
                    "backend at {} accepted a connection after {} attempt(s)",
                    self.address(),
                    attempts
                );
                return Some(Ok(attempts));
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    return Some(Err(DeskError::ReadinessTimeout {
                        address: self.address(),
                        waited_ms: limit.as_millis() as u64,
                    }));
                }
            }
        }
    }
}

pub(crate) struct ProbeHandle {
    cancelled: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ProbeHandle {
    /// Stops the poller and waits for its thread, at most one interval plus one attempt.
    pub(crate) fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("readiness probe thread panicked");
            }
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
