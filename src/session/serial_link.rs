//! Serial transport (spec §4.1): open/close/write/read-line over a real
//! serial port, or an in-memory stand-in when the `serial` feature is off.
//!
//! Grounded on the teacher's `machines::grbl::poller::run_poller` idiom —
//! the port lives behind a `tokio::sync::Mutex` and every blocking I/O call
//! takes a `blocking_lock()` inside `spawn_blocking`, so the async runtime
//! is never blocked on a read — generalized from "one hardcoded poll loop"
//! into a transport any higher-level component can write to and read framed
//! lines from.

use crate::error::CoreError;
#[cfg(not(feature = "serial"))]
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
#[cfg(not(feature = "serial"))]
use tokio::sync::Notify;
use tracing::debug;

#[cfg(feature = "serial")]
use serialport::SerialPort;

/// Line framing: write `\n`-terminated, read stripping a trailing `\r?\n`
/// (spec §4.1). Firmware echoes vary in CR/LF discipline; we normalize on
/// read and are strict on write.
fn strip_line_ending(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
    }
    if line.ends_with('\r') {
        line.pop();
    }
    line
}

#[cfg(feature = "serial")]
struct OpenPort {
    port: Box<dyn SerialPort>,
    read_buf: Vec<u8>,
}

// `Box<dyn SerialPort>` is not `Sync`, but every access goes through the
// same `tokio::sync::Mutex`, so sharing across the `spawn_blocking` thread
// is safe in practice (the teacher's `PollerHandle` relies on the same
// property via `Arc<Mutex<Port>>`).
#[cfg(feature = "serial")]
unsafe impl Send for OpenPort {}

/// A session's serial transport. Not `Clone`; share it behind an `Arc` if
/// more than one task needs to drive the same port.
pub struct SerialLink {
    #[cfg(feature = "serial")]
    inner: Arc<Mutex<Option<OpenPort>>>,
    #[cfg(not(feature = "serial"))]
    open: Arc<Mutex<bool>>,
    /// Canned reply lines waiting to be handed back by `read_line`, and a
    /// record of what was written — lets integration tests drive a
    /// `ControllerSession` end to end without real hardware (SPEC_FULL §8).
    #[cfg(not(feature = "serial"))]
    incoming: Arc<Mutex<VecDeque<String>>>,
    #[cfg(not(feature = "serial"))]
    incoming_notify: Arc<Notify>,
    #[cfg(not(feature = "serial"))]
    written_lines: Arc<Mutex<Vec<String>>>,
    #[cfg(not(feature = "serial"))]
    written_realtime: Arc<Mutex<Vec<u8>>>,
    path: String,
}

impl SerialLink {
    #[cfg(feature = "serial")]
    pub fn new(path: impl Into<String>) -> Self {
        SerialLink {
            inner: Arc::new(Mutex::new(None)),
            path: path.into(),
        }
    }

    #[cfg(not(feature = "serial"))]
    pub fn new(path: impl Into<String>) -> Self {
        SerialLink {
            open: Arc::new(Mutex::new(false)),
            incoming: Arc::new(Mutex::new(VecDeque::new())),
            incoming_notify: Arc::new(Notify::new()),
            written_lines: Arc::new(Mutex::new(Vec::new())),
            written_realtime: Arc::new(Mutex::new(Vec::new())),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Queue a canned reply line for `read_line` to hand back, as if the
    /// firmware had written it. Test-only transport, not compiled with the
    /// `serial` feature.
    #[cfg(not(feature = "serial"))]
    pub async fn push_incoming_line(&self, line: impl Into<String>) {
        self.incoming.lock().await.push_back(line.into());
        self.incoming_notify.notify_waiters();
    }

    #[cfg(not(feature = "serial"))]
    pub async fn written_lines(&self) -> Vec<String> {
        self.written_lines.lock().await.clone()
    }

    #[cfg(not(feature = "serial"))]
    pub async fn written_realtime_bytes(&self) -> Vec<u8> {
        self.written_realtime.lock().await.clone()
    }

    #[cfg(feature = "serial")]
    pub async fn open(&self, baud_rate: u32, read_timeout: Duration) -> Result<(), CoreError> {
        {
            let guard = self.inner.lock().await;
            if guard.is_some() {
                return Err(CoreError::AlreadyOpen);
            }
        }
        let path = self.path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud_rate).timeout(read_timeout).open()
        })
        .await
        .map_err(|e| CoreError::Io { detail: e.to_string() })?
        .map_err(|e| CoreError::NoSuchPort { port: e.to_string() })?;

        let mut guard = self.inner.lock().await;
        *guard = Some(OpenPort { port: opened, read_buf: Vec::new() });
        debug!(port = %self.path, "serial link opened");
        Ok(())
    }

    #[cfg(not(feature = "serial"))]
    pub async fn open(&self, _baud_rate: u32, _read_timeout: Duration) -> Result<(), CoreError> {
        let mut guard = self.open.lock().await;
        if *guard {
            return Err(CoreError::AlreadyOpen);
        }
        *guard = true;
        Ok(())
    }

    #[cfg(feature = "serial")]
    pub async fn close(&self) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().await;
        if guard.take().is_none() {
            return Err(CoreError::NotOpen);
        }
        debug!(port = %self.path, "serial link closed");
        Ok(())
    }

    #[cfg(not(feature = "serial"))]
    pub async fn close(&self) -> Result<(), CoreError> {
        let mut guard = self.open.lock().await;
        if !*guard {
            return Err(CoreError::NotOpen);
        }
        *guard = false;
        Ok(())
    }

    #[cfg(feature = "serial")]
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    #[cfg(not(feature = "serial"))]
    pub async fn is_open(&self) -> bool {
        *self.open.lock().await
    }

    /// Write one line, appending the firmware's expected `\n` terminator.
    #[cfg(feature = "serial")]
    pub async fn write_line(&self, line: &str) -> Result<(), CoreError> {
        if !self.is_open().await {
            return Err(CoreError::NotOpen);
        }
        let mut buf = line.as_bytes().to_vec();
        buf.push(b'\n');
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.blocking_lock();
            let open = guard.as_mut().ok_or(std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))?;
            open.port.write_all(&buf)
        })
        .await
        .map_err(|e| CoreError::Io { detail: e.to_string() })?
        .map_err(|e| CoreError::PortGone { detail: e.to_string() })
    }

    #[cfg(not(feature = "serial"))]
    pub async fn write_line(&self, line: &str) -> Result<(), CoreError> {
        if !self.is_open().await {
            return Err(CoreError::NotOpen);
        }
        self.written_lines.lock().await.push(line.to_string());
        Ok(())
    }

    /// Write a single realtime byte with no line terminator.
    #[cfg(feature = "serial")]
    pub async fn write_realtime_byte(&self, byte: u8) -> Result<(), CoreError> {
        if !self.is_open().await {
            return Err(CoreError::NotOpen);
        }
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.blocking_lock();
            let open = guard.as_mut().ok_or(std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))?;
            open.port.write_all(&[byte])
        })
        .await
        .map_err(|e| CoreError::Io { detail: e.to_string() })?
        .map_err(|e| CoreError::PortGone { detail: e.to_string() })
    }

    #[cfg(not(feature = "serial"))]
    pub async fn write_realtime_byte(&self, byte: u8) -> Result<(), CoreError> {
        if !self.is_open().await {
            return Err(CoreError::NotOpen);
        }
        self.written_realtime.lock().await.push(byte);
        Ok(())
    }

    /// Blocking-read one `\n`-terminated line, with a timeout. Returns the
    /// line with its terminator stripped.
    #[cfg(feature = "serial")]
    pub async fn read_line(&self, timeout: Duration) -> Result<String, CoreError> {
        if !self.is_open().await {
            return Err(CoreError::NotOpen);
        }
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let mut guard = self.inner.lock().await;
                let open = guard.as_mut().ok_or(CoreError::NotOpen)?;
                if let Some(pos) = open.read_buf.iter().position(|&b| b == b'\n') {
                    let line_bytes: Vec<u8> = open.read_buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes).into_owned();
                    return Ok(strip_line_ending(line));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Timeout {
                    what: "serial read_line".to_string(),
                    ms: timeout.as_millis() as u64,
                });
            }

            let inner = Arc::clone(&self.inner);
            let chunk = tokio::task::spawn_blocking(move || {
                let mut guard = inner.blocking_lock();
                let open = guard
                    .as_mut()
                    .ok_or(std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))?;
                let mut buf = [0u8; 256];
                match open.port.read(&mut buf) {
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| CoreError::Io { detail: e.to_string() })?
            .map_err(|e| CoreError::PortGone { detail: e.to_string() })?;

            let mut guard = self.inner.lock().await;
            let open = guard.as_mut().ok_or(CoreError::NotOpen)?;
            open.read_buf.extend_from_slice(&chunk);
        }
    }

    #[cfg(not(feature = "serial"))]
    pub async fn read_line(&self, timeout: Duration) -> Result<String, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_open().await {
                return Err(CoreError::NotOpen);
            }
            if let Some(line) = self.incoming.lock().await.pop_front() {
                return Ok(line);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Timeout {
                    what: "serial read_line".to_string(),
                    ms: timeout.as_millis() as u64,
                });
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let poll_interval = Duration::from_millis(5).min(remaining);
            tokio::select! {
                _ = self.incoming_notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
