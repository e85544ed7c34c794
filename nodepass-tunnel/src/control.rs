//! The control-channel line protocol (§4.5): handshake, launch signals,
//! keepalive, and the pool-flush signal. Lines are URL-shaped
//! (`scheme://host#fragment`) but the grammar is small enough that a
//! hand-rolled parser is clearer than pulling in a general URL parser.

use std::collections::VecDeque;
use std::sync::Arc;

use nodepass_shared::{FlowId, Protocol, ProtocolError, TlsMode};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify};
use tracing::warn;

/// A single parsed line on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Handshake { remote_port: u16, tls_mode: TlsMode },
    Launch { id: FlowId, protocol: Protocol },
    Flush,
    Keepalive,
}

pub fn encode_handshake(remote_port: u16, tls_mode: TlsMode) -> String {
    format!("tunnel://{remote_port}#{}\n", tls_mode.code())
}

pub fn encode_launch(id: &FlowId, protocol: Protocol) -> String {
    format!("//{id}#{}\n", protocol.fragment())
}

pub fn encode_flush() -> String {
    "//#0\n".to_string()
}

pub fn encode_keepalive() -> String {
    "\n".to_string()
}

/// Maximum line length the reader accepts before treating the line as
/// malformed (§6 "maximum line length ≈ 256 bytes").
const MAX_LINE_LEN: usize = 256;

pub fn parse_line(raw: &str) -> Result<Signal, ProtocolError> {
    let line = raw.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(Signal::Keepalive);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(ProtocolError::Malformed(line.to_string()));
    }

    if let Some(rest) = line.strip_prefix("tunnel://") {
        let (host, frag) = split_fragment(rest).ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
        let remote_port: u16 = host
            .parse()
            .map_err(|_| ProtocolError::Malformed(line.to_string()))?;
        let tls_mode =
            TlsMode::from_code(frag).ok_or_else(|| ProtocolError::UnknownFragment(frag.to_string()))?;
        return Ok(Signal::Handshake { remote_port, tls_mode });
    }

    if let Some(rest) = line.strip_prefix("//") {
        let (host, frag) = split_fragment(rest).ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
        return match frag {
            "0" => Ok(Signal::Flush),
            "1" | "2" => {
                let protocol = Protocol::from_fragment(frag)
                    .ok_or_else(|| ProtocolError::UnknownFragment(frag.to_string()))?;
                Ok(Signal::Launch {
                    id: FlowId::from(host.to_string()),
                    protocol,
                })
            }
            other => Err(ProtocolError::UnknownFragment(other.to_string())),
        };
    }

    Err(ProtocolError::Malformed(line.to_string()))
}

fn split_fragment(s: &str) -> Option<(&str, &str)> {
    let idx = s.find('#')?;
    Some((&s[..idx], &s[idx + 1..]))
}

/// Serializes writes to the control channel behind a mutex so that a
/// signal or keepalive is always written as one atomic line (§5 "exactly
/// one writer per endpoint").
pub struct ControlWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: Mutex::new(writer) }
    }

    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.inner.lock().await;
        guard.write_all(line.as_bytes()).await?;
        guard.flush().await
    }
}

/// Reads lines off the control channel and hands back parsed [`Signal`]s.
/// Malformed lines and unknown fragments are logged and skipped, never
/// surfaced as an error (§7 ProtocolError: "logged, line dropped, tunnel
/// continues").
pub struct ControlReader<R> {
    inner: BufReader<R>,
}

impl<R: tokio::io::AsyncRead + Unpin> ControlReader<R> {
    pub fn new(reader: R) -> Self {
        Self { inner: BufReader::new(reader) }
    }

    /// Reads and parses the next well-formed signal, silently skipping
    /// malformed lines. Returns `Ok(None)` at EOF.
    pub async fn next_signal(&mut self) -> std::io::Result<Option<Signal>> {
        loop {
            let mut line = String::new();
            let n = self.inner.read_line(&mut line).await?;
            if n == 0 {
                return Ok(None);
            }
            match parse_line(&line) {
                Ok(signal) => return Ok(Some(signal)),
                Err(e) => {
                    warn!(error = %e, "dropping malformed control line");
                    continue;
                }
            }
        }
    }
}

/// A bounded FIFO of pending signals with drop-oldest overflow (§4.5
/// "Signal queueing"). One task pushes (the line reader), another pops in
/// a loop and spawns a per-flow handler.
pub struct SignalQueue {
    inner: Mutex<VecDeque<Signal>>,
    capacity: usize,
    notify: Notify,
}

impl SignalQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        })
    }

    /// Pushes a signal, dropping the oldest queued entry if at capacity.
    pub async fn push(&self, signal: Signal) {
        let mut queue = self.inner.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            warn!(capacity = self.capacity, "signal queue saturated, dropping oldest signal");
        }
        queue.push_back(signal);
        drop(queue);
        self.notify.notify_one();
    }

    /// Pops the next signal, waiting if the queue is currently empty.
    pub async fn pop(&self) -> Signal {
        loop {
            {
                let mut queue = self.inner.lock().await;
                if let Some(signal) = queue.pop_front() {
                    return signal;
                }
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handshake_line() {
        let signal = parse_line("tunnel://18000#1\n").unwrap();
        assert_eq!(
            signal,
            Signal::Handshake { remote_port: 18000, tls_mode: TlsMode::SelfSigned }
        );
    }

    #[test]
    fn parses_launch_lines() {
        assert_eq!(
            parse_line("//ab12cd34#1\n").unwrap(),
            Signal::Launch { id: FlowId::from("ab12cd34".to_string()), protocol: Protocol::Tcp }
        );
        assert_eq!(
            parse_line("//ab12cd34#2\n").unwrap(),
            Signal::Launch { id: FlowId::from("ab12cd34".to_string()), protocol: Protocol::Udp }
        );
    }

    #[test]
    fn parses_flush_and_keepalive() {
        assert_eq!(parse_line("//#0\n").unwrap(), Signal::Flush);
        assert_eq!(parse_line("\n").unwrap(), Signal::Keepalive);
        assert_eq!(parse_line("").unwrap(), Signal::Keepalive);
    }

    #[test]
    fn rejects_unknown_fragment() {
        assert!(matches!(parse_line("//abcd#9\n"), Err(ProtocolError::UnknownFragment(_))));
    }

    #[test]
    fn rejects_lines_without_scheme_markers() {
        assert!(matches!(parse_line("not-a-signal\n"), Err(ProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let queue = SignalQueue::new(2);
        queue.push(Signal::Keepalive).await;
        queue.push(Signal::Flush).await;
        queue.push(Signal::Launch { id: FlowId::from("x".to_string()), protocol: Protocol::Tcp }).await;

        let first = queue.pop().await;
        assert_eq!(first, Signal::Flush);
    }
}
