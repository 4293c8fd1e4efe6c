/// `transport.rs` — pluggable rig control
///
/// The engine only ever needs connect/disconnect, PTT, and frequency; every
/// physical path (serial CAT, network CAT, vendor WLAN) implements this one
/// trait. Calls may block briefly (socket/serial round-trip); the controller
/// confines them to blocking tasks.
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{EngineError, Result};

pub trait RadioTransport: Send {
    fn kind(&self) -> &'static str;
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn set_ptt(&mut self, on: bool) -> Result<()>;
    fn set_frequency(&mut self, hz: u64) -> Result<()>;
    fn read_frequency(&mut self) -> Result<Option<u64>>;
    fn is_connected(&self) -> bool;
}

// ── None ─────────────────────────────────────────────────────────────────────

/// Transport type "none": every operation succeeds without touching
/// hardware. Lets the engine run audio-only.
#[derive(Debug, Default)]
pub struct NullTransport {
    connected: bool,
    frequency: Option<u64>,
}

impl RadioTransport for NullTransport {
    fn kind(&self) -> &'static str {
        "none"
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn set_ptt(&mut self, _on: bool) -> Result<()> {
        Ok(())
    }

    fn set_frequency(&mut self, hz: u64) -> Result<()> {
        self.frequency = Some(hz);
        Ok(())
    }

    fn read_frequency(&mut self) -> Result<Option<u64>> {
        Ok(self.frequency)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ── Network CAT (rigctld wire protocol) ──────────────────────────────────────

/// Network CAT client speaking the hamlib `rigctld` line protocol:
/// `T 1` / `T 0` for PTT, `F <hz>` to tune, `f` to read, `RPRT 0` on
/// success.
pub struct TcpCatTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpCatTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    fn send_line(&mut self, cmd: &str) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::RadioTransport("not connected".into()))?;
        stream
            .write_all(format!("{cmd}\n").as_bytes())
            .map_err(|e| EngineError::RadioTransport(e.to_string()))
    }

    fn read_reply_line(&mut self) -> Result<String> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::RadioTransport("not connected".into()))?;
        let mut reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| EngineError::RadioTransport(e.to_string()))?,
        );
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| EngineError::RadioTransport(e.to_string()))?;
        if n == 0 {
            return Err(EngineError::RadioTransport("connection closed".into()));
        }
        Ok(line.trim().to_string())
    }

    /// Set commands answer a single `RPRT <code>` line.
    fn set_command(&mut self, cmd: &str) -> Result<()> {
        self.send_line(cmd)?;
        let reply = self.read_reply_line()?;
        match reply.strip_prefix("RPRT ") {
            Some("0") => Ok(()),
            Some(code) => Err(EngineError::RadioTransport(format!(
                "rig returned RPRT {code} for '{cmd}'"
            ))),
            None => Err(EngineError::RadioTransport(format!(
                "unexpected reply '{reply}' for '{cmd}'"
            ))),
        }
    }

    /// Get commands answer a single value line.
    fn get_command(&mut self, cmd: &str) -> Result<String> {
        self.send_line(cmd)?;
        self.read_reply_line()
    }
}

impl RadioTransport for TcpCatTransport {
    fn kind(&self) -> &'static str {
        "network"
    }

    fn connect(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr)
            .map_err(|e| EngineError::RadioTransport(format!("connect {addr}: {e}")))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .and_then(|_| stream.set_write_timeout(Some(Duration::from_secs(2))))
            .map_err(|e| EngineError::RadioTransport(e.to_string()))?;
        self.stream = Some(stream);
        log::info!("network CAT connected to {addr}");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }

    fn set_ptt(&mut self, on: bool) -> Result<()> {
        self.set_command(if on { "T 1" } else { "T 0" })
    }

    fn set_frequency(&mut self, hz: u64) -> Result<()> {
        self.set_command(&format!("F {hz}"))
    }

    fn read_frequency(&mut self) -> Result<Option<u64>> {
        let line = self.get_command("f")?;
        Ok(line.parse().ok())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

// ── Test transport ───────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_transport_is_always_safe() {
        let mut t = NullTransport::default();
        assert!(!t.is_connected());
        t.set_ptt(true).unwrap(); // no-op while disconnected
        t.connect().unwrap();
        assert!(t.is_connected());
        t.set_frequency(14_074_000).unwrap();
        assert_eq!(t.read_frequency().unwrap(), Some(14_074_000));
        t.disconnect().unwrap();
        assert!(!t.is_connected());
    }

    #[test]
    fn tcp_cat_rejects_commands_while_disconnected() {
        let mut t = TcpCatTransport::new("127.0.0.1", 4532);
        assert!(!t.is_connected());
        assert!(t.set_ptt(true).is_err());
    }
}
