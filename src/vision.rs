use crate::protocol::{self, CMD_ONLINE, CMD_TRIGGER, REPLY_SIZE};
use crate::routine::VisionConfig;
use crate::types::Pose;
use crate::{CellError, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Client for the vision sensor's pose socket.
///
/// Each request opens a fresh connection, sends the online and trigger
/// commands, and reads one fixed-width reply. No state carries over between
/// requests.
#[derive(Debug, Clone)]
pub struct PoseClient {
    host: String,
    port: u16,
    read_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl PoseClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            read_timeout: None,
            connect_timeout: None,
        }
    }

    pub fn from_config(config: &VisionConfig) -> Self {
        Self::new(config.host.clone(), config.port)
            .with_read_timeout(config.read_timeout_ms.map(Duration::from_millis))
            .with_connect_timeout(config.connect_timeout_ms.map(Duration::from_millis))
    }

    /// `None` blocks until the sensor answers.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&self) -> Result<TcpStream> {
        let Some(timeout) = self.connect_timeout else {
            return Ok(TcpStream::connect((self.host.as_str(), self.port))?);
        };

        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(CellError::Io)
            .unwrap_or_else(|| CellError::Config(format!("{} did not resolve", self.endpoint()))))
    }

    /// Request one pose.
    ///
    /// A reply shorter than the fixed width is a protocol error; the caller
    /// must not act on it.
    pub fn request_pose(&self) -> Result<Pose> {
        log::debug!("Requesting pose from {}", self.endpoint());
        let mut stream = self.connect()?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.read_timeout)?;

        stream.write_all(CMD_ONLINE)?;
        stream.write_all(CMD_TRIGGER)?;
        stream.flush()?;

        let reply = read_reply(&mut stream)?;
        log::trace!("Vision reply ({} bytes): {:02x?}", reply.len(), reply);

        let pose = protocol::parse_pose_reply(&reply)?;
        log::info!("Vision pose: x={} y={} r={}", pose.x, pose.y, pose.r);
        Ok(pose)
    }
}

/// Read up to one full reply, stopping early if the sensor closes the socket.
fn read_reply(stream: &mut impl Read) -> Result<Vec<u8>> {
    let mut buf = [0u8; REPLY_SIZE];
    let mut filled = 0;
    while filled < REPLY_SIZE {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buf[..filled].to_vec())
}
