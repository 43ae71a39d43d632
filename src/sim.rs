//! In-process stand-ins for the cell hardware.
//!
//! - [`SimActuator`]: records every command, serves a scripted trigger input,
//!   and can fail a chosen command or raise a notification mid-run.
//! - [`MemoryStore`]: PLC data blocks held in memory.
//! - [`VisionStub`]: loopback TCP server speaking the vision protocol with
//!   scripted replies.
//!
//! All three can share a [`Journal`] so tests see one ordered history.

use crate::actuator::{Code, MotionActuator, CODE_OK};
use crate::protocol::{CMD_ONLINE, CMD_TRIGGER, REPLY_SIZE};
use crate::store::BlockStore;
use crate::types::{ActuatorEvent, CpuState, MotionParams, OutputBank};
use crate::{CellError, Result};
use crossbeam_channel::Sender;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One observable action in a simulated run.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Setup(&'static str),
    Joints([f64; 6]),
    Cartesian([f64; 6]),
    Output { bank: OutputBank, pin: u8, on: bool },
    /// The vision stub received a complete request.
    VisionRequest(usize),
}

impl Record {
    pub fn is_motion(&self) -> bool {
        matches!(self, Record::Joints(_) | Record::Cartesian(_))
    }
}

/// Shared, ordered history of simulated actions.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<Record>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Record>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, record: Record) {
        self.lock().push(record);
    }

    pub fn entries(&self) -> Vec<Record> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Simulated manipulator.
pub struct SimActuator {
    journal: Journal,
    subscribers: Vec<Sender<ActuatorEvent>>,
    trigger_pin: Option<u8>,
    trigger_script: VecDeque<bool>,
    /// Fail the n-th motion/output command (0-based) with the given code.
    fail_at: Option<(usize, Code)>,
    /// Raise a notification right after the n-th motion/output command.
    event_at: Option<(usize, ActuatorEvent)>,
    commands: usize,
    error_code: i32,
    state: i32,
    connected: bool,
    enabled: bool,
}

impl SimActuator {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            subscribers: Vec::new(),
            trigger_pin: None,
            trigger_script: VecDeque::new(),
            fail_at: None,
            event_at: None,
            commands: 0,
            error_code: 0,
            state: 0,
            connected: true,
            enabled: false,
        }
    }

    /// Serve `script` on input `pin`, one value per read; reads `false` once exhausted.
    pub fn with_trigger(mut self, pin: u8, script: impl IntoIterator<Item = bool>) -> Self {
        self.trigger_pin = Some(pin);
        self.trigger_script = script.into_iter().collect();
        self
    }

    pub fn fail_command(mut self, index: usize, code: Code) -> Self {
        self.fail_at = Some((index, code));
        self
    }

    pub fn raise_after(mut self, index: usize, event: ActuatorEvent) -> Self {
        self.event_at = Some((index, event));
        self
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn motion_enabled(&self) -> bool {
        self.enabled
    }

    /// Deliver a notification and update the simulated controller state.
    pub fn notify(&mut self, event: ActuatorEvent) {
        match event {
            ActuatorEvent::ErrorWarnChanged { error_code, .. } => self.error_code = error_code,
            ActuatorEvent::StateChanged { state } => self.state = state,
            ActuatorEvent::ConnectionChanged { connected, .. } => self.connected = connected,
            ActuatorEvent::CountChanged { .. } => {}
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn command(&mut self, record: Record) -> Code {
        let index = self.commands;
        self.commands += 1;

        if let Some((at, code)) = self.fail_at {
            if at == index {
                log::debug!("sim: failing command #{} with code {}", index, code);
                return code;
            }
        }
        self.journal.push(record);

        if matches!(&self.event_at, Some((at, _)) if *at == index) {
            if let Some((_, event)) = self.event_at.take() {
                self.notify(event);
            }
        }
        CODE_OK
    }
}

impl MotionActuator for SimActuator {
    fn connect(&mut self) -> Code {
        self.connected = true;
        self.journal.push(Record::Setup("connect"));
        CODE_OK
    }

    fn disconnect(&mut self) -> Code {
        self.connected = false;
        self.journal.push(Record::Setup("disconnect"));
        CODE_OK
    }

    fn motion_enable(&mut self, enable: bool) -> Code {
        self.enabled = enable;
        self.journal.push(Record::Setup("motion_enable"));
        CODE_OK
    }

    fn set_mode(&mut self, _mode: i32) -> Code {
        self.journal.push(Record::Setup("set_mode"));
        CODE_OK
    }

    fn set_state(&mut self, state: i32) -> Code {
        self.state = state;
        self.journal.push(Record::Setup("set_state"));
        CODE_OK
    }

    fn clean_error(&mut self) -> Code {
        self.error_code = 0;
        self.journal.push(Record::Setup("clean_error"));
        CODE_OK
    }

    fn clean_warn(&mut self) -> Code {
        self.journal.push(Record::Setup("clean_warn"));
        CODE_OK
    }

    fn set_pause_time(&mut self, _pause: Duration) -> Code {
        self.journal.push(Record::Setup("set_pause_time"));
        CODE_OK
    }

    fn subscribe(&mut self) -> crossbeam_channel::Receiver<ActuatorEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn set_digital_output(&mut self, bank: OutputBank, pin: u8, on: bool) -> Code {
        self.command(Record::Output { bank, pin, on })
    }

    fn digital_input(&mut self, pin: u8) -> std::result::Result<bool, Code> {
        if Some(pin) == self.trigger_pin {
            Ok(self.trigger_script.pop_front().unwrap_or(false))
        } else {
            Ok(false)
        }
    }

    fn move_joints(&mut self, angles: &[f64; 6], _params: &MotionParams) -> Code {
        self.command(Record::Joints(*angles))
    }

    fn move_cartesian(&mut self, pose: &[f64; 6], _params: &MotionParams) -> Code {
        self.command(Record::Cartesian(*pose))
    }

    fn error_code(&self) -> i32 {
        self.error_code
    }

    fn state(&self) -> i32 {
        self.state
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    blocks: HashMap<u16, Vec<u8>>,
    connected: bool,
    fail_writes: bool,
}

/// PLC data blocks held in memory. Clones share the same blocks.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zero-filled data block.
    pub fn with_block(self, block: u16, size: usize) -> Self {
        self.lock().blocks.insert(block, vec![0; size]);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn block(&self, block: u16) -> Option<Vec<u8>> {
        self.lock().blocks.get(&block).cloned()
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn poke(&self, block: u16, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let bytes = block_range(&mut inner.blocks, block, offset, data.len())?;
        bytes.copy_from_slice(data);
        Ok(())
    }
}

fn block_range(
    blocks: &mut HashMap<u16, Vec<u8>>,
    block: u16,
    offset: usize,
    len: usize,
) -> Result<&mut [u8]> {
    let data = blocks
        .get_mut(&block)
        .ok_or_else(|| CellError::Store(format!("DB{} does not exist", block)))?;
    let size = data.len();
    data.get_mut(offset..offset + len).ok_or_else(|| {
        CellError::Store(format!(
            "DB{}: range {}..{} outside block of {} bytes",
            block,
            offset,
            offset + len,
            size
        ))
    })
}

impl BlockStore for MemoryStore {
    fn connect(&mut self, _host: &str, _rack: u16, _slot: u16) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    fn cpu_state(&mut self) -> Result<CpuState> {
        Ok(if self.lock().connected {
            CpuState::Run
        } else {
            CpuState::Unknown
        })
    }

    fn read(&mut self, block: u16, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        Ok(block_range(&mut inner.blocks, block, offset, len)?.to_vec())
    }

    fn write(&mut self, block: u16, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(CellError::Store(format!("DB{}: write rejected", block)));
        }
        block_range(&mut inner.blocks, block, offset, data.len())?.copy_from_slice(data);
        Ok(())
    }
}

/// Pad a reply body with NULs to the fixed reply width.
pub fn padded_reply(body: &str) -> Vec<u8> {
    let mut buf = body.as_bytes().to_vec();
    if buf.len() < REPLY_SIZE {
        buf.resize(REPLY_SIZE, 0);
    }
    buf
}

/// Loopback vision server answering each connection with the next scripted reply.
pub struct VisionStub {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl VisionStub {
    /// Start serving `replies` in order. After the last reply the listener closes.
    pub fn start(replies: Vec<Vec<u8>>, journal: Option<Journal>) -> Result<VisionStub> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let requests = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let ctx = StubContext {
            listener,
            replies: replies.into(),
            journal,
            requests: requests.clone(),
            received: received.clone(),
            stop_flag: stop_flag.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("vision-stub".into())
            .spawn(move || stub_loop(ctx))
            .map_err(|e| CellError::Spawn(format!("vision stub: {}", e)))?;

        Ok(VisionStub {
            addr,
            requests,
            received,
            stop_flag,
            thread: Some(thread),
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of requests answered so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Raw request bytes, one entry per connection.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for VisionStub {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct StubContext {
    listener: TcpListener,
    replies: VecDeque<Vec<u8>>,
    journal: Option<Journal>,
    requests: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    stop_flag: Arc<AtomicBool>,
}

fn stub_loop(mut ctx: StubContext) {
    let request_len = CMD_ONLINE.len() + CMD_TRIGGER.len();

    while let Some(reply) = ctx.replies.pop_front() {
        let mut stream = loop {
            if ctx.stop_flag.load(Ordering::Relaxed) {
                return;
            }
            match ctx.listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => {
                    log::warn!("vision stub accept failed: {}", e);
                    return;
                }
            }
        };

        if stream.set_nonblocking(false).is_err() {
            return;
        }
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

        let mut request = vec![0u8; request_len];
        if let Err(e) = stream.read_exact(&mut request) {
            log::warn!("vision stub: incomplete request: {}", e);
            continue;
        }

        let index = ctx.requests.fetch_add(1, Ordering::SeqCst);
        ctx.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        if let Some(journal) = &ctx.journal {
            journal.push(Record::VisionRequest(index));
        }

        if let Err(e) = stream.write_all(&reply) {
            log::warn!("vision stub: reply failed: {}", e);
        }
        // Dropping the stream closes the connection, which ends short replies.
    }
}
