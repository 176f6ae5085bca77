//! In-process scripted DCP producers for the integration scenarios. A
//! `FakeNode` accepts connections serially, answers the handshake on its
//! own, and hands each connection to the test's script.

use crate::error::DcpError;
use crate::events::{
    AckHandle, ControlEvent, ControlEventHandler, DataEventHandler, Handlers, SystemEvent,
    SystemEventHandler,
};
use crate::retry::{Delay, RetryPolicy};
use crate::settings::ClientSettings;
use brine::frame::{Frame, Header, Magic, Opcode, Status, HEADER_SIZE};
use brine::message::DataMessage;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Client settings tuned for fast tests: short timeouts, few retries.
pub(crate) fn test_settings() -> ClientSettings {
    let transient_only = |policy: RetryPolicy| policy.with_interrupt(|error: &DcpError| !error.is_transient());

    ClientSettings::new("bucket", "reader", "secret")
        .with_connect_timeout(Duration::from_secs(5))
        .with_query_timeout(Duration::from_secs(5))
        .with_close_timeout(Duration::from_secs(2))
        .with_connect_policy(transient_only(RetryPolicy::new(
            2,
            Delay::Fixed(Duration::from_millis(10)),
        )))
        .with_config_policy(transient_only(RetryPolicy::new(
            3,
            Delay::Fixed(Duration::from_millis(10)),
        )))
        .with_repair_policy(transient_only(RetryPolicy::new(
            4,
            Delay::Fixed(Duration::from_millis(50)),
        )))
}

/// Spin until `predicate` holds, panicking after `timeout`.
pub(crate) fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Records everything delivered to the embedder handlers, acking data
/// immediately so flow control keeps moving.
pub(crate) struct Recorder {
    pub mutations: Mutex<Vec<(u16, u64)>>,
    pub control: Mutex<Vec<ControlEvent>>,
    pub system: Mutex<Vec<SystemEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Recorder> {
        Arc::new(Recorder {
            mutations: Mutex::new(Vec::new()),
            control: Mutex::new(Vec::new()),
            system: Mutex::new(Vec::new()),
        })
    }

    pub fn handlers(recorder: &Arc<Recorder>) -> Handlers {
        Handlers {
            data: recorder.clone(),
            control: recorder.clone(),
            system: recorder.clone(),
        }
    }

    pub fn seqnos(&self, partition: u16) -> Vec<u64> {
        self.mutations
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|&(_, seqno)| seqno)
            .collect()
    }
}

impl DataEventHandler for Recorder {
    fn on_event(&self, ack: &AckHandle, message: DataMessage) {
        self.mutations
            .lock()
            .unwrap()
            .push((message.partition(), message.by_seqno()));

        let bytes = HEADER_SIZE + message.key().len() + 31;
        ack.ack(bytes as u32);
    }
}

impl ControlEventHandler for Recorder {
    fn on_event(&self, event: ControlEvent) {
        self.control.lock().unwrap().push(event);
    }
}

impl SystemEventHandler for Recorder {
    fn on_event(&self, event: SystemEvent) {
        self.system.lock().unwrap().push(event);
    }
}

/// A scripted producer node. Connections are served one at a time, in
/// order; the script receives the connection index so reconnects can be
/// told apart from the first contact.
pub(crate) struct FakeNode {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeNode {
    pub fn start<F>(mut script: F) -> FakeNode
    where
        F: FnMut(usize, &mut ScriptConn) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake node");
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_inner = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("fake-node-{}", addr))
            .spawn(move || {
                let mut index = 0;
                while !stop_inner.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
                            stream.set_nodelay(true).unwrap();
                            let mut conn = ScriptConn::new(stream);
                            script(index, &mut conn);
                            index += 1;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })
            .expect("spawn fake node");

        FakeNode {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `"127.0.0.1:<port>"` as it appears in a config server list.
    pub fn server_entry(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One accepted connection, with helpers for both directions of the
/// protocol.
pub(crate) struct ScriptConn {
    stream: TcpStream,
    pub acked_bytes: u64,
    pub noop_replies: usize,
}

impl ScriptConn {
    fn new(stream: TcpStream) -> ScriptConn {
        ScriptConn {
            stream,
            acked_bytes: 0,
            noop_replies: 0,
        }
    }

    pub fn read_frame(&mut self) -> io::Result<Frame> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header_bytes)?;

        let header = Header::read(&header_bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad header"))?;
        let mut body = vec![0u8; header.body_len as usize];
        self.stream.read_exact(&mut body)?;

        Ok(Frame { header, body })
    }

    pub fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.stream.write_all(&frame.to_bytes())
    }

    /// Read requests until something beyond the handshake arrives, auto
    /// answering SASL, bucket selection, HELO, DCP open and controls.
    /// Buffer acknowledgements are tallied and skipped.
    pub fn next_request(&mut self) -> io::Result<Frame> {
        loop {
            let frame = self.read_frame()?;
            let opcode = frame.header.known_opcode();

            match opcode {
                Some(Opcode::SaslAuth)
                | Some(Opcode::SelectBucket)
                | Some(Opcode::OpenConnection)
                | Some(Opcode::Control) => {
                    self.reply(&frame, Status::Success, &[])?;
                }
                Some(Opcode::Helo) => {
                    // Grant everything the client asked for.
                    let granted = frame.value().to_vec();
                    self.reply(&frame, Status::Success, &granted)?;
                }
                Some(Opcode::BufferAck) => {
                    let mut bytes = [0u8; 4];
                    bytes.copy_from_slice(&frame.extras()[..4]);
                    self.acked_bytes += u64::from(u32::from_be_bytes(bytes));
                }
                Some(Opcode::Noop) => self.noop_replies += 1,
                _ => return Ok(frame),
            }
        }
    }

    /// Block until at least `min_bytes` of buffer acknowledgement credit
    /// has come back.
    pub fn wait_for_ack(&mut self, min_bytes: u64) -> io::Result<u64> {
        while self.acked_bytes < min_bytes {
            let frame = self.read_frame()?;
            if frame.header.known_opcode() == Some(Opcode::BufferAck) {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&frame.extras()[..4]);
                self.acked_bytes += u64::from(u32::from_be_bytes(bytes));
            }
        }
        Ok(self.acked_bytes)
    }

    /// Keep the connection alive, answering close-stream requests with a
    /// closed stream-end, until the client goes away.
    pub fn serve_until_closed(&mut self) {
        loop {
            match self.next_request() {
                Ok(frame) => {
                    if frame.header.known_opcode() == Some(Opcode::CloseStream) {
                        let partition = frame.header.vbucket();
                        let _ = self.reply(&frame, Status::Success, &[]);
                        let _ = self.send_stream_end(partition, 1);
                    }
                }
                Err(_) => return,
            }
        }
    }

    pub fn reply(&mut self, request: &Frame, status: Status, value: &[u8]) -> io::Result<()> {
        self.write_frame(&response(request, status, &[], value))
    }

    /// Answer a stream request with its failover log.
    pub fn reply_stream_success(&mut self, request: &Frame, log: &[(u64, u64)]) -> io::Result<()> {
        let mut value = Vec::with_capacity(log.len() * 16);
        for &(uuid, seqno) in log {
            value.extend_from_slice(&uuid.to_be_bytes());
            value.extend_from_slice(&seqno.to_be_bytes());
        }
        self.reply(request, Status::Success, &value)
    }

    pub fn reply_rollback(&mut self, request: &Frame, seqno: u64) -> io::Result<()> {
        self.reply(request, Status::Rollback, &seqno.to_be_bytes())
    }

    pub fn reply_seqnos(&mut self, request: &Frame, seqnos: &[(u16, u64)]) -> io::Result<()> {
        let mut value = Vec::with_capacity(seqnos.len() * 10);
        for &(partition, seqno) in seqnos {
            value.extend_from_slice(&partition.to_be_bytes());
            value.extend_from_slice(&seqno.to_be_bytes());
        }
        self.reply(request, Status::Success, &value)
    }

    pub fn reply_failover_log(&mut self, request: &Frame, log: &[(u64, u64)]) -> io::Result<()> {
        self.reply_stream_success(request, log)
    }

    pub fn send_snapshot_marker(&mut self, partition: u16, start: u64, end: u64) -> io::Result<()> {
        let mut extras = Vec::with_capacity(20);
        extras.extend_from_slice(&start.to_be_bytes());
        extras.extend_from_slice(&end.to_be_bytes());
        extras.extend_from_slice(&1u32.to_be_bytes());
        self.write_frame(&server_request(Opcode::SnapshotMarker, partition, extras, &[], &[]))
    }

    pub fn send_mutation(&mut self, partition: u16, by_seqno: u64, key: &[u8], value: &[u8]) -> io::Result<()> {
        let mut extras = Vec::with_capacity(31);
        extras.extend_from_slice(&by_seqno.to_be_bytes());
        extras.extend_from_slice(&1u64.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u16.to_be_bytes());
        extras.push(0);
        self.write_frame(&server_request(Opcode::Mutation, partition, extras, key, value))
    }

    pub fn send_stream_end(&mut self, partition: u16, reason: u32) -> io::Result<()> {
        let extras = reason.to_be_bytes().to_vec();
        self.write_frame(&server_request(Opcode::StreamEnd, partition, extras, &[], &[]))
    }

    pub fn send_noop(&mut self, opaque: u32) -> io::Result<()> {
        let mut frame = server_request(Opcode::Noop, 0, Vec::new(), &[], &[]);
        frame.header.opaque = opaque;
        self.write_frame(&frame)
    }
}

fn response(request: &Frame, status: Status, extras: &[u8], value: &[u8]) -> Frame {
    let mut body = Vec::with_capacity(extras.len() + value.len());
    body.extend_from_slice(extras);
    body.extend_from_slice(value);

    Frame {
        header: Header {
            magic: Magic::Response,
            opcode: request.header.opcode,
            key_len: 0,
            extras_len: extras.len() as u8,
            data_type: 0,
            vbucket_or_status: status.code(),
            body_len: body.len() as u32,
            opaque: request.header.opaque,
            cas: 0,
        },
        body,
    }
}

fn server_request(opcode: Opcode, vbucket: u16, extras: Vec<u8>, key: &[u8], value: &[u8]) -> Frame {
    let mut body = extras.clone();
    body.extend_from_slice(key);
    body.extend_from_slice(value);

    Frame {
        header: Header {
            magic: Magic::Request,
            opcode: opcode.into(),
            key_len: key.len() as u16,
            extras_len: extras.len() as u8,
            data_type: 0,
            vbucket_or_status: vbucket,
            body_len: body.len() as u32,
            opaque: 0,
            cas: 1,
        },
        body,
    }
}

/// Extract `(start, end, snap_start, snap_end)` from a stream request's
/// extras, for script-side assertions.
pub(crate) fn stream_request_window(frame: &Frame) -> (u64, u64, u64, u64) {
    let extras = frame.extras();
    let read_u64 = |offset: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&extras[offset..offset + 8]);
        u64::from_be_bytes(bytes)
    };

    (read_u64(8), read_u64(16), read_u64(32), read_u64(40))
}
