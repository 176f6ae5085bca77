use crate::error::{DcpError, DcpResult};
use crate::events::{AckHandle, ControlEvent, DcpEvent, EventSink, Handlers};
use crate::logging::{self, Logger};
use crate::retry::{retry_blocking, Verdict};
use crate::session::{SessionState, StreamProgress, StreamState};
use crate::settings::ClientSettings;
use brine::buffer::Buffer;
use brine::error::WireError;
use brine::frame::{build, Frame, Header, Magic, Opcode, Status, HEADER_SIZE};
use brine::message::{self, DataMessage, StreamRequest};
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

const STREAM_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

// Upper bound on how long the loop sleeps between housekeeping passes.
const TICK: Duration = Duration::from_millis(250);

const READ_BUF_INITIAL: usize = 65536;
const WRITE_BUF_INITIAL: usize = 16384;
const WRITE_BUF_MAX: usize = 4 * 1024 * 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Channel-internal control block, guarded by the channel's own monitor.
struct Ctl {
    state: ChannelState,
    /// Pre-encoded outbound frames, drained in order by the loop thread.
    outbound: VecDeque<Vec<u8>>,
    wake: Option<SetReadiness>,
    /// Partitions requested or open on this connection.
    streams: IndexSet<u16>,
    /// HELO intersection: what we asked for and the server granted.
    features: Vec<u16>,
    hard_stop: bool,
}

struct Shared {
    address: SocketAddr,
    ctl: Mutex<Ctl>,
    cond: Condvar,
    /// Flow-control credit returned by the embedder, not yet acknowledged.
    acked: Arc<AtomicU64>,
}

/// One TCP session to one node's data port. Owns the stream bookkeeping for
/// partitions mastered there; a dedicated loop thread reads frames, drains
/// the outbound queue and does the housekeeping (flow-control acks,
/// dead-peer detection, deferred stream retries).
pub struct DcpChannel {
    shared: Arc<Shared>,
    settings: ClientSettings,
    session: Arc<SessionState>,
    sink: EventSink,
    handlers: Handlers,
    thread: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl DcpChannel {
    pub fn new(
        address: SocketAddr,
        settings: ClientSettings,
        session: Arc<SessionState>,
        sink: EventSink,
        handlers: Handlers,
        log: &Logger,
    ) -> DcpChannel {
        DcpChannel {
            shared: Arc::new(Shared {
                address,
                ctl: Mutex::new(Ctl {
                    state: ChannelState::Disconnected,
                    outbound: VecDeque::new(),
                    wake: None,
                    streams: IndexSet::new(),
                    features: Vec::new(),
                    hard_stop: false,
                }),
                cond: Condvar::new(),
                acked: Arc::new(AtomicU64::new(0)),
            }),
            settings,
            session,
            sink,
            handlers,
            thread: Mutex::new(None),
            log: log.new(logging::o!("channel" => address.to_string())),
        }
    }

    #[inline]
    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.ctl().state
    }

    /// Features granted by the server during the handshake.
    pub fn negotiated_features(&self) -> Vec<u16> {
        self.ctl().features.clone()
    }

    /// Partitions currently bound to this connection.
    pub fn open_partitions(&self) -> Vec<u16> {
        self.ctl().streams.iter().cloned().collect()
    }

    /// Establish the connection: TCP, SASL, bucket selection, HELO, DCP open
    /// and control settings, each attempt under the connect policy. On
    /// success the socket is handed to the loop thread.
    pub fn connect(&self) -> DcpResult<()> {
        {
            let mut ctl = self.ctl();
            match ctl.state {
                ChannelState::Disconnected => ctl.state = ChannelState::Connecting,
                ChannelState::Connecting | ChannelState::Connected => return Ok(()),
                ChannelState::Disconnecting => return Err(DcpError::ConnectionClosed),
            }
        }

        let connected = retry_blocking(&self.settings.connect_policy, || self.connect_once());

        let (stream, features) = match connected {
            Ok(pair) => pair,
            Err(err) => {
                let mut ctl = self.ctl();
                ctl.state = ChannelState::Disconnected;
                self.shared.cond.notify_all();
                logging::warn!(self.log, "channel connect failed"; "error" => ?err);
                return Err(err);
            }
        };

        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_stream(stream)?;

        let poll = Poll::new()?;
        poll.register(
            &stream,
            STREAM_TOKEN,
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )?;

        let (registration, wake) = Registration::new2();
        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())?;

        self.shared.acked.store(0, Ordering::Relaxed);

        {
            let mut ctl = self.ctl();
            if ctl.state != ChannelState::Connecting {
                // Closed underneath us while the handshake ran.
                ctl.state = ChannelState::Disconnected;
                self.shared.cond.notify_all();
                return Err(DcpError::ConnectionClosed);
            }
            ctl.wake = Some(wake.clone());
            ctl.features = features;
            ctl.hard_stop = false;
            ctl.state = ChannelState::Connected;
            self.shared.cond.notify_all();
        }

        let driver = Driver {
            stream,
            poll,
            _registration: registration,
            shared: self.shared.clone(),
            session: self.session.clone(),
            sink: self.sink.clone(),
            handlers: self.handlers.clone(),
            settings: self.settings.clone(),
            ack: AckHandle::new(self.shared.acked.clone(), wake),
            read_buffer: Buffer::new(READ_BUF_INITIAL, brine::frame::MAX_BODY_SIZE + HEADER_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_INITIAL, WRITE_BUF_MAX),
            retry_due: Vec::new(),
            retry_attempts: HashMap::new(),
            log: self.log.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("dcp-channel-{}", self.shared.address))
            .spawn(move || driver.run());

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                let mut ctl = self.ctl();
                ctl.state = ChannelState::Disconnected;
                ctl.wake = None;
                self.shared.cond.notify_all();
                return Err(err.into());
            }
        };

        *self.thread.lock().unwrap() = Some(handle);

        logging::debug!(self.log, "channel connected");
        Ok(())
    }

    /// Block until the channel leaves `Connecting`.
    pub fn wait_connected(&self, timeout: Duration) -> DcpResult<()> {
        let deadline = Instant::now() + timeout;
        let mut ctl = self.ctl();

        loop {
            match ctl.state {
                ChannelState::Connected => return Ok(()),
                ChannelState::Disconnected | ChannelState::Disconnecting => {
                    return Err(DcpError::ConnectionClosed)
                }
                ChannelState::Connecting => (),
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(DcpError::TimedOut),
            };

            let (guard, _) = self.shared.cond.wait_timeout(ctl, remaining).unwrap();
            ctl = guard;
        }
    }

    /// Dispatch a stream request for `request.partition` on this connection.
    /// The partition turns `Connecting`; the response moves it on.
    pub fn open_stream(&self, request: &StreamRequest) -> DcpResult<()> {
        let partition = request.partition;
        let state = self.session.get(partition)?;

        {
            let mut ctl = self.ctl();
            if ctl.state != ChannelState::Connected {
                return Err(DcpError::ConnectionClosed);
            }
            ctl.streams.insert(partition);
        }

        state.set_state(StreamState::Connecting);

        self.enqueue(build::stream_request(
            partition,
            u32::from(partition),
            request.vbucket_uuid,
            request.start_seqno,
            request.end_seqno,
            request.snapshot_start_seqno,
            request.snapshot_end_seqno,
        ))
    }

    /// Ask the server to close the stream; the stream-end frame that comes
    /// back finishes the partition.
    pub fn close_stream(&self, partition: u16) -> DcpResult<()> {
        let state = self.session.get(partition)?;
        state.set_state(StreamState::Disconnecting);
        self.enqueue(build::close_stream(partition, u32::from(partition)))
    }

    /// Drop the binding without waiting for the server: the partition is
    /// moving elsewhere and any late stream-end from this node must not
    /// clobber its state. A close is still sent as a courtesy.
    pub fn release_stream(&self, partition: u16) {
        let released = {
            let mut ctl = self.ctl();
            ctl.streams.remove(&partition)
        };

        if released {
            let _ = self.enqueue(build::close_stream(partition, u32::from(partition)));
        }
    }

    pub fn request_failover_log(&self, partition: u16) -> DcpResult<()> {
        self.enqueue(build::get_failover_log(partition, u32::from(partition)))
    }

    pub fn request_seqnos(&self) -> DcpResult<()> {
        self.enqueue(build::get_all_vb_seqnos(u32::max_value()))
    }

    /// Shut the channel down. Graceful closes every open stream first and
    /// waits (bounded by the close timeout) for the server's stream-ends;
    /// hard stop drops the socket as soon as the loop notices.
    pub fn close(&self, graceful: bool) {
        {
            let mut ctl = self.ctl();

            match ctl.state {
                ChannelState::Disconnected => (),
                state => {
                    let streaming = state == ChannelState::Connected;
                    ctl.state = ChannelState::Disconnecting;

                    if graceful && streaming {
                        let open: Vec<u16> = ctl.streams.iter().cloned().collect();
                        for partition in open {
                            ctl.outbound
                                .push_back(build::close_stream(partition, u32::from(partition)).to_bytes());
                        }
                    } else {
                        ctl.hard_stop = true;
                    }

                    if let Some(wake) = &ctl.wake {
                        let _ = wake.set_readiness(Ready::readable());
                    }
                    self.shared.cond.notify_all();
                }
            }
        }

        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Close requested from a handler running on the loop thread;
                // the loop unwinds on its own once the callback returns.
                *self.thread.lock().unwrap() = Some(handle);
                return;
            }
            let _ = handle.join();
        }

        let mut ctl = self.ctl();
        ctl.state = ChannelState::Disconnected;
        self.shared.cond.notify_all();
    }

    fn enqueue(&self, frame: Frame) -> DcpResult<()> {
        let mut ctl = self.ctl();

        match ctl.state {
            ChannelState::Connected | ChannelState::Disconnecting => {
                ctl.outbound.push_back(frame.to_bytes());
                if let Some(wake) = &ctl.wake {
                    let _ = wake.set_readiness(Ready::readable());
                }
                Ok(())
            }
            _ => Err(DcpError::ConnectionClosed),
        }
    }

    /// One full connect attempt: TCP, SASL PLAIN, SELECT_BUCKET, HELO, DCP
    /// open, control settings. Blocking with socket timeouts; the caller
    /// retries under policy.
    fn connect_once(&self) -> DcpResult<(std::net::TcpStream, Vec<u16>)> {
        let timeout = self.settings.connect_timeout;

        let mut stream = std::net::TcpStream::connect_timeout(&self.shared.address, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        if !self.settings.username.is_empty() {
            let response = sync_call(
                &mut stream,
                &build::sasl_auth_plain(&self.settings.username, &self.settings.password),
            )?;
            match response.header.status() {
                Status::Success | Status::AuthContinue => (),
                Status::AuthError => return Err(DcpError::AuthFailed),
                other => return Err(DcpError::UnexpectedStatus(other.code())),
            }
        }

        let response = sync_call(&mut stream, &build::select_bucket(&self.settings.bucket))?;
        match response.header.status() {
            Status::Success => (),
            Status::KeyNotFound => return Err(DcpError::BucketNotFound),
            Status::AuthError => return Err(DcpError::AuthFailed),
            other => return Err(DcpError::UnexpectedStatus(other.code())),
        }

        let stream_name = self.stream_name();

        let response = sync_call(
            &mut stream,
            &build::helo(&stream_name, &self.settings.desired_features),
        )?;
        let granted = message::parse_helo_features(response.value())?;
        let negotiated: Vec<u16> = self
            .settings
            .desired_features
            .iter()
            .cloned()
            .filter(|feature| granted.contains(feature))
            .collect();

        let response = sync_call(&mut stream, &build::open_connection(&stream_name))?;
        if response.header.status() != Status::Success {
            return Err(DcpError::UnexpectedStatus(response.header.status().code()));
        }

        self.send_control(
            &mut stream,
            "connection_buffer_size",
            &self.settings.connection_buffer_size.to_string(),
            true,
        )?;
        self.send_control(
            &mut stream,
            "enable_noop",
            if self.settings.enable_noop { "true" } else { "false" },
            true,
        )?;
        if self.settings.enable_noop {
            self.send_control(
                &mut stream,
                "set_noop_interval",
                &self.settings.noop_interval.as_secs().to_string(),
                true,
            )?;
        }
        if let Some(priority) = &self.settings.priority {
            self.send_control(&mut stream, "set_priority", priority, false)?;
        }
        self.send_control(&mut stream, "enable_ext_metadata", "true", false)?;
        self.send_control(&mut stream, "enable_stream_end_on_client_close_stream", "true", false)?;
        self.send_control(&mut stream, "send_stream_end_on_client_close_stream", "true", false)?;

        logging::debug!(self.log, "handshake complete";
                        "name" => stream_name.as_str(),
                        "features" => ?negotiated);

        Ok((stream, negotiated))
    }

    fn send_control(
        &self,
        stream: &mut std::net::TcpStream,
        key: &str,
        value: &str,
        required: bool,
    ) -> DcpResult<()> {
        let response = sync_call(stream, &build::control(key, value))?;
        let status = response.header.status();

        if status != Status::Success {
            if required {
                return Err(DcpError::UnexpectedStatus(status.code()));
            }
            logging::warn!(self.log, "control setting rejected";
                           "key" => key,
                           "status" => status.code());
        }

        Ok(())
    }

    fn stream_name(&self) -> String {
        let epoch = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        format!("{}:{}:{}", self.settings.connection_name, self.shared.address, epoch)
    }

    #[inline]
    fn ctl(&self) -> std::sync::MutexGuard<'_, Ctl> {
        self.shared.ctl.lock().expect("channel ctl poisoned")
    }
}

/// Write `frame` and read the one response frame, blocking under the
/// socket's timeouts. Only used during the handshake, before any stream
/// traffic can interleave.
fn sync_call(stream: &mut std::net::TcpStream, frame: &Frame) -> DcpResult<Frame> {
    stream.write_all(&frame.to_bytes())?;
    read_frame_blocking(stream)
}

fn read_frame_blocking(stream: &mut std::net::TcpStream) -> DcpResult<Frame> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes)?;

    let header = Header::read(&header_bytes)?;
    let mut body = vec![0u8; header.body_len as usize];
    stream.read_exact(&mut body)?;

    Ok(Frame { header, body })
}

/// The loop-thread half of a channel: owns the socket and both buffers.
struct Driver {
    stream: mio::net::TcpStream,
    poll: Poll,
    _registration: Registration,
    shared: Arc<Shared>,
    session: Arc<SessionState>,
    sink: EventSink,
    handlers: Handlers,
    settings: ClientSettings,
    ack: AckHandle,
    read_buffer: Buffer,
    write_buffer: Buffer,
    /// Deferred stream-request retries after TMPFAIL, `(due, partition)`.
    retry_due: Vec<(Instant, u16)>,
    retry_attempts: HashMap<u16, u32>,
    log: Logger,
}

impl Driver {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        let mut last_ingress = Instant::now();
        let mut drain_deadline: Option<Instant> = None;

        let exit_cause = 'drive: loop {
            if let Err(err) = self.poll.poll(&mut events, Some(TICK)) {
                break Some(DcpError::from(err));
            }

            // Ingress. Always attempted: edge-triggered readiness plus a
            // capped read buffer means a skipped pass could strand data in
            // the kernel with no further edge to announce it. A hangup is
            // only acted on after the frames that arrived with it have been
            // dispatched.
            let mut peer_gone = None;
            match self.read_buffer.fill_from(&self.stream) {
                Ok(received) => {
                    if received > 0 {
                        last_ingress = Instant::now();
                    }
                }
                Err(WireError::Closed) => peer_gone = Some(DcpError::ConnectionClosed),
                Err(err) => break Some(DcpError::from(err)),
            }

            // Frame dispatch.
            loop {
                match Frame::parse(self.read_buffer.data()) {
                    Ok((frame, consumed)) => {
                        self.read_buffer.consume(consumed);
                        if let Err(err) = self.dispatch(frame) {
                            break 'drive Some(err);
                        }
                    }
                    Err(WireError::Wait) => break,
                    Err(err) => break 'drive Some(DcpError::from(err)),
                }
            }

            if let Some(err) = peer_gone {
                break Some(err);
            }

            let now = Instant::now();

            self.flush_due_retries(now);
            self.maybe_buffer_ack();

            // Move queued frames into the write buffer, in order.
            let (hard_stop, disconnecting) = {
                let mut ctl = self.shared.ctl.lock().unwrap();

                while let Some(bytes) = ctl.outbound.pop_front() {
                    match self.write_buffer.put(&bytes) {
                        Ok(()) => (),
                        Err(_) => {
                            ctl.outbound.push_front(bytes);
                            break;
                        }
                    }
                }

                (ctl.hard_stop, ctl.state == ChannelState::Disconnecting)
            };

            // Egress.
            if !self.write_buffer.is_empty() {
                match self.write_buffer.drain_to(&self.stream) {
                    Ok(_) => (),
                    Err(WireError::Closed) => break Some(DcpError::ConnectionClosed),
                    Err(err) => break Some(DcpError::from(err)),
                }
            }

            if hard_stop {
                break None;
            }

            if disconnecting {
                let deadline = *drain_deadline.get_or_insert(now + self.settings.close_timeout);
                let drained = {
                    let ctl = self.shared.ctl.lock().unwrap();
                    ctl.streams.is_empty() && ctl.outbound.is_empty()
                };

                if (drained && self.write_buffer.is_empty()) || now >= deadline {
                    break None;
                }
            } else if self.peer_looks_dead(last_ingress) {
                break Some(DcpError::TimedOut);
            }
        };

        self.teardown(exit_cause);
    }

    /// No inbound traffic for the configured interval while we expect some
    /// (streams open, or noop negotiated) means the producer is gone.
    fn peer_looks_dead(&self, last_ingress: Instant) -> bool {
        let expecting_traffic = {
            let ctl = self.shared.ctl.lock().unwrap();
            !ctl.streams.is_empty()
        } || self.settings.enable_noop;

        expecting_traffic && last_ingress.elapsed() >= self.settings.dead_connection_interval
    }

    fn teardown(&mut self, cause: Option<DcpError>) {
        let partitions: Vec<u16> = {
            let mut ctl = self.shared.ctl.lock().unwrap();
            ctl.state = ChannelState::Disconnected;
            ctl.wake = None;
            ctl.outbound.clear();
            ctl.hard_stop = false;
            ctl.streams.drain(..).collect()
        };
        self.shared.cond.notify_all();

        for &partition in &partitions {
            if let Ok(state) = self.session.get(partition) {
                state.set_state(StreamState::Disconnected);
            }
        }

        if let Some(cause) = cause {
            logging::warn!(self.log, "channel dropped";
                           "cause" => ?cause,
                           "partitions" => partitions.len());
            self.sink.publish(DcpEvent::ChannelDropped {
                address: self.shared.address,
                partitions,
                cause,
            });
        } else {
            logging::debug!(self.log, "channel closed");
        }
    }

    fn dispatch(&mut self, frame: Frame) -> DcpResult<()> {
        let opcode = match frame.header.known_opcode() {
            Some(opcode) => opcode,
            None => return Err(DcpError::UnknownOpcode(frame.header.opcode)),
        };

        match frame.header.magic {
            Magic::Request => self.on_server_message(opcode, frame),
            Magic::Response => self.on_response(opcode, frame),
        }
    }

    /// Server-initiated traffic: the DCP stream itself plus noops.
    fn on_server_message(&mut self, opcode: Opcode, frame: Frame) -> DcpResult<()> {
        match opcode {
            Opcode::SnapshotMarker => {
                let marker = message::SnapshotMarker::parse(&frame)?;

                if !self.owns(marker.partition) {
                    // The stream moved elsewhere; this is the old node's
                    // tail end.
                    self.auto_ack(frame.wire_size());
                    return Ok(());
                }

                if let Ok(state) = self.session.get(marker.partition) {
                    state.advance_snapshot(marker.start_seqno, marker.end_seqno);
                }

                self.handlers.control.on_event(ControlEvent::SnapshotMarker {
                    partition: marker.partition,
                    start_seqno: marker.start_seqno,
                    end_seqno: marker.end_seqno,
                    flags: marker.flags,
                });
                self.auto_ack(frame.wire_size());
                Ok(())
            }
            Opcode::Mutation | Opcode::Deletion | Opcode::Expiration => {
                let data = match opcode {
                    Opcode::Mutation => DataMessage::Mutation(message::parse_mutation(&frame)?),
                    Opcode::Deletion => DataMessage::Deletion(message::parse_removal(&frame)?),
                    _ => DataMessage::Expiration(message::parse_removal(&frame)?),
                };

                let partition = data.partition();
                if !self.owns(partition) {
                    self.auto_ack(frame.wire_size());
                    return Ok(());
                }

                let completed = match self.session.get(partition) {
                    Ok(state) => state.advance_seqno(data.by_seqno()) == StreamProgress::Completed,
                    Err(_) => false,
                };

                // Data bytes are charged against flow control by the
                // embedder's ack, not here.
                self.handlers.data.on_event(&self.ack, data);

                if completed {
                    // The requested window is done; a late stream-end from
                    // the server is welcome but not required.
                    self.shared.ctl.lock().unwrap().streams.remove(&partition);
                    self.retry_attempts.remove(&partition);
                }
                Ok(())
            }
            Opcode::StreamEnd => {
                let reason = message::parse_stream_end(&frame)?;
                let partition = frame.header.vbucket();

                let owned = self.shared.ctl.lock().unwrap().streams.remove(&partition);
                if owned {
                    self.retry_attempts.remove(&partition);
                    if let Ok(state) = self.session.get(partition) {
                        state.set_ended(reason);
                    }
                    self.handlers.control.on_event(ControlEvent::StreamEnd { partition, reason });
                    self.sink.publish(DcpEvent::StreamEnd { partition, reason });
                }

                self.auto_ack(frame.wire_size());
                Ok(())
            }
            Opcode::Noop => {
                self.queue_frame(build::noop_reply(frame.header.opaque));
                Ok(())
            }
            Opcode::SetVbucketState | Opcode::Flush => {
                logging::trace!(self.log, "advisory server message"; "opcode" => ?opcode);
                self.auto_ack(frame.wire_size());
                Ok(())
            }
            other => {
                logging::warn!(self.log, "unexpected server request"; "opcode" => ?other);
                Ok(())
            }
        }
    }

    /// Replies to requests this client sent.
    fn on_response(&mut self, opcode: Opcode, frame: Frame) -> DcpResult<()> {
        match opcode {
            Opcode::StreamRequest => self.on_stream_response(frame),
            Opcode::GetFailoverLog => {
                let partition = frame.header.opaque as u16;

                if frame.header.status() == Status::Success {
                    let log = message::parse_failover_log(frame.value())?;
                    if let Ok(state) = self.session.get(partition) {
                        state.set_failover_log(log);
                    }
                } else {
                    logging::warn!(self.log, "failover log request failed";
                                   "partition" => partition,
                                   "status" => frame.header.status().code());
                }
                Ok(())
            }
            Opcode::GetAllVbSeqnos => {
                if frame.header.status() == Status::Success {
                    for (partition, seqno) in message::parse_seqno_map(frame.value())? {
                        if let Ok(state) = self.session.get(partition) {
                            state.set_current_seqno(seqno);
                        }
                    }
                } else {
                    logging::warn!(self.log, "seqno request failed";
                                   "status" => frame.header.status().code());
                }
                Ok(())
            }
            Opcode::CloseStream => {
                logging::trace!(self.log, "close-stream acknowledged";
                                "partition" => frame.header.opaque as u16,
                                "status" => frame.header.status().code());
                Ok(())
            }
            other => {
                logging::trace!(self.log, "ignored response"; "opcode" => ?other);
                Ok(())
            }
        }
    }

    fn on_stream_response(&mut self, frame: Frame) -> DcpResult<()> {
        let partition = frame.header.opaque as u16;
        let status = frame.header.status();

        let state = match self.session.get(partition) {
            Ok(state) => state,
            Err(_) => {
                logging::warn!(self.log, "stream response for unknown partition";
                               "partition" => partition);
                return Ok(());
            }
        };

        match status {
            Status::Success => {
                let log = message::parse_failover_log(frame.value())?;
                self.retry_attempts.remove(&partition);
                state.set_failover_log(log);
                state.set_state(StreamState::Connected);
                logging::debug!(self.log, "stream open"; "partition" => partition);
                Ok(())
            }
            Status::Rollback => {
                let seqno = message::parse_rollback_point(frame.value())?;
                self.shared.ctl.lock().unwrap().streams.remove(&partition);
                self.retry_attempts.remove(&partition);
                state.set_state(StreamState::Disconnected);
                logging::debug!(self.log, "stream rollback";
                                "partition" => partition,
                                "seqno" => seqno);
                self.sink.publish(DcpEvent::Rollback { partition, seqno });
                Ok(())
            }
            Status::NotMyVbucket => {
                self.shared.ctl.lock().unwrap().streams.remove(&partition);
                self.retry_attempts.remove(&partition);
                state.set_state(StreamState::Disconnected);
                logging::debug!(self.log, "not my vbucket"; "partition" => partition);
                self.sink.publish(DcpEvent::NotMyVbucket { partition });
                Ok(())
            }
            transient if transient.is_transient() => {
                let attempt = {
                    let counter = self.retry_attempts.entry(partition).or_insert(0);
                    *counter += 1;
                    *counter
                };

                match self.settings.stream_policy.verdict(attempt, &DcpError::TmpFail) {
                    Verdict::Sleep(delay) => {
                        self.retry_due.push((Instant::now() + delay, partition));
                        Ok(())
                    }
                    _ => {
                        self.shared.ctl.lock().unwrap().streams.remove(&partition);
                        self.retry_attempts.remove(&partition);
                        state.set_state(StreamState::Disconnected);
                        self.sink.publish(DcpEvent::Failed {
                            partition,
                            error: DcpError::CannotRetry {
                                attempts: attempt - 1,
                                cause: Box::new(DcpError::TmpFail),
                            },
                        });
                        Ok(())
                    }
                }
            }
            other => {
                self.shared.ctl.lock().unwrap().streams.remove(&partition);
                self.retry_attempts.remove(&partition);
                state.set_state(StreamState::Disconnected);
                logging::warn!(self.log, "stream request failed";
                               "partition" => partition,
                               "status" => other.code());
                self.sink.publish(DcpEvent::Failed {
                    partition,
                    error: DcpError::UnexpectedStatus(other.code()),
                });
                Ok(())
            }
        }
    }

    /// Re-issue stream requests whose TMPFAIL delay has elapsed.
    fn flush_due_retries(&mut self, now: Instant) {
        if self.retry_due.is_empty() {
            return;
        }

        let mut due = Vec::new();
        self.retry_due.retain(|&(at, partition)| {
            if at <= now {
                due.push(partition);
                false
            } else {
                true
            }
        });

        for partition in due {
            let still_wanted = self.shared.ctl.lock().unwrap().streams.contains(&partition);
            if !still_wanted {
                self.retry_attempts.remove(&partition);
                continue;
            }

            if let Ok(state) = self.session.get(partition) {
                let request = state.stream_request();
                self.queue_frame(build::stream_request(
                    partition,
                    u32::from(partition),
                    request.vbucket_uuid,
                    request.start_seqno,
                    request.end_seqno,
                    request.snapshot_start_seqno,
                    request.snapshot_end_seqno,
                ));
            }
        }
    }

    /// Turn accumulated embedder credit into a buffer acknowledgement once
    /// it crosses the watermark.
    fn maybe_buffer_ack(&mut self) {
        let watermark = self.settings.ack_watermark();
        if watermark == 0 {
            return;
        }

        if self.shared.acked.load(Ordering::Relaxed) >= watermark {
            let credit = self.shared.acked.swap(0, Ordering::Relaxed);
            let credit = credit.min(u64::from(u32::max_value())) as u32;
            self.queue_frame(build::buffer_ack(credit));
            logging::trace!(self.log, "buffer ack"; "bytes" => credit);
        }
    }

    /// Internally generated frames take the same queue as caller requests so
    /// outbound ordering stays first-in first-out.
    fn queue_frame(&self, frame: Frame) {
        self.shared.ctl.lock().unwrap().outbound.push_back(frame.to_bytes());
    }

    #[inline]
    fn owns(&self, partition: u16) -> bool {
        self.shared.ctl.lock().unwrap().streams.contains(&partition)
    }

    /// Control messages are consumed here, so their flow-control share is
    /// returned here too.
    fn auto_ack(&self, bytes: usize) {
        self.shared.acked.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_queue, Handlers};
    use crate::logging;
    use crate::testkit::{test_settings, FakeNode};
    use std::net::TcpListener;

    fn test_channel(address: SocketAddr) -> (DcpChannel, std::sync::mpsc::Receiver<DcpEvent>) {
        let (sink, receiver) = event_queue();
        let channel = DcpChannel::new(
            address,
            test_settings(),
            Arc::new(crate::session::SessionState::new(4)),
            sink,
            Handlers::discard(),
            &logging::discard(),
        );
        (channel, receiver)
    }

    #[test]
    fn test_connect_negotiates_and_closes() {
        let node = FakeNode::start(|_, conn| conn.serve_until_closed());
        let (channel, _events) = test_channel(node.addr());

        channel.connect().unwrap();

        assert_eq!(channel.state(), ChannelState::Connected);
        // The fake grants everything offered.
        assert_eq!(channel.negotiated_features(), test_settings().desired_features);

        // Idempotent while connected.
        channel.connect().unwrap();

        channel.close(false);
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.open_partitions().is_empty());
    }

    #[test]
    fn test_failed_connect_leaves_channel_disconnected() {
        // Grab a port that refuses connections.
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let (channel, _events) = test_channel(address);

        let result = channel.connect();

        assert!(result.is_err());
        // The reported state agrees with reality: no half-open channel
        // claiming to be connected after a failed attempt.
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_stream_operations_require_connection() {
        let address = "127.0.0.1:9".parse().unwrap();
        let (channel, _events) = test_channel(address);

        let request = StreamRequest {
            partition: 0,
            vbucket_uuid: 0,
            start_seqno: 0,
            end_seqno: 10,
            snapshot_start_seqno: 0,
            snapshot_end_seqno: 0,
        };

        assert_eq!(channel.open_stream(&request).unwrap_err(), DcpError::ConnectionClosed);
        assert_eq!(channel.request_seqnos().unwrap_err(), DcpError::ConnectionClosed);
    }

    #[test]
    fn test_close_when_never_connected_is_noop() {
        let address = "127.0.0.1:9".parse().unwrap();
        let (channel, _events) = test_channel(address);

        channel.close(true);
        channel.close(false);

        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
