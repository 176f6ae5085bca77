//! The public façade and coordinator: owns the channel map, the session,
//! the event queue and the fixer lifecycle. Callers talk to the `Conductor`;
//! channels and the fixer talk to each other through the event queue.

use crate::config::{BucketConfig, ConfigProvider};
use crate::error::{DcpError, DcpResult};
use crate::events::{event_queue, DcpEvent, EventSink, Handlers};
use crate::fixer::{self, FixerHandle};
use crate::logging::{self, Logger};
use crate::net::channel::{ChannelState, DcpChannel};
use crate::retry::retry_blocking;
use crate::session::{SessionState, StreamState};
use crate::settings::ClientSettings;
use brine::message::{FailoverEntry, StreamRequest};
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

/// State shared between the conductor's callers and the fixer thread.
pub(crate) struct Core {
    pub(crate) settings: ClientSettings,
    pub(crate) handlers: Handlers,
    pub(crate) sink: EventSink,
    pub(crate) log: Logger,
    provider: Mutex<Box<dyn ConfigProvider>>,
    config: Mutex<Option<BucketConfig>>,
    session: Mutex<Option<Arc<SessionState>>>,
    channels: Mutex<HashMap<SocketAddr, Arc<DcpChannel>>>,
    connected: AtomicBool,
}

impl Core {
    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn require_connected(&self) -> DcpResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DcpError::InvariantViolation("client is not connected"))
        }
    }

    pub(crate) fn latest_config(&self) -> DcpResult<BucketConfig> {
        self.config
            .lock()
            .unwrap()
            .clone()
            .ok_or(DcpError::InvariantViolation("no config observed yet"))
    }

    /// Adopt `config` if its revision is newer than what we hold. Returns
    /// whether it was adopted; stale revisions are ignored.
    pub(crate) fn store_config(&self, config: BucketConfig) -> bool {
        let mut current = self.config.lock().unwrap();

        match &*current {
            Some(existing) if existing.rev >= config.rev => false,
            _ => {
                *current = Some(config);
                true
            }
        }
    }

    /// One provider refresh under the config retry policy, adopting the
    /// result.
    pub(crate) fn refresh_config(&self) -> DcpResult<BucketConfig> {
        let timeout = self.settings.connect_timeout;
        let mut provider = self.provider.lock().unwrap();

        let config = retry_blocking(&self.settings.config_policy, || provider.refresh(timeout))?;
        drop(provider);

        self.store_config(config.clone());
        Ok(config)
    }

    /// Single refresh attempt, errors swallowed. Used between repair
    /// attempts so a moved partition finds its new master.
    pub(crate) fn refresh_config_best_effort(&self) {
        let timeout = self.settings.connect_timeout;
        let refreshed = self.provider.lock().unwrap().refresh(timeout);

        if let Ok(config) = refreshed {
            self.store_config(config);
        }
    }

    /// One raw refresh attempt, for callers running their own retry loop.
    pub(crate) fn refresh_config_once(&self) -> DcpResult<BucketConfig> {
        let timeout = self.settings.connect_timeout;
        let config = self.provider.lock().unwrap().refresh(timeout)?;
        self.store_config(config.clone());
        Ok(config)
    }

    pub(crate) fn session(&self) -> DcpResult<Arc<SessionState>> {
        self.session
            .lock()
            .unwrap()
            .clone()
            .ok_or(DcpError::InvariantViolation("no session established"))
    }

    /// Channel for `address`, connecting a fresh one if needed. Connecting
    /// happens outside the map lock; racing callers converge on one entry.
    pub(crate) fn ensure_channel(&self, address: SocketAddr) -> DcpResult<Arc<DcpChannel>> {
        loop {
            if !self.is_connected() {
                return Err(DcpError::SessionDisconnected);
            }

            let existing = self.channels.lock().unwrap().get(&address).cloned();

            if let Some(channel) = existing {
                match channel.state() {
                    ChannelState::Connected => return Ok(channel),
                    ChannelState::Connecting => {
                        channel.wait_connected(self.settings.connect_timeout)?;
                        continue;
                    }
                    _ => {
                        self.remove_channel_entry(&address, &channel);
                        continue;
                    }
                }
            }

            let session = self.session()?;
            let channel = Arc::new(DcpChannel::new(
                address,
                self.settings.clone(),
                session,
                self.sink.clone(),
                self.handlers.clone(),
                &self.log,
            ));

            {
                let mut channels = self.channels.lock().unwrap();
                if channels.contains_key(&address) {
                    continue;
                }
                channels.insert(address, channel.clone());
            }

            match channel.connect() {
                Ok(()) => {
                    if !self.is_connected() {
                        self.remove_channel_entry(&address, &channel);
                        channel.close(false);
                        return Err(DcpError::SessionDisconnected);
                    }
                    return Ok(channel);
                }
                Err(err) => {
                    self.remove_channel_entry(&address, &channel);
                    return Err(err);
                }
            }
        }
    }

    pub(crate) fn remove_channel(&self, address: SocketAddr) -> Option<Arc<DcpChannel>> {
        self.channels.lock().unwrap().remove(&address)
    }

    fn remove_channel_entry(&self, address: &SocketAddr, channel: &Arc<DcpChannel>) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(current) = channels.get(address) {
            if Arc::ptr_eq(current, channel) {
                channels.remove(address);
            }
        }
    }

    pub(crate) fn channels_snapshot(&self) -> Vec<Arc<DcpChannel>> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    /// The channel a partition's stream currently lives on, if any.
    pub(crate) fn channel_owning(&self, partition: u16) -> Option<Arc<DcpChannel>> {
        self.channels
            .lock()
            .unwrap()
            .values()
            .find(|channel| channel.open_partitions().contains(&partition))
            .cloned()
    }

    /// Routing primitive: the channel of the partition's master under the
    /// latest observed config. Absence is a programming error.
    pub(crate) fn master_channel(&self, partition: u16) -> DcpResult<Arc<DcpChannel>> {
        let config = self.latest_config()?;
        let address = config.master_addr(partition)?;

        self.channels
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or(DcpError::InvariantViolation("no channel for partition master"))
    }

    /// Reopen `partition` on its current master at its saved resume point.
    pub(crate) fn reopen_partition(&self, partition: u16) -> DcpResult<()> {
        let config = self.latest_config()?;
        let address = config.master_addr(partition)?;
        let channel = self.ensure_channel(address)?;
        let session = self.session()?;
        let state = session.get(partition)?;

        channel.open_stream(&state.stream_request())
    }
}

/// The embedder's entry point. See the crate docs for the lifecycle:
/// `connect` → `establish_dcp_connections` → stream operations →
/// `disconnect`.
pub struct Conductor {
    core: Arc<Core>,
    fixer: Mutex<Option<FixerHandle>>,
    receiver: Mutex<Option<Receiver<DcpEvent>>>,
    connect_serial: Mutex<()>,
}

impl Conductor {
    pub fn new<'a, P, L>(settings: ClientSettings, provider: P, handlers: Handlers, log: L) -> Conductor
    where
        P: ConfigProvider + 'static,
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("bucket" => settings.bucket.clone())),
            None => logging::discard(),
        };

        let (sink, receiver) = event_queue();

        let mut provider = provider;
        provider.attach(sink.clone());

        Conductor {
            core: Arc::new(Core {
                settings,
                handlers,
                sink,
                log,
                provider: Mutex::new(Box::new(provider)),
                config: Mutex::new(None),
                session: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
            }),
            fixer: Mutex::new(None),
            receiver: Mutex::new(Some(receiver)),
            connect_serial: Mutex::new(()),
        }
    }

    /// Fetch the bucket config and bring the session up. Idempotent: a
    /// connected client treats this as a no-op. A reconnect after
    /// `disconnect` reuses the existing session, preserving every
    /// partition's progress.
    pub fn connect(&self) -> DcpResult<()> {
        let _serial = self.connect_serial.lock().unwrap();

        if self.core.is_connected() {
            return Ok(());
        }

        let config = self.core.refresh_config()?;

        {
            let mut session = self.core.session.lock().unwrap();
            match &*session {
                Some(existing) if existing.len() == config.num_partitions() => {
                    existing.set_connected();
                }
                _ => {
                    let fresh = Arc::new(SessionState::new(config.num_partitions()));
                    fresh.set_connected();
                    *session = Some(fresh);
                }
            }
        }

        self.core.connected.store(true, Ordering::Release);
        logging::info!(self.core.log, "connected"; "rev" => config.rev);
        Ok(())
    }

    /// Start the fixer and open one channel per node that masters at least
    /// one partition.
    pub fn establish_dcp_connections(&self) -> DcpResult<()> {
        self.core.require_connected()?;

        {
            let mut fixer = self.fixer.lock().unwrap();
            if fixer.is_none() {
                let receiver = self
                    .receiver
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or(DcpError::InvariantViolation("event queue already consumed"))?;

                let handle = fixer::spawn(self.core.clone(), receiver)?;
                handle.wait_till_started(self.core.settings.connect_timeout)?;
                *fixer = Some(handle);
            }
        }

        let config = self.core.latest_config()?;
        for address in config.master_addrs()? {
            self.core.ensure_channel(address)?;
        }

        Ok(())
    }

    /// Dispatch a stream request to the partition's master. The caller's
    /// request must satisfy `snapshot_start <= start <= snapshot_end`.
    pub fn start_stream_for_partition(&self, request: &StreamRequest) -> DcpResult<()> {
        self.core.require_connected()?;

        if request.snapshot_start_seqno > request.start_seqno
            || request.start_seqno > request.snapshot_end_seqno
        {
            return Err(DcpError::InvariantViolation(
                "snapshot window must bracket the start seqno",
            ));
        }

        let session = self.core.session()?;
        let state = session.get(request.partition)?;
        state.prime(request);

        let channel = self.core.master_channel(request.partition)?;
        channel.open_stream(&state.stream_request())
    }

    /// Close the partition's stream and wait for the server's stream-end.
    pub fn stop_stream_for_partition(&self, partition: u16) -> DcpResult<()> {
        self.core.require_connected()?;

        let session = self.core.session()?;
        let state = session.get(partition)?;

        match state.state() {
            StreamState::Connected | StreamState::Connecting => (),
            _ => return Ok(()),
        }

        let channel = match self.core.channel_owning(partition) {
            Some(channel) => channel,
            None => self.core.master_channel(partition)?,
        };

        channel.close_stream(partition)?;
        state.wait_for_state(StreamState::Disconnected, self.core.settings.close_timeout)
    }

    /// Ask every master for its current high seqnos. Blocks until all
    /// partitions have answered or the query timeout runs out.
    pub fn get_seqnos(&self) -> DcpResult<Vec<(u16, u64)>> {
        self.core.require_connected()?;

        let config = self.core.latest_config()?;
        let session = self.core.session()?;
        let deadline = Instant::now() + self.core.settings.query_timeout;

        let mut by_address: HashMap<SocketAddr, Vec<u16>> = HashMap::new();
        for partition in 0..config.num_partitions() {
            by_address
                .entry(config.master_addr(partition)?)
                .or_insert_with(Vec::new)
                .push(partition);
        }

        for (address, partitions) in &by_address {
            let channel = self
                .core
                .channels
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .ok_or(DcpError::InvariantViolation("no channel for partition master"))?;

            for &partition in partitions {
                session.get(partition)?.seqno_request();
            }
            channel.request_seqnos()?;
        }

        let mut seqnos = Vec::with_capacity(config.num_partitions() as usize);
        for partition in 0..config.num_partitions() {
            let state = session.get(partition)?;
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_default();
            state.wait_till_seqno_updated(remaining)?;
            seqnos.push((partition, state.current_seqno()));
        }

        Ok(seqnos)
    }

    /// Fetch and store the partition's failover log.
    pub fn get_failover_log(&self, partition: u16) -> DcpResult<Vec<FailoverEntry>> {
        self.core.require_connected()?;

        let session = self.core.session()?;
        let state = session.get(partition)?;

        let channel = match self.core.channel_owning(partition) {
            Some(channel) => channel,
            None => self.core.master_channel(partition)?,
        };

        state.failover_request();
        channel.request_failover_log(partition)?;
        state.wait_till_failover_updated(self.core.settings.query_timeout)?;

        Ok(state.failover_log())
    }

    /// Routing primitive: the channel of the partition's master under the
    /// latest observed config. A missing channel is a programming error and
    /// surfaces as an invariant violation.
    pub fn master_channel_by_partition(&self, partition: u16) -> DcpResult<Arc<DcpChannel>> {
        self.core.master_channel(partition)
    }

    /// Observing accessor for embedders that track partition progress.
    pub fn session(&self) -> DcpResult<Arc<SessionState>> {
        self.core.session()
    }

    /// Number of partitions under the latest observed config.
    pub fn num_partitions(&self) -> DcpResult<u16> {
        Ok(self.core.latest_config()?.num_partitions())
    }

    /// Addresses with live channels, for observability.
    pub fn channel_addresses(&self) -> Vec<SocketAddr> {
        self.core
            .channels_snapshot()
            .into_iter()
            .map(|channel| channel.address())
            .collect()
    }

    /// Tear everything down: poison the fixer, close every channel
    /// (gracefully when `wait`), mark the session disconnected and wake all
    /// blocked waiters. Idempotent, and safe to call from a fixer-invoked
    /// callback: the conductor will not join the thread it is running on.
    pub fn disconnect(&self, wait: bool) -> DcpResult<()> {
        if !self.core.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        logging::info!(self.core.log, "disconnecting"; "graceful" => wait);

        let fixer = self.fixer.lock().unwrap().take();
        if let Some(mut handle) = fixer {
            handle.poison();
            if thread::current().id() != handle.thread_id() {
                handle.join();
            }
        }

        let channels: Vec<Arc<DcpChannel>> = {
            let mut map = self.core.channels.lock().unwrap();
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.close(wait);
        }

        if let Ok(session) = self.core.session() {
            session.set_disconnected();
        }

        // Fresh queue so a later reconnect starts with an empty event
        // stream. Every sink clone in the wild follows the swap.
        let (tx, rx) = mpsc::channel();
        self.core.sink.replace(tx);
        *self.receiver.lock().unwrap() = Some(rx);

        Ok(())
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        let _ = self.disconnect(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{config_json, StaticProvider, StaticProviderHandle};
    use crate::retry::{Delay, RetryPolicy};
    use crate::testkit::{
        stream_request_window, test_settings, wait_until, FakeNode, Recorder, ScriptConn,
    };
    use brine::frame::{Opcode, Status};
    use brine::message::{StreamEndReason, StreamRequest, NO_END_SEQNO};
    use std::io;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn one_node_config(rev: u64, node: &FakeNode) -> BucketConfig {
        let entry = node.server_entry();
        let json = config_json(rev, &[entry.as_str()], &[&[0]]);
        BucketConfig::parse(&json, "127.0.0.1").unwrap()
    }

    fn provider_for(config: BucketConfig) -> (StaticProvider, StaticProviderHandle) {
        StaticProvider::new(Some(config))
    }

    fn open_ended_request(partition: u16, start: u64) -> StreamRequest {
        StreamRequest {
            partition,
            vbucket_uuid: 0,
            start_seqno: start,
            end_seqno: NO_END_SEQNO,
            snapshot_start_seqno: start,
            snapshot_end_seqno: start,
        }
    }

    fn expect_stream_request(conn: &mut ScriptConn) -> brine::frame::Frame {
        let frame = conn.next_request().unwrap();
        assert_eq!(frame.header.known_opcode(), Some(Opcode::StreamRequest));
        frame
    }

    #[test]
    fn test_happy_path_single_partition() {
        let node = FakeNode::start(|index, conn| {
            assert_eq!(index, 0);

            let request = expect_stream_request(conn);
            assert_eq!(request.header.vbucket(), 0);
            assert_eq!(stream_request_window(&request), (0, 100, 0, 0));

            conn.reply_stream_success(&request, &[(0xaaaa, 0)]).unwrap();
            conn.send_snapshot_marker(0, 0, 100).unwrap();
            for seqno in 1..=100u64 {
                conn.send_mutation(0, seqno, b"key", b"{}").unwrap();
            }
            conn.send_stream_end(0, 0).unwrap();
            conn.serve_until_closed();
        });

        let (provider, _handle) = provider_for(one_node_config(1, &node));
        let recorder = Recorder::new();
        let conductor = Conductor::new(test_settings(), provider, Recorder::handlers(&recorder), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();
        conductor
            .start_stream_for_partition(&StreamRequest {
                partition: 0,
                vbucket_uuid: 0xaaaa,
                start_seqno: 0,
                end_seqno: 100,
                snapshot_start_seqno: 0,
                snapshot_end_seqno: 0,
            })
            .unwrap();

        let partition = conductor.session().unwrap().get(0).unwrap();
        wait_until(
            || partition.end_reason() == Some(StreamEndReason::Ok),
            WAIT,
            "stream completion",
        );

        let seqnos = recorder.seqnos(0);
        assert_eq!(seqnos, (1..=100u64).collect::<Vec<_>>());
        assert_eq!(partition.state(), StreamState::Disconnected);
        assert_eq!(partition.start_seqno(), 100);
        assert!(!partition.failover_log().is_empty());

        let first_control = recorder.control.lock().unwrap().first().cloned();
        assert_eq!(
            first_control,
            Some(crate::events::ControlEvent::SnapshotMarker {
                partition: 0,
                start_seqno: 0,
                end_seqno: 100,
                flags: 1,
            })
        );

        conductor.disconnect(true).unwrap();
        assert!(conductor.channel_addresses().is_empty());
    }

    #[test]
    fn test_rollback_rewinds_and_reopens() {
        let node = FakeNode::start(|index, conn| {
            assert_eq!(index, 0);

            let first = expect_stream_request(conn);
            assert_eq!(stream_request_window(&first), (50, NO_END_SEQNO, 50, 50));
            conn.reply_rollback(&first, 30).unwrap();

            let second = expect_stream_request(conn);
            assert_eq!(stream_request_window(&second), (30, NO_END_SEQNO, 30, 30));
            conn.reply_stream_success(&second, &[(0xbbbb, 0)]).unwrap();

            conn.send_snapshot_marker(0, 30, 100).unwrap();
            for seqno in 31..=40u64 {
                conn.send_mutation(0, seqno, b"key", b"{}").unwrap();
            }
            conn.serve_until_closed();
        });

        let (provider, _handle) = provider_for(one_node_config(1, &node));
        let recorder = Recorder::new();
        let conductor = Conductor::new(test_settings(), provider, Recorder::handlers(&recorder), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();
        conductor
            .start_stream_for_partition(&open_ended_request(0, 50))
            .unwrap();

        let partition = conductor.session().unwrap().get(0).unwrap();
        wait_until(|| partition.start_seqno() == 40, WAIT, "post-rollback delivery");

        assert_eq!(recorder.seqnos(0), (31..=40u64).collect::<Vec<_>>());
        assert_eq!(partition.snapshot(), (30, 100));
        assert_eq!(partition.state(), StreamState::Connected);

        conductor.disconnect(true).unwrap();
    }

    #[test]
    fn test_channel_drop_resumes_at_last_seqno() {
        let node = FakeNode::start(|index, conn| match index {
            0 => {
                let request = expect_stream_request(conn);
                conn.reply_stream_success(&request, &[(0xaaaa, 0)]).unwrap();
                conn.send_snapshot_marker(0, 0, 1000).unwrap();
                for seqno in 1..=42u64 {
                    conn.send_mutation(0, seqno, b"key", b"{}").unwrap();
                }
                // Connection dies here: the script returns and the socket
                // drops mid-stream.
            }
            _ => {
                let request = expect_stream_request(conn);
                let (start, _, snap_start, snap_end) = stream_request_window(&request);
                assert_eq!(start, 42);
                assert_eq!(snap_start, 0);
                assert_eq!(snap_end, 1000);

                conn.reply_stream_success(&request, &[(0xaaaa, 0)]).unwrap();
                conn.send_snapshot_marker(0, 43, 1000).unwrap();
                for seqno in 43..=45u64 {
                    conn.send_mutation(0, seqno, b"key", b"{}").unwrap();
                }
                conn.serve_until_closed();
            }
        });

        let (provider, _handle) = provider_for(one_node_config(1, &node));
        let recorder = Recorder::new();
        let conductor = Conductor::new(test_settings(), provider, Recorder::handlers(&recorder), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();
        conductor
            .start_stream_for_partition(&open_ended_request(0, 0))
            .unwrap();

        let partition = conductor.session().unwrap().get(0).unwrap();
        wait_until(|| partition.start_seqno() == 45, WAIT, "post-repair delivery");

        // No gaps: every seqno up to 45 was delivered exactly once here
        // (duplicates would be tolerated, holes would not).
        assert_eq!(recorder.seqnos(0), (1..=45u64).collect::<Vec<_>>());

        conductor.disconnect(true).unwrap();
    }

    #[test]
    fn test_topology_move_follows_master() {
        let node_b_seen = Arc::new(AtomicUsize::new(0));
        let node_b_seen_inner = node_b_seen.clone();

        let node_a = FakeNode::start(|_, conn| {
            let request = expect_stream_request(conn);
            conn.reply_stream_success(&request, &[(0xaaaa, 0)]).unwrap();
            conn.send_snapshot_marker(0, 0, 1000).unwrap();
            for seqno in 1..=10u64 {
                conn.send_mutation(0, seqno, b"key", b"{}").unwrap();
            }
            conn.serve_until_closed();
        });

        let node_b = FakeNode::start(move |_, conn| {
            let request = expect_stream_request(conn);
            let (start, _, snap_start, snap_end) = stream_request_window(&request);
            assert_eq!(start, 10);
            assert_eq!(snap_start, 0);
            assert_eq!(snap_end, 1000);
            node_b_seen_inner.fetch_add(1, AtomicOrdering::SeqCst);

            conn.reply_stream_success(&request, &[(0xaaaa, 0)]).unwrap();
            conn.send_snapshot_marker(0, 11, 1000).unwrap();
            for seqno in 11..=15u64 {
                conn.send_mutation(0, seqno, b"key", b"{}").unwrap();
            }
            conn.serve_until_closed();
        });

        let servers = [node_a.server_entry(), node_b.server_entry()];
        let server_refs: Vec<&str> = servers.iter().map(|s| s.as_str()).collect();

        let rev1 = BucketConfig::parse(&config_json(1, &server_refs, &[&[0, 1]]), "127.0.0.1").unwrap();
        let rev2 = BucketConfig::parse(&config_json(2, &server_refs, &[&[1, 0]]), "127.0.0.1").unwrap();

        let (provider, handle) = provider_for(rev1);
        let recorder = Recorder::new();
        let conductor = Conductor::new(test_settings(), provider, Recorder::handlers(&recorder), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();
        conductor
            .start_stream_for_partition(&open_ended_request(0, 0))
            .unwrap();

        let partition = conductor.session().unwrap().get(0).unwrap();
        wait_until(|| partition.start_seqno() == 10, WAIT, "delivery from the old master");

        handle.publish(rev2);

        wait_until(|| partition.start_seqno() == 15, WAIT, "delivery from the new master");
        assert_eq!(node_b_seen.load(AtomicOrdering::SeqCst), 1);

        // Nothing lost across the move.
        assert_eq!(recorder.seqnos(0), (1..=15u64).collect::<Vec<_>>());

        conductor.disconnect(true).unwrap();
    }

    #[test]
    fn test_connect_retry_exhaustion() {
        let (provider, handle) = StaticProvider::new(None);
        handle.fail_refreshes(DcpError::Io(io::ErrorKind::ConnectionRefused));

        let settings = test_settings().with_config_policy(
            RetryPolicy::new(3, Delay::Fixed(Duration::from_millis(5)))
                .with_interrupt(|error: &DcpError| !error.is_transient()),
        );
        let conductor = Conductor::new(settings, provider, Handlers::discard(), None);

        match conductor.connect().unwrap_err() {
            DcpError::CannotRetry { attempts, cause } => {
                assert_eq!(attempts, 3);
                assert_eq!(*cause, DcpError::Io(io::ErrorKind::ConnectionRefused));
            }
            other => panic!("Unexpected error {:?}", other),
        }

        assert!(conductor.channel_addresses().is_empty());
        assert!(conductor.establish_dcp_connections().is_err());
    }

    #[test]
    fn test_disconnect_during_repair() {
        let connections = Arc::new(AtomicUsize::new(0));
        let connections_inner = connections.clone();

        let node = FakeNode::start(move |index, conn| {
            connections_inner.fetch_add(1, AtomicOrdering::SeqCst);
            if index > 0 {
                // Every reconnect is refused by dropping the socket
                // immediately, keeping the fixer in its retry loop.
                return;
            }

            let request = expect_stream_request(conn);
            conn.reply_stream_success(&request, &[(0xaaaa, 0)]).unwrap();
            conn.send_snapshot_marker(0, 0, 1000).unwrap();
            for seqno in 1..=5u64 {
                conn.send_mutation(0, seqno, b"key", b"{}").unwrap();
            }
        });

        let (provider, _handle) = provider_for(one_node_config(1, &node));
        let recorder = Recorder::new();
        let conductor = Conductor::new(test_settings(), provider, Recorder::handlers(&recorder), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();
        conductor
            .start_stream_for_partition(&open_ended_request(0, 0))
            .unwrap();

        let partition = conductor.session().unwrap().get(0).unwrap();
        wait_until(|| partition.start_seqno() == 5, WAIT, "initial delivery");

        // Wait until the fixer is visibly mid-repair (reconnect attempts
        // landing on the node), then pull the plug.
        wait_until(
            || connections.load(AtomicOrdering::SeqCst) >= 2,
            WAIT,
            "repair reconnect attempts",
        );

        let waiter_partition = partition.clone();
        let waiter = thread::spawn(move || {
            waiter_partition.wait_for_state(StreamState::Connected, Duration::from_secs(30))
        });

        thread::sleep(Duration::from_millis(20));
        conductor.disconnect(true).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap_err(), DcpError::SessionDisconnected);
        assert!(conductor.channel_addresses().is_empty());
        assert_eq!(partition.state(), StreamState::Disconnected);
    }

    #[test]
    fn test_not_my_vbucket_reroutes_after_config_refresh() {
        let node = FakeNode::start(|index, conn| {
            assert_eq!(index, 0);

            let first = expect_stream_request(conn);
            conn.reply(&first, Status::NotMyVbucket, &[]).unwrap();

            let second = expect_stream_request(conn);
            conn.reply_stream_success(&second, &[(0xaaaa, 0)]).unwrap();
            conn.send_snapshot_marker(0, 1, 10).unwrap();
            conn.send_mutation(0, 1, b"key", b"{}").unwrap();
            conn.serve_until_closed();
        });

        let rev1 = one_node_config(1, &node);
        let rev2 = one_node_config(2, &node);

        let settings = test_settings().with_config_policy(
            RetryPolicy::new(50, Delay::Fixed(Duration::from_millis(20)))
                .with_interrupt(|error: &DcpError| !error.is_transient()),
        );

        let (provider, handle) = provider_for(rev1);
        let recorder = Recorder::new();
        let conductor = Conductor::new(settings, provider, Recorder::handlers(&recorder), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();
        conductor
            .start_stream_for_partition(&open_ended_request(0, 1))
            .unwrap();

        // The cluster "catches up": a newer revision unblocks the reroute.
        thread::sleep(Duration::from_millis(100));
        handle.publish(rev2);

        let partition = conductor.session().unwrap().get(0).unwrap();
        wait_until(|| partition.start_seqno() == 1, WAIT, "delivery after reroute");

        conductor.disconnect(true).unwrap();
    }

    #[test]
    fn test_get_seqnos_and_failover_log() {
        let node = FakeNode::start(|_, conn| loop {
            let request = match conn.next_request() {
                Ok(request) => request,
                Err(_) => return,
            };

            match request.header.known_opcode() {
                Some(Opcode::GetAllVbSeqnos) => {
                    conn.reply_seqnos(&request, &[(0, 1234)]).unwrap();
                }
                Some(Opcode::GetFailoverLog) => {
                    conn.reply_failover_log(&request, &[(0xfeed, 77), (0xbeef, 0)]).unwrap();
                }
                Some(Opcode::CloseStream) => {
                    conn.reply(&request, Status::Success, &[]).unwrap();
                }
                other => panic!("Unexpected request {:?}", other),
            }
        });

        let (provider, _handle) = provider_for(one_node_config(1, &node));
        let conductor = Conductor::new(test_settings(), provider, Handlers::discard(), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();

        assert_eq!(conductor.get_seqnos().unwrap(), vec![(0, 1234)]);

        let log = conductor.get_failover_log(0).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].vbucket_uuid, 0xfeed);
        assert_eq!(log[0].seqno, 77);

        conductor.disconnect(true).unwrap();
    }

    #[test]
    fn test_buffer_ack_emitted_past_watermark() {
        let acked = Arc::new(AtomicU64::new(0));
        let acked_inner = acked.clone();

        let node = FakeNode::start(move |_, conn| {
            let request = expect_stream_request(conn);
            conn.reply_stream_success(&request, &[(0xaaaa, 0)]).unwrap();
            conn.send_snapshot_marker(0, 0, 1000).unwrap();
            for seqno in 1..=10u64 {
                conn.send_mutation(0, seqno, b"key", &[7u8; 64]).unwrap();
            }

            // connection_buffer_size 1000 puts the watermark at 200; ten
            // mutations of ~120 acked bytes must cross it.
            let total = conn.wait_for_ack(200).unwrap();
            acked_inner.store(total, AtomicOrdering::SeqCst);
            conn.serve_until_closed();
        });

        let settings = test_settings().with_buffer_size(1000);
        let (provider, _handle) = provider_for(one_node_config(1, &node));
        let recorder = Recorder::new();
        let conductor = Conductor::new(settings, provider, Recorder::handlers(&recorder), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();
        conductor
            .start_stream_for_partition(&open_ended_request(0, 0))
            .unwrap();

        wait_until(
            || acked.load(AtomicOrdering::SeqCst) >= 200,
            WAIT,
            "buffer acknowledgement",
        );

        conductor.disconnect(true).unwrap();
    }

    #[test]
    fn test_connect_twice_is_idempotent() {
        let node = FakeNode::start(|_, conn| conn.serve_until_closed());

        let (provider, _handle) = provider_for(one_node_config(1, &node));
        let conductor = Conductor::new(test_settings(), provider, Handlers::discard(), None);

        conductor.connect().unwrap();
        let session = conductor.session().unwrap();
        conductor.connect().unwrap();

        // Same session object: the second connect was a no-op.
        assert!(Arc::ptr_eq(&session, &conductor.session().unwrap()));

        conductor.disconnect(false).unwrap();
    }

    #[test]
    fn test_disconnect_when_not_connected_is_noop() {
        let (provider, _handle) = StaticProvider::new(None);
        let conductor = Conductor::new(test_settings(), provider, Handlers::discard(), None);

        conductor.disconnect(true).unwrap();
        conductor.disconnect(false).unwrap();
    }

    #[test]
    fn test_stop_stream_closes_partition() {
        let noops_answered = Arc::new(AtomicUsize::new(0));
        let noops_answered_inner = noops_answered.clone();

        let node = FakeNode::start(move |_, conn| {
            let request = expect_stream_request(conn);
            conn.reply_stream_success(&request, &[(0xaaaa, 0)]).unwrap();
            conn.send_snapshot_marker(0, 0, 1000).unwrap();
            conn.send_mutation(0, 1, b"key", b"{}").unwrap();
            conn.send_noop(7).unwrap();
            conn.serve_until_closed();
            noops_answered_inner.store(conn.noop_replies, AtomicOrdering::SeqCst);
        });

        let (provider, _handle) = provider_for(one_node_config(1, &node));
        let recorder = Recorder::new();
        let conductor = Conductor::new(test_settings(), provider, Recorder::handlers(&recorder), None);

        conductor.connect().unwrap();
        conductor.establish_dcp_connections().unwrap();
        conductor
            .start_stream_for_partition(&open_ended_request(0, 0))
            .unwrap();

        let partition = conductor.session().unwrap().get(0).unwrap();
        wait_until(|| partition.start_seqno() == 1, WAIT, "first delivery");

        conductor.stop_stream_for_partition(0).unwrap();

        assert_eq!(partition.state(), StreamState::Disconnected);
        assert_eq!(partition.end_reason(), Some(StreamEndReason::Closed));

        // Stopping an already-closed stream is a no-op.
        conductor.stop_stream_for_partition(0).unwrap();

        conductor.disconnect(true).unwrap();

        wait_until(
            || noops_answered.load(AtomicOrdering::SeqCst) == 1,
            WAIT,
            "noop reply",
        );
    }
}
