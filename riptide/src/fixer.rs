//! The background supervisor: a single reactor thread consuming the event
//! queue and driving repair by reassigning partitions, reconnecting channels
//! and restarting streams at their saved resume points. Single-consumer so
//! exactly one actor ever reopens a stream.

use crate::conductor::Core;
use crate::error::{DcpError, DcpResult};
use crate::events::{DcpEvent, EventSink, SystemEvent};
use crate::logging::{self, Logger};
use crate::retry::retry_blocking;
use crate::session::StreamState;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

pub(crate) struct FixerHandle {
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
    sink: EventSink,
    started: Arc<(Mutex<bool>, Condvar)>,
}

impl FixerHandle {
    /// Gate for `establish_dcp_connections`: the reactor must be consuming
    /// before any channel can publish.
    pub(crate) fn wait_till_started(&self, timeout: Duration) -> DcpResult<()> {
        let deadline = Instant::now() + timeout;
        let (lock, condvar) = &*self.started;
        let mut started = lock.lock().unwrap();

        while !*started {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(DcpError::TimedOut),
            };

            let (guard, _) = condvar.wait_timeout(started, remaining).unwrap();
            started = guard;
        }

        Ok(())
    }

    /// Request graceful shutdown. The reactor drains up to the poison pill
    /// and exits.
    pub(crate) fn poison(&self) {
        self.sink.publish(DcpEvent::Poison);
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    #[inline]
    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

pub(crate) fn spawn(core: Arc<Core>, receiver: Receiver<DcpEvent>) -> DcpResult<FixerHandle> {
    let started = Arc::new((Mutex::new(false), Condvar::new()));
    let started_inner = started.clone();
    let sink = core.sink.clone();
    let log = core.log.new(logging::o!("thread" => "fixer"));

    let handle = thread::Builder::new()
        .name("dcp-fixer".to_string())
        .spawn(move || run(core, receiver, started_inner, log))?;

    let thread_id = handle.thread().id();

    Ok(FixerHandle {
        thread: Some(handle),
        thread_id,
        sink,
        started,
    })
}

fn run(core: Arc<Core>, receiver: Receiver<DcpEvent>, started: Arc<(Mutex<bool>, Condvar)>, log: Logger) {
    {
        let (lock, condvar) = &*started;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
    }
    logging::debug!(log, "fixer started");

    while let Ok(event) = receiver.recv() {
        match event {
            DcpEvent::Poison => break,
            event => handle_event(&core, event, &log),
        }
    }

    logging::debug!(log, "fixer stopped");
}

fn handle_event(core: &Arc<Core>, event: DcpEvent, log: &Logger) {
    match event {
        DcpEvent::ChannelDropped { address, partitions, cause } => {
            logging::warn!(log, "repairing dropped channel";
                           "address" => address.to_string(),
                           "partitions" => partitions.len(),
                           "cause" => ?cause);

            core.handlers.system.on_event(SystemEvent::ChannelDropped { address });
            core.remove_channel(address);

            // Each partition reconnects to its *current* master, which may
            // be a different node by now.
            for partition in partitions {
                repair_partition(core, partition, log);
            }
        }
        DcpEvent::StreamEnd { partition, reason } => {
            if reason.is_final() {
                logging::debug!(log, "stream finished";
                                "partition" => partition,
                                "reason" => ?reason);
                return;
            }

            logging::debug!(log, "stream ended early, reopening";
                            "partition" => partition,
                            "reason" => ?reason);
            repair_partition(core, partition, log);
        }
        DcpEvent::Rollback { partition, seqno } => {
            core.handlers.system.on_event(SystemEvent::Rollback { partition, seqno });

            if !core.is_connected() {
                return;
            }

            if let Ok(session) = core.session() {
                if let Ok(state) = session.get(partition) {
                    state.rollback_to(seqno);
                }
            }

            logging::debug!(log, "rolling back";
                            "partition" => partition,
                            "seqno" => seqno);
            repair_partition(core, partition, log);
        }
        DcpEvent::NotMyVbucket { partition } => {
            if !core.is_connected() {
                return;
            }

            // Wait out the cluster: refresh until a newer revision shows up,
            // then route the partition again.
            let seen = core.latest_config().map(|config| config.rev).unwrap_or(0);
            let refreshed = retry_blocking(&core.settings.config_policy, || {
                let config = core.refresh_config_once()?;
                if config.rev <= seen {
                    // Not an error from the provider, just not news yet.
                    return Err(DcpError::TimedOut);
                }
                Ok(config)
            });

            match refreshed {
                Ok(config) => {
                    logging::debug!(log, "rerouting after not-my-vbucket";
                                    "partition" => partition,
                                    "rev" => config.rev);
                    core.handlers.system.on_event(SystemEvent::PartitionRerouted { partition });
                    repair_partition(core, partition, log);
                }
                Err(err) => fail_partition(core, partition, err, log),
            }
        }
        DcpEvent::ConfigRevision(config) => {
            let rev = config.rev;
            core.handlers.system.on_event(SystemEvent::ConfigUpdated { rev });

            if !core.store_config(config.clone()) {
                logging::trace!(log, "ignoring stale config"; "rev" => rev);
                return;
            }
            if !core.is_connected() {
                return;
            }

            apply_topology(core, &config, log);
        }
        DcpEvent::Failed { partition, error } => {
            if let Ok(session) = core.session() {
                if let Ok(state) = session.get(partition) {
                    state.set_state(StreamState::Disconnected);
                }
            }
            core.handlers.system.on_event(SystemEvent::PartitionFailed { partition, error });
        }
        DcpEvent::Poison => unreachable!("poison is consumed by the reactor loop"),
    }
}

/// Diff the channel map against a newly adopted config: move streams whose
/// master changed, drop channels for departed nodes. New nodes get channels
/// lazily, the first time a partition routes to them.
fn apply_topology(core: &Arc<Core>, config: &crate::config::BucketConfig, log: &Logger) {
    logging::debug!(log, "applying topology"; "rev" => config.rev);

    let valid_addrs: Vec<_> = (0..config.num_nodes())
        .filter_map(|index| config.node_addr(index).ok())
        .collect();

    for channel in core.channels_snapshot() {
        let address = channel.address();

        for partition in channel.open_partitions() {
            let new_master = match config.master_addr(partition) {
                Ok(addr) => addr,
                Err(_) => continue,
            };

            if new_master != address {
                logging::debug!(log, "partition master moved";
                                "partition" => partition,
                                "from" => address.to_string(),
                                "to" => new_master.to_string());
                channel.release_stream(partition);
                repair_partition(core, partition, log);
            }
        }

        if !valid_addrs.contains(&address) {
            logging::debug!(log, "node left topology"; "address" => address.to_string());
            core.remove_channel(address);
            let stranded = channel.open_partitions();
            channel.close(false);
            for partition in stranded {
                repair_partition(core, partition, log);
            }
        }
    }
}

/// Reopen one partition's stream at its saved resume point, under the
/// repair retry policy. Later attempts refresh the config first so the
/// partition can follow its master. Exhaustion fails the partition.
fn repair_partition(core: &Arc<Core>, partition: u16, log: &Logger) {
    let mut first_attempt = true;

    let result = retry_blocking(&core.settings.repair_policy, || {
        if !core.is_connected() {
            return Err(DcpError::SessionDisconnected);
        }

        if !first_attempt {
            core.refresh_config_best_effort();
        }
        first_attempt = false;

        core.reopen_partition(partition)
    });

    match result {
        Ok(()) => (),
        Err(DcpError::SessionDisconnected) => (),
        Err(err) => fail_partition(core, partition, err, log),
    }
}

fn fail_partition(core: &Arc<Core>, partition: u16, error: DcpError, log: &Logger) {
    logging::warn!(log, "partition repair exhausted";
                   "partition" => partition,
                   "error" => ?error);

    if let Ok(session) = core.session() {
        if let Ok(state) = session.get(partition) {
            state.set_state(StreamState::Disconnected);
        }
    }

    core.handlers.system.on_event(SystemEvent::PartitionFailed { partition, error });
}
