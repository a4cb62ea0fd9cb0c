/*!
Runtime wiring around the translation pipeline.

Two threads per transport:

1. Reader loop: owns the [`Transport`]. Writes queued outgoing telegrams,
   reads one line at a time, runs the frame codec and forwards frames with
   their arrival time. It never waits on a command.
2. Store actor: owns the [`Pipeline`] and therefore every device state.
   Frames are applied in arrival order, requests from [`BridgeHandle`]s are
   served in between, and the watchdog ticks on a fixed interval.

All hand-offs are bounded crossbeam channels. Command issuers wait for a
queue slot and for the reply with a timeout.
*/

use anyhow::Context;
use chrono::{DateTime, Utc};
use crossbeam_channel::{
    bounded, never, select, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use serde::Serialize;
use shared::{
    decode_telegram, CanFrame, CommandCall, CommandError, DeviceEvent, DeviceState, IssuedCommand, Pipeline,
    PipelineStats, ProfileRegistry, ProfileSet, SharedError, StoreError,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::transport::{Transport, TransportError};

/// A decoded frame stamped on arrival
#[derive(Debug, Clone, Copy)]
pub struct InboundFrame {
    pub frame: CanFrame,
    pub received_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge is stopped")]
    Stopped,

    #[error("Command queue is full")]
    QueueFull,

    #[error("No reply from the store within the request timeout")]
    ReplyTimedOut,

    #[error("Outgoing telegram queue is full, command #{0} was not sent")]
    OutboundFull(u64),

    #[error(transparent)]
    Pipeline(#[from] SharedError),
}

impl BridgeError {
    /// Busy device or congested queues; the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QueueFull | Self::ReplyTimedOut | Self::OutboundFull(_) => true,
            Self::Pipeline(e) => e.is_retryable(),
            Self::Stopped => false,
        }
    }
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        Self::Pipeline(err.into())
    }
}

impl From<CommandError> for BridgeError {
    fn from(err: CommandError) -> Self {
        Self::Pipeline(err.into())
    }
}

/// Work items for the store actor
enum BridgeRequest {
    Command {
        device_id: String,
        call: CommandCall,
        reply: Sender<Result<IssuedCommand, BridgeError>>,
    },
    Snapshot {
        device_id: String,
        reply: Sender<Option<DeviceState>>,
    },
    Snapshots {
        reply: Sender<Vec<DeviceState>>,
    },
    Connect {
        device_id: String,
        device_type: String,
        reply: Sender<Result<(), StoreError>>,
    },
    Disconnect {
        device_id: String,
        reply: Sender<Result<DeviceState, StoreError>>,
    },
    Stats {
        reply: Sender<PipelineStats>,
    },
}

/// Reader loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub lines: u64,
    pub framing_errors: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub telegrams_written: u64,
    pub write_errors: u64,
}

/// Final counters of a stopped bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeReport {
    pub reader: ReaderStats,
    pub pipeline: PipelineStats,
    pub events_dropped: u64,
}

/// Cloneable front door for command issuers and state readers
#[derive(Clone)]
pub struct BridgeHandle {
    requests: Sender<BridgeRequest>,
    registry: Arc<ProfileRegistry>,
    running: Arc<AtomicBool>,
    timeout: Duration,
}

impl BridgeHandle {
    fn request<R>(&self, make: impl FnOnce(Sender<R>) -> BridgeRequest) -> Result<R, BridgeError> {
        if !self.is_running() {
            return Err(BridgeError::Stopped);
        }

        let (reply_tx, reply_rx) = bounded(1);
        self.requests
            .send_timeout(make(reply_tx), self.timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => BridgeError::QueueFull,
                SendTimeoutError::Disconnected(_) => BridgeError::Stopped,
            })?;

        reply_rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => BridgeError::ReplyTimedOut,
            RecvTimeoutError::Disconnected => BridgeError::Stopped,
        })
    }

    /// Issue a command; the returned telegrams are already queued for the transport
    pub fn issue_command(&self, device_id: &str, call: CommandCall) -> Result<IssuedCommand, BridgeError> {
        self.request(|reply| BridgeRequest::Command {
            device_id: device_id.to_string(),
            call,
            reply,
        })?
    }

    pub fn snapshot(&self, device_id: &str) -> Result<Option<DeviceState>, BridgeError> {
        self.request(|reply| BridgeRequest::Snapshot {
            device_id: device_id.to_string(),
            reply,
        })
    }

    pub fn snapshots(&self) -> Result<Vec<DeviceState>, BridgeError> {
        self.request(|reply| BridgeRequest::Snapshots { reply })
    }

    pub fn connect_device(&self, device_id: &str, device_type: &str) -> Result<(), BridgeError> {
        Ok(self.request(|reply| BridgeRequest::Connect {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            reply,
        })??)
    }

    /// Tear a device down and return its final snapshot
    pub fn disconnect_device(&self, device_id: &str) -> Result<DeviceState, BridgeError> {
        Ok(self.request(|reply| BridgeRequest::Disconnect {
            device_id: device_id.to_string(),
            reply,
        })??)
    }

    pub fn stats(&self) -> Result<PipelineStats, BridgeError> {
        self.request(|reply| BridgeRequest::Stats { reply })
    }

    /// Load profile files over the built-ins and swap them in atomically
    pub fn reload_profiles(&self, paths: &[PathBuf]) -> Result<Vec<String>, BridgeError> {
        let set = ProfileSet::load(paths)?;
        let device_types = set.device_types();
        self.registry.replace(set);
        info!("🔄 Reloaded device profiles: {}", device_types.join(", "));
        Ok(device_types)
    }

    pub fn supported_commands(&self, device_type: &str) -> Result<Vec<String>, BridgeError> {
        Ok(self.registry.current().supported_commands(device_type)?)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The flag checked by both threads, for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

/// A running bridge over one transport
pub struct Bridge {
    handle: BridgeHandle,
    events: Receiver<DeviceEvent>,
    reader: Option<JoinHandle<ReaderStats>>,
    actor: Option<JoinHandle<(PipelineStats, u64)>>,
}

impl Bridge {
    /// Connect the configured devices and start the reader loop and store actor
    pub fn start<T: Transport + 'static>(
        transport: T,
        config: &AppConfig,
        registry: Arc<ProfileRegistry>,
    ) -> anyhow::Result<Self> {
        let bridge = &config.bridge;
        let (frame_tx, frame_rx) = bounded::<InboundFrame>(bridge.frame_queue_size.max(1));
        let (request_tx, request_rx) = bounded::<BridgeRequest>(bridge.command_queue_size.max(1));
        let (outbound_tx, outbound_rx) = bounded::<Vec<u8>>(bridge.outbound_queue_size.max(1));
        let (event_tx, event_rx) = bounded::<DeviceEvent>(bridge.event_queue_size.max(1));
        let running = Arc::new(AtomicBool::new(true));

        let mut pipeline = Pipeline::new(config.store.clone(), Arc::clone(&registry), bridge.unknown_frames);
        let mut publisher = EventPublisher::new(event_tx);
        let now = Utc::now();
        for device in &config.devices {
            let events = pipeline
                .store_mut()
                .connect(&device.id, &device.device_type, now)
                .with_context(|| format!("Failed to connect device {} ({})", device.id, device.device_type))?;
            publisher.publish(events);
        }

        info!("🚀 Starting bridge on {}", transport.describe());

        let reader = {
            let running = Arc::clone(&running);
            let read_timeout = bridge.read_timeout();
            let frame_timeout = bridge.request_timeout();
            thread::Builder::new()
                .name("reader-loop".to_string())
                .spawn(move || reader_loop(transport, frame_tx, outbound_rx, running, read_timeout, frame_timeout))
                .context("Failed to spawn reader loop")?
        };

        let actor = {
            let actor = StoreActor {
                pipeline,
                outbound: outbound_tx,
                publisher,
                running: Arc::clone(&running),
                tick_interval: bridge.tick_interval(),
                stats_interval: Duration::from_secs(bridge.stats_interval_seconds.max(1)),
            };
            thread::Builder::new()
                .name("store-actor".to_string())
                .spawn(move || actor.run(frame_rx, request_rx))
                .context("Failed to spawn store actor")?
        };

        Ok(Self {
            handle: BridgeHandle {
                requests: request_tx,
                registry,
                running,
                timeout: bridge.request_timeout(),
            },
            events: event_rx,
            reader: Some(reader),
            actor: Some(actor),
        })
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Published device events, in the order the store produced them
    pub fn events(&self) -> Receiver<DeviceEvent> {
        self.events.clone()
    }

    /// Wait for both threads; call [`BridgeHandle::shutdown`] first
    pub fn join(mut self) -> anyhow::Result<BridgeReport> {
        let reader = match self.reader.take() {
            Some(handle) => handle.join().map_err(|_| anyhow::anyhow!("Reader loop panicked"))?,
            None => ReaderStats::default(),
        };
        let (pipeline, events_dropped) = match self.actor.take() {
            Some(handle) => handle.join().map_err(|_| anyhow::anyhow!("Store actor panicked"))?,
            None => (PipelineStats::default(), 0),
        };
        Ok(BridgeReport {
            reader,
            pipeline,
            events_dropped,
        })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.actor.take() {
            let _ = handle.join();
        }
    }
}

/// Reader loop - transport lines to frames, queued telegrams to the transport
fn reader_loop<T: Transport>(
    mut transport: T,
    frames: Sender<InboundFrame>,
    outbound: Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
    frame_timeout: Duration,
) -> ReaderStats {
    let mut stats = ReaderStats::default();
    info!("📡 Reader loop started on {}", transport.describe());

    'outer: while running.load(Ordering::SeqCst) {
        loop {
            let telegram = match outbound.try_recv() {
                Ok(telegram) => telegram,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            };
            match transport.write(&telegram) {
                Ok(()) => stats.telegrams_written += 1,
                Err(e) if e.is_recoverable() => {
                    stats.write_errors += 1;
                    warn!("Dropping outgoing telegram: {}", e);
                }
                Err(e) => {
                    error!("Transport write failed: {}", e);
                    break 'outer;
                }
            }
        }

        let line = match transport.read_line(read_timeout) {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(TransportError::Framing(e)) => {
                stats.framing_errors += 1;
                warn!("Dropping malformed input: {}", e);
                continue;
            }
            Err(TransportError::Closed) => {
                info!("Transport closed");
                break;
            }
            Err(e) => {
                error!("Transport read failed: {}", e);
                break;
            }
        };
        stats.lines += 1;

        let frame = match decode_telegram(&line) {
            Ok(frame) => frame,
            Err(e) => {
                stats.framing_errors += 1;
                warn!("Dropping telegram {:?}: {}", String::from_utf8_lossy(&line), e);
                continue;
            }
        };

        let inbound = InboundFrame {
            frame,
            received_at: Utc::now(),
        };
        match frames.send_timeout(inbound, frame_timeout) {
            Ok(()) => stats.frames_forwarded += 1,
            Err(SendTimeoutError::Timeout(dropped)) => {
                stats.frames_dropped += 1;
                error!("Frame queue full, dropping {}! The store actor can't keep up.", dropped.frame);
            }
            Err(SendTimeoutError::Disconnected(_)) => break,
        }
    }

    info!(
        "📈 Reader final stats: {} lines, {} framing errors, {} frames forwarded, {} dropped, {} telegrams written",
        stats.lines, stats.framing_errors, stats.frames_forwarded, stats.frames_dropped, stats.telegrams_written
    );
    stats
}

/// Non-blocking event fan-out; a slow consumer loses events, never stalls the store
struct EventPublisher {
    events: Sender<DeviceEvent>,
    dropped: u64,
}

impl EventPublisher {
    fn new(events: Sender<DeviceEvent>) -> Self {
        Self { events, dropped: 0 }
    }

    fn publish(&mut self, events: Vec<DeviceEvent>) {
        for event in events {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.dropped += 1;
                    warn!("Event queue full, dropping {:?}", event);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

struct StoreActor {
    pipeline: Pipeline,
    outbound: Sender<Vec<u8>>,
    publisher: EventPublisher,
    running: Arc<AtomicBool>,
    tick_interval: Duration,
    stats_interval: Duration,
}

impl StoreActor {
    fn run(mut self, frames: Receiver<InboundFrame>, requests: Receiver<BridgeRequest>) -> (PipelineStats, u64) {
        let mut frames = frames;
        let mut last_tick = Instant::now();
        let mut last_stats = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let mut reader_gone = false;
            let mut requests_gone = false;
            select! {
                recv(frames) -> msg => match msg {
                    Ok(inbound) => {
                        let events = self.pipeline.process_frame(&inbound.frame, inbound.received_at);
                        self.publisher.publish(events);
                    }
                    Err(_) => reader_gone = true,
                },
                recv(requests) -> msg => match msg {
                    Ok(request) => self.handle(request),
                    Err(_) => requests_gone = true,
                },
                default(self.tick_interval) => {}
            }
            if requests_gone {
                break;
            }
            if reader_gone {
                warn!("Reader loop stopped, devices will time out");
                frames = never();
            }

            if last_tick.elapsed() >= self.tick_interval {
                let events = self.pipeline.tick(Utc::now());
                self.publisher.publish(events);
                last_tick = Instant::now();
            }

            if last_stats.elapsed() >= self.stats_interval {
                let stats = self.pipeline.stats();
                info!(
                    "📊 {} frames decoded, {} unknown, {} decode errors, {} commands ({} rejected)",
                    stats.frames_decoded,
                    stats.unknown_frames,
                    stats.decode_errors,
                    stats.commands_issued,
                    stats.commands_rejected
                );
                last_stats = Instant::now();
            }
        }

        let stats = self.pipeline.stats();
        info!(
            "📈 Store final stats: {} frames decoded, {} unknown, {} stale, {} commands issued, {} events dropped",
            stats.frames_decoded, stats.unknown_frames, stats.stale_updates, stats.commands_issued, self.publisher.dropped
        );
        (stats, self.publisher.dropped)
    }

    fn handle(&mut self, request: BridgeRequest) {
        let now = Utc::now();
        // A failed reply send means the issuer gave up waiting
        match request {
            BridgeRequest::Command { device_id, call, reply } => {
                let result = self.issue(&device_id, &call, now);
                let _ = reply.send(result);
            }
            BridgeRequest::Snapshot { device_id, reply } => {
                let _ = reply.send(self.pipeline.store().snapshot(&device_id));
            }
            BridgeRequest::Snapshots { reply } => {
                let _ = reply.send(self.pipeline.store().snapshots());
            }
            BridgeRequest::Connect {
                device_id,
                device_type,
                reply,
            } => {
                let result = self.pipeline.store_mut().connect(&device_id, &device_type, now).map(|events| {
                    self.publisher.publish(events);
                });
                let _ = reply.send(result);
            }
            BridgeRequest::Disconnect { device_id, reply } => {
                let result = self
                    .pipeline
                    .store_mut()
                    .disconnect(&device_id, now)
                    .map(|(state, events)| {
                        self.publisher.publish(events);
                        state
                    });
                let _ = reply.send(result);
            }
            BridgeRequest::Stats { reply } => {
                let _ = reply.send(self.pipeline.stats());
            }
        }
    }

    fn issue(&mut self, device_id: &str, call: &CommandCall, now: DateTime<Utc>) -> Result<IssuedCommand, BridgeError> {
        let issued = self.pipeline.issue_call(device_id, call, now)?;
        match self.outbound.try_send(issued.wire.clone()) {
            Ok(()) => {
                debug!("Queued command #{} {} for {}", issued.command_id, issued.command, device_id);
                Ok(issued)
            }
            Err(_) => {
                // never sent, so the deadline must not count it as a device timeout
                self.pipeline.abort_command(device_id, issued.command_id);
                Err(BridgeError::OutboundFull(issued.command_id))
            }
        }
    }
}
