/*!
Byte-stream transports feeding the reader loop.

A [`Transport`] hands out complete telegram lines and accepts raw outgoing
bytes. Two implementations:

- [`TcpBridgeTransport`] talks to a serial-over-TCP bridge. A tokio runtime
  on its own thread owns the socket; received chunks come back over a
  bounded crossbeam channel and go through a [`TelegramAssembler`].
- [`SimulatedArmTransport`] is a synthetic `deep_arm` for debug mode. It
  emits periodic status telegrams and echoes joint commands as feedback.
*/

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use shared::profiles::DEEP_ARM;
use shared::signal::{decode_frame, encode_frame, DecodeOutcome};
use shared::{
    decode_telegram, encode_telegram, CanFrame, CatalogError, DeviceProfile, FramingError, MessageCatalog,
    SignalValues, TelegramAssembler,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;

#[derive(Error, Debug)]
pub enum TransportError {
    /// A line was discarded; the stream itself is fine
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Outgoing queue is full")]
    Backpressure,

    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when the reader loop can keep going
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::Backpressure)
    }
}

/// Line-oriented byte stream to the device link
pub trait Transport: Send {
    /// Next complete line, terminator included; `None` when nothing arrived within `timeout`
    fn read_line(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Human readable endpoint name for logs
    fn describe(&self) -> String;
}

/// Serial-over-TCP bridge connection
pub struct TcpBridgeTransport {
    address: String,
    inbound: Receiver<Bytes>,
    outbound: mpsc::Sender<Vec<u8>>,
    assembler: TelegramAssembler,
    running: Arc<AtomicBool>,
    io_thread: Option<JoinHandle<()>>,
}

impl TcpBridgeTransport {
    /// Connect and start the socket thread
    pub fn connect(config: &BridgeConfig) -> Result<Self, TransportError> {
        let address = config.address();
        let (inbound_tx, inbound_rx) = bounded::<Bytes>(config.frame_queue_size.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(config.outbound_queue_size.max(1));
        let (ready_tx, ready_rx) = bounded::<std::io::Result<()>>(1);
        let running = Arc::new(AtomicBool::new(true));

        let running_io = Arc::clone(&running);
        let io_address = address.clone();
        let recv_buffer_bytes = config.recv_buffer_bytes;

        let io_thread = thread::spawn(move || {
            let rt = match Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            rt.block_on(async {
                let stream = match Self::open(&io_address, recv_buffer_bytes).await {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                match Self::socket_task(stream, inbound_tx, outbound_rx, running_io).await {
                    Ok(_) => info!("Bridge socket task finished"),
                    Err(e) => error!("Bridge socket task failed: {}", e),
                }
            });
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = io_thread.join();
                return Err(TransportError::Io(e));
            }
            Err(_) => return Err(TransportError::Closed),
        }

        info!("🔌 Connected to serial bridge at {}", address);
        Ok(Self {
            address,
            inbound: inbound_rx,
            outbound: outbound_tx,
            assembler: TelegramAssembler::new(),
            running,
            io_thread: Some(io_thread),
        })
    }

    async fn open(address: &str, recv_buffer_bytes: usize) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;

        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_keepalive(true)?;
        sock_ref.set_recv_buffer_size(recv_buffer_bytes)?;
        debug!("Socket receive buffer set to {} bytes", recv_buffer_bytes);

        Ok(stream)
    }

    /// Pump bytes between the socket and the channels until closed or stopped
    async fn socket_task(
        stream: TcpStream,
        inbound: crossbeam_channel::Sender<Bytes>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = vec![0u8; 4096];
        let mut total_bytes = 0u64;
        let mut dropped_chunks = 0u64;

        while running.load(Ordering::SeqCst) {
            tokio::select! {
                received = reader.read(&mut buffer) => {
                    let n = received?;
                    if n == 0 {
                        info!("Serial bridge closed the connection");
                        break;
                    }
                    total_bytes += n as u64;
                    if inbound.try_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                        error!("Inbound channel full, dropping {} bytes! The reader loop can't keep up.", n);
                        dropped_chunks += 1;
                    }
                }
                outgoing = outbound.recv() => {
                    match outgoing {
                        Some(bytes) => writer.write_all(&bytes).await?,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    // Timeout - loop around to check the running flag
                }
            }
        }

        info!("📈 Socket final stats: {} bytes received, {} chunks dropped", total_bytes, dropped_chunks);
        Ok(())
    }
}

impl Transport for TcpBridgeTransport {
    fn read_line(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.assembler.next_line() {
                return Ok(Some(line?.to_vec()));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.inbound.recv_timeout(remaining) {
                Ok(chunk) => self.assembler.push(&chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.outbound.try_send(bytes.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

impl Drop for TcpBridgeTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                error!("Bridge socket thread panicked");
            }
        }
    }
}

const ARM_STATUS: u32 = 0x110;
const END_EFFECTOR_POSE: u32 = 0x111;
const JOINT_TARGETS: u32 = 0x101;
const ARM_CONTROL: u32 = 0x102;
const RESET_COMMAND: f64 = 255.0;

/// Synthetic `deep_arm` speaking the telegram protocol
pub struct SimulatedArmTransport {
    catalog: MessageCatalog,
    joints: [f64; 6],
    heartbeat: u8,
    status_count: u64,
    status_interval: Duration,
    next_status: Instant,
    pending: VecDeque<Vec<u8>>,
    assembler: TelegramAssembler,
}

impl SimulatedArmTransport {
    pub fn new() -> Result<Self, CatalogError> {
        Ok(Self {
            catalog: DeviceProfile::deep_arm()?.catalog,
            joints: [90.0; 6],
            heartbeat: 0,
            status_count: 0,
            status_interval: Duration::from_millis(200),
            next_status: Instant::now(),
            pending: VecDeque::new(),
            assembler: TelegramAssembler::new(),
        })
    }

    /// Interval between status telegrams
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    #[cfg(test)]
    fn joint(&self, joint: usize) -> Option<f64> {
        self.joints.get(joint).copied()
    }

    fn queue(&mut self, id: u32, values: SignalValues) {
        match encode_frame(&self.catalog, id, &values) {
            Ok(frame) => self.pending.push_back(encode_telegram(&frame)),
            Err(e) => warn!("🧪 Simulated arm cannot encode 0x{:X}: {}", id, e),
        }
    }

    fn queue_joint(&mut self, joint: usize) {
        let values: SignalValues = [(format!("Joint{}Angle", joint + 1), self.joints[joint])].into();
        self.queue(joint as u32 + 1, values);
    }

    /// Status, pose and one joint's feedback, round robin
    fn queue_status(&mut self) {
        let phase = self.status_count as f64 * 0.1;
        self.heartbeat = self.heartbeat.wrapping_add(1);

        let status: SignalValues = [
            ("Temperature".to_string(), ((35.0 + 5.0 * phase.sin()) * 10.0).round() / 10.0),
            ("StatusCode".to_string(), 0.0),
            ("Heartbeat".to_string(), self.heartbeat as f64),
        ]
        .into();
        self.queue(ARM_STATUS, status);

        let reach = 300.0 + self.joints[1] - self.joints[2];
        let pose: SignalValues = [
            ("PoseX".to_string(), (reach * self.joints[0].to_radians().cos() * 10.0).round() / 10.0),
            ("PoseY".to_string(), (reach * self.joints[0].to_radians().sin() * 10.0).round() / 10.0),
            ("PoseZ".to_string(), 150.0),
        ]
        .into();
        self.queue(END_EFFECTOR_POSE, pose);

        self.queue_joint((self.status_count % 6) as usize);
        self.status_count += 1;
    }

    fn apply_command(&mut self, frame: &CanFrame) {
        let decoded = match decode_frame(&self.catalog, frame) {
            Ok(DecodeOutcome::Decoded(decoded)) => decoded,
            Ok(DecodeOutcome::Unknown(frame)) => {
                debug!("🧪 Simulated arm ignores {}", frame);
                return;
            }
            Err(e) => {
                warn!("🧪 Simulated arm rejects {}: {}", frame, e);
                return;
            }
        };

        match decoded.arbitration_id {
            id @ 1..=6 => {
                let joint = id as usize - 1;
                if let Some(&angle) = decoded.signals.get(&format!("Joint{}Angle", id)) {
                    self.joints[joint] = angle;
                    self.queue_joint(joint);
                }
            }
            JOINT_TARGETS => {
                for joint in 0..6 {
                    if let Some(&angle) = decoded.signals.get(&format!("Target{}", joint + 1)) {
                        self.joints[joint] = angle;
                        self.queue_joint(joint);
                    }
                }
            }
            ARM_CONTROL if decoded.signals.get("ResetCommand") == Some(&RESET_COMMAND) => {
                info!("🧪 Simulated arm reset");
                self.joints = [90.0; 6];
                self.heartbeat = 0;
            }
            id => debug!("🧪 Simulated arm has no handler for 0x{:X}", id),
        }
    }
}

impl Transport for SimulatedArmTransport {
    fn read_line(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }

        let now = Instant::now();
        if now < self.next_status {
            let wait = self.next_status - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }

        self.queue_status();
        self.next_status = Instant::now() + self.status_interval;
        Ok(self.pending.pop_front())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.assembler.push(bytes);
        while let Some(line) = self.assembler.next_line() {
            let frame = decode_telegram(&line?)?;
            debug!("🧪 Simulated arm received {}", frame);
            self.apply_command(&frame);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulated {}", DEEP_ARM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn read_until_line(transport: &mut impl Transport) -> Vec<u8> {
        for _ in 0..100 {
            if let Some(line) = transport.read_line(Duration::from_millis(50)).unwrap() {
                return line;
            }
        }
        panic!("no line within 5 seconds");
    }

    #[test]
    fn test_tcp_transport_reads_split_lines_and_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(b"AT00000001").unwrap();
            socket.flush().unwrap();
            thread::sleep(Duration::from_millis(50));
            socket.write_all(b"04AABBCCDD\r\nAT00000001").unwrap();
            socket.write_all(b"0114\r\n").unwrap();

            let mut received = [0u8; 16];
            socket.read_exact(&mut received).unwrap();
            received.to_vec()
        });

        let config = BridgeConfig {
            port,
            ..BridgeConfig::default()
        };
        let mut transport = TcpBridgeTransport::connect(&config).unwrap();
        assert_eq!(transport.describe(), format!("tcp://127.0.0.1:{}", port));

        assert_eq!(read_until_line(&mut transport), b"AT0000000104AABBCCDD\r\n");
        assert_eq!(read_until_line(&mut transport), b"AT000000010114\r\n");

        transport.write(b"AT00000001011E\r\n").unwrap();
        assert_eq!(server.join().unwrap(), b"AT00000001011E\r\n");
    }

    #[test]
    fn test_tcp_transport_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });

        let config = BridgeConfig {
            port,
            ..BridgeConfig::default()
        };
        let mut transport = TcpBridgeTransport::connect(&config).unwrap();
        server.join().unwrap();

        let mut result = Ok(None);
        for _ in 0..100 {
            result = transport.read_line(Duration::from_millis(50));
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[test]
    fn test_tcp_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = BridgeConfig {
            port,
            ..BridgeConfig::default()
        };
        assert!(matches!(TcpBridgeTransport::connect(&config), Err(TransportError::Io(_))));
    }

    #[test]
    fn test_simulated_arm_emits_status_first() {
        let mut arm = SimulatedArmTransport::new().unwrap();
        let line = arm.read_line(Duration::from_millis(10)).unwrap().unwrap();
        let frame = decode_telegram(&line).unwrap();
        assert_eq!(frame.arbitration_id(), ARM_STATUS);

        let pose = decode_telegram(&arm.read_line(Duration::from_millis(10)).unwrap().unwrap()).unwrap();
        assert_eq!(pose.arbitration_id(), END_EFFECTOR_POSE);
        let joint = decode_telegram(&arm.read_line(Duration::from_millis(10)).unwrap().unwrap()).unwrap();
        assert_eq!(joint.arbitration_id(), 0x1);
    }

    #[test]
    fn test_simulated_arm_is_quiet_between_statuses() {
        let mut arm = SimulatedArmTransport::new()
            .unwrap()
            .with_status_interval(Duration::from_secs(60));
        for _ in 0..3 {
            arm.read_line(Duration::from_millis(10)).unwrap();
        }
        assert_eq!(arm.read_line(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_simulated_arm_echoes_joint_commands() {
        let mut arm = SimulatedArmTransport::new()
            .unwrap()
            .with_status_interval(Duration::from_secs(60));
        for _ in 0..3 {
            arm.read_line(Duration::from_millis(10)).unwrap();
        }

        arm.write(b"AT00000001011E\r\n").unwrap();
        assert_eq!(arm.joint(0), Some(30.0));
        assert_eq!(arm.read_line(Duration::from_millis(10)).unwrap().unwrap(), b"AT00000001011E\r\n");

        arm.write(b"AT0000010206").unwrap();
        arm.write(b"0A141E28323C\r\n").unwrap();
        assert_eq!(arm.joint(5), Some(60.0));
        let mut echoes = 0;
        while arm.read_line(Duration::from_millis(10)).unwrap().is_some() {
            echoes += 1;
        }
        assert_eq!(echoes, 6);

        arm.write(b"AT0000010201FF\r\n").unwrap();
        assert_eq!(arm.joint(0), Some(90.0));
    }

    #[test]
    fn test_simulated_arm_rejects_garbage() {
        let mut arm = SimulatedArmTransport::new().unwrap();
        assert!(matches!(
            arm.write(b"AT0000000103AABBCCDD\r\n"),
            Err(TransportError::Framing(FramingError::LengthMismatch { .. }))
        ));
    }
}
