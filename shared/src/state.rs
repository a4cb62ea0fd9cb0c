/*!
Device State Store: sole owner of per-device state.

Each connected device has one entry holding its [`DeviceState`] snapshot
and the bookkeeping behind the connection state machine:

```text
Disconnected → Connecting → Connected ⇄ Degraded → Disconnected
```

- `Connecting → Connected` on the first uplink update
- `Connected → Degraded` on a validation warning streak above the threshold,
  on repeated command timeouts or on one missed heartbeat window
- `Degraded → Connected` on a clean uplink update
- `Connecting | Degraded → Disconnected` once `max_missed_heartbeats`
  windows pass without a telegram, or on explicit disconnect

Callers only ever receive cloned snapshots. Anomalies are reported as
[`DeviceEvent`]s, never as errors.
*/

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::can::CanFrame;
use crate::error::SharedError;
use crate::profiles::ProfileRegistry;
use crate::semantic::{Bounds, CommandArgs, CommandError, SemanticUpdate};
use crate::telegram::encode_telegram;

/// Pseudo-field used for anomalies raised by connection transitions
pub const CONNECTION_FIELD: &str = "connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectionStatus {
    /// True for every state except `Disconnected`
    pub fn is_active(self) -> bool {
        self != Self::Disconnected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

/// Last known value of a business field
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldValue {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Immutable snapshot of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub device_id: String,
    pub device_type: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
    /// Timestamp of the newest applied uplink update
    pub last_update: Option<DateTime<Utc>>,
    /// Incremented on every mutation of this snapshot
    pub generation: u64,
}

impl DeviceState {
    pub fn value(&self, field: &str) -> Option<f64> {
        self.fields.get(field).map(|f| f.value)
    }
}

/// Physical limits checked on every changed field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRule {
    pub field: String,
    /// Safe operating range
    #[serde(default)]
    pub safe: Option<Bounds>,
    /// Largest plausible change per second
    #[serde(default)]
    pub max_rate_per_sec: Option<f64>,
    #[serde(default)]
    pub severity: Severity,
}

impl AnomalyRule {
    pub fn safe(field: impl Into<String>, min: f64, max: f64, severity: Severity) -> Self {
        Self {
            field: field.into(),
            safe: Some(Bounds::new(min, max)),
            max_rate_per_sec: None,
            severity,
        }
    }

    pub fn rate(field: impl Into<String>, max_rate_per_sec: f64, severity: Severity) -> Self {
        Self {
            field: field.into(),
            safe: None,
            max_rate_per_sec: Some(max_rate_per_sec),
            severity,
        }
    }
}

/// Store tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Consecutive updates with validation warnings tolerated before degrading
    pub warning_streak_threshold: u32,
    /// Expected telegram interval per device
    pub heartbeat_window_ms: u64,
    /// Missed windows before a device is declared disconnected
    pub max_missed_heartbeats: u32,
    pub command_timeout_ms: u64,
    /// Consecutive command timeouts before degrading
    pub timeout_degrade_threshold: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            warning_streak_threshold: 3,
            heartbeat_window_ms: 1000,
            max_missed_heartbeats: 3,
            command_timeout_ms: 500,
            timeout_degrade_threshold: 2,
        }
    }
}

impl StoreConfig {
    pub fn heartbeat_window(&self) -> Duration {
        millis(self.heartbeat_window_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        millis(self.command_timeout_ms)
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Everything the store reports to consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Fields whose value changed, with their new values
    StateChanged {
        device_id: String,
        fields: BTreeMap<String, f64>,
        timestamp: DateTime<Utc>,
    },
    AnomalyDetected {
        device_id: String,
        field: String,
        severity: Severity,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    ConnectionChanged {
        device_id: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
        timestamp: DateTime<Utc>,
    },
    CommandTimedOut {
        device_id: String,
        command_id: u64,
        command: String,
        timestamp: DateTime<Utc>,
    },
    /// Frame no catalog knows, forwarded untranslated
    UnknownFrame { frame: CanFrame, timestamp: DateTime<Utc> },
}

impl DeviceEvent {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::StateChanged { device_id, .. }
            | Self::AnomalyDetected { device_id, .. }
            | Self::ConnectionChanged { device_id, .. }
            | Self::CommandTimedOut { device_id, .. } => Some(device_id),
            Self::UnknownFrame { .. } => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Unknown device {0}")]
    UnknownDevice(String),

    #[error("No profile for device type {0}")]
    UnknownDeviceType(String),

    #[error("Device {device_id} is already {status}")]
    AlreadyConnected { device_id: String, status: ConnectionStatus },

    #[error("Device {device_id} is {status}")]
    NotConnected { device_id: String, status: ConnectionStatus },

    #[error("Device {device_id} is busy with command {command} (#{command_id})")]
    CommandBusy { device_id: String, command: String, command_id: u64 },

    #[error("Update for {device_id} at {timestamp} is older than {last_update}")]
    StaleUpdate {
        device_id: String,
        timestamp: DateTime<Utc>,
        last_update: DateTime<Utc>,
    },
}

/// Wire-ready result of a successful command
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCommand {
    pub command_id: u64,
    pub device_id: String,
    pub command: String,
    pub frames: Vec<CanFrame>,
    /// Concatenated telegrams for the transport
    pub wire: Vec<u8>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct InFlight {
    command_id: u64,
    command: String,
    ack_message: Option<u32>,
    deadline: DateTime<Utc>,
}

#[derive(Debug)]
struct DeviceEntry {
    state: DeviceState,
    /// Last telegram, or the connect time before the first one
    last_seen: DateTime<Utc>,
    warning_streak: u32,
    consecutive_timeouts: u32,
    in_flight: Option<InFlight>,
    /// `(source_message, timestamp)` of the last applied update
    last_applied: Option<(Option<u32>, DateTime<Utc>)>,
}

impl DeviceEntry {
    /// Move to `to`, returning the transition event and, for degradations, its anomaly
    fn transition(&mut self, to: ConnectionStatus, reason: &str, now: DateTime<Utc>) -> Vec<DeviceEvent> {
        let from = self.state.connection_status;
        if from == to {
            return Vec::new();
        }

        self.state.connection_status = to;
        self.state.generation += 1;
        let device_id = self.state.device_id.clone();

        let mut events = vec![DeviceEvent::ConnectionChanged {
            device_id: device_id.clone(),
            from,
            to,
            timestamp: now,
        }];

        let severity = match to {
            ConnectionStatus::Degraded => Some(Severity::Warning),
            ConnectionStatus::Disconnected => Some(Severity::Critical),
            _ => None,
        };
        if let Some(severity) = severity {
            warn!("Device {} {} -> {}: {}", device_id, from, to, reason);
            self.state.last_error = Some(reason.to_string());
            events.push(DeviceEvent::AnomalyDetected {
                device_id,
                field: CONNECTION_FIELD.to_string(),
                severity,
                detail: reason.to_string(),
                timestamp: now,
            });
        } else {
            info!("Device {} {} -> {}", device_id, from, to);
        }

        if to == ConnectionStatus::Disconnected {
            self.in_flight = None;
        }
        events
    }
}

/// Owner of every device's state; all mutations go through `&mut self`
#[derive(Debug)]
pub struct DeviceStateStore {
    config: StoreConfig,
    registry: Arc<ProfileRegistry>,
    devices: BTreeMap<String, DeviceEntry>,
    next_command_id: u64,
}

impl DeviceStateStore {
    pub fn new(config: StoreConfig, registry: Arc<ProfileRegistry>) -> Self {
        Self {
            config,
            registry,
            devices: BTreeMap::new(),
            next_command_id: 1,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    /// Start a fresh connection attempt
    pub fn connect(
        &mut self,
        device_id: &str,
        device_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeviceEvent>, StoreError> {
        if self.registry.get(device_type).is_none() {
            return Err(StoreError::UnknownDeviceType(device_type.to_string()));
        }
        if let Some(existing) = self.devices.get(device_id) {
            let status = existing.state.connection_status;
            if status.is_active() {
                return Err(StoreError::AlreadyConnected {
                    device_id: device_id.to_string(),
                    status,
                });
            }
        }

        let mut entry = DeviceEntry {
            state: DeviceState {
                device_id: device_id.to_string(),
                device_type: device_type.to_string(),
                fields: BTreeMap::new(),
                connection_status: ConnectionStatus::Disconnected,
                last_error: None,
                last_update: None,
                generation: 0,
            },
            last_seen: now,
            warning_streak: 0,
            consecutive_timeouts: 0,
            in_flight: None,
            last_applied: None,
        };
        let events = entry.transition(ConnectionStatus::Connecting, "link established", now);
        self.devices.insert(device_id.to_string(), entry);
        Ok(events)
    }

    /// Tear a device down, returning its final snapshot
    pub fn disconnect(
        &mut self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(DeviceState, Vec<DeviceEvent>), StoreError> {
        let mut entry = self
            .devices
            .remove(device_id)
            .ok_or_else(|| StoreError::UnknownDevice(device_id.to_string()))?;

        let mut events = Vec::new();
        if entry.state.connection_status.is_active() {
            let from = entry.state.connection_status;
            entry.state.connection_status = ConnectionStatus::Disconnected;
            entry.state.generation += 1;
            events.push(DeviceEvent::ConnectionChanged {
                device_id: device_id.to_string(),
                from,
                to: ConnectionStatus::Disconnected,
                timestamp: now,
            });
            info!("Device {} disconnected", device_id);
        }
        Ok((entry.state, events))
    }

    /// Merge business fields into the device snapshot
    pub fn apply_uplink_update(
        &mut self,
        device_id: &str,
        update: &SemanticUpdate,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<DeviceEvent>, StoreError> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::UnknownDevice(device_id.to_string()))?;

        let status = entry.state.connection_status;
        if !status.is_active() {
            return Err(StoreError::NotConnected {
                device_id: device_id.to_string(),
                status,
            });
        }
        if let Some(last_update) = entry.state.last_update {
            if timestamp < last_update {
                return Err(StoreError::StaleUpdate {
                    device_id: device_id.to_string(),
                    timestamp,
                    last_update,
                });
            }
        }

        // a field-less update carries nothing to compare, so its identity is its source and time
        let duplicate = if update.fields.is_empty() {
            entry.last_applied == Some((update.source_message, timestamp))
        } else {
            update.fields.iter().all(|(field, value)| {
                entry.state.fields.get(field) == Some(&FieldValue { value: *value, timestamp })
            })
        };
        if duplicate {
            debug!("Ignoring duplicate update for {} at {}", device_id, timestamp);
            return Ok(Vec::new());
        }

        let profile = self.registry.get(&entry.state.device_type);
        let anomaly_rules = profile.as_ref().map(|p| p.anomalies.as_slice()).unwrap_or(&[]);

        let mut events = Vec::new();
        let mut changed = BTreeMap::new();
        let mut anomalies = Vec::new();

        for (field, &value) in &update.fields {
            let previous = entry.state.fields.get(field).copied();
            if previous.map(|p| p.value) != Some(value) {
                changed.insert(field.clone(), value);
            }

            for rule in anomaly_rules.iter().filter(|r| &r.field == field) {
                if let Some(safe) = rule.safe {
                    let was_safe = previous.map_or(true, |p| safe.contains(p.value));
                    if !safe.contains(value) && was_safe {
                        anomalies.push((rule.severity, field.clone(), format!("{} outside safe range {}", value, safe)));
                    }
                }
                if let (Some(limit), Some(previous)) = (rule.max_rate_per_sec, previous) {
                    let elapsed = (timestamp - previous.timestamp).num_microseconds().unwrap_or(i64::MAX);
                    if elapsed > 0 {
                        let rate = (value - previous.value).abs() / (elapsed as f64 / 1e6);
                        if rate > limit {
                            anomalies.push((
                                rule.severity,
                                field.clone(),
                                format!("changing at {:.1}/s, limit {}/s", rate, limit),
                            ));
                        }
                    }
                }
            }

            entry.state.fields.insert(field.clone(), FieldValue { value, timestamp });
        }

        for warning in &update.warnings {
            anomalies.push((Severity::Warning, warning.field.clone(), warning.to_string()));
        }

        entry.state.last_update = Some(timestamp);
        entry.state.generation += 1;
        entry.last_applied = Some((update.source_message, timestamp));
        if timestamp > entry.last_seen {
            entry.last_seen = timestamp;
        }

        if !changed.is_empty() {
            events.push(DeviceEvent::StateChanged {
                device_id: device_id.to_string(),
                fields: changed,
                timestamp,
            });
        }
        for (severity, field, detail) in anomalies {
            debug!("Anomaly on {}.{}: {}", device_id, field, detail);
            events.push(DeviceEvent::AnomalyDetected {
                device_id: device_id.to_string(),
                field,
                severity,
                detail,
                timestamp,
            });
        }

        if let Some(in_flight) = &entry.in_flight {
            if in_flight.ack_message.is_none() || in_flight.ack_message == update.source_message {
                debug!("Command #{} on {} acknowledged", in_flight.command_id, device_id);
                entry.in_flight = None;
                entry.consecutive_timeouts = 0;
            }
        }

        if update.warnings.is_empty() {
            entry.warning_streak = 0;
        } else {
            entry.warning_streak += 1;
        }

        match entry.state.connection_status {
            ConnectionStatus::Connecting => {
                events.extend(entry.transition(ConnectionStatus::Connected, "first telegram", timestamp));
            }
            ConnectionStatus::Connected if entry.warning_streak > self.config.warning_streak_threshold => {
                let reason = format!("{} consecutive updates with validation warnings", entry.warning_streak);
                events.extend(entry.transition(ConnectionStatus::Degraded, &reason, timestamp));
            }
            ConnectionStatus::Degraded if update.warnings.is_empty() => {
                events.extend(entry.transition(ConnectionStatus::Connected, "clean telegram", timestamp));
            }
            _ => {}
        }

        Ok(events)
    }

    /// Resolve and encode a command; at most one command per device is in flight
    pub fn issue_command(
        &mut self,
        device_id: &str,
        command: &str,
        args: &CommandArgs,
        now: DateTime<Utc>,
    ) -> Result<IssuedCommand, SharedError> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| StoreError::UnknownDevice(device_id.to_string()))?;

        let status = entry.state.connection_status;
        if !matches!(status, ConnectionStatus::Connected | ConnectionStatus::Degraded) {
            return Err(StoreError::NotConnected {
                device_id: device_id.to_string(),
                status,
            }
            .into());
        }
        if let Some(in_flight) = &entry.in_flight {
            return Err(StoreError::CommandBusy {
                device_id: device_id.to_string(),
                command: in_flight.command.clone(),
                command_id: in_flight.command_id,
            }
            .into());
        }

        let device_type = &entry.state.device_type;
        let profile = self
            .registry
            .get(device_type)
            .ok_or_else(|| CommandError::UnknownDeviceType(device_type.clone()))?;
        let resolved = profile.rules.resolve_command(device_type, command, args)?;
        let frames = resolved.encode(&profile.catalog)?;
        let wire: Vec<u8> = frames.iter().flat_map(encode_telegram).collect();

        let command_id = self.next_command_id;
        self.next_command_id += 1;
        let deadline = now + self.config.command_timeout();

        entry.in_flight = Some(InFlight {
            command_id,
            command: resolved.name.clone(),
            ack_message: resolved.ack_message,
            deadline,
        });

        debug!(
            "Command #{} {} for {}: {}",
            command_id,
            command,
            device_id,
            String::from_utf8_lossy(&wire).trim_end()
        );

        Ok(IssuedCommand {
            command_id,
            device_id: device_id.to_string(),
            command: resolved.name,
            frames,
            wire,
            deadline,
        })
    }

    /// Watchdog: expire command deadlines, then count missed heartbeat windows
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<DeviceEvent> {
        let window_ms = self.config.heartbeat_window().num_milliseconds().max(1);
        let max_missed = i64::from(self.config.max_missed_heartbeats.max(1));
        let mut events = Vec::new();

        for (device_id, entry) in self.devices.iter_mut() {
            if !entry.state.connection_status.is_active() {
                continue;
            }

            let expired = entry.in_flight.as_ref().is_some_and(|f| f.deadline <= now);
            let timed_out = if expired { entry.in_flight.take() } else { None };
            if let Some(in_flight) = timed_out {
                entry.consecutive_timeouts += 1;
                entry.state.last_error = Some(format!("command {} timed out", in_flight.command));
                entry.state.generation += 1;
                warn!(
                    "Command #{} {} on {} timed out ({} in a row)",
                    in_flight.command_id, in_flight.command, device_id, entry.consecutive_timeouts
                );
                events.push(DeviceEvent::CommandTimedOut {
                    device_id: device_id.clone(),
                    command_id: in_flight.command_id,
                    command: in_flight.command,
                    timestamp: now,
                });

                if entry.state.connection_status == ConnectionStatus::Connected
                    && entry.consecutive_timeouts >= self.config.timeout_degrade_threshold
                {
                    let reason = format!("{} consecutive command timeouts", entry.consecutive_timeouts);
                    events.extend(entry.transition(ConnectionStatus::Degraded, &reason, now));
                }
            }

            let silent_ms = (now - entry.last_seen).num_milliseconds();
            let missed = silent_ms / window_ms;
            if missed < 1 {
                continue;
            }

            let reason = format!("no telegram for {} ms", silent_ms);
            if entry.state.connection_status == ConnectionStatus::Connected {
                events.extend(entry.transition(ConnectionStatus::Degraded, &reason, now));
            }
            if missed >= max_missed
                && matches!(
                    entry.state.connection_status,
                    ConnectionStatus::Degraded | ConnectionStatus::Connecting
                )
            {
                events.extend(entry.transition(ConnectionStatus::Disconnected, &reason, now));
            }
        }

        events
    }

    /// Free the in-flight slot for a command that never reached the device.
    /// Unlike a deadline expiry this does not count towards degradation.
    pub fn abort_command(&mut self, device_id: &str, command_id: u64) -> bool {
        let Some(entry) = self.devices.get_mut(device_id) else {
            return false;
        };
        if entry.in_flight.as_ref().map(|f| f.command_id) != Some(command_id) {
            return false;
        }
        if let Some(in_flight) = entry.in_flight.take() {
            warn!("Command #{} {} on {} aborted before sending", command_id, in_flight.command, device_id);
        }
        true
    }

    /// Record a per-device error that did not produce an update
    pub fn record_error(&mut self, device_id: &str, error: impl Into<String>) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.state.last_error = Some(error.into());
            entry.state.generation += 1;
        }
    }

    pub fn snapshot(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.get(device_id).map(|e| e.state.clone())
    }

    /// Snapshots of every known device, ordered by device id
    pub fn snapshots(&self) -> Vec<DeviceState> {
        self.devices.values().map(|e| e.state.clone()).collect()
    }

    pub fn device_type(&self, device_id: &str) -> Option<&str> {
        self.devices.get(device_id).map(|e| e.state.device_type.as_str())
    }

    /// `(device_id, device_type)` of every registered device, disconnected ones included
    pub fn registered_devices(&self) -> Vec<(String, String)> {
        self.devices
            .values()
            .map(|e| (e.state.device_id.clone(), e.state.device_type.clone()))
            .collect()
    }

    /// Id of the command currently in flight for a device
    pub fn pending_command(&self, device_id: &str) -> Option<u64> {
        self.devices
            .get(device_id)
            .and_then(|e| e.in_flight.as_ref())
            .map(|f| f.command_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{ProfileSet, DEEP_ARM, DEEP_MOTOR};
    use crate::semantic::ValidationWarning;
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn store() -> DeviceStateStore {
        let registry = Arc::new(ProfileRegistry::new(ProfileSet::builtin().unwrap()));
        DeviceStateStore::new(StoreConfig::default(), registry)
    }

    fn update(source: u32, fields: &[(&str, f64)]) -> SemanticUpdate {
        SemanticUpdate {
            fields: fields.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            warnings: Vec::new(),
            source_message: Some(source),
        }
    }

    fn warned(source: u32, field: &str, value: f64) -> SemanticUpdate {
        let mut update = update(source, &[(field, value)]);
        update.warnings.push(ValidationWarning {
            field: field.to_string(),
            value,
            bounds: Bounds::new(0.0, 100.0),
        });
        update
    }

    fn connected(store: &mut DeviceStateStore, device_id: &str) {
        store.connect(device_id, DEEP_ARM, t(0)).unwrap();
        store.apply_uplink_update(device_id, &update(0x1, &[("joint1_angle", 0.0)]), t(0)).unwrap();
    }

    fn anomalies(events: &[DeviceEvent]) -> Vec<(&str, Severity)> {
        events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::AnomalyDetected { field, severity, .. } => Some((field.as_str(), *severity)),
                _ => None,
            })
            .collect()
    }

    fn transitions(events: &[DeviceEvent]) -> Vec<(ConnectionStatus, ConnectionStatus)> {
        events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::ConnectionChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_and_first_update() {
        let mut store = store();
        let events = store.connect("arm-1", DEEP_ARM, t(0)).unwrap();
        assert_eq!(
            transitions(&events),
            vec![(ConnectionStatus::Disconnected, ConnectionStatus::Connecting)]
        );

        let events = store
            .apply_uplink_update("arm-1", &update(0x1, &[("joint1_angle", 170.0)]), t(10))
            .unwrap();
        assert_eq!(
            transitions(&events),
            vec![(ConnectionStatus::Connecting, ConnectionStatus::Connected)]
        );
        assert!(matches!(
            &events[0],
            DeviceEvent::StateChanged { fields, .. } if fields["joint1_angle"] == 170.0
        ));

        let state = store.snapshot("arm-1").unwrap();
        assert_eq!(state.value("joint1_angle"), Some(170.0));
        assert_eq!(state.fields["joint1_angle"].timestamp, t(10));
        assert_eq!(state.connection_status, ConnectionStatus::Connected);
    }

    #[test]
    fn test_connect_errors() {
        let mut store = store();
        assert_eq!(
            store.connect("x", "toaster", t(0)),
            Err(StoreError::UnknownDeviceType("toaster".into()))
        );
        store.connect("arm-1", DEEP_ARM, t(0)).unwrap();
        assert!(matches!(
            store.connect("arm-1", DEEP_ARM, t(1)),
            Err(StoreError::AlreadyConnected { status: ConnectionStatus::Connecting, .. })
        ));
        assert_eq!(
            store.apply_uplink_update("ghost", &update(0x1, &[]), t(1)),
            Err(StoreError::UnknownDevice("ghost".into()))
        );
    }

    #[test]
    fn test_idempotent_update() {
        let mut store = store();
        connected(&mut store, "arm-1");
        let same = update(0x1, &[("joint1_angle", 42.0)]);

        assert!(!store.apply_uplink_update("arm-1", &same, t(100)).unwrap().is_empty());
        let before = store.snapshot("arm-1").unwrap();

        assert!(store.apply_uplink_update("arm-1", &same, t(100)).unwrap().is_empty());
        assert_eq!(store.snapshot("arm-1").unwrap(), before);
    }

    #[test]
    fn test_repeated_fieldless_update_is_ignored() {
        let mut store = store();
        connected(&mut store, "arm-1");
        let heartbeat = update(0x102, &[]);

        assert!(store.apply_uplink_update("arm-1", &heartbeat, t(100)).unwrap().is_empty());
        let before = store.snapshot("arm-1").unwrap();
        assert_eq!(before.last_update, Some(t(100)));

        assert!(store.apply_uplink_update("arm-1", &heartbeat, t(100)).unwrap().is_empty());
        assert_eq!(store.snapshot("arm-1").unwrap(), before);

        // a different message at the same instant is still applied
        store.apply_uplink_update("arm-1", &update(0x101, &[]), t(100)).unwrap();
        assert_eq!(store.snapshot("arm-1").unwrap().generation, before.generation + 1);
    }

    #[test]
    fn test_first_fieldless_update_confirms_link() {
        let mut store = store();
        store.connect("arm-1", DEEP_ARM, t(0)).unwrap();

        let events = store.apply_uplink_update("arm-1", &update(0x102, &[]), t(10)).unwrap();
        assert_eq!(
            transitions(&events),
            vec![(ConnectionStatus::Connecting, ConnectionStatus::Connected)]
        );
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let mut store = store();
        connected(&mut store, "arm-1");
        store
            .apply_uplink_update("arm-1", &update(0x1, &[("joint1_angle", 20.0)]), t(200))
            .unwrap();

        let result = store.apply_uplink_update("arm-1", &update(0x1, &[("joint1_angle", 10.0)]), t(100));
        assert!(matches!(result, Err(StoreError::StaleUpdate { .. })));
        assert_eq!(store.snapshot("arm-1").unwrap().value("joint1_angle"), Some(20.0));
    }

    #[test]
    fn test_unchanged_value_restamps_without_event() {
        let mut store = store();
        connected(&mut store, "arm-1");
        let events = store
            .apply_uplink_update("arm-1", &update(0x1, &[("joint1_angle", 0.0)]), t(50))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(store.snapshot("arm-1").unwrap().fields["joint1_angle"].timestamp, t(50));
    }

    #[test]
    fn test_safe_bounds_anomaly_fires_on_entry() {
        let mut store = store();
        connected(&mut store, "arm-1");

        let hot = update(0x110, &[("temperature", 90.0)]);
        let events = store.apply_uplink_update("arm-1", &hot, t(100)).unwrap();
        assert_eq!(anomalies(&events), vec![("temperature", Severity::Warning)]);

        let hotter = update(0x110, &[("temperature", 95.0)]);
        let events = store.apply_uplink_update("arm-1", &hotter, t(200)).unwrap();
        assert!(anomalies(&events).is_empty());

        let fault = update(0x110, &[("current_status", 2.0)]);
        let events = store.apply_uplink_update("arm-1", &fault, t(300)).unwrap();
        assert_eq!(anomalies(&events), vec![("current_status", Severity::Critical)]);
    }

    #[test]
    fn test_rate_of_change_anomaly() {
        let mut store = store();
        connected(&mut store, "arm-1");

        // 90 degrees in 100 ms is 900 deg/s against a 180 deg/s limit
        let events = store
            .apply_uplink_update("arm-1", &update(0x1, &[("joint1_angle", 90.0)]), t(100))
            .unwrap();
        assert_eq!(anomalies(&events), vec![("joint1_angle", Severity::Warning)]);

        let events = store
            .apply_uplink_update("arm-1", &update(0x1, &[("joint1_angle", 100.0)]), t(1100))
            .unwrap();
        assert!(anomalies(&events).is_empty());
    }

    #[test]
    fn test_warning_streak_degrades_and_clean_update_recovers() {
        let mut store = store();
        connected(&mut store, "arm-1");

        for i in 1..=3 {
            let events = store
                .apply_uplink_update("arm-1", &warned(0x110, "temperature", 101.0 + i as f64), t(i * 10))
                .unwrap();
            assert!(transitions(&events).is_empty());
        }
        let events = store
            .apply_uplink_update("arm-1", &warned(0x110, "temperature", 110.0), t(40))
            .unwrap();
        assert_eq!(
            transitions(&events),
            vec![(ConnectionStatus::Connected, ConnectionStatus::Degraded)]
        );

        let events = store
            .apply_uplink_update("arm-1", &update(0x110, &[("temperature", 40.0)]), t(50))
            .unwrap();
        assert_eq!(
            transitions(&events),
            vec![(ConnectionStatus::Degraded, ConnectionStatus::Connected)]
        );
    }

    #[test]
    fn test_busy_command_is_rejected() {
        let mut store = store();
        connected(&mut store, "arm-1");
        let args: CommandArgs = [("joint".to_string(), 1.0), ("angle_deg".to_string(), 30.0)].into();

        let issued = store.issue_command("arm-1", "move_joint", &args, t(10)).unwrap();
        assert_eq!(issued.wire, b"AT00000001011E\r\n");
        assert_eq!(issued.deadline, t(510));
        assert_eq!(store.pending_command("arm-1"), Some(issued.command_id));

        let second = store.issue_command("arm-1", "move_joint", &args, t(20));
        assert!(matches!(
            second,
            Err(SharedError::Store(StoreError::CommandBusy { command_id, .. })) if command_id == issued.command_id
        ));
        assert!(second.unwrap_err().is_retryable());
        assert_eq!(store.pending_command("arm-1"), Some(issued.command_id));

        // any uplink acknowledges a command without an ack message
        store
            .apply_uplink_update("arm-1", &update(0x1, &[("joint1_angle", 30.0)]), t(30))
            .unwrap();
        assert_eq!(store.pending_command("arm-1"), None);
        assert!(store.issue_command("arm-1", "move_joint", &args, t(40)).is_ok());
    }

    #[test]
    fn test_ack_message_releases_slot() {
        let mut store = store();
        store.connect("motor-1", DEEP_MOTOR, t(0)).unwrap();
        store.apply_uplink_update("motor-1", &update(0x201, &[("rpm", 0.0)]), t(0)).unwrap();

        let args: CommandArgs = [("rpm".to_string(), 1500.0)].into();
        store.issue_command("motor-1", "set_rpm", &args, t(10)).unwrap();

        store.apply_uplink_update("motor-1", &update(0x999, &[]), t(20)).unwrap();
        assert!(store.pending_command("motor-1").is_some());

        store.apply_uplink_update("motor-1", &update(0x201, &[("rpm", 1500.0)]), t(30)).unwrap();
        assert!(store.pending_command("motor-1").is_none());
    }

    #[test]
    fn test_failed_resolution_does_not_occupy_slot() {
        let mut store = store();
        connected(&mut store, "arm-1");

        let result = store.issue_command("arm-1", "fly", &CommandArgs::new(), t(10));
        assert!(matches!(result, Err(SharedError::Command(CommandError::UnsupportedCommand { .. }))));

        let args: CommandArgs = [("joint".to_string(), 7.0), ("angle_deg".to_string(), 30.0)].into();
        let result = store.issue_command("arm-1", "move_joint", &args, t(10));
        assert!(matches!(result, Err(SharedError::Command(CommandError::InvalidArguments { .. }))));
        assert_eq!(store.pending_command("arm-1"), None);
    }

    #[test]
    fn test_aborted_command_frees_slot_without_timeout() {
        let mut store = store();
        connected(&mut store, "arm-1");

        let issued = store.issue_command("arm-1", "reset_arm", &CommandArgs::new(), t(10)).unwrap();
        assert!(!store.abort_command("arm-1", issued.command_id + 1));
        assert!(!store.abort_command("arm-2", issued.command_id));
        assert_eq!(store.pending_command("arm-1"), Some(issued.command_id));

        assert!(store.abort_command("arm-1", issued.command_id));
        assert_eq!(store.pending_command("arm-1"), None);
        assert!(!store.abort_command("arm-1", issued.command_id));

        // nothing left to expire at the old deadline
        store.apply_uplink_update("arm-1", &update(0x1, &[]), t(400)).unwrap();
        assert!(store.tick(t(600)).is_empty());
        assert_eq!(store.snapshot("arm-1").unwrap().connection_status, ConnectionStatus::Connected);

        let next = store.issue_command("arm-1", "reset_arm", &CommandArgs::new(), t(600)).unwrap();
        assert_ne!(next.command_id, issued.command_id);
    }

    #[test]
    fn test_commands_need_a_confirmed_link() {
        let mut store = store();
        store.connect("arm-1", DEEP_ARM, t(0)).unwrap();
        assert!(matches!(
            store.issue_command("arm-1", "reset_arm", &CommandArgs::new(), t(1)),
            Err(SharedError::Store(StoreError::NotConnected { status: ConnectionStatus::Connecting, .. }))
        ));
    }

    #[test]
    fn test_command_timeouts_degrade() {
        let mut store = store();
        connected(&mut store, "arm-1");

        let first = store.issue_command("arm-1", "reset_arm", &CommandArgs::new(), t(0)).unwrap();
        assert!(store.tick(t(499)).is_empty());

        let events = store.tick(t(500));
        assert!(matches!(
            &events[..],
            [DeviceEvent::CommandTimedOut { command_id, .. }] if *command_id == first.command_id
        ));
        assert_eq!(store.pending_command("arm-1"), None);

        // keep the heartbeat alive so only the timeouts count
        store.apply_uplink_update("arm-1", &update(0x1, &[]), t(600)).unwrap();
        store.issue_command("arm-1", "reset_arm", &CommandArgs::new(), t(600)).unwrap();
        let events = store.tick(t(1100));
        assert_eq!(
            transitions(&events),
            vec![(ConnectionStatus::Connected, ConnectionStatus::Degraded)]
        );
        assert_eq!(anomalies(&events), vec![(CONNECTION_FIELD, Severity::Warning)]);
        assert_eq!(
            store.snapshot("arm-1").unwrap().last_error.as_deref(),
            Some("2 consecutive command timeouts")
        );
    }

    #[test]
    fn test_heartbeat_loss_one_anomaly_per_transition() {
        let mut store = store();
        connected(&mut store, "arm-1");

        let mut all = Vec::new();
        for ms in (100..=3500).step_by(100) {
            all.extend(store.tick(t(ms)));
        }

        assert_eq!(
            transitions(&all),
            vec![
                (ConnectionStatus::Connected, ConnectionStatus::Degraded),
                (ConnectionStatus::Degraded, ConnectionStatus::Disconnected),
            ]
        );
        assert_eq!(
            anomalies(&all),
            vec![(CONNECTION_FIELD, Severity::Warning), (CONNECTION_FIELD, Severity::Critical)]
        );
        assert_eq!(
            store.snapshot("arm-1").unwrap().connection_status,
            ConnectionStatus::Disconnected
        );
        assert!(matches!(
            store.apply_uplink_update("arm-1", &update(0x1, &[]), t(3600)),
            Err(StoreError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_late_tick_still_reports_each_transition() {
        let mut store = store();
        connected(&mut store, "arm-1");
        let events = store.tick(t(10_000));
        assert_eq!(transitions(&events).len(), 2);
        assert_eq!(anomalies(&events).len(), 2);
    }

    #[test]
    fn test_connecting_device_that_never_answers() {
        let mut store = store();
        store.connect("arm-1", DEEP_ARM, t(0)).unwrap();
        assert!(store.tick(t(2999)).is_empty());
        let events = store.tick(t(3000));
        assert_eq!(
            transitions(&events),
            vec![(ConnectionStatus::Connecting, ConnectionStatus::Disconnected)]
        );
        assert_eq!(anomalies(&events).len(), 1);
    }

    #[test]
    fn test_reconnect_creates_fresh_state() {
        let mut store = store();
        connected(&mut store, "arm-1");
        store.tick(t(5000));
        assert_eq!(
            store.snapshot("arm-1").unwrap().connection_status,
            ConnectionStatus::Disconnected
        );

        store.connect("arm-1", DEEP_ARM, t(6000)).unwrap();
        let state = store.snapshot("arm-1").unwrap();
        assert_eq!(state.connection_status, ConnectionStatus::Connecting);
        assert!(state.fields.is_empty());
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn test_disconnect_returns_final_snapshot() {
        let mut store = store();
        connected(&mut store, "arm-1");
        let (state, events) = store.disconnect("arm-1", t(100)).unwrap();
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(state.value("joint1_angle"), Some(0.0));
        assert_eq!(
            transitions(&events),
            vec![(ConnectionStatus::Connected, ConnectionStatus::Disconnected)]
        );
        assert!(anomalies(&events).is_empty());
        assert!(store.snapshot("arm-1").is_none());
        assert_eq!(store.disconnect("arm-1", t(200)).unwrap_err(), StoreError::UnknownDevice("arm-1".into()));
    }

    #[test]
    fn test_event_json_shape() {
        let event = DeviceEvent::AnomalyDetected {
            device_id: "arm-1".into(),
            field: "temperature".into(),
            severity: Severity::Critical,
            detail: "hot".into(),
            timestamp: t(0),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "anomaly_detected");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["timestamp"], "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_store_config_defaults_fill_missing_keys() {
        let config: StoreConfig = toml::from_str("heartbeat_window_ms = 250").unwrap();
        assert_eq!(config.heartbeat_window_ms, 250);
        assert_eq!(config.max_missed_heartbeats, 3);
        assert_eq!(config.command_timeout(), Duration::milliseconds(500));
    }
}
