/*!
Uplink routing and downlink composition over the four components.

[`Pipeline`] owns the [`DeviceStateStore`]. Uplink, a telegram line or
decoded frame goes to every registered device whose catalog knows its
arbitration id; the store decides whether that device still accepts it.
Frames no registered device knows are handled per [`UnknownFramePolicy`]
and counted apart from real errors.
Downlink, commands go through the store so the busy check and the deadline
bookkeeping always apply.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::can::CanFrame;
use crate::error::Result;
use crate::profiles::ProfileRegistry;
use crate::semantic::{CommandArgs, CommandCall, CommandError};
use crate::signal::decode_message;
use crate::state::{DeviceEvent, DeviceStateStore, IssuedCommand, StoreConfig, StoreError};
use crate::telegram::decode_telegram;

/// What happens to frames no registered device's catalog knows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFramePolicy {
    /// Count and log at debug level
    #[default]
    Drop,
    /// Also emit an `UnknownFrame` event with the raw frame
    ForwardRaw,
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub telegrams: u64,
    pub framing_errors: u64,
    pub frames_decoded: u64,
    pub unknown_frames: u64,
    pub decode_errors: u64,
    pub stale_updates: u64,
    pub commands_issued: u64,
    pub commands_rejected: u64,
}

#[derive(Debug)]
pub struct Pipeline {
    store: DeviceStateStore,
    policy: UnknownFramePolicy,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(config: StoreConfig, registry: Arc<ProfileRegistry>, policy: UnknownFramePolicy) -> Self {
        Self {
            store: DeviceStateStore::new(config, registry),
            policy,
            stats: PipelineStats::default(),
        }
    }

    pub fn store(&self) -> &DeviceStateStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut DeviceStateStore {
        &mut self.store
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn policy(&self) -> UnknownFramePolicy {
        self.policy
    }

    /// Decode one telegram line; framing errors are logged and the line dropped
    pub fn process_line(&mut self, line: &[u8], timestamp: DateTime<Utc>) -> Vec<DeviceEvent> {
        self.stats.telegrams += 1;
        match decode_telegram(line) {
            Ok(frame) => self.process_frame(&frame, timestamp),
            Err(e) => {
                self.stats.framing_errors += 1;
                warn!("Dropping telegram {:?}: {}", String::from_utf8_lossy(line), e);
                Vec::new()
            }
        }
    }

    /// Route a frame to every registered device whose catalog defines it
    pub fn process_frame(&mut self, frame: &CanFrame, timestamp: DateTime<Utc>) -> Vec<DeviceEvent> {
        let profiles = self.store.registry().current();
        let mut events = Vec::new();
        let mut routed = false;

        for (device_id, device_type) in self.store.registered_devices() {
            let Some(profile) = profiles.get(&device_type) else {
                continue;
            };
            let Some(message) = profile.catalog.message(frame.arbitration_id()) else {
                continue;
            };
            routed = true;

            let decoded = match decode_message(message, frame.payload()) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    warn!("Device {}: {}", device_id, e);
                    self.store.record_error(&device_id, e.to_string());
                    continue;
                }
            };
            self.stats.frames_decoded += 1;

            let update = profile.rules.map_uplink(&decoded);
            match self.store.apply_uplink_update(&device_id, &update, timestamp) {
                Ok(device_events) => events.extend(device_events),
                Err(e @ StoreError::StaleUpdate { .. }) => {
                    self.stats.stale_updates += 1;
                    warn!("{}", e);
                }
                Err(e @ StoreError::NotConnected { .. }) => debug!("Ignoring frame {}: {}", frame, e),
                Err(e) => warn!("Device {}: {}", device_id, e),
            }
        }

        if !routed {
            self.stats.unknown_frames += 1;
            debug!("Unknown frame {} ({:?})", frame, self.policy);
            if self.policy == UnknownFramePolicy::ForwardRaw {
                events.push(DeviceEvent::UnknownFrame {
                    frame: *frame,
                    timestamp,
                });
            }
        }

        events
    }

    /// Resolve, encode and register a command
    pub fn issue_command(
        &mut self,
        device_id: &str,
        command: &str,
        args: &CommandArgs,
        now: DateTime<Utc>,
    ) -> Result<IssuedCommand> {
        let result = self.store.issue_command(device_id, command, args, now);
        match &result {
            Ok(_) => self.stats.commands_issued += 1,
            Err(e) => {
                self.stats.commands_rejected += 1;
                debug!("Command {} for {} rejected: {}", command, device_id, e);
            }
        }
        result
    }

    /// Release a command that was issued but never written to the wire
    pub fn abort_command(&mut self, device_id: &str, command_id: u64) -> bool {
        let aborted = self.store.abort_command(device_id, command_id);
        if aborted {
            self.stats.commands_issued = self.stats.commands_issued.saturating_sub(1);
            self.stats.commands_rejected += 1;
        }
        aborted
    }

    /// Issue a textual call such as `move_joint(joint=1, angle_deg=30)`
    pub fn issue_call(&mut self, device_id: &str, call: &CommandCall, now: DateTime<Utc>) -> Result<IssuedCommand> {
        let args = self.bind_call(device_id, call)?;
        self.issue_command(device_id, &call.name, &args, now)
    }

    /// Bind a call's arguments against the device's command rule
    pub fn bind_call(&self, device_id: &str, call: &CommandCall) -> Result<CommandArgs> {
        let device_type = self
            .store
            .device_type(device_id)
            .ok_or_else(|| StoreError::UnknownDevice(device_id.to_string()))?;
        let profile = self
            .store
            .registry()
            .get(device_type)
            .ok_or_else(|| CommandError::UnknownDeviceType(device_type.to_string()))?;
        let rule = profile
            .rules
            .command(&call.name)
            .ok_or_else(|| CommandError::UnsupportedCommand {
                device_type: device_type.to_string(),
                command: call.name.clone(),
            })?;
        Ok(call.bind(rule)?)
    }

    /// Run the store watchdog
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<DeviceEvent> {
        self.store.tick(now)
    }
}
