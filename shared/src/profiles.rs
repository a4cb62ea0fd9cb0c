/*!
Device profiles: everything the pipeline knows about one device type.

A [`DeviceProfile`] bundles the message catalog, the mapping rules and the
anomaly rules of a device type. Profiles are validated once when built and
never change afterwards; [`ProfileRegistry`] swaps the whole [`ProfileSet`]
atomically on reload, so readers always see either the old or the new set.
*/

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::catalog::{CatalogError, MessageCatalog, MessageDefinition, SignalDefinition};
use crate::error::Result;
use crate::semantic::{
    CommandError, CommandRule, CommandTarget, FieldRule, MappingRules, ParamSpec, SignalBinding,
};
use crate::state::{AnomalyRule, Severity};

/// Built-in six-joint arm
pub const DEEP_ARM: &str = "deep_arm";

/// Built-in single motor controller
pub const DEEP_MOTOR: &str = "deep_motor";

const JOINTS: u32 = 6;

/// Catalog, mapping rules and anomaly rules of one device type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_type: String,
    pub catalog: MessageCatalog,
    #[serde(default)]
    pub rules: MappingRules,
    #[serde(default)]
    pub anomalies: Vec<AnomalyRule>,
}

impl DeviceProfile {
    /// Check that rules only reference what the catalog and field rules provide
    pub fn validate(&self) -> std::result::Result<(), CatalogError> {
        self.rules.validate_against(&self.device_type, &self.catalog)?;

        for rule in &self.anomalies {
            let invalid = |reason: &str| CatalogError::InvalidRule {
                profile: self.device_type.clone(),
                reason: format!("anomaly rule for {}: {}", rule.field, reason),
            };
            if !self.rules.fields.iter().any(|f| f.field == rule.field) {
                return Err(invalid("field is never mapped"));
            }
            if rule.safe.is_some_and(|b| !b.is_valid()) {
                return Err(invalid("safe bounds are invalid"));
            }
            if rule.max_rate_per_sec.is_some_and(|r| !r.is_finite() || r <= 0.0) {
                return Err(invalid("rate limit must be positive"));
            }
        }

        Ok(())
    }

    /// Parse and validate a profile from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let profile: Self = toml::from_str(text)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load and validate a profile file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let profile = Self::from_toml_str(&text)?;
        debug!(
            "Loaded profile {} from {} ({} messages)",
            profile.device_type,
            path.as_ref().display(),
            profile.catalog.len()
        );
        Ok(profile)
    }

    /// Six joints, joint targets, reset, status/heartbeat and end-effector pose
    pub fn deep_arm() -> std::result::Result<Self, CatalogError> {
        let mut messages = Vec::new();
        let mut fields = Vec::new();
        let mut anomalies = Vec::new();
        let mut joint_targets = Vec::new();
        let mut target_bindings = Vec::new();

        for joint in 1..=JOINTS {
            let signal = format!("Joint{}Angle", joint);
            let field = format!("joint{}_angle", joint);
            messages.push(
                MessageDefinition::new(joint, format!("Joint{}", joint), 1)
                    .with_signal(SignalDefinition::new(&signal, 0, 8).unit("deg")),
            );
            fields.push(FieldRule::new(&signal, &field).bounded(0.0, 180.0));
            anomalies.push(AnomalyRule::rate(&field, 180.0, Severity::Warning));
            joint_targets.push(CommandTarget::new(joint, vec![SignalBinding::argument(&signal, "angle_deg")]));
            target_bindings.push(SignalBinding::argument(format!("Target{}", joint), format!("j{}", joint)));
        }

        let mut targets = MessageDefinition::new(0x101, "JointTargets", JOINTS as u8);
        for joint in 0..JOINTS as u16 {
            targets = targets.with_signal(
                SignalDefinition::new(format!("Target{}", joint + 1), joint * 8, 8)
                    .unit("deg")
                    .range(0.0, 180.0),
            );
        }
        messages.push(targets);

        messages.push(
            MessageDefinition::new(0x102, "ArmControl", 1).with_signal(SignalDefinition::new("ResetCommand", 0, 8)),
        );
        messages.push(
            MessageDefinition::new(0x110, "ArmStatus", 4)
                .with_signal(SignalDefinition::new("Temperature", 0, 16).signed().scaled(0.1, 0.0).unit("degC"))
                .with_signal(SignalDefinition::new("StatusCode", 16, 8))
                .with_signal(SignalDefinition::new("Heartbeat", 24, 8)),
        );
        messages.push(
            MessageDefinition::new(0x111, "EndEffectorPose", 6)
                .with_signal(pose_signal("PoseX", 7))
                .with_signal(pose_signal("PoseY", 23))
                .with_signal(pose_signal("PoseZ", 39)),
        );

        fields.extend([
            FieldRule::new("Temperature", "temperature").bounded(-20.0, 100.0),
            FieldRule::new("StatusCode", "current_status").bounded(0.0, 2.0),
            FieldRule::new("Heartbeat", "heartbeat"),
            FieldRule::new("PoseX", "pose_x_mm"),
            FieldRule::new("PoseY", "pose_y_mm"),
            FieldRule::new("PoseZ", "pose_z_mm"),
        ]);
        anomalies.extend([
            AnomalyRule::safe("temperature", -20.0, 85.0, Severity::Warning),
            AnomalyRule::safe("current_status", 0.0, 1.0, Severity::Critical),
        ]);

        let commands = vec![
            CommandRule {
                name: "move_joint".into(),
                params: vec![
                    ParamSpec::new("joint").integer().bounded(1.0, JOINTS as f64),
                    ParamSpec::new("angle_deg").bounded(0.0, 180.0),
                ],
                selector: Some("joint".into()),
                targets: joint_targets,
                ack_message: None,
            },
            CommandRule {
                name: "move_joint_angles".into(),
                params: (1..=JOINTS)
                    .map(|j| ParamSpec::new(format!("j{}", j)).bounded(0.0, 180.0))
                    .collect(),
                selector: None,
                targets: vec![CommandTarget::new(0x101, target_bindings)],
                ack_message: None,
            },
            CommandRule {
                name: "reset_arm".into(),
                params: Vec::new(),
                selector: None,
                targets: vec![CommandTarget::new(0x102, vec![SignalBinding::constant("ResetCommand", 255.0)])],
                ack_message: Some(0x110),
            },
        ];

        let profile = Self {
            device_type: DEEP_ARM.to_string(),
            catalog: MessageCatalog::new(messages)?,
            rules: MappingRules { fields, commands },
            anomalies,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Speed-controlled motor with current and temperature feedback
    pub fn deep_motor() -> std::result::Result<Self, CatalogError> {
        let catalog = MessageCatalog::new(vec![
            MessageDefinition::new(0x200, "MotorCommand", 2).with_signal(
                SignalDefinition::new("TargetRpm", 0, 16)
                    .signed()
                    .unit("rpm")
                    .range(-6000.0, 6000.0),
            ),
            MessageDefinition::new(0x201, "MotorStatus", 6)
                .with_signal(SignalDefinition::new("Rpm", 0, 16).signed().unit("rpm"))
                .with_signal(SignalDefinition::new("CurrentMilliamps", 16, 16).unit("mA"))
                .with_signal(SignalDefinition::new("Temperature", 32, 8).scaled(1.0, -40.0).unit("degC"))
                .with_signal(SignalDefinition::new("ErrorCode", 40, 8)),
        ])?;

        let rules = MappingRules {
            fields: vec![
                FieldRule::new("Rpm", "rpm").bounded(-6000.0, 6000.0),
                FieldRule::new("CurrentMilliamps", "current_a").linear(0.001, 0.0).bounded(0.0, 20.0),
                FieldRule::new("Temperature", "motor_temperature").bounded(-40.0, 120.0),
                FieldRule::new("ErrorCode", "error_code"),
            ],
            commands: vec![
                CommandRule {
                    name: "set_rpm".into(),
                    params: vec![ParamSpec::new("rpm").bounded(-6000.0, 6000.0)],
                    selector: None,
                    targets: vec![CommandTarget::new(0x200, vec![SignalBinding::argument("TargetRpm", "rpm")])],
                    ack_message: Some(0x201),
                },
                CommandRule {
                    name: "stop".into(),
                    params: Vec::new(),
                    selector: None,
                    targets: vec![CommandTarget::new(0x200, vec![SignalBinding::constant("TargetRpm", 0.0)])],
                    ack_message: Some(0x201),
                },
            ],
        };

        let profile = Self {
            device_type: DEEP_MOTOR.to_string(),
            catalog,
            rules,
            anomalies: vec![
                AnomalyRule::safe("motor_temperature", -40.0, 90.0, Severity::Warning),
                AnomalyRule::safe("error_code", 0.0, 0.0, Severity::Critical),
                AnomalyRule::rate("rpm", 10_000.0, Severity::Warning),
            ],
        };
        profile.validate()?;
        Ok(profile)
    }
}

fn pose_signal(name: &str, start_bit: u16) -> SignalDefinition {
    SignalDefinition::new(name, start_bit, 16)
        .big_endian()
        .signed()
        .scaled(0.1, 0.0)
        .unit("mm")
}

/// Immutable set of profiles keyed by device type
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    profiles: HashMap<String, Arc<DeviceProfile>>,
}

impl ProfileSet {
    /// Validate every profile; device types must be unique
    pub fn new(profiles: Vec<DeviceProfile>) -> std::result::Result<Self, CatalogError> {
        let mut map = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            profile.validate()?;
            let device_type = profile.device_type.clone();
            if map.insert(device_type.clone(), Arc::new(profile)).is_some() {
                return Err(CatalogError::DuplicateProfile(device_type));
            }
        }
        Ok(Self { profiles: map })
    }

    /// The built-in `deep_arm` and `deep_motor` profiles
    pub fn builtin() -> std::result::Result<Self, CatalogError> {
        Self::new(vec![DeviceProfile::deep_arm()?, DeviceProfile::deep_motor()?])
    }

    /// Built-in profiles plus profile files; a file replaces a built-in of the same device type
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut set = Self::builtin()?;
        let mut loaded = Vec::with_capacity(paths.len());

        for path in paths {
            let profile = DeviceProfile::load_from_file(path)?;
            if loaded.contains(&profile.device_type) {
                return Err(CatalogError::DuplicateProfile(profile.device_type).into());
            }
            if set.profiles.contains_key(&profile.device_type) {
                info!("Profile file {} overrides built-in {}", path.display(), profile.device_type);
            }
            loaded.push(profile.device_type.clone());
            set.profiles.insert(profile.device_type.clone(), Arc::new(profile));
        }

        info!("Loaded {} device profile(s): {}", set.profiles.len(), set.device_types().join(", "));
        Ok(set)
    }

    pub fn get(&self, device_type: &str) -> Option<Arc<DeviceProfile>> {
        self.profiles.get(device_type).cloned()
    }

    /// Known device types, sorted
    pub fn device_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.profiles.keys().cloned().collect();
        types.sort();
        types
    }

    /// Command names a device type accepts, in declaration order
    pub fn supported_commands(&self, device_type: &str) -> std::result::Result<Vec<String>, CommandError> {
        let profile = self
            .profiles
            .get(device_type)
            .ok_or_else(|| CommandError::UnknownDeviceType(device_type.to_string()))?;
        Ok(profile.rules.command_names().into_iter().map(String::from).collect())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Shared handle to the active profile set
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    current: RwLock<Arc<ProfileSet>>,
}

impl ProfileRegistry {
    pub fn new(set: ProfileSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// Snapshot of the active set; stays valid across later reloads
    pub fn current(&self) -> Arc<ProfileSet> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Atomically install a new set, returning the previous one
    pub fn replace(&self, set: ProfileSet) -> Arc<ProfileSet> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        info!("Installing profile set with {} device type(s)", set.len());
        std::mem::replace(&mut *guard, Arc::new(set))
    }

    pub fn get(&self, device_type: &str) -> Option<Arc<DeviceProfile>> {
        self.current().get(device_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::CanFrame;
    use crate::error::SharedError;
    use crate::semantic::CommandArgs;
    use crate::signal::{decode_frame, DecodeOutcome};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const GRIPPER: &str = r#"
        device_type = "gripper"

        [[catalog]]
        arbitration_id = 0x300
        name = "GripperStatus"
        byte_length = 2

        [[catalog.signals]]
        name = "Opening"
        start_bit = 0
        bit_length = 8
        unit = "mm"

        [[catalog.signals]]
        name = "Force"
        start_bit = 8
        bit_length = 8
        scale = 0.5

        [[catalog]]
        arbitration_id = 0x301
        name = "GripperCommand"
        byte_length = 1

        [[catalog.signals]]
        name = "TargetOpening"
        start_bit = 0
        bit_length = 8

        [[rules.fields]]
        signal = "Opening"
        field = "opening_mm"
        bounds = { min = 0.0, max = 80.0 }

        [[rules.fields]]
        signal = "Force"
        field = "force_n"

        [[rules.commands]]
        name = "open_to"
        params = [{ name = "opening_mm", bounds = { min = 0.0, max = 80.0 } }]
        ack_message = 0x300

        [[rules.commands.targets]]
        message_id = 0x301
        bindings = [{ signal = "TargetOpening", source = { from = "argument", name = "opening_mm" } }]

        [[anomalies]]
        field = "force_n"
        safe = { min = 0.0, max = 100.0 }
        severity = "critical"
    "#;

    #[test]
    fn test_builtin_profiles_are_valid() {
        let set = ProfileSet::builtin().unwrap();
        assert_eq!(set.device_types(), vec![DEEP_ARM.to_string(), DEEP_MOTOR.to_string()]);
        assert_eq!(set.get(DEEP_ARM).unwrap().catalog.len(), 10);
        assert_eq!(set.get(DEEP_MOTOR).unwrap().catalog.len(), 2);
    }

    #[test]
    fn test_supported_commands() {
        let set = ProfileSet::builtin().unwrap();
        assert_eq!(
            set.supported_commands(DEEP_ARM).unwrap(),
            vec!["move_joint", "move_joint_angles", "reset_arm"]
        );
        assert_eq!(set.supported_commands(DEEP_MOTOR).unwrap(), vec!["set_rpm", "stop"]);
        assert_eq!(
            set.supported_commands("toaster"),
            Err(CommandError::UnknownDeviceType("toaster".into()))
        );
    }

    #[test]
    fn test_deep_arm_joint_uplink() {
        let arm = DeviceProfile::deep_arm().unwrap();
        let frame = CanFrame::standard(0x1, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        let DecodeOutcome::Decoded(decoded) = decode_frame(&arm.catalog, &frame).unwrap() else {
            panic!("joint 1 should be in the catalog");
        };
        let update = arm.rules.map_uplink(&decoded);
        assert_eq!(update.fields["joint1_angle"], 170.0);
        assert!(update.warnings.is_empty());
    }

    #[test]
    fn test_deep_arm_pose_is_big_endian() {
        let arm = DeviceProfile::deep_arm().unwrap();
        // PoseX = 0x04D2 (123.4 mm), PoseY = -1 (-0.1 mm), PoseZ = 0
        let frame = CanFrame::standard(0x111, &[0x04, 0xD2, 0xFF, 0xFF, 0x00, 0x00]).unwrap();
        let DecodeOutcome::Decoded(decoded) = decode_frame(&arm.catalog, &frame).unwrap() else {
            panic!("pose should be in the catalog");
        };
        let update = arm.rules.map_uplink(&decoded);
        assert!((update.fields["pose_x_mm"] - 123.4).abs() < 1e-9);
        assert!((update.fields["pose_y_mm"] + 0.1).abs() < 1e-9);
        assert_eq!(update.fields["pose_z_mm"], 0.0);
    }

    #[test]
    fn test_deep_arm_commands_encode() {
        let arm = DeviceProfile::deep_arm().unwrap();

        let args: CommandArgs = [("joint".to_string(), 4.0), ("angle_deg".to_string(), 90.0)].into();
        let frames = arm
            .rules
            .resolve_command(DEEP_ARM, "move_joint", &args)
            .unwrap()
            .encode(&arm.catalog)
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].arbitration_id(), 0x4);
        assert_eq!(frames[0].payload(), &[90]);

        let args: CommandArgs = (1..=6).map(|j| (format!("j{}", j), (j * 10) as f64)).collect();
        let frames = arm
            .rules
            .resolve_command(DEEP_ARM, "move_joint_angles", &args)
            .unwrap()
            .encode(&arm.catalog)
            .unwrap();
        assert_eq!(frames[0].payload(), &[10, 20, 30, 40, 50, 60]);

        let resolved = arm.rules.resolve_command(DEEP_ARM, "reset_arm", &CommandArgs::new()).unwrap();
        assert_eq!(resolved.ack_message, Some(0x110));
        assert_eq!(resolved.encode(&arm.catalog).unwrap()[0].payload(), &[0xFF]);
    }

    #[test]
    fn test_deep_motor_feedback_and_command() {
        let motor = DeviceProfile::deep_motor().unwrap();
        // rpm -1200, 2500 mA, 25 degC (raw 65), no error
        let frame = CanFrame::standard(0x201, &[0x50, 0xFB, 0xC4, 0x09, 65, 0]).unwrap();
        let DecodeOutcome::Decoded(decoded) = decode_frame(&motor.catalog, &frame).unwrap() else {
            panic!("motor status should be in the catalog");
        };
        let update = motor.rules.map_uplink(&decoded);
        assert_eq!(update.fields["rpm"], -1200.0);
        assert_eq!(update.fields["current_a"], 2.5);
        assert_eq!(update.fields["motor_temperature"], 25.0);
        assert_eq!(update.fields["error_code"], 0.0);

        let args: CommandArgs = [("rpm".to_string(), -1200.0)].into();
        let frames = motor
            .rules
            .resolve_command(DEEP_MOTOR, "set_rpm", &args)
            .unwrap()
            .encode(&motor.catalog)
            .unwrap();
        assert_eq!(frames[0].payload(), &[0x50, 0xFB]);
    }

    #[test]
    fn test_profile_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(GRIPPER.as_bytes()).unwrap();

        let profile = DeviceProfile::load_from_file(file.path()).unwrap();
        assert_eq!(profile.device_type, "gripper");
        assert_eq!(profile.anomalies[0].severity, Severity::Critical);

        let set = ProfileSet::load(&[file.path().to_path_buf()]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.supported_commands("gripper").unwrap(), vec!["open_to"]);
    }

    #[test]
    fn test_profile_with_dangling_reference_is_rejected() {
        let broken = GRIPPER.replace("signal = \"Force\"", "signal = \"Grip\"");
        assert!(matches!(
            DeviceProfile::from_toml_str(&broken),
            Err(SharedError::Catalog(CatalogError::UnknownSignal { .. }))
        ));

        let broken = GRIPPER.replace("field = \"force_n\"\n        safe", "field = \"grip_n\"\n        safe");
        assert!(matches!(
            DeviceProfile::from_toml_str(&broken),
            Err(SharedError::Catalog(CatalogError::InvalidRule { .. }))
        ));

        assert!(matches!(
            DeviceProfile::from_toml_str("device_type = 3"),
            Err(SharedError::Toml(_))
        ));
    }

    #[test]
    fn test_duplicate_device_types() {
        let arm = DeviceProfile::deep_arm().unwrap();
        assert_eq!(
            ProfileSet::new(vec![arm.clone(), arm]).unwrap_err(),
            CatalogError::DuplicateProfile(DEEP_ARM.into())
        );
    }

    #[test]
    fn test_registry_swap_keeps_old_snapshots() {
        let registry = ProfileRegistry::new(ProfileSet::builtin().unwrap());
        let before = registry.current();
        assert!(registry.get(DEEP_MOTOR).is_some());

        let previous = registry.replace(ProfileSet::new(vec![DeviceProfile::deep_arm().unwrap()]).unwrap());
        assert!(Arc::ptr_eq(&before, &previous));
        assert!(registry.get(DEEP_MOTOR).is_none());
        assert!(before.get(DEEP_MOTOR).is_some());
    }
}
