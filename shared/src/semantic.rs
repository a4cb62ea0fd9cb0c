/*!
Semantic field mapping and command resolution.

Uplink, [`MappingRules::map_uplink`] turns decoded signals into business
fields and range-checks them. Out-of-bounds values become
[`ValidationWarning`]s on the update; the state store decides what they mean.

Downlink, [`MappingRules::resolve_command`] turns an abstract command such as
`move_joint(joint=1, angle_deg=30)` into per-message signal values, which
[`ResolvedCommand::encode`] hands to the signal codec.
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

use crate::can::CanFrame;
use crate::catalog::{CatalogError, MessageCatalog};
use crate::signal::{self, DecodedMessage, SignalEncodeError, SignalValues};

/// Argument name → value for one command invocation
pub type CommandArgs = BTreeMap<String, f64>;

/// Caller-side command failures. None of these are retried automatically.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Unknown device type {0}")]
    UnknownDeviceType(String),

    #[error("Device type {device_type} does not support command {command}")]
    UnsupportedCommand { device_type: String, command: String },

    #[error("Invalid arguments for {command}: {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("Malformed command call: {0}")]
    Malformed(String),
}

impl CommandError {
    fn invalid(command: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// Conversion between a signal's physical value and a business value
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldTransform {
    #[default]
    Identity,
    /// `business = signal * factor + offset`
    Linear { factor: f64, offset: f64 },
}

impl FieldTransform {
    /// Signal value → business value
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            Self::Identity => value,
            Self::Linear { factor, offset } => value * factor + offset,
        }
    }

    /// Business value → signal value
    pub fn invert(&self, value: f64) -> f64 {
        match *self {
            Self::Identity => value,
            Self::Linear { factor, offset } => (value - offset) / factor,
        }
    }

    fn is_invertible(&self) -> bool {
        match *self {
            Self::Identity => true,
            Self::Linear { factor, offset } => factor.is_finite() && factor != 0.0 && offset.is_finite(),
        }
    }
}

/// Inclusive value range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Finite and not inverted
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Maps one signal onto one business field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub signal: String,
    pub field: String,
    #[serde(default)]
    pub transform: FieldTransform,
    /// Values outside these bounds produce a validation warning
    #[serde(default)]
    pub bounds: Option<Bounds>,
}

impl FieldRule {
    pub fn new(signal: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
            field: field.into(),
            transform: FieldTransform::Identity,
            bounds: None,
        }
    }

    pub fn linear(mut self, factor: f64, offset: f64) -> Self {
        self.transform = FieldTransform::Linear { factor, offset };
        self
    }

    pub fn bounded(mut self, min: f64, max: f64) -> Self {
        self.bounds = Some(Bounds::new(min, max));
        self
    }
}

/// A named command argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub bounds: Option<Bounds>,
    /// Reject values with a fractional part
    #[serde(default)]
    pub integer: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bounds: None,
            integer: false,
        }
    }

    pub fn bounded(mut self, min: f64, max: f64) -> Self {
        self.bounds = Some(Bounds::new(min, max));
        self
    }

    pub fn integer(mut self) -> Self {
        self.integer = true;
        self
    }
}

/// Where a downlink signal value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum BindingSource {
    /// A command argument, converted back through `transform`
    Argument {
        name: String,
        #[serde(default)]
        transform: FieldTransform,
    },
    Constant { value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBinding {
    pub signal: String,
    pub source: BindingSource,
}

impl SignalBinding {
    pub fn argument(signal: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
            source: BindingSource::Argument {
                name: name.into(),
                transform: FieldTransform::Identity,
            },
        }
    }

    pub fn constant(signal: impl Into<String>, value: f64) -> Self {
        Self {
            signal: signal.into(),
            source: BindingSource::Constant { value },
        }
    }
}

/// One message written by a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTarget {
    pub message_id: u32,
    #[serde(default)]
    pub bindings: Vec<SignalBinding>,
}

impl CommandTarget {
    pub fn new(message_id: u32, bindings: Vec<SignalBinding>) -> Self {
        Self { message_id, bindings }
    }
}

/// How an abstract command becomes signal values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRule {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Integer argument picking one 1-based target; all targets are written without it
    #[serde(default)]
    pub selector: Option<String>,
    pub targets: Vec<CommandTarget>,
    /// Uplink message that acknowledges the command
    #[serde(default)]
    pub ack_message: Option<u32>,
}

impl CommandRule {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    fn check_args(&self, args: &CommandArgs) -> Result<(), CommandError> {
        if let Some(unexpected) = args.keys().find(|name| self.param(name).is_none()) {
            return Err(CommandError::invalid(&self.name, format!("unexpected argument {}", unexpected)));
        }

        for param in &self.params {
            let value = *args
                .get(&param.name)
                .ok_or_else(|| CommandError::invalid(&self.name, format!("missing argument {}", param.name)))?;

            if !value.is_finite() {
                return Err(CommandError::invalid(&self.name, format!("{} is not finite", param.name)));
            }
            if param.integer && value.fract() != 0.0 {
                return Err(CommandError::invalid(&self.name, format!("{} must be an integer", param.name)));
            }
            if let Some(bounds) = param.bounds {
                if !bounds.contains(value) {
                    return Err(CommandError::invalid(
                        &self.name,
                        format!("{} = {} outside {}", param.name, value, bounds),
                    ));
                }
            }
        }

        Ok(())
    }

    fn selected_targets(&self, args: &CommandArgs) -> Result<&[CommandTarget], CommandError> {
        let Some(selector) = &self.selector else {
            return Ok(&self.targets);
        };

        let value = args.get(selector).copied().unwrap_or(f64::NAN);
        let index = value as usize;
        if value.fract() != 0.0 || value < 1.0 || index > self.targets.len() {
            return Err(CommandError::invalid(
                &self.name,
                format!("{} = {} does not select one of {} targets", selector, value, self.targets.len()),
            ));
        }
        Ok(&self.targets[index - 1..index])
    }
}

/// Business value outside its expected range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub value: f64,
    pub bounds: Bounds,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} outside {}", self.field, self.value, self.bounds)
    }
}

/// Business fields produced from one decoded message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SemanticUpdate {
    pub fields: BTreeMap<String, f64>,
    pub warnings: Vec<ValidationWarning>,
    /// Arbitration id the fields were decoded from
    pub source_message: Option<u32>,
}

impl SemanticUpdate {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Signal values ready for the signal codec
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    pub name: String,
    pub messages: Vec<(u32, SignalValues)>,
    pub ack_message: Option<u32>,
}

impl ResolvedCommand {
    /// Encode every target message with the signal codec
    pub fn encode(&self, catalog: &MessageCatalog) -> Result<Vec<CanFrame>, SignalEncodeError> {
        self.messages
            .iter()
            .map(|(id, values)| signal::encode_frame(catalog, *id, values))
            .collect()
    }
}

/// Field and command rules for one device type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingRules {
    #[serde(default)]
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub commands: Vec<CommandRule>,
}

impl MappingRules {
    /// Map decoded signals to business fields; unmapped signals are ignored
    pub fn map_uplink(&self, decoded: &DecodedMessage) -> SemanticUpdate {
        let mut update = SemanticUpdate {
            source_message: Some(decoded.arbitration_id),
            ..Default::default()
        };

        for rule in &self.fields {
            let Some(&raw) = decoded.signals.get(&rule.signal) else {
                continue;
            };
            let value = rule.transform.apply(raw);
            if let Some(bounds) = rule.bounds {
                if !bounds.contains(value) {
                    update.warnings.push(ValidationWarning {
                        field: rule.field.clone(),
                        value,
                        bounds,
                    });
                }
            }
            update.fields.insert(rule.field.clone(), value);
        }

        update
    }

    pub fn command(&self, name: &str) -> Option<&CommandRule> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Command names in declaration order
    pub fn command_names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name.as_str()).collect()
    }

    /// Resolve a command into per-message signal values
    pub fn resolve_command(
        &self,
        device_type: &str,
        command: &str,
        args: &CommandArgs,
    ) -> Result<ResolvedCommand, CommandError> {
        let rule = self.command(command).ok_or_else(|| CommandError::UnsupportedCommand {
            device_type: device_type.to_string(),
            command: command.to_string(),
        })?;

        rule.check_args(args)?;

        let mut messages = Vec::new();
        for target in rule.selected_targets(args)? {
            let mut values = SignalValues::new();
            for binding in &target.bindings {
                let value = match &binding.source {
                    BindingSource::Argument { name, transform } => {
                        // check_args guarantees every declared param is present
                        let arg = args
                            .get(name)
                            .ok_or_else(|| CommandError::invalid(command, format!("missing argument {}", name)))?;
                        transform.invert(*arg)
                    }
                    BindingSource::Constant { value } => *value,
                };
                values.insert(binding.signal.clone(), value);
            }
            messages.push((target.message_id, values));
        }

        Ok(ResolvedCommand {
            name: rule.name.clone(),
            messages,
            ack_message: rule.ack_message,
        })
    }

    /// Check every rule against the catalog it will run with
    pub fn validate_against(&self, profile: &str, catalog: &MessageCatalog) -> Result<(), CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidRule {
            profile: profile.to_string(),
            reason,
        };

        let mut fields = HashSet::new();
        for rule in &self.fields {
            if catalog.message_for_signal(&rule.signal).is_none() {
                return Err(CatalogError::UnknownSignal {
                    profile: profile.to_string(),
                    signal: rule.signal.clone(),
                });
            }
            if !fields.insert(rule.field.as_str()) {
                return Err(invalid(format!("field {} is mapped twice", rule.field)));
            }
            if !rule.transform.is_invertible() {
                return Err(invalid(format!("field {} has a degenerate transform", rule.field)));
            }
            if rule.bounds.is_some_and(|b| !b.is_valid()) {
                return Err(invalid(format!("field {} has invalid bounds", rule.field)));
            }
        }

        let mut names = HashSet::new();
        for command in &self.commands {
            if !names.insert(command.name.as_str()) {
                return Err(invalid(format!("command {} is defined twice", command.name)));
            }
            if command.targets.is_empty() {
                return Err(invalid(format!("command {} has no targets", command.name)));
            }
            if let Some(selector) = &command.selector {
                if command.param(selector).is_none() {
                    return Err(invalid(format!("command {} selects by unknown param {}", command.name, selector)));
                }
            }
            if let Some(ack) = command.ack_message {
                if catalog.message(ack).is_none() {
                    return Err(CatalogError::UnknownMessage {
                        profile: profile.to_string(),
                        message: ack,
                    });
                }
            }

            for target in &command.targets {
                let message = catalog
                    .message(target.message_id)
                    .ok_or_else(|| CatalogError::UnknownMessage {
                        profile: profile.to_string(),
                        message: target.message_id,
                    })?;

                for binding in &target.bindings {
                    if message.signal(&binding.signal).is_none() {
                        return Err(CatalogError::UnknownSignal {
                            profile: profile.to_string(),
                            signal: binding.signal.clone(),
                        });
                    }
                    if let BindingSource::Argument { name, transform } = &binding.source {
                        if command.param(name).is_none() {
                            return Err(invalid(format!("command {} binds unknown param {}", command.name, name)));
                        }
                        if !transform.is_invertible() {
                            return Err(invalid(format!("command {} has a degenerate transform", command.name)));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Textual command invocation, `name(arg=value, ...)` or `name(value, ...)`
#[derive(Debug, Clone, PartialEq)]
pub struct CommandCall {
    pub name: String,
    /// Named or positional arguments in call order
    pub args: Vec<(Option<String>, f64)>,
}

impl CommandCall {
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let text = text.trim();
        let malformed = |reason: &str| CommandError::Malformed(format!("{}: {}", reason, text));

        let (name, rest) = match text.find('(') {
            Some(open) => {
                let inner = text[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| malformed("missing closing parenthesis"))?;
                (text[..open].trim(), inner)
            }
            None => (text, ""),
        };

        if !is_identifier(name) {
            return Err(malformed("invalid command name"));
        }

        let mut args = Vec::new();
        let mut seen_named = false;
        for part in rest.split(',').map(str::trim) {
            if part.is_empty() {
                if rest.trim().is_empty() {
                    break;
                }
                return Err(malformed("empty argument"));
            }

            let (key, value) = match part.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if !is_identifier(key) {
                        return Err(malformed("invalid argument name"));
                    }
                    seen_named = true;
                    (Some(key.to_string()), value.trim())
                }
                None if seen_named => return Err(malformed("positional argument after named argument")),
                None => (None, part),
            };

            let value: f64 = value.parse().map_err(|_| malformed("argument is not a number"))?;
            args.push((key, value));
        }

        Ok(Self {
            name: name.to_string(),
            args,
        })
    }

    /// Bind arguments to the rule's params; positional ones follow declaration order
    pub fn bind(&self, rule: &CommandRule) -> Result<CommandArgs, CommandError> {
        let mut bound = CommandArgs::new();
        for (position, (key, value)) in self.args.iter().enumerate() {
            let name = match key {
                Some(key) => key.clone(),
                None => rule
                    .params
                    .get(position)
                    .map(|p| p.name.clone())
                    .ok_or_else(|| CommandError::invalid(&rule.name, "too many positional arguments"))?,
            };
            if bound.insert(name.clone(), *value).is_some() {
                return Err(CommandError::invalid(&rule.name, format!("argument {} given twice", name)));
            }
        }
        Ok(bound)
    }
}

impl fmt::Display for CommandCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, (key, value)) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match key {
                Some(key) => write!(f, "{}={}", key, value)?,
                None => write!(f, "{}", value)?,
            }
        }
        write!(f, ")")
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
