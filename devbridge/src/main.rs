/*!
# Device Bridge

Translates between a serial/CAN device link and business-level device
state. Telegrams from a serial-over-TCP bridge are decoded into CAN frames,
physical signals and semantic fields; commands travel the same path in
reverse.

## Features

- Serial-over-TCP transport with stream resynchronisation
- Built-in `deep_arm` and `deep_motor` profiles, extensible with TOML profile files
- Per-device connection state machine with heartbeat watchdog
- Command busy/timeout tracking, one command in flight per device
- Device events as JSON lines on stdout, logs on stderr
- Simulated arm for running without hardware

## Usage

### Bridge a serial-over-TCP link
```bash
devbridge --config devbridge.toml run
```
Commands are read from stdin as `<device_id> <command>`, e.g.
`arm-1 move_joint(joint=1, angle_deg=30)`. Console verbs: `snapshot [device_id]`,
`connect <device_id> <device_type>`, `disconnect <device_id>`,
`commands <device_type>`, `reload`, `stats`.

### Run against the simulated arm
```bash
devbridge simulate --seconds 10 --command "arm-1 move_joint(1, 45)"
```

### Offline translation
```bash
devbridge decode --device-type deep_arm AT0000000104AABBCCDD
devbridge encode --device-type deep_arm "move_joint(joint=1, angle_deg=30)"
```
*/

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use shared::signal::{decode_frame, DecodeOutcome};
use shared::{decode_telegram, encode_telegram, CommandCall, DeviceEvent, ProfileRegistry, ProfileSet};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Level};

mod bridge;
mod config;
mod transport;

use bridge::{Bridge, BridgeHandle};
use config::{AppConfig, DeviceConfig};
use transport::{SimulatedArmTransport, TcpBridgeTransport, Transport};

#[derive(Parser)]
#[command(name = "devbridge")]
#[command(about = "Serial/CAN device protocol translation bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "devbridge.toml", global = true)]
    config: PathBuf,

    /// Log per-frame detail
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge a serial-over-TCP link
    Run {
        /// Override the bridge host
        #[arg(long)]
        host: Option<String>,

        /// Override the bridge port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run against a simulated deep_arm (no hardware needed)
    Simulate {
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Status telegram interval in milliseconds
        #[arg(long, default_value = "200")]
        status_interval_ms: u64,

        /// Commands to issue once connected, as "<device_id> <command>"
        #[arg(long = "command")]
        commands: Vec<String>,
    },

    /// Decode telegrams with a device profile and print the result as JSON
    Decode {
        #[arg(short, long, default_value = "deep_arm")]
        device_type: String,

        /// Telegrams, terminator optional
        #[arg(required = true)]
        telegrams: Vec<String>,
    },

    /// Encode a command into telegrams
    Encode {
        #[arg(short, long, default_value = "deep_arm")]
        device_type: String,

        /// Command call, e.g. "move_joint(joint=1, angle_deg=30)"
        call: String,
    },

    /// List device types and their commands
    Commands {
        device_type: Option<String>,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "devbridge.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr to keep stdout clean for JSON event lines
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    match cli.command {
        Commands::Run { host, port } => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            if let Some(host) = host {
                config.bridge.host = host;
            }
            if let Some(port) = port {
                config.bridge.port = port;
            }
            run_bridge(config)
        }

        Commands::Simulate {
            seconds,
            status_interval_ms,
            commands,
        } => {
            let config = AppConfig::load_or_default(&cli.config)?;
            run_simulation(config, seconds.map(Duration::from_secs), status_interval_ms, commands)
        }

        Commands::Decode {
            device_type,
            telegrams,
        } => {
            let config = AppConfig::load_or_default(&cli.config)?;
            decode_telegrams(&config, &device_type, &telegrams)
        }

        Commands::Encode { device_type, call } => {
            let config = AppConfig::load_or_default(&cli.config)?;
            encode_call(&config, &device_type, &call)
        }

        Commands::Commands { device_type } => {
            let config = AppConfig::load_or_default(&cli.config)?;
            list_commands(&config, device_type.as_deref())
        }

        Commands::Config { output } => generate_config_file(output),
    }
}

fn load_profiles(config: &AppConfig) -> Result<Arc<ProfileRegistry>> {
    let set = ProfileSet::load(&config.profiles).with_context(|| "Failed to load device profiles")?;
    Ok(Arc::new(ProfileRegistry::new(set)))
}

/// Bridge the configured serial-over-TCP link until Ctrl+C
fn run_bridge(config: AppConfig) -> Result<()> {
    info!("🚀 Starting device bridge");
    info!("🔌 Serial bridge: {}", config.bridge.address());
    info!("🔍 Unknown frames: {:?}", config.bridge.unknown_frames);

    let registry = load_profiles(&config)?;
    let transport = TcpBridgeTransport::connect(&config.bridge)
        .with_context(|| format!("Failed to connect to serial bridge at {}", config.bridge.address()))?;

    run_session(transport, &config, registry, None, Vec::new())
}

/// Run against the simulated arm
fn run_simulation(
    mut config: AppConfig,
    duration: Option<Duration>,
    status_interval_ms: u64,
    script: Vec<String>,
) -> Result<()> {
    info!("🧪 Starting device bridge (SIMULATION mode)");

    if config.devices.is_empty() {
        config.devices.push(DeviceConfig::new("arm-1", shared::profiles::DEEP_ARM));
    }
    let registry = load_profiles(&config)?;
    let transport = SimulatedArmTransport::new()
        .with_context(|| "Failed to build simulated arm")?
        .with_status_interval(Duration::from_millis(status_interval_ms.max(1)));

    run_session(transport, &config, registry, duration, script)
}

fn run_session<T: Transport + 'static>(
    transport: T,
    config: &AppConfig,
    registry: Arc<ProfileRegistry>,
    duration: Option<Duration>,
    script: Vec<String>,
) -> Result<()> {
    let bridge = Bridge::start(transport, config, registry)?;
    let handle = bridge.handle();
    let events = bridge.events();

    let running = handle.running_flag();
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, std::sync::atomic::Ordering::SeqCst);
    })?;

    let script_thread = if script.is_empty() {
        None
    } else {
        let handle = handle.clone();
        let profiles = config.profiles.clone();
        Some(thread::spawn(move || run_script(&handle, &profiles, &script)))
    };

    // Detached: a blocking stdin read would otherwise hold up shutdown
    let stdin_handle = handle.clone();
    let profiles = config.profiles.clone();
    thread::spawn(move || command_reader(&stdin_handle, &profiles));

    let started = Instant::now();
    while handle.is_running() {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            print_event(&event);
        }
        if duration.is_some_and(|d| started.elapsed() >= d) {
            info!("⏱️ Session time elapsed");
            handle.shutdown();
        }
    }

    if let Some(script_thread) = script_thread {
        if script_thread.join().is_err() {
            error!("Script thread panicked");
        }
    }

    let report = bridge.join()?;
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }

    info!("📈 Final statistics:");
    info!("  Lines read: {}", report.reader.lines);
    info!("  Framing errors: {}", report.reader.framing_errors);
    info!("  Frames decoded: {}", report.pipeline.frames_decoded);
    info!("  Unknown frames: {}", report.pipeline.unknown_frames);
    info!("  Decode errors: {}", report.pipeline.decode_errors);
    info!("  Stale updates: {}", report.pipeline.stale_updates);
    info!(
        "  Commands: {} issued, {} rejected, {} telegrams written",
        report.pipeline.commands_issued, report.pipeline.commands_rejected, report.reader.telegrams_written
    );
    info!("  Events dropped: {}", report.events_dropped);
    info!("✅ Device bridge stopped");
    Ok(())
}

fn print_event(event: &DeviceEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Cannot serialize event: {}", e),
    }
}

/// `<device_id> <command>` split at the first whitespace
fn split_command_line(line: &str) -> Option<(&str, &str)> {
    let (device_id, call) = line.trim().split_once(char::is_whitespace)?;
    Some((device_id, call.trim()))
}

fn run_script(handle: &BridgeHandle, profiles: &[PathBuf], script: &[String]) {
    // Give the devices a moment to report in
    thread::sleep(Duration::from_millis(500));

    for line in script {
        if !handle.is_running() {
            break;
        }
        execute_line(handle, profiles, line);
        thread::sleep(Duration::from_millis(500));
    }
}

fn command_reader(handle: &BridgeHandle, profiles: &[PathBuf]) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if !handle.is_running() {
            break;
        }
        if !line.trim().is_empty() {
            execute_line(handle, profiles, &line);
        }
    }
}

/// Console verbs; anything else is `<device_id> <command>`
fn execute_line(handle: &BridgeHandle, profiles: &[PathBuf], line: &str) {
    let line = line.trim();
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next(), words.next()) {
        (Some("snapshot"), None, _) => handle.snapshots().map(|states| json!(states)),
        (Some("snapshot"), Some(device_id), _) => handle.snapshot(device_id).map(|state| json!(state)),
        (Some("connect"), Some(device_id), Some(device_type)) => handle
            .connect_device(device_id, device_type)
            .map(|_| json!({ "connected": device_id })),
        (Some("disconnect"), Some(device_id), _) => handle.disconnect_device(device_id).map(|state| json!(state)),
        (Some("commands"), Some(device_type), _) => handle.supported_commands(device_type).map(|names| json!(names)),
        (Some("reload"), None, _) => handle.reload_profiles(profiles).map(|types| json!({ "profiles": types })),
        (Some("stats"), None, _) => handle.stats().map(|stats| json!(stats)),
        _ => {
            issue_line(handle, line);
            return;
        }
    };

    match result {
        Ok(value) => println!("{}", value),
        Err(e) => warn!("{} failed: {}", line, e),
    }
}

fn issue_line(handle: &BridgeHandle, line: &str) {
    let Some((device_id, text)) = split_command_line(line) else {
        warn!("Expected \"<device_id> <command>\", got {:?}", line);
        return;
    };
    let call = match CommandCall::parse(text) {
        Ok(call) => call,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };

    match handle.issue_command(device_id, call) {
        Ok(issued) => {
            info!("📤 Command #{} {} sent to {}", issued.command_id, issued.command, device_id);
            println!(
                "{}",
                json!({
                    "event": "command_issued",
                    "device_id": issued.device_id,
                    "command_id": issued.command_id,
                    "command": issued.command,
                    "wire": String::from_utf8_lossy(&issued.wire).trim_end(),
                    "deadline": issued.deadline,
                })
            );
        }
        Err(e) if e.is_retryable() => warn!("Command for {} not accepted now, retry later: {}", device_id, e),
        Err(e) => warn!("Command for {} failed: {}", device_id, e),
    }
}

/// Decode telegrams through one device profile, no bridge needed
fn decode_telegrams(config: &AppConfig, device_type: &str, telegrams: &[String]) -> Result<()> {
    let registry = load_profiles(config)?;
    let profile = registry
        .get(device_type)
        .ok_or_else(|| anyhow!("Unknown device type: {}", device_type))?;

    for text in telegrams {
        let mut line = text.trim().as_bytes().to_vec();
        line.extend_from_slice(shared::protocol::TELEGRAM_TERMINATOR);

        let frame = match decode_telegram(&line) {
            Ok(frame) => frame,
            Err(e) => {
                println!("{}", json!({ "telegram": text, "error": e.to_string() }));
                continue;
            }
        };

        let output = match decode_frame(&profile.catalog, &frame) {
            Ok(DecodeOutcome::Decoded(decoded)) => {
                let update = profile.rules.map_uplink(&decoded);
                json!({
                    "telegram": text,
                    "frame": frame,
                    "message": decoded.message,
                    "signals": decoded.signals,
                    "fields": update.fields,
                    "warnings": update.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
                })
            }
            Ok(DecodeOutcome::Unknown(frame)) => json!({ "telegram": text, "frame": frame, "unknown": true }),
            Err(e) => json!({ "telegram": text, "frame": frame, "error": e.to_string() }),
        };
        println!("{}", output);
    }

    Ok(())
}

/// Print the telegrams a command call produces for a device type
fn encode_call(config: &AppConfig, device_type: &str, text: &str) -> Result<()> {
    let registry = load_profiles(config)?;
    let profile = registry
        .get(device_type)
        .ok_or_else(|| anyhow!("Unknown device type: {}", device_type))?;

    let call = CommandCall::parse(text)?;
    let rule = profile
        .rules
        .command(&call.name)
        .ok_or_else(|| anyhow!("{} has no command {}", device_type, call.name))?;
    let args = call.bind(rule)?;
    let resolved = profile.rules.resolve_command(device_type, &call.name, &args)?;

    for frame in resolved.encode(&profile.catalog)? {
        let telegram = encode_telegram(&frame);
        println!("{}", String::from_utf8_lossy(&telegram).trim_end());
    }

    Ok(())
}

fn list_commands(config: &AppConfig, device_type: Option<&str>) -> Result<()> {
    let registry = load_profiles(config)?;
    let profiles = registry.current();

    let device_types = match device_type {
        Some(device_type) => vec![device_type.to_string()],
        None => profiles.device_types(),
    };

    for device_type in device_types {
        let profile = profiles
            .get(&device_type)
            .ok_or_else(|| anyhow!("Unknown device type: {}", device_type))?;
        println!("{}", device_type);
        for name in profile.rules.command_names() {
            let params = profile
                .rules
                .command(name)
                .map(|rule| rule.params.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            println!("  {}({})", name, params);
        }
    }

    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   devbridge --config {} run", output_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_line() {
        assert_eq!(
            split_command_line("  arm-1 move_joint(joint=1, angle_deg=30) "),
            Some(("arm-1", "move_joint(joint=1, angle_deg=30)"))
        );
        assert_eq!(split_command_line("arm-1"), None);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["devbridge", "--verbose", "decode", "AT00000001011E"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("devbridge.toml"));
        match cli.command {
            Commands::Decode {
                device_type,
                telegrams,
            } => {
                assert_eq!(device_type, "deep_arm");
                assert_eq!(telegrams, vec!["AT00000001011E"]);
            }
            _ => panic!("expected decode"),
        }

        let cli = Cli::try_parse_from([
            "devbridge",
            "simulate",
            "--seconds",
            "5",
            "--command",
            "arm-1 reset_arm()",
            "--command",
            "arm-1 move_joint(1, 45)",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate { seconds, commands, .. } => {
                assert_eq!(seconds, Some(5));
                assert_eq!(commands.len(), 2);
            }
            _ => panic!("expected simulate"),
        }

        assert!(Cli::try_parse_from(["devbridge", "decode"]).is_err());
    }
}
