//! Build the state memory image of a node from a TOML provisioning file.

use std::{fs, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;

use lora_counter_common::{state::UNCONFIGURED_NODE_NUMBER, AlertCode, CountersState, SystemState};
use lora_counter_config::{serialize_image, NodeConfig, COUNTERS_RECORD_OFFSET, SYSTEM_RECORD_OFFSET};

/// Write the initial system and counters records of a node.
///
/// The image is meant to be written to the start of the node's state memory.
#[derive(Parser)]
struct Opts {
    /// Path to a provisioning file in TOML format.
    #[clap(short, long)]
    config: PathBuf,
    /// Where to write the binary image. Without it, only the hex dump is printed.
    #[clap(short, long)]
    output: Option<PathBuf>,
}

#[derive(Deserialize)]
struct ProvisionFile {
    #[serde(default)]
    node: NodeConfig,
    #[serde(default)]
    state: InitialState,
}

/// Overrides of the factory default system state.
#[derive(Deserialize, Default)]
#[serde(default)]
struct InitialState {
    /// Pre-assigned node number, the node does not join if set
    node_number: Option<u8>,
    frequency_minutes: Option<u16>,
    open_hours: Option<bool>,
}

fn hex_dump(data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let range = i * 16..i * 16 + 16;
        let marker = if range.contains(&SYSTEM_RECORD_OFFSET) {
            "  <- system record"
        } else if range.contains(&COUNTERS_RECORD_OFFSET) {
            "  <- counters record"
        } else {
            ""
        };
        println!("{:04x}: {}{}", i * 16, bytes.join(" "), marker);
    }
}

/// Factory state of the node with the `[state]` overrides applied.
fn build_system(file: &ProvisionFile) -> Result<SystemState> {
    let mut system = file.node.factory_system_state();
    if let Some(node_number) = file.state.node_number {
        if node_number == UNCONFIGURED_NODE_NUMBER {
            log::warn!("Node number {} means unconfigured, the node will join", node_number);
        } else {
            system.node_number = node_number;
            system.alert_code = AlertCode::None;
        }
    }
    if let Some(frequency_minutes) = file.state.frequency_minutes {
        system.frequency_minutes = frequency_minutes;
    }
    if let Some(open_hours) = file.state.open_hours {
        system.open_hours = open_hours;
    }
    system
        .validate()
        .map_err(|e| anyhow!("Invalid [state] table: {}", e))?;
    Ok(system)
}

fn main() -> Result<()> {
    env_logger::init();

    // Parse command line args
    let opts: Opts = Opts::parse();

    // Parse config
    let source = fs::read_to_string(&opts.config).context("Could not read provisioning file")?;
    let file: ProvisionFile = toml::from_str(&source).context("Could not parse provisioning file")?;
    file.node
        .validate()
        .map_err(|e| anyhow!("Invalid node config: {}", e))?;

    let system = build_system(&file)?;

    let image = serialize_image(&system, &CountersState::default())
        .map_err(|e| anyhow!("Could not build image: {}", e))?;

    println!(
        "Node {} (magic {}, {} sensor, device {}), reporting every {} min",
        system.node_number,
        system.magic_number,
        system.sensor_type,
        file.node.device_id,
        system.frequency_minutes
    );
    hex_dump(&image);

    if let Some(output) = opts.output {
        fs::write(&output, &image[..])
            .with_context(|| format!("Could not write image to {}", output.display()))?;
        println!("Wrote {} bytes to {}", image.len(), output.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> ProvisionFile {
        toml::from_str(source).unwrap()
    }

    #[test]
    fn test_state_overrides() {
        let file = parse("[state]\nnode_number = 4\nfrequency_minutes = 30\n");
        let system = build_system(&file).unwrap();
        assert_eq!(system.node_number, 4);
        assert_eq!(system.frequency_minutes, 30);
        assert_eq!(system.alert_code, AlertCode::None);
    }

    #[test]
    fn test_zero_frequency_is_rejected() {
        let file = parse("[state]\nfrequency_minutes = 0\n");
        let err = build_system(&file).unwrap_err();
        assert!(err.to_string().contains("[state]"), "{}", err);
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        assert!(build_system(&parse("[state]\nfrequency_minutes = 61\n")).is_err());
        assert!(build_system(&parse("[state]\nnode_number = 200\n")).is_err());
    }
}
