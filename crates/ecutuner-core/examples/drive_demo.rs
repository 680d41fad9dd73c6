//! Drive the simulated car, watch it over the virtual OBD link, then read,
//! tune and write back its calibration.
//!
//! Usage: cargo run --example drive_demo [-- tuner.json]

use anyhow::{Context, Result};
use ecutuner_core::prelude::*;
use ecutuner_core::protocol::{available_links, connect, LinkTarget};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => TunerConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => TunerConfig::default(),
    };

    let registry = config.registry()?;
    let profile = registry.get(&config.vehicle)?;
    println!("Vehicle: {} ({})", profile.name, profile.hardware_id);

    let sim = Simulator::spawn(profile, config.simulator.clone())?;

    println!("Links:");
    for link in available_links() {
        println!("  {:?}", link);
    }
    let mut client = ObdClient::new(connect(&LinkTarget::Virtual, &sim, &config.serial)?);

    sim.apply_controls(ControlInput {
        ignition: IgnitionCommand::On,
        gear: GearCommand::Select(GearSelector::Drive),
        throttle: 0.8,
        ..ControlInput::default()
    });

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let reading = client.poll();
        let telemetry = sim.snapshot();
        println!(
            "OBD {:>5} rpm {:>3} km/h | gear {} temp {}C {:.1}V  [{}]",
            reading.rpm, reading.speed, telemetry.gear, telemetry.temp, telemetry.volt, reading.raw
        );
    }

    sim.apply_controls(ControlInput {
        brake: 1.0,
        ..ControlInput::default()
    });
    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("{}", serde_json::to_string(&sim.snapshot())?);
    client.close();

    let store = Arc::new(ImageStore::from_config(&config.store)?);
    let flash = FlashWorkflow::new(
        sim.clone(),
        Arc::new(Mutex::new(CalibrationImage::new())),
        Arc::clone(&store),
        config.flash.clone(),
    );

    flash.start_read()?;
    flash.wait().await;

    {
        let mut image = flash.image().lock();
        for stage in [Stage::Stage1, Stage::EgrOff, Stage::PopBang] {
            match image.apply_stage(stage) {
                Ok(report) => println!(
                    "{}: {} bytes changed at {:#x}",
                    report.stage, report.bytes_changed, report.offset
                ),
                Err(e) => println!("{}: skipped ({})", stage, e),
            }
        }
        if let Some(meta) = image.metadata() {
            let saved = store.save("demo tune", image.current(), meta, RecordType::Modified)?;
            println!("Saved modified image as {}", saved);
        }
    }

    flash.start_write()?;
    flash.wait().await;
    for line in flash.job().log {
        println!("{}", line);
    }

    println!("Stored images in {:?}:", store.path());
    for record in store.list() {
        println!(
            "  {} {:?} {} {} bytes",
            record.filename, record.record_type, record.vehicle_name, record.byte_length
        );
    }

    sim.stop();
    Ok(())
}
