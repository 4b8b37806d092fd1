use std::env;

use atmeex_cloud::{Bridge, Config, DeviceId};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Usage: cargo run --example control -- <device-id> <attribute> <value>
///
/// e.g. `control 1234 fan_speed 4` or `control 1234 mode recirculation`.
/// Credentials come from ATMEEX_EMAIL / ATMEEX_PASSWORD.
#[tokio::main]
async fn main() -> atmeex_cloud::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let (Some(device), Some(attribute), Some(raw)) = (args.get(1), args.get(2), args.get(3)) else {
        eprintln!("usage: control <device-id> <attribute> <value>");
        std::process::exit(2);
    };
    // Bare words like `off` or `recirculation` are sent as strings.
    let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()));

    let bridge = Bridge::start(Config::from_env()?).await?;
    let device_id = DeviceId::new(device.as_str());

    if bridge.get_snapshot(&device_id).is_none() {
        eprintln!("device {device_id} not found; known devices:");
        for d in bridge.snapshot().devices() {
            eprintln!("  {} ({})", d.device.id, d.device.name);
        }
        bridge.shutdown().await;
        std::process::exit(1);
    }

    bridge.submit_command(&device_id, attribute, &value).await?;
    println!("{attribute} = {value} accepted");

    if let Some(state) = bridge.get_snapshot(&device_id) {
        println!("{state:#?}");
    }

    bridge.shutdown().await;
    Ok(())
}
