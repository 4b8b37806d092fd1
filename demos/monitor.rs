use atmeex_cloud::{Bridge, Config, Event};
use tracing_subscriber::EnvFilter;

/// Usage: ATMEEX_EMAIL=.. ATMEEX_PASSWORD=.. cargo run --example monitor
#[tokio::main]
async fn main() -> atmeex_cloud::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    println!("Signing in as {}...", config.email);

    let bridge = Bridge::builder(config)
        .on_event(|event| match event {
            Event::DeviceAdded { device_id, name } => println!("+ {name} ({device_id})"),
            Event::DeviceRemoved { device_id } => println!("- {device_id}"),
            other => println!("  {other:?}"),
        })
        .on_snapshot(|snapshot| {
            for device in snapshot.devices() {
                let Some(state) = &device.state else {
                    println!("[{}] no data yet", device.device.name);
                    continue;
                };
                println!(
                    "[{}] {} | fan {} | {} | target {} | inside {} | humidity {}{}",
                    device.device.name,
                    if state.power { "on" } else { "off" },
                    state.fan_speed.get(),
                    state.mode.label(),
                    state
                        .target_temperature
                        .map_or_else(|| "-".to_string(), |t| t.to_string()),
                    state
                        .current_temperature
                        .map_or_else(|| "-".to_string(), |t| t.to_string()),
                    state
                        .current_humidity
                        .map_or_else(|| "-".to_string(), |h| format!("{h:.0}%")),
                    state
                        .humidifier
                        .map_or_else(String::new, |h| format!(" | humidifier {}", h.option())),
                );
            }
        })
        .start()
        .await?;

    println!("Polling. Ctrl+C to stop.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("signal handler failed: {e}");
    }

    bridge.shutdown().await;
    Ok(())
}
