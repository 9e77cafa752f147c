use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};
use wattlers::{
    telemetry::format_duration, BtleplugTransport, PowerMeterSession, Result, SessionConfig,
    SessionState,
};

const RECORD_FOR: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Wattlers Live Monitor Example");
    info!("Searching for power meters...");

    let config = SessionConfig::default();
    let transport = BtleplugTransport::new(&config).await?;
    let session = PowerMeterSession::new(transport, config);

    if let Err(e) = session.connect().await {
        error!("❌ Failed to connect to power meter: {}", e);
        return Err(e);
    }
    info!("✅ Connected");

    session.start_recording().await?;
    info!("⏺️  Recording for {} seconds", RECORD_FOR.as_secs());

    let mut monitor_interval = interval(Duration::from_secs(2));
    let start_time = Instant::now();
    let mut max_power = 0;

    while start_time.elapsed() < RECORD_FOR {
        monitor_interval.tick().await;

        let snapshot = session.snapshot().await;
        let readings = &snapshot.readings;
        max_power = max_power.max(readings.power);

        println!(
            "\n📊 {} [{}]",
            format_duration(snapshot.recording.elapsed_ms),
            snapshot.state
        );
        println!("┌─────────────────────────────────────────┐");
        println!("│ Power:   {:6} W                        │", readings.power);
        println!("│ Cadence: {:6} rpm                      │", readings.cadence);
        println!("│ Battery: {:6} %                        │", readings.battery_percent);
        println!("│ Samples: {:6}                          │", snapshot.recording.samples);
        println!("└─────────────────────────────────────────┘");

        for entry in readings.logs.iter().take(3) {
            println!("  📝 {entry}");
        }

        if let Some(message) = snapshot.status_message() {
            warn!("{}", message);
        }
        if snapshot.state == SessionState::Failed {
            break;
        }
    }

    match session.stop_recording().await {
        Ok(recording) => {
            println!("\n📈 Recording Summary:");
            println!("  Samples: {}", recording.samples().len());
            println!("  Max Power: {max_power} W");
            println!("  File: {}", recording.filename());
            println!("{}", String::from_utf8_lossy(&recording.to_csv()));
        }
        Err(e) => warn!("No recording captured: {}", e),
    }

    info!("🔌 Disconnecting...");
    if let Err(e) = session.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    } else {
        info!("✅ Disconnected successfully");
    }

    Ok(())
}
