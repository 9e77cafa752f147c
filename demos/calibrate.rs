use std::io::{self, BufRead, Write};
use tracing::{error, info};
use wattlers::{
    BtleplugTransport, CalibrationSide, CalibrationStep, PowerMeterError, PowerMeterSession,
    Result, SessionConfig, WizardInput,
};

/// Usage: `calibrate [left|right] <weight-kg>`
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let side = match args.next().as_deref() {
        Some("right" | "R" | "r") => CalibrationSide::Right,
        Some("left" | "L" | "l") | None => CalibrationSide::Left,
        Some(other) => {
            return Err(PowerMeterError::InvalidInput(format!(
                "unknown side {other:?}, expected left or right"
            )))
        }
    };
    let weight = args.next().unwrap_or_default();

    info!("⚖️  Wattlers Calibration Example");

    let config = SessionConfig::default();
    let transport = BtleplugTransport::new(&config).await?;
    let session = PowerMeterSession::new(transport, config);
    session.connect().await?;
    info!("✅ Connected");

    let mut input = Some(WizardInput {
        side: Some(side),
        weight: Some(weight),
    });
    let stdin = io::stdin();

    loop {
        let wizard = session.wizard().await;
        let step = wizard.step();

        println!("\n== {} ({}) ==", step.title(), wizard.side());
        println!("{}", wizard.instructions());
        print!("[Enter] {} ", step.action_label());
        let _ = io::stdout().flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() {
            break;
        }

        match session.advance_wizard(input.take()).await {
            Ok(CalibrationStep::SelectSide) => {
                info!("🎉 Calibration saved");
                break;
            }
            Ok(next) => info!("➡️  {}", next.title()),
            Err(e) => {
                error!("❌ {}", e);
                if step == CalibrationStep::SelectSide {
                    break;
                }
            }
        }
    }

    session.disconnect().await
}
