//! Read instantaneous power and cumulative energy from a smart meter.
//!
//! ```sh
//! ROUTEB_ID=00112233... ROUTEB_PASSWORD=XXXX cargo run --example get_power -- /dev/ttyUSB0
//! ```

use routeb::{EnergyDirection, MeterBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let device = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let rbid = std::env::var("ROUTEB_ID")?;
    let password = std::env::var("ROUTEB_PASSWORD")?;

    println!("opening {device} (scan + PANA can take a couple of minutes)...");
    let meter = MeterBuilder::new(rbid, password)
        .device(&device)
        .build()
        .await?;

    let power = meter.get_instantaneous_power().await?;
    println!("instantaneous power: {power} W");

    let current = meter.get_instantaneous_current().await?;
    println!(
        "instantaneous current: R {:.1} A / T {:.1} A",
        current.r_amps, current.t_amps
    );

    match meter.get_cumulative_energy(EnergyDirection::Normal).await? {
        Some(kwh) => println!("cumulative energy: {kwh:.1} kWh"),
        None => println!("cumulative energy: no data"),
    }

    meter.close().await;
    Ok(())
}
