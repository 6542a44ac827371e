//! Watch session lifecycle events while polling power once a minute.
//!
//! Demonstrates how re-authentication cycles and transmission
//! restrictions show up on the event channel while calls keep working.

use std::time::Duration;

use routeb::MeterBuilder;

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
    let meter = MeterBuilder::new(
        std::env::var("ROUTEB_ID")?,
        std::env::var("ROUTEB_PASSWORD")?,
    )
    .device(&device)
    .build()
    .await?;

    let mut events = meter.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("session event: {event:?}");
        }
    });

    loop {
        match meter.get_instantaneous_power().await {
            Ok(power) => println!("{power} W"),
            Err(routeb::Error::NeedToReopen(reason)) => {
                eprintln!("session lost ({reason}), exiting");
                break;
            }
            Err(e) => eprintln!("read failed: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
    }

    meter.close().await;
    Ok(())
}
