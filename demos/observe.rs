// Connects to a fake heart rate monitor, subscribes to the measurement
// characteristic and prints the values it notifies.
//
// Run with: RUST_LOG=debug cargo run --example observe

use std::str::FromStr;
use std::time::Duration;

use futures::StreamExt;
use gattling::fake::{FakeCharacteristic, FakeHost, FakeProfile, FakeService};
use gattling::uuid::uuid_from_u16;
use gattling::{Address, CharacteristicProperties, ServiceHandle, SessionConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let heart_rate = FakeCharacteristic::new(uuid_from_u16(0x2A37),
                                             CharacteristicProperties::READ
                                             | CharacteristicProperties::NOTIFY)
        .with_value(vec![60]);
    let heart_rate_id = heart_rate.id();
    let profile = FakeProfile::new().with_service(FakeService::primary(uuid_from_u16(0x180D))
                                        .with_characteristic(heart_rate));

    let host = FakeHost::new();
    let id = host.add_device(Address::from_str("F1:E2:D3:C4:B5:A6")?, "HRM", profile);

    let session = SessionConfig::fake(host.clone()).start().await?;
    let device = session.declare_device(id.address().clone());

    let measurement = ServiceHandle::new(uuid_from_u16(0x180D), 0)
        .characteristic(uuid_from_u16(0x2A37), 0);
    let observer = device.subscribe(&measurement);
    let mut values = Box::pin(observer.values());

    device.connect().wait().await?;
    println!("Connected to {} ({})", device.name().unwrap_or_default(), device.address());
    for service in device.services() {
        println!("  service {}", service);
        for characteristic in device.characteristics(&service) {
            println!("    characteristic {}", characteristic);
        }
    }

    device.set_notify(&measurement, true).wait().await?;

    // The fake peripheral side, sending a few beats
    let feeder = tokio::spawn({
        let host = host.clone();
        let id = id.clone();
        async move {
            for bpm in [62u8, 64, 63, 70, 68] {
                tokio::time::sleep(Duration::from_millis(200)).await;
                host.notify(&id, heart_rate_id, vec![bpm]);
            }
        }
    });

    for _ in 0..5 {
        if let Some(value) = values.next().await {
            println!("heart rate: {} bpm", value[0]);
        }
    }
    feeder.await?;

    device.disconnect().wait().await?;
    Ok(())
}
