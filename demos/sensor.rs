use std::{
    convert::Infallible,
    time::{Duration, Instant},
};

use latest_stage::{Producer, StageConfig, TriggeredStage};

/// A batch of readings taken from the sensor.
#[derive(Debug, Clone)]
struct Packet {
    readings: Vec<u32>,
    taken_at: Instant,
}

/// A stand-in for a slow device. Every read returns one more reading than the
/// previous one.
struct Sensor {
    reads: usize,
}

impl Producer<Packet> for Sensor {
    type Error = Infallible;

    fn produce(&mut self) -> Result<Packet, Self::Error> {
        // Simulate the device's latency.
        std::thread::sleep(Duration::from_millis(30));
        self.reads += 1;
        Ok(Packet {
            readings: (0..).take(self.reads).collect(),
            taken_at: Instant::now(),
        })
    }
}

fn main() {
    let started = Instant::now();
    // The stage owns a worker thread that talks to the sensor only when asked.
    let mut stage = TriggeredStage::with_config(
        Sensor { reads: 0 },
        StageConfig::new().with_name("sensor"),
    );
    stage.start().unwrap();

    for _ in 0..3 {
        // Asking for an update returns immediately. While the sensor is busy,
        // further requests are ignored instead of piling up.
        assert!(stage.request_update());
        assert!(!stage.request_update());
        println!("Updating: {}", stage.is_updating());

        // Block until the worker has published the new packet.
        let packet = stage.wait_get_latest().unwrap();
        println!(
            "Got packet {:?} taken {:?} after start",
            packet.readings,
            packet.taken_at.duration_since(started)
        );

        // Give the worker a moment to go back to waiting.
        while stage.is_updating() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // Dropping the stage would do the same, but this reports any problem.
    stage.shutdown().unwrap();
}

#[test]
fn runs() {
    main()
}
