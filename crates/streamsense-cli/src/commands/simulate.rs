//! Synthetic device readings with labelled anomalies.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use streamsense_core::Reading;
use streamsense_core::reading::parse_timestamp;

const BUILDINGS: &[&str] = &["Building_A", "Building_B", "Building_C"];

pub struct SimulateCommandConfig<'a> {
    pub devices: usize,
    pub readings: usize,
    pub interval_secs: i64,
    pub anomaly_rate: f64,
    pub start: Option<&'a str>,
    pub seed: Option<u64>,
    pub output: Option<&'a Path>,
}

pub fn run(cfg: SimulateCommandConfig<'_>) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&cfg.anomaly_rate),
        "--anomaly-rate must be within 0.0..=1.0, got {}",
        cfg.anomaly_rate
    );
    ensure!(cfg.interval_secs > 0, "--interval-secs must be positive");

    let span = i64::try_from(cfg.readings)
        .ok()
        .and_then(|n| n.checked_mul(cfg.interval_secs))
        .and_then(TimeDelta::try_seconds);
    let Some(span) = span else {
        anyhow::bail!(
            "{} readings every {}s is too long a span to simulate",
            cfg.readings,
            cfg.interval_secs
        );
    };
    let start = match cfg.start {
        Some(s) => parse_timestamp(s).context("parsing --start")?,
        None => Utc::now()
            .checked_sub_signed(span)
            .context("simulated span reaches before the earliest representable time")?,
    };
    ensure!(
        start.checked_add_signed(span).is_some(),
        "simulated span runs past the latest representable time"
    );
    let rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut sim = Simulator::new(cfg.devices, cfg.anomaly_rate, rng);

    let mut out: Box<dyn Write> = match cfg.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };

    let mut anomalies = 0usize;
    for step in 0..cfg.readings {
        let ts = start + TimeDelta::seconds(cfg.interval_secs * step as i64);
        for reading in sim.tick(ts) {
            if reading.labeled_anomaly == Some(true) {
                anomalies += 1;
            }
            out.write_all(&reading.to_payload())?;
            out.write_all(b"\n")?;
        }
    }
    out.flush()?;
    log::info!(
        "generated {} reading(s) for {} device(s), {anomalies} labelled anomalous",
        cfg.readings * cfg.devices,
        cfg.devices
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Injected {
    TemperatureSpike,
    TemperatureDrop,
    VibrationSpike,
    Combined,
}

impl Injected {
    fn label(self) -> &'static str {
        match self {
            Self::TemperatureSpike => "temperature_spike",
            Self::TemperatureDrop => "temperature_drop",
            Self::VibrationSpike => "vibration_spike",
            Self::Combined => "combined",
        }
    }
}

struct Device {
    id: String,
    building: &'static str,
    floor: i64,
    room: String,
    base_temperature: f64,
    base_vibration: f64,
}

pub struct Simulator<R: Rng> {
    devices: Vec<Device>,
    anomaly_rate: f64,
    rng: R,
}

impl<R: Rng> Simulator<R> {
    pub fn new(devices: usize, anomaly_rate: f64, mut rng: R) -> Self {
        let devices = (0..devices)
            .map(|i| {
                let floor = rng.random_range(1..=5);
                Device {
                    id: format!("sensor_{:04}", i + 1),
                    building: BUILDINGS[i % BUILDINGS.len()],
                    floor,
                    room: format!("Room_{floor}{:02}", rng.random_range(1..=20u32)),
                    base_temperature: rng.random_range(20.0..24.0),
                    base_vibration: rng.random_range(0.8..1.4),
                }
            })
            .collect();
        Self {
            devices,
            anomaly_rate: anomaly_rate.clamp(0.0, 1.0),
            rng,
        }
    }

    /// One reading per device at `ts`.
    pub fn tick(&mut self, ts: DateTime<Utc>) -> Vec<Reading> {
        let mut out = Vec::with_capacity(self.devices.len());
        for i in 0..self.devices.len() {
            let injected = if self.rng.random_bool(self.anomaly_rate) {
                Some(match self.rng.random_range(0..4u8) {
                    0 => Injected::TemperatureSpike,
                    1 => Injected::TemperatureDrop,
                    2 => Injected::VibrationSpike,
                    _ => Injected::Combined,
                })
            } else {
                None
            };
            let device = &self.devices[i];
            let mut temperature = device.base_temperature + self.rng.random_range(-0.5..0.5);
            let mut vibration = device.base_vibration + self.rng.random_range(-0.1..0.1);
            match injected {
                Some(Injected::TemperatureSpike) => temperature = self.rng.random_range(35.0..42.0),
                Some(Injected::TemperatureDrop) => temperature = self.rng.random_range(12.0..16.0),
                Some(Injected::VibrationSpike) => vibration = self.rng.random_range(3.8..5.0),
                Some(Injected::Combined) => {
                    temperature = self.rng.random_range(35.0..42.0);
                    vibration = self.rng.random_range(3.8..5.0);
                }
                None => {}
            }

            let mut reading = Reading::new(&device.id, ts, round2(temperature), round2(vibration))
                .with_location(device.building, device.floor, &device.room)
                .with_device_type("industrial_sensor");
            reading.labeled_anomaly = Some(injected.is_some());
            reading.anomaly_type = injected.map(|a| a.label().to_string());
            out.push(reading);
        }
        out
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
