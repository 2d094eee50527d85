use chrono::{DateTime, Duration, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const READING_INTERVAL_MINUTES: i64 = 5;
pub const SOURCE: &str = "mock_api";

const BASE_POWER_W: [f64; 3] = [1500.0, 2000.0, 1200.0];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub power_w: f64,
    pub energy_wh: f64,
    pub voltage: f64,
    pub temp_c: f64,
    pub occupancy: bool,
    pub source: String,
}

/// Nominal draw of the n-th simulated meter.
pub fn base_power(device_index: usize) -> f64 {
    BASE_POWER_W[device_index % BASE_POWER_W.len()]
}

/// One reading every five minutes from `start` through `end`, both included.
pub fn generate_readings(
    rng: &mut impl Rng,
    device_id: &str,
    base_power_w: f64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<Reading> {
    let mut readings = Vec::new();
    let mut current = start;

    while current <= end {
        readings.push(generate_reading(rng, device_id, base_power_w, current));
        current += Duration::minutes(READING_INTERVAL_MINUTES);
    }

    readings
}

fn generate_reading(
    rng: &mut impl Rng,
    device_id: &str,
    base_power_w: f64,
    timestamp: DateTime<Utc>,
) -> Reading {
    let hour = timestamp.hour();

    // Daily load curve: lowest around midnight, peaking mid-afternoon
    let time_factor = 0.3 + 0.7 * (1.0 + ((hour as f64 - 6.0) * PI / 12.0).sin()) / 2.0;
    let mut power_w = base_power_w * time_factor * gauss(rng, 1.0, 0.15);

    if rng.gen_bool(0.05) {
        power_w *= rng.gen_range(2.5..4.0); // 5% spikes
    }

    let energy_wh = power_w * (READING_INTERVAL_MINUTES as f64 / 60.0);

    Reading {
        device_id: device_id.to_string(),
        timestamp,
        power_w: round_to(power_w, 2),
        energy_wh: round_to(energy_wh, 2),
        voltage: round_to(gauss(rng, 120.0, 2.0), 1),
        temp_c: round_to(gauss(rng, 22.0, 3.0), 1),
        occupancy: (7..=23).contains(&hour),
        source: SOURCE.to_string(),
    }
}

/// Normal draw via the Box-Muller transform.
fn gauss(rng: &mut impl Rng, mean: f64, std_dev: f64) -> f64 {
    // gen::<f64>() is in [0, 1); flip it so ln() never sees zero
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
    mean + std_dev * z
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_readings_cover_window_inclusively() {
        let mut rng = StdRng::seed_from_u64(7);
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let end = start + Duration::hours(1);

        let readings = generate_readings(&mut rng, "device_001", 1500.0, start, end);

        assert_eq!(readings.len(), 13);
        assert_eq!(readings.first().unwrap().timestamp, start);
        assert_eq!(readings.last().unwrap().timestamp, end);
    }

    #[test]
    fn test_empty_when_end_before_start() {
        let mut rng = StdRng::seed_from_u64(7);
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let readings =
            generate_readings(&mut rng, "device_001", 1500.0, start, start - Duration::minutes(1));

        assert!(readings.is_empty());
    }

    #[test]
    fn test_reading_fields() {
        let mut rng = StdRng::seed_from_u64(42);
        let night = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 5, 1, 19, 0, 0).unwrap();

        let at_night = generate_reading(&mut rng, "device_002", 2000.0, night);
        let in_evening = generate_reading(&mut rng, "device_002", 2000.0, evening);

        assert!(!at_night.occupancy);
        assert!(in_evening.occupancy);
        assert_eq!(at_night.source, "mock_api");
        assert!((at_night.energy_wh - at_night.power_w * 5.0 / 60.0).abs() < 0.01);
    }

    #[test]
    fn test_voltage_and_temperature_centered() {
        let mut rng = StdRng::seed_from_u64(3);
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let readings =
            generate_readings(&mut rng, "device_001", 1500.0, start, start + Duration::days(7));
        let n = readings.len() as f64;
        let voltage = readings.iter().map(|r| r.voltage).sum::<f64>() / n;
        let temp_c = readings.iter().map(|r| r.temp_c).sum::<f64>() / n;

        assert!((voltage - 120.0).abs() < 0.5, "mean voltage {}", voltage);
        assert!((temp_c - 22.0).abs() < 0.5, "mean temperature {}", temp_c);
        assert!(readings.iter().all(|r| r.power_w > 0.0));
    }

    #[test]
    fn test_base_power_cycles() {
        assert_eq!(base_power(0), 1500.0);
        assert_eq!(base_power(1), 2000.0);
        assert_eq!(base_power(3), 1500.0);
    }
}
