use approx::assert_relative_eq;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::time::{Duration, Instant};

use ridelog::ant::{
    AbsentNode, AntConfig, AntDeviceType, AntManager, AntSettings, AntSlot, DeviceKey, SlotBinding,
};
use ridelog::config::{MemoryBindings, Settings, WPrimeAlgorithm};
use ridelog::gps::{GpsConfig, GpsFusion, NoClock};
use ridelog::integrate::{
    IntegratedSample, IntegrationConfig, IntegrationEvent, Integrator, Stopwatch, WPrimeBalance,
};
use ridelog::session::{LoggerConfig, MemoryLogStore, ResumeOutcome, SessionLogger};
use ridelog::store::{SensorMessage, SensorStore};
use ridelog::types::{FixMode, GpsFix, StopwatchStatus};

fn t(i: u64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 2, 7, 30, 0).unwrap() + TimeDelta::seconds(i as i64)
}

fn started() -> Stopwatch {
    let mut sw = Stopwatch::default();
    sw.toggle_manual();
    sw
}

fn fix(lat: f64, lon: f64, hdop: f64) -> GpsFix {
    GpsFix {
        lat: Some(lat),
        lon: Some(lon),
        alt: Some(20.0),
        speed: Some(5.0),
        track: Some(0.0),
        mode: Some(FixMode::Fix3d),
        used_sats: Some(8),
        total_sats: Some(12),
        dop: [Some(1.5), Some(hdop), Some(1.2)],
        error: None,
        utc_time: None,
    }
}

fn memory_logger() -> SessionLogger {
    let store = Box::new(MemoryLogStore::new());
    SessionLogger::open(LoggerConfig::default(), store).unwrap().0
}

fn jsonl_config(dir: &tempfile::TempDir) -> LoggerConfig {
    LoggerConfig {
        path: dir.path().join("log.jsonl"),
        export_dir: dir.path().to_path_buf(),
        ..LoggerConfig::default()
    }
}

fn fusion(hdop_cutoff: f64) -> GpsFusion {
    let mut config = GpsConfig::default();
    config.dop_cutoff[1] = hdop_cutoff;
    let earliest = config.min_valid_date;
    GpsFusion::new(config, Box::new(NoClock::new(earliest)))
}

fn standard_power_page(events: u8, accumulated: u16, power: u16) -> [u8; 8] {
    let acc = accumulated.to_le_bytes();
    let pwr = power.to_le_bytes();
    [0x10, events, 0xFF, 90, acc[0], acc[1], pwr[0], pwr[1]]
}

#[test]
fn test_standard_power_pages_deplete_w_prime() {
    let settings = Settings { dummy_output: true, ..Settings::default() };
    let bindings = Box::new(MemoryBindings::default());
    let mut ant = AntManager::new(AntConfig::from(&settings), Box::new(AbsentNode), bindings);
    let meter = ant.bindings().enabled_device(AntSlot::Power).unwrap();
    let mut store = SensorStore::new(ant.bindings().clone());
    let mut integ = Integrator::new(IntegrationConfig::from(&settings));
    assert_eq!(integ.config().algorithm, WPrimeAlgorithm::Waterworth);
    let mut sw = started();
    let t0 = Instant::now();

    let mut prev = 100.0;
    for i in 0..10u64 {
        let now = t0 + Duration::from_secs(i);
        let payload = standard_power_page(i as u8, (200 * i) as u16, 200);
        for (device, page) in ant.decode(meter, &payload, now) {
            store.apply(SensorMessage::Ant { device, page, at: now });
        }
        let (s, _) = integ.tick(&store, &mut sw, now);
        assert_eq!(s.power, Some(200.0));
        let n = s.w_prime.normalized;
        assert!(n < prev, "tick {i}: {n} did not drop below {prev}");
        assert!((0.0..=100.0).contains(&n));
        prev = n;
    }
    // first page only primes the counters
    let (s, _) = integ.tick(&store, &mut sw, t0 + Duration::from_secs(9));
    assert_relative_eq!(s.accumulated_power, 1800.0);
}

#[test]
fn test_power_at_cp_keeps_differential_balance() {
    let mut wb = WPrimeBalance::new(250.0, 20000.0, WPrimeAlgorithm::Differential, 1.0);
    for _ in 0..600 {
        wb.update(250.0);
    }
    assert_eq!(wb.state().balance, 20000.0);
}

#[test]
fn test_distance_accrues_only_between_valid_fixes() {
    let mut gps = fusion(5.0);
    let t0 = Instant::now();
    let step = 1e-4;
    let mut held = None;
    for i in 0..6u64 {
        let hdop = if i % 2 == 0 { 1.0 } else { 9.0 };
        let now = t0 + Duration::from_secs(i);
        let v = gps.update(&fix(35.0 + step * i as f64, 139.0, hdop), StopwatchStatus::Start, now);
        if i % 2 == 0 {
            assert!(v.valid);
            held = v.lat;
        } else {
            assert!(!v.valid);
            assert_eq!(v.lat, held, "position moved on an invalid fix");
            assert_eq!(v.speed, None);
        }
    }
    let expected = ridelog::gps::distance_on_earth(35.0, 139.0, 35.0 + step * 4.0, 139.0);
    assert_relative_eq!(gps.values().distance, expected, max_relative = 1e-9);
}

fn tick_sample(i: u64, sw: Stopwatch) -> IntegratedSample {
    IntegratedSample {
        heart_rate: Some(110.0 + (i % 37) as f64),
        cadence: Some(if i % 5 == 0 { 0.0 } else { 70.0 + (i % 23) as f64 }),
        power: (i % 11 != 0).then(|| 150.0 + ((i * 7) % 90) as f64),
        speed: Some(7.0 + (i % 13) as f64 * 0.3),
        distance: i as f64 * 7.3,
        accumulated_power: i as f64 * 181.7,
        stopwatch: sw,
        ..IntegratedSample::default()
    }
}

fn ride(logger: &mut SessionLogger, ticks: std::ops::RangeInclusive<u64>) {
    let sw = started();
    for i in ticks {
        logger.on_tick(&tick_sample(i, sw), t(i)).unwrap();
        if i % 200 == 0 {
            logger.count_laps(t(i)).unwrap();
        }
    }
}

#[test]
fn test_crash_after_500_ticks_resumes_exact_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = jsonl_config(&dir);

    let (mut logger, outcome) = SessionLogger::open_jsonl(config.clone()).unwrap();
    assert_eq!(outcome, ResumeOutcome::Fresh);
    ride(&mut logger, 1..=500);
    assert_eq!(logger.lap(), 2);
    let before = (logger.lap(), logger.count_lap(), logger.count(), logger.stats().clone());
    drop(logger);

    let (mut resumed, outcome) = SessionLogger::open_jsonl(config).unwrap();
    let ResumeOutcome::Resumed(state) = outcome else { panic!("expected a resume") };
    assert_eq!((state.lap, state.count_lap, state.count), (2, 100, 500));
    let after = (resumed.lap(), resumed.count_lap(), resumed.count(), resumed.stats().clone());
    assert_eq!(after, before);

    // and the resumed run stays in step with one that never stopped
    let mut straight = memory_logger();
    ride(&mut straight, 1..=650);
    ride(&mut resumed, 501..=650);
    assert_eq!(resumed.lap(), straight.lap());
    assert_eq!(resumed.count_lap(), straight.count_lap());
    assert_eq!(resumed.stats(), straight.stats());
}

#[test]
fn test_resume_keeps_lap_ascent_non_negative() {
    let dir = tempfile::tempdir().unwrap();
    let config = jsonl_config(&dir);
    let (mut logger, _) = SessionLogger::open_jsonl(config.clone()).unwrap();
    let mut integ = Integrator::new(IntegrationConfig::default());
    let mut store = SensorStore::default();
    let mut sw = started();
    let t0 = Instant::now();
    for i in 1..=500u64 {
        store.imu.total_ascent = Some(i as f64 * 0.24);
        store.imu.total_descent = Some(i as f64 * 0.1);
        let (sample, _) = integ.tick(&store, &mut sw, t0 + Duration::from_secs(i));
        logger.on_tick(&sample, t(i)).unwrap();
        if i == 400 {
            logger.count_laps(t(i)).unwrap();
        }
    }
    drop(logger);

    let (mut resumed, outcome) = SessionLogger::open_jsonl(config).unwrap();
    let ResumeOutcome::Resumed(state) = outcome else { panic!("expected a resume") };
    assert_relative_eq!(state.total_ascent.unwrap(), 120.0, max_relative = 1e-9);
    let mut integ = Integrator::new(IntegrationConfig::default());
    integ.restore(state.distance, state.accumulated_power);
    integ.restore_climb(state.total_ascent, state.total_descent);

    // the barometer restarts its totals after the crash
    let mut store = SensorStore::default();
    store.imu.total_ascent = Some(3.0);
    store.imu.total_descent = Some(0.0);
    let (sample, _) = integ.tick(&store, &mut sw, t0 + Duration::from_secs(501));
    resumed.on_tick(&sample, t(501)).unwrap();

    let row = resumed.store().index().last_row().cloned().unwrap();
    assert_relative_eq!(row.total_ascent.unwrap(), 123.0, max_relative = 1e-9);
    assert_relative_eq!(row.lap_total_ascent, 123.0 - 96.0, max_relative = 1e-9);
    assert!(row.lap_total_descent >= 0.0);
}

#[test]
fn test_silent_wheel_sensor_uses_gps_for_the_whole_ride() {
    let wheel = DeviceKey::new(21, AntDeviceType::SpeedAndCadence);
    let mut bindings = AntSettings::default();
    bindings.slots.insert(AntSlot::Speed, SlotBinding { enabled: true, device: Some(wheel) });
    let mut store = SensorStore::new(bindings);
    store.imu.moving = Some(true);

    let mut gps = fusion(99.0);
    let mut integ = Integrator::new(IntegrationConfig::default());
    let mut logger = memory_logger();
    let mut sw = started();
    let t0 = Instant::now();
    let step = 5.0 / 111_195.0;

    let mut fallbacks = 0;
    for i in 0..=1000u64 {
        let now = t0 + Duration::from_secs(i);
        let values = gps.update(&fix(35.0 + step * i as f64, 139.0, 1.0), sw.status, now).clone();
        store.apply(SensorMessage::Gps(values));
        let (sample, events) = integ.tick(&store, &mut sw, now);
        fallbacks += events
            .iter()
            .filter(|e| matches!(e, IntegrationEvent::GpsDistanceFallback { .. }))
            .count();
        assert!(sample.stopwatch.status.is_running(), "autostop tripped at tick {i}");
        logger.on_tick(&sample, t(i)).unwrap();
    }

    assert_eq!(fallbacks, 1);
    let last = logger.store().index().last_row().cloned().unwrap();
    assert_relative_eq!(last.distance, 5000.0, max_relative = 1e-3);
    assert_relative_eq!(last.distance, last.gps_distance, max_relative = 1e-9);
    assert_eq!(last.speed, Some(5.0));
}
