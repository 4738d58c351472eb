//! Task wiring.
//!
//! One tokio task per subsystem. The ANT+ and GPS tasks decode their inputs
//! and send `SensorMessage`s to the integration task, the only owner of the
//! `SensorStore`. Every tick snapshot goes down an ordered queue to the
//! session logger, which runs on the blocking pool and owns the log store.
//! Shutdown is a watch flag: each task leaves its loop, the logger drains
//! what is queued, and the ANT+ node is stopped on the blocking pool.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::ant::dummy::DummyAnt;
use crate::ant::{
    AbsentNode, AntConfig, AntDeviceType, AntFrame, AntManager, AntMode, AntNode, AntPage, AntSlot,
    DeviceKey, SearchCandidate,
};
use crate::config::{BindingStore, MemoryBindings, Settings};
use crate::error::{AntError, RuntimeError, SessionResult};
use crate::export::{self, Exporter};
use crate::gps::dummy::DummyGps;
use crate::gps::{ClockControl, GpsConfig, GpsFusion, NoClock};
use crate::integrate::{IntegratedSample, IntegrationEvent, Integrator, Stopwatch};
use crate::session::{ResetOutcome, SessionLogger};
use crate::store::{SensorMessage, SensorStore};
use crate::types::{GpsFix, ImuValues, ManualFix, StopwatchStatus};

const SENSOR_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 16;
const LOGGER_QUEUE: usize = 64;

type Reply<T> = oneshot::Sender<T>;
pub type TrackUpdate = (Option<DateTime<Utc>>, Vec<(f64, f64)>);

// ─── Messages ────────────────────────────────────────────────────────────────

/// Requests handled by the integration task.
pub enum Command {
    ToggleManual,
    Lap,
    Reset(Reply<SessionResult<ResetOutcome>>),
    Track { since: Option<DateTime<Utc>>, reply: Reply<SessionResult<TrackUpdate>> },
}

/// Requests handled by the ANT+ task.
pub enum AntCommand {
    Search(AntSlot, Reply<Result<(), AntError>>),
    StopSearch(Reply<Result<(), AntError>>),
    SearchResults(Reply<Vec<(u16, SearchCandidate)>>),
    Connect {
        slot: AntSlot,
        id: u16,
        device_type: AntDeviceType,
        reply: Reply<Result<(), AntError>>,
    },
    Disconnect(AntSlot, Reply<Result<Option<DeviceKey>, AntError>>),
}

#[derive(Clone, Debug)]
pub enum GpsInput {
    Fix(GpsFix),
    Manual(ManualFix),
}

enum LoggerMsg {
    Tick(Box<IntegratedSample>, DateTime<Utc>),
    Lap(DateTime<Utc>),
    Reset { manual: StopwatchStatus, reply: Reply<SessionResult<ResetOutcome>> },
    Track { since: Option<DateTime<Utc>>, reply: Reply<SessionResult<TrackUpdate>> },
}

// ─── Sources ─────────────────────────────────────────────────────────────────

/// Hardware seams. Frames, fixes and IMU readings are pushed through the handle.
pub struct Sources {
    pub ant_node: Box<dyn AntNode>,
    pub binding_store: Box<dyn BindingStore>,
    pub clock: Box<dyn ClockControl>,
}

impl Sources {
    /// No node, bindings kept in memory, system clock untouched.
    pub fn offline(settings: &Settings) -> Self {
        Self {
            ant_node: Box::new(AbsentNode),
            binding_store: Box::new(MemoryBindings::default()),
            clock: Box::new(NoClock::new(settings.gps.min_valid_date)),
        }
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<Command>,
    ant: mpsc::Sender<AntCommand>,
    ant_frames: mpsc::Sender<AntFrame>,
    gps: mpsc::Sender<GpsInput>,
    sensors: mpsc::Sender<SensorMessage>,
    sample: watch::Receiver<IntegratedSample>,
    shutdown: Arc<watch::Sender<bool>>,
}

fn push<T>(tx: &mpsc::Sender<T>, item: T, what: &str) -> Result<(), RuntimeError> {
    match tx.try_send(item) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            log::debug!("[runtime] {} queue full, dropping", what);
            Ok(())
        }
        Err(TrySendError::Closed(_)) => Err(RuntimeError::Closed),
    }
}

impl RuntimeHandle {
    async fn command(&self, cmd: Command) -> Result<(), RuntimeError> {
        self.commands.send(cmd).await.map_err(|_| RuntimeError::Closed)
    }

    async fn ant_request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> AntCommand,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.ant.send(make(tx)).await.map_err(|_| RuntimeError::Closed)?;
        rx.await.map_err(|_| RuntimeError::Closed)
    }

    pub async fn toggle_manual(&self) -> Result<(), RuntimeError> {
        self.command(Command::ToggleManual).await
    }

    pub async fn lap(&self) -> Result<(), RuntimeError> {
        self.command(Command::Lap).await
    }

    /// Export, archive and start a new session.
    pub async fn reset(&self) -> Result<ResetOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Reset(tx)).await?;
        Ok(rx.await.map_err(|_| RuntimeError::Closed)??)
    }

    pub async fn track(&self, since: Option<DateTime<Utc>>) -> Result<TrackUpdate, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Track { since, reply: tx }).await?;
        Ok(rx.await.map_err(|_| RuntimeError::Closed)??)
    }

    pub async fn search(&self, slot: AntSlot) -> Result<(), RuntimeError> {
        Ok(self.ant_request(|reply| AntCommand::Search(slot, reply)).await??)
    }

    pub async fn stop_search(&self) -> Result<(), RuntimeError> {
        Ok(self.ant_request(AntCommand::StopSearch).await??)
    }

    pub async fn search_results(&self) -> Result<Vec<(u16, SearchCandidate)>, RuntimeError> {
        self.ant_request(AntCommand::SearchResults).await
    }

    pub async fn connect(
        &self,
        slot: AntSlot,
        id: u16,
        device_type: AntDeviceType,
    ) -> Result<(), RuntimeError> {
        Ok(self.ant_request(|reply| AntCommand::Connect { slot, id, device_type, reply }).await??)
    }

    pub async fn disconnect(&self, slot: AntSlot) -> Result<Option<DeviceKey>, RuntimeError> {
        Ok(self.ant_request(|reply| AntCommand::Disconnect(slot, reply)).await??)
    }

    pub fn push_frame(&self, frame: AntFrame) -> Result<(), RuntimeError> {
        push(&self.ant_frames, frame, "ant frame")
    }

    pub fn push_fix(&self, fix: GpsFix) -> Result<(), RuntimeError> {
        push(&self.gps, GpsInput::Fix(fix), "gps")
    }

    pub fn push_manual_fix(&self, fix: ManualFix) -> Result<(), RuntimeError> {
        push(&self.gps, GpsInput::Manual(fix), "gps")
    }

    pub fn push_imu(&self, values: ImuValues) -> Result<(), RuntimeError> {
        push(&self.sensors, SensorMessage::Imu(values), "imu")
    }

    /// Latest integrated sample.
    pub fn sample(&self) -> IntegratedSample {
        self.sample.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IntegratedSample> {
        self.sample.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

pub struct Runtime {
    handle: RuntimeHandle,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Runtime {
    /// Spawn every task. Must be called from inside a tokio runtime.
    pub fn start(
        settings: &Settings,
        logger: SessionLogger,
        integrator: Integrator,
        sources: Sources,
    ) -> Self {
        let interval = settings.interval();
        let (sensor_tx, sensor_rx) = mpsc::channel(SENSOR_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (ant_cmd_tx, ant_cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (frame_tx, frame_rx) = mpsc::channel(SENSOR_QUEUE);
        let (gps_tx, gps_rx) = mpsc::channel(SENSOR_QUEUE);
        let (log_tx, log_rx) = mpsc::channel(LOGGER_QUEUE);
        let (sample_tx, sample_rx) = watch::channel(IntegratedSample::default());
        let (stopwatch_tx, stopwatch_rx) = watch::channel(Stopwatch::default());
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ant =
            AntManager::new(AntConfig::from(settings), sources.ant_node, sources.binding_store);
        let dummy_ant =
            (ant.mode() == AntMode::Dummy).then(|| DummyAnt::new(settings.dummy_seed, interval));
        let ant_task = AntTask {
            manager: ant,
            dummy: dummy_ant,
            interval,
            frames: frame_rx,
            commands: ant_cmd_rx,
            sensors: sensor_tx.clone(),
            stopwatch: stopwatch_rx.clone(),
            epoch: epoch_rx.clone(),
            shutdown: shutdown_rx.clone(),
        };

        let fusion = GpsFusion::new(GpsConfig::from(settings), sources.clock);
        let dummy_gps = settings
            .dummy_output
            .then(|| DummyGps::new(settings.dummy_position, settings.sensor_interval));
        let gps_task = GpsTask {
            fusion,
            dummy: dummy_gps,
            interval,
            input: gps_rx,
            sensors: sensor_tx.clone(),
            stopwatch: stopwatch_rx,
            epoch: epoch_rx,
            shutdown: shutdown_rx.clone(),
        };

        let integration_task = IntegrationTask {
            integrator,
            store: SensorStore::new(settings.ant.clone()),
            stopwatch: Stopwatch::default(),
            sensors: sensor_rx,
            commands: cmd_rx,
            logger: log_tx,
            sample: sample_tx,
            stopwatch_tx,
            epoch: epoch_tx,
            shutdown: shutdown_rx,
        };

        let exporters = export::enabled(settings.log.write_csv, settings.log.write_gpx);
        let tasks = vec![
            ("ant", tokio::spawn(ant_task.run())),
            ("gps", tokio::spawn(gps_task.run())),
            ("integrate", tokio::spawn(integration_task.run())),
            ("logger", tokio::task::spawn_blocking(move || logger_loop(logger, exporters, log_rx))),
        ];

        let handle = RuntimeHandle {
            commands: cmd_tx,
            ant: ant_cmd_tx,
            ant_frames: frame_tx,
            gps: gps_tx,
            sensors: sensor_tx,
            sample: sample_rx,
            shutdown: Arc::new(shutdown_tx),
        };
        Self { handle, tasks }
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn join(self) {
        self.handle.shutdown();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                log::error!("[runtime] {} task failed: {}", name, e);
            }
        }
        log::info!("[runtime] stopped");
    }
}

async fn publish(tx: &mpsc::Sender<SensorMessage>, msg: SensorMessage, who: &str) -> bool {
    if tx.send(msg).await.is_err() {
        log::info!("[{}] sensor channel closed, stopping", who);
        return false;
    }
    true
}

// ─── ANT+ task ───────────────────────────────────────────────────────────────

struct AntTask {
    manager: AntManager,
    dummy: Option<DummyAnt>,
    interval: Duration,
    frames: mpsc::Receiver<AntFrame>,
    commands: mpsc::Receiver<AntCommand>,
    sensors: mpsc::Sender<SensorMessage>,
    stopwatch: watch::Receiver<Stopwatch>,
    epoch: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
}

/// Run a blocking node call on the blocking pool, handing the manager back.
async fn on_blocking_pool(
    mut manager: AntManager,
    f: fn(&mut AntManager) -> Result<(), AntError>,
) -> Option<(AntManager, Result<(), AntError>)> {
    match tokio::task::spawn_blocking(move || {
        let r = f(&mut manager);
        (manager, r)
    })
    .await
    {
        Ok(out) => Some(out),
        Err(e) => {
            log::error!("[ant] blocking call failed: {}", e);
            None
        }
    }
}

impl AntTask {
    async fn run(mut self) {
        let Some((manager, started)) = on_blocking_pool(self.manager, AntManager::start).await
        else {
            return;
        };
        self.manager = manager;
        if let Err(e) = started {
            log::warn!("[ant] node start failed: {}", e);
        }
        if !self.publish_bindings().await {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = ticker.tick(), if self.dummy.is_some() => {
                    if !self.emit_dummy().await {
                        break;
                    }
                }
                Some(frame) = self.frames.recv() => {
                    let now = Instant::now();
                    let pages = self.manager.handle_frame(&frame, now);
                    if !self.forward(pages, now).await {
                        break;
                    }
                }
                Some(cmd) = self.commands.recv() => {
                    if !self.on_command(cmd).await {
                        break;
                    }
                }
                Ok(()) = self.epoch.changed() => self.manager.reset(),
            }
        }

        if let Some((_, Err(e))) = on_blocking_pool(self.manager, AntManager::stop).await {
            log::warn!("[ant] node stop failed: {}", e);
        }
        log::info!("[ant] stopped");
    }

    async fn emit_dummy(&mut self) -> bool {
        let manual = self.stopwatch.borrow().manual;
        let Some(dummy) = self.dummy.as_mut() else { return true };
        let pages = dummy.generate(self.manager.bindings(), manual);
        self.forward(pages, Instant::now()).await
    }

    async fn forward(&mut self, pages: Vec<(DeviceKey, AntPage)>, at: Instant) -> bool {
        for (device, page) in pages {
            if !publish(&self.sensors, SensorMessage::Ant { device, page, at }, "ant").await {
                return false;
            }
        }
        true
    }

    async fn publish_bindings(&mut self) -> bool {
        let bindings = self.manager.bindings().clone();
        publish(&self.sensors, SensorMessage::Bindings(bindings), "ant").await
    }

    async fn on_command(&mut self, cmd: AntCommand) -> bool {
        // a dropped reply receiver only means the caller gave up
        match cmd {
            AntCommand::Search(slot, reply) => {
                let _ = reply.send(self.manager.search(slot));
            }
            AntCommand::StopSearch(reply) => {
                let _ = reply.send(self.manager.stop_search());
            }
            AntCommand::SearchResults(reply) => {
                let _ = reply.send(self.manager.search_results());
            }
            AntCommand::Connect { slot, id, device_type, reply } => {
                let r = self.manager.connect(slot, id, device_type);
                let changed = r.is_ok();
                let _ = reply.send(r);
                if changed {
                    return self.publish_bindings().await;
                }
            }
            AntCommand::Disconnect(slot, reply) => {
                let r = self.manager.disconnect(slot);
                let changed = matches!(r, Ok(Some(_)));
                let _ = reply.send(r);
                if changed {
                    return self.publish_bindings().await;
                }
            }
        }
        true
    }
}

// ─── GPS task ────────────────────────────────────────────────────────────────

struct GpsTask {
    fusion: GpsFusion,
    dummy: Option<DummyGps>,
    interval: Duration,
    input: mpsc::Receiver<GpsInput>,
    sensors: mpsc::Sender<SensorMessage>,
    stopwatch: watch::Receiver<Stopwatch>,
    epoch: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
}

impl GpsTask {
    async fn run(mut self) {
        if self.dummy.is_some() {
            log::info!("[gps] using dummy fixes");
        }
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            let input = tokio::select! {
                _ = self.shutdown.changed() => break,
                Ok(()) = self.epoch.changed() => {
                    self.fusion.reset();
                    None
                }
                _ = ticker.tick(), if self.dummy.is_some() => {
                    self.dummy.as_mut().map(|d| GpsInput::Fix(d.next_fix()))
                }
                Some(input) = self.input.recv() => Some(input),
            };
            let status = self.stopwatch.borrow().status;
            let now = Instant::now();
            let values = match input {
                Some(GpsInput::Fix(fix)) => self.fusion.update(&fix, status, now),
                Some(GpsInput::Manual(m)) => self.fusion.update_manual(&m, status, now),
                None => self.fusion.values(),
            }
            .clone();
            if !publish(&self.sensors, SensorMessage::Gps(values), "gps").await {
                break;
            }
        }
        log::info!("[gps] stopped");
    }
}

// ─── Integration task ────────────────────────────────────────────────────────

struct IntegrationTask {
    integrator: Integrator,
    store: SensorStore,
    stopwatch: Stopwatch,
    sensors: mpsc::Receiver<SensorMessage>,
    commands: mpsc::Receiver<Command>,
    logger: mpsc::Sender<LoggerMsg>,
    sample: watch::Sender<IntegratedSample>,
    stopwatch_tx: watch::Sender<Stopwatch>,
    epoch: watch::Sender<u64>,
    shutdown: watch::Receiver<bool>,
}

impl IntegrationTask {
    async fn run(mut self) {
        loop {
            let sleep = tokio::time::sleep(self.integrator.wait());
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = self.shutdown.changed() => {
                        log::info!("[integrate] stopped");
                        return;
                    }
                    () = &mut sleep => break,
                    Some(msg) = self.sensors.recv() => self.store.apply(msg),
                    Some(cmd) = self.commands.recv() => {
                        if !self.on_command(cmd).await {
                            return;
                        }
                    }
                }
            }

            let started = Instant::now();
            let (sample, events) = self.integrator.tick(&self.store, &mut self.stopwatch, started);
            for event in &events {
                if let IntegrationEvent::GpsDistanceFallback { gps_diff } = event {
                    log::info!(
                        "[integrate] wheel sensor silent, using GPS distance ({:.1} m)",
                        gps_diff
                    );
                }
            }
            self.stopwatch_tx.send_replace(self.stopwatch);
            self.sample.send_replace(sample.clone());
            if !self.to_logger(LoggerMsg::Tick(Box::new(sample), Utc::now())).await {
                return;
            }
            self.integrator.finish_tick(started.elapsed());
        }
    }

    async fn to_logger(&mut self, msg: LoggerMsg) -> bool {
        if self.logger.send(msg).await.is_err() {
            log::error!("[integrate] logger queue closed, stopping");
            return false;
        }
        true
    }

    async fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::ToggleManual => {
                self.stopwatch.toggle_manual();
                self.stopwatch_tx.send_replace(self.stopwatch);
                true
            }
            Command::Lap => self.to_logger(LoggerMsg::Lap(Utc::now())).await,
            Command::Track { since, reply } => {
                self.to_logger(LoggerMsg::Track { since, reply }).await
            }
            Command::Reset(reply) => {
                let (tx, rx) = oneshot::channel();
                let manual = self.stopwatch.manual;
                if !self.to_logger(LoggerMsg::Reset { manual, reply: tx }).await {
                    return false;
                }
                let Ok(outcome) = rx.await else {
                    log::error!("[integrate] logger went away during reset");
                    return false;
                };
                if let Ok(ResetOutcome::Reset { .. }) = &outcome {
                    self.integrator.reset();
                    self.store.reset_totals();
                    self.stopwatch = Stopwatch::default();
                    self.stopwatch_tx.send_replace(self.stopwatch);
                    self.epoch.send_modify(|e| *e += 1);
                }
                let _ = reply.send(outcome);
                true
            }
        }
    }
}

// ─── Logger ──────────────────────────────────────────────────────────────────

/// Blocking consumer of the tick queue. Returns once every sender is gone
/// and the queue is drained.
fn logger_loop(
    mut logger: SessionLogger,
    exporters: Vec<Box<dyn Exporter>>,
    mut rx: mpsc::Receiver<LoggerMsg>,
) {
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            LoggerMsg::Tick(sample, at) => {
                if let Err(e) = logger.on_tick(&sample, at) {
                    log::error!("[logger] tick not recorded: {}", e);
                }
            }
            LoggerMsg::Lap(at) => {
                if let Err(e) = logger.count_laps(at) {
                    log::error!("[logger] lap not recorded: {}", e);
                }
            }
            LoggerMsg::Reset { manual, reply } => {
                let outcome = logger.reset_count(manual, &exporters);
                match &outcome {
                    Ok(ResetOutcome::Rejected(reason)) => {
                        log::info!("[logger] reset refused: {}", reason)
                    }
                    Err(e) => log::error!("[logger] reset failed: {}", e),
                    Ok(ResetOutcome::Reset { .. }) => {}
                }
                let _ = reply.send(outcome);
            }
            LoggerMsg::Track { since, reply } => {
                let _ = reply.send(logger.update_track(since));
            }
        }
    }
    log::info!("[logger] queue drained at tick {}, closing log", logger.count());
}
