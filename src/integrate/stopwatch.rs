use serde::{Deserialize, Serialize};

use crate::types::StopwatchStatus;

/// Manual (user) status plus the effective stopwatch status that autostop drives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stopwatch {
    pub manual: StopwatchStatus,
    pub status: StopwatchStatus,
}

impl Stopwatch {
    /// User start/stop. Forces the effective status to follow.
    pub fn toggle_manual(&mut self) -> StopwatchStatus {
        if self.manual != StopwatchStatus::Start {
            log::info!("->M START");
            self.manual = StopwatchStatus::Start;
            self.status = StopwatchStatus::Start;
        } else {
            log::info!("->M STOP");
            self.manual = StopwatchStatus::Stop;
            self.status = StopwatchStatus::Stop;
        }
        self.manual
    }

    pub fn toggle(&mut self) -> StopwatchStatus {
        self.status = self.status.toggled();
        log::info!("->{:?}", self.status);
        self.status
    }
}

/// Inputs to the autostop decision for one tick.
#[derive(Clone, Copy, Debug)]
pub struct AutostopInput {
    pub speed: Option<f64>,
    /// Accelerometer motion flag; `None` when absent
    pub moving: Option<bool>,
    pub ant_speed_enabled: bool,
    pub gps_seen: bool,
    pub dummy: bool,
}

/// Apply autostop while the ride is manually started. Returns the new status on a transition.
pub fn autostop(sw: &mut Stopwatch, input: AutostopInput, cutoff: f64) -> Option<StopwatchStatus> {
    if !sw.manual.is_running() {
        return None;
    }
    match input.speed {
        Some(speed) => {
            let flag_spd = speed >= cutoff;
            let flag_moving =
                input.moving.unwrap_or(true) || input.ant_speed_enabled || input.dummy;
            let should_run = flag_spd && flag_moving;
            (should_run != sw.status.is_running()).then(|| sw.toggle())
        }
        None => {
            let source_present = input.ant_speed_enabled || input.gps_seen;
            (source_present && sw.status.is_running()).then(|| sw.toggle())
        }
    }
}
