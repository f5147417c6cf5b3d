// Astronomical data contract consumed by the target and sequencer layers.
//
// The coordinate math itself (rise/set, transforms) lives outside the engine;
// these types only carry the values the scheduler needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Equatorial coordinates of a target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Coordinates {
    /// Right ascension in decimal hours (0-24).
    pub ra_hours: f64,
    /// Declination in decimal degrees (-90 to +90).
    pub dec_degrees: f64,
}

/// Horizontal (alt/az) coordinates at the observer's location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct HorizontalCoordinates {
    pub altitude: f64,
    pub azimuth: f64,
}

/// Geographic location of the observer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ObserverLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation above sea level in meters.
    pub elevation: f64,
}

/// Time window during which a target satisfies its altitude constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Meridian transit time inside the window, when known.
    pub transit: Option<DateTime<Utc>>,
}

impl ObservabilityWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }
}

/// A single filter's exposure plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposurePlan {
    pub filter: String,
    /// Exposure duration in seconds.
    pub exposure: f64,
    pub planned_count: u32,
    #[serde(default)]
    pub completed_count: u32,
}

impl ExposurePlan {
    pub fn new(filter: impl Into<String>, exposure: f64, planned_count: u32) -> Self {
        Self {
            filter: filter.into(),
            exposure,
            planned_count,
            completed_count: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count >= self.planned_count
    }

    /// Remaining exposure time in seconds.
    pub fn remaining_secs(&self) -> f64 {
        f64::from(self.planned_count.saturating_sub(self.completed_count)) * self.exposure
    }

    /// Records one completed exposure, saturating at the planned count.
    pub fn record_completed(&mut self) {
        if self.completed_count < self.planned_count {
            self.completed_count += 1;
        }
    }
}

/// Which side of the pier the mount is on relative to the meridian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MeridianState {
    #[default]
    East,
    West,
    Transiting,
}

/// Meridian-flip bookkeeping for a target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MeridianFlipInfo {
    pub state: MeridianState,
    pub needs_flip: bool,
    /// Seconds until the target crosses the meridian (negative once past).
    pub seconds_to_meridian: f64,
    pub flip_completed: bool,
}

/// Astronomical configuration attached to a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetAstroConfig {
    #[serde(default)]
    pub coordinates: Coordinates,
    #[serde(default)]
    pub exposure_plans: Vec<ExposurePlan>,
    /// Index of the active exposure plan; equals `exposure_plans.len()` when
    /// all plans are exhausted.
    #[serde(default)]
    pub current_plan_index: usize,
    pub observability_window: Option<ObservabilityWindow>,
    #[serde(default)]
    pub horizontal: HorizontalCoordinates,
    #[serde(default)]
    pub meridian: MeridianFlipInfo,
    /// Scheduling priority, 1 (low) to 10 (high).
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Minimum altitude in degrees for the target to count as observable.
    #[serde(default)]
    pub min_altitude: f64,
}

fn default_priority() -> i32 {
    5
}

impl Default for TargetAstroConfig {
    fn default() -> Self {
        Self {
            coordinates: Coordinates::default(),
            exposure_plans: Vec::new(),
            current_plan_index: 0,
            observability_window: None,
            horizontal: HorizontalCoordinates::default(),
            meridian: MeridianFlipInfo::default(),
            priority: default_priority(),
            min_altitude: 0.0,
        }
    }
}

impl TargetAstroConfig {
    pub fn current_plan(&self) -> Option<&ExposurePlan> {
        self.exposure_plans.get(self.current_plan_index)
    }

    pub fn current_plan_mut(&mut self) -> Option<&mut ExposurePlan> {
        self.exposure_plans.get_mut(self.current_plan_index)
    }

    /// Advances to the next plan. Returns false once past the last plan.
    pub fn advance_plan(&mut self) -> bool {
        if self.current_plan_index < self.exposure_plans.len() {
            self.current_plan_index += 1;
        }
        self.current_plan_index < self.exposure_plans.len()
    }

    pub fn remaining_exposure_secs(&self) -> f64 {
        self.exposure_plans.iter().map(ExposurePlan::remaining_secs).sum()
    }

    /// Overall exposure progress across all plans, 0-100.
    pub fn exposure_progress(&self) -> f64 {
        let planned: u64 = self.exposure_plans.iter().map(|p| u64::from(p.planned_count)).sum();
        if planned == 0 {
            return 100.0;
        }
        let completed: u64 = self
            .exposure_plans
            .iter()
            .map(|p| u64::from(p.completed_count.min(p.planned_count)))
            .sum();
        completed as f64 / planned as f64 * 100.0
    }

    pub fn plans_complete(&self) -> bool {
        self.exposure_plans.iter().all(ExposurePlan::is_complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_containment() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 3, 2, 4, 0, 0).unwrap();
        let window = ObservabilityWindow { start, end, transit: None };
        assert!(window.contains(Utc.with_ymd_and_hms(2025, 3, 1, 23, 0, 0).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2025, 3, 2, 5, 0, 0).unwrap()));
        assert_eq!(window.duration_secs(), 8 * 3600);
    }

    #[test]
    fn exposure_plan_accounting() {
        let mut plan = ExposurePlan::new("Ha", 300.0, 4);
        assert_eq!(plan.remaining_secs(), 1200.0);
        plan.record_completed();
        plan.record_completed();
        assert_eq!(plan.remaining_secs(), 600.0);
        assert!(!plan.is_complete());
        plan.record_completed();
        plan.record_completed();
        assert!(plan.is_complete());
        // completed never exceeds planned
        plan.record_completed();
        assert_eq!(plan.completed_count, 4);
    }

    #[test]
    fn plan_advancement_stops_at_end() {
        let mut cfg = TargetAstroConfig::default();
        cfg.exposure_plans.push(ExposurePlan::new("L", 60.0, 2));
        cfg.exposure_plans.push(ExposurePlan::new("R", 60.0, 2));
        assert_eq!(cfg.current_plan().unwrap().filter, "L");
        assert!(cfg.advance_plan());
        assert_eq!(cfg.current_plan().unwrap().filter, "R");
        assert!(!cfg.advance_plan());
        assert!(cfg.current_plan().is_none());
        // index is clamped to plans.len()
        assert!(!cfg.advance_plan());
        assert_eq!(cfg.current_plan_index, 2);
    }

    #[test]
    fn progress_over_plans() {
        let mut cfg = TargetAstroConfig::default();
        cfg.exposure_plans.push(ExposurePlan::new("L", 60.0, 2));
        cfg.exposure_plans.push(ExposurePlan::new("R", 30.0, 2));
        cfg.exposure_plans[0].record_completed();
        cfg.exposure_plans[0].record_completed();
        assert!((cfg.exposure_progress() - 50.0).abs() < f64::EPSILON);
        assert!(!cfg.plans_complete());
    }
}
