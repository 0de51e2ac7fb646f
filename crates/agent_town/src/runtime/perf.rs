//! Rolling duration series for the tick, each tick step, each collaborator,
//! and decision cycles.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

const DEFAULT_SAMPLE_WINDOW: usize = 512;
const DEFAULT_DECISION_BUDGET_MS: f64 = 5_000.0;

const WARN_OVER_BUDGET_RATIO_PPM: u64 = 50_000;
const CRITICAL_OVER_BUDGET_RATIO_PPM: u64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PerfHealth {
    #[default]
    Unknown,
    Healthy,
    Warn,
    Critical,
}

impl PerfHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Warn => "warn",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerfSeriesSnapshot {
    pub samples_total: u64,
    pub samples_window: usize,
    pub budget_ms: f64,
    pub last_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub over_budget_total: u64,
    pub over_budget_ratio_ppm: u64,
}

impl PerfSeriesSnapshot {
    pub fn has_samples(&self) -> bool {
        self.samples_total > 0
    }

    fn is_critical(&self) -> bool {
        self.has_samples()
            && ((self.budget_ms > 0.0 && self.p95_ms > self.budget_ms * 2.0)
                || self.over_budget_ratio_ppm >= CRITICAL_OVER_BUDGET_RATIO_PPM)
    }

    fn is_warn(&self) -> bool {
        self.has_samples()
            && ((self.budget_ms > 0.0 && self.p95_ms > self.budget_ms)
                || self.over_budget_ratio_ppm >= WARN_OVER_BUDGET_RATIO_PPM)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TickPerfSnapshot {
    pub sample_window: usize,
    pub tick: PerfSeriesSnapshot,
    pub decision_cycle: PerfSeriesSnapshot,
    pub steps: BTreeMap<String, PerfSeriesSnapshot>,
    pub collaborators: BTreeMap<String, PerfSeriesSnapshot>,
    pub health: PerfHealth,
    /// Step with the highest p95, if any step has samples.
    pub bottleneck: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TickPerfCollector {
    sample_window: usize,
    tick_budget_ms: f64,
    tick: PerfSeries,
    decision_cycle: PerfSeries,
    steps: BTreeMap<String, PerfSeries>,
    collaborators: BTreeMap<String, PerfSeries>,
}

impl TickPerfCollector {
    pub fn new(tick_budget: Duration) -> Self {
        Self::with_sample_window(tick_budget, DEFAULT_SAMPLE_WINDOW)
    }

    pub fn with_sample_window(tick_budget: Duration, sample_window: usize) -> Self {
        let tick_budget_ms = duration_to_ms(tick_budget);
        Self {
            sample_window: sample_window.max(1),
            tick_budget_ms,
            tick: PerfSeries::new(tick_budget_ms),
            decision_cycle: PerfSeries::new(DEFAULT_DECISION_BUDGET_MS),
            steps: BTreeMap::new(),
            collaborators: BTreeMap::new(),
        }
    }

    pub fn record_tick(&mut self, duration: Duration) {
        self.tick.record(duration_to_ms(duration), self.sample_window);
    }

    pub fn record_step(&mut self, step: &str, duration: Duration) {
        let budget = self.tick_budget_ms;
        self.steps
            .entry(step.to_string())
            .or_insert_with(|| PerfSeries::new(budget))
            .record(duration_to_ms(duration), self.sample_window);
    }

    pub fn record_collaborator(&mut self, name: &str, duration: Duration) {
        let budget = self.tick_budget_ms;
        self.collaborators
            .entry(name.to_string())
            .or_insert_with(|| PerfSeries::new(budget))
            .record(duration_to_ms(duration), self.sample_window);
    }

    pub fn record_decision_cycle(&mut self, duration: Duration) {
        self.decision_cycle
            .record(duration_to_ms(duration), self.sample_window);
    }

    pub fn snapshot(&self) -> TickPerfSnapshot {
        let tick = self.tick.snapshot();
        let steps: BTreeMap<String, PerfSeriesSnapshot> = self
            .steps
            .iter()
            .map(|(name, series)| (name.clone(), series.snapshot()))
            .collect();
        let health = if !tick.has_samples() {
            PerfHealth::Unknown
        } else if tick.is_critical() {
            PerfHealth::Critical
        } else if tick.is_warn() {
            PerfHealth::Warn
        } else {
            PerfHealth::Healthy
        };
        let bottleneck = steps
            .iter()
            .filter(|(_, series)| series.has_samples() && series.p95_ms > 0.0)
            .max_by(|a, b| {
                a.1.p95_ms
                    .partial_cmp(&b.1.p95_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, _)| name.clone());
        TickPerfSnapshot {
            sample_window: self.sample_window,
            tick,
            decision_cycle: self.decision_cycle.snapshot(),
            collaborators: self
                .collaborators
                .iter()
                .map(|(name, series)| (name.clone(), series.snapshot()))
                .collect(),
            steps,
            health,
            bottleneck,
        }
    }

    pub fn reset(&mut self) {
        self.tick.reset();
        self.decision_cycle.reset();
        self.steps.clear();
        self.collaborators.clear();
    }
}

#[derive(Debug, Clone)]
struct PerfSeries {
    budget_ms: f64,
    window_samples: VecDeque<f64>,
    samples_total: u64,
    over_budget_total: u64,
    total_ms: f64,
    last_ms: f64,
    max_ms: f64,
}

impl PerfSeries {
    fn new(budget_ms: f64) -> Self {
        Self {
            budget_ms,
            window_samples: VecDeque::new(),
            samples_total: 0,
            over_budget_total: 0,
            total_ms: 0.0,
            last_ms: 0.0,
            max_ms: 0.0,
        }
    }

    fn record(&mut self, sample_ms: f64, sample_window: usize) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }
        self.samples_total = self.samples_total.saturating_add(1);
        self.total_ms += sample_ms;
        self.last_ms = sample_ms;
        self.max_ms = self.max_ms.max(sample_ms);
        if sample_ms > self.budget_ms {
            self.over_budget_total = self.over_budget_total.saturating_add(1);
        }
        self.window_samples.push_back(sample_ms);
        while self.window_samples.len() > sample_window {
            self.window_samples.pop_front();
        }
    }

    fn snapshot(&self) -> PerfSeriesSnapshot {
        let mut samples: Vec<f64> = self.window_samples.iter().copied().collect();
        samples.sort_by(|left, right| left.partial_cmp(right).unwrap_or(std::cmp::Ordering::Equal));
        let avg_ms = if self.samples_total > 0 {
            self.total_ms / self.samples_total as f64
        } else {
            0.0
        };
        let over_budget_ratio_ppm = if self.samples_total > 0 {
            self.over_budget_total.saturating_mul(1_000_000) / self.samples_total
        } else {
            0
        };
        PerfSeriesSnapshot {
            samples_total: self.samples_total,
            samples_window: samples.len(),
            budget_ms: self.budget_ms,
            last_ms: self.last_ms,
            avg_ms,
            max_ms: self.max_ms,
            p50_ms: percentile(&samples, 0.50),
            p95_ms: percentile(&samples, 0.95),
            over_budget_total: self.over_budget_total,
            over_budget_ratio_ppm,
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.budget_ms);
    }
}

fn duration_to_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn percentile(samples: &[f64], percentile: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let index = ((samples.len() - 1) as f64 * percentile.clamp(0.0, 1.0)).round() as usize;
    samples[index]
}
