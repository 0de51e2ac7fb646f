//! World clock: time of day and weather, advanced once per tick.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const MINUTES_PER_DAY: u64 = 24 * 60;
const MIN_WEATHER_SPELL_MINUTES: u64 = 60;
const MAX_WEATHER_SPELL_MINUTES: u64 = 240;
const DAY_START_MINUTE: u64 = 8 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Weather {
    #[default]
    Clear,
    Cloudy,
    Rain,
    Storm,
}

impl Weather {
    pub fn as_str(self) -> &'static str {
        match self {
            Weather::Clear => "clear",
            Weather::Cloudy => "cloudy",
            Weather::Rain => "rain",
            Weather::Storm => "storm",
        }
    }

    fn roll(rng: &mut StdRng) -> Self {
        match rng.gen_range(0..100) {
            0..=54 => Weather::Clear,
            55..=79 => Weather::Cloudy,
            80..=94 => Weather::Rain,
            _ => Weather::Storm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldClock {
    seed: u64,
    minutes_per_tick: u64,
    total_minutes: u64,
    weather: Weather,
    next_weather_change: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldTimeView {
    pub day: u64,
    pub hour: u64,
    pub minute: u64,
    pub time_of_day: String,
    pub weather: Weather,
}

impl WorldClock {
    pub fn new(seed: u64, minutes_per_tick: u64) -> Self {
        Self {
            seed,
            minutes_per_tick: minutes_per_tick.max(1),
            total_minutes: DAY_START_MINUTE,
            weather: Weather::Clear,
            next_weather_change: DAY_START_MINUTE + MIN_WEATHER_SPELL_MINUTES,
        }
    }

    /// Advances one tick. Weather rolls are seeded by the minute they happen at,
    /// so two clocks with the same seed stay in lockstep.
    pub fn advance(&mut self) -> Option<Weather> {
        self.total_minutes = self.total_minutes.saturating_add(self.minutes_per_tick);
        if self.total_minutes < self.next_weather_change {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed ^ self.total_minutes);
        let previous = self.weather;
        self.weather = Weather::roll(&mut rng);
        self.next_weather_change = self.total_minutes
            + rng.gen_range(MIN_WEATHER_SPELL_MINUTES..=MAX_WEATHER_SPELL_MINUTES);
        (previous != self.weather).then_some(self.weather)
    }

    pub fn weather(&self) -> Weather {
        self.weather
    }

    pub fn day(&self) -> u64 {
        self.total_minutes / MINUTES_PER_DAY
    }

    pub fn minute_of_day(&self) -> u64 {
        self.total_minutes % MINUTES_PER_DAY
    }

    pub fn view(&self) -> WorldTimeView {
        let minute_of_day = self.minute_of_day();
        let hour = minute_of_day / 60;
        let phase = match hour {
            5..=11 => "morning",
            12..=16 => "afternoon",
            17..=20 => "evening",
            _ => "night",
        };
        WorldTimeView {
            day: self.day(),
            hour,
            minute: minute_of_day % 60,
            time_of_day: phase.to_string(),
            weather: self.weather,
        }
    }
}

impl Default for WorldClock {
    fn default() -> Self {
        Self::new(0, 1)
    }
}
