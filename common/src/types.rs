use serde::{Deserialize, Serialize};

use crate::heat_index::heat_index_c;

pub const LABEL_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeatherCondition {
    Cloudy,
    Foggy,
    Rainy,
    Sunny,
}

impl WeatherCondition {
    pub const ALL: [WeatherCondition; LABEL_COUNT] =
        [Self::Cloudy, Self::Foggy, Self::Rainy, Self::Sunny];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cloudy => "cloudy",
            Self::Foggy => "foggy",
            Self::Rainy => "rainy",
            Self::Sunny => "sunny",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Cloudy => 0,
            Self::Foggy => 1,
            Self::Rainy => 2,
            Self::Sunny => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSample {
    pub temperature_c: f32,
    pub humidity: f32,
    pub heat_index_c: f32,
}

impl SensorSample {
    pub fn from_readings(temperature_c: f32, humidity: f32) -> Self {
        Self {
            temperature_c,
            humidity,
            heat_index_c: heat_index_c(temperature_c, humidity),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.temperature_c.is_finite() && self.humidity.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub condition: WeatherCondition,
    pub score: f32,
}

impl Classification {
    pub fn label_index(&self) -> usize {
        self.condition.index()
    }

    pub fn label(&self) -> &'static str {
        self.condition.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_follow_index_order() {
        let labels: Vec<_> = WeatherCondition::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(labels, ["cloudy", "foggy", "rainy", "sunny"]);

        for (index, condition) in WeatherCondition::ALL.iter().enumerate() {
            assert_eq!(condition.index(), index);
            assert_eq!(WeatherCondition::from_index(index), Some(*condition));
        }
        assert_eq!(WeatherCondition::from_index(LABEL_COUNT), None);
    }

    #[test]
    fn failed_reading_is_not_valid() {
        let sample = SensorSample::from_readings(f32::NAN, 55.0);
        assert!(!sample.is_valid());
        assert!(sample.heat_index_c.is_nan());
    }
}
