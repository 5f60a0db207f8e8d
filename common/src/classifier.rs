use log::debug;

use crate::{
    model::{InferenceEngine, InferenceError, MODEL_INPUTS, MODEL_OUTPUTS},
    types::{Classification, SensorSample, WeatherCondition, LABEL_COUNT},
};

/// Ties go to the lower index.
pub fn argmax_first(scores: &[f32; LABEL_COUNT]) -> (usize, f32) {
    let mut best_index = 0;
    let mut best_score = scores[0];
    for (index, &score) in scores.iter().enumerate().skip(1) {
        if score > best_score {
            best_score = score;
            best_index = index;
        }
    }
    (best_index, best_score)
}

pub fn classify<E>(engine: &mut E, sample: &SensorSample) -> Result<Classification, InferenceError>
where
    E: InferenceEngine + ?Sized,
{
    let input = engine.input_tensor()?;
    if input.len() != MODEL_INPUTS {
        return Err(InferenceError::InvalidModel(format!(
            "input tensor holds {} values, expected {MODEL_INPUTS}",
            input.len()
        )));
    }
    input[0] = sample.temperature_c;
    input[1] = sample.humidity;

    engine.invoke()?;

    let output = engine.output_tensor()?;
    let scores: [f32; LABEL_COUNT] = output.try_into().map_err(|_| {
        InferenceError::InvalidModel(format!(
            "output tensor holds {} values, expected {MODEL_OUTPUTS}",
            output.len()
        ))
    })?;

    for (index, score) in scores.iter().enumerate() {
        debug!("output score [{}]: {score}", index + 1);
    }

    let (index, score) = argmax_first(&scores);
    let condition = WeatherCondition::from_index(index)
        .ok_or_else(|| InferenceError::InvalidModel(format!("no label for index {index}")))?;

    Ok(Classification { condition, score })
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::model::{init_engine, EMBEDDED_MODEL};

    struct CannedScores {
        input: [f32; MODEL_INPUTS],
        scores: [f32; MODEL_OUTPUTS],
        invocations: usize,
    }

    impl CannedScores {
        fn new(scores: [f32; MODEL_OUTPUTS]) -> Self {
            Self {
                input: [0.0; MODEL_INPUTS],
                scores,
                invocations: 0,
            }
        }
    }

    impl InferenceEngine for CannedScores {
        fn input_tensor(&mut self) -> Result<&mut [f32], InferenceError> {
            Ok(&mut self.input)
        }

        fn invoke(&mut self) -> Result<(), InferenceError> {
            self.invocations += 1;
            Ok(())
        }

        fn output_tensor(&self) -> Result<&[f32], InferenceError> {
            Ok(&self.scores)
        }
    }

    struct FailingInvoke;

    impl InferenceEngine for FailingInvoke {
        fn input_tensor(&mut self) -> Result<&mut [f32], InferenceError> {
            Err(InferenceError::NotAllocated)
        }

        fn invoke(&mut self) -> Result<(), InferenceError> {
            Err(InferenceError::NotAllocated)
        }

        fn output_tensor(&self) -> Result<&[f32], InferenceError> {
            Err(InferenceError::NotAllocated)
        }
    }

    #[test]
    fn ties_resolve_to_lower_index() {
        assert_eq!(argmax_first(&[0.2, 0.9, 0.9, 0.1]), (1, 0.9));
        assert_eq!(argmax_first(&[0.5, 0.5, 0.5, 0.5]), (0, 0.5));
        assert_eq!(argmax_first(&[0.1, 0.2, 0.3, 0.4]), (3, 0.4));
    }

    #[test]
    fn negative_scores_still_pick_a_label() {
        assert_eq!(argmax_first(&[-3.0, -1.0, -2.0, -1.0]), (1, -1.0));
    }

    #[test]
    fn writes_temperature_then_humidity() {
        let mut engine = CannedScores::new([0.1, 0.1, 0.7, 0.1]);
        let sample = SensorSample::from_readings(21.5, 88.0);

        let result = classify(&mut engine, &sample).unwrap();

        assert_eq!(engine.input, [21.5, 88.0]);
        assert_eq!(engine.invocations, 1);
        assert_eq!(result.condition, WeatherCondition::Rainy);
        assert_eq!(result.label_index(), 2);
        assert_eq!(result.label(), "rainy");
    }

    #[test]
    fn consecutive_calls_do_not_share_state() {
        let sample = SensorSample::from_readings(20.0, 50.0);

        let mut high = CannedScores::new([0.1, 0.9, 0.0, 0.0]);
        assert_eq!(classify(&mut high, &sample).unwrap().label_index(), 1);

        // A previous high score must not shadow a lower maximum.
        let mut low = CannedScores::new([0.0, 0.0, 0.0, 0.3]);
        let result = classify(&mut low, &sample).unwrap();
        assert_eq!(result.condition, WeatherCondition::Sunny);
        assert_eq!(result.score, 0.3);
    }

    #[test]
    fn engine_failure_yields_no_classification() {
        let sample = SensorSample::from_readings(25.0, 60.0);
        assert!(classify(&mut FailingInvoke, &sample).is_err());
    }

    #[test]
    fn embedded_model_separates_conditions() {
        let mut engine = init_engine(EMBEDDED_MODEL, 12 * 1024).unwrap();
        let cases = [
            (25.0, 60.0, WeatherCondition::Cloudy),
            (12.0, 95.0, WeatherCondition::Foggy),
            (26.0, 92.0, WeatherCondition::Rainy),
            (32.0, 35.0, WeatherCondition::Sunny),
        ];

        for (temp, humidity, expected) in cases {
            let sample = SensorSample::from_readings(temp, humidity);
            let result = classify(&mut engine, &sample).unwrap();
            assert_eq!(result.condition, expected, "{temp}°C / {humidity}%");
        }
    }
}
