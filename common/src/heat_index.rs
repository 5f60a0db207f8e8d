pub fn celsius_to_fahrenheit(temp_c: f32) -> f32 {
    temp_c * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(temp_f: f32) -> f32 {
    (temp_f - 32.0) * 5.0 / 9.0
}

pub fn heat_index_c(temp_c: f32, humidity: f32) -> f32 {
    let t = celsius_to_fahrenheit(temp_c);
    let rh = humidity;

    let mut hi = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + rh * 0.094);

    if hi > 79.0 {
        hi = -42.379 + 2.049_015_2 * t + 10.143_331 * rh
            - 0.224_755_41 * t * rh
            - 0.006_837_83 * t * t
            - 0.054_817_17 * rh * rh
            + 0.001_228_74 * t * t * rh
            + 0.000_852_82 * t * rh * rh
            - 0.000_001_99 * t * t * rh * rh;

        if rh < 13.0 && (80.0..=112.0).contains(&t) {
            hi -= ((13.0 - rh) * 0.25) * ((17.0 - (t - 95.0).abs()) * 0.058_82).sqrt();
        } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
            hi += ((rh - 85.0) * 0.1) * ((87.0 - t) * 0.2);
        }
    }

    fahrenheit_to_celsius(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mild_conditions_use_simple_average() {
        let hi = heat_index_c(20.0, 50.0);
        assert!((hi - 19.36).abs() < 0.01, "got {hi}");
    }

    #[test]
    fn hot_humid_conditions_use_regression() {
        let hi = heat_index_c(30.0, 70.0);
        assert!((hi - 35.0).abs() < 0.2, "got {hi}");
        assert!(hi > 30.0);
    }

    #[test]
    fn nan_propagates() {
        assert!(heat_index_c(f32::NAN, 40.0).is_nan());
        assert!(heat_index_c(25.0, f32::NAN).is_nan());
    }
}
