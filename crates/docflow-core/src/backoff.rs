//! Capped exponential backoff
//!
//! Delays are deterministic: the same attempt always yields the same wait.

use std::time::Duration;

/// Delay before the status check following `attempt` previous checks
///
/// Computes `min(initial * multiplier^attempt, max)`. Multipliers below 1.0
/// are treated as 1.0 so the sequence never shrinks.
///
/// ```
/// use docflow_core::backoff::next_delay;
/// use std::time::Duration;
///
/// let initial = Duration::from_secs(2);
/// let max = Duration::from_secs(30);
///
/// assert_eq!(next_delay(0, initial, max, 2.0), Duration::from_secs(2));
/// assert_eq!(next_delay(3, initial, max, 2.0), Duration::from_secs(16));
/// assert_eq!(next_delay(4, initial, max, 2.0), Duration::from_secs(30));
/// ```
pub fn next_delay(attempt: u32, initial: Duration, max: Duration, multiplier: f64) -> Duration {
    if initial >= max {
        return max;
    }

    let multiplier = if multiplier.is_finite() {
        multiplier.max(1.0)
    } else {
        1.0
    };
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let scaled = initial.as_secs_f64() * multiplier.powi(exponent);

    // Overflow and out-of-range values saturate to the cap
    if !scaled.is_finite() || scaled >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(scaled).min(max)
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{ser, Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).map_err(|_| {
            ser::Error::custom(format!("duration {duration:?} overflows u64 milliseconds"))
        })?;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIAL: Duration = Duration::from_millis(2000);
    const MAX: Duration = Duration::from_millis(30000);

    #[test]
    fn test_first_attempt_uses_initial_delay() {
        assert_eq!(next_delay(0, INITIAL, MAX, 2.0), INITIAL);
    }

    #[test]
    fn test_doubling_sequence() {
        let delays: Vec<u64> = (0..6)
            .map(|attempt| next_delay(attempt, INITIAL, MAX, 2.0).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_non_decreasing_and_capped() {
        for multiplier in [1.0, 1.5, 2.0, 3.7, 10.0] {
            let mut previous = Duration::ZERO;
            for attempt in 0..200 {
                let delay = next_delay(attempt, INITIAL, MAX, multiplier);
                assert!(delay >= previous, "attempt {attempt} multiplier {multiplier}");
                assert!(delay <= MAX);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_huge_attempt_saturates() {
        assert_eq!(next_delay(u32::MAX, INITIAL, MAX, 2.0), MAX);
        assert_eq!(next_delay(5000, INITIAL, MAX, f64::MAX), MAX);
    }

    #[test]
    fn test_degenerate_multipliers() {
        assert_eq!(next_delay(10, INITIAL, MAX, 0.5), INITIAL);
        assert_eq!(next_delay(10, INITIAL, MAX, f64::NAN), INITIAL);
    }

    #[test]
    fn test_initial_above_max_is_capped() {
        let delay = next_delay(0, Duration::from_secs(60), MAX, 2.0);
        assert_eq!(delay, MAX);
    }
}
