use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Microseconds since the UNIX epoch.
///
/// Three sentinels bracket real times: [`Timestamp::ZERO`] (beginning of
/// time), [`Timestamp::END`] (end of time) and [`Timestamp::NONE`], which
/// marks an unset or invalid time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const END: Timestamp = Timestamp(i64::MAX);
    pub const NONE: Timestamp = Timestamp(i64::MIN);

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Timestamp(i64::try_from(since.as_micros()).unwrap_or(i64::MAX)),
            Err(before) => Timestamp(
                i64::try_from(before.duration().as_micros())
                    .map(|micros| -micros)
                    .unwrap_or(0),
            ),
        }
    }

    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    pub fn is_none(self) -> bool {
        self == Timestamp::NONE
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(micros).max(0))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timestamp::ZERO => f.write_str("TS_ZERO"),
            Timestamp::END => f.write_str("TS_ENDT"),
            Timestamp::NONE => f.write_str("TS_NONE"),
            Timestamp(micros) => write!(
                f,
                "{}.{:06}",
                micros.div_euclid(1_000_000),
                micros.rem_euclid(1_000_000)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Timestamp;

    #[test]
    fn sentinels_render_by_name() {
        assert_eq!(Timestamp::ZERO.to_string(), "TS_ZERO");
        assert_eq!(Timestamp::END.to_string(), "TS_ENDT");
        assert_eq!(Timestamp::NONE.to_string(), "TS_NONE");
        assert_eq!(Timestamp(1_500_000).to_string(), "1.500000");
    }

    #[test]
    fn subtraction_clamps_at_zero() {
        let t = Timestamp::from_secs(10);
        assert_eq!(t.saturating_sub(Duration::from_secs(4)), Timestamp::from_secs(6));
        assert_eq!(t.saturating_sub(Duration::from_secs(40)), Timestamp::ZERO);
        assert_eq!(Timestamp::END.saturating_add(Duration::from_secs(1)), Timestamp::END);
    }
}
