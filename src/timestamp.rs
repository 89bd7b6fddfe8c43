use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::{SystemTime, SystemTimeError};

/// A Unix timestamp represented as a `u64`, used in payment validity windows.
///
/// Encodes seconds since the Unix epoch (1970-01-01T00:00:00Z). Payment
/// payloads carry `validAfter` and `validBefore` as bare integers, and both
/// bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    /// The current wall-clock time, or the epoch if the system clock reads
    /// before 1970.
    pub fn now() -> Self {
        Self::try_now().unwrap_or(Self(0))
    }

    /// The current wall-clock time.
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self(now))
    }

    pub fn seconds_since_epoch(&self) -> u64 {
        self.0
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

impl From<u64> for UnixTimestamp {
    fn from(seconds: u64) -> Self {
        UnixTimestamp(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_bare_integer() {
        let ts = UnixTimestamp(1699999999);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1699999999");
        let back: UnixTimestamp = serde_json::from_str("1699999999").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(UnixTimestamp(5) < UnixTimestamp(6));
        assert_eq!(UnixTimestamp(5) + 1, UnixTimestamp(6));
    }
}
