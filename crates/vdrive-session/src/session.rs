use std::time::{SystemTime, UNIX_EPOCH};

/// Per-peer session state.
///
/// `active` implies both ephemeral keys are present in the keyring and a
/// session key has been derived; it is set only after a SESSION response
/// has been signed.
#[derive(Debug, Default)]
pub struct Session {
    /// Highest accepted inbound timestamp (ms), the replay floor
    pub last: i64,
    /// Peer clock offset, applied to outbound timestamps
    pub skew_ms: i64,
    pub active: bool,

    pub pairing_mode: bool,
    pub pairing_nonce: u64,
}

impl Session {
    pub fn reset(&mut self) {
        self.active = false;
    }

    /// Current time in the peer's clock domain (ms since the Unix epoch).
    pub fn time(&self) -> i64 {
        now_ms() + self.skew_ms
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_replay_floor() {
        let mut s = Session {
            last: 42,
            skew_ms: -7,
            active: true,
            ..Default::default()
        };

        s.reset();

        assert!(!s.active);
        assert_eq!(s.last, 42);
        assert_eq!(s.skew_ms, -7);
    }

    #[test]
    fn test_time_applies_skew() {
        let s = Session {
            skew_ms: -100_000,
            ..Default::default()
        };

        assert!(s.time() < now_ms());
    }
}
