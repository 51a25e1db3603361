use std::ops::Add;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Offset in seconds between the unix epoch and the NTP epoch (1900-01-01).
const UNIX_TO_NTP_SECS: u64 = 0x83AA_7E80;

/// Encodes a wallclock time as an RFC 5905 64-bit NTP timestamp: seconds
/// since 1900 UTC in the upper 32 bits, fraction in the lower 32 bits.
pub fn ntp_encode(t: SystemTime) -> u64 {
    let u = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos() as u64;

    let mut s = u / 1_000_000_000;
    s += UNIX_TO_NTP_SECS;
    let mut f = u % 1_000_000_000;
    f <<= 32;
    f /= 1_000_000_000;
    s <<= 32;

    s | f
}

/// Inverse of [`ntp_encode`]. NTP times before the unix epoch decode to the
/// unix epoch.
pub fn ntp_decode(t: u64) -> SystemTime {
    let s = (t >> 32).saturating_sub(UNIX_TO_NTP_SECS);
    let mut f = t & 0xFFFF_FFFF;
    f *= 1_000_000_000;
    f >>= 32;
    UNIX_EPOCH + Duration::new(s, f as u32)
}

/// The middle 32 bits of an NTP timestamp, as carried in the LSR field of a
/// reception report (RFC 3550 §6.4.1).
pub fn ntp_middle(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// A monotonic instant paired with the wallclock at capture time, so NTP
/// timestamps can be produced from `Instant` arithmetic without re-reading
/// the system clock.
#[derive(Debug, Copy, Clone)]
pub struct SystemInstant {
    instant: Instant,
    duration_since_unix_epoch: Duration,
}

impl SystemInstant {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            duration_since_unix_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0)),
        }
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    pub fn system_time_at(&self, now: Instant) -> SystemTime {
        UNIX_EPOCH.add(
            now.duration_since(self.instant)
                .add(self.duration_since_unix_epoch),
        )
    }

    pub fn ntp(&self, now: Instant) -> u64 {
        ntp_encode(self.system_time_at(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_round_trip() {
        let t = UNIX_EPOCH + Duration::new(1_502_551_800, 250_000_000);
        let ntp = ntp_encode(t);
        let back = ntp_decode(ntp);
        let diff = back
            .duration_since(t)
            .unwrap_or_else(|_| t.duration_since(back).unwrap());
        // fraction resolution is 2^-32 s
        assert!(diff < Duration::from_nanos(2));
    }

    #[test]
    fn test_ntp_epoch_offset() {
        let ntp = ntp_encode(UNIX_EPOCH);
        assert_eq!(ntp >> 32, UNIX_TO_NTP_SECS);
        assert_eq!(ntp & 0xFFFF_FFFF, 0);
    }

    #[test]
    fn test_ntp_middle() {
        let ntp = 0x1122_3344_5566_7788u64;
        assert_eq!(ntp_middle(ntp), 0x3344_5566);
    }

    #[test]
    fn test_system_instant_advances() {
        let si = SystemInstant::now();
        let later = si.instant() + Duration::from_secs(2);
        let a = si.ntp(si.instant());
        let b = si.ntp(later);
        assert_eq!((b >> 32) - (a >> 32), 2);
    }
}
