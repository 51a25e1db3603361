//! Periodic RTCP report generation: receiver reports for subscribed media,
//! sender reports for published media (RFC 3550 §6.4).

mod receiver;
mod sender;

pub use receiver::{ReceiverStats, RtpIngest};
pub use sender::SenderStats;

use std::time::Duration;

/// Default report emission period. Overridable through the client/server
/// option structs, mainly so tests do not wait ten seconds.
pub const DEFAULT_REPORT_PERIOD: Duration = Duration::from_secs(10);

/// A run of this many or more consecutive missing packets is surfaced to
/// the application as a loss event.
pub const LOSS_EVENT_THRESHOLD: u64 = 10;
