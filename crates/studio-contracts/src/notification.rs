use std::fmt::Display;
use std::time::Duration;

use serde::Serialize;

pub const ERROR_NOTIFICATION_DURATION: Duration = Duration::from_secs(5);

/// User-facing message that the UI dismisses after `duration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl Notification {
    pub fn error(err: impl Display) -> Self {
        Self {
            message: format!("Error: {err}"),
            duration: ERROR_NOTIFICATION_DURATION,
        }
    }
}

fn serialize_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}
