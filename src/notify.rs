use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify_rust::{Notification, Timeout};

use crate::session::Notice;

const APP_NAME: &str = "Commerce Assistant";

/// How long an error banner stays visible in the window.
pub const BANNER_TTL: Duration = Duration::from_secs(3);

/// In-window error banner with its own expiry.
#[derive(Debug, Clone)]
pub struct Banner {
    pub message: String,
    shown_at: Instant,
}

impl Banner {
    pub fn new(notice: &Notice) -> Self {
        Banner {
            message: notice.message.clone(),
            shown_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.shown_at) >= BANNER_TTL
    }
}

fn desktop_notification(notice: &Notice) -> Notification {
    let mut notification = Notification::new();
    notification
        .appname(APP_NAME)
        .summary(APP_NAME)
        .body(&notice.message)
        .timeout(Timeout::Milliseconds(BANNER_TTL.as_millis() as u32));
    notification
}

/// Raise a desktop notification. Blocks on the notification daemon, so run it off the UI thread.
pub fn show_desktop(notice: &Notice) -> Result<()> {
    desktop_notification(notice)
        .show()
        .context("Failed to show desktop notification")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> Notice {
        Notice {
            message: "Failed to contact backend.".to_string(),
        }
    }

    #[test]
    fn test_banner_expires_after_ttl() {
        let banner = Banner::new(&notice());
        assert_eq!(banner.message, "Failed to contact backend.");
        assert!(!banner.is_expired(banner.shown_at));
        assert!(!banner.is_expired(banner.shown_at + Duration::from_millis(2999)));
        assert!(banner.is_expired(banner.shown_at + BANNER_TTL));
    }

    #[test]
    fn test_desktop_notification_carries_message() {
        let notification = desktop_notification(&notice());
        assert_eq!(notification.summary, APP_NAME);
        assert_eq!(notification.body, "Failed to contact backend.");
    }
}
