//! # Background Keep-Alive
//!
//! While channels are streaming the host must not suspend sample delivery,
//! even when no front-end is in the foreground. The controller asks a
//! `KeepAliveHost` for that grant and shows a persistent indicator for as
//! long as it holds it.

use crate::error::KeepAliveError;
use std::sync::Mutex;

/// User-visible notice shown while the grant is held
#[derive(Debug, Clone, PartialEq)]
pub struct Indicator {
    pub title: String,
    pub text: String,
    /// Always false: the user cannot dismiss the indicator while streaming
    pub dismissable: bool,
}

impl Indicator {
    pub fn persistent(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            dismissable: false,
        }
    }
}

/// Host mechanism that keeps the process running in the background
pub trait KeepAliveHost: Send + Sync {
    fn acquire(&self, indicator: &Indicator) -> Result<(), KeepAliveError>;
    fn release(&self);
}

/// Host for plain desktop processes, which are never suspended.
///
/// The indicator is written to the log instead of a notification area.
pub struct LogHost;

impl KeepAliveHost for LogHost {
    fn acquire(&self, indicator: &Indicator) -> Result<(), KeepAliveError> {
        log::info!("{}: {}", indicator.title, indicator.text);
        Ok(())
    }

    fn release(&self) {
        log::info!("Background streaming released");
    }
}

pub struct KeepAliveController {
    host: Box<dyn KeepAliveHost>,
    indicator: Indicator,
    active: Mutex<bool>,
}

impl KeepAliveController {
    pub fn new(host: Box<dyn KeepAliveHost>, indicator: Indicator) -> Self {
        Self {
            host,
            indicator,
            active: Mutex::new(false),
        }
    }

    /// Acquire the keep-alive grant. No-op if already held.
    pub fn start(&self) -> Result<(), KeepAliveError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if *active {
            return Ok(());
        }
        self.host.acquire(&self.indicator)?;
        *active = true;
        Ok(())
    }

    /// Release the grant. No-op if not held.
    pub fn stop(&self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if *active {
            self.host.release();
            *active = false;
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}
