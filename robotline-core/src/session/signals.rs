//! Outbound UI signals
//!
//! The coordinator never renders anything itself. It fans out signals on a
//! broadcast channel and front ends subscribe to the ones they care about.

use tokio::sync::broadcast;

use super::thinking::ThinkingScope;

const SIGNAL_BUFFER_CAPACITY: usize = 256;

/// Severity of a user-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl NoticeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeLevel::Info => "info",
            NoticeLevel::Success => "success",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        }
    }
}

/// A toast-style notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    Notice(Notice),
    /// The UI should now reference this instance
    Navigate { instance_id: String },
    ScrollToBottom,
    /// Message input may be used again
    InputEnabled { scope: ThinkingScope },
    TimelineChanged,
    PlansChanged,
}

/// Cloneable sending half of the signal channel
#[derive(Debug, Clone)]
pub struct SignalSender {
    sender: broadcast::Sender<SessionSignal>,
}

impl Default for SignalSender {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSender {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(SIGNAL_BUFFER_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.sender.subscribe()
    }

    /// Send a signal. Having no subscribers is not an error.
    pub fn emit(&self, signal: SessionSignal) {
        let _ = self.sender.send(signal);
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(level = level.as_str(), message = %message, "Notice");
        self.emit(SessionSignal::Notice(Notice { level, message }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let signals = SignalSender::new();
        signals.emit(SessionSignal::ScrollToBottom);
    }

    #[test]
    fn test_subscriber_receives_notice() {
        let signals = SignalSender::new();
        let mut rx = signals.subscribe();
        signals.notify(NoticeLevel::Error, "boom");
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionSignal::Notice(Notice {
                level: NoticeLevel::Error,
                message: "boom".to_string()
            })
        );
    }
}
