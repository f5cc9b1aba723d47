//! Channel-access observers.
//!
//! Listeners are registered on a `ListenerRegistry` handed to the MAC at
//! construction time and are told about NAV changes and exchange timeouts.

use embassy_time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAccessNotification {
    NavStart(Duration),
    NavReset(Duration),
    AckTimeoutStart(Duration),
    AckTimeoutReset,
    CtsTimeoutStart(Duration),
    CtsTimeoutReset,
}

pub trait ChannelAccessListener {
    fn notify(&mut self, notification: ChannelAccessNotification);
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Box<dyn ChannelAccessListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Box<dyn ChannelAccessListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn notify(&mut self, notification: ChannelAccessNotification) {
        for listener in self.listeners.iter_mut() {
            listener.notify(notification);
        }
    }
}
