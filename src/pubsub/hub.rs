use async_broadcast::{InactiveReceiver, Sender};
use dashmap::DashMap;
use futures::StreamExt;
use tracing::{debug, trace};

use super::{Notification, Subscription};

/// In-process broadcast channels keyed by channel name.
///
/// A channel exists only while someone subscribes to it. Messages published
/// while nobody listens are discarded, and a publish that finds the last
/// subscriber gone drops the channel.
pub struct NotificationHub {
    channels: DashMap<String, (Sender<Notification>, InactiveReceiver<Notification>)>,
    capacity: usize,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn ensure_channel(&self, name: &str) -> Sender<Notification> {
        if let Some(entry) = self.channels.get(name) {
            return entry.0.clone();
        }
        let entry = self.channels.entry(name.to_string()).or_insert_with(|| {
            let (mut tx, rx) = async_broadcast::broadcast(self.capacity);
            tx.set_overflow(true); // Drop oldest messages when full
            tx.set_await_active(false);
            debug!(channel = %name, capacity = self.capacity, "Created channel");
            (tx, rx.deactivate())
        });
        entry.0.clone()
    }

    /// Broadcast to current subscribers, returning how many were reached
    pub fn publish(&self, name: &str, notification: Notification) -> usize {
        let Some(sender) = self.channels.get(name).map(|entry| entry.0.clone()) else {
            trace!(channel = %name, "No subscribers, notification dropped");
            return 0;
        };
        let receivers = sender.receiver_count();
        if receivers == 0 {
            self.channels
                .remove_if(name, |_, (tx, _)| tx.receiver_count() == 0);
            debug!(channel = %name, "Last subscriber gone, dropped channel");
            return 0;
        }
        match sender.try_broadcast(notification) {
            Ok(_) => receivers,
            Err(e) => {
                trace!(channel = %name, "Broadcast failed: {}", e);
                0
            }
        }
    }

    pub fn subscribe(&self, name: &str) -> Subscription {
        self.ensure_channel(name);
        let receiver = match self.channels.get(name) {
            Some(entry) => entry.1.activate_cloned(),
            None => {
                // Only reachable if a publish dropped the channel in between
                let sender = self.ensure_channel(name);
                sender.new_receiver()
            }
        };
        Subscription::new(name, receiver.boxed())
    }

}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(256)
    }
}
