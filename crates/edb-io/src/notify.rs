use crate::transport::Notification;

/// Notifications owed to the server, oldest first. A notification that is
/// already queued is not queued twice.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingNotifications {
    queue: Vec<Notification>,
}

impl PendingNotifications {
    pub fn push(&mut self, notification: Notification) {
        if !self.queue.contains(&notification) {
            self.queue.push(notification);
        }
    }

    pub fn take(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.queue)
    }

    /// Put undelivered notifications back in front of anything queued since.
    pub fn requeue(&mut self, undelivered: Vec<Notification>) {
        let newer = std::mem::replace(&mut self.queue, undelivered);
        for notification in newer {
            self.push(notification);
        }
    }

    pub fn as_slice(&self) -> &[Notification] {
        &self.queue
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
