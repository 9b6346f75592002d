//! Bounded FIFO of supervisor commands (spec §4.8). `submit` never blocks
//! and returns `false` when full; producers implement their own retry
//! (Instance's termination protocol does this with a 1s backoff).

use tokio::sync::{mpsc, Mutex};

use crate::model::InstanceProfile;

#[derive(Debug, Clone)]
pub enum Action {
    Add(InstanceProfile),
    Finish(String),
    Delete(String),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Add(_) => "ADD",
            Action::Finish(_) => "FINISH",
            Action::Delete(_) => "DELETE",
        }
    }
}

pub struct ActionBus {
    capacity: usize,
    tx: mpsc::Sender<Action>,
    rx: Mutex<mpsc::Receiver<Action>>,
}

impl ActionBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Non-blocking; `false` if the bus is full.
    pub fn submit(&self, action: Action) -> bool {
        self.tx.try_send(action).is_ok()
    }

    /// Drains everything currently queued without blocking for more.
    pub async fn drain(&self) -> Vec<Action> {
        let mut rx = self.rx.lock().await;
        let mut actions = Vec::new();
        while let Ok(action) = rx.try_recv() {
            actions.push(action);
        }
        actions
    }

    /// Current queue depth, derived from the sender's free-permit count
    /// since `mpsc::Receiver` exposes no length directly.
    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceProfile;

    #[tokio::test]
    async fn submit_fails_when_full() {
        let bus = ActionBus::new(1);
        assert!(bus.submit(Action::Delete("a".into())));
        assert!(!bus.submit(Action::Delete("b".into())));
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn drain_empties_fifo() {
        let bus = ActionBus::new(4);
        bus.submit(Action::Add(InstanceProfile::new("t", "i1", "file", "proxy")));
        bus.submit(Action::Finish("i1".into()));
        let actions = bus.drain().await;
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind(), "ADD");
        assert_eq!(actions[1].kind(), "FINISH");
        assert!(bus.is_empty());
    }
}
