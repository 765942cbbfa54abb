use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

/// Session-wide cancellation. Cancelling drops the only sender, which
/// disconnects every token's receiver so `select!` wakes up immediately.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    token: CancelToken,
}

#[derive(Clone)]
pub struct CancelToken {
    receiver: Receiver<()>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            token: CancelToken { receiver },
        }
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_reaches_every_clone() {
        let handle = CancelHandle::new();
        let token = handle.token();
        let other = handle.clone();
        assert!(!token.is_cancelled());

        other.cancel();
        other.cancel();

        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
        assert!(token.receiver().recv_timeout(Duration::from_secs(1)).is_err());
    }
}
