//! One-shot readiness gate
//!
//! Unset until [`GateOpener::open`] is called, set forever afterwards. Any
//! number of [`ReadinessGate`] clones may wait on it. `open` consumes the
//! opener, so the transition can happen at most once; dropping the opener
//! without opening it releases every waiter with `None`.

use tokio::sync::watch;

/// The single writer side of a gate
pub struct GateOpener<T> {
    tx: watch::Sender<Option<T>>,
}

/// The waiting side of a gate
#[derive(Clone)]
pub struct ReadinessGate<T> {
    rx: watch::Receiver<Option<T>>,
}

/// Create an unset gate
pub fn gate<T>() -> (GateOpener<T>, ReadinessGate<T>) {
    let (tx, rx) = watch::channel(None);
    (GateOpener { tx }, ReadinessGate { rx })
}

impl<T> GateOpener<T> {
    /// Set the gate, releasing every waiter with `value`
    pub fn open(self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

impl<T: Clone> ReadinessGate<T> {
    /// Wait until the gate is set. `None` if the opener was dropped unset.
    pub async fn wait(&mut self) -> Option<T> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }

    /// The value if the gate is already set
    pub fn get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    /// Whether the gate is set
    pub fn is_set(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Whether the opener is gone, opened or not
    pub fn is_released(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}
