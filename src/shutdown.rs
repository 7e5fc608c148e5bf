use tokio::sync::watch;

/// Broadcasts the `quit` signal described in spec.md §5: every channel send/receive performed by
/// a non-coordinator task selects against this signal and treats its firing as "server stopped".
/// A thin wrapper over `tokio::sync::watch` rather than a dependency on the teacher's path-local
/// shutdown crate, which isn't independently publishable outside its own workspace (see
/// DESIGN.md).
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired. Intended for use inside `tokio::select!` alongside
    /// other branches.
    pub async fn wait(&mut self) {
        if self.is_triggered() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}
