use tokio::sync::watch;

/// Broadcasts "the tunnel table changed" to everyone currently listening.
///
/// Listeners must be created *before* inspecting the table: a notification fired
/// after [`ChangeNotifier::listen`] returns is never lost.
#[derive(Debug)]
pub struct ChangeNotifier {
    generation: watch::Sender<u64>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self { generation: tx }
    }

    pub fn listen(&self) -> ChangeListener {
        ChangeListener {
            rx: self.generation.subscribe(),
        }
    }

    pub fn notify(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

#[derive(Debug)]
pub struct ChangeListener {
    rx: watch::Receiver<u64>,
}

impl ChangeListener {
    /// Waits for the next notification. Returns false once the notifier is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
