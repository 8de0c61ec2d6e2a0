use crate::domains::sync::types::Connectivity;
use tokio::sync::watch;

/// Process-wide connectivity state with explicit subscribe/notify.
///
/// The host shell feeds transitions in via `set_online`; the sync worker
/// subscribes and resumes draining on the offline → online edge. In-flight
/// calls are never force-cancelled on the way offline; they fail by
/// timeout so no ambiguous partial completions are recorded.
pub struct ConnectivityMonitor {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().is_online()
    }

    /// Report a connectivity transition. Repeated reports of the same state
    /// are ignored.
    pub fn set_online(&self, online: bool) {
        let next = if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };

        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            match next {
                Connectivity::Online => log::info!("Connectivity restored"),
                Connectivity::Offline => log::info!("Connectivity lost"),
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Offline)
    }
}
