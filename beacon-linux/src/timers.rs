//! Wake/Timer Host on tokio: one sleeping task per armed beacon.
//! Timers do not survive a restart; the registry re-arms everything on load.

use std::collections::HashMap;
use std::time::Duration;

use beacon_core::{BeaconKey, WakeHost};
use tokio::task::JoinHandle;

use crate::events::{now_ms, EventSender, HostEvent};

pub struct TokioWake {
    tx: EventSender,
    tasks: HashMap<BeaconKey, JoinHandle<()>>,
}

impl TokioWake {
    pub fn new(tx: EventSender) -> Self {
        Self {
            tx,
            tasks: HashMap::new(),
        }
    }
}

impl WakeHost for TokioWake {
    fn arm(&mut self, at_ms: u64, beacon: BeaconKey) {
        self.tasks.retain(|_, task| !task.is_finished());
        let delay = Duration::from_millis(at_ms.saturating_sub(now_ms()));
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(HostEvent::Wake(beacon));
        });
        if let Some(old) = self.tasks.insert(beacon, task) {
            old.abort();
        }
    }

    fn cancel(&mut self, beacon: BeaconKey) {
        if let Some(task) = self.tasks.remove(&beacon) {
            task.abort();
        }
    }
}

impl Drop for TokioWake {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}
