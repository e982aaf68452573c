//! Dry-run Radio Adapter: logs every advertisement it is asked to transmit
//! and reports success immediately. SIGUSR1 toggles the simulated adapter
//! power so the off/on recovery path can be exercised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use beacon_core::{
    ActiveState, AdvertiseHandle, AdvertisePayload, AdvertiseRequest, BeaconKey, RadioAdapter,
    StateNotifier, Telemetry, TelemetrySource,
};
use tracing::info;

use crate::events::{EventSender, HostEvent};

pub struct DryRunRadio {
    powered: Arc<AtomicBool>,
    tx: EventSender,
}

impl DryRunRadio {
    pub fn new(tx: EventSender) -> Self {
        Self {
            powered: Arc::new(AtomicBool::new(true)),
            tx,
        }
    }

    /// Shared power flag, for the toggle task.
    pub fn power_switch(&self) -> Arc<AtomicBool> {
        self.powered.clone()
    }
}

impl RadioAdapter for DryRunRadio {
    fn is_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn supports_multi_advertise(&self) -> bool {
        true
    }

    fn request_enable(&mut self) {
        if !self.powered.swap(true, Ordering::SeqCst) {
            info!("radio powered on by request");
            let _ = self.tx.send(HostEvent::RadioEnabled);
        }
    }

    fn start(&mut self, handle: AdvertiseHandle, request: &AdvertiseRequest) {
        info!(
            handle = handle.0,
            mode = ?request.settings.mode,
            tx = ?request.settings.tx_power_level,
            connectable = request.settings.connectable,
            payload = %describe(&request.data),
            scan_response = %request.scan_response.as_ref().map(describe).unwrap_or_default(),
            "advertise"
        );
        let _ = self
            .tx
            .send(HostEvent::AdvertiseStarted(handle, request.settings));
    }

    fn stop(&mut self, handle: AdvertiseHandle) {
        info!(handle = handle.0, "advertise stop");
    }
}

fn describe(payload: &AdvertisePayload) -> String {
    match payload {
        AdvertisePayload::ServiceData {
            service_uuid16,
            data,
        } => format!("svc {service_uuid16:04x} {}", hex::encode(data)),
        AdvertisePayload::ManufacturerData { company_id, data } => {
            format!("mfr {company_id:04x} {}", hex::encode(data))
        }
        AdvertisePayload::ServiceUuid(uuid) => format!("uuid {uuid}"),
    }
}

/// Flip the simulated adapter power on every SIGUSR1.
#[cfg(unix)]
pub fn spawn_power_toggle(powered: Arc<AtomicBool>, tx: EventSender) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut usr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            let was_on = powered.fetch_xor(true, Ordering::SeqCst);
            info!(powered = !was_on, "radio power toggled");
            let event = if was_on {
                HostEvent::RadioDisabled
            } else {
                HostEvent::RadioEnabled
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    Ok(())
}

/// Telemetry from the host: uptime since daemon start and the number of
/// advertise requests seen. No battery or temperature sensor.
pub struct HostTelemetry {
    started: Instant,
    samples: u32,
}

impl HostTelemetry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            samples: 0,
        }
    }
}

impl TelemetrySource for HostTelemetry {
    fn sample(&mut self, _now_ms: u64) -> Telemetry {
        self.samples = self.samples.wrapping_add(1);
        Telemetry {
            battery_millivolts: 0,
            temperature_celsius: None,
            advertising_count: self.samples,
            uptime_deciseconds: (self.started.elapsed().as_millis() / 100) as u32,
        }
    }
}

/// State-Change Notifier that only logs; the daemon's event loop is the
/// sole owner of the registry, so there is nobody else to tell.
pub struct LogNotifier;

impl StateNotifier for LogNotifier {
    fn notify(&mut self, beacon: BeaconKey, state: ActiveState) {
        info!(beacon = %beacon, ?state, "beacon state");
    }
}
