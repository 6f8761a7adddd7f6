//! Bluetooth-LE characteristic bridge.
//!
//! The BLE stack delivers characteristic notifications on its own thread. The
//! notification callback only pushes the raw payload through a
//! [`BleNotifier`]; the acquisition loop pops them via [`BlePacketSource`].
//! A [`BleLink`] owns the radio side: it connects, subscribes, and feeds the
//! notifier. Talking to real hardware needs the `ble` feature.

use crate::source::packet::{PacketError, PacketSource};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

/// Notifications buffered before the oldest are dropped.
const QUEUE_CAPACITY: usize = 4096;

/// Sending half handed to the BLE notification callback.
#[derive(Clone)]
pub struct BleNotifier {
    sender: Sender<Vec<u8>>,
}

impl BleNotifier {
    /// Queue one notification payload; returns `false` when the queue is
    /// full or the acquisition side is gone.
    pub fn notify(&self, payload: &[u8]) -> bool {
        match self.sender.try_send(payload.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!("ble queue full, notification dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// The radio side of a BLE sensor.
pub trait BleLink: Send {
    /// Connect, subscribe, and forward every notification to `notifier`
    /// until the peripheral goes away. Dropping the notifier signals a lost
    /// link.
    fn connect(&mut self, notifier: BleNotifier) -> Result<(), PacketError>;

    /// Tear the connection down. Safe to call when not connected.
    fn disconnect(&mut self);
}

/// Receiving half consumed by the sensor multiplexer.
pub struct BlePacketSource {
    receiver: Option<Receiver<Vec<u8>>>,
    link: Option<Box<dyn BleLink>>,
    device: String,
}

impl BlePacketSource {
    /// Create a connected notifier/source pair for one peripheral.
    pub fn channel(device: impl Into<String>) -> (BleNotifier, BlePacketSource) {
        let (sender, receiver) = bounded(QUEUE_CAPACITY);
        (
            BleNotifier { sender },
            BlePacketSource {
                receiver: Some(receiver),
                link: None,
                device: device.into(),
            },
        )
    }

    /// Connect `link` and read its notifications.
    pub fn connect(device: impl Into<String>, link: impl BleLink + 'static) -> Result<Self, PacketError> {
        let (notifier, mut source) = Self::channel(device);
        let mut link: Box<dyn BleLink> = Box::new(link);
        link.connect(notifier)?;
        source.link = Some(link);
        Ok(source)
    }
}

impl PacketSource for BlePacketSource {
    fn recv_packet(&mut self, timeout: Duration) -> Result<Vec<u8>, PacketError> {
        let receiver = self.receiver.as_ref().ok_or(PacketError::Disconnected)?;
        match receiver.recv_timeout(timeout) {
            Ok(payload) => Ok(payload),
            Err(RecvTimeoutError::Timeout) => Err(PacketError::Timeout),
            // A link can come back; a bare channel cannot.
            Err(RecvTimeoutError::Disconnected) if self.link.is_some() => {
                Err(PacketError::Link(format!("{} disconnected", self.device)))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PacketError::Disconnected),
        }
    }

    /// Stale notifications would mix old readings into a fresh frame.
    fn discard_pending(&mut self) {
        if let Some(receiver) = self.receiver.as_ref() {
            let stale = receiver.try_iter().count();
            if stale > 0 {
                tracing::trace!(stale, "cleared stale ble notifications");
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), PacketError> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        link.disconnect();

        let (sender, receiver) = bounded(QUEUE_CAPACITY);
        self.receiver = Some(receiver);
        link.connect(BleNotifier { sender })?;
        tracing::info!(device = %self.device, "ble link re-established");
        Ok(())
    }

    fn close(&mut self) {
        self.receiver = None;
        if let Some(mut link) = self.link.take() {
            link.disconnect();
        }
    }

    fn describe(&self) -> String {
        format!("ble:{}", self.device)
    }
}

#[cfg(feature = "ble")]
pub use radio::BtleplugLink;

#[cfg(feature = "ble")]
mod radio {
    use super::{BleLink, BleNotifier};
    use crate::config::BleConfig;
    use crate::source::packet::PacketError;
    use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
    use btleplug::platform::{Adapter, Manager, Peripheral};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::runtime::Runtime;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    const SCAN_POLL: Duration = Duration::from_millis(250);

    fn link_error(err: btleplug::Error) -> PacketError {
        PacketError::Link(err.to_string())
    }

    /// btleplug-backed link to a peripheral advertising the sensor service.
    ///
    /// btleplug is async; the link drives it on a private runtime so the
    /// acquisition loop stays synchronous.
    pub struct BtleplugLink {
        runtime: Runtime,
        service: Uuid,
        rx_characteristic: Uuid,
        device_name: Option<String>,
        scan_timeout: Duration,
        peripheral: Option<Peripheral>,
        forwarder: Option<JoinHandle<()>>,
    }

    impl BtleplugLink {
        pub fn new(config: &BleConfig) -> Result<Self, PacketError> {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("ble-link")
                .enable_all()
                .build()?;

            Ok(Self {
                runtime,
                service: config.service,
                rx_characteristic: config.rx_characteristic,
                device_name: config.device_name.clone(),
                scan_timeout: config.scan_timeout,
                peripheral: None,
                forwarder: None,
            })
        }

        async fn open(&self, notifier: BleNotifier) -> Result<(Peripheral, JoinHandle<()>), PacketError> {
            let manager = Manager::new().await.map_err(link_error)?;
            let adapter = manager
                .adapters()
                .await
                .map_err(link_error)?
                .into_iter()
                .next()
                .ok_or_else(|| PacketError::Link("no bluetooth adapter".to_string()))?;

            adapter
                .start_scan(ScanFilter {
                    services: vec![self.service],
                })
                .await
                .map_err(link_error)?;
            let found = self.find_peripheral(&adapter).await;
            if let Err(e) = adapter.stop_scan().await {
                tracing::debug!(error = %e, "stopping ble scan failed");
            }
            let peripheral = found?;

            peripheral.connect().await.map_err(link_error)?;
            peripheral.discover_services().await.map_err(link_error)?;

            let rx = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == self.rx_characteristic)
                .ok_or_else(|| PacketError::Link(format!("characteristic {} not found", self.rx_characteristic)))?;
            peripheral.subscribe(&rx).await.map_err(link_error)?;

            let mut notifications = peripheral.notifications().await.map_err(link_error)?;
            let rx_uuid = rx.uuid;
            let forwarder = tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if notification.uuid == rx_uuid {
                        notifier.notify(&notification.value);
                    }
                }
                tracing::warn!("ble notification stream ended");
            });

            Ok((peripheral, forwarder))
        }

        async fn find_peripheral(&self, adapter: &Adapter) -> Result<Peripheral, PacketError> {
            let deadline = tokio::time::Instant::now() + self.scan_timeout;

            loop {
                for peripheral in adapter.peripherals().await.map_err(link_error)? {
                    let Ok(Some(properties)) = peripheral.properties().await else {
                        continue;
                    };
                    let advertises = properties.services.contains(&self.service);
                    let named = match &self.device_name {
                        Some(name) => properties.local_name.as_deref() == Some(name.as_str()),
                        None => true,
                    };
                    if advertises && named {
                        tracing::info!(name = ?properties.local_name, "found ble sensor");
                        return Ok(peripheral);
                    }
                }

                if tokio::time::Instant::now() >= deadline {
                    return Err(PacketError::Link(format!(
                        "no peripheral advertising {} within {:?}",
                        self.service, self.scan_timeout
                    )));
                }
                tokio::time::sleep(SCAN_POLL).await;
            }
        }
    }

    impl BleLink for BtleplugLink {
        fn connect(&mut self, notifier: BleNotifier) -> Result<(), PacketError> {
            self.disconnect();
            let (peripheral, forwarder) = self.runtime.block_on(self.open(notifier))?;
            self.peripheral = Some(peripheral);
            self.forwarder = Some(forwarder);
            Ok(())
        }

        fn disconnect(&mut self) {
            if let Some(forwarder) = self.forwarder.take() {
                forwarder.abort();
            }
            if let Some(peripheral) = self.peripheral.take() {
                if let Err(e) = self.runtime.block_on(peripheral.disconnect()) {
                    tracing::debug!(error = %e, "ble disconnect failed");
                }
            }
        }
    }

    impl Drop for BtleplugLink {
        fn drop(&mut self) {
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FrameSource, SensorMultiplexer, SourceError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Connects instantly and replays one packet per connection.
    struct FakeLink {
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
        /// Kept so the test can drop it to simulate a lost link.
        notifier: Arc<Mutex<Option<BleNotifier>>>,
    }

    impl BleLink for FakeLink {
        fn connect(&mut self, notifier: BleNotifier) -> Result<(), PacketError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            notifier.notify(format!("&acc:{n}:").as_bytes());
            *self.notifier.lock().unwrap() = Some(notifier);
            Ok(())
        }

        fn disconnect(&mut self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.notifier.lock().unwrap().take();
        }
    }

    fn fake_link() -> (FakeLink, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<Mutex<Option<BleNotifier>>>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let notifier = Arc::new(Mutex::new(None));
        (
            FakeLink {
                connects: connects.clone(),
                disconnects: disconnects.clone(),
                notifier: notifier.clone(),
            },
            connects,
            disconnects,
            notifier,
        )
    }

    #[test]
    fn test_notifications_reach_source() {
        let (notifier, mut source) = BlePacketSource::channel("phone");
        assert!(notifier.notify(b"&acc:1:"));

        let packet = source.recv_packet(Duration::from_millis(50)).unwrap();
        assert_eq!(packet, b"&acc:1:");
    }

    #[test]
    fn test_discard_pending_clears_queue() {
        let (notifier, mut source) = BlePacketSource::channel("phone");
        notifier.notify(b"&acc:1:");
        notifier.notify(b"&acc:2:");

        source.discard_pending();
        assert!(matches!(
            source.recv_packet(Duration::from_millis(10)),
            Err(PacketError::Timeout)
        ));
    }

    #[test]
    fn test_dropped_notifier_disconnects() {
        let (notifier, mut source) = BlePacketSource::channel("phone");
        drop(notifier);
        assert!(matches!(
            source.recv_packet(Duration::from_millis(10)),
            Err(PacketError::Disconnected)
        ));
    }

    #[test]
    fn test_multiplexer_over_ble_times_out() {
        let (_notifier, source) = BlePacketSource::channel("phone");
        let mut mux = SensorMultiplexer::new(source, 2, Duration::from_millis(10));
        assert!(matches!(mux.next_frame(), Err(SourceError::Timeout)));
        assert_eq!(mux.describe(), "ble:phone");
    }

    #[test]
    fn test_lost_link_is_recoverable_and_reconnects() {
        let (link, connects, disconnects, notifier) = fake_link();
        let mut source = BlePacketSource::connect("phone", link).unwrap();
        assert_eq!(source.recv_packet(Duration::from_millis(50)).unwrap(), b"&acc:1:");

        // The peripheral vanishes: a link fault, not end of stream.
        notifier.lock().unwrap().take();
        assert!(matches!(
            source.recv_packet(Duration::from_millis(10)),
            Err(PacketError::Link(_))
        ));

        source.reconnect().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(source.recv_packet(Duration::from_millis(50)).unwrap(), b"&acc:2:");
    }

    #[test]
    fn test_close_disconnects_link() {
        let (link, _connects, disconnects, _notifier) = fake_link();
        let mut source = BlePacketSource::connect("phone", link).unwrap();
        source.close();

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(
            source.recv_packet(Duration::from_millis(10)),
            Err(PacketError::Disconnected)
        ));
    }
}
