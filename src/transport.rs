use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Characteristic a notification arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationSource {
    /// Cycling power measurement
    Power,
    /// Battery level
    Battery,
    /// Vendor log text
    Log,
}

/// Event pushed by a transport to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw value of a subscribed characteristic
    Notification {
        /// Characteristic the value came from
        source: NotificationSource,
        /// Raw payload
        value: Vec<u8>,
    },
    /// The GATT link dropped
    Disconnected,
}

/// Sender half the transport pushes events into
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// BLE stack operations the session is built on
///
/// Implementations forward every notification and link loss to the
/// [`EventSender`] they are handed, in arrival order.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Selected device
    type Device: Clone + Send + Sync;
    /// Open GATT link
    type Link: Send + Sync;
    /// Resolved primary service
    type Service: Send + Sync;
    /// Resolved characteristic
    type Characteristic: Clone + Send + Sync;

    /// Select a device offering `services`
    async fn request_device(&self, services: &[Uuid]) -> Result<Self::Device>;

    /// Re-acquire a previously selected device without user interaction
    ///
    /// Platforms that cannot reconnect in the background fail with
    /// [`crate::PowerMeterError::DeviceUnavailable`] or
    /// [`crate::PowerMeterError::LinkUnavailable`].
    async fn paired_device(&self, previous: &Self::Device) -> Result<Self::Device>;

    /// Open a GATT link to `device`
    async fn connect_link(&self, device: &Self::Device) -> Result<Self::Link>;

    /// Resolve a primary service
    async fn get_service(&self, link: &Self::Link, service: Uuid) -> Result<Self::Service>;

    /// Resolve a characteristic within `service`
    async fn get_characteristic(
        &self,
        service: &Self::Service,
        characteristic: Uuid,
    ) -> Result<Self::Characteristic>;

    /// Enable notifications and forward values tagged with `source`
    async fn subscribe(
        &self,
        characteristic: &Self::Characteristic,
        source: NotificationSource,
        events: EventSender,
    ) -> Result<()>;

    /// Write a value to `characteristic`
    async fn write_value(&self, characteristic: &Self::Characteristic, data: Bytes) -> Result<()>;

    /// Report link loss of `link` as [`TransportEvent::Disconnected`]
    async fn on_disconnected(&self, link: &Self::Link, events: EventSender) -> Result<()>;

    /// Close `link`, stopping notification and disconnect forwarding
    async fn disconnect_link(&self, link: &Self::Link) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory transport.

    use super::*;
    use crate::error::PowerMeterError;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    /// Step of connection establishment that can be made to fail
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Step {
        RequestDevice,
        PairedDevice,
        ConnectLink,
        Service(Uuid),
        Characteristic(Uuid),
        Subscribe(NotificationSource),
        Write,
    }

    #[derive(Default)]
    struct State {
        failures: VecDeque<Step>,
        always_fail: Vec<Step>,
        writes: Vec<Vec<u8>>,
        events: Option<EventSender>,
        subscriptions: Vec<NotificationSource>,
        links_opened: u32,
        links_closed: u32,
        link_delay: Option<std::time::Duration>,
        service_delay: Option<std::time::Duration>,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct FakeChar {
        pub(crate) uuid: Uuid,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeTransport {
        state: Arc<Mutex<State>>,
    }

    impl FakeTransport {
        /// Fail `step` the next time it runs
        pub(crate) fn fail_once(&self, step: Step) {
            self.state.lock().unwrap().failures.push_back(step);
        }

        /// Fail `step` every time until cleared
        pub(crate) fn fail_always(&self, step: Step) {
            self.state.lock().unwrap().always_fail.push(step);
        }

        pub(crate) fn clear_failures(&self) {
            let mut state = self.state.lock().unwrap();
            state.failures.clear();
            state.always_fail.clear();
        }

        /// Delay every link open
        pub(crate) fn set_link_delay(&self, delay: std::time::Duration) {
            self.state.lock().unwrap().link_delay = Some(delay);
        }

        /// Delay every service resolution, `None` clears it
        pub(crate) fn set_service_delay(&self, delay: Option<std::time::Duration>) {
            self.state.lock().unwrap().service_delay = delay;
        }

        pub(crate) fn writes(&self) -> Vec<String> {
            self.state
                .lock()
                .unwrap()
                .writes
                .iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect()
        }

        pub(crate) fn subscriptions(&self) -> Vec<NotificationSource> {
            self.state.lock().unwrap().subscriptions.clone()
        }

        pub(crate) fn links_opened(&self) -> u32 {
            self.state.lock().unwrap().links_opened
        }

        pub(crate) fn links_closed(&self) -> u32 {
            self.state.lock().unwrap().links_closed
        }

        /// Push a notification as if it came from the device
        pub(crate) fn notify(&self, source: NotificationSource, value: &[u8]) {
            if let Some(events) = self.state.lock().unwrap().events.as_ref() {
                let _ = events.send(TransportEvent::Notification {
                    source,
                    value: value.to_vec(),
                });
            }
        }

        /// Simulate an unexpected link loss
        pub(crate) fn drop_link(&self) {
            if let Some(events) = self.state.lock().unwrap().events.as_ref() {
                let _ = events.send(TransportEvent::Disconnected);
            }
        }

        fn check(&self, step: Step) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let once = state.failures.front() == Some(&step);
            if once {
                state.failures.pop_front();
            }
            if once || state.always_fail.contains(&step) {
                return Err(match step {
                    Step::RequestDevice | Step::PairedDevice => PowerMeterError::DeviceUnavailable,
                    Step::ConnectLink => PowerMeterError::LinkUnavailable("fake".to_string()),
                    Step::Service(uuid) => PowerMeterError::ServiceNotFound(uuid),
                    Step::Characteristic(uuid) => PowerMeterError::CharacteristicNotFound(uuid),
                    Step::Subscribe(source) => {
                        PowerMeterError::SubscribeFailed(format!("{source:?}"))
                    }
                    Step::Write => PowerMeterError::WriteFailed("fake".to_string()),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        type Device = u32;
        type Link = u32;
        type Service = Uuid;
        type Characteristic = FakeChar;

        async fn request_device(&self, _services: &[Uuid]) -> Result<u32> {
            self.check(Step::RequestDevice)?;
            Ok(1)
        }

        async fn paired_device(&self, previous: &u32) -> Result<u32> {
            self.check(Step::PairedDevice)?;
            Ok(*previous)
        }

        async fn connect_link(&self, device: &u32) -> Result<u32> {
            let delay = self.state.lock().unwrap().link_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.check(Step::ConnectLink)?;
            let mut state = self.state.lock().unwrap();
            state.links_opened += 1;
            Ok(*device * 100 + state.links_opened)
        }

        async fn get_service(&self, _link: &u32, service: Uuid) -> Result<Uuid> {
            let delay = self.state.lock().unwrap().service_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.check(Step::Service(service))?;
            Ok(service)
        }

        async fn get_characteristic(&self, _service: &Uuid, characteristic: Uuid) -> Result<FakeChar> {
            self.check(Step::Characteristic(characteristic))?;
            Ok(FakeChar {
                uuid: characteristic,
            })
        }

        async fn subscribe(
            &self,
            _characteristic: &FakeChar,
            source: NotificationSource,
            events: EventSender,
        ) -> Result<()> {
            self.check(Step::Subscribe(source))?;
            let mut state = self.state.lock().unwrap();
            state.subscriptions.push(source);
            state.events = Some(events);
            Ok(())
        }

        async fn write_value(&self, characteristic: &FakeChar, data: Bytes) -> Result<()> {
            assert_eq!(characteristic.uuid, crate::CONTROL_CHAR_UUID);
            self.check(Step::Write)?;
            self.state.lock().unwrap().writes.push(data.to_vec());
            Ok(())
        }

        async fn on_disconnected(&self, _link: &u32, events: EventSender) -> Result<()> {
            self.state.lock().unwrap().events = Some(events);
            Ok(())
        }

        /// Closing any link drops event delivery for the whole device, the
        /// way a peripheral-wide disconnect does.
        async fn disconnect_link(&self, _link: &u32) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.links_closed += 1;
            state.events = None;
            Ok(())
        }
    }
}
