//! A process registered with a session.

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::message::param;

pub type ServiceId = u32;

/// Documents a service mailbox holds before further deliveries fail.
pub const MAILBOX_CAPACITY: usize = 256;

/// Visibility of a service to the rest of its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Registered, not yet ready.
    Hidden,
    Visible,
    /// Was visible and has been hidden again. Never becomes visible twice.
    Departed,
}

/// Identity and routing information of one registered service.
#[derive(Debug, Clone)]
pub struct Service {
    id: ServiceId,
    name: String,
    url: String,
    service_type: String,
    visibility: Visibility,
    receives_broadcast: bool,
    mailbox: mpsc::Sender<String>,
}

impl Service {
    pub(crate) fn new(
        id: ServiceId,
        registration: ServiceRegistration,
        mailbox: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            name: registration.name,
            url: registration.url,
            service_type: registration.service_type,
            visibility: Visibility::Hidden,
            receives_broadcast: registration.receives_broadcast,
            mailbox,
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_visible(&self) -> bool {
        self.visibility == Visibility::Visible
    }

    pub fn receives_broadcast(&self) -> bool {
        self.receives_broadcast
    }

    /// Port parsed from the trailing `:<port>` of the URL. Not checked
    /// against any port allocator.
    pub fn port(&self) -> Option<u16> {
        let (_, port) = self.url.rsplit_once(':')?;
        port.parse().ok()
    }

    /// Returns `true` if the service was hidden and is now visible.
    pub(crate) fn set_visible(&mut self) -> bool {
        if self.visibility != Visibility::Hidden {
            return false;
        }
        self.visibility = Visibility::Visible;
        true
    }

    /// Returns `true` if the service was visible and is now hidden.
    pub(crate) fn set_hidden(&mut self) -> bool {
        if self.visibility != Visibility::Visible {
            return false;
        }
        self.visibility = Visibility::Departed;
        true
    }

    /// Queue a document for delivery. Fails when the mailbox is full or the
    /// service's receiver is gone.
    pub(crate) fn deliver(&self, document: String) -> bool {
        match self.mailbox.try_send(document) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(service_id = self.id, name = %self.name, "service mailbox full, document dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(service_id = self.id, name = %self.name, "service mailbox closed, document dropped");
                false
            }
        }
    }

    /// Entry as listed to other services.
    pub fn to_json(&self) -> Value {
        json!({
            (param::SERVICE_ID): self.id,
            (param::SERVICE_NAME): self.name,
            (param::SERVICE_TYPE): self.service_type,
            (param::SERVICE_URL): self.url,
        })
    }
}

/// What a process supplies when it registers.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub name: String,
    pub url: String,
    pub service_type: String,
    pub receives_broadcast: bool,
}

impl ServiceRegistration {
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            service_type: service_type.into(),
            receives_broadcast: true,
        }
    }

    pub fn without_broadcasts(mut self) -> Self {
        self.receives_broadcast = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(url: &str) -> Service {
        let (tx, _rx) = mpsc::channel(MAILBOX_CAPACITY);
        Service::new(7, ServiceRegistration::new("Model", "model", url), tx)
    }

    #[test]
    fn port_is_parsed_from_url() {
        assert_eq!(service("127.0.0.1:8091").port(), Some(8091));
        assert_eq!(service("127.0.0.1").port(), None);
        assert_eq!(service("host:notaport").port(), None);
    }

    #[test]
    fn visibility_transitions_once() {
        let mut s = service("127.0.0.1:1024");
        assert!(!s.set_hidden());
        assert_eq!(s.visibility(), Visibility::Hidden);

        assert!(s.set_visible());
        assert!(!s.set_visible());
        assert!(s.is_visible());

        assert!(s.set_hidden());
        assert!(!s.set_hidden());
        assert!(!s.set_visible());
        assert_eq!(s.visibility(), Visibility::Departed);
    }

    #[test]
    fn delivery_fails_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let s = Service::new(1, ServiceRegistration::new("UI", "ui", "h:1"), tx);
        assert!(s.deliver("a".into()));
        assert!(!s.deliver("b".into()));
        assert_eq!(rx.try_recv().unwrap(), "a");
        assert!(s.deliver("c".into()));
    }

    #[test]
    fn delivery_fails_after_receiver_drop() {
        let (tx, rx) = mpsc::channel(4);
        let s = Service::new(1, ServiceRegistration::new("UI", "ui", "h:1"), tx);
        assert!(s.deliver("a".into()));
        drop(rx);
        assert!(!s.deliver("b".into()));
    }

    #[test]
    fn json_entry() {
        let s = service("127.0.0.1:8091");
        assert_eq!(
            s.to_json(),
            json!({"ServiceID": 7, "ServiceName": "Model", "ServiceType": "model", "ServiceURL": "127.0.0.1:8091"})
        );
    }
}
