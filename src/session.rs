//! Sessions and the services registered with them.
//!
//! A [`Session`] tracks its services in registration order, hands out their
//! ids and fans broadcast actions out to their mailboxes. The
//! [`SessionRegistry`] owns every session of the process and announces
//! creation and teardown as [`SessionEvent`]s.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::message::{self, action, param};
use crate::service::{Service, ServiceId, ServiceRegistration, MAILBOX_CAPACITY};

/// Validate a session id. Ids must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("session id must not be empty".into());
    }
    if id.len() > 64 {
        return Err(format!("session id too long ({} chars, max 64)", id.len()));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!("session id contains invalid characters: {id}"));
    }
    Ok(())
}

/// Hands out service ids, lowest unused first. Only ids in use are stored.
#[derive(Debug, Default)]
struct IdManager {
    taken: BTreeSet<ServiceId>,
}

impl IdManager {
    /// Lowest free id from 1 up, or `None` once every id is taken.
    fn grab(&mut self) -> Option<ServiceId> {
        let mut candidate: ServiceId = 1;
        for &id in self.taken.range(1..) {
            if id != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        self.taken.insert(candidate);
        Some(candidate)
    }

    /// Reserve a specific id. The caller has checked it is not taken.
    fn claim(&mut self, id: ServiceId) {
        self.taken.insert(id);
    }

    fn release(&mut self, id: ServiceId) {
        self.taken.remove(&id);
    }
}

/// One session: the services cooperating on a single user task.
///
/// Services are kept in registration order, which is also the delivery order
/// of broadcasts. Each service has a mailbox of [`MAILBOX_CAPACITY`]
/// documents; the receiving end is handed to whoever forwards documents to
/// the service's process.
#[derive(Debug)]
pub struct Session {
    id: String,
    services: HashMap<ServiceId, Service>,
    order: Vec<ServiceId>,
    ids: IdManager,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            services: HashMap::new(),
            order: Vec::new(),
            ids: IdManager::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn register_service(
        &mut self,
        registration: ServiceRegistration,
    ) -> Result<(ServiceId, mpsc::Receiver<String>), RegistryError> {
        let id = self.ids.grab().ok_or(RegistryError::ServiceIdsExhausted)?;
        let inbox = self.insert(id, registration);
        Ok((id, inbox))
    }

    /// Register under a caller-chosen id, e.g. one assigned by a directory.
    pub fn register_service_with_id(
        &mut self,
        id: ServiceId,
        registration: ServiceRegistration,
    ) -> Result<mpsc::Receiver<String>, RegistryError> {
        if self.services.contains_key(&id) {
            return Err(RegistryError::DuplicateServiceId(id));
        }
        self.ids.claim(id);
        Ok(self.insert(id, registration))
    }

    fn insert(
        &mut self,
        id: ServiceId,
        registration: ServiceRegistration,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let service = Service::new(id, registration, tx);
        tracing::info!(
            session = %self.id,
            service_id = id,
            name = %service.name(),
            url = %service.url(),
            "service registered"
        );
        self.services.insert(id, service);
        self.order.push(id);
        rx
    }

    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn service_by_url(&self, url: &str) -> Option<&Service> {
        self.ordered().find(|s| s.url() == url)
    }

    pub fn services_by_name(&self, name: &str) -> Vec<&Service> {
        self.ordered().filter(|s| s.name() == name).collect()
    }

    /// Entries of every visible service, in registration order.
    pub fn service_list(&self) -> Vec<Value> {
        self.ordered()
            .filter(|s| s.is_visible())
            .map(Service::to_json)
            .collect()
    }

    /// Mark a service ready and announce it. A repeated call is a no-op and
    /// returns `Ok(false)`.
    pub fn set_visible(&mut self, id: ServiceId) -> Result<bool, RegistryError> {
        let service = self
            .services
            .get_mut(&id)
            .ok_or(RegistryError::ServiceNotFound(id))?;
        if !service.set_visible() {
            return Ok(false);
        }
        self.broadcast_action(id, action::SERVICE_CONNECTED, true);
        Ok(true)
    }

    /// Withdraw a visible service and announce it. A repeated call is a
    /// no-op and returns `Ok(false)`.
    pub fn set_hidden(&mut self, id: ServiceId) -> Result<bool, RegistryError> {
        let service = self
            .services
            .get_mut(&id)
            .ok_or(RegistryError::ServiceNotFound(id))?;
        if !service.set_hidden() {
            return Ok(false);
        }
        self.broadcast_action(id, action::SERVICE_DISCONNECTED, true);
        Ok(true)
    }

    /// Remove a service and free its id. With `notify`, the remaining
    /// services are told if the removed one was visible.
    pub fn remove_service(&mut self, id: ServiceId, notify: bool) -> Option<Service> {
        let service = self.services.remove(&id)?;
        self.order.retain(|other| *other != id);
        self.ids.release(id);
        tracing::info!(session = %self.id, service_id = id, "service removed");

        if notify && service.is_visible() {
            let document = broadcast_document(action::SERVICE_DISCONNECTED, &service);
            self.deliver(&document, None);
        }
        Some(service)
    }

    /// Deliver `action` on behalf of `originator` to every service that
    /// receives broadcasts, optionally skipping the originator. Returns the
    /// number of deliveries.
    pub fn broadcast_action(
        &self,
        originator: ServiceId,
        action: &str,
        exclude_originator: bool,
    ) -> usize {
        let document = match self.services.get(&originator) {
            Some(origin) => broadcast_document(action, origin),
            None => message::action_document(action),
        };
        let skip = exclude_originator.then_some(originator);
        self.deliver(&document, skip)
    }

    /// Deliver an arbitrary document to every service that receives
    /// broadcasts except `skip`.
    pub fn broadcast_document(&self, document: &Value, skip: Option<ServiceId>) -> usize {
        self.deliver(document, skip)
    }

    /// Tell every service the session is going away, then drop them all.
    pub fn shutdown(&mut self, sender: Option<ServiceId>) -> usize {
        tracing::info!(session = %self.id, ?sender, "shutting down session");
        let mut pre = message::action_document(action::SERVICE_PRE_SHUTDOWN);
        let mut shutdown = message::action_document(action::SERVICE_SHUTDOWN);
        shutdown[param::SESSION_EXISTS] = Value::Bool(false);
        if let Some(origin) = sender.and_then(|id| self.services.get(&id)) {
            pre = broadcast_document(action::SERVICE_PRE_SHUTDOWN, origin);
            shutdown[param::SERVICE_ID] = Value::from(origin.id());
        }

        let recipients = self.all_except(sender);
        for service in &recipients {
            service.deliver(pre.to_string());
        }
        for service in &recipients {
            service.deliver(shutdown.to_string());
        }
        self.clear()
    }

    /// A service crashed: every other service is told to stop immediately.
    pub fn service_failure(&mut self, failed: ServiceId) -> usize {
        tracing::error!(session = %self.id, service_id = failed, "service failed, emergency shutdown");
        let document = match self.services.get(&failed) {
            Some(origin) => broadcast_document(action::SERVICE_EMERGENCY_SHUTDOWN, origin),
            None => message::action_document(action::SERVICE_EMERGENCY_SHUTDOWN),
        };
        let text = document.to_string();
        for service in self.all_except(Some(failed)) {
            service.deliver(text.clone());
        }
        self.clear()
    }

    fn ordered(&self) -> impl Iterator<Item = &Service> + '_ {
        self.order.iter().filter_map(|id| self.services.get(id))
    }

    /// Snapshot of every service except `skip`, in registration order.
    fn all_except(&self, skip: Option<ServiceId>) -> Vec<Service> {
        self.ordered()
            .filter(|s| Some(s.id()) != skip)
            .cloned()
            .collect()
    }

    fn deliver(&self, document: &Value, skip: Option<ServiceId>) -> usize {
        let recipients: Vec<Service> = self
            .all_except(skip)
            .into_iter()
            .filter(Service::receives_broadcast)
            .collect();
        let text = document.to_string();
        let delivered = recipients
            .iter()
            .filter(|s| s.deliver(text.clone()))
            .count();
        tracing::debug!(
            session = %self.id,
            action = message::action_of(document).unwrap_or_default(),
            delivered,
            "broadcast"
        );
        delivered
    }

    fn clear(&mut self) -> usize {
        let removed = self.services.len();
        self.services.clear();
        self.order.clear();
        self.ids = IdManager::default();
        removed
    }
}

fn broadcast_document(action: &str, origin: &Service) -> Value {
    let mut document = message::action_document(action);
    document[param::SERVICE_ID] = Value::from(origin.id());
    document[param::SERVICE_URL] = Value::from(origin.url());
    document[param::SERVICE_NAME] = Value::from(origin.name());
    document[param::SERVICE_TYPE] = Value::from(origin.service_type());
    document
}

/// Lifecycle events emitted by the session registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: String },
    Destroyed { id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session already exists: {0}")]
    SessionExists(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("service id already registered: {0}")]
    DuplicateServiceId(ServiceId),
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),
    #[error("no free service id left in this session")]
    ServiceIdsExhausted,
}

/// Sessions of this process by id.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Session>>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    /// Create an empty session under `id`.
    pub fn create(&self, id: &str) -> Result<(), RegistryError> {
        self.insert(Session::new(id))
    }

    pub fn insert(&self, session: Session) -> Result<(), RegistryError> {
        validate_session_id(session.id()).map_err(RegistryError::InvalidSessionId)?;
        let id = session.id().to_string();
        {
            let mut inner = self.inner.write();
            if inner.contains_key(&id) {
                return Err(RegistryError::SessionExists(id));
            }
            inner.insert(id.clone(), session);
        }
        tracing::info!(session = %id, "session created");
        // Send event (ignore error if there are no receivers).
        let _ = self.events_tx.send(SessionEvent::Created { id });
        Ok(())
    }

    /// Run `f` against a session under the write lock.
    pub fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, RegistryError> {
        let mut inner = self.inner.write();
        let session = inner
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
        Ok(f(session))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        let removed = self.inner.write().remove(id);
        if removed.is_some() {
            tracing::info!(session = %id, "session destroyed");
            let _ = self.events_tx.send(SessionEvent::Destroyed { id: id.to_string() });
        }
        removed
    }

    /// Session ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Shut down and remove every session.
    pub fn drain(&self) -> usize {
        let sessions: Vec<Session> = self.inner.write().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for mut session in sessions {
            session.shutdown(None);
            let _ = self.events_tx.send(SessionEvent::Destroyed {
                id: session.id().to_string(),
            });
        }
        count
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
