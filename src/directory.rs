//! Routing of sessions to their hosts, and the restart policy for the services
//! started on their behalf.
//!
//! Each (session, service type) pair has a [`ServiceInformation`] record whose
//! counters bound how often the service may be started before it ever runs
//! and how often it may be restarted after crashing once it did run.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::OrchestratorConfig;

/// Initialization attempts per start before the service is restarted.
pub const MAX_INITIALIZE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartLimits {
    pub max_crash_restarts: u32,
    pub max_startup_restarts: u32,
}

impl Default for RestartLimits {
    fn default() -> Self {
        Self {
            max_crash_restarts: 8,
            max_startup_restarts: 64,
        }
    }
}

/// Restart bookkeeping for one service of one session. Serializes to a flat
/// JSON object holding exactly these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceInformation {
    pub name: String,
    #[serde(rename = "Type")]
    pub service_type: String,
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "SessionServiceURL")]
    pub session_service_url: String,
    pub initialize_attempt: u32,
    pub start_counter: u32,
    #[serde(default)]
    pub crash_restarts: u32,
    #[serde(default)]
    pub running: bool,
    pub max_crash_restarts: u32,
    pub max_startup_restarts: u32,
}

/// What to do after an initialization attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializeDecision {
    /// Keep initializing; carries the attempt number.
    Proceed(u32),
    /// Too many attempts: stop the service and start it again.
    Restart,
}

impl ServiceInformation {
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        session_id: impl Into<String>,
        session_service_url: impl Into<String>,
        limits: RestartLimits,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            session_id: session_id.into(),
            session_service_url: session_service_url.into(),
            initialize_attempt: 0,
            start_counter: 0,
            crash_restarts: 0,
            running: false,
            max_crash_restarts: limits.max_crash_restarts,
            max_startup_restarts: limits.max_startup_restarts,
        }
    }

    /// Count a (re)start. Refused once the counter would exceed
    /// `max_startup_restarts`.
    pub fn begin_start(&mut self) -> Result<u32, DirectoryError> {
        if self.start_counter >= self.max_startup_restarts {
            return Err(DirectoryError::StartupRestartsExhausted {
                name: self.name.clone(),
                max: self.max_startup_restarts,
            });
        }
        self.start_counter += 1;
        self.initialize_attempt = 0;
        self.running = false;
        Ok(self.start_counter)
    }

    pub fn record_initialize_attempt(&mut self) -> InitializeDecision {
        self.initialize_attempt += 1;
        if self.initialize_attempt > MAX_INITIALIZE_ATTEMPTS {
            self.initialize_attempt = 0;
            return InitializeDecision::Restart;
        }
        InitializeDecision::Proceed(self.initialize_attempt)
    }

    /// The service finished starting; later failures count as crashes.
    pub fn mark_running(&mut self) {
        self.running = true;
        self.initialize_attempt = 0;
    }

    /// Count a restart after a crash. Opens a fresh startup phase.
    pub fn begin_crash_restart(&mut self) -> Result<u32, DirectoryError> {
        if self.crash_restarts >= self.max_crash_restarts {
            return Err(DirectoryError::CrashRestartsExhausted {
                name: self.name.clone(),
                max: self.max_crash_restarts,
            });
        }
        self.crash_restarts += 1;
        self.running = false;
        self.start_counter = 0;
        self.initialize_attempt = 0;
        Ok(self.crash_restarts)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("session already registered: {0}")]
    SessionExists(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("no {service_type} service tracked for session {session}")]
    ServiceNotFound { session: String, service_type: String },
    #[error("service {name} exceeded {max} startup restarts")]
    StartupRestartsExhausted { name: String, max: u32 },
    #[error("service {name} exceeded {max} crash restarts")]
    CrashRestartsExhausted { name: String, max: u32 },
}

/// A session known to the directory.
#[derive(Debug, Clone)]
pub struct SessionRoute {
    pub session_service_url: String,
    services: BTreeMap<String, ServiceInformation>,
}

impl SessionRoute {
    pub fn services(&self) -> impl Iterator<Item = &ServiceInformation> + '_ {
        self.services.values()
    }
}

pub struct SessionDirectory {
    hostname: String,
    defaults: RestartLimits,
    overrides: HashMap<(String, String), RestartLimits>,
    sessions: BTreeMap<String, SessionRoute>,
}

impl SessionDirectory {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self::with_defaults(hostname, RestartLimits::default())
    }

    pub fn with_defaults(hostname: impl Into<String>, defaults: RestartLimits) -> Self {
        Self {
            hostname: hostname.into(),
            defaults,
            overrides: HashMap::new(),
            sessions: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let directory = &config.directory;
        let defaults = RestartLimits {
            max_crash_restarts: directory.default_max_crash_restarts,
            max_startup_restarts: directory.default_max_startup_restarts,
        };
        let mut this = Self::with_defaults(config.hostname(), defaults);
        for service in &directory.services {
            this.set_limits(
                &service.name,
                &service.service_type,
                RestartLimits {
                    max_crash_restarts: service
                        .max_crash_restarts
                        .unwrap_or(defaults.max_crash_restarts),
                    max_startup_restarts: service
                        .max_startup_restarts
                        .unwrap_or(defaults.max_startup_restarts),
                },
            );
        }
        this
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Override the restart limits for services with this name and type.
    /// Applies to records created afterwards.
    pub fn set_limits(&mut self, name: &str, service_type: &str, limits: RestartLimits) {
        self.overrides
            .insert((name.to_string(), service_type.to_string()), limits);
    }

    pub fn limits_for(&self, name: &str, service_type: &str) -> RestartLimits {
        self.overrides
            .get(&(name.to_string(), service_type.to_string()))
            .copied()
            .unwrap_or(self.defaults)
    }

    pub fn register_session(
        &mut self,
        session_id: &str,
        session_service_url: &str,
    ) -> Result<(), DirectoryError> {
        if self.sessions.contains_key(session_id) {
            return Err(DirectoryError::SessionExists(session_id.to_string()));
        }
        self.sessions.insert(
            session_id.to_string(),
            SessionRoute {
                session_service_url: session_service_url.to_string(),
                services: BTreeMap::new(),
            },
        );
        tracing::info!(session = %session_id, url = %session_service_url, "session registered");
        Ok(())
    }

    /// Forget a session and every service record under it.
    pub fn remove_session(&mut self, session_id: &str) -> Option<SessionRoute> {
        let removed = self.sessions.remove(session_id);
        if removed.is_some() {
            tracing::info!(session = %session_id, "session removed from directory");
        }
        removed
    }

    /// URL of the session service responsible for `session_id`.
    pub fn route(&self, session_id: &str) -> Option<&str> {
        self.sessions
            .get(session_id)
            .map(|route| route.session_service_url.as_str())
    }

    pub fn sessions(&self) -> impl Iterator<Item = &str> + '_ {
        self.sessions.keys().map(String::as_str)
    }

    pub fn service(&self, session_id: &str, service_type: &str) -> Option<&ServiceInformation> {
        self.sessions.get(session_id)?.services.get(service_type)
    }

    /// Record a start of the service, creating its record on first use.
    /// Refused once its startup restarts are used up.
    pub fn request_start(
        &mut self,
        session_id: &str,
        name: &str,
        service_type: &str,
    ) -> Result<ServiceInformation, DirectoryError> {
        let limits = self.limits_for(name, service_type);
        let route = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| DirectoryError::SessionNotFound(session_id.to_string()))?;
        let url = route.session_service_url.clone();
        let info = route
            .services
            .entry(service_type.to_string())
            .or_insert_with(|| ServiceInformation::new(name, service_type, session_id, url, limits));

        match info.begin_start() {
            Ok(attempt) => {
                tracing::info!(session = %session_id, service = %name, attempt, "starting service");
                Ok(info.clone())
            }
            Err(e) => {
                tracing::error!(session = %session_id, service = %name, %e, "start refused");
                Err(e)
            }
        }
    }

    pub fn record_initialize_attempt(
        &mut self,
        session_id: &str,
        service_type: &str,
    ) -> Result<InitializeDecision, DirectoryError> {
        let info = self.service_mut(session_id, service_type)?;
        let decision = info.record_initialize_attempt();
        if decision == InitializeDecision::Restart {
            tracing::warn!(
                session = %session_id,
                service = %info.name,
                "initialization failed {MAX_INITIALIZE_ATTEMPTS} times, restarting service"
            );
        }
        Ok(decision)
    }

    pub fn confirm_initialized(
        &mut self,
        session_id: &str,
        service_type: &str,
    ) -> Result<(), DirectoryError> {
        let info = self.service_mut(session_id, service_type)?;
        info.mark_running();
        tracing::info!(session = %session_id, service = %info.name, "service running");
        Ok(())
    }

    /// Record a crash of a running service. Returns the crash restart count,
    /// or an error once the crash limit is reached.
    pub fn report_crash(
        &mut self,
        session_id: &str,
        service_type: &str,
    ) -> Result<u32, DirectoryError> {
        let info = self.service_mut(session_id, service_type)?;
        match info.begin_crash_restart() {
            Ok(count) => {
                tracing::warn!(session = %session_id, service = %info.name, count, "service crashed, restarting");
                Ok(count)
            }
            Err(e) => {
                tracing::error!(session = %session_id, service = %info.name, %e, "service crashed, giving up");
                Err(e)
            }
        }
    }

    pub fn remove_service(
        &mut self,
        session_id: &str,
        service_type: &str,
    ) -> Option<ServiceInformation> {
        self.sessions.get_mut(session_id)?.services.remove(service_type)
    }

    /// Every tracked session and service record, for diagnostics.
    pub fn to_json(&self) -> Value {
        let sessions: Vec<Value> = self
            .sessions
            .iter()
            .map(|(id, route)| {
                json!({
                    "SessionID": id,
                    "SessionServiceURL": route.session_service_url,
                    "Services": route.services.values().collect::<Vec<_>>(),
                })
            })
            .collect();
        json!({
            "Hostname": self.hostname,
            "Sessions": sessions,
        })
    }

    fn service_mut(
        &mut self,
        session_id: &str,
        service_type: &str,
    ) -> Result<&mut ServiceInformation, DirectoryError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| DirectoryError::SessionNotFound(session_id.to_string()))?
            .services
            .get_mut(service_type)
            .ok_or_else(|| DirectoryError::ServiceNotFound {
                session: session_id.to_string(),
                service_type: service_type.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceLimitConfig;

    fn directory() -> SessionDirectory {
        let mut dir = SessionDirectory::with_defaults(
            "host-1",
            RestartLimits {
                max_crash_restarts: 2,
                max_startup_restarts: 3,
            },
        );
        dir.register_session("s1", "127.0.0.1:8092").unwrap();
        dir
    }

    #[test]
    fn service_information_json_is_flat_and_lossless() {
        let mut info = ServiceInformation::new("Model", "model", "s1", "127.0.0.1:8092", RestartLimits::default());
        info.begin_start().unwrap();
        info.record_initialize_attempt();

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            value,
            json!({
                "Name": "Model",
                "Type": "model",
                "SessionID": "s1",
                "SessionServiceURL": "127.0.0.1:8092",
                "InitializeAttempt": 1,
                "StartCounter": 1,
                "CrashRestarts": 0,
                "Running": false,
                "MaxCrashRestarts": 8,
                "MaxStartupRestarts": 64,
            })
        );
        let back: ServiceInformation = serde_json::from_value(value).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn records_without_crash_fields_still_parse() {
        let info: ServiceInformation = serde_json::from_value(json!({
            "Name": "UI", "Type": "ui", "SessionID": "s", "SessionServiceURL": "h:1",
            "InitializeAttempt": 0, "StartCounter": 2,
            "MaxCrashRestarts": 8, "MaxStartupRestarts": 64,
        }))
        .unwrap();
        assert_eq!(info.crash_restarts, 0);
        assert!(!info.running);
    }

    #[test]
    fn start_is_refused_after_max_startup_restarts() {
        let mut dir = directory();
        for attempt in 1..=3 {
            let info = dir.request_start("s1", "Model", "model").unwrap();
            assert_eq!(info.start_counter, attempt);
            assert_eq!(info.session_service_url, "127.0.0.1:8092");
        }
        for _ in 0..3 {
            assert!(matches!(
                dir.request_start("s1", "Model", "model"),
                Err(DirectoryError::StartupRestartsExhausted { max: 3, .. })
            ));
        }
        assert_eq!(dir.service("s1", "model").unwrap().start_counter, 3);
    }

    #[test]
    fn initialization_attempts_are_bounded() {
        let mut dir = directory();
        dir.request_start("s1", "Model", "model").unwrap();
        for attempt in 1..=MAX_INITIALIZE_ATTEMPTS {
            assert_eq!(
                dir.record_initialize_attempt("s1", "model").unwrap(),
                InitializeDecision::Proceed(attempt)
            );
        }
        assert_eq!(
            dir.record_initialize_attempt("s1", "model").unwrap(),
            InitializeDecision::Restart
        );
        assert_eq!(dir.service("s1", "model").unwrap().initialize_attempt, 0);
    }

    #[test]
    fn crash_restarts_are_counted_separately() {
        let mut dir = directory();
        dir.request_start("s1", "Model", "model").unwrap();
        dir.request_start("s1", "Model", "model").unwrap();
        dir.confirm_initialized("s1", "model").unwrap();
        assert!(dir.service("s1", "model").unwrap().running);

        assert_eq!(dir.report_crash("s1", "model").unwrap(), 1);
        let info = dir.service("s1", "model").unwrap();
        assert!(!info.running);
        assert_eq!(info.start_counter, 0);

        // A fresh startup phase is available after the crash.
        for _ in 0..3 {
            dir.request_start("s1", "Model", "model").unwrap();
        }
        assert_eq!(dir.report_crash("s1", "model").unwrap(), 2);
        assert!(matches!(
            dir.report_crash("s1", "model"),
            Err(DirectoryError::CrashRestartsExhausted { max: 2, .. })
        ));
    }

    #[test]
    fn unknown_session_and_service() {
        let mut dir = directory();
        assert!(matches!(
            dir.request_start("nope", "UI", "ui"),
            Err(DirectoryError::SessionNotFound(_))
        ));
        assert!(matches!(
            dir.confirm_initialized("s1", "ui"),
            Err(DirectoryError::ServiceNotFound { .. })
        ));
        assert!(matches!(
            dir.register_session("s1", "elsewhere:1"),
            Err(DirectoryError::SessionExists(_))
        ));
    }

    #[test]
    fn routing_and_removal() {
        let mut dir = directory();
        dir.register_session("s2", "10.0.0.2:9000").unwrap();
        assert_eq!(dir.route("s2"), Some("10.0.0.2:9000"));
        assert_eq!(dir.sessions().collect::<Vec<_>>(), vec!["s1", "s2"]);

        dir.request_start("s2", "UI", "ui").unwrap();
        let removed = dir.remove_session("s2").unwrap();
        assert_eq!(removed.services().count(), 1);
        assert!(dir.route("s2").is_none());
        assert!(dir.service("s2", "ui").is_none());
    }

    #[test]
    fn limits_come_from_config_overrides() {
        let mut config = OrchestratorConfig::default();
        config.directory.hostname = Some("cfg-host".into());
        config.directory.default_max_startup_restarts = 10;
        config.directory.services.push(ServiceLimitConfig {
            name: "Model".into(),
            service_type: "model".into(),
            max_crash_restarts: Some(1),
            max_startup_restarts: None,
        });
        let mut dir = SessionDirectory::from_config(&config);
        assert_eq!(dir.hostname(), "cfg-host");
        assert_eq!(
            dir.limits_for("Model", "model"),
            RestartLimits { max_crash_restarts: 1, max_startup_restarts: 10 }
        );
        assert_eq!(
            dir.limits_for("UI", "ui"),
            RestartLimits { max_crash_restarts: 8, max_startup_restarts: 10 }
        );

        dir.register_session("s", "h:1").unwrap();
        let info = dir.request_start("s", "Model", "model").unwrap();
        assert_eq!(info.max_crash_restarts, 1);
    }

    #[test]
    fn debug_dump_lists_every_record() {
        let mut dir = directory();
        dir.request_start("s1", "Model", "model").unwrap();
        dir.request_start("s1", "UI", "ui").unwrap();
        let dump = dir.to_json();
        assert_eq!(dump["Hostname"], "host-1");
        assert_eq!(dump["Sessions"][0]["SessionID"], "s1");
        let services = dump["Sessions"][0]["Services"].as_array().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0]["Type"], "model");
        assert_eq!(services[1]["StartCounter"], 1);
    }
}
