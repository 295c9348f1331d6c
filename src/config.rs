//! Configuration management for the bridge
//!
//! Loads the camera list, microphone, session constraints, ICE servers,
//! flush interval and trace filters from TOML. Loading is lenient per field:
//! a malformed entry is logged and left at its default instead of rejecting
//! the whole file.

use crate::errors::ConfigError;
use crate::trace::TraceLevel;
use crate::types::{Constraint, IceServer, MediaConstraints, SourceOrigin};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::{Table, Value};

/// Default interval between periodic flushes, in seconds (10 minutes).
pub const DEFAULT_FLUSH_FREQUENCY_SECS: u64 = 10 * 60;

pub const DEFAULT_NAMESPACE: &str = "crabrtc";

/// One configured video source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoSourceSpec {
    pub origin: SourceOrigin,
    /// Source name without its scheme.
    pub name: String,
    /// Track label; empty means "assign one when the pipeline is built".
    pub label: String,
    pub constraints: MediaConstraints,
    /// Republish converted frames on the bus.
    pub publish: bool,
}

impl VideoSourceSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            origin: SourceOrigin::Topic,
            name: name.into(),
            label: String::new(),
            constraints: MediaConstraints::default(),
            publish: false,
        }
    }

    pub fn device(name: impl Into<String>) -> Self {
        Self {
            origin: SourceOrigin::Device,
            ..Self::topic(name)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    /// Name with its scheme re-attached, as written in config files.
    pub fn qualified_name(&self) -> String {
        format!("{}{}", self.origin.scheme(), self.name)
    }
}

/// The single audio source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AudioSourceSpec {
    pub label: String,
    pub constraints: MediaConstraints,
    pub publish: bool,
}

/// Root configuration consumed by [`Orchestrator::open`](crate::orchestrator::Orchestrator::open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeConfig {
    /// Prefix of every endpoint and topic name.
    pub namespace: String,
    pub cameras: Vec<VideoSourceSpec>,
    pub microphone: AudioSourceSpec,
    pub session_constraints: MediaConstraints,
    pub ice_servers: Vec<IceServer>,
    /// Seconds between periodic flushes; 0 disables them.
    pub flush_frequency: u64,
    pub trace_filters: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            cameras: Vec::new(),
            microphone: AudioSourceSpec::default(),
            session_constraints: MediaConstraints::default(),
            ice_servers: Vec::new(),
            flush_frequency: DEFAULT_FLUSH_FREQUENCY_SECS,
            trace_filters: vec!["default".to_string()],
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config = Self::from_toml_str(&contents)?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse a TOML document. Only a syntactically broken document is an error.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let table: Table =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self::from_table(&table))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
            }
        }

        fs::write(path, self.to_toml_string()?).map_err(|e| ConfigError::Io(e.to_string()))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("crabrtc.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn trace_level(&self) -> TraceLevel {
        TraceLevel::parse_filters(&self.trace_filters)
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_frequency > 0).then(|| Duration::from_secs(self.flush_frequency))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".to_string()));
        }

        let mut labels = std::collections::HashSet::new();
        for camera in &self.cameras {
            if camera.name.is_empty() {
                return Err(ConfigError::Invalid("camera name must not be empty".to_string()));
            }
            if !camera.label.is_empty() && !labels.insert(camera.label.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate video label '{}'",
                    camera.label
                )));
            }
        }

        for server in &self.ice_servers {
            if server.uri.is_empty() {
                return Err(ConfigError::Invalid("ice server uri must not be empty".to_string()));
            }
        }

        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        let mut root = Table::new();
        root.insert("namespace".into(), Value::String(self.namespace.clone()));
        root.insert(
            "flush_frequency".into(),
            Value::Integer(i64::try_from(self.flush_frequency).unwrap_or(i64::MAX)),
        );
        root.insert(
            "trace_filters".into(),
            Value::Array(self.trace_filters.iter().cloned().map(Value::String).collect()),
        );

        let cameras = self
            .cameras
            .iter()
            .map(|camera| {
                let mut t = Table::new();
                t.insert("name".into(), Value::String(camera.qualified_name()));
                t.insert("label".into(), Value::String(camera.label.clone()));
                t.insert("publish".into(), Value::Boolean(camera.publish));
                t.insert("constraints".into(), constraints_to_value(&camera.constraints));
                Value::Table(t)
            })
            .collect();
        root.insert("cameras".into(), Value::Array(cameras));

        let mut microphone = Table::new();
        microphone.insert("label".into(), Value::String(self.microphone.label.clone()));
        microphone.insert("publish".into(), Value::Boolean(self.microphone.publish));
        microphone.insert(
            "constraints".into(),
            constraints_to_value(&self.microphone.constraints),
        );
        root.insert("microphone".into(), Value::Table(microphone));

        let mut session = Table::new();
        session.insert(
            "constraints".into(),
            constraints_to_value(&self.session_constraints),
        );
        root.insert("session".into(), Value::Table(session));

        let servers = self
            .ice_servers
            .iter()
            .map(|server| {
                let mut t = Table::new();
                t.insert("uri".into(), Value::String(server.uri.clone()));
                t.insert("username".into(), Value::String(server.username.clone()));
                t.insert("password".into(), Value::String(server.password.clone()));
                Value::Table(t)
            })
            .collect();
        root.insert("ice_servers".into(), Value::Array(servers));

        toml::to_string_pretty(&root).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    fn from_table(table: &Table) -> Self {
        let mut config = Self::default();

        match table.get("namespace") {
            Some(Value::String(ns)) if !ns.trim().is_empty() => {
                config.namespace = ns.trim_matches('/').to_string()
            }
            Some(_) => log::warn!("'namespace' param is not a non-empty string, using default"),
            None => {}
        }

        // cameras: array of tables, or the legacy table keyed by camera name
        match table.get("cameras") {
            Some(Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    if let Some(camera) = parse_camera(&format!("cameras[{}]", i), item) {
                        config.cameras.push(camera);
                    }
                }
            }
            Some(Value::Table(items)) => {
                for (key, item) in items {
                    if let Some(camera) = parse_camera(&format!("cameras/{}", key), item) {
                        config.cameras.push(camera);
                    }
                }
            }
            Some(_) => log::warn!("'cameras' param is neither a list nor a table"),
            None => log::info!("missing 'cameras' param"),
        }

        match table.get("microphone") {
            Some(Value::Table(t)) => {
                config.microphone = AudioSourceSpec {
                    label: get_string(t, "microphone", "label").unwrap_or_default(),
                    constraints: parse_constraints("microphone", t.get("constraints")),
                    publish: get_bool(t, "microphone", "publish").unwrap_or(false),
                };
            }
            Some(_) => log::warn!("'microphone' param is not a table"),
            None => {}
        }

        if let Some(session) = table.get("session") {
            match session {
                Value::Table(t) => {
                    config.session_constraints =
                        parse_constraints("session", t.get("constraints"));
                }
                _ => log::warn!("'session' param is not a table"),
            }
        }

        match table.get("ice_servers") {
            Some(Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    if let Some(server) = parse_ice_server(&format!("ice_servers[{}]", i), item) {
                        config.ice_servers.push(server);
                    }
                }
            }
            Some(Value::Table(items)) => {
                for (key, item) in items {
                    if let Some(server) = parse_ice_server(&format!("ice_servers/{}", key), item)
                    {
                        config.ice_servers.push(server);
                    }
                }
            }
            Some(_) => log::warn!("'ice_servers' param is neither a list nor a table"),
            None => log::info!("missing 'ice_servers' param"),
        }

        match table.get("flush_frequency") {
            Some(Value::Integer(secs)) if *secs >= 0 => config.flush_frequency = *secs as u64,
            Some(_) => log::info!("'flush_frequency' param type not a non-negative int"),
            None => {}
        }

        match table.get("trace_filters") {
            Some(Value::Array(items)) => {
                config.trace_filters = items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        other => {
                            log::warn!("ignoring non-string trace filter {}", other);
                            None
                        }
                    })
                    .collect();
            }
            Some(Value::String(s)) => config.trace_filters = vec![s.clone()],
            Some(_) => log::warn!("'trace_filters' param is not a list of strings"),
            None => {}
        }

        config
    }
}

fn get_string(table: &Table, root: &str, key: &str) -> Option<String> {
    match table.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            log::warn!("'{}/{}' param is not a string", root, key);
            None
        }
        None => None,
    }
}

fn get_bool(table: &Table, root: &str, key: &str) -> Option<bool> {
    match table.get(key) {
        Some(Value::Boolean(b)) => Some(*b),
        Some(_) => {
            log::warn!("'{}/{}' param is not a bool", root, key);
            None
        }
        None => None,
    }
}

fn parse_camera(root: &str, value: &Value) -> Option<VideoSourceSpec> {
    let Value::Table(t) = value else {
        log::warn!("'{}' is not a table, skipping camera", root);
        return None;
    };
    let full_name = match get_string(t, root, "name") {
        Some(name) if !name.is_empty() => name,
        _ => {
            log::warn!("'{}' has no name, skipping camera", root);
            return None;
        }
    };
    let (origin, name) = SourceOrigin::parse(&full_name);
    if name.is_empty() {
        log::warn!("'{}' name '{}' has an empty source, skipping camera", root, full_name);
        return None;
    }

    Some(VideoSourceSpec {
        origin,
        name: name.to_string(),
        label: get_string(t, root, "label").unwrap_or_default(),
        constraints: parse_constraints(root, t.get("constraints")),
        publish: get_bool(t, root, "publish").unwrap_or(false),
    })
}

fn parse_ice_server(root: &str, value: &Value) -> Option<IceServer> {
    let Value::Table(t) = value else {
        log::warn!("'{}' is not a table, skipping ice server", root);
        return None;
    };
    let uri = match get_string(t, root, "uri") {
        Some(uri) if !uri.is_empty() => uri,
        _ => {
            log::warn!("'{}' has no uri, skipping ice server", root);
            return None;
        }
    };
    Some(IceServer {
        uri,
        username: get_string(t, root, "username").unwrap_or_default(),
        password: get_string(t, root, "password").unwrap_or_default(),
    })
}

fn parse_constraints(root: &str, value: Option<&Value>) -> MediaConstraints {
    let mut constraints = MediaConstraints::default();
    let Some(value) = value else {
        return constraints;
    };
    let Value::Table(t) = value else {
        log::warn!("'{}/constraints' is not a table", root);
        return constraints;
    };

    for (section, target) in [
        ("mandatory", &mut constraints.mandatory),
        ("optional", &mut constraints.optional),
    ] {
        match t.get(section) {
            Some(Value::Table(entries)) => {
                for (key, value) in entries {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        Value::Integer(i) => i.to_string(),
                        Value::Float(f) => f.to_string(),
                        Value::Boolean(b) => b.to_string(),
                        _ => {
                            log::warn!(
                                "'{}/constraints/{}/{}' has an unsupported value type, skipping",
                                root,
                                section,
                                key
                            );
                            continue;
                        }
                    };
                    target.push(Constraint::new(key.clone(), value));
                }
            }
            Some(_) => log::warn!("'{}/constraints/{}' is not a table", root, section),
            None => {}
        }
    }

    constraints
}

fn constraints_to_value(constraints: &MediaConstraints) -> Value {
    let section = |entries: &[Constraint]| {
        let mut t = Table::new();
        for c in entries {
            t.insert(c.key.clone(), Value::String(c.value.clone()));
        }
        Value::Table(t)
    };
    let mut t = Table::new();
    t.insert("mandatory".into(), section(&constraints.mandatory));
    t.insert("optional".into(), section(&constraints.optional));
    Value::Table(t)
}
