//! Hierarchical key/value configuration with YAML ingestion.
//!
//! Values are registered under lower-case dotted keys (`fiber.stack_size`)
//! through [`Config::lookup`], which hands back a live [`ConfigVar`]. Loading a
//! YAML document flattens it into dotted keys and updates every registered
//! var it mentions; change listeners see the old and new value.

use crate::error::{Error, Result};
use crate::log::Logger;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Key of the default fiber stack size.
pub const FIBER_STACK_SIZE_KEY: &str = "fiber.stack_size";
/// Default fiber stack size (1 MiB).
pub const DEFAULT_FIBER_STACK_SIZE: u32 = 1024 * 1024;
/// Key of the idle wait used by [`CondvarPark`](crate::park::CondvarPark).
pub const IDLE_TIMEOUT_KEY: &str = "scheduler.idle_timeout_ms";
/// Default idle wait in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10;

/// Bounds every configurable value type satisfies.
pub trait ConfigValue:
    Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static
{
}

impl<T> ConfigValue for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static
{
}

/// Type-erased view of a [`ConfigVar`], used by the registry and loaders.
pub trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn type_name(&self) -> &'static str;
    /// Serializes the current value as YAML.
    fn to_yaml_string(&self) -> Result<String>;
    /// Replaces the value from a YAML node, keeping the old one on failure.
    fn set_from_yaml(&self, node: &Value) -> Result<()>;
    fn set_from_yaml_str(&self, text: &str) -> Result<()>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A named, typed, observable configuration value.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
    next_listener: AtomicU64,
}

impl<T: ConfigValue> ConfigVar<T> {
    fn new(name: String, default_value: T, description: &str) -> Self {
        ConfigVar {
            name,
            description: description.to_string(),
            value: RwLock::new(default_value),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Stores `value`, notifying listeners first. Equal values are ignored.
    pub fn set_value(&self, value: T) {
        let old = {
            let current = self.value.read();
            if *current == value {
                return;
            }
            current.clone()
        };
        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&old, &value);
        }
        *self.value.write() = value;
    }

    /// Registers a change listener and returns the key that removes it.
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let key = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(key, Arc::new(listener));
        key
    }

    pub fn remove_listener(&self, key: u64) -> bool {
        self.listeners.lock().remove(&key).is_some()
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T: ConfigValue> ConfigVarBase for ConfigVar<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&*self.value.read())?)
    }

    fn set_from_yaml(&self, node: &Value) -> Result<()> {
        let value = serde_yaml::from_value::<T>(node.clone()).map_err(|source| Error::ConfigValue {
            name: self.name.clone(),
            source,
        })?;
        self.set_value(value);
        Ok(())
    }

    fn set_from_yaml_str(&self, text: &str) -> Result<()> {
        let node: Value = serde_yaml::from_str(text).map_err(|source| Error::ConfigValue {
            name: self.name.clone(),
            source,
        })?;
        self.set_from_yaml(&node)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: ConfigValue> Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &*self.value.read())
            .field("description", &self.description)
            .finish()
    }
}

lazy_static::lazy_static! {
    static ref REGISTRY: RwLock<BTreeMap<String, Arc<dyn ConfigVarBase>>> =
        RwLock::new(BTreeMap::new());
}

fn is_valid_name(name: &str) -> bool {
    name.bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'.')
}

/// Process-wide configuration registry.
pub struct Config;

impl Config {
    /// Finds or registers the var called `name`.
    ///
    /// Fails if the name contains characters outside `[a-z0-9_.]` (after
    /// lower-casing) or if a var of a different type already owns it.
    pub fn lookup<T: ConfigValue>(
        name: &str,
        default_value: T,
        description: &str,
    ) -> Result<Arc<ConfigVar<T>>> {
        let name = name.to_ascii_lowercase();
        if name.is_empty() || !is_valid_name(&name) {
            Logger::root().error(format_args!("config lookup with invalid name `{name}`"));
            return Err(Error::InvalidConfigName(name));
        }

        let mut registry = REGISTRY.write();
        if let Some(existing) = registry.get(&name).cloned() {
            let actual = existing.type_name();
            return existing.as_any().downcast::<ConfigVar<T>>().map_err(|_| {
                Logger::root().error(format_args!(
                    "config `{name}` exists as {actual}, requested {}",
                    std::any::type_name::<T>()
                ));
                Error::ConfigTypeMismatch {
                    name: name.clone(),
                    expected: std::any::type_name::<T>(),
                    actual,
                }
            });
        }

        let var = Arc::new(ConfigVar::new(name.clone(), default_value, description));
        registry.insert(name, var.clone() as Arc<dyn ConfigVarBase>);
        Ok(var)
    }

    /// Returns the var called `name` if it exists with type `T`.
    pub fn get<T: ConfigValue>(name: &str) -> Option<Arc<ConfigVar<T>>> {
        Self::lookup_base(name)?.as_any().downcast::<ConfigVar<T>>().ok()
    }

    pub fn lookup_base(name: &str) -> Option<Arc<dyn ConfigVarBase>> {
        REGISTRY.read().get(&name.to_ascii_lowercase()).cloned()
    }

    /// Calls `visitor` for every registered var, in key order.
    pub fn visit<F>(mut visitor: F)
    where
        F: FnMut(&Arc<dyn ConfigVarBase>),
    {
        let vars: Vec<_> = REGISTRY.read().values().cloned().collect();
        for var in &vars {
            visitor(var);
        }
    }

    /// Applies a parsed YAML document to the registered vars.
    ///
    /// Unknown keys are ignored; values that fail to convert are logged and
    /// the var keeps its previous value.
    pub fn load_from_yaml(root: &Value) {
        register_core_tunables();

        let mut members = Vec::new();
        list_all_members("", root, &mut members);
        for (key, node) in members {
            if key.is_empty() {
                continue;
            }
            let Some(var) = Self::lookup_base(&key) else {
                continue;
            };
            if let Err(err) = var.set_from_yaml(&node) {
                Logger::root().error(format_args!("config `{key}` rejected: {err}"));
            }
        }
    }

    pub fn load_from_yaml_str(text: &str) -> Result<()> {
        let root: Value = serde_yaml::from_str(text)?;
        Self::load_from_yaml(&root);
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_from_yaml_str(&text)
    }
}

/// Flattens nested maps into `(dotted.key, node)` pairs, parents first.
fn list_all_members(prefix: &str, node: &Value, out: &mut Vec<(String, Value)>) {
    if !is_valid_name(prefix) {
        Logger::root().error(format_args!("config has invalid key `{prefix}`"));
        return;
    }
    out.push((prefix.to_string(), node.clone()));
    if let Value::Mapping(map) = node {
        for (key, child) in map {
            let key = match key {
                Value::String(s) => s.to_ascii_lowercase(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    Logger::root().error(format_args!("config has non-scalar key {other:?}"));
                    continue;
                }
            };
            let path = if prefix.is_empty() {
                key
            } else {
                format!("{prefix}.{key}")
            };
            list_all_members(&path, child, out);
        }
    }
}

lazy_static::lazy_static! {
    static ref FIBER_STACK_SIZE: Option<Arc<ConfigVar<u32>>> =
        register_tunable(FIBER_STACK_SIZE_KEY, DEFAULT_FIBER_STACK_SIZE, "fiber stack size");
    static ref IDLE_TIMEOUT_MS: Option<Arc<ConfigVar<u64>>> =
        register_tunable(IDLE_TIMEOUT_KEY, DEFAULT_IDLE_TIMEOUT_MS, "idle wait in ms");
}

fn register_tunable<T: ConfigValue>(name: &str, default_value: T, description: &str) -> Option<Arc<ConfigVar<T>>> {
    Config::lookup(name, default_value, description)
        .map_err(|err| Logger::system().error(format_args!("cannot register `{name}`: {err}")))
        .ok()
}

/// Registers the runtime's own tunables so a YAML document loaded before the
/// first fiber or scheduler still reaches them.
pub fn register_core_tunables() {
    lazy_static::initialize(&FIBER_STACK_SIZE);
    lazy_static::initialize(&IDLE_TIMEOUT_MS);
    crate::log::register_logger_config();
}

/// Current default fiber stack size in bytes.
///
/// A configured size of zero is rejected and the default used instead.
pub fn fiber_stack_size() -> usize {
    let Some(var) = FIBER_STACK_SIZE.as_ref() else {
        return DEFAULT_FIBER_STACK_SIZE as usize;
    };
    match var.value() {
        0 => {
            Logger::system().error(format_args!(
                "`{FIBER_STACK_SIZE_KEY}` is 0, using {DEFAULT_FIBER_STACK_SIZE}"
            ));
            DEFAULT_FIBER_STACK_SIZE as usize
        }
        size => size as usize,
    }
}

/// Current idle wait for condition-variable parking.
pub fn idle_timeout() -> Duration {
    let millis = IDLE_TIMEOUT_MS
        .as_ref()
        .map_or(DEFAULT_IDLE_TIMEOUT_MS, |var| var.value());
    Duration::from_millis(millis)
}
