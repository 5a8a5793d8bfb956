//! Realm plugins and the registry resolving realm/agent type aliases to them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, PluginError};
use crate::identity::{AgentRef, RealmRef};

/// Host integration for one family of realm types.
pub trait RealmPlugin: Send + Sync {
    /// Current agent roster of the realm.
    fn related_agents(&self, realm: &RealmRef) -> Result<Vec<AgentRef>, PluginError>;

    /// Generate a turn because every agent is ready.
    fn auto_generate(&self, realm: &RealmRef) -> Result<(), PluginError>;

    /// Generate a turn because the schedule fired.
    fn force_generate(&self, realm: &RealmRef) -> Result<(), PluginError>;
}

/// A plugin together with the aliases it declares.
pub struct PluginEntry {
    name: String,
    plugin: Arc<dyn RealmPlugin>,
    realm_types: BTreeMap<String, String>,
    agent_types: BTreeMap<String, String>,
}

impl PluginEntry {
    pub fn new(name: impl Into<String>, plugin: Arc<dyn RealmPlugin>) -> Self {
        Self {
            name: name.into(),
            plugin,
            realm_types: BTreeMap::new(),
            agent_types: BTreeMap::new(),
        }
    }

    /// Declare `alias` as a name for the realm type `type_key`.
    pub fn realm_type(mut self, alias: impl Into<String>, type_key: impl Into<String>) -> Self {
        self.realm_types.insert(alias.into(), type_key.into());
        self
    }

    /// Declare `alias` as a name for the agent type `type_key`.
    pub fn agent_type(mut self, alias: impl Into<String>, type_key: impl Into<String>) -> Self {
        self.agent_types.insert(alias.into(), type_key.into());
        self
    }
}

/// Per-plugin alias overrides. An empty target removes the alias.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AliasOverrides {
    pub realm_types: BTreeMap<String, String>,
    pub agent_types: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct PluginRegistryBuilder {
    entries: Vec<PluginEntry>,
    overrides: HashMap<String, AliasOverrides>,
}

impl PluginRegistryBuilder {
    pub fn register(mut self, entry: PluginEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_overrides(mut self, plugin_name: impl Into<String>, overrides: AliasOverrides) -> Self {
        self.overrides.insert(plugin_name.into(), overrides);
        self
    }

    pub fn with_all_overrides(
        mut self,
        overrides: impl IntoIterator<Item = (String, AliasOverrides)>,
    ) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn build(self) -> PluginRegistry {
        let mut registry = PluginRegistry::default();
        for entry in self.entries {
            let overrides = self.overrides.get(&entry.name);

            let mut realm_types = entry.realm_types;
            let mut agent_types = entry.agent_types;
            if let Some(o) = overrides {
                realm_types.extend(o.realm_types.clone());
                agent_types.extend(o.agent_types.clone());
            }

            for (alias, key) in realm_types.into_iter().filter(|(_, k)| !k.is_empty()) {
                registry.plugins.insert(key.clone(), entry.plugin.clone());
                registry.realm_types.insert(alias, key);
            }
            for (alias, key) in agent_types.into_iter().filter(|(_, k)| !k.is_empty()) {
                registry.plugins.insert(key.clone(), entry.plugin.clone());
                registry.agent_types.insert(alias, key);
            }
            registry.names.push(entry.name);
        }
        registry
    }
}

/// Immutable map from type keys to plugins, built once at startup.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    names: Vec<String>,
    realm_types: HashMap<String, String>,
    agent_types: HashMap<String, String>,
    plugins: HashMap<String, Arc<dyn RealmPlugin>>,
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    /// Type key registered under a realm alias.
    pub fn realm_type(&self, alias: &str) -> Option<&str> {
        self.realm_types.get(alias).map(String::as_str)
    }

    /// Type key registered under an agent alias.
    pub fn agent_type(&self, alias: &str) -> Option<&str> {
        self.agent_types.get(alias).map(String::as_str)
    }

    /// Resolve a realm alias plus id into a reference.
    pub fn realm(&self, alias: &str, id: u64) -> Result<RealmRef, KernelError> {
        self.realm_type(alias)
            .map(|key| RealmRef::new(key, id))
            .ok_or_else(|| KernelError::UnknownRealmType(alias.to_string()))
    }

    pub fn plugin_for_type(&self, type_key: &str) -> Option<Arc<dyn RealmPlugin>> {
        self.plugins.get(type_key).cloned()
    }

    pub fn plugin_for(&self, realm: &RealmRef) -> Result<Arc<dyn RealmPlugin>, KernelError> {
        self.plugin_for_type(&realm.kind)
            .ok_or_else(|| KernelError::UnknownRealmType(realm.kind.clone()))
    }

    pub fn plugin_names(&self) -> &[String] {
        &self.names
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("names", &self.names)
            .field("realm_types", &self.realm_types)
            .field("agent_types", &self.agent_types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stubs::FakeRealmPlugin;

    fn entry() -> PluginEntry {
        PluginEntry::new("sample_app", Arc::new(FakeRealmPlugin::new()))
            .realm_type("testrealm", "sample_app.testrealm")
            .agent_type("testagent", "sample_app.testagent")
    }

    #[test]
    fn resolves_declared_aliases() {
        let registry = PluginRegistry::builder().register(entry()).build();
        assert_eq!(registry.realm_type("testrealm"), Some("sample_app.testrealm"));
        assert_eq!(registry.agent_type("testagent"), Some("sample_app.testagent"));
        assert_eq!(registry.realm_type("unknown"), None);

        let realm = registry.realm("testrealm", 4).unwrap();
        assert_eq!(realm, RealmRef::new("sample_app.testrealm", 4));
        assert!(registry.plugin_for(&realm).is_ok());
        assert!(registry.plugin_for_type("sample_app.testagent").is_some());
    }

    #[test]
    fn overrides_replace_add_and_remove_aliases() {
        let overrides = AliasOverrides {
            realm_types: BTreeMap::from([
                ("testrealm".to_string(), String::new()),
                ("world".to_string(), "sample_app.world".to_string()),
            ]),
            agent_types: BTreeMap::from([(
                "testagent".to_string(),
                "sample_app.player".to_string(),
            )]),
        };
        let registry = PluginRegistry::builder()
            .register(entry())
            .with_overrides("sample_app", overrides)
            .build();

        assert_eq!(registry.realm_type("testrealm"), None);
        assert_eq!(registry.realm_type("world"), Some("sample_app.world"));
        assert_eq!(registry.agent_type("testagent"), Some("sample_app.player"));
        assert!(registry.plugin_for_type("sample_app.testrealm").is_none());
    }

    #[test]
    fn overrides_for_other_plugins_are_ignored() {
        let overrides = AliasOverrides {
            realm_types: BTreeMap::from([("testrealm".to_string(), String::new())]),
            ..AliasOverrides::default()
        };
        let registry = PluginRegistry::builder()
            .register(entry())
            .with_overrides("other_app", overrides)
            .build();
        assert_eq!(registry.realm_type("testrealm"), Some("sample_app.testrealm"));
    }

    #[test]
    fn unknown_realm_type_is_an_error() {
        let registry = PluginRegistry::builder().build();
        let err = registry
            .plugin_for(&RealmRef::new("nope.realm", 1))
            .err()
            .unwrap();
        assert!(matches!(err, KernelError::UnknownRealmType(kind) if kind == "nope.realm"));
        assert!(matches!(
            registry.realm("nope", 1),
            Err(KernelError::UnknownRealmType(_))
        ));
    }
}
