use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{BaseKey, ContentStructure, InstanceKey, ResourceMetadata, ResourcePointer};
use crate::error::BtcError;
use crate::keys::{base_key_of, derive_instance_key, usage_count};
use crate::store::KeyValueStore;

pub const WORKSPACE_KEY: &str = "workspace:current";
pub const WORKSPACE_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Panel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub resource_keys: Vec<InstanceKey>,
    #[serde(default)]
    pub active_index: usize,
    #[serde(default)]
    pub position: usize,
}

impl Panel {
    pub fn new(id: &str, name: &str, position: usize) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            resource_keys: Vec::new(),
            active_index: 0,
            position,
        }
    }

    pub fn active_key(&self) -> Option<&InstanceKey> {
        self.resource_keys.get(self.active_index)
    }

    fn index_of(&self, key: &InstanceKey) -> Option<usize> {
        self.resource_keys.iter().position(|candidate| candidate == key)
    }

    fn insert(&mut self, key: InstanceKey, index: Option<usize>) {
        let len = self.resource_keys.len();
        let index = index.unwrap_or(len).min(len);
        self.resource_keys.insert(index, key);
        if len > 0 && index <= self.active_index {
            self.active_index += 1;
        }
    }

    fn remove_at(&mut self, index: usize) -> InstanceKey {
        let removed = self.resource_keys.remove(index);
        if index < self.active_index {
            self.active_index -= 1;
        }
        if self.active_index >= self.resource_keys.len() {
            self.active_index = self.resource_keys.len().saturating_sub(1);
        }
        removed
    }
}

/// Table row for a resource: the metadata fields panels need to render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    pub pointer: ResourcePointer,
    pub title: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub content_structure: ContentStructure,
    /// Removed from the table but still referenced by a panel.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detached: bool,
}

impl From<&ResourceMetadata> for ResourceEntry {
    fn from(value: &ResourceMetadata) -> Self {
        Self {
            pointer: value.pointer.clone(),
            title: value.title.clone(),
            subject: value.subject.clone(),
            resource_type: value.resource_type.clone(),
            version: value.version.clone(),
            content_structure: value.content_structure,
            detached: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRemoval {
    pub removed: bool,
    pub remaining_instances: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resources: BTreeMap<BaseKey, ResourceEntry>,
    #[serde(default)]
    pub panels: Vec<Panel>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            name: "My Workspace".to_string(),
            version: WORKSPACE_VERSION.to_string(),
            resources: BTreeMap::new(),
            panels: vec![
                Panel::new("panel-1", "Panel 1", 0),
                Panel::new("panel-2", "Panel 2", 1),
            ],
        }
    }
}

impl Workspace {
    pub fn panel(&self, panel_id: &str) -> Option<&Panel> {
        self.panels.iter().find(|panel| panel.id == panel_id)
    }

    fn panel_mut(&mut self, panel_id: &str) -> Option<&mut Panel> {
        self.panels.iter_mut().find(|panel| panel.id == panel_id)
    }

    pub fn instance_keys(&self) -> impl Iterator<Item = &InstanceKey> {
        self.panels.iter().flat_map(|panel| panel.resource_keys.iter())
    }

    /// Panels that currently hold `key`.
    pub fn panels_containing(&self, key: &InstanceKey) -> Vec<&str> {
        self.panels
            .iter()
            .filter(|panel| panel.resource_keys.contains(key))
            .map(|panel| panel.id.as_str())
            .collect()
    }

    /// Table lookup for a placed instance, by its stripped base key.
    pub fn resolve_instance(&self, key: &InstanceKey) -> Option<&ResourceEntry> {
        self.resources.get(&base_key_of(key))
    }

    /// Resources visible in the table (excluding detached ones).
    pub fn table(&self) -> impl Iterator<Item = (&BaseKey, &ResourceEntry)> {
        self.resources.iter().filter(|(_, entry)| !entry.detached)
    }

    pub fn usage_count(&self, base: &BaseKey) -> usize {
        usage_count(base, self.instance_keys())
    }

    pub fn add_panel(&mut self, id: &str, name: &str) -> bool {
        if self.panel(id).is_some() {
            return false;
        }
        let position = self.panels.len();
        self.panels.push(Panel::new(id, name, position));
        true
    }

    /// Places an existing instance key. An instance lives in at most one
    /// panel, so keys already placed anywhere are rejected; use
    /// `place_resource` for another instance of the same resource.
    pub fn assign_to_panel(&mut self, key: &InstanceKey, panel_id: &str, index: Option<usize>) -> bool {
        if self.instance_keys().any(|placed| placed == key) {
            return false;
        }
        let Some(panel) = self.panel_mut(panel_id) else {
            return false;
        };
        panel.insert(key.clone(), index);
        true
    }

    /// Derives a fresh instance key for `base` and places it in `panel_id`.
    pub fn place_resource(
        &mut self,
        base: &BaseKey,
        panel_id: &str,
        index: Option<usize>,
    ) -> Option<InstanceKey> {
        self.panel(panel_id)?;
        let key = derive_instance_key(base, self.instance_keys());
        self.assign_to_panel(&key, panel_id, index).then_some(key)
    }

    pub fn remove_from_panel(&mut self, key: &InstanceKey, panel_id: &str) -> bool {
        let Some(panel) = self.panel_mut(panel_id) else {
            return false;
        };
        let Some(index) = panel.index_of(key) else {
            return false;
        };
        panel.remove_at(index);
        self.prune_detached(&base_key_of(key));
        true
    }

    /// Moves `key` from one panel to another. Either both halves happen or
    /// neither does.
    pub fn move_between_panels(
        &mut self,
        key: &InstanceKey,
        from: &str,
        to: &str,
        insert_index: Option<usize>,
    ) -> bool {
        if from == to {
            return match insert_index {
                Some(index) => self.reorder_in_panel(key, from, index),
                None => false,
            };
        }
        let Some(source_index) = self.panel(from).and_then(|panel| panel.index_of(key)) else {
            return false;
        };
        match self.panel(to) {
            Some(target) if target.index_of(key).is_none() => {}
            _ => return false,
        }
        let Some(source) = self.panel_mut(from) else {
            return false;
        };
        let moved = source.remove_at(source_index);
        let Some(target) = self.panel_mut(to) else {
            return false;
        };
        target.insert(moved, insert_index);
        true
    }

    pub fn reorder_in_panel(&mut self, key: &InstanceKey, panel_id: &str, new_index: usize) -> bool {
        let Some(panel) = self.panel_mut(panel_id) else {
            return false;
        };
        let Some(current) = panel.index_of(key) else {
            return false;
        };
        let last = panel.resource_keys.len() - 1;
        let new_index = new_index.min(last);
        if current == new_index {
            return false;
        }
        let active = panel.active_key().cloned();
        let moved = panel.resource_keys.remove(current);
        panel.resource_keys.insert(new_index, moved);
        if let Some(active) = active {
            panel.active_index = panel.index_of(&active).unwrap_or(0);
        }
        true
    }

    pub fn set_active(&mut self, panel_id: &str, index: usize) -> bool {
        let Some(panel) = self.panel_mut(panel_id) else {
            return false;
        };
        if index >= panel.resource_keys.len() || panel.active_index == index {
            return false;
        }
        panel.active_index = index;
        true
    }

    pub fn add_resource_to_table(&mut self, metadata: &ResourceMetadata) -> Result<bool, BtcError> {
        let key = metadata.base_key()?;
        let entry = ResourceEntry::from(metadata);
        if self.resources.get(&key) == Some(&entry) {
            return Ok(false);
        }
        self.resources.insert(key, entry);
        Ok(true)
    }

    /// Drops `base` from the table. Panel references are left in place: while
    /// instances remain the entry is only detached so they stay renderable.
    pub fn remove_resource_from_table(&mut self, base: &BaseKey) -> TableRemoval {
        let remaining_instances = self.usage_count(base);
        let removed = match self.resources.get_mut(base) {
            None => false,
            Some(entry) if remaining_instances > 0 => {
                let changed = !entry.detached;
                entry.detached = true;
                changed
            }
            Some(_) => self.resources.remove(base).is_some(),
        };
        TableRemoval {
            removed,
            remaining_instances,
        }
    }

    fn prune_detached(&mut self, base: &BaseKey) {
        let is_detached = self
            .resources
            .get(base)
            .map(|entry| entry.detached)
            .unwrap_or(false);
        if is_detached && self.usage_count(base) == 0 {
            self.resources.remove(base);
        }
    }
}

/// The authoritative workspace plus write-through persistence.
pub struct WorkspaceState {
    workspace: Workspace,
    store: Arc<dyn KeyValueStore>,
}

impl WorkspaceState {
    /// Loads the persisted workspace, creating (and persisting) the default
    /// two-panel workspace on first use.
    pub fn load_or_create(store: Arc<dyn KeyValueStore>) -> Result<Self, BtcError> {
        match store.get(WORKSPACE_KEY)? {
            Some(value) => {
                let workspace = serde_json::from_value(value)
                    .map_err(|err| BtcError::Store(format!("corrupt workspace: {err}")))?;
                Ok(Self { workspace, store })
            }
            None => {
                let state = Self {
                    workspace: Workspace::default(),
                    store,
                };
                state.persist()?;
                Ok(state)
            }
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn persist(&self) -> Result<(), BtcError> {
        let value = serde_json::to_value(&self.workspace)
            .map_err(|err| BtcError::Serialization(err.to_string()))?;
        self.store.set(WORKSPACE_KEY, &value)
    }

    fn commit(&self, changed: bool, action: &str) -> Result<bool, BtcError> {
        if changed {
            debug!(action, "workspace changed; persisting");
            self.persist()?;
        }
        Ok(changed)
    }

    pub fn add_panel(&mut self, id: &str, name: &str) -> Result<bool, BtcError> {
        let changed = self.workspace.add_panel(id, name);
        self.commit(changed, "add_panel")
    }

    pub fn assign_to_panel(
        &mut self,
        key: &InstanceKey,
        panel_id: &str,
        index: Option<usize>,
    ) -> Result<bool, BtcError> {
        let changed = self.workspace.assign_to_panel(key, panel_id, index);
        self.commit(changed, "assign_to_panel")
    }

    pub fn place_resource(
        &mut self,
        base: &BaseKey,
        panel_id: &str,
        index: Option<usize>,
    ) -> Result<Option<InstanceKey>, BtcError> {
        let placed = self.workspace.place_resource(base, panel_id, index);
        self.commit(placed.is_some(), "place_resource")?;
        Ok(placed)
    }

    pub fn remove_from_panel(&mut self, key: &InstanceKey, panel_id: &str) -> Result<bool, BtcError> {
        let changed = self.workspace.remove_from_panel(key, panel_id);
        self.commit(changed, "remove_from_panel")
    }

    pub fn move_between_panels(
        &mut self,
        key: &InstanceKey,
        from: &str,
        to: &str,
        insert_index: Option<usize>,
    ) -> Result<bool, BtcError> {
        let changed = self.workspace.move_between_panels(key, from, to, insert_index);
        self.commit(changed, "move_between_panels")
    }

    pub fn reorder_in_panel(
        &mut self,
        key: &InstanceKey,
        panel_id: &str,
        new_index: usize,
    ) -> Result<bool, BtcError> {
        let changed = self.workspace.reorder_in_panel(key, panel_id, new_index);
        self.commit(changed, "reorder_in_panel")
    }

    pub fn set_active(&mut self, panel_id: &str, index: usize) -> Result<bool, BtcError> {
        let changed = self.workspace.set_active(panel_id, index);
        self.commit(changed, "set_active")
    }

    pub fn add_resource_to_table(&mut self, metadata: &ResourceMetadata) -> Result<bool, BtcError> {
        let changed = self.workspace.add_resource_to_table(metadata)?;
        self.commit(changed, "add_resource_to_table")
    }

    pub fn remove_resource_from_table(&mut self, base: &BaseKey) -> Result<TableRemoval, BtcError> {
        let removal = self.workspace.remove_resource_from_table(base);
        self.commit(removal.removed, "remove_resource_from_table")?;
        Ok(removal)
    }

    /// Swaps in an imported workspace wholesale.
    pub fn replace(&mut self, workspace: Workspace) -> Result<(), BtcError> {
        self.workspace = workspace;
        self.commit(true, "replace").map(|_| ())
    }
}
