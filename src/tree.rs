//! # Directory Tree
//!
//! The authoritative in-memory view of entities and groups. Every read
//! and every mutation flows through a `Tree`; it is the single writer to
//! the store underneath it.
//!
//! ## Consistency
//!
//! Each kind is indexed twice, by id/name and by number. Mutations work
//! on a copy of the record, write it through to the store, and commit the
//! index update only if the store accepted the write, so the store and
//! the index agree after every successful operation.
//!
//! ## Locking
//!
//! One readers-writer lock guards the whole inner state, store handle
//! included. Mutations hold the write lock across KDF work and store
//! I/O; reads (membership resolution included) hold the read lock for
//! the full traversal and therefore see a consistent snapshot.
//!
//! ## Example
//!
//! ```rust
//! use netauth_core::crypto::DigestKdf;
//! use netauth_core::store::MemoryStore;
//! use netauth_core::tree::Tree;
//!
//! let tree = Tree::load(Box::new(MemoryStore::new()), Box::new(DigestKdf)).unwrap();
//! tree.new_entity("camille", None, "hunter2").unwrap();
//! assert!(tree.validate_secret("camille", "hunter2").is_ok());
//! assert!(tree.get_entity("camille").unwrap().secret.is_none());
//! ```

use crate::capability::{self, Capability, UnknownCapability};
use crate::crypto::{CryptoError, SecretKdf};
use crate::entity::{Entity, EntityMeta};
use crate::group::{Expansion, ExpansionMode, ExpansionUpdate, Group, GroupPatch};
use crate::kv::{self, KvMode};
use crate::membership;
use crate::store::{DirectoryStore, HealthStatus, StoreError};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("unknown entity")]
    UnknownEntity,

    #[error("unknown group")]
    UnknownGroup,

    #[error(transparent)]
    UnknownCapability(#[from] UnknownCapability),

    #[error("entity id '{0}' already exists")]
    DuplicateEntityID(String),

    #[error("group name '{0}' already exists")]
    DuplicateGroupName(String),

    #[error("number {0} is already in use")]
    DuplicateNumber(i32),

    #[error("expansion {mode} from '{parent}' to '{child}' already exists")]
    ExistingExpansion {
        parent: String,
        child: String,
        mode: ExpansionMode,
    },

    #[error("entity is locked")]
    EntityLocked,

    #[error("entity authentication failed")]
    EntityBadAuth,

    #[error("requestor is not qualified")]
    RequestorUnqualified,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for TreeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownEntity => TreeError::UnknownEntity,
            StoreError::UnknownGroup => TreeError::UnknownGroup,
            other => TreeError::Store(other),
        }
    }
}

impl From<CryptoError> for TreeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthorizationFailure => TreeError::EntityBadAuth,
            CryptoError::InternalError(msg) => TreeError::Internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;

// ============================================================================
// TREE
// ============================================================================

struct TreeInner {
    store: Box<dyn DirectoryStore>,
    kdf: Box<dyn SecretKdf>,
    entities: HashMap<String, Entity>,
    entity_numbers: HashMap<i32, String>,
    groups: HashMap<String, Group>,
    group_numbers: HashMap<i32, String>,
    bootstrap_done: bool,
}

/// The directory tree. One instance lives for the whole server process;
/// tests build fresh ones around a `MemoryStore`.
pub struct Tree {
    inner: RwLock<TreeInner>,
}

impl Tree {
    /// Rebuild the in-memory indexes from whatever the store holds.
    ///
    /// If any persisted entity already carries `GLOBAL_ROOT`, the
    /// bootstrap latch is tripped immediately, so a restart never
    /// reopens the bootstrap window.
    pub fn load(store: Box<dyn DirectoryStore>, kdf: Box<dyn SecretKdf>) -> Result<Tree> {
        let mut inner = TreeInner {
            store,
            kdf,
            entities: HashMap::new(),
            entity_numbers: HashMap::new(),
            groups: HashMap::new(),
            group_numbers: HashMap::new(),
            bootstrap_done: false,
        };

        for id in inner.store.discover_entity_ids()? {
            let e = inner.store.load_entity(&id)?;
            inner.entity_numbers.insert(e.number, e.id.clone());
            inner.entities.insert(e.id.clone(), e);
        }
        for name in inner.store.discover_group_names()? {
            let g = inner.store.load_group(&name)?;
            inner.group_numbers.insert(g.number, g.name.clone());
            inner.groups.insert(g.name.clone(), g);
        }

        if inner
            .entities
            .values()
            .any(|e| e.meta.capabilities.contains(&Capability::GlobalRoot))
        {
            inner.bootstrap_done = true;
        }

        info!(
            entities = inner.entities.len(),
            groups = inner.groups.len(),
            bootstrap_done = inner.bootstrap_done,
            "directory tree loaded"
        );
        Ok(Tree {
            inner: RwLock::new(inner),
        })
    }

    /// Probe the backing store.
    pub fn health(&self) -> HealthStatus {
        self.inner.read().store.health()
    }

    // ========================================================================
    // ENTITY OPERATIONS
    // ========================================================================

    /// Create an entity. `number: None` assigns one past the largest in
    /// use, starting from 1. An empty secret leaves the entity locked,
    /// which is how service accounts that never log in are provisioned.
    pub fn new_entity(&self, id: &str, number: Option<i32>, secret: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if id.is_empty() {
            return Err(TreeError::MalformedRequest("entity id must not be empty".into()));
        }
        if inner.entities.contains_key(id) {
            return Err(TreeError::DuplicateEntityID(id.to_string()));
        }
        if let Some(n) = number {
            if inner.entity_numbers.contains_key(&n) {
                return Err(TreeError::DuplicateNumber(n));
            }
        }
        let number = number.unwrap_or_else(|| next_number(inner.entities.values().map(|e| e.number)));

        let mut entity = Entity::new(id, number);
        if !secret.is_empty() {
            entity.secret = Some(inner.kdf.secure(secret)?);
        }

        inner.store.save_entity(&entity)?;
        inner.entity_numbers.insert(number, entity.id.clone());
        inner.entities.insert(entity.id.clone(), entity);
        info!(entity = id, number, "created entity");
        Ok(())
    }

    /// Delete an entity. The stored secret is wiped before the record
    /// leaves the index so an in-flight login cannot win the race against
    /// the delete.
    pub fn delete_entity(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let number = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?.number;

        if let Some(e) = inner.entities.get_mut(id) {
            e.wipe_secret();
        }
        inner.store.delete_entity(id)?;
        inner.entities.remove(id);
        inner.entity_numbers.remove(&number);
        info!(entity = id, "deleted entity");
        Ok(())
    }

    /// Safe copy of an entity: the secret field is always cleared.
    pub fn get_entity(&self, id: &str) -> Result<Entity> {
        let inner = self.inner.read();
        inner
            .entities
            .get(id)
            .map(Entity::safe_copy)
            .ok_or(TreeError::UnknownEntity)
    }

    /// Safe copy, looked up by number.
    pub fn get_entity_by_number(&self, number: i32) -> Result<Entity> {
        let inner = self.inner.read();
        inner
            .entity_numbers
            .get(&number)
            .and_then(|id| inner.entities.get(id))
            .map(Entity::safe_copy)
            .ok_or(TreeError::UnknownEntity)
    }

    /// Merge the set scalar fields of `patch` into the entity's metadata.
    /// Capability and group lists in the patch are ignored.
    pub fn update_entity_meta(&self, id: &str, patch: &EntityMeta) -> Result<()> {
        let mut inner = self.inner.write();
        let mut updated = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?.clone();
        updated.meta.merge(patch);
        inner.store.save_entity(&updated)?;
        inner.entities.insert(updated.id.clone(), updated);
        debug!(entity = id, "updated entity metadata");
        Ok(())
    }

    /// Apply an untyped-metadata operation to an entity, returning the
    /// affected `"k:v"` pairs.
    pub fn manage_untyped_entity_meta(
        &self,
        id: &str,
        mode: KvMode,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.write();
        let mut updated = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?.clone();
        let out = kv::manage(&mut updated.meta.untyped, mode, key, value);
        if mode.mutates() {
            inner.store.save_entity(&updated)?;
            inner.entities.insert(updated.id.clone(), updated);
        }
        Ok(out)
    }

    /// Grant a capability directly to an entity. Adding a capability the
    /// entity already holds changes nothing.
    pub fn set_entity_capability(&self, id: &str, capability: &str) -> Result<()> {
        let cap: Capability = capability.parse()?;
        let mut inner = self.inner.write();
        let mut updated = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?.clone();
        if updated.meta.capabilities.contains(&cap) {
            return Ok(());
        }
        updated.meta.capabilities.push(cap);
        inner.store.save_entity(&updated)?;
        inner.entities.insert(updated.id.clone(), updated);
        info!(entity = id, capability = %cap, "set entity capability");
        Ok(())
    }

    /// Remove a directly held capability. Removing an absent capability
    /// changes nothing.
    pub fn remove_entity_capability(&self, id: &str, capability: &str) -> Result<()> {
        let cap: Capability = capability.parse()?;
        let mut inner = self.inner.write();
        let mut updated = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?.clone();
        if !updated.meta.capabilities.contains(&cap) {
            return Ok(());
        }
        updated.meta.capabilities.retain(|c| *c != cap);
        inner.store.save_entity(&updated)?;
        inner.entities.insert(updated.id.clone(), updated);
        info!(entity = id, capability = %cap, "removed entity capability");
        Ok(())
    }

    /// Change an entity's secret.
    ///
    /// An entity may always change its own secret by proving the current
    /// one. Changing someone else's requires proving the actor's secret
    /// and holding `CHANGE_ENTITY_SECRET` (directly or through a group).
    pub fn change_secret(
        &self,
        actor_id: &str,
        actor_secret: &str,
        target_id: &str,
        new_secret: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        validate_secret_inner(&inner, actor_id, actor_secret)?;
        if actor_id != target_id && !is_qualified_inner(&inner, actor_id, Capability::ChangeEntitySecret) {
            warn!(actor = actor_id, target = target_id, "unqualified secret change refused");
            return Err(TreeError::RequestorUnqualified);
        }

        let mut updated = inner.entities.get(target_id).ok_or(TreeError::UnknownEntity)?.clone();
        updated.secret = Some(inner.kdf.secure(new_secret)?);
        inner.store.save_entity(&updated)?;
        inner.entities.insert(updated.id.clone(), updated);
        info!(actor = actor_id, target = target_id, "secret changed");
        Ok(())
    }

    /// Check a login secret. Locked entities fail with `EntityLocked`
    /// before any KDF work happens.
    pub fn validate_secret(&self, id: &str, secret: &str) -> Result<()> {
        let inner = self.inner.read();
        validate_secret_inner(&inner, id, secret)
    }

    // ========================================================================
    // GROUP OPERATIONS
    // ========================================================================

    /// Create a group. `number: None` auto-assigns as for entities. An
    /// empty `managed_by` means no delegated administration.
    pub fn new_group(
        &self,
        name: &str,
        display_name: &str,
        managed_by: &str,
        number: Option<i32>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if name.is_empty() {
            return Err(TreeError::MalformedRequest("group name must not be empty".into()));
        }
        if inner.groups.contains_key(name) {
            return Err(TreeError::DuplicateGroupName(name.to_string()));
        }
        if let Some(n) = number {
            if inner.group_numbers.contains_key(&n) {
                return Err(TreeError::DuplicateNumber(n));
            }
        }
        let number = number.unwrap_or_else(|| next_number(inner.groups.values().map(|g| g.number)));

        let mut group = Group::new(name, display_name, number);
        if !managed_by.is_empty() {
            group.managed_by = Some(managed_by.to_string());
        }

        inner.store.save_group(&group)?;
        inner.group_numbers.insert(number, group.name.clone());
        inner.groups.insert(group.name.clone(), group);
        info!(group = name, number, "created group");
        Ok(())
    }

    /// Delete a group. Expansion rules and `managed_by` pointers that
    /// referenced it are left in place; the resolver and the evaluator
    /// treat them as dangling.
    pub fn delete_group(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let number = inner.groups.get(name).ok_or(TreeError::UnknownGroup)?.number;
        inner.store.delete_group(name)?;
        inner.groups.remove(name);
        inner.group_numbers.remove(&number);
        info!(group = name, "deleted group");
        Ok(())
    }

    pub fn get_group(&self, name: &str) -> Result<Group> {
        let inner = self.inner.read();
        inner.groups.get(name).cloned().ok_or(TreeError::UnknownGroup)
    }

    /// All groups, sorted by name.
    pub fn list_groups(&self) -> Vec<Group> {
        let inner = self.inner.read();
        let mut groups: Vec<Group> = inner.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    /// Merge the set fields of `patch` into a group.
    pub fn update_group_meta(&self, name: &str, patch: &GroupPatch) -> Result<()> {
        let mut inner = self.inner.write();
        let mut updated = inner.groups.get(name).ok_or(TreeError::UnknownGroup)?.clone();
        updated.merge(patch);
        inner.store.save_group(&updated)?;
        inner.groups.insert(updated.name.clone(), updated);
        debug!(group = name, "updated group metadata");
        Ok(())
    }

    /// Apply an untyped-metadata operation to a group.
    pub fn manage_untyped_group_meta(
        &self,
        name: &str,
        mode: KvMode,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.write();
        let mut updated = inner.groups.get(name).ok_or(TreeError::UnknownGroup)?.clone();
        let out = kv::manage(&mut updated.untyped, mode, key, value);
        if mode.mutates() {
            inner.store.save_group(&updated)?;
            inner.groups.insert(updated.name.clone(), updated);
        }
        Ok(out)
    }

    /// Grant a capability to a group's members. Idempotent.
    pub fn set_group_capability(&self, name: &str, capability: &str) -> Result<()> {
        let cap: Capability = capability.parse()?;
        let mut inner = self.inner.write();
        let mut updated = inner.groups.get(name).ok_or(TreeError::UnknownGroup)?.clone();
        if updated.capabilities.contains(&cap) {
            return Ok(());
        }
        updated.capabilities.push(cap);
        inner.store.save_group(&updated)?;
        inner.groups.insert(updated.name.clone(), updated);
        info!(group = name, capability = %cap, "set group capability");
        Ok(())
    }

    /// Remove a capability from a group.
    pub fn remove_group_capability(&self, name: &str, capability: &str) -> Result<()> {
        let cap: Capability = capability.parse()?;
        let mut inner = self.inner.write();
        let mut updated = inner.groups.get(name).ok_or(TreeError::UnknownGroup)?.clone();
        if !updated.capabilities.contains(&cap) {
            return Ok(());
        }
        updated.capabilities.retain(|c| *c != cap);
        inner.store.save_group(&updated)?;
        inner.groups.insert(updated.name.clone(), updated);
        info!(group = name, capability = %cap, "removed group capability");
        Ok(())
    }

    /// Add, replace, or drop the expansion rule for `(parent, child)`.
    ///
    /// INCLUDE and EXCLUDE refuse self-reference, require both groups to
    /// exist, replace an existing rule of the other mode, and report
    /// `ExistingExpansion` when the same rule is already present. DROP
    /// removes whatever rule exists for the pair and is a quiet no-op
    /// otherwise.
    pub fn modify_group_expansions(
        &self,
        parent: &str,
        child: &str,
        update: ExpansionUpdate,
    ) -> Result<()> {
        let mut inner = self.inner.write();

        let mode = match update {
            ExpansionUpdate::Include => ExpansionMode::Include,
            ExpansionUpdate::Exclude => ExpansionMode::Exclude,
            ExpansionUpdate::Drop => {
                let mut updated = inner.groups.get(parent).ok_or(TreeError::UnknownGroup)?.clone();
                let before = updated.expansions.len();
                updated.expansions.retain(|x| x.target != child);
                if updated.expansions.len() == before {
                    return Ok(());
                }
                inner.store.save_group(&updated)?;
                inner.groups.insert(updated.name.clone(), updated);
                info!(parent, child, "dropped expansion");
                return Ok(());
            }
        };

        if parent == child {
            return Err(TreeError::MalformedRequest(
                "a group cannot expand into itself".into(),
            ));
        }
        if !inner.groups.contains_key(child) {
            return Err(TreeError::UnknownGroup);
        }
        let mut updated = inner.groups.get(parent).ok_or(TreeError::UnknownGroup)?.clone();

        if let Some(existing) = updated.expansion_for(child) {
            if existing.mode == mode {
                return Err(TreeError::ExistingExpansion {
                    parent: parent.to_string(),
                    child: child.to_string(),
                    mode,
                });
            }
            // A rule of the other mode is replaced in place.
            updated.expansions.retain(|x| x.target != child);
        }
        updated.expansions.push(Expansion {
            mode,
            target: child.to_string(),
        });

        inner.store.save_group(&updated)?;
        inner.groups.insert(updated.name.clone(), updated);
        info!(parent, child, %mode, "set expansion");
        Ok(())
    }

    // ========================================================================
    // MEMBERSHIP
    // ========================================================================

    /// Add an entity to a group's direct membership. The group must
    /// exist; adding an existing membership changes nothing.
    pub fn add_entity_to_group(&self, id: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.groups.contains_key(group) {
            return Err(TreeError::UnknownGroup);
        }
        let mut updated = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?.clone();
        if updated.meta.groups.iter().any(|g| g == group) {
            return Ok(());
        }
        updated.meta.groups.push(group.to_string());
        inner.store.save_entity(&updated)?;
        inner.entities.insert(updated.id.clone(), updated);
        info!(entity = id, group, "added direct membership");
        Ok(())
    }

    /// Remove an entity's direct membership. Works even if the group no
    /// longer exists, so dangling memberships can be cleaned up.
    pub fn remove_entity_from_group(&self, id: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let mut updated = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?.clone();
        if !updated.meta.groups.iter().any(|g| g == group) {
            return Ok(());
        }
        updated.meta.groups.retain(|g| g != group);
        inner.store.save_entity(&updated)?;
        inner.entities.insert(updated.id.clone(), updated);
        info!(entity = id, group, "removed direct membership");
        Ok(())
    }

    /// Group names an entity belongs to. With `include_indirect` the
    /// direct list is expanded through the group expansion rules;
    /// without, it is just the direct list, sorted and deduplicated.
    pub fn get_memberships(&self, entity: &Entity, include_indirect: bool) -> Vec<String> {
        if !include_indirect {
            return membership::direct_memberships(&entity.meta.groups);
        }
        let inner = self.inner.read();
        membership::effective_memberships(&inner.groups, &entity.meta.groups)
    }

    /// Safe copies of every entity whose effective membership includes
    /// `group`, sorted by id.
    pub fn list_members(&self, group: &str) -> Result<Vec<Entity>> {
        let inner = self.inner.read();
        if !inner.groups.contains_key(group) {
            return Err(TreeError::UnknownGroup);
        }
        let mut members: Vec<Entity> = inner
            .entities
            .values()
            .filter(|e| {
                membership::effective_memberships(&inner.groups, &e.meta.groups)
                    .iter()
                    .any(|g| g == group)
            })
            .map(Entity::safe_copy)
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(members)
    }

    // ========================================================================
    // AUTHORIZATION EVALUATOR
    // ========================================================================

    /// Whether an entity can exercise `capability`, directly or through
    /// any group in its effective membership. Unknown entities are never
    /// qualified.
    pub fn is_qualified(&self, id: &str, capability: Capability) -> bool {
        let inner = self.inner.read();
        is_qualified_inner(&inner, id, capability)
    }

    /// The full capability set an entity can exercise: its direct
    /// capabilities plus everything conferred by effective membership.
    pub fn effective_capabilities(&self, id: &str) -> Result<Vec<Capability>> {
        let inner = self.inner.read();
        let entity = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?;
        let mut caps: Vec<Capability> = Vec::new();
        for c in &entity.meta.capabilities {
            if !caps.contains(c) {
                caps.push(*c);
            }
        }
        for name in membership::effective_memberships(&inner.groups, &entity.meta.groups) {
            if let Some(g) = inner.groups.get(&name) {
                for c in &g.capabilities {
                    if !caps.contains(c) {
                        caps.push(*c);
                    }
                }
            }
        }
        Ok(caps)
    }

    /// Whether `actor` may administer `group` through its `managed_by`
    /// delegation. False when the group is unknown, carries no
    /// delegation, or the delegation points at a group the actor is not
    /// effectively in (a deleted target counts as not-in).
    pub fn manage_by_membership(&self, actor_id: &str, group: &str) -> bool {
        let inner = self.inner.read();
        let managed_by = match inner.groups.get(group).and_then(|g| g.managed_by.clone()) {
            Some(m) if !m.is_empty() => m,
            _ => return false,
        };
        let actor = match inner.entities.get(actor_id) {
            Some(e) => e,
            None => return false,
        };
        membership::effective_memberships(&inner.groups, &actor.meta.groups)
            .iter()
            .any(|g| *g == managed_by)
    }

    // ========================================================================
    // BOOTSTRAP
    // ========================================================================

    /// One-shot creation of the first administrative entity.
    ///
    /// If the id already exists it is granted `GLOBAL_ROOT`; otherwise
    /// the entity is created with an auto-assigned number and the
    /// capability. Once the latch is set, further calls change nothing.
    pub fn make_bootstrap(&self, id: &str, secret: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.bootstrap_done {
            debug!(entity = id, "bootstrap window already closed");
            return Ok(());
        }

        if let Some(mut updated) = inner.entities.get(id).cloned() {
            if !updated.meta.capabilities.contains(&Capability::GlobalRoot) {
                updated.meta.capabilities.push(Capability::GlobalRoot);
            }
            inner.store.save_entity(&updated)?;
            inner.entities.insert(updated.id.clone(), updated);
        } else {
            let number = next_number(inner.entities.values().map(|e| e.number));
            let mut entity = Entity::new(id, number);
            if !secret.is_empty() {
                entity.secret = Some(inner.kdf.secure(secret)?);
            }
            entity.meta.capabilities.push(Capability::GlobalRoot);
            inner.store.save_entity(&entity)?;
            inner.entity_numbers.insert(number, entity.id.clone());
            inner.entities.insert(entity.id.clone(), entity);
        }

        inner.bootstrap_done = true;
        info!(entity = id, "bootstrap complete");
        Ok(())
    }

    /// Close the bootstrap window without creating anything.
    pub fn disable_bootstrap(&self) {
        self.inner.write().bootstrap_done = true;
    }

    /// Whether the bootstrap window has closed.
    pub fn bootstrap_done(&self) -> bool {
        self.inner.read().bootstrap_done
    }
}

fn next_number(numbers: impl Iterator<Item = i32>) -> i32 {
    numbers.max().unwrap_or(0) + 1
}

fn validate_secret_inner(inner: &TreeInner, id: &str, secret: &str) -> Result<()> {
    let entity = inner.entities.get(id).ok_or(TreeError::UnknownEntity)?;
    let blob = match entity.secret.as_deref() {
        Some(b) if !b.is_empty() => b,
        _ => {
            warn!(entity = id, "login refused for locked entity");
            return Err(TreeError::EntityLocked);
        }
    };
    match inner.kdf.verify(blob, secret) {
        Ok(()) => {
            debug!(entity = id, "authenticated");
            Ok(())
        }
        Err(CryptoError::AuthorizationFailure) => {
            warn!(entity = id, "failed authentication");
            Err(TreeError::EntityBadAuth)
        }
        Err(CryptoError::InternalError(msg)) => Err(TreeError::Internal(msg)),
    }
}

fn is_qualified_inner(inner: &TreeInner, id: &str, cap: Capability) -> bool {
    let entity = match inner.entities.get(id) {
        Some(e) => e,
        None => return false,
    };
    if capability::any_satisfies(&entity.meta.capabilities, cap) {
        return true;
    }
    membership::effective_memberships(&inner.groups, &entity.meta.groups)
        .iter()
        .filter_map(|name| inner.groups.get(name))
        .any(|g| capability::any_satisfies(&g.capabilities, cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DigestKdf;
    use crate::store::MemoryStore;

    fn tree() -> Tree {
        Tree::load(Box::new(MemoryStore::new()), Box::new(DigestKdf)).unwrap()
    }

    // ------------------------------------------------------------------
    // entities
    // ------------------------------------------------------------------

    #[test]
    fn test_new_entity_auto_numbering() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.new_entity("b", None, "pw").unwrap();
        assert_eq!(t.get_entity("a").unwrap().number, 1);
        assert_eq!(t.get_entity("b").unwrap().number, 2);

        // Auto assignment tracks the maximum, holes included.
        t.new_entity("c", Some(10), "pw").unwrap();
        t.new_entity("d", None, "pw").unwrap();
        assert_eq!(t.get_entity("d").unwrap().number, 11);
    }

    #[test]
    fn test_new_entity_duplicates() {
        let t = tree();
        t.new_entity("a", Some(5), "pw").unwrap();
        assert!(matches!(
            t.new_entity("a", None, "x"),
            Err(TreeError::DuplicateEntityID(_))
        ));
        assert!(matches!(
            t.new_entity("b", Some(5), "x"),
            Err(TreeError::DuplicateNumber(5))
        ));
    }

    #[test]
    fn test_entity_uniqueness_held_after_mutations() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.new_entity("b", None, "pw").unwrap();
        t.delete_entity("a").unwrap();
        t.new_entity("c", None, "pw").unwrap();

        let ids: Vec<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        let mut seen_numbers = Vec::new();
        for id in &ids {
            let e = t.get_entity(id).unwrap();
            assert!(!seen_numbers.contains(&e.number));
            seen_numbers.push(e.number);
        }
    }

    #[test]
    fn test_get_entity_strips_secret() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        assert!(t.get_entity("a").unwrap().secret.is_none());
        assert!(t.get_entity_by_number(1).unwrap().secret.is_none());
    }

    #[test]
    fn test_get_entity_unknown() {
        let t = tree();
        assert!(matches!(t.get_entity("ghost"), Err(TreeError::UnknownEntity)));
        assert!(matches!(t.get_entity_by_number(42), Err(TreeError::UnknownEntity)));
    }

    #[test]
    fn test_delete_entity() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.delete_entity("a").unwrap();
        assert!(matches!(t.get_entity("a"), Err(TreeError::UnknownEntity)));
        assert!(matches!(t.delete_entity("a"), Err(TreeError::UnknownEntity)));
    }

    #[test]
    fn test_validate_secret() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        assert!(t.validate_secret("a", "pw").is_ok());
        assert!(matches!(t.validate_secret("a", "nope"), Err(TreeError::EntityBadAuth)));
        assert!(matches!(t.validate_secret("ghost", "pw"), Err(TreeError::UnknownEntity)));
    }

    #[test]
    fn test_empty_secret_means_locked() {
        let t = tree();
        t.new_entity("svc", None, "").unwrap();
        assert!(matches!(t.validate_secret("svc", ""), Err(TreeError::EntityLocked)));
        assert!(matches!(t.validate_secret("svc", "anything"), Err(TreeError::EntityLocked)));
    }

    #[test]
    fn test_change_secret_self() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.change_secret("a", "pw", "a", "pw2").unwrap();
        assert!(t.validate_secret("a", "pw2").is_ok());
        assert!(matches!(t.validate_secret("a", "pw"), Err(TreeError::EntityBadAuth)));
    }

    #[test]
    fn test_change_secret_self_requires_current_secret() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        assert!(matches!(
            t.change_secret("a", "wrong", "a", "pw2"),
            Err(TreeError::EntityBadAuth)
        ));
        assert!(t.validate_secret("a", "pw").is_ok());
    }

    #[test]
    fn test_change_secret_other_requires_capability() {
        let t = tree();
        t.new_entity("admin", None, "adminpw").unwrap();
        t.new_entity("a", None, "pw").unwrap();

        assert!(matches!(
            t.change_secret("admin", "adminpw", "a", "pw2"),
            Err(TreeError::RequestorUnqualified)
        ));

        t.set_entity_capability("admin", "CHANGE_ENTITY_SECRET").unwrap();
        t.change_secret("admin", "adminpw", "a", "pw2").unwrap();
        assert!(t.validate_secret("a", "pw2").is_ok());
    }

    #[test]
    fn test_change_secret_other_via_group_capability() {
        let t = tree();
        t.new_entity("helpdesk", None, "hd").unwrap();
        t.new_entity("a", None, "pw").unwrap();
        t.new_group("support", "", "", None).unwrap();
        t.set_group_capability("support", "CHANGE_ENTITY_SECRET").unwrap();
        t.add_entity_to_group("helpdesk", "support").unwrap();

        t.change_secret("helpdesk", "hd", "a", "pw2").unwrap();
        assert!(t.validate_secret("a", "pw2").is_ok());
    }

    #[test]
    fn test_update_entity_meta_merges_scalars_only() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.set_entity_capability("a", "CREATE_ENTITY").unwrap();

        let patch = EntityMeta {
            display_name: Some("Alice".to_string()),
            capabilities: vec![Capability::GlobalRoot],
            groups: vec!["admins".to_string()],
            ..EntityMeta::default()
        };
        t.update_entity_meta("a", &patch).unwrap();

        let e = t.get_entity("a").unwrap();
        assert_eq!(e.meta.display_name.as_deref(), Some("Alice"));
        assert_eq!(e.meta.capabilities, vec![Capability::CreateEntity]);
        assert!(e.meta.groups.is_empty());
    }

    #[test]
    fn test_untyped_entity_meta() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();

        t.manage_untyped_entity_meta("a", KvMode::Upsert, "k1", "v1").unwrap();
        t.manage_untyped_entity_meta("a", KvMode::Upsert, "k2", "v2").unwrap();
        assert_eq!(
            t.manage_untyped_entity_meta("a", KvMode::Read, "*", "").unwrap(),
            vec!["k1:v1", "k2:v2"]
        );

        t.manage_untyped_entity_meta("a", KvMode::ClearExact, "k1", "").unwrap();
        assert_eq!(
            t.manage_untyped_entity_meta("a", KvMode::Read, "*", "").unwrap(),
            vec!["k2:v2"]
        );

        assert!(matches!(
            t.manage_untyped_entity_meta("ghost", KvMode::Read, "*", ""),
            Err(TreeError::UnknownEntity)
        ));
    }

    #[test]
    fn test_set_entity_capability_idempotent() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.set_entity_capability("a", "GLOBAL_ROOT").unwrap();
        t.set_entity_capability("a", "GLOBAL_ROOT").unwrap();
        assert_eq!(t.get_entity("a").unwrap().meta.capabilities.len(), 1);
    }

    #[test]
    fn test_capability_validation() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        assert!(matches!(
            t.set_entity_capability("a", ""),
            Err(TreeError::UnknownCapability(_))
        ));
        assert!(matches!(
            t.set_entity_capability("a", "FLY_TO_MARS"),
            Err(TreeError::UnknownCapability(_))
        ));
        assert!(matches!(
            t.set_entity_capability("ghost", "GLOBAL_ROOT"),
            Err(TreeError::UnknownEntity)
        ));
    }

    #[test]
    fn test_remove_entity_capability() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.set_entity_capability("a", "GLOBAL_ROOT").unwrap();
        t.set_entity_capability("a", "CREATE_ENTITY").unwrap();
        t.remove_entity_capability("a", "GLOBAL_ROOT").unwrap();
        assert_eq!(
            t.get_entity("a").unwrap().meta.capabilities,
            vec![Capability::CreateEntity]
        );
        // Removing an absent capability is quiet.
        t.remove_entity_capability("a", "GLOBAL_ROOT").unwrap();
    }

    // ------------------------------------------------------------------
    // groups
    // ------------------------------------------------------------------

    #[test]
    fn test_new_group_and_duplicates() {
        let t = tree();
        t.new_group("foo", "", "", Some(1)).unwrap();
        assert!(matches!(
            t.new_group("foo", "", "", Some(2)),
            Err(TreeError::DuplicateGroupName(_))
        ));
        assert!(matches!(
            t.new_group("bar", "", "", Some(1)),
            Err(TreeError::DuplicateNumber(1))
        ));
        t.new_group("bar", "", "", None).unwrap();
        assert_eq!(t.get_group("bar").unwrap().number, 2);
    }

    #[test]
    fn test_list_groups_sorted() {
        let t = tree();
        for name in ["aac", "aaa", "aab"] {
            t.new_group(name, "", "", None).unwrap();
        }
        let names: Vec<String> = t.list_groups().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["aaa", "aab", "aac"]);
    }

    #[test]
    fn test_delete_group() {
        let t = tree();
        t.new_group("foo", "", "", None).unwrap();
        t.delete_group("foo").unwrap();
        assert!(matches!(t.get_group("foo"), Err(TreeError::UnknownGroup)));
        assert!(matches!(t.delete_group("foo"), Err(TreeError::UnknownGroup)));
    }

    #[test]
    fn test_update_group_meta() {
        let t = tree();
        t.new_group("foo", "foo", "", None).unwrap();
        t.update_group_meta(
            "foo",
            &GroupPatch {
                display_name: Some("Foo Group".to_string()),
                managed_by: None,
            },
        )
        .unwrap();
        assert_eq!(t.get_group("foo").unwrap().display_name, "Foo Group");
    }

    #[test]
    fn test_untyped_group_meta() {
        let t = tree();
        t.new_group("g1", "g1", "", None).unwrap();
        t.manage_untyped_group_meta("g1", KvMode::Upsert, "k1", "v1").unwrap();
        assert_eq!(
            t.manage_untyped_group_meta("g1", KvMode::Read, "*", "").unwrap(),
            vec!["k1:v1"]
        );
        assert!(matches!(
            t.manage_untyped_group_meta("unknown", KvMode::Read, "*", ""),
            Err(TreeError::UnknownGroup)
        ));
    }

    #[test]
    fn test_group_capabilities() {
        let t = tree();
        t.new_group("foo", "", "", None).unwrap();
        t.set_group_capability("foo", "GLOBAL_ROOT").unwrap();
        t.set_group_capability("foo", "GLOBAL_ROOT").unwrap();
        assert_eq!(t.get_group("foo").unwrap().capabilities.len(), 1);

        t.set_group_capability("foo", "MODIFY_ENTITY_META").unwrap();
        t.remove_group_capability("foo", "GLOBAL_ROOT").unwrap();
        assert_eq!(
            t.get_group("foo").unwrap().capabilities,
            vec![Capability::ModifyEntityMeta]
        );

        assert!(matches!(
            t.set_group_capability("nope", "GLOBAL_ROOT"),
            Err(TreeError::UnknownGroup)
        ));
        assert!(matches!(
            t.set_group_capability("foo", ""),
            Err(TreeError::UnknownCapability(_))
        ));
    }

    // ------------------------------------------------------------------
    // expansions and memberships
    // ------------------------------------------------------------------

    #[test]
    fn test_expansion_rules() {
        let t = tree();
        t.new_group("a", "", "", None).unwrap();
        t.new_group("b", "", "", None).unwrap();

        t.modify_group_expansions("a", "b", ExpansionUpdate::Include).unwrap();
        assert!(matches!(
            t.modify_group_expansions("a", "b", ExpansionUpdate::Include),
            Err(TreeError::ExistingExpansion { .. })
        ));

        // Switching mode replaces the rule rather than stacking a second.
        t.modify_group_expansions("a", "b", ExpansionUpdate::Exclude).unwrap();
        let g = t.get_group("a").unwrap();
        assert_eq!(g.expansions.len(), 1);
        assert_eq!(g.expansions[0].mode, ExpansionMode::Exclude);

        t.modify_group_expansions("a", "b", ExpansionUpdate::Drop).unwrap();
        assert!(t.get_group("a").unwrap().expansions.is_empty());
        // Dropping an absent rule is a quiet no-op.
        t.modify_group_expansions("a", "b", ExpansionUpdate::Drop).unwrap();
    }

    #[test]
    fn test_expansion_guards() {
        let t = tree();
        t.new_group("a", "", "", None).unwrap();
        assert!(matches!(
            t.modify_group_expansions("a", "a", ExpansionUpdate::Include),
            Err(TreeError::MalformedRequest(_))
        ));
        assert!(matches!(
            t.modify_group_expansions("a", "ghost", ExpansionUpdate::Include),
            Err(TreeError::UnknownGroup)
        ));
        assert!(matches!(
            t.modify_group_expansions("ghost", "a", ExpansionUpdate::Include),
            Err(TreeError::UnknownGroup)
        ));
    }

    #[test]
    fn test_memberships_through_expansions() {
        let t = tree();
        for g in ["a", "b", "c"] {
            t.new_group(g, "", "", None).unwrap();
        }
        t.new_entity("e", None, "pw").unwrap();
        t.add_entity_to_group("e", "a").unwrap();
        t.modify_group_expansions("a", "b", ExpansionUpdate::Include).unwrap();
        t.modify_group_expansions("b", "c", ExpansionUpdate::Include).unwrap();

        let e = t.get_entity("e").unwrap();
        assert_eq!(t.get_memberships(&e, false), vec!["a"]);
        assert_eq!(t.get_memberships(&e, true), vec!["a", "b", "c"]);

        t.modify_group_expansions("a", "c", ExpansionUpdate::Exclude).unwrap();
        assert_eq!(t.get_memberships(&e, true), vec!["a", "b"]);
    }

    #[test]
    fn test_membership_management() {
        let t = tree();
        t.new_entity("e", None, "pw").unwrap();
        assert!(matches!(
            t.add_entity_to_group("e", "ghost"),
            Err(TreeError::UnknownGroup)
        ));

        t.new_group("ops", "", "", None).unwrap();
        t.add_entity_to_group("e", "ops").unwrap();
        t.add_entity_to_group("e", "ops").unwrap();
        assert_eq!(t.get_entity("e").unwrap().meta.groups, vec!["ops"]);

        t.remove_entity_from_group("e", "ops").unwrap();
        assert!(t.get_entity("e").unwrap().meta.groups.is_empty());
    }

    #[test]
    fn test_list_members_includes_expansions() {
        let t = tree();
        t.new_group("parent", "", "", None).unwrap();
        t.new_group("child", "", "", None).unwrap();
        t.modify_group_expansions("parent", "child", ExpansionUpdate::Include).unwrap();

        t.new_entity("direct", None, "pw").unwrap();
        t.add_entity_to_group("direct", "child").unwrap();
        t.new_entity("via", None, "pw").unwrap();
        t.add_entity_to_group("via", "parent").unwrap();

        let child_members: Vec<String> =
            t.list_members("child").unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(child_members, vec!["direct", "via"]);

        let parent_members: Vec<String> =
            t.list_members("parent").unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(parent_members, vec!["via"]);

        assert!(matches!(t.list_members("ghost"), Err(TreeError::UnknownGroup)));
    }

    // ------------------------------------------------------------------
    // evaluator
    // ------------------------------------------------------------------

    #[test]
    fn test_is_qualified_direct() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.set_entity_capability("a", "CREATE_ENTITY").unwrap();
        assert!(t.is_qualified("a", Capability::CreateEntity));
        assert!(!t.is_qualified("a", Capability::DestroyEntity));
        assert!(!t.is_qualified("ghost", Capability::CreateEntity));
    }

    #[test]
    fn test_global_root_qualifies_everything() {
        let t = tree();
        t.new_entity("root", None, "pw").unwrap();
        t.set_entity_capability("root", "GLOBAL_ROOT").unwrap();
        for cap in Capability::ALL {
            assert!(t.is_qualified("root", cap));
        }
    }

    #[test]
    fn test_is_qualified_through_groups() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.new_group("admins", "", "", None).unwrap();
        t.new_group("staff", "", "", None).unwrap();
        t.set_group_capability("admins", "CREATE_GROUP").unwrap();
        t.add_entity_to_group("a", "staff").unwrap();
        t.modify_group_expansions("staff", "admins", ExpansionUpdate::Include).unwrap();

        assert!(t.is_qualified("a", Capability::CreateGroup));
        assert!(!t.is_qualified("a", Capability::DestroyGroup));
    }

    #[test]
    fn test_effective_capabilities() {
        let t = tree();
        t.new_entity("a", None, "pw").unwrap();
        t.set_entity_capability("a", "CREATE_ENTITY").unwrap();
        t.new_group("ops", "", "", None).unwrap();
        t.set_group_capability("ops", "CREATE_GROUP").unwrap();
        t.set_group_capability("ops", "CREATE_ENTITY").unwrap();
        t.add_entity_to_group("a", "ops").unwrap();

        let caps = t.effective_capabilities("a").unwrap();
        assert_eq!(caps, vec![Capability::CreateEntity, Capability::CreateGroup]);
    }

    #[test]
    fn test_manage_by_membership() {
        let t = tree();
        t.new_group("admins", "", "", None).unwrap();
        t.new_group("ops", "", "admins", None).unwrap();
        t.new_entity("a", None, "pw").unwrap();

        assert!(!t.manage_by_membership("a", "ops"));
        t.add_entity_to_group("a", "admins").unwrap();
        assert!(t.manage_by_membership("a", "ops"));

        // Groups without delegation never match.
        assert!(!t.manage_by_membership("a", "admins"));
        // Unknown groups and actors never match.
        assert!(!t.manage_by_membership("a", "ghost"));
        assert!(!t.manage_by_membership("ghost", "ops"));
    }

    #[test]
    fn test_manage_by_membership_dangling_target() {
        let t = tree();
        t.new_group("admins", "", "", None).unwrap();
        t.new_group("ops", "", "admins", None).unwrap();
        t.new_entity("a", None, "pw").unwrap();
        t.add_entity_to_group("a", "admins").unwrap();
        assert!(t.manage_by_membership("a", "ops"));

        // Deleting the delegation target leaves the pointer dangling and
        // the check failing closed.
        t.delete_group("admins").unwrap();
        assert!(!t.manage_by_membership("a", "ops"));
        assert_eq!(t.get_group("ops").unwrap().managed_by.as_deref(), Some("admins"));
    }

    // ------------------------------------------------------------------
    // bootstrap
    // ------------------------------------------------------------------

    #[test]
    fn test_bootstrap_creates_root() {
        let t = tree();
        t.make_bootstrap("root", "hunter2").unwrap();
        let e = t.get_entity("root").unwrap();
        assert_eq!(e.number, 1);
        assert!(e.meta.capabilities.contains(&Capability::GlobalRoot));
        assert!(t.validate_secret("root", "hunter2").is_ok());
        assert!(t.bootstrap_done());
    }

    #[test]
    fn test_bootstrap_runs_once() {
        let t = tree();
        t.make_bootstrap("root", "hunter2").unwrap();
        t.make_bootstrap("other", "pw").unwrap();
        assert!(matches!(t.get_entity("other"), Err(TreeError::UnknownEntity)));
    }

    #[test]
    fn test_bootstrap_promotes_existing_entity() {
        let t = tree();
        t.new_entity("admin", None, "pw").unwrap();
        t.make_bootstrap("admin", "ignored").unwrap();
        let e = t.get_entity("admin").unwrap();
        assert!(e.meta.capabilities.contains(&Capability::GlobalRoot));
        // The existing secret is untouched.
        assert!(t.validate_secret("admin", "pw").is_ok());
    }

    #[test]
    fn test_disable_bootstrap() {
        let t = tree();
        t.disable_bootstrap();
        t.make_bootstrap("root", "hunter2").unwrap();
        assert!(matches!(t.get_entity("root"), Err(TreeError::UnknownEntity)));
    }

    #[test]
    fn test_bootstrap_latch_arms_on_load() {
        let mut store = MemoryStore::new();
        let mut root = Entity::new("root", 1);
        root.meta.capabilities.push(Capability::GlobalRoot);
        store.save_entity(&root).unwrap();

        let t = Tree::load(Box::new(store), Box::new(DigestKdf)).unwrap();
        assert!(t.bootstrap_done());
        t.make_bootstrap("intruder", "pw").unwrap();
        assert!(matches!(t.get_entity("intruder"), Err(TreeError::UnknownEntity)));
    }

    // ------------------------------------------------------------------
    // write-through
    // ------------------------------------------------------------------

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Store wrapper that fails the next write when the shared flag is
    /// set, for exercising the write-through rollback.
    struct SaboteurStore {
        inner: MemoryStore,
        fail_next: Arc<AtomicBool>,
    }

    impl SaboteurStore {
        fn check(&self) -> crate::store::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "induced failure",
                )));
            }
            Ok(())
        }
    }

    impl DirectoryStore for SaboteurStore {
        fn save_entity(&mut self, e: &Entity) -> crate::store::Result<()> {
            self.check()?;
            self.inner.save_entity(e)
        }
        fn load_entity(&self, id: &str) -> crate::store::Result<Entity> {
            self.inner.load_entity(id)
        }
        fn delete_entity(&mut self, id: &str) -> crate::store::Result<()> {
            self.check()?;
            self.inner.delete_entity(id)
        }
        fn discover_entity_ids(&self) -> crate::store::Result<Vec<String>> {
            self.inner.discover_entity_ids()
        }
        fn save_group(&mut self, g: &Group) -> crate::store::Result<()> {
            self.check()?;
            self.inner.save_group(g)
        }
        fn load_group(&self, name: &str) -> crate::store::Result<Group> {
            self.inner.load_group(name)
        }
        fn delete_group(&mut self, name: &str) -> crate::store::Result<()> {
            self.check()?;
            self.inner.delete_group(name)
        }
        fn discover_group_names(&self) -> crate::store::Result<Vec<String>> {
            self.inner.discover_group_names()
        }
        fn health(&self) -> HealthStatus {
            self.inner.health()
        }
    }

    #[test]
    fn test_failed_store_write_rolls_back_index() {
        let fail = Arc::new(AtomicBool::new(false));
        let store = SaboteurStore {
            inner: MemoryStore::new(),
            fail_next: fail.clone(),
        };
        let t = Tree::load(Box::new(store), Box::new(DigestKdf)).unwrap();
        t.new_entity("a", None, "pw").unwrap();

        // A failed metadata save leaves the old record visible.
        fail.store(true, Ordering::SeqCst);
        let patch = EntityMeta {
            display_name: Some("Broken".to_string()),
            ..EntityMeta::default()
        };
        assert!(t.update_entity_meta("a", &patch).is_err());
        assert!(t.get_entity("a").unwrap().meta.display_name.is_none());

        // A failed create leaves no trace in the index.
        fail.store(true, Ordering::SeqCst);
        assert!(t.new_entity("b", None, "pw").is_err());
        assert!(matches!(t.get_entity("b"), Err(TreeError::UnknownEntity)));

        // And the numbering is unaffected by the failed attempt.
        t.new_entity("c", None, "pw").unwrap();
        assert_eq!(t.get_entity("c").unwrap().number, 2);
    }
}
