use crate::capability::Capability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::Zeroize;

/// Typed metadata attached to an entity.
///
/// Scalar fields are optional so that a partially filled value can act as
/// a patch: [`EntityMeta::merge`] copies only the fields the patch sets.
/// The `capabilities` and `groups` lists are deliberately outside the
/// merge; they change only through their own tree operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub primary_group: Option<String>,

    /// Free-form string pairs, managed through the untyped-meta verb.
    #[serde(default)]
    pub untyped: BTreeMap<String, String>,

    /// Capabilities granted directly to the entity.
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// Direct group memberships, by group name.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl EntityMeta {
    /// Merge the scalar fields of `patch` into `self`.
    ///
    /// Unset fields in the patch leave the existing value alone. The
    /// untyped map, capability list, and group list are never touched
    /// here, whatever the patch carries.
    pub fn merge(&mut self, patch: &EntityMeta) {
        if let Some(v) = &patch.display_name {
            self.display_name = Some(v.clone());
        }
        if let Some(v) = &patch.shell {
            self.shell = Some(v.clone());
        }
        if let Some(v) = &patch.home {
            self.home = Some(v.clone());
        }
        if let Some(v) = &patch.primary_group {
            self.primary_group = Some(v.clone());
        }
    }
}

/// A principal: a user or service account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique, immutable identifier.
    pub id: String,

    /// Globally unique, immutable number.
    pub number: i32,

    /// KDF output over the login secret. `None` or empty means the entity
    /// cannot authenticate.
    pub secret: Option<String>,

    pub meta: EntityMeta,
}

impl Entity {
    pub fn new(id: impl Into<String>, number: i32) -> Self {
        Entity {
            id: id.into(),
            number,
            secret: None,
            meta: EntityMeta::default(),
        }
    }

    /// Copy of this entity with the secret field cleared, fit to hand to
    /// any external caller.
    pub fn safe_copy(&self) -> Entity {
        let mut copy = self.clone();
        copy.secret = None;
        copy
    }

    /// Overwrite and drop the stored secret blob.
    pub fn wipe_secret(&mut self) {
        if let Some(s) = self.secret.as_mut() {
            s.zeroize();
        }
        self.secret = None;
    }

    /// Whether the entity has a usable secret at all.
    pub fn authenticable(&self) -> bool {
        self.secret.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }
}
