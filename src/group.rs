use crate::capability::Capability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown expansion mode '{0}'")]
pub struct UnknownExpansionMode(pub String);

/// Stored rule mode: how a child group contributes to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpansionMode {
    Include,
    Exclude,
}

impl fmt::Display for ExpansionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpansionMode::Include => f.write_str("INCLUDE"),
            ExpansionMode::Exclude => f.write_str("EXCLUDE"),
        }
    }
}

/// Requested change to a parent group's rule set. `Drop` removes whatever
/// rule exists for the pair; it is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionUpdate {
    Include,
    Exclude,
    Drop,
}

impl FromStr for ExpansionUpdate {
    type Err = UnknownExpansionMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INCLUDE" => Ok(ExpansionUpdate::Include),
            "EXCLUDE" => Ok(ExpansionUpdate::Exclude),
            "DROP" => Ok(ExpansionUpdate::Drop),
            other => Err(UnknownExpansionMode(other.to_string())),
        }
    }
}

/// A directed edge in the expansion graph, stored on the parent group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expansion {
    pub mode: ExpansionMode,
    /// Name of the child group. May dangle after a deletion; the resolver
    /// skips targets it cannot find.
    pub target: String,
}

/// A named collection of entities with optional delegated administration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Globally unique, immutable name.
    pub name: String,

    pub display_name: String,

    /// Globally unique, immutable number.
    pub number: i32,

    /// Entities in this group may administer the group carrying the
    /// pointer. `None` means no delegation.
    #[serde(default)]
    pub managed_by: Option<String>,

    /// Capabilities conferred on members.
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// Ordered rule list feeding the membership resolver.
    #[serde(default)]
    pub expansions: Vec<Expansion>,

    #[serde(default)]
    pub untyped: BTreeMap<String, String>,
}

/// Patch for the mutable scalar fields of a group. Unset fields keep the
/// existing value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupPatch {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub managed_by: Option<String>,
}

impl Group {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, number: i32) -> Self {
        Group {
            name: name.into(),
            display_name: display_name.into(),
            number,
            ..Group::default()
        }
    }

    /// Merge the set fields of `patch` into this group. Name, number,
    /// capabilities, and expansions are immutable through this path.
    pub fn merge(&mut self, patch: &GroupPatch) {
        if let Some(v) = &patch.display_name {
            self.display_name = v.clone();
        }
        if let Some(v) = &patch.managed_by {
            self.managed_by = if v.is_empty() { None } else { Some(v.clone()) };
        }
    }

    /// The rule for `(self, child)`, if one exists.
    pub fn expansion_for(&self, child: &str) -> Option<&Expansion> {
        self.expansions.iter().find(|x| x.target == child)
    }
}
