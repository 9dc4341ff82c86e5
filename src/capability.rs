use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a wire string does not name a known capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown capability '{0}'")]
pub struct UnknownCapability(pub String);

/// Authorization atom granted to entities directly or conferred through
/// group membership.
///
/// The set is closed. The wire format uses the upper snake case names,
/// which `FromStr` and `Display` round-trip. `GlobalRoot` subsumes every
/// other capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    GlobalRoot,
    CreateEntity,
    DestroyEntity,
    ModifyEntityMeta,
    ChangeEntitySecret,
    CreateGroup,
    DestroyGroup,
    ModifyGroupMeta,
    ModifyGroupMembers,
}

impl Capability {
    /// Every capability in wire order.
    pub const ALL: [Capability; 9] = [
        Capability::GlobalRoot,
        Capability::CreateEntity,
        Capability::DestroyEntity,
        Capability::ModifyEntityMeta,
        Capability::ChangeEntitySecret,
        Capability::CreateGroup,
        Capability::DestroyGroup,
        Capability::ModifyGroupMeta,
        Capability::ModifyGroupMembers,
    ];

    /// Wire name of this capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::GlobalRoot => "GLOBAL_ROOT",
            Capability::CreateEntity => "CREATE_ENTITY",
            Capability::DestroyEntity => "DESTROY_ENTITY",
            Capability::ModifyEntityMeta => "MODIFY_ENTITY_META",
            Capability::ChangeEntitySecret => "CHANGE_ENTITY_SECRET",
            Capability::CreateGroup => "CREATE_GROUP",
            Capability::DestroyGroup => "DESTROY_GROUP",
            Capability::ModifyGroupMeta => "MODIFY_GROUP_META",
            Capability::ModifyGroupMembers => "MODIFY_GROUP_MEMBERS",
        }
    }

    /// Whether holding `self` satisfies a check for `required`.
    ///
    /// `GLOBAL_ROOT` satisfies everything.
    pub fn satisfies(&self, required: Capability) -> bool {
        *self == Capability::GlobalRoot || *self == required
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// Whether any capability in `held` satisfies `required`.
pub fn any_satisfies(held: &[Capability], required: Capability) -> bool {
    held.iter().any(|c| c.satisfies(required))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        for c in Capability::ALL {
            assert_eq!(c.as_str().parse::<Capability>().unwrap(), c);
        }
    }

    #[test]
    fn test_unknown_string_rejected() {
        assert!("LAUNCH_MISSILES".parse::<Capability>().is_err());
        assert!("".parse::<Capability>().is_err());
        assert!("create_entity".parse::<Capability>().is_err());
    }

    #[test]
    fn test_global_root_satisfies_all() {
        for c in Capability::ALL {
            assert!(Capability::GlobalRoot.satisfies(c));
        }
    }

    #[test]
    fn test_plain_capability_satisfies_only_itself() {
        assert!(Capability::CreateEntity.satisfies(Capability::CreateEntity));
        assert!(!Capability::CreateEntity.satisfies(Capability::DestroyEntity));
        assert!(!Capability::CreateEntity.satisfies(Capability::GlobalRoot));
    }

    #[test]
    fn test_any_satisfies() {
        let held = [Capability::CreateGroup, Capability::ModifyGroupMeta];
        assert!(any_satisfies(&held, Capability::CreateGroup));
        assert!(!any_satisfies(&held, Capability::CreateEntity));
        assert!(any_satisfies(&[Capability::GlobalRoot], Capability::CreateEntity));
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&Capability::ChangeEntitySecret).unwrap();
        assert_eq!(json, "\"CHANGE_ENTITY_SECRET\"");
        let back: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Capability::ChangeEntitySecret);
    }
}
