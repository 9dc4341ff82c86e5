//! # Auth Flow
//!
//! Orchestrates the two flows every client goes through:
//!
//! 1. **Login**: prove a secret, receive a bearer token carrying the
//!    entity's effective capability set (optionally narrowed to a
//!    requested subset).
//! 2. **Authorize then execute**: every privileged call validates the
//!    presented token, checks the required capability (or delegated
//!    administration where the operation supports it), and only then
//!    touches the tree.
//!
//! Errors crossing this boundary are translated to canonical wire codes
//! with short single-line messages. Internal details are logged here and
//! never sent to the caller.

use crate::capability::Capability;
use crate::crypto::CryptoError;
use crate::entity::{Entity, EntityMeta};
use crate::group::{Group, GroupPatch};
use crate::kv::KvMode;
use crate::store::HealthStatus;
use crate::token::{Claims, TokenError, TokenService};
use crate::tree::{Tree, TreeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{error, info, warn};

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Canonical wire status codes, matching what the RPC layer exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCode {
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    InvalidArgument,
    Internal,
    Unknown,
}

impl fmt::Display for WireCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WireCode::Unauthenticated => "UNAUTHENTICATED",
            WireCode::PermissionDenied => "PERMISSION_DENIED",
            WireCode::NotFound => "NOT_FOUND",
            WireCode::AlreadyExists => "ALREADY_EXISTS",
            WireCode::FailedPrecondition => "FAILED_PRECONDITION",
            WireCode::InvalidArgument => "INVALID_ARGUMENT",
            WireCode::Internal => "INTERNAL",
            WireCode::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Error shape handed to the RPC layer: a canonical code and a short
/// human message.
#[derive(Debug, Clone, Error)]
#[error("{code}: {msg}")]
pub struct WireError {
    pub code: WireCode,
    pub msg: String,
}

impl WireError {
    fn new(code: WireCode, msg: impl Into<String>) -> Self {
        WireError { code, msg: msg.into() }
    }

    fn unauthenticated() -> Self {
        WireError::new(WireCode::Unauthenticated, "Authentication failure")
    }

    fn unqualified() -> Self {
        WireError::new(WireCode::PermissionDenied, "Requestor not qualified")
    }
}

impl From<TreeError> for WireError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::UnknownEntity | TreeError::UnknownGroup | TreeError::UnknownCapability(_) => {
                WireError::new(WireCode::NotFound, e.to_string())
            }
            TreeError::DuplicateEntityID(_)
            | TreeError::DuplicateGroupName(_)
            | TreeError::DuplicateNumber(_)
            | TreeError::ExistingExpansion { .. } => {
                WireError::new(WireCode::AlreadyExists, e.to_string())
            }
            TreeError::EntityLocked => WireError::new(WireCode::FailedPrecondition, e.to_string()),
            TreeError::EntityBadAuth => WireError::unauthenticated(),
            TreeError::RequestorUnqualified => WireError::unqualified(),
            TreeError::MalformedRequest(msg) => WireError::new(WireCode::InvalidArgument, msg),
            TreeError::Store(inner) => {
                error!(detail = %inner, "store failure");
                WireError::new(WireCode::Internal, "Internal error")
            }
            TreeError::Internal(detail) => {
                error!(%detail, "internal tree failure");
                WireError::new(WireCode::Internal, "Internal error")
            }
        }
    }
}

impl From<TokenError> for WireError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::KeyUnavailable(detail) => {
                error!(%detail, "token keys unavailable");
                WireError::new(WireCode::FailedPrecondition, "Token keys unavailable")
            }
            TokenError::TokenInvalid => WireError::unauthenticated(),
            TokenError::Internal(detail) => {
                error!(%detail, "internal token failure");
                WireError::new(WireCode::Internal, "Internal error")
            }
        }
    }
}

impl From<CryptoError> for WireError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthorizationFailure => WireError::unauthenticated(),
            CryptoError::InternalError(detail) => {
                error!(%detail, "internal crypto failure");
                WireError::new(WireCode::Internal, "Internal error")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Caller identification sent with every request. Logged for the audit
/// trail, never consulted for authorization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub service: String,
    pub id: String,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.id)
    }
}

/// Uniform response for mutating calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleResult {
    pub success: bool,
    pub msg: String,
}

impl SimpleResult {
    fn ok(msg: impl Into<String>) -> Self {
        SimpleResult { success: true, msg: msg.into() }
    }
}

/// Payload for a group information query: the group itself plus the
/// names of the groups it administers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group: Group,
    pub managed: Vec<String>,
}

/// Direction of a membership or capability adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Add,
    Drop,
}

impl FromStr for Adjustment {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ADD" => Ok(Adjustment::Add),
            "DROP" | "REMOVE" => Ok(Adjustment::Drop),
            other => Err(WireError::new(
                WireCode::InvalidArgument,
                format!("unknown adjustment '{}'", other),
            )),
        }
    }
}

/// Wire sentinel: `-1` asks the tree to auto-assign the next number.
fn wire_number(n: i32) -> Option<i32> {
    if n == -1 {
        None
    } else {
        Some(n)
    }
}

// ============================================================================
// AUTH FLOW
// ============================================================================

/// Server-side composition of the tree and the token service. One
/// instance lives for the whole process; handler threads share it.
pub struct AuthFlow {
    tree: Tree,
    tokens: TokenService,
}

impl AuthFlow {
    pub fn new(tree: Tree, tokens: TokenService) -> Self {
        AuthFlow { tree, tokens }
    }

    /// Direct access to the tree, for startup tasks such as bootstrap.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn health(&self) -> HealthStatus {
        self.tree.health()
    }

    // ========================================================================
    // LOGIN
    // ========================================================================

    /// Authenticate an entity and mint a token.
    ///
    /// The token carries the entity's effective capability set: direct
    /// capabilities plus everything conferred by group membership. A
    /// `requested` list narrows the grant to the intersection; asking for
    /// capabilities the entity lacks silently yields fewer than asked.
    pub fn login(&self, id: &str, secret: &str, requested: Option<&[Capability]>) -> Result<String> {
        self.tree.validate_secret(id, secret)?;

        let effective = self.tree.effective_capabilities(id)?;
        let granted: Vec<Capability> = match requested {
            None => effective,
            Some(req) => effective.into_iter().filter(|c| req.contains(c)).collect(),
        };

        let token = self.tokens.generate(id, granted)?;
        info!(entity = id, "login succeeded");
        Ok(token)
    }

    fn authenticate(&self, token: &str) -> Result<Claims> {
        match self.tokens.validate(token) {
            Ok(claims) => Ok(claims),
            Err(e) => {
                warn!("token rejected");
                Err(e.into())
            }
        }
    }

    fn require(&self, claims: &Claims, cap: Capability) -> Result<()> {
        if claims.has_capability(cap) {
            return Ok(());
        }
        warn!(subject = %claims.subject, capability = %cap, "capability check failed");
        Err(WireError::unqualified())
    }

    /// The delegated-administration disjunction used by group metadata
    /// operations: the capability on the token, or effective membership
    /// in the target group's managing group.
    fn require_group_admin(&self, claims: &Claims, group: &str, cap: Capability) -> Result<()> {
        if self.tree.manage_by_membership(&claims.subject, group) {
            return Ok(());
        }
        self.require(claims, cap)
    }

    // ========================================================================
    // ENTITY RPCS
    // ========================================================================

    /// Create an entity. Requires `CREATE_ENTITY`. A `number` of `-1`
    /// auto-assigns.
    pub fn new_entity(
        &self,
        token: &str,
        client: &ClientInfo,
        id: &str,
        number: i32,
        secret: &str,
    ) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require(&claims, Capability::CreateEntity)?;
        self.tree.new_entity(id, wire_number(number), secret)?;
        info!(entity = id, actor = %claims.subject, client = %client, "entity created");
        Ok(SimpleResult::ok("New entity created successfully"))
    }

    /// Delete an entity. Requires `DESTROY_ENTITY`.
    pub fn remove_entity(&self, token: &str, client: &ClientInfo, id: &str) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require(&claims, Capability::DestroyEntity)?;
        self.tree.delete_entity(id)?;
        info!(entity = id, actor = %claims.subject, client = %client, "entity removed");
        Ok(SimpleResult::ok("Entity removed successfully"))
    }

    /// Safe copy of an entity. No token required.
    pub fn entity_info(&self, client: &ClientInfo, id: &str) -> Result<Entity> {
        info!(entity = id, client = %client, "entity info requested");
        Ok(self.tree.get_entity(id)?)
    }

    /// Merge typed metadata. Requires `MODIFY_ENTITY_META`.
    pub fn modify_entity_meta(
        &self,
        token: &str,
        client: &ClientInfo,
        id: &str,
        patch: &EntityMeta,
    ) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require(&claims, Capability::ModifyEntityMeta)?;
        self.tree.update_entity_meta(id, patch)?;
        info!(entity = id, actor = %claims.subject, client = %client, "entity metadata updated");
        Ok(SimpleResult::ok("Metadata updated"))
    }

    /// Manage untyped metadata. Requires `MODIFY_ENTITY_META`.
    pub fn manage_untyped_entity_meta(
        &self,
        token: &str,
        client: &ClientInfo,
        id: &str,
        mode: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let claims = self.authenticate(token)?;
        let mode: KvMode = mode
            .parse()
            .map_err(|e: crate::kv::UnknownKvMode| WireError::new(WireCode::InvalidArgument, e.to_string()))?;
        if mode.mutates() {
            self.require(&claims, Capability::ModifyEntityMeta)?;
        }
        let out = self.tree.manage_untyped_entity_meta(id, mode, key, value)?;
        info!(entity = id, actor = %claims.subject, client = %client, "untyped entity metadata managed");
        Ok(out)
    }

    /// Grant or revoke a direct entity capability. Requires
    /// `GLOBAL_ROOT`: handing out authority is the most sensitive
    /// operation the service has.
    pub fn manage_entity_capability(
        &self,
        token: &str,
        client: &ClientInfo,
        id: &str,
        adjustment: Adjustment,
        capability: &str,
    ) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require(&claims, Capability::GlobalRoot)?;
        match adjustment {
            Adjustment::Add => self.tree.set_entity_capability(id, capability)?,
            Adjustment::Drop => self.tree.remove_entity_capability(id, capability)?,
        }
        info!(entity = id, capability, actor = %claims.subject, client = %client, "entity capability managed");
        Ok(SimpleResult::ok("Capability modified"))
    }

    /// Change a secret. Authorization is proven with the actor's current
    /// secret rather than a token: self-service always works, changing
    /// another entity's secret additionally requires
    /// `CHANGE_ENTITY_SECRET`.
    pub fn change_secret(
        &self,
        client: &ClientInfo,
        actor_id: &str,
        actor_secret: &str,
        target_id: &str,
        new_secret: &str,
    ) -> Result<SimpleResult> {
        self.tree.change_secret(actor_id, actor_secret, target_id, new_secret)?;
        info!(actor = actor_id, target = target_id, client = %client, "secret changed");
        Ok(SimpleResult::ok("Secret changed successfully"))
    }

    // ========================================================================
    // GROUP RPCS
    // ========================================================================

    /// Create a group. Requires `CREATE_GROUP`. A `number` of `-1`
    /// auto-assigns; an empty `managed_by` means no delegation.
    pub fn new_group(
        &self,
        token: &str,
        client: &ClientInfo,
        name: &str,
        display_name: &str,
        managed_by: &str,
        number: i32,
    ) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require(&claims, Capability::CreateGroup)?;
        self.tree.new_group(name, display_name, managed_by, wire_number(number))?;
        info!(group = name, actor = %claims.subject, client = %client, "group created");
        Ok(SimpleResult::ok("New group created successfully"))
    }

    /// Delete a group. Requires `DESTROY_GROUP`.
    pub fn delete_group(&self, token: &str, client: &ClientInfo, name: &str) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require(&claims, Capability::DestroyGroup)?;
        self.tree.delete_group(name)?;
        info!(group = name, actor = %claims.subject, client = %client, "group removed");
        Ok(SimpleResult::ok("Group removed successfully"))
    }

    /// Group record plus the groups it administers. No token required.
    pub fn group_info(&self, client: &ClientInfo, name: &str) -> Result<GroupInfo> {
        let group = self.tree.get_group(name)?;
        let managed = self
            .tree
            .list_groups()
            .into_iter()
            .filter(|g| g.managed_by.as_deref() == Some(name))
            .map(|g| g.name)
            .collect();
        info!(group = name, client = %client, "group info requested");
        Ok(GroupInfo { group, managed })
    }

    /// All groups, sorted by name. No token required.
    pub fn list_groups(&self, client: &ClientInfo) -> Result<Vec<Group>> {
        info!(client = %client, "group list requested");
        Ok(self.tree.list_groups())
    }

    /// Merge group metadata. Delegated administrators of the group may
    /// do this without holding `MODIFY_GROUP_META`.
    pub fn modify_group_meta(
        &self,
        token: &str,
        client: &ClientInfo,
        name: &str,
        patch: &GroupPatch,
    ) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require_group_admin(&claims, name, Capability::ModifyGroupMeta)?;
        self.tree.update_group_meta(name, patch)?;
        info!(group = name, actor = %claims.subject, client = %client, "group metadata updated");
        Ok(SimpleResult::ok("Group modified successfully"))
    }

    /// Manage untyped group metadata, under the same rule as
    /// [`modify_group_meta`](Self::modify_group_meta).
    pub fn manage_untyped_group_meta(
        &self,
        token: &str,
        client: &ClientInfo,
        name: &str,
        mode: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let claims = self.authenticate(token)?;
        let mode: KvMode = mode
            .parse()
            .map_err(|e: crate::kv::UnknownKvMode| WireError::new(WireCode::InvalidArgument, e.to_string()))?;
        if mode.mutates() {
            self.require_group_admin(&claims, name, Capability::ModifyGroupMeta)?;
        }
        let out = self.tree.manage_untyped_group_meta(name, mode, key, value)?;
        info!(group = name, actor = %claims.subject, client = %client, "untyped group metadata managed");
        Ok(out)
    }

    /// Add, replace, or drop an expansion rule. Requires
    /// `MODIFY_GROUP_META`. Both group names must be given.
    pub fn modify_group_expansions(
        &self,
        token: &str,
        client: &ClientInfo,
        parent: &str,
        child: &str,
        mode: &str,
    ) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require(&claims, Capability::ModifyGroupMeta)?;
        if parent.is_empty() || child.is_empty() {
            return Err(WireError::new(
                WireCode::InvalidArgument,
                "parent and child must both be specified",
            ));
        }
        let update = mode.parse().map_err(|e: crate::group::UnknownExpansionMode| {
            WireError::new(WireCode::InvalidArgument, e.to_string())
        })?;
        self.tree.modify_group_expansions(parent, child, update)?;
        info!(parent, child, mode, actor = %claims.subject, client = %client, "expansion modified");
        Ok(SimpleResult::ok("Expansion modified successfully"))
    }

    /// Add or remove a direct group member. Delegated administrators may
    /// do this without holding `MODIFY_GROUP_MEMBERS`.
    pub fn manage_group_members(
        &self,
        token: &str,
        client: &ClientInfo,
        group: &str,
        entity_id: &str,
        adjustment: Adjustment,
    ) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require_group_admin(&claims, group, Capability::ModifyGroupMembers)?;
        match adjustment {
            Adjustment::Add => self.tree.add_entity_to_group(entity_id, group)?,
            Adjustment::Drop => self.tree.remove_entity_from_group(entity_id, group)?,
        }
        info!(group, entity = entity_id, actor = %claims.subject, client = %client, "group membership managed");
        Ok(SimpleResult::ok("Membership modified"))
    }

    /// Grant or revoke a group capability. Requires `GLOBAL_ROOT`, as
    /// for entity capabilities.
    pub fn manage_group_capability(
        &self,
        token: &str,
        client: &ClientInfo,
        group: &str,
        adjustment: Adjustment,
        capability: &str,
    ) -> Result<SimpleResult> {
        let claims = self.authenticate(token)?;
        self.require(&claims, Capability::GlobalRoot)?;
        match adjustment {
            Adjustment::Add => self.tree.set_group_capability(group, capability)?,
            Adjustment::Drop => self.tree.remove_group_capability(group, capability)?,
        }
        info!(group, capability, actor = %claims.subject, client = %client, "group capability managed");
        Ok(SimpleResult::ok("Capability modified"))
    }
}
