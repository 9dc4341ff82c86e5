//! # NetAuth Core - Centralized Identity and Authorization
//!
//! NetAuth manages two kinds of principals, entities and groups, along
//! with a capability model and group expansion rules that compute
//! effective memberships. Clients prove a shared secret, receive a
//! signed bearer token carrying capability claims, and present that
//! token with every privileged call.
//!
//! ## Core Philosophy
//!
//! **One writer, short-lived tokens, no partial mutations.**
//!
//! - The tree serializes every mutation and writes through to the store
//!   before committing its index
//! - Tokens are Ed25519-signed and expire quickly; expiry is the
//!   revocation mechanism
//! - Secrets are stored only as KDF output and wiped before a deleted
//!   record leaves the index
//!
//! ## Components
//!
//! - [`store`] - pluggable persistence (in-memory, atomic file backend)
//! - [`crypto`] - the KDF seam for login secrets
//! - [`token`] - bearer token mint and validation
//! - [`tree`] - the authoritative directory with its resolver and
//!   authorization evaluator
//! - [`authflow`] - login and authorize-then-execute orchestration
//!
//! ## Example
//!
//! ```rust
//! use netauth_core::authflow::{AuthFlow, ClientInfo};
//! use netauth_core::crypto::DigestKdf;
//! use netauth_core::store::MemoryStore;
//! use netauth_core::token::{TokenConfig, TokenKeys, TokenService};
//! use netauth_core::tree::Tree;
//!
//! // Assemble a server core around an in-memory store.
//! let tree = Tree::load(Box::new(MemoryStore::new()), Box::new(DigestKdf)).unwrap();
//! tree.make_bootstrap("root", "hunter2").unwrap();
//! let flow = AuthFlow::new(
//!     tree,
//!     TokenService::new(TokenKeys::generate(), TokenConfig::default()),
//! );
//!
//! // Login, then act with the token.
//! let client = ClientInfo { service: "demo".into(), id: "localhost".into() };
//! let token = flow.login("root", "hunter2", None).unwrap();
//! flow.new_entity(&token, &client, "alice", -1, "password").unwrap();
//! assert_eq!(flow.entity_info(&client, "alice").unwrap().number, 2);
//! ```

pub mod authflow;
pub mod capability;
pub mod crypto;
pub mod entity;
pub mod group;
pub mod kv;
pub mod membership;
pub mod store;
pub mod token;
pub mod tree;

// Re-export main types
pub use authflow::{Adjustment, AuthFlow, ClientInfo, GroupInfo, SimpleResult, WireCode, WireError};
pub use capability::Capability;
pub use crypto::{create_kdf, Argon2Kdf, DigestKdf, KdfBackend, KdfConfig, SecretKdf};
pub use entity::{Entity, EntityMeta};
pub use group::{Expansion, ExpansionMode, ExpansionUpdate, Group, GroupPatch};
pub use kv::KvMode;
pub use store::{create_store, DirectoryStore, FileStore, HealthStatus, MemoryStore, StoreConfig};
pub use token::{Claims, TokenConfig, TokenKeys, TokenService};
pub use tree::{Tree, TreeError};

/// Version of the NetAuth core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
