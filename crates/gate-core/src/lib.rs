//! gate-core - Shared domain types for the gate client agent
//!
//! This crate provides the types shared between the wire crate and the
//! daemon: the channel space, the per-client channel allocator, the
//! distributed-class registry, interests and their in-flight operations,
//! projection entries, uberdogs, and configuration.
//!
//! Nothing here performs I/O; sessions own their mutable state and share
//! these registries read-only.

pub mod allocator;
pub mod channel;
pub mod config;
pub mod dclass;
pub mod interest;
pub mod object;
pub mod uberdog;

// Re-exports for convenience
pub use allocator::ChannelAllocator;
pub use channel::{location_channel, Channel, DoId, Zone, BCHAN_CLIENTS};
pub use config::{AgentConfig, ChannelRange, ConfigError};
pub use dclass::{ClassConfig, ClassRegistry, DcClass, DcError, DcField, FieldConfig, FieldType};
pub use interest::{Interest, InterestOperation};
pub use object::DistributedObject;
pub use uberdog::{Uberdog, UberdogConfig, UberdogError, UberdogRegistry};
