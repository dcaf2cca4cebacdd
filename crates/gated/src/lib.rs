//! gated - Client agent daemon for a distributed-object cluster
//!
//! This crate provides the daemon infrastructure:
//! - `agent` - the acceptor role that owns the registries and spawns sessions
//! - `session` - the per-connection state machine and protocol translation
//! - `bus` - the message director routing actor and participant handles
//! - `events` - operational event emission
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   ClientAgent   │
//! │  (TcpListener)  │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  subscribe/publish  ┌─────────────────┐
//! │  ClientSession  │────────────────────▶│     BusActor    │
//! │  (per client)   │◀────────────────────│ (channel router)│
//! └───────┬─────────┘       inbox         └─────────────────┘
//!         │
//!         ▼
//! ┌─────────────────┐
//! │   EventSender   │
//! │ (log + UDP sink)│
//! └─────────────────┘
//! ```
//!
//! Each session owns its projection, interests, and in-flight interest
//! operations exclusively; the class and uberdog registries are shared
//! read-only, and the channel allocator is interior-synchronized.

pub mod agent;
pub mod bus;
pub mod events;
pub mod session;
