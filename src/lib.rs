//! # playervault
//!
//! A multi-tenant player-data persistence engine built on two external
//! services: a key/value document store with per-key compare-and-set
//! ("DocStore") and a lease-based shared hash map used for cross-process
//! coordination ("LeaseMap").
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Store Facade                         │
//! │  • load / unload / update / tx / save / get / peek / close  │
//! │  • per-key session map, lifecycle, concurrency guards       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Per-Key Session                         │
//! │  • FSM: Loading → Ready → Unloading → Closed (∥ Lost)       │
//! │  • operation queue with update fast path                    │
//! │  • autosave scheduler, pending-change tracking              │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                    │
//!          ▼                   ▼                    ▼
//! ┌────────────────┐ ┌──────────────────┐ ┌────────────────────┐
//! │  Lock Manager  │ │ Tx Coordinator   │ │   Shard Manager    │
//! │  • lease +     │ │ • two-phase      │ │ • split oversized  │
//! │    refresh     │ │   multi-key      │ │   records          │
//! │  • loss        │ │   commit         │ │ • orphan GC queue  │
//! │    callbacks   │ │ • ledger bit     │ │ • hash-verified    │
//! └────────────────┘ └──────────────────┘ │   reassembly       │
//!          │                   │          └────────────────────┘
//!          ▼                   ▼                    │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Retry/Backoff (classified failures)            │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                        │
//!          ▼                                        ▼
//!     ┌─────────┐                             ┌──────────┐
//!     │ LeaseMap│                             │ DocStore │
//!     └─────────┘                             └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use playervault::{MemoryDocStore, MemoryLeaseMap, Store, StoreConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), playervault::StoreError> {
//!     let config = StoreConfig::new("players")
//!         .template(json!({"coins": 0}))
//!         .schema(|data| {
//!             data["coins"]
//!                 .as_i64()
//!                 .map(|_| ())
//!                 .ok_or_else(|| "coins must be a number".to_string())
//!         });
//!
//!     let store = Store::open(
//!         config,
//!         Arc::new(MemoryDocStore::new()),
//!         Arc::new(MemoryLeaseMap::new()),
//!     )
//!     .await?;
//!
//!     store.load("player-1").await?;
//!     store.load("player-2").await?;
//!
//!     // Single-key update: runs immediately when no transaction is
//!     // pending on the key.
//!     store.update("player-1", |data| {
//!         data["coins"] = json!(10);
//!         true
//!     })
//!     .await?;
//!
//!     // Atomic multi-key transfer, linearized at the ledger write.
//!     store.tx(&["player-1", "player-2"], |state| {
//!         state.get_mut("player-1").unwrap()["coins"] = json!(3);
//!         state.get_mut("player-2").unwrap()["coins"] = json!(7);
//!         true
//!     })
//!     .await?;
//!
//!     store.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Exclusive sessions**: one live lease per key across processes, with
//!   background refresh and loss notification
//! - **Multi-key transactions**: two-phase commit over a record-embedded
//!   write-ahead patch, atomic across N keys
//! - **Sharding**: records over the size budget split across sibling
//!   documents with hash-verified reassembly and orphan GC
//! - **Migrations**: named, ordered, exactly-once transforms at load
//! - **Retry with classification**: transient/budget/terminal backend
//!   failures, exponential backoff with jitter
//! - **Change fan-out**: immutable before/after snapshots to observers
//!
//! ## Modules
//!
//! - [`store`]: the [`Store`] facade owning per-key sessions
//! - [`session`]: per-key state machine and operation queue worker
//! - [`backend`]: DocStore/LeaseMap traits and in-memory implementations
//! - [`lock`]: lease acquisition, refresh, loss callbacks
//! - [`codec`] / [`patch`]: stored envelope and structural JSON diffing
//! - [`migration`]: ordered named migration steps
//! - [`events`]: change fan-out to observers
//! - [`resilience`]: retry with backoff, cancellation
//! - [`metrics`]: `metrics`-facade instrumentation

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod metrics;
pub mod migration;
pub mod patch;
pub mod record;
pub mod resilience;
pub mod session;
pub mod store;

mod queue;
mod shard;
mod tx;

pub use backend::{DocStore, Document, FaultPlan, LeaseMap, MemoryDocStore, MemoryLeaseMap, Precondition};
pub use config::{ImportFn, SchemaFn, StoreConfig, Tunables};
pub use error::{BackendError, StoreError};
pub use events::{ChangeEvent, ChangeObserver};
pub use lock::{LockManager, LockState};
pub use migration::{MigrationFn, MigrationStep};
pub use patch::{apply, diff, Patch, PatchError, PatchOp};
pub use record::{LogicalRecord, RecordMeta, ShardManifest};
pub use resilience::{CancelSource, CancelToken, RetryPolicy};
pub use session::SessionState;
pub use store::{Store, StoreState, StoreStats};
