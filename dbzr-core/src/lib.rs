//! DBzr Core Library
//!
//! Storage side of dbzr:
//! - Transports (local filesystem, in-memory) and lock directories
//! - Graph indices and the pack container format
//! - Pack collection with write groups, autopack and pack
//! - Repository, branch and control directory contracts plus their local
//!   implementations
//! - Stream fetch between repositories, check and reconcile

pub mod branch;
pub mod check;
pub mod config;
pub mod container;
pub mod controldir;
pub mod delta;
pub mod errors;
pub mod fetch;
pub mod graph;
pub mod graph_index;
pub mod key;
pub mod lockdir;
pub mod model;
pub mod pack;
pub mod pack_collection;
pub mod pack_repository;
pub mod packer;
pub mod record;
pub mod repository;
pub mod transport;

pub use branch::{Branch, BranchFiles, BzrBranch, PullResult, Tags, pull};
pub use check::{CheckReport, ReconcileResult};
pub use config::{BranchConfig, RepositoryConfig};
pub use controldir::{
    ControlDir, InitializeOptions, InitializeResult, LocalControlDir, initialize_ex, open_control_dir, register_scheme,
};
pub use errors::{BzrError, ErrorTuple, Result};
pub use fetch::{FetchResult, fetch, fetch_revisions, search_missing_revision_ids};
pub use graph::{ParentsProvider, SearchRecipe, SearchResult};
pub use key::{FileId, Key, NULL_REVISION, ParentMap, RevisionId};
pub use model::{Inventory, InventoryDelta, InventoryEntry, Revision, Serializer};
pub use pack_collection::PackCollection;
pub use pack_repository::PackRepository;
pub use record::{ContentRecord, Stream, Substream, SubstreamKind};
pub use repository::{LockMode, MissingKeys, Repository, RepositoryFormat, RevnoLookup};
pub use transport::{LocalTransport, MemoryTransport, Transport, get_transport};
