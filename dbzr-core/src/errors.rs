//! Error types shared by the storage engine and the smart client.
//!
//! Every error a server can report has a local counterpart here, so callers
//! cannot tell a translated remote failure from a local one.

use std::fmt;

/// Result type for dbzr operations
pub type Result<T> = std::result::Result<T, BzrError>;

/// A structured error reply from a smart server: the error verb and its
/// arguments, all opaque byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTuple {
    pub verb: Vec<u8>,
    pub args: Vec<Vec<u8>>,
}

impl ErrorTuple {
    pub fn new(verb: &[u8], args: Vec<Vec<u8>>) -> Self {
        Self {
            verb: verb.to_vec(),
            args,
        }
    }

    /// Argument `i` decoded lossily, or an empty string when absent.
    pub fn arg_str(&self, i: usize) -> String {
        self.args
            .get(i)
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for ErrorTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", String::from_utf8_lossy(&self.verb))?;
        for arg in &self.args {
            write!(f, ", {}", String::from_utf8_lossy(arg))?;
        }
        write!(f, ")")
    }
}

/// Errors that can occur in repository, branch and protocol operations
#[derive(Debug, thiserror::Error)]
pub enum BzrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Transport ====================
    #[error("No such file: {0}")]
    NoSuchFile(String),

    #[error("File exists: {0}")]
    FileExists(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Path {path} is not a child of {base}")]
    PathNotChild { path: String, base: String },

    #[error("Permission denied: {path}{extra}")]
    PermissionDenied { path: String, extra: String },

    #[error("Error reading from {path}: {extra}")]
    ReadError { path: String, extra: String },

    #[error("Short readv of {path}: wanted {length} bytes at {offset}, got {actual}")]
    ShortReadvError {
        path: String,
        offset: u64,
        length: u64,
        actual: u64,
    },

    #[error("Invalid URL {url}: {extra}")]
    InvalidUrl { url: String, extra: String },

    // ==================== Objects ====================
    #[error("Not a branch: {path}{}", fmt_detail(.detail))]
    NotBranchError {
        path: String,
        detail: Option<String>,
    },

    #[error("No repository present: {0}")]
    NoRepositoryPresent(String),

    #[error("Branch {0} is not stacked")]
    NotStacked(String),

    #[error("{within} has no revision {revision}")]
    NoSuchRevision { within: String, revision: String },

    #[error("Revision {revision} not present in {file}")]
    RevisionNotPresent { revision: String, file: String },

    #[error("Requested revno {revno} is out of range ({min}..{max})")]
    RevnoOutOfBounds { revno: i64, min: i64, max: i64 },

    #[error("Could not determine revno for {revision} because its ancestry shows a ghost at {ghost}")]
    GhostRevisionsHaveNoRevno { revision: String, ghost: String },

    #[error("Branches have diverged: {branch} and {other}")]
    Diverged { branch: String, other: String },

    #[error("Tip change rejected: {0}")]
    TipChangeRejected(String),

    #[error("Unknown format: {0}")]
    UnknownFormat(String),

    // ==================== Locking ====================
    #[error("{0} is not locked")]
    ObjectNotLocked(String),

    #[error("{0} is not write locked")]
    NotWriteLocked(String),

    #[error("A write attempt was made in a read only transaction on {0}")]
    ReadOnlyError(String),

    #[error("Could not acquire lock {lock}{msg}")]
    LockContention { lock: String, msg: String },

    #[error("Cannot lock {lock}: {why}")]
    LockFailed { lock: String, why: String },

    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    #[error("The lock token {given:?} does not match lock token {lock:?}")]
    TokenMismatch { given: String, lock: String },

    #[error("{0} does not support token locking")]
    TokenLockingNotSupported(String),

    #[error("Cannot lock: transport is read only: {0}")]
    UnlockableTransport(String),

    // ==================== Stacking ====================
    #[error("The branch {url}({format}) is not a stackable format")]
    UnstackableBranchFormat { format: String, url: String },

    #[error("The repository {url}({format}) is not a stackable format")]
    UnstackableRepositoryFormat { format: String, url: String },

    #[error("The branch {branch} cannot be stacked on {location}")]
    UnstackableLocation { branch: String, location: String },

    #[error("{source_repo} is incompatible with {target_repo}{details}")]
    IncompatibleRepositories {
        source_repo: String,
        target_repo: String,
        details: String,
    },

    // ==================== Write groups ====================
    #[error("Repository {0} cannot suspend a write group")]
    UnsuspendableWriteGroup(String),

    #[error("Repository {repository} cannot resume write group {tokens:?}: {reason}")]
    UnresumableWriteGroup {
        repository: String,
        tokens: Vec<String>,
        reason: String,
    },

    #[error("Internal check failed: {0}")]
    BzrCheckError(String),

    #[error("Already have a pack named {0}")]
    PackNameCollision(String),

    // ==================== Indices and records ====================
    #[error("Bad index key {0}")]
    BadIndexKey(String),

    #[error("The key {key} is already in index {index}")]
    BadIndexDuplicateKey { key: String, index: String },

    #[error("Corrupt index data: {0}")]
    BadIndexData(String),

    #[error("Index {0} has been finished and cannot be modified")]
    IndexFinished(String),

    #[error("Bad index value {0}")]
    BadIndexValue(String),

    #[error("Invalid container record: {0}")]
    InvalidRecord(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ==================== Smart protocol ====================
    #[error("The server does not recognise this request: {0}")]
    UnknownSmartMethod(String),

    #[error("Error received from smart server: {0}")]
    ErrorFromSmartServer(ErrorTuple),

    #[error("Server sent an unexpected error: {0}")]
    UnknownErrorFromSmartServer(ErrorTuple),

    #[error("Could not understand response from smart server: {0:?}")]
    UnexpectedSmartServerResponse(Vec<String>),

    #[error("Generic bzr smart protocol error: {0}")]
    SmartProtocolError(String),

    #[error("Connection closed: {0}")]
    ConnectionReset(String),

    #[error("Bad search: {0}")]
    BadSearch(String),

    #[error("Server reported an out of memory condition")]
    MemoryError,

    #[error("{0} is not supported")]
    NotImplemented(String),

    #[error("{0}")]
    General(String),
}

fn fmt_detail(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(": {}", d)).unwrap_or_default()
}

impl BzrError {
    pub fn no_such_revision(within: impl fmt::Display, revision: &[u8]) -> Self {
        BzrError::NoSuchRevision {
            within: within.to_string(),
            revision: String::from_utf8_lossy(revision).into_owned(),
        }
    }

    pub fn serialization(err: impl fmt::Display) -> Self {
        BzrError::Serialization(err.to_string())
    }

    /// Build an `UnexpectedSmartServerResponse` from raw response arguments.
    pub fn unexpected_response(args: &[Vec<u8>]) -> Self {
        BzrError::UnexpectedSmartServerResponse(
            args.iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
        )
    }

    pub fn is_no_such_file(&self) -> bool {
        match self {
            BzrError::NoSuchFile(_) => true,
            BzrError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<bincode::Error> for BzrError {
    fn from(err: bincode::Error) -> Self {
        BzrError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BzrError {
    fn from(err: serde_json::Error) -> Self {
        BzrError::Serialization(err.to_string())
    }
}
