//! Control directories: the `.dbzr` directory holding a repository and a
//! branch, and the URL registry used to open them.

use crate::branch::{Branch, BzrBranch};
use crate::errors::{BzrError, Result};
use crate::pack_repository::PackRepository;
use crate::repository::{Repository, RepositoryFormat};
use crate::transport::{Transport, absolute_url, get_transport, join_location};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, info};

pub const CONTROL_DIR: &str = ".dbzr";
pub const CONTROL_FORMAT: &str = "DBZR control directory 1\n";
pub const CONTROL_FORMAT_FILE: &str = "branch-format";
pub const REPOSITORY_DIR: &str = "repository";
pub const BRANCH_DIR: &str = "branch";

pub trait ControlDir: fmt::Debug {
    /// URL of the directory the control directory lives in.
    fn base(&self) -> String;

    /// The repository stored here; `NoRepositoryPresent` otherwise.
    fn open_repository(&self) -> Result<Box<dyn Repository>>;

    /// The branch stored here, with stacking activated.
    fn open_branch(&self) -> Result<Box<dyn Branch>>;

    fn has_workingtree(&self) -> bool;

    /// Create a branch over the repository stored here.
    fn create_branch(&self) -> Result<Box<dyn Branch>>;
}

type Opener = fn(&str) -> Result<Box<dyn ControlDir>>;

fn openers() -> &'static RwLock<HashMap<String, Opener>> {
    static OPENERS: OnceLock<RwLock<HashMap<String, Opener>>> = OnceLock::new();
    OPENERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Route URLs of `scheme` (`scheme://...`) to `opener`.
pub fn register_scheme(scheme: &str, opener: Opener) {
    let mut map = openers().write().unwrap_or_else(|e| e.into_inner());
    map.insert(scheme.to_string(), opener);
}

fn scheme_opener(url: &str) -> Option<Opener> {
    let parsed = absolute_url(url).ok().flatten()?;
    let map = openers().read().unwrap_or_else(|e| e.into_inner());
    map.get(parsed.scheme()).copied()
}

/// Open the control directory at `url`: a local path, a `file://` URL, or
/// a URL whose scheme has been registered.
pub fn open_control_dir(url: &str) -> Result<Box<dyn ControlDir>> {
    if let Some(opener) = scheme_opener(url) {
        return opener(url);
    }
    Ok(Box::new(LocalControlDir::open(get_transport(url)?)?))
}

/// A control directory reached through a transport: the local filesystem,
/// memory, or plain file operations over a smart medium.
#[derive(Debug, Clone)]
pub struct LocalControlDir {
    root: Arc<dyn Transport>,
    control: Arc<dyn Transport>,
}

impl LocalControlDir {
    pub fn open(root: Arc<dyn Transport>) -> Result<Self> {
        let control = root.clone_to(CONTROL_DIR)?;
        match control.get_bytes(CONTROL_FORMAT_FILE) {
            Ok(bytes) if bytes == CONTROL_FORMAT.as_bytes() => Ok(Self { root, control }),
            Ok(bytes) => Err(BzrError::UnknownFormat(String::from_utf8_lossy(&bytes).trim().to_string())),
            Err(e) if e.is_no_such_file() => Err(BzrError::NotBranchError {
                path: root.base(),
                detail: None,
            }),
            Err(e) => Err(e),
        }
    }

    /// Create an empty control directory in the existing directory of `root`.
    pub fn create(root: Arc<dyn Transport>) -> Result<Self> {
        let control = root.clone_to(CONTROL_DIR)?;
        root.mkdir(CONTROL_DIR)?;
        control.put_bytes(CONTROL_FORMAT_FILE, CONTROL_FORMAT.as_bytes())?;
        Ok(Self { root, control })
    }

    pub fn root_transport(&self) -> &Arc<dyn Transport> {
        &self.root
    }

    pub fn repository_transport(&self) -> Result<Arc<dyn Transport>> {
        self.control.clone_to(REPOSITORY_DIR)
    }

    pub fn branch_transport(&self) -> Result<Arc<dyn Transport>> {
        self.control.clone_to(BRANCH_DIR)
    }

    pub fn has_repository(&self) -> Result<bool> {
        self.control.has(&format!("{}/format", REPOSITORY_DIR))
    }

    pub fn create_repository(&self, format: &RepositoryFormat) -> Result<PackRepository> {
        self.control.mkdir(REPOSITORY_DIR)?;
        PackRepository::create(self.repository_transport()?, format)
    }

    pub fn open_pack_repository(&self) -> Result<PackRepository> {
        PackRepository::open(self.repository_transport()?)
    }

    /// Open the branch without activating its stacking location.
    pub fn open_bzr_branch(&self) -> Result<BzrBranch> {
        let repository = self.open_repository()?;
        BzrBranch::open(&self.root.base(), self.branch_transport()?, repository).map_err(|e| match e {
            BzrError::NotBranchError { .. } => BzrError::NotBranchError {
                path: self.root.base(),
                detail: Some("no branch".into()),
            },
            other => other,
        })
    }
}

impl ControlDir for LocalControlDir {
    fn base(&self) -> String {
        self.root.base()
    }

    fn open_repository(&self) -> Result<Box<dyn Repository>> {
        Ok(Box::new(self.open_pack_repository()?))
    }

    fn open_branch(&self) -> Result<Box<dyn Branch>> {
        let mut branch = self.open_bzr_branch()?;
        branch.activate_stacking()?;
        Ok(Box::new(branch))
    }

    fn has_workingtree(&self) -> bool {
        false
    }

    fn create_branch(&self) -> Result<Box<dyn Branch>> {
        let repository = self.open_repository()?;
        self.control.mkdir(BRANCH_DIR)?;
        Ok(Box::new(BzrBranch::create(&self.root.base(), self.branch_transport()?, repository)?))
    }
}

/// Options for [`initialize_ex`].
#[derive(Debug, Clone, Default)]
pub struct InitializeOptions {
    /// Format of the repository to create; `None` creates no repository.
    pub repository_format: Option<RepositoryFormat>,
    /// Location a branch created here should stack on.
    pub stacked_on: Option<String>,
    /// Base that a relative `stacked_on` is resolved against.
    pub stack_on_pwd: Option<String>,
    pub require_stacking: bool,
    /// Create missing parent directories.
    pub create_prefix: bool,
    /// Accept an existing (control-dir free) directory.
    pub use_existing_dir: bool,
}

/// What [`initialize_ex`] created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeResult {
    /// `Some("")` when a repository was created in the new control dir.
    pub repository_path: Option<String>,
    pub format: Option<RepositoryFormat>,
    pub control_dir_name: String,
    pub require_stacking: bool,
    pub stacked_on: Option<String>,
    pub stack_pwd: Option<String>,
    /// Write lock token of the new repository, when it was left locked.
    pub repo_lock_token: Option<String>,
}

fn make_dirs(transport: &Arc<dyn Transport>) -> Result<()> {
    match transport.mkdir(".") {
        Ok(()) | Err(BzrError::FileExists(_)) => Ok(()),
        Err(e) if e.is_no_such_file() => {
            make_dirs(&transport.clone_to("..")?)?;
            transport.ensure_dir(".")
        }
        Err(e) => Err(e),
    }
}

/// Resolve `location` against the directory `pwd` unless it is already
/// absolute. Without `pwd` only URLs are normalized.
pub fn resolve_location(location: &str, pwd: Option<&str>) -> Result<String> {
    match pwd {
        Some(pwd) => join_location(pwd, location),
        None => Ok(absolute_url(location)?.map_or_else(|| location.to_string(), String::from)),
    }
}

/// Create a control directory (and, if asked, a repository) at `transport`,
/// checking that a requested stacking location is usable.
pub fn initialize_ex(transport: Arc<dyn Transport>, options: &InitializeOptions) -> Result<InitializeResult> {
    match transport.mkdir(".") {
        Ok(()) => {}
        Err(BzrError::FileExists(_)) if options.use_existing_dir => {}
        Err(e @ BzrError::FileExists(_)) => return Err(e),
        Err(e) if e.is_no_such_file() && options.create_prefix => make_dirs(&transport)?,
        Err(e) => return Err(e),
    }
    if transport.has(CONTROL_DIR)? {
        return Err(BzrError::FileExists(format!("{}{}", transport.base(), CONTROL_DIR)));
    }

    // Relative locations are relative to the new directory unless a pwd
    // is given.
    let base = transport.base();
    let stacked_on = options
        .stacked_on
        .as_deref()
        .map(|url| resolve_location(url, Some(options.stack_on_pwd.as_deref().unwrap_or(&base))))
        .transpose()?;
    if options.require_stacking && stacked_on.is_none() {
        return Err(BzrError::UnstackableLocation {
            branch: transport.base(),
            location: String::new(),
        });
    }
    if let (Some(url), Some(format)) = (&stacked_on, &options.repository_format) {
        let fallback = open_control_dir(url)?.open_repository()?;
        let other = fallback.format();
        if !format.supports_external_lookups {
            return Err(BzrError::UnstackableRepositoryFormat {
                format: format.network_name.clone(),
                url: transport.base(),
            });
        }
        if !format.same_model(&other) {
            return Err(BzrError::IncompatibleRepositories {
                source_repo: url.clone(),
                target_repo: transport.base(),
                details: format!(": different serializers ({} vs {})", other.serializer, format.serializer),
            });
        }
    }

    let control = LocalControlDir::create(Arc::clone(&transport))?;
    let mut result = InitializeResult {
        repository_path: None,
        format: None,
        control_dir_name: CONTROL_DIR.to_string(),
        require_stacking: options.require_stacking,
        stacked_on: options.stacked_on.clone(),
        stack_pwd: options.stack_on_pwd.clone(),
        repo_lock_token: None,
    };
    if let Some(format) = &options.repository_format {
        control.create_repository(format)?;
        result.repository_path = Some(String::new());
        result.format = Some(format.clone());
    }
    info!("initialized {} ({:?})", transport.base(), result.format.as_ref().map(|f| &f.network_name));
    Ok(result)
}

/// Create a control directory with a repository and a branch, stacked if
/// `stacked_on` is given.
pub fn create_branch_convenience(
    transport: Arc<dyn Transport>,
    format: &RepositoryFormat,
    stacked_on: Option<&str>,
) -> Result<Box<dyn Branch>> {
    let options = InitializeOptions {
        repository_format: Some(format.clone()),
        stacked_on: stacked_on.map(str::to_string),
        create_prefix: true,
        use_existing_dir: true,
        ..Default::default()
    };
    let result = initialize_ex(Arc::clone(&transport), &options)?;
    let mut branch = LocalControlDir::open(transport)?.create_branch()?;
    if let Some(url) = result.stacked_on {
        let url = match &result.stack_pwd {
            Some(pwd) => join_location(pwd, &url)?,
            None => url,
        };
        debug!("stacking new branch {} on {}", branch.base(), url);
        branch.lock_write(None)?;
        let stacked = branch.set_stacked_on_url(Some(&url));
        let unlocked = branch.unlock();
        stacked?;
        unlocked?;
    }
    Ok(branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalTransport, MemoryTransport};
    use tempfile::TempDir;

    #[test]
    fn test_initialize_and_open() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let result = initialize_ex(
            Arc::clone(&t),
            &InitializeOptions {
                repository_format: Some(RepositoryFormat::default()),
                use_existing_dir: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result.repository_path.as_deref(), Some(""));
        assert_eq!(result.control_dir_name, ".dbzr");

        let dir = LocalControlDir::open(Arc::clone(&t)).unwrap();
        assert!(dir.has_repository().unwrap());
        assert!(matches!(dir.open_branch(), Err(BzrError::NotBranchError { .. })));
        let mut branch = dir.create_branch().unwrap();
        assert_eq!(branch.last_revision_info().unwrap(), (0, b"null:".to_vec()));

        let again = initialize_ex(t, &InitializeOptions { use_existing_dir: true, ..Default::default() });
        assert!(matches!(again, Err(BzrError::FileExists(_))));
    }

    #[test]
    fn test_initialize_requires_existing_dir_flag() {
        let tmp = TempDir::new().unwrap();
        let t: Arc<dyn Transport> = Arc::new(LocalTransport::new(tmp.path()));
        let err = initialize_ex(Arc::clone(&t), &InitializeOptions::default()).unwrap_err();
        assert!(matches!(err, BzrError::FileExists(_)));

        let nested: Arc<dyn Transport> = Arc::new(LocalTransport::new(tmp.path().join("a/b")));
        assert!(initialize_ex(Arc::clone(&nested), &InitializeOptions::default()).is_err());
        let options = InitializeOptions {
            create_prefix: true,
            ..Default::default()
        };
        initialize_ex(nested, &options).unwrap();
        assert!(tmp.path().join("a/b/.dbzr/branch-format").exists());
    }

    #[test]
    fn test_require_stacking_without_location() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let options = InitializeOptions {
            require_stacking: true,
            use_existing_dir: true,
            ..Default::default()
        };
        assert!(matches!(
            initialize_ex(t, &options),
            Err(BzrError::UnstackableLocation { .. })
        ));
    }

    #[test]
    fn test_open_missing_control_dir() {
        let tmp = TempDir::new().unwrap();
        let err = open_control_dir(tmp.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, BzrError::NotBranchError { .. }));
        assert!(matches!(
            open_control_dir("nosuch://host/path"),
            Err(BzrError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(resolve_location("../trunk", Some("file:///srv/b/")).unwrap(), "file:///srv/trunk");
        assert_eq!(resolve_location("./x/../trunk", Some("file:///srv/b")).unwrap(), "file:///srv/b/trunk");
        assert_eq!(resolve_location("/abs", Some("file:///srv")).unwrap(), "/abs");
        assert_eq!(resolve_location("dbzr://h/x", None).unwrap(), "dbzr://h/x");
        assert_eq!(resolve_location("../trunk", None).unwrap(), "../trunk");
    }
}
