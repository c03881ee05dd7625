//! Mapping between server error tuples and local errors.
//!
//! The client side looks error verbs up in a registry built once per
//! process. Some translators need to know what the caller was operating on
//! (a branch, a repository, a path or a lock token); when that context is
//! missing, the untranslated `ErrorFromSmartServer` is returned as is.
//! [`error_to_tuple`] is the server side of the same mapping.

use dbzr_core::{BzrError, ErrorTuple};
use std::collections::HashMap;
use std::sync::OnceLock;

/// What the failing call was about.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub path: Option<String>,
    pub branch: Option<String>,
    pub repository: Option<String>,
    pub token: Option<String>,
}

impl ErrorContext {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..Self::default()
        }
    }

    pub fn repository(repository: impl Into<String>) -> Self {
        Self {
            repository: Some(repository.into()),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: Option<&str>) -> Self {
        self.token = token.map(str::to_string);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }
}

type Translator = fn(&ErrorTuple, &ErrorContext) -> Option<BzrError>;

fn registry() -> &'static HashMap<&'static [u8], Translator> {
    static REGISTRY: OnceLock<HashMap<&'static [u8], Translator>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

fn arg_u64(err: &ErrorTuple, i: usize) -> u64 {
    err.arg_str(i).parse().unwrap_or_default()
}

fn arg_i64(err: &ErrorTuple, i: usize) -> i64 {
    err.arg_str(i).parse().unwrap_or_default()
}

/// The path an error is about: the caller's path, else the first argument.
fn error_path(err: &ErrorTuple, ctx: &ErrorContext) -> Option<String> {
    ctx.path.clone().or_else(|| err.args.first().map(|_| err.arg_str(0)))
}

fn build_registry() -> HashMap<&'static [u8], Translator> {
    let mut map: HashMap<&'static [u8], Translator> = HashMap::new();

    // Translators that need context.
    map.insert(b"NoSuchRevision", |err, ctx| {
        let branch = ctx.branch.as_ref()?;
        Some(BzrError::no_such_revision(branch, err.args.first()?))
    });
    map.insert(b"nosuchrevision", |err, ctx| {
        let repository = ctx.repository.as_ref()?;
        Some(BzrError::no_such_revision(repository, err.args.first()?))
    });
    map.insert(b"revno-outofbounds", |err, _| {
        Some(BzrError::RevnoOutOfBounds {
            revno: arg_i64(err, 0),
            min: arg_i64(err, 1),
            max: arg_i64(err, 2),
        })
    });
    map.insert(b"nobranch", |err, ctx| {
        Some(BzrError::NotBranchError {
            path: ctx.path.clone()?,
            detail: err.args.first().map(|_| err.arg_str(0)),
        })
    });
    map.insert(b"norepository", |_, ctx| {
        Some(BzrError::NoRepositoryPresent(ctx.path.clone()?))
    });
    map.insert(b"UnlockableTransport", |_, ctx| {
        Some(BzrError::UnlockableTransport(ctx.path.clone()?))
    });
    map.insert(b"TokenMismatch", |_, ctx| {
        Some(BzrError::TokenMismatch {
            given: ctx.token.clone()?,
            lock: "(remote token)".to_string(),
        })
    });
    map.insert(b"Diverged", |err, ctx| {
        Some(BzrError::Diverged {
            branch: ctx.branch.clone()?,
            other: err.args.first().map(|_| err.arg_str(0)).unwrap_or_default(),
        })
    });
    map.insert(b"NotStacked", |_, ctx| Some(BzrError::NotStacked(ctx.branch.clone()?)));
    map.insert(b"PermissionDenied", |err, ctx| {
        Some(BzrError::PermissionDenied {
            path: error_path(err, ctx)?,
            extra: err.arg_str(1),
        })
    });
    map.insert(b"ReadError", |err, ctx| {
        Some(BzrError::ReadError {
            path: error_path(err, ctx)?,
            extra: err.arg_str(1),
        })
    });
    map.insert(b"NoSuchFile", |err, ctx| Some(BzrError::NoSuchFile(error_path(err, ctx)?)));
    map.insert(b"TokenLockingNotSupported", |_, ctx| {
        Some(BzrError::TokenLockingNotSupported(ctx.repository.clone()?))
    });
    map.insert(b"UnsuspendableWriteGroup", |_, ctx| {
        Some(BzrError::UnsuspendableWriteGroup(ctx.repository.clone()?))
    });
    map.insert(b"UnresumableWriteGroup", |err, ctx| {
        Some(BzrError::UnresumableWriteGroup {
            repository: ctx.repository.clone()?,
            tokens: err.arg_str(0).split_whitespace().map(str::to_string).collect(),
            reason: err.arg_str(1),
        })
    });

    // Translators that stand on the error arguments alone.
    map.insert(b"GhostRevisionsHaveNoRevno", |err, _| {
        Some(BzrError::GhostRevisionsHaveNoRevno {
            revision: err.arg_str(0),
            ghost: err.arg_str(1),
        })
    });
    map.insert(b"IncompatibleRepositories", |err, _| {
        Some(BzrError::IncompatibleRepositories {
            source_repo: err.arg_str(0),
            target_repo: err.arg_str(1),
            details: err.arg_str(2),
        })
    });
    map.insert(b"LockContention", |err, _| {
        Some(BzrError::LockContention {
            lock: err.arg_str(0),
            msg: err.arg_str(1),
        })
    });
    map.insert(b"LockFailed", |err, _| {
        Some(BzrError::LockFailed {
            lock: err.arg_str(0),
            why: err.arg_str(1),
        })
    });
    map.insert(b"TipChangeRejected", |err, _| Some(BzrError::TipChangeRejected(err.arg_str(0))));
    map.insert(b"UnstackableBranchFormat", |err, _| {
        Some(BzrError::UnstackableBranchFormat {
            format: err.arg_str(0),
            url: err.arg_str(1),
        })
    });
    map.insert(b"UnstackableRepositoryFormat", |err, _| {
        Some(BzrError::UnstackableRepositoryFormat {
            format: err.arg_str(0),
            url: err.arg_str(1),
        })
    });
    map.insert(b"FileExists", |err, _| Some(BzrError::FileExists(err.arg_str(0))));
    map.insert(b"DirectoryNotEmpty", |err, _| Some(BzrError::DirectoryNotEmpty(err.arg_str(0))));
    map.insert(b"UnknownFormat", |err, _| Some(BzrError::UnknownFormat(err.arg_str(0))));
    map.insert(b"InvalidURL", |err, _| {
        Some(BzrError::InvalidUrl {
            url: err.arg_str(0),
            extra: err.arg_str(1),
        })
    });
    map.insert(b"ShortReadvError", |err, _| {
        Some(BzrError::ShortReadvError {
            path: err.arg_str(0),
            offset: arg_u64(err, 1),
            length: arg_u64(err, 2),
            actual: arg_u64(err, 3),
        })
    });
    map.insert(b"ReadOnlyError", |err, _| Some(BzrError::ReadOnlyError(err.arg_str(0))));
    map.insert(b"MemoryError", |_, _| Some(BzrError::MemoryError));
    map.insert(b"RevisionNotPresent", |err, _| {
        Some(BzrError::RevisionNotPresent {
            revision: err.arg_str(0),
            file: err.arg_str(1),
        })
    });
    map.insert(b"BzrCheckError", |err, _| Some(BzrError::BzrCheckError(err.arg_str(0))));

    map
}

/// Translate a server error reply; any other error passes through.
pub fn translate_error(err: BzrError, ctx: &ErrorContext) -> BzrError {
    let BzrError::ErrorFromSmartServer(tuple) = err else {
        return err;
    };
    match registry().get(tuple.verb.as_slice()) {
        Some(translate) => translate(&tuple, ctx).unwrap_or(BzrError::ErrorFromSmartServer(tuple)),
        None => BzrError::UnknownErrorFromSmartServer(tuple),
    }
}

const NO_ARGS: &[&str] = &[];

fn tuple<S: AsRef<str>>(verb: &[u8], args: &[S]) -> ErrorTuple {
    ErrorTuple::new(verb, args.iter().map(|a| a.as_ref().as_bytes().to_vec()).collect())
}

/// Encode a local error as the tuple a server sends back.
pub fn error_to_tuple(err: &BzrError) -> ErrorTuple {
    match err {
        BzrError::NoSuchRevision { revision, .. } => tuple(b"nosuchrevision", &[revision]),
        BzrError::RevnoOutOfBounds { revno, min, max } => tuple(
            b"revno-outofbounds",
            &[&revno.to_string(), &min.to_string(), &max.to_string()],
        ),
        BzrError::NotBranchError { detail, .. } => match detail {
            Some(detail) => tuple(b"nobranch", &[detail]),
            None => tuple(b"nobranch", NO_ARGS),
        },
        BzrError::NoRepositoryPresent(_) => tuple(b"norepository", NO_ARGS),
        BzrError::UnlockableTransport(_) => tuple(b"UnlockableTransport", NO_ARGS),
        BzrError::TokenMismatch { .. } => tuple(b"TokenMismatch", NO_ARGS),
        BzrError::Diverged { other, .. } => tuple(b"Diverged", &[other]),
        BzrError::NotStacked(_) => tuple(b"NotStacked", NO_ARGS),
        BzrError::PermissionDenied { path, extra } => tuple(b"PermissionDenied", &[path, extra]),
        BzrError::ReadError { path, extra } => tuple(b"ReadError", &[path, extra]),
        BzrError::NoSuchFile(path) => tuple(b"NoSuchFile", &[path]),
        BzrError::TokenLockingNotSupported(_) => tuple(b"TokenLockingNotSupported", NO_ARGS),
        BzrError::UnsuspendableWriteGroup(_) => tuple(b"UnsuspendableWriteGroup", NO_ARGS),
        BzrError::UnresumableWriteGroup { tokens, reason, .. } => {
            tuple(b"UnresumableWriteGroup", &[&tokens.join(" "), reason])
        }
        BzrError::GhostRevisionsHaveNoRevno { revision, ghost } => {
            tuple(b"GhostRevisionsHaveNoRevno", &[revision, ghost])
        }
        BzrError::IncompatibleRepositories {
            source_repo,
            target_repo,
            details,
        } => tuple(b"IncompatibleRepositories", &[source_repo, target_repo, details]),
        BzrError::LockContention { lock, msg } => tuple(b"LockContention", &[lock, msg]),
        BzrError::LockFailed { lock, why } => tuple(b"LockFailed", &[lock, why]),
        BzrError::TipChangeRejected(msg) => tuple(b"TipChangeRejected", &[msg]),
        BzrError::UnstackableBranchFormat { format, url } => tuple(b"UnstackableBranchFormat", &[format, url]),
        BzrError::UnstackableRepositoryFormat { format, url } => {
            tuple(b"UnstackableRepositoryFormat", &[format, url])
        }
        BzrError::FileExists(path) => tuple(b"FileExists", &[path]),
        BzrError::DirectoryNotEmpty(path) => tuple(b"DirectoryNotEmpty", &[path]),
        BzrError::UnknownFormat(name) => tuple(b"UnknownFormat", &[name]),
        BzrError::InvalidUrl { url, extra } => tuple(b"InvalidURL", &[url, extra]),
        BzrError::ShortReadvError {
            path,
            offset,
            length,
            actual,
        } => tuple(
            b"ShortReadvError",
            &[path, &offset.to_string(), &length.to_string(), &actual.to_string()],
        ),
        BzrError::ReadOnlyError(what) => tuple(b"ReadOnlyError", &[what]),
        BzrError::MemoryError => tuple(b"MemoryError", NO_ARGS),
        BzrError::RevisionNotPresent { revision, file } => tuple(b"RevisionNotPresent", &[revision, file]),
        BzrError::BzrCheckError(msg) => tuple(b"BzrCheckError", &[msg]),
        BzrError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => tuple(b"NoSuchFile", &[&e.to_string()]),
        other => tuple(b"error", &[&other.to_string()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(verb: &[u8], args: &[&str]) -> BzrError {
        BzrError::ErrorFromSmartServer(tuple(verb, args))
    }

    #[test]
    fn test_context_translators() {
        let ctx = ErrorContext::branch("dbzr://host/trunk/");
        assert!(matches!(
            translate_error(remote(b"NotStacked", NO_ARGS), &ctx),
            BzrError::NotStacked(b) if b == "dbzr://host/trunk/"
        ));
        assert!(matches!(
            translate_error(remote(b"NoSuchRevision", &["r9"]), &ctx),
            BzrError::NoSuchRevision { revision, .. } if revision == "r9"
        ));

        let ctx = ErrorContext::path("trunk/").with_token(Some("abc"));
        assert!(matches!(
            translate_error(remote(b"TokenMismatch", NO_ARGS), &ctx),
            BzrError::TokenMismatch { given, .. } if given == "abc"
        ));
        assert!(matches!(
            translate_error(remote(b"nobranch", &["no format"]), &ctx),
            BzrError::NotBranchError { path, detail: Some(d) } if path == "trunk/" && d == "no format"
        ));
    }

    #[test]
    fn test_missing_context_keeps_original() {
        let ctx = ErrorContext::default();
        assert!(matches!(
            translate_error(remote(b"NotStacked", NO_ARGS), &ctx),
            BzrError::ErrorFromSmartServer(t) if t.verb == b"NotStacked"
        ));
        assert!(matches!(
            translate_error(remote(b"nosuchrevision", &["r1"]), &ErrorContext::branch("b")),
            BzrError::ErrorFromSmartServer(_)
        ));
    }

    #[test]
    fn test_unknown_verb() {
        assert!(matches!(
            translate_error(remote(b"SomethingNew", &["x"]), &ErrorContext::default()),
            BzrError::UnknownErrorFromSmartServer(t) if t.verb == b"SomethingNew"
        ));
        // Non-server errors are untouched.
        assert!(matches!(
            translate_error(BzrError::MemoryError, &ErrorContext::default()),
            BzrError::MemoryError
        ));
    }

    #[test]
    fn test_server_tuples_translate_back() {
        let ctx = ErrorContext::repository("repo").with_path("repo/");
        let errors = vec![
            BzrError::LockContention {
                lock: "repo/lock".into(),
                msg: String::new(),
            },
            BzrError::FileExists("x".into()),
            BzrError::DirectoryNotEmpty("d".into()),
            BzrError::ShortReadvError {
                path: "p".into(),
                offset: 10,
                length: 5,
                actual: 2,
            },
            BzrError::RevnoOutOfBounds { revno: 9, min: 0, max: 3 },
            BzrError::UnresumableWriteGroup {
                repository: "repo".into(),
                tokens: vec!["a".into(), "b".into()],
                reason: "missing".into(),
            },
        ];
        for err in errors {
            let expected = err.to_string();
            let translated = translate_error(BzrError::ErrorFromSmartServer(error_to_tuple(&err)), &ctx);
            assert_eq!(translated.to_string(), expected);
        }
        assert!(translate_error(BzrError::ErrorFromSmartServer(error_to_tuple(&BzrError::NoSuchFile("f".into()))), &ctx)
            .is_no_such_file());
    }
}
