use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use derive_more::Display;
use itertools::Itertools;
use std::fmt::Debug;
use thiserror::Error;

/// Storage operation that failed, used to label transfer errors
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum StorageOp {
    #[display("upload")]
    Upload,
    #[display("download")]
    Download,
    #[display("delete")]
    Delete,
    #[display("list")]
    List,
}

/// Why a restored artifact was rejected
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum IntegrityFailure {
    #[display("decryption failed (wrong key, bad IV or tampered data)")]
    Decrypt,
    #[display("decompression failed")]
    Decompress,
    #[display("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[display("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),
    #[error("scheduling failed: {0}")]
    Scheduling(String),
    #[error("unknown session {0:?}")]
    UnknownSession(String),
    #[error("storage {op} of {path:?} failed: {reason}")]
    Transfer {
        op: StorageOp,
        path: String,
        retryable: bool,
        reason: String,
    },
    #[error("integrity check failed for {path:?}: {failure}")]
    Integrity {
        path: String,
        failure: IntegrityFailure,
    },
    #[error("{entity} {id} cannot {action} while {state}")]
    State {
        entity: &'static str,
        id: String,
        action: &'static str,
        state: String,
    },
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send + Sync>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>, O: Debug + Send + Sync + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    /// Storage failure the caller may retry, e.g. an unreachable backend
    pub fn transfer<P: Into<String>, R: ToString>(op: StorageOp, path: P, reason: R) -> Self {
        Error::Transfer {
            op,
            path: path.into(),
            retryable: true,
            reason: reason.to_string(),
        }
    }

    pub fn not_found<P: Into<String>>(op: StorageOp, path: P) -> Self {
        Error::Transfer {
            op,
            path: path.into(),
            retryable: false,
            reason: "object not found".into(),
        }
    }

    pub fn integrity<P: Into<String>>(path: P, failure: IntegrityFailure) -> Self {
        Error::Integrity {
            path: path.into(),
            failure,
        }
    }

    pub fn state<I: ToString, S: Debug>(
        entity: &'static str,
        id: I,
        action: &'static str,
        state: S,
    ) -> Self {
        Error::State {
            entity,
            id: id.to_string(),
            action,
            state: format!("{state:?}").to_lowercase(),
        }
    }

    /// Looks through context wrappers for the underlying failure.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.root()
            }
            e => e,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Error::Transfer {
                retryable: true,
                ..
            }
        )
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self.root(), Error::Integrity { .. })
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }
}
