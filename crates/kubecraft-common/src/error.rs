//! Error types for kubecraft
//!
//! Every component-level operation fails with exactly one [`ErrorKind`].
//! Variants carry the fields a front end needs to print a specific message:
//! the offending name, the exhausted range, the observed headroom.

use thiserror::Error;

/// The closed set of failure kinds surfaced to callers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or reserved name, or invalid configuration
    Validation,
    /// Name, port or namespace already in use
    Conflict,
    /// Target tenant, workload or list does not exist
    NotFound,
    /// Tenant-count ceiling reached
    QuotaExceeded,
    /// Admission control rejected a new workload
    InsufficientCapacity,
    /// No free external port in range
    Exhausted,
    /// Readiness not observed in time
    Timeout,
    /// Any other failure from the orchestration substrate
    Substrate,
}

/// Main error type for kubecraft operations
#[derive(Debug, Error)]
pub enum Error {
    /// A name or configuration value violates a rule
    #[error("invalid {field}: {message}")]
    Validation {
        /// What was being validated (e.g. "tenant name", "port range")
        field: String,
        /// The specific rule that was violated
        message: String,
    },

    /// The target resource already exists
    #[error("{resource} already exists: {message}")]
    Conflict {
        /// Resource description (e.g. "namespace mc-alice")
        resource: String,
        /// Detail of the conflict
        message: String,
    },

    /// The target resource does not exist
    #[error("{resource} not found")]
    NotFound {
        /// Resource description (e.g. "workload srv1")
        resource: String,
    },

    /// A cluster object kubecraft depends on was never installed
    #[error("{resource} is not installed")]
    PrerequisiteMissing {
        /// Resource description (e.g. "clusterrolebinding kc-users-capacity-check")
        resource: String,
    },

    /// Tenant-count ceiling reached
    #[error("tenant limit reached ({current}/{max})")]
    QuotaExceeded {
        /// Number of registered tenants
        current: usize,
        /// Configured ceiling
        max: usize,
    },

    /// Not enough free memory to admit another workload
    #[error("insufficient cluster memory: {available_mib}Mi free, {required_mib}Mi required")]
    InsufficientCapacity {
        /// Memory left after summing running workload requests
        available_mib: i64,
        /// Per-workload limit that must fit
        required_mib: i64,
    },

    /// No external port left in the configured range
    #[error("no available ports in range {min}-{max}")]
    Exhausted {
        /// Lower bound of the range
        min: u16,
        /// Upper bound of the range
        max: u16,
    },

    /// Readiness polling gave up
    #[error("timed out waiting for {what} to become ready after {attempts} attempts")]
    Timeout {
        /// What was being waited on
        what: String,
        /// Number of polls performed
        attempts: u32,
    },

    /// Kubernetes API error
    #[error("kubernetes error during {context}: {source}")]
    Substrate {
        /// The operation that failed
        context: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// The substrate returned an object kubecraft cannot interpret
    #[error("malformed object during {context}: {message}")]
    MalformedObject {
        /// The operation that observed the object
        context: String,
        /// What was wrong with it
        message: String,
    },
}

impl Error {
    /// Create a validation error for the given field
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error for the given resource
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given resource
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an error for a missing cluster prerequisite
    pub fn prerequisite_missing(resource: impl Into<String>) -> Self {
        Self::PrerequisiteMissing {
            resource: resource.into(),
        }
    }

    /// Wrap a kube-rs error with the operation that produced it
    pub fn substrate(context: impl Into<String>, source: kube::Error) -> Self {
        Self::Substrate {
            context: context.into(),
            source,
        }
    }

    /// Create a malformed-object error
    pub fn malformed(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedObject {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// The failure kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::NotFound { .. } | Error::PrerequisiteMissing { .. } => ErrorKind::NotFound,
            Error::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Error::InsufficientCapacity { .. } => ErrorKind::InsufficientCapacity,
            Error::Exhausted { .. } => ErrorKind::Exhausted,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Substrate { .. } | Error::MalformedObject { .. } => ErrorKind::Substrate,
        }
    }

    /// Whether the caller can fix this by changing the request
    ///
    /// A missing prerequisite is a deployment fault even though its kind is
    /// [`ErrorKind::NotFound`].
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, Error::PrerequisiteMissing { .. })
            && matches!(
                self.kind(),
                ErrorKind::Validation | ErrorKind::Conflict | ErrorKind::NotFound
            )
    }

    /// HTTP status code used by the registration service
    pub fn http_status(&self) -> u16 {
        if let Error::PrerequisiteMissing { .. } = self {
            return 500;
        }
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::QuotaExceeded | ErrorKind::InsufficientCapacity | ErrorKind::Exhausted => {
                503
            }
            ErrorKind::Timeout => 504,
            ErrorKind::Substrate => 500,
        }
    }

    /// Process exit code for command-line front ends
    pub fn exit_code(&self) -> i32 {
        if self.is_caller_error() {
            2
        } else {
            1
        }
    }
}

/// Whether a kube-rs error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube-rs error means the write collided with existing state
///
/// Covers 409 (AlreadyExists, stale resourceVersion) and the 422 the API
/// server returns when a NodePort is already allocated to another Service.
pub fn is_conflict(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => true,
        kube::Error::Api(ae) if ae.code == 422 => ae.message.contains("already allocated"),
        _ => false,
    }
}

/// Whether a kube-rs error is worth retrying
///
/// Transport failures, throttling and server-side errors are transient.
/// Every other API status is a definitive answer.
pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 429 || ae.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}
