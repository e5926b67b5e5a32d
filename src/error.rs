use std::fmt;

/// Typed failures surfaced across subsystem boundaries.
///
/// Orchestration code uses `anyhow` and downcasts to this enum where the
/// distinction matters (lock retries, admin refusals, auth).
#[derive(Debug)]
pub enum StatikoError {
    /// Master secret key missing or not 16 bytes after base64 decoding.
    BadKey,
    /// AES-GCM authentication failed.
    Decrypt,
    /// A decrypted payload did not match its framing.
    Corrupt,
    /// A store lock could not be acquired before the deadline.
    LockTimeout(String),
    /// A node with the same name is already connected.
    NameInUse(String),
    /// The certificate is still referenced by at least one site.
    CertificateInUse(String),
    /// An admin mutation was refused (duplicate domain, missing cert, ...).
    Validation(String),
    /// Lookup by id/name found nothing.
    NotFound,
    /// Bearer token mismatch.
    Unauthorized,
    Internal(String),
}

impl fmt::Display for StatikoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatikoError::BadKey => write!(f, "master key is missing or not 16 bytes"),
            StatikoError::Decrypt => write!(f, "decryption failed"),
            StatikoError::Corrupt => write!(f, "corrupt encrypted payload"),
            StatikoError::LockTimeout(name) => write!(f, "timed out acquiring lock: {}", name),
            StatikoError::NameInUse(name) => write!(f, "node name already in use: {}", name),
            StatikoError::CertificateInUse(id) => {
                write!(f, "certificate is referenced by a site: {}", id)
            }
            StatikoError::Validation(msg) => write!(f, "validation error: {}", msg),
            StatikoError::NotFound => write!(f, "not found"),
            StatikoError::Unauthorized => write!(f, "unauthorized"),
            StatikoError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for StatikoError {}
