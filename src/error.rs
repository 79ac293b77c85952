//! Error taxonomy shared by every component of the console.

use thiserror::Error;

/// Message fragment the appliance returns for a key bundle it has already
/// consumed. The ingest task treats this failure as a successful dedup hit.
pub const KEYBUNDLE_PROCESSED_MESSAGE: &str = "Keybundle was previously processed";

/// The crate wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A fastboot invocation failed. Carries the merged or separated command
    /// output so the operator can see what the device reported.
    #[error("fastboot failure: {0}")]
    Transport(String),

    /// The appliance is absent or a target serial is no longer tracked.
    #[error("device not found")]
    DeviceNotFound,

    /// A structurally invalid ATAP message (length, version, reserved bytes,
    /// or an unsupported certify request).
    #[error("malformed message: {0}")]
    BadRequest(String),

    /// ECDH computation or GCM authentication failed.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// The SoM certificate chain or authentication signature did not verify.
    #[error("signature failure: {0}")]
    SignatureFailure(String),

    /// The product/SoM descriptor file is not usable.
    #[error("descriptor format error: {0}")]
    DescriptorFormat(String),

    /// The target offered no usable key exchange algorithm.
    #[error("no key exchange algorithm available")]
    NoAlgorithm,

    /// The appliance OS version is older than the compatible baseline.
    #[error("incompatible appliance version {0}")]
    VersionIncompatible(i64),

    /// The appliance OS version could not be read at all.
    #[error("appliance os version not available")]
    OsVersionUnavailable,

    /// Creating one or more device records failed; lists every affected
    /// serial so a single tick surfaces one aggregated warning.
    #[error("failed to create device records for {}: {message}", serials.join(", "))]
    DeviceCreation {
        serials: Vec<String>,
        message: String,
    },

    /// No product or SoM descriptor has been selected yet.
    #[error("no product or SoM selected")]
    ProductNotSpecified,

    /// A step was requested that would regress the device's provision state.
    #[error("step refused: {0}")]
    StepRefused(String),

    /// Operator authentication failed.
    #[error("password verification failed")]
    PasswordError,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is the appliance's permanent "bundle already consumed"
    /// answer, which the ingest log records as a success.
    pub fn is_keybundle_processed(&self) -> bool {
        matches!(self, Error::Transport(msg) if msg.contains(KEYBUNDLE_PROCESSED_MESSAGE))
    }
}
