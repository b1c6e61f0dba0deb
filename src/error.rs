//! Possible errors that may occur during Webauthn operation processing.

use thiserror::Error;

/// Possible errors that may occur during Webauthn operation processing.
///
/// Every variant is terminal for the ceremony that raised it.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum WebauthnError {
    #[error("Structurally invalid binary, CBOR or JSON input: {0}")]
    MalformedInput(&'static str),

    #[error("The client data type did not match the ceremony")]
    ProtocolViolation,

    #[error("The user identifier is not of the expected shape")]
    InvalidIdentifier,

    #[error("No challenge was found for this user and ceremony")]
    ChallengeNotFound,

    #[error("The clientData challenge does not match the issued challenge")]
    ChallengeMismatch,

    #[error("The clientData origin does not match the relying party")]
    OriginMismatch,

    #[error("The authenticator data RP ID hash does not match the relying party")]
    RpIdHashMismatch,

    #[error("The user present bit is not set in the authenticator data")]
    UserNotPresent,

    #[error("The attestation format {0:?} is not supported")]
    UnsupportedAttestationFormat(String),

    #[error("The authenticator data does not carry attested credential data")]
    MissingAttestedCredentialData,

    #[error("The attestation statement is malformed: {0}")]
    MalformedAttestation(&'static str),

    #[error("The attestation statement signature is invalid")]
    AttestationSignatureInvalid,

    #[error("The attestation could not be verified against the trust policy")]
    AttestationTrustFailure,

    #[error("The assertion signature is invalid")]
    AssertionSignatureInvalid,

    #[error("No credential is registered for this user")]
    CredentialNotFound,

    #[error("The asserted credential id does not match the registered credential")]
    CredentialIdMismatch,

    #[error("The asserted user handle does not match the user")]
    UserHandleMismatch,

    #[error("The authenticator counter did not advance, the credential may be cloned")]
    CounterRegression,

    #[error("The COSE algorithm {0} is not supported")]
    UnsupportedAlgorithm(i128),

    #[error("The COSE key is invalid: {0}")]
    COSEKeyInvalid(&'static str),

    #[error("The requested metadata was not found")]
    NotFound,

    #[error("The metadata document is invalid: {0}")]
    MetadataInvalid(&'static str),

    #[error("The metadata service is unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("The storage backend failed: {0}")]
    Storage(String),

    #[error("OpenSSL Error")]
    OpenSSLError(#[from] openssl::error::ErrorStack),
}
