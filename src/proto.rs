//! JSON Protocol Structs and representations for communication with authenticators
//! and clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;

use crate::base64_data::Base64UrlSafeData;
use crate::constants::CHALLENGE_SIZE_BYTES;
use crate::crypto::{COSEAlgorithm, COSEKey};
use crate::error::WebauthnError;

/// Representation of an opaque credential id. Compared byte for byte.
pub type CredentialID = Base64UrlSafeData;

/// The ceremony a challenge was issued for. A challenge is bound to exactly one
/// user and one purpose at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChallengePurpose {
    /// `navigator.credentials.create()`
    Registration,
    /// `navigator.credentials.get()`
    Authentication,
}

/// A random nonce issued to the client for a single ceremony.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge(pub Vec<u8>);

impl Challenge {
    /// Generate a fresh challenge from the thread local CSPRNG.
    pub fn new() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Challenge(rng.gen::<[u8; CHALLENGE_SIZE_BYTES]>().to_vec())
    }
}

impl Default for Challenge {
    fn default() -> Self {
        Challenge::new()
    }
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Challenge({})", Base64UrlSafeData(self.0.clone()))
    }
}

impl AsRef<[u8]> for Challenge {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Challenge> for Base64UrlSafeData {
    fn from(c: Challenge) -> Self {
        Base64UrlSafeData(c.0)
    }
}

/// A user's authenticator credential. It contains an id, the public key
/// and a counter of how many times the authenticator has been used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// The ID of this credential.
    pub cred_id: CredentialID,
    /// The public key of this credential
    pub cred: COSEKey,
    /// The counter for this credential
    pub counter: u32,
}

impl Credential {
    pub(crate) fn new(cred_id: Vec<u8>, cred: COSEKey, counter: u32) -> Self {
        Credential {
            cred_id: Base64UrlSafeData(cred_id),
            cred,
            counter,
        }
    }
}

/// Relying Party Entity
#[derive(Debug, Serialize, Clone, Deserialize)]
pub struct RelyingParty {
    /// The name of the relying party.
    pub name: String,
    /// The id of the relying party.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// User Entity
#[derive(Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// The user's id in base64 form. This is the identifier as bytes.
    pub id: Base64UrlSafeData,
    /// A detailed name for the account, such as an email address.
    pub name: String,
    /// The user's preferred name for display.
    pub display_name: String,
    /// An image representing the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Public key cryptographic parameters
#[derive(Debug, Serialize, Clone, Deserialize)]
pub struct PubKeyCredParams {
    /// The type of public-key credential.
    #[serde(rename = "type")]
    pub type_: String,
    /// The algorithm in use defined by COSE.
    pub alg: i64,
}

impl From<COSEAlgorithm> for PubKeyCredParams {
    fn from(alg: COSEAlgorithm) -> Self {
        PubKeyCredParams {
            type_: "public-key".to_string(),
            alg: alg.into(),
        }
    }
}

/// <https://www.w3.org/TR/webauthn/#enumdef-attestationconveyancepreference>
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationConveyancePreference {
    /// Do not request attestation.
    None,
    /// Request attestation in a semi-anonymized form.
    Indirect,
    /// Request attestation in a direct form.
    Direct,
}

/// <https://www.w3.org/TR/webauthn/#dictdef-publickeycredentialdescriptor>
#[derive(Debug, Serialize, Clone, Deserialize)]
pub struct PublicKeyCredentialDescriptor {
    /// The type of credential
    #[serde(rename = "type")]
    pub type_: String,
    /// The credential id.
    pub id: CredentialID,
}

impl From<&Credential> for PublicKeyCredentialDescriptor {
    fn from(cred: &Credential) -> Self {
        PublicKeyCredentialDescriptor {
            type_: "public-key".to_string(),
            id: cred.cred_id.clone(),
        }
    }
}

/// <https://w3c.github.io/webauthn/#dictionary-makecredentialoptions>
#[derive(Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyCredentialCreationOptions {
    /// The relying party
    pub rp: RelyingParty,
    /// The user.
    pub user: User,
    /// The one-time challenge for the credential to sign.
    pub challenge: Base64UrlSafeData,
    /// The set of cryptographic types allowed by this server.
    pub pub_key_cred_params: Vec<PubKeyCredParams>,
    /// The timeout for the authenticator to stop accepting the operation
    pub timeout: u32,
    /// Credential ID's that are excluded from being able to be registered.
    pub exclude_credentials: Vec<PublicKeyCredentialDescriptor>,
    /// The requested attestation level from the device.
    pub attestation: AttestationConveyancePreference,
    /// Extensions that may be used by the browser/authenticator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<BTreeMap<String, serde_json::Value>>,
}

/// A JSON serialisable challenge which is issued to the user's webbrowser
/// for handling. This is meant to be opaque, that is, you should not need
/// to inspect or alter the content of the struct - you should serialise it
/// and transmit it to the client only.
#[derive(Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationChallengeResponse {
    /// The options.
    pub public_key: PublicKeyCredentialCreationOptions,
}

/// The requested options for the authentication
#[derive(Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyCredentialRequestOptions {
    /// The challenge that should be signed by the authenticator.
    pub challenge: Base64UrlSafeData,
    /// The timeout for the authenticator in case of no interaction.
    pub timeout: u32,
    /// The relying party ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rp_id: Option<String>,
    /// The set of credentials that are allowed to sign this challenge.
    pub allow_credentials: Vec<PublicKeyCredentialDescriptor>,
}

/// A JSON serialisable challenge which is issued to the user's webbrowser
/// for handling. This is meant to be opaque, that is, you should not need
/// to inspect or alter the content of the struct - you should serialise it
/// and transmit it to the client only.
#[derive(Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestChallengeResponse {
    /// The options.
    pub public_key: PublicKeyCredentialRequestOptions,
}

/// The data collected and hashed in the operation.
/// <https://www.w3.org/TR/webauthn-2/#dictdef-collectedclientdata>
#[derive(Debug, Serialize, Clone, Deserialize)]
pub struct CollectedClientData {
    /// The credential type
    #[serde(rename = "type")]
    pub type_: String,
    /// The challenge.
    pub challenge: Base64UrlSafeData,
    /// The rp origin as the browser understood it.
    pub origin: String,
    /// The inverse of the sameOriginWithAncestors argument value that was
    /// passed into the internal method.
    #[serde(rename = "crossOrigin", skip_serializing_if = "Option::is_none")]
    pub cross_origin: Option<bool>,
    /// tokenBinding.
    #[serde(rename = "tokenBinding", skip_serializing_if = "Option::is_none")]
    pub token_binding: Option<serde_json::Value>,
    /// This struct be extended, so it's important to be tolerant of unknown
    /// keys.
    #[serde(flatten)]
    pub unknown_keys: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<&[u8]> for CollectedClientData {
    type Error = WebauthnError;
    fn try_from(data: &[u8]) -> Result<CollectedClientData, WebauthnError> {
        serde_json::from_slice(data).map_err(|err| {
            debug!(?err, "client data json could not be decoded");
            WebauthnError::MalformedInput("client data json could not be decoded")
        })
    }
}

/// <https://w3c.github.io/webauthn/#authenticatorattestationresponse>
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorAttestationResponseRaw {
    /// The cbor attestation object.
    pub attestation_object: Base64UrlSafeData,
    /// The client data json, exactly as the browser produced it.
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: Base64UrlSafeData,
}

/// A client response to a registration challenge. This contains all details
/// required to validate the new credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPublicKeyCredential {
    /// The id of the PublicKey credential, likely in base64
    pub id: String,
    /// The id of the credential in bytes.
    pub raw_id: Base64UrlSafeData,
    /// The attestation response from the authenticator.
    pub response: AuthenticatorAttestationResponseRaw,
    /// The type of credential.
    #[serde(rename = "type")]
    pub type_: String,
}

/// <https://w3c.github.io/webauthn/#authenticatorassertionresponse>
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorAssertionResponseRaw {
    /// Raw authenticator data.
    pub authenticator_data: Base64UrlSafeData,
    /// The client data json, exactly as the browser produced it.
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: Base64UrlSafeData,
    /// Signature over `authenticatorData || sha256(clientDataJSON)`.
    pub signature: Base64UrlSafeData,
    /// Optional user handle.
    pub user_handle: Option<Base64UrlSafeData>,
}

/// A client response to an authentication challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyCredential {
    /// The credential Id, likely base64
    pub id: String,
    /// The binary of the credential id.
    pub raw_id: Base64UrlSafeData,
    /// The authenticator response.
    pub response: AuthenticatorAssertionResponseRaw,
    /// The type of credential.
    #[serde(rename = "type")]
    pub type_: String,
}

/// How far an attestation could be traced to a trusted root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationTrust {
    /// The attestation certificate chains to a root listed in the metadata
    /// record for its key identifier.
    Verified {
        /// The metadata key identifier of the attestation certificate.
        key_identifier: String,
        /// The authenticator description from the metadata record.
        description: Option<String>,
    },
    /// The attestation signature is valid, but it could not be traced to a
    /// trusted root.
    Unverified,
}

/// The outcome of a successful registration. The credential has already been
/// persisted through the storage backend.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// The registered credential.
    pub credential: Credential,
    /// The attestation trust outcome.
    pub trust: AttestationTrust,
}

/// The outcome of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResult {
    /// The credential that was used.
    pub cred_id: CredentialID,
    /// The new signature counter.
    pub counter: u32,
    /// If the authenticator asserted user verification.
    pub user_verified: bool,
}
