//! The relying party manager.
//!
//! [`RelyingPartyManager`] runs the two webauthn ceremonies against a
//! [`StorageBackend`]. Each ceremony is split into an options step, whose output
//! is handed to `navigator.credentials.create()` or `navigator.credentials.get()`,
//! and a verification step that consumes the authenticator's response.
//!
//! Site specific policy is provided through the [`WebauthnConfig`] trait.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::sync::OnceLock;
use url::Url;

use crate::attestation::{verify_attestation_ca_chain, Attestation, AttestationStatement};
use crate::base64_data::Base64UrlSafeData;
use crate::constants::{
    AUTHENTICATOR_TIMEOUT, CLIENT_DATA_TYPE_CREATE, CLIENT_DATA_TYPE_GET, USER_IDENTIFIER_PATTERN,
};
use crate::crypto::{compute_sha256, COSEAlgorithm};
use crate::error::WebauthnError;
use crate::internals::{AttestationObject, AuthenticatorData};
use crate::metadata::MetadataSource;
use crate::proto::*;
use crate::storage::StorageBackend;

/// What to do with a registration whose attestation signature is valid, but
/// whose attestation certificate can not be traced to a trusted root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttestationTrustPolicy {
    /// Accept the credential as [`AttestationTrust::Unverified`].
    #[default]
    Lenient,
    /// Reject the registration with [`WebauthnError::AttestationTrustFailure`].
    /// This requires a metadata source.
    Strict,
}

/// The WebauthnConfig type allows site-specific customisation of the relying
/// party manager. It provides the relying party's identity and the policies
/// applied during registration and authentication.
///
/// For a simple implementation see [`crate::ephemeral::WebauthnEphemeralConfig`].
pub trait WebauthnConfig {
    /// Returns the relying parties name. This is generally any text identifier
    /// you wish, but should rarely if ever change. Changes to the relying party
    /// name may confuse authenticators.
    ///
    /// Examples of names could be "My Awesome Site", "https://my-awesome-site.com.au"
    fn get_relying_party_name(&self) -> &str;

    /// Returns the relying party id. This should never change, and is used as an
    /// id in cryptographic operations and credential scoping. This is defined as
    /// the domain name of the service, minus all protocol, port and location data.
    /// For example:
    ///   `https://name:port/path -> name`
    ///
    /// If changed, all associated credentials will be lost in all authenticators.
    ///
    /// When this is `None` the origin and rp id hash checks are skipped. Only
    /// do that in tests.
    fn get_relying_party_id(&self) -> Option<&str>;

    /// Get the list of valid credential algorithms that this service can accept.
    fn get_credential_algorithms(&self) -> Vec<COSEAlgorithm> {
        vec![
            COSEAlgorithm::ES256,
            COSEAlgorithm::ES384,
            COSEAlgorithm::ES512,
        ]
    }

    /// Return a timeout on how long the authenticator has to respond to a
    /// challenge. This value defaults to 60000 milliseconds.
    fn get_authenticator_timeout(&self) -> u32 {
        AUTHENTICATOR_TIMEOUT
    }

    /// Returns the attestation conveyance preference. Defaults to `Direct`, as
    /// a `fido-u2f` statement is required to register.
    fn get_attestation_preference(&self) -> AttestationConveyancePreference {
        AttestationConveyancePreference::Direct
    }

    /// Return a set of site-requested extensions to be sent to authenticators
    /// during registration. See <https://w3c.github.io/webauthn/#extensions>
    fn get_extensions(&self) -> Option<BTreeMap<String, serde_json::Value>> {
        None
    }

    /// The attestation trust policy. Defaults to [`AttestationTrustPolicy::Lenient`].
    fn get_trust_policy(&self) -> AttestationTrustPolicy {
        AttestationTrustPolicy::Lenient
    }

    /// If the signature counter must advance on every authentication. When
    /// `false` a counter that fails to advance is only logged. Cloned
    /// authenticators are detected by this check, so think carefully before
    /// disabling it.
    fn require_valid_counter_value(&self) -> bool {
        true
    }
}

fn identifier_is_valid(user_identifier: &str) -> bool {
    static IDENTIFIER: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    match IDENTIFIER.get_or_init(|| Regex::new(USER_IDENTIFIER_PATTERN)) {
        Ok(re) => re.is_match(user_identifier),
        Err(err) => {
            error!(?err, "user identifier pattern failed to compile");
            false
        }
    }
}

fn trace_attestation(
    source: &dyn MetadataSource,
    attestation: &Attestation,
) -> Result<AttestationTrust, WebauthnError> {
    let key_identifier = attestation.attestation_certificate.key_identifier()?;
    let record = source.metadata_for_key_identifier(&key_identifier)?;
    let roots = record.attestation_roots()?;

    if verify_attestation_ca_chain(attestation, &roots)? {
        Ok(AttestationTrust::Verified {
            key_identifier,
            description: record.statement.description,
        })
    } else {
        debug!(%key_identifier, "attestation certificate does not chain to a listed root");
        Err(WebauthnError::AttestationTrustFailure)
    }
}

/// This is the core of the relying party. It provides four interfaces:
/// * get_registration_options
/// * register
/// * get_authentication_options
/// * verify
///
/// Each of these is described in turn, but they will all map to routes in your
/// application. The manager holds no mutable state of its own; challenges and
/// credentials are kept by the storage backend, so a single manager can be
/// shared between threads.
pub struct RelyingPartyManager<T, S> {
    config: T,
    storage: S,
    metadata: Option<Box<dyn MetadataSource + Send + Sync>>,
    rp_id_hash: Option<[u8; 32]>,
}

impl<T, S> std::fmt::Debug for RelyingPartyManager<T, S>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelyingPartyManager")
            .field("config", &self.config)
            .field("metadata", &self.metadata.is_some())
            .finish()
    }
}

impl<T, S> RelyingPartyManager<T, S>
where
    T: WebauthnConfig,
    S: StorageBackend,
{
    /// Create a new relying party manager with the supplied configuration and
    /// storage backend. No metadata source is configured.
    pub fn new(config: T, storage: S) -> Self {
        let rp_id_hash = config
            .get_relying_party_id()
            .map(|rp_id| compute_sha256(rp_id.as_bytes()));
        RelyingPartyManager {
            config,
            storage,
            metadata: None,
            rp_id_hash,
        }
    }

    /// Trace attestation certificates to trusted roots with `source`.
    pub fn with_metadata_source<M>(mut self, source: M) -> Self
    where
        M: MetadataSource + Send + Sync + 'static,
    {
        self.metadata = Some(Box::new(source));
        self
    }

    /// The configuration of this relying party.
    pub fn config(&self) -> &T {
        &self.config
    }

    /// The storage backend of this relying party.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Generate the options for a new credential registration for
    /// `user_identifier`. The result is serialised and handed to
    /// `navigator.credentials.create()`.
    ///
    /// The challenge is persisted for `(user_identifier, Registration)` before
    /// this returns. `display_name` defaults to the user identifier.
    pub fn get_registration_options(
        &self,
        user_identifier: &str,
        display_name: Option<&str>,
        icon: Option<&str>,
    ) -> Result<CreationChallengeResponse, WebauthnError> {
        let challenge = Challenge::new();

        let options = PublicKeyCredentialCreationOptions {
            rp: RelyingParty {
                name: self.config.get_relying_party_name().to_string(),
                id: self.config.get_relying_party_id().map(str::to_string),
            },
            user: User {
                id: Base64UrlSafeData(user_identifier.as_bytes().to_vec()),
                name: user_identifier.to_string(),
                display_name: display_name.unwrap_or(user_identifier).to_string(),
                icon: icon.map(str::to_string),
            },
            challenge: challenge.clone().into(),
            pub_key_cred_params: self
                .config
                .get_credential_algorithms()
                .into_iter()
                .map(PubKeyCredParams::from)
                .collect(),
            timeout: self.config.get_authenticator_timeout(),
            exclude_credentials: Vec::new(),
            attestation: self.config.get_attestation_preference(),
            extensions: self.config.get_extensions(),
        };

        self.storage
            .save_challenge_for_user(user_identifier, challenge, ChallengePurpose::Registration)
            .map_err(|err| {
                error!(?err, %user_identifier, "failed to persist registration challenge");
                err
            })?;

        debug!(%user_identifier, "issued registration options");
        Ok(CreationChallengeResponse {
            public_key: options,
        })
    }

    /// Process a credential registration response from `navigator.credentials.create()`.
    ///
    /// On success the credential has been persisted for `user_identifier`.
    /// Nothing is persisted on failure.
    pub fn register(
        &self,
        client_data_json: &[u8],
        attestation_object: &[u8],
        user_identifier: &str,
    ) -> Result<RegistrationResult, WebauthnError> {
        self.register_inner(client_data_json, attestation_object, user_identifier)
            .map(|result| {
                debug!(%user_identifier, trust = ?result.trust, "registration accepted");
                result
            })
            .map_err(|err| {
                error!(?err, %user_identifier, "registration rejected");
                err
            })
    }

    /// Process the browser's JSON response to `navigator.credentials.create()`.
    pub fn register_credential(
        &self,
        reg: &RegisterPublicKeyCredential,
        user_identifier: &str,
    ) -> Result<RegistrationResult, WebauthnError> {
        self.register(
            reg.response.client_data_json.as_ref(),
            reg.response.attestation_object.as_ref(),
            user_identifier,
        )
    }

    fn register_inner(
        &self,
        client_data_json: &[u8],
        attestation_object: &[u8],
        user_identifier: &str,
    ) -> Result<RegistrationResult, WebauthnError> {
        // Perform CBOR decoding on the attestationObject field to obtain the attestation
        // statement format fmt, the authenticator data authData, and the attestation
        // statement attStmt.
        let attestation_object = AttestationObject::try_from(attestation_object)?;

        if !identifier_is_valid(user_identifier) {
            return Err(WebauthnError::InvalidIdentifier);
        }

        // Compute the hash of response.clientDataJSON using SHA-256.
        let client_data_hash = compute_sha256(client_data_json);

        // Let C, the client data claimed as collected during the credential creation, be the
        // result of running an implementation-specific JSON parser on JSONtext.
        let client_data = CollectedClientData::try_from(client_data_json)?;

        // Verify that the value of C.type is webauthn.create.
        if client_data.type_ != CLIENT_DATA_TYPE_CREATE {
            debug!(type_ = %client_data.type_, "unexpected client data type");
            return Err(WebauthnError::ProtocolViolation);
        }

        // Verify that the value of C.challenge matches the challenge that was sent to the
        // authenticator in the create() call.
        let challenge = self
            .storage
            .get_challenge_for_user(user_identifier, ChallengePurpose::Registration)?;
        if client_data.challenge.as_ref() != challenge.as_ref() {
            return Err(WebauthnError::ChallengeMismatch);
        }

        // Verify that the value of C.origin matches the Relying Party's origin.
        self.verify_origin(&client_data.origin)?;

        let auth_data = attestation_object.auth_data()?;
        self.verify_auth_data(&auth_data)?;

        // Determine the attestation statement format by performing a USASCII case-sensitive
        // match on fmt against the set of supported WebAuthn Attestation Statement Format
        // Identifier values.
        let statement =
            AttestationStatement::try_from_format(&attestation_object.fmt, &attestation_object.att_stmt)?;

        // Verify that attStmt is a correct attestation statement, conveying a valid attestation
        // signature, by using the attestation statement format fmt’s verification procedure
        // given attStmt, authData and the hash of the serialized client data.
        let attestation = statement.validate(&auth_data, &auth_data.rp_id_hash, &client_data_hash)?;

        // Assess the attestation trustworthiness using the outputs of the verification procedure.
        let trust = self.assess_trust(&attestation)?;

        self.storage
            .save_credential_for_user(user_identifier, attestation.credential.clone())?;

        Ok(RegistrationResult {
            credential: attestation.credential,
            trust,
        })
    }

    /// Generate the options for authenticating `user_identifier` with their
    /// registered credential. The result is serialised and handed to
    /// `navigator.credentials.get()`.
    pub fn get_authentication_options(
        &self,
        user_identifier: &str,
    ) -> Result<RequestChallengeResponse, WebauthnError> {
        let credential = self
            .storage
            .get_credential_by_identifier(user_identifier)
            .map_err(|err| {
                error!(?err, %user_identifier, "no credential to authenticate with");
                err
            })?;

        let challenge = Challenge::new();
        let options = PublicKeyCredentialRequestOptions {
            challenge: challenge.clone().into(),
            timeout: self.config.get_authenticator_timeout(),
            rp_id: self.config.get_relying_party_id().map(str::to_string),
            allow_credentials: vec![PublicKeyCredentialDescriptor::from(&credential)],
        };

        self.storage
            .save_challenge_for_user(user_identifier, challenge, ChallengePurpose::Authentication)
            .map_err(|err| {
                error!(?err, %user_identifier, "failed to persist authentication challenge");
                err
            })?;

        debug!(%user_identifier, "issued authentication options");
        Ok(RequestChallengeResponse {
            public_key: options,
        })
    }

    /// Verify an assertion response from `navigator.credentials.get()`.
    ///
    /// On success the credential's signature counter has been updated.
    pub fn verify(
        &self,
        authenticator_data: &[u8],
        client_data_json: &[u8],
        signature: &[u8],
        user_handle: Option<&[u8]>,
        raw_credential_id: &[u8],
        user_identifier: &str,
    ) -> Result<AuthenticationResult, WebauthnError> {
        self.verify_inner(
            authenticator_data,
            client_data_json,
            signature,
            user_handle,
            raw_credential_id,
            user_identifier,
        )
        .map(|result| {
            debug!(%user_identifier, counter = result.counter, "authentication accepted");
            result
        })
        .map_err(|err| {
            error!(?err, %user_identifier, "authentication rejected");
            err
        })
    }

    /// Verify the browser's JSON response to `navigator.credentials.get()`.
    pub fn authenticate_credential(
        &self,
        rsp: &PublicKeyCredential,
        user_identifier: &str,
    ) -> Result<AuthenticationResult, WebauthnError> {
        self.verify(
            rsp.response.authenticator_data.as_ref(),
            rsp.response.client_data_json.as_ref(),
            rsp.response.signature.as_ref(),
            rsp.response.user_handle.as_ref().map(|uh| uh.as_ref()),
            rsp.raw_id.as_ref(),
            user_identifier,
        )
    }

    fn verify_inner(
        &self,
        authenticator_data: &[u8],
        client_data_json: &[u8],
        signature: &[u8],
        user_handle: Option<&[u8]>,
        raw_credential_id: &[u8],
        user_identifier: &str,
    ) -> Result<AuthenticationResult, WebauthnError> {
        if !identifier_is_valid(user_identifier) {
            return Err(WebauthnError::InvalidIdentifier);
        }

        // Let hash be the result of computing a hash over the cData using SHA-256.
        let client_data_hash = compute_sha256(client_data_json);

        // Let C, the client data claimed as used for the signature, be the result of running an
        // implementation-specific JSON parser on JSONtext.
        let client_data = CollectedClientData::try_from(client_data_json)?;

        // Verify that the value of C.type is the string webauthn.get.
        if client_data.type_ != CLIENT_DATA_TYPE_GET {
            debug!(type_ = %client_data.type_, "unexpected client data type");
            return Err(WebauthnError::ProtocolViolation);
        }

        // Verify that the value of C.challenge matches the challenge that was sent to the
        // authenticator in the PublicKeyCredentialRequestOptions passed to the get() call.
        let challenge = self
            .storage
            .get_challenge_for_user(user_identifier, ChallengePurpose::Authentication)?;
        if client_data.challenge.as_ref() != challenge.as_ref() {
            return Err(WebauthnError::ChallengeMismatch);
        }

        // Verify that the value of C.origin matches the Relying Party's origin.
        self.verify_origin(&client_data.origin)?;

        let auth_data = AuthenticatorData::try_from(authenticator_data)?;
        self.verify_auth_data(&auth_data)?;

        // Identify the user being authenticated and verify that this user is the owner of the
        // public key credential source credentialSource identified by credential.id.
        let credential = self.storage.get_credential_by_identifier(user_identifier)?;
        if credential.cred_id.as_ref() != raw_credential_id {
            return Err(WebauthnError::CredentialIdMismatch);
        }

        if let Some(user_handle) = user_handle.filter(|uh| !uh.is_empty()) {
            if user_handle != user_identifier.as_bytes() {
                return Err(WebauthnError::UserHandleMismatch);
            }
        }

        // Using the credential public key, verify that sig is a valid signature over the binary
        // concatenation of authData and hash.
        // Note: This verification step is compatible with signatures generated by FIDO U2F
        // authenticators. See §6.1.2 FIDO U2F Signature Format Compatibility.
        let verification_data: Vec<u8> = authenticator_data
            .iter()
            .chain(client_data_hash.iter())
            .copied()
            .collect();

        if !credential.cred.verify_signature(signature, &verification_data)? {
            return Err(WebauthnError::AssertionSignatureInvalid);
        }

        // If authData.signCount is nonzero or the stored signCount is nonzero, then the
        // authData.signCount must be greater than the stored signCount.
        let counter = auth_data.counter;
        if (counter != 0 || credential.counter != 0) && counter <= credential.counter {
            if self.config.require_valid_counter_value() {
                debug!(counter, stored = credential.counter, "signature counter did not advance");
                return Err(WebauthnError::CounterRegression);
            }
            warn!(
                counter,
                stored = credential.counter,
                %user_identifier,
                "signature counter did not advance, the authenticator may be cloned"
            );
        }

        self.storage
            .update_credential_counter(user_identifier, credential.cred_id.as_ref(), counter)?;

        Ok(AuthenticationResult {
            cred_id: credential.cred_id,
            counter,
            user_verified: auth_data.user_verified(),
        })
    }

    // The origin must be a https url on exactly the rp id.
    fn verify_origin(&self, origin: &str) -> Result<(), WebauthnError> {
        let Some(rp_id) = self.config.get_relying_party_id() else {
            return Ok(());
        };

        let url = Url::parse(origin).map_err(|err| {
            debug!(?err, %origin, "client origin is not a url");
            WebauthnError::OriginMismatch
        })?;

        // Url lowercases the host, a configured rp id may not be.
        let host_matches = url
            .host_str()
            .map_or(false, |host| host.eq_ignore_ascii_case(rp_id));
        if url.scheme() != "https" || !host_matches {
            debug!(%origin, %rp_id, "client origin does not match rp id");
            return Err(WebauthnError::OriginMismatch);
        }
        Ok(())
    }

    fn verify_auth_data(&self, auth_data: &AuthenticatorData) -> Result<(), WebauthnError> {
        // Verify that the rpIdHash in authData is the SHA-256 hash of the RP ID expected by the
        // Relying Party.
        if let Some(rp_id_hash) = self.rp_id_hash.as_ref() {
            if &auth_data.rp_id_hash != rp_id_hash {
                return Err(WebauthnError::RpIdHashMismatch);
            }
        }

        // Verify that the User Present bit of the flags in authData is set.
        if !auth_data.user_present() {
            return Err(WebauthnError::UserNotPresent);
        }
        Ok(())
    }

    fn assess_trust(&self, attestation: &Attestation) -> Result<AttestationTrust, WebauthnError> {
        let traced = match self.metadata.as_deref() {
            Some(source) => trace_attestation(source, attestation),
            None => Err(WebauthnError::MetadataUnavailable(
                "no metadata source is configured".to_string(),
            )),
        };

        match (traced, self.config.get_trust_policy()) {
            (Ok(trust), _) => Ok(trust),
            (Err(err), AttestationTrustPolicy::Lenient) => {
                warn!(?err, "attestation is not traceable to a trusted root, accepting as unverified");
                Ok(AttestationTrust::Unverified)
            }
            (Err(err), AttestationTrustPolicy::Strict) => {
                debug!(?err, "attestation is not traceable to a trusted root");
                Err(WebauthnError::AttestationTrustFailure)
            }
        }
    }
}
