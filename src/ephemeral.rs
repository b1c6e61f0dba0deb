//! In-memory implementations of the relying party configuration and storage.
//!
//! Everything here is lost on service restart. It's only really useful for
//! demo-sites, testing and as a reference for implementing [`WebauthnConfig`]
//! and [`StorageBackend`] yourself.
//!
//! IMPORTANT: DO NOT USE [`EphemeralStorage`] IN PRODUCTION. Back your relying
//! party with a durable store that implements [`StorageBackend`].

use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::{AttestationTrustPolicy, WebauthnConfig};
use crate::error::WebauthnError;
use crate::proto::{Challenge, ChallengePurpose, Credential};
use crate::storage::StorageBackend;

fn default_require_valid_counter() -> bool {
    true
}

/// A simple [`WebauthnConfig`]. It can be built in code, or deserialised from
/// a configuration file:
///
/// ```
/// use webauthn_rp_core::ephemeral::WebauthnEphemeralConfig;
///
/// let config: WebauthnEphemeralConfig = serde_json::from_str(r#"{
///     "rp_name": "Example Corp",
///     "rp_id": "example.com",
///     "trust_policy": "Strict"
/// }"#).unwrap();
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct WebauthnEphemeralConfig {
    rp_name: String,
    #[serde(default)]
    rp_id: Option<String>,
    #[serde(default)]
    trust_policy: AttestationTrustPolicy,
    #[serde(default = "default_require_valid_counter")]
    require_valid_counter: bool,
    #[serde(default)]
    extensions: Option<BTreeMap<String, serde_json::Value>>,
}

impl WebauthnEphemeralConfig {
    /// Create a new configuration. Without an `rp_id` the origin and rp id hash
    /// checks are skipped, which is only suitable for tests.
    pub fn new(rp_name: &str, rp_id: Option<&str>) -> Self {
        WebauthnEphemeralConfig {
            rp_name: rp_name.to_string(),
            rp_id: rp_id.map(str::to_string),
            trust_policy: AttestationTrustPolicy::default(),
            require_valid_counter: true,
            extensions: None,
        }
    }

    /// Set the attestation trust policy.
    pub fn trust_policy(mut self, policy: AttestationTrustPolicy) -> Self {
        self.trust_policy = policy;
        self
    }

    /// Allow authenticators whose counter does not advance. A regression is
    /// then only logged.
    pub fn allow_counter_regression(mut self) -> Self {
        self.require_valid_counter = false;
        self
    }

    /// Set the extensions requested in registration options.
    pub fn extensions(mut self, extensions: BTreeMap<String, serde_json::Value>) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

impl WebauthnConfig for WebauthnEphemeralConfig {
    fn get_relying_party_name(&self) -> &str {
        &self.rp_name
    }

    fn get_relying_party_id(&self) -> Option<&str> {
        self.rp_id.as_deref()
    }

    fn get_extensions(&self) -> Option<BTreeMap<String, serde_json::Value>> {
        self.extensions.clone()
    }

    fn get_trust_policy(&self) -> AttestationTrustPolicy {
        self.trust_policy
    }

    fn require_valid_counter_value(&self) -> bool {
        self.require_valid_counter
    }
}

/// An in-memory [`StorageBackend`]. Each user holds one credential, and at most
/// one outstanding challenge per ceremony. Reading a challenge removes it.
#[derive(Debug, Default)]
pub struct EphemeralStorage {
    challenges: Mutex<BTreeMap<(String, ChallengePurpose), Challenge>>,
    credentials: Mutex<BTreeMap<String, Credential>>,
}

fn lock<V>(m: &Mutex<V>) -> Result<MutexGuard<'_, V>, WebauthnError> {
    m.lock().map_err(|e| {
        error!(err = %e, "ephemeral storage lock poisoned");
        WebauthnError::Storage(e.to_string())
    })
}

impl EphemeralStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for EphemeralStorage {
    fn save_challenge_for_user(
        &self,
        user_identifier: &str,
        challenge: Challenge,
        purpose: ChallengePurpose,
    ) -> Result<(), WebauthnError> {
        lock(&self.challenges)?.insert((user_identifier.to_string(), purpose), challenge);
        Ok(())
    }

    fn get_challenge_for_user(
        &self,
        user_identifier: &str,
        purpose: ChallengePurpose,
    ) -> Result<Challenge, WebauthnError> {
        lock(&self.challenges)?
            .remove(&(user_identifier.to_string(), purpose))
            .ok_or(WebauthnError::ChallengeNotFound)
    }

    fn save_credential_for_user(
        &self,
        user_identifier: &str,
        credential: Credential,
    ) -> Result<(), WebauthnError> {
        lock(&self.credentials)?.insert(user_identifier.to_string(), credential);
        Ok(())
    }

    fn get_credential_by_identifier(
        &self,
        user_identifier: &str,
    ) -> Result<Credential, WebauthnError> {
        lock(&self.credentials)?
            .get(user_identifier)
            .cloned()
            .ok_or(WebauthnError::CredentialNotFound)
    }

    fn update_credential_counter(
        &self,
        user_identifier: &str,
        cred_id: &[u8],
        counter: u32,
    ) -> Result<(), WebauthnError> {
        let mut credentials = lock(&self.credentials)?;
        match credentials.get_mut(user_identifier) {
            Some(cred) if cred.cred_id.as_ref() == cred_id => {
                cred.counter = counter;
                Ok(())
            }
            Some(_) => Err(WebauthnError::CredentialIdMismatch),
            None => Err(WebauthnError::CredentialNotFound),
        }
    }
}
