//! The persistence contract the relying party manager depends on.
//!
//! Challenges and credentials live outside of this crate. An implementation of
//! [`StorageBackend`] must make a saved challenge or credential immediately
//! retrievable, create a user's credential atomically, and hand out a given
//! challenge at most once.

use crate::error::WebauthnError;
use crate::proto::{Challenge, ChallengePurpose, Credential};

/// Storage for in-flight challenges and registered credentials, keyed by the
/// user identifier. Methods take `&self` so that a single backend can be shared
/// between threads serving concurrent ceremonies.
pub trait StorageBackend {
    /// Persist `challenge` for `(user_identifier, purpose)`, replacing any
    /// challenge previously issued for that pair.
    fn save_challenge_for_user(
        &self,
        user_identifier: &str,
        challenge: Challenge,
        purpose: ChallengePurpose,
    ) -> Result<(), WebauthnError>;

    /// Retrieve the challenge issued for `(user_identifier, purpose)`. Returns
    /// [`WebauthnError::ChallengeNotFound`] if none is outstanding.
    fn get_challenge_for_user(
        &self,
        user_identifier: &str,
        purpose: ChallengePurpose,
    ) -> Result<Challenge, WebauthnError>;

    /// Persist the credential of a completed registration.
    fn save_credential_for_user(
        &self,
        user_identifier: &str,
        credential: Credential,
    ) -> Result<(), WebauthnError>;

    /// Retrieve the registered credential. Returns
    /// [`WebauthnError::CredentialNotFound`] if the user has none.
    fn get_credential_by_identifier(&self, user_identifier: &str)
        -> Result<Credential, WebauthnError>;

    /// Record the signature counter seen in a successful authentication.
    fn update_credential_counter(
        &self,
        user_identifier: &str,
        cred_id: &[u8],
        counter: u32,
    ) -> Result<(), WebauthnError>;
}
