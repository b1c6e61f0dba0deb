mod common;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use common::{
    client_data, signed_metadata_blob, SoftU2F, FLAG_ATTESTED_CREDENTIAL_DATA, FLAG_USER_PRESENT,
};
use std::convert::TryFrom;

use webauthn_rp_core::crypto::X509PublicKey;
use webauthn_rp_core::ephemeral::{EphemeralStorage, WebauthnEphemeralConfig};
use webauthn_rp_core::proto::{
    AttestationTrust, AuthenticationResult, PublicKeyCredential, RegisterPublicKeyCredential,
    RegistrationResult,
};
use webauthn_rp_core::{
    AttestationTrustPolicy, FidoMetadataClient, MdsTransport, RelyingPartyManager,
    StorageBackend, WebauthnError,
};

const RP_ID: &str = "example.com";
const ORIGIN: &str = "https://example.com";
const USER: &str = "alice@example.com";
const REG_FLAGS: u8 = FLAG_USER_PRESENT | FLAG_ATTESTED_CREDENTIAL_DATA;

type Manager = RelyingPartyManager<WebauthnEphemeralConfig, EphemeralStorage>;

fn manager(config: WebauthnEphemeralConfig) -> Manager {
    let _ = tracing_subscriber::fmt::try_init();
    RelyingPartyManager::new(config, EphemeralStorage::new())
}

fn register(rp: &Manager, token: &SoftU2F) -> Result<RegistrationResult, WebauthnError> {
    let options = rp.get_registration_options(USER, None, None).unwrap();
    let cdj = client_data("webauthn.create", options.public_key.challenge.as_ref(), ORIGIN);
    let attestation_object = token.register(RP_ID, &cdj, REG_FLAGS);
    rp.register(&cdj, &attestation_object, USER)
}

fn authenticate(
    rp: &Manager,
    token: &mut SoftU2F,
    tamper: impl FnOnce(&mut Vec<u8>),
) -> Result<AuthenticationResult, WebauthnError> {
    let options = rp.get_authentication_options(USER).unwrap();
    let cdj = client_data("webauthn.get", options.public_key.challenge.as_ref(), ORIGIN);
    let (auth_data, mut signature) = token.assert(RP_ID, &cdj, FLAG_USER_PRESENT);
    tamper(&mut signature);
    rp.verify(&auth_data, &cdj, &signature, None, &token.cred_id, USER)
}

struct StaticTransport(String);

impl MdsTransport for StaticTransport {
    fn fetch_blob(&self) -> Result<String, WebauthnError> {
        Ok(self.0.clone())
    }
}

fn metadata_client(
    token: &SoftU2F,
    listed_roots: Vec<String>,
) -> FidoMetadataClient<StaticTransport> {
    let key_id = X509PublicKey::try_from(token.att_cert.to_der().unwrap().as_slice())
        .unwrap()
        .key_identifier()
        .unwrap();

    let payload = serde_json::json!({
        "no": 1,
        "nextUpdate": "2030-01-01",
        "entries": [{
            "attestationCertificateKeyIdentifiers": [key_id],
            "metadataStatement": {
                "description": "Soft U2F",
                "attestationRootCertificates": listed_roots,
            },
            "statusReports": [{"status": "FIDO_CERTIFIED"}],
        }],
    });
    let (blob, mds_root) = signed_metadata_blob(&payload);
    FidoMetadataClient::new(StaticTransport(blob)).with_trust_root(mds_root)
}

#[test]
fn test_u2f_register_then_authenticate() {
    let rp = manager(WebauthnEphemeralConfig::new("Example", Some(RP_ID)));
    let mut token = SoftU2F::new();

    let reg = register(&rp, &token).unwrap();
    assert_eq!(reg.trust, AttestationTrust::Unverified);
    assert_eq!(reg.credential.cred_id.as_ref(), token.cred_id.as_slice());

    let auth = authenticate(&rp, &mut token, |_| {}).unwrap();
    assert_eq!(auth.counter, 1);
    assert!(!auth.user_verified);
    assert_eq!(
        rp.storage().get_credential_by_identifier(USER).unwrap().counter,
        1
    );

    let auth = authenticate(&rp, &mut token, |_| {}).unwrap();
    assert_eq!(auth.counter, 2);

    let rejected = authenticate(&rp, &mut token, |sig| {
        if let Some(last) = sig.last_mut() {
            *last ^= 0x01;
        }
    });
    assert!(matches!(rejected, Err(WebauthnError::AssertionSignatureInvalid)));
    // A rejected assertion leaves the counter alone.
    assert_eq!(
        rp.storage().get_credential_by_identifier(USER).unwrap().counter,
        2
    );
}

#[test]
fn test_u2f_browser_json() {
    let rp = manager(WebauthnEphemeralConfig::new("Example", Some(RP_ID)));
    let mut token = SoftU2F::new();

    let options = rp.get_registration_options(USER, Some("Alice"), None).unwrap();
    let cdj = client_data("webauthn.create", options.public_key.challenge.as_ref(), ORIGIN);
    let attestation_object = token.register(RP_ID, &cdj, REG_FLAGS);

    let reg_json = serde_json::json!({
        "id": URL_SAFE_NO_PAD.encode(&token.cred_id),
        "rawId": URL_SAFE_NO_PAD.encode(&token.cred_id),
        "response": {
            "attestationObject": URL_SAFE_NO_PAD.encode(&attestation_object),
            "clientDataJSON": URL_SAFE_NO_PAD.encode(&cdj),
        },
        "type": "public-key",
    });
    let reg: RegisterPublicKeyCredential = serde_json::from_value(reg_json).unwrap();
    rp.register_credential(&reg, USER).unwrap();

    let options = rp.get_authentication_options(USER).unwrap();
    let cdj = client_data("webauthn.get", options.public_key.challenge.as_ref(), ORIGIN);
    let (auth_data, signature) = token.assert(RP_ID, &cdj, FLAG_USER_PRESENT);

    let auth_json = serde_json::json!({
        "id": URL_SAFE_NO_PAD.encode(&token.cred_id),
        "rawId": URL_SAFE_NO_PAD.encode(&token.cred_id),
        "response": {
            "authenticatorData": URL_SAFE_NO_PAD.encode(&auth_data),
            "clientDataJSON": URL_SAFE_NO_PAD.encode(&cdj),
            "signature": URL_SAFE_NO_PAD.encode(&signature),
            "userHandle": URL_SAFE_NO_PAD.encode(USER),
        },
        "type": "public-key",
    });
    let rsp: PublicKeyCredential = serde_json::from_value(auth_json).unwrap();
    let auth = rp.authenticate_credential(&rsp, USER).unwrap();
    assert_eq!(auth.counter, 1);
}

#[test]
fn test_u2f_registration_rejections() {
    let rp = manager(WebauthnEphemeralConfig::new("Example", Some(RP_ID)));
    let token = SoftU2F::new();

    // Wrong challenge.
    rp.get_registration_options(USER, None, None).unwrap();
    let cdj = client_data("webauthn.create", &[0; 32], ORIGIN);
    let ao = token.register(RP_ID, &cdj, REG_FLAGS);
    assert!(matches!(
        rp.register(&cdj, &ao, USER),
        Err(WebauthnError::ChallengeMismatch)
    ));

    // Wrong origin.
    let options = rp.get_registration_options(USER, None, None).unwrap();
    let cdj = client_data(
        "webauthn.create",
        options.public_key.challenge.as_ref(),
        "https://evil.example.com",
    );
    let ao = token.register(RP_ID, &cdj, REG_FLAGS);
    assert!(matches!(
        rp.register(&cdj, &ao, USER),
        Err(WebauthnError::OriginMismatch)
    ));

    // Plain http.
    let options = rp.get_registration_options(USER, None, None).unwrap();
    let cdj = client_data(
        "webauthn.create",
        options.public_key.challenge.as_ref(),
        "http://example.com",
    );
    let ao = token.register(RP_ID, &cdj, REG_FLAGS);
    assert!(matches!(
        rp.register(&cdj, &ao, USER),
        Err(WebauthnError::OriginMismatch)
    ));

    // Scoped to another relying party.
    let options = rp.get_registration_options(USER, None, None).unwrap();
    let cdj = client_data("webauthn.create", options.public_key.challenge.as_ref(), ORIGIN);
    let ao = token.register("other.example", &cdj, REG_FLAGS);
    assert!(matches!(
        rp.register(&cdj, &ao, USER),
        Err(WebauthnError::RpIdHashMismatch)
    ));

    // User presence not asserted.
    let options = rp.get_registration_options(USER, None, None).unwrap();
    let cdj = client_data("webauthn.create", options.public_key.challenge.as_ref(), ORIGIN);
    let ao = token.register(RP_ID, &cdj, FLAG_ATTESTED_CREDENTIAL_DATA);
    assert!(matches!(
        rp.register(&cdj, &ao, USER),
        Err(WebauthnError::UserNotPresent)
    ));

    // Unsupported attestation format.
    let options = rp.get_registration_options(USER, None, None).unwrap();
    let cdj = client_data("webauthn.create", options.public_key.challenge.as_ref(), ORIGIN);
    let u2f = token.register(RP_ID, &cdj, REG_FLAGS);
    let ao = {
        let v: serde_cbor_2::Value = serde_cbor_2::from_slice(&u2f).unwrap();
        let serde_cbor_2::Value::Map(mut m) = v else {
            unreachable!()
        };
        m.insert(
            serde_cbor_2::Value::Text("fmt".to_string()),
            serde_cbor_2::Value::Text("packed".to_string()),
        );
        serde_cbor_2::to_vec(&serde_cbor_2::Value::Map(m)).unwrap()
    };
    assert!(matches!(
        rp.register(&cdj, &ao, USER),
        Err(WebauthnError::UnsupportedAttestationFormat(fmt)) if fmt == "packed"
    ));

    // Nothing was ever persisted.
    assert!(matches!(
        rp.storage().get_credential_by_identifier(USER),
        Err(WebauthnError::CredentialNotFound)
    ));
}

#[test]
fn test_u2f_authentication_rejections() {
    let rp = manager(WebauthnEphemeralConfig::new("Example", Some(RP_ID)));
    let mut token = SoftU2F::new();
    register(&rp, &token).unwrap();
    authenticate(&rp, &mut token, |_| {}).unwrap();
    let stored_counter = || {
        rp.storage()
            .get_credential_by_identifier(USER)
            .unwrap()
            .counter
    };

    // Wrong challenge.
    rp.get_authentication_options(USER).unwrap();
    let cdj = client_data("webauthn.get", &[0; 32], ORIGIN);
    let (auth_data, signature) = token.assert(RP_ID, &cdj, FLAG_USER_PRESENT);
    assert!(matches!(
        rp.verify(&auth_data, &cdj, &signature, None, &token.cred_id, USER),
        Err(WebauthnError::ChallengeMismatch)
    ));
    assert_eq!(stored_counter(), 1);

    // An origin that only starts with the rp id.
    let options = rp.get_authentication_options(USER).unwrap();
    let cdj = client_data(
        "webauthn.get",
        options.public_key.challenge.as_ref(),
        "https://example.com.evil.net",
    );
    let (auth_data, signature) = token.assert(RP_ID, &cdj, FLAG_USER_PRESENT);
    assert!(matches!(
        rp.verify(&auth_data, &cdj, &signature, None, &token.cred_id, USER),
        Err(WebauthnError::OriginMismatch)
    ));
    assert_eq!(stored_counter(), 1);

    // User presence not asserted.
    let options = rp.get_authentication_options(USER).unwrap();
    let cdj = client_data("webauthn.get", options.public_key.challenge.as_ref(), ORIGIN);
    let (auth_data, signature) = token.assert(RP_ID, &cdj, 0);
    assert!(matches!(
        rp.verify(&auth_data, &cdj, &signature, None, &token.cred_id, USER),
        Err(WebauthnError::UserNotPresent)
    ));
    assert_eq!(stored_counter(), 1);

    // Scoped to another relying party.
    let options = rp.get_authentication_options(USER).unwrap();
    let cdj = client_data("webauthn.get", options.public_key.challenge.as_ref(), ORIGIN);
    let (auth_data, signature) = token.assert("other.example", &cdj, FLAG_USER_PRESENT);
    assert!(matches!(
        rp.verify(&auth_data, &cdj, &signature, None, &token.cred_id, USER),
        Err(WebauthnError::RpIdHashMismatch)
    ));
    assert_eq!(stored_counter(), 1);

    // Replayed counter.
    token.counter = 0;
    assert!(matches!(
        authenticate(&rp, &mut token, |_| {}),
        Err(WebauthnError::CounterRegression)
    ));
    assert_eq!(stored_counter(), 1);

    // Some other credential id.
    token.counter = 10;
    let options = rp.get_authentication_options(USER).unwrap();
    let cdj = client_data("webauthn.get", options.public_key.challenge.as_ref(), ORIGIN);
    let (auth_data, signature) = token.assert(RP_ID, &cdj, FLAG_USER_PRESENT);
    assert!(matches!(
        rp.verify(&auth_data, &cdj, &signature, None, &[0; 64], USER),
        Err(WebauthnError::CredentialIdMismatch)
    ));

    // A user handle for someone else.
    let options = rp.get_authentication_options(USER).unwrap();
    let cdj = client_data("webauthn.get", options.public_key.challenge.as_ref(), ORIGIN);
    let (auth_data, signature) = token.assert(RP_ID, &cdj, FLAG_USER_PRESENT);
    assert!(matches!(
        rp.verify(
            &auth_data,
            &cdj,
            &signature,
            Some(b"mallory@example.com"),
            &token.cred_id,
            USER
        ),
        Err(WebauthnError::UserHandleMismatch)
    ));

    // A registration response presented to the authentication ceremony.
    let options = rp.get_authentication_options(USER).unwrap();
    let cdj = client_data("webauthn.create", options.public_key.challenge.as_ref(), ORIGIN);
    let (auth_data, signature) = token.assert(RP_ID, &cdj, FLAG_USER_PRESENT);
    assert!(matches!(
        rp.verify(&auth_data, &cdj, &signature, None, &token.cred_id, USER),
        Err(WebauthnError::ProtocolViolation)
    ));
}

#[test]
fn test_u2f_counter_regression_allowed() {
    let rp = manager(WebauthnEphemeralConfig::new("Example", Some(RP_ID)).allow_counter_regression());
    let mut token = SoftU2F::new();
    register(&rp, &token).unwrap();
    authenticate(&rp, &mut token, |_| {}).unwrap();

    token.counter = 0;
    let auth = authenticate(&rp, &mut token, |_| {}).unwrap();
    assert_eq!(auth.counter, 1);
}

#[test]
fn test_u2f_strict_trust_with_metadata() {
    let strict = || {
        WebauthnEphemeralConfig::new("Example", Some(RP_ID))
            .trust_policy(AttestationTrustPolicy::Strict)
    };

    // The attestation CA is listed as a root for this key.
    let token = SoftU2F::new();
    let roots = vec![STANDARD.encode(token.ca_cert.to_der().unwrap())];
    let rp = manager(strict()).with_metadata_source(metadata_client(&token, roots));
    let reg = register(&rp, &token).unwrap();
    match reg.trust {
        AttestationTrust::Verified {
            key_identifier,
            description,
        } => {
            assert_eq!(key_identifier.len(), 40);
            assert_eq!(description.as_deref(), Some("Soft U2F"));
        }
        AttestationTrust::Unverified => panic!("expected a verified attestation"),
    }

    // Listed, but under some other root.
    let token = SoftU2F::new();
    let other = SoftU2F::new();
    let roots = vec![STANDARD.encode(other.ca_cert.to_der().unwrap())];
    let rp = manager(strict()).with_metadata_source(metadata_client(&token, roots.clone()));
    assert!(matches!(
        register(&rp, &token),
        Err(WebauthnError::AttestationTrustFailure)
    ));

    // The same under the lenient policy.
    let rp = manager(WebauthnEphemeralConfig::new("Example", Some(RP_ID)))
        .with_metadata_source(metadata_client(&token, roots));
    assert_eq!(register(&rp, &token).unwrap().trust, AttestationTrust::Unverified);

    // No metadata source at all.
    let rp = manager(strict());
    assert!(matches!(
        register(&rp, &token),
        Err(WebauthnError::AttestationTrustFailure)
    ));
}
