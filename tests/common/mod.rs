#![allow(dead_code)]

//! A software FIDO U2F authenticator, for driving whole ceremonies in tests.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509NameBuilder, X509};
use openssl::{asn1, bn, ec, ecdsa, hash, nid, pkey, sha, sign};
use serde_cbor_2::Value;
use std::collections::BTreeMap;

pub const FLAG_USER_PRESENT: u8 = 0x01;
pub const FLAG_ATTESTED_CREDENTIAL_DATA: u8 = 0x40;

fn p256_key() -> pkey::PKey<pkey::Private> {
    let group = ec::EcGroup::from_curve_name(nid::Nid::X9_62_PRIME256V1).unwrap();
    pkey::PKey::from_ec_key(ec::EcKey::generate(&group).unwrap()).unwrap()
}

fn name(cn: &str) -> openssl::x509::X509Name {
    let mut x509_name = X509NameBuilder::new().unwrap();
    x509_name.append_entry_by_text("C", "AU").unwrap();
    x509_name.append_entry_by_text("O", "Webauthn RP Core").unwrap();
    x509_name.append_entry_by_text("CN", cn).unwrap();
    x509_name.build()
}

fn build_cert(
    subject_key: &pkey::PKey<pkey::Private>,
    cn: &str,
    issuer: Option<(&pkey::PKey<pkey::Private>, &X509)>,
    serial: u32,
) -> X509 {
    let mut cert_builder = X509::builder().unwrap();
    // Yes, 2 actually means 3 here ...
    cert_builder.set_version(2).unwrap();
    let serial_number = bn::BigNum::from_u32(serial)
        .and_then(|serial| serial.to_asn1_integer())
        .unwrap();
    cert_builder.set_serial_number(&serial_number).unwrap();

    let subject = name(cn);
    cert_builder.set_subject_name(&subject).unwrap();
    match issuer {
        Some((_, ca_cert)) => cert_builder.set_issuer_name(ca_cert.subject_name()).unwrap(),
        None => cert_builder.set_issuer_name(&subject).unwrap(),
    }

    cert_builder
        .set_not_before(&asn1::Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    cert_builder
        .set_not_after(&asn1::Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    cert_builder.set_pubkey(subject_key).unwrap();

    if issuer.is_none() {
        cert_builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        cert_builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()
                    .unwrap(),
            )
            .unwrap();
    } else {
        cert_builder
            .append_extension(BasicConstraints::new().build().unwrap())
            .unwrap();
    }

    let subject_key_identifier = SubjectKeyIdentifier::new()
        .build(&cert_builder.x509v3_context(issuer.map(|(_, c)| &**c), None))
        .unwrap();
    cert_builder.append_extension(subject_key_identifier).unwrap();

    let signing_key = issuer.map(|(k, _)| k).unwrap_or(subject_key);
    cert_builder
        .sign(signing_key, hash::MessageDigest::sha256())
        .unwrap();
    cert_builder.build()
}

fn sign_sha256(key: &pkey::PKey<pkey::Private>, data: &[u8]) -> Vec<u8> {
    let mut signer = sign::Signer::new(hash::MessageDigest::sha256(), key).unwrap();
    signer.update(data).unwrap();
    signer.sign_to_vec().unwrap()
}

/// Build the client data json a browser would produce.
pub fn client_data(type_: &str, challenge: &[u8], origin: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "type": type_,
        "challenge": URL_SAFE_NO_PAD.encode(challenge),
        "origin": origin,
        "crossOrigin": false,
    }))
    .unwrap()
}

pub struct SoftU2F {
    pub ca_key: pkey::PKey<pkey::Private>,
    pub ca_cert: X509,
    att_key: pkey::PKey<pkey::Private>,
    pub att_cert: X509,
    cred_key: pkey::PKey<pkey::Private>,
    pub cred_id: Vec<u8>,
    pub counter: u32,
}

impl SoftU2F {
    pub fn new() -> Self {
        let ca_key = p256_key();
        let ca_cert = build_cert(&ca_key, "Soft U2F Root CA", None, 1);
        let att_key = p256_key();
        let att_cert = build_cert(&att_key, "Soft U2F Attestation", Some((&ca_key, &ca_cert)), 2);

        let mut cred_id = vec![0; 64];
        openssl::rand::rand_bytes(&mut cred_id).unwrap();

        SoftU2F {
            ca_key,
            ca_cert,
            att_key,
            att_cert,
            cred_key: p256_key(),
            cred_id,
            counter: 0,
        }
    }

    fn public_point(&self) -> (Vec<u8>, Vec<u8>) {
        let ec_key = self.cred_key.ec_key().unwrap();
        let mut ctx = bn::BigNumContext::new().unwrap();
        let mut x = bn::BigNum::new().unwrap();
        let mut y = bn::BigNum::new().unwrap();
        ec_key
            .public_key()
            .affine_coordinates_gfp(ec_key.group(), &mut x, &mut y, &mut ctx)
            .unwrap();
        (x.to_vec_padded(32).unwrap(), y.to_vec_padded(32).unwrap())
    }

    pub fn cose_key(&self) -> Vec<u8> {
        let (x, y) = self.public_point();
        let mut m = BTreeMap::new();
        m.insert(Value::Integer(1), Value::Integer(2));
        m.insert(Value::Integer(3), Value::Integer(-7));
        m.insert(Value::Integer(-1), Value::Integer(1));
        m.insert(Value::Integer(-2), Value::Bytes(x));
        m.insert(Value::Integer(-3), Value::Bytes(y));
        serde_cbor_2::to_vec(&Value::Map(m)).unwrap()
    }

    /// Respond to `navigator.credentials.create()` with a fido-u2f attestation object.
    pub fn register(&self, rp_id: &str, client_data_json: &[u8], flags: u8) -> Vec<u8> {
        let rp_id_hash = sha::sha256(rp_id.as_bytes());
        let client_data_hash = sha::sha256(client_data_json);
        let (x, y) = self.public_point();

        let mut auth_data = Vec::new();
        auth_data.extend_from_slice(&rp_id_hash);
        auth_data.push(flags);
        auth_data.extend_from_slice(&self.counter.to_be_bytes());
        auth_data.extend_from_slice(&[0; 16]);
        auth_data.extend_from_slice(&(self.cred_id.len() as u16).to_be_bytes());
        auth_data.extend_from_slice(&self.cred_id);
        auth_data.extend_from_slice(&self.cose_key());

        let mut verification_data = vec![0x00];
        verification_data.extend_from_slice(&rp_id_hash);
        verification_data.extend_from_slice(&client_data_hash);
        verification_data.extend_from_slice(&self.cred_id);
        verification_data.push(0x04);
        verification_data.extend_from_slice(&x);
        verification_data.extend_from_slice(&y);
        let sig = sign_sha256(&self.att_key, &verification_data);

        self.attestation_object("fido-u2f", sig, auth_data)
    }

    pub fn attestation_object(&self, fmt: &str, sig: Vec<u8>, auth_data: Vec<u8>) -> Vec<u8> {
        let mut att_stmt = BTreeMap::new();
        att_stmt.insert(Value::Text("sig".to_string()), Value::Bytes(sig));
        att_stmt.insert(
            Value::Text("x5c".to_string()),
            Value::Array(vec![Value::Bytes(self.att_cert.to_der().unwrap())]),
        );

        let mut m = BTreeMap::new();
        m.insert(Value::Text("fmt".to_string()), Value::Text(fmt.to_string()));
        m.insert(Value::Text("attStmt".to_string()), Value::Map(att_stmt));
        m.insert(Value::Text("authData".to_string()), Value::Bytes(auth_data));
        serde_cbor_2::to_vec(&Value::Map(m)).unwrap()
    }

    /// Respond to `navigator.credentials.get()`. Returns the authenticator data
    /// and the signature. The counter advances on each call.
    pub fn assert(&mut self, rp_id: &str, client_data_json: &[u8], flags: u8) -> (Vec<u8>, Vec<u8>) {
        self.counter += 1;

        let mut auth_data = Vec::new();
        auth_data.extend_from_slice(&sha::sha256(rp_id.as_bytes()));
        auth_data.push(flags);
        auth_data.extend_from_slice(&self.counter.to_be_bytes());

        let mut verification_data = auth_data.clone();
        verification_data.extend_from_slice(&sha::sha256(client_data_json));
        let signature = sign_sha256(&self.cred_key, &verification_data);

        (auth_data, signature)
    }
}

/// Sign a metadata BLOB payload as a compact ES256 JWS. The signer certificate
/// is issued by the returned root.
pub fn signed_metadata_blob(payload: &serde_json::Value) -> (String, X509) {
    let root_key = p256_key();
    let root_cert = build_cert(&root_key, "Soft MDS Root", None, 10);
    let signer_key = p256_key();
    let signer_cert = build_cert(&signer_key, "Soft MDS Signer", Some((&root_key, &root_cert)), 11);

    let header = serde_json::json!({
        "alg": "ES256",
        "typ": "JWT",
        "x5c": [STANDARD.encode(signer_cert.to_der().unwrap())],
    });
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap());

    let der = sign_sha256(&signer_key, format!("{header_b64}.{payload_b64}").as_bytes());
    let ecsig = ecdsa::EcdsaSig::from_der(&der).unwrap();
    let mut raw = ecsig.r().to_vec_padded(32).unwrap();
    raw.extend(ecsig.s().to_vec_padded(32).unwrap());

    (
        format!("{header_b64}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(raw)),
        root_cert,
    )
}
