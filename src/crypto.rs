//! Cryptographic operation wrapper for Webauthn. This module exists to
//! allow ease of auditing, safe operation wrappers for the webauthn library,
//! and cryptographic provider abstraction. This module currently uses OpenSSL
//! as the cryptographic primitive provider.

#![allow(non_camel_case_types)]

use openssl::{bn, ec, hash, nid, pkey, sha, sign, stack, x509};
use serde::{Deserialize, Serialize};
use serde_cbor_2::Value;
use std::collections::BTreeMap;
use std::convert::TryFrom;

use crate::base64_data::Base64UrlSafeData;
use crate::error::WebauthnError;

/// An X509PublicKey. This is what is otherwise known as a public certificate
/// which comprises a public key and other signed metadata related to the issuer
/// of the key.
pub struct X509PublicKey {
    pub(crate) pubk: x509::X509,
}

impl std::fmt::Debug for X509PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "X509PublicKey")
    }
}

impl TryFrom<&[u8]> for X509PublicKey {
    type Error = WebauthnError;

    // Must be DER bytes. If you have PEM, base64decode first!
    fn try_from(d: &[u8]) -> Result<Self, Self::Error> {
        let pubk = x509::X509::from_der(d)?;
        Ok(X509PublicKey { pubk })
    }
}

impl X509PublicKey {
    /// The DER form of this certificate.
    pub fn to_der(&self) -> Result<Vec<u8>, WebauthnError> {
        self.pubk.to_der().map_err(WebauthnError::OpenSSLError)
    }

    pub(crate) fn is_secp256r1(&self) -> Result<bool, WebauthnError> {
        let pk = self.pubk.public_key()?;
        let Ok(ec_key) = pk.ec_key() else {
            return Ok(false);
        };
        ec_key.check_key()?;

        Ok(ec_key.group().curve_name() == Some(nid::Nid::X9_62_PRIME256V1))
    }

    /// Verify a DER ECDSA signature made with SHA-256 by this certificate's key.
    /// A signature that is not valid DER is reported as not verifying.
    pub(crate) fn verify_signature(
        &self,
        signature: &[u8],
        verification_data: &[u8],
    ) -> Result<bool, WebauthnError> {
        let pkey = self.pubk.public_key()?;

        let mut verifier = sign::Verifier::new(hash::MessageDigest::sha256(), &pkey)?;
        verifier.update(verification_data)?;
        Ok(verifier
            .verify(signature)
            .map_err(|err| {
                debug!(?err, "x509 signature could not be processed");
            })
            .unwrap_or(false))
    }

    /// The key identifier of this certificate as used by the FIDO metadata
    /// service: the lowercase hex SHA-1 of the subjectPublicKey bit string
    /// (RFC 5280 4.2.1.2 method 1).
    pub fn key_identifier(&self) -> Result<String, WebauthnError> {
        let pk = self.pubk.public_key()?;

        let subject_public_key = match pk.id() {
            pkey::Id::EC => {
                let ec_key = pk.ec_key()?;
                let mut ctx = bn::BigNumContext::new()?;
                ec_key.public_key().to_bytes(
                    ec_key.group(),
                    ec::PointConversionForm::UNCOMPRESSED,
                    &mut ctx,
                )?
            }
            pkey::Id::RSA => pk.rsa()?.public_key_to_der_pkcs1()?,
            _ => {
                return Err(WebauthnError::MalformedAttestation(
                    "unsupported attestation certificate key type",
                ))
            }
        };

        Ok(hex::encode(sha::sha1(&subject_public_key)))
    }

    /// Validate this certificate up to one of `roots`, through the optional
    /// `intermediates`. Returns `Ok(false)` if no path to a root exists.
    pub(crate) fn verify_chain(
        &self,
        intermediates: &[x509::X509],
        roots: &[x509::X509],
    ) -> Result<bool, WebauthnError> {
        verify_certificate_chain(&self.pubk, intermediates, roots)
    }
}

/// Validate `leaf` to one of `roots` with OpenSSL's path building.
pub(crate) fn verify_certificate_chain(
    leaf: &x509::X509Ref,
    intermediates: &[x509::X509],
    roots: &[x509::X509],
) -> Result<bool, WebauthnError> {
    if roots.is_empty() {
        return Ok(false);
    }

    let mut ca_store = x509::store::X509StoreBuilder::new()?;
    for root in roots {
        ca_store.add_cert(root.clone())?;
    }
    let ca_store = ca_store.build();

    let mut chain = stack::Stack::new()?;
    for crt in intermediates {
        chain.push(crt.clone())?;
    }

    let mut ca_ctx = x509::X509StoreContext::new()?;
    ca_ctx
        .init(&ca_store, leaf, &chain, |ca_ctx_ref| {
            let valid = ca_ctx_ref.verify_cert()?;
            if !valid {
                debug!(err = ?ca_ctx_ref.error(), "certificate chain did not verify");
            }
            Ok(valid)
        })
        .map_err(WebauthnError::OpenSSLError)
}

/// An ECDSACurve identifier. You probabably will never need to alter
/// or use this value, as it is set inside the Credential for you.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ECDSACurve {
    // +---------+-------+----------+------------------------------------+
    // | Name    | Value | Key Type | Description                        |
    // +---------+-------+----------+------------------------------------+
    // | P-256   | 1     | EC2      | NIST P-256 also known as secp256r1 |
    // | P-384   | 2     | EC2      | NIST P-384 also known as secp384r1 |
    // | P-521   | 3     | EC2      | NIST P-521 also known as secp521r1 |
    // +---------+-------+----------+------------------------------------+
    /// Identifies this curve as SECP256R1 (X9_62_PRIME256V1 in OpenSSL)
    SECP256R1 = 1,
    /// Identifies this curve as SECP384R1
    SECP384R1 = 2,
    /// Identifies this curve as SECP521R1
    SECP521R1 = 3,
}

impl TryFrom<i128> for ECDSACurve {
    type Error = WebauthnError;
    fn try_from(u: i128) -> Result<Self, Self::Error> {
        match u {
            1 => Ok(ECDSACurve::SECP256R1),
            2 => Ok(ECDSACurve::SECP384R1),
            3 => Ok(ECDSACurve::SECP521R1),
            _ => Err(WebauthnError::COSEKeyInvalid("unsupported ec2 curve")),
        }
    }
}

impl From<ECDSACurve> for i128 {
    fn from(c: ECDSACurve) -> Self {
        c as i128
    }
}

impl ECDSACurve {
    fn to_openssl_nid(self) -> nid::Nid {
        match self {
            ECDSACurve::SECP256R1 => nid::Nid::X9_62_PRIME256V1,
            ECDSACurve::SECP384R1 => nid::Nid::SECP384R1,
            ECDSACurve::SECP521R1 => nid::Nid::SECP521R1,
        }
    }

    /// The length in bytes of a single affine coordinate on this curve.
    pub fn coordinate_size(self) -> usize {
        match self {
            ECDSACurve::SECP256R1 => 32,
            ECDSACurve::SECP384R1 => 48,
            ECDSACurve::SECP521R1 => 66,
        }
    }
}

/// A COSE signature algorithm identifier, indicating the type of key and hash
/// that should be used with this key. Only the ECDSA family is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum COSEAlgorithm {
    /// Identifies this key as ECDSA (recommended SECP256R1) with SHA256 hashing
    ES256 = -7,
    /// Identifies this key as ECDSA (recommended SECP384R1) with SHA384 hashing
    ES384 = -35,
    /// Identifies this key as ECDSA (recommended SECP521R1) with SHA512 hashing
    ES512 = -36,
}

impl TryFrom<i128> for COSEAlgorithm {
    type Error = WebauthnError;

    fn try_from(i: i128) -> Result<Self, Self::Error> {
        match i {
            -7 => Ok(COSEAlgorithm::ES256),
            -35 => Ok(COSEAlgorithm::ES384),
            -36 => Ok(COSEAlgorithm::ES512),
            _ => Err(WebauthnError::UnsupportedAlgorithm(i)),
        }
    }
}

impl From<COSEAlgorithm> for i64 {
    fn from(c: COSEAlgorithm) -> Self {
        c as i64
    }
}

impl COSEAlgorithm {
    fn digest(self) -> hash::MessageDigest {
        match self {
            COSEAlgorithm::ES256 => hash::MessageDigest::sha256(),
            COSEAlgorithm::ES384 => hash::MessageDigest::sha384(),
            COSEAlgorithm::ES512 => hash::MessageDigest::sha512(),
        }
    }

    // RFC 8152 8.1: applications MUST check that the curve and the key type are
    // consistent and reject a key if they are not.
    fn expected_curve(self) -> ECDSACurve {
        match self {
            COSEAlgorithm::ES256 => ECDSACurve::SECP256R1,
            COSEAlgorithm::ES384 => ECDSACurve::SECP384R1,
            COSEAlgorithm::ES512 => ECDSACurve::SECP521R1,
        }
    }
}

/// A COSE Eliptic Curve Public Key. This is generally the provided credential
/// that an authenticator registers, and is used to authenticate the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct COSEEC2Key {
    /// The curve that this key references.
    pub curve: ECDSACurve,
    /// The key's public X coordinate.
    pub x: Base64UrlSafeData,
    /// The key's public Y coordinate.
    pub y: Base64UrlSafeData,
}

/// The type of Key contained within a COSE value. You should never need
/// to alter or change this type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum COSEKeyType {
    /// Identifies this as an Eliptic Curve EC2 key
    EC_EC2(COSEEC2Key),
}

/// A COSE Key as provided by the Authenticator. This is the public key of a
/// credential, and is used to verify assertion signatures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct COSEKey {
    /// The signature algorithm this key is used with
    pub type_: COSEAlgorithm,
    /// The public key
    pub key: COSEKeyType,
}

// COSE key map labels, RFC 8152 7.1 and 13.1.1
const COSE_KTY: i128 = 1;
const COSE_ALG: i128 = 3;
const COSE_EC2_CRV: i128 = -1;
const COSE_EC2_X: i128 = -2;
const COSE_EC2_Y: i128 = -3;
const COSE_KTY_EC2: i128 = 2;

impl TryFrom<&Value> for COSEKey {
    type Error = WebauthnError;
    fn try_from(d: &Value) -> Result<COSEKey, Self::Error> {
        let m = cbor_try_map!(d).map_err(|_| WebauthnError::COSEKeyInvalid("not a cbor map"))?;

        // See also https://tools.ietf.org/html/rfc8152#section-3.1
        // {
        //     1: 2,   ; kty: EC2
        //     3: -7,  ; alg: ES256
        //    -1: 1,   ; crv: P-256
        //    -2: x,   ; bytes
        //    -3: y,   ; bytes
        // }
        let get_int = |label: i128| {
            m.get(&Value::Integer(label))
                .ok_or(WebauthnError::COSEKeyInvalid("missing cose key label"))
                .and_then(|v| cbor_try_i128!(v))
        };
        let get_bytes = |label: i128| {
            m.get(&Value::Integer(label))
                .ok_or(WebauthnError::COSEKeyInvalid("missing cose key label"))
                .and_then(|v| cbor_try_bytes!(v))
        };

        let key_type = get_int(COSE_KTY)?;
        if key_type != COSE_KTY_EC2 {
            return Err(WebauthnError::COSEKeyInvalid("only ec2 keys are supported"));
        }

        let type_ = COSEAlgorithm::try_from(get_int(COSE_ALG)?)?;
        let curve = ECDSACurve::try_from(get_int(COSE_EC2_CRV)?)?;

        if type_.expected_curve() != curve {
            return Err(WebauthnError::COSEKeyInvalid(
                "curve is not consistent with the algorithm",
            ));
        }

        let x = get_bytes(COSE_EC2_X)?;
        let y = get_bytes(COSE_EC2_Y)?;

        if x.len() != curve.coordinate_size() || y.len() != curve.coordinate_size() {
            return Err(WebauthnError::COSEKeyInvalid(
                "coordinate length does not match the curve",
            ));
        }

        let cose_key = COSEKey {
            type_,
            key: COSEKeyType::EC_EC2(COSEEC2Key {
                curve,
                x: x.clone().into(),
                y: y.clone().into(),
            }),
        };

        // Feed the point to openssl to assert it is on the curve.
        cose_key.get_openssl_pkey()?;
        Ok(cose_key)
    }
}

impl COSEKey {
    /// Decode a key from its COSE CBOR encoding, for example from a stored credential.
    pub fn from_cose_bytes(data: &[u8]) -> Result<Self, WebauthnError> {
        let value: Value = serde_cbor_2::from_slice(data)
            .map_err(|_| WebauthnError::MalformedInput("invalid cose key cbor"))?;
        COSEKey::try_from(&value)
    }

    /// This key as a COSE CBOR map.
    pub fn to_cbor_value(&self) -> Value {
        match &self.key {
            COSEKeyType::EC_EC2(ec2k) => {
                let mut m = BTreeMap::new();
                m.insert(Value::Integer(COSE_KTY), Value::Integer(COSE_KTY_EC2));
                m.insert(
                    Value::Integer(COSE_ALG),
                    Value::Integer(i64::from(self.type_) as i128),
                );
                m.insert(
                    Value::Integer(COSE_EC2_CRV),
                    Value::Integer(i128::from(ec2k.curve)),
                );
                m.insert(Value::Integer(COSE_EC2_X), Value::Bytes(ec2k.x.0.clone()));
                m.insert(Value::Integer(COSE_EC2_Y), Value::Bytes(ec2k.y.0.clone()));
                Value::Map(m)
            }
        }
    }

    /// Encode this key in its COSE CBOR form.
    pub fn to_cose_bytes(&self) -> Result<Vec<u8>, WebauthnError> {
        serde_cbor_2::to_vec(&self.to_cbor_value())
            .map_err(|_| WebauthnError::COSEKeyInvalid("unable to encode cose key"))
    }

    pub(crate) fn get_alg_key_ecc_x962_raw(&self) -> Vec<u8> {
        // Let publicKeyU2F be the concatenation 0x04 || x || y.
        // Note: This signifies uncompressed ECC key format.
        match &self.key {
            COSEKeyType::EC_EC2(ecpk) => std::iter::once(0x04)
                .chain(ecpk.x.0.iter().copied())
                .chain(ecpk.y.0.iter().copied())
                .collect(),
        }
    }

    pub(crate) fn is_secp256r1(&self) -> bool {
        match &self.key {
            COSEKeyType::EC_EC2(ecpk) => ecpk.curve == ECDSACurve::SECP256R1,
        }
    }

    fn get_openssl_pkey(&self) -> Result<pkey::PKey<pkey::Public>, WebauthnError> {
        match &self.key {
            COSEKeyType::EC_EC2(ec2k) => {
                let ec_group = ec::EcGroup::from_curve_name(ec2k.curve.to_openssl_nid())?;

                let xbn = bn::BigNum::from_slice(ec2k.x.as_ref())?;
                let ybn = bn::BigNum::from_slice(ec2k.y.as_ref())?;

                let ec_key = ec::EcKey::from_public_key_affine_coordinates(&ec_group, &xbn, &ybn)
                    .map_err(|err| {
                        error!(?err, "ec2 point is not on the curve");
                        WebauthnError::COSEKeyInvalid("ec2 point is not on the curve")
                    })?;

                // Validate the key is sound. This checks the point is on the
                // curve and is not the point at infinity.
                ec_key.check_key().map_err(|err| {
                    error!(?err, "ec2 key failed validation");
                    WebauthnError::COSEKeyInvalid("ec2 key failed validation")
                })?;

                pkey::PKey::from_ec_key(ec_key).map_err(WebauthnError::OpenSSLError)
            }
        }
    }

    /// Verify a DER encoded ECDSA `signature` over `verification_data` with the
    /// hash implied by this key's algorithm. A signature that does not verify,
    /// including one that is not valid DER, yields `Ok(false)`.
    pub fn verify_signature(
        &self,
        signature: &[u8],
        verification_data: &[u8],
    ) -> Result<bool, WebauthnError> {
        let pkey = self.get_openssl_pkey()?;

        let mut verifier = sign::Verifier::new(self.type_.digest(), &pkey)?;
        verifier.update(verification_data)?;
        Ok(verifier
            .verify(signature)
            .map_err(|err| {
                debug!(?err, "signature could not be processed");
            })
            .unwrap_or(false))
    }
}

/// Compute the sha256 of a slice of data.
pub fn compute_sha256(data: &[u8]) -> [u8; 32] {
    sha::sha256(data)
}
