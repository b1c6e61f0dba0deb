//! Attestation statement formats and their verification procedures.
//!
//! The format identifier of an attestation object selects a variant of
//! [`AttestationStatement`]. Each variant knows how to decode its own statement
//! and how to validate it against the authenticator data it was produced with.
//! Only the FIDO U2F format is supported.

use serde_cbor_2::Value;
use std::convert::TryFrom;

use crate::crypto::{COSEKey, X509PublicKey};
use crate::error::WebauthnError;
use crate::internals::AuthenticatorData;
use crate::proto::Credential;

/// The attestation statement formats that can be verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationFormat {
    /// `fido-u2f`
    FIDOU2F,
}

impl TryFrom<&str> for AttestationFormat {
    type Error = WebauthnError;

    fn try_from(a: &str) -> Result<AttestationFormat, Self::Error> {
        match a {
            "fido-u2f" => Ok(AttestationFormat::FIDOU2F),
            _ => Err(WebauthnError::UnsupportedAttestationFormat(a.to_string())),
        }
    }
}

impl AttestationFormat {
    /// The identifier of this format as it appears in `fmt`.
    pub fn as_str(self) -> &'static str {
        match self {
            AttestationFormat::FIDOU2F => "fido-u2f",
        }
    }
}

/// The result of a successful attestation validation.
#[derive(Debug)]
pub struct Attestation {
    /// The format that was validated.
    pub format: AttestationFormat,
    /// The credential the authenticator created.
    pub credential: Credential,
    /// The certificate that signed the attestation statement.
    pub attestation_certificate: X509PublicKey,
}

/// A decoded `fido-u2f` attestation statement.
#[derive(Debug, Clone)]
pub struct FidoU2FAttestationStatement {
    /// DER ECDSA signature over the U2F registration data.
    pub sig: Vec<u8>,
    /// DER certificates. Exactly one is valid for this format.
    pub x5c: Vec<Vec<u8>>,
}

impl TryFrom<&Value> for FidoU2FAttestationStatement {
    type Error = WebauthnError;

    fn try_from(att_stmt: &Value) -> Result<Self, Self::Error> {
        let att_stmt_map = cbor_try_map!(att_stmt)
            .map_err(|_| WebauthnError::MalformedAttestation("attStmt is not a map"))?;

        let sig_value = att_stmt_map
            .get(&Value::Text("sig".to_string()))
            .ok_or(WebauthnError::MalformedAttestation("attStmt is missing sig"))?;
        let sig = cbor_try_bytes!(sig_value)
            .map_err(|_| WebauthnError::MalformedAttestation("sig is not a byte string"))?;

        let x5c_value = att_stmt_map
            .get(&Value::Text("x5c".to_string()))
            .ok_or(WebauthnError::MalformedAttestation("attStmt is missing x5c"))?;
        let x5c = cbor_try_array!(x5c_value)
            .map_err(|_| WebauthnError::MalformedAttestation("x5c is not an array"))?
            .iter()
            .map(|cert| {
                cbor_try_bytes!(cert).cloned().map_err(|_| {
                    WebauthnError::MalformedAttestation("x5c entry is not a byte string")
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FidoU2FAttestationStatement {
            sig: sig.clone(),
            x5c,
        })
    }
}

/// Build the byte string a U2F authenticator signs at registration:
/// `0x00 || rpIdHash || clientDataHash || credentialId || 0x04 || x || y`
pub(crate) fn u2f_verification_data(
    rp_id_hash: &[u8],
    client_data_hash: &[u8],
    credential_id: &[u8],
    credential_public_key: &COSEKey,
) -> Vec<u8> {
    let public_key_u2f = credential_public_key.get_alg_key_ecc_x962_raw();

    std::iter::once(0x00)
        .chain(rp_id_hash.iter().copied())
        .chain(client_data_hash.iter().copied())
        .chain(credential_id.iter().copied())
        .chain(public_key_u2f)
        .collect()
}

impl FidoU2FAttestationStatement {
    // https://www.w3.org/TR/webauthn-2/#sctn-fido-u2f-attestation
    fn validate(
        &self,
        auth_data: &AuthenticatorData,
        rp_id_hash: &[u8],
        client_data_hash: &[u8],
    ) -> Result<Attestation, WebauthnError> {
        let acd = auth_data.acd.as_ref().ok_or_else(|| {
            error!("fido-u2f attestation without attested credential data");
            WebauthnError::MissingAttestedCredentialData
        })?;

        // Check that x5c has exactly one element and let att_cert be that element.
        let att_cert = match self.x5c.as_slice() {
            [att_cert] => X509PublicKey::try_from(att_cert.as_slice()).map_err(|err| {
                error!(?err, "x5c certificate is not valid der");
                WebauthnError::MalformedAttestation("x5c certificate is not valid der")
            })?,
            _ => {
                error!(len = self.x5c.len(), "x5c must contain exactly one certificate");
                return Err(WebauthnError::MalformedAttestation(
                    "x5c must contain exactly one certificate",
                ));
            }
        };

        // If certificate public key is not an Elliptic Curve (EC) public key over
        // the P-256 curve, terminate this algorithm and return an appropriate error.
        if !att_cert.is_secp256r1().unwrap_or(false) {
            error!("attestation certificate key is not p-256");
            return Err(WebauthnError::MalformedAttestation(
                "attestation certificate key is not p-256",
            ));
        }

        // Convert the COSE_KEY formatted credentialPublicKey to Raw ANSI X9.62
        // public key format.
        let credential_public_key = COSEKey::try_from(&acd.credential_pk).map_err(|err| {
            error!(?err, "credential public key is invalid");
            WebauthnError::MalformedAttestation("credential public key is invalid")
        })?;
        if !credential_public_key.is_secp256r1() {
            error!("u2f credential public key is not p-256");
            return Err(WebauthnError::MalformedAttestation(
                "u2f credential public key is not p-256",
            ));
        }

        let verification_data = u2f_verification_data(
            rp_id_hash,
            client_data_hash,
            acd.credential_id(),
            &credential_public_key,
        );

        // Verify the sig using verificationData and certificate public key per [SEC1].
        if !att_cert.verify_signature(&self.sig, &verification_data)? {
            error!("fido-u2f attestation signature verification failed!");
            return Err(WebauthnError::AttestationSignatureInvalid);
        }

        Ok(Attestation {
            format: AttestationFormat::FIDOU2F,
            credential: Credential::new(
                acd.credential_id().to_vec(),
                credential_public_key,
                auth_data.counter,
            ),
            attestation_certificate: att_cert,
        })
    }
}

/// A decoded attestation statement, keyed by its format.
#[derive(Debug, Clone)]
pub enum AttestationStatement {
    /// `fido-u2f`
    FidoU2F(FidoU2FAttestationStatement),
}

impl AttestationStatement {
    /// Select and decode the statement for the format identifier `fmt`.
    pub fn try_from_format(fmt: &str, att_stmt: &Value) -> Result<Self, WebauthnError> {
        match AttestationFormat::try_from(fmt)? {
            AttestationFormat::FIDOU2F => {
                FidoU2FAttestationStatement::try_from(att_stmt).map(AttestationStatement::FidoU2F)
            }
        }
    }

    /// The format of this statement.
    pub fn format(&self) -> AttestationFormat {
        match self {
            AttestationStatement::FidoU2F(_) => AttestationFormat::FIDOU2F,
        }
    }

    /// Validate this statement. This is pure: no storage or network access occurs.
    pub fn validate(
        &self,
        auth_data: &AuthenticatorData,
        rp_id_hash: &[u8],
        client_data_hash: &[u8],
    ) -> Result<Attestation, WebauthnError> {
        match self {
            AttestationStatement::FidoU2F(stmt) => {
                stmt.validate(auth_data, rp_id_hash, client_data_hash)
            }
        }
    }
}

/// Verify the attestation certificate chains to one of the trusted `roots`.
pub fn verify_attestation_ca_chain(
    attestation: &Attestation,
    roots: &[openssl::x509::X509],
) -> Result<bool, WebauthnError> {
    attestation.attestation_certificate.verify_chain(&[], roots)
}
