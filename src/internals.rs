//! Binary decoders for the authenticator data and attestation object structures
//! that an authenticator hands back to the relying party.

use serde::Deserialize;
use serde_cbor_2::Value;
use std::convert::TryFrom;
use uuid::Uuid;

use crate::constants::*;
use crate::error::WebauthnError;

/// The attested credential data block of authenticator data. This is present
/// during registration and carries the new credential's id and public key.
#[derive(Debug, Clone, PartialEq)]
pub struct AttestedCredentialData {
    /// The guid of the authenticator model. U2F devices report all zeros.
    pub aaguid: [u8; 16],
    credential_id: Vec<u8>,
    /// The credential public key as a COSE cbor map.
    pub credential_pk: Value,
    raw_credential_pk: Vec<u8>,
}

impl AttestedCredentialData {
    /// The aaguid as a uuid.
    pub fn aaguid(&self) -> Uuid {
        Uuid::from_bytes(self.aaguid)
    }

    /// The credential id, an opaque byte string of at most `u16::MAX` bytes.
    pub fn credential_id(&self) -> &[u8] {
        &self.credential_id
    }
}

/// Authenticator data as defined in
/// <https://www.w3.org/TR/webauthn-2/#sctn-authenticator-data>
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorData {
    /// SHA-256 of the RP ID the authenticator scoped the credential to.
    pub rp_id_hash: [u8; 32],
    /// The raw flags byte.
    pub flags: u8,
    /// The signature counter.
    pub counter: u32,
    /// Attested credential data, present iff the AT flag is set.
    pub acd: Option<AttestedCredentialData>,
    /// Authenticator extension outputs, present iff the ED flag is set.
    pub extensions: Option<Value>,
    raw_extensions: Option<Vec<u8>>,
    raw: Vec<u8>,
}

impl AuthenticatorData {
    /// The user present (UP) flag.
    pub fn user_present(&self) -> bool {
        self.flags & FLAG_USER_PRESENT != 0
    }

    /// The user verified (UV) flag.
    pub fn user_verified(&self) -> bool {
        self.flags & FLAG_USER_VERIFIED != 0
    }

    /// The bytes this structure was decoded from. These are part of the signed
    /// payload of an assertion and must not be re-encoded for verification.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Encode this structure back to its binary layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len());
        out.extend_from_slice(&self.rp_id_hash);
        out.push(self.flags);
        out.extend_from_slice(&self.counter.to_be_bytes());

        if let Some(acd) = &self.acd {
            out.extend_from_slice(&acd.aaguid);
            // Only the parser sets credential_id, bounded by its u16 length prefix.
            out.extend_from_slice(&(acd.credential_id.len() as u16).to_be_bytes());
            out.extend_from_slice(&acd.credential_id);
            out.extend_from_slice(&acd.raw_credential_pk);
        }

        if let Some(raw_extensions) = &self.raw_extensions {
            out.extend_from_slice(raw_extensions);
        }

        out
    }
}

/// Decode a single cbor item from the front of `i`, returning the value and the
/// exact bytes it occupied.
fn cbor_value_parser(i: &[u8]) -> nom::IResult<&[u8], (Value, &[u8])> {
    let mut deserializer = serde_cbor_2::Deserializer::from_slice(i);
    let v = Value::deserialize(&mut deserializer).map_err(|err| {
        trace!(?err, "unable to decode embedded cbor");
        nom::Err::Failure(nom::error::Error::new(i, nom::error::ErrorKind::Verify))
    })?;

    let (raw, i) = i.split_at(deserializer.byte_offset());
    Ok((i, (v, raw)))
}

fn acd_parser(i: &[u8]) -> nom::IResult<&[u8], AttestedCredentialData> {
    let (i, aaguid) = nom::combinator::map_res(nom::bytes::complete::take(16usize), |s: &[u8]| {
        <[u8; 16]>::try_from(s)
    })(i)?;
    let (i, credential_id) = nom::multi::length_data(nom::number::complete::be_u16)(i)?;
    let (i, (credential_pk, raw_credential_pk)) = cbor_value_parser(i)?;

    Ok((
        i,
        AttestedCredentialData {
            aaguid,
            credential_id: credential_id.to_vec(),
            credential_pk,
            raw_credential_pk: raw_credential_pk.to_vec(),
        },
    ))
}

fn extensions_parser(i: &[u8]) -> nom::IResult<&[u8], (Value, &[u8])> {
    let (rest, (v, raw)) = cbor_value_parser(i)?;
    if !matches!(v, Value::Map(_)) {
        // Extension outputs are always a map.
        return Err(nom::Err::Failure(nom::error::Error::new(
            i,
            nom::error::ErrorKind::IsNot,
        )));
    }
    Ok((rest, (v, raw)))
}

fn authenticator_data_parser(i: &[u8]) -> nom::IResult<&[u8], AuthenticatorData> {
    let (i, rp_id_hash) = nom::combinator::map_res(nom::bytes::complete::take(32usize), |s: &[u8]| {
        <[u8; 32]>::try_from(s)
    })(i)?;
    let (i, flags) = nom::number::complete::be_u8(i)?;
    let (i, counter) = nom::number::complete::be_u32(i)?;
    let (i, acd) = nom::combinator::cond(flags & FLAG_ATTESTED_CREDENTIAL_DATA != 0, acd_parser)(i)?;
    let (i, extensions) =
        nom::combinator::cond(flags & FLAG_EXTENSION_DATA != 0, extensions_parser)(i)?;

    let (extensions, raw_extensions) = match extensions {
        Some((v, raw)) => (Some(v), Some(raw.to_vec())),
        None => (None, None),
    };

    Ok((
        i,
        AuthenticatorData {
            rp_id_hash,
            flags,
            counter,
            acd,
            extensions,
            raw_extensions,
            raw: Vec::new(),
        },
    ))
}

impl TryFrom<&[u8]> for AuthenticatorData {
    type Error = WebauthnError;

    fn try_from(auth_data_bytes: &[u8]) -> Result<Self, Self::Error> {
        if auth_data_bytes.len() < AUTHENTICATOR_DATA_MIN_LEN {
            return Err(WebauthnError::MalformedInput(
                "authenticator data is shorter than 37 bytes",
            ));
        }

        nom::combinator::all_consuming(authenticator_data_parser)(auth_data_bytes)
            .map_err(|err| {
                debug!(?err, "authenticator data parse failure");
                WebauthnError::MalformedInput("authenticator data could not be decoded")
            })
            .map(|(_, mut ad)| {
                ad.raw = auth_data_bytes.to_vec();
                ad
            })
    }
}

/// The attestation object produced by `navigator.credentials.create()`.
#[derive(Debug, Clone)]
pub struct AttestationObject {
    /// The attestation statement format identifier.
    pub fmt: String,
    /// The format specific attestation statement.
    pub att_stmt: Value,
    /// The raw authenticator data. Decode with [`AttestationObject::auth_data`].
    pub auth_data_bytes: Vec<u8>,
}

impl AttestationObject {
    /// Decode the embedded authenticator data.
    pub fn auth_data(&self) -> Result<AuthenticatorData, WebauthnError> {
        AuthenticatorData::try_from(self.auth_data_bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for AttestationObject {
    type Error = WebauthnError;

    fn try_from(data: &[u8]) -> Result<AttestationObject, WebauthnError> {
        let v: Value = serde_cbor_2::from_slice(data).map_err(|err| {
            debug!(?err, "attestation object is not valid cbor");
            WebauthnError::MalformedInput("attestation object is not valid cbor")
        })?;

        let m = cbor_try_map!(&v)?;
        let get = |k: &'static str| {
            m.get(&Value::Text(k.to_string()))
                .ok_or(WebauthnError::MalformedInput("attestation object is missing a key"))
        };

        let fmt = cbor_try_string!(get("fmt")?)?.clone();
        let att_stmt = get("attStmt")?.clone();
        let auth_data_bytes = cbor_try_bytes!(get("authData")?)?.clone();

        Ok(AttestationObject {
            fmt,
            att_stmt,
            auth_data_bytes,
        })
    }
}
