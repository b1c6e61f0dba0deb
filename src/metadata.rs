//! Authenticator metadata lookup.
//!
//! The relying party only needs one thing from metadata: given the key identifier
//! of an attestation certificate, the record describing that authenticator and
//! the roots its attestation certificates chain to. That contract is
//! [`MetadataSource`]. [`FidoMetadataClient`] implements it over the FIDO
//! Alliance Metadata Service BLOB, a JWS signed table of entries.
//!
//! The client owns its caches. The verified document is loaded once on first use
//! and lookups are memoised in a bounded LRU. Both are dropped by
//! [`FidoMetadataClient::invalidate`].

use openssl::{bn, ecdsa, hash, sign, x509};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::base64_data::Base64UrlSafeData;
use crate::constants::METADATA_CACHE_SIZE;
use crate::crypto::verify_certificate_chain;
use crate::error::WebauthnError;

/// A source of trust metadata for attestation certificates.
pub trait MetadataSource {
    /// Find the record for an attestation certificate key identifier, the
    /// lowercase hex SHA-1 of the certificate's subjectPublicKey. Returns
    /// [`WebauthnError::NotFound`] if no entry lists this identifier.
    fn metadata_for_key_identifier(&self, key_id: &str) -> Result<MetadataRecord, WebauthnError>;
}

/// Retrieval of the raw metadata documents. This is the network boundary and
/// is implemented by the caller with whatever http client and timeouts suit it.
pub trait MdsTransport {
    /// Fetch the compact JWS metadata BLOB.
    fn fetch_blob(&self) -> Result<String, WebauthnError>;

    /// Fetch the base64 encoded metadata statement referenced by an entry's `url`.
    fn fetch_statement(&self, url: &str) -> Result<String, WebauthnError> {
        Err(WebauthnError::MetadataUnavailable(format!(
            "this transport can not fetch statement {url}"
        )))
    }
}

/// An entry in a status report of an authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// The status, such as `FIDO_CERTIFIED` or `REVOKED`.
    pub status: String,
    /// ISO-8601 date since when the status is in effect.
    pub effective_date: Option<String>,
}

/// The parts of a FIDO metadata statement the relying party uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataStatement {
    /// Legal Header
    pub legal_header: Option<String>,
    /// The Authenticator Attestation GUID.
    pub aaguid: Option<Uuid>,
    /// Attestation certificate key identifiers, lowercase hex.
    pub attestation_certificate_key_identifiers: Option<Vec<String>>,
    /// A human-readable, short description of the authenticator, in English.
    pub description: Option<String>,
    /// Base64 (not url safe) DER trust anchors for this authenticator's
    /// attestation certificates.
    #[serde(default)]
    pub attestation_root_certificates: Vec<String>,
}

/// A device entry of the metadata BLOB.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FidoDevice {
    /// The AAGUID of FIDO2 devices.
    pub aaguid: Option<Uuid>,
    /// Attestation certificate key identifiers of U2F devices.
    pub attestation_certificate_key_identifiers: Option<Vec<String>>,
    /// The inline metadata statement.
    pub metadata_statement: Option<MetadataStatement>,
    /// Older BLOBs reference the statement by url rather than inlining it.
    pub url: Option<String>,
    /// Status reports for this device.
    #[serde(default)]
    pub status_reports: Vec<StatusReport>,
    /// ISO-8601 date of the last status change.
    pub time_of_last_status_change: Option<String>,
}

impl FidoDevice {
    fn has_key_identifier(&self, key_id: &str) -> bool {
        self.attestation_certificate_key_identifiers
            .as_ref()
            .map(|ids| ids.iter().any(|id| id.eq_ignore_ascii_case(key_id)))
            .unwrap_or(false)
    }
}

/// The metadata BLOB payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FidoMds {
    /// The serial number of this BLOB.
    pub no: u32,
    /// ISO-8601 date when the next update will be provided at latest.
    pub next_update: String,
    /// Legal header
    pub legal_header: Option<String>,
    /// The set of device metadata
    pub entries: Vec<FidoDevice>,
}

#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    x5c: Vec<String>,
}

fn b64_decode(s: &str, what: &'static str) -> Result<Vec<u8>, WebauthnError> {
    Base64UrlSafeData::decode(s)
        .map(|d| d.0)
        .ok_or(WebauthnError::MetadataInvalid(what))
}

// JWS ES256 signatures are the fixed width r || s, openssl wants DER.
fn es256_raw_to_der(sig: &[u8]) -> Result<Vec<u8>, WebauthnError> {
    if sig.len() != 64 {
        return Err(WebauthnError::MetadataInvalid(
            "es256 signature must be 64 bytes",
        ));
    }
    let r = bn::BigNum::from_slice(&sig[..32])?;
    let s = bn::BigNum::from_slice(&sig[32..])?;
    let ecsig = ecdsa::EcdsaSig::from_private_components(r, s)?;
    ecsig.to_der().map_err(WebauthnError::OpenSSLError)
}

impl FidoMds {
    /// Verify and decode a compact JWS metadata BLOB.
    ///
    /// The signature is checked with the algorithm and the first `x5c`
    /// certificate declared in the JWS header. If `trust_root` is given, the
    /// `x5c` chain must additionally validate to it.
    pub fn from_jws(jws: &str, trust_root: Option<&x509::X509>) -> Result<Self, WebauthnError> {
        let mut parts = jws.trim().split('.');
        let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(WebauthnError::MetadataInvalid("not a compact jws"));
        };

        let header: JwsHeader =
            serde_json::from_slice(&b64_decode(header_b64, "jws header is not base64")?)
                .map_err(|serde_err| {
                    error!(?serde_err, "jws header is not valid json");
                    WebauthnError::MetadataInvalid("jws header is not valid json")
                })?;
        trace!(?header);

        let chain = header
            .x5c
            .iter()
            .map(|c| {
                b64_decode(c, "x5c entry is not base64").and_then(|der| {
                    x509::X509::from_der(&der)
                        .map_err(|_| WebauthnError::MetadataInvalid("x5c entry is not der"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (leaf, intermediates) = chain
            .split_first()
            .ok_or(WebauthnError::MetadataInvalid("jws header has no x5c"))?;

        let signature = b64_decode(sig_b64, "jws signature is not base64")?;
        let signature = match header.alg.as_str() {
            "ES256" => es256_raw_to_der(&signature)?,
            "RS256" => signature,
            _ => {
                error!(alg = %header.alg, "unsupported jws algorithm");
                return Err(WebauthnError::MetadataInvalid("unsupported jws algorithm"));
            }
        };

        let pkey = leaf.public_key()?;
        let mut verifier = sign::Verifier::new(hash::MessageDigest::sha256(), &pkey)?;
        verifier.update(header_b64.as_bytes())?;
        verifier.update(b".")?;
        verifier.update(payload_b64.as_bytes())?;
        if !verifier.verify(&signature).unwrap_or(false) {
            error!("metadata jws signature verification failed");
            return Err(WebauthnError::MetadataInvalid("jws signature is invalid"));
        }

        if let Some(root) = trust_root {
            if !verify_certificate_chain(leaf, intermediates, std::slice::from_ref(root))? {
                error!("metadata jws signer does not chain to the trust root");
                return Err(WebauthnError::MetadataInvalid(
                    "jws certificate chain is not trusted",
                ));
            }
        }

        serde_json::from_slice(&b64_decode(payload_b64, "jws payload is not base64")?).map_err(
            |serde_err| {
                error!(?serde_err, "metadata payload could not be decoded");
                WebauthnError::MetadataInvalid("metadata payload could not be decoded")
            },
        )
    }
}

/// The result of a metadata lookup.
#[derive(Debug, Clone)]
pub struct MetadataRecord {
    /// The metadata statement of the authenticator.
    pub statement: MetadataStatement,
    /// Status reports of the authenticator.
    pub status_reports: Vec<StatusReport>,
}

impl MetadataRecord {
    /// Decode the attestation root certificates of this record.
    pub fn attestation_roots(&self) -> Result<Vec<x509::X509>, WebauthnError> {
        self.statement
            .attestation_root_certificates
            .iter()
            .map(|c| {
                b64_decode(c, "attestation root is not base64").and_then(|der| {
                    x509::X509::from_der(&der)
                        .map_err(|_| WebauthnError::MetadataInvalid("attestation root is not der"))
                })
            })
            .collect()
    }
}

/// A metadata client over the FIDO Metadata Service BLOB.
pub struct FidoMetadataClient<T> {
    transport: T,
    trust_root: Option<x509::X509>,
    document: Mutex<Option<Arc<FidoMds>>>,
    lookups: Mutex<lru::LruCache<String, MetadataRecord>>,
}

// A poisoned lock only means another lookup panicked part way, the caches are
// still coherent.
fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: MdsTransport> FidoMetadataClient<T> {
    /// Create a client. The BLOB signature is checked against its embedded
    /// certificate only, use [`FidoMetadataClient::with_trust_root`] to pin a root.
    pub fn new(transport: T) -> Self {
        FidoMetadataClient {
            transport,
            trust_root: None,
            document: Mutex::new(None),
            lookups: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(METADATA_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Require the BLOB signer to chain to `root`.
    pub fn with_trust_root(mut self, root: x509::X509) -> Self {
        self.trust_root = Some(root);
        self
    }

    /// The verified metadata document, fetched on first use.
    ///
    /// The fetch runs without holding the document lock, so concurrent first
    /// lookups may each fetch. The first verified document stored wins.
    pub fn metadata_document(&self) -> Result<Arc<FidoMds>, WebauthnError> {
        if let Some(doc) = lock(&self.document).as_ref() {
            return Ok(doc.clone());
        }

        let blob = self.transport.fetch_blob()?;
        let doc = Arc::new(FidoMds::from_jws(&blob, self.trust_root.as_ref())?);
        debug!(no = doc.no, entries = doc.entries.len(), "loaded fido metadata");
        Ok(lock(&self.document).get_or_insert(doc).clone())
    }

    /// Drop the cached document and all memoised lookups. The next lookup will
    /// fetch the document again.
    pub fn invalidate(&self) {
        *lock(&self.document) = None;
        lock(&self.lookups).clear();
        debug!("fido metadata cache invalidated");
    }

    fn fetch_statement(&self, url: &str) -> Result<MetadataStatement, WebauthnError> {
        let encoded = self.transport.fetch_statement(url)?;
        let json = b64_decode(encoded.trim(), "metadata statement is not base64")?;
        serde_json::from_slice(&json).map_err(|serde_err| {
            error!(?serde_err, %url, "metadata statement could not be decoded");
            WebauthnError::MetadataInvalid("metadata statement could not be decoded")
        })
    }
}

impl<T: MdsTransport> MetadataSource for FidoMetadataClient<T> {
    fn metadata_for_key_identifier(&self, key_id: &str) -> Result<MetadataRecord, WebauthnError> {
        if let Some(record) = lock(&self.lookups).get(key_id) {
            trace!(%key_id, "metadata lookup cache hit");
            return Ok(record.clone());
        }

        let doc = self.metadata_document()?;
        let device = doc
            .entries
            .iter()
            .find(|device| device.has_key_identifier(key_id))
            .ok_or_else(|| {
                debug!(%key_id, "no metadata entry for key identifier");
                WebauthnError::NotFound
            })?;

        let statement = match (&device.metadata_statement, &device.url) {
            (Some(statement), _) => statement.clone(),
            (None, Some(url)) => self.fetch_statement(url)?,
            (None, None) => {
                return Err(WebauthnError::MetadataInvalid(
                    "entry has neither a statement nor a url",
                ))
            }
        };

        let record = MetadataRecord {
            statement,
            status_reports: device.status_reports.clone(),
        };
        lock(&self.lookups).put(key_id.to_string(), record.clone());
        Ok(record)
    }
}
