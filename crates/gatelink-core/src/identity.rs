//! Device identity for the signed gateway handshake
//!
//! Each install carries one ed25519 keypair. The device id is the SHA-256
//! digest of the raw public key, hex encoded; the gateway pairs devices by
//! that id. The identity is persisted as a versioned record and regenerated
//! only when the record is absent or unreadable.
//!
//! The canonical auth payload is a pipe-delimited string the verifying
//! server rebuilds byte-for-byte: field order and the separator are part of
//! the wire contract, not an implementation detail.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::{IdentityError, Result};
use crate::storage::{load_json, save_json, StateStore, KEY_DEVICE_IDENTITY};

/// Version tag for an auth payload without a server nonce
pub const AUTH_VERSION_PLAIN: &str = "v1";
/// Version tag for a nonce-bound auth payload
pub const AUTH_VERSION_NONCE: &str = "v2";

/// Current on-disk identity record version
const IDENTITY_RECORD_VERSION: u32 = 1;

// ----------------------------------------------------------------------------
// Persisted Record
// ----------------------------------------------------------------------------

/// Serialized form of a device identity
///
/// The secret key is stored base64url (unpadded), the same encoding used
/// for key material on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub version: u32,
    pub secret_key: String,
    pub device_id: String,
}

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// An install-scoped signing identity
///
/// Immutable once created; `load_or_generate` is the only constructor used
/// outside tests.
pub struct DeviceIdentity {
    signing_key: SigningKey,
    device_id: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug output
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Load the persisted identity, generating and persisting a fresh one
    /// when the record is absent or unreadable
    ///
    /// The engine calls this once and caches the result for the session;
    /// repeated calls re-read storage and are only used across restarts.
    pub fn load_or_generate(store: &mut dyn StateStore) -> Result<Self> {
        match load_json::<IdentityRecord>(store, KEY_DEVICE_IDENTITY) {
            Ok(Some(record)) => match Self::from_record(&record) {
                Ok(identity) => {
                    debug!(device_id = %identity.device_id, "loaded device identity");
                    return Ok(identity);
                }
                Err(e) => {
                    warn!("persisted device identity unreadable, regenerating: {e}");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!("persisted device identity undecodable, regenerating: {e}");
            }
        }

        let identity = Self::generate();
        save_json(store, KEY_DEVICE_IDENTITY, &identity.to_record())?;
        debug!(device_id = %identity.device_id, "generated device identity");
        Ok(identity)
    }

    /// Generate a fresh identity from OS entropy (not yet persisted)
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let device_id = derive_device_id(&signing_key.verifying_key());
        Self {
            signing_key,
            device_id,
        }
    }

    fn from_record(record: &IdentityRecord) -> core::result::Result<Self, IdentityError> {
        if record.version != IDENTITY_RECORD_VERSION {
            return Err(IdentityError::UnsupportedVersion {
                version: record.version,
            });
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(&record.secret_key)
            .map_err(|e| IdentityError::CorruptRecord {
                reason: format!("secret key: {e}"),
            })?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::CorruptRecord {
                reason: "secret key is not 32 bytes".to_string(),
            })?;
        let signing_key = SigningKey::from_bytes(&bytes);
        // The id is derived, so recompute rather than trusting the record
        let device_id = derive_device_id(&signing_key.verifying_key());
        Ok(Self {
            signing_key,
            device_id,
        })
    }

    fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            version: IDENTITY_RECORD_VERSION,
            secret_key: URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()),
            device_id: self.device_id.clone(),
        }
    }

    /// Stable device identifier: hex SHA-256 of the raw public key
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Public key in the wire encoding (base64url, unpadded)
    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Build the canonical pipe-delimited auth payload
    ///
    /// Field order: version, device id, client id, client mode, role,
    /// comma-joined scopes, signed-at millis, token (empty when absent),
    /// then the nonce when present. The version tag is `v2` exactly when a
    /// nonce is bound in.
    pub fn auth_payload(&self, ctx: &AuthContext<'_>) -> String {
        let version = if ctx.nonce.is_some() {
            AUTH_VERSION_NONCE
        } else {
            AUTH_VERSION_PLAIN
        };
        let mut fields = vec![
            version.to_string(),
            self.device_id.clone(),
            ctx.client_id.to_string(),
            ctx.client_mode.to_string(),
            ctx.role.to_string(),
            ctx.scopes.join(","),
            ctx.signed_at_ms.to_string(),
            ctx.token.unwrap_or_default().to_string(),
        ];
        if let Some(nonce) = ctx.nonce {
            fields.push(nonce.to_string());
        }
        fields.join("|")
    }

    /// Sign the UTF-8 bytes of a canonical payload
    ///
    /// Returns the signature in the wire encoding (base64url, unpadded).
    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }

    #[cfg(test)]
    pub(crate) fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Derive the stable device id from a public key
pub fn derive_device_id(public_key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(public_key.to_bytes()))
}

// ----------------------------------------------------------------------------
// Auth Context
// ----------------------------------------------------------------------------

/// The fields bound into a signed auth payload
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: u64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn ctx<'a>(scopes: &'a [String], token: Option<&'a str>, nonce: Option<&'a str>) -> AuthContext<'a> {
        AuthContext {
            client_id: "gateway-client",
            client_mode: "webchat",
            role: "operator",
            scopes,
            signed_at_ms: 1_700_000_000_000,
            token,
            nonce,
        }
    }

    #[test]
    fn test_device_id_is_hex_sha256_of_public_key() {
        let identity = DeviceIdentity::generate();
        let expected = hex::encode(Sha256::digest(identity.verifying_key().to_bytes()));
        assert_eq!(identity.device_id(), expected);
        assert_eq!(identity.device_id().len(), 64);
    }

    #[test]
    fn test_auth_payload_field_order_plain() {
        let identity = DeviceIdentity::generate();
        let scopes = vec!["chat".to_string(), "tasks".to_string()];
        let payload = identity.auth_payload(&ctx(&scopes, Some("tok"), None));

        let expected = format!(
            "v1|{}|gateway-client|webchat|operator|chat,tasks|1700000000000|tok",
            identity.device_id()
        );
        assert_eq!(payload, expected);
    }

    #[test]
    fn test_auth_payload_nonce_selects_v2_and_appends() {
        let identity = DeviceIdentity::generate();
        let scopes = vec!["chat".to_string()];
        let payload = identity.auth_payload(&ctx(&scopes, None, Some("n0nce")));

        assert!(payload.starts_with("v2|"));
        assert!(payload.ends_with("|n0nce"));
        // Absent token still occupies its slot
        assert!(payload.contains("|1700000000000||n0nce"));
    }

    #[test]
    fn test_signature_verifies_over_payload_bytes() {
        let identity = DeviceIdentity::generate();
        let scopes = vec!["chat".to_string()];
        let payload = identity.auth_payload(&ctx(&scopes, Some("tok"), Some("abc")));
        let sig_b64 = identity.sign(&payload);

        let sig_bytes = URL_SAFE_NO_PAD.decode(sig_b64).unwrap();
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes.try_into().unwrap());
        identity
            .verifying_key()
            .verify_strict(payload.as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn test_load_or_generate_persists_and_reloads() {
        let mut store = MemoryStore::new();

        let first = DeviceIdentity::load_or_generate(&mut store).unwrap();
        let second = DeviceIdentity::load_or_generate(&mut store).unwrap();

        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key_b64(), second.public_key_b64());
    }

    #[test]
    fn test_corrupt_record_regenerates() {
        let mut store = MemoryStore::new();
        store
            .set(KEY_DEVICE_IDENTITY, b"{\"version\":1,\"secret_key\":\"!!\",\"device_id\":\"x\"}".to_vec())
            .unwrap();

        let identity = DeviceIdentity::load_or_generate(&mut store).unwrap();
        assert_eq!(identity.device_id().len(), 64);

        // The freshly generated identity replaced the corrupt record
        let reloaded = DeviceIdentity::load_or_generate(&mut store).unwrap();
        assert_eq!(identity.device_id(), reloaded.device_id());
    }

    #[test]
    fn test_unsupported_version_regenerates() {
        let mut store = MemoryStore::new();
        let mut record = DeviceIdentity::generate().to_record();
        record.version = 99;
        save_json(&mut store, KEY_DEVICE_IDENTITY, &record).unwrap();

        let identity = DeviceIdentity::load_or_generate(&mut store).unwrap();
        assert_ne!(identity.device_id(), record.device_id);
    }
}
