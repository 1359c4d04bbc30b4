//! Tool packs and signed manifests.
//!
//! A tool pack is a named, versioned list of tool names. Packs ship with a
//! manifest that can be signed with HMAC-SHA256 over a canonical JSON
//! encoding (sorted keys, sorted tool list) so consumers can verify that a
//! pack has not been tampered with.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Result, TasukiError};

type HmacSha256 = Hmac<Sha256>;

/// Environment variable carrying the manifest signing secret.
pub const MANIFEST_SECRET_ENV: &str = "AGENT_SDK_TOOL_MANIFEST_SECRET";

/// A named, versioned tool pack manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolManifest {
    /// Pack name.
    pub name: String,
    /// Pack version.
    pub version: String,
    /// Names of the tools the pack provides.
    pub tools: Vec<String>,
    /// Free-form metadata; ordered so the canonical encoding is stable.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Hex-encoded HMAC-SHA256 signature, when signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ToolManifest {
    /// Create an unsigned manifest.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        tools: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools,
            metadata: BTreeMap::new(),
            signature: None,
        }
    }

    /// Attach a metadata entry (builder pattern).
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The canonical JSON payload that signatures cover.
    ///
    /// Keys are sorted, the tool list is sorted, and the signature field is
    /// excluded, so logically equal manifests encode identically.
    #[must_use]
    pub fn canonical_payload(&self) -> String {
        let mut tools = self.tools.clone();
        tools.sort_unstable();

        // BTreeMap gives sorted keys for both the outer object and metadata.
        let mut payload: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        payload.insert("metadata", serde_json::to_value(&self.metadata).unwrap_or_default());
        payload.insert("name", serde_json::Value::String(self.name.clone()));
        payload.insert("tools", serde_json::to_value(tools).unwrap_or_default());
        payload.insert("version", serde_json::Value::String(self.version.clone()));
        serde_json::to_string(&payload).unwrap_or_default()
    }
}

/// Sign a manifest, returning a copy carrying the hex signature.
///
/// # Errors
///
/// Fails only if the secret cannot seed the MAC, which HMAC permits for any
/// key length; kept fallible for interface stability.
pub fn sign_manifest(manifest: &ToolManifest, secret: &str) -> Result<ToolManifest> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TasukiError::configuration(format!("invalid manifest secret: {e}")))?;
    mac.update(manifest.canonical_payload().as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let mut signed = manifest.clone();
    signed.signature = Some(signature);
    Ok(signed)
}

/// Verify a manifest signature in constant time.
///
/// Unsigned manifests never verify.
#[must_use]
pub fn verify_manifest(manifest: &ToolManifest, secret: &str) -> bool {
    let Some(signature) = &manifest.signature else {
        return false;
    };
    let Ok(raw) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(manifest.canonical_payload().as_bytes());
    mac.verify_slice(&raw).is_ok()
}

/// Read the manifest signing secret from the environment.
#[must_use]
pub fn default_manifest_secret() -> Option<String> {
    std::env::var(MANIFEST_SECRET_ENV).ok()
}

/// Tool names belonging to a builtin pack, or `None` for unknown packs.
#[must_use]
pub fn pack_tools(pack: &str) -> Option<&'static [&'static str]> {
    match pack {
        "core" => Some(&["echo", "math.eval", "time.now"]),
        "utilities" => Some(&["text.search", "text.replace", "json.query"]),
        "rag" => Some(&["vector.search", "vector.upsert"]),
        "coordination" => Some(&["agent.delegate", "agent.status"]),
        _ => None,
    }
}

/// Names of all builtin packs.
#[must_use]
pub const fn builtin_pack_names() -> [&'static str; 4] {
    ["core", "utilities", "rag", "coordination"]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> ToolManifest {
        ToolManifest::new(
            "core",
            "1.0.0",
            vec!["math.eval".into(), "echo".into()],
        )
        .with_metadata("author", "tasuki")
    }

    mod signing {
        use super::*;

        #[test]
        fn sign_then_verify_succeeds() {
            let signed = sign_manifest(&sample_manifest(), "secret").unwrap();
            assert!(signed.signature.is_some());
            assert!(verify_manifest(&signed, "secret"));
        }

        #[test]
        fn wrong_secret_fails_verification() {
            let signed = sign_manifest(&sample_manifest(), "secret").unwrap();
            assert!(!verify_manifest(&signed, "other-secret"));
        }

        #[test]
        fn unsigned_manifest_never_verifies() {
            assert!(!verify_manifest(&sample_manifest(), "secret"));
        }

        #[test]
        fn tampering_invalidates_signature() {
            let mut signed = sign_manifest(&sample_manifest(), "secret").unwrap();
            signed.tools.push("rogue.tool".into());
            assert!(!verify_manifest(&signed, "secret"));
        }

        #[test]
        fn garbage_signature_is_rejected() {
            let mut manifest = sample_manifest();
            manifest.signature = Some("not-hex!".into());
            assert!(!verify_manifest(&manifest, "secret"));
        }
    }

    mod canonical_encoding {
        use super::*;

        #[test]
        fn tool_order_does_not_change_payload() {
            let a = ToolManifest::new("p", "1", vec!["b".into(), "a".into()]);
            let b = ToolManifest::new("p", "1", vec!["a".into(), "b".into()]);
            assert_eq!(a.canonical_payload(), b.canonical_payload());
        }

        #[test]
        fn signature_field_is_excluded() {
            let unsigned = sample_manifest();
            let signed = sign_manifest(&unsigned, "secret").unwrap();
            assert_eq!(unsigned.canonical_payload(), signed.canonical_payload());
        }

        #[test]
        fn payload_has_sorted_keys() {
            let payload = sample_manifest().canonical_payload();
            let meta = payload.find("\"metadata\"").unwrap();
            let name = payload.find("\"name\"").unwrap();
            let tools = payload.find("\"tools\"").unwrap();
            let version = payload.find("\"version\"").unwrap();
            assert!(meta < name && name < tools && tools < version);
        }
    }

    mod builtin_packs {
        use super::*;

        #[test]
        fn known_packs_resolve() {
            for pack in builtin_pack_names() {
                assert!(pack_tools(pack).is_some(), "{pack} should resolve");
            }
        }

        #[test]
        fn unknown_pack_is_none() {
            assert!(pack_tools("nonexistent").is_none());
        }
    }
}
