//! API key authentication for the realtime endpoint
//!
//! Authenticated connections carry three query parameters on the upgrade
//! request: `api-expires`, `api-signature` and `api-key`. The signature is a
//! hex-encoded HMAC-SHA256 over `verb + path + expires` keyed by the API secret.
//! Every (re)connect signs a fresh URL because the expiry is short.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Seconds a signed upgrade request stays valid
pub const SIGNATURE_TTL_SECS: u64 = 60;

/// Path signed for realtime connections
const REALTIME_PATH: &str = "/realtime";

/// API key pair used to sign realtime connections
#[derive(Clone)]
pub struct ApiCredentials {
    key_id: String,
    secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl ApiCredentials {
    /// Create credentials from an API key id and secret
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let key_id = key_id.into();
        let secret = secret.into();

        if key_id.is_empty() {
            return Err(Error::Auth("API key id must not be empty".to_string()));
        }
        if secret.is_empty() {
            return Err(Error::Auth("API key secret must not be empty".to_string()));
        }

        Ok(Self { key_id, secret })
    }

    /// Build credentials from optional config values
    ///
    /// Returns `Ok(None)` when no key id is configured.
    pub fn from_parts(key_id: Option<&str>, secret: Option<&str>) -> Result<Option<Self>> {
        match (key_id, secret) {
            (None, _) => Ok(None),
            (Some(_), None) => Err(Error::Auth(
                "apiKeySecret is required when apiKeyID is set".to_string(),
            )),
            (Some(id), Some(secret)) => Self::new(id, secret).map(Some),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign `verb + path + expires + body`
    pub fn sign(&self, verb: &str, path: &str, expires: u64, body: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Auth(format!("Invalid API secret: {e}")))?;
        mac.update(verb.as_bytes());
        mac.update(path.as_bytes());
        mac.update(expires.to_string().as_bytes());
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Append signed auth parameters to a realtime URL, expiring at `expires`
    pub fn sign_url_at(&self, url: &str, expires: u64) -> Result<String> {
        let signature = self.sign("GET", REALTIME_PATH, expires, "")?;
        let separator = if url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{url}{separator}api-expires={expires}&api-signature={signature}&api-key={}",
            self.key_id
        ))
    }

    /// Append signed auth parameters valid for [`SIGNATURE_TTL_SECS`]
    pub fn sign_url(&self, url: &str) -> Result<String> {
        self.sign_url_at(url, expiry_from_now()?)
    }
}

fn expiry_from_now() -> Result<u64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Auth(format!("System clock before UNIX epoch: {e}")))?;
    Ok(now.as_secs() + SIGNATURE_TTL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Known-answer vector from the public REST authentication docs
    const DOC_KEY: &str = "LAqUlngMIQkIUjXMUreyu3qn";
    const DOC_SECRET: &str = "chNOOS4KvNXR_Xq4k4c9qsfoKWvnDecLATCRlcBwyKDYnWgO";

    #[test]
    fn test_sign_known_vector() {
        let creds = ApiCredentials::new(DOC_KEY, DOC_SECRET).unwrap();
        let signature = creds
            .sign("GET", "/api/v1/instrument", 1518064236, "")
            .unwrap();
        assert_eq!(
            signature,
            "c7682d435d0cfe87c16098df34ef2eb5a549d4c5a3c2b1f0f77b8af73423bf00"
        );
    }

    #[test]
    fn test_sign_is_deterministic() {
        let creds = ApiCredentials::new("id", "secret").unwrap();
        let a = creds.sign("GET", "/realtime", 100, "").unwrap();
        let b = creds.sign("GET", "/realtime", 100, "").unwrap();
        let c = creds.sign("GET", "/realtime", 101, "").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_sign_url_at() {
        let creds = ApiCredentials::new("id", "secret").unwrap();
        let signature = creds.sign("GET", "/realtime", 100, "").unwrap();

        let url = creds
            .sign_url_at("wss://ws.bitmex.com/realtime", 100)
            .unwrap();
        assert_eq!(
            url,
            format!("wss://ws.bitmex.com/realtime?api-expires=100&api-signature={signature}&api-key=id")
        );

        let url = creds
            .sign_url_at("wss://ws.bitmex.com/realtime?heartbeat=true", 100)
            .unwrap();
        assert!(url.contains("heartbeat=true&api-expires=100"));
    }

    #[test]
    fn test_sign_url_uses_future_expiry() {
        let creds = ApiCredentials::new("id", "secret").unwrap();
        let url = creds.sign_url("wss://ws.bitmex.com/realtime").unwrap();
        let expires: u64 = url
            .split("api-expires=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .and_then(|v| v.parse().ok())
            .unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(expires > now);
    }

    #[test]
    fn test_empty_credentials_rejected() {
        assert!(matches!(ApiCredentials::new("", "secret"), Err(Error::Auth(_))));
        assert!(matches!(ApiCredentials::new("id", ""), Err(Error::Auth(_))));
    }

    #[test]
    fn test_from_parts() {
        assert!(ApiCredentials::from_parts(None, None).unwrap().is_none());
        assert!(ApiCredentials::from_parts(None, Some("secret")).unwrap().is_none());
        assert!(ApiCredentials::from_parts(Some("id"), None).is_err());
        let creds = ApiCredentials::from_parts(Some("id"), Some("secret"))
            .unwrap()
            .unwrap();
        assert_eq!(creds.key_id(), "id");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = ApiCredentials::new("id", "super-secret").unwrap();
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("id"));
        assert!(!debug_str.contains("super-secret"));
    }
}
