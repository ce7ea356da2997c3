//! WS-Security UsernameToken (PasswordDigest profile) for ONVIF SOAP calls.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use sha1::{Digest, Sha1};
use uuid::Uuid;

const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
const PASSWORD_DIGEST_TYPE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";
const BASE64_ENCODING: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// One signed token; a fresh nonce and timestamp per request.
#[derive(Debug, Clone)]
pub struct UsernameToken {
    username: String,
    digest: String,
    nonce: String,
    created: String,
}

impl UsernameToken {
    pub fn sign(username: &str, password: &str) -> Self {
        Self::sign_with(username, password, Uuid::new_v4().as_bytes(), Utc::now())
    }

    /// PasswordDigest = Base64(SHA1(nonce + created + password))
    pub fn sign_with(username: &str, password: &str, nonce: &[u8], created: DateTime<Utc>) -> Self {
        let created = created.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();

        let mut hasher = Sha1::new();
        hasher.update(nonce);
        hasher.update(created.as_bytes());
        hasher.update(password.as_bytes());

        Self {
            username: username.to_string(),
            digest: BASE64.encode(hasher.finalize()),
            nonce: BASE64.encode(nonce),
            created,
        }
    }

    /// `<wsse:Security>` element for the SOAP header.
    pub fn to_header(&self) -> String {
        format!(
            concat!(
                r#"<wsse:Security xmlns:wsse="{}" xmlns:wsu="{}">"#,
                "<wsse:UsernameToken>",
                "<wsse:Username>{}</wsse:Username>",
                r#"<wsse:Password Type="{}">{}</wsse:Password>"#,
                r#"<wsse:Nonce EncodingType="{}">{}</wsse:Nonce>"#,
                "<wsu:Created>{}</wsu:Created>",
                "</wsse:UsernameToken>",
                "</wsse:Security>"
            ),
            WSSE_NS,
            WSU_NS,
            escape(self.username.as_str()),
            PASSWORD_DIGEST_TYPE,
            self.digest,
            BASE64_ENCODING,
            self.nonce,
            self.created
        )
    }
}
