//! SAS token signing and the background refresh loop that keeps a
//! connection's password fresh before it expires. Loop shape grounded on
//! the teacher's `iothub/token_handler.rs::refresh_tokens()`; the signing
//! math has no teacher counterpart (it delegates to a registration
//! service) and is grounded on the HMAC-signing idiom confirmed across
//! the pack (`aws-iot-core/src/security.rs`).

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, SdkError};

type HmacSha256 = Hmac<Sha256>;

/// Fraction of the requested TTL after which the token is considered due
/// for renewal, mirroring the teacher's clock-skew safety margin.
const REFRESH_FRACTION: f64 = 0.8;

/// Computes SAS signatures from a long-lived shared key.
#[derive(Clone)]
pub struct SharedKeySigner {
    key_base64: String,
    key_name: Option<String>,
}

impl SharedKeySigner {
    pub fn new(key_base64: String, key_name: Option<String>) -> Self {
        Self {
            key_base64,
            key_name,
        }
    }

    /// Issues a SAS token for `resource_uri`, valid until `now + ttl`.
    /// Returns the token string and the instant at which it should be
    /// refreshed (80% of the way to expiry).
    pub fn issue(
        &self,
        resource_uri: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<IssuedToken> {
        let expiry = now.timestamp() + ttl.as_secs() as i64;
        let encoded_uri = urlencoding::encode(resource_uri).into_owned();
        let signing_string = format!("{encoded_uri}\n{expiry}");

        let key_bytes = BASE64
            .decode(self.key_base64.as_bytes())
            .map_err(|e| anyhow::anyhow!("shared key is not valid base64: {e}"))?;
        let mut mac = HmacSha256::new_from_slice(&key_bytes)
            .map_err(|e| anyhow::anyhow!("invalid HMAC key length: {e}"))?;
        mac.update(signing_string.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        let encoded_signature = urlencoding::encode(&signature).into_owned();

        let mut token =
            format!("SharedAccessSignature sr={encoded_uri}&sig={encoded_signature}&se={expiry}");
        if let Some(key_name) = &self.key_name {
            token.push_str(&format!("&skn={key_name}"));
        }

        let refresh_on = now + chrono::Duration::milliseconds(
            (ttl.as_millis() as f64 * REFRESH_FRACTION) as i64,
        );
        Ok(IssuedToken { token, refresh_on })
    }
}

/// A freshly-issued SAS token and when it should be renewed. `refresh_on
/// = None` means the token never needs renewal (used by
/// [`crate::credentials::Authentication::PrecomputedSasToken`]).
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub refresh_on: DateTime<Utc>,
}

/// Commands the owning transport handler can send into a running
/// refresh loop.
pub enum TokenRefresherCommand {
    /// Force an immediate re-issue, e.g. after a reconnect.
    RefreshNow,
}

/// Runs the periodic SAS re-issue loop. Owned exclusively by the
/// transport handler and stopped via its `CancellationToken` on close,
/// mirroring the teacher's `TokenHandler` lifecycle.
pub struct TokenRefresher {
    signer: SharedKeySigner,
    resource_uri: String,
    ttl: Duration,
    tokens_tx: watch::Sender<Option<String>>,
}

impl TokenRefresher {
    pub fn new(signer: SharedKeySigner, resource_uri: String, ttl: Duration) -> Self {
        let (tokens_tx, _) = watch::channel(None);
        Self {
            signer,
            resource_uri,
            ttl,
            tokens_tx,
        }
    }

    /// A receiver that always observes the most recently issued token.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tokens_tx.subscribe()
    }

    /// Runs until `cancel` fires. Transient signing failures are logged
    /// and retried after a short pause rather than terminating the loop,
    /// matching the teacher's `refresh_tokens` behavior on a failed
    /// registration round-trip.
    pub async fn run(
        self,
        mut commands: tokio::sync::mpsc::Receiver<TokenRefresherCommand>,
        cancel: CancellationToken,
    ) {
        const RETRY_PAUSE: Duration = Duration::from_secs(30);

        loop {
            let issued = self.signer.issue(&self.resource_uri, self.ttl, Utc::now());
            let sleep_until = match issued {
                Ok(issued) => {
                    log::debug!("issued SAS token, refresh scheduled at {}", issued.refresh_on);
                    let _ = self.tokens_tx.send(Some(issued.token));
                    let now = Utc::now();
                    let delay = (issued.refresh_on - now)
                        .to_std()
                        .unwrap_or(Duration::from_secs(0));
                    delay
                }
                Err(err) => {
                    log::warn!("failed to issue SAS token, retrying in {RETRY_PAUSE:?}: {err}");
                    RETRY_PAUSE
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("token refresher cancelled");
                    return;
                }
                _ = tokio::time::sleep(sleep_until) => {}
                Some(TokenRefresherCommand::RefreshNow) = commands.recv() => {
                    log::debug!("token refresh requested out of band");
                }
            }
        }
    }
}

pub fn tls_auth_error(message: impl Into<String>) -> SdkError {
    SdkError::new(ErrorKind::TlsAuthenticationError, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_produces_well_formed_token() {
        let signer = SharedKeySigner::new(BASE64.encode(b"0123456789abcdef"), None);
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let issued = signer
            .issue("hub.example.net/devices/dev-1", Duration::from_secs(3600), now)
            .unwrap();
        assert!(issued.token.starts_with("SharedAccessSignature sr="));
        assert!(issued.token.contains("&sig="));
        assert!(issued.token.contains("&se="));
        assert!(issued.refresh_on > now);
        assert!(issued.refresh_on < now + chrono::Duration::seconds(3600));
    }

    #[test]
    fn issue_includes_key_name_when_present() {
        let signer = SharedKeySigner::new(BASE64.encode(b"0123456789abcdef"), Some("device01".into()));
        let issued = signer
            .issue("hub/devices/d", Duration::from_secs(60), Utc::now())
            .unwrap();
        assert!(issued.token.ends_with("&skn=device01"));
    }

    #[test]
    fn issue_rejects_invalid_base64_key() {
        let signer = SharedKeySigner::new("not-base64!!".into(), None);
        assert!(signer.issue("hub/devices/d", Duration::from_secs(60), Utc::now()).is_err());
    }

    #[test]
    fn refresh_on_is_eighty_percent_of_ttl() {
        let signer = SharedKeySigner::new(BASE64.encode(b"0123456789abcdef"), None);
        let now = Utc::now();
        let issued = signer
            .issue("hub/devices/d", Duration::from_secs(1000), now)
            .unwrap();
        let delta = (issued.refresh_on - now).num_seconds();
        assert_eq!(delta, 800);
    }
}
