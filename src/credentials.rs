use std::sync::Arc;

use crate::token::SharedKeySigner;

/// How a device authenticates to the service.
#[derive(Clone)]
pub enum Authentication {
    /// Client certificate + private key, DER-encoded, with an optional
    /// password protecting the private key.
    Certificate {
        der: Vec<u8>,
        password: Option<String>,
    },
    /// A long-lived shared key; the transport refreshes the SAS token
    /// itself on a timer (see [`crate::token::TokenRefresher`]).
    SharedKey(SharedKeySigner),
    /// A signature the caller computed out of band, used as-is for the
    /// lifetime of the connection.
    PrecomputedSasToken(String),
}

/// Device (or module) identity plus how it authenticates.
#[derive(Clone)]
pub struct ConnectionCredentials {
    host: String,
    device_id: String,
    module_id: Option<String>,
    auth: Authentication,
}

impl ConnectionCredentials {
    pub fn builder(host: impl Into<String>, device_id: impl Into<String>) -> CredentialsBuilder {
        CredentialsBuilder::new(host, device_id)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    pub fn authentication(&self) -> &Authentication {
        &self.auth
    }

    /// `deviceId` or `deviceId/moduleId`, used as the MQTT client id.
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }

    /// The resource URI a SAS signature is computed over: `{host}/devices/{deviceId}`,
    /// with `/modules/{moduleId}` appended for module identities.
    pub fn resource_uri(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "{}/devices/{}/modules/{}",
                self.host, self.device_id, module_id
            ),
            None => format!("{}/devices/{}", self.host, self.device_id),
        }
    }
}

/// Fluent builder mirroring the teacher SDK's `with_*` chaining idiom,
/// validated once at [`CredentialsBuilder::build`] rather than deep inside
/// the transport handler.
pub struct CredentialsBuilder {
    host: String,
    device_id: String,
    module_id: Option<String>,
    auth: Option<Authentication>,
}

impl CredentialsBuilder {
    pub fn new(host: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            device_id: device_id.into(),
            module_id: None,
            auth: None,
        }
    }

    pub fn with_module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_certificate(mut self, der: Vec<u8>, password: Option<String>) -> Self {
        self.auth = Some(Authentication::Certificate { der, password });
        self
    }

    pub fn with_shared_key(mut self, key_base64: impl Into<String>) -> Self {
        self.auth = Some(Authentication::SharedKey(SharedKeySigner::new(
            key_base64.into(),
            None,
        )));
        self
    }

    pub fn with_shared_key_named(
        mut self,
        key_base64: impl Into<String>,
        key_name: impl Into<String>,
    ) -> Self {
        self.auth = Some(Authentication::SharedKey(SharedKeySigner::new(
            key_base64.into(),
            Some(key_name.into()),
        )));
        self
    }

    pub fn with_precomputed_sas(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(Authentication::PrecomputedSasToken(token.into()));
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<ConnectionCredentials>> {
        let auth = self
            .auth
            .ok_or_else(|| anyhow::anyhow!("no authentication method configured"))?;
        if self.host.is_empty() {
            anyhow::bail!("host must not be empty");
        }
        if self.device_id.is_empty() {
            anyhow::bail!("device_id must not be empty");
        }
        Ok(Arc::new(ConnectionCredentials {
            host: self.host,
            device_id: self.device_id,
            module_id: self.module_id,
            auth,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_includes_module_when_present() {
        let creds = ConnectionCredentials::builder("hub.example.net", "dev-1")
            .with_module_id("mod-1")
            .with_shared_key("a2V5")
            .build()
            .unwrap();
        assert_eq!(creds.client_id(), "dev-1/mod-1");
        assert_eq!(
            creds.resource_uri(),
            "hub.example.net/devices/dev-1/modules/mod-1"
        );
    }

    #[test]
    fn device_only_resource_uri() {
        let creds = ConnectionCredentials::builder("hub.example.net", "dev-1")
            .with_shared_key("a2V5")
            .build()
            .unwrap();
        assert_eq!(creds.client_id(), "dev-1");
        assert_eq!(creds.resource_uri(), "hub.example.net/devices/dev-1");
    }

    #[test]
    fn build_fails_without_authentication() {
        let err = ConnectionCredentials::builder("hub.example.net", "dev-1").build();
        assert!(err.is_err());
    }
}
