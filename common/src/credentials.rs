//! Credential resolution and object-store client construction.
//!
//! Resolution order, first match wins: explicit static keys (with an optional
//! session token) → named profile → role assumption (with an optional
//! external id) → ambient environment. Resolved keys are injected into an
//! `AmazonS3Builder`; clients are cached per credential bundle and bucket so
//! concurrent callers share them.

use std::collections::HashMap;
use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use parking_lot::RwLock;
use serde::Deserialize;
use ::tracing::{debug, warn};

/// A credential bundle as supplied by the caller. All fields optional; an
/// empty bundle means "use whatever the environment provides".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct Credentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub profile: Option<String>,
    pub role_arn: Option<String>,
    pub external_id: Option<String>,

    /// RFC 3339 expiry of temporary credentials, when known. Only used to
    /// warn ahead of authentication failures.
    pub expiration: Option<String>,
}

impl Credentials {
    pub fn from_static_keys(access_key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            access_key_id: Some(access_key_id.into()),
            secret_access_key: Some(secret.into()),
            ..Default::default()
        }
    }

    /// Logs a warning when the bundle is expired or expires within 15 minutes.
    pub fn check_expiration(&self) {
        let Some(raw) = &self.expiration else {
            return;
        };
        let expires_at = match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                warn!(expiration = %raw, error = %e, "unparseable credential expiration timestamp");
                return;
            }
        };
        let remaining = expires_at - Utc::now();
        if remaining.num_seconds() <= 0 {
            warn!(%expires_at, "credentials are expired, requests will likely be denied");
        } else if remaining.num_minutes() < 15 {
            warn!(%expires_at, minutes_left = remaining.num_minutes(), "credentials expire soon");
        }
    }
}

/// Secret material must never appear in this error's text; the resolution
/// stage and the provider's own (key-free) message are all callers see.
#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("access denied: could not resolve credentials from {stage}: {message}")]
    AccessDenied { stage: &'static str, message: String },

    #[error("object store configuration error: {0}")]
    Store(#[from] object_store::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    bucket: String,
    region: Option<String>,
    credentials: Credentials,
}

/// Yields authenticated object-store clients on demand.
///
/// The cache is write-once per (bucket, region, bundle): on a racing miss the
/// first inserted client wins and the duplicate is dropped.
#[derive(Default)]
pub struct ClientProvider {
    clients: RwLock<HashMap<ClientKey, Arc<dyn ObjectStore>>>,
}

impl ClientProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn s3_client(
        &self,
        bucket: &str,
        region: Option<&str>,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ObjectStore>, CredentialsError> {
        let key = ClientKey {
            bucket: bucket.to_string(),
            region: region.map(str::to_string),
            credentials: credentials.clone(),
        };
        if let Some(client) = self.clients.read().get(&key) {
            return Ok(client.clone());
        }

        credentials.check_expiration();
        let client = build_s3_client(bucket, region, credentials).await?;
        let client = self
            .clients
            .write()
            .entry(key)
            .or_insert(client)
            .clone();
        Ok(client)
    }
}

async fn build_s3_client(
    bucket: &str,
    region: Option<&str>,
    credentials: &Credentials,
) -> Result<Arc<dyn ObjectStore>, CredentialsError> {
    // `from_env` keeps AWS_ENDPOINT and friends working for S3-compatible
    // stores; resolved keys below take precedence.
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
    if let Some(region) = region {
        builder = builder.with_region(region);
    }

    if let Some(keys) = resolve_keys(region, credentials).await? {
        builder = builder
            .with_access_key_id(keys.access_key_id)
            .with_secret_access_key(keys.secret_access_key);
        if let Some(token) = keys.session_token {
            builder = builder.with_token(token);
        }
    }

    Ok(Arc::new(builder.build()?))
}

struct ResolvedKeys {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl From<aws_credential_types::Credentials> for ResolvedKeys {
    fn from(creds: aws_credential_types::Credentials) -> Self {
        Self {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().map(str::to_string),
        }
    }
}

/// Walks the resolution order. Returns `None` when nothing is configured and
/// the ambient environment should be left to the store builder itself.
async fn resolve_keys(
    region: Option<&str>,
    credentials: &Credentials,
) -> Result<Option<ResolvedKeys>, CredentialsError> {
    if let (Some(key), Some(secret)) = (
        &credentials.access_key_id,
        &credentials.secret_access_key,
    ) {
        debug!("using static credentials");
        return Ok(Some(ResolvedKeys {
            access_key_id: key.clone(),
            secret_access_key: secret.clone(),
            session_token: credentials.session_token.clone(),
        }));
    }

    if let Some(profile) = &credentials.profile {
        debug!(profile, "resolving credentials from named profile");
        let provider = aws_config::profile::ProfileFileCredentialsProvider::builder()
            .profile_name(profile)
            .build();
        let keys = provider
            .provide_credentials()
            .await
            .map_err(|e| CredentialsError::AccessDenied {
                stage: "named profile",
                message: e.to_string(),
            })?;
        return Ok(Some(keys.into()));
    }

    if let Some(role_arn) = &credentials.role_arn {
        debug!(role_arn, "resolving credentials via role assumption");
        let mut builder = aws_config::sts::AssumeRoleProvider::builder(role_arn)
            .session_name("curq-session");
        if let Some(region) = region {
            builder = builder.region(aws_config::Region::new(region.to_string()));
        }
        if let Some(external_id) = &credentials.external_id {
            builder = builder.external_id(external_id);
        }
        let provider = builder.build().await;
        let keys = provider
            .provide_credentials()
            .await
            .map_err(|e| CredentialsError::AccessDenied {
                stage: "role assumption",
                message: e.to_string(),
            })?;
        return Ok(Some(keys.into()));
    }

    // Ambient environment. Resolve through the default chain so instance
    // profiles and SSO sessions work; absence of any provider is not an error
    // here because public buckets are still reachable.
    let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    match config.credentials_provider() {
        Some(provider) => match provider.provide_credentials().await {
            Ok(keys) => Ok(Some(keys.into())),
            Err(e) => {
                debug!(error = %e, "ambient credential chain yielded nothing");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}
