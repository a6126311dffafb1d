//! Credential & Token Manager (C4): mints short-lived service-account
//! bearer tokens for a session, rotates them before expiry, and validates
//! that the integration credentials a session's containers reference via
//! `ValueFrom` actually exist before a pod is composed.
//!
//! The composer (C3) embeds the *shape* of the credential references
//! (secret name + key) deterministically, with no I/O; this module is what
//! actually mints the token value and, in `Pending`, checks that the
//! referenced secrets are present so a missing mandatory credential fails
//! the session early with a clear message rather than a stuck pod.

use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::Request;
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::resource::Session;

/// Name of the per-project secret mirroring object-store credentials.
/// Read by the composer (env-ref shape) and validated here (existence).
pub const OBJECT_STORE_SECRET_NAME: &str = "object-store-credentials";
pub const OBJECT_STORE_ACCESS_KEY_FIELD: &str = "accessKeyId";
pub const OBJECT_STORE_SECRET_KEY_FIELD: &str = "secretAccessKey";

/// Name of the per-project secret mirroring the git hosting provider token.
pub const GIT_PROVIDER_SECRET_NAME: &str = "git-provider-credentials";
pub const GIT_PROVIDER_TOKEN_FIELD: &str = "token";

const TOKEN_SECRET_KEY: &str = "token";
const ANNOTATION_ISSUED_AT: &str = "sessions.agentic.io/token-issued-at";
const FIELD_MANAGER: &str = "session-controller-credentials";

/// What a `Pending` reconcile needs to know about the project's integration
/// secrets before it is safe to compose a pod: whether each one is present.
/// Only the object-store secret is ever mandatory (hydrate cannot work
/// without it once an object-store endpoint is configured); a missing git
/// provider secret just means no provider token is injected.
pub struct IntegrationSecrets {
    pub object_store_present: bool,
    pub git_provider_present: bool,
}

/// Checks which of the per-project integration secrets referenced by the
/// composed pod actually exist in the session's namespace. Does not read
/// their contents -- the pod consumes them via `ValueFrom`, never the
/// controller.
pub async fn verify_integration_secrets(
    client: &Client,
    namespace: &str,
) -> Result<IntegrationSecrets> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    Ok(IntegrationSecrets {
        object_store_present: secrets.get_opt(OBJECT_STORE_SECRET_NAME).await?.is_some(),
        git_provider_present: secrets.get_opt(GIT_PROVIDER_SECRET_NAME).await?.is_some(),
    })
}

/// Ensures the per-session `ServiceAccount` exists; idempotent (server-side
/// apply, forced, so a concurrent or retried reconcile never conflicts).
pub async fn ensure_service_account(client: &Client, sa: &ServiceAccount) -> Result<()> {
    let namespace = sa.namespace().ok_or_else(|| {
        Error::MissingMetadata("service account is missing .metadata.namespace".to_string())
    })?;
    let name = sa.name_any();
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(sa),
    )
    .await?;
    Ok(())
}

/// State of the per-session token secret as the reconciler cares about it.
pub struct TokenState {
    pub issued_at: DateTime<Utc>,
}

/// Mints a bounded-lifetime bearer token for `service_account_name` via the
/// `TokenRequest` subresource and stores it in `secret_name`, owned by the
/// session. Used both to provision the token the first time (`Pending`) and
/// to rotate it in place (`Running`, §4.4.2) -- the mounted file picks up
/// the new value on the kubelet's next projection interval.
pub async fn mint_and_store_token(
    client: &Client,
    namespace: &str,
    service_account_name: &str,
    secret_name: &str,
    owner_references: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>,
    labels: BTreeMap<String, String>,
    lifetime: Duration,
) -> Result<TokenState> {
    let token = request_token(client, namespace, service_account_name, lifetime).await?;
    let issued_at = Utc::now();

    let secret = Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(owner_references),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_ISSUED_AT.to_string(),
                issued_at.to_rfc3339(),
            )])),
            ..Default::default()
        },
        string_data: None,
        data: Some(BTreeMap::from([(
            TOKEN_SECRET_KEY.to_string(),
            ByteString(token.into_bytes()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .patch(
            secret_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;

    Ok(TokenState { issued_at })
}

/// Reads the issue time recorded on an existing token secret, if any.
pub async fn read_token_state(client: &Client, namespace: &str, secret_name: &str) -> Result<Option<TokenState>> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = secrets.get_opt(secret_name).await? else {
        return Ok(None);
    };
    let issued_at = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_ISSUED_AT))
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Ok(issued_at.map(|issued_at| TokenState { issued_at }))
}

/// Deletes the per-session token secret; called when a session reaches a
/// terminal phase (§3: "Deleted when the session reaches a terminal phase").
pub async fn delete_token_secret(client: &Client, namespace: &str, secret_name: &str) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    match secrets.delete(secret_name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Pure decision: does a token issued at `issued_at` need refreshing given
/// `now` and the configured `lifetime`? True once remaining lifetime drops
/// below one quarter of the total (§4.4.2, equivalently elapsed >= 3/4).
pub fn needs_refresh(issued_at: DateTime<Utc>, now: DateTime<Utc>, lifetime: Duration) -> bool {
    let elapsed = (now - issued_at).to_std().unwrap_or_default();
    elapsed >= lifetime * 3 / 4
}

async fn request_token(
    client: &Client,
    namespace: &str,
    service_account_name: &str,
    lifetime: Duration,
) -> Result<String> {
    let token_request = TokenRequest {
        spec: TokenRequestSpec {
            expiration_seconds: Some(lifetime.as_secs() as i64),
            ..Default::default()
        },
        ..Default::default()
    };
    let body = serde_json::to_vec(&token_request)?;

    let url_path = <ServiceAccount as Resource>::url_path(&(), Some(namespace));
    let request = Request { url_path };
    let request =
        request.create_subresource("token", service_account_name, &PostParams::default(), body)?;
    let response: TokenRequest = client.request(request).await?;
    response
        .status
        .map(|s| s.token)
        .ok_or_else(|| Error::MissingCredential(format!(
            "TokenRequest for {namespace}/{service_account_name} returned no token"
        )))
}

/// Operator-level config bundled with a client, for call sites that thread
/// credential operations through the reconciler's `Context`.
pub struct TokenManager<'a> {
    pub client: &'a Client,
    pub config: &'a OperatorConfig,
}

impl<'a> TokenManager<'a> {
    pub fn new(client: &'a Client, config: &'a OperatorConfig) -> Self {
        Self { client, config }
    }

    /// Mints a token if `session`'s secret is missing, or refreshes it in
    /// place if it exists but has crossed the refresh threshold. Returns
    /// `true` if a mint/refresh actually happened.
    pub async fn ensure_or_refresh(
        &self,
        session: &Session,
        service_account_name: &str,
        secret_name: &str,
        owner_references: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>,
        labels: BTreeMap<String, String>,
    ) -> Result<bool> {
        let namespace = session.namespace().ok_or_else(|| {
            Error::MissingMetadata("session is missing .metadata.namespace".to_string())
        })?;
        let existing = read_token_state(self.client, &namespace, secret_name).await?;
        let should_mint = match &existing {
            None => true,
            Some(state) => needs_refresh(state.issued_at, Utc::now(), self.config.token_lifetime()),
        };
        if should_mint {
            mint_and_store_token(
                self.client,
                &namespace,
                service_account_name,
                secret_name,
                owner_references,
                labels,
                self.config.token_lifetime(),
            )
            .await?;
        }
        Ok(should_mint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn refresh_not_needed_before_three_quarters_lifetime() {
        let lifetime = Duration::from_secs(3600);
        let issued_at = Utc::now() - ChronoDuration::seconds(2600);
        assert!(!needs_refresh(issued_at, Utc::now(), lifetime));
    }

    #[test]
    fn refresh_needed_at_three_quarters_lifetime() {
        let lifetime = Duration::from_secs(3600);
        let issued_at = Utc::now() - ChronoDuration::seconds(2700);
        assert!(needs_refresh(issued_at, Utc::now(), lifetime));
    }

    #[test]
    fn refresh_needed_past_full_lifetime() {
        let lifetime = Duration::from_secs(3600);
        let issued_at = Utc::now() - ChronoDuration::seconds(4000);
        assert!(needs_refresh(issued_at, Utc::now(), lifetime));
    }
}
