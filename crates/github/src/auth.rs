use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use http::Method;
use indent_core::models::{AppId, InstallationId};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{Error, PER_PAGE, PageParams, Result, api::ApiClient, clock::Clock};

/// Assertions are backdated to tolerate clock drift against the platform.
pub const ASSERTION_BACKDATE: Duration = Duration::from_secs(60);
/// The platform rejects assertions valid for longer than ten minutes.
pub const ASSERTION_LIFETIME: Duration = Duration::from_secs(600);

/// The app's own identity: its id and RSA signing key.
pub struct AppIdentity {
    app_id: AppId,
    key: EncodingKey,
}

impl AppIdentity {
    pub fn from_pem(app_id: AppId, pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::Config(format!("Invalid private key for app {app_id}: {e}")))?;
        Ok(Self { app_id, key })
    }

    pub fn app_id(&self) -> AppId { self.app_id }
}

impl fmt::Debug for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppIdentity").field("app_id", &self.app_id).finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// A short-lived RS256 JWT identifying the app itself.
#[derive(Clone)]
pub struct SignedAssertion {
    pub token: String,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl fmt::Debug for SignedAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedAssertion")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Signs `{iss, iat, exp}` with `iat` backdated by [`ASSERTION_BACKDATE`] and
/// `exp - iat` equal to [`ASSERTION_LIFETIME`].
///
/// `exp` is anchored to the backdated `iat`, so it lands at `now + 540s`
/// rather than `now + 600s`. The platform bounds `exp - iat` at ten minutes,
/// and anchoring `exp` to `now` would exceed that by the backdate.
pub fn mint_assertion(identity: &AppIdentity, now: OffsetDateTime) -> Result<SignedAssertion> {
    let issued_at = now - ASSERTION_BACKDATE;
    let expires_at = issued_at + ASSERTION_LIFETIME;
    let claims = Claims {
        iat: issued_at.unix_timestamp(),
        exp: expires_at.unix_timestamp(),
        iss: identity.app_id.to_string(),
    };
    let token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &identity.key)
        .map_err(|e| Error::Config(format!("Failed to sign app assertion: {e}")))?;
    Ok(SignedAssertion { token, issued_at, expires_at })
}

/// A scoped installation access token.
#[derive(Clone)]
pub struct InstallationCredential {
    token: String,
    pub expires_at: OffsetDateTime,
    pub installation_id: InstallationId,
}

impl InstallationCredential {
    pub fn token(&self) -> &str { &self.token }

    /// Usable while `now` is more than `margin` before expiry.
    pub fn is_fresh(&self, now: OffsetDateTime, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl fmt::Debug for InstallationCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationCredential")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("installation_id", &self.installation_id)
            .finish()
    }
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    token: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
}

#[derive(Deserialize)]
struct Installation {
    id: InstallationId,
    account: Option<Account>,
}

#[derive(Deserialize)]
struct Account {
    login: String,
}

/// Mints installation credentials and caches one per installation.
pub struct Credentials {
    identity: AppIdentity,
    api: ApiClient,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
    // Held across the check, the exchange and the write so concurrent
    // callers never mint the same installation twice.
    cache: Mutex<HashMap<InstallationId, InstallationCredential>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(identity: AppIdentity, api: ApiClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity,
            api,
            clock,
            refresh_margin: Duration::from_secs(600),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn api(&self) -> &ApiClient { &self.api }

    pub fn clock(&self) -> &Arc<dyn Clock> { &self.clock }

    pub fn app_id(&self) -> AppId { self.identity.app_id }

    pub fn app_assertion(&self) -> Result<SignedAssertion> {
        mint_assertion(&self.identity, self.clock.now())
    }

    pub async fn get_installation_credential(
        &self,
        installation_id: InstallationId,
    ) -> Result<InstallationCredential> {
        let mut cache = self.cache.lock().await;
        let now = self.clock.now();
        if let Some(credential) = cache.get(&installation_id) {
            if credential.is_fresh(now, self.refresh_margin) {
                return Ok(credential.clone());
            }
            tracing::debug!("Installation {} token expiring, re-minting", installation_id);
            cache.remove(&installation_id);
        }
        let credential = self.exchange(installation_id).await?;
        cache.insert(installation_id, credential.clone());
        Ok(credential)
    }

    /// Drops the cached credential, e.g. after the installation was removed.
    pub async fn invalidate(&self, installation_id: InstallationId) -> bool {
        self.cache.lock().await.remove(&installation_id).is_some()
    }

    async fn exchange(&self, installation_id: InstallationId) -> Result<InstallationCredential> {
        let assertion = self.app_assertion()?;
        let endpoint = format!("/app/installations/{installation_id}/access_tokens");
        let builder = self.api.request(Method::POST, &endpoint, &assertion.token)?;
        let (status, body) = self.api.send_raw(&endpoint, builder).await?;
        if !status.is_success() {
            return Err(Error::Auth {
                endpoint,
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let response: AccessTokenResponse = crate::api::decode(&endpoint, &body)?;
        tracing::info!(
            "Minted token for installation {} (expires {})",
            installation_id,
            response.expires_at
        );
        Ok(InstallationCredential {
            token: response.token,
            expires_at: response.expires_at,
            installation_id,
        })
    }

    /// Finds the installation whose account is `owner`.
    pub async fn find_installation(&self, owner: &str) -> Result<InstallationId> {
        let assertion = self.app_assertion()?;
        let endpoint = "/app/installations";
        let mut page = 1;
        loop {
            let builder = self
                .api
                .request(Method::GET, endpoint, &assertion.token)?
                .query(&PageParams { per_page: PER_PAGE, page });
            let installations: Vec<Installation> = self.api.send_json(endpoint, builder).await?;
            if let Some(installation) = installations.iter().find(|i| {
                i.account.as_ref().is_some_and(|a| a.login.eq_ignore_ascii_case(owner))
            }) {
                tracing::info!("Found installation {} for {}", installation.id, owner);
                return Ok(installation.id);
            }
            if installations.len() < PER_PAGE {
                break;
            }
            page += 1;
        }
        Err(Error::NotFound {
            endpoint: endpoint.to_string(),
            body: format!("No installation of app {} found for {owner}", self.identity.app_id),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool { self.cache.try_lock().is_err() }
}

#[cfg(test)]
pub(crate) mod testing {
    use url::Url;
    use wiremock::MockServer;

    use super::*;

    pub const PRIVATE_KEY: &str = include_str!("../tests/fixtures/app-key.pem");
    pub const PUBLIC_KEY: &str = include_str!("../tests/fixtures/app-key.pub.pem");

    pub fn identity() -> AppIdentity {
        AppIdentity::from_pem(AppId(12345), PRIVATE_KEY.as_bytes()).unwrap()
    }

    pub fn credentials(server: &MockServer, clock: Arc<dyn Clock>) -> Credentials {
        let api = ApiClient::new(Url::parse(&server.uri()).unwrap()).unwrap();
        Credentials::new(identity(), api, clock)
    }

    /// Serves a token for installation 1 that expires one hour after the
    /// manual clock's start.
    pub fn token_response() -> serde_json::Value {
        serde_json::json!({
            "token": "ghs_installation",
            "expires_at": "2025-03-01T13:00:00Z",
            "permissions": { "actions": "write" },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use jsonwebtoken::{DecodingKey, Validation};
    use time::macros::datetime;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header_exists, method, path, query_param},
    };

    use super::{testing::*, *};
    use crate::{ErrorKind, clock::testing::ManualClock};

    #[test]
    fn test_assertion_time_contract() {
        let now = datetime!(2025-03-01 12:00:00 UTC);
        let assertion = mint_assertion(&identity(), now).unwrap();
        assert_eq!(assertion.issued_at, now - Duration::from_secs(60));
        assert_eq!(assertion.expires_at - assertion.issued_at, time::Duration::minutes(10));
        assert!(assertion.expires_at <= now + Duration::from_secs(600));
        // Anchored to the backdated issue time, not to now
        assert_eq!(assertion.expires_at, now + Duration::from_secs(540));

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::from(["exp".to_string(), "iss".to_string()]);
        let decoded = jsonwebtoken::decode::<Claims>(
            &assertion.token,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.header.alg, Algorithm::RS256);
        assert_eq!(decoded.claims.iss, "12345");
        assert_eq!(decoded.claims.iat, now.unix_timestamp() - 60);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 600);
    }

    #[tokio::test]
    async fn test_debug_output_is_redacted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/1/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(token_response()))
            .mount(&server)
            .await;
        let credentials = credentials(&server, Arc::new(ManualClock::start()));
        let credential = credentials.get_installation_credential(InstallationId(1)).await.unwrap();
        let rendered = format!("{credentials:?} {credential:?}");
        assert!(rendered.contains("12345"), "{rendered}");
        assert!(!rendered.contains("ghs_installation"), "{rendered}");
        assert!(!rendered.contains("PRIVATE KEY"), "{rendered}");
    }

    #[test]
    fn test_malformed_key_is_config_error() {
        let err = AppIdentity::from_pem(AppId(1), b"not a key").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_cached_credential_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/1/access_tokens"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(201).set_body_json(token_response()))
            .expect(1)
            .mount(&server)
            .await;
        let clock = Arc::new(ManualClock::start());
        let credentials = credentials(&server, clock.clone());

        let first = credentials.get_installation_credential(InstallationId(1)).await.unwrap();
        clock.advance(Duration::from_secs(30 * 60));
        let second = credentials.get_installation_credential(InstallationId(1)).await.unwrap();
        assert_eq!(first.token(), "ghs_installation");
        assert_eq!(second.token(), first.token());
        assert_eq!(second.installation_id, InstallationId(1));
    }

    #[tokio::test]
    async fn test_expired_credential_is_reminted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/1/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(token_response()))
            .expect(2)
            .mount(&server)
            .await;
        let clock = Arc::new(ManualClock::start());
        let credentials = credentials(&server, clock.clone());

        credentials.get_installation_credential(InstallationId(1)).await.unwrap();
        // Past expires_at - margin (12:50)
        clock.advance(Duration::from_secs(51 * 60));
        credentials.get_installation_credential(InstallationId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_credentials_are_per_installation() {
        let server = MockServer::start().await;
        for id in [1, 2] {
            Mock::given(method("POST"))
                .and(path(format!("/app/installations/{id}/access_tokens")))
                .respond_with(ResponseTemplate::new(201).set_body_json(token_response()))
                .expect(1)
                .mount(&server)
                .await;
        }
        let credentials = credentials(&server, Arc::new(ManualClock::start()));
        for id in [1, 2, 1, 2] {
            credentials.get_installation_credential(InstallationId(id)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_mint_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/1/access_tokens"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(token_response())
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let credentials = Arc::new(credentials(&server, Arc::new(ManualClock::start())));
        let mut handles = vec![];
        for _ in 0..8 {
            let credentials = credentials.clone();
            handles.push(tokio::spawn(async move {
                credentials.get_installation_credential(InstallationId(1)).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().token(), "ghs_installation");
        }
        assert!(!credentials.is_locked());
    }

    #[tokio::test]
    async fn test_rejected_exchange_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/1/access_tokens"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Integration not found"))
            .mount(&server)
            .await;
        let credentials = credentials(&server, Arc::new(ManualClock::start()));
        match credentials.get_installation_credential(InstallationId(1)).await {
            Err(Error::Auth { status, body, .. }) => {
                assert_eq!(status, http::StatusCode::NOT_FOUND);
                assert_eq!(body, "Integration not found");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Nothing cached after a failure
        assert!(!credentials.invalidate(InstallationId(1)).await);
    }

    #[tokio::test]
    async fn test_invalidate_forces_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/1/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(token_response()))
            .expect(2)
            .mount(&server)
            .await;
        let credentials = credentials(&server, Arc::new(ManualClock::start()));
        credentials.get_installation_credential(InstallationId(1)).await.unwrap();
        assert!(credentials.invalidate(InstallationId(1)).await);
        credentials.get_installation_credential(InstallationId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_find_installation_by_owner() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/installations"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": 10, "account": { "login": "someone-else" } },
                { "id": 11, "account": { "login": "Exponent-Run" } },
            ])))
            .mount(&server)
            .await;
        let credentials = credentials(&server, Arc::new(ManualClock::start()));
        assert_eq!(credentials.find_installation("exponent-run").await.unwrap(), InstallationId(11));
        let err = credentials.find_installation("nobody").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
