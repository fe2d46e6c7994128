//! HTTPS implementation of [`VerdaApi`].
//!
//! Every request carries a bearer token obtained with the OAuth2
//! client-credentials grant. The token is cached until shortly before it
//! expires and dropped when the API answers `401`, after which the request
//! is retried once with a fresh token.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::types::{CreateInstance, Instance, InstanceType, StartupScript};
use crate::VerdaApi;

pub const DEFAULT_API_URL: &str = "https://api.verda.com/v1";

/// Tokens are renewed this long before the server-side expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// API credentials and endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
}

impl Credentials {
    /// Read `VERDA_CLIENT_ID`, `VERDA_CLIENT_SECRET` and the optional
    /// `VERDA_API_URL` from the environment.
    pub fn from_env() -> ClientResult<Self> {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let (Some(client_id), Some(client_secret)) =
            (var("VERDA_CLIENT_ID"), var("VERDA_CLIENT_SECRET"))
        else {
            return Err(ClientError::Auth(
                "VERDA_CLIENT_ID and VERDA_CLIENT_SECRET env vars must be set".to_string(),
            ));
        };
        Ok(Self {
            client_id,
            client_secret,
            base_url: var("VERDA_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        })
    }
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct VerdaClient {
    http: Client,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl VerdaClient {
    pub fn new(credentials: Credentials) -> ClientResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            credentials,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.credentials.base_url.trim_end_matches('/'), path)
    }

    async fn bearer_token(&self) -> ClientResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let resp = self
            .http
            .post(self.url("/oauth2/token"))
            .json(&json!({
                "grant_type": "client_credentials",
                "client_id": self.credentials.client_id,
                "client_secret": self.credentials.client_secret,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Auth(format!("token request returned {status}: {body}")));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Decode(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!(expires_in = lifetime.as_secs(), "obtained Verda access token");

        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }

    async fn drop_token(&self) {
        *self.token.lock().await = None;
    }

    /// Send an authenticated request. Non-2xx answers become
    /// [`ClientError::Api`].
    async fn execute(&self, method: Method, path: &str, body: Option<Value>) -> ClientResult<Response> {
        let mut retried = false;
        loop {
            let token = self.bearer_token().await?;
            let mut request = self
                .http
                .request(method.clone(), self.url(path))
                .bearer_auth(token);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let resp = request.send().await?;
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !retried {
                warn!(%method, %path, "Verda API rejected token, re-authenticating");
                self.drop_token().await;
                retried = true;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                debug!(%method, %path, status = status.as_u16(), "Verda API call failed");
                return Err(ClientError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            return Ok(resp);
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.execute(Method::GET, path, None)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Decode(format!("GET {path}: {e}")))
    }

    /// Endpoints that create resources answer with the bare id, sometimes
    /// JSON-quoted.
    async fn post_for_id(&self, path: &str, body: Value) -> ClientResult<String> {
        let text = self.execute(Method::POST, path, Some(body)).await?.text().await?;
        let id = text.trim().trim_matches('"').to_string();
        if id.is_empty() {
            return Err(ClientError::Decode(format!("POST {path}: empty id in response")));
        }
        Ok(id)
    }
}

#[async_trait]
impl VerdaApi for VerdaClient {
    async fn list_instances(&self) -> ClientResult<Vec<Instance>> {
        self.get_json("/instances").await
    }

    async fn create_instance(&self, request: &CreateInstance) -> ClientResult<String> {
        let body = serde_json::to_value(request).map_err(|e| ClientError::Decode(e.to_string()))?;
        self.post_for_id("/instances", body).await
    }

    async fn delete_instance(&self, instance_id: &str) -> ClientResult<()> {
        self.execute(
            Method::PUT,
            "/instances",
            Some(json!({ "action": "delete", "id": instance_id })),
        )
        .await?;
        Ok(())
    }

    async fn list_instance_types(&self) -> ClientResult<Vec<InstanceType>> {
        self.get_json("/instance-types").await
    }

    async fn list_startup_scripts(&self) -> ClientResult<Vec<StartupScript>> {
        self.get_json("/scripts").await
    }

    async fn create_startup_script(&self, name: &str, script: &str) -> ClientResult<String> {
        self.post_for_id("/scripts", json!({ "name": name, "script": script }))
            .await
    }

    async fn delete_startup_script(&self, script_id: &str) -> ClientResult<()> {
        self.execute(Method::DELETE, "/scripts", Some(json!({ "scripts": [script_id] })))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> VerdaClient {
        VerdaClient::new(Credentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            base_url: server.uri(),
        })
        .unwrap()
    }

    async fn mount_token(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn lists_instances_with_bearer_token() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1").await;
        Mock::given(method("GET"))
            .and(path("/instances"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "i-1", "hostname": "gpu-pool-1a2b3c4d", "status": "running", "instance_type": "1V100.6V"},
                {"id": "i-2", "hostname": "other", "status": "offline"}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let instances = client.list_instances().await.unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].hostname, "gpu-pool-1a2b3c4d");
        assert_eq!(instances[1].status, "offline");
    }

    #[tokio::test]
    async fn token_is_cached_between_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok", "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/scripts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.list_startup_scripts().await.unwrap();
        client.list_startup_scripts().await.unwrap();
    }

    #[tokio::test]
    async fn create_instance_returns_trimmed_id() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;
        Mock::given(method("POST"))
            .and(path("/instances"))
            .respond_with(ResponseTemplate::new(202).set_body_string("\"0b3f9c2e-new\"\n"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let request = CreateInstance {
            instance_type: "1V100.6V".to_string(),
            image: "ubuntu-24.04".to_string(),
            hostname: "gpu-pool-1a2b3c4d".to_string(),
            description: "Autoscaler node for gpu-pool".to_string(),
            location: "FIN-01".to_string(),
            ssh_key_ids: vec![],
            startup_script_id: Some("script-1".to_string()),
            contract: Default::default(),
            pricing: Default::default(),
            is_spot: false,
        };
        let id = client.create_instance(&request).await.unwrap();
        assert_eq!(id, "0b3f9c2e-new");

        let received = server.received_requests().await.unwrap();
        let create = received
            .iter()
            .find(|r| r.url.path() == "/instances")
            .unwrap();
        let body: Value = serde_json::from_slice(&create.body).unwrap();
        assert_eq!(body["hostname"], "gpu-pool-1a2b3c4d");
        assert_eq!(body["startup_script_id"], "script-1");
    }

    #[tokio::test]
    async fn delete_issues_delete_action() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;
        Mock::given(method("PUT"))
            .and(path("/instances"))
            .and(body_json(json!({"action": "delete", "id": "i-9"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.delete_instance("i-9").await.unwrap();
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;
        Mock::given(method("GET"))
            .and(path("/instance-types"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.list_instance_types().await.unwrap_err();
        match err {
            ClientError::Api { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_answer_forces_reauthentication() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;
        Mock::given(method("GET"))
            .and(path("/instances"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.list_instances().await.unwrap().is_empty());

        let token_requests = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/oauth2/token")
            .count();
        assert_eq!(token_requests, 2);
    }

    #[tokio::test]
    async fn failed_token_request_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(matches!(
            client.list_instances().await,
            Err(ClientError::Auth(_))
        ));
    }
}
