//! Marathon-backed discovery of Prometheus backends.
//!
//! Each configured app id is resolved through `/v2/apps/<id>`; every task of
//! the app contributes `http://<host>:<ports[0]>`. A 401 triggers exactly one
//! re-authentication through the principal secret before the failing app
//! fetch is retried.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};

use super::marathon_auth::{AuthContext, Authenticator};
use super::{Locator, LocatorError, PrometheusEndpoint, to_prometheus_clients};

#[derive(Debug)]
pub struct MarathonLocator {
    http: reqwest::Client,
    base_url: String,
    apps: Vec<String>,
    authenticator: Option<Authenticator>,
    /// Session token installed by the last successful authentication.
    token: tokio::sync::RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct AppResponse {
    app: App,
}

#[derive(Debug, Deserialize)]
struct App {
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct Task {
    host: String,
    #[serde(default)]
    ports: Vec<u16>,
}

enum FetchError {
    Unauthorized,
    Other(String),
}

impl MarathonLocator {
    /// Build a locator for `marathon_url`, authenticating up front when a
    /// principal secret is configured, and ping the API once to validate the
    /// configuration.
    pub async fn new(
        http: reqwest::Client,
        marathon_url: &str,
        apps: Vec<String>,
        auth_endpoint: Option<&str>,
        principal_secret: Option<&str>,
    ) -> Result<Self, LocatorError> {
        let authenticator = match principal_secret {
            Some(secret) => {
                let context = AuthContext::from_principal_secret(secret, auth_endpoint)?;
                Some(Authenticator::new(http.clone(), context))
            }
            None => None,
        };
        let locator = Self {
            http,
            base_url: marathon_url.trim_end_matches('/').to_string(),
            apps,
            authenticator,
            token: tokio::sync::RwLock::new(None),
        };
        if let Some(authenticator) = &locator.authenticator {
            let token = authenticator.authenticate().await?;
            *locator.token.write().await = Some(token);
        }
        locator.ping().await?;
        Ok(locator)
    }

    async fn ping(&self) -> Result<(), LocatorError> {
        let url = format!("{}/ping", self.base_url);
        let response = self
            .request(&url)
            .await
            .send()
            .await
            .map_err(|err| LocatorError::Marathon {
                url: url.clone(),
                reason: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(LocatorError::Marathon {
                url,
                reason: format!("status {}", response.status()),
            });
        }
        Ok(())
    }

    async fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.get(url);
        match self.token.read().await.as_deref() {
            Some(token) => builder.header("Authorization", format!("token={token}")),
            None => builder,
        }
    }

    async fn fetch_app(&self, app_id: &str) -> Result<Vec<String>, FetchError> {
        let url = format!(
            "{}/v2/apps/{}",
            self.base_url,
            app_id.trim_start_matches('/')
        );
        let response = self
            .request(&url)
            .await
            .send()
            .await
            .map_err(|err| FetchError::Other(err.to_string()))?;
        match response.status().as_u16() {
            401 => return Err(FetchError::Unauthorized),
            200 => {}
            status => return Err(FetchError::Other(format!("status {status}"))),
        }
        let body: AppResponse = response
            .json()
            .await
            .map_err(|err| FetchError::Other(err.to_string()))?;
        Ok(body
            .app
            .tasks
            .iter()
            .filter(|task| !task.ports.is_empty())
            .map(|task| format!("http://{}:{}", task.host, task.ports[0]))
            .collect())
    }

    /// Refresh the session token after a 401 from the API.
    async fn reauthenticate(&self) -> Result<(), LocatorError> {
        let Some(authenticator) = &self.authenticator else {
            return Err(LocatorError::Marathon {
                url: self.base_url.clone(),
                reason: "unauthorized and no principal secret configured".to_string(),
            });
        };
        debug!("marathon returned 401; re-authenticating");
        let token = authenticator.authenticate().await?;
        *self.token.write().await = Some(token);
        Ok(())
    }
}

#[async_trait]
impl Locator for MarathonLocator {
    async fn endpoints(&self) -> Result<Vec<PrometheusEndpoint>, LocatorError> {
        let mut urls = Vec::new();
        let mut failed_apps = Vec::new();

        for app_id in &self.apps {
            let mut outcome = self.fetch_app(app_id).await;
            if matches!(outcome, Err(FetchError::Unauthorized)) {
                self.reauthenticate().await?;
                outcome = self.fetch_app(app_id).await;
            }
            match outcome {
                Ok(app_urls) => urls.extend(app_urls),
                Err(FetchError::Unauthorized) => {
                    error!(app = app_id, "failed to resolve marathon application: still unauthorized");
                    failed_apps.push(app_id.clone());
                }
                Err(FetchError::Other(reason)) => {
                    error!(app = app_id, %reason, "failed to resolve marathon application");
                    failed_apps.push(app_id.clone());
                }
            }
        }

        let endpoints = to_prometheus_clients(&self.http, &urls).await?;
        if !failed_apps.is_empty() {
            return Err(LocatorError::Partial {
                endpoints,
                reason: format!(
                    "failed to resolve marathon application(s): {}",
                    failed_apps.join(", ")
                ),
            });
        }
        Ok(endpoints)
    }

    fn describe(&self) -> String {
        format!(
            "marathon{{url: {}, apps: [{}]}}",
            self.base_url,
            self.apps.join(", ")
        )
    }
}
