//! Authenticated HTTP client for the cloud control plane.
//!
//! The client speaks to two services: the identity service, which exchanges
//! credentials for a token, and the compute service, which manages instances,
//! images, flavors, and networks. Authentication is lazy; the first request
//! obtains a token which is cached for the life of the client value.

mod error;
mod types;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendFuture, Flavor, InstanceClass, InstanceInfo};
use crate::config::CloudConfig;

pub use error::CloudError;
pub use types::{Image, InstanceLimits, Network, Session};
use types::{
    AuthBody, AuthRequest, CreateRequest, CreateServer, FlavorList, ImageList, LimitsEnvelope,
    NetworkAttachment, NetworkList, PasswordCredentials, RebuildRequest, RebuildServer,
    ServerEnvelope, ServerList, TokenEnvelope,
};

const CLOUD_CONFIG_USER_DATA: &str = "#cloud-config\napt_preserve_sources_list: true\n";

/// Client for the identity and compute services.
#[derive(Debug)]
pub struct CloudClient {
    http: reqwest::Client,
    config: CloudConfig,
    session: OnceCell<Session>,
}

impl CloudClient {
    /// Builds a client without contacting the cloud.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Transport`] when the HTTP client cannot be
    /// initialised.
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            config,
            session: OnceCell::new(),
        })
    }

    /// Exchanges credentials for a token and tenant identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Auth`] when the identity service does not
    /// answer with a success status, and [`CloudError::Transport`] when the
    /// request cannot be completed.
    pub async fn authenticate(
        &self,
        login: &str,
        password: &str,
        tenant: &str,
    ) -> Result<Session, CloudError> {
        let url = format!(
            "{}:{}/v2.0/tokens",
            self.base_url()?,
            self.config.identity_port
        );
        let payload = AuthRequest {
            auth: AuthBody {
                tenant_name: tenant,
                password_credentials: PasswordCredentials {
                    username: login,
                    password,
                },
            },
        };
        debug!(%url, login, tenant, "authenticating");
        let response = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CloudError::Auth {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: TokenEnvelope = decode(&url, &body)?;
        Ok(Session {
            token_id: envelope.access.token.id,
            tenant_id: envelope.access.token.tenant.id,
        })
    }

    /// Returns the cached session, authenticating with the configured
    /// credentials on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::MissingCredential`] when a credential is unset,
    /// or any error raised by [`CloudClient::authenticate`].
    pub async fn session(&self) -> Result<&Session, CloudError> {
        self.session
            .get_or_try_init(|| async {
                let login = required(self.config.username.as_deref(), "username")?;
                let password = required(self.config.password.as_deref(), "password")?;
                let tenant = required(self.config.tenant_name.as_deref(), "tenant_name")?;
                let session = self.authenticate(login, password, tenant).await?;
                info!(tenant_id = %session.tenant_id, "authenticated with cloud");
                Ok::<_, CloudError>(session)
            })
            .await
    }

    /// Lists images offered by the compute service.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the request fails.
    pub async fn list_images(&self) -> Result<Vec<Image>, CloudError> {
        let list: ImageList = self.get("images").await?;
        Ok(list.images)
    }

    /// Lists flavors along with their RAM sizes.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the request fails.
    pub async fn list_flavors(&self) -> Result<Vec<Flavor>, CloudError> {
        let list: FlavorList = self.get("flavors/detail").await?;
        Ok(list.flavors)
    }

    /// Lists networks instances may attach to.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the request fails.
    pub async fn list_networks(&self) -> Result<Vec<Network>, CloudError> {
        let list: NetworkList = self.get("os-networks").await?;
        Ok(list.networks)
    }

    /// Lists instances. Entries carry only their identifier and name.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the request fails.
    pub async fn list_instances(&self) -> Result<Vec<InstanceInfo>, CloudError> {
        let list: ServerList = self.get("servers").await?;
        Ok(list.servers)
    }

    /// Reads the tenant's instance quota.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when the request fails.
    pub async fn limits(&self) -> Result<InstanceLimits, CloudError> {
        let envelope: LimitsEnvelope = self.get("limits").await?;
        Ok(envelope.limits.absolute)
    }

    /// Fetches the full description of the named instance.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError`] when a request fails.
    pub async fn get_instance_by_name(
        &self,
        name: &str,
    ) -> Result<Option<InstanceInfo>, CloudError> {
        let Some(summary) = self
            .list_instances()
            .await?
            .into_iter()
            .find(|instance| instance.name == name)
        else {
            return Ok(None);
        };
        let envelope: ServerEnvelope = self.get(&format!("servers/{}", summary.id)).await?;
        Ok(Some(envelope.server))
    }

    /// Requests creation of every instance of `class`.
    ///
    /// Image, flavor, and network names are resolved to identifiers with
    /// fresh list calls.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::UnknownImage`], [`CloudError::UnknownFlavor`], or
    /// [`CloudError::UnknownNetwork`] when a name does not resolve, and
    /// [`CloudError::Api`] when the compute service rejects the request.
    pub async fn create_instance(&self, class: &InstanceClass) -> Result<InstanceInfo, CloudError> {
        let image = self
            .list_images()
            .await?
            .into_iter()
            .find(|image| image.name == class.image)
            .ok_or_else(|| CloudError::UnknownImage(class.image.clone()))?;
        let flavor = self
            .list_flavors()
            .await?
            .into_iter()
            .find(|flavor| flavor.name == class.flavor_name)
            .ok_or_else(|| CloudError::UnknownFlavor(class.flavor_name.clone()))?;
        let networks = self.resolve_networks(&class.networks).await?;
        self.check_headroom(class).await;

        let payload = CreateRequest {
            server: CreateServer {
                name: &class.name,
                image_ref: &image.id,
                flavor_ref: &flavor.id,
                key_name: &class.key_name,
                min_count: class.count,
                max_count: class.count,
                networks,
                user_data: STANDARD.encode(CLOUD_CONFIG_USER_DATA),
            },
        };
        info!(
            name = %class.name,
            count = class.count,
            flavor = %class.flavor_name,
            "creating instances"
        );
        let envelope: ServerEnvelope = self
            .send(
                Method::POST,
                "servers",
                Some(&payload),
                &[StatusCode::OK, StatusCode::ACCEPTED],
            )
            .await?;
        let mut server = envelope.server;
        if server.name.is_empty() {
            server.name.clone_from(&class.name);
        }
        Ok(server)
    }

    /// Deletes the named instance, returning `false` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Api`] when the compute service does not answer
    /// with `204 No Content`.
    pub async fn delete_instance(&self, name: &str) -> Result<bool, CloudError> {
        let Some(instance) = self.get_instance_by_name(name).await? else {
            debug!(name, "instance already absent");
            return Ok(false);
        };
        info!(name, id = %instance.id, "deleting instance");
        self.send_raw::<()>(
            Method::DELETE,
            &format!("servers/{}", instance.id),
            None,
            &[StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(true)
    }

    /// Rebuilds the named instance from the image it currently runs,
    /// returning `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::MissingCredential`] when no admin password is
    /// configured and [`CloudError::Api`] when the rebuild is rejected.
    pub async fn rebuild_instance(&self, name: &str) -> Result<Option<InstanceInfo>, CloudError> {
        let Some(instance) = self.get_instance_by_name(name).await? else {
            return Ok(None);
        };
        let admin_pass = required(self.config.password.as_deref(), "password")?;
        let image_ref = instance
            .image_href()
            .or_else(|| instance.image.get("id").and_then(|id| id.as_str()))
            .ok_or_else(|| CloudError::UnknownImage(format!("image of instance {name}")))?;
        let payload = RebuildRequest {
            rebuild: RebuildServer {
                name,
                image_ref,
                admin_pass,
            },
        };
        info!(name, id = %instance.id, "rebuilding instance");
        let envelope: ServerEnvelope = self
            .send(
                Method::POST,
                &format!("servers/{}/action", instance.id),
                Some(&payload),
                &[StatusCode::OK, StatusCode::ACCEPTED],
            )
            .await?;
        Ok(Some(envelope.server))
    }

    /// Warns when the quota cannot fit `class`. Lookup failures are logged
    /// and otherwise ignored.
    async fn check_headroom(&self, class: &InstanceClass) {
        match self.limits().await {
            Ok(limits) => {
                let Some(headroom) = limits.headroom() else {
                    return;
                };
                let requested = i64::try_from(class.count).unwrap_or(i64::MAX);
                if headroom < requested {
                    warn!(
                        name = %class.name,
                        requested,
                        headroom,
                        max = limits.max_total_instances,
                        used = limits.total_instances_used,
                        "instance quota too small for request"
                    );
                }
            }
            Err(err) => debug!(error = %err, "instance limits unavailable"),
        }
    }

    async fn resolve_networks(
        &self,
        labels: &[String],
    ) -> Result<Vec<NetworkAttachment>, CloudError> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let known = self.list_networks().await?;
        labels
            .iter()
            .map(|label| {
                known
                    .iter()
                    .find(|network| &network.label == label)
                    .map(|network| NetworkAttachment {
                        uuid: network.id.clone(),
                    })
                    .ok_or_else(|| CloudError::UnknownNetwork(label.clone()))
            })
            .collect()
    }

    fn base_url(&self) -> Result<&str, CloudError> {
        let url = required(self.config.url.as_deref(), "url")?;
        Ok(url.trim_end_matches('/'))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CloudError> {
        self.send::<(), T>(Method::GET, path, None, &[StatusCode::OK])
            .await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        expected: &[StatusCode],
    ) -> Result<T, CloudError> {
        let (url, text) = self.send_raw(method, path, body, expected).await?;
        decode(&url, &text)
    }

    async fn send_raw<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        expected: &[StatusCode],
    ) -> Result<(String, String), CloudError> {
        let session = self.session().await?;
        let url = format!(
            "{}:{}/v2/{}/{path}",
            self.base_url()?,
            self.config.compute_port,
            session.tenant_id
        );
        debug!(%method, %url, "compute request");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(ACCEPT, "application/json")
            .header("X-Auth-Token", &session.token_id);
        if let Some(tenant) = &self.config.tenant_name {
            request = request.header("X-Auth-Project-Id", tenant);
        }
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !expected.contains(&status) {
            return Err(CloudError::Api {
                method: method.to_string(),
                url,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok((url, text))
    }
}

impl Backend for CloudClient {
    type Error = CloudError;

    fn flavors(&self) -> BackendFuture<'_, Vec<Flavor>, Self::Error> {
        Box::pin(self.list_flavors())
    }

    fn instance_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<InstanceInfo>, Self::Error> {
        Box::pin(self.get_instance_by_name(name))
    }

    fn create<'a>(
        &'a self,
        class: &'a InstanceClass,
    ) -> BackendFuture<'a, InstanceInfo, Self::Error> {
        Box::pin(self.create_instance(class))
    }

    fn delete<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool, Self::Error> {
        Box::pin(self.delete_instance(name))
    }

    fn rebuild<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<InstanceInfo>, Self::Error> {
        Box::pin(self.rebuild_instance(name))
    }
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, CloudError> {
    value
        .filter(|text| !text.trim().is_empty())
        .ok_or(CloudError::MissingCredential(field))
}

fn decode<T: DeserializeOwned>(url: &str, body: &str) -> Result<T, CloudError> {
    serde_json::from_str(body).map_err(|err| CloudError::Decode {
        url: url.to_owned(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: Option<&str>) -> CloudConfig {
        CloudConfig {
            username: Some(String::from("tester")),
            password: None,
            url: url.map(str::to_owned),
            tenant_name: Some(String::from("qa")),
            identity_port: 5000,
            compute_port: 8774,
            image_name: String::from("storage-node"),
            key_name: String::new(),
            networks: String::new(),
            request_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn missing_password_is_an_auth_failure() {
        let client = CloudClient::new(config(Some("http://127.0.0.1")))
            .unwrap_or_else(|err| panic!("client: {err}"));
        let err = client
            .list_flavors()
            .await
            .expect_err("missing password should fail before any request");
        assert_eq!(err, CloudError::MissingCredential("password"));
        assert!(err.is_auth());
        assert!(err.to_string().contains("OS_PASSWORD"));
    }

    #[test]
    fn headroom_treats_negative_maximum_as_unlimited() {
        let limits: InstanceLimits =
            serde_json::from_str(r#"{"maxTotalInstances": 10, "totalInstancesUsed": 7}"#)
                .unwrap_or_else(|err| panic!("decode: {err}"));
        assert_eq!(limits.headroom(), Some(3));

        let unlimited: InstanceLimits =
            serde_json::from_str(r#"{"maxTotalInstances": -1, "totalInstancesUsed": 40}"#)
                .unwrap_or_else(|err| panic!("decode: {err}"));
        assert_eq!(unlimited.headroom(), None);
        assert_eq!(InstanceLimits::default().headroom(), None);
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = CloudClient::new(config(Some("http://cloud.example/")))
            .unwrap_or_else(|err| panic!("client: {err}"));
        assert_eq!(client.base_url(), Ok("http://cloud.example"));
    }

    #[test]
    fn missing_url_is_reported_lazily() {
        let client =
            CloudClient::new(config(None)).unwrap_or_else(|err| panic!("client: {err}"));
        assert_eq!(
            client.base_url(),
            Err(CloudError::MissingCredential("url"))
        );
    }
}
