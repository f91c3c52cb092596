//! The REST client and its typed collections.
//!
//! Every resource kind lives under a versioned collection path
//! (`v1/groups/`, `v1/triggers/`, …). Queries are composed locally as
//! [`Query`] trees and passed verbatim in the `q` parameter; the API
//! server evaluates them.

use std::marker::PhantomData;
use std::time::Duration;

use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use storm_core::{Application, CloudId, Group, Member, Node, Query, Recipe, Trigger};

use crate::error::{ApiError, ApiResult};
use crate::shortcuts::Shortcuts;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8000/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A resource kind stored by the API server.
pub trait ApiResource: Serialize + DeserializeOwned + Send + Sync {
    /// Collection path relative to the server root.
    const PATH: &'static str;

    /// The identifier used in per-resource URLs.
    fn identifier(&self) -> String;
}

impl ApiResource for Group {
    const PATH: &'static str = "v1/groups/";

    fn identifier(&self) -> String {
        self.name.clone()
    }
}

impl ApiResource for Application {
    const PATH: &'static str = "v1/apps/";

    fn identifier(&self) -> String {
        self.name.clone()
    }
}

impl ApiResource for Recipe {
    const PATH: &'static str = "v1/recipes/";

    fn identifier(&self) -> String {
        self.name.clone()
    }
}

impl ApiResource for Trigger {
    const PATH: &'static str = "v1/triggers/";

    fn identifier(&self) -> String {
        self.uuid.to_string()
    }
}

impl ApiResource for Node {
    const PATH: &'static str = "v1/nodes/";

    fn identifier(&self) -> String {
        self.cloud_id.clone()
    }
}

/// Client for one API server.
///
/// Cheap to clone; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(server_url: &str) -> ApiResult<Self> {
        let mut url = server_url.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        let base = Url::parse(&url)
            .map_err(|e| ApiError::Validation(format!("invalid server url {server_url}: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { http, base })
    }

    pub fn groups(&self) -> Collection<'_, Group> {
        Collection::new(self)
    }

    pub fn apps(&self) -> Collection<'_, Application> {
        Collection::new(self)
    }

    pub fn recipes(&self) -> Collection<'_, Recipe> {
        Collection::new(self)
    }

    pub fn triggers(&self) -> Collection<'_, Trigger> {
        Collection::new(self)
    }

    pub fn nodes(&self) -> Collection<'_, Node> {
        Collection::new(self)
    }

    pub fn shortcuts(&self) -> Shortcuts<'_> {
        Shortcuts::new(self)
    }

    /// Query across all resource kinds (`v1/query/`). Used to resolve
    /// containers, which have no collection of their own.
    pub async fn query_resources(&self, query: &Query) -> ApiResult<Vec<Member>> {
        self.get_json("v1/query/", &[("q", query.to_compact_json())])
            .await
    }

    // ── Raw request plumbing ───────────────────────────────────────

    fn endpoint(&self, path: &str) -> ApiResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Validation(format!("invalid path {path}: {e}")))
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ApiResult<T> {
        let mut url = self.endpoint(path)?;
        for (name, value) in params {
            url.query_pairs_mut().append_pair(name, value);
        }
        let response = self.http.get(url).send().await?;
        Ok(checked(response).await?.json().await?)
    }

    pub(crate) async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        let url = self.endpoint(path)?;
        let response = self.http.request(method, url).json(body).send().await?;
        Ok(checked(response).await?.json().await?)
    }

    /// Send a JSON body where the response content is irrelevant.
    pub(crate) async fn send_json_discard<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> ApiResult<()> {
        let url = self.endpoint(path)?;
        let response = self.http.request(method, url).json(body).send().await?;
        checked(response).await?;
        Ok(())
    }

    /// POST to an action sub-path with an empty body.
    pub(crate) async fn post_action(&self, path: &str) -> ApiResult<()> {
        let url = self.endpoint(path)?;
        let response = self.http.post(url).send().await?;
        checked(response).await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, path: &str) -> ApiResult<()> {
        let url = self.endpoint(path)?;
        let response = self.http.delete(url).send().await?;
        checked(response).await?;
        Ok(())
    }
}

/// Map non-2xx responses onto [`ApiError`].
async fn checked(response: reqwest::Response) -> ApiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let path = response.url().path().to_string();
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound { path });
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Client {
        status: status.as_u16(),
        body,
    })
}

/// Typed operations over one resource collection.
pub struct Collection<'a, T> {
    client: &'a ApiClient,
    marker: PhantomData<fn() -> T>,
}

impl<'a, T: ApiResource> Collection<'a, T> {
    fn new(client: &'a ApiClient) -> Self {
        Self {
            client,
            marker: PhantomData,
        }
    }

    fn item_path(id: &str) -> String {
        format!("{}{}/", T::PATH, id)
    }

    pub async fn all(&self) -> ApiResult<Vec<T>> {
        self.client.get_json(T::PATH, &[]).await
    }

    pub async fn query(&self, query: &Query) -> ApiResult<Vec<T>> {
        self.client
            .get_json(T::PATH, &[("q", query.to_compact_json())])
            .await
    }

    pub async fn get(&self, id: &str) -> ApiResult<T> {
        self.client.get_json(&Self::item_path(id), &[]).await
    }

    pub async fn create(&self, body: &T) -> ApiResult<T> {
        self.client.send_json(Method::POST, T::PATH, body).await
    }

    pub async fn update(&self, id: &str, body: &T) -> ApiResult<T> {
        self.client
            .send_json(Method::PUT, &Self::item_path(id), body)
            .await
    }

    /// Upsert by identifier.
    ///
    /// A concurrent creator racing the not-found window surfaces as a
    /// conflict, which is resolved by re-reading and updating.
    pub async fn update_or_create(&self, body: &T) -> ApiResult<T> {
        let id = body.identifier();
        match self.get(&id).await {
            Ok(_) => self.update(&id, body).await,
            Err(e) if e.is_not_found() => match self.create(body).await {
                Err(e) if e.is_conflict() => {
                    debug!(%id, "create conflicted, re-reading");
                    self.get(&id).await?;
                    self.update(&id, body).await
                }
                other => other,
            },
            Err(e) => Err(e),
        }
    }

    pub async fn destroy(&self, id: &str) -> ApiResult<()> {
        self.client.delete(&Self::item_path(id)).await
    }
}

#[derive(Serialize)]
struct MembersMutation<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    include: Option<&'a [CloudId]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exclude: Option<&'a [CloudId]>,
}

impl<'a> Collection<'a, Group> {
    fn members_path(group: &str) -> String {
        format!("{}{}/members/", Group::PATH, group)
    }

    /// List members, composing the group's own query with `filter`
    /// server-side.
    pub async fn members(&self, group: &str, filter: Option<&Query>) -> ApiResult<Vec<Member>> {
        let params = match filter {
            Some(query) => vec![("q", query.to_compact_json())],
            None => Vec::new(),
        };
        self.client.get_json(&Self::members_path(group), &params).await
    }

    pub async fn add_members(&self, group: &str, ids: &[CloudId]) -> ApiResult<()> {
        self.client
            .send_json_discard(
                Method::POST,
                &Self::members_path(group),
                &MembersMutation {
                    include: Some(ids),
                    exclude: None,
                },
            )
            .await
    }

    pub async fn remove_members(&self, group: &str, ids: &[CloudId]) -> ApiResult<()> {
        self.client
            .send_json_discard(
                Method::POST,
                &Self::members_path(group),
                &MembersMutation {
                    include: None,
                    exclude: Some(ids),
                },
            )
            .await
    }

    /// Replace the explicit membership with exactly `wanted`, in one
    /// mutation.
    pub async fn set_members(&self, group: &str, wanted: &[CloudId]) -> ApiResult<()> {
        let current = self.members(group, None).await?;
        let unwanted = unwanted_members(&current, wanted);
        self.client
            .send_json_discard(
                Method::POST,
                &Self::members_path(group),
                &MembersMutation {
                    include: Some(wanted),
                    exclude: Some(&unwanted),
                },
            )
            .await
    }
}

/// Current members that are not in the wanted set.
fn unwanted_members(current: &[Member], wanted: &[CloudId]) -> Vec<CloudId> {
    current
        .iter()
        .filter(|member| !wanted.contains(&member.cloud_id))
        .map(|member| member.cloud_id.clone())
        .collect()
}
