//! REST adapter for the remote group API.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET groups/{group}/members?max_items=N[&marker=M]` lists one page of members,
//! - `PUT groups/{group}/members/{member}` adds a member,
//! - `DELETE groups/{group}/members/{member}` removes a member.
//!
//! Errors come back as `{"code": "...", "entity": "group" | "member", "message": "..."}`.
use std::time::Duration;

use reqwest::{header::AUTHORIZATION, Client, Method, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};

use crate::api::{ApiError, EntityKind, GroupApi, GroupPage};

const NO_SUCH_ENTITY: &str = "NoSuchEntity";

#[derive(Deserialize)]
struct GetGroupResponse {
    group_name: String,
    #[serde(default)]
    members: Vec<MemberEntry>,
    #[serde(default)]
    is_truncated: bool,
    marker: Option<String>,
}

#[derive(Deserialize)]
struct MemberEntry {
    user_name: String,
}

impl From<GetGroupResponse> for GroupPage {
    fn from(response: GetGroupResponse) -> Self {
        Self {
            group_name: response.group_name,
            members: response
                .members
                .into_iter()
                .map(|member| member.user_name)
                .collect(),
            is_truncated: response.is_truncated,
            marker: response.marker.filter(|marker| !marker.is_empty()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    entity: Option<EntityKind>,
    message: Option<String>,
}

pub struct HttpGroupApi {
    client: Client,
    base_url: Url,
    token: SecretString,
    page_size: usize,
}

impl HttpGroupApi {
    pub fn new(
        base_url: Url,
        token: SecretString,
        page_size: usize,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token,
            page_size,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::Other {
                code: "InvalidUrl".into(),
                message: format!("{} can't be used as a base URL", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<Response, ApiError> {
        debug!("Sending {method} request to {url}");
        let mut request = self.client.request(method, url).query(query);
        let token = self.token.expose_secret();
        if !token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(request.send().await?)
    }
}

/// Translate an unsuccessful response into the remote error taxonomy.
async fn parse_error(response: Response, group: &str, member: Option<&str>) -> ApiError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let message = body.message.clone().unwrap_or_else(|| text.clone());
    debug!("Remote API returned {status}: {text}");

    if status == StatusCode::NOT_FOUND || body.code.as_deref() == Some(NO_SUCH_ENTITY) {
        // a bare 404 is taken to mean the group, never an already absent member
        let entity = body.entity.unwrap_or(EntityKind::Group);
        let name = match entity {
            EntityKind::Group => group,
            EntityKind::Member => member.unwrap_or(group),
        };
        return ApiError::NoSuchEntity {
            entity,
            name: name.to_string(),
        };
    }

    match status {
        StatusCode::CONFLICT => ApiError::EntityAlreadyExists(message),
        StatusCode::TOO_MANY_REQUESTS => ApiError::Throttled(message),
        status if status.is_server_error() => ApiError::Transport(format!("{status}: {message}")),
        status => ApiError::Other {
            code: body.code.unwrap_or_else(|| status.to_string()),
            message,
        },
    }
}

impl GroupApi for HttpGroupApi {
    async fn get_group(&self, group: &str, marker: Option<&str>) -> Result<GroupPage, ApiError> {
        let url = self.endpoint(&["groups", group, "members"])?;
        let page_size = self.page_size.to_string();
        let mut query = vec![("max_items", page_size.as_str())];
        if let Some(marker) = marker {
            query.push(("marker", marker));
        }

        let response = self.send(Method::GET, url, &query).await?;
        if !response.status().is_success() {
            return Err(parse_error(response, group, None).await);
        }
        let response: GetGroupResponse = response.json().await?;
        Ok(response.into())
    }

    async fn add_member(&self, group: &str, member: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["groups", group, "members", member])?;
        let response = self.send(Method::PUT, url, &[]).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            // a 404 here means the group or the user is unknown, the body says which
            Err(parse_error(response, group, Some(member)).await)
        }
    }

    async fn remove_member(&self, group: &str, member: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["groups", group, "members", member])?;
        let response = self.send(Method::DELETE, url, &[]).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(parse_error(response, group, Some(member)).await)
        }
    }
}
