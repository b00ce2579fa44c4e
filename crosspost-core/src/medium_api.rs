//! Medium's private editor API, driven with the same session cookies the
//! browser uses. Tried before the browser driver for Medium posts.

use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, ORIGIN, REFERER, USER_AGENT};
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::credentials::PlatformCredential;

/// Anti-JSON-hijacking guard prepended to every response body.
const HIJACK_PREFIX: &str = "])}while(1);</x>";
const CLIENT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

#[derive(Debug, Error)]
pub enum MediumApiError {
    #[error("medium api needs a medium credential")]
    WrongCredential,
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("medium returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Payload(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MediumApiResult<T> = Result<T, MediumApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Delta {
    #[serde(rename = "type")]
    kind: u8,
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    section: Option<Section>,
    #[serde(skip_serializing_if = "Option::is_none")]
    paragraph: Option<Paragraph>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    verify_same_name: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Section {
    name: String,
    start_index: usize,
}

#[derive(Debug, Serialize)]
struct Paragraph {
    name: String,
    #[serde(rename = "type")]
    kind: u8,
    text: String,
    markups: Vec<String>,
}

const DELTA_INSERT: u8 = 1;
const DELTA_UPDATE: u8 = 3;
const DELTA_SECTION: u8 = 8;
const PARAGRAPH_BODY: u8 = 1;
const PARAGRAPH_TITLE: u8 = 3;

#[derive(Debug, Clone)]
pub struct MediumApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl MediumApiClient {
    pub fn new(credential: &PlatformCredential, base_url: impl Into<String>) -> MediumApiResult<Self> {
        let PlatformCredential::Medium { uid, sid, xsrf } = credential else {
            return Err(MediumApiError::WrongCredential);
        };
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let xsrf = xsrf.clone().unwrap_or_default();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        headers.insert("x-obvious-cid", HeaderValue::from_static("web"));
        headers.insert("x-xsrf-token", HeaderValue::from_str(&xsrf)?);
        headers.insert(ORIGIN, HeaderValue::from_str(&base_url)?);
        headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{base_url}/new-story"))?,
        );
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("uid={uid}; sid={sid}; xsrf={xsrf}"))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Create, fill, tag and publish a story; returns its public URL.
    pub async fn publish(&self, title: &str, content: &str, tags: &[String]) -> MediumApiResult<String> {
        let post_id = self.create_story().await?;
        self.update_content(&post_id, title, content).await?;
        if !tags.is_empty() {
            self.update_metadata(&post_id, tags).await?;
        }
        self.publish_post(&post_id).await
    }

    pub async fn create_story(&self) -> MediumApiResult<String> {
        let body = json!({
            "deltas": [],
            "baseRev": -1,
            "coverless": true,
            "visibility": 0,
        });
        let payload = self.request(Method::POST, "/new-story", &body).await?;
        let id = payload
            .pointer("/payload/value/id")
            .and_then(Value::as_str)
            .ok_or_else(|| MediumApiError::Payload("post id missing".into()))?;
        debug!(target: "medium_api", post_id = id, "story created");
        Ok(id.to_string())
    }

    pub async fn update_content(&self, post_id: &str, title: &str, content: &str) -> MediumApiResult<()> {
        let deltas = build_deltas(title, content);
        let body = json!({
            "id": post_id,
            "deltas": deltas,
            "baseRev": -1,
        });
        self.request(Method::POST, &format!("/p/{post_id}/deltas"), &body)
            .await?;
        Ok(())
    }

    pub async fn update_metadata(&self, post_id: &str, tags: &[String]) -> MediumApiResult<()> {
        let body = json!({
            "tags": tags,
            "noteToCurator": "",
            "allowCuration": false,
            "notifyTwitter": false,
            "pinnedPost": false,
            "isPublishToEmail": false,
            "isMarkedPaywallOnly": false,
        });
        self.request(Method::PUT, &format!("/_/api/posts/{post_id}/metadata"), &body)
            .await?;
        Ok(())
    }

    pub async fn publish_post(&self, post_id: &str) -> MediumApiResult<String> {
        let body = json!({
            "title": "",
            "subtitle": "",
            "metaDescription": "",
            "latestRev": -1,
        });
        let payload = self
            .request(Method::POST, &format!("/p/{post_id}/publish"), &body)
            .await?;
        let url = payload
            .pointer("/payload/value/mediumUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/p/{post_id}", self.base_url));
        info!(target: "medium_api", %url, "story published");
        Ok(url)
    }

    async fn request(&self, method: Method, path: &str, body: &Value) -> MediumApiResult<Value> {
        let response = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header("x-client-date", chrono::Utc::now().timestamp_millis().to_string())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(MediumApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let stripped = strip_hijack_prefix(&text);
        if stripped.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(stripped)?)
    }
}

pub fn strip_hijack_prefix(body: &str) -> &str {
    body.strip_prefix(HIJACK_PREFIX).unwrap_or(body)
}

/// Pulls the hex post id out of `/p/<id>` style URLs.
pub fn post_id_from_url(url: &str) -> Option<&str> {
    let start = url.find("/p/")? + 3;
    let rest = &url[start..];
    let end = rest
        .find(|ch: char| !ch.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn paragraph_name() -> String {
    format!("{:04x}", rand::thread_rng().gen_range(0..0x10000u32))
}

fn build_deltas(title: &str, content: &str) -> Vec<Delta> {
    let title_name = paragraph_name();
    let mut deltas = vec![
        Delta {
            kind: DELTA_SECTION,
            index: 0,
            section: Some(Section {
                name: paragraph_name(),
                start_index: 0,
            }),
            paragraph: None,
            verify_same_name: false,
        },
        Delta {
            kind: DELTA_INSERT,
            index: 0,
            section: None,
            paragraph: Some(Paragraph {
                name: title_name.clone(),
                kind: PARAGRAPH_TITLE,
                text: String::new(),
                markups: Vec::new(),
            }),
            verify_same_name: false,
        },
        Delta {
            kind: DELTA_UPDATE,
            index: 0,
            section: None,
            paragraph: Some(Paragraph {
                name: title_name,
                kind: PARAGRAPH_TITLE,
                text: title.to_string(),
                markups: Vec::new(),
            }),
            verify_same_name: true,
        },
    ];

    let paragraphs = content
        .trim()
        .split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty());
    for (offset, text) in paragraphs.enumerate() {
        let index = offset + 1;
        let name = paragraph_name();
        deltas.push(Delta {
            kind: DELTA_INSERT,
            index,
            section: None,
            paragraph: Some(Paragraph {
                name: name.clone(),
                kind: PARAGRAPH_BODY,
                text: String::new(),
                markups: Vec::new(),
            }),
            verify_same_name: false,
        });
        deltas.push(Delta {
            kind: DELTA_UPDATE,
            index,
            section: None,
            paragraph: Some(Paragraph {
                name,
                kind: PARAGRAPH_BODY,
                text: text.to_string(),
                markups: Vec::new(),
            }),
            verify_same_name: true,
        });
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_stripped_once() {
        assert_eq!(strip_hijack_prefix("])}while(1);</x>{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_hijack_prefix("{}"), "{}");
    }

    #[test]
    fn post_ids_come_from_edit_urls() {
        assert_eq!(post_id_from_url("https://medium.com/p/5d18830dea37/edit"), Some("5d18830dea37"));
        assert_eq!(post_id_from_url("https://medium.com/@me/story"), None);
    }

    #[test]
    fn deltas_cover_title_and_each_paragraph() {
        let deltas = build_deltas("Title", "first\n\n\n\nsecond\n\n  ");
        assert_eq!(deltas.len(), 3 + 4);
        let value = serde_json::to_value(&deltas).unwrap();
        assert_eq!(value[2]["paragraph"]["text"], "Title");
        assert_eq!(value[2]["verifySameName"], true);
        assert!(value[1].get("verifySameName").is_none());
        assert_eq!(value[6]["index"], 2);
        assert_eq!(value[6]["paragraph"]["text"], "second");
    }

    #[test]
    fn non_medium_credential_is_rejected() {
        let credential = PlatformCredential::DevTo { token: "t".into() };
        assert!(matches!(
            MediumApiClient::new(&credential, "https://medium.com"),
            Err(MediumApiError::WrongCredential)
        ));
    }
}
