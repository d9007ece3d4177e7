use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::errors::CrmError;

const USER_AGENT: &str = concat!("dealflow/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an upstream error body kept in error messages.
const MAX_ERROR_BODY: usize = 200;

/// Connection details for one Chatwoot account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatwootConfig {
    pub base_url: String,
    pub account_id: i64,
    pub api_token: String,
    /// Informational only. Contacts are listed account-wide, so no request
    /// filters by inbox.
    pub inbox_id: Option<i64>,
}

impl ChatwootConfig {
    /// Trim the base URL and token and reject unusable values.
    pub fn normalized(mut self) -> Result<Self, CrmError> {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self.api_token = self.api_token.trim().to_string();
        if self.base_url.is_empty() {
            return Err(CrmError::ChatwootNotConfigured("base URL is empty".into()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(CrmError::ChatwootNotConfigured(format!(
                "base URL '{}' must start with http:// or https://",
                self.base_url
            )));
        }
        if self.api_token.is_empty() {
            return Err(CrmError::ChatwootNotConfigured("API token is empty".into()));
        }
        if self.account_id <= 0 {
            return Err(CrmError::ChatwootNotConfigured(
                "account id must be positive".into(),
            ));
        }
        Ok(self)
    }
}

/// A Chatwoot contact (subset of fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatwootContact {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub identifier: Option<String>,
    #[serde(default)]
    pub additional_attributes: Option<AdditionalAttributes>,
    /// Unix seconds.
    pub created_at: Option<i64>,
    pub last_activity_at: Option<i64>,
}

impl ChatwootContact {
    pub fn company_name(&self) -> Option<&str> {
        self.additional_attributes
            .as_ref()
            .and_then(|a| a.company_name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdditionalAttributes {
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactsMeta {
    pub count: Option<u64>,
    /// Chatwoot has sent this both as a number and as a string.
    pub current_page: Option<serde_json::Value>,
}

/// One page of `GET /contacts`.
#[derive(Debug, Deserialize)]
pub struct ContactsPage {
    #[serde(default)]
    pub meta: ContactsMeta,
    #[serde(default)]
    pub payload: Vec<ChatwootContact>,
}

/// The agent profile behind the API token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatwootProfile {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub available_name: Option<String>,
}

pub struct ChatwootClient {
    http: reqwest::Client,
    config: ChatwootConfig,
}

impl ChatwootClient {
    pub fn new(config: ChatwootConfig, timeout: Duration) -> Result<Self> {
        let config = config.normalized()?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build Chatwoot HTTP client")?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ChatwootConfig {
        &self.config
    }

    fn account_url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/accounts/{}/{}",
            self.config.base_url, self.config.account_id, path
        )
    }

    /// Fetch one page of contacts, sorted by name. Pages start at 1.
    pub async fn list_contacts_page(&self, page: u32) -> Result<ContactsPage> {
        let resp = self
            .http
            .get(self.account_url("contacts"))
            .header("api_access_token", &self.config.api_token)
            .header("Accept", "application/json")
            .query(&[("page", page.to_string()), ("sort", "name".to_string())])
            .send()
            .await
            .context("Failed to send contacts request to Chatwoot")?;
        let resp = check_status(resp).await?;
        resp.json::<ContactsPage>()
            .await
            .context("Failed to parse Chatwoot contacts response")
    }

    /// Walk contact pages until an empty page, the reported total, or
    /// `max_pages`, whichever comes first.
    pub async fn list_all_contacts(&self, max_pages: u32) -> Result<Vec<ChatwootContact>> {
        let mut contacts = Vec::new();
        let max_pages = max_pages.max(1);

        for page in 1..=max_pages {
            let resp = self.list_contacts_page(page).await?;
            if resp.payload.is_empty() {
                break;
            }
            contacts.extend(resp.payload);
            tracing::debug!(page, fetched = contacts.len(), "Fetched Chatwoot contacts page");

            if let Some(total) = resp.meta.count {
                if contacts.len() as u64 >= total {
                    break;
                }
            }
            if page == max_pages {
                tracing::warn!(
                    max_pages,
                    fetched = contacts.len(),
                    "Stopped Chatwoot pagination at page limit"
                );
            }
        }

        Ok(contacts)
    }

    /// Verify the base URL and token by fetching the token owner's profile.
    pub async fn check_connection(&self) -> Result<ChatwootProfile> {
        let resp = self
            .http
            .get(format!("{}/api/v1/profile", self.config.base_url))
            .header("api_access_token", &self.config.api_token)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to reach Chatwoot")?;
        let resp = check_status(resp).await?;
        resp.json::<ChatwootProfile>()
            .await
            .context("Failed to parse Chatwoot profile response")
    }
}

/// Map error statuses to `CrmError`: 401 is an auth failure, anything else
/// non-2xx is an upstream error carrying the status and body.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(CrmError::ChatwootAuth.into());
    }
    let body = resp.text().await.unwrap_or_default();
    let message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    Err(CrmError::ChatwootUpstream {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.canonical_reason().unwrap_or("error").to_string()
        } else {
            message
        },
    }
    .into())
}
