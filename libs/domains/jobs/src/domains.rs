//! Listing domains.
//!
//! Each domain is a marker type naming its queue, cache prefix, env prefix,
//! delete policy, request parameters and result item. Everything else
//! (cache, service, processor) is generic over [`ListingDomain`].

use chrono::{DateTime, Utc};
use queue_worker::QueueDef;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use strum::{AsRefStr, Display};
use validator::Validate;

use crate::config::ListingConfig;

/// What `delete_job` does when the job is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Succeed silently.
    Idempotent,
    /// Fail with `NotFound`.
    Strict,
}

pub trait ListingDomain: QueueDef + Send + Sync + 'static {
    /// Handler name in logs and metrics
    const NAME: &'static str;
    /// Cache key namespace
    const KEY_PREFIX: &'static str;
    /// Environment prefix of the [`ListingConfig`]
    const ENV_PREFIX: &'static str;
    const DELETE_POLICY: DeletePolicy;
    /// Internal data API path producing chunks for this domain
    const SOURCE_PATH: &'static str;

    type Params: Serialize + DeserializeOwned + Validate + Clone + Debug + Send + Sync + 'static;
    type Item: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    fn default_config() -> ListingConfig {
        ListingConfig::default()
    }
}

macro_rules! listing_domain {
    (
        $domain:ident,
        name: $name:literal,
        env: $env:literal,
        delete: $policy:expr,
        source: $source:literal,
        params: $params:ty,
        item: $item:ty
        $(, config: $config:expr)?
        $(,)?
    ) => {
        impl QueueDef for $domain {
            const QUEUE_NAME: &'static str = concat!("jobs.", $name);
            const DLQ_NAME: &'static str = concat!("jobs.", $name, ".dlq");
        }

        impl ListingDomain for $domain {
            const NAME: &'static str = $name;
            const KEY_PREFIX: &'static str = concat!("jobs:", $name);
            const ENV_PREFIX: &'static str = $env;
            const DELETE_POLICY: DeletePolicy = $policy;
            const SOURCE_PATH: &'static str = $source;

            type Params = $params;
            type Item = $item;

            $(
                fn default_config() -> ListingConfig {
                    $config
                }
            )?
        }
    };
}

// Companies

pub struct CompanyList;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompanyListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 100))]
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanySummary {
    pub id: String,
    pub name: String,
    pub role: String,
    pub member_count: u64,
}

listing_domain!(
    CompanyList,
    name: "company-list",
    env: "COMPANY_LIST_",
    delete: DeletePolicy::Strict,
    source: "/internal/companies",
    params: CompanyListParams,
    item: CompanySummary
);

// Invites

pub struct InviteList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InviteListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InviteStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteSummary {
    pub id: String,
    pub company_id: String,
    pub company_name: String,
    pub email: String,
    pub status: InviteStatus,
    pub created_at: DateTime<Utc>,
}

listing_domain!(
    InviteList,
    name: "invite-list",
    env: "INVITE_LIST_",
    delete: DeletePolicy::Strict,
    source: "/internal/invites",
    params: InviteListParams,
    item: InviteSummary
);

// Friendships

pub struct FriendshipList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Blocked,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FriendshipListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FriendshipStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendSummary {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub status: FriendshipStatus,
}

listing_domain!(
    FriendshipList,
    name: "friendship-list",
    env: "FRIENDSHIP_LIST_",
    delete: DeletePolicy::Strict,
    source: "/internal/friendships",
    params: FriendshipListParams,
    item: FriendSummary
);

// Notifications

pub struct NotificationList;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NotificationListParams {
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSummary {
    pub id: String,
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

listing_domain!(
    NotificationList,
    name: "notification-list",
    env: "NOTIFICATION_LIST_",
    delete: DeletePolicy::Idempotent,
    source: "/internal/notifications",
    params: NotificationListParams,
    item: NotificationSummary
);

// User search

pub struct UserSearch;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UserSearchParams {
    #[validate(length(min = 1, max = 100))]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub email: String,
}

// Searches are short-lived and paged in small windows
listing_domain!(
    UserSearch,
    name: "user-search",
    env: "USER_SEARCH_",
    delete: DeletePolicy::Idempotent,
    source: "/internal/users/search",
    params: UserSearchParams,
    item: UserSummary,
    config: ListingConfig {
        default_chunk_size: 500,
        min_chunk_size: 100,
        max_chunk_size: 2000,
        default_page_size: 20,
        max_page_size: 100,
        ttl: std::time::Duration::from_secs(600),
        ..ListingConfig::default()
    }
);

// Bulk invite actions

pub struct InviteBulk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BulkInviteAction {
    Accept,
    Reject,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InviteBulkParams {
    #[validate(length(min = 1, max = 500))]
    pub invite_ids: Vec<String>,
    pub action: BulkInviteAction,
}

/// Outcome of one invite in a bulk action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteActionOutcome {
    pub invite_id: String,
    pub action: BulkInviteAction,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Every item is a write on the data API, so chunks stay small
listing_domain!(
    InviteBulk,
    name: "invite-bulk",
    env: "INVITE_BULK_",
    delete: DeletePolicy::Strict,
    source: "/internal/invites/bulk",
    params: InviteBulkParams,
    item: InviteActionOutcome,
    config: ListingConfig {
        default_chunk_size: 50,
        min_chunk_size: 10,
        max_chunk_size: 500,
        ..ListingConfig::default()
    }
);
