use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque last-modified marker used for conditional catalog fetches.
///
/// Stored as milliseconds since the Unix epoch. Zero means "never synced",
/// which turns the next fetch into an unconditional one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(i64);

impl Watermark {
    pub const NONE: Watermark = Watermark(0);

    pub fn from_millis(millis: i64) -> Self {
        Self(millis.max(0))
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn to_http_date(self) -> Option<String> {
        if self.is_none() {
            return None;
        }
        let at = UNIX_EPOCH + Duration::from_millis(self.0 as u64);
        Some(httpdate::fmt_http_date(at))
    }

    pub fn from_http_date(value: &str) -> Option<Self> {
        let at = httpdate::parse_http_date(value).ok()?;
        Self::from_system_time(at)
    }

    pub fn from_system_time(at: SystemTime) -> Option<Self> {
        let since_epoch = at.duration_since(UNIX_EPOCH).ok()?;
        let millis = i64::try_from(since_epoch.as_millis()).ok()?;
        Some(Self::from_millis(millis))
    }
}

/// One entry of `subreddits.json.gz`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteSubreddit {
    pub name: String,
    #[serde(default, rename = "sizeBytes", alias = "size")]
    pub size_bytes: i64,
    #[serde(default, rename = "addedAt", alias = "added")]
    pub added_at: i64,
}

/// One entry of `{subreddit}/emotes.json.gz`.
///
/// A single image (identified by `hash`) may be published under several
/// names. Older catalogs use the short field names accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteEmote {
    pub hash: String,
    pub image: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default, alias = "sr")]
    pub subreddit: String,
    #[serde(default)]
    pub delay: i64,
    #[serde(default)]
    pub index: i64,
    #[serde(default, rename = "isAnimated", alias = "apng")]
    pub is_animated: bool,
    #[serde(default, rename = "isAdultContent", alias = "nsfw")]
    pub is_adult_content: bool,
}
