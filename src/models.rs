use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub type PostId = Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown, // any unrecognised wire value
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(Severity::parse(&raw))
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct Post {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub author: String,
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    #[serde(default)]
    pub location: String, // free-text address, may be empty
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub upvotes: u32,
    pub downvotes: u32,
    pub status: bool, // approved
    pub resolved: u32,
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
}

impl Post {
    /// Both coordinates or neither; a half-present pair reads as no location.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        }
    }

    pub fn votes(&self) -> VoteCount {
        VoteCount { upvotes: self.upvotes, downvotes: self.downvotes }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub image_url: Option<String>,
    #[serde(default)]
    pub location: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("latitude and longitude must both be present or both be absent")]
    PartialCoordinates,
    #[error("coordinates out of range")]
    CoordinatesOutOfRange,
}

impl NewPost {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        match (self.latitude, self.longitude) {
            (None, None) => Ok(()),
            (Some(lat), Some(lng)) => {
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
                    Ok(())
                } else {
                    Err(ValidationError::CoordinatesOutOfRange)
                }
            }
            _ => Err(ValidationError::PartialCoordinates),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    pub fn opposite(self) -> Self {
        match self {
            VoteDirection::Up => VoteDirection::Down,
            VoteDirection::Down => VoteDirection::Up,
        }
    }

    pub fn field(self) -> VoteField {
        match self {
            VoteDirection::Up => VoteField::Upvotes,
            VoteDirection::Down => VoteField::Downvotes,
        }
    }
}

/// Counter column a vote write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VoteField {
    Upvotes,
    Downvotes,
}

impl VoteField {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteField::Upvotes => "upvotes",
            VoteField::Downvotes => "downvotes",
        }
    }
}

impl std::str::FromStr for VoteField {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upvotes" | "up" => Ok(VoteField::Upvotes),
            "downvotes" | "down" => Ok(VoteField::Downvotes),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VoteCount {
    pub upvotes: u32,
    pub downvotes: u32,
}

impl VoteCount {
    pub fn get(&self, field: VoteField) -> u32 {
        match field {
            VoteField::Upvotes => self.upvotes,
            VoteField::Downvotes => self.downvotes,
        }
    }

    pub fn set(&mut self, field: VoteField, value: u32) {
        match field {
            VoteField::Upvotes => self.upvotes = value,
            VoteField::Downvotes => self.downvotes = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// One row mutation as delivered by the change feed.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct PostChange {
    pub kind: ChangeKind,
    pub post: Post,
}

/// Server-side predicate for change subscriptions. `None` fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChangeFilter {
    pub kind: Option<ChangeKind>,
    pub status: Option<bool>,
    pub post_id: Option<Uuid>,
}

impl ChangeFilter {
    /// "status becomes true" on any post.
    pub fn approved() -> Self {
        Self { kind: Some(ChangeKind::Update), status: Some(true), post_id: None }
    }

    pub fn for_post(mut self, id: PostId) -> Self {
        self.post_id = Some(id);
        self
    }

    pub fn matches(&self, change: &PostChange) -> bool {
        self.kind.map_or(true, |k| k == change.kind)
            && self.status.map_or(true, |s| s == change.post.status)
            && self.post_id.map_or(true, |id| id == change.post.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WriteVote {
    pub value: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AdjustVote {
    pub delta: i32,
}
