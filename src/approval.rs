use tracing::info;

use crate::models::{Post, PostId};
use crate::repo::{PostRepo, RepoResult};

pub const DEFAULT_APPROVAL_THRESHOLD: i64 = 10;

/// Engagement rule that flips a post's status to approved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApprovalPolicy {
    /// Minimum `upvotes - downvotes`.
    pub threshold: i64,
}

impl Default for ApprovalPolicy {
    fn default() -> Self { Self { threshold: DEFAULT_APPROVAL_THRESHOLD } }
}

impl ApprovalPolicy {
    pub fn from_env() -> Self {
        let threshold = std::env::var("APPROVAL_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_APPROVAL_THRESHOLD);
        Self { threshold }
    }

    pub fn qualifies(&self, post: &Post) -> bool {
        i64::from(post.upvotes) - i64::from(post.downvotes) >= self.threshold
    }
}

/// Approve `id` if it now qualifies. Returns the resulting status.
pub async fn recheck(repo: &dyn PostRepo, policy: &ApprovalPolicy, post: &Post) -> RepoResult<bool> {
    if post.status {
        return Ok(true);
    }
    if !policy.qualifies(post) {
        return Ok(false);
    }
    let approved = repo.approve_post(post.id).await?;
    info!(post_id = %post.id, upvotes = approved.upvotes, downvotes = approved.downvotes, "post approved");
    Ok(approved.status)
}

pub async fn recheck_by_id(repo: &dyn PostRepo, policy: &ApprovalPolicy, id: PostId) -> RepoResult<bool> {
    let post = repo.get_post(id).await?;
    recheck(repo, policy, &post).await
}
