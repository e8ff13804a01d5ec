use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::feed::ChangeFeed;
use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Server-side store for posts. Every mutation is published on the change feed.
#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn list_posts(&self) -> RepoResult<Vec<Post>>;
    async fn get_post(&self, id: PostId) -> RepoResult<Post>;
    async fn create_post(&self, author: &str, new: NewPost) -> RepoResult<Post>;
    /// Targeted absolute write of one counter (last write wins).
    async fn write_vote_count(&self, id: PostId, field: VoteField, value: u32) -> RepoResult<Post>;
    /// Atomic increment/decrement of one counter, saturating at zero.
    async fn adjust_vote_count(&self, id: PostId, field: VoteField, delta: i32) -> RepoResult<Post>;
    /// false -> true only. Approving an approved post is a no-op.
    async fn approve_post(&self, id: PostId) -> RepoResult<Post>;
    async fn get_status(&self, id: PostId) -> RepoResult<bool> {
        Ok(self.get_post(id).await?.status)
    }
}

pub(crate) fn apply_delta(current: u32, delta: i32) -> u32 {
    if delta >= 0 {
        current.saturating_add(delta as u32)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};
    use tracing::{info, warn};

    const SNAPSHOT_FILE: &str = "state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        posts: HashMap<PostId, Post>,
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Option<Arc<PathBuf>>,
        feed: ChangeFeed,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("ECOREPORT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        info!("loaded snapshot '{}' ({} posts)", path.display(), s.posts.len());
                        s
                    }
                    Err(e) => {
                        warn!("failed to parse snapshot '{}': {e}. Starting empty.", path.display());
                        State::default()
                    }
                },
                Err(e) => {
                    info!("no snapshot at '{}': {e}. Starting empty.", path.display());
                    State::default()
                }
            }
        }

        /// Snapshot-backed store rooted at `ECOREPORT_DATA_DIR` (default `data/`).
        pub fn new(feed: ChangeFeed) -> Self {
            let mut path = Self::data_dir();
            path.push(SNAPSHOT_FILE);
            let state = Self::load_state_from(&path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Some(Arc::new(path)),
                feed,
            }
        }

        /// Memory-only store; nothing is written to disk.
        pub fn ephemeral(feed: ChangeFeed) -> Self {
            Self { state: Arc::new(RwLock::new(State::default())), snapshot_path: None, feed }
        }

        pub fn feed(&self) -> &ChangeFeed {
            &self.feed
        }

        fn persist(&self) {
            let Some(path) = self.snapshot_path.as_ref() else { return };
            let bytes = match self.state.read() {
                Ok(s) => serde_json::to_vec_pretty(&*s),
                Err(_) => return,
            };
            if let Ok(bytes) = bytes {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(path.as_path(), bytes) {
                    warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        /// Run `f` against one post under the write lock, then persist and publish.
        fn mutate<F>(&self, id: PostId, f: F) -> RepoResult<Post>
        where
            F: FnOnce(&mut Post) -> bool,
        {
            let mut s = self.state.write().map_err(|_| RepoError::Internal("lock poisoned".into()))?;
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            let changed = f(post);
            let updated = post.clone();
            drop(s); // release lock before persisting
            if changed {
                self.persist();
                self.feed.publish(PostChange { kind: ChangeKind::Update, post: updated.clone() });
            }
            Ok(updated)
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn list_posts(&self) -> RepoResult<Vec<Post>> {
            let s = self.state.read().map_err(|_| RepoError::Internal("lock poisoned".into()))?;
            let mut v: Vec<_> = s.posts.values().cloned().collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at)); // newest first
            Ok(v)
        }

        async fn get_post(&self, id: PostId) -> RepoResult<Post> {
            let s = self.state.read().map_err(|_| RepoError::Internal("lock poisoned".into()))?;
            s.posts.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn create_post(&self, author: &str, new: NewPost) -> RepoResult<Post> {
            let post = Post {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                author: author.to_string(),
                title: new.title,
                description: new.description,
                image_url: new.image_url,
                location: new.location,
                latitude: new.latitude,
                longitude: new.longitude,
                upvotes: 0,
                downvotes: 0,
                status: false,
                resolved: 0,
                category: new.category,
                tags: new.tags,
                severity: new.severity,
            };
            {
                let mut s = self.state.write().map_err(|_| RepoError::Internal("lock poisoned".into()))?;
                if s.posts.contains_key(&post.id) {
                    return Err(RepoError::Conflict);
                }
                s.posts.insert(post.id, post.clone());
            }
            self.persist();
            self.feed.publish(PostChange { kind: ChangeKind::Insert, post: post.clone() });
            Ok(post)
        }

        async fn write_vote_count(&self, id: PostId, field: VoteField, value: u32) -> RepoResult<Post> {
            self.mutate(id, |p| {
                let mut votes = p.votes();
                votes.set(field, value);
                p.upvotes = votes.upvotes;
                p.downvotes = votes.downvotes;
                true
            })
        }

        async fn adjust_vote_count(&self, id: PostId, field: VoteField, delta: i32) -> RepoResult<Post> {
            self.mutate(id, |p| {
                let mut votes = p.votes();
                votes.set(field, apply_delta(votes.get(field), delta));
                p.upvotes = votes.upvotes;
                p.downvotes = votes.downvotes;
                true
            })
        }

        async fn approve_post(&self, id: PostId) -> RepoResult<Post> {
            self.mutate(id, |p| {
                if p.status { return false; }
                p.status = true;
                true
            })
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    const POST_COLUMNS: &str = "id, created_at, author, title, description, image_url, location, latitude, longitude, upvotes, downvotes, status, resolved, category, tags, severity";

    #[derive(sqlx::FromRow)]
    struct PostRow {
        id: Uuid,
        created_at: chrono::DateTime<Utc>,
        author: String,
        title: String,
        description: String,
        image_url: Option<String>,
        location: String,
        latitude: Option<f64>,
        longitude: Option<f64>,
        upvotes: i32,
        downvotes: i32,
        status: bool,
        resolved: i32,
        category: Vec<String>,
        tags: Vec<String>,
        severity: String,
    }

    impl From<PostRow> for Post {
        fn from(r: PostRow) -> Self {
            Post {
                id: r.id,
                created_at: r.created_at,
                author: r.author,
                title: r.title,
                description: r.description,
                image_url: r.image_url,
                location: r.location,
                latitude: r.latitude,
                longitude: r.longitude,
                upvotes: r.upvotes.max(0) as u32,
                downvotes: r.downvotes.max(0) as u32,
                status: r.status,
                resolved: r.resolved.max(0) as u32,
                category: r.category,
                tags: r.tags,
                severity: Severity::parse(&r.severity),
            }
        }
    }

    fn map_err(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Conflict,
            other => RepoError::Internal(other.to_string()),
        }
    }

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres>, feed: ChangeFeed }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>, feed: ChangeFeed) -> Self { Self { pool, feed } }

        fn publish_update(&self, post: &Post) {
            self.feed.publish(PostChange { kind: ChangeKind::Update, post: post.clone() });
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn list_posts(&self) -> RepoResult<Vec<Post>> {
            let rows = sqlx::query_as::<_, PostRow>(&format!("SELECT {POST_COLUMNS} FROM posts ORDER BY created_at DESC"))
                .fetch_all(&self.pool).await.map_err(map_err)?;
            Ok(rows.into_iter().map(Post::from).collect())
        }

        async fn get_post(&self, id: PostId) -> RepoResult<Post> {
            let row = sqlx::query_as::<_, PostRow>(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool).await.map_err(map_err)?;
            Ok(row.into())
        }

        async fn create_post(&self, author: &str, new: NewPost) -> RepoResult<Post> {
            let row = sqlx::query_as::<_, PostRow>(&format!(
                "INSERT INTO posts (id, author, title, description, image_url, location, latitude, longitude, category, tags, severity) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) RETURNING {POST_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(author)
            .bind(&new.title)
            .bind(&new.description)
            .bind(new.image_url.as_ref())
            .bind(&new.location)
            .bind(new.latitude)
            .bind(new.longitude)
            .bind(&new.category)
            .bind(&new.tags)
            .bind(new.severity.as_str())
            .fetch_one(&self.pool).await.map_err(map_err)?;
            let post: Post = row.into();
            self.feed.publish(PostChange { kind: ChangeKind::Insert, post: post.clone() });
            Ok(post)
        }

        async fn write_vote_count(&self, id: PostId, field: VoteField, value: u32) -> RepoResult<Post> {
            let value = i32::try_from(value).map_err(|_| RepoError::Conflict)?;
            let sql = format!("UPDATE posts SET {col} = $2 WHERE id = $1 RETURNING {POST_COLUMNS}", col = field.as_str());
            let row = sqlx::query_as::<_, PostRow>(&sql)
                .bind(id).bind(value)
                .fetch_one(&self.pool).await.map_err(map_err)?;
            let post: Post = row.into();
            self.publish_update(&post);
            Ok(post)
        }

        async fn adjust_vote_count(&self, id: PostId, field: VoteField, delta: i32) -> RepoResult<Post> {
            // single statement: the increment happens server side, no read-modify-write
            let sql = format!(
                "UPDATE posts SET {col} = GREATEST({col} + $2, 0) WHERE id = $1 RETURNING {POST_COLUMNS}",
                col = field.as_str()
            );
            let row = sqlx::query_as::<_, PostRow>(&sql)
                .bind(id).bind(delta)
                .fetch_one(&self.pool).await.map_err(map_err)?;
            let post: Post = row.into();
            self.publish_update(&post);
            Ok(post)
        }

        async fn approve_post(&self, id: PostId) -> RepoResult<Post> {
            let row = sqlx::query_as::<_, PostRow>(&format!(
                "UPDATE posts SET status = TRUE WHERE id = $1 AND status = FALSE RETURNING {POST_COLUMNS}"
            ))
            .bind(id)
            .fetch_optional(&self.pool).await.map_err(map_err)?;
            match row {
                Some(row) => {
                    let post: Post = row.into();
                    self.publish_update(&post);
                    Ok(post)
                }
                None => self.get_post(id).await, // already approved (or NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::apply_delta;

    #[test]
    fn delta_saturates_at_zero() {
        assert_eq!(apply_delta(3, -1), 2);
        assert_eq!(apply_delta(0, -1), 0);
        assert_eq!(apply_delta(u32::MAX, 1), u32::MAX);
        assert_eq!(apply_delta(30, 1), 31);
    }
}
