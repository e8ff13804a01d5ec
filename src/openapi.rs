use crate::models::{AdjustVote, ChangeFilter, ChangeKind, NewPost, Post, PostChange, Severity, VoteCount, VoteField, WriteVote};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_posts,
        crate::routes::create_post,
        crate::routes::get_post,
        crate::routes::check_status,
        crate::routes::write_vote,
        crate::routes::adjust_vote,
        crate::routes::upload_image,
        crate::routes::auth_me,
    ),
    components(schemas(
        Post, NewPost, Severity, VoteField, VoteCount, WriteVote, AdjustVote,
        PostChange, ChangeKind, ChangeFilter,
        crate::routes::ImageUploadResponse, crate::routes::MeResponse
    )),
    tags(
        (name = "posts", description = "Environmental issue reports"),
        (name = "votes", description = "Vote counters and approval"),
    )
)]
pub struct ApiDoc;
