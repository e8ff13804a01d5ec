#![cfg(feature = "inmem-store")]

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use ecoreport::approval::ApprovalPolicy;
use ecoreport::models::{NewPost, Severity, VoteDirection, VoteField};
use ecoreport::repo::{inmem::InMemRepo, PostRepo};
use ecoreport::storage::FsImageStore;
use ecoreport::sync::{GatewayError, HttpGateway, RemoteGateway, SyncClient, SyncConfig};
use ecoreport::{config, AppState, ChangeFeed};

struct Running {
    base_url: String,
    feed: ChangeFeed,
    repo: Arc<InMemRepo>,
    _images: tempfile::TempDir,
}

fn start_server(threshold: i64) -> Running {
    let images = tempfile::tempdir().unwrap();
    let feed = ChangeFeed::default();
    let repo = Arc::new(InMemRepo::ephemeral(feed.clone()));
    let state = AppState {
        approval: ApprovalPolicy { threshold },
        sse_keepalive: Duration::from_millis(200),
        ..AppState::new(repo.clone(), Arc::new(FsImageStore::at(images.path())), feed.clone())
    };
    let server = HttpServer::new(move || App::new().app_data(web::Data::new(state.clone())).configure(config))
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    Running { base_url: format!("http://{addr}"), feed, repo, _images: images }
}

fn report(title: &str) -> NewPost {
    NewPost {
        title: title.into(),
        description: String::new(),
        image_url: None,
        location: "Harbour Road".into(),
        latitude: Some(-33.86),
        longitude: Some(151.2),
        category: vec![],
        tags: vec![],
        severity: Severity::Low,
    }
}

async fn settle<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[actix_web::test]
async fn reads_and_writes_over_http() {
    let srv = start_server(1_000);
    let post = srv.repo.create_post("anonymous", report("Oil drums")).await.unwrap();
    let gw = HttpGateway::new(&srv.base_url);

    let posts = gw.read_posts().await.unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].id, post.id);

    let p = gw.adjust_vote_count(post.id, VoteField::Upvotes, 2).await.unwrap();
    assert_eq!(p.upvotes, 2);
    let p = gw.write_vote_count(post.id, VoteField::Downvotes, 5).await.unwrap();
    assert_eq!((p.upvotes, p.downvotes), (2, 5));
    assert!(!gw.check_status(post.id).await.unwrap());

    let missing = uuid::Uuid::new_v4();
    assert!(matches!(gw.read_post(missing).await, Err(GatewayError::NotFound)));
}

#[actix_web::test]
async fn sync_client_over_http_and_sse() {
    let srv = start_server(1_000);
    let post = srv.repo.create_post("anonymous", report("Sewage outflow")).await.unwrap();
    srv.repo.write_vote_count(post.id, VoteField::Upvotes, 30).await.unwrap();
    let post = srv.repo.write_vote_count(post.id, VoteField::Downvotes, 2).await.unwrap();

    let client = SyncClient::new(Arc::new(HttpGateway::new(&srv.base_url)), SyncConfig::default());
    let views = client.load_feed().await;
    assert_eq!(views.len(), 1);

    let v = client.apply_vote(post.id, VoteDirection::Up).unwrap();
    assert_eq!(v.upvotes, 31);
    let repo = srv.repo.clone();
    settle(|| {
        let repo = repo.clone();
        async move { repo.get_post(post.id).await.unwrap().upvotes == 31 }
    })
    .await;

    // the SSE listener must be attached before the approval is published
    let feed = srv.feed.clone();
    settle(|| {
        let feed = feed.clone();
        async move { feed.receiver_count() >= 1 }
    })
    .await;
    srv.repo.approve_post(post.id).await.unwrap();

    let c = client.clone();
    settle(|| {
        let c = c.clone();
        async move { c.view(post.id).map_or(false, |v| v.is_approved()) && !c.is_subscribed(post.id) }
    })
    .await;
    client.shutdown();
}
