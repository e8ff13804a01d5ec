#![cfg(feature = "inmem-store")]

use ecoreport::models::{ChangeKind, NewPost, Severity, VoteField};
use ecoreport::repo::{inmem::InMemRepo, PostRepo, RepoError};
use ecoreport::ChangeFeed;
use serial_test::serial;
use uuid::Uuid;

fn new_post(title: &str) -> NewPost {
    NewPost {
        title: title.into(),
        description: "Bags of rubbish by the river".into(),
        image_url: None,
        location: "Riverside Park".into(),
        latitude: Some(51.5),
        longitude: Some(-0.12),
        category: vec!["waste".into()],
        tags: vec!["river".into()],
        severity: Severity::High,
    }
}

#[tokio::test]
async fn create_list_and_vote() {
    let r = InMemRepo::ephemeral(ChangeFeed::default());
    assert!(r.list_posts().await.unwrap().is_empty());

    let p = r.create_post("alice", new_post("Dumped tyres")).await.unwrap();
    assert_eq!((p.upvotes, p.downvotes, p.status), (0, 0, false));
    assert_eq!(p.author, "alice");

    let p = r.adjust_vote_count(p.id, VoteField::Upvotes, 1).await.unwrap();
    assert_eq!(p.upvotes, 1);
    let p = r.adjust_vote_count(p.id, VoteField::Downvotes, -1).await.unwrap();
    assert_eq!(p.downvotes, 0, "counts never go negative");

    let p = r.write_vote_count(p.id, VoteField::Downvotes, 4).await.unwrap();
    assert_eq!(p.downvotes, 4);
    assert_eq!(r.get_post(p.id).await.unwrap().downvotes, 4);
    assert!(!r.get_status(p.id).await.unwrap());

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = r.create_post("bob", new_post("Oil slick")).await.unwrap();
    let all = r.list_posts().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second.id, "newest first");
}

#[tokio::test]
async fn unknown_post_is_not_found() {
    let r = InMemRepo::ephemeral(ChangeFeed::default());
    let id = Uuid::new_v4();
    assert!(matches!(r.get_post(id).await, Err(RepoError::NotFound)));
    assert!(matches!(r.adjust_vote_count(id, VoteField::Upvotes, 1).await, Err(RepoError::NotFound)));
    assert!(matches!(r.get_status(id).await, Err(RepoError::NotFound)));
}

#[tokio::test]
async fn approve_is_idempotent_and_published_once() {
    let feed = ChangeFeed::default();
    let r = InMemRepo::ephemeral(feed.clone());
    let p = r.create_post("alice", new_post("Burst pipe")).await.unwrap();
    let mut rx = feed.subscribe();

    assert!(r.approve_post(p.id).await.unwrap().status);
    assert!(r.approve_post(p.id).await.unwrap().status);

    let change = rx.recv().await.unwrap();
    assert_eq!(change.kind, ChangeKind::Update);
    assert!(change.post.status);
    assert!(rx.try_recv().is_err(), "second approval changed nothing");
}

#[tokio::test]
#[serial]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("ECOREPORT_DATA_DIR", dir.path());

    let r = InMemRepo::new(ChangeFeed::default());
    let p = r.create_post("alice", new_post("Fly tipping")).await.unwrap();
    r.adjust_vote_count(p.id, VoteField::Upvotes, 3).await.unwrap();

    let reopened = InMemRepo::new(ChangeFeed::default());
    let p = reopened.get_post(p.id).await.unwrap();
    assert_eq!(p.upvotes, 3);
    assert_eq!(p.severity, Severity::High);
    std::env::remove_var("ECOREPORT_DATA_DIR");
}
