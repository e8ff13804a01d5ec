#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App};
use ecoreport::auth::create_jwt;
use ecoreport::repo::inmem::InMemRepo;
use ecoreport::storage::FsImageStore;
use ecoreport::{config, AppState, ChangeFeed};
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

fn state(images: &tempfile::TempDir) -> AppState {
    let feed = ChangeFeed::default();
    let repo = InMemRepo::ephemeral(feed.clone());
    AppState::new(Arc::new(repo), Arc::new(FsImageStore::at(images.path())), feed)
}

macro_rules! json_body {
    ($resp:expr) => {
        serde_json::from_slice::<Value>(&test::read_body($resp).await).unwrap()
    };
}

#[actix_web::test]
#[serial]
async fn post_vote_and_approval_flow() {
    setup_env();
    let tmp = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(web::Data::new(state(&tmp))).configure(config)).await;

    // empty feed
    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/posts").to_request()).await;
    assert!(resp.status().is_success());
    assert_eq!(json_body!(resp).as_array().unwrap().len(), 0);

    // anonymous report
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .set_json(json!({
            "title": "Dumped fridge",
            "description": "Leaking coolant near the playground",
            "location": "Elm Street",
            "latitude": 40.71,
            "longitude": -74.0,
            "severity": "catastrophic"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let post = json_body!(resp);
    assert_eq!(post["author"], "anonymous");
    assert_eq!(post["severity"], "unknown");
    assert_eq!(post["status"], false);
    let id = post["id"].as_str().unwrap().to_string();

    // nine atomic upvotes keep it pending
    for expected in 1..=9 {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/posts/{id}/votes/upvotes/adjust"))
            .set_json(json!({ "delta": 1 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body = json_body!(resp);
        assert_eq!(body["upvotes"], expected);
        assert_eq!(body["status"], false);
    }

    // the tenth crosses the threshold
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{id}/votes/up/adjust"))
        .set_json(json!({ "delta": 1 }))
        .to_request();
    let body = json_body!(test::call_service(&app, req).await);
    assert_eq!(body["upvotes"], 10);
    assert_eq!(body["status"], true);

    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/api/v1/posts/{id}/status")).to_request()).await;
    assert_eq!(json_body!(resp), json!(true));

    // absolute write below the threshold does not revoke approval
    let req = test::TestRequest::put()
        .uri(&format!("/api/v1/posts/{id}/votes/downvotes"))
        .set_json(json!({ "value": 8 }))
        .to_request();
    let body = json_body!(test::call_service(&app, req).await);
    assert_eq!(body["downvotes"], 8);
    assert_eq!(body["status"], true);

    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/api/v1/posts/{id}")).to_request()).await;
    let body = json_body!(resp);
    assert_eq!((body["upvotes"].as_u64(), body["downvotes"].as_u64()), (Some(10), Some(8)));
}

#[actix_web::test]
#[serial]
async fn invalid_requests_are_rejected() {
    setup_env();
    let tmp = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(web::Data::new(state(&tmp))).configure(config)).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .set_json(json!({ "title": "Smoke", "latitude": 10.0 }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::post().uri("/api/v1/posts").set_json(json!({ "title": " " })).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let missing = uuid::Uuid::new_v4();
    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/api/v1/posts/{missing}")).to_request()).await;
    assert_eq!(resp.status(), 404);
    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/api/v1/posts/{missing}/status")).to_request()).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post().uri("/api/v1/posts").set_json(json!({ "title": "Smog" })).to_request();
    let id = json_body!(test::call_service(&app, req).await)["id"].as_str().unwrap().to_string();
    let req = test::TestRequest::put()
        .uri(&format!("/api/v1/posts/{id}/votes/resolved"))
        .set_json(json!({ "value": 1 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert!(json_body!(resp)["error"].as_str().unwrap().contains("resolved"));
}

#[actix_web::test]
#[serial]
async fn authenticated_author_and_me() {
    setup_env();
    let tmp = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(web::Data::new(state(&tmp))).configure(config)).await;
    let token = create_jwt("user-42", Some("eco@example.org")).unwrap();

    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/auth/me").to_request()).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/api/v1/auth/me")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    let me = json_body!(test::call_service(&app, req).await);
    assert_eq!(me["id"], "user-42");
    assert_eq!(me["email"], "eco@example.org");

    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(json!({ "title": "Blocked drain" }))
        .to_request();
    assert_eq!(json_body!(test::call_service(&app, req).await)["author"], "user-42");
}

fn multipart(boundary: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"photo.png\"\r\nContent-Type: image/png\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[actix_web::test]
#[serial]
async fn image_upload_is_content_addressed() {
    setup_env();
    let tmp = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(web::Data::new(state(&tmp))).configure(config)).await;

    let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    png.extend_from_slice(&[0u8; 32]);
    let boundary = "ecoreportboundary";

    let upload = || {
        test::TestRequest::post()
            .uri("/api/v1/images")
            .insert_header(("Content-Type", format!("multipart/form-data; boundary={boundary}")))
            .set_payload(multipart(boundary, &png))
            .to_request()
    };

    let resp = test::call_service(&app, upload()).await;
    assert_eq!(resp.status(), 201);
    let first = json_body!(resp);
    assert_eq!(first["mime"], "image/png");
    assert_eq!(first["duplicate"], false);
    let key = first["key"].as_str().unwrap().to_string();
    assert!(first["url"].as_str().unwrap().ends_with(&format!("/images/{key}")));

    let resp = test::call_service(&app, upload()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(json_body!(resp)["duplicate"], true);

    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/images/{key}")).to_request()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(test::read_body(resp).await.as_ref(), png.as_slice());

    let resp = test::call_service(&app, test::TestRequest::get().uri("/images/not-a-key").to_request()).await;
    assert_eq!(resp.status(), 404);
}
