//! The `/api/v2.0` surface: visibility, paging and the artifact views.

mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{json_body, Harness, ADMIN, DEV, GUEST};

#[tokio::test]
async fn private_projects_are_hidden_from_strangers() {
    let harness = Harness::new().await;
    let response = harness
        .api(
            Method::POST,
            "/projects",
            Some(DEV),
            Some(json!({"project_name": "team", "metadata": {"public": "false"}})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = harness.api(Method::GET, "/projects/team", Some(DEV), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let project = json_body(response).await;
    assert_eq!(project["owner_name"], "dev");
    assert_eq!(project["metadata"]["public"], "false");

    let response = harness.api(Method::GET, "/projects/team", None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = harness.api(Method::GET, "/projects/team", Some(GUEST), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness
        .api(
            Method::POST,
            "/projects",
            Some(ADMIN),
            Some(json!({"project_name": "team"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn project_listing_reports_the_total() {
    let harness = Harness::new().await;
    for n in 0..3 {
        harness.project(&format!("p{n}"), true).await;
    }

    let response = harness
        .api(Method::GET, "/projects?page=1&page_size=2", None, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-total-count"], "3");
    assert_eq!(
        response.headers()["link"],
        "</api/v2.0/projects?page=2&page_size=2>; rel=\"next\""
    );
    let page = json_body(response).await;
    let names: Vec<_> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|project| project["name"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(names, ["p0", "p1"]);
}

#[tokio::test]
async fn nested_repositories_are_addressed_double_encoded() {
    let harness = Harness::new().await;
    harness.project("team", false).await;
    harness.push_image("team/web/app", "v1", &[b"layer"]).await;

    let listing = "/projects/team/repositories/web%252Fapp/artifacts";
    let response = harness.api(Method::GET, listing, Some(ADMIN), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-total-count"], "1");
    let artifacts = json_body(response).await;
    assert_eq!(artifacts[0]["tags"][0]["name"], "v1");

    let response = harness
        .api(
            Method::POST,
            &format!("{listing}/v1/tags"),
            Some(ADMIN),
            Some(json!({"name": "stable"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = harness
        .api(Method::GET, &format!("{listing}/stable"), Some(ADMIN), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let artifact = json_body(response).await;
    let mut tags: Vec<_> = artifact["tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tag| tag["name"].as_str().unwrap().to_owned())
        .collect();
    tags.sort();
    assert_eq!(tags, ["stable", "v1"]);

    let tag = format!("{listing}/v1/tags/stable");
    let response = harness.api(Method::DELETE, &tag, Some(ADMIN), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = harness.api(Method::DELETE, &tag, Some(ADMIN), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn registry_secrets_never_leave_the_api() {
    let harness = Harness::new().await;
    let endpoint = json!({
        "name": "upstream",
        "type": "harbor",
        "url": "https://upstream.example.com",
        "credential": {"access_key": "robot", "access_secret": "s3cret"},
    });

    let response = harness
        .api(Method::POST, "/registries", Some(DEV), Some(endpoint.clone()))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = harness
        .api(Method::POST, "/registries", Some(ADMIN), Some(endpoint))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = harness.api(Method::GET, "/registries", Some(ADMIN), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let registries = json_body(response).await;
    assert_eq!(registries[0]["credential"]["access_key"], "robot");
    assert_eq!(registries[0]["credential"]["access_secret"], "*****");
}

#[tokio::test]
async fn unknown_adapter_types_are_refused() {
    let harness = Harness::new().await;
    let response = harness
        .api(
            Method::POST,
            "/registries",
            Some(ADMIN),
            Some(json!({"name": "x", "type": "no-such-registry", "url": "https://x.example"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let harness = Harness::new().await;
    let response = harness.api(Method::GET, "/no/such/thing", Some(ADMIN), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
