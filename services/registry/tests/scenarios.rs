//! End-to-end flows through the token endpoint, `/v2` and `/api/v2.0`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use harbor_core::media::{OCI_EMPTY, OCI_MANIFEST};
use harbor_core::model::ExecutionStatus;
use harbor_core::store::QuotaStore;
use harbor_core::Digest;
use harbor_replication::{Adapter, AdapterRegistry, MemoryAdapter};
use serde_json::json;

use common::{basic, body, config, json_body, location_id, Harness, ADMIN};

const MIB: u64 = 1024 * 1024;

#[tokio::test]
async fn anonymous_pull_follows_the_challenge() {
    let harness = Harness::new().await;
    harness.project("library", true).await;
    let manifest = harness.push_image("library/nginx", "latest", &[b"nginx"]).await;

    let response = harness
        .send(
            Request::builder()
                .uri("/v2/library/nginx/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Bearer realm=\"https://h/service/token\",service=\"harbor-registry\",scope=\"repository:library/nginx:pull\""
    );

    let response = harness
        .send(
            Request::builder()
                .uri("/service/token?service=harbor-registry&scope=repository:library/nginx:pull")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let token = json_body(response).await["token"]
        .as_str()
        .unwrap()
        .to_owned();

    let response = harness
        .send(
            Request::builder()
                .uri("/v2/library/nginx/manifests/latest")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-content-digest"],
        Digest::sha256(&manifest).to_string().as_str()
    );
    assert_eq!(body(response).await, manifest);
}

#[tokio::test]
async fn immutable_tags_cannot_move() {
    let harness = Harness::new().await;
    harness.project("p", false).await;
    let response = harness
        .api(
            Method::POST,
            "/projects/p/immutabletagrules",
            Some(ADMIN),
            Some(json!({"tag_selector": {"pattern": "release-*"}})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    harness.push_image("p/web", "release-1", &[b"one"]).await;
    let other = harness
        .image_manifest("p/web", &json!({"os": "linux"}), &[b"two"])
        .await;
    let response = harness.put_manifest("p/web", "release-1", &other).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let errors = json_body(response).await;
    assert_eq!(errors["errors"][0]["code"], "TAG_IMMUTABLE");
    assert!(errors["errors"][0]["message"]
        .as_str()
        .unwrap()
        .contains("immutable rule 'release-*'"));

    // Tags the rule does not select still move.
    harness.push_image("p/web", "dev", &[b"one"]).await;
    let response = harness.put_manifest("p/web", "dev", &other).await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn pushes_over_quota_are_refused() {
    let harness = Harness::new().await;
    let project = harness.project("p", false).await;
    let store = harness.store();
    store.set_quota_limit(project.id, Some(100 * MIB)).await.unwrap();
    store.set_quota_usage(project.id, 99 * MIB).await.unwrap();

    let layer = vec![7u8; 2 * MIB as usize];
    let response = harness
        .send(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/v2/p/web/blobs/uploads/?digest={}", Digest::sha256(&layer)))
                .header(header::AUTHORIZATION, basic(ADMIN))
                .header(header::CONTENT_LENGTH, layer.len())
                .body(Body::from(layer))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(response).await["errors"][0]["code"], "QUOTA_EXCEEDED");

    let quota = store.get_quota(project.id).await.unwrap();
    assert_eq!(quota.used, 99 * MIB);
    assert_eq!(quota.reserved, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_replication_starts_no_new_tasks() {
    let local = Arc::new(MemoryAdapter::new("local"));
    for n in 0..50u8 {
        local.put_image("team/app", &format!("v{n}"), &[&[n]]);
    }
    local.set_latency(Some(Duration::from_millis(20)));
    let remote = Arc::new(MemoryAdapter::new("remote"));
    let mut adapters = AdapterRegistry::new();
    let target = remote.clone();
    adapters.register("memory", move |_| Ok(target.clone() as Arc<dyn Adapter>));

    let mut config = config();
    config.replication.concurrency = 2;
    let harness = Harness::with(config, |builder| {
        builder
            .adapters(adapters)
            .local_adapter(local.clone() as Arc<dyn Adapter>)
    })
    .await;

    let response = harness
        .api(
            Method::POST,
            "/registries",
            Some(ADMIN),
            Some(json!({"name": "remote", "type": "memory", "url": "memory://remote"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let registry = location_id(&response);

    let response = harness
        .api(
            Method::POST,
            "/replication/policies",
            Some(ADMIN),
            Some(json!({
                "name": "mirror",
                "dst_registry": registry,
                "dst_namespace": "mirror",
                "trigger": {"type": "manual"},
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let policy = location_id(&response);

    let response = harness
        .api(
            Method::POST,
            "/replication/executions",
            Some(ADMIN),
            Some(json!({"policy_id": policy})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let execution = location_id(&response);

    let engine = harness.registry.replication();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = engine.execution(execution).await.unwrap();
            if current.counters.succeed >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("five tasks complete");

    let response = harness
        .api(
            Method::PATCH,
            &format!("/replication/executions/{execution}"),
            Some(ADMIN),
            Some(json!({"status": "Stopped"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let stopped = tokio::time::timeout(Duration::from_secs(10), engine.wait(execution))
        .await
        .expect("execution finishes")
        .unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Stopped);
    assert_eq!(stopped.counters.running(), 0);
    assert!(stopped.counters.succeed < 50);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let later = engine.execution(execution).await.unwrap();
    assert_eq!(later.counters, stopped.counters);

    let response = harness
        .api(
            Method::GET,
            &format!("/replication/executions/{execution}"),
            Some(ADMIN),
            None,
        )
        .await;
    assert_eq!(json_body(response).await["status"], "Stopped");
}

#[tokio::test]
async fn accessories_follow_their_subject() {
    let harness = Harness::new().await;
    harness.project("library", false).await;
    let image = harness.push_image("library/app", "v1", &[b"app"]).await;
    let image_digest = Digest::sha256(&image);

    let empty = harness.push_blob("library/app", b"{}").await;
    let signature = harness.push_blob("library/app", b"signature payload").await;
    let accessory = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "artifactType": "application/vnd.dev.cosign.artifact.sig.v1+json",
        "config": {"mediaType": OCI_EMPTY, "digest": empty.to_string(), "size": 2},
        "layers": [{
            "mediaType": "application/vnd.dev.cosign.simplesigning.v1+json",
            "digest": signature.to_string(),
            "size": 17,
        }],
        "subject": {"mediaType": OCI_MANIFEST, "digest": image_digest.to_string(), "size": image.len()},
    }))
    .unwrap();
    let accessory_digest = Digest::sha256(&accessory);
    let response = harness
        .put_manifest("library/app", &accessory_digest.to_string(), &accessory)
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers()["oci-subject"],
        image_digest.to_string().as_str()
    );

    let response = harness
        .send(
            Request::builder()
                .uri(format!("/v2/library/app/referrers/{image_digest}"))
                .header(header::AUTHORIZATION, basic(ADMIN))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let index = json_body(response).await;
    assert_eq!(index["manifests"].as_array().unwrap().len(), 1);
    assert_eq!(index["manifests"][0]["digest"], accessory_digest.to_string());

    let response = harness
        .send(
            Request::builder()
                .method(Method::DELETE)
                .uri(format!("/v2/library/app/manifests/{image_digest}"))
                .header(header::AUTHORIZATION, basic(ADMIN))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    for uri in [
        format!("/v2/library/app/blobs/{signature}"),
        format!("/v2/library/app/manifests/{accessory_digest}"),
    ] {
        let response = harness
            .send(
                Request::builder()
                    .method(Method::HEAD)
                    .uri(&uri)
                    .header(header::AUTHORIZATION, basic(ADMIN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

fn png(size: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(size, size, image::Rgba([200, 30, 30, 255]));
    let mut out = std::io::Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

#[tokio::test]
async fn custom_icons_are_thumbnailed_once() {
    let harness = Harness::new().await;
    harness.project("library", false).await;
    let icon = png(160);
    let icon_digest = Digest::sha256(&icon);
    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Labels": {"io.goharbor.artifact.icon": icon_digest.to_string()}},
    });
    let manifest = harness
        .image_manifest("library/app", &config, &[&icon])
        .await;
    let response = harness.put_manifest("library/app", "v1", &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let first = fetch_icon(&harness, &icon_digest).await;
    let icon: serde_json::Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(icon["content-type"], "image/png");
    let thumbnail = STANDARD.decode(icon["content"].as_str().unwrap()).unwrap();
    let decoded = image::load_from_memory(&thumbnail).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (50, 50));

    assert_eq!(fetch_icon(&harness, &icon_digest).await, first);
}

#[tokio::test]
async fn dangling_icon_labels_use_the_builtin_icon() {
    let harness = Harness::new().await;
    harness.project("library", false).await;
    let missing = Digest::sha256(&png(80));
    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Labels": {"io.goharbor.artifact.icon": missing.to_string()}},
    });
    let manifest = harness
        .image_manifest("library/app", &config, &[b"layer"])
        .await;
    let response = harness.put_manifest("library/app", "v1", &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = harness
        .api(
            Method::GET,
            "/projects/library/repositories/app/artifacts/v1",
            Some(ADMIN),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let artifact = json_body(response).await;
    let builtin = Digest::sha256(include_bytes!("../src/artifact/icons/image.png"));
    assert_eq!(artifact["icon"], builtin.to_string());
    fetch_icon(&harness, &builtin).await;
}

async fn fetch_icon(harness: &Harness, digest: &Digest) -> bytes::Bytes {
    let response = harness
        .api(Method::GET, &format!("/icons/{digest}"), None, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    body(response).await
}
