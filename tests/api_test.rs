use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use tokio::net::TcpListener;

use eggscan::db::{create_test_connection_in_temporary_file, migrate};
use eggscan::detect::{Candidate, DetectionAdapter, FixedDetector, ThresholdPolicy};
use eggscan::record::Detection;
use eggscan::render::Renderer;
use eggscan::serve::{
    build_router, AppState, HealthResponse, LatestDetectionResponse, RecordResponse, ResultsPage,
    UploadResponse,
};
use eggscan::store::RecordStore;

/// Running test server; dropping it removes the database and upload directory
struct TestServer {
    url: String,
    store: RecordStore,
    upload_dir: tempfile::TempDir,
    _db_guard: tempfile::TempDir,
    _handle: tokio::task::JoinHandle<()>,
}

fn candidate(label: &str, confidence: f64, bbox: [f64; 4]) -> Candidate {
    Candidate {
        label: label.to_string(),
        confidence,
        bbox,
    }
}

/// Start a server whose detector reports `candidates` for every image
async fn start_test_server(candidates: Vec<Candidate>) -> TestServer {
    let (pool, db_guard) = create_test_connection_in_temporary_file().await.unwrap();
    migrate(&pool).await.unwrap();
    let upload_dir = tempfile::tempdir().unwrap();

    let store = RecordStore::new(pool);
    let state = Arc::new(AppState {
        store: store.clone(),
        adapter: DetectionAdapter::new(
            Arc::new(FixedDetector::new(candidates)),
            ThresholdPolicy::default(),
        ),
        renderer: Renderer::new(8, 95),
        upload_dir: upload_dir.path().to_path_buf(),
        model_name: "fixed".to_string(),
        camera_prefix: "esp32".to_string(),
        public_base_url: None,
    });

    let app = build_router(state, 10 * 1024 * 1024);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    TestServer {
        url,
        store,
        upload_dir,
        _db_guard: db_guard,
        _handle: handle,
    }
}

fn egg_candidates() -> Vec<Candidate> {
    vec![
        candidate("unfertile", 0.72, [60.0, 60.0, 90.0, 90.0]),
        candidate("fertile", 0.91, [10.0, 10.0, 50.0, 50.0]),
    ]
}

/// A small PNG image
fn png_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(120, 100, Rgb([200, 180, 150]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

async fn upload(server: &TestServer, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/upload", server.url))
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn upload_ok(server: &TestServer, device_id: &str, timestamp: i64) -> UploadResponse {
    let response = upload(
        server,
        json!({
            "device_id": device_id,
            "timestamp": timestamp,
            "image": STANDARD.encode(png_bytes()),
        }),
    )
    .await;
    assert_eq!(response.status(), 200);
    response.json().await.unwrap()
}

async fn get(server: &TestServer, path: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(format!("{}{}", server.url, path))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_upload_returns_predictions_by_confidence() {
    let server = start_test_server(egg_candidates()).await;

    let data = upload_ok(&server, "esp32_cam_01", 1700000000).await;
    assert_eq!(data.status, "ok");
    assert_eq!(data.file, "esp32_cam_01_1700000000.jpg");
    assert!(data.id.starts_with("rec_"));
    assert!(data.image_with_boxes.starts_with("data:image/jpeg;base64,"));
    assert_eq!(
        data.pred,
        vec![
            Detection::new("fertile", 0.91, Some([10.0, 10.0, 50.0, 50.0])),
            Detection::new("unfertile", 0.72, Some([60.0, 60.0, 90.0, 90.0])),
        ]
    );

    let stored = server.upload_dir.path().join(&data.file);
    assert_eq!(std::fs::read(stored).unwrap(), png_bytes());
}

#[tokio::test]
async fn test_result_reports_latest_record() {
    let server = start_test_server(egg_candidates()).await;
    let uploaded = upload_ok(&server, "esp32_cam_01", 1700000000).await;

    let response = get(&server, "/result").await;
    assert_eq!(response.status(), 200);
    let data: RecordResponse = response.json().await.unwrap();

    assert_eq!(data.id, uploaded.id);
    assert_eq!(data.device_id, "esp32_cam_01");
    assert_eq!(data.timestamp, 1700000000);
    assert_eq!(data.file, uploaded.file);
    assert_eq!(data.image_url, format!("{}/uploads/{}", server.url, uploaded.file));
    let scores: Vec<(String, f64)> = data.pred.into_iter().map(|d| (d.label, d.score)).collect();
    assert_eq!(
        scores,
        vec![("fertile".to_string(), 0.91), ("unfertile".to_string(), 0.72)]
    );
}

#[tokio::test]
async fn test_nothing_above_threshold_reports_sentinel() {
    let server = start_test_server(vec![candidate("fertile", 0.55, [1.0, 1.0, 20.0, 20.0])]).await;
    upload_ok(&server, "phone_7", 1700000000).await;

    let raw: Value = get(&server, "/latest-detection").await.json().await.unwrap();
    assert_eq!(raw["total_detections"], 0);
    assert_eq!(raw["pred"], json!([{"label": "unknown", "score": 0.0, "box": []}]));

    let data: LatestDetectionResponse = serde_json::from_value(raw).unwrap();
    assert_eq!(data.source, "mobile");
    assert_eq!(data.pred, vec![Detection::sentinel()]);
}

#[tokio::test]
async fn test_latest_detection_fields() {
    let server = start_test_server(egg_candidates()).await;
    let uploaded = upload_ok(&server, "esp32_cam_01", 1700000000).await;

    let response = get(&server, "/latest-detection").await;
    assert_eq!(response.status(), 200);
    let data: LatestDetectionResponse = response.json().await.unwrap();

    assert_eq!(data.id, uploaded.id);
    assert_eq!(data.source, "camera");
    assert_eq!(data.timestamp, 1700000000);
    assert_eq!(data.datetime.as_deref(), Some("2023-11-14T22:13:20+00:00"));
    assert_eq!(data.total_detections, 2);
    assert_eq!(data.image_url, format!("{}/uploads/{}", server.url, uploaded.file));
}

#[tokio::test]
async fn test_results_pagination() {
    let server = start_test_server(egg_candidates()).await;
    for i in 0..5 {
        upload_ok(&server, "esp32_cam_01", 1000 + i).await;
    }

    let page: ResultsPage = get(&server, "/results?limit=2&offset=0")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(page.count, 2);
    let timestamps: Vec<i64> = page.items.iter().map(|r| r.timestamp).collect();
    assert_eq!(timestamps, vec![1004, 1003]);
    assert!(page.items.iter().all(|r| r.pred.len() == 2));

    let page: ResultsPage = get(&server, "/results?limit=2&offset=4")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.items[0].timestamp, 1000);

    let page: ResultsPage = get(&server, "/results").await.json().await.unwrap();
    assert_eq!(page.count, 5);
}

#[tokio::test]
async fn test_results_rejects_bad_params() {
    let server = start_test_server(egg_candidates()).await;

    for query in ["limit=-1", "offset=-3", "limit=abc", "offset=1.5"] {
        let response = get(&server, &format!("/results?{}", query)).await;
        assert_eq!(response.status(), 400, "query {}", query);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn test_empty_store_returns_404() {
    let server = start_test_server(egg_candidates()).await;

    for path in ["/latest", "/result", "/latest-detection"] {
        let response = get(&server, path).await;
        assert_eq!(response.status(), 404, "path {}", path);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].is_string());
    }

    let page: ResultsPage = get(&server, "/results").await.json().await.unwrap();
    assert_eq!(page.count, 0);
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn test_upload_rejects_missing_or_invalid_image() {
    let server = start_test_server(egg_candidates()).await;

    let response = upload(&server, json!({"device_id": "esp32_cam_01"})).await;
    assert_eq!(response.status(), 400);

    let response = upload(&server, json!({"image": "%%% not base64 %%%"})).await;
    assert_eq!(response.status(), 400);

    let response = reqwest::Client::new()
        .post(format!("{}/upload", server.url))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let page: ResultsPage = get(&server, "/results").await.json().await.unwrap();
    assert_eq!(page.count, 0);
}

#[tokio::test]
async fn test_upload_accepts_data_uri_and_string_timestamp() {
    let server = start_test_server(egg_candidates()).await;

    let response = upload(
        &server,
        json!({
            "timestamp": "1700000123",
            "image": format!("data:image/png;base64,{}", STANDARD.encode(png_bytes())),
        }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let data: UploadResponse = response.json().await.unwrap();
    assert_eq!(data.file, "unknown_1700000123.jpg");

    let record: RecordResponse = get(&server, "/result").await.json().await.unwrap();
    assert_eq!(record.device_id, "unknown");
    assert_eq!(record.timestamp, 1700000123);
}

#[tokio::test]
async fn test_upload_file_multipart() {
    let server = start_test_server(egg_candidates()).await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(png_bytes()).file_name("egg photo.png"),
    );
    let response = reqwest::Client::new()
        .post(format!("{}/upload-file", server.url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let data: UploadResponse = response.json().await.unwrap();
    assert!(data.file.starts_with("manual_"), "file {}", data.file);
    assert!(data.file.ends_with("_egg_photo.png"), "file {}", data.file);
    assert_eq!(data.pred.len(), 2);

    let latest: LatestDetectionResponse = get(&server, "/latest-detection").await.json().await.unwrap();
    assert_eq!(latest.device_id, "manual");
    assert_eq!(latest.source, "mobile");
}

#[tokio::test]
async fn test_upload_file_requires_file() {
    let server = start_test_server(egg_candidates()).await;

    let form = reqwest::multipart::Form::new().text("note", "no file here");
    let response = reqwest::Client::new()
        .post(format!("{}/upload-file", server.url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let form = reqwest::multipart::Form::new()
        .part("file", reqwest::multipart::Part::bytes(png_bytes()).file_name(""));
    let response = reqwest::Client::new()
        .post(format!("{}/upload-file", server.url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_latest_returns_annotated_jpeg() {
    let server = start_test_server(egg_candidates()).await;
    upload_ok(&server, "esp32_cam_01", 1700000000).await;

    let response = get(&server, "/latest").await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/jpeg"
    );

    let bytes = response.bytes().await.unwrap();
    let image = image::load_from_memory(&bytes).unwrap().to_rgb8();
    assert_eq!(image.dimensions(), (120, 100));

    // Left edge of the fertile box is drawn green
    let edge = image.get_pixel(10, 30);
    assert!(edge[1] > 150 && edge[0] < 120, "pixel {:?}", edge);
}

#[tokio::test]
async fn test_uploads_serves_stored_files() {
    let server = start_test_server(egg_candidates()).await;
    let uploaded = upload_ok(&server, "esp32_cam_01", 1700000000).await;

    let response = get(&server, &format!("/uploads/{}", uploaded.file)).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/jpeg"
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), png_bytes());

    let response = get(&server, "/uploads/missing.jpg").await;
    assert_eq!(response.status(), 404);

    let response = get(&server, "/uploads/..%2Fsecret.txt").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_health() {
    let server = start_test_server(egg_candidates()).await;
    upload_ok(&server, "esp32_cam_01", 1700000000).await;

    let response = get(&server, "/health").await;
    assert_eq!(response.status(), 200);
    let data: HealthResponse = response.json().await.unwrap();
    assert_eq!(data.status, "ok");
    assert_eq!(data.model, "fixed");
    assert_eq!(data.records, 1);
    assert!(data.timestamp > 1700000000);
}

fn stored_files(server: &TestServer) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(server.upload_dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_undecodable_upload_leaves_existing_record_intact() {
    let server = start_test_server(egg_candidates()).await;
    let uploaded = upload_ok(&server, "esp32_01", 1000).await;
    assert_eq!(get(&server, "/latest").await.status(), 200);

    let response = upload(
        &server,
        json!({
            "device_id": "esp32_01",
            "timestamp": 1000,
            "image": STANDARD.encode("hello not an image"),
        }),
    )
    .await;
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("decode"));

    assert_eq!(stored_files(&server), vec![uploaded.file.clone()]);
    assert_eq!(
        std::fs::read(server.upload_dir.path().join(&uploaded.file)).unwrap(),
        png_bytes()
    );

    let response = get(&server, "/latest").await;
    assert_eq!(response.status(), 200);
    let record: RecordResponse = get(&server, "/result").await.json().await.unwrap();
    assert_eq!(record.id, uploaded.id);

    let page: ResultsPage = get(&server, "/results").await.json().await.unwrap();
    assert_eq!(page.count, 1);
}

#[tokio::test]
async fn test_repeated_upload_name_keeps_both_files() {
    let server = start_test_server(egg_candidates()).await;

    let first = upload_ok(&server, "esp32_01", 1000).await;
    let second = upload_ok(&server, "esp32_01", 1000).await;

    assert_eq!(first.file, "esp32_01_1000.jpg");
    assert_eq!(second.file, "esp32_01_1000_1.jpg");
    assert_ne!(first.id, second.id);
    assert_eq!(
        stored_files(&server),
        vec!["esp32_01_1000.jpg".to_string(), "esp32_01_1000_1.jpg".to_string()]
    );

    let older = server.store.get(&first.id).await.unwrap().unwrap();
    assert_eq!(older.file, "esp32_01_1000.jpg");
}

#[tokio::test]
async fn test_image_url_percent_encodes_stored_name() {
    let server = start_test_server(egg_candidates()).await;

    let name = "manual_1_my egg#1.jpg";
    std::fs::write(server.upload_dir.path().join(name), png_bytes()).unwrap();
    server
        .store
        .save(
            "rec_legacy",
            "manual",
            1,
            name,
            vec![Detection::new("fertile", 0.9, Some([1.0, 1.0, 5.0, 5.0]))],
        )
        .await
        .unwrap();

    let record: RecordResponse = get(&server, "/result").await.json().await.unwrap();
    assert_eq!(record.file, name);
    assert_eq!(
        record.image_url,
        format!("{}/uploads/manual_1_my%20egg%231.jpg", server.url)
    );

    let response = reqwest::Client::new()
        .get(&record.image_url)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().to_vec(), png_bytes());
}
