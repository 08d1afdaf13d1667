//! Download → multipart upload against a wiremock media host

mod common;

use async_trait::async_trait;
use bulkport_common::ResourcePath;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bulkport_worker::bulk::{MemoryBulkStore, UserQuota};
use bulkport_worker::cancel::{CancelSignal, CancellationProbe};
use bulkport_worker::config::TransferConfig;
use bulkport_worker::storage::MemoryObjectStore;
use bulkport_worker::transfer::{BatchOptions, FailureKind, QuotaBudget, TransferPipeline};

struct Fixture {
    server: MockServer,
    objects: Arc<MemoryObjectStore>,
    pipeline: TransferPipeline,
}

async fn fixture(config: TransferConfig) -> Fixture {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part\""))
        .mount(&server)
        .await;

    let objects = Arc::new(MemoryObjectStore::new(format!("{}/parts", server.uri())));
    let pipeline = TransferPipeline::new(objects.clone(), config).unwrap();
    Fixture {
        server,
        objects,
        pipeline,
    }
}

async fn serve(server: &MockServer, name: &str, body: Vec<u8>) -> String {
    Mock::given(method("GET"))
        .and(path(format!("/media/{}", name)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "image/jpeg")
                .set_body_bytes(body),
        )
        .mount(server)
        .await;
    format!("{}/media/{}", server.uri(), name)
}

fn options() -> BatchOptions {
    BatchOptions::new(
        ResourcePath::parse("/companies/acme/catalog/sku-1").unwrap(),
        QuotaBudget::unlimited(),
    )
}

#[tokio::test]
async fn test_body_is_split_into_fixed_parts() {
    let fx = fixture(common::test_config().transfer).await;
    let body: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let url = serve(&fx.server, "photo.jpg", body.clone()).await;

    let outcome = fx
        .pipeline
        .download_batch(&[url], &options(), 1, &CancelSignal::new())
        .await
        .unwrap();

    assert!(outcome.all_succeeded());
    let result = &outcome.results[0];
    assert_eq!(result.size, 2500);
    assert_eq!(result.mime_type.as_deref(), Some("image/jpeg"));
    let key = result.storage_path.clone().unwrap();
    assert!(key.starts_with("companies/acme/catalog/sku-1/"));
    assert!(key.ends_with("-photo.jpg"));

    let parts = fx.objects.parts_of(&key);
    assert_eq!(parts.len(), 3);
    assert_eq!(
        parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(fx.objects.open_uploads(), 0);

    let mut puts: Vec<(u32, Vec<u8>)> = fx
        .server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PUT")
        .map(|r| {
            let number = r.url.path().rsplit('/').next().unwrap().parse().unwrap();
            (number, r.body)
        })
        .collect();
    puts.sort_by_key(|(number, _)| *number);

    let sizes: Vec<usize> = puts.iter().map(|(_, b)| b.len()).collect();
    assert_eq!(sizes, vec![1024, 1024, 452]);
    let reassembled: Vec<u8> = puts.into_iter().flat_map(|(_, b)| b).collect();
    assert_eq!(reassembled, body);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let fx = fixture(common::test_config().transfer).await;
    Mock::given(method("GET"))
        .and(path("/media/flaky.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&fx.server)
        .await;
    let url = serve(&fx.server, "flaky.jpg", vec![1u8; 64]).await;

    let outcome = fx
        .pipeline
        .download_batch(&[url], &options(), 1, &CancelSignal::new())
        .await
        .unwrap();

    assert!(outcome.all_succeeded());
    assert_eq!(outcome.results[0].attempts, 2);
}

#[tokio::test]
async fn test_permanent_failures_are_classified() {
    let fx = fixture(common::test_config().transfer).await;
    Mock::given(method("GET"))
        .and(path("/media/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&fx.server)
        .await;
    let missing = format!("{}/media/missing.jpg", fx.server.uri());
    let binary = format!("{}/media/tool.exe", fx.server.uri());

    let outcome = fx
        .pipeline
        .download_batch(&[missing, binary], &options(), 2, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.failed, 2);
    let not_found = outcome.results[0].error.as_ref().unwrap();
    assert_eq!(not_found.kind, FailureKind::Transient);
    assert_eq!(outcome.results[0].attempts, 1);

    let rejected = outcome.results[1].error.as_ref().unwrap();
    assert_eq!(rejected.kind, FailureKind::Validation);
    assert_eq!(outcome.results[1].attempts, 0);
    assert_eq!(fx.objects.initiated_uploads(), 0);
}

#[tokio::test]
async fn test_declared_size_over_limit_never_opens_upload() {
    let mut config = common::test_config().transfer;
    config.max_file_size = 1000;
    let fx = fixture(config).await;
    let big = serve(&fx.server, "big.jpg", vec![0u8; 4000]).await;
    let small = serve(&fx.server, "small.jpg", vec![0u8; 600]).await;

    let mut opts = options();
    opts.max_file_size = Some(500);
    let outcome = fx
        .pipeline
        .download_batch(&[big, small], &opts, 1, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.failed, 2);
    for result in &outcome.results {
        assert_eq!(result.error.as_ref().unwrap().kind, FailureKind::Limit);
    }
    assert!(outcome.results[1]
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("500 byte limit"));
    assert_eq!(fx.objects.initiated_uploads(), 0);
}

#[tokio::test]
async fn test_quota_is_shared_across_a_batch() {
    let fx = fixture(common::test_config().transfer).await;
    let a = serve(&fx.server, "a.jpg", vec![0u8; 400]).await;
    let b = serve(&fx.server, "b.jpg", vec![0u8; 400]).await;

    let opts = BatchOptions::new(ResourcePath::root(), QuotaBudget::new(500));
    let outcome = fx
        .pipeline
        .download_batch(&[a, b], &opts, 1, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.succeeded, 1);
    assert_eq!(outcome.total_bytes, 400);
    assert_eq!(
        outcome.results[1].error.as_ref().unwrap().message,
        "Storage quota exceeded: 400 bytes required, 100 remaining"
    );
    assert_eq!(opts.budget.remaining(), 100);
}

#[tokio::test]
async fn test_concurrent_batches_share_the_user_ledger() {
    let fx = fixture(common::test_config().transfer).await;
    let a = serve(&fx.server, "a.jpg", vec![0u8; 400]).await;
    let b = serve(&fx.server, "b.jpg", vec![0u8; 400]).await;

    let ledger = MemoryBulkStore::new();
    let user = Uuid::new_v4();
    ledger.set_quota(user, 500, 0);
    let budget = || {
        let quota = UserQuota::new(Arc::new(ledger.clone()), user);
        BatchOptions::new(ResourcePath::root(), QuotaBudget::shared(Arc::new(quota)))
    };
    let (first_opts, second_opts) = (budget(), budget());

    let (first, second) = tokio::join!(
        fx.pipeline
            .download_batch(&[a], &first_opts, 1, &CancelSignal::new()),
        fx.pipeline
            .download_batch(&[b], &second_opts, 1, &CancelSignal::new()),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.succeeded + second.succeeded, 1);
    assert_eq!(ledger.quota_used(user), Some(400));
    let denied = if first.succeeded == 0 { &first } else { &second };
    assert_eq!(denied.results[0].error.as_ref().unwrap().kind, FailureKind::Limit);
}

/// Requests cancellation once anything has been stored
struct CancelAfterFirstObject(Arc<MemoryObjectStore>);

#[async_trait]
impl CancellationProbe for CancelAfterFirstObject {
    async fn is_cancel_requested(&self) -> bool {
        !self.0.object_keys().is_empty()
    }
}

#[tokio::test]
async fn test_cancelled_batch_deletes_stored_objects() {
    let fx = fixture(common::test_config().transfer).await;
    let first = serve(&fx.server, "first.jpg", vec![3u8; 200]).await;
    let second = serve(&fx.server, "second.jpg", vec![4u8; 200]).await;

    let cancel = CancelSignal::with_probe(
        Arc::new(CancelAfterFirstObject(fx.objects.clone())),
        Duration::ZERO,
    );
    let mut opts = options();
    opts.budget = QuotaBudget::new(1000);
    let err = fx
        .pipeline
        .download_batch(&[first, second], &opts, 1, &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancellation());
    assert_eq!(opts.budget.remaining(), 1000);
    assert!(cancel.is_cancelled());
    assert_eq!(fx.objects.initiated_uploads(), 1);
    assert_eq!(fx.objects.deleted_keys().len(), 1);
    assert!(fx.objects.object_keys().is_empty());
}
