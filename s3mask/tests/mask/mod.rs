//! Masking jobs run end to end against an in-memory bucket and a fake masking service.
use crate::progress::TestMaskProgressCallback;
use crate::Result;
use assert_matches::assert_matches;
use bytes::Bytes;
use more_asserts::*;
use s3mask::{
    Config, ErrorKind, FailurePolicy, MaskJobBuilder, MaskSource, MaskSummary, MemoryBucket,
    S3MaskError, SkipReason,
};
use s3mask_testing::logging::test_with_logging;
use s3mask_testing::masking_service::{FakeMaskingService, MultipartResponse, CONTEXT_RESOURCES};
use s3mask_testing::test_data;
use std::future::Future;

const MASKED: &str = "this is a XXXX";
const RESULTS: &str = r#"{"matches":[{"matcher":"TestMatcher","start":10,"end":14}]}"#;

fn config_for(service: &FakeMaskingService) -> Config {
    Config {
        masking_url: service.base_url(),
        workers: 2,
        ..Default::default()
    }
}

fn masked_response() -> MultipartResponse {
    MultipartResponse::new()
        .part("file", "text/plain", MASKED)
        .part("results", "application/json", RESULTS)
}

/// Run a job over every object in `bucket` with the given abort future
async fn run_job_with_abort(
    config: Config,
    bucket: &MemoryBucket,
    abort: impl Future<Output = ()>,
) -> (s3mask::Result<MaskSummary>, TestMaskProgressCallback) {
    let progress = TestMaskProgressCallback::new();

    let source = MaskSource::Bucket {
        bucket: Box::new(bucket.clone()),
        prefix: String::new(),
    };
    let result = match MaskJobBuilder::new(config, source).build().await {
        Ok(job) => job.run(abort, progress.clone()).await,
        Err(e) => Err(e),
    };

    (result, progress)
}

async fn run_job(
    config: Config,
    bucket: &MemoryBucket,
) -> (s3mask::Result<MaskSummary>, TestMaskProgressCallback) {
    run_job_with_abort(config, bucket, futures::future::pending()).await
}

#[test]
fn masks_files_and_skips_everything_else() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let contexts = service.mock_contexts().await;
        let mask = service.mock_mask(&masked_response()).await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("a.txt", "text/plain", "this is a test");
        bucket.put("masked/old.txt", "text/plain", "this is a XXXX");
        bucket.put("results/old.json", "application/json", "{}");
        bucket.put("photos", "application/x-directory", "");

        let (result, progress) = run_job(config, &bucket).await;
        let summary = result?;

        assert_eq!(
            MaskSummary {
                enumerated: 4,
                masked: 1,
                skipped: 3,
                failed: 0,
            },
            summary
        );
        assert_eq!(summary, progress.finished_summary());

        assert_eq!(1, mask.hits_async().await);
        assert_eq!(Some(Bytes::from_static(MASKED.as_bytes())), bucket.get("masked/a.txt"));
        assert_eq!(Some(Bytes::from_static(RESULTS.as_bytes())), bucket.get("results/a.json"));

        // The skipped objects are left exactly as they were
        assert_eq!(
            Some(Bytes::from_static(b"this is a XXXX")),
            bucket.get("masked/old.txt")
        );
        assert_eq!(None, bucket.get("masked/masked/old.txt"));
        assert_eq!(None, bucket.get("masked/photos"));

        assert_eq!(vec!["a.txt".to_string()], progress.masked_keys());
        assert_eq!(
            vec![
                ("masked/old.txt".to_string(), SkipReason::AlreadyMasked),
                ("photos".to_string(), SkipReason::DirectoryMarker),
                ("results/old.json".to_string(), SkipReason::ResultsReport),
            ],
            progress.skipped()
        );
        assert_eq!(
            vec!["masked/a.txt".to_string(), "results/a.json".to_string()],
            progress.destinations_of("a.txt")
        );

        for resource in CONTEXT_RESOURCES {
            assert_eq!(1, contexts.created(resource).await, "{resource}");
            assert_eq!(1, contexts.destroyed(resource).await, "{resource}");
        }

        Ok(())
    })
}

#[test]
fn response_part_order_doesnt_matter() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let _contexts = service.mock_contexts().await;
        let response = MultipartResponse::new()
            .part("results", "application/json", RESULTS)
            .part("file", "text/plain", MASKED);
        service.mock_mask(&response).await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("a.txt", "text/plain", "this is a test");

        let (result, progress) = run_job(config, &bucket).await;
        result?;

        assert_eq!(Some(Bytes::from_static(MASKED.as_bytes())), bucket.get("masked/a.txt"));
        assert_eq!(Some(Bytes::from_static(RESULTS.as_bytes())), bucket.get("results/a.json"));
        assert_eq!(
            vec!["results/a.json".to_string(), "masked/a.txt".to_string()],
            progress.destinations_of("a.txt")
        );

        Ok(())
    })
}

#[test]
fn only_objects_under_the_prefix_are_masked() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let _contexts = service.mock_contexts().await;
        let mask = service.mock_mask(&masked_response()).await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("data/2022/a.txt", "text/plain", "this is a test");
        bucket.put("other/b.txt", "text/plain", "this is a test");

        let progress = TestMaskProgressCallback::new();
        let source = MaskSource::Bucket {
            bucket: Box::new(bucket.clone()),
            prefix: "data/".to_string(),
        };
        let summary = MaskJobBuilder::new(config, source)
            .build()
            .await?
            .run(futures::future::pending(), progress.clone())
            .await?;

        assert_eq!(1, summary.enumerated);
        assert_eq!(1, mask.hits_async().await);
        assert!(bucket.get("masked/data/2022/a.txt").is_some());
        assert!(bucket.get("results/data/2022/a.json").is_some());
        assert_eq!(None, bucket.get("masked/other/b.txt"));

        Ok(())
    })
}

#[test]
fn masking_service_error_fails_the_job() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let contexts = service.mock_contexts().await;
        service.mock_mask_failure(500, "kaboom").await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("b.txt", "text/plain", "this is a test");

        let (result, progress) = run_job(config, &bucket).await;

        assert_matches!(
            result,
            Err(S3MaskError::MaskingService { key, status: 500, body }) if key == "b.txt" && body == "kaboom"
        );
        assert_eq!(None, bucket.get("masked/b.txt"));
        assert_eq!(None, bucket.get("results/b.json"));
        assert_eq!(vec!["b.txt".to_string()], progress.failed_keys());
        assert_eq!(1, progress.finished_summary().failed);

        // Teardown still happens
        assert_eq!(CONTEXT_RESOURCES.len(), contexts.total_destroyed().await);

        Ok(())
    })
}

#[test]
fn failed_setup_masks_nothing() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let contexts = service
            .mock_contexts_failing_at(Some("files/fileSearchContext"))
            .await;
        let mask = service.mock_mask(&masked_response()).await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("a.txt", "text/plain", "this is a test");

        let (result, progress) = run_job(config, &bucket).await;

        assert_matches!(
            result,
            Err(S3MaskError::ContextCreate { resource, status: 500, .. }) if resource == "files/fileSearchContext"
        );
        assert_eq!(0, mask.hits_async().await);
        assert_eq!(None, bucket.get("masked/a.txt"));

        // Only what was created is destroyed
        assert_eq!(1, contexts.destroyed("searchContext").await);
        assert_eq!(1, contexts.destroyed("maskContext").await);
        assert_eq!(0, contexts.destroyed("files/fileSearchContext").await);
        assert_eq!(0, contexts.created("files/fileMaskContext").await);
        assert_eq!(0, contexts.destroyed("files/fileMaskContext").await);

        // The job never started, so there's nothing to report
        assert!(progress.events().is_empty());

        Ok(())
    })
}

#[test]
fn continue_policy_masks_the_rest_then_fails() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let contexts = service.mock_contexts().await;
        let mask = service.mock_mask(&masked_response()).await;

        let config = Config {
            failure_policy: FailurePolicy::Continue,
            ..config_for(&service)
        };
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("a.txt", "text/plain", "this is a test");
        bucket.put("b.txt", "text/plain", "this is a test");
        bucket.put_untyped("c.bin", test_data::random_bytes("4 KiB"));
        bucket.fail_reads_of("b.txt");

        let (result, progress) = run_job(config, &bucket).await;

        assert_matches!(result, Err(S3MaskError::ObjectsFailed { failed: 1 }));

        let summary = progress.finished_summary();
        assert_eq!(
            MaskSummary {
                enumerated: 3,
                masked: 2,
                skipped: 0,
                failed: 1,
            },
            summary
        );
        assert_eq!(summary.enumerated, summary.processed());

        assert_eq!(2, mask.hits_async().await);
        assert!(bucket.get("masked/a.txt").is_some());
        assert!(bucket.get("masked/c.bin").is_some());
        assert_eq!(None, bucket.get("masked/b.txt"));
        assert_eq!(vec!["b.txt".to_string()], progress.failed_keys());
        assert_eq!(CONTEXT_RESOURCES.len(), contexts.total_destroyed().await);

        Ok(())
    })
}

#[test]
fn large_masked_copies_are_multipart_uploads() -> Result<()> {
    test_with_logging(async move {
        let masked = test_data::random_text("3 MiB");

        let service = FakeMaskingService::start().await;
        let _contexts = service.mock_contexts().await;
        service
            .mock_mask(&MultipartResponse::new().part("file", "text/plain", &masked))
            .await;

        let config = Config {
            multipart_threshold: byte_unit::Byte::from_bytes(1024 * 1024),
            multipart_chunk_size: byte_unit::Byte::from_bytes(1024 * 1024),
            chunk_size: byte_unit::Byte::from_bytes(64 * 1024),
            ..config_for(&service)
        };
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("big.txt", "text/plain", test_data::random_text("3 MiB"));

        let (result, _progress) = run_job(config, &bucket).await;
        result?;

        assert_gt!(bucket.parts_uploaded("masked/big.txt").unwrap_or(0), 1);
        assert_eq!(Some(Bytes::from(masked)), bucket.get("masked/big.txt"));

        // No results part in the response means no results report
        assert_eq!(None, bucket.get("results/big.json"));

        Ok(())
    })
}

#[test]
fn results_can_go_to_a_local_directory() -> Result<()> {
    test_with_logging(async move {
        let results_dir = tempfile::tempdir()?;

        let service = FakeMaskingService::start().await;
        let _contexts = service.mock_contexts().await;
        service.mock_mask(&masked_response()).await;

        let config = Config {
            results_dir: Some(results_dir.path().to_path_buf()),
            ..config_for(&service)
        };
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("docs/a.txt", "text/plain", "this is a test");

        let (result, _progress) = run_job(config, &bucket).await;
        result?;

        let report = std::fs::read_to_string(results_dir.path().join("docs").join("a.json"))?;
        assert_eq!(RESULTS, report);
        assert!(bucket.get("masked/docs/a.txt").is_some());
        assert!(bucket.keys().iter().all(|key| !key.starts_with("results/")));

        Ok(())
    })
}

#[test]
fn disabled_results_are_discarded() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let _contexts = service.mock_contexts().await;
        service.mock_mask(&masked_response()).await;

        let config = Config {
            disable_results: true,
            ..config_for(&service)
        };
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("a.txt", "text/plain", "this is a test");

        let (result, progress) = run_job(config, &bucket).await;
        result?;

        assert_eq!(Some(Bytes::from_static(MASKED.as_bytes())), bucket.get("masked/a.txt"));
        assert_eq!(vec!["a.txt", "masked/a.txt"], bucket.keys());
        assert_eq!(
            vec!["masked/a.txt".to_string()],
            progress.destinations_of("a.txt")
        );

        Ok(())
    })
}

#[test]
fn empty_prefix_still_sets_up_and_tears_down() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let contexts = service.mock_contexts().await;
        let mask = service.mock_mask(&masked_response()).await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);

        let (result, progress) = run_job(config, &bucket).await;

        assert_eq!(MaskSummary::default(), result?);
        assert_eq!(MaskSummary::default(), progress.finished_summary());
        assert_eq!(0, mask.hits_async().await);
        assert_eq!(CONTEXT_RESOURCES.len(), contexts.total_created().await);
        assert_eq!(CONTEXT_RESOURCES.len(), contexts.total_destroyed().await);

        Ok(())
    })
}

#[test]
fn abort_tears_down_and_fails() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let contexts = service.mock_contexts().await;
        service.mock_mask(&masked_response()).await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);
        for index in 0..20 {
            bucket.put(format!("{index:02}.txt"), "text/plain", "this is a test");
        }

        let (result, progress) =
            run_job_with_abort(config, &bucket, futures::future::ready(())).await;

        assert_matches!(result, Err(S3MaskError::Aborted));
        assert_lt!(progress.finished_summary().masked, 20);
        assert_eq!(CONTEXT_RESOURCES.len(), contexts.total_destroyed().await);

        Ok(())
    })
}

#[test]
fn results_reports_with_the_same_stem_dont_collide() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let _contexts = service.mock_contexts().await;
        service.mock_mask(&masked_response()).await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("a.txt", "text/plain", "this is a test");
        bucket.put("a.csv", "text/csv", "this,is,a,test");

        let (result, progress) = run_job(config, &bucket).await;
        assert_eq!(2, result?.masked);

        let reports: Vec<String> = bucket
            .keys()
            .into_iter()
            .filter(|key| key.starts_with("results/"))
            .collect();
        assert_eq!(2, reports.len(), "{reports:?}");
        assert!(reports.contains(&"results/a.json".to_string()));
        // Whichever object finished second gets its full name
        assert!(
            reports.contains(&"results/a.txt.json".to_string())
                || reports.contains(&"results/a.csv.json".to_string()),
            "{reports:?}"
        );
        for report in &reports {
            assert_eq!(Some(Bytes::from_static(RESULTS.as_bytes())), bucket.get(report));
        }

        let txt_destinations = progress.destinations_of("a.txt");
        let csv_destinations = progress.destinations_of("a.csv");
        assert_eq!(2, txt_destinations.len());
        assert_eq!(2, csv_destinations.len());
        assert_ne!(txt_destinations[1], csv_destinations[1]);

        Ok(())
    })
}

#[test]
fn fail_fast_stops_the_other_workers() -> Result<()> {
    test_with_logging(async move {
        const WORKERS: usize = 2;

        let service = FakeMaskingService::start().await;
        let contexts = service.mock_contexts().await;
        let mask = service.mock_mask_failure(500, "kaboom").await;

        let config = Config {
            workers: WORKERS,
            ..config_for(&service)
        };
        let bucket = MemoryBucket::new("test-bucket", &config);
        for index in 0..40 {
            bucket.put(format!("{index:02}.txt"), "text/plain", "this is a test");
        }

        let (result, progress) = run_job(config, &bucket).await;

        assert_matches!(result, Err(S3MaskError::MaskingService { status: 500, .. }));

        // Each worker gets at most one object past the first failure
        assert_le!(mask.hits_async().await, 2 * WORKERS);
        let summary = progress.finished_summary();
        assert_eq!(0, summary.masked);
        assert_le!(summary.failed, 2 * WORKERS);
        assert!(bucket.keys().iter().all(|key| !key.starts_with("masked/")));
        assert_eq!(CONTEXT_RESOURCES.len(), contexts.total_destroyed().await);

        Ok(())
    })
}

#[test]
fn write_failure_fails_the_job() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let contexts = service.mock_contexts().await;
        service.mock_mask(&masked_response()).await;

        let config = config_for(&service);
        let bucket = MemoryBucket::new("test-bucket", &config);
        bucket.put("a.txt", "text/plain", "this is a test");
        bucket.fail_writes_to("masked/a.txt");

        let (result, progress) = run_job(config, &bucket).await;

        let err = result.unwrap_err();
        assert_eq!(ErrorKind::Write, err.kind());
        assert_matches!(err, S3MaskError::WriteObject { key, .. } if key == "masked/a.txt");
        assert_eq!(None, bucket.get("masked/a.txt"));
        assert_eq!(vec!["a.txt".to_string()], progress.failed_keys());
        assert_eq!(CONTEXT_RESOURCES.len(), contexts.total_destroyed().await);

        Ok(())
    })
}

#[test]
fn every_enumerated_object_is_processed_for_any_worker_count() -> Result<()> {
    test_with_logging(async move {
        let service = FakeMaskingService::start().await;
        let _contexts = service.mock_contexts().await;
        service.mock_mask(&masked_response()).await;

        for workers in [1, 3, 8] {
            let config = Config {
                workers,
                ..config_for(&service)
            };
            let bucket = MemoryBucket::new("test-bucket", &config);
            for index in 0..25 {
                bucket.put(format!("data/{index:02}.txt"), "text/plain", "this is a test");
            }
            bucket.put("data/empty/", "application/x-directory", "");

            let (result, progress) = run_job(config, &bucket).await;
            let summary = result?;

            assert_eq!(
                MaskSummary {
                    enumerated: 26,
                    masked: 25,
                    skipped: 1,
                    failed: 0,
                },
                summary,
                "workers = {workers}"
            );
            assert_eq!(summary.enumerated, summary.processed());
            assert_eq!(summary, progress.finished_summary());
            assert_eq!(25, progress.masked_keys().len());
        }

        Ok(())
    })
}
