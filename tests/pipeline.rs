//! Offline integration tests for the docpipe stages.
//!
//! Every collaborator is local: a directory-backed object store, an
//! in-memory SQLite warehouse, and fake hub / PDF engine / extraction
//! service implementations. Fake PDFs are `%PDF-fake\n` followed by a JSON
//! page description, e.g. `{"pages":[{"text":"Hi","images":2}]}`. Image
//! `i` on page `p` (both 0-based) is `10 * (p + 1) + i` pixels wide;
//! `"float_images"` adds that many float-pixel images PNG cannot encode.
//!
//! Run with:
//!   cargo test --test pipeline

use async_trait::async_trait;
use docpipe::cloud_service::{
    AssetHandle, ExtractJob, ExtractionService, JobLocation, JobStatus, ResultAsset,
};
use docpipe::hub::DatasetHub;
use docpipe::pdf::{PageContent, PdfBackend};
use docpipe::storage::{FsObjectStore, ObjectStore};
use docpipe::warehouse::{SqliteWarehouse, Warehouse};
use docpipe::{
    fetch_extracted, list_questions, ExtractionMethod, FileError, Pipeline, PipelineConfig,
    PipelineContext, PipelineError, PipelineProgressCallback, RepoKind, ServiceError, Stage,
    StageReport, TableNames,
};
use image::DynamicImage;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

// ── Fakes ────────────────────────────────────────────────────────────────────

const FAKE_MAGIC: &[u8] = b"%PDF-fake\n";

fn fake_pdf(spec: Value) -> Vec<u8> {
    let mut out = FAKE_MAGIC.to_vec();
    out.extend_from_slice(spec.to_string().as_bytes());
    out
}

fn page_spec(data: &[u8]) -> Option<Value> {
    let body = data.strip_prefix(FAKE_MAGIC)?;
    serde_json::from_slice(body).ok()
}

struct FakeHub {
    files: Vec<(String, Vec<u8>)>,
    cache: TempDir,
}

impl FakeHub {
    fn new(files: Vec<(&str, Vec<u8>)>) -> Self {
        Self {
            files: files.into_iter().map(|(n, d)| (n.to_string(), d)).collect(),
            cache: tempfile::tempdir().unwrap(),
        }
    }
}

#[async_trait]
impl DatasetHub for FakeHub {
    async fn list_files(&self, _repo: &str, _kind: RepoKind) -> Result<Vec<String>, PipelineError> {
        Ok(self.files.iter().map(|(n, _)| n.clone()).collect())
    }

    async fn download(
        &self,
        repo: &str,
        _kind: RepoKind,
        path: &str,
    ) -> Result<PathBuf, PipelineError> {
        let (_, data) = self
            .files
            .iter()
            .find(|(n, _)| n == path)
            .ok_or_else(|| PipelineError::Hub {
                repo: repo.to_string(),
                detail: format!("{path} not found"),
            })?;
        let local = self.cache.path().join(path);
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, data).unwrap();
        Ok(local)
    }
}

/// Opens only `%PDF-fake` documents; anything else is corrupt. With
/// `unbound` set every call fails like a missing pdfium library.
#[derive(Default)]
struct FakePdf {
    unbound: AtomicBool,
}

impl FakePdf {
    fn spec(&self, path: &Path) -> Result<Value, PipelineError> {
        if self.unbound.load(Ordering::SeqCst) {
            return Err(PipelineError::PdfiumBindingFailed(
                "libpdfium.so: cannot open shared object file".into(),
            ));
        }
        let data = std::fs::read(path).map_err(|e| PipelineError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        page_spec(&data).ok_or_else(|| PipelineError::CorruptPdf {
            path: path.to_path_buf(),
            detail: "not a fake PDF".into(),
        })
    }
}

impl PdfBackend for FakePdf {
    fn open_check(&self, path: &Path) -> Result<(), PipelineError> {
        self.spec(path).map(|_| ())
    }

    fn extract(&self, path: &Path) -> Result<Vec<PageContent>, PipelineError> {
        let spec = self.spec(path)?;
        let pages = spec["pages"].as_array().cloned().unwrap_or_default();
        Ok(pages
            .iter()
            .enumerate()
            .map(|(page, p)| {
                let width = |i: u64| 10 * (page as u32 + 1) + i as u32;
                let plain = p["images"].as_u64().unwrap_or(0);
                let float = p["float_images"].as_u64().unwrap_or(0);
                let images = (0..plain)
                    .map(|i| DynamicImage::new_rgb8(width(i), 2))
                    .chain((plain..plain + float).map(|i| DynamicImage::new_rgb32f(width(i), 2)))
                    .collect();
                PageContent {
                    text: p["text"].as_str().unwrap_or_default().to_string(),
                    images,
                }
            })
            .collect())
    }
}

/// Extraction service driven by the uploaded fake PDF: `"cloud": "hang"`
/// never finishes, `"cloud": "fail"` fails the job, anything else returns
/// an archive whose elements are the trimmed page texts.
#[derive(Default)]
struct FakeExtractor {
    assets: Mutex<HashMap<String, Vec<u8>>>,
    jobs: Mutex<HashMap<String, String>>,
    seq: AtomicUsize,
    reject_auth: bool,
    polls: AtomicUsize,
}

impl FakeExtractor {
    fn result_zip(spec: &Value) -> Vec<u8> {
        let elements: Vec<Value> = spec["pages"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let path = if i == 0 { "//Document/H1" } else { "//Document/P" };
                json!({"Path": path, "Text": p["text"].as_str().unwrap_or_default().trim()})
            })
            .collect();

        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("structuredData.json", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(json!({ "elements": elements }).to_string().as_bytes())
            .unwrap();
        zip.start_file("figures/fileoutpart0.png", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"png").unwrap();
        zip.finish().unwrap().into_inner()
    }
}

#[async_trait]
impl ExtractionService for FakeExtractor {
    async fn authenticate(&self) -> Result<(), PipelineError> {
        if self.reject_auth {
            return Err(PipelineError::Credentials {
                path: PathBuf::from("Adobe_Credentials.json"),
                detail: "rejected".into(),
            });
        }
        Ok(())
    }

    async fn upload(&self, data: Vec<u8>, _media_type: &str) -> Result<AssetHandle, ServiceError> {
        let id = format!("asset-{}", self.seq.fetch_add(1, Ordering::SeqCst));
        self.assets.lock().unwrap().insert(id.clone(), data);
        Ok(AssetHandle { asset_id: id })
    }

    async fn submit(&self, job: &ExtractJob) -> Result<JobLocation, ServiceError> {
        let location = format!("job-{}", job.asset_id);
        self.jobs
            .lock()
            .unwrap()
            .insert(location.clone(), job.asset_id.clone());
        Ok(JobLocation(location))
    }

    async fn poll(&self, location: &JobLocation) -> Result<JobStatus, ServiceError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let asset = self.jobs.lock().unwrap()[&location.0].clone();
        let spec = page_spec(&self.assets.lock().unwrap()[&asset]).unwrap_or_default();
        Ok(match spec["cloud"].as_str() {
            Some("hang") => JobStatus::InProgress,
            Some("fail") => JobStatus::Failed("ERROR: unsupported document".into()),
            _ => JobStatus::Done(ResultAsset {
                download_uri: asset,
            }),
        })
    }

    async fn get_content(&self, result: &ResultAsset) -> Result<Vec<u8>, ServiceError> {
        let data = self.assets.lock().unwrap()[&result.download_uri].clone();
        let spec = page_spec(&data).ok_or_else(|| ServiceError::Sdk("bad asset".into()))?;
        Ok(Self::result_zip(&spec))
    }
}

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

impl PipelineProgressCallback for RecordingProgress {
    fn on_stage_start(&self, stage: &str, _index: usize, _total: usize) {
        self.events.lock().unwrap().push(format!("start {stage}"));
    }

    fn on_stage_complete(&self, report: &StageReport) {
        self.events
            .lock()
            .unwrap()
            .push(format!("done {}", report.stage));
    }

    fn on_stage_error(&self, stage: &str, _error: &str) {
        self.events.lock().unwrap().push(format!("error {stage}"));
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    dir: TempDir,
    store: Arc<FsObjectStore>,
    warehouse: Arc<SqliteWarehouse>,
    pdf: Arc<FakePdf>,
    extractor: Arc<FakeExtractor>,
    progress: Arc<RecordingProgress>,
    pipeline: Pipeline,
}

fn config(dir: &Path, hub_token: Option<&str>, poll_timeout_secs: u64) -> PipelineConfig {
    let mut builder = PipelineConfig::builder()
        .bucket("bench")
        .repo_id("gaia-benchmark/GAIA")
        .scratch_dir(dir.join("scratch"))
        .output_dir(dir.join("out"))
        .cloud_extracted_folder("adobe_extracted")
        .poll_interval_ms(5)
        .poll_timeout_secs(poll_timeout_secs);
    if let Some(token) = hub_token {
        builder = builder.hub_token(token);
    }
    builder.build().unwrap()
}

fn harness_with(
    hub: FakeHub,
    extractor: FakeExtractor,
    hub_token: Option<&str>,
    poll_timeout_secs: u64,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path().join("bucket"), "bench"));
    let warehouse = Arc::new(SqliteWarehouse::in_memory().unwrap());
    let pdf = Arc::new(FakePdf::default());
    let extractor = Arc::new(extractor);
    let progress = Arc::new(RecordingProgress::default());

    let ctx = PipelineContext::new(
        config(dir.path(), hub_token, poll_timeout_secs),
        store.clone(),
        warehouse.clone(),
        Arc::new(hub),
        pdf.clone(),
        extractor.clone(),
    )
    .with_progress(progress.clone());

    Harness {
        dir,
        store,
        warehouse,
        pdf,
        extractor,
        progress,
        pipeline: Pipeline::new(ctx),
    }
}

fn harness(hub: FakeHub) -> Harness {
    harness_with(hub, FakeExtractor::default(), Some("hf_test"), 5)
}

fn benchmark_hub() -> FakeHub {
    let test_meta = [
        json!({"task_id": "t1", "Question": "Q1?", "Level": 1, "Final answer": "42", "file_name": "t1.pdf"}),
        json!({"task_id": "t2", "Question": "Q2?", "Level": 2, "Final answer": "no", "file_name": ""}),
        json!({"task_id": "t3", "Question": "Q3?", "Level": 3, "Final answer": "x", "file_name": "t3.pdf"}),
    ];
    let test_jsonl = format!(
        "{}\n\n{}\n{}\n",
        test_meta[0], test_meta[1], test_meta[2]
    );
    let validation_jsonl = json!({
        "task_id": "v1", "Question": "V1?", "Level": 1, "Final answer": "yes",
        "file_name": "v1.pdf", "Annotator Metadata": {"Steps": "read"}
    })
    .to_string();

    FakeHub::new(vec![
        ("README.md", b"# benchmark".to_vec()),
        ("2023/test/metadata.jsonl", test_jsonl.into_bytes()),
        ("2023/validation/metadata.jsonl", validation_jsonl.into_bytes()),
        (
            "2023/test/t1.pdf",
            fake_pdf(json!({"pages": [
                {"text": "Hello ", "images": 1},
                {"text": " world", "images": 2}
            ]})),
        ),
        ("2023/test/t3.pdf", b"%PDF-1.4 truncated garbage".to_vec()),
        ("2023/test/notpdf.pdf", b"GIF89a....".to_vec()),
        (
            "2023/validation/v1.pdf",
            fake_pdf(json!({"pages": [{"text": "Validation\u{200B} text", "images": 0}]})),
        ),
    ])
}

async fn table_rows(wh: &SqliteWarehouse, sql: &str) -> Vec<serde_json::Map<String, Value>> {
    wh.query(sql, &[]).await.unwrap()
}

// ── Full run ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_loads_every_table() {
    let h = harness(benchmark_hub());
    let report = tokio_test::assert_ok!(h.pipeline.run().await);

    let names: Vec<&str> = report.stages.iter().map(|s| s.stage.as_str()).collect();
    let expected: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
    assert_eq!(names, expected);

    // ── stage-dataset ────────────────────────────────────────────────────
    let staged = report.stage("stage-dataset").unwrap();
    assert_eq!(staged.processed, 6);
    assert_eq!(staged.skipped, 1);
    assert!(h
        .store
        .get("2023/test/t1.pdf")
        .await
        .unwrap()
        .starts_with(FAKE_MAGIC));

    // ── normalize-metadata ───────────────────────────────────────────────
    let normalized = report.stage("normalize-metadata").unwrap();
    assert_eq!(normalized.processed, 2);
    assert!(normalized.is_clean());
    let csv_bytes = h.store.get("cleaned_data/metadata_test.csv").await.unwrap();
    let mut rdr = csv::Reader::from_reader(csv_bytes.as_slice());
    let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 3);
    let source_col = rdr
        .headers()
        .unwrap()
        .iter()
        .position(|col| col == "dataset_source")
        .unwrap();
    assert!(rows.iter().all(|r| &r[source_col] == "metadata_test"));

    // ── opensource-extract ───────────────────────────────────────────────
    let extracted = report.stage("opensource-extract").unwrap();
    assert_eq!(extracted.processed, 2);
    assert_eq!(extracted.rejected, 2);
    let rejected: Vec<&str> = extracted
        .failed
        .iter()
        .filter_map(|f| match f {
            FileError::InvalidPdf { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(rejected, ["2023/test/notpdf.pdf", "2023/test/t3.pdf"]);

    let scratch = h.dir.path().join("scratch");
    assert!(scratch.join("2023/test/t1.pdf").is_file());
    assert!(!scratch.join("2023/test/t3.pdf").exists());
    assert!(!scratch.join("2023/test/notpdf.pdf").exists());

    let artifact: Value =
        serde_json::from_slice(&h.store.get("extracted_data/t1/t1.json").await.unwrap()).unwrap();
    assert_eq!(artifact["pdf_filename"], "t1.pdf");
    assert_eq!(artifact["image_count"], 3);
    assert_eq!(artifact["extracted_text_length"], 12);
    assert_eq!(
        artifact["image_paths"],
        json!([
            "gs://bench/extracted_data/t1/t1_img1.png",
            "gs://bench/extracted_data/t1/t1_img2.png",
            "gs://bench/extracted_data/t1/t1_img3.png"
        ])
    );
    let mut widths = Vec::new();
    for n in 1..=3 {
        let png = h
            .store
            .get(&format!("extracted_data/t1/t1_img{n}.png"))
            .await
            .unwrap();
        assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));
        widths.push(image::load_from_memory(&png).unwrap().width());
    }
    assert_eq!(widths, [10, 20, 21]);
    assert!(h.store.get("extracted_data/t1/t1.csv").await.is_ok());

    // ── load-metadata ────────────────────────────────────────────────────
    assert_eq!(report.stage("load-metadata").unwrap().rows_loaded, Some(4));
    let meta = table_rows(
        &h.warehouse,
        "SELECT task_id, level, dataset_source, file_path, annotator_metadata \
         FROM \"combined_metadata\" ORDER BY task_id",
    )
    .await;
    assert_eq!(meta.len(), 4);
    assert_eq!(meta[0]["task_id"], "t1");
    assert_eq!(meta[0]["level"], 1);
    assert_eq!(
        meta[0]["file_path"],
        "https://storage.cloud.google.com/bench/2023/test/t1.pdf"
    );
    assert_eq!(meta[1]["file_path"], Value::Null);
    assert_eq!(meta[3]["dataset_source"], "metadata_validation");
    assert_eq!(meta[3]["annotator_metadata"], r#"{"Steps":"read"}"#);

    // ── load-opensource ──────────────────────────────────────────────────
    assert_eq!(report.stage("load-opensource").unwrap().rows_loaded, Some(2));
    let tables = TableNames::default();
    let t1 = fetch_extracted(h.warehouse.as_ref(), &tables, "t1", ExtractionMethod::OpenSource)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t1.text(), "Hello world");
    let v1 = fetch_extracted(h.warehouse.as_ref(), &tables, "v1", ExtractionMethod::OpenSource)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v1.text(), "Validation text");

    // ── cloud-extract / cloud-upload ─────────────────────────────────────
    let cloud = report.stage("cloud-extract").unwrap();
    assert_eq!(cloud.processed, 2);
    assert!(cloud.is_clean());
    assert!(h.dir.path().join("out/extract_t1.zip").is_file());
    assert!(h.dir.path().join("out/extract_t1/figures/fileoutpart0.png").is_file());

    assert_eq!(report.stage("cloud-upload").unwrap().processed, 4);
    assert!(h
        .store
        .get("adobe_extracted/extract_t1/extract_t1_structuredData.json")
        .await
        .is_ok());
    assert!(h
        .store
        .get("adobe_extracted/extract_v1/extract_v1_fileoutpart0.png")
        .await
        .is_ok());

    // ── load-cloud ───────────────────────────────────────────────────────
    assert_eq!(report.stage("load-cloud").unwrap().rows_loaded, Some(2));
    let t1_cloud = fetch_extracted(h.warehouse.as_ref(), &tables, "t1", ExtractionMethod::Cloud)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t1_cloud.text(), "Hello world");
    match t1_cloud {
        docpipe::ExtractionResult::Cloud(r) => {
            assert_eq!(r.source, "extract_t1");
            assert_eq!(
                r.file_path,
                "gs://bench/adobe_extracted/extract_t1/extract_t1_structuredData.json"
            );
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // ── ensure-users ─────────────────────────────────────────────────────
    assert_eq!(report.stage("ensure-users").unwrap().processed, 1);

    // ── Serving reads ────────────────────────────────────────────────────
    let questions = list_questions(h.warehouse.as_ref(), &tables).await.unwrap();
    let ids: Vec<&str> = questions.iter().map(|q| q.task_id.as_str()).collect();
    assert_eq!(ids, ["t1", "t3", "v1"]);
    assert!(
        fetch_extracted(h.warehouse.as_ref(), &tables, "missing", ExtractionMethod::Cloud)
            .await
            .unwrap()
            .is_none()
    );

    assert_eq!(h.extractor.seq.load(Ordering::SeqCst), 2);
    let events = h.progress.events.lock().unwrap();
    assert_eq!(events.first().map(String::as_str), Some("start stage-dataset"));
    assert_eq!(events.last().map(String::as_str), Some("done ensure-users"));
}

#[tokio::test]
async fn reloading_is_idempotent() {
    let h = harness(benchmark_hub());
    h.pipeline.run_from(Stage::StageDataset).await.unwrap();

    let count = "SELECT COUNT(*) AS n FROM \"opensource_extracted\"";
    let before = table_rows(&h.warehouse, count).await;
    let again = h.pipeline.run_stage(Stage::LoadOpenSource).await.unwrap();
    assert_eq!(again.rows_loaded, Some(2));
    let after = table_rows(&h.warehouse, count).await;
    assert_eq!(before, after);

    // ensure-users is a no-op the second time.
    let users = h.pipeline.run_stage(Stage::EnsureUsers).await.unwrap();
    assert_eq!(users.processed, 0);
    assert_eq!(users.skipped, 1);
}

#[tokio::test]
async fn run_without_pdfs_completes_every_stage() {
    let meta = json!({"task_id": "t1", "Question": "Q1?", "Level": 1, "Final answer": "42", "file_name": ""});
    let h = harness(FakeHub::new(vec![
        ("2023/test/metadata.jsonl", format!("{meta}\n").into_bytes()),
        ("2023/validation/metadata.jsonl", b"{\"task_id\":\"v1\"}\n".to_vec()),
    ]));

    let report = tokio_test::assert_ok!(h.pipeline.run().await);
    assert_eq!(report.stages.len(), Stage::ALL.len());
    assert_eq!(report.stage("opensource-extract").unwrap().processed, 0);
    assert_eq!(report.stage("cloud-extract").unwrap().processed, 0);
    assert_eq!(report.stage("cloud-upload").unwrap().processed, 0);
    assert_eq!(report.stage("load-cloud").unwrap().rows_loaded, None);
    assert_eq!(report.stage("load-metadata").unwrap().rows_loaded, Some(2));
    assert!(!h.dir.path().join("out").exists());
    assert_eq!(h.extractor.seq.load(Ordering::SeqCst), 0);

    let events = h.progress.events.lock().unwrap();
    assert!(!events.iter().any(|e| e.starts_with("error")));
    assert_eq!(events.last().map(String::as_str), Some("done ensure-users"));
}

#[tokio::test]
async fn skipped_images_leave_no_gap_in_names() {
    let h = harness(FakeHub::new(vec![]));
    h.store
        .put(
            "2023/test/mixed.pdf",
            fake_pdf(json!({"pages": [
                {"text": "one", "images": 1, "float_images": 1},
                {"text": "two", "images": 1}
            ]})),
            "application/pdf",
        )
        .await
        .unwrap();

    let report = h.pipeline.run_stage(Stage::OpenSourceExtract).await.unwrap();
    assert_eq!(report.processed, 1);
    assert!(matches!(
        &report.failed[..],
        [FileError::Extraction { name, .. }] if name.contains("mixed.pdf")
    ));

    let artifact: Value =
        serde_json::from_slice(&h.store.get("extracted_data/mixed/mixed.json").await.unwrap())
            .unwrap();
    let paths = artifact["image_paths"].as_array().unwrap();
    assert_eq!(artifact["image_count"], json!(paths.len()));
    assert_eq!(
        artifact["image_paths"],
        json!([
            "gs://bench/extracted_data/mixed/mixed_img1.png",
            "gs://bench/extracted_data/mixed/mixed_img2.png"
        ])
    );
    let second = h.store.get("extracted_data/mixed/mixed_img2.png").await.unwrap();
    assert_eq!(image::load_from_memory(&second).unwrap().width(), 20);
    assert!(h.store.get("extracted_data/mixed/mixed_img3.png").await.is_err());
}

// ── Failure isolation ────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_hub_token_halts_before_any_other_stage() {
    let h = harness_with(benchmark_hub(), FakeExtractor::default(), None, 5);
    let err = h.pipeline.run().await.unwrap_err();

    match &err {
        PipelineError::StageFailed { stage, source } => {
            assert_eq!(stage, "stage-dataset");
            assert!(matches!(**source, PipelineError::MissingConfig { ref key } if key == "HUGGINGFACE_TOKEN"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.store.list("").await.unwrap().is_empty());

    let events = h.progress.events.lock().unwrap().clone();
    assert_eq!(events, ["start stage-dataset", "error stage-dataset"]);
}

#[tokio::test]
async fn cloud_timeout_skips_file_and_batch_continues() {
    let h = harness_with(
        FakeHub::new(vec![]),
        FakeExtractor::default(),
        Some("hf_test"),
        1,
    );
    h.store
        .put(
            "2023/test/slow.pdf",
            fake_pdf(json!({"cloud": "hang", "pages": [{"text": "slow", "images": 0}]})),
            "application/pdf",
        )
        .await
        .unwrap();
    h.store
        .put(
            "2023/test/fast.pdf",
            fake_pdf(json!({"pages": [{"text": "fast", "images": 0}]})),
            "application/pdf",
        )
        .await
        .unwrap();

    let report = h.pipeline.run_stage(Stage::CloudExtract).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed.len(), 1);
    match &report.failed[0] {
        FileError::Service { name, kind, .. } => {
            assert_eq!(name, "2023/test/slow.pdf");
            assert_eq!(kind, "timed-out");
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    assert!(h.extractor.polls.load(Ordering::SeqCst) > 1);
    assert!(h.dir.path().join("out/extract_fast.zip").is_file());
    assert!(!h.dir.path().join("out/extract_slow.zip").exists());
}

#[tokio::test]
async fn failed_cloud_job_is_per_file() {
    let h = harness(FakeHub::new(vec![]));
    h.store
        .put(
            "a.pdf",
            fake_pdf(json!({"cloud": "fail", "pages": []})),
            "application/pdf",
        )
        .await
        .unwrap();

    let report = h.pipeline.run_stage(Stage::CloudExtract).await.unwrap();
    assert_eq!(report.processed, 0);
    assert!(matches!(
        &report.failed[..],
        [FileError::Service { kind, .. }] if kind == "job-failed"
    ));
}

#[tokio::test]
async fn unchecked_pdfs_never_reach_the_cloud_service() {
    let h = harness(FakeHub::new(vec![]));
    let good = fake_pdf(json!({"pages": [{"text": "good", "images": 0}]}));
    let garbage = b"%PDF-1.4 truncated garbage".to_vec();
    h.store
        .put("2023/test/garbage.pdf", garbage.clone(), "application/pdf")
        .await
        .unwrap();
    h.store
        .put("2023/test/good.pdf", good.clone(), "application/pdf")
        .await
        .unwrap();

    // Without a PDF engine validation stops and leaves nothing staged.
    h.pdf.unbound.store(true, Ordering::SeqCst);
    let err = h.pipeline.run_stage(Stage::OpenSourceExtract).await.unwrap_err();
    match &err {
        PipelineError::StageFailed { stage, source } => {
            assert_eq!(stage, "opensource-extract");
            assert!(matches!(**source, PipelineError::PdfiumBindingFailed(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let staged_dir = h.dir.path().join("scratch/2023/test");
    assert!(!staged_dir.join("garbage.pdf").exists());
    assert!(!staged_dir.join("garbage.pdf.partial").exists());

    // Leftovers from an older run: an unchecked file and one whose object
    // is gone from the bucket.
    std::fs::create_dir_all(&staged_dir).unwrap();
    std::fs::write(staged_dir.join("garbage.pdf"), &garbage).unwrap();
    std::fs::write(staged_dir.join("good.pdf"), &good).unwrap();
    std::fs::write(staged_dir.join("orphan.pdf"), &good).unwrap();

    h.pdf.unbound.store(false, Ordering::SeqCst);
    let report = h.pipeline.run_stage(Stage::CloudExtract).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.skipped, 1);
    assert!(matches!(
        &report.failed[..],
        [FileError::InvalidPdf { name, .. }] if name == "2023/test/garbage.pdf"
    ));
    assert_eq!(h.extractor.seq.load(Ordering::SeqCst), 1);
    assert!(!staged_dir.join("garbage.pdf").exists());
    assert!(!staged_dir.join("orphan.pdf").exists());
    assert!(h.dir.path().join("out/extract_good.zip").is_file());
    assert!(!h.dir.path().join("out/extract_orphan.zip").exists());
}

#[tokio::test]
async fn cloud_authentication_failure_fails_the_stage() {
    let extractor = FakeExtractor {
        reject_auth: true,
        ..Default::default()
    };
    let h = harness_with(FakeHub::new(vec![]), extractor, Some("hf_test"), 5);
    h.store
        .put(
            "a.pdf",
            fake_pdf(json!({"pages": [{"text": "x", "images": 0}]})),
            "application/pdf",
        )
        .await
        .unwrap();

    let err = h.pipeline.run_stage(Stage::CloudExtract).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::StageFailed { ref stage, .. } if stage == "cloud-extract"
    ));
    assert_eq!(h.extractor.seq.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_metadata_emits_nothing_for_that_file() {
    let h = harness(FakeHub::new(vec![]));
    h.store
        .put(
            "2023/test/metadata.jsonl",
            b"{\"task_id\":\"t1\"}\n{broken\n".to_vec(),
            "application/x-ndjson",
        )
        .await
        .unwrap();
    h.store
        .put(
            "2023/validation/metadata.jsonl",
            b"{\"task_id\":\"v1\"}\n".to_vec(),
            "application/x-ndjson",
        )
        .await
        .unwrap();

    let report = h.pipeline.run_stage(Stage::NormalizeMetadata).await.unwrap();
    assert_eq!(report.processed, 1);
    assert!(matches!(
        &report.failed[..],
        [FileError::MalformedMetadata { line: 2, .. }]
    ));
    assert!(h.store.get("cleaned_data/metadata_test.csv").await.is_err());
    assert!(h
        .store
        .get("cleaned_data/metadata_validation.csv")
        .await
        .is_ok());
}

#[tokio::test]
async fn duplicate_task_ids_keep_the_last_record() {
    let h = harness(FakeHub::new(vec![]));
    h.store
        .put(
            "cleaned_data/metadata_test.csv",
            b"task_id,Question,file_name,dataset_source\nt1,old question,,metadata_test\n".to_vec(),
            "text/csv",
        )
        .await
        .unwrap();
    h.store
        .put(
            "cleaned_data/metadata_validation.csv",
            b"task_id,Question,file_name,dataset_source\nt1,new question,,metadata_validation\n"
                .to_vec(),
            "text/csv",
        )
        .await
        .unwrap();

    let report = h.pipeline.run_stage(Stage::LoadMetadata).await.unwrap();
    assert_eq!(report.rows_loaded, Some(1));
    assert_eq!(report.skipped, 1);

    let rows = table_rows(
        &h.warehouse,
        "SELECT question, dataset_source FROM \"combined_metadata\"",
    )
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["question"], "new question");
    assert_eq!(rows[0]["dataset_source"], "metadata_validation");
}

#[tokio::test]
async fn empty_record_set_is_a_no_op() {
    let h = harness(FakeHub::new(vec![]));
    let report = h.pipeline.run_stage(Stage::LoadCloud).await.unwrap();
    assert_eq!(report.rows_loaded, None);
    assert_eq!(report.processed, 0);
}

#[tokio::test]
async fn incomplete_artifacts_are_filtered_before_load() {
    let h = harness(FakeHub::new(vec![]));
    let artifacts = [
        ("good", json!({"pdf_filename": "good.pdf", "extracted_text_length": 4, "image_count": 0, "image_paths": [], "extracted_text": "good"})),
        ("noname", json!({"pdf_filename": "", "extracted_text_length": 4, "extracted_text": "text"})),
        ("notext", json!({"pdf_filename": "notext.pdf", "extracted_text_length": 0, "image_count": 1, "image_paths": []})),
        ("empty", json!({})),
    ];
    for (stem, doc) in artifacts {
        h.store
            .put(
                &format!("extracted_data/{stem}/{stem}.json"),
                doc.to_string().into_bytes(),
                "application/json",
            )
            .await
            .unwrap();
    }
    h.store
        .put(
            "extracted_data/broken/broken.json",
            b"{not json".to_vec(),
            "application/json",
        )
        .await
        .unwrap();

    let report = h.pipeline.run_stage(Stage::LoadOpenSource).await.unwrap();
    assert_eq!(report.rows_loaded, Some(1));
    assert_eq!(report.rejected, 2);
    assert_eq!(report.skipped, 1);
    assert!(matches!(&report.failed[..], [FileError::Decode { .. }]));
}
