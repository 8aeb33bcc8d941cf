use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use livedet::annotate::BOX_COLOR;
use livedet::detect::{StubBackend, StubResponse};
use livedet::predictions::read_records;
use livedet::{
    open_source, Annotator, BoundingBox, Detection, FramePipeline, InMemoryObjectStore,
    LabelTable, LivedetError, PipelineConfig, PipelineState, PredictionLog, PredictionLogConfig,
    PublishedFrame, StepOutcome, StreamBroadcaster, StreamConfig, UploadMode,
};

fn stream_config() -> StreamConfig {
    StreamConfig {
        addr: "127.0.0.1:0".to_string(),
        poll_interval: Duration::from_millis(5),
        ..StreamConfig::default()
    }
}

fn build(
    dir: &Path,
    source: &str,
    skip_frames: u64,
    script: Vec<StubResponse>,
    store: &InMemoryObjectStore,
) -> FramePipeline {
    let log = PredictionLog::open(
        PredictionLogConfig {
            path: dir.join("predictions.csv"),
            bucket: "detections".to_string(),
            key: "predictions.csv".to_string(),
            upload: UploadMode::PerRecord,
        },
        Box::new(store.clone()),
    )
    .expect("open prediction log");
    let frames = Arc::new(PublishedFrame::default());
    FramePipeline::new(
        PipelineConfig {
            skip_frames,
            ..PipelineConfig::default()
        },
        open_source(source).expect("open source"),
        Box::new(StubBackend::new().with_script(script)),
        Annotator::new(LabelTable::from_names(["person", "car"]), None),
        log,
        StreamBroadcaster::new(stream_config(), frames),
    )
    .expect("build pipeline")
}

fn detection(x1: f64, y1: f64, x2: f64, y2: f64, class_id: usize, confidence: f64) -> Detection {
    Detection::new(BoundingBox::new(x1, y1, x2, y2), class_id, confidence)
}

#[test]
fn samples_every_kth_frame_until_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryObjectStore::new();
    let mut pipeline = build(
        dir.path(),
        "stub://cam?frames=23&width=64&height=32",
        5,
        Vec::new(),
        &store,
    );
    assert_eq!(pipeline.state(), PipelineState::Idle);

    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
    let addr = pipeline.stream_addr().expect("listener bound");

    let report = pipeline.run().unwrap();
    assert_eq!(report.frames_sampled, 5);
    assert_eq!(report.records_appended, 0);
    assert_eq!(report.final_state, PipelineState::Stopped);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.frames().generation(), 5);

    let last = pipeline.frames().latest().unwrap();
    assert_eq!(last.frame.index, 20);
    assert_eq!((last.frame.width(), last.frame.height()), (64, 32));

    assert!(pipeline.stream_addr().is_none());
    assert!(TcpStream::connect(addr).is_err(), "listener still open");
}

#[test]
fn step_reports_each_sampled_frame() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryObjectStore::new();
    let mut pipeline = build(
        dir.path(),
        "stub://cam?frames=3&width=16&height=8",
        2,
        Vec::new(),
        &store,
    );

    assert!(pipeline.step().is_err(), "step before start");
    pipeline.start().unwrap();
    assert!(matches!(
        pipeline.step().unwrap(),
        StepOutcome::Processed { index: 0, .. }
    ));
    assert!(matches!(
        pipeline.step().unwrap(),
        StepOutcome::Processed { index: 2, .. }
    ));
    assert_eq!(pipeline.step().unwrap(), StepOutcome::Exhausted);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn overlapping_detections_are_suppressed_before_recording() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryObjectStore::new();
    let script = vec![
        StubResponse::Detections(vec![
            detection(5.0, 2.0, 10.0, 8.0, 1, 0.6),
            detection(5.0, 2.0, 10.0, 8.0, 1, 0.9),
            detection(15.0, 2.0, 20.0, 8.0, 0, 0.7),
        ]),
        StubResponse::Detections(Vec::new()),
    ];
    let mut pipeline = build(
        dir.path(),
        "stub://cam?frames=10&width=832&height=416",
        5,
        script,
        &store,
    );

    pipeline.start().unwrap();
    assert!(matches!(
        pipeline.step().unwrap(),
        StepOutcome::Processed {
            index: 0,
            detections: 2,
            records: 2
        }
    ));
    // Grid (5,2)-(10,8) on a 26x13 grid is (160,64)-(320,256) on 832x416.
    let published = pipeline.frames().latest().expect("annotated frame published");
    let image = &published.frame.image;
    for (x, y) in [(160, 64), (320, 256), (240, 64), (160, 160), (320, 160)] {
        assert_eq!(image.get_pixel(x, y), &BOX_COLOR, "box edge at ({x}, {y})");
    }
    assert_ne!(image.get_pixel(240, 160), &BOX_COLOR);
    // The second retained box, grid (15,2)-(20,8).
    assert_eq!(image.get_pixel(480, 64), &BOX_COLOR);
    assert_eq!(image.get_pixel(640, 256), &BOX_COLOR);

    let report = pipeline.run().unwrap();
    assert_eq!(report.frames_sampled, 2);
    assert_eq!(report.detections_retained, 2);
    assert_eq!(report.records_appended, 2);
    assert_eq!(report.upload_failures, 0);

    let records = read_records(&dir.path().join("predictions.csv")).unwrap();
    let summary: Vec<(String, u32)> = records
        .into_iter()
        .map(|r| (r.label, r.confidence_percent))
        .collect();
    assert_eq!(
        summary,
        vec![("car".to_string(), 90), ("person".to_string(), 70)]
    );

    let remote = store.get("detections", "predictions.csv").expect("uploaded");
    assert_eq!(remote.iter().filter(|b| **b == b'\n').count(), 2);
    assert_eq!(pipeline.frames().generation(), 2);
}

#[test]
fn detector_failure_stops_pipeline_and_listener() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryObjectStore::new();
    let script = vec![
        StubResponse::Detections(Vec::new()),
        StubResponse::Fail("model crashed".to_string()),
    ];
    let mut pipeline = build(
        dir.path(),
        "stub://cam?frames=50&width=64&height=32",
        5,
        script,
        &store,
    );
    pipeline.start().unwrap();
    let addr = pipeline.stream_addr().unwrap();

    let err = pipeline.run().expect_err("detector failure is fatal");
    match err.downcast_ref::<LivedetError>() {
        Some(LivedetError::DetectorFailure { frame_index, .. }) => assert_eq!(*frame_index, 5),
        other => panic!("unexpected error: {:?}", other),
    }
    let message = format!("{:#}", err);
    assert!(message.contains("detector failed on frame 5"), "{message}");
    assert!(message.contains("model crashed"), "{message}");
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(pipeline.report().frames_sampled, 1);
    assert!(TcpStream::connect(addr).is_err(), "listener still open");

    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn source_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let frames_dir = dir.path().join("frames");
    std::fs::create_dir(&frames_dir).unwrap();
    std::fs::write(frames_dir.join("0001.jpg"), b"not a jpeg").unwrap();

    let store = InMemoryObjectStore::new();
    let mut pipeline = build(
        dir.path(),
        frames_dir.to_str().unwrap(),
        1,
        Vec::new(),
        &store,
    );
    let err = pipeline.run().expect_err("undecodable frame is fatal");
    assert!(matches!(
        err.downcast_ref::<LivedetError>(),
        Some(LivedetError::SourceFailure { frame_index: 0, .. })
    ));
    let message = format!("{:#}", err);
    assert!(message.contains("frame source failed at frame 0"), "{message}");
    assert!(message.contains("0001.jpg"), "{message}");
    assert_eq!(pipeline.state(), PipelineState::Failed);
}

#[test]
fn upload_failures_do_not_stop_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryObjectStore::new();
    store.set_fail_puts(true);
    let script = vec![StubResponse::Detections(vec![detection(
        1.0, 1.0, 4.0, 4.0, 0, 0.8,
    )])];
    let mut pipeline = build(
        dir.path(),
        "stub://cam?frames=6&width=64&height=32",
        5,
        script,
        &store,
    );

    let report = pipeline.run().unwrap();
    assert_eq!(report.frames_sampled, 2);
    assert_eq!(report.records_appended, 1);
    assert_eq!(report.upload_failures, 1);
    assert!(store.get("detections", "predictions.csv").is_none());
    assert_eq!(
        read_records(&dir.path().join("predictions.csv")).unwrap().len(),
        1
    );
}

#[test]
fn zero_skip_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryObjectStore::new();
    let log = PredictionLog::open(
        PredictionLogConfig {
            path: dir.path().join("p.csv"),
            bucket: "b".to_string(),
            key: "k".to_string(),
            upload: UploadMode::PerRecord,
        },
        Box::new(store),
    )
    .unwrap();
    let result = FramePipeline::new(
        PipelineConfig {
            skip_frames: 0,
            ..PipelineConfig::default()
        },
        open_source("stub://cam").unwrap(),
        Box::new(StubBackend::new()),
        Annotator::new(LabelTable::default(), None),
        log,
        StreamBroadcaster::new(stream_config(), Arc::new(PublishedFrame::default())),
    );
    let err = result.err().expect("K = 0 must be rejected");
    assert!(matches!(
        err.downcast_ref::<LivedetError>(),
        Some(LivedetError::Config(_))
    ));
}
