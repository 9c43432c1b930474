use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref FRAMES_PROCESSED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("fw_frames_processed_total", "Total number of frames extracted and published"),
            &["stream_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACES_DETECTED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("fw_faces_detected_total", "Total number of faces detected"),
            &["stream_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACES_RECOGNIZED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("fw_faces_recognized_total", "Total number of faces matched in the library"),
            &["stream_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref INFERENCE_DURATION: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new("fw_inference_duration_seconds", "Duration of vision pipeline stages")
                .buckets(prometheus::exponential_buckets(0.005, 2.0, 10).expect("valid buckets")),
            &["stage"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref QUEUE_DEPTH: IntGauge = {
        let metric = IntGauge::new("fw_queue_depth", "Pending frame tasks in the work queue")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ACTIVE_STREAMS: IntGauge = {
        let metric = IntGauge::new("fw_active_streams", "Currently active extraction loops")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LIVE_SUBSCRIBERS: IntGauge = {
        let metric = IntGauge::new("fw_live_subscribers", "Connected live event subscribers")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
