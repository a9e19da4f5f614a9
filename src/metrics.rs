//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "stegodon_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Database Metrics
    pub static ref DB_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_db_queries_total", "Total number of database queries"),
        &["operation", "table"]
    ).expect("metric can be created");
    pub static ref DB_QUERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "stegodon_db_query_duration_seconds",
            "Database query duration in seconds"
        ).buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        &["operation", "table"]
    ).expect("metric can be created");
    pub static ref DB_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "stegodon_db_connections_active",
        "Current number of active database connections"
    ).expect("metric can be created");

    // Federation inbound/outbound metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_activitypub_activities_received_total", "Total number of ActivityPub activities received, by type and outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_activitypub_activities_sent_total", "Total number of ActivityPub activities enqueued for delivery"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "stegodon_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Signature verification outcomes (C1)
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_signature_verifications_total", "HTTP signature verification outcomes"),
        &["outcome"]
    ).expect("metric can be created");

    // Delivery queue (C6)
    pub static ref DELIVERY_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "stegodon_delivery_queue_depth",
        "Number of delivery tasks currently queued"
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_delivery_attempts_total", "Delivery attempt outcomes"),
        &["outcome"]
    ).expect("metric can be created");

    // Relay subsystem (C8)
    pub static ref RELAY_SUBSCRIPTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("stegodon_relay_subscriptions", "Relay subscriptions by state"),
        &["state"]
    ).expect("metric can be created");

    // Cache metrics (actor/key resolver TTL cache)
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("stegodon_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Application metrics
    pub static ref USERS_TOTAL: IntGauge = IntGauge::new(
        "stegodon_users_total",
        "Total number of registered local accounts"
    ).expect("metric can be created");
    pub static ref POSTS_TOTAL: IntGauge = IntGauge::new(
        "stegodon_posts_total",
        "Total number of local notes"
    ).expect("metric can be created");

    // Error metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("stegodon_errors_total", "Total number of errors, by kind"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone())).expect("register HTTP_REQUESTS_TOTAL");
    REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone())).expect("register HTTP_REQUEST_DURATION_SECONDS");
    REGISTRY.register(Box::new(DB_QUERIES_TOTAL.clone())).expect("register DB_QUERIES_TOTAL");
    REGISTRY.register(Box::new(DB_QUERY_DURATION_SECONDS.clone())).expect("register DB_QUERY_DURATION_SECONDS");
    REGISTRY.register(Box::new(DB_CONNECTIONS_ACTIVE.clone())).expect("register DB_CONNECTIONS_ACTIVE");
    REGISTRY.register(Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone())).expect("register ACTIVITYPUB_ACTIVITIES_RECEIVED");
    REGISTRY.register(Box::new(ACTIVITYPUB_ACTIVITIES_SENT.clone())).expect("register ACTIVITYPUB_ACTIVITIES_SENT");
    REGISTRY.register(Box::new(FEDERATION_REQUESTS_TOTAL.clone())).expect("register FEDERATION_REQUESTS_TOTAL");
    REGISTRY.register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone())).expect("register FEDERATION_REQUEST_DURATION_SECONDS");
    REGISTRY.register(Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone())).expect("register SIGNATURE_VERIFICATIONS_TOTAL");
    REGISTRY.register(Box::new(DELIVERY_QUEUE_DEPTH.clone())).expect("register DELIVERY_QUEUE_DEPTH");
    REGISTRY.register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone())).expect("register DELIVERY_ATTEMPTS_TOTAL");
    REGISTRY.register(Box::new(RELAY_SUBSCRIPTIONS.clone())).expect("register RELAY_SUBSCRIPTIONS");
    REGISTRY.register(Box::new(CACHE_HITS_TOTAL.clone())).expect("register CACHE_HITS_TOTAL");
    REGISTRY.register(Box::new(CACHE_MISSES_TOTAL.clone())).expect("register CACHE_MISSES_TOTAL");
    REGISTRY.register(Box::new(CACHE_SIZE.clone())).expect("register CACHE_SIZE");
    REGISTRY.register(Box::new(USERS_TOTAL.clone())).expect("register USERS_TOTAL");
    REGISTRY.register(Box::new(POSTS_TOTAL.clone())).expect("register POSTS_TOTAL");
    REGISTRY.register(Box::new(ERRORS_TOTAL.clone())).expect("register ERRORS_TOTAL");

    tracing::info!("metrics registry initialized");
}
