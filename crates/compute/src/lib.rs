pub mod pipeline;
pub mod scheduler;
pub mod service;

pub use pipeline::{
    AnomalyDetector, AnomalyFlag, ForecastPoint, Forecaster, Severity, TimeBucket,
};
pub use scheduler::{
    CollectionError, CollectionJob, Collector, HealthReport, JobHandler, JobStatus, Scheduler,
    SchedulerConfig, SchedulerMetrics,
};
pub use service::{AnomalyReport, AnomalySummary, CityForecast, PulseService, PulseSnapshot};
