//! Performance sample handling for soakwatch.
//!
//! Samples are staged per pass by [`collector`], merged into the
//! platform-partitioned [`cache`], rendered by [`report`] and optionally
//! shipped by [`export`]. [`pipeline`] strings the end-of-run steps together.

#![forbid(unsafe_code)]

pub mod cache;
pub mod collector;
pub mod export;
pub mod pipeline;
pub mod report;
pub mod sample;

pub use cache::{
    AggregatedView, CacheError, HistoricWindow, MergeReport, MetricAggregate, PerformanceCache,
    TimeWindowFilter, evaluate_window,
};
pub use collector::{
    Candidate, CollectError, CollectorConfig, SampleCollector, StagedSample, pass_dir_name,
    select_latest,
};
pub use export::{
    DirectoryIngestionClient, ExportBatch, ExportError, ExportMetadata, HttpIngestionClient,
    IngestionClient, RemoteExporter, SubmitReceipt, client_from_settings, decode_sample,
    encode_sample,
};
pub use pipeline::{ExportSummary, PerfPipeline, PipelineReport};
pub use report::{
    CommandReportRenderer, GeneratedReport, HistoricReports, HtmlReportRenderer, ReportError,
    ReportGenerator, ReportRenderer,
};
pub use sample::{
    CsvProfile, MetricSummary, PerformanceSample, SampleError, SampleIdentity, SampleMetadata,
    SampleSummary,
};
