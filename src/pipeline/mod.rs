pub mod staging;
pub mod worker;
pub mod protocol;
pub mod store;
pub mod orchestrator; // stage → worker → parse → persist → cleanup

#[cfg(test)]
pub(crate) mod test_support;

pub use orchestrator::{OpenError, PipelineError, PreviewError, PreviewErrorKind, PreviewPipeline};
pub use staging::ImageInput;
pub use store::{ConsumeError, PreviewStore, SqlitePreviewStore};
pub use worker::{ProcessWorker, RawOutput, RedactionWorker, WorkerError};
