pub mod archive;
pub mod client;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod factory;
pub mod file_data;
pub mod noop;
pub mod serializer;
pub mod status;
pub mod storage;
pub mod writer;

pub use archive::{ArchiveFormat, ExportArchiveBuilder, StagedSource};
pub use client::HttpCommandFeedClientProvider;
pub use config::{ExportWriterConfig, TransientFailureMode};
pub use dead_letter::{DeadLetterStore, DiskDeadLetterStore};
pub use error::{StorageFault, WriteError};
pub use factory::{
    CommandDataWriterFactory,
    CommandFeedClient,
    CommandFeedClientProvider,
    CommandStateTable,
    ExecutionContext,
    FactoryError,
};
pub use file_data::{FileDataManager, FileDetails};
pub use status::{AbandonReason, WriterKind, WriterStatus};
pub use storage::{BlobExportPipelineFactory, ExportPipeline, ExportPipelineFactory};
pub use writer::DataWriter;
