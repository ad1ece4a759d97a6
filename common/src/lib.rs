pub mod config;
pub mod credentials;
pub mod export;
pub mod store;
pub mod tracing;

pub use config::{DataConfig, Window};
pub use credentials::{ClientProvider, Credentials, CredentialsError};
pub use datafusion::arrow;
pub use datafusion::parquet;
pub use export::{ContentFormat, ExportType, Granularity, Partition, PartitionValue};
pub use store::{Store, StoreError};

pub type BoxError = Box<dyn std::error::Error + Sync + Send + 'static>;
