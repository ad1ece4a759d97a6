//! The unified query layer: source resolution, safety validation, the
//! engine adapter, the dispatcher, and the closed error taxonomy.

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod output;
pub mod safety;
pub mod source;

pub use dispatcher::{CatalogSummary, Dispatcher, QueryMetadata, QueryOptions, QueryResponse};
pub use engine::{DataFusionEngine, Engine, EngineError, Feature, Frame};
pub use error::{classify, ErrorKind, QueryError};
pub use output::{Output, OutputFormat};
pub use source::DataSource;
