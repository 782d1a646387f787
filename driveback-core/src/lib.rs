mod destination;
mod error;
mod local;
mod source;

pub use destination::{BucketUsage, DestinationConnector, RemoteEntry, RemoteProbe, UploadReceipt};
pub use error::{ConnectorError, ErrorClass};
pub use local::{LocalDirDestination, LocalTreeSource, ROOT_CONTAINER_ID};
pub use source::{ChildPage, ItemMetadata, SourceConnector};
