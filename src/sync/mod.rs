pub mod attrs;
pub mod decode;
pub mod encode;
pub mod protocol;
pub mod session;
pub mod transport;

pub use attrs::AttributeCache;
pub use protocol::{AttrDef, ServerMessage};
pub use session::{SessionState, SyncConfig, SyncEngine};
pub use transport::{Connector, TransportSink, TransportStream, WsConnector};
