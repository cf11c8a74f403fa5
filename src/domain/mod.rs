pub mod ids;
pub mod merge;
pub mod transaction;
pub mod triple;

pub use ids::*;
pub use merge::*;
pub use transaction::*;
pub use triple::*;
