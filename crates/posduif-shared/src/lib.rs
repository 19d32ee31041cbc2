pub mod enrollment;
pub mod lsn;
pub mod message;
pub mod sync;
pub mod user;
pub mod wire;

pub use enrollment::EnrollmentToken;
pub use lsn::{Lsn, LsnParseError};
pub use message::{Message, MessageStatus};
pub use sync::{SyncMetadata, SyncState};
pub use user::{User, UserType};
