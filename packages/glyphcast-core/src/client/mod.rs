//! Client records and the global registry.

pub mod record;
pub mod registry;

pub use record::{
    Attachment, ClientId, ClientInfo, ClientProfile, ClientRecord, RenderSnapshot,
};
pub use registry::ClientRegistry;
