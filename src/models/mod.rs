pub mod identifier;
pub mod integrity;
pub mod ledger;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod roots;
pub mod scanner;
pub mod validator;

pub use identifier::normalize;
pub use manager::{DeleteReport, ManagerEvent, ModelLifecycleManager, ModelState};
pub use provider::{HubProvider, ModelProvider};
pub use registry::{CatalogSort, DeviceProfile, HardwareTier, ModelCatalogEntry};
pub use roots::{StorageRoot, StorageRootResolver};
pub use scanner::{ArtifactScanner, DownloadedArtifactIndex, IndexedArtifact};
