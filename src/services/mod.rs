pub mod api_client;
pub mod directory_resolver;
pub mod download_orchestrator;
pub mod drive_space;
pub mod events;
pub mod game_runtime_service;
pub mod game_store;
pub mod helper_process;
pub mod process_table;
pub mod settings_store;
pub mod timestamp_store;
pub mod verification;

pub use directory_resolver::normalize_game_name;
pub use download_orchestrator::{DownloadOrchestrator, DownloadRequest, OrchestratorConfig, RetryRequest};
pub use drive_space::{DriveSpaceCache, InstalledSizeCache, SysinfoDiskStats};
pub use events::{AppEvent, EventEmitter};
pub use game_runtime_service::GameRuntime;
pub use game_store::{CustomGameListing, GameStore};
pub use helper_process::HelperLocator;
pub use process_table::ProcessTable;
pub use settings_store::{Settings, SettingsStore};
pub use timestamp_store::TimestampStore;
pub use verification::VerificationEngine;
