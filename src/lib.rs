// Форматы и константы
pub mod consts;
pub mod error;
pub mod codec;  // zstd / zlib чанки
pub mod cmap;   // pg_compression
pub mod cfm;    // <relation>.cfm

// Отслеживание изменений (bitmap / scan)
pub mod tracking; // src/tracking/{mod,bitmap,scan}.rs

// Источник и транспорт
pub mod instance; // src/instance/{mod,local}.rs
pub mod transfer;

// Детектор, каталог, валидатор, оркестратор
pub mod detect;
pub mod catalog;  // src/catalog/{mod,content}.rs
pub mod validate;
pub mod backup;   // src/backup/{mod,copy}.rs

// Общее
pub mod config;
pub mod metrics;
pub mod lock;
pub mod util;

// Удобные реэкспорты
pub use backup::{run_backup, BackupRequest, CancelToken, Orchestrator};
pub use catalog::{BackupCatalog, BackupRecord, BackupStatus, BackupType, CatalogLease};
pub use codec::Algorithm;
pub use config::BackupConfig;
pub use error::{classify, BackupError};
pub use instance::{LocalInstance, SourceConnection, SourceInstance, TablespaceInfo};
pub use tracking::ChangeTracking;
pub use transfer::TransferMode;
pub use validate::{validate_backup, validate_instance, InstanceValidation, ValidationReport};
