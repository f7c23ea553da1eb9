pub mod config;
pub mod crypto;
pub mod database;
pub mod logging;

pub use config::AppConfig;
pub use crypto::{CryptoError, DataCodec};
pub use database::cache_cards::CacheCard;
pub use database::cards::{Card, CardUpdate};
pub use database::error::{StoreError, StoreErrorKind, StoreResult};
pub use database::hydrator::MigrationStatsSnapshot;
pub use database::kyc::{Kyc, KycStatus};
pub use database::migrations::MigrationReport;
pub use database::notifications::Notification;
pub use database::store::Page;
pub use database::tokens::Token;
pub use database::transactions::EbsTransaction;
pub use database::users::{User, UserUpdate};
pub use database::{Dialect, Store};
