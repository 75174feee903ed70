pub mod db;
pub mod transfer;

pub use db::DbAdapter;
pub use transfer::HttpTransferAdapter;
