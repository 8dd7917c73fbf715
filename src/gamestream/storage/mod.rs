mod temporary_storage;

pub use temporary_storage::TemporaryStorage;
