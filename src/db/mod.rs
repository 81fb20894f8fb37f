pub mod conversation_repository;
pub mod settings_repository;
pub mod store;
