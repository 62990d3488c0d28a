pub mod character;
pub mod chat;
pub mod events;
pub mod settings;
pub mod store;
