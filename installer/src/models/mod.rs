pub mod application;
pub mod bindings;
pub mod environment;
pub mod fields;
pub mod responses;
pub mod settings;
pub mod state;
