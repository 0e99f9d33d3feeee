pub mod connection;
pub mod migration_output;
pub mod migrations;
