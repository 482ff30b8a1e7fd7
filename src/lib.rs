// Process configuration
pub mod config;

// Encrypted OAuth credential storage
pub mod credentials;

// Opaque bearer sessions
pub mod session;

// Provider OAuth and analytics clients
pub mod provider;

// Sync orchestration, logs and snapshots
pub mod sync;

// HTTP API
pub mod api;
