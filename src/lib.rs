// AES-256-GCM key handling and sealing
pub mod cipher;

// Field-level encrypted credentials
pub mod credentials;

// Notion OAuth with PKCE
pub mod oauth;

// Session registry and key rotation
pub mod session;

// Configuration (TOML + env)
pub mod config;

// HTTP API
pub mod api;
