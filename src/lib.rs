// Configuration (TOML + env overrides)
pub mod config;

// Entity model and collection
pub mod entity;

// Observer-list broadcaster
pub mod event;

// Session ports, hub and wire protocol
pub mod session;

// Reference frames, geodesy and pose resolution
pub mod spatial;

// Subscription tracker and registry
pub mod subscription;
