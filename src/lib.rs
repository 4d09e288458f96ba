// Entity tree, attribute store and sensor events
pub mod state;

// Subscription registry / event bus
pub mod subscription;

// Scheduled pollers publishing sensor values
pub mod feed;

// Policies attached to entities
pub mod policy;

// Effector schemas and task execution
pub mod effector;

// Lifecycle states and health derivation
pub mod lifecycle;

// Entity behaviors and the type catalog
pub mod entity;

// Reverse-proxy controller and reconciliation
pub mod controller;

// Management context owning all of the above
pub mod management;

// Application registry
pub mod app;

// HTTP API
pub mod api;

// Configuration
pub mod config;
