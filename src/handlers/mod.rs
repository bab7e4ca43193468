// Handlers module
pub mod docker_registry_v2;
pub mod errors;
pub mod health;
