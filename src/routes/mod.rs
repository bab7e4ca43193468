// Routes module
pub mod docker_registry_v2;
pub mod health;
