pub mod capability_router;
pub mod client_service;
pub mod config_store;
pub mod credential_gate;
pub mod model_service;
pub mod openai_adapter;
pub mod provider_adapter;
pub mod quota_limiter;
pub mod rate_limiter;
pub mod store;
pub mod usage_recorder;
pub mod usage_service;

#[cfg(test)]
pub mod memory_store;
