pub mod capability;
pub mod client;
pub mod model_config;
pub mod provider;
pub mod usage_record;
