pub mod app;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod model_registry;
pub mod normalize;
pub mod oauth;
pub mod ollama;
pub mod reasoning;
pub mod session;
pub mod settings;
pub mod token;
pub mod translate;
pub mod upstream;
