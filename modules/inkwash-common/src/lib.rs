pub mod config;
pub mod headers;

pub use config::{
    ChannelConfig, Config, ConfigError, GeminiConfig, HttpConfig, PathSettings, PipelineConfig,
    WeChatConfig,
};
pub use headers::load_default_headers;
