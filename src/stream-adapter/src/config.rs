use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamAdapterConfig {
    /// Enable the byte-stream receive feature on the worker.
    #[serde(default = "default_enable_stream")]
    pub enable_stream: bool,
    /// Serialize entry points with a worker-scope lock. Single-threaded
    /// workers leave this off and the critical section compiles to a no-op.
    #[serde(default)]
    pub thread_safe: bool,
    /// Size of one pooled receive buffer. Fragments larger than this get a
    /// one-off allocation that is not recycled.
    #[serde(default = "default_desc_buffer_size")]
    pub desc_buffer_size: usize,
    /// Number of receive buffers allocated when the pool is created.
    #[serde(default = "default_desc_pool_bootstrap")]
    pub desc_pool_bootstrap: usize,
    /// Cap on concurrently outstanding receive requests.
    #[serde(default = "default_max_outstanding_requests")]
    pub max_outstanding_requests: usize,
}

fn default_enable_stream() -> bool {
    true
}

fn default_desc_buffer_size() -> usize {
    8192
}

fn default_desc_pool_bootstrap() -> usize {
    64
}

fn default_max_outstanding_requests() -> usize {
    1024
}

impl Default for StreamAdapterConfig {
    fn default() -> Self {
        StreamAdapterConfig {
            enable_stream: default_enable_stream(),
            thread_safe: false,
            desc_buffer_size: default_desc_buffer_size(),
            desc_pool_bootstrap: default_desc_pool_bootstrap(),
            max_outstanding_requests: default_max_outstanding_requests(),
        }
    }
}

impl StreamAdapterConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = toml::from_str(config.unwrap_or(""))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_takes_defaults() {
        let config = StreamAdapterConfig::new(None).unwrap();
        assert!(config.enable_stream);
        assert!(!config.thread_safe);
        assert_eq!(config.desc_buffer_size, 8192);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(StreamAdapterConfig::new(Some("no_such_knob = 1")).is_err());
    }
}
