use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::message::HEADER_SIZE;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address (server) or peer address (client).
    pub ip: String,
    /// Listen or peer port. Port 0 lets the OS pick one on the server side.
    pub port: u16,
    pub max_sessions: usize,
    /// true disables Nagle's algorithm on every accepted or connected socket.
    pub tcp_nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 0,
            max_sessions: 1024,
            tcp_nodelay: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// Completion worker task count; 0 means one per CPU core.
    pub worker_tasks: usize,
    pub completion_queue_capacity: usize,
    /// Scan interval of the send scheduler.
    pub send_flush_interval_ms: u64,
    /// Most messages gathered into a single batched send.
    pub send_batch_max: usize,
    /// Queued-message bound above which a session counts as a slow consumer
    /// and is dropped.
    pub send_backlog_limit: usize,
    /// How long shutdown waits for active sessions to drain.
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_tasks: 4,
            completion_queue_capacity: 1024,
            send_flush_interval_ms: 2,
            send_batch_max: 128,
            send_backlog_limit: 1024,
            shutdown_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BufferConfig {
    /// Per-session receive ring capacity; also bounds the largest acceptable
    /// frame.
    pub ring_capacity: usize,
    pub message_pool_capacity: usize,
    /// Objects added to a thread-local free list per growth step.
    pub local_pool_chunk: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            ring_capacity: 64 * 1024,
            message_pool_capacity: 512,
            local_pool_chunk: 64,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub workers: WorkerConfig,
    pub buffers: BufferConfig,
}

impl EngineConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<EngineConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;

        Ok(engine_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_sessions == 0 {
            return Err(AppError::InvalidValue(
                "network.max_sessions must be at least 1".into(),
            ));
        }
        if self.buffers.ring_capacity <= HEADER_SIZE {
            return Err(AppError::InvalidValue(format!(
                "buffers.ring_capacity must exceed the {HEADER_SIZE}-byte frame header"
            )));
        }
        if self.workers.send_batch_max == 0 {
            return Err(AppError::InvalidValue(
                "workers.send_batch_max must be at least 1".into(),
            ));
        }
        if self.workers.completion_queue_capacity == 0 {
            return Err(AppError::InvalidValue(
                "workers.completion_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Worker count with the 0 = "one per core" convention applied.
    pub fn resolved_worker_tasks(&self) -> usize {
        if self.workers.worker_tasks == 0 {
            num_cpus::get()
        } else {
            self.workers.worker_tasks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.resolved_worker_tasks() > 0);
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        let mut config = EngineConfig::default();
        config.buffers.ring_capacity = HEADER_SIZE;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.network.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.workers.send_batch_max = 0;
        assert!(config.validate().is_err());
    }
}
