//! Environment configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use cbnet_config::{from_toml_serde, render_serde, Config, ConfigError};
use cbnet_logging::LogLevel;
use cbnet_types::descriptor::MAX_WORKERS;
use serde::{Deserialize, Serialize};

use crate::fabric::QpCaps;

/// Process-wide settings consumed by `Environment::init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Local IPv4 address used to pick the RDMA device.
    #[serde(default = "default_local_ip")]
    pub local_ip: String,

    /// Number of workers, each with its own PD and CQ.
    #[serde(default = "default_worker_num")]
    pub worker_num: usize,

    /// Completions the data-path poller drains per poll.
    #[serde(default = "default_max_msg_cnt_per_poll")]
    pub max_msg_cnt_per_poll: u32,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Default `connect` deadline in milliseconds.
    #[serde(default = "default_conn_timeout_ms")]
    pub conn_timeout_ms: u64,

    /// NUMA node for buffer placement; -1 means no preference.
    #[serde(default = "default_numa_node")]
    pub numa_node: i32,

    /// Entries in each worker's completion queue.
    #[serde(default = "default_cq_depth")]
    pub cq_depth: u32,

    /// Send and receive work-queue depth per QP.
    #[serde(default = "default_wq_depth")]
    pub wq_depth: u32,

    /// Scatter-gather entries per work request.
    #[serde(default = "default_wq_sge_depth")]
    pub wq_sge_depth: u32,

    /// Timeout for address and route resolution.
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,

    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,
}

fn default_local_ip() -> String {
    "127.0.0.1".into()
}
fn default_worker_num() -> usize {
    1
}
fn default_max_msg_cnt_per_poll() -> u32 {
    16
}
fn default_conn_timeout_ms() -> u64 {
    1000
}
fn default_numa_node() -> i32 {
    -1
}
fn default_cq_depth() -> u32 {
    1024
}
fn default_wq_depth() -> u32 {
    8
}
fn default_wq_sge_depth() -> u32 {
    2
}
fn default_resolve_timeout_ms() -> u64 {
    500
}
fn default_listen_backlog() -> u32 {
    10
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            local_ip: default_local_ip(),
            worker_num: default_worker_num(),
            max_msg_cnt_per_poll: default_max_msg_cnt_per_poll(),
            log_level: LogLevel::default(),
            conn_timeout_ms: default_conn_timeout_ms(),
            numa_node: default_numa_node(),
            cq_depth: default_cq_depth(),
            wq_depth: default_wq_depth(),
            wq_sge_depth: default_wq_sge_depth(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            listen_backlog: default_listen_backlog(),
        }
    }
}

impl EnvConfig {
    pub fn local_ipv4(&self) -> Result<Ipv4Addr, ConfigError> {
        self.local_ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid("local_ip", format!("{:?} is not IPv4", self.local_ip)))
    }

    /// RC queue-pair capabilities; send and receive queues are symmetric.
    pub fn qp_caps(&self) -> QpCaps {
        QpCaps {
            max_send_wr: self.wq_depth,
            max_recv_wr: self.wq_depth,
            max_send_sge: self.wq_sge_depth,
            max_recv_sge: self.wq_sge_depth,
        }
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_millis(self.conn_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

impl Config for EnvConfig {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
        from_toml_serde(value)
    }

    fn hot_update(&mut self, other: &Self) {
        self.log_level = other.log_level;
        self.conn_timeout_ms = other.conn_timeout_ms;
    }

    fn render(&self) -> String {
        render_serde(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.local_ipv4()?;
        if self.worker_num == 0 || self.worker_num > MAX_WORKERS {
            return Err(ConfigError::out_of_range(
                "worker_num",
                self.worker_num,
                Some(1),
                Some(MAX_WORKERS),
            ));
        }
        for (field, value) in [
            ("max_msg_cnt_per_poll", self.max_msg_cnt_per_poll),
            ("cq_depth", self.cq_depth),
            ("wq_depth", self.wq_depth),
            ("wq_sge_depth", self.wq_sge_depth),
            ("listen_backlog", self.listen_backlog),
        ] {
            if value == 0 {
                return Err(ConfigError::out_of_range(field, value, Some(1), None::<u32>));
            }
        }
        if self.conn_timeout_ms == 0 {
            return Err(ConfigError::out_of_range(
                "conn_timeout_ms",
                0,
                Some(1),
                None::<u64>,
            ));
        }
        Ok(())
    }
}
