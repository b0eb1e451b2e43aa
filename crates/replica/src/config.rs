use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Replica configuration, loaded from YAML.
///
/// Durations accept humantime strings (`"10ms"`, `"1s 500ms"`).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReplicaConfig {
    /// Index of this replica within `replica_ips`, in `[0, N)`.
    pub replica_id: u32,
    /// Addresses of every replica of the set, in replica-id order.
    pub replica_ips: Vec<String>,
    /// Size of the commutativity key space; `opKey` must stay below it.
    pub key_num: u32,

    /// Samples per proxy in the one-way-delay sliding window.
    #[serde(default = "defaults::sliding_window_len")]
    pub sliding_window_len: usize,
    /// Max index records per IndexSync broadcast.
    #[serde(default = "defaults::index_transfer_batch")]
    pub index_transfer_batch: u32,
    /// Max request keys per AskMissedReq message.
    #[serde(default = "defaults::request_key_transfer_batch")]
    pub request_key_transfer_batch: u32,
    /// Max request bodies per state-transfer or missed-req reply.
    #[serde(default = "defaults::request_transfer_batch")]
    pub request_transfer_batch: u32,

    /// Cadence of the garbage-collection pass.
    #[serde(with = "humantime_serde", default = "defaults::reclaim_timeout")]
    pub reclaim_timeout: Duration,
    /// Retry interval for unanswered state-transfer requests; ten of these
    /// bound the whole transfer before it aborts and re-targets.
    #[serde(with = "humantime_serde", default = "defaults::state_transfer_timeout")]
    pub state_transfer_timeout: Duration,
    /// Silence from the leader a follower tolerates before it initiates a
    /// view change.
    #[serde(with = "humantime_serde", default = "defaults::heartbeat_timeout")]
    pub heartbeat_timeout: Duration,
    /// Cadence of follower sync-status reports and leader commits.
    #[serde(with = "humantime_serde", default = "defaults::periodic_sync_interval")]
    pub periodic_sync_interval: Duration,
    /// Slack subtracted from the local clock to form the release horizon.
    /// The deadline-order guarantee assumes client-to-replica one-way delay
    /// plus clock skew stays under this bound; requests that violate it are
    /// routed through the late buffer instead of breaking the order.
    #[serde(with = "humantime_serde", default = "defaults::owd_headroom")]
    pub owd_headroom: Duration,

    /// Reply queue shards; also the number of fast-reply worker threads.
    #[serde(default = "defaults::reply_shards")]
    pub reply_shards: usize,
}

mod defaults {
    use std::time::Duration;

    pub fn sliding_window_len() -> usize {
        100
    }
    pub fn index_transfer_batch() -> u32 {
        25
    }
    pub fn request_key_transfer_batch() -> u32 {
        25
    }
    pub fn request_transfer_batch() -> u32 {
        25
    }
    pub fn reclaim_timeout() -> Duration {
        Duration::from_millis(100)
    }
    pub fn state_transfer_timeout() -> Duration {
        Duration::from_millis(500)
    }
    pub fn heartbeat_timeout() -> Duration {
        Duration::from_millis(100)
    }
    pub fn periodic_sync_interval() -> Duration {
        Duration::from_millis(10)
    }
    pub fn owd_headroom() -> Duration {
        Duration::from_millis(50)
    }
    pub fn reply_shards() -> usize {
        2
    }
}

impl ReplicaConfig {
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| crate::Error::ConfigIo {
            path: path.to_owned(),
            err,
        })?;
        let config: ReplicaConfig =
            serde_yaml::from_str(&raw).map_err(|err| crate::Error::ConfigParse {
                path: path.to_owned(),
                err,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Startup self-check. A replica with a nonsensical configuration must
    /// fail loudly rather than join the peer set.
    pub fn validate(&self) -> crate::Result<()> {
        if self.replica_ips.is_empty() {
            return Err(crate::Error::Config("replicaIps must not be empty"));
        }
        if self.replica_id as usize >= self.replica_ips.len() {
            return Err(crate::Error::Config(
                "replicaId must index into replicaIps",
            ));
        }
        if self.key_num == 0 {
            return Err(crate::Error::Config("keyNum must be positive"));
        }
        if self.index_transfer_batch == 0
            || self.request_key_transfer_batch == 0
            || self.request_transfer_batch == 0
        {
            return Err(crate::Error::Config("transfer batches must be positive"));
        }
        if self.sliding_window_len == 0 {
            return Err(crate::Error::Config("slidingWindowLen must be positive"));
        }
        if self.reply_shards == 0 {
            return Err(crate::Error::Config("replyShards must be positive"));
        }
        Ok(())
    }

    pub fn replica_num(&self) -> usize {
        self.replica_ips.len()
    }
}
