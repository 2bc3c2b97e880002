use serde::Deserialize;

/// Top-level configuration settings for a routemesh node.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub router: RouterSettings,
    pub dispatcher: DispatcherSettings,
    pub directory: DirectorySettings,
    pub maintenance: MaintenanceSettings,
    pub backpressure: BackpressureSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

/// Where the channel transport listens and which channel id it answers to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub channel_id: String,
}

/// Delivery scheduling and retry policy of the message router.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouterSettings {
    /// Base delay of the exponential backoff.
    pub retry_interval_ms: u64,
    /// Upper bound of a single retry delay.
    pub max_delay_ms: u64,
    /// Random jitter added to each delay as a fraction of the un-jittered
    /// delay, clamped to `[0, 1]`. Zero disables jitter.
    pub jitter_ratio: f64,
    /// Negative means unlimited; retries are then bounded by the TTL only.
    pub max_retry_count: i64,
    /// Number of workers pulling from the delay queue.
    pub max_parallel_sends: usize,
    /// Queue identifier handed to the durability hook.
    pub queue_id: String,
}

impl RouterSettings {
    pub fn max_retries(&self) -> Option<u32> {
        u32::try_from(self.max_retry_count).ok()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DispatcherSettings {
    /// Maximum number of request handlers running at once.
    pub handler_pool_size: usize,
}

/// What happens when a second provider registers the same domain/interface.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The newest registration replaces providers of the same domain/interface.
    #[default]
    LastWriteWins,
    /// Providers of the same domain/interface coexist.
    KeepAll,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DirectorySettings {
    pub conflict_policy: ConflictPolicy,
}

/// The coalesced background tick sweeping expired replies, discovery entries
/// and routing entries.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MaintenanceSettings {
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackpressureSettings {
    pub enabled: bool,
    /// Zero means no limit.
    pub max_incoming_requests: usize,
    /// Admission resumes once in-flight requests drop to this level.
    pub lower_threshold: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub router: Option<PartialRouterSettings>,
    pub dispatcher: Option<PartialDispatcherSettings>,
    pub directory: Option<PartialDirectorySettings>,
    pub maintenance: Option<PartialMaintenanceSettings>,
    pub backpressure: Option<PartialBackpressureSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub channel_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRouterSettings {
    pub retry_interval_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter_ratio: Option<f64>,
    pub max_retry_count: Option<i64>,
    pub max_parallel_sends: Option<usize>,
    pub queue_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDispatcherSettings {
    pub handler_pool_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDirectorySettings {
    pub conflict_policy: Option<ConflictPolicy>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialMaintenanceSettings {
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBackpressureSettings {
    pub enabled: Option<bool>,
    pub max_incoming_requests: Option<usize>,
    pub lower_threshold: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPersistenceSettings {
    pub enabled: Option<bool>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let router = self.router.unwrap_or_default();
        let dispatcher = self.dispatcher.unwrap_or_default();
        let directory = self.directory.unwrap_or_default();
        let maintenance = self.maintenance.unwrap_or_default();
        let backpressure = self.backpressure.unwrap_or_default();
        let persistence = self.persistence.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                channel_id: server.channel_id.unwrap_or(default.server.channel_id),
            },
            router: RouterSettings {
                retry_interval_ms: router
                    .retry_interval_ms
                    .unwrap_or(default.router.retry_interval_ms),
                max_delay_ms: router.max_delay_ms.unwrap_or(default.router.max_delay_ms),
                jitter_ratio: router.jitter_ratio.unwrap_or(default.router.jitter_ratio),
                max_retry_count: router
                    .max_retry_count
                    .unwrap_or(default.router.max_retry_count),
                max_parallel_sends: router
                    .max_parallel_sends
                    .unwrap_or(default.router.max_parallel_sends),
                queue_id: router.queue_id.unwrap_or(default.router.queue_id),
            },
            dispatcher: DispatcherSettings {
                handler_pool_size: dispatcher
                    .handler_pool_size
                    .unwrap_or(default.dispatcher.handler_pool_size),
            },
            directory: DirectorySettings {
                conflict_policy: directory
                    .conflict_policy
                    .unwrap_or(default.directory.conflict_policy),
            },
            maintenance: MaintenanceSettings {
                interval_ms: maintenance
                    .interval_ms
                    .unwrap_or(default.maintenance.interval_ms),
            },
            backpressure: BackpressureSettings {
                enabled: backpressure.enabled.unwrap_or(default.backpressure.enabled),
                max_incoming_requests: backpressure
                    .max_incoming_requests
                    .unwrap_or(default.backpressure.max_incoming_requests),
                lower_threshold: backpressure
                    .lower_threshold
                    .unwrap_or(default.backpressure.lower_threshold),
            },
            persistence: PersistenceSettings {
                enabled: persistence.enabled.unwrap_or(default.persistence.enabled),
                path: persistence.path.unwrap_or(default.persistence.path),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures a node has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                channel_id: "routemesh".to_string(),
            },
            router: RouterSettings::default(),
            dispatcher: DispatcherSettings {
                handler_pool_size: 16,
            },
            directory: DirectorySettings {
                conflict_policy: ConflictPolicy::LastWriteWins,
            },
            maintenance: MaintenanceSettings { interval_ms: 1000 },
            backpressure: BackpressureSettings::default(),
            persistence: PersistenceSettings {
                enabled: false,
                path: "routemesh_db".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 3000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.5,
            max_retry_count: -1,
            max_parallel_sends: 4,
            queue_id: "routemesh-router".to_string(),
        }
    }
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_incoming_requests: 20,
            lower_threshold: 15,
        }
    }
}
