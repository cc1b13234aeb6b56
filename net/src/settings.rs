use config::{Config, Environment, File};
use serde::Deserialize;

use crate::{
    data_types::{ProcessorCount, WaitTime, PROCESSOR_LIMIT_INFINITE},
    errors::EngineResult,
    lock_policy::LockPolicy,
};

pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_PORT: &str = "8000";
pub const ENVIRONMENT_PREFIX: &str = "NETENGINE";

/// Construction parameters shared by every endpoint
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub host_name: String,
    pub port: String,
    pub asynchronous_receive: bool,
    /// Absent means wait forever
    pub wait_time_ms: Option<u64>,
    pub maximum_processor_count: ProcessorCount,
    pub lock_policy: LockPolicy,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            host_name: DEFAULT_HOSTNAME.to_owned(),
            port: DEFAULT_PORT.to_owned(),
            asynchronous_receive: true,
            wait_time_ms: None,
            maximum_processor_count: PROCESSOR_LIMIT_INFINITE,
            lock_policy: LockPolicy::default(),
        }
    }
}

impl EndpointSettings {
    pub fn new(host_name: &str, port: &str) -> Self {
        Self {
            host_name: host_name.to_owned(),
            port: port.to_owned(),
            ..Self::default()
        }
    }

    /// Merges `Settings`, `Settings.<environment>` and `NETENGINE_*` environment
    /// variables. Both files are optional.
    pub fn load(environment: &str) -> EngineResult<Self> {
        let config = Config::builder()
            .add_source(File::with_name("Settings").required(false))
            .add_source(File::with_name(&format!("Settings.{environment}")).required(false))
            .add_source(Environment::with_prefix(ENVIRONMENT_PREFIX))
            .build()?;
        Ok(config.try_deserialize::<Self>()?)
    }

    pub fn wait_time(self: &Self) -> WaitTime {
        self.wait_time_ms.into()
    }

    pub fn with_wait_time(mut self: Self, wait_time: WaitTime) -> Self {
        self.wait_time_ms = wait_time.duration().map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_asynchronous_receive(mut self: Self, asynchronous_receive: bool) -> Self {
        self.asynchronous_receive = asynchronous_receive;
        self
    }

    pub fn with_maximum_processor_count(mut self: Self, count: ProcessorCount) -> Self {
        self.maximum_processor_count = count;
        self
    }

    pub fn with_lock_policy(mut self: Self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn should_default_to_safe_values() {
        let settings = EndpointSettings::default();
        assert_eq!(settings.host_name, "localhost");
        assert!(settings.asynchronous_receive);
        assert!(settings.wait_time().is_infinite());
        assert_eq!(settings.maximum_processor_count, 0);
        assert_eq!(settings.lock_policy, LockPolicy::Mutex);
    }

    #[test]
    fn should_deserialize_partial_configuration() {
        let config = Config::builder()
            .add_source(File::from_str(
                "port = \"9100\"\nwait_time_ms = 250\nlock_policy = \"spin\"",
                FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings: EndpointSettings = config.try_deserialize().unwrap();

        assert_eq!(settings.host_name, "localhost");
        assert_eq!(settings.port, "9100");
        assert_eq!(settings.wait_time(), WaitTime::from_millis(250));
        assert_eq!(settings.lock_policy, LockPolicy::Spin);
    }

    #[test]
    fn should_round_trip_wait_time_through_builder() {
        let settings = EndpointSettings::new("127.0.0.1", "1")
            .with_wait_time(WaitTime::from_millis(40))
            .with_maximum_processor_count(3);
        assert_eq!(settings.wait_time_ms, Some(40));
        assert_eq!(settings.maximum_processor_count, 3);
    }
}
