//! Every option is a named argument (`--name value`). Underscores in option
//! names are accepted in place of dashes, so `--mac_address` and
//! `--mac-address` are equivalent.

use btleplug::api::BDAddr;
use std::{fmt::Display, str::FromStr};

use crate::{
    error::{BridgeError, Result},
    types::{ConnectionParams, TimeoutConfig},
};

/// Bike id used when deriving default topics
pub const DEFAULT_BIKE_ID: &str = "000001";

/// Broker port for TLS connections
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Broker port for plain TCP connections
pub const DEFAULT_TCP_PORT: u16 = 1883;

/// Environment variable consulted when `--password` is not given
pub const PASSWORD_ENV: &str = "KICKR_BROKER_PASSWORD";

const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Usage text printed for `--help`
pub const USAGE: &str = "\
usage: kickr-bridge --mac-address <MAC> --broker-address <HOST> [options]

  --mac-address <MAC>                 BLE address of the KICKR
  --broker-address <HOST>             MQTT broker host
  --broker-port <PORT>                broker port (8883 with TLS, 1883 without)
  --username <NAME>                   broker username
  --password <SECRET>                 broker password (or KICKR_BROKER_PASSWORD)
  --no-tls                            connect over plain TCP
  --client-id <ID>                    MQTT client id
  --bike-id <ID>                      bike id used in default topics (000001)
  --device-name <NAME>                metadata.deviceName (defaults to host name)
  --resistance-command-topic <TOPIC>
  --incline-command-topic <TOPIC>
  --resistance-report-topic <TOPIC>
  --incline-report-topic <TOPIC>
  --speed-report-topic <TOPIC>
  --cadence-report-topic <TOPIC>
  --power-report-topic <TOPIC>
  --heart-rate-report-topic <TOPIC>   publish heart rate when set
  --write-timeout-ms <MS>             write acknowledgement timeout (2000)
  --scan-timeout-ms <MS>              BLE scan timeout (10000)
  --connect-timeout-ms <MS>           BLE connect timeout (30000)
  --reconnect-attempts <N>            BLE reconnect attempts (3)
  --help                              show this text
";

/// MQTT topics the bridge reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Inbound resistance commands
    pub resistance_command: String,
    /// Inbound incline commands
    pub incline_command: String,
    /// Confirmed resistance and resistance rejections
    pub resistance_report: String,
    /// Confirmed incline and incline rejections
    pub incline_report: String,
    /// Instantaneous speed
    pub speed_report: String,
    /// Instantaneous cadence
    pub cadence_report: String,
    /// Instantaneous power
    pub power_report: String,
    /// Heart rate, published only when configured
    pub heart_rate_report: Option<String>,
}

impl Topics {
    /// Default topic set for a bike id
    #[must_use]
    pub fn for_bike(bike_id: &str) -> Self {
        let base = format!("bike/{bike_id}");
        Self {
            resistance_command: format!("{base}/resistance"),
            incline_command: format!("{base}/incline"),
            resistance_report: format!("{base}/resistance/report"),
            incline_report: format!("{base}/incline/report"),
            speed_report: format!("{base}/speed"),
            cadence_report: format!("{base}/cadence"),
            power_report: format!("{base}/power"),
            heart_rate_report: None,
        }
    }

    /// Topics to subscribe to
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        vec![self.resistance_command.clone(), self.incline_command.clone()]
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::for_bike(DEFAULT_BIKE_ID)
    }
}

/// MQTT broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    /// Broker host name or address
    pub broker_host: String,
    /// Broker port
    pub broker_port: u16,
    /// Connect over TLS
    pub use_tls: bool,
    /// Username, if the broker requires one
    pub username: Option<String>,
    /// Password for `username`
    pub password: Option<String>,
    /// MQTT client id
    pub client_id: String,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
}

/// Complete runtime configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// BLE address of the trainer
    pub mac_address: BDAddr,
    /// Broker settings
    pub mqtt: MqttConfig,
    /// Topic mapping
    pub topics: Topics,
    /// Host identifier sent as `metadata.deviceName`
    pub device_name: String,
    /// BLE scan, connect and reconnect settings
    pub connection: ConnectionParams,
    /// GATT operation timeouts
    pub timeouts: TimeoutConfig,
}

/// Check whether `--help` or `-h` was passed
#[must_use]
pub fn help_requested(args: &[String]) -> bool {
    args.iter().any(|arg| arg == "--help" || arg == "-h")
}

fn parse_number<T>(flag: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| BridgeError::Config(format!("invalid value for --{flag}: {value} ({e})")))
}

/// Host name used as the default device name
#[must_use]
pub fn default_device_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

impl BridgeConfig {
    /// Build the configuration from process arguments (without the program name)
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] for unknown options, missing values,
    /// malformed numbers or addresses, and when a required option is absent.
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        Self::from_args_with_env(args, |key| std::env::var(key).ok())
    }

    /// Build the configuration with an explicit environment lookup
    ///
    /// # Errors
    ///
    /// See [`BridgeConfig::from_args`].
    pub fn from_args_with_env<I, F>(args: I, env: F) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let mut mac_address = None;
        let mut broker_host = None;
        let mut broker_port = None;
        let mut username = None;
        let mut password = None;
        let mut use_tls = true;
        let mut client_id = None;
        let mut bike_id = DEFAULT_BIKE_ID.to_string();
        let mut device_name = None;
        let mut overrides: Vec<(String, String)> = Vec::new();
        let mut connection = ConnectionParams::default();
        let mut timeouts = TimeoutConfig::default();

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let Some(flag) = arg.strip_prefix("--") else {
                return Err(BridgeError::Config(format!("unexpected argument: {arg}")));
            };
            let flag = flag.replace('_', "-");

            if flag == "no-tls" {
                use_tls = false;
                continue;
            }

            let value = args
                .next()
                .ok_or_else(|| BridgeError::Config(format!("missing value for --{flag}")))?;

            match flag.as_str() {
                "mac-address" => {
                    let address = BDAddr::from_str(&value).map_err(|e| {
                        BridgeError::Config(format!("invalid MAC address {value}: {e}"))
                    })?;
                    mac_address = Some(address);
                }
                "broker-address" => broker_host = Some(value),
                "broker-port" => broker_port = Some(parse_number(&flag, &value)?),
                "username" => username = Some(value),
                "password" => password = Some(value),
                "client-id" => client_id = Some(value),
                "bike-id" => bike_id = value,
                "device-name" => device_name = Some(value),
                "write-timeout-ms" => timeouts.write_ack_timeout_ms = parse_number(&flag, &value)?,
                "scan-timeout-ms" => connection.scan_timeout_ms = parse_number(&flag, &value)?,
                "connect-timeout-ms" => connection.timeout_ms = parse_number(&flag, &value)?,
                "reconnect-attempts" => connection.retry_attempts = parse_number(&flag, &value)?,
                topic if topic.ends_with("-topic") => overrides.push((flag.clone(), value)),
                _ => return Err(BridgeError::Config(format!("unknown option: --{flag}"))),
            }
        }

        let mac_address = mac_address
            .ok_or_else(|| BridgeError::Config("--mac-address is required".to_string()))?;
        let broker_host = broker_host
            .ok_or_else(|| BridgeError::Config("--broker-address is required".to_string()))?;

        let mut topics = Topics::for_bike(&bike_id);
        for (flag, value) in overrides {
            let slot = match flag.as_str() {
                "resistance-command-topic" => &mut topics.resistance_command,
                "incline-command-topic" => &mut topics.incline_command,
                "resistance-report-topic" => &mut topics.resistance_report,
                "incline-report-topic" => &mut topics.incline_report,
                "speed-report-topic" => &mut topics.speed_report,
                "cadence-report-topic" => &mut topics.cadence_report,
                "power-report-topic" => &mut topics.power_report,
                "heart-rate-report-topic" => {
                    topics.heart_rate_report = Some(value);
                    continue;
                }
                _ => return Err(BridgeError::Config(format!("unknown option: --{flag}"))),
            };
            *slot = value;
        }

        let mqtt = MqttConfig {
            broker_host,
            broker_port: broker_port.unwrap_or(if use_tls {
                DEFAULT_TLS_PORT
            } else {
                DEFAULT_TCP_PORT
            }),
            use_tls,
            password: password.or_else(|| env(PASSWORD_ENV)),
            username,
            client_id: client_id.unwrap_or_else(|| format!("kickr-bridge-{bike_id}")),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        };

        Ok(Self {
            mac_address,
            mqtt,
            topics,
            device_name: device_name.unwrap_or_else(default_device_name),
            connection,
            timeouts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    const REQUIRED: [&str; 4] = [
        "--mac-address",
        "F8:8E:4D:4B:D7:6C",
        "--broker-address",
        "broker.example.com",
    ];

    #[test]
    fn test_default_topics() {
        let topics = Topics::default();
        assert_eq!(topics.resistance_command, "bike/000001/resistance");
        assert_eq!(topics.incline_command, "bike/000001/incline");
        assert_eq!(topics.resistance_report, "bike/000001/resistance/report");
        assert_eq!(topics.incline_report, "bike/000001/incline/report");
        assert_eq!(topics.speed_report, "bike/000001/speed");
        assert_eq!(topics.cadence_report, "bike/000001/cadence");
        assert_eq!(topics.power_report, "bike/000001/power");
        assert_eq!(topics.heart_rate_report, None);
        assert_eq!(
            topics.subscriptions(),
            vec!["bike/000001/resistance", "bike/000001/incline"]
        );
    }

    #[test]
    fn test_minimal_arguments() {
        let mut list = REQUIRED.to_vec();
        list.extend(["--device-name", "pi-bike"]);
        let config = assert_ok!(BridgeConfig::from_args_with_env(args(&list), no_env));

        assert_eq!(config.mac_address.to_string(), "F8:8E:4D:4B:D7:6C");
        assert_eq!(config.mqtt.broker_host, "broker.example.com");
        assert_eq!(config.mqtt.broker_port, DEFAULT_TLS_PORT);
        assert!(config.mqtt.use_tls);
        assert_eq!(config.mqtt.client_id, "kickr-bridge-000001");
        assert_eq!(config.device_name, "pi-bike");
        assert_eq!(config.topics, Topics::default());
        assert_eq!(config.timeouts.write_ack_timeout_ms, 2_000);
        assert_eq!(config.connection.retry_attempts, 3);
    }

    #[test]
    fn test_underscore_options_and_overrides() {
        let mut list = vec![
            "--mac_address",
            "f8:8e:4d:4b:d7:6c",
            "--broker_address",
            "localhost",
            "--bike-id",
            "000002",
            "--no-tls",
            "--speed_report_topic",
            "custom/speed",
            "--heart-rate-report-topic",
            "bike/000002/heartrate",
            "--write-timeout-ms",
            "500",
            "--reconnect-attempts",
            "0",
        ];
        list.extend(["--username", "bike"]);
        let config = assert_ok!(BridgeConfig::from_args_with_env(args(&list), no_env));

        assert!(!config.mqtt.use_tls);
        assert_eq!(config.mqtt.broker_port, DEFAULT_TCP_PORT);
        assert_eq!(config.mqtt.username.as_deref(), Some("bike"));
        assert_eq!(config.topics.speed_report, "custom/speed");
        assert_eq!(config.topics.cadence_report, "bike/000002/cadence");
        assert_eq!(config.topics.incline_command, "bike/000002/incline");
        assert_eq!(
            config.topics.heart_rate_report.as_deref(),
            Some("bike/000002/heartrate")
        );
        assert_eq!(config.timeouts.write_ack_timeout_ms, 500);
        assert_eq!(config.connection.retry_attempts, 0);
    }

    #[test]
    fn test_password_from_environment() {
        let env = |key: &str| (key == PASSWORD_ENV).then(|| "from-env".to_string());

        let config = assert_ok!(BridgeConfig::from_args_with_env(args(&REQUIRED), env));
        assert_eq!(config.mqtt.password.as_deref(), Some("from-env"));

        let mut list = REQUIRED.to_vec();
        list.extend(["--password", "from-args"]);
        let config = assert_ok!(BridgeConfig::from_args_with_env(args(&list), env));
        assert_eq!(config.mqtt.password.as_deref(), Some("from-args"));
    }

    #[test]
    fn test_invalid_arguments() {
        let cases: [&[&str]; 6] = [
            &["--broker-address", "localhost"],
            &["--mac-address", "F8:8E:4D:4B:D7:6C"],
            &["--mac-address", "not-a-mac", "--broker-address", "localhost"],
            &["--mac-address", "F8:8E:4D:4B:D7:6C", "--broker-port"],
            &["--mac-address", "F8:8E:4D:4B:D7:6C", "--broker-port", "http"],
            &["--mac-address", "F8:8E:4D:4B:D7:6C", "--color", "red"],
        ];

        for case in cases {
            let mut list = case.to_vec();
            if !list.contains(&"--broker-address") && list.len() > 2 {
                list.extend(["--broker-address", "localhost"]);
            }
            assert!(
                matches!(
                    BridgeConfig::from_args_with_env(args(&list), no_env),
                    Err(BridgeError::Config(_))
                ),
                "{case:?} should be rejected"
            );
        }

        assert!(BridgeConfig::from_args_with_env(args(&["positional"]), no_env).is_err());
        let mut list = REQUIRED.to_vec();
        list.extend(["--bogus-topic", "x"]);
        assert!(BridgeConfig::from_args_with_env(args(&list), no_env).is_err());
    }

    #[test]
    fn test_help_requested() {
        assert!(help_requested(&args(&["--help"])));
        assert!(help_requested(&args(&["--mac-address", "x", "-h"])));
        assert!(!help_requested(&args(&REQUIRED)));
    }
}
