//! Daemon configuration.
//!
//! Everything has a default; `STACKPILOT_*` environment variables override.
//! An unparsable value is logged and the default kept.
//!
//! | Variable | Default |
//! |---|---|
//! | `STACKPILOT_STATE_DIR` | `./stackpilot-state` |
//! | `STACKPILOT_MIN_PREFIX_LEN` | 6 |
//! | `STACKPILOT_DELIVERY_TIMEOUT_SECS` | 10 |
//! | `STACKPILOT_USER_AGENT` | `stackpilot/<version>` |
//! | `STACKPILOT_SNAPSHOT_INTERVAL_SECS` | 60 |
//! | `STACKPILOT_DELIVERY_ATTEMPTS` | 3 |
//! | `STACKPILOT_RETRY_DELAY_SECS` | 5 |
//! | `STACKPILOT_DEPLOY_COMMAND` | echoes the target SHA |
//! | `STACKPILOT_ROLLBACK_COMMAND` | the deploy command |
//! | `STACKPILOT_TASK_COMMAND_<NAME>` | none (maintenance task `<name>`) |
//! | `STACKPILOT_KILL_GRACE_SECS` | 10 |

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::engine::{DEFAULT_MIN_PREFIX_LEN, OrchestratorConfig};
use crate::executor::{DEFAULT_KILL_GRACE_SECS, ScriptConfig};
use crate::hooks::{DispatcherConfig, TransportConfig};
use crate::jobs::worker::{DEFAULT_DELIVERY_ATTEMPTS, DEFAULT_RETRY_DELAY_SECS, WorkerConfig};

const DEFAULT_STATE_DIR: &str = "./stackpilot-state";
const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60;
const DEFAULT_DEPLOY_COMMAND: &str = "echo \"deploying $STACKPILOT_SHA\"";
const TASK_COMMAND_PREFIX: &str = "STACKPILOT_TASK_COMMAND_";

#[derive(Debug, Clone)]
pub struct Config {
    /// Holds `snapshot.json` and `events.log`.
    pub state_dir: PathBuf,
    pub snapshot_interval: Duration,
    pub orchestrator: OrchestratorConfig,
    pub transport: TransportConfig,
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub scripts: ScriptConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            snapshot_interval: Duration::from_secs(DEFAULT_SNAPSHOT_INTERVAL_SECS),
            orchestrator: OrchestratorConfig::default(),
            transport: TransportConfig {
                timeout: Duration::from_secs(DEFAULT_DELIVERY_TIMEOUT_SECS),
                user_agent: default_user_agent(),
            },
            dispatcher: DispatcherConfig::default(),
            worker: WorkerConfig::default(),
            scripts: ScriptConfig {
                deploy: DEFAULT_DEPLOY_COMMAND.to_string(),
                rollback: DEFAULT_DEPLOY_COMMAND.to_string(),
                tasks: BTreeMap::new(),
                kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SECS),
            },
        }
    }
}

fn default_user_agent() -> String {
    format!("stackpilot/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Builds a config from explicit variables.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let defaults = Config::default();

        let deploy = vars
            .get("STACKPILOT_DEPLOY_COMMAND")
            .cloned()
            .unwrap_or(defaults.scripts.deploy);
        let rollback = vars
            .get("STACKPILOT_ROLLBACK_COMMAND")
            .cloned()
            .unwrap_or_else(|| deploy.clone());
        let tasks = vars
            .iter()
            .filter_map(|(key, command)| {
                let name = key.strip_prefix(TASK_COMMAND_PREFIX)?;
                Some((name.to_ascii_lowercase().replace('_', "-"), command.clone()))
            })
            .collect();

        Config {
            state_dir: vars
                .get("STACKPILOT_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            snapshot_interval: Duration::from_secs(parse_or(
                &vars,
                "STACKPILOT_SNAPSHOT_INTERVAL_SECS",
                DEFAULT_SNAPSHOT_INTERVAL_SECS,
            )),
            orchestrator: OrchestratorConfig {
                min_prefix_len: parse_or(&vars, "STACKPILOT_MIN_PREFIX_LEN", DEFAULT_MIN_PREFIX_LEN),
            },
            transport: TransportConfig {
                timeout: Duration::from_secs(parse_or(
                    &vars,
                    "STACKPILOT_DELIVERY_TIMEOUT_SECS",
                    DEFAULT_DELIVERY_TIMEOUT_SECS,
                )),
                user_agent: vars
                    .get("STACKPILOT_USER_AGENT")
                    .cloned()
                    .unwrap_or(defaults.transport.user_agent),
            },
            dispatcher: defaults.dispatcher,
            worker: WorkerConfig {
                delivery_attempts: parse_or(
                    &vars,
                    "STACKPILOT_DELIVERY_ATTEMPTS",
                    DEFAULT_DELIVERY_ATTEMPTS,
                ),
                retry_delay: Duration::from_secs(parse_or(
                    &vars,
                    "STACKPILOT_RETRY_DELAY_SECS",
                    DEFAULT_RETRY_DELAY_SECS,
                )),
            },
            scripts: ScriptConfig {
                deploy,
                rollback,
                tasks,
                kill_grace: Duration::from_secs(parse_or(
                    &vars,
                    "STACKPILOT_KILL_GRACE_SECS",
                    DEFAULT_KILL_GRACE_SECS,
                )),
            },
        }
    }
}

fn parse_or<T: FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    match vars.get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid value, using default");
            default
        }),
    }
}
