// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::events::DEFAULT_EVENT_CAPACITY;

/// What to do when the record store cannot be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistPolicy {
    /// Log the error and carry on; memory and disk may diverge until the
    /// next successful save
    #[default]
    Log,
    /// Try the save once more before logging
    RetryOnce,
    /// Return the error to the caller of the operation
    Fail,
}

impl FromStr for PersistPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(Self::Log),
            "retry-once" => Ok(Self::RetryOnce),
            "fail" => Ok(Self::Fail),
            other => Err(format!(
                "unknown persist policy '{other}' (expected log, retry-once or fail)"
            )),
        }
    }
}

impl fmt::Display for PersistPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Log => "log",
            Self::RetryOnce => "retry-once",
            Self::Fail => "fail",
        })
    }
}

/// Options for the download coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory finished episodes are written to
    pub download_dir: PathBuf,
    pub persist_policy: PersistPolicy,
    /// Events buffered per subscriber before it lags
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            persist_policy: PersistPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_policy_parses_cli_names() {
        assert_eq!("log".parse(), Ok(PersistPolicy::Log));
        assert_eq!("retry-once".parse(), Ok(PersistPolicy::RetryOnce));
        assert_eq!("fail".parse(), Ok(PersistPolicy::Fail));
        assert!("sometimes".parse::<PersistPolicy>().is_err());
    }

    #[test]
    fn persist_policy_display_round_trips() {
        for policy in [PersistPolicy::Log, PersistPolicy::RetryOnce, PersistPolicy::Fail] {
            assert_eq!(policy.to_string().parse(), Ok(policy));
        }
    }

    #[test]
    fn default_config_logs_store_failures() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.persist_policy, PersistPolicy::Log);
        assert_eq!(config.download_dir, PathBuf::from("downloads"));
    }
}
