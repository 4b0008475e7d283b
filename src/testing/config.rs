//! Scenario file types
//!
//! Defines the data structures for deserializing YAML scenario files.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::common::config::VmSpec;
use crate::params::Params;
use crate::scenarios::ScenarioKind;

/// A complete scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
pub struct ScenarioFile {
    /// Name of the run, used for the log file name
    pub name: String,
    /// Which scenario to run
    #[serde(rename = "type")]
    pub kind: ScenarioKind,
    /// Optional description of what the run verifies
    pub description: Option<String>,
    /// VM definitions; override config VMs with the same name
    #[serde(default)]
    pub vms: HashMap<String, VmSpec>,
    /// Scenario parameters
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl ScenarioFile {
    /// Parameters as the string map scenarios read
    pub fn params(&self) -> Params {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

/// A parameter value as written in YAML
///
/// Scalars are accepted in their natural YAML form so `repeat_times: 3`
/// does not need quoting.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", if *b { "yes" } else { "no" }),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario_file() {
        let file: ScenarioFile = serde_yaml::from_str(
            r#"
name: nbd-reconnect
type: block_kill_reconnect
description: Kill the data export twice
vms:
  vm1:
    login: ssh -p 2222 root@127.0.0.1
params:
  main_vm: vm1
  repeat_times: 2
  reconnect_time_wait: 1.5
  nbd_port_data1: 10809
  kill_data_img_cmd: "fuser -k %s/tcp"
"#,
        )
        .unwrap();

        assert_eq!(file.kind, ScenarioKind::BlockKillReconnect);
        assert_eq!(file.vms["vm1"].login, "ssh -p 2222 root@127.0.0.1");
        assert_eq!(file.params["repeat_times"], ParamValue::Int(2));

        let params = file.params();
        assert_eq!(params.raw("repeat_times"), Some("2"));
        assert_eq!(params.raw("reconnect_time_wait"), Some("1.5"));
        assert_eq!(params.raw("kill_data_img_cmd"), Some("fuser -k %s/tcp"));
    }

    #[test]
    fn test_bool_params_use_yes_no() {
        assert_eq!(ParamValue::Bool(true).to_string(), "yes");
        assert_eq!(ParamValue::Bool(false).to_string(), "no");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<ScenarioFile, _> = serde_yaml::from_str("name: x\ntype: reboot\n");
        assert!(result.is_err());
    }
}
