// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`ControlPlane`] backed by the OVN northbound database, driven through
//! `ovn-nbctl`.

use crate::port::mac_to_string;
use crate::port::ControlPlane;
use crate::port::ControlPlaneError;
use crate::port::PortAddresses;
use crate::port::PortSpec;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use macaddr::MacAddr6;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::Logger;
use std::net::IpAddr;
use std::process::ExitStatus;
use std::time::Duration;

/// How to reach `ovn-nbctl`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct NbctlConfig {
    /// Path to the `ovn-nbctl` binary.
    pub path: Utf8PathBuf,
    /// Seconds to wait for a single invocation before giving up on it.
    pub timeout_secs: u64,
}

impl Default for NbctlConfig {
    fn default() -> Self {
        Self { path: Utf8PathBuf::from("ovn-nbctl"), timeout_secs: 15 }
    }
}

/// Failure to run one `ovn-nbctl` invocation.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to start `{command}`")]
    Spawn {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed { command: String, status: ExitStatus, stderr: String },

    #[error("`{command}` did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

// Run the command to completion, treating a non-zero exit status or running
// past `timeout` as failure.
async fn execute_async(
    command: &mut tokio::process::Command,
    timeout: Duration,
) -> Result<std::process::Output, ExecutionError> {
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| ExecutionError::Timeout {
            command: command_to_string(command.as_std()),
            timeout,
        })?
        .map_err(|err| ExecutionError::Spawn {
            command: command_to_string(command.as_std()),
            err,
        })?;

    if !output.status.success() {
        return Err(ExecutionError::Failed {
            command: command_to_string(command.as_std()),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

fn ensure_port_args(port: &PortSpec) -> Vec<String> {
    vec![
        String::from("--"),
        String::from("--may-exist"),
        String::from("lsp-add"),
        port.switch.clone(),
        port.name.clone(),
        String::from("--"),
        String::from("lsp-set-addresses"),
        port.name.clone(),
        format!("{} {}", mac_to_string(port.mac), port.ip),
    ]
}

fn remove_port_args(name: &str) -> Vec<String> {
    vec![
        String::from("--"),
        String::from("--if-exists"),
        String::from("lsp-del"),
        name.to_string(),
    ]
}

fn port_addresses_args(name: &str) -> Vec<String> {
    vec![
        String::from("--if-exists"),
        String::from("get"),
        String::from("logical_switch_port"),
        name.to_string(),
        String::from("addresses"),
    ]
}

/// Parse the `addresses` column of a logical switch port.
///
/// `ovn-nbctl --if-exists get` prints nothing for a missing port, and a set
/// of strings such as `["0a:58:0a:84:00:03 10.132.0.3"]` otherwise. Only the
/// first entry is considered.
fn parse_addresses(
    port: &str,
    output: &str,
) -> Result<Option<PortAddresses>, ControlPlaneError> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(None);
    }
    let entries = output
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| ControlPlaneError::Addresses {
            port: port.to_string(),
            output: output.to_string(),
        })?;
    let Some(first) =
        entries.split(',').map(str::trim).find(|entry| !entry.is_empty())
    else {
        return Ok(Some(PortAddresses::default()));
    };

    let mut words = first.trim_matches('"').split_whitespace();
    // The first word may also be "dynamic", "router" or "unknown".
    let mac = words.next().and_then(|word| word.parse::<MacAddr6>().ok());
    let ip = words.find_map(|word| word.parse::<IpAddr>().ok());
    Ok(Some(PortAddresses { mac, ip }))
}

/// Manages overlay ports through `ovn-nbctl`.
pub struct Nbctl {
    log: Logger,
    path: Utf8PathBuf,
    timeout: Duration,
}

impl Nbctl {
    pub fn new(log: &Logger, config: &NbctlConfig) -> Self {
        Self {
            log: log.new(o!("component" => "Nbctl")),
            path: config.path.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String, ExecutionError> {
        let mut command =
            tokio::process::Command::new(self.path.as_std_path());
        command.args(args).kill_on_drop(true);
        debug!(
            self.log,
            "running command";
            "command" => command_to_string(command.as_std()),
        );
        let output = execute_async(&mut command, self.timeout).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ControlPlane for Nbctl {
    async fn ensure_port(
        &self,
        port: &PortSpec,
    ) -> Result<(), ControlPlaneError> {
        self.run(&ensure_port_args(port)).await.map_err(|err| {
            ControlPlaneError::Execution {
                op: "add",
                port: port.name.clone(),
                err,
            }
        })?;
        Ok(())
    }

    async fn remove_port(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.run(&remove_port_args(name)).await.map_err(|err| {
            ControlPlaneError::Execution {
                op: "delete",
                port: name.to_string(),
                err,
            }
        })?;
        Ok(())
    }

    async fn port_addresses(
        &self,
        name: &str,
    ) -> Result<Option<PortAddresses>, ControlPlaneError> {
        let output =
            self.run(&port_addresses_args(name)).await.map_err(|err| {
                ControlPlaneError::Execution {
                    op: "look up",
                    port: name.to_string(),
                    err,
                }
            })?;
        parse_addresses(name, &output)
    }
}
