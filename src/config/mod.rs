/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::common::lookup_key::KeyPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
    #[error("flow config invalid: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlowConfig {
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub active_timeout: Duration,

    #[serde(rename = "flow-slots-size")]
    pub hash_slots: u32,
    // 0 disables the resource bound
    #[serde(rename = "flow-count-limit")]
    pub flow_count_max: u32,

    // per-direction payload capture, 0 disables
    pub payload_cap: u32,
    pub udp_multipkt_capture: bool,
    // 0 off, 1 every port, otherwise only datagrams on that port
    pub udp_uniflow_port: u16,

    pub vlan_in_key: bool,
    pub netif_in_key: bool,
    pub mpls_enabled: bool,

    pub uniflow_export: bool,
    pub accept_out_of_order: bool,
    pub stats_enabled: bool,

    #[serde(with = "humantime_serde")]
    pub flush_delay: Duration,
    // backlog at which a flush proceeds in spite of flush-delay
    pub flush_backlog: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            idle_timeout: Duration::from_secs(300),
            active_timeout: Duration::from_secs(1800),

            hash_slots: 131072,
            flow_count_max: 0,

            payload_cap: 0,
            udp_multipkt_capture: false,
            udp_uniflow_port: 0,

            vlan_in_key: true,
            netif_in_key: false,
            mpls_enabled: false,

            uniflow_export: false,
            accept_out_of_order: false,
            stats_enabled: false,

            flush_delay: Duration::from_secs(5),
            flush_backlog: 2500,
        }
    }
}

impl FlowConfig {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        let cfg: Self = if contents.len() == 0 {
            // parsing empty string leads to EOF error
            Self::default()
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() || self.active_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "flow timeouts must be positive".to_owned(),
            ));
        }
        if self.hash_slots == 0 {
            return Err(ConfigError::Invalid(
                "flow-slots-size must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            vlan_in_key: self.vlan_in_key,
            netif_in_key: self.netif_in_key,
        }
    }
}
