/*
 * Copyright (c) 2022 Yunshan Networks
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

pub mod common;
pub mod config;
pub mod flow_cache;
mod utils;

pub use common::{timestamp_to_millis, MetaPacket, Timestamp};
pub use config::FlowConfig;
pub use flow_cache::{AppLabeler, Error, FlowCache, FlowExporter, PacketDumper, Result};

// for benchmarks
#[doc(hidden)]
pub use flow_cache::cache::{_new_flow_cache, _new_meta_packet, _reverse_meta_packet};
