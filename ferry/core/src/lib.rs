// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

#![doc = include_str!("../README.md")]

/// The current version of Ferry, derived from the Cargo package version.
pub const FERRY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// All-to-all collectives on top of channels.
pub mod collective;
/// Configuration options and settings.
pub mod config;
/// Block pool, files, block readers and writers, channels.
pub mod data;
/// Per-worker asynchronous I/O runtime.
pub mod dispatcher;
/// Error types and result definitions.
pub mod error;
/// Frames and connection groups between workers.
pub mod net;
/// Spilling reduce pre-stage.
pub mod reduce;
