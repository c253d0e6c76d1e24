/*
 * Copyright (C) 2026 The Sharedpath Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::OnceLock;

use tokio::sync::Mutex;

/// Connection string for the catalog the integration tests run against.
/// Tests skip silently when the harness does not provide one.
pub fn test_dsn() -> Option<String> {
    std::env::var("SHAREDPATH_TEST_DSN")
        .ok()
        .filter(|dsn| !dsn.is_empty())
}

/// The tests share one database, so they run one at a time.
pub fn serial_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Volume names must be unique among live rows; suffix them so reruns and
/// parallel test binaries never collide.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}
