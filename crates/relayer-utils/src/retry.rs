// Copyright 2024 Escrow Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry logic for async calls.

use std::time::Duration;

use backoff::backoff::Backoff;

/// A constant-interval backoff with a retry budget. The scanners wrap
/// each record handler in one of these, so a transient store or RPC
/// hiccup is absorbed a few times before the record is skipped.
#[derive(Debug, Clone)]
pub struct ConstantWithMaxRetryCount {
    interval: Duration,
    remaining: usize,
    limit: usize,
}

impl ConstantWithMaxRetryCount {
    /// A policy waiting `interval` between attempts and allowing at
    /// most `max_retry_count` retries before giving up.
    pub fn new(interval: Duration, max_retry_count: usize) -> Self {
        Self {
            interval,
            remaining: max_retry_count,
            limit: max_retry_count,
        }
    }
}

impl Backoff for ConstantWithMaxRetryCount {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.interval)
    }

    fn reset(&mut self) {
        self.remaining = self.limit;
    }
}
