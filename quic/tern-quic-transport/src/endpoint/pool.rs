// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::Endpoint;
use parking_lot::RwLock;
use std::sync::Arc;

/// A set of endpoints, usually one per socket, that new client connections are spread over
#[derive(Debug, Default)]
pub struct Pool {
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, endpoint: Arc<Endpoint>) {
        self.endpoints.write().push(endpoint);
    }

    /// Returns the open endpoint carrying the fewest connections
    pub fn select(&self) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .filter(|endpoint| endpoint.is_open())
            .min_by_key(|endpoint| endpoint.connection_count())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    /// Closes every endpoint and empties the pool
    pub fn close(&self) {
        let endpoints = core::mem::take(&mut *self.endpoints.write());
        for endpoint in endpoints {
            endpoint.close();
        }
    }
}
