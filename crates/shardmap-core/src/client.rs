//! Retrying store client
//!
//! Every call opens a transaction through the connection factory, prefixes
//! the request with a version check where required and converts failed
//! responses into categorized errors.

use crate::retry::RetryPolicy;
use shardmap_common::{Error, Result, ShardLocation, StoreVersion};
use shardmap_store::{StoreConnectionFactory, StoreRequest, StoreResponse};
use std::sync::Arc;

/// Store access shared by the engine, recovery and upgrades
pub struct StoreClient {
    stores: Arc<dyn StoreConnectionFactory>,
    retry: RetryPolicy,
}

impl StoreClient {
    pub fn new(stores: Arc<dyn StoreConnectionFactory>, retry: RetryPolicy) -> Self {
        Self { stores, retry }
    }

    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run a request against the global store after a version check
    pub fn global(
        &self,
        what: &str,
        min: StoreVersion,
        request: StoreRequest,
    ) -> Result<StoreResponse> {
        self.retry.run(what, || {
            let connection = self.stores.global()?;
            let requests = [StoreRequest::CheckVersion { min }, request.clone()];
            last_response(connection.execute_in_transaction(&requests)?)
        })
    }

    /// Run a request against the global store without a version check
    pub fn global_unchecked(&self, what: &str, request: StoreRequest) -> Result<StoreResponse> {
        self.retry.run(what, || {
            let connection = self.stores.global()?;
            last_response(connection.execute_in_transaction(std::slice::from_ref(&request))?)
        })
    }

    /// Run a request against a local store after a version check
    pub fn local(
        &self,
        what: &str,
        location: &ShardLocation,
        min: StoreVersion,
        request: StoreRequest,
    ) -> Result<StoreResponse> {
        self.retry.run(what, || {
            let connection = self.stores.local(location)?;
            let requests = [StoreRequest::CheckVersion { min }, request.clone()];
            last_response(connection.execute_in_transaction(&requests)?)
        })
    }

    /// Run a request against a local store without a version check
    pub fn local_unchecked(
        &self,
        what: &str,
        location: &ShardLocation,
        request: StoreRequest,
    ) -> Result<StoreResponse> {
        self.retry.run(what, || {
            let connection = self.stores.local(location)?;
            last_response(connection.execute_in_transaction(std::slice::from_ref(&request))?)
        })
    }
}

/// Last response of a batch, or the error of the first failed one
fn last_response(responses: Vec<StoreResponse>) -> Result<StoreResponse> {
    let mut last = None;
    for response in responses {
        last = Some(response.into_result()?);
    }
    last.ok_or_else(|| Error::storage("store returned no response"))
}
