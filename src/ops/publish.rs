//! Publish the allocation spec and the rollout target version

use crate::common::keys::{spec_key, VERSION_KEY};
use crate::common::{retry_with_backoff, Error, Result};
use crate::consul::{Backend, QueryOptions};
use crate::shift::AllocationSpec;
use std::time::Duration;

const READ_RETRIES: usize = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Validate and store the allocation spec of `service`.
pub async fn set_spec(backend: &dyn Backend, service: &str, spec: &AllocationSpec) -> Result<()> {
    if spec.is_empty() {
        return Err(Error::InvalidSpec("spec must list at least one version".into()));
    }
    let key = spec_key(service);
    let written = backend.kv_put(&key, spec.to_json()?.as_bytes()).await?;
    if !written {
        return Err(Error::RequestFailed(format!("write of {} was refused", key)));
    }
    tracing::info!(service = %service, spec = ?spec.entries(), "Published allocation spec");
    Ok(())
}

pub async fn get_spec(backend: &dyn Backend, service: &str) -> Result<Option<AllocationSpec>> {
    let key = spec_key(service);
    let pair = retry_with_backoff(
        || backend.kv_get(&key, QueryOptions::default()),
        READ_RETRIES,
        READ_RETRY_DELAY,
    )
    .await?;
    pair.value.map(|p| AllocationSpec::from_json(&p.value)).transpose()
}

/// Set the cluster-wide target version of an orchestrated rollout.
pub async fn set_version(backend: &dyn Backend, version: &str) -> Result<()> {
    if version.trim().is_empty() {
        return Err(Error::InvalidSpec("version must not be empty".into()));
    }
    backend.kv_put(VERSION_KEY, version.as_bytes()).await?;
    tracing::info!(version = %version, "Published target version");
    Ok(())
}

pub async fn get_version(backend: &dyn Backend) -> Result<Option<String>> {
    let pair = retry_with_backoff(
        || backend.kv_get(VERSION_KEY, QueryOptions::default()),
        READ_RETRIES,
        READ_RETRY_DELAY,
    )
    .await?;
    Ok(pair.value.and_then(|p| p.value_str().map(str::to_string)))
}
