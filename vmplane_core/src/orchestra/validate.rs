use crate::resources::{Graphics, GraphicsType};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use url::Url;

// Error Handling
use vmplane_error::{Reason, VmplaneError};

/// Decode a request body into its parameter struct.
/// Unknown fields and type mismatches are rejected.
pub(super) fn parse_params<T: DeserializeOwned>(body: Value) -> Result<T, VmplaneError> {
    serde_json::from_value(body).map_err(|e| {
        VmplaneError::invalid(Reason::ParamsInvalid, &format!("invalid request body: {e}"))
    })
}

pub(super) fn check_name(what: &str, name: &str) -> Result<(), VmplaneError> {
    if name.trim().is_empty() || name.chars().any(|c| c == '/' || c.is_control()) {
        return Err(VmplaneError::invalid(
            Reason::NameInvalid,
            &format!("{what} name {:#?} must not be blank nor contain '/'", name),
        ));
    }
    Ok(())
}

/// Extract the entity name from an uri like "/templates/<name>".
pub(super) fn uri_name<'a>(uri: &'a str, collection: &str) -> Result<&'a str, VmplaneError> {
    let prefix = format!("/{collection}/");
    match uri.strip_prefix(&prefix) {
        Some(name) if !name.is_empty() && !name.contains('/') => Ok(name),
        _ => Err(VmplaneError::invalid(
            Reason::UriInvalid,
            &format!("{:#?} is not a {} uri ({}<name>)", uri, collection, prefix),
        )),
    }
}

/// http, https and ftp locations are accepted without a local check.
pub(super) fn is_remote(path: &str) -> bool {
    match Url::parse(path) {
        Ok(url) => matches!(url.scheme(), "http" | "https" | "ftp" | "ftps"),
        Err(_) => false,
    }
}

pub(super) fn media_exists(path: &str) -> bool {
    is_remote(path) || Path::new(path).exists()
}

pub(super) fn check_media_path(path: &str) -> Result<(), VmplaneError> {
    if !media_exists(path) {
        return Err(VmplaneError::invalid(
            Reason::StoragePathNotFound,
            &format!("{:#?} is neither an existing file nor a remote url", path),
        ));
    }
    Ok(())
}

/// Catch `"networks": "default"` before it reaches serde.
pub(super) fn check_networks_field(body: &Value) -> Result<(), VmplaneError> {
    match body.get("networks") {
        Some(networks) if !networks.is_array() => Err(VmplaneError::invalid(
            Reason::NetworksNotArray,
            "networks must be an array of network names",
        )),
        _ => Ok(()),
    }
}

pub(super) fn check_cpus(cpus: u32, max: u32) -> Result<(), VmplaneError> {
    if cpus == 0 || cpus > max {
        return Err(VmplaneError::invalid(
            Reason::CpusInvalid,
            &format!("cpus must be between 1 and {max}, got {cpus}"),
        ));
    }
    Ok(())
}

pub(super) fn check_memory(memory: u64, min: u64) -> Result<(), VmplaneError> {
    if memory < min {
        return Err(VmplaneError::invalid(
            Reason::MemoryInvalid,
            &format!("memory must be at least {min} MiB, got {memory}"),
        ));
    }
    Ok(())
}

/// First "<prefix><n>" with n >= 1 for which `taken` is false.
pub(super) fn next_free_name<F>(prefix: &str, taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    let mut n: u64 = 1;
    loop {
        let name = format!("{prefix}{n}");
        if !taken(&name) {
            return name;
        }
        n += 1;
    }
}

pub(super) fn now() -> i64 {
    Utc::now().timestamp()
}

/// Graphics as found in template and vm create bodies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphicsParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub listen: Option<String>,
}

impl GraphicsParams {
    /// Overlay the supplied fields on `base`.
    pub fn apply(&self, base: &Graphics) -> Result<Graphics, VmplaneError> {
        let mut graphics = base.clone();
        if let Some(kind) = &self.kind {
            graphics.kind = GraphicsType::from_str(kind).map_err(|_| {
                VmplaneError::invalid(
                    Reason::GraphicsInvalid,
                    &format!("unsupported graphics type {:#?}, use vnc or spice", kind),
                )
            })?;
        }
        if let Some(listen) = &self.listen {
            graphics.listen = listen.parse::<IpAddr>().map_err(|_| {
                VmplaneError::invalid(
                    Reason::GraphicsInvalid,
                    &format!("graphics listen {:#?} is not an ip address", listen),
                )
            })?;
        }
        Ok(graphics)
    }
}
