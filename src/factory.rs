//! Entry point: parses SDK keys and connection strings, and lazily builds
//! the default client from the `FLAGS` environment variable.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::client::Client;
use crate::controller::ControllerOptions;
use crate::core::error::{FlagsError, Result};
use crate::host::{Host, ProcessHost, ENV_FLAGS};

const CONNECTION_STRING_PREFIX: &str = "flags:";
const SDK_KEY_PARAM: &str = "sdkKey=";

/// Extract the `vf_…` SDK key from either a bare SDK key or a connection
/// string of the form `flags:…&sdkKey=vf_…`.
pub fn parse_sdk_key(input: &str) -> Result<String> {
    let candidate = if let Some(rest) = input.strip_prefix(CONNECTION_STRING_PREFIX) {
        rest.split('&')
            .find_map(|part| part.strip_prefix(SDK_KEY_PARAM))
            .ok_or_else(|| FlagsError::InvalidSdkKey(input.to_string()))?
    } else {
        input
    };

    if !candidate.starts_with("vf_") {
        return Err(FlagsError::InvalidSdkKey(input.to_string()));
    }
    Ok(candidate.to_string())
}

/// Build a client for the given SDK key or connection string. `configure`
/// is applied to the normalized options before the client is constructed
/// (stream/polling overrides, a provided datafile, etc.).
pub fn create_client(
    sdk_key_or_connection_string: &str,
    host: Arc<dyn Host>,
    configure: impl FnOnce(ControllerOptions) -> ControllerOptions,
) -> Result<Client> {
    let sdk_key = parse_sdk_key(sdk_key_or_connection_string)?;
    let options = configure(ControllerOptions::new(sdk_key)?);
    Ok(Client::new(options, host))
}

static DEFAULT_CLIENT: OnceCell<Arc<Client>> = OnceCell::new();

/// The process-wide default client, built lazily from the `FLAGS`
/// environment variable (read through the `Host` seam, never `std::env`
/// directly). Returns the same instance on every call after the first.
pub fn default_client(host: Arc<dyn Host>) -> Result<Arc<Client>> {
    if let Some(client) = DEFAULT_CLIENT.get() {
        return Ok(Arc::clone(client));
    }
    let connection_string = host
        .env(ENV_FLAGS)
        .ok_or_else(|| FlagsError::config(format!("{ENV_FLAGS} environment variable is not set")))?;
    let sdk_key = parse_sdk_key(&connection_string)?;
    let options = ControllerOptions::new(sdk_key)?;
    let client = Arc::new(Client::new(options, host));
    Ok(Arc::clone(DEFAULT_CLIENT.get_or_init(|| client)))
}

/// Convenience wrapper around [`default_client`] using a real
/// [`ProcessHost`]. Most callers outside of tests should use this.
pub fn default_client_process_host() -> Result<Arc<Client>> {
    default_client(Arc::new(ProcessHost::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;

    #[test]
    fn parses_bare_sdk_key() {
        assert_eq!(parse_sdk_key("vf_abc123").unwrap(), "vf_abc123");
    }

    #[test]
    fn parses_sdk_key_from_connection_string() {
        let key = parse_sdk_key("flags:v1&sdkKey=vf_abc123&other=1").unwrap();
        assert_eq!(key, "vf_abc123");
    }

    #[test]
    fn rejects_key_without_vf_prefix() {
        assert!(parse_sdk_key("not-a-key").is_err());
        assert!(parse_sdk_key("flags:v1&sdkKey=nope").is_err());
    }

    #[test]
    fn rejects_connection_string_missing_sdk_key_param() {
        assert!(parse_sdk_key("flags:v1&other=1").is_err());
    }

    #[test]
    fn create_client_validates_and_configures() {
        let host: Arc<dyn Host> = Arc::new(TestHost::new());
        let client = create_client("vf_abc123", host, |opts| opts.with_host("http://127.0.0.1:1")).unwrap();
        assert!(client.id() > 0);
    }
}
