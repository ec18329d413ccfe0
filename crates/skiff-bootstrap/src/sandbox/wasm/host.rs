//! Host functions linked into every wasm context.
//!
//! | Function | Input | Output |
//! |----------|-------|--------|
//! | `skiff_invoke` | `{context, export, input}` | export output |
//! | `skiff_load_nested` | `{location, module?}` | `{context}` |
//! | `skiff_log` | level, message | - |
//! | `skiff_require` | module name | host handles JSON |

use extism::{CurrentPlugin, Error, PTR, PluginBuilder, UserData, Val};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::sandbox::{ContextId, Exports, SandboxEnv};

/// Longest string a guest may pass to a host function.
const MAX_GUEST_STRING: u64 = 4 * 1024 * 1024;

/// Longest module name or log level.
const MAX_NAME_LEN: u64 = 256;

/// State shared by the host functions of one context.
pub(super) struct HostState {
    pub(super) env: SandboxEnv,
}

#[derive(Debug, Deserialize)]
struct LoadRequest {
    location: String,
    #[serde(default)]
    module: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoadResponse {
    context: String,
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    context: String,
    export: String,
    #[serde(default)]
    input: String,
}

/// Register the `skiff_*` functions on a plugin builder.
pub(super) fn register_host_functions(
    builder: PluginBuilder,
    user_data: UserData<HostState>,
) -> PluginBuilder {
    builder
        .with_function(
            "skiff_require",
            [PTR],
            [PTR],
            user_data.clone(),
            skiff_require_impl,
        )
        .with_function(
            "skiff_load_nested",
            [PTR],
            [PTR],
            user_data.clone(),
            skiff_load_nested_impl,
        )
        .with_function(
            "skiff_invoke",
            [PTR],
            [PTR],
            user_data.clone(),
            skiff_invoke_impl,
        )
        .with_function("skiff_log", [PTR, PTR], [], user_data, skiff_log_impl)
}

fn get_safe_string(plugin: &mut CurrentPlugin, val: &Val, max_len: u64) -> Result<String, Error> {
    let ptr = match val {
        Val::I64(v) => v.cast_unsigned(),
        Val::I32(v) => u64::from(v.cast_unsigned()),
        _ => return Err(Error::msg("expected memory pointer value")),
    };
    let len = plugin.memory_length(ptr)?;
    if len > max_len {
        return Err(Error::msg(format!(
            "guest string of {len} bytes exceeds limit of {max_len}"
        )));
    }
    plugin.memory_get_val(&Val::I64(ptr.cast_signed()))
}

fn env(user_data: &UserData<HostState>) -> Result<SandboxEnv, Error> {
    let ud = user_data.get()?;
    let state = ud
        .lock()
        .map_err(|e| Error::msg(format!("host state lock poisoned: {e}")))?;
    Ok(state.env.clone())
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn skiff_require_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let name = get_safe_string(plugin, &inputs[0], MAX_NAME_LEN)?;
    let handles = env(&user_data)?
        .require(&name)
        .map_err(|e| Error::msg(e.to_string()))?;
    let json = serde_json::to_string(handles.as_ref())?;

    let mem = plugin.memory_new(&json)?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn skiff_load_nested_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let raw = get_safe_string(plugin, &inputs[0], MAX_GUEST_STRING)?;
    let request: LoadRequest = serde_json::from_str(&raw)?;
    let location = Url::parse(&request.location)
        .map_err(|e| Error::msg(format!("invalid location `{}`: {e}", request.location)))?;

    let env = env(&user_data)?;
    let exports = match request.module.as_deref() {
        Some(module_id) => env.load_module(module_id, &location),
        None => env.load_nested(&location),
    }
    .map_err(|e| Error::msg(e.to_string()))?;

    let json = serde_json::to_string(&LoadResponse {
        context: exports.context().to_string(),
    })?;
    let mem = plugin.memory_new(&json)?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn skiff_invoke_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let raw = get_safe_string(plugin, &inputs[0], MAX_GUEST_STRING)?;
    let request: InvokeRequest = serde_json::from_str(&raw)?;
    let context: ContextId = request
        .context
        .parse()
        .map_err(|e: crate::sandbox::SandboxError| Error::msg(e.to_string()))?;

    let output = env(&user_data)?
        .invoke(&Exports::new(context), &request.export, request.input.as_bytes())
        .map_err(|e| Error::msg(e.to_string()))?;

    let mem = plugin.memory_new(output.as_slice())?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn skiff_log_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<HostState>,
) -> Result<(), Error> {
    let level = get_safe_string(plugin, &inputs[0], MAX_NAME_LEN)?;
    let message = get_safe_string(plugin, &inputs[1], MAX_GUEST_STRING)?;
    let context = env(&user_data)?.context();

    match level.to_lowercase().as_str() {
        "trace" => tracing::trace!(context = %context, "{message}"),
        "debug" => tracing::debug!(context = %context, "{message}"),
        "warn" | "warning" => tracing::warn!(context = %context, "{message}"),
        "error" | "err" => tracing::error!(context = %context, "{message}"),
        _ => tracing::info!(context = %context, "{message}"),
    }
    Ok(())
}
