//! `SKIFF_*` environment variable fallbacks.
//!
//! Environment variables only fill fields that no config file set.

use std::collections::HashMap;

use tracing::debug;

use crate::merge::{ConfigLayer, FieldSources};

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: ValueKind,
}

#[derive(Clone, Copy)]
enum ValueKind {
    String,
    Integer,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "SKIFF_RECLAIM_DELAY_MS",
        field_path: "bootstrap.reclaim_delay_ms",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "SKIFF_PLATFORM_VERSION",
        field_path: "bootstrap.platform_version",
        kind: ValueKind::String,
    },
    EnvMapping {
        var_name: "SKIFF_PLATFORM_ROOT",
        field_path: "bootstrap.platform_root",
        kind: ValueKind::String,
    },
    EnvMapping {
        var_name: "SKIFF_LOG_LEVEL",
        field_path: "logging.level",
        kind: ValueKind::String,
    },
    EnvMapping {
        var_name: "SKIFF_LOG_FORMAT",
        field_path: "logging.format",
        kind: ValueKind::String,
    },
];

/// Snapshot the process's `SKIFF_*` variables.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("SKIFF_"))
        .collect()
}

/// Apply fallbacks for fields no file layer set. Returns how many applied.
///
/// Fields still at their embedded default count as unset.
pub fn apply_env_fallbacks<S: std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> usize {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        let set_by_file = sources
            .get(mapping.field_path)
            .is_some_and(|layer| *layer != ConfigLayer::Defaults);
        if set_by_file {
            continue;
        }
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };

        let value = match mapping.kind {
            ValueKind::String => toml::Value::String(raw.clone()),
            // Unparsable numbers stay strings so validation reports them.
            ValueKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map_or_else(|_| toml::Value::String(raw.clone()), toml::Value::Integer),
        };
        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );
        set_field(merged, mapping.field_path, value);
        sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
        count = count.saturating_add(1);
    }

    count
}

fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }
}
