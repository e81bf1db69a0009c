//! Structured output and exit-code mapping.
//!
//! With `--json`, every command renders a machine-readable document and
//! errors become `{ "kind": ..., "message": ..., "context": ... }`. Exit
//! codes: 0 success, 2 validation, 3 not-found, 4 conflict, 5 runtime,
//! 6 external service; 1 for anything outside the core's error set.

use anyhow::Result;
use net_servers::Error;
use serde::Serialize;
use serde_json::json;

/// Prints `value` as JSON, or runs the human renderer.
pub fn emit<T: Serialize, F: FnOnce()>(json: bool, value: &T, human: F) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

pub fn exit_code_of(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(core) => core.exit_code(),
        None => 1,
    }
}

/// The `--json` error document.
pub fn error_json(err: &anyhow::Error) -> serde_json::Value {
    match err.downcast_ref::<Error>() {
        Some(core) => json!({
            "kind": core.kind(),
            "message": core.to_string(),
            "context": context_of(core),
        }),
        None => json!({
            "kind": "ERROR",
            "message": err.to_string(),
            "context": {},
        }),
    }
}

fn context_of(err: &Error) -> serde_json::Value {
    match err {
        Error::ConfigParse { file, .. } => json!({ "file": file }),
        Error::ConfigValidate(issues) => json!({
            "issues": issues
                .iter()
                .map(|i| json!({ "path": i.path, "rule": i.rule, "message": i.message }))
                .collect::<Vec<_>>(),
        }),
        Error::IoTransient { path, .. } | Error::IoFatal { path, .. } => json!({ "path": path }),
        Error::EnvNotFound(name)
        | Error::EnvNotEnabled(name)
        | Error::EnvLastRemaining(name)
        | Error::EnvCurrentRemove(name) => json!({ "environment": name }),
        Error::PathNotAbsolute(path) => json!({ "path": path }),
        Error::PathConflict { base, environments } => json!({
            "base": base,
            "environments": [environments.0, environments.1],
        }),
        Error::PortConflict {
            port,
            container,
            holder,
        } => json!({ "port": port, "container": container, "holder": holder }),
        Error::RuntimeTimeout { operation, timeout } => {
            json!({ "operation": operation, "timeout_secs": timeout.as_secs() })
        }
        Error::RuntimeError { operation, stderr } => {
            json!({ "operation": operation, "stderr": stderr })
        }
        Error::CertIssueFailed { domain, detail } => {
            json!({ "domain": domain, "detail": detail })
        }
        Error::CertExpired { domain } => json!({ "domain": domain }),
        Error::ZoneCheckFailed { zone, stderr } => json!({ "zone": zone, "stderr": stderr }),
        Error::ReloadFailed(container) => json!({ "container": container }),
        Error::PlanConflict {
            path,
            synchronizers,
        } => json!({
            "path": path,
            "synchronizers": [synchronizers.0, synchronizers.1],
        }),
        _ => json!({}),
    }
}
