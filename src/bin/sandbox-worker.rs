use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pysandbox_pool::{SandboxError, SandboxId, SandboxService, ServiceConfig};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;
const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
struct SandboxParams {
    sandbox_id: SandboxId,
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    sandbox_id: SandboxId,
    code: String,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InstallParams {
    sandbox_id: SandboxId,
    package: String,
}

#[derive(Debug, Deserialize)]
struct FileParams {
    sandbox_id: SandboxId,
    path: String,
    content_base64: Option<String>,
}

/// What the read loop should do after answering a request
enum Flow {
    Continue,
    Stop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sandbox_worker=info,pysandbox_pool=info".to_string()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ServiceConfig::from_env()?;
    tracing::info!("sandbox-worker starting (root_dir={:?})", config.root_dir);
    let mut service = SandboxService::start(config).await?;

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid json-rpc line: {} | err={}", line, e);
                continue;
            }
        };

        let (response, flow) = handle_message(&service, parsed).await;
        if let Some(resp) = response {
            let s = serde_json::to_string(&resp)?;
            stdout.write_all(s.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        if let Flow::Stop = flow {
            break;
        }
    }

    service.stop().await;
    tracing::info!("sandbox-worker stopped");
    Ok(())
}

async fn handle_message(service: &SandboxService, msg: Value) -> (Option<Value>, Flow) {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));
    let flow = if method == "shutdown" || method == "exit" {
        Flow::Stop
    } else {
        Flow::Continue
    };

    // Notifications have no id and get no reply.
    let Some(id) = msg.get("id").cloned() else {
        return (None, flow);
    };

    let result = match method {
        "shutdown" => Ok(json!({ "stopping": true })),
        _ => dispatch(service, method, params).await,
    };

    let response = match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    };
    (Some(response), flow)
}

async fn dispatch(
    service: &SandboxService,
    method: &str,
    params: Value,
) -> std::result::Result<Value, Value> {
    let registry = service.registry();
    match method {
        "sandbox.create" => {
            let id = registry.create().map_err(sandbox_error)?;
            let info = registry.wait_ready(id).await.map_err(sandbox_error)?;
            to_value(info)
        }
        "sandbox.execute" => {
            let p: ExecuteParams = parse_params(params)?;
            let timeout = p.timeout_seconds.map(Duration::from_secs);
            let result = registry
                .execute(p.sandbox_id, &p.code, timeout)
                .await
                .map_err(sandbox_error)?;
            to_value(result)
        }
        "sandbox.install" => {
            let p: InstallParams = parse_params(params)?;
            let report = registry
                .install(p.sandbox_id, &p.package)
                .await
                .map_err(sandbox_error)?;
            to_value(report)
        }
        "sandbox.upload" => {
            let p: FileParams = parse_params(params)?;
            let encoded = p
                .content_base64
                .ok_or_else(|| invalid_params("missing content_base64"))?;
            let data = BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| invalid_params(&format!("content_base64: {}", e)))?;
            let size = data.len();
            registry
                .upload(p.sandbox_id, &p.path, data)
                .await
                .map_err(sandbox_error)?;
            Ok(json!({ "path": p.path, "size": size }))
        }
        "sandbox.download" => {
            let p: FileParams = parse_params(params)?;
            let data = registry
                .download(p.sandbox_id, &p.path)
                .await
                .map_err(sandbox_error)?;
            Ok(json!({ "path": p.path, "content_base64": BASE64.encode(data) }))
        }
        "sandbox.list_files" => {
            let p: SandboxParams = parse_params(params)?;
            let files = registry
                .list_files(p.sandbox_id)
                .await
                .map_err(sandbox_error)?;
            Ok(json!({ "files": files }))
        }
        "sandbox.close" => {
            let p: SandboxParams = parse_params(params)?;
            registry.close(p.sandbox_id).await.map_err(sandbox_error)?;
            Ok(json!({ "closed": p.sandbox_id }))
        }
        "sandbox.list" => Ok(json!({ "sandboxes": registry.list() })),
        _ => Err(json!({
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {}", method)
        })),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> std::result::Result<T, Value> {
    serde_json::from_value(params).map_err(|e| invalid_params(&e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> std::result::Result<Value, Value> {
    serde_json::to_value(value).map_err(|e| sandbox_error(SandboxError::from(e)))
}

fn invalid_params(message: &str) -> Value {
    json!({ "code": INVALID_PARAMS, "message": format!("Invalid params: {}", message) })
}

fn sandbox_error(err: SandboxError) -> Value {
    json!({
        "code": SERVER_ERROR,
        "message": err.to_string(),
        "data": { "kind": err.code() }
    })
}
