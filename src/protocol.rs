//! Wire format spoken between a `KernelSession` and its interpreter process.
//!
//! One JSON object per line in each direction. Requests carry a `msg_id`; every
//! event the kernel emits while handling a request carries it back as `parent_id`.
//! Message names follow the notebook kernel protocol.

use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol adapter run inside the sandbox interpreter (`python -u -c KERNEL_SHIM`).
///
/// It keeps a private copy of the original stdin/stdout for frames, points fd 0 at
/// /dev/null and fd 1 at stderr so neither user code nor its subprocesses can touch
/// the channel, and then serves execute/shutdown requests against one namespace.
pub const KERNEL_SHIM: &str = r#"
import ast, base64, builtins, importlib, io, json, linecache, os, signal, sys, threading, traceback

_requests = os.fdopen(os.dup(0), "rb")
_proto = os.fdopen(os.dup(1), "w", encoding="utf-8", buffering=1)
_null = os.open(os.devnull, os.O_RDONLY)
os.dup2(_null, 0)
os.close(_null)
os.dup2(2, 1)

_lock = threading.Lock()
_parent = None
_running = False
_count = 0
_ns = {"__name__": "__main__", "__builtins__": builtins}
_log = sys.__stderr__


def _clean(value):
    # Lone surrogates (surrogateescape'd bytes) are not valid JSON text.
    if isinstance(value, str):
        return value.encode("utf-8", "backslashreplace").decode("utf-8")
    if isinstance(value, dict):
        return {_clean(k): _clean(v) for k, v in value.items()}
    if isinstance(value, (list, tuple)):
        return [_clean(v) for v in value]
    return value


def _send(msg_type, content):
    frame = json.dumps({"parent_id": _parent, "msg_type": msg_type, "content": _clean(content)})
    with _lock:
        _proto.write(frame + "\n")
        _proto.flush()


class _Stream(io.TextIOBase):
    def __init__(self, name):
        self.name = name
        self._buf = ""

    @property
    def encoding(self):
        return "utf-8"

    def writable(self):
        return True

    def isatty(self):
        return False

    def write(self, text):
        if not isinstance(text, str):
            raise TypeError("write() argument must be str, not %s" % type(text).__name__)
        self._buf += text
        while "\n" in self._buf:
            line, self._buf = self._buf.split("\n", 1)
            _send("stream", {"name": self.name, "text": line + "\n"})
        return len(text)

    def flush(self):
        pass

    def finish(self):
        if self._buf:
            text, self._buf = self._buf, ""
            _send("stream", {"name": self.name, "text": text})


_MIME_METHODS = (
    ("image/png", "_repr_png_"),
    ("image/jpeg", "_repr_jpeg_"),
    ("image/svg+xml", "_repr_svg_"),
    ("application/pdf", "_repr_pdf_"),
    ("text/html", "_repr_html_"),
    ("text/markdown", "_repr_markdown_"),
    ("text/latex", "_repr_latex_"),
    ("application/json", "_repr_json_"),
    ("application/javascript", "_repr_javascript_"),
)


def _format(obj):
    try:
        data = {"text/plain": repr(obj)}
    except Exception as exc:
        data = {"text/plain": "<unrepresentable %s: %s>" % (type(obj).__name__, exc)}
    if isinstance(obj, type):
        return data
    for mime, attr in _MIME_METHODS:
        method = getattr(obj, attr, None)
        if not callable(method):
            continue
        try:
            value = method()
        except Exception:
            continue
        if isinstance(value, tuple):
            value = value[0]
        if value is None:
            continue
        if isinstance(value, (bytes, bytearray)):
            value = base64.b64encode(bytes(value)).decode("ascii")
        elif mime == "application/json":
            try:
                json.dumps(value)
            except (TypeError, ValueError):
                continue
        elif not isinstance(value, str):
            value = str(value)
        data[mime] = value
    return data


def display(*objs):
    for obj in objs:
        _send("display_data", {"data": _format(obj)})


builtins.display = display


def _flush_figures():
    plt = sys.modules.get("matplotlib.pyplot")
    if plt is None:
        return
    try:
        for num in plt.get_fignums():
            fig = plt.figure(num)
            buf = io.BytesIO()
            fig.savefig(buf, format="png", bbox_inches="tight")
            _send("display_data", {"data": {
                "image/png": base64.b64encode(buf.getvalue()).decode("ascii"),
                "text/plain": repr(fig),
            }})
        plt.close("all")
    except Exception as exc:
        _log.write("figure capture failed: %r\n" % (exc,))


def _report(exc):
    frames = traceback.extract_tb(exc.__traceback__)
    for start, frame in enumerate(frames):
        if frame.filename.startswith("<cell-"):
            frames = [f for f in frames[start:] if f.filename != "<string>"]
            break
    else:
        frames = []
    lines = []
    if frames:
        lines.append("Traceback (most recent call last):\n")
        lines.extend(traceback.format_list(frames))
    lines.extend(traceback.format_exception_only(type(exc), exc))
    _send("error", {
        "ename": type(exc).__name__,
        "evalue": str(exc),
        "traceback": lines,
    })


def _execute(code):
    global _count, _running
    _count += 1
    filename = "<cell-%d>" % _count
    linecache.cache[filename] = (len(code), None, code.splitlines(True), filename)
    # Packages may have been installed into the environment since the last cell.
    importlib.invalidate_caches()
    _send("status", {"execution_state": "busy"})
    status = "ok"
    try:
        tree = ast.parse(code, filename, "exec")
        tail = None
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            tail = ast.Expression(tree.body.pop().value)
        body = compile(tree, filename, "exec")
        value = None
        _running = True
        try:
            exec(body, _ns)
            if tail is not None:
                value = eval(compile(tail, filename, "eval"), _ns)
        finally:
            _running = False
        if value is not None:
            _ns["_"] = value
            _send("execute_result", {"execution_count": _count, "data": _format(value)})
    except BaseException as exc:
        _running = False
        status = "error"
        _report(exc)
    finally:
        sys.stdout.finish()
        sys.stderr.finish()
        _flush_figures()
    _send("execute_reply", {"status": status, "execution_count": _count})
    _send("status", {"execution_state": "idle"})


def _on_sigint(signum, frame):
    if _running:
        raise KeyboardInterrupt


def _main():
    global _parent
    signal.signal(signal.SIGINT, _on_sigint)
    sys.argv = [""]
    sys.stdin = io.StringIO("")
    sys.stdout = _Stream("stdout")
    sys.stderr = _Stream("stderr")
    _send("status", {"execution_state": "starting"})
    _send("status", {"execution_state": "idle"})
    while True:
        line = _requests.readline()
        if not line:
            break
        try:
            request = json.loads(line)
        except ValueError as exc:
            _log.write("malformed request: %r\n" % (exc,))
            continue
        _parent = request.get("msg_id")
        kind = request.get("msg_type")
        if kind == "execute_request":
            _execute(request.get("code", ""))
        elif kind == "shutdown_request":
            _send("shutdown_reply", {"status": "ok"})
            break
        else:
            _log.write("unknown request type: %r\n" % (kind,))
        _parent = None


_main()
"#;

/// Request sent to the kernel
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum KernelRequest {
    ExecuteRequest { msg_id: String, code: String },
    ShutdownRequest { msg_id: String },
}

impl KernelRequest {
    pub fn execute(code: &str) -> Self {
        KernelRequest::ExecuteRequest {
            msg_id: uuid::Uuid::new_v4().to_string(),
            code: code.to_string(),
        }
    }

    pub fn shutdown() -> Self {
        KernelRequest::ShutdownRequest {
            msg_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn msg_id(&self) -> &str {
        match self {
            KernelRequest::ExecuteRequest { msg_id, .. }
            | KernelRequest::ShutdownRequest { msg_id } => msg_id,
        }
    }

    /// One newline-terminated frame
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Interpreter-level execution state announced by `status` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Decoded event
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Status(ExecutionState),
    Stream {
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        execution_count: Option<u32>,
        data: Map<String, Value>,
    },
    DisplayData {
        data: Map<String, Value>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    ExecuteReply {
        ok: bool,
        execution_count: Option<u32>,
    },
    ShutdownReply,
    /// A message type this side does not interpret
    Unknown(String),
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: ExecutionState,
}

#[derive(Deserialize)]
struct StreamContent {
    name: StreamName,
    text: String,
}

#[derive(Deserialize)]
struct DataContent {
    #[serde(default)]
    execution_count: Option<u32>,
    #[serde(default)]
    data: Map<String, Value>,
}

#[derive(Deserialize)]
struct ErrorContent {
    #[serde(default)]
    ename: String,
    #[serde(default)]
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Deserialize)]
struct ReplyContent {
    status: String,
    #[serde(default)]
    execution_count: Option<u32>,
}

/// One line read from the kernel
#[derive(Debug, Clone, Deserialize)]
pub struct KernelFrame {
    #[serde(default)]
    pub parent_id: Option<String>,
    pub msg_type: String,
    #[serde(default)]
    pub content: Value,
}

impl KernelFrame {
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| SandboxError::Protocol(format!("undecodable frame ({}): {}", e, line.trim_end())))
    }

    /// Whether this frame answers the request `msg_id`
    pub fn belongs_to(&self, msg_id: &str) -> bool {
        self.parent_id.as_deref() == Some(msg_id)
    }

    pub fn event(&self) -> Result<KernelEvent> {
        let content = self.content.clone();
        let bad = |e: serde_json::Error| {
            SandboxError::Protocol(format!("malformed {} frame: {}", self.msg_type, e))
        };
        let event = match self.msg_type.as_str() {
            "status" => {
                let c: StatusContent = serde_json::from_value(content).map_err(bad)?;
                KernelEvent::Status(c.execution_state)
            }
            "stream" => {
                let c: StreamContent = serde_json::from_value(content).map_err(bad)?;
                KernelEvent::Stream {
                    name: c.name,
                    text: c.text,
                }
            }
            "execute_result" => {
                let c: DataContent = serde_json::from_value(content).map_err(bad)?;
                KernelEvent::ExecuteResult {
                    execution_count: c.execution_count,
                    data: c.data,
                }
            }
            "display_data" => {
                let c: DataContent = serde_json::from_value(content).map_err(bad)?;
                KernelEvent::DisplayData { data: c.data }
            }
            "error" => {
                let c: ErrorContent = serde_json::from_value(content).map_err(bad)?;
                KernelEvent::Error {
                    ename: c.ename,
                    evalue: c.evalue,
                    traceback: c.traceback,
                }
            }
            "execute_reply" => {
                let c: ReplyContent = serde_json::from_value(content).map_err(bad)?;
                KernelEvent::ExecuteReply {
                    ok: c.status == "ok",
                    execution_count: c.execution_count,
                }
            }
            "shutdown_reply" => KernelEvent::ShutdownReply,
            other => KernelEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}
