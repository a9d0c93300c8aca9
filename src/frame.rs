//! The request/response frame model.
//!
//! A frame is one newline-delimited value in the textual object notation.
//! A frame with a `patch:` field is a PATCH operation; `hello:`, `newTx:`,
//! and `watch:` select session operations; anything else is a MATCH
//! (read), which requires a `path:`.

use logd_path::KindedPath;
use logd_store::StoreError;
use logd_value::{parse_frame, render_frame, Key, Node, TextError};

/// A decoded request frame.
#[derive(Debug, Clone)]
pub enum Request {
    Hello {
        client_id: String,
    },
    NewTx {
        participants: u32,
    },
    Watch {
        path: KindedPath,
    },
    Patch {
        path: KindedPath,
        match_cond: Option<Node>,
        patch: Node,
        tx: Option<u64>,
        participants: Option<u32>,
    },
    Match {
        path: KindedPath,
        match_cond: Option<Node>,
    },
}

/// A request-level failure, rendered as an error frame.
#[derive(Debug)]
pub struct RequestError {
    pub kind: &'static str,
    pub message: String,
}

impl RequestError {
    pub fn usage(message: impl Into<String>) -> Self {
        RequestError {
            kind: "UsageError",
            message: message.into(),
        }
    }

    pub fn not_found(path: &KindedPath) -> Self {
        RequestError {
            kind: "NotFound",
            message: format!("no value at {path}"),
        }
    }
}

impl From<TextError> for RequestError {
    fn from(source: TextError) -> Self {
        RequestError {
            kind: "MalformedStream",
            message: source.to_string(),
        }
    }
}

impl From<StoreError> for RequestError {
    fn from(source: StoreError) -> Self {
        RequestError {
            kind: source.wire_kind(),
            message: source.to_string(),
        }
    }
}

/// Parses and classifies one request frame.
pub fn parse_request(raw: &str) -> Result<Request, RequestError> {
    let node = parse_frame(raw)?;
    let object = node
        .as_object()
        .ok_or_else(|| RequestError::usage("request frame must be an object"))?;

    if let Some(hello) = object.get_field("hello") {
        let client_id = hello
            .as_object()
            .and_then(|body| body.get_field("clientID"))
            .and_then(Node::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok(Request::Hello { client_id });
    }

    if let Some(new_tx) = object.get_field("newTx") {
        let participants = new_tx
            .as_object()
            .and_then(|body| body.get_field("participants"))
            .and_then(Node::as_int)
            .unwrap_or(1);
        let participants = u32::try_from(participants)
            .ok()
            .filter(|&count| count >= 1)
            .ok_or_else(|| RequestError::usage("participants must be a positive integer"))?;
        return Ok(Request::NewTx { participants });
    }

    if let Some(watch) = object.get_field("watch") {
        let path_text = watch
            .as_object()
            .and_then(|body| body.get_field("path"))
            .and_then(Node::as_str)
            .ok_or_else(|| RequestError::usage("watch requires a path"))?;
        let path = parse_path(path_text)?;
        return Ok(Request::Watch { path });
    }

    let path_text = object
        .get_field("path")
        .and_then(Node::as_str)
        .ok_or_else(|| RequestError::usage("request requires a string path field"))?;
    let path = parse_path(path_text)?;
    let match_cond = object.get_field("match").cloned();

    if let Some(patch) = object.get_field("patch") {
        let tx = match object.get_field("tx") {
            Some(value) => Some(
                value
                    .as_int()
                    .and_then(|raw| u64::try_from(raw).ok())
                    .ok_or_else(|| RequestError::usage("tx must be a non-negative integer"))?,
            ),
            None => None,
        };
        let participants = match object.get_field("participants") {
            Some(value) => Some(
                value
                    .as_int()
                    .and_then(|raw| u32::try_from(raw).ok())
                    .filter(|&count| count >= 1)
                    .ok_or_else(|| {
                        RequestError::usage("participants must be a positive integer")
                    })?,
            ),
            None => None,
        };
        return Ok(Request::Patch {
            path,
            match_cond,
            patch: patch.clone(),
            tx,
            participants,
        });
    }

    Ok(Request::Match { path, match_cond })
}

fn parse_path(text: &str) -> Result<KindedPath, RequestError> {
    KindedPath::parse(text).map_err(|e| RequestError {
        kind: "BadPath",
        message: e.to_string(),
    })
}

/// Renders `{ error: { message, kind } }`.
pub fn error_frame(error: &RequestError) -> String {
    render_frame(&Node::object(vec![(
        Key::from("error"),
        Node::object(vec![
            (Key::from("message"), Node::string(error.message.clone())),
            (Key::from("kind"), Node::string(error.kind)),
        ]),
    )]))
}

/// Renders `{ ok: true|false }`.
pub fn ok_frame(ok: bool) -> String {
    render_frame(&Node::object(vec![(Key::from("ok"), Node::bool(ok))]))
}

/// Renders the PATCH success response.
pub fn commit_frame(txid: u64, commit: u64) -> String {
    render_frame(&Node::object(vec![
        (Key::from("tx"), Node::int(txid as i64)),
        (Key::from("commit"), Node::int(commit as i64)),
    ]))
}

/// Renders the `newTx` response: `{ newTx: { txID: N } }`.
pub fn new_tx_frame(txid: u64) -> String {
    render_frame(&Node::object(vec![(
        Key::from("newTx"),
        Node::object(vec![(Key::from("txID"), Node::int(txid as i64))]),
    )]))
}

/// Renders one watch notification.
pub fn watch_frame(commit: u64, path: &KindedPath, value: Option<&Node>) -> String {
    render_frame(&Node::object(vec![
        (Key::from("commit"), Node::int(commit as i64)),
        (Key::from("path"), Node::string(path.to_string())),
        (
            Key::from("value"),
            value.cloned().unwrap_or_else(Node::null),
        ),
    ]))
}

/// Renders a read result: the subtree itself, as a frame.
pub fn value_frame(value: &Node) -> String {
    render_frame(value)
}
