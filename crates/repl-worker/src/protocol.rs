//! Messages exchanged between the controller and the worker thread.
//!
//! Every message is a record tagged by its `cmd` field, so the JSON form of
//! `{cmd: "run", data: "1 + 2"}` is exactly what `serde_json` produces for
//! `Request::Run`.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use anyhow::Result;
use repl_engine::{CancellationChannel, Stream};
use serde::{Deserialize, Serialize};

/// Controller to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Request {
    /// Shares the cancellation cells with the worker.  The cells cannot be
    /// serialized; a deserialized `init` carries fresh ones.
    Init {
        #[serde(skip)]
        data: CancellationChannel,
    },
    /// Replaces the session with one created from `data`.
    Load { data: String },
    /// Evaluates `data` in the session.
    Run { data: String },
    /// Formats `data` without touching the session.
    Format { data: String },
    /// Informational only: the stop itself travels through the shared cell.
    Stop,
}

impl Request {
    /// The `cmd` tag of this request.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Init { .. } => "init",
            Request::Load { .. } => "load",
            Request::Run { .. } => "run",
            Request::Format { .. } => "format",
            Request::Stop => "stop",
        }
    }
}

/// Worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Response {
    /// The session is ready for the next request.
    Ready,
    /// A chunk of output, from the module or from the worker itself.
    Output { stream: Stream, data: String },
    /// Answer to `format`: the new text, or `None` when it is unchanged.
    Format { data: Option<String> },
    /// Module download progress, as a percentage.
    Progress { data: f64 },
    /// The session is unusable and will not become ready again.
    Error { data: String },
}

impl Response {
    /// Renders the response as one line of JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_are_tagged_records() {
        let output = Response::Output {
            stream: Stream::Stdout,
            data: "3\n".to_string(),
        };
        assert_eq!(
            output.to_json().unwrap(),
            r#"{"cmd":"output","stream":"stdout","data":"3\n"}"#
        );
        assert_eq!(Response::Ready.to_json().unwrap(), r#"{"cmd":"ready"}"#);
        assert_eq!(
            Response::Format { data: None }.to_json().unwrap(),
            r#"{"cmd":"format","data":null}"#
        );
        assert_eq!(
            Response::Progress { data: 50.0 }.to_json().unwrap(),
            r#"{"cmd":"progress","data":50.0}"#
        );
    }

    #[test]
    fn requests_parse_from_tagged_records() {
        let run: Request = serde_json::from_str(r#"{"cmd":"run","data":"1 + 2"}"#).unwrap();
        assert!(matches!(run, Request::Run { ref data } if data == "1 + 2"));

        let stop: Request = serde_json::from_str(r#"{"cmd":"stop"}"#).unwrap();
        assert_eq!(stop.name(), "stop");

        let init: Request = serde_json::from_str(r#"{"cmd":"init"}"#).unwrap();
        match init {
            Request::Init { data } => assert!(!data.is_stop_requested()),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn graphics_output_keeps_its_tag() {
        let json = r#"{"cmd":"output","stream":"graphics","data":"<svg/>"}"#;
        let response: Response = serde_json::from_str(json).unwrap();
        assert_eq!(
            response,
            Response::Output {
                stream: Stream::Graphics,
                data: "<svg/>".to_string()
            }
        );
    }
}
