use std::collections::BTreeMap;
use std::path::PathBuf;

use herder::{ErrorKind, StatusRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	Start {
		name: String,
		#[serde(default)]
		binary: String,
		#[serde(default)]
		args: Vec<String>,
		/// `null` inherits the daemon's environment; `[]` starts with none.
		#[serde(default)]
		env: Option<Vec<String>>,
		#[serde(default)]
		dir: String,
	},
	Stop { name: String },
	Remove { name: String },
	Restart { name: String },
	Status,
	Load { path: PathBuf },
	Attach { pid: u32 },
	Ping,
	Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Ok { message: Option<String> },
	Process { process: StatusRecord },
	Status { processes: BTreeMap<String, StatusRecord> },
	Error { kind: ErrorKind, message: String },
	Pong,
}

impl Response {
	pub fn ok(message: impl Into<String>) -> Self {
		Response::Ok {
			message: Some(message.into()),
		}
	}
}

impl From<herder::Error> for Response {
	fn from(e: herder::Error) -> Self {
		Response::Error {
			kind: e.kind(),
			message: e.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn start_request_wire_format() {
		let line = r#"{"cmd":"start","name":"web","binary":"python3","args":["-m","http.server"],"env":null,"dir":"web"}"#;
		let req: Request = serde_json::from_str(line).unwrap();
		assert_eq!(
			req,
			Request::Start {
				name: "web".into(),
				binary: "python3".into(),
				args: vec!["-m".into(), "http.server".into()],
				env: None,
				dir: "web".into(),
			}
		);

		let req: Request = serde_json::from_str(r#"{"cmd":"start","name":"bare","env":[]}"#).unwrap();
		assert!(matches!(req, Request::Start { env: Some(ref e), .. } if e.is_empty()));
	}

	#[test]
	fn unit_requests() {
		assert_eq!(serde_json::to_string(&Request::Ping).unwrap(), r#"{"cmd":"ping"}"#);
		let req: Request = serde_json::from_str(r#"{"cmd":"attach","pid":42}"#).unwrap();
		assert_eq!(req, Request::Attach { pid: 42 });
	}

	#[test]
	fn error_response_carries_kind() {
		let resp = Response::from(herder::Error::NotFound("web".into()));
		let json = serde_json::to_string(&resp).unwrap();
		assert_eq!(json, r#"{"type":"error","kind":"not_found","message":"process not found: web"}"#);
		assert_eq!(serde_json::from_str::<Response>(&json).unwrap(), resp);
	}
}
