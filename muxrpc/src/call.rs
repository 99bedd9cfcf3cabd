use crate::packet::{Body, Packet};

/// First packet sent on every connection. Names the method to call and the
/// shape of the call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct CallRequest {
    pub name: Vec<String>,
    #[serde(rename = "type")]
    pub type_: CallType,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl CallRequest {
    pub fn new(method: &str, type_: CallType, args: Vec<serde_json::Value>) -> Self {
        Self {
            name: method.split('.').map(String::from).collect(),
            type_,
            args,
        }
    }

    pub fn into_packet(self) -> Packet {
        Packet::Message(Body::json(&self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// A single request with a single response
    Async,
    /// Only the server sends stream messages
    Source,
    /// Only the client sends stream messages
    Sink,
    /// Both the server and the client send stream messages
    Duplex,
}

impl CallType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Source => "source",
            Self::Sink => "sink",
            Self::Duplex => "duplex",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for CallType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.as_str().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for CallType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let value = String::deserialize(deserializer)?;
        match value.as_ref() {
            "async" => Ok(Self::Async),
            "source" => Ok(Self::Source),
            "sink" => Ok(Self::Sink),
            "duplex" => Ok(Self::Duplex),
            value => Err(D::Error::invalid_value(
                serde::de::Unexpected::Str(value),
                &"one of \"async\", \"source\", \"sink\" or \"duplex\"",
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn call_request_json() {
        let request = CallRequest::new("tunnel.echo", CallType::Async, vec!["hello".into()]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": ["tunnel", "echo"],
                "type": "async",
                "args": ["hello"],
            })
        );
        let request2 = serde_json::from_value::<CallRequest>(json).unwrap();
        assert_eq!(request2, request);
    }

    #[test]
    fn invalid_call_type() {
        let result = serde_json::from_value::<CallRequest>(serde_json::json!({
            "name": ["echo"],
            "type": "through",
        }));
        assert!(result.is_err());
    }
}
