use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(MessageId, "msg");
branded_id!(ToolCallId, "call");
branded_id!(RequestId, "req");
branded_id!(ConnectionId, "conn");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(ToolCallId::new().as_str().starts_with("call_"));
        assert!(RequestId::new().as_str().starts_with("req_"));
        assert!(ConnectionId::new().as_str().starts_with("conn_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_keeps_vendor_ids_verbatim() {
        let id: ToolCallId = "call_abc123".parse().unwrap();
        assert_eq!(id.as_str(), "call_abc123");
        assert_eq!(id.to_string(), "call_abc123");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SessionId::from_raw("s1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"s1\"");
        let back: SessionId = serde_json::from_str("\"s1\"").unwrap();
        assert_eq!(back, id);
    }
}
