use serde::{Deserialize, Serialize};

/// One session as listed in a `sessions` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub name: String,
    pub client_count: usize,
    /// RFC 3339 creation timestamp, immutable for the session's lifetime.
    pub created_at: String,
    /// Whether at least one client is currently attached.
    pub is_connected: bool,
}

/// One connected client as listed in a `clients` frame.
///
/// `id` is assigned in iteration order at the moment the list is built and
/// is NOT stable across calls; a `kick-client` racing a join or leave may
/// target a different connection than intended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub id: usize,
    pub ip: String,
    /// RFC 3339 timestamp of when the connection was accepted.
    pub connected_at: String,
    /// Name of the session the client is attached to, if any.
    pub session: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_entry_wire_field_names() {
        let entry = SessionEntry {
            name: "demo".to_string(),
            client_count: 2,
            created_at: "2026-08-01T10:00:00Z".to_string(),
            is_connected: true,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""clientCount":2"#));
        assert!(json.contains(r#""createdAt""#));
        assert!(json.contains(r#""isConnected":true"#));
        let parsed: SessionEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_client_entry_roundtrip() {
        let entry = ClientEntry {
            id: 0,
            ip: "192.168.1.20".to_string(),
            connected_at: "2026-08-01T10:00:00Z".to_string(),
            session: Some("demo".to_string()),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""connectedAt""#));
        let parsed: ClientEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_client_entry_detached_session_null() {
        let entry = ClientEntry {
            id: 3,
            ip: "10.0.0.7".to_string(),
            connected_at: "2026-08-01T10:00:00Z".to_string(),
            session: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""session":null"#));
    }
}
