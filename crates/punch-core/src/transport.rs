//! The signaling transport.
//!
//! HTTP request/response against the vendor's session endpoints, bearer
//! authorized, built around one shared [`reqwest::Client`] — grounded on
//! `services/forwarder/src/uplink.rs`'s `UplinkSession`, just over HTTP
//! instead of a WebSocket.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::codec;
use crate::error::{CoreError, Result};
use crate::model::{ConsoleFamily, DeviceInfo, SessionMessage};

/// Base URL of the vendor REST service — the service provider owns the
/// actual paths; this just needs *a* base to build requests against,
/// overridable for tests.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub base_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            base_url: "https://remoteplay.example.com".to_owned(),
        }
    }
}

pub struct SignalingTransport {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl SignalingTransport {
    pub fn new(endpoints: Endpoints, http_timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(CoreError::from)?;
        Ok(SignalingTransport { client, endpoints })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.base_url, path)
    }

    /// `GET /users/me/clients?platform={PS4|PS5}`.
    pub async fn list_devices(&self, token: &str, family: ConsoleFamily) -> Result<Vec<DeviceInfo>> {
        let path = format!("/users/me/clients?platform={}", family.query_value());
        let resp = self
            .client
            .get(self.url(&path))
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::HttpNonOk {
                path,
                status: status.as_u16(),
            });
        }
        let body: Value = resp.json().await.map_err(CoreError::from)?;
        let clients = body
            .get("devices")
            .and_then(Value::as_array)
            .ok_or_else(|| CoreError::Schema("list_devices: missing 'devices'".into()))?;
        let mut out = Vec::with_capacity(clients.len());
        for c in clients {
            let duid_hex = c
                .get("duid")
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::Schema("device missing 'duid'".into()))?;
            let duid_bytes = hex::decode(duid_hex)
                .map_err(|e| CoreError::Schema(format!("device duid not hex: {e}")))?;
            let duid: [u8; 32] = duid_bytes
                .try_into()
                .map_err(|_| CoreError::Schema("device duid not 32 bytes".into()))?;
            let name = c
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::Schema("device missing 'name'".into()))?
                .to_owned();
            let remote_play_enabled = c
                .get("enabledFeatures")
                .and_then(Value::as_array)
                .is_some_and(|features| {
                    features.iter().any(|f| f.as_str() == Some("remotePlay"))
                });
            out.push(DeviceInfo {
                duid,
                name,
                remote_play_enabled,
            });
        }
        debug!(count = out.len(), "list_devices");
        Ok(out)
    }

    /// POST the session-creation template.
    ///
    /// Returns `(session_id, account_id)` parsed from the response; the
    /// caller (the state machine) stores these on the `Session`.
    pub async fn create_session(&self, token: &str, push_context_id: &str) -> Result<(String, i64)> {
        let path = "/remotePlaySessions";
        let payload = json!({ "pushContextId": push_context_id });
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::HttpNonOk {
                path: path.to_owned(),
                status: status.as_u16(),
            });
        }
        let body: Value = resp.json().await.map_err(CoreError::from)?;
        let session_id = body
            .pointer("/remotePlaySessions/0/sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Schema("create_session: missing sessionId".into()))?;
        if session_id.len() != 36 {
            return Err(CoreError::Schema("create_session: sessionId not a UUIDv4".into()));
        }
        let account_id_val = body
            .pointer("/members/0/accountId")
            .ok_or_else(|| CoreError::Schema("create_session: missing accountId".into()))?;
        let account_id = account_id_val
            .as_i64()
            .or_else(|| account_id_val.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| CoreError::Schema("create_session: accountId not int or numeric string".into()))?;
        Ok((session_id.to_owned(), account_id))
    }

    /// POST the start envelope.
    pub async fn start_session(
        &self,
        token: &str,
        session_id: &str,
        account_id: i64,
        data1: &[u8; 16],
        data2: &[u8; 16],
    ) -> Result<()> {
        use base64::Engine;
        let inner = json!({
            "accountId": account_id,
            "sessionId": session_id,
            "data1": base64::engine::general_purpose::STANDARD.encode(data1),
            "data2": base64::engine::general_purpose::STANDARD.encode(data2),
            "clientType": "Windows",
        });
        let path = format!("/remotePlaySessions/{session_id}/start");
        let payload = json!({ "payload": inner.to_string() });
        let resp = self
            .client
            .post(self.url(&path))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::HttpNonOk {
                path,
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// POST `/remotePlaySessions/{id}/sessionMessage`.
    pub async fn send_session_message(
        &self,
        token: &str,
        session_id: &str,
        msg: &SessionMessage,
    ) -> Result<()> {
        let path = format!("/remotePlaySessions/{session_id}/sessionMessage");
        let payload = json!({ "payload": codec::encode_envelope_payload(msg) });
        let resp = self
            .client
            .post(self.url(&path))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(%path, %status, "send_session_message non-2xx");
            return Err(CoreError::HttpNonOk {
                path,
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// `GET /np/serveraddr?...` — resolves the push stream's FQDN.
    pub async fn push_fqdn(&self, token: &str) -> Result<String> {
        let path = "/np/serveraddr?version=2.1&fields=keepAliveStatus&keepAliveStatusType=3";
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::HttpNonOk {
                path: path.to_owned(),
                status: status.as_u16(),
            });
        }
        let body: Value = resp.json().await.map_err(CoreError::from)?;
        body.get("fqdn")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| CoreError::Schema("push_fqdn: missing 'fqdn'".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use punch_test_utils::MockSignalingServer;

    fn transport_for(server: &MockSignalingServer) -> SignalingTransport {
        SignalingTransport::new(
            Endpoints { base_url: server.base_url() },
            std::time::Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn list_devices_decodes_hex_duid_and_remote_play_flag() {
        let server = MockSignalingServer::start().await;
        server
            .set_devices(vec![json!({
                "duid": "aa".repeat(32),
                "name": "Living Room PS5",
                "enabledFeatures": ["remotePlay"],
            })])
            .await;
        let transport = transport_for(&server);

        let devices = transport.list_devices("tok", ConsoleFamily::Ps5).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Living Room PS5");
        assert_eq!(devices[0].duid, [0xaau8; 32]);
        assert!(devices[0].remote_play_enabled);
    }

    #[tokio::test]
    async fn list_devices_rejects_non_hex_duid() {
        let server = MockSignalingServer::start().await;
        server
            .set_devices(vec![json!({"duid": "not-hex", "name": "x", "enabledFeatures": []})])
            .await;
        let transport = transport_for(&server);
        assert!(transport.list_devices("tok", ConsoleFamily::Ps4).await.is_err());
    }

    #[tokio::test]
    async fn create_session_parses_session_and_account_ids() {
        let server = MockSignalingServer::start().await;
        server.set_session("11111111-1111-4111-8111-111111111111", 77).await;
        let transport = transport_for(&server);

        let (session_id, account_id) = transport.create_session("tok", "push-ctx").await.unwrap();
        assert_eq!(session_id, "11111111-1111-4111-8111-111111111111");
        assert_eq!(account_id, 77);
    }

    #[tokio::test]
    async fn push_fqdn_returns_configured_value() {
        let server = MockSignalingServer::start().await;
        server.set_fqdn("push.example.net").await;
        let transport = transport_for(&server);
        assert_eq!(transport.push_fqdn("tok").await.unwrap(), "push.example.net");
    }

    #[tokio::test]
    async fn send_session_message_is_recorded_by_the_mock() {
        let server = MockSignalingServer::start().await;
        let transport = transport_for(&server);
        let msg = SessionMessage {
            action: crate::model::Action::Result,
            req_id: 1,
            error: 0,
            conn_request: Some(crate::model::ConnectionRequest::empty()),
        };
        transport.send_session_message("tok", "sess", &msg).await.unwrap();
        assert_eq!(server.sent_messages().await.len(), 1);
    }
}
