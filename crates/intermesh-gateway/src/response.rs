//! Client-facing serialization of upstream envelopes.
//!
//! | Format | Shape |
//! |---|---|
//! | [`ResponseFormat::Json`] | `{ "messageTypes", "conversationId", "senderPlatform", "payload" }` plus `subscriptionId` / `error` when present |
//! | [`ResponseFormat::JsonLd`] | `{ "@context", "@graph": [metadata node, payload node] }` |

use intermesh_types::{MessageEnvelope, MessageType, ResponseFormat, RouteError};
use serde_json::{Map, Value, json};

const MSG_NS: &str = "http://inter-iot.eu/message/";
const INTERIOT_NS: &str = "http://inter-iot.eu/";

/// Serialize `envelope` for delivery in `format`.
///
/// # Errors
///
/// Returns [`RouteError::Middleware`] when the JSON format is requested for
/// an envelope whose only tag is `RESPONSE`: the client could not tell what
/// the message answers.
pub fn serialize_response(envelope: &MessageEnvelope, format: ResponseFormat) -> Result<String, RouteError> {
    let value = match format {
        ResponseFormat::Json => to_json(envelope)?,
        ResponseFormat::JsonLd => to_json_ld(envelope),
    };
    Ok(serde_json::to_string(&value)?)
}

/// Join already-serialized responses into the push body.
pub fn batch_body(items: &[String]) -> String {
    if items.is_empty() {
        return "[]".to_string();
    }
    format!("[\n{}]", items.join(",\n"))
}

fn to_json(envelope: &MessageEnvelope) -> Result<Value, RouteError> {
    let types: Vec<&str> = envelope
        .message_types
        .iter()
        .filter(|t| **t != MessageType::Response)
        .map(|t| t.as_str())
        .collect();
    if types.is_empty() {
        return Err(RouteError::Middleware(format!(
            "cannot serialize response {} without a request type",
            envelope.log_id()
        )));
    }

    let mut out = Map::new();
    out.insert("messageTypes".into(), json!(types));
    out.insert("conversationId".into(), json!(envelope.conversation_id));
    out.insert("senderPlatform".into(), json!(envelope.sender_platform_id));
    out.insert("payload".into(), envelope.payload.clone());
    if let Some(sub) = &envelope.subscription_id {
        out.insert("subscriptionId".into(), json!(sub));
    }
    if let Some(err) = &envelope.error {
        out.insert("error".into(), json!({ "category": err.category, "description": err.description }));
    }
    Ok(Value::Object(out))
}

fn to_json_ld(envelope: &MessageEnvelope) -> Value {
    let id = envelope.log_id();
    let mut types = vec![json!("msg:meta")];
    types.extend(envelope.message_types.iter().map(|t| json!(format!("msg:{}", t.as_str()))));

    let mut meta = Map::new();
    meta.insert("@id".into(), json!(format!("msg:meta/{id}")));
    meta.insert("@type".into(), Value::Array(types));
    meta.insert("msg:conversationID".into(), json!(envelope.conversation_id));
    meta.insert("msg:messageID".into(), json!(id));
    if let Some(ts) = envelope.timestamp {
        meta.insert("msg:dateTimeStamp".into(), json!(ts.to_rfc3339()));
    }
    if let Some(sender) = &envelope.sender_platform_id {
        meta.insert("msg:SenderPlatformId".into(), json!({ "@id": sender }));
    }
    if !envelope.receiver_platform_ids.is_empty() {
        let receivers: Vec<Value> = envelope
            .receiver_platform_ids
            .iter()
            .map(|r| json!({ "@id": r }))
            .collect();
        meta.insert("msg:ReceiverPlatformId".into(), Value::Array(receivers));
    }
    if let Some(client) = &envelope.client_id {
        meta.insert("msg:clientID".into(), json!(client));
    }
    if let Some(sub) = &envelope.subscription_id {
        meta.insert("msg:subscriptionID".into(), json!(sub));
    }
    if let Some(err) = &envelope.error {
        meta.insert("msg:errorCategory".into(), json!(err.category));
        meta.insert("msg:errorDescription".into(), json!(err.description));
    }

    json!({
        "@context": {
            "msg": MSG_NS,
            "InterIoT": INTERIOT_NS,
        },
        "@graph": [
            Value::Object(meta),
            {
                "@id": format!("msg:payload/{id}"),
                "@type": "msg:payload",
                "msg:data": envelope.payload,
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use intermesh_types::ErrorInfo;

    fn observation() -> MessageEnvelope {
        MessageEnvelope::new([MessageType::Observation], "conv-1")
            .with_sender("http://p1")
            .with_subscription("conv-1")
            .with_payload(json!({ "observations": [] }))
    }

    #[test]
    fn json_shape_carries_types_without_response_tag() -> Result<(), Box<dyn std::error::Error>> {
        let env = MessageEnvelope::new([MessageType::Subscribe, MessageType::Response], "conv-9");
        let out: Value = serde_json::from_str(&serialize_response(&env, ResponseFormat::Json)?)?;
        assert_eq!(out["messageTypes"], json!(["SUBSCRIBE"]));
        assert_eq!(out["conversationId"], "conv-9");
        assert!(out.get("subscriptionId").is_none());
        Ok(())
    }

    #[test]
    fn json_includes_subscription_and_error_when_present() -> Result<(), Box<dyn std::error::Error>> {
        let mut env = observation();
        env.error = Some(ErrorInfo {
            category: "ERROR_HANDLING_RECEIVED_MESSAGE".into(),
            description: "boom".into(),
            original_message: None,
        });
        let out: Value = serde_json::from_str(&serialize_response(&env, ResponseFormat::Json)?)?;
        assert_eq!(out["subscriptionId"], "conv-1");
        assert_eq!(out["senderPlatform"], "http://p1");
        assert_eq!(out["error"]["category"], "ERROR_HANDLING_RECEIVED_MESSAGE");
        Ok(())
    }

    #[test]
    fn json_with_only_response_tag_is_rejected() {
        let env = MessageEnvelope::new([MessageType::Response], "conv-2");
        assert!(matches!(
            serialize_response(&env, ResponseFormat::Json),
            Err(RouteError::Middleware(_))
        ));
    }

    #[test]
    fn json_ld_has_metadata_and_payload_nodes() -> Result<(), Box<dyn std::error::Error>> {
        let env = observation();
        let out: Value = serde_json::from_str(&serialize_response(&env, ResponseFormat::JsonLd)?)?;
        let graph = out["@graph"].as_array().ok_or("graph missing")?;
        assert_eq!(graph.len(), 2);
        assert_eq!(graph[0]["msg:conversationID"], "conv-1");
        assert!(graph[0]["@type"].as_array().unwrap().contains(&json!("msg:OBSERVATION")));
        assert_eq!(graph[1]["msg:data"], json!({ "observations": [] }));
        assert_eq!(out["@context"]["msg"], MSG_NS);
        Ok(())
    }

    #[test]
    fn batch_body_layout() {
        assert_eq!(batch_body(&[]), "[]");
        assert_eq!(batch_body(&["{}".into()]), "[\n{}]");
        assert_eq!(batch_body(&["1".into(), "2".into()]), "[\n1,\n2]");
    }
}
