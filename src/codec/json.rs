//! A plain JSON [`Codec`], newline-delimiting multiple replies/pushes
//! within one frame the way Centrifugo's own JSON protocol (as opposed to
//! its Protobuf one) frames a WebSocket message. Real deployments plug in
//! a Protobuf codec instead (spec.md §1: explicitly out of scope here);
//! this one exists for the test suite and for callers happy to speak JSON
//! over the wire.
//!
//! Grounded on `ethers_connections::jsonrpc`'s hand-rolled `Request`/
//! `Response`/`Notification` (de)serialization: that module's own comment
//! notes an untagged `enum` can't be derived over fields containing
//! `RawValue`, so replies/pushes are classified by inspecting a
//! `serde_json::Value` first, matching the same workaround used by
//! `jsonrpc::deserialize_batch_response`.

use serde_json::value::RawValue;
use serde_json::Value;

use crate::command::{Command, CommandKind};
use crate::error::{CodecError, ReplyErrorPayload};
use crate::reply::{InboundItem, Push, Reply};
use crate::transport::Codec;

/// Encodes each command as one JSON object and decodes newline-delimited
/// JSON objects back into [`InboundItem`]s.
#[derive(Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn encode(&self, cmd: &Command) -> Result<Vec<u8>, CodecError> {
        let value = encode_command(cmd)?;
        serde_json::to_vec(&value).map_err(|err| CodecError::Encode(Box::new(err)))
    }

    fn decode(&self, frame: &[u8]) -> Result<Vec<InboundItem>, CodecError> {
        let text = std::str::from_utf8(frame).map_err(|err| CodecError::Decode(Box::new(err)))?;
        text.lines().filter(|line| !line.trim().is_empty()).map(decode_line).collect()
    }
}

fn encode_command(cmd: &Command) -> Result<Value, CodecError> {
    let (method, params) = match &cmd.kind {
        CommandKind::Connect { token, name, version } => {
            ("connect", serde_json::json!({ "token": token, "name": name, "version": version }))
        }
        CommandKind::Subscribe { channel, payload } => {
            let mut params = raw_to_value(payload)?;
            if let Value::Object(map) = &mut params {
                map.insert("channel".to_string(), Value::String(channel.clone()));
            }
            ("subscribe", params)
        }
        CommandKind::Unsubscribe { channel } => ("unsubscribe", serde_json::json!({ "channel": channel })),
        CommandKind::Publish { channel, data } => {
            ("publish", serde_json::json!({ "channel": channel, "data": raw_to_value(data)? }))
        }
        CommandKind::Presence { channel } => ("presence", serde_json::json!({ "channel": channel })),
        CommandKind::PresenceStats { channel } => ("presence_stats", serde_json::json!({ "channel": channel })),
        CommandKind::History { channel, limit, since, reverse } => (
            "history",
            serde_json::json!({ "channel": channel, "limit": limit, "since": since, "reverse": reverse }),
        ),
        CommandKind::Ping => ("ping", Value::Object(Default::default())),
        CommandKind::Send { data } => ("send", raw_to_value(data)?),
        CommandKind::Rpc { method, data } => ("rpc", serde_json::json!({ "method": method, "data": raw_to_value(data)? })),
        CommandKind::Refresh { token } => ("refresh", serde_json::json!({ "token": token })),
        CommandKind::SubRefresh { channel, token } => {
            ("sub_refresh", serde_json::json!({ "channel": channel, "token": token }))
        }
    };

    Ok(serde_json::json!({ "id": cmd.id, "method": method, "params": params }))
}

fn raw_to_value(raw: &RawValue) -> Result<Value, CodecError> {
    serde_json::from_str(raw.get()).map_err(|err| CodecError::Encode(Box::new(err)))
}

fn value_to_raw(value: &Value) -> Result<Box<RawValue>, CodecError> {
    serde_json::value::to_raw_value(value).map_err(|err| CodecError::Decode(Box::new(err)))
}

fn decode_line(line: &str) -> Result<InboundItem, CodecError> {
    let value: Value = serde_json::from_str(line).map_err(|err| CodecError::Decode(Box::new(err)))?;
    let Value::Object(obj) = &value else {
        return Err(CodecError::Decode("expected a JSON object".into()));
    };

    if let Some(push) = obj.get("push") {
        return Ok(InboundItem::Push(decode_push(push)?));
    }

    let id = obj.get("id").and_then(Value::as_u64).unwrap_or(0) as u32;
    if let Some(error) = obj.get("error") {
        let payload: ReplyErrorPayload =
            serde_json::from_value(error.clone()).map_err(|err| CodecError::Decode(Box::new(err)))?;
        return Ok(InboundItem::Reply(Reply { id, payload: Err(payload) }));
    }

    let result = obj.get("result").cloned().unwrap_or(Value::Object(Default::default()));
    Ok(InboundItem::Reply(Reply { id, payload: Ok(value_to_raw(&result)?) }))
}

fn decode_push(push: &Value) -> Result<Push, CodecError> {
    let kind = push
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::Decode("push object missing \"type\"".into()))?;

    let str_field = |key: &str| -> Result<String, CodecError> {
        push.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CodecError::Decode(format!("push missing \"{key}\"").into()))
    };
    let u64_field = |key: &str| push.get(key).and_then(Value::as_u64).unwrap_or(0);
    let bool_field = |key: &str| push.get(key).and_then(Value::as_bool).unwrap_or(false);
    let str_default = |key: &str| push.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    let raw_field = |key: &str| -> Result<Box<RawValue>, CodecError> {
        value_to_raw(push.get(key).unwrap_or(&Value::Null))
    };

    Ok(match kind {
        "publication" => Push::Publication {
            channel: str_field("channel")?,
            data: raw_field("data")?,
            offset: u64_field("offset"),
            epoch: str_default("epoch"),
        },
        "join" => Push::Join { channel: str_field("channel")?, info: raw_field("info")? },
        "leave" => Push::Leave { channel: str_field("channel")?, info: raw_field("info")? },
        "subscribe" => Push::Subscribe {
            channel: str_field("channel")?,
            recoverable: bool_field("recoverable"),
            epoch: str_default("epoch"),
            offset: u64_field("offset"),
        },
        "unsubscribe" => Push::Unsubscribe { channel: str_field("channel")?, code: u64_field("code") as u32 },
        "message" => Push::Message { data: raw_field("data")? },
        "disconnect" => Push::Disconnect {
            code: u64_field("code") as u32,
            reason: str_default("reason"),
            reconnect: push.get("reconnect").and_then(Value::as_bool).unwrap_or(true),
            next_reconnect_at: push.get("nextReconnectAt").and_then(Value::as_u64),
            reconnect_url: push.get("reconnectUrl").and_then(Value::as_str).map(str::to_string),
        },
        "refresh" => Push::Refresh { ttl: push.get("ttl").and_then(Value::as_u64), expires: bool_field("expires") },
        "sub_refresh" => Push::SubRefresh {
            channel: str_field("channel")?,
            ttl: push.get("ttl").and_then(Value::as_u64),
            expires: bool_field("expires"),
        },
        "connect" => Push::Connect {
            client_id: str_default("client"),
            ttl: push.get("ttl").and_then(Value::as_u64),
            expires: bool_field("expires"),
        },
        other => return Err(CodecError::Decode(format!("unknown push type \"{other}\"").into())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_subscribe_command() {
        let codec = JsonCodec::new();
        let payload = RawValue::from_string(r#"{"channel":"news","recover":false}"#.into()).unwrap();
        let cmd = Command::new(7, CommandKind::Subscribe { channel: "news".into(), payload });
        let frame = codec.encode(&cmd).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.contains("\"method\":\"subscribe\""));
        assert!(text.contains("\"id\":7"));
    }

    #[test]
    fn decodes_a_reply_and_a_push_from_one_frame() {
        let codec = JsonCodec::new();
        let frame = concat!(
            "{\"id\":3,\"result\":{\"ok\":true}}\n",
            "{\"push\":{\"type\":\"publication\",\"channel\":\"news\",\"data\":{\"x\":1},\"offset\":5}}\n",
        );
        let items = codec.decode(frame.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        match &items[0] {
            InboundItem::Reply(reply) => assert_eq!(reply.id, 3),
            _ => panic!("expected a reply"),
        }
        match &items[1] {
            InboundItem::Push(Push::Publication { channel, offset, .. }) => {
                assert_eq!(channel, "news");
                assert_eq!(*offset, 5);
            }
            _ => panic!("expected a publication push"),
        }
    }

    #[test]
    fn decodes_an_error_reply() {
        let codec = JsonCodec::new();
        let frame = b"{\"id\":1,\"error\":{\"code\":100,\"message\":\"bad request\",\"temporary\":false}}";
        let items = codec.decode(frame).unwrap();
        match &items[0] {
            InboundItem::Reply(reply) => {
                let err = reply.payload.as_ref().unwrap_err();
                assert_eq!(err.code, 100);
            }
            _ => panic!("expected a reply"),
        }
    }
}
