//! Tagged-union view of a [`Frame`]: one variant per message code, decoded
//! once at the frame boundary so opaque bytes never leak into the lock
//! manager, the config store, or the bus.

use crate::error::ProtocolError;
use crate::frame::Frame;
use common::LockKey;

/// Stable numeric wire codes, grouped by the subsystem they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageCode {
    Unknown = -1,

    Lock = 20,
    Unlock = 21,
    LockOk = 22,
    LockRetry = 23,
    LockStolen = 24,
    LockStolenAck = 25,

    RedisAddrQuery = 30,
    RedisAddrReply = 31,

    UdsQuery = 40,
    UdsOk = 41,
    UdsFailed = 42,

    GetFile = 50,
    GetFileFailed = 51,
    GetFileOk = 52,

    GetDbTree = 60,
    DbFile = 61,
    DbEnd = 62,

    SetFile = 70,
    SetFileOk = 72,
    SetFileFailed = 73,

    RemoveFile = 80,
    MovePath = 81,
    RemoveFileOk = 82,
    RemoveFileFailed = 83,
    MovePathOk = 84,
    MovePathFailed = 85,
}

impl MessageCode {
    fn from_i32(code: i32) -> Option<Self> {
        use MessageCode::*;
        Some(match code {
            -1 => Unknown,
            20 => Lock,
            21 => Unlock,
            22 => LockOk,
            23 => LockRetry,
            24 => LockStolen,
            25 => LockStolenAck,
            30 => RedisAddrQuery,
            31 => RedisAddrReply,
            40 => UdsQuery,
            41 => UdsOk,
            42 => UdsFailed,
            50 => GetFile,
            51 => GetFileFailed,
            52 => GetFileOk,
            60 => GetDbTree,
            61 => DbFile,
            62 => DbEnd,
            70 => SetFile,
            72 => SetFileOk,
            73 => SetFileFailed,
            80 => RemoveFile,
            81 => MovePath,
            82 => RemoveFileOk,
            83 => RemoveFileFailed,
            84 => MovePathOk,
            85 => MovePathFailed,
            _ => return None,
        })
    }
}

/// A fully decoded application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Carries the first field of whatever payload the server didn't
    /// recognize, so the client can at least log which request failed.
    Unknown(String),

    Lock { key: LockKey },
    Unlock { key: LockKey },
    LockOk { key: String },
    LockRetry { key: String },
    LockStolen { names: Vec<String> },
    LockStolenAck { names: Vec<String> },

    RedisAddrQuery,
    RedisAddrReply { address: String },

    UdsQuery { hostname: String },
    UdsOk { path: String },
    UdsFailed,

    GetFile { msgkey: String, path: String },
    GetFileFailed { msgkey: String, error: String },
    GetFileOk { msgkey: String, content: Vec<u8> },

    GetDbTree { msgkey: String, base_path: String },
    DbFile { msgkey: String, rel_path: String, content: Vec<u8> },
    DbEnd { msgkey: String },

    SetFile { msgkey: String, path: String, content: Vec<u8> },
    SetFileOk { msgkey: String },
    SetFileFailed { msgkey: String, error: String },

    RemoveFile { msgkey: String, path: String },
    RemoveFileOk { msgkey: String },
    RemoveFileFailed { msgkey: String, error: String },

    MovePath { msgkey: String, src: String, dst: String },
    MovePathOk { msgkey: String },
    MovePathFailed { msgkey: String, error: String },
}

/// Splits `payload` on `|` into exactly `parts` fields; the last field
/// keeps any remaining `|` bytes verbatim, since file content may
/// legitimately contain the separator.
fn split_fields(payload: &[u8], parts: usize) -> Vec<Vec<u8>> {
    if parts == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(parts);
    let mut rest = payload;
    for _ in 0..parts - 1 {
        match rest.iter().position(|&b| b == b'|') {
            Some(idx) => {
                out.push(rest[..idx].to_vec());
                rest = &rest[idx + 1..];
            }
            None => {
                out.push(rest.to_vec());
                rest = &[];
            }
        }
    }
    out.push(rest.to_vec());
    out
}

fn to_utf8(bytes: Vec<u8>, field: &str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes).map_err(|_| ProtocolError::Invalid(format!("{field} is not utf-8")))
}

impl Message {
    /// Encodes this message into a wire [`Frame`].
    pub fn encode(&self) -> Frame {
        match self {
            Message::Unknown(echoed) => Frame::new(MessageCode::Unknown as i32, echoed.clone().into_bytes()),

            Message::Lock { key } => Frame::new(MessageCode::Lock as i32, key.encode().into_bytes()),
            Message::Unlock { key } => Frame::new(MessageCode::Unlock as i32, key.encode().into_bytes()),
            Message::LockOk { key } => Frame::new(MessageCode::LockOk as i32, key.clone().into_bytes()),
            Message::LockRetry { key } => Frame::new(MessageCode::LockRetry as i32, key.clone().into_bytes()),
            Message::LockStolen { names } => {
                Frame::new(MessageCode::LockStolen as i32, names.join("|").into_bytes())
            }
            Message::LockStolenAck { names } => {
                Frame::new(MessageCode::LockStolenAck as i32, names.join("|").into_bytes())
            }

            Message::RedisAddrQuery => Frame::new(MessageCode::RedisAddrQuery as i32, Vec::new()),
            Message::RedisAddrReply { address } => {
                Frame::new(MessageCode::RedisAddrReply as i32, address.clone().into_bytes())
            }

            Message::UdsQuery { hostname } => {
                Frame::new(MessageCode::UdsQuery as i32, hostname.clone().into_bytes())
            }
            Message::UdsOk { path } => Frame::new(MessageCode::UdsOk as i32, path.clone().into_bytes()),
            Message::UdsFailed => Frame::new(MessageCode::UdsFailed as i32, Vec::new()),

            Message::GetFile { msgkey, path } => {
                Frame::new(MessageCode::GetFile as i32, format!("{msgkey}|{path}").into_bytes())
            }
            Message::GetFileFailed { msgkey, error } => Frame::new(
                MessageCode::GetFileFailed as i32,
                format!("{msgkey}|{error}").into_bytes(),
            ),
            Message::GetFileOk { msgkey, content } => {
                let mut payload = format!("{msgkey}|").into_bytes();
                payload.extend_from_slice(content);
                Frame::new(MessageCode::GetFileOk as i32, payload)
            }

            Message::GetDbTree { msgkey, base_path } => Frame::new(
                MessageCode::GetDbTree as i32,
                format!("{msgkey}|{base_path}").into_bytes(),
            ),
            Message::DbFile { msgkey, rel_path, content } => {
                let mut payload = format!("{msgkey}|{rel_path}|").into_bytes();
                payload.extend_from_slice(content);
                Frame::new(MessageCode::DbFile as i32, payload)
            }
            Message::DbEnd { msgkey } => Frame::new(MessageCode::DbEnd as i32, msgkey.clone().into_bytes()),

            Message::SetFile { msgkey, path, content } => {
                let mut payload = format!("{msgkey}|{path}|").into_bytes();
                payload.extend_from_slice(content);
                Frame::new(MessageCode::SetFile as i32, payload)
            }
            Message::SetFileOk { msgkey } => Frame::new(MessageCode::SetFileOk as i32, msgkey.clone().into_bytes()),
            Message::SetFileFailed { msgkey, error } => Frame::new(
                MessageCode::SetFileFailed as i32,
                format!("{msgkey}|{error}").into_bytes(),
            ),

            Message::RemoveFile { msgkey, path } => Frame::new(
                MessageCode::RemoveFile as i32,
                format!("{msgkey}|{path}").into_bytes(),
            ),
            Message::RemoveFileOk { msgkey } => {
                Frame::new(MessageCode::RemoveFileOk as i32, msgkey.clone().into_bytes())
            }
            Message::RemoveFileFailed { msgkey, error } => Frame::new(
                MessageCode::RemoveFileFailed as i32,
                format!("{msgkey}|{error}").into_bytes(),
            ),

            Message::MovePath { msgkey, src, dst } => Frame::new(
                MessageCode::MovePath as i32,
                format!("{msgkey}|{src}|{dst}").into_bytes(),
            ),
            Message::MovePathOk { msgkey } => Frame::new(MessageCode::MovePathOk as i32, msgkey.clone().into_bytes()),
            Message::MovePathFailed { msgkey, error } => Frame::new(
                MessageCode::MovePathFailed as i32,
                format!("{msgkey}|{error}").into_bytes(),
            ),
        }
    }

    /// Decodes a wire [`Frame`] into a [`Message`]. An unrecognized type
    /// code is not an error here — it decodes to [`Message::Unknown`],
    /// mirroring the server's own `UNKNOWN` reply for the same case.
    pub fn decode(frame: &Frame) -> Result<Message, ProtocolError> {
        let code = match MessageCode::from_i32(frame.type_code) {
            Some(code) => code,
            None => {
                let echoed = String::from_utf8_lossy(&frame.payload).into_owned();
                return Ok(Message::Unknown(echoed));
            }
        };

        let payload = &frame.payload;
        Ok(match code {
            MessageCode::Unknown => Message::Unknown(to_utf8(payload.clone(), "unknown payload")?),

            MessageCode::Lock => {
                let text = to_utf8(payload.clone(), "lock payload")?;
                Message::Lock { key: LockKey::parse(&text) }
            }
            MessageCode::Unlock => {
                let text = to_utf8(payload.clone(), "unlock payload")?;
                Message::Unlock { key: LockKey::parse(&text) }
            }
            MessageCode::LockOk => Message::LockOk { key: to_utf8(payload.clone(), "lock key")? },
            MessageCode::LockRetry => Message::LockRetry { key: to_utf8(payload.clone(), "lock key")? },
            MessageCode::LockStolen => Message::LockStolen { names: split_names(payload)? },
            MessageCode::LockStolenAck => Message::LockStolenAck { names: split_names(payload)? },

            MessageCode::RedisAddrQuery => Message::RedisAddrQuery,
            MessageCode::RedisAddrReply => {
                Message::RedisAddrReply { address: to_utf8(payload.clone(), "redis address")? }
            }

            MessageCode::UdsQuery => Message::UdsQuery { hostname: to_utf8(payload.clone(), "hostname")? },
            MessageCode::UdsOk => Message::UdsOk { path: to_utf8(payload.clone(), "uds path")? },
            MessageCode::UdsFailed => Message::UdsFailed,

            MessageCode::GetFile => {
                let [msgkey, path] = split_fields(payload, 2).try_into().unwrap();
                Message::GetFile { msgkey: to_utf8(msgkey, "msgkey")?, path: to_utf8(path, "path")? }
            }
            MessageCode::GetFileFailed => {
                let [msgkey, error] = split_fields(payload, 2).try_into().unwrap();
                Message::GetFileFailed { msgkey: to_utf8(msgkey, "msgkey")?, error: to_utf8(error, "error")? }
            }
            MessageCode::GetFileOk => {
                let [msgkey, content] = split_fields(payload, 2).try_into().unwrap();
                Message::GetFileOk { msgkey: to_utf8(msgkey, "msgkey")?, content }
            }

            MessageCode::GetDbTree => {
                let [msgkey, base_path] = split_fields(payload, 2).try_into().unwrap();
                Message::GetDbTree { msgkey: to_utf8(msgkey, "msgkey")?, base_path: to_utf8(base_path, "base_path")? }
            }
            MessageCode::DbFile => {
                let [msgkey, rel_path, content] = split_fields(payload, 3).try_into().unwrap();
                Message::DbFile {
                    msgkey: to_utf8(msgkey, "msgkey")?,
                    rel_path: to_utf8(rel_path, "rel_path")?,
                    content,
                }
            }
            MessageCode::DbEnd => Message::DbEnd { msgkey: to_utf8(payload.clone(), "msgkey")? },

            MessageCode::SetFile => {
                let [msgkey, path, content] = split_fields(payload, 3).try_into().unwrap();
                Message::SetFile { msgkey: to_utf8(msgkey, "msgkey")?, path: to_utf8(path, "path")?, content }
            }
            MessageCode::SetFileOk => Message::SetFileOk { msgkey: to_utf8(payload.clone(), "msgkey")? },
            MessageCode::SetFileFailed => {
                let [msgkey, error] = split_fields(payload, 2).try_into().unwrap();
                Message::SetFileFailed { msgkey: to_utf8(msgkey, "msgkey")?, error: to_utf8(error, "error")? }
            }

            MessageCode::RemoveFile => {
                let [msgkey, path] = split_fields(payload, 2).try_into().unwrap();
                Message::RemoveFile { msgkey: to_utf8(msgkey, "msgkey")?, path: to_utf8(path, "path")? }
            }
            MessageCode::RemoveFileOk => Message::RemoveFileOk { msgkey: to_utf8(payload.clone(), "msgkey")? },
            MessageCode::RemoveFileFailed => {
                let [msgkey, error] = split_fields(payload, 2).try_into().unwrap();
                Message::RemoveFileFailed { msgkey: to_utf8(msgkey, "msgkey")?, error: to_utf8(error, "error")? }
            }

            MessageCode::MovePath => {
                let [msgkey, src, dst] = split_fields(payload, 3).try_into().unwrap();
                Message::MovePath {
                    msgkey: to_utf8(msgkey, "msgkey")?,
                    src: to_utf8(src, "src")?,
                    dst: to_utf8(dst, "dst")?,
                }
            }
            MessageCode::MovePathOk => Message::MovePathOk { msgkey: to_utf8(payload.clone(), "msgkey")? },
            MessageCode::MovePathFailed => {
                let [msgkey, error] = split_fields(payload, 2).try_into().unwrap();
                Message::MovePathFailed { msgkey: to_utf8(msgkey, "msgkey")?, error: to_utf8(error, "error")? }
            }
        })
    }

    /// The first `|`-delimited field of this message's own wire payload,
    /// for echoing back in an `Unknown` reply when a message type arrives
    /// from a side that shouldn't be sending it.
    pub fn first_field(&self) -> String {
        let payload = self.encode().payload;
        let end = payload.iter().position(|&b| b == b'|').unwrap_or(payload.len());
        String::from_utf8_lossy(&payload[..end]).into_owned()
    }
}

fn split_names(payload: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let text = to_utf8(payload.to_vec(), "names")?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    Ok(text.split('|').map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let frame = message.encode();
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn lock_round_trips() {
        round_trip(Message::Lock { key: LockKey::new(100, vec!["mot1".into(), "mot2".into()]) });
    }

    #[test]
    fn lock_stolen_round_trips_with_multiple_names() {
        round_trip(Message::LockStolen { names: vec!["mot1".into(), "mot2".into()] });
    }

    #[test]
    fn empty_lock_payload_is_a_noop_key() {
        let frame = Frame::new(MessageCode::Lock as i32, Vec::new());
        let decoded = Message::decode(&frame).unwrap();
        match decoded {
            Message::Lock { key } => assert!(key.is_empty()),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn get_file_ok_preserves_pipes_in_content() {
        round_trip(Message::GetFileOk {
            msgkey: "7".into(),
            content: b"name: robz\nsteps_per_unit: 1000\nalias: a|b\n".to_vec(),
        });
    }

    #[test]
    fn db_file_preserves_pipes_in_content() {
        round_trip(Message::DbFile {
            msgkey: "9".into(),
            rel_path: "axes/robz.yml".into(),
            content: b"a|b|c".to_vec(),
        });
    }

    #[test]
    fn unknown_type_code_decodes_to_unknown_echo() {
        let frame = Frame::new(999, b"GET_FOO".to_vec());
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, Message::Unknown("GET_FOO".to_string()));
    }

    #[test]
    fn first_field_extracts_the_msgkey_from_a_multi_field_payload() {
        let message = Message::GetFileFailed { msgkey: "7".into(), error: "not found".into() };
        assert_eq!(message.first_field(), "7");
    }

    #[test]
    fn first_field_is_the_whole_payload_when_there_is_no_separator() {
        assert_eq!(Message::UdsFailed.first_field(), "");
        assert_eq!(Message::LockOk { key: "mot1".into() }.first_field(), "mot1");
    }

    #[test]
    fn redis_addr_query_has_empty_payload() {
        let frame = Message::RedisAddrQuery.encode();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.type_code, MessageCode::RedisAddrQuery as i32);
    }
}
